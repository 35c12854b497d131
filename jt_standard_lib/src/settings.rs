use std::net::SocketAddr;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::JtError;

/// Every knob the platform recognizes. A missing settings file is written
/// out with these defaults so a fresh checkout runs; individual fields can
/// then be edited in place.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// HTTP listener for webhooks, health and monitoring.
    pub listen_address: SocketAddr,
    /// Embedded single-file backend for development ("jt_platform.db"),
    /// networked backend for production ("postgres://...").
    pub database_url: String,
    /// Out-of-band key required on all write endpoints.
    pub admin_api_key: String,
    /// How many broker adapter variants to activate, in declaration order.
    pub broker_adapter_count: usize,

    pub ingest_workers: usize,
    pub exec_workers: usize,
    pub ingest_queue_depth: usize,
    pub exec_queue_depth: usize,
    /// Per execution task deadline.
    pub exec_task_timeout_secs: u64,
    /// How long an ingest worker may block on a full execution queue before
    /// recording a drop (the webhook still gets its 2xx).
    pub exec_enqueue_deadline_ms: u64,

    /// Connect-gate semaphore value; process wide.
    pub stream_connect_concurrency: usize,
    /// Forced delay between permitted connects.
    pub stream_connect_spacing_secs: u64,
    /// Number of 30 s windows with zero data before a forced reconnect.
    pub stream_dead_sub_windows: u32,
    /// Max randomized startup delay per connection.
    pub stream_initial_stagger_max_secs: u64,
    pub stream_heartbeat_ms: u64,
    pub stream_silence_timeout_secs: u64,
    /// Connections older than this reconnect with a fresh token.
    pub stream_token_max_age_secs: u64,

    /// Proactive refresh window before token expiry.
    pub token_refresh_early_margin_secs: i64,
    /// Locally stored validity; must stay below the broker's real lifetime.
    pub token_stored_lifetime_secs: i64,
    pub token_sweep_interval_secs: u64,

    pub reconciler_interval_secs: u64,
    /// Grace past the session cutoff before an open record counts as stale.
    pub stale_trade_grace_secs: i64,

    pub webhook_dedup_window_secs: i64,
    pub signal_cooldown_default_secs: i64,
    pub max_daily_loss_default: Decimal,
    /// Window over which already-processed fill ids suppress replays.
    pub copy_fill_replay_window_secs: u64,

    pub broker_read_timeout_secs: u64,
    pub broker_order_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8090".parse().expect("static address"),
            database_url: "jt_platform.db".to_string(),
            admin_api_key: String::new(),
            broker_adapter_count: 3,

            ingest_workers: 10,
            exec_workers: 10,
            ingest_queue_depth: 256,
            exec_queue_depth: 256,
            exec_task_timeout_secs: 60,
            exec_enqueue_deadline_ms: 500,

            stream_connect_concurrency: 2,
            stream_connect_spacing_secs: 3,
            stream_dead_sub_windows: 10,
            stream_initial_stagger_max_secs: 30,
            stream_heartbeat_ms: 2500,
            stream_silence_timeout_secs: 10,
            stream_token_max_age_secs: 70 * 60,

            token_refresh_early_margin_secs: 30 * 60,
            token_stored_lifetime_secs: 85 * 60,
            token_sweep_interval_secs: 5 * 60,

            reconciler_interval_secs: 5 * 60,
            stale_trade_grace_secs: 60 * 60,

            webhook_dedup_window_secs: 30,
            signal_cooldown_default_secs: 0,
            max_daily_loss_default: Decimal::ZERO,
            copy_fill_replay_window_secs: 60,

            broker_read_timeout_secs: 30,
            broker_order_timeout_secs: 60,
        }
    }
}

/// Load settings from a TOML file, creating it with defaults when missing.
/// `JT_DATABASE_URL` and `JT_ADMIN_API_KEY` override the file so deployments
/// can keep secrets out of it.
pub fn initialise_settings(path: &Path) -> Result<ServerSettings, JtError> {
    if !path.exists() {
        let defaults = ServerSettings::default();
        let content = toml::to_string_pretty(&defaults)
            .map_err(|e| JtError::Internal(format!("serialize default settings: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| JtError::Internal(format!("write default settings: {}", e)))?;
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| JtError::Internal(format!("read settings {}: {}", path.display(), e)))?;
    let mut settings: ServerSettings = toml::from_str(&content)
        .map_err(|e| JtError::Internal(format!("parse settings {}: {}", path.display(), e)))?;

    if let Ok(url) = std::env::var("JT_DATABASE_URL") {
        if !url.is_empty() {
            settings.database_url = url;
        }
    }
    if let Ok(key) = std::env::var("JT_ADMIN_API_KEY") {
        if !key.is_empty() {
            settings.admin_api_key = key;
        }
    }

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let s = ServerSettings::default();
        assert_eq!(s.stream_connect_concurrency, 2);
        assert_eq!(s.stream_connect_spacing_secs, 3);
        assert_eq!(s.stream_dead_sub_windows, 10);
        assert_eq!(s.token_refresh_early_margin_secs, 30 * 60);
        assert_eq!(s.token_stored_lifetime_secs, 85 * 60);
        assert_eq!(s.reconciler_interval_secs, 5 * 60);
        assert_eq!(s.webhook_dedup_window_secs, 30);
        // Heartbeat cadence must sit inside the 2.4-2.6 s conformance band.
        assert!(s.stream_heartbeat_ms >= 2400 && s.stream_heartbeat_ms <= 2600);
        // The stored token lifetime must sit strictly below a 90 minute grant.
        assert!(s.token_stored_lifetime_secs < 90 * 60);
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jt_settings.toml");
        let first = initialise_settings(&path).unwrap();
        assert!(path.exists());
        let second = initialise_settings(&path).unwrap();
        assert_eq!(first.listen_address, second.listen_address);
        assert_eq!(first.exec_workers, second.exec_workers);
    }
}
