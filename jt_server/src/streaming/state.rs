use std::time::{Duration, Instant};

/// Connection lifecycle for one shared streaming session. One connection
/// exists per (broker, token); accounts multiplex over it.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Authenticating,
    Subscribing,
    Live { since: Instant },
    /// Peer went quiet past the silence timeout; a heartbeat probe is
    /// forced and the dead-subscription clock is running.
    Silent { since: Instant },
    Dead,
    Backoff { attempt: u32, until: Instant },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Live { .. } | ConnectionState::Silent { .. })
    }

    /// The connect-gate region: states that hold a gate permit.
    pub fn holds_gate(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Subscribing
        )
    }
}

/// Exponential backoff with jitter, capped at 60 s. The cap matters more
/// than the curve: past it, many tokens reconnecting together stay spread
/// out instead of synchronizing into a herd.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(2u64.saturating_pow(attempt.min(6)));
    let capped = base.min(Duration::from_secs(60));
    let jitter_ms = (rand::random::<u64>() % 1000) as u64;
    capped + Duration::from_millis(jitter_ms)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    /// No frames inside the silence timeout: force a heartbeat, move to
    /// `Silent`, keep the connection.
    Probe,
    /// Connection is alive but carried zero data through the whole
    /// dead-subscription window during market hours: tear it down. The
    /// window is deliberately wide; tighter values herd reconnects across
    /// tokens and the broker answers with rate limits.
    ForceReconnect,
}

/// Pure liveness classification for the hub's watchdog.
#[derive(Clone, Copy, Debug)]
pub struct LivenessPolicy {
    pub silence_timeout: Duration,
    pub dead_subscription_window: Duration,
    pub max_session_age: Duration,
}

impl LivenessPolicy {
    pub fn from_settings(settings: &jt_standard_lib::settings::ServerSettings) -> Self {
        Self {
            silence_timeout: Duration::from_secs(settings.stream_silence_timeout_secs),
            dead_subscription_window: Duration::from_secs(
                30 * settings.stream_dead_sub_windows as u64,
            ),
            max_session_age: Duration::from_secs(settings.stream_token_max_age_secs),
        }
    }

    pub fn classify(
        &self,
        now: Instant,
        connected_at: Instant,
        last_message: Instant,
        last_data: Instant,
        market_open: bool,
    ) -> Liveness {
        // Tokens age out: a session older than the token's useful life
        // reconnects with a fresh one.
        if now.duration_since(connected_at) >= self.max_session_age {
            return Liveness::ForceReconnect;
        }
        if market_open && now.duration_since(last_data) >= self.dead_subscription_window {
            return Liveness::ForceReconnect;
        }
        if now.duration_since(last_message) >= self.silence_timeout {
            return Liveness::Probe;
        }
        Liveness::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> LivenessPolicy {
        LivenessPolicy {
            silence_timeout: Duration::from_secs(10),
            dead_subscription_window: Duration::from_secs(300),
            max_session_age: Duration::from_secs(70 * 60),
        }
    }

    #[test]
    fn quiet_peer_probes_after_ten_seconds() {
        let p = policy();
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(11);
        assert_eq!(
            p.classify(now, t0, t0, now - Duration::from_secs(1), true),
            Liveness::Probe
        );
    }

    #[test]
    fn fresh_messages_are_healthy() {
        let p = policy();
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(5);
        assert_eq!(p.classify(now, t0, now, now, true), Liveness::Healthy);
    }

    #[test]
    fn dead_subscription_forces_reconnect_only_in_market_hours() {
        let p = policy();
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(301);
        // Heartbeats keep arriving (last_message fresh) but zero data.
        assert_eq!(p.classify(now, t0, now, t0, true), Liveness::ForceReconnect);
        // Overnight the same silence is expected and tolerated.
        assert_eq!(p.classify(now, t0, now, t0, false), Liveness::Healthy);
    }

    #[test]
    fn old_sessions_recycle_for_fresh_tokens() {
        let p = policy();
        let t0 = Instant::now();
        let now = t0 + Duration::from_secs(70 * 60 + 1);
        assert_eq!(p.classify(now, t0, now, now, false), Liveness::ForceReconnect);
    }

    #[test]
    fn backoff_is_capped_at_a_minute() {
        for attempt in 0..12 {
            let d = backoff_delay(attempt);
            assert!(d <= Duration::from_secs(61), "attempt {} gave {:?}", attempt, d);
        }
        assert!(backoff_delay(0) >= Duration::from_secs(1));
    }

    #[test]
    fn gate_region_matches_connect_states() {
        assert!(ConnectionState::Connecting.holds_gate());
        assert!(ConnectionState::Authenticating.holds_gate());
        assert!(ConnectionState::Subscribing.holds_gate());
        assert!(!ConnectionState::Live { since: Instant::now() }.holds_gate());
        assert!(!ConnectionState::Dead.holds_gate());
    }

    proptest! {
        /// Classification is monotone: if a timestamp pair is ForceReconnect,
        /// any older data timestamp is too.
        #[test]
        fn force_reconnect_is_monotone_in_data_age(extra in 0u64..10_000u64) {
            let p = policy();
            let t0 = Instant::now();
            let now = t0 + Duration::from_secs(400);
            let base = p.classify(now, t0, now, t0 + Duration::from_secs(90), true);
            prop_assert_eq!(base, Liveness::ForceReconnect);
            let older = p.classify(
                now + Duration::from_secs(extra),
                t0,
                now + Duration::from_secs(extra),
                t0,
                true,
            );
            prop_assert_eq!(older, Liveness::ForceReconnect);
        }
    }
}
