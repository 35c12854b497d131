use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use structopt::StructOpt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::settings::initialise_settings;
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::store::Store;

pub mod api;
pub mod brokers;
pub mod copy_engine;
pub mod credential_keeper;
pub mod execution;
pub mod position_sync;
pub mod reconciler;
pub mod signal_router;
pub mod streaming;
pub mod worker_pools;

use brokers::projectx::ProjectXClient;
use brokers::tradier::TradierClient;
use brokers::tradovate::TradovateClient;
use brokers::BrokerRegistry;
use copy_engine::CopyEngine;
use credential_keeper::CredentialKeeper;
use execution::ExecutionEngine;
use position_sync::PositionSyncListener;
use reconciler::Reconciler;
use signal_router::SignalRouter;
use streaming::StreamingHub;
use worker_pools::WorkerPools;

#[derive(Debug, StructOpt)]
struct ServerLaunchOptions {
    /// Path to the settings file; created with defaults when missing.
    #[structopt(
        short = "c",
        long = "settings",
        parse(from_os_str),
        default_value = "jt_settings.toml"
    )]
    settings_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), JtError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = ServerLaunchOptions::from_args();
    let settings = initialise_settings(&options.settings_path)?;

    let store = Store::connect(&settings.database_url)?;
    store.run_migrations().await?;
    info!(database = %settings.database_url, "store ready");

    // Adapter variants activate in declaration order up to the configured
    // count.
    let mut registry = BrokerRegistry::new();
    let variants = [Brokerage::Tradovate, Brokerage::ProjectX, Brokerage::Tradier];
    for brokerage in variants.iter().take(settings.broker_adapter_count) {
        match brokerage {
            Brokerage::Tradovate => registry.register(Arc::new(TradovateClient::new(
                settings.broker_read_timeout_secs,
                settings.broker_order_timeout_secs,
                settings.token_stored_lifetime_secs,
            ))),
            Brokerage::ProjectX => registry.register(Arc::new(ProjectXClient::new(
                settings.broker_read_timeout_secs,
                settings.broker_order_timeout_secs,
            ))),
            Brokerage::Tradier => registry.register(Arc::new(TradierClient::new(
                settings.broker_read_timeout_secs,
                settings.broker_order_timeout_secs,
            ))),
            Brokerage::Sim => {}
        }
    }
    let brokers = Arc::new(registry);
    info!(active = ?brokers.active(), "broker adapters ready");

    let keeper = CredentialKeeper::new(store.clone(), brokers.clone(), &settings);
    let keeper_task = keeper.spawn_sweep();

    let engine = ExecutionEngine::new(store.clone(), brokers.clone(), keeper.clone());
    let router = SignalRouter::new(store.clone(), &settings);
    let pools = WorkerPools::start(&settings, router.clone(), engine.clone());
    let hub = StreamingHub::new(keeper.clone(), &settings);
    let copy = CopyEngine::new(store.clone(), engine.clone(), brokers.clone(), &settings);
    let balances = Arc::new(DashMap::new());

    // Position/order/fill listeners keep the store in sync per account.
    let mut listener_ids = Vec::new();
    for account in store.list_enabled_accounts().await? {
        if !account.brokerage.has_streaming() {
            continue;
        }
        let listener = PositionSyncListener::new(
            store.clone(),
            brokers.clone(),
            account.brokerage,
            balances.clone(),
        );
        let id = hub.register(&account, vec![account.subaccount_id.clone()], listener);
        listener_ids.push(id);
    }

    // Leader-fill listeners feed the copy engine.
    for leader in store.list_leader_accounts().await? {
        if !leader.auto_copy_enabled {
            continue;
        }
        match store.get_account(leader.account_id).await {
            Ok(account) if account.brokerage.has_streaming() => {
                let listener = copy.listener_for(account.clone());
                let id = hub.register(&account, vec![account.subaccount_id.clone()], listener);
                listener_ids.push(id);
            }
            Ok(_) => {}
            Err(e) => warn!(leader_account = leader.account_id, error = %e, "leader account missing"),
        }
    }

    let reconciler = Reconciler::new(
        store.clone(),
        brokers.clone(),
        engine.clone(),
        Some(hub.clone()),
        &settings,
    );
    let reconciler_task = reconciler.spawn();

    let api_state = Arc::new(api::ApiState {
        store,
        router,
        pools: pools.clone(),
        hub: hub.clone(),
        engine,
        copy,
        balances,
        admin_api_key: settings.admin_api_key.clone(),
    });
    let app = api::build_router(api_state);

    let listener = tokio::net::TcpListener::bind(settings.listen_address)
        .await
        .map_err(|e| JtError::Internal(format!("bind {}: {}", settings.listen_address, e)))?;
    info!(address = %settings.listen_address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| JtError::Internal(format!("server: {}", e)))?;

    // Ordered teardown: inbound is already closed; drain the pools, then
    // drop stream listeners, then the background loops.
    info!("shutting down: draining pools");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    pools.close_ingest();
    for id in listener_ids {
        hub.unregister(id);
    }
    keeper_task.abort();
    reconciler_task.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received, beginning graceful shutdown");
}
