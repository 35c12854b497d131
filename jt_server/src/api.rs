use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use jt_standard_lib::standardized_types::accounts::AccountId;
use jt_standard_lib::store::Store;

use crate::copy_engine::CopyEngine;
use crate::execution::ExecutionEngine;
use crate::position_sync::BalanceSnapshot;
use crate::signal_router::{AcceptOutcome, SignalRouter};
use crate::streaming::StreamingHub;
use crate::worker_pools::WorkerPools;

const ADMIN_KEY_HEADER: &str = "x-admin-key";

pub struct ApiState {
    pub store: Store,
    pub router: Arc<SignalRouter>,
    pub pools: Arc<WorkerPools>,
    pub hub: Arc<StreamingHub>,
    pub engine: Arc<ExecutionEngine>,
    pub copy: Arc<CopyEngine>,
    pub balances: Arc<DashMap<String, BalanceSnapshot>>,
    pub admin_api_key: String,
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/webhook/:token", post(webhook))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/api/broker-execution/status", get(execution_status))
        .route("/api/broker-execution/failures", get(execution_failures))
        .route("/api/accounts/auth-status", get(auth_status))
        .route("/api/run-migrations", post(run_migrations))
        .route("/api/admin/flatten/:account", post(admin_flatten))
        .with_state(state)
}

/// Signal ingest. The budget from receipt to 2xx is tight: token lookup,
/// raw persist, parse, enqueue. Broker work happens on the pools. Never a
/// 4xx/5xx for a transient condition; the charting service only retries
/// 5xx and punishes nothing else.
async fn webhook(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
    body: String,
) -> Response {
    match state.router.accept(&token, &body, Utc::now()).await {
        Ok(AcceptOutcome::Accepted(job)) => {
            state.pools.enqueue_ingest(job);
            StatusCode::OK.into_response()
        }
        // Persisted for audit; nothing to execute.
        Ok(AcceptOutcome::Unparseable) => StatusCode::OK.into_response(),
        Ok(AcceptOutcome::UnknownToken) => StatusCode::NOT_FOUND.into_response(),
        Ok(AcceptOutcome::Gone) => StatusCode::GONE.into_response(),
        Err(e) => {
            // Could not persist: a genuine failure, and the one case where
            // an upstream retry actually helps.
            error!(error = %e, "webhook persistence failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({
        "streams": state.hub.status(),
        "pools": state.pools.stats.snapshot(),
    }))
}

async fn execution_status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let snapshot = state.pools.stats.snapshot();
    Json(json!({
        "workers_alive": snapshot.exec_alive,
        "queue_size": snapshot.exec_queue_depth,
        "processed_total": snapshot.exec_processed,
        "failed_total": snapshot.exec_failed,
        "dropped_total": snapshot.dropped,
        "avg_latency_ms": snapshot.avg_exec_latency_ms,
    }))
}

#[derive(Deserialize)]
struct FailuresQuery {
    #[serde(default = "default_failure_limit")]
    limit: i64,
}

fn default_failure_limit() -> i64 {
    50
}

async fn execution_failures(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<FailuresQuery>,
) -> Response {
    match state.store.list_execution_failures(query.limit).await {
        Ok(failures) => Json(failures).into_response(),
        Err(e) => {
            error!(error = %e, "failure listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn auth_status(State(state): State<Arc<ApiState>>) -> Response {
    match state.store.list_auth_statuses().await {
        Ok(statuses) => Json(json!({
            "accounts": statuses,
            "balances": state
                .balances
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect::<std::collections::HashMap<_, _>>(),
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "auth status listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Out-of-band admin key on every write endpoint. Internal callers carry
/// the same header, so cross-process invocations authenticate without a
/// user session.
fn require_admin(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let presented = headers
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if state.admin_api_key.is_empty() || presented != state.admin_api_key {
        warn!("admin endpoint rejected: bad or missing key");
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    Ok(())
}

async fn run_migrations(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = require_admin(&state, &headers) {
        return rejection;
    }
    match state.store.run_migrations().await {
        Ok(()) => {
            info!("migrations run via admin endpoint");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            error!(error = %e, "admin migrations failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Emergency flatten: every symbol the account holds goes to market, and
/// when the account is a copy leader the flatten fans out to followers
/// like any other leader transition.
async fn admin_flatten(
    State(state): State<Arc<ApiState>>,
    Path(account_id): Path<AccountId>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = require_admin(&state, &headers) {
        return rejection;
    }

    let account = match state.store.get_account(account_id).await {
        Ok(account) => account,
        Err(e) => {
            warn!(account_id, error = %e, "flatten target not found");
            return StatusCode::NOT_FOUND.into_response();
        }
    };

    let adapter = match state.engine.brokers().client_for(account.brokerage) {
        Ok(adapter) => adapter,
        Err(e) => {
            error!(error = %e, "no adapter for flatten");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let positions = match adapter.list_positions(&account).await {
        Ok(positions) => positions,
        Err(e) => {
            error!(error = %e, "position read failed during flatten");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let leader = state.store.get_leader_for_account(account.id).await.ok().flatten();
    let mut flattened = Vec::new();
    for position in positions {
        let prev = position.quantity;
        if let Err(e) = state
            .engine
            .flatten_account_symbol(&account, &position.symbol)
            .await
        {
            error!(symbol = %position.symbol, error = %e, "flatten failed");
            continue;
        }
        flattened.push(position.symbol.clone());

        if leader.is_some() {
            if let Err(e) = state
                .copy
                .copy_to_followers(&account, &position.symbol, prev, Decimal::ZERO, None, None)
                .await
            {
                warn!(symbol = %position.symbol, error = %e, "follower flatten fan-out failed");
            }
        }
    }

    info!(account_id, ?flattened, "admin flatten complete");
    Json(json!({ "flattened": flattened })).into_response()
}
