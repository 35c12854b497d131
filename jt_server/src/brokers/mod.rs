use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::warn;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::standardized_types::accounts::Account;
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::standardized_types::enums::OrderSide;
use jt_standard_lib::standardized_types::orders::{
    BracketIds, BracketSpec, BrokerOrder, BrokerPosition, ContractSpec, OrderId, OrderUpdate,
};
use jt_standard_lib::standardized_types::{Price, SymbolName, Volume};

pub mod projectx;
pub mod sim;
pub mod tradier;
pub mod tradovate;

/// The uniform capability set every brokerage variant implements. All
/// methods return structured results; a 2xx with a broker-side error body
/// still comes back as `Err`.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn brokerage(&self) -> Brokerage;

    async fn resolve_contract(
        &self,
        account: &Account,
        symbol: &SymbolName,
    ) -> Result<ContractSpec, JtError>;

    async fn place_market(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        client_order_id: &str,
    ) -> Result<OrderId, JtError>;

    /// Entry plus exits in a single broker call. Bracket distances arrive
    /// in points; the adapter converts and signs per the broker's wire
    /// conventions.
    async fn place_bracket(
        &self,
        account: &Account,
        bracket: &BracketSpec,
    ) -> Result<BracketIds, JtError>;

    async fn place_limit(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        limit_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError>;

    async fn place_stop(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trigger_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError>;

    async fn place_stop_limit(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trigger_price: Price,
        limit_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError>;

    async fn place_trailing_stop(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trail_points: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError>;

    async fn cancel_order(&self, account: &Account, order_id: &OrderId) -> Result<(), JtError>;

    /// Advisory only: brokers may acknowledge without applying. Callers
    /// verify by re-reading open orders, and bracket-managed exits never
    /// use this path at all (cancel-and-replace instead).
    async fn modify_order(
        &self,
        account: &Account,
        order_id: &OrderId,
        update: OrderUpdate,
    ) -> Result<(), JtError>;

    async fn list_positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, JtError>;

    async fn list_open_orders(&self, account: &Account) -> Result<Vec<BrokerOrder>, JtError>;

    /// Cancel working orders on the symbol and close the net position at
    /// market.
    async fn flatten(&self, account: &Account, symbol: &SymbolName) -> Result<(), JtError>;

    /// Proactive token refresh. `Ok(None)` means this brokerage has nothing
    /// to refresh (long lived keys).
    async fn refresh_credentials(
        &self,
        account: &Account,
    ) -> Result<Option<jt_standard_lib::standardized_types::accounts::BrokerCredentials>, JtError> {
        let _ = account;
        Ok(None)
    }

    /// Full password-grant re-login, the fallback when a refresh fails.
    async fn relogin(
        &self,
        account: &Account,
    ) -> Result<Option<jt_standard_lib::standardized_types::accounts::BrokerCredentials>, JtError> {
        let _ = account;
        Ok(None)
    }
}

/// Adapter variants constructed once at startup and shared everywhere.
/// Activation order matches the declaration order in the settings docs.
pub struct BrokerRegistry {
    clients: BTreeMap<Brokerage, Arc<dyn BrokerClient>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self { clients: BTreeMap::new() }
    }

    pub fn register(&mut self, client: Arc<dyn BrokerClient>) {
        self.clients.insert(client.brokerage(), client);
    }

    pub fn client_for(&self, brokerage: Brokerage) -> Result<Arc<dyn BrokerClient>, JtError> {
        self.clients
            .get(&brokerage)
            .cloned()
            .ok_or_else(|| JtError::NotFound(format!("no adapter active for {}", brokerage)))
    }

    pub fn active(&self) -> Vec<Brokerage> {
        self.clients.keys().copied().collect()
    }
}

impl Default for BrokerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry discipline for broker calls: exponential backoff at 1, 2, 4, 8,
/// 16 seconds, five attempts total, and only for retriable kinds. A
/// `RateLimited { retry_after }` longer than the scheduled backoff wins.
pub async fn with_broker_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, JtError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, JtError>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut delay = Duration::from_secs(1);

    for attempt in 1..=MAX_ATTEMPTS {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < MAX_ATTEMPTS => {
                let wait = match &err {
                    JtError::RateLimited { retry_after: Some(after) } => (*after).max(delay),
                    _ => delay,
                };
                warn!(operation, attempt, wait_secs = wait.as_secs(), error = %err, "broker call retrying");
                sleep(wait).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("retry loop always returns by the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_up_to_five_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), JtError> = with_broker_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(JtError::RateLimited { retry_after: None }) }
        })
        .await;
        assert!(matches!(result, Err(JtError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn rejections_are_never_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), JtError> = with_broker_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(JtError::BrokerRejected { reason: "margin".to_string() })
            }
        })
        .await;
        assert!(matches!(result, Err(JtError::BrokerRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_eventually_succeed() {
        let calls = AtomicU32::new(0);
        let result = with_broker_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(JtError::BrokerUnreachable("connection reset".to_string()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
