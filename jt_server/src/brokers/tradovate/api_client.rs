use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::warn;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::standardized_types::accounts::{Account, BrokerCredentials};
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::standardized_types::enums::{Environment, OrderSide};
use jt_standard_lib::standardized_types::orders::{
    BracketIds, BracketSpec, BrokerOrder, BrokerOrderStatus, BrokerOrderType, BrokerPosition,
    ContractSpec, OrderId, OrderUpdate,
};
use jt_standard_lib::standardized_types::{Price, SymbolName, Volume};

use super::models::*;
use crate::brokers::BrokerClient;

const LIVE_URL: &str = "https://live.tradovateapi.com/v1";
const DEMO_URL: &str = "https://demo.tradovateapi.com/v1";
const APP_ID: &str = "JTPlatform";
const APP_VERSION: &str = "1.0";

/// Futures REST adapter. Tokens are short lived (the broker grants 90
/// minutes; we store 85) and owned by the credential keeper; this client
/// only consumes whatever token currently sits on the account.
pub struct TradovateClient {
    http: reqwest::Client,
    /// Locally stored token validity, strictly below the broker's grant.
    stored_token_lifetime: ChronoDuration,
    order_timeout: Duration,
}

impl TradovateClient {
    pub fn new(read_timeout_secs: u64, order_timeout_secs: u64, stored_token_lifetime_secs: i64) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(read_timeout_secs))
                .build()
                .expect("reqwest client"),
            stored_token_lifetime: ChronoDuration::seconds(stored_token_lifetime_secs),
            order_timeout: Duration::from_secs(order_timeout_secs),
        }
    }

    fn base_url(account: &Account) -> &'static str {
        match account.environment {
            Environment::Live => LIVE_URL,
            Environment::Demo => DEMO_URL,
        }
    }

    fn bearer_token(account: &Account) -> Result<String, JtError> {
        match &account.credentials {
            BrokerCredentials::OAuthToken { access_token, .. } if !access_token.is_empty() => {
                Ok(access_token.clone())
            }
            _ => Err(JtError::AuthExpired(format!(
                "account {} has no usable access token",
                account.id
            ))),
        }
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, JtError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(JtError::AuthExpired("token rejected".to_string()));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(JtError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JtError::BrokerRejected {
                reason: format!("HTTP {}: {}", status, body),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| JtError::BrokerUnreachable(format!("decode: {}", e)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        account: &Account,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, JtError> {
        let token = Self::bearer_token(account)?;
        let response = self
            .http
            .get(format!("{}{}", Self::base_url(account), path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| JtError::BrokerUnreachable(e.to_string()))?;
        Self::decode(response).await
    }

    async fn post_json<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        account: &Account,
        path: &str,
        body: &B,
    ) -> Result<T, JtError> {
        let token = Self::bearer_token(account)?;
        let response = self
            .http
            .post(format!("{}{}", Self::base_url(account), path))
            .bearer_auth(token)
            .timeout(self.order_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| JtError::BrokerUnreachable(e.to_string()))?;
        Self::decode(response).await
    }

    fn action_for(side: OrderSide) -> &'static str {
        match side {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }

    /// Futures roots drop the expiry: year digits, then the month letter.
    /// `MNQH6` -> `MNQ`, `M2KU6` -> `M2K`, bare roots pass through.
    fn product_root(symbol: &str) -> &str {
        let without_year = symbol.trim_end_matches(|c: char| c.is_ascii_digit());
        if without_year.len() < symbol.len() && without_year.len() > 1 {
            &symbol[..without_year.len() - 1]
        } else {
            symbol
        }
    }

    async fn place(
        &self,
        account: &Account,
        request: &PlaceOrderRequest,
    ) -> Result<OrderId, JtError> {
        let response: PlaceOrderResponse =
            self.post_json(account, "/order/placeorder", request).await?;
        if let Some(text) = response.failure_text.or(response.failure_reason) {
            return Err(JtError::BrokerRejected { reason: text });
        }
        match response.order_id {
            Some(id) => Ok(id.to_string()),
            None => Err(JtError::BrokerRejected {
                reason: "no order id in accepted response".to_string(),
            }),
        }
    }

    fn base_order(
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        order_type: &str,
        client_order_id: &str,
    ) -> PlaceOrderRequest {
        PlaceOrderRequest {
            account_spec: account.subaccount_id.clone(),
            account_id: account.subaccount_id.parse().ok(),
            action: Self::action_for(side).to_string(),
            symbol: symbol.clone(),
            order_qty: quantity,
            order_type: order_type.to_string(),
            price: None,
            stop_price: None,
            trail_distance: None,
            is_automated: true,
            cl_ord_id: client_order_id.to_string(),
        }
    }
}

#[async_trait]
impl BrokerClient for TradovateClient {
    fn brokerage(&self) -> Brokerage {
        Brokerage::Tradovate
    }

    async fn resolve_contract(
        &self,
        account: &Account,
        symbol: &SymbolName,
    ) -> Result<ContractSpec, JtError> {
        let contract: ContractItem = self
            .get_json(account, "/contract/find", &[("name", symbol.clone())])
            .await?;
        let product: ProductItem = self
            .get_json(
                account,
                "/product/find",
                &[("name", Self::product_root(symbol).to_string())],
            )
            .await?;
        let tick_size = product.tick_size.ok_or_else(|| {
            JtError::IntegrityViolation(format!("product {} has no tick size", product.name))
        })?;
        let tick_value = product
            .value_per_point
            .map(|vpp| vpp * tick_size)
            .unwrap_or(tick_size);
        Ok(ContractSpec {
            contract_id: contract.id.to_string(),
            symbol: contract.name,
            tick_size,
            tick_value,
        })
    }

    async fn place_market(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        let request = Self::base_order(account, symbol, side, quantity, "Market", client_order_id);
        self.place(account, &request).await
    }

    async fn place_bracket(
        &self,
        account: &Account,
        bracket: &BracketSpec,
    ) -> Result<BracketIds, JtError> {
        // Offsets are signed: profit in the trade direction, stop against it.
        let direction = match bracket.side {
            OrderSide::Buy => rust_decimal::Decimal::ONE,
            OrderSide::Sell => -rust_decimal::Decimal::ONE,
        };
        let stop = bracket.stop.as_ref();
        let brackets: Vec<OsoBracket> = bracket
            .legs
            .iter()
            .enumerate()
            .map(|(i, leg)| OsoBracket {
                qty: leg.quantity,
                profit_target: leg.distance_points * direction,
                // The broker attaches one stop per bracket rung; splitting
                // the configured stop across rungs keeps the covered
                // quantity equal to the entry quantity.
                stop_loss: stop.map(|s| -s.distance_points() * direction),
                trailing_stop: match stop {
                    Some(jt_standard_lib::standardized_types::orders::StopSpec::Trailing {
                        ..
                    }) if i == 0 => Some(true),
                    _ => None,
                },
            })
            .collect();

        let request = PlaceOsoRequest {
            account_spec: account.subaccount_id.clone(),
            account_id: account.subaccount_id.parse().ok(),
            action: Self::action_for(bracket.side).to_string(),
            symbol: bracket.symbol.clone(),
            order_qty: bracket.quantity,
            order_type: "Market".to_string(),
            is_automated: true,
            cl_ord_id: bracket.client_order_id.clone(),
            brackets,
        };

        let response: PlaceOsoResponse =
            self.post_json(account, "/order/placeoso", &request).await?;
        if let Some(text) = response.failure_text.or(response.failure_reason) {
            return Err(JtError::BrokerRejected { reason: text });
        }
        let entry_id = response.order_id.ok_or_else(|| JtError::BrokerRejected {
            reason: "no order id in accepted oso response".to_string(),
        })?;
        Ok(BracketIds {
            strategy_id: entry_id.to_string(),
            entry_order_id: Some(entry_id.to_string()),
            tp_order_ids: response
                .oso_ids
                .unwrap_or_default()
                .iter()
                .map(|id| id.to_string())
                .collect(),
            sl_order_id: None,
        })
    }

    async fn place_limit(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        limit_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        let mut request =
            Self::base_order(account, symbol, side, quantity, "Limit", client_order_id);
        request.price = Some(limit_price);
        self.place(account, &request).await
    }

    async fn place_stop(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trigger_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        let mut request =
            Self::base_order(account, symbol, side, quantity, "Stop", client_order_id);
        request.stop_price = Some(trigger_price);
        self.place(account, &request).await
    }

    async fn place_stop_limit(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trigger_price: Price,
        limit_price: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        let mut request =
            Self::base_order(account, symbol, side, quantity, "StopLimit", client_order_id);
        request.stop_price = Some(trigger_price);
        request.price = Some(limit_price);
        self.place(account, &request).await
    }

    async fn place_trailing_stop(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
        quantity: Volume,
        trail_points: Price,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        let mut request =
            Self::base_order(account, symbol, side, quantity, "TrailingStop", client_order_id);
        request.trail_distance = Some(trail_points);
        self.place(account, &request).await
    }

    async fn cancel_order(&self, account: &Account, order_id: &OrderId) -> Result<(), JtError> {
        let id: i64 = order_id
            .parse()
            .map_err(|_| JtError::BadRequest(format!("bad order id {}", order_id)))?;
        let response: PlaceOrderResponse = self
            .post_json(account, "/order/cancelorder", &serde_json::json!({ "orderId": id }))
            .await?;
        if let Some(text) = response.failure_text.or(response.failure_reason) {
            return Err(JtError::BrokerRejected { reason: text });
        }
        Ok(())
    }

    async fn modify_order(
        &self,
        account: &Account,
        order_id: &OrderId,
        update: OrderUpdate,
    ) -> Result<(), JtError> {
        let id: i64 = order_id
            .parse()
            .map_err(|_| JtError::BadRequest(format!("bad order id {}", order_id)))?;
        let mut body = serde_json::json!({ "orderId": id });
        match update {
            OrderUpdate::Quantity(qty) => body["orderQty"] = serde_json::json!(qty),
            OrderUpdate::LimitPrice(price) => body["price"] = serde_json::json!(price),
            OrderUpdate::StopPrice(price) => body["stopPrice"] = serde_json::json!(price),
        }
        let response: PlaceOrderResponse =
            self.post_json(account, "/order/modifyorder", &body).await?;
        if let Some(text) = response.failure_text.or(response.failure_reason) {
            return Err(JtError::BrokerRejected { reason: text });
        }
        // Accepted is not applied; callers re-read before trusting it.
        Ok(())
    }

    async fn list_positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, JtError> {
        let items: Vec<PositionItem> = self.get_json(account, "/position/list", &[]).await?;
        let account_id: Option<i64> = account.subaccount_id.parse().ok();
        let mut positions = Vec::new();
        for item in items {
            if item.archived || item.net_pos == rust_decimal::Decimal::ZERO {
                continue;
            }
            if let Some(id) = account_id {
                if item.account_id != id {
                    continue;
                }
            }
            positions.push(BrokerPosition {
                symbol: item.contract_id.to_string(),
                quantity: item.net_pos,
                average_price: item.net_price.unwrap_or_default(),
            });
        }
        Ok(positions)
    }

    async fn list_open_orders(&self, account: &Account) -> Result<Vec<BrokerOrder>, JtError> {
        let items: Vec<OrderItem> = self.get_json(account, "/order/list", &[]).await?;
        let account_id: Option<i64> = account.subaccount_id.parse().ok();
        let mut orders = Vec::new();
        for item in items {
            if let Some(id) = account_id {
                if item.account_id != id {
                    continue;
                }
            }
            let status = match item.ord_status.as_str() {
                "Working" | "Suspended" | "PendingNew" => BrokerOrderStatus::Working,
                "Filled" => BrokerOrderStatus::Filled,
                "Canceled" => BrokerOrderStatus::Cancelled,
                "Rejected" => BrokerOrderStatus::Rejected,
                _ => continue,
            };
            if status != BrokerOrderStatus::Working {
                continue;
            }
            orders.push(BrokerOrder {
                order_id: item.id.to_string(),
                client_order_id: item.cl_ord_id,
                symbol: item.contract_id.map(|c| c.to_string()).unwrap_or_default(),
                side: if item.action == "Buy" { OrderSide::Buy } else { OrderSide::Sell },
                quantity: item.order_qty.unwrap_or_default(),
                order_type: match item.order_type.as_deref() {
                    Some("Limit") => BrokerOrderType::Limit,
                    Some("Stop") => BrokerOrderType::Stop,
                    Some("StopLimit") => BrokerOrderType::StopLimit,
                    Some("TrailingStop") => BrokerOrderType::TrailingStop,
                    _ => BrokerOrderType::Market,
                },
                limit_price: item.limit_price,
                stop_price: item.stop_price,
                status,
                placed_at: item.timestamp.and_then(|t| t.parse().ok()),
            });
        }
        Ok(orders)
    }

    async fn flatten(&self, account: &Account, symbol: &SymbolName) -> Result<(), JtError> {
        let response: PlaceOrderResponse = self
            .post_json(
                account,
                "/order/liquidateposition",
                &serde_json::json!({
                    "accountId": account.subaccount_id.parse::<i64>().ok(),
                    "symbol": symbol,
                    "admin": false,
                }),
            )
            .await?;
        if let Some(text) = response.failure_text.or(response.failure_reason) {
            return Err(JtError::BrokerRejected { reason: text });
        }
        Ok(())
    }

    async fn refresh_credentials(
        &self,
        account: &Account,
    ) -> Result<Option<BrokerCredentials>, JtError> {
        let (username, password) = match &account.credentials {
            BrokerCredentials::OAuthToken { username, password, .. } => {
                (username.clone(), password.clone())
            }
            _ => return Ok(None),
        };

        let response: AccessTokenResponse = self
            .post_json(account, "/auth/renewaccesstoken", &serde_json::json!({}))
            .await?;
        if !response.succeeded() {
            warn!(
                account_id = account.id,
                error = response.error_text.as_deref().unwrap_or("no token in response"),
                "token renewal failed"
            );
            return Err(JtError::AuthExpired(format!("renewal failed for {}", account.id)));
        }

        Ok(Some(BrokerCredentials::OAuthToken {
            username,
            password,
            access_token: response.access_token.unwrap_or_default(),
            expires_at: Utc::now() + self.stored_token_lifetime,
        }))
    }

    async fn relogin(&self, account: &Account) -> Result<Option<BrokerCredentials>, JtError> {
        let (username, password) = match &account.credentials {
            BrokerCredentials::OAuthToken { username, password, .. } => {
                (username.clone(), password.clone())
            }
            _ => return Ok(None),
        };

        let request = AccessTokenRequest {
            name: username.clone(),
            password: password.clone(),
            app_id: APP_ID.to_string(),
            app_version: APP_VERSION.to_string(),
            device_id: format!("jt-{}", account.id),
        };
        let response = self
            .http
            .post(format!("{}/auth/accesstokenrequest", Self::base_url(account)))
            .json(&request)
            .send()
            .await
            .map_err(|e| JtError::BrokerUnreachable(e.to_string()))?;
        let token: AccessTokenResponse = Self::decode(response).await?;
        if !token.succeeded() {
            return Err(JtError::AuthExpired(format!(
                "password grant failed for {}: {}",
                account.id,
                token.error_text.unwrap_or_else(|| "no token".to_string())
            )));
        }

        Ok(Some(BrokerCredentials::OAuthToken {
            username,
            password,
            access_token: token.access_token.unwrap_or_default(),
            expires_at: Utc::now() + self.stored_token_lifetime,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_root_strips_month_and_year() {
        assert_eq!(TradovateClient::product_root("MNQH6"), "MNQ");
        assert_eq!(TradovateClient::product_root("ESZ5"), "ES");
        assert_eq!(TradovateClient::product_root("M2KU6"), "M2K");
    }
}
