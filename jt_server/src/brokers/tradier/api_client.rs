use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::de::DeserializeOwned;
use sha2::Sha256;

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

type HmacSha256 = Hmac<Sha256>;

const LIVE_URL: &str = "https://api.tradier.com/v1";
const SANDBOX_URL: &str = "https://sandbox.tradier.com/v1";

/// Equity/options adapter. Requests carry an HMAC-SHA256 signature over
/// `timestamp + method + path + body`; there is no streaming surface, so
/// bracket fill detection for this broker falls to the reconciler sweep.
pub struct TradierClient {
    http: reqwest::Client,
    order_timeout: Duration,
}

impl TradierClient {
    pub fn new(read_timeout_secs: u64, order_timeout_secs: u64) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(read_timeout_secs))
                .build()
                .expect("reqwest client"),
            order_timeout: Duration::from_secs(order_timeout_secs),
        }
    }

    fn base_url(account: &Account) -> &'static str {
        match account.environment {
            Environment::Live => LIVE_URL,
            Environment::Demo => SANDBOX_URL,
        }
    }

    fn keys(account: &Account) -> Result<(String, String), JtError> {
        match &account.credentials {
            BrokerCredentials::HmacKey { key, secret } if !key.is_empty() => {
                Ok((key.clone(), secret.clone()))
            }
            _ => Err(JtError::AuthExpired(format!(
                "account {} has no signing keys",
                account.id
            ))),
        }
    }

    fn sign(secret: &str, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(timestamp.as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn request<T: DeserializeOwned>(
        &self,
        account: &Account,
        method: reqwest::Method,
        path: &str,
        form: Option<&[(&str, String)]>,
        is_order: bool,
    ) -> Result<T, JtError> {
        let (key, secret) = Self::keys(account)?;
        let body = form
            .map(|pairs| {
                pairs
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                    .collect::<Vec<_>>()
                    .join("&")
            })
            .unwrap_or_default();
        let timestamp = Utc::now().timestamp().to_string();
        let signature = Self::sign(&secret, &timestamp, method.as_str(), path, &body);

        let mut request = self
            .http
            .request(method, format!("{}{}", Self::base_url(account), path))
            .header("Accept", "application/json")
            .header("X-Api-Key", key)
            .header("X-Timestamp", timestamp)
            .header("X-Signature", signature);
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body);
        }
        if is_order {
            request = request.timeout(self.order_timeout);
        }

        let response = request
            .send()
            .await
            .map_err(|e| JtError::BrokerUnreachable(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(JtError::AuthExpired("signature rejected".to_string()));
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
            return Err(JtError::BrokerRejected { reason: format!("HTTP {}: {}", status, body) });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| JtError::BrokerUnreachable(format!("decode: {}", e)))
    }

    fn orders_path(account: &Account) -> String {
        format!("/accounts/{}/orders", account.subaccount_id)
    }

    fn side_word(side: OrderSide, reduces: bool) -> &'static str {
        match (side, reduces) {
            (OrderSide::Buy, false) => "buy",
            (OrderSide::Buy, true) => "buy_to_cover",
            (OrderSide::Sell, false) => "sell_short",
            (OrderSide::Sell, true) => "sell",
        }
    }

    async fn submit_order(
        &self,
        account: &Account,
        form: Vec<(&str, String)>,
    ) -> Result<OrderId, JtError> {
        let envelope: OrderEnvelope = self
            .request(
                account,
                reqwest::Method::POST,
                &Self::orders_path(account),
                Some(&form),
                true,
            )
            .await?;
        if let Some(errors) = envelope.errors {
            return Err(JtError::BrokerRejected { reason: errors.error.join("; ") });
        }
        match envelope.order {
            Some(order) => Ok(order.id.to_string()),
            None => Err(JtError::BrokerRejected {
                reason: "no order in accepted response".to_string(),
            }),
        }
    }

    /// Whether the order reduces an existing position, which picks the
    /// broker's long/short side words.
    async fn order_reduces(
        &self,
        account: &Account,
        symbol: &SymbolName,
        side: OrderSide,
    ) -> Result<bool, JtError> {
        let current = self
            .list_positions(account)
            .await?
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        Ok(match side {
            OrderSide::Buy => current < Decimal::ZERO,
            OrderSide::Sell => current > Decimal::ZERO,
        })
    }
}

#[async_trait]
impl BrokerClient for TradierClient {
    fn brokerage(&self) -> Brokerage {
        Brokerage::Tradier
    }

    async fn resolve_contract(
        &self,
        _account: &Account,
        symbol: &SymbolName,
    ) -> Result<ContractSpec, JtError> {
        // Listed equities and options trade in pennies; there is no contract
        // metadata endpoint worth a round trip.
        Ok(ContractSpec {
            contract_id: symbol.clone(),
            symbol: symbol.clone(),
            tick_size: dec!(0.01),
            tick_value: dec!(0.01),
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
        let reduces = self.order_reduces(account, symbol, side).await?;
        self.submit_order(
            account,
            vec![
                ("class", "equity".to_string()),
                ("symbol", symbol.clone()),
                ("side", Self::side_word(side, reduces).to_string()),
                ("quantity", quantity.to_string()),
                ("type", "market".to_string()),
                ("duration", "day".to_string()),
                ("tag", client_order_id.to_string()),
            ],
        )
        .await
    }

    /// No native bracket: entry at market, then each exit as its own
    /// resting order priced off the reported cost basis.
    async fn place_bracket(
        &self,
        account: &Account,
        bracket: &BracketSpec,
    ) -> Result<BracketIds, JtError> {
        let entry_id = self
            .place_market(
                account,
                &bracket.symbol,
                bracket.side,
                bracket.quantity,
                &bracket.client_order_id,
            )
            .await?;

        let entry_price = self
            .list_positions(account)
            .await?
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(&bracket.symbol))
            .map(|p| p.average_price)
            .ok_or_else(|| JtError::BrokerRejected {
                reason: "entry filled but no position reported".to_string(),
            })?;

        let direction = match bracket.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };
        let exit_side = bracket.side.opposite();

        let mut tp_order_ids = Vec::new();
        for leg in &bracket.legs {
            let id = self
                .place_limit(
                    account,
                    &bracket.symbol,
                    exit_side,
                    leg.quantity,
                    entry_price + leg.distance_points * direction,
                    &bracket.client_order_id,
                )
                .await?;
            tp_order_ids.push(id);
        }

        let sl_order_id = match &bracket.stop {
            Some(stop) => {
                let trigger = entry_price - stop.distance_points() * direction;
                Some(
                    self.place_stop(
                        account,
                        &bracket.symbol,
                        exit_side,
                        bracket.quantity,
                        trigger,
                        &bracket.client_order_id,
                    )
                    .await?,
                )
            }
            None => None,
        };

        Ok(BracketIds {
            strategy_id: entry_id.clone(),
            entry_order_id: Some(entry_id),
            tp_order_ids,
            sl_order_id,
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
        let reduces = self.order_reduces(account, symbol, side).await?;
        self.submit_order(
            account,
            vec![
                ("class", "equity".to_string()),
                ("symbol", symbol.clone()),
                ("side", Self::side_word(side, reduces).to_string()),
                ("quantity", quantity.to_string()),
                ("type", "limit".to_string()),
                ("duration", "gtc".to_string()),
                ("price", limit_price.to_string()),
                ("tag", client_order_id.to_string()),
            ],
        )
        .await
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
        let reduces = self.order_reduces(account, symbol, side).await?;
        self.submit_order(
            account,
            vec![
                ("class", "equity".to_string()),
                ("symbol", symbol.clone()),
                ("side", Self::side_word(side, reduces).to_string()),
                ("quantity", quantity.to_string()),
                ("type", "stop".to_string()),
                ("duration", "gtc".to_string()),
                ("stop", trigger_price.to_string()),
                ("tag", client_order_id.to_string()),
            ],
        )
        .await
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
        let reduces = self.order_reduces(account, symbol, side).await?;
        self.submit_order(
            account,
            vec![
                ("class", "equity".to_string()),
                ("symbol", symbol.clone()),
                ("side", Self::side_word(side, reduces).to_string()),
                ("quantity", quantity.to_string()),
                ("type", "stop_limit".to_string()),
                ("duration", "gtc".to_string()),
                ("price", limit_price.to_string()),
                ("stop", trigger_price.to_string()),
                ("tag", client_order_id.to_string()),
            ],
        )
        .await
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
        // No native trailing order type; emulate with a fixed stop off the
        // current cost basis and let the reconciler walk it.
        let basis = self
            .list_positions(account)
            .await?
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
            .map(|p| p.average_price)
            .unwrap_or(Decimal::ZERO);
        let trigger = match side {
            OrderSide::Sell => basis - trail_points,
            OrderSide::Buy => basis + trail_points,
        };
        self.place_stop(account, symbol, side, quantity, trigger, client_order_id)
            .await
    }

    async fn cancel_order(&self, account: &Account, order_id: &OrderId) -> Result<(), JtError> {
        let path = format!("{}/{}", Self::orders_path(account), order_id);
        let _: serde_json::Value = self
            .request(account, reqwest::Method::DELETE, &path, None, true)
            .await?;
        Ok(())
    }

    async fn modify_order(
        &self,
        account: &Account,
        order_id: &OrderId,
        update: OrderUpdate,
    ) -> Result<(), JtError> {
        let path = format!("{}/{}", Self::orders_path(account), order_id);
        let form = match update {
            OrderUpdate::Quantity(qty) => vec![("quantity", qty.to_string())],
            OrderUpdate::LimitPrice(price) => vec![("price", price.to_string())],
            OrderUpdate::StopPrice(price) => vec![("stop", price.to_string())],
        };
        let _: serde_json::Value = self
            .request(account, reqwest::Method::PUT, &path, Some(&form), true)
            .await?;
        Ok(())
    }

    async fn list_positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, JtError> {
        let envelope: PositionsEnvelope = self
            .request(
                account,
                reqwest::Method::GET,
                &format!("/accounts/{}/positions", account.subaccount_id),
                None,
                false,
            )
            .await?;
        Ok(envelope
            .positions
            .map(|body| {
                body.position
                    .into_iter()
                    .filter(|p| p.quantity != Decimal::ZERO)
                    .map(|p| BrokerPosition {
                        average_price: if p.quantity.abs() > Decimal::ZERO {
                            p.cost_basis / p.quantity.abs()
                        } else {
                            Decimal::ZERO
                        },
                        symbol: p.symbol,
                        quantity: p.quantity,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_open_orders(&self, account: &Account) -> Result<Vec<BrokerOrder>, JtError> {
        let envelope: OrdersEnvelope = self
            .request(
                account,
                reqwest::Method::GET,
                &Self::orders_path(account),
                None,
                false,
            )
            .await?;
        Ok(envelope
            .orders
            .map(|body| {
                body.order
                    .into_iter()
                    .filter(|o| matches!(o.status.as_str(), "open" | "pending" | "partially_filled"))
                    .map(|o| BrokerOrder {
                        order_id: o.id.to_string(),
                        client_order_id: o.tag,
                        symbol: o.symbol,
                        side: if o.side.starts_with("buy") { OrderSide::Buy } else { OrderSide::Sell },
                        quantity: o.quantity,
                        order_type: match o.order_type.as_str() {
                            "limit" => BrokerOrderType::Limit,
                            "stop" => BrokerOrderType::Stop,
                            "stop_limit" => BrokerOrderType::StopLimit,
                            _ => BrokerOrderType::Market,
                        },
                        limit_price: o.price,
                        stop_price: o.stop_price,
                        status: BrokerOrderStatus::Working,
                        placed_at: o.create_date.and_then(|t| t.parse().ok()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn flatten(&self, account: &Account, symbol: &SymbolName) -> Result<(), JtError> {
        for order in self.list_open_orders(account).await? {
            if order.symbol.eq_ignore_ascii_case(symbol) {
                self.cancel_order(account, &order.order_id).await?;
            }
        }
        let net = self
            .list_positions(account)
            .await?
            .into_iter()
            .find(|p| p.symbol.eq_ignore_ascii_case(symbol))
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO);
        if net == Decimal::ZERO {
            return Ok(());
        }
        let side = if net > Decimal::ZERO { OrderSide::Sell } else { OrderSide::Buy };
        self.place_market(account, symbol, side, net.abs(), "JT_MAN_flatten")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_and_key_dependent() {
        let a = TradierClient::sign("secret-a", "1700000000", "POST", "/accounts/1/orders", "x=1");
        let b = TradierClient::sign("secret-a", "1700000000", "POST", "/accounts/1/orders", "x=1");
        let c = TradierClient::sign("secret-b", "1700000000", "POST", "/accounts/1/orders", "x=1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64); // hex encoded sha256
    }

    #[test]
    fn side_words_depend_on_position_direction() {
        assert_eq!(TradierClient::side_word(OrderSide::Buy, false), "buy");
        assert_eq!(TradierClient::side_word(OrderSide::Buy, true), "buy_to_cover");
        assert_eq!(TradierClient::side_word(OrderSide::Sell, false), "sell_short");
        assert_eq!(TradierClient::side_word(OrderSide::Sell, true), "sell");
    }
}
