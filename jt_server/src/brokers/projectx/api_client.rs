use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::standardized_types::accounts::{Account, BrokerCredentials};
use jt_standard_lib::standardized_types::broker_enum::Brokerage;
use jt_standard_lib::standardized_types::enums::{Environment, OrderSide};
use jt_standard_lib::standardized_types::orders::{
    BracketIds, BracketSpec, BrokerOrder, BrokerOrderStatus, BrokerOrderType, BrokerPosition,
    ContractSpec, OrderId, OrderUpdate, StopSpec,
};
use jt_standard_lib::standardized_types::{Price, SymbolName, Volume};

use super::models::*;
use crate::brokers::BrokerClient;

const LIVE_URL: &str = "https://gateway.projectx.com/api";
const DEMO_URL: &str = "https://gateway-demo.projectx.com/api";

/// Prop-firm gateway adapter. Auth is a long lived API key sent as a
/// bearer credential; streaming rides a separate SignalR-style socket owned
/// by the hub. The gateway has no native bracket call, so `place_bracket`
/// composes entry + exits and reports the ids it collected.
pub struct ProjectXClient {
    http: reqwest::Client,
    order_timeout: Duration,
}

impl ProjectXClient {
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
            Environment::Demo => DEMO_URL,
        }
    }

    fn api_key(account: &Account) -> Result<String, JtError> {
        match &account.credentials {
            BrokerCredentials::ApiKey { key, .. } if !key.is_empty() => Ok(key.clone()),
            _ => Err(JtError::AuthExpired(format!(
                "account {} has no gateway api key",
                account.id
            ))),
        }
    }

    async fn post<B: serde::Serialize, T: DeserializeOwned>(
        &self,
        account: &Account,
        path: &str,
        body: &B,
        is_order: bool,
    ) -> Result<T, JtError> {
        let key = Self::api_key(account)?;
        let mut request = self
            .http
            .post(format!("{}{}", Self::base_url(account), path))
            .bearer_auth(key)
            .json(body);
        if is_order {
            request = request.timeout(self.order_timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| JtError::BrokerUnreachable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(JtError::AuthExpired("gateway key rejected".to_string()));
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

        let envelope: GatewayEnvelope<T> = response
            .json()
            .await
            .map_err(|e| JtError::BrokerUnreachable(format!("decode: {}", e)))?;
        if !envelope.success {
            return Err(JtError::BrokerRejected {
                reason: envelope
                    .error_message
                    .unwrap_or_else(|| format!("gateway error code {}", envelope.error_code)),
            });
        }
        envelope.payload.ok_or_else(|| JtError::BrokerRejected {
            reason: "success without payload".to_string(),
        })
    }

    fn side_code(side: OrderSide) -> i32 {
        match side {
            OrderSide::Buy => SIDE_BUY,
            OrderSide::Sell => SIDE_SELL,
        }
    }

    async fn place(
        &self,
        account: &Account,
        contract_id: &str,
        order_type: i32,
        side: OrderSide,
        quantity: Volume,
        limit_price: Option<Price>,
        stop_price: Option<Price>,
        trail_price: Option<Price>,
        client_order_id: &str,
    ) -> Result<OrderId, JtError> {
        let request = PlaceOrderRequest {
            account_id: account.subaccount_id.clone(),
            contract_id: contract_id.to_string(),
            order_type,
            side: Self::side_code(side),
            size: quantity,
            limit_price,
            stop_price,
            trail_price,
            custom_tag: client_order_id.to_string(),
        };
        let payload: PlaceOrderPayload =
            self.post(account, "/Order/place", &request, true).await?;
        Ok(payload.order_id.to_string())
    }

    /// The gateway keys orders to contract ids, not symbols; resolve before
    /// placing.
    async fn contract_for(
        &self,
        account: &Account,
        symbol: &SymbolName,
    ) -> Result<GatewayContract, JtError> {
        let payload: ContractSearchPayload = self
            .post(
                account,
                "/Contract/search",
                &ContractSearchRequest {
                    search_text: symbol.clone(),
                    live: account.environment == Environment::Live,
                },
                false,
            )
            .await?;
        payload
            .contracts
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| JtError::NotFound(format!("unknown gateway contract {}", symbol)))
    }
}

#[async_trait]
impl BrokerClient for ProjectXClient {
    fn brokerage(&self) -> Brokerage {
        Brokerage::ProjectX
    }

    async fn resolve_contract(
        &self,
        account: &Account,
        symbol: &SymbolName,
    ) -> Result<ContractSpec, JtError> {
        let contract = self.contract_for(account, symbol).await?;
        Ok(ContractSpec {
            contract_id: contract.id,
            symbol: contract.name,
            tick_size: contract.tick_size,
            tick_value: contract.tick_value,
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
        let contract = self.contract_for(account, symbol).await?;
        self.place(
            account,
            &contract.id,
            ORDER_TYPE_MARKET,
            side,
            quantity,
            None,
            None,
            None,
            client_order_id,
        )
        .await
    }

    async fn place_bracket(
        &self,
        account: &Account,
        bracket: &BracketSpec,
    ) -> Result<BracketIds, JtError> {
        let contract = self.contract_for(account, &bracket.symbol).await?;
        let direction = match bracket.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };

        let entry_id = self
            .place(
                account,
                &contract.id,
                ORDER_TYPE_MARKET,
                bracket.side,
                bracket.quantity,
                None,
                None,
                None,
                &bracket.client_order_id,
            )
            .await?;

        // Exits are priced off the broker-reported fill; read it back
        // rather than assuming the mark we saw before placing.
        let entry_price = self
            .list_positions(account)
            .await?
            .into_iter()
            .find(|p| p.symbol == contract.id || p.symbol.eq_ignore_ascii_case(&bracket.symbol))
            .map(|p| p.average_price)
            .ok_or_else(|| JtError::BrokerRejected {
                reason: "entry filled but no position reported".to_string(),
            })?;

        let exit_side = bracket.side.opposite();
        let mut tp_order_ids = Vec::new();
        for leg in &bracket.legs {
            let id = self
                .place(
                    account,
                    &contract.id,
                    ORDER_TYPE_LIMIT,
                    exit_side,
                    leg.quantity,
                    Some(entry_price + leg.distance_points * direction),
                    None,
                    None,
                    &bracket.client_order_id,
                )
                .await?;
            tp_order_ids.push(id);
        }

        let sl_order_id = match &bracket.stop {
            Some(StopSpec::Fixed { distance_points }) => Some(
                self.place(
                    account,
                    &contract.id,
                    ORDER_TYPE_STOP,
                    exit_side,
                    bracket.quantity,
                    None,
                    Some(entry_price - distance_points * direction),
                    None,
                    &bracket.client_order_id,
                )
                .await?,
            ),
            Some(StopSpec::Trailing { distance_points, .. }) => Some(
                self.place(
                    account,
                    &contract.id,
                    ORDER_TYPE_TRAILING_STOP,
                    exit_side,
                    bracket.quantity,
                    None,
                    None,
                    Some(*distance_points),
                    &bracket.client_order_id,
                )
                .await?,
            ),
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
        let contract = self.contract_for(account, symbol).await?;
        self.place(
            account,
            &contract.id,
            ORDER_TYPE_LIMIT,
            side,
            quantity,
            Some(limit_price),
            None,
            None,
            client_order_id,
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
        let contract = self.contract_for(account, symbol).await?;
        self.place(
            account,
            &contract.id,
            ORDER_TYPE_STOP,
            side,
            quantity,
            None,
            Some(trigger_price),
            None,
            client_order_id,
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
        let contract = self.contract_for(account, symbol).await?;
        self.place(
            account,
            &contract.id,
            ORDER_TYPE_STOP,
            side,
            quantity,
            Some(limit_price),
            Some(trigger_price),
            None,
            client_order_id,
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
        let contract = self.contract_for(account, symbol).await?;
        self.place(
            account,
            &contract.id,
            ORDER_TYPE_TRAILING_STOP,
            side,
            quantity,
            None,
            None,
            Some(trail_points),
            client_order_id,
        )
        .await
    }

    async fn cancel_order(&self, account: &Account, order_id: &OrderId) -> Result<(), JtError> {
        let id: i64 = order_id
            .parse()
            .map_err(|_| JtError::BadRequest(format!("bad order id {}", order_id)))?;
        let _: serde_json::Value = self
            .post(
                account,
                "/Order/cancel",
                &serde_json::json!({ "accountId": account.subaccount_id, "orderId": id }),
                true,
            )
            .await?;
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
        let mut body = serde_json::json!({ "accountId": account.subaccount_id, "orderId": id });
        match update {
            OrderUpdate::Quantity(qty) => body["size"] = serde_json::json!(qty),
            OrderUpdate::LimitPrice(price) => body["limitPrice"] = serde_json::json!(price),
            OrderUpdate::StopPrice(price) => body["stopPrice"] = serde_json::json!(price),
        }
        let _: serde_json::Value = self.post(account, "/Order/modify", &body, true).await?;
        Ok(())
    }

    async fn list_positions(&self, account: &Account) -> Result<Vec<BrokerPosition>, JtError> {
        let payload: PositionSearchPayload = self
            .post(
                account,
                "/Position/searchOpen",
                &AccountScopedRequest { account_id: account.subaccount_id.clone() },
                false,
            )
            .await?;
        Ok(payload
            .positions
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.contract_id,
                quantity: if p.position_type == POSITION_TYPE_SHORT { -p.size } else { p.size },
                average_price: p.average_price,
            })
            .collect())
    }

    async fn list_open_orders(&self, account: &Account) -> Result<Vec<BrokerOrder>, JtError> {
        let payload: OrderSearchPayload = self
            .post(
                account,
                "/Order/searchOpen",
                &AccountScopedRequest { account_id: account.subaccount_id.clone() },
                false,
            )
            .await?;
        Ok(payload
            .orders
            .into_iter()
            .map(|o| BrokerOrder {
                order_id: o.id.to_string(),
                client_order_id: o.custom_tag,
                symbol: o.contract_id,
                side: if o.side == SIDE_BUY { OrderSide::Buy } else { OrderSide::Sell },
                quantity: o.size,
                order_type: match o.order_type {
                    ORDER_TYPE_LIMIT => BrokerOrderType::Limit,
                    ORDER_TYPE_STOP => BrokerOrderType::Stop,
                    ORDER_TYPE_TRAILING_STOP => BrokerOrderType::TrailingStop,
                    _ => BrokerOrderType::Market,
                },
                limit_price: o.limit_price,
                stop_price: o.stop_price,
                status: BrokerOrderStatus::Working,
                placed_at: o.creation_timestamp.and_then(|t| t.parse().ok()),
            })
            .collect())
    }

    async fn flatten(&self, account: &Account, symbol: &SymbolName) -> Result<(), JtError> {
        let contract = self.contract_for(account, symbol).await?;

        for order in self.list_open_orders(account).await? {
            if order.symbol == contract.id {
                self.cancel_order(account, &order.order_id).await?;
            }
        }

        let _: serde_json::Value = self
            .post(
                account,
                "/Position/closeContract",
                &serde_json::json!({
                    "accountId": account.subaccount_id,
                    "contractId": contract.id,
                }),
                true,
            )
            .await?;
        Ok(())
    }
}
