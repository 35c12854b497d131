use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Wire shapes for the Tradovate REST surface. Responses can carry a 2xx
/// status and still fail through `errorText` / `failureText`; every caller
/// goes through `OrderResponse::into_result` style checks instead of
/// trusting the status line.

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub account_spec: String,
    pub account_id: Option<i64>,
    pub action: String,
    pub symbol: String,
    pub order_qty: Decimal,
    pub order_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_distance: Option<Decimal>,
    pub is_automated: bool,
    pub cl_ord_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderResponse {
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsoBracket {
    pub qty: Decimal,
    /// Signed offset from entry, in points, positive in the trade direction.
    pub profit_target: Decimal,
    /// Signed offset from entry, in points, negative of the trade direction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOsoRequest {
    pub account_spec: String,
    pub account_id: Option<i64>,
    pub action: String,
    pub symbol: String,
    pub order_qty: Decimal,
    pub order_type: String,
    pub is_automated: bool,
    pub cl_ord_id: String,
    pub brackets: Vec<OsoBracket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOsoResponse {
    #[serde(default)]
    pub order_id: Option<i64>,
    #[serde(default)]
    pub oso_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub failure_text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractItem {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductItem {
    pub name: String,
    pub tick_size: Option<Decimal>,
    pub value_per_point: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionItem {
    pub account_id: i64,
    pub contract_id: i64,
    #[serde(default)]
    pub net_pos: Decimal,
    #[serde(default)]
    pub net_price: Option<Decimal>,
    #[serde(default)]
    pub archived: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: i64,
    pub account_id: i64,
    #[serde(default)]
    pub contract_id: Option<i64>,
    pub action: String,
    #[serde(default)]
    pub ord_status: String,
    #[serde(default)]
    pub order_qty: Option<Decimal>,
    #[serde(default)]
    pub order_type: Option<String>,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub cl_ord_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Token grant / renewal. Success is the presence of `access_token`
/// together with an empty `error_text`; the object existing proves nothing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expiration_time: Option<String>,
    #[serde(default)]
    pub error_text: Option<String>,
    #[serde(default)]
    pub p_ticket: Option<String>,
    #[serde(default)]
    pub p_time: Option<i64>,
}

impl AccessTokenResponse {
    pub fn succeeded(&self) -> bool {
        self.error_text.is_none() && self.access_token.as_deref().map_or(false, |t| !t.is_empty())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRequest {
    pub name: String,
    pub password: String,
    pub app_id: String,
    pub app_version: String,
    pub device_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_success_requires_the_structured_flag_not_presence() {
        let ok: AccessTokenResponse =
            serde_json::from_str(r#"{"accessToken":"tok","expirationTime":"2026-03-02T15:00:00Z"}"#)
                .unwrap();
        assert!(ok.succeeded());

        // A perfectly well formed response object that is still a failure.
        let failed: AccessTokenResponse =
            serde_json::from_str(r#"{"errorText":"Incorrect username or password"}"#).unwrap();
        assert!(!failed.succeeded());

        let empty_token: AccessTokenResponse =
            serde_json::from_str(r#"{"accessToken":""}"#).unwrap();
        assert!(!empty_token.succeeded());
    }

    #[test]
    fn order_response_surfaces_2xx_failures() {
        let r: PlaceOrderResponse = serde_json::from_str(
            r#"{"failureReason":"UnknownReason","failureText":"Order rejected by exchange"}"#,
        )
        .unwrap();
        assert!(r.order_id.is_none());
        assert!(r.failure_text.is_some());
    }
}
