use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Gateway wire shapes. Every response carries `success` + `errorCode`;
/// a 200 with `success=false` is a failure and callers check the flag,
/// never the presence of a payload.

pub const ORDER_TYPE_LIMIT: i32 = 1;
pub const ORDER_TYPE_MARKET: i32 = 2;
pub const ORDER_TYPE_STOP: i32 = 4;
pub const ORDER_TYPE_TRAILING_STOP: i32 = 5;

pub const SIDE_BUY: i32 = 0;
pub const SIDE_SELL: i32 = 1;

pub const POSITION_TYPE_LONG: i32 = 1;
pub const POSITION_TYPE_SHORT: i32 = 2;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error_code: i32,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub payload: Option<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSearchRequest {
    pub search_text: String,
    pub live: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractSearchPayload {
    #[serde(default)]
    pub contracts: Vec<GatewayContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayContract {
    pub id: String,
    pub name: String,
    pub tick_size: Decimal,
    pub tick_value: Decimal,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub account_id: String,
    pub contract_id: String,
    #[serde(rename = "type")]
    pub order_type: i32,
    pub side: i32,
    pub size: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trail_price: Option<Decimal>,
    pub custom_tag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderPayload {
    pub order_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountScopedRequest {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSearchPayload {
    #[serde(default)]
    pub positions: Vec<GatewayPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPosition {
    pub contract_id: String,
    #[serde(rename = "type")]
    pub position_type: i32,
    pub size: Decimal,
    pub average_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSearchPayload {
    #[serde(default)]
    pub orders: Vec<GatewayOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOrder {
    pub id: i64,
    pub contract_id: String,
    #[serde(rename = "type")]
    pub order_type: i32,
    pub side: i32,
    pub size: Decimal,
    #[serde(default)]
    pub limit_price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub custom_tag: Option<String>,
    #[serde(default)]
    pub creation_timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_flag_beats_payload_presence() {
        let failed: GatewayEnvelope<PlaceOrderPayload> = serde_json::from_str(
            r#"{"success":false,"errorCode":3,"errorMessage":"Insufficient margin","orderId":0}"#,
        )
        .unwrap();
        assert!(!failed.success);
        // The payload deserialized, but success=false still means failure.
        assert!(failed.payload.is_some());

        let ok: GatewayEnvelope<PlaceOrderPayload> =
            serde_json::from_str(r#"{"success":true,"errorCode":0,"orderId":8812}"#).unwrap();
        assert!(ok.success);
        assert_eq!(ok.payload.unwrap().order_id, 8812);
    }
}
