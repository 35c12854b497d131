use rust_decimal::Decimal;
use serde::Deserialize;

/// Equity/options wire shapes. The broker wraps single results and lists
/// in the same envelope keys, and reports order-level failures inside a
/// 200 via `errors`.

#[derive(Debug, Deserialize)]
pub struct OrderEnvelope {
    #[serde(default)]
    pub order: Option<PlacedOrder>,
    #[serde(default)]
    pub errors: Option<ErrorsBody>,
}

#[derive(Debug, Deserialize)]
pub struct PlacedOrder {
    pub id: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ErrorsBody {
    #[serde(default)]
    pub error: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PositionsEnvelope {
    #[serde(default)]
    pub positions: Option<PositionsBody>,
}

#[derive(Debug, Deserialize)]
pub struct PositionsBody {
    #[serde(default)]
    pub position: Vec<PositionItem>,
}

#[derive(Debug, Deserialize)]
pub struct PositionItem {
    pub symbol: String,
    /// Signed share/contract count; negative is short.
    pub quantity: Decimal,
    pub cost_basis: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct OrdersEnvelope {
    #[serde(default)]
    pub orders: Option<OrdersBody>,
}

#[derive(Debug, Deserialize)]
pub struct OrdersBody {
    #[serde(default)]
    pub order: Vec<OrderItem>,
}

#[derive(Debug, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: String,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub stop_price: Option<Decimal>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub create_date: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_errors_inside_200_are_detected() {
        let body = r#"{"errors":{"error":["Backoffice rejected override of the order."]}}"#;
        let envelope: OrderEnvelope = serde_json::from_str(body).unwrap();
        assert!(envelope.order.is_none());
        assert_eq!(envelope.errors.unwrap().error.len(), 1);
    }

    #[test]
    fn empty_positions_deserialize_as_none() {
        let envelope: PositionsEnvelope = serde_json::from_str(r#"{"positions":null}"#).unwrap();
        assert!(envelope.positions.is_none());
    }
}
