use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::standardized_types::enums::{OrderSide, StopKind};
use crate::standardized_types::{Price, SymbolName, Volume};

pub type OrderId = String;
pub type ClientOrderId = String;

/// Prefix carried by propagated copy orders and nothing else. The leader
/// fill listener discards any fill whose parent order carries it.
pub const COPY_ORDER_PREFIX: &str = "JT_COPY_";
/// Prefix carried by strategy (signal driven) orders.
pub const SIGNAL_ORDER_PREFIX: &str = "JT_SIG_";
/// Prefix carried by manually initiated orders, including admin flatten.
pub const MANUAL_ORDER_PREFIX: &str = "JT_MAN_";

/// Where an order came from. Every order the platform places carries a
/// client-order-id with exactly one of the three prefixes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOrigin {
    Signal,
    Copy,
    Manual,
}

impl OrderOrigin {
    pub fn prefix(&self) -> &'static str {
        match self {
            OrderOrigin::Signal => SIGNAL_ORDER_PREFIX,
            OrderOrigin::Copy => COPY_ORDER_PREFIX,
            OrderOrigin::Manual => MANUAL_ORDER_PREFIX,
        }
    }

    pub fn new_client_order_id(&self) -> ClientOrderId {
        format!("{}{}", self.prefix(), Uuid::new_v4().simple())
    }
}

pub fn is_copy_order(client_order_id: &str) -> bool {
    client_order_id.starts_with(COPY_ORDER_PREFIX)
}

pub fn is_platform_order(client_order_id: &str) -> bool {
    client_order_id.starts_with(SIGNAL_ORDER_PREFIX)
        || client_order_id.starts_with(COPY_ORDER_PREFIX)
        || client_order_id.starts_with(MANUAL_ORDER_PREFIX)
}

/// Resolved contract metadata. All outbound prices must be exact multiples
/// of `tick_size`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub contract_id: String,
    pub symbol: SymbolName,
    pub tick_size: Price,
    pub tick_value: Price,
}

/// One take-profit rung of a bracket. Distance is in points, positive in
/// the direction of the trade; the adapter signs it for brokers that want
/// directional values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    pub quantity: Volume,
    pub distance_points: Price,
}

/// Stop half of a bracket. Distance is in points, positive away from entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StopSpec {
    Fixed {
        distance_points: Price,
    },
    Trailing {
        distance_points: Price,
        trigger_points: Price,
        frequency_points: Price,
    },
}

impl StopSpec {
    pub fn kind(&self) -> StopKind {
        match self {
            StopSpec::Fixed { .. } => StopKind::Fixed,
            StopSpec::Trailing { .. } => StopKind::Trailing,
        }
    }

    pub fn distance_points(&self) -> Price {
        match self {
            StopSpec::Fixed { distance_points } => *distance_points,
            StopSpec::Trailing { distance_points, .. } => *distance_points,
        }
    }
}

/// An atomic entry + exits order: market entry, ordered TP rungs, stop.
/// Invariant: the leg quantities sum to `quantity`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BracketSpec {
    pub symbol: SymbolName,
    pub side: OrderSide,
    pub quantity: Volume,
    pub legs: Vec<TakeProfitLeg>,
    pub stop: Option<StopSpec>,
    pub client_order_id: ClientOrderId,
}

impl BracketSpec {
    pub fn legs_cover_entry(&self) -> bool {
        let total: Volume = self.legs.iter().map(|l| l.quantity).sum();
        total == self.quantity
    }
}

/// Identifiers a bracket placement returns: the broker's strategy id plus
/// the individual leg order ids where the broker exposes them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BracketIds {
    pub strategy_id: String,
    pub entry_order_id: Option<OrderId>,
    pub tp_order_ids: Vec<OrderId>,
    pub sl_order_id: Option<OrderId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerOrderStatus {
    Working,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

/// A working or historical order as the broker reports it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerOrder {
    pub order_id: OrderId,
    pub client_order_id: Option<ClientOrderId>,
    pub symbol: SymbolName,
    pub side: OrderSide,
    pub quantity: Volume,
    pub order_type: BrokerOrderType,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    pub status: BrokerOrderStatus,
    pub placed_at: Option<DateTime<Utc>>,
}

impl BrokerOrder {
    /// Exit orders are the cancel-and-replace surface: resting limits
    /// (take profits) and stops.
    pub fn is_exit_order(&self) -> bool {
        matches!(
            self.order_type,
            BrokerOrderType::Limit
                | BrokerOrderType::Stop
                | BrokerOrderType::StopLimit
                | BrokerOrderType::TrailingStop
        ) && self.status == BrokerOrderStatus::Working
    }

    pub fn is_take_profit(&self) -> bool {
        self.order_type == BrokerOrderType::Limit && self.status == BrokerOrderStatus::Working
    }
}

/// Net position as the broker reports it. Quantity is signed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: SymbolName,
    pub quantity: Volume,
    pub average_price: Price,
}

/// The only mutation shapes `ModifyOrder` accepts. Brokers may acknowledge
/// a modify without applying it, so callers treat the call as advisory and
/// verify by re-reading open orders.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OrderUpdate {
    Quantity(Volume),
    LimitPrice(Price),
    StopPrice(Price),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn client_order_ids_carry_exactly_one_prefix() {
        let copy = OrderOrigin::Copy.new_client_order_id();
        let signal = OrderOrigin::Signal.new_client_order_id();
        let manual = OrderOrigin::Manual.new_client_order_id();

        assert!(is_copy_order(&copy));
        assert!(!is_copy_order(&signal));
        assert!(!is_copy_order(&manual));
        assert!(is_platform_order(&copy));
        assert!(is_platform_order(&signal));
        assert!(is_platform_order(&manual));
        assert!(!is_platform_order("manual-ui-784"));
    }

    #[test]
    fn bracket_legs_must_cover_entry() {
        let bracket = BracketSpec {
            symbol: "MNQH6".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(3),
            legs: vec![
                TakeProfitLeg { quantity: dec!(2), distance_points: dec!(5.0) },
                TakeProfitLeg { quantity: dec!(1), distance_points: dec!(10.0) },
            ],
            stop: Some(StopSpec::Fixed { distance_points: dec!(12.5) }),
            client_order_id: OrderOrigin::Signal.new_client_order_id(),
        };
        assert!(bracket.legs_cover_entry());

        let short_legged = BracketSpec {
            legs: vec![TakeProfitLeg { quantity: dec!(2), distance_points: dec!(5.0) }],
            ..bracket
        };
        assert!(!short_legged.legs_cover_entry());
    }
}
