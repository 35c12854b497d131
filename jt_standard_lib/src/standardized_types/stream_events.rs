use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::standardized_types::enums::OrderSide;
use crate::standardized_types::orders::{BrokerOrderStatus, ClientOrderId, OrderId};
use crate::standardized_types::{Price, SymbolName, Volume};

/// Typed events the streaming hub fans out. Messages are parsed once, in
/// the hub, per broker; listeners only ever see these variants.
///
/// `account` is the broker side subaccount identifier the event belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Fill {
        account: String,
        symbol: SymbolName,
        side: OrderSide,
        quantity: Volume,
        price: Price,
        order_id: OrderId,
        /// Parent order's client-order-id when the broker echoes it. The
        /// copy engine's loop prevention keys off its prefix.
        client_order_id: Option<ClientOrderId>,
        fill_id: String,
        time: DateTime<Utc>,
    },
    OrderUpdate {
        account: String,
        symbol: SymbolName,
        order_id: OrderId,
        client_order_id: Option<ClientOrderId>,
        status: BrokerOrderStatus,
        time: DateTime<Utc>,
    },
    PositionUpdate {
        account: String,
        symbol: SymbolName,
        /// Signed net quantity.
        quantity: Volume,
        average_price: Price,
        time: DateTime<Utc>,
    },
    Balance {
        account: String,
        cash_value: Decimal,
        realized_pnl_day: Decimal,
        time: DateTime<Utc>,
    },
    /// Anything the broker sends that we do not model. Preserved verbatim
    /// for audit; never matched on beyond logging.
    Unknown { raw: serde_json::Value },
}

impl StreamEvent {
    pub fn account(&self) -> Option<&str> {
        match self {
            StreamEvent::Fill { account, .. } => Some(account),
            StreamEvent::OrderUpdate { account, .. } => Some(account),
            StreamEvent::PositionUpdate { account, .. } => Some(account),
            StreamEvent::Balance { account, .. } => Some(account),
            StreamEvent::Unknown { .. } => None,
        }
    }

    /// Data events prove the subscription is alive; heartbeats and opaque
    /// frames do not.
    pub fn is_data(&self) -> bool {
        !matches!(self, StreamEvent::Unknown { .. })
    }
}
