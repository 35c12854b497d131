use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::helpers::decimal_calculators::{cap_quantity, round_quantity};
use crate::standardized_types::accounts::AccountId;
use crate::standardized_types::enums::{CopyStatus, OrderSide};
use crate::standardized_types::{Price, SymbolName, Volume};

/// Marks an account as a copy-trading source. An account is either a
/// leader or a follower of a given leader, never both; the store enforces
/// the invariant on write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderAccount {
    pub id: i64,
    pub account_id: AccountId,
    pub auto_copy_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FollowerAccount {
    pub id: i64,
    pub leader_account_id: AccountId,
    pub account_id: AccountId,
    pub multiplier: Decimal,
    /// 0 = unlimited.
    pub max_position_size: Volume,
    pub copy_tp: bool,
    pub copy_sl: bool,
    pub enabled: bool,
}

impl FollowerAccount {
    /// Scale a leader quantity onto this follower: round then cap. The
    /// magnitude is scaled; the sign survives untouched.
    pub fn scale_quantity(&self, leader_qty: Volume) -> Volume {
        let scaled = round_quantity(leader_qty.abs() * self.multiplier);
        let capped = cap_quantity(scaled, self.max_position_size);
        if leader_qty.is_sign_negative() {
            -capped
        } else {
            capped
        }
    }
}

/// Audit row per follower copy attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CopyTradeLog {
    pub id: i64,
    pub leader_account_id: AccountId,
    pub follower_account_id: AccountId,
    pub symbol: SymbolName,
    pub side: OrderSide,
    pub leader_quantity: Volume,
    pub follower_quantity: Volume,
    pub leader_price: Option<Price>,
    pub follower_price: Option<Price>,
    pub status: CopyStatus,
    pub latency_ms: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cross-order mapping for copying between related contracts, e.g. a full
/// size future onto its micro with a quantity multiplier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContractMapping {
    pub id: i64,
    pub source_symbol: SymbolName,
    pub target_symbol: SymbolName,
    pub qty_multiplier: Decimal,
}
