use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::helpers::decimal_calculators::weighted_average_price;
use crate::standardized_types::accounts::AccountId;
use crate::standardized_types::enums::{ExitReason, PositionSide, TradeStatus};
use crate::standardized_types::orders::{ClientOrderId, OrderId};
use crate::standardized_types::signals::SignalId;
use crate::standardized_types::strategies::{StrategyId, TraderId};
use crate::standardized_types::{Price, SymbolName, Volume};

pub type TradeId = i64;

/// A single entry record for one trader on one account. When a strategy
/// drives multiple accounts every account carries its own row; the
/// `tp_order_id` always refers to an order on this row's account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub strategy_id: StrategyId,
    pub trader_id: TraderId,
    pub account_id: AccountId,
    pub signal_id: Option<SignalId>,
    pub symbol: SymbolName,
    pub side: PositionSide,
    pub quantity: Volume,
    pub entry_price: Price,
    pub entry_time: DateTime<Utc>,
    pub exit_price: Option<Price>,
    pub exit_time: Option<DateTime<Utc>>,
    pub status: TradeStatus,
    pub exit_reason: Option<ExitReason>,
    pub realized_pnl: Option<Decimal>,
    pub client_order_id: ClientOrderId,
    pub tp_order_id: Option<OrderId>,
    pub sl_order_id: Option<OrderId>,
    pub break_even_applied: bool,
}

impl Trade {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

/// Derived aggregate per strategy+symbol: total quantity, weighted average
/// entry, running unrealized extremes. Created on first entry, updated on
/// each fill, closed when the broker shows net zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionAggregate {
    pub strategy_id: StrategyId,
    pub symbol: SymbolName,
    pub side: PositionSide,
    pub quantity: Volume,
    pub average_price: Price,
    pub entries: Vec<PositionEntry>,
    pub open_pnl: Decimal,
    pub worst_pnl: Decimal,
    pub best_pnl: Decimal,
    pub open: bool,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub price: Price,
    pub quantity: Volume,
    pub time: DateTime<Utc>,
}

impl PositionAggregate {
    pub fn open_with(
        strategy_id: StrategyId,
        symbol: SymbolName,
        side: PositionSide,
        price: Price,
        quantity: Volume,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            strategy_id,
            symbol,
            side,
            quantity,
            average_price: price,
            entries: vec![PositionEntry { price, quantity, time }],
            open_pnl: Decimal::ZERO,
            worst_pnl: Decimal::ZERO,
            best_pnl: Decimal::ZERO,
            open: true,
            opened_at: time,
            updated_at: time,
        }
    }

    /// Fold an add into the aggregate and recompute the weighted average.
    pub fn apply_add(&mut self, price: Price, quantity: Volume, time: DateTime<Utc>) {
        self.entries.push(PositionEntry { price, quantity, time });
        let pairs: Vec<(Price, Volume)> =
            self.entries.iter().map(|e| (e.price, e.quantity)).collect();
        self.average_price = weighted_average_price(&pairs);
        self.quantity += quantity;
        self.updated_at = time;
    }

    pub fn apply_trim(&mut self, quantity: Volume, time: DateTime<Utc>) {
        self.quantity = (self.quantity - quantity).max(Decimal::ZERO);
        self.updated_at = time;
        if self.quantity == Decimal::ZERO {
            self.open = false;
        }
    }

    /// Track unrealized P&L extremes against a mark price, in points
    /// (the caller converts to currency with the tick value).
    pub fn mark(&mut self, mark_price: Price, time: DateTime<Utc>) {
        let direction = self.side.sign();
        self.open_pnl = (mark_price - self.average_price) * direction * self.quantity;
        if self.open_pnl > self.best_pnl {
            self.best_pnl = self.open_pnl;
        }
        if self.open_pnl < self.worst_pnl {
            self.worst_pnl = self.open_pnl;
        }
        self.updated_at = time;
    }
}
