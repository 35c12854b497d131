use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Net direction of a position. `Flat` is a real state, not an absence.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

impl PositionSide {
    pub fn of_quantity(signed_qty: Decimal) -> PositionSide {
        if signed_qty > Decimal::ZERO {
            PositionSide::Long
        } else if signed_qty < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }

    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => -Decimal::ONE,
            PositionSide::Flat => Decimal::ZERO,
        }
    }

    /// The order side that opens or grows a position on this side.
    pub fn entry_order_side(&self) -> Option<OrderSide> {
        match self {
            PositionSide::Long => Some(OrderSide::Buy),
            PositionSide::Short => Some(OrderSide::Sell),
            PositionSide::Flat => None,
        }
    }
}

/// Every action word the webhook surface accepts, with all aliases.
/// Parsing is case insensitive.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SignalAction {
    Buy,
    Sell,
    CloseLong,
    CloseShort,
    Close,
    Flat,
    Flip,
}

impl SignalAction {
    /// Close family actions always reduce the target to zero and are never
    /// routed as reversals, even when a direction label rides along.
    pub fn is_close(&self) -> bool {
        matches!(
            self,
            SignalAction::Close | SignalAction::CloseLong | SignalAction::CloseShort | SignalAction::Flat
        )
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, SignalAction::Buy | SignalAction::Sell)
    }

    /// Inverse strategies swap buy and sell before target computation.
    /// Close family actions are unaffected.
    pub fn inverted(&self) -> SignalAction {
        match self {
            SignalAction::Buy => SignalAction::Sell,
            SignalAction::Sell => SignalAction::Buy,
            other => *other,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Environment {
    Live,
    Demo,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DistanceUnit {
    Ticks,
    Points,
    Percent,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TrimUnit {
    Contracts,
    Percent,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StopKind {
    Fixed,
    Trailing,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    CloseSignal,
    Flip,
    /// A repeat entry with add-down disabled closes the previous record and
    /// opens a fresh independent one.
    NewEntry,
    /// The reconciler observed the broker flat while the record was open.
    BrokerFlat,
    AutoFlat,
    ManualCleanup,
    Manual,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DirectionFilter {
    Both,
    LongOnly,
    ShortOnly,
}

impl DirectionFilter {
    pub fn allows(&self, action: SignalAction) -> bool {
        match self {
            DirectionFilter::Both => true,
            DirectionFilter::LongOnly => action != SignalAction::Sell,
            DirectionFilter::ShortOnly => action != SignalAction::Buy,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum CopyStatus {
    Pending,
    Filled,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn signal_action_aliases_parse_case_insensitive() {
        assert_eq!(SignalAction::from_str("BUY").unwrap(), SignalAction::Buy);
        assert_eq!(SignalAction::from_str("closelong").unwrap(), SignalAction::CloseLong);
        assert_eq!(SignalAction::from_str("CloseShort").unwrap(), SignalAction::CloseShort);
        assert_eq!(SignalAction::from_str("FLAT").unwrap(), SignalAction::Flat);
        assert!(SignalAction::from_str("hold").is_err());
    }

    #[test]
    fn close_family_never_inverts() {
        assert_eq!(SignalAction::Buy.inverted(), SignalAction::Sell);
        assert_eq!(SignalAction::Close.inverted(), SignalAction::Close);
        assert_eq!(SignalAction::CloseLong.inverted(), SignalAction::CloseLong);
    }

    #[test]
    fn position_side_from_signed_quantity() {
        assert_eq!(PositionSide::of_quantity(dec!(3)), PositionSide::Long);
        assert_eq!(PositionSide::of_quantity(dec!(-2)), PositionSide::Short);
        assert_eq!(PositionSide::of_quantity(dec!(0)), PositionSide::Flat);
    }

    #[test]
    fn direction_filter_blocks_entries_only() {
        assert!(DirectionFilter::LongOnly.allows(SignalAction::Buy));
        assert!(!DirectionFilter::LongOnly.allows(SignalAction::Sell));
        assert!(DirectionFilter::LongOnly.allows(SignalAction::Close));
        assert!(DirectionFilter::ShortOnly.allows(SignalAction::Flat));
    }
}
