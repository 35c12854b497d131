use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::helpers::decimal_calculators::round_quantity;
use crate::standardized_types::accounts::{AccountId, UserId};
use crate::standardized_types::enums::{DirectionFilter, DistanceUnit, StopKind, TrimUnit};
use crate::standardized_types::{SymbolName, Volume};

pub type StrategyId = i64;
pub type TraderId = i64;

/// For numeric settings where zero is a legal "unlimited / disabled" value,
/// callers must use this predicate rather than truthiness.
pub fn cap_is_set(value: Decimal) -> bool {
    value > Decimal::ZERO
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLegPlan {
    pub distance: Decimal,
    pub trim: Decimal,
}

/// Ordered take-profit rungs. Distances are interpreted per `distance_unit`,
/// trims per `trim_unit`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TakeProfitPlan {
    pub distance_unit: DistanceUnit,
    pub trim_unit: TrimUnit,
    pub legs: Vec<TakeProfitLegPlan>,
}

impl Default for TakeProfitPlan {
    fn default() -> Self {
        Self {
            distance_unit: DistanceUnit::Ticks,
            trim_unit: TrimUnit::Percent,
            legs: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopLossPlan {
    pub enabled: bool,
    pub distance: Decimal,
    pub unit: DistanceUnit,
    pub kind: StopKind,
    pub trail_trigger: Decimal,
    pub trail_frequency: Decimal,
}

impl Default for StopLossPlan {
    fn default() -> Self {
        Self {
            enabled: false,
            distance: Decimal::ZERO,
            unit: DistanceUnit::Ticks,
            kind: StopKind::Fixed,
            trail_trigger: Decimal::ZERO,
            trail_frequency: Decimal::ZERO,
        }
    }
}

/// Add-down (DCA) plan: adding to a losing position at a trigger distance,
/// rate limited by `min_delay_secs` between entries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddDownPlan {
    pub enabled: bool,
    pub size: Volume,
    pub trigger_distance: Decimal,
    pub unit: DistanceUnit,
    pub min_delay_secs: i64,
}

impl Default for AddDownPlan {
    fn default() -> Self {
        Self {
            enabled: false,
            size: Decimal::ZERO,
            trigger_distance: Decimal::ZERO,
            unit: DistanceUnit::Ticks,
            min_delay_secs: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakEvenPlan {
    pub enabled: bool,
    pub trigger_distance: Decimal,
    pub unit: DistanceUnit,
    /// Offset in ticks added past entry when the stop is moved.
    pub offset_ticks: Decimal,
}

impl Default for BreakEvenPlan {
    fn default() -> Self {
        Self {
            enabled: false,
            trigger_distance: Decimal::ZERO,
            unit: DistanceUnit::Ticks,
            offset_ticks: Decimal::ZERO,
        }
    }
}

/// A trading window in the strategy's exchange time zone. Windows that end
/// before they start span midnight.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn contains(&self, local: NaiveTime) -> bool {
        if !self.enabled {
            return false;
        }
        if self.start <= self.end {
            local >= self.start && local < self.end
        } else {
            local >= self.start || local < self.end
        }
    }
}

/// The durable trading spec (a.k.a. recorder), identified externally by its
/// webhook token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub id: StrategyId,
    pub user_id: UserId,
    pub name: String,
    pub symbol: SymbolName,
    pub enabled: bool,
    pub initial_size: Volume,
    pub add_size: Volume,
    pub take_profit: TakeProfitPlan,
    pub stop_loss: StopLossPlan,
    pub add_down: AddDownPlan,
    pub break_even: BreakEvenPlan,
    pub windows: Vec<TimeWindow>,
    pub auto_flat_after_cutoff: bool,
    pub direction: DirectionFilter,
    pub inverse: bool,
    /// Take every Nth entry signal; values below 2 mean every signal.
    pub signal_delay: i64,
    pub signal_cooldown_secs: i64,
    /// 0 = unlimited.
    pub max_signals_per_session: i64,
    /// 0 = unlimited, in account currency.
    pub max_daily_loss: Decimal,
    /// 0 = unlimited, in contracts before the trader multiplier.
    pub max_contracts: Volume,
    /// Exchange time zone the windows and session cutoffs are evaluated in.
    pub time_zone: String,
    pub webhook_token: String,
}

impl Strategy {
    pub fn new_webhook_token() -> String {
        // URL safe, unguessable, no padding characters.
        format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
    }

    pub fn tz(&self) -> Tz {
        self.time_zone.parse().unwrap_or(chrono_tz::America::Chicago)
    }

    /// True when `now` falls inside at least one enabled window. A strategy
    /// with no enabled windows trades around the clock.
    pub fn in_trading_window(&self, now: DateTime<Utc>) -> bool {
        let enabled: Vec<&TimeWindow> = self.windows.iter().filter(|w| w.enabled).collect();
        if enabled.is_empty() {
            return true;
        }
        let local = now.with_timezone(&self.tz()).time();
        enabled.iter().any(|w| w.contains(local))
    }

    /// Past the last enabled window's cutoff for today. Only meaningful when
    /// `auto_flat_after_cutoff` is on.
    pub fn past_cutoff(&self, now: DateTime<Utc>) -> bool {
        if !self.auto_flat_after_cutoff {
            return false;
        }
        let enabled: Vec<&TimeWindow> = self.windows.iter().filter(|w| w.enabled).collect();
        if enabled.is_empty() {
            return false;
        }
        let local = now.with_timezone(&self.tz()).time();
        !enabled.iter().any(|w| w.contains(local))
    }
}

/// Per-linkage overrides. A `None` means "inherit from the strategy".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraderOverrides {
    pub initial_size: Option<Volume>,
    pub add_size: Option<Volume>,
    pub take_profit: Option<TakeProfitPlan>,
    pub stop_loss: Option<StopLossPlan>,
    pub add_down: Option<AddDownPlan>,
    pub break_even: Option<BreakEvenPlan>,
    pub windows: Option<Vec<TimeWindow>>,
    pub auto_flat_after_cutoff: Option<bool>,
    pub direction: Option<DirectionFilter>,
    pub inverse: Option<bool>,
    pub signal_delay: Option<i64>,
    pub signal_cooldown_secs: Option<i64>,
    pub max_signals_per_session: Option<i64>,
    pub max_daily_loss: Option<Decimal>,
    pub max_contracts: Option<Volume>,
}

/// A (user, strategy, account) linkage. The multiplier scales every quantity
/// produced for this trader and is applied exactly once, in `effective`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trader {
    pub id: TraderId,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub account_id: AccountId,
    pub enabled: bool,
    pub multiplier: Decimal,
    pub overrides: TraderOverrides,
}

impl Trader {
    /// Resolve the override chain `trader.override -> strategy.default` and
    /// apply the quantity multiplier at this single leaf. Downstream code
    /// must never multiply again.
    pub fn effective(&self, strategy: &Strategy) -> EffectiveConfig {
        let o = &self.overrides;
        let m = if self.multiplier > Decimal::ZERO {
            self.multiplier
        } else {
            Decimal::ONE
        };

        let mut take_profit = o.take_profit.clone().unwrap_or_else(|| strategy.take_profit.clone());
        if take_profit.trim_unit == TrimUnit::Contracts {
            for leg in take_profit.legs.iter_mut() {
                leg.trim = round_quantity(leg.trim * m);
            }
        }

        let mut add_down = o.add_down.clone().unwrap_or_else(|| strategy.add_down.clone());
        add_down.size = round_quantity(add_down.size * m);

        let max_contracts = o.max_contracts.unwrap_or(strategy.max_contracts);
        let max_contracts = if cap_is_set(max_contracts) {
            round_quantity(max_contracts * m)
        } else {
            max_contracts
        };

        EffectiveConfig {
            symbol: strategy.symbol.clone(),
            initial_size: round_quantity(o.initial_size.unwrap_or(strategy.initial_size) * m),
            add_size: round_quantity(o.add_size.unwrap_or(strategy.add_size) * m),
            take_profit,
            stop_loss: o.stop_loss.clone().unwrap_or_else(|| strategy.stop_loss.clone()),
            add_down,
            break_even: o.break_even.clone().unwrap_or_else(|| strategy.break_even.clone()),
            windows: o.windows.clone().unwrap_or_else(|| strategy.windows.clone()),
            auto_flat_after_cutoff: o
                .auto_flat_after_cutoff
                .unwrap_or(strategy.auto_flat_after_cutoff),
            direction: o.direction.unwrap_or(strategy.direction),
            inverse: o.inverse.unwrap_or(strategy.inverse),
            signal_delay: o.signal_delay.unwrap_or(strategy.signal_delay),
            signal_cooldown_secs: o.signal_cooldown_secs.unwrap_or(strategy.signal_cooldown_secs),
            max_signals_per_session: o
                .max_signals_per_session
                .unwrap_or(strategy.max_signals_per_session),
            max_daily_loss: o.max_daily_loss.unwrap_or(strategy.max_daily_loss),
            max_contracts,
            time_zone: strategy.time_zone.clone(),
        }
    }
}

/// Fully resolved configuration for one trader. All sizes are already
/// multiplied; caps of zero mean unlimited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub symbol: SymbolName,
    pub initial_size: Volume,
    pub add_size: Volume,
    pub take_profit: TakeProfitPlan,
    pub stop_loss: StopLossPlan,
    pub add_down: AddDownPlan,
    pub break_even: BreakEvenPlan,
    pub windows: Vec<TimeWindow>,
    pub auto_flat_after_cutoff: bool,
    pub direction: DirectionFilter,
    pub inverse: bool,
    pub signal_delay: i64,
    pub signal_cooldown_secs: i64,
    pub max_signals_per_session: i64,
    pub max_daily_loss: Decimal,
    pub max_contracts: Volume,
    pub time_zone: String,
}

impl EffectiveConfig {
    /// Apply the per-trade contract cap. Zero means unlimited; the check is
    /// an explicit "is set" predicate, never truthiness.
    pub fn capped(&self, quantity: Volume) -> Volume {
        if cap_is_set(self.max_contracts) {
            quantity.min(self.max_contracts)
        } else {
            quantity
        }
    }

    pub fn cooldown_is_set(&self) -> bool {
        self.signal_cooldown_secs > 0
    }

    pub fn max_signals_is_set(&self) -> bool {
        self.max_signals_per_session > 0
    }

    pub fn max_daily_loss_is_set(&self) -> bool {
        cap_is_set(self.max_daily_loss)
    }

    pub fn signal_delay_is_set(&self) -> bool {
        self.signal_delay > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    pub(crate) fn base_strategy() -> Strategy {
        Strategy {
            id: 1,
            user_id: 1,
            name: "mnq scalp".to_string(),
            symbol: "MNQH6".to_string(),
            enabled: true,
            initial_size: dec!(1),
            add_size: dec!(1),
            take_profit: TakeProfitPlan {
                distance_unit: DistanceUnit::Ticks,
                trim_unit: TrimUnit::Percent,
                legs: vec![TakeProfitLegPlan { distance: dec!(20), trim: dec!(100) }],
            },
            stop_loss: StopLossPlan {
                enabled: true,
                distance: dec!(50),
                unit: DistanceUnit::Ticks,
                kind: StopKind::Fixed,
                trail_trigger: Decimal::ZERO,
                trail_frequency: Decimal::ZERO,
            },
            add_down: AddDownPlan::default(),
            break_even: BreakEvenPlan::default(),
            windows: Vec::new(),
            auto_flat_after_cutoff: false,
            direction: DirectionFilter::Both,
            inverse: false,
            signal_delay: 0,
            signal_cooldown_secs: 0,
            max_signals_per_session: 0,
            max_daily_loss: Decimal::ZERO,
            max_contracts: Decimal::ZERO,
            time_zone: "America/Chicago".to_string(),
            webhook_token: Strategy::new_webhook_token(),
        }
    }

    fn trader(multiplier: Decimal, overrides: TraderOverrides) -> Trader {
        Trader {
            id: 7,
            user_id: 1,
            strategy_id: 1,
            account_id: 3,
            enabled: true,
            multiplier,
            overrides,
        }
    }

    #[test]
    fn null_override_inherits_from_strategy() {
        let strategy = base_strategy();
        let cfg = trader(dec!(1), TraderOverrides::default()).effective(&strategy);
        assert_eq!(cfg.initial_size, dec!(1));
        assert_eq!(cfg.signal_cooldown_secs, 0);
        assert_eq!(cfg.take_profit, strategy.take_profit);
    }

    #[test]
    fn override_wins_over_strategy_default() {
        let strategy = base_strategy();
        let overrides = TraderOverrides {
            initial_size: Some(dec!(3)),
            signal_cooldown_secs: Some(45),
            ..TraderOverrides::default()
        };
        let cfg = trader(dec!(1), overrides).effective(&strategy);
        assert_eq!(cfg.initial_size, dec!(3));
        assert_eq!(cfg.signal_cooldown_secs, 45);
    }

    #[test]
    fn multiplier_scales_every_quantity_once() {
        let mut strategy = base_strategy();
        strategy.add_down = AddDownPlan {
            enabled: true,
            size: dec!(2),
            trigger_distance: dec!(40),
            unit: DistanceUnit::Ticks,
            min_delay_secs: 60,
        };
        strategy.max_contracts = dec!(4);
        let cfg = trader(dec!(2.5), TraderOverrides::default()).effective(&strategy);
        assert_eq!(cfg.initial_size, dec!(3)); // round(1 * 2.5)
        assert_eq!(cfg.add_down.size, dec!(5));
        assert_eq!(cfg.max_contracts, dec!(10));
    }

    #[test]
    fn zero_cap_means_unlimited_not_zero() {
        let strategy = base_strategy();
        let cfg = trader(dec!(2), TraderOverrides::default()).effective(&strategy);
        assert!(!cap_is_set(cfg.max_contracts));
        assert_eq!(cfg.capped(dec!(250)), dec!(250));
    }

    #[test]
    fn contract_trims_scale_with_multiplier_percent_trims_do_not() {
        let mut strategy = base_strategy();
        strategy.take_profit = TakeProfitPlan {
            distance_unit: DistanceUnit::Ticks,
            trim_unit: TrimUnit::Contracts,
            legs: vec![TakeProfitLegPlan { distance: dec!(20), trim: dec!(1) }],
        };
        let cfg = trader(dec!(3), TraderOverrides::default()).effective(&strategy);
        assert_eq!(cfg.take_profit.legs[0].trim, dec!(3));

        strategy.take_profit.trim_unit = TrimUnit::Percent;
        strategy.take_profit.legs[0].trim = dec!(50);
        let cfg = trader(dec!(3), TraderOverrides::default()).effective(&strategy);
        assert_eq!(cfg.take_profit.legs[0].trim, dec!(50));
    }

    #[test]
    fn overnight_window_spans_midnight() {
        let w = TimeWindow {
            enabled: true,
            start: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        };
        assert!(w.contains(NaiveTime::from_hms_opt(23, 30, 0).unwrap()));
        assert!(w.contains(NaiveTime::from_hms_opt(1, 0, 0).unwrap()));
        assert!(!w.contains(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
    }
}
