use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use jt_standard_lib::errors::JtError;
use jt_standard_lib::helpers::decimal_calculators::{round_quantity, round_to_tick_size};
use jt_standard_lib::standardized_types::enums::{DistanceUnit, OrderSide, StopKind, TrimUnit};
use jt_standard_lib::standardized_types::orders::{
    BracketSpec, ClientOrderId, ContractSpec, StopSpec, TakeProfitLeg,
};
use jt_standard_lib::standardized_types::strategies::EffectiveConfig;
use jt_standard_lib::standardized_types::{Price, Volume};

/// Convert a configured distance into points on the contract's tick grid.
/// Percent distances need a reference price (signal price, or the
/// broker-reported average on recompute paths).
pub fn distance_to_points(
    distance: Decimal,
    unit: DistanceUnit,
    contract: &ContractSpec,
    reference_price: Option<Price>,
) -> Result<Price, JtError> {
    let raw = match unit {
        DistanceUnit::Ticks => distance * contract.tick_size,
        DistanceUnit::Points => distance,
        DistanceUnit::Percent => {
            let reference = reference_price.ok_or_else(|| {
                JtError::BadRequest("percent distance without a reference price".to_string())
            })?;
            reference * distance / dec!(100)
        }
    };
    Ok(round_to_tick_size(raw, contract.tick_size))
}

/// Split the entry quantity across the configured take-profit rungs. The
/// result is index-aligned with the configured legs (rungs that round to
/// nothing come back as zero and are skipped at placement). Contract trims
/// are taken literally, clamped to what remains; percent trims round per
/// rung; the final rung absorbs whatever is left so the rungs always cover
/// the entry exactly.
pub fn allocate_tp_quantities(cfg: &EffectiveConfig, entry_quantity: Volume) -> Vec<Volume> {
    let legs = &cfg.take_profit.legs;
    if legs.is_empty() || entry_quantity <= Decimal::ZERO {
        return Vec::new();
    }

    let mut remaining = entry_quantity;
    let mut quantities = Vec::with_capacity(legs.len());
    for (i, leg) in legs.iter().enumerate() {
        let is_last = i == legs.len() - 1;
        let wanted = match cfg.take_profit.trim_unit {
            TrimUnit::Contracts => leg.trim,
            TrimUnit::Percent => round_quantity(entry_quantity * leg.trim / dec!(100)),
        };
        let quantity = if is_last { remaining } else { wanted.min(remaining).max(Decimal::ZERO) };
        quantities.push(quantity);
        remaining -= quantity;
    }
    quantities
}

fn stop_spec(
    cfg: &EffectiveConfig,
    contract: &ContractSpec,
    reference_price: Option<Price>,
) -> Result<Option<StopSpec>, JtError> {
    if !cfg.stop_loss.enabled {
        return Ok(None);
    }
    let distance_points = distance_to_points(
        cfg.stop_loss.distance,
        cfg.stop_loss.unit,
        contract,
        reference_price,
    )?;
    Ok(Some(match cfg.stop_loss.kind {
        StopKind::Fixed => StopSpec::Fixed { distance_points },
        StopKind::Trailing => StopSpec::Trailing {
            distance_points,
            trigger_points: distance_to_points(
                cfg.stop_loss.trail_trigger,
                cfg.stop_loss.unit,
                contract,
                reference_price,
            )?,
            frequency_points: distance_to_points(
                cfg.stop_loss.trail_frequency,
                cfg.stop_loss.unit,
                contract,
                reference_price,
            )?,
        },
    }))
}

/// Build the atomic entry-plus-exits order for a fresh entry. All
/// distances come out in points on the tick grid, and the TP rung
/// quantities sum to the entry quantity.
pub fn build_bracket(
    cfg: &EffectiveConfig,
    contract: &ContractSpec,
    side: OrderSide,
    quantity: Volume,
    reference_price: Option<Price>,
    client_order_id: ClientOrderId,
) -> Result<BracketSpec, JtError> {
    if quantity <= Decimal::ZERO {
        return Err(JtError::BadRequest(format!(
            "bracket quantity must be positive, got {}",
            quantity
        )));
    }

    let tp_quantities = allocate_tp_quantities(cfg, quantity);
    let mut legs = Vec::with_capacity(tp_quantities.len());
    for (leg_plan, leg_quantity) in cfg.take_profit.legs.iter().zip(tp_quantities) {
        if leg_quantity <= Decimal::ZERO {
            continue;
        }
        legs.push(TakeProfitLeg {
            quantity: leg_quantity,
            distance_points: distance_to_points(
                leg_plan.distance,
                cfg.take_profit.distance_unit,
                contract,
                reference_price,
            )?,
        });
    }

    Ok(BracketSpec {
        symbol: cfg.symbol.clone(),
        side,
        quantity,
        legs,
        stop: stop_spec(cfg, contract, reference_price)?,
        client_order_id,
    })
}

/// Absolute take-profit prices for the cancel-and-replace path, computed
/// from an average entry the broker reported. Every price is tick aligned.
pub fn take_profit_prices(
    cfg: &EffectiveConfig,
    contract: &ContractSpec,
    side: OrderSide,
    average_entry: Price,
    position_quantity: Volume,
) -> Result<Vec<(Volume, Price)>, JtError> {
    let direction = match side {
        OrderSide::Buy => Decimal::ONE,
        OrderSide::Sell => -Decimal::ONE,
    };
    let quantities = allocate_tp_quantities(cfg, position_quantity);
    let mut prices = Vec::with_capacity(quantities.len());
    for (leg_plan, quantity) in cfg.take_profit.legs.iter().zip(quantities) {
        if quantity <= Decimal::ZERO {
            continue;
        }
        let points = distance_to_points(
            leg_plan.distance,
            cfg.take_profit.distance_unit,
            contract,
            Some(average_entry),
        )?;
        let price = round_to_tick_size(average_entry + points * direction, contract.tick_size);
        prices.push((quantity, price));
    }
    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jt_standard_lib::standardized_types::strategies::{
        Strategy, TakeProfitLegPlan, TakeProfitPlan, Trader, TraderOverrides,
    };
    use proptest::prelude::*;

    fn contract(tick: Decimal) -> ContractSpec {
        ContractSpec {
            contract_id: "C1".to_string(),
            symbol: "MNQH6".to_string(),
            tick_size: tick,
            tick_value: dec!(0.50),
        }
    }

    fn config_with(tp: TakeProfitPlan) -> EffectiveConfig {
        let mut strategy = base_strategy();
        strategy.take_profit = tp;
        trader().effective(&strategy)
    }

    fn base_strategy() -> Strategy {
        use jt_standard_lib::standardized_types::enums::*;
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
            stop_loss: jt_standard_lib::standardized_types::strategies::StopLossPlan {
                enabled: true,
                distance: dec!(50),
                unit: DistanceUnit::Ticks,
                kind: StopKind::Fixed,
                trail_trigger: Decimal::ZERO,
                trail_frequency: Decimal::ZERO,
            },
            add_down: Default::default(),
            break_even: Default::default(),
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

    fn trader() -> Trader {
        Trader {
            id: 1,
            user_id: 1,
            strategy_id: 1,
            account_id: 1,
            enabled: true,
            multiplier: dec!(1),
            overrides: TraderOverrides::default(),
        }
    }

    #[test]
    fn fresh_entry_bracket_matches_configured_plan() {
        let cfg = trader().effective(&base_strategy());
        let bracket = build_bracket(
            &cfg,
            &contract(dec!(0.25)),
            OrderSide::Buy,
            dec!(1),
            Some(dec!(21500.00)),
            "JT_SIG_x".to_string(),
        )
        .unwrap();

        assert_eq!(bracket.quantity, dec!(1));
        assert_eq!(bracket.legs.len(), 1);
        // 20 ticks on a 0.25 grid is 5 points.
        assert_eq!(bracket.legs[0].distance_points, dec!(5));
        assert_eq!(bracket.legs[0].quantity, dec!(1));
        // 50 ticks is 12.5 points.
        assert_eq!(
            bracket.stop,
            Some(StopSpec::Fixed { distance_points: dec!(12.5) })
        );
        assert!(bracket.legs_cover_entry());
    }

    #[test]
    fn percent_trims_round_and_last_leg_absorbs_remainder() {
        let cfg = config_with(TakeProfitPlan {
            distance_unit: DistanceUnit::Ticks,
            trim_unit: TrimUnit::Percent,
            legs: vec![
                TakeProfitLegPlan { distance: dec!(10), trim: dec!(33) },
                TakeProfitLegPlan { distance: dec!(20), trim: dec!(33) },
                TakeProfitLegPlan { distance: dec!(40), trim: dec!(34) },
            ],
        });
        let quantities = allocate_tp_quantities(&cfg, dec!(10));
        assert_eq!(quantities, vec![dec!(3), dec!(3), dec!(4)]);

        // A split that over-rounds still covers exactly; starved rungs
        // come back as zero and are skipped at placement.
        let quantities = allocate_tp_quantities(&cfg, dec!(2));
        let total: Decimal = quantities.iter().sum();
        assert_eq!(total, dec!(2));
        assert_eq!(quantities.len(), 3);
    }

    #[test]
    fn contract_trims_clamp_to_remaining() {
        let cfg = config_with(TakeProfitPlan {
            distance_unit: DistanceUnit::Ticks,
            trim_unit: TrimUnit::Contracts,
            legs: vec![
                TakeProfitLegPlan { distance: dec!(10), trim: dec!(2) },
                TakeProfitLegPlan { distance: dec!(20), trim: dec!(5) },
            ],
        });
        assert_eq!(allocate_tp_quantities(&cfg, dec!(3)), vec![dec!(2), dec!(1)]);
    }

    #[test]
    fn percent_distance_needs_reference_price() {
        let cfg = config_with(TakeProfitPlan {
            distance_unit: DistanceUnit::Percent,
            trim_unit: TrimUnit::Percent,
            legs: vec![TakeProfitLegPlan { distance: dec!(1), trim: dec!(100) }],
        });
        let err = build_bracket(
            &cfg,
            &contract(dec!(0.25)),
            OrderSide::Buy,
            dec!(1),
            None,
            "JT_SIG_x".to_string(),
        )
        .unwrap_err();
        assert!(matches!(err, JtError::BadRequest(_)));
    }

    #[test]
    fn recomputed_tp_prices_use_broker_average_and_stay_on_grid() {
        let cfg = trader().effective(&base_strategy());
        let c = contract(dec!(0.25));
        // Broker-reported average from two fills at 21500 and 21480.
        let prices = take_profit_prices(&cfg, &c, OrderSide::Buy, dec!(21490.00), dec!(2)).unwrap();
        assert_eq!(prices, vec![(dec!(2), dec!(21495.00))]);

        // A drifted fractional average still lands on the tick grid.
        let prices = take_profit_prices(&cfg, &c, OrderSide::Buy, dec!(21490.13), dec!(2)).unwrap();
        assert_eq!(prices[0].1, dec!(21495.25));

        let short = take_profit_prices(&cfg, &c, OrderSide::Sell, dec!(21490.00), dec!(2)).unwrap();
        assert_eq!(short, vec![(dec!(2), dec!(21485.00))]);
    }

    proptest! {
        /// The TP rungs always cover the entry quantity exactly, whatever
        /// the configured trim split.
        #[test]
        fn rungs_always_cover_entry(
            qty in 1i64..50i64,
            trims in prop::collection::vec(1u32..100u32, 1..4),
        ) {
            let legs = trims
                .iter()
                .map(|t| TakeProfitLegPlan { distance: dec!(10), trim: Decimal::from(*t) })
                .collect();
            let cfg = config_with(TakeProfitPlan {
                distance_unit: DistanceUnit::Ticks,
                trim_unit: TrimUnit::Percent,
                legs,
            });
            let quantities = allocate_tp_quantities(&cfg, Decimal::from(qty));
            let total: Decimal = quantities.iter().sum();
            prop_assert_eq!(total, Decimal::from(qty));
            prop_assert!(quantities.iter().all(|q| *q >= Decimal::ZERO));
        }

        /// Every distance the bracket builder emits is an exact multiple of
        /// the contract tick.
        #[test]
        fn emitted_distances_are_tick_aligned(
            distance_ticks in 1i64..400i64,
            tick_idx in 0usize..5usize,
        ) {
            let ticks = [dec!(0.01), dec!(0.10), dec!(0.25), dec!(1.0), dec!(0.03125)];
            let c = contract(ticks[tick_idx]);
            let cfg = config_with(TakeProfitPlan {
                distance_unit: DistanceUnit::Ticks,
                trim_unit: TrimUnit::Percent,
                legs: vec![TakeProfitLegPlan { distance: Decimal::from(distance_ticks), trim: dec!(100) }],
            });
            let bracket = build_bracket(&cfg, &c, OrderSide::Buy, dec!(1), None, "JT_SIG_p".to_string()).unwrap();
            let ratio = bracket.legs[0].distance_points / c.tick_size;
            prop_assert_eq!(ratio, ratio.round_dp(0));
        }
    }
}
