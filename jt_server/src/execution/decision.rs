use rust_decimal::Decimal;

use jt_standard_lib::standardized_types::enums::{OrderSide, PositionSide};
use jt_standard_lib::standardized_types::Volume;

/// What the engine must do to take an account from `prev` to `target`,
/// both signed and already multiplied/capped. This table is the spine of
/// the system; everything else is mechanics.
#[derive(Clone, Debug, PartialEq)]
pub enum TransitionPlan {
    NoOp,
    /// From flat: bracket entry for the full target.
    Entry { side: OrderSide, quantity: Volume },
    /// To flat: cancel working exits, then market-close the previous
    /// quantity. Never routed as a reversal.
    Close { side: OrderSide, quantity: Volume },
    /// Same direction, growing, add-down enabled: market the delta and
    /// recompute take profits from the broker-reported average.
    AddMerge { side: OrderSide, delta: Volume },
    /// Same direction, growing, add-down disabled: the previous record is
    /// closed and a fresh independent bracket goes in for the delta.
    AddFresh { side: OrderSide, fresh_quantity: Volume },
    /// Same direction, shrinking: market the delta against the position
    /// and leave remaining exits alone.
    Trim { side: OrderSide, delta: Volume },
    /// Sign change: cancel exits, close the old side, then enter the new.
    Flip {
        close_side: OrderSide,
        close_quantity: Volume,
        enter_side: OrderSide,
        enter_quantity: Volume,
    },
}

fn entry_side(signed: Decimal) -> OrderSide {
    if signed > Decimal::ZERO {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    }
}

fn closing_side(signed: Decimal) -> OrderSide {
    entry_side(signed).opposite()
}

pub fn plan_transition(prev: Decimal, target: Decimal, dca_enabled: bool) -> TransitionPlan {
    let prev_side = PositionSide::of_quantity(prev);
    let target_side = PositionSide::of_quantity(target);

    match (prev_side, target_side) {
        (PositionSide::Flat, PositionSide::Flat) => TransitionPlan::NoOp,
        (PositionSide::Flat, _) => TransitionPlan::Entry {
            side: entry_side(target),
            quantity: target.abs(),
        },
        (_, PositionSide::Flat) => TransitionPlan::Close {
            side: closing_side(prev),
            quantity: prev.abs(),
        },
        (p, t) if p == t => {
            let delta = target.abs() - prev.abs();
            if delta > Decimal::ZERO {
                if dca_enabled {
                    TransitionPlan::AddMerge { side: entry_side(target), delta }
                } else {
                    TransitionPlan::AddFresh {
                        side: entry_side(target),
                        fresh_quantity: delta,
                    }
                }
            } else if delta < Decimal::ZERO {
                TransitionPlan::Trim { side: closing_side(prev), delta: delta.abs() }
            } else {
                TransitionPlan::NoOp
            }
        }
        _ => TransitionPlan::Flip {
            close_side: closing_side(prev),
            close_quantity: prev.abs(),
            enter_side: entry_side(target),
            enter_quantity: target.abs(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn entry_from_flat() {
        assert_eq!(
            plan_transition(dec!(0), dec!(1), true),
            TransitionPlan::Entry { side: OrderSide::Buy, quantity: dec!(1) }
        );
        assert_eq!(
            plan_transition(dec!(0), dec!(-3), false),
            TransitionPlan::Entry { side: OrderSide::Sell, quantity: dec!(3) }
        );
    }

    #[test]
    fn close_to_flat_is_never_a_reversal() {
        assert_eq!(
            plan_transition(dec!(2), dec!(0), true),
            TransitionPlan::Close { side: OrderSide::Sell, quantity: dec!(2) }
        );
        assert_eq!(
            plan_transition(dec!(-2), dec!(0), false),
            TransitionPlan::Close { side: OrderSide::Buy, quantity: dec!(2) }
        );
    }

    #[test]
    fn add_routes_by_dca_flag() {
        assert_eq!(
            plan_transition(dec!(1), dec!(2), true),
            TransitionPlan::AddMerge { side: OrderSide::Buy, delta: dec!(1) }
        );
        assert_eq!(
            plan_transition(dec!(1), dec!(2), false),
            TransitionPlan::AddFresh { side: OrderSide::Buy, fresh_quantity: dec!(1) }
        );
        assert_eq!(
            plan_transition(dec!(-2), dec!(-5), true),
            TransitionPlan::AddMerge { side: OrderSide::Sell, delta: dec!(3) }
        );
    }

    #[test]
    fn trim_leaves_exits_in_place() {
        assert_eq!(
            plan_transition(dec!(3), dec!(1), true),
            TransitionPlan::Trim { side: OrderSide::Sell, delta: dec!(2) }
        );
        assert_eq!(
            plan_transition(dec!(-3), dec!(-1), false),
            TransitionPlan::Trim { side: OrderSide::Buy, delta: dec!(2) }
        );
    }

    #[test]
    fn flip_closes_then_enters() {
        assert_eq!(
            plan_transition(dec!(3), dec!(-3), true),
            TransitionPlan::Flip {
                close_side: OrderSide::Sell,
                close_quantity: dec!(3),
                enter_side: OrderSide::Sell,
                enter_quantity: dec!(3),
            }
        );
    }

    #[test]
    fn same_quantity_is_a_no_op() {
        assert_eq!(plan_transition(dec!(2), dec!(2), true), TransitionPlan::NoOp);
        assert_eq!(plan_transition(dec!(0), dec!(0), false), TransitionPlan::NoOp);
    }

    proptest! {
        /// Delta correctness: the plan never routes through a transient
        /// zero unless the sign changes, and the quantities it orders move
        /// the position exactly from prev to target.
        #[test]
        fn plans_move_prev_to_target_exactly(
            prev in -20i64..20i64,
            target in -20i64..20i64,
            dca in proptest::bool::ANY,
        ) {
            let prev = Decimal::from(prev);
            let target = Decimal::from(target);
            let plan = plan_transition(prev, target, dca);

            let signed = |side: OrderSide, qty: Decimal| match side {
                OrderSide::Buy => qty,
                OrderSide::Sell => -qty,
            };

            let result = match plan {
                TransitionPlan::NoOp => prev,
                TransitionPlan::Entry { side, quantity } => prev + signed(side, quantity),
                TransitionPlan::Close { side, quantity } => prev + signed(side, quantity),
                TransitionPlan::AddMerge { side, delta } => prev + signed(side, delta),
                TransitionPlan::AddFresh { side, fresh_quantity } => prev + signed(side, fresh_quantity),
                TransitionPlan::Trim { side, delta } => prev + signed(side, delta),
                TransitionPlan::Flip { close_side, close_quantity, enter_side, enter_quantity } => {
                    let after_close = prev + signed(close_side, close_quantity);
                    // The only path that touches zero is the sign change.
                    prop_assert_eq!(after_close, Decimal::ZERO);
                    after_close + signed(enter_side, enter_quantity)
                }
            };
            prop_assert_eq!(result, target);

            // A transient zero only ever happens on a flip.
            if prev != Decimal::ZERO
                && target != Decimal::ZERO
                && prev.is_sign_positive() == target.is_sign_positive()
            {
                let is_flip_or_close = matches!(plan, TransitionPlan::Flip { .. } | TransitionPlan::Close { .. });
                prop_assert!(!is_flip_or_close);
            }
        }
    }
}
