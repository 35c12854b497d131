use rust_decimal::{Decimal, RoundingStrategy};

use crate::standardized_types::{Price, Volume};

/// Symmetric rounding of a price onto the contract's tick grid:
/// `round(price / tick) * tick`. Every price sent to a broker passes
/// through here first.
pub fn round_to_tick_size(price: Price, tick_size: Price) -> Price {
    if tick_size <= Decimal::ZERO {
        return price;
    }
    let ticks = (price / tick_size)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (ticks * tick_size).normalize()
}

/// Distances configured in ticks become broker distances in points.
pub fn ticks_to_points(ticks: Decimal, tick_size: Price) -> Price {
    (ticks * tick_size).normalize()
}

/// Contract quantities are whole numbers; multipliers produce fractions
/// that round half away from zero.
pub fn round_quantity(quantity: Volume) -> Volume {
    quantity.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

/// Cap a quantity when the cap is set; zero caps mean unlimited.
pub fn cap_quantity(quantity: Volume, cap: Volume) -> Volume {
    if cap > Decimal::ZERO {
        quantity.min(cap)
    } else {
        quantity
    }
}

/// Quantity weighted average entry across (price, quantity) pairs. Zero
/// total quantity yields zero rather than dividing.
pub fn weighted_average_price(entries: &[(Price, Volume)]) -> Price {
    let mut total_quantity = Decimal::ZERO;
    let mut weighted_total = Decimal::ZERO;
    for (price, quantity) in entries {
        weighted_total += price * quantity;
        total_quantity += quantity;
    }
    if total_quantity > Decimal::ZERO {
        weighted_total / total_quantity
    } else {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rounds_onto_quarter_tick_grid() {
        assert_eq!(round_to_tick_size(dec!(21504.90), dec!(0.25)), dec!(21505));
        assert_eq!(round_to_tick_size(dec!(21504.87), dec!(0.25)), dec!(21504.75));
        assert_eq!(round_to_tick_size(dec!(21487.50), dec!(0.25)), dec!(21487.5));
    }

    #[test]
    fn rounds_onto_thirty_seconds_grid() {
        // Treasury style 1/32 tick.
        let tick = dec!(0.03125);
        assert_eq!(round_to_tick_size(dec!(110.51), tick), dec!(110.5));
        assert_eq!(round_to_tick_size(dec!(110.516), tick), dec!(110.53125));
    }

    #[test]
    fn midpoint_rounds_away_from_zero() {
        assert_eq!(round_to_tick_size(dec!(100.125), dec!(0.25)), dec!(100.25));
        assert_eq!(round_to_tick_size(dec!(-100.125), dec!(0.25)), dec!(-100.25));
        assert_eq!(round_quantity(dec!(0.5)), dec!(1));
        assert_eq!(round_quantity(dec!(-1.5)), dec!(-2));
    }

    #[test]
    fn zero_tick_passes_price_through() {
        assert_eq!(round_to_tick_size(dec!(42.42), Decimal::ZERO), dec!(42.42));
    }

    #[test]
    fn weighted_average_of_two_entries() {
        let entries = [(dec!(21500.00), dec!(1)), (dec!(21480.00), dec!(1))];
        assert_eq!(weighted_average_price(&entries), dec!(21490.00));
        assert_eq!(weighted_average_price(&[]), Decimal::ZERO);
    }

    #[test]
    fn cap_of_zero_is_unlimited() {
        assert_eq!(cap_quantity(dec!(9), dec!(0)), dec!(9));
        assert_eq!(cap_quantity(dec!(9), dec!(4)), dec!(4));
    }

    proptest! {
        /// For any price and any tick from the supported grids, the rounded
        /// price is an exact multiple of the tick.
        #[test]
        fn rounded_price_is_exact_tick_multiple(
            cents in 1u64..100_000_000u64,
            distance_ticks in 0i64..500i64,
            tick_idx in 0usize..5usize,
        ) {
            let ticks = [dec!(0.01), dec!(0.10), dec!(0.25), dec!(1.0), dec!(0.03125)];
            let tick = ticks[tick_idx];
            let price = Decimal::new(cents as i64, 2) + Decimal::from(distance_ticks) * tick;
            let rounded = round_to_tick_size(price, tick);
            let remainder = rounded / tick - (rounded / tick).round_dp(0);
            prop_assert_eq!(remainder, Decimal::ZERO);
        }

        /// Rounding is idempotent: a tick aligned price stays put.
        #[test]
        fn rounding_is_idempotent(
            cents in 1u64..100_000_000u64,
            tick_idx in 0usize..5usize,
        ) {
            let ticks = [dec!(0.01), dec!(0.10), dec!(0.25), dec!(1.0), dec!(0.03125)];
            let tick = ticks[tick_idx];
            let rounded = round_to_tick_size(Decimal::new(cents as i64, 2), tick);
            prop_assert_eq!(round_to_tick_size(rounded, tick), rounded);
        }
    }
}
