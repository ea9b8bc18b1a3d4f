//! Entry/exit commission calculation.
//!
//! `commission_value_type` selects the unit the rate is expressed in:
//! `"percentage"` charges a percentage of order notional
//! (`qty * contract_size * price`); anything else (`"money"` being the
//! common case) charges a flat amount per lot (`rate * qty`).
//! `commission_type` is persisted on the order as a snapshot but does not
//! change this formula — both entry and exit commission are computed the
//! same way, evaluated at the respective price.

use rust_decimal::Decimal;

pub fn compute_commission(
    rate: Decimal,
    value_type: &str,
    qty: Decimal,
    price: Decimal,
    contract_size: Decimal,
) -> Decimal {
    if rate.is_zero() {
        return Decimal::ZERO;
    }
    if value_type.eq_ignore_ascii_case("percentage") {
        rate / Decimal::from(100) * qty * contract_size * price
    } else {
        rate * qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zero_rate_is_free() {
        assert_eq!(compute_commission(Decimal::ZERO, "money", dec!(1), dec!(1.1), dec!(100000)), Decimal::ZERO);
    }

    #[test]
    fn flat_per_lot() {
        let c = compute_commission(dec!(7), "money", dec!(2), dec!(1.1), dec!(100000));
        assert_eq!(c, dec!(14));
    }

    #[test]
    fn percentage_of_notional() {
        let c = compute_commission(dec!(0.1), "percentage", dec!(1), dec!(1.1), dec!(100000));
        // 0.1% of (1 * 100000 * 1.1) = 110
        assert_eq!(c, dec!(110.0));
    }
}
