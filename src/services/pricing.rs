//! Line arithmetic shared by orders, invoices and credit notes.
//!
//! Amounts are rounded per line to two decimals with commercial rounding
//! (half away from zero); document totals are sums of rounded lines.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::Serialize;

pub const MONEY_SCALE: u32 = 2;

pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LineAmounts {
    pub net: Decimal,
    pub tax: Decimal,
    pub gross: Decimal,
}

impl std::ops::Add for LineAmounts {
    type Output = LineAmounts;

    fn add(self, rhs: LineAmounts) -> LineAmounts {
        LineAmounts {
            net: self.net + rhs.net,
            tax: self.tax + rhs.tax,
            gross: self.gross + rhs.gross,
        }
    }
}

/// `quantity × unit price × (1 − discount%)`, then tax on the rounded net.
pub fn line_amounts(
    quantity: Decimal,
    unit_price: Decimal,
    discount_percent: Decimal,
    tax_rate: Decimal,
) -> LineAmounts {
    let factor = Decimal::ONE - discount_percent / dec!(100);
    let net = round_money(quantity * unit_price * factor);
    let tax = round_money(net * tax_rate / dec!(100));
    LineAmounts {
        net,
        tax,
        gross: net + tax,
    }
}

/// Splits a gross amount into net and tax at `tax_rate` percent.
pub fn split_gross(gross: Decimal, tax_rate: Decimal) -> LineAmounts {
    let net = round_money(gross / (Decimal::ONE + tax_rate / dec!(100)));
    LineAmounts {
        net,
        tax: gross - net,
        gross,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_discount_before_tax() {
        let amounts = line_amounts(dec!(3), dec!(10), dec!(10), dec!(19));
        assert_eq!(amounts.net, dec!(27.00));
        assert_eq!(amounts.tax, dec!(5.13));
        assert_eq!(amounts.gross, dec!(32.13));
    }

    #[test]
    fn rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(0.125)), dec!(0.13));
        assert_eq!(round_money(dec!(-0.125)), dec!(-0.13));
    }

    #[test]
    fn split_gross_keeps_the_gross_exact() {
        let amounts = split_gross(dec!(11.90), dec!(19));
        assert_eq!(amounts.net, dec!(10.00));
        assert_eq!(amounts.tax, dec!(1.90));
        assert_eq!(amounts.net + amounts.tax, dec!(11.90));
    }
}
