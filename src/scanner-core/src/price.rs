//! Fixed-point price representation.
//!
//! Wire prices arrive as decimal strings ("0.4550"). Per the design notes,
//! book keys are quantised to four decimal places and stored as a `i64`
//! tick count so that price comparisons and map ordering are exact integer
//! operations rather than floating-point or `Decimal` scale comparisons.

use std::fmt;

use rust_decimal::Decimal;

/// A price quantised to four decimal places, stored as ticks of `1e-4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FixedPrice(i64);

impl FixedPrice {
    /// Ticks per unit (four decimal places).
    pub const SCALE: i64 = 10_000;

    pub const ZERO: FixedPrice = FixedPrice(0);
    pub const ONE: FixedPrice = FixedPrice(Self::SCALE);

    /// Build a `FixedPrice` directly from a tick count.
    pub const fn from_ticks(ticks: i64) -> Self {
        Self(ticks)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    /// Quantise a `Decimal` to four decimal places.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        let scaled = value.round_dp(4) * Decimal::from(Self::SCALE);
        scaled.try_into().ok().map(FixedPrice)
    }

    /// Parse a wire-format decimal string ("0.4550") into a quantised price.
    pub fn parse(text: &str) -> Option<Self> {
        text.trim().parse::<Decimal>().ok().and_then(Self::from_decimal)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, 4)
    }

    pub fn checked_add(self, other: FixedPrice) -> Option<FixedPrice> {
        self.0.checked_add(other.0).map(FixedPrice)
    }

    pub fn checked_sub(self, other: FixedPrice) -> Option<FixedPrice> {
        self.0.checked_sub(other.0).map(FixedPrice)
    }
}

impl fmt::Display for FixedPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_wire_prices() {
        assert_eq!(FixedPrice::parse("0.4550").unwrap().ticks(), 4550);
        assert_eq!(FixedPrice::parse("1").unwrap().ticks(), 10_000);
        assert_eq!(FixedPrice::parse("0").unwrap().ticks(), 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(FixedPrice::parse("not-a-price").is_none());
        assert!(FixedPrice::parse("").is_none());
    }

    #[test]
    fn quantises_beyond_four_decimals() {
        let p = FixedPrice::from_decimal(dec!(0.455049)).unwrap();
        assert_eq!(p.ticks(), 4550);
    }

    #[test]
    fn round_trips_through_decimal() {
        let p = FixedPrice::parse("0.0599").unwrap();
        assert_eq!(p.to_decimal(), dec!(0.0599));
    }

    #[test]
    fn orders_by_value() {
        let a = FixedPrice::parse("0.40").unwrap();
        let b = FixedPrice::parse("0.55").unwrap();
        assert!(a < b);
    }

    #[test]
    fn addition_and_combined_threshold() {
        let yes = FixedPrice::parse("0.45").unwrap();
        let no = FixedPrice::parse("0.50").unwrap();
        let combined = yes.checked_add(no).unwrap();
        assert!(combined < FixedPrice::ONE);
        assert_eq!(FixedPrice::ONE.checked_sub(combined).unwrap().to_decimal(), dec!(0.05));
    }
}
