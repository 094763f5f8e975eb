//! Per-token order book: two ordered maps from quantised price to size.
//!
//! Invariant: every entry has size > 0; best_ask is the minimum ask price,
//! best_bid is the maximum bid price. Never trusts a transport-supplied
//! "best price" field — always recomputed locally from the map.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::price::FixedPrice;

/// Which side of the book a price level belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    /// Map the wire `BUY`/`SELL` vocabulary onto book sides.
    pub fn from_wire(raw: &str) -> Option<Side> {
        match raw {
            "BUY" => Some(Side::Bid),
            "SELL" => Some(Side::Ask),
            _ => None,
        }
    }
}

/// A single price level in a snapshot or delta.
#[derive(Debug, Clone, Copy)]
pub struct Level {
    pub price: FixedPrice,
    pub size: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    asks: BTreeMap<FixedPrice, Decimal>,
    bids: BTreeMap<FixedPrice, Decimal>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the book with a full snapshot. Zero-size entries are dropped.
    pub fn apply_snapshot(&mut self, asks: &[Level], bids: &[Level]) {
        self.asks = asks
            .iter()
            .filter(|l| !l.size.is_zero())
            .map(|l| (l.price, l.size))
            .collect();
        self.bids = bids
            .iter()
            .filter(|l| !l.size.is_zero())
            .map(|l| (l.price, l.size))
            .collect();
    }

    /// Apply a single delta: size == 0 deletes the level, otherwise sets it.
    pub fn apply_change(&mut self, side: Side, price: FixedPrice, size: Decimal) {
        let levels = match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        };
        if size.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, size);
        }
    }

    /// Lowest ask price, if the book has any ask liquidity.
    pub fn best_ask(&self) -> Option<FixedPrice> {
        self.asks.keys().next().copied()
    }

    /// Highest bid price, if the book has any bid liquidity.
    pub fn best_bid(&self) -> Option<FixedPrice> {
        self.bids.keys().next_back().copied()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.len()
    }

    pub fn bid_count(&self) -> usize {
        self.bids.len()
    }

    /// True if every resting entry has a positive size and the book is
    /// internally crossed-free (best_ask >= best_bid).
    pub fn is_consistent(&self) -> bool {
        let sizes_positive = self
            .asks
            .values()
            .chain(self.bids.values())
            .all(|s| *s > Decimal::ZERO);
        let not_crossed = match (self.best_ask(), self.best_bid()) {
            (Some(ask), Some(bid)) => ask >= bid,
            _ => true,
        };
        sizes_positive && not_crossed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: &str, size: &str) -> Level {
        Level {
            price: FixedPrice::parse(price).unwrap(),
            size: size.parse().unwrap(),
        }
    }

    #[test]
    fn snapshot_drops_zero_size_entries() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&[level("0.50", "0"), level("0.52", "100")], &[]);
        assert_eq!(book.ask_count(), 1);
        assert_eq!(book.best_ask(), FixedPrice::parse("0.52"));
    }

    #[test]
    fn best_ask_is_minimum_best_bid_is_maximum() {
        let mut book = OrderBook::new();
        book.apply_snapshot(
            &[level("0.55", "10"), level("0.52", "10"), level("0.60", "10")],
            &[level("0.40", "10"), level("0.48", "10")],
        );
        assert_eq!(book.best_ask(), FixedPrice::parse("0.52"));
        assert_eq!(book.best_bid(), FixedPrice::parse("0.48"));
    }

    #[test]
    fn delta_removes_on_zero_size() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&[level("0.52", "10")], &[]);
        book.apply_change(Side::Ask, FixedPrice::parse("0.52").unwrap(), "0".parse().unwrap());
        assert_eq!(book.best_ask(), None);
    }

    #[test]
    fn delta_inserts_new_level() {
        let mut book = OrderBook::new();
        book.apply_change(Side::Bid, FixedPrice::parse("0.40").unwrap(), "5".parse().unwrap());
        assert_eq!(book.best_bid(), FixedPrice::parse("0.40"));
    }

    #[test]
    fn snapshot_after_deltas_converges_independent_of_intermediate_state() {
        let mut a = OrderBook::new();
        a.apply_snapshot(&[level("0.52", "10")], &[level("0.48", "5")]);
        a.apply_change(Side::Ask, FixedPrice::parse("0.53").unwrap(), "7".parse().unwrap());
        a.apply_change(Side::Bid, FixedPrice::parse("0.48").unwrap(), "0".parse().unwrap());
        a.apply_snapshot(&[level("0.60", "1")], &[level("0.59", "1")]);

        let mut b = OrderBook::new();
        b.apply_snapshot(&[level("0.60", "1")], &[level("0.59", "1")]);

        assert_eq!(a.best_ask(), b.best_ask());
        assert_eq!(a.best_bid(), b.best_bid());
        assert_eq!(a.ask_count(), b.ask_count());
        assert_eq!(a.bid_count(), b.bid_count());
    }

    #[test]
    fn consistency_holds_with_no_crossed_book() {
        let mut book = OrderBook::new();
        book.apply_snapshot(&[level("0.55", "1")], &[level("0.45", "1")]);
        assert!(book.is_consistent());
    }
}
