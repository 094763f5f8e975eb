//! Concurrent in-memory directory of markets, token reverse-mappings, and
//! per-token order books.
//!
//! Each entry is sharded by `DashMap`'s internal locking, so a book mutation
//! for one token never contends with a read or write for another. There is
//! no global lock anywhere in this module; callers on the hot path (the Feed
//! Connector, the Detector) never block each other across tokens.

use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::models::{Market, MarketId, TokenId};
use crate::orderbook::{Level, OrderBook, Side};
use crate::price::FixedPrice;

/// Which outcome side of its market a token represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Yes,
    No,
}

/// Spread inputs for a market once both outcome tokens are hydrated.
#[derive(Debug, Clone, Copy)]
pub struct SpreadInputs {
    pub market_id: MarketId,
    pub yes_ask: FixedPrice,
    pub no_ask: FixedPrice,
    pub yes_bid: FixedPrice,
    pub no_bid: FixedPrice,
}

#[derive(Debug, Default)]
pub struct MarketStore {
    markets: DashMap<MarketId, Market>,
    token_to_market: DashMap<TokenId, (MarketId, Outcome)>,
    books: DashMap<TokenId, OrderBook>,
    pinned: DashMap<MarketId, ()>,
}

impl MarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a market and wire up its reverse token mappings. Both
    /// directions are updated before this call returns.
    pub fn insert_market(&self, market: Market) {
        let id = market.id;
        self.token_to_market
            .insert(market.yes_token_id.clone(), (id, Outcome::Yes));
        self.token_to_market
            .insert(market.no_token_id.clone(), (id, Outcome::No));
        self.books.entry(market.yes_token_id.clone()).or_default();
        self.books.entry(market.no_token_id.clone()).or_default();
        self.markets.insert(id, market);
    }

    /// Remove a market and its token mappings/books. Does not consult the
    /// pinned set; callers decide eligibility before calling this.
    pub fn remove_market(&self, id: MarketId) -> Option<Market> {
        let market = self.markets.remove(&id).map(|(_, m)| m)?;
        self.token_to_market.remove(&market.yes_token_id);
        self.token_to_market.remove(&market.no_token_id);
        self.books.remove(&market.yes_token_id);
        self.books.remove(&market.no_token_id);
        self.pinned.remove(&id);
        Some(market)
    }

    pub fn get_market(&self, id: MarketId) -> Option<Market> {
        self.markets.get(&id).map(|m| m.clone())
    }

    pub fn all_market_ids(&self) -> Vec<MarketId> {
        self.markets.iter().map(|e| *e.key()).collect()
    }

    pub fn pin(&self, id: MarketId) {
        self.pinned.insert(id, ());
    }

    pub fn unpin(&self, id: MarketId) {
        self.pinned.remove(&id);
    }

    pub fn is_pinned(&self, id: MarketId) -> bool {
        self.pinned.contains_key(&id)
    }

    /// Every currently pinned market, so the pinned watcher can diff against
    /// its freshly computed desired set.
    pub fn pinned_ids(&self) -> Vec<MarketId> {
        self.pinned.iter().map(|e| *e.key()).collect()
    }

    /// Replace a token's book with a fresh snapshot.
    pub fn apply_book_snapshot(&self, token: &TokenId, asks: &[Level], bids: &[Level]) {
        if let Some(mut book) = self.books.get_mut(token) {
            book.apply_snapshot(asks, bids);
        }
    }

    /// Apply a batch of (side, price, size) deltas to a token's book.
    pub fn apply_book_changes(&self, token: &TokenId, changes: &[(Side, FixedPrice, Decimal)]) {
        if let Some(mut book) = self.books.get_mut(token) {
            for (side, price, size) in changes {
                book.apply_change(*side, *price, *size);
            }
        }
    }

    pub fn best_ask(&self, token: &TokenId) -> Option<FixedPrice> {
        self.books.get(token).and_then(|b| b.best_ask())
    }

    pub fn best_bid(&self, token: &TokenId) -> Option<FixedPrice> {
        self.books.get(token).and_then(|b| b.best_bid())
    }

    /// Resolve (market_id, is_yes) for a token, or `None` if it isn't watched
    /// (e.g. after a concurrent unsubscribe).
    pub fn get_market_for_token(&self, token: &TokenId) -> Option<(MarketId, Outcome)> {
        self.token_to_market.get(token).map(|e| *e)
    }

    /// Spread inputs for the market a token belongs to, iff both outcome
    /// tokens are hydrated (have both a best ask and a best bid).
    pub fn get_spread_inputs(&self, token: &TokenId) -> Option<SpreadInputs> {
        let (market_id, _) = self.get_market_for_token(token)?;
        let market = self.get_market(market_id)?;
        let yes_ask = self.best_ask(&market.yes_token_id)?;
        let no_ask = self.best_ask(&market.no_token_id)?;
        let yes_bid = self.best_bid(&market.yes_token_id)?;
        let no_bid = self.best_bid(&market.no_token_id)?;
        Some(SpreadInputs {
            market_id,
            yes_ask,
            no_ask,
            yes_bid,
            no_bid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn make_market(yes: &str, no: &str) -> Market {
        Market {
            id: Uuid::new_v4(),
            condition_id: "cond".into(),
            title: "Will X happen?".into(),
            category: "crypto".into(),
            end_time: Utc::now(),
            volume_24h: Decimal::new(100_000, 0),
            liquidity: Decimal::new(10_000, 0),
            yes_token_id: yes.into(),
            no_token_id: no.into(),
            is_active: true,
            discovered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn level(price: &str, size: &str) -> Level {
        Level {
            price: FixedPrice::parse(price).unwrap(),
            size: size.parse().unwrap(),
        }
    }

    #[test]
    fn insert_then_lookup_both_directions() {
        let store = MarketStore::new();
        let market = make_market("yes-1", "no-1");
        let id = market.id;
        store.insert_market(market);

        let (resolved_id, outcome) = store.get_market_for_token(&"yes-1".to_string()).unwrap();
        assert_eq!(resolved_id, id);
        assert_eq!(outcome, Outcome::Yes);
    }

    #[test]
    fn remove_clears_both_token_mappings_and_books() {
        let store = MarketStore::new();
        let market = make_market("yes-2", "no-2");
        let id = market.id;
        store.insert_market(market);
        store.apply_book_snapshot(&"yes-2".to_string(), &[level("0.5", "10")], &[]);

        store.remove_market(id);

        assert!(store.get_market_for_token(&"yes-2".to_string()).is_none());
        assert!(store.best_ask(&"yes-2".to_string()).is_none());
    }

    #[test]
    fn spread_inputs_none_until_both_sides_hydrated() {
        let store = MarketStore::new();
        let market = make_market("yes-3", "no-3");
        store.insert_market(market);

        store.apply_book_snapshot(&"yes-3".to_string(), &[level("0.45", "10")], &[level("0.40", "10")]);
        assert!(store.get_spread_inputs(&"yes-3".to_string()).is_none());

        store.apply_book_snapshot(&"no-3".to_string(), &[level("0.50", "10")], &[level("0.48", "10")]);
        let inputs = store.get_spread_inputs(&"yes-3".to_string()).unwrap();
        assert_eq!(inputs.yes_ask, FixedPrice::parse("0.45").unwrap());
        assert_eq!(inputs.no_ask, FixedPrice::parse("0.50").unwrap());
    }

    #[test]
    fn pinned_markets_are_tracked_independent_of_the_directory() {
        let store = MarketStore::new();
        let market = make_market("yes-4", "no-4");
        let id = market.id;
        store.insert_market(market);

        assert!(!store.is_pinned(id));
        store.pin(id);
        assert!(store.is_pinned(id));
        assert_eq!(store.pinned_ids(), vec![id]);
        store.unpin(id);
        assert!(!store.is_pinned(id));
        assert!(store.pinned_ids().is_empty());
    }
}
