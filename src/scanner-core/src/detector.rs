//! Per-market spread detector: the state machine that turns a stream of
//! price messages into Open/Close window events.
//!
//! The Detector keeps its own price cache rather than reading the Market
//! Store on every tick. Reading the shared store concurrently with the Feed
//! Connector's writes would expose interleaved, half-updated snapshots; the
//! private cache guarantees each decision reflects exactly the message that
//! produced it. This also makes the Detector single-threaded and trivial to
//! unit test without a store or network at all.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use hdrhistogram::Histogram;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::classifier::classify;
use crate::models::{
    CloseWindowEvent, MarketId, OpenDurationClass, OpenWindowEvent, PriceMessage, SpreadCategory,
    TokenId, WindowEvent, WindowObservables,
};
use crate::price::FixedPrice;
use crate::store::MarketStore;

/// Tunables for the state machine. `min_combined_threshold` defaults to
/// `1.0` (strict `combined < 1.0`); lowering it prices in transaction costs.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    pub min_arb_ticks: u32,
    pub min_combined_threshold: Decimal,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_arb_ticks: 2,
            min_combined_threshold: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveWindow {
    first_seen_ns: i64,
    last_seen_ns: i64,
    tick_count: u32,
    opening_yes_ask: Decimal,
    opening_no_ask: Decimal,
    prev_yes_ask: FixedPrice,
    prev_no_ask: FixedPrice,
    trade_event_fired: bool,
    volume_change_ticks: u32,
    price_shifted: bool,
    last_yes_ask: Decimal,
    last_no_ask: Decimal,
}

#[derive(Debug, Clone)]
enum MarketState {
    Idle,
    Pending(ActiveWindow),
    Open(ActiveWindow),
}

/// Thread-safe handle to the detection-latency histogram. The Detector is
/// the sole writer; `snapshot()` is cheap enough to call from the query
/// layer or the health endpoint on demand.
#[derive(Clone)]
pub struct LatencyHistogram(Arc<Mutex<Histogram<u64>>>);

#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySnapshot {
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub count: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3).expect("valid histogram bounds");
        Self(Arc::new(Mutex::new(histogram)))
    }

    fn record(&self, micros: u64) {
        let mut h = self.0.lock().expect("latency histogram mutex poisoned");
        let _ = h.record(micros);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let h = self.0.lock().expect("latency histogram mutex poisoned");
        LatencySnapshot {
            p50_us: h.value_at_quantile(0.50),
            p95_us: h.value_at_quantile(0.95),
            p99_us: h.value_at_quantile(0.99),
            count: h.len(),
        }
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks, per market, how many Pending windows were discarded as
/// single-tick glitches before ever reaching Open. The Aggregator reads a
/// snapshot of this to compute each market's noise ratio.
#[derive(Clone, Default)]
pub struct DiscardedPendingCounter(Arc<Mutex<HashMap<MarketId, u64>>>);

impl DiscardedPendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self, market_id: MarketId) {
        let mut counts = self.0.lock().expect("discarded pending mutex poisoned");
        *counts.entry(market_id).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> HashMap<MarketId, u64> {
        self.0.lock().expect("discarded pending mutex poisoned").clone()
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Everything that can drive the Detector's state machine: a price tick
/// from the Feed Connector, or a removal notice from the Subscription
/// Controller (which may synthesise a Close).
pub enum DetectorInput {
    Price(PriceMessage),
    Remove(MarketId),
}

pub struct SpreadDetector {
    store: Arc<MarketStore>,
    price_cache: HashMap<TokenId, (FixedPrice, FixedPrice)>,
    states: HashMap<MarketId, MarketState>,
    config: DetectorConfig,
    histogram: LatencyHistogram,
    discarded_pending: DiscardedPendingCounter,
    event_tx: mpsc::Sender<WindowEvent>,
}

impl SpreadDetector {
    pub fn new(
        store: Arc<MarketStore>,
        config: DetectorConfig,
        histogram: LatencyHistogram,
        discarded_pending: DiscardedPendingCounter,
        event_tx: mpsc::Sender<WindowEvent>,
    ) -> Self {
        Self {
            store,
            price_cache: HashMap::new(),
            states: HashMap::new(),
            config,
            histogram,
            discarded_pending,
            event_tx,
        }
    }

    /// Handle to this detector's discarded-pending counter, for wiring into
    /// the Aggregator.
    pub fn discarded_pending(&self) -> DiscardedPendingCounter {
        self.discarded_pending.clone()
    }

    /// Drive the state machine with one Price Message, emitting at most one
    /// window event. Steps 1-6 of the per-tick procedure; no suspension
    /// points until the final queue send.
    pub async fn on_price_message(&mut self, msg: PriceMessage) {
        if let Some(event) = self.decide(&msg) {
            if self.event_tx.send(event).await.is_err() {
                warn!("window consumer channel closed; dropping event");
            }
        }
    }

    fn decide(&mut self, msg: &PriceMessage) -> Option<WindowEvent> {
        // Step 1: update private cache.
        self.price_cache
            .insert(msg.token_id.clone(), (msg.best_ask, msg.best_bid));

        // Step 2: resolve market.
        let (market_id, outcome) = self.store.get_market_for_token(&msg.token_id)?;
        let market = self.store.get_market(market_id)?;

        // Step 3: read both sides from the private cache.
        let yes_ask = self.price_cache.get(&market.yes_token_id)?.0;
        let no_ask = self.price_cache.get(&market.no_token_id)?.0;

        // Step 4: compute combined / spread / is_arb.
        let combined = yes_ask.to_decimal() + no_ask.to_decimal();
        let spread = Decimal::ONE - combined;
        let is_arb = combined < self.config.min_combined_threshold;

        // Step 5: latency.
        let elapsed_us = msg.received_at.elapsed().as_micros().min(u128::from(u64::MAX)) as u64;
        self.histogram.record(elapsed_us);

        let _ = outcome; // resolved only to confirm the token belongs to this market

        // Step 6: advance the state machine.
        self.advance(market_id, yes_ask, no_ask, combined, spread, is_arb, msg, elapsed_us)
    }

    fn advance(
        &mut self,
        market_id: MarketId,
        yes_ask: FixedPrice,
        no_ask: FixedPrice,
        combined: Decimal,
        spread: Decimal,
        is_arb: bool,
        msg: &PriceMessage,
        elapsed_us: u64,
    ) -> Option<WindowEvent> {
        let now = now_ns();
        let state = self.states.remove(&market_id).unwrap_or(MarketState::Idle);

        match state {
            MarketState::Idle => {
                if is_arb {
                    let window = ActiveWindow {
                        first_seen_ns: now,
                        last_seen_ns: now,
                        tick_count: 1,
                        opening_yes_ask: yes_ask.to_decimal(),
                        opening_no_ask: no_ask.to_decimal(),
                        prev_yes_ask: yes_ask,
                        prev_no_ask: no_ask,
                        trade_event_fired: msg.trade_fired,
                        volume_change_ticks: u32::from(msg.volume_changed),
                        price_shifted: false,
                        last_yes_ask: yes_ask.to_decimal(),
                        last_no_ask: no_ask.to_decimal(),
                    };
                    self.states.insert(market_id, MarketState::Pending(window));
                } else {
                    self.states.insert(market_id, MarketState::Idle);
                }
                None
            }
            MarketState::Pending(mut window) => {
                if !is_arb {
                    debug!(%market_id, "single-tick glitch discarded");
                    self.discarded_pending.increment(market_id);
                    self.states.insert(market_id, MarketState::Idle);
                    None
                } else {
                    Self::update_observables(&mut window, yes_ask, no_ask, msg, now);
                    if window.tick_count >= self.config.min_arb_ticks {
                        let event = OpenWindowEvent {
                            market_id,
                            opened_at_ns: window.first_seen_ns,
                            opening_yes_ask: window.opening_yes_ask,
                            opening_no_ask: window.opening_no_ask,
                            opening_combined: window.opening_yes_ask + window.opening_no_ask,
                            opening_spread: Decimal::ONE - (window.opening_yes_ask + window.opening_no_ask),
                        };
                        self.states.insert(market_id, MarketState::Open(window));
                        Some(WindowEvent::Open(event))
                    } else {
                        self.states.insert(market_id, MarketState::Pending(window));
                        None
                    }
                }
            }
            MarketState::Open(mut window) => {
                if is_arb {
                    Self::update_observables(&mut window, yes_ask, no_ask, msg, now);
                    self.states.insert(market_id, MarketState::Open(window));
                    None
                } else {
                    let event = Self::close_window(market_id, window, combined, spread, now, elapsed_us);
                    self.states.insert(market_id, MarketState::Idle);
                    Some(WindowEvent::Close(event))
                }
            }
        }
    }

    fn update_observables(window: &mut ActiveWindow, yes_ask: FixedPrice, no_ask: FixedPrice, msg: &PriceMessage, now: i64) {
        window.tick_count += 1;
        window.last_seen_ns = now;
        if msg.trade_fired {
            window.trade_event_fired = true;
        }
        if msg.volume_changed {
            window.volume_change_ticks += 1;
        }
        if yes_ask != window.prev_yes_ask || no_ask != window.prev_no_ask {
            window.price_shifted = true;
        }
        window.prev_yes_ask = yes_ask;
        window.prev_no_ask = no_ask;
        window.last_yes_ask = yes_ask.to_decimal();
        window.last_no_ask = no_ask.to_decimal();
    }

    fn close_window(
        market_id: MarketId,
        window: ActiveWindow,
        combined: Decimal,
        spread: Decimal,
        closed_at_ns: i64,
        elapsed_us: u64,
    ) -> CloseWindowEvent {
        let observables = WindowObservables {
            open_duration_class: OpenDurationClass::MultiTick,
            trade_event_fired: window.trade_event_fired,
            volume_change_ticks: window.volume_change_ticks,
            price_shifted: window.price_shifted,
        };
        let classification = classify(observables);
        CloseWindowEvent {
            market_id,
            opened_at_ns: window.first_seen_ns,
            closed_at_ns,
            closing_yes_ask: window.last_yes_ask,
            closing_no_ask: window.last_no_ask,
            closing_combined: combined,
            closing_spread: spread,
            spread_category: SpreadCategory::classify(spread),
            classification,
            tick_count: window.tick_count,
            trade_event_fired: window.trade_event_fired,
            volume_change_ticks: window.volume_change_ticks,
            detection_latency_us: elapsed_us,
        }
    }

    /// Called by the Subscription Controller when a market is removed while
    /// it may still have an Open window. Synthesises a Close using the last
    /// known combined, if one exists.
    pub fn remove_market(&mut self, market_id: MarketId) -> Option<WindowEvent> {
        match self.states.remove(&market_id) {
            Some(MarketState::Open(window)) => {
                let combined = window.last_yes_ask + window.last_no_ask;
                let spread = Decimal::ONE - combined;
                let event = Self::close_window(market_id, window, combined, spread, now_ns(), 0);
                Some(WindowEvent::Close(event))
            }
            _ => None,
        }
    }

    pub fn latency_snapshot(&self) -> LatencySnapshot {
        self.histogram.snapshot()
    }

    /// Drive the state machine until the input channel closes (shutdown).
    pub async fn run(&mut self, mut input: mpsc::Receiver<DetectorInput>) {
        while let Some(item) = input.recv().await {
            match item {
                DetectorInput::Price(msg) => self.on_price_message(msg).await,
                DetectorInput::Remove(market_id) => {
                    if let Some(event) = self.remove_market(market_id) {
                        if self.event_tx.send(event).await.is_err() {
                            warn!("window consumer channel closed; dropping synthetic close");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Market;
    use crate::orderbook::Level;
    use chrono::Utc;
    use std::time::Instant;
    use uuid::Uuid;

    fn setup(min_arb_ticks: u32) -> (Arc<MarketStore>, MarketId, SpreadDetector, mpsc::Receiver<WindowEvent>) {
        let store = Arc::new(MarketStore::new());
        let market = Market {
            id: Uuid::new_v4(),
            condition_id: "cond".into(),
            title: "t".into(),
            category: "c".into(),
            end_time: Utc::now(),
            volume_24h: Decimal::new(1, 0),
            liquidity: Decimal::new(1, 0),
            yes_token_id: "yes".into(),
            no_token_id: "no".into(),
            is_active: true,
            discovered_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let market_id = market.id;
        store.insert_market(market);

        let (tx, rx) = mpsc::channel(64);
        let config = DetectorConfig {
            min_arb_ticks,
            ..Default::default()
        };
        let detector = SpreadDetector::new(store.clone(), config, LatencyHistogram::new(), DiscardedPendingCounter::new(), tx);
        (store, market_id, detector, rx)
    }

    fn tick(token: &str, ask: &str, bid: &str, trade: bool, volume: bool) -> PriceMessage {
        PriceMessage {
            token_id: token.to_string(),
            best_ask: FixedPrice::parse(ask).unwrap(),
            best_bid: FixedPrice::parse(bid).unwrap(),
            received_at: Instant::now(),
            trade_fired: trade,
            volume_changed: volume,
        }
    }

    #[tokio::test]
    async fn s1_single_tick_glitch_emits_nothing() {
        let (_store, id, mut detector, mut rx) = setup(2);
        detector.on_price_message(tick("yes", "0.48", "0.47", false, false)).await;
        detector.on_price_message(tick("no", "0.49", "0.48", false, false)).await;
        detector.on_price_message(tick("yes", "0.52", "0.51", false, false)).await;

        rx.close();
        assert!(rx.try_recv().is_err());
        assert_eq!(detector.discarded_pending().snapshot().get(&id), Some(&1));
    }

    #[tokio::test]
    async fn s2_gradual_volume_open_then_close() {
        let (_store, _id, mut detector, mut rx) = setup(2);

        // tick 1: not yet arb (no=0.50) -> feed yes then no
        detector.on_price_message(tick("yes", "0.45", "0.44", false, false)).await;
        detector.on_price_message(tick("no", "0.50", "0.49", false, false)).await;
        // tick 2: arb begins, no drops to 0.49, trade+vol
        detector.on_price_message(tick("no", "0.49", "0.48", true, true)).await;
        assert!(matches!(rx.try_recv().unwrap(), WindowEvent::Open(_)));
        // tick 3: still arb, trade+vol again -> gradual
        detector.on_price_message(tick("no", "0.49", "0.48", true, true)).await;
        // tick 4: closes (yes rises, no rises, combined > 1)
        detector.on_price_message(tick("yes", "0.47", "0.46", false, false)).await;
        detector.on_price_message(tick("no", "0.54", "0.53", false, false)).await;

        let close = rx.try_recv().unwrap();
        match close {
            WindowEvent::Close(c) => {
                assert_eq!(c.classification.close_reason, Some(crate::models::CloseReason::VolumeSpikeGradual));
                assert_eq!(c.tick_count, 3);
            }
            _ => panic!("expected close event"),
        }
    }

    #[tokio::test]
    async fn removing_market_with_open_window_emits_synthetic_close() {
        let (_store, id, mut detector, mut rx) = setup(2);
        detector.on_price_message(tick("yes", "0.40", "0.39", false, false)).await;
        detector.on_price_message(tick("no", "0.40", "0.39", false, false)).await;
        detector.on_price_message(tick("no", "0.40", "0.39", false, false)).await;
        let _ = rx.try_recv().unwrap(); // Open

        let event = detector.remove_market(id);
        assert!(matches!(event, Some(WindowEvent::Close(_))));
        assert!(detector.remove_market(id).is_none());
    }

    #[tokio::test]
    async fn unknown_token_is_dropped_without_panic() {
        let (_store, _id, mut detector, mut rx) = setup(2);
        detector.on_price_message(tick("ghost", "0.5", "0.49", false, false)).await;
        rx.close();
        assert!(rx.try_recv().is_err());
    }
}
