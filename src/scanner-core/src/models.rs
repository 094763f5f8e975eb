//! Shared data-model types used across the store, detector, classifier, and
//! persistence layers.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::price::FixedPrice;

pub type MarketId = Uuid;
pub type TokenId = String;

/// A candidate or watched market, as admitted by the Catalog Fetcher.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Market {
    pub id: MarketId,
    pub condition_id: String,
    pub title: String,
    pub category: String,
    pub end_time: DateTime<Utc>,
    pub volume_24h: Decimal,
    pub liquidity: Decimal,
    pub yes_token_id: TokenId,
    pub no_token_id: TokenId,
    pub is_active: bool,
    pub discovered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How the YES/NO token split was determined for a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeResolution {
    Labelled,
    Positional,
}

/// A price update for a single token, stamped at the earliest possible point.
#[derive(Debug, Clone)]
pub struct PriceMessage {
    pub token_id: TokenId,
    pub best_ask: FixedPrice,
    pub best_bid: FixedPrice,
    pub received_at: Instant,
    pub trade_fired: bool,
    pub volume_changed: bool,
}

/// Reporting bucket for a window's spread at open (or close).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpreadCategory {
    Noise,
    Small,
    Medium,
    Large,
}

impl SpreadCategory {
    /// Bucket a spread per the thresholds: <0.02 noise, [0.02,0.05) small,
    /// [0.05,0.10) medium, >=0.10 large.
    pub fn classify(spread: Decimal) -> Self {
        if spread < Decimal::new(2, 2) {
            SpreadCategory::Noise
        } else if spread < Decimal::new(5, 2) {
            SpreadCategory::Small
        } else if spread < Decimal::new(10, 2) {
            SpreadCategory::Medium
        } else {
            SpreadCategory::Large
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SpreadCategory::Noise => "noise",
            SpreadCategory::Small => "small",
            SpreadCategory::Medium => "medium",
            SpreadCategory::Large => "large",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "noise" => Some(SpreadCategory::Noise),
            "small" => Some(SpreadCategory::Small),
            "medium" => Some(SpreadCategory::Medium),
            "large" => Some(SpreadCategory::Large),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenDurationClass {
    SingleTick,
    MultiTick,
}

impl OpenDurationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            OpenDurationClass::SingleTick => "single_tick",
            OpenDurationClass::MultiTick => "multi_tick",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "single_tick" => Some(OpenDurationClass::SingleTick),
            "multi_tick" => Some(OpenDurationClass::MultiTick),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    VolumeSpikeGradual,
    VolumeSpikeInstant,
    PriceDrift,
    OrderVanished,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::VolumeSpikeGradual => "volume_spike_gradual",
            CloseReason::VolumeSpikeInstant => "volume_spike_instant",
            CloseReason::PriceDrift => "price_drift",
            CloseReason::OrderVanished => "order_vanished",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "volume_spike_gradual" => Some(CloseReason::VolumeSpikeGradual),
            "volume_spike_instant" => Some(CloseReason::VolumeSpikeInstant),
            "price_drift" => Some(CloseReason::PriceDrift),
            "order_vanished" => Some(CloseReason::OrderVanished),
            _ => None,
        }
    }
}

/// Four-level opportunity taxonomy. 0 (noise) is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpportunityClass {
    Noise = 0,
    Best = 1,
    Good = 2,
    FastRequired = 3,
    LowValue = 4,
}

impl OpportunityClass {
    pub fn as_i16(self) -> i16 {
        self as i16
    }
}

/// Observables accumulated over an active window's lifetime, consumed by the
/// classifier once a window closes.
#[derive(Debug, Clone, Copy)]
pub struct WindowObservables {
    pub open_duration_class: OpenDurationClass,
    pub trade_event_fired: bool,
    pub volume_change_ticks: u32,
    pub price_shifted: bool,
}

/// Classifier output: the three labels derived from `WindowObservables`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub open_duration_class: OpenDurationClass,
    pub close_reason: Option<CloseReason>,
    pub opportunity_class: OpportunityClass,
}

/// A window event emitted by the Detector: either the opening or the closing
/// half of a window's lifecycle.
#[derive(Debug, Clone)]
pub enum WindowEvent {
    Open(OpenWindowEvent),
    Close(CloseWindowEvent),
}

#[derive(Debug, Clone)]
pub struct OpenWindowEvent {
    pub market_id: MarketId,
    pub opened_at_ns: i64,
    pub opening_yes_ask: Decimal,
    pub opening_no_ask: Decimal,
    pub opening_combined: Decimal,
    pub opening_spread: Decimal,
}

#[derive(Debug, Clone)]
pub struct CloseWindowEvent {
    pub market_id: MarketId,
    pub opened_at_ns: i64,
    pub closed_at_ns: i64,
    pub closing_yes_ask: Decimal,
    pub closing_no_ask: Decimal,
    pub closing_combined: Decimal,
    pub closing_spread: Decimal,
    pub spread_category: SpreadCategory,
    pub classification: Classification,
    pub tick_count: u32,
    pub trade_event_fired: bool,
    pub volume_change_ticks: u32,
    pub detection_latency_us: u64,
}

/// A persisted window row as read back by the query layer. Built by hand in
/// `repository` from primitive columns since several fields are
/// text-encoded enums rather than native Postgres types.
#[derive(Debug, Clone)]
pub struct ClosedWindow {
    pub market_id: MarketId,
    pub opened_at_ns: i64,
    pub closed_at_ns: Option<i64>,
    pub opening_yes_ask: Decimal,
    pub opening_no_ask: Decimal,
    pub opening_combined: Decimal,
    pub opening_spread: Decimal,
    pub closing_yes_ask: Option<Decimal>,
    pub closing_no_ask: Option<Decimal>,
    pub closing_combined: Option<Decimal>,
    pub closing_spread: Option<Decimal>,
    pub spread_category: Option<SpreadCategory>,
    pub open_duration_class: Option<OpenDurationClass>,
    pub close_reason: Option<CloseReason>,
    pub opportunity_class: Option<i16>,
    pub tick_count: i32,
    pub trade_event_fired: Option<bool>,
    pub volume_change_ticks: Option<i32>,
    pub detection_latency_us: Option<i64>,
}

/// A market's rolling statistics row as written by the Aggregator and read
/// back by the query layer. Built by hand in `repository` from individual
/// `class_N_count` columns rather than a native array type.
#[derive(Debug, Clone)]
pub struct PersistedMarketStats {
    pub market_id: MarketId,
    pub window_count: i64,
    pub class_counts: [i64; 5],
    pub avg_duration_ms: f64,
    pub avg_spread: Decimal,
    pub max_spread: Decimal,
    pub noise_ratio: f64,
    pub composite_score: f64,
    pub computed_at: DateTime<Utc>,
}
