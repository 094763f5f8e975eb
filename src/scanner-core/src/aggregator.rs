//! Aggregator (C9): scheduled consumer of persisted windows that computes
//! rolling per-market statistics and a composite ranking score.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::info;

use crate::detector::DiscardedPendingCounter;
use crate::models::{ClosedWindow, MarketId};
use crate::repository::{Repository, RepositoryError};

/// Weights applied to each opportunity class when computing the composite
/// score: class 1 counts double, class 2 counts one-and-a-half, everything
/// else counts once.
fn class_weight(opportunity_class: i16) -> f64 {
    match opportunity_class {
        1 => 2.0,
        2 => 1.5,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MarketStats {
    pub window_count: i64,
    pub class_counts: [i64; 5],
    pub avg_duration_ms: f64,
    pub avg_spread: Decimal,
    pub max_spread: Decimal,
    pub noise_ratio: f64,
    pub composite_score: f64,
}

/// Compute one market's rolling stats from its closed windows within the
/// lookback window, plus the number of discarded single-tick observations
/// that never reached Open (used for the noise ratio).
pub fn compute_stats(windows: &[ClosedWindow], discarded_pending_count: i64) -> MarketStats {
    let closed: Vec<&ClosedWindow> = windows.iter().filter(|w| w.closed_at_ns.is_some()).collect();
    let window_count = closed.len() as i64;
    if window_count == 0 {
        let total_observations = discarded_pending_count.max(1);
        return MarketStats {
            noise_ratio: discarded_pending_count as f64 / total_observations as f64,
            ..Default::default()
        };
    }

    let mut class_counts = [0i64; 5];
    let mut total_duration_ms = 0.0f64;
    let mut total_spread = Decimal::ZERO;
    let mut max_spread = Decimal::ZERO;
    let mut weighted_score_sum = 0.0f64;

    for w in &closed {
        let class = w.opportunity_class.unwrap_or(0);
        if (0..5).contains(&class) {
            class_counts[class as usize] += 1;
        }
        if let Some(closed_at) = w.closed_at_ns {
            total_duration_ms += (closed_at - w.opened_at_ns) as f64 / 1_000_000.0;
        }
        if let Some(spread) = w.closing_spread {
            total_spread += spread;
            if spread > max_spread {
                max_spread = spread;
            }
        }
        weighted_score_sum += class_weight(class);
    }

    let avg_duration_ms = total_duration_ms / window_count as f64;
    let avg_spread = total_spread / Decimal::from(window_count);
    let total_observations = window_count + discarded_pending_count;
    let noise_ratio = if total_observations > 0 {
        discarded_pending_count as f64 / total_observations as f64
    } else {
        0.0
    };

    let normalised_weight = weighted_score_sum / window_count as f64;
    let spread_component = avg_spread.to_string().parse::<f64>().unwrap_or(0.0);
    let composite_score = normalised_weight * (1.0 + spread_component) * (1.0 - noise_ratio).max(0.0);

    MarketStats {
        window_count,
        class_counts,
        avg_duration_ms,
        avg_spread,
        max_spread,
        noise_ratio,
        composite_score,
    }
}

pub struct Aggregator {
    repo: Repository,
    discarded_pending: DiscardedPendingCounter,
}

impl Aggregator {
    pub fn new(repo: Repository, discarded_pending: DiscardedPendingCounter) -> Self {
        Self { repo, discarded_pending }
    }

    /// Scan the last 24h of persisted windows and upsert `market_stats` for
    /// every market seen.
    pub async fn run_once(&self) -> Result<usize, RepositoryError> {
        let since = Utc::now() - ChronoDuration::hours(24);
        let windows = self.repo.list_recent_closed_windows(since, 100_000).await?;
        let discarded = self.discarded_pending.snapshot();

        let mut by_market: HashMap<MarketId, Vec<ClosedWindow>> = HashMap::new();
        for w in windows {
            by_market.entry(w.market_id).or_default().push(w);
        }

        let market_count = by_market.len();
        for (market_id, windows) in by_market {
            let discarded_count = discarded.get(&market_id).copied().unwrap_or(0) as i64;
            let stats = compute_stats(&windows, discarded_count);
            self.repo
                .upsert_market_stats(
                    market_id,
                    stats.window_count,
                    stats.class_counts,
                    stats.avg_duration_ms,
                    stats.avg_spread,
                    stats.max_spread,
                    stats.noise_ratio,
                    stats.composite_score,
                )
                .await?;
        }
        info!(markets = market_count, "aggregator pass complete");
        Ok(market_count)
    }
}
