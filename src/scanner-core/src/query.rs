//! Downstream query surface: the data-access functions an external
//! HTTP/WebSocket layer (out of scope here) would call. Plain async
//! functions over the repository and the live detector/writer handles — no
//! transport of any kind is implemented in this crate.

use chrono::{DateTime, Utc};

use crate::consumer::PendingCounter;
use crate::detector::LatencySnapshot;
use crate::models::{ClosedWindow, Market, MarketId, PersistedMarketStats};
use crate::repository::{Repository, RepositoryError};
use crate::writer::WriterQueue;

#[derive(Debug, Clone)]
pub struct MarketWithStats {
    pub market: Market,
    pub stats: Option<PersistedMarketStats>,
}

/// Every active market paired with the Aggregator's latest rolling stats
/// for it, if any have been computed yet.
pub async fn list_markets_with_stats(repo: &Repository) -> Result<Vec<MarketWithStats>, RepositoryError> {
    let markets = repo.get_active_markets().await?;
    let mut result = Vec::with_capacity(markets.len());
    for market in markets {
        let stats = repo.get_market_stats(market.id).await?;
        result.push(MarketWithStats { market, stats });
    }
    Ok(result)
}

pub async fn list_windows_for_market(repo: &Repository, market_id: MarketId, limit: i64) -> Result<Vec<ClosedWindow>, RepositoryError> {
    repo.list_windows_for_market(market_id, limit).await
}

pub async fn list_recent_closed_windows(repo: &Repository, since: DateTime<Utc>, limit: i64) -> Result<Vec<ClosedWindow>, RepositoryError> {
    repo.list_recent_closed_windows(since, limit).await
}

pub async fn list_open_windows(repo: &Repository) -> Result<Vec<ClosedWindow>, RepositoryError> {
    repo.list_open_windows().await
}

pub fn latency_snapshot(histogram: &crate::detector::LatencyHistogram) -> LatencySnapshot {
    histogram.snapshot()
}

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub feed_connected: bool,
    pub subscribed_count: usize,
    pub hydrated_count: usize,
    pub pending_writes: usize,
    pub pending_writes_total: u64,
    pub p99_latency_us: u64,
}

#[allow(clippy::too_many_arguments)]
pub fn health_snapshot(
    feed_connected: bool,
    subscribed_count: usize,
    hydrated_count: usize,
    writer_queue: &WriterQueue,
    pending: &PendingCounter,
    histogram: &crate::detector::LatencyHistogram,
) -> HealthSnapshot {
    HealthSnapshot {
        feed_connected,
        subscribed_count,
        hydrated_count,
        pending_writes: writer_queue.len(),
        pending_writes_total: pending.total(),
        p99_latency_us: histogram.snapshot().p99_us,
    }
}
