//! Persistence layer: runtime-checked queries against the `markets`,
//! `windows`, and `market_stats` tables.
//!
//! Uses `sqlx::query`/`query_as` with bound parameters rather than the
//! `query!`/`query_as!` compile-time macros: those require either a live
//! database or a committed offline query cache at build time, neither of
//! which this deployment produces. Runtime checking is the documented
//! trade-off (see DESIGN.md).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ClosedWindow, CloseReason, CloseWindowEvent, Market, MarketId, OpenDurationClass, OpenWindowEvent,
    PersistedMarketStats, SpreadCategory,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct Repository {
    pool: PgPool,
}

impl Repository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a market's metadata row, keyed by condition_id.
    pub async fn upsert_market(&self, market: &Market) -> Result<MarketId, RepositoryError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO markets (id, condition_id, title, category, end_time, volume_24h, liquidity, yes_token_id, no_token_id, is_active, discovered_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, true, $10, NOW())
            ON CONFLICT (condition_id) DO UPDATE SET
                title = EXCLUDED.title,
                category = EXCLUDED.category,
                end_time = EXCLUDED.end_time,
                volume_24h = EXCLUDED.volume_24h,
                liquidity = EXCLUDED.liquidity,
                yes_token_id = EXCLUDED.yes_token_id,
                no_token_id = EXCLUDED.no_token_id,
                is_active = true,
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(market.id)
        .bind(&market.condition_id)
        .bind(&market.title)
        .bind(&market.category)
        .bind(market.end_time)
        .bind(market.volume_24h)
        .bind(market.liquidity)
        .bind(&market.yes_token_id)
        .bind(&market.no_token_id)
        .bind(market.discovered_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn deactivate_expired_markets(&self) -> Result<u64, RepositoryError> {
        let result = sqlx::query("UPDATE markets SET is_active = false, updated_at = NOW() WHERE is_active = true AND end_time < $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_active_markets(&self) -> Result<Vec<Market>, RepositoryError> {
        let markets = sqlx::query_as::<_, Market>(
            "SELECT id, condition_id, title, category, end_time, volume_24h, liquidity, yes_token_id, no_token_id, is_active, discovered_at, updated_at \
             FROM markets WHERE is_active = true ORDER BY end_time ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(markets)
    }

    pub async fn get_market_by_condition_id(&self, condition_id: &str) -> Result<Option<Market>, RepositoryError> {
        let market = sqlx::query_as::<_, Market>(
            "SELECT id, condition_id, title, category, end_time, volume_24h, liquidity, yes_token_id, no_token_id, is_active, discovered_at, updated_at \
             FROM markets WHERE condition_id = $1",
        )
        .bind(condition_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(market)
    }

    /// Insert the open half of a window: closed_at and classification start
    /// NULL.
    pub async fn insert_open(&self, event: &OpenWindowEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO windows (market_id, opened_at_ns, opening_yes_ask, opening_no_ask, opening_combined, opening_spread, tick_count)
            VALUES ($1, $2, $3, $4, $5, $6, 1)
            ON CONFLICT (market_id, opened_at_ns) DO NOTHING
            "#,
        )
        .bind(event.market_id)
        .bind(event.opened_at_ns)
        .bind(event.opening_yes_ask)
        .bind(event.opening_no_ask)
        .bind(event.opening_combined)
        .bind(event.opening_spread)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// UPDATE-or-INSERT: try to close the matching open row; if none exists
    /// (lost or reordered Open, or overflow drop), insert a complete row.
    pub async fn upsert_close(&self, event: &CloseWindowEvent) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE windows SET
                closed_at_ns = $3,
                closing_yes_ask = $4,
                closing_no_ask = $5,
                closing_combined = $6,
                closing_spread = $7,
                spread_category = $8,
                open_duration_class = $9,
                close_reason = $10,
                opportunity_class = $11,
                tick_count = $12,
                trade_event_fired = $13,
                volume_change_ticks = $14,
                detection_latency_us = $15
            WHERE market_id = $1 AND opened_at_ns = $2 AND closed_at_ns IS NULL
            "#,
        )
        .bind(event.market_id)
        .bind(event.opened_at_ns)
        .bind(event.closed_at_ns)
        .bind(event.closing_yes_ask)
        .bind(event.closing_no_ask)
        .bind(event.closing_combined)
        .bind(event.closing_spread)
        .bind(event.spread_category.as_str())
        .bind(event.classification.open_duration_class.as_str())
        .bind(event.classification.close_reason.map(CloseReason::as_str))
        .bind(event.classification.opportunity_class.as_i16())
        .bind(event.tick_count as i32)
        .bind(event.trade_event_fired)
        .bind(event.volume_change_ticks as i32)
        .bind(event.detection_latency_us as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO windows (
                    market_id, opened_at_ns, closed_at_ns,
                    opening_yes_ask, opening_no_ask, opening_combined, opening_spread,
                    closing_yes_ask, closing_no_ask, closing_combined, closing_spread,
                    spread_category, open_duration_class, close_reason, opportunity_class,
                    tick_count, trade_event_fired, volume_change_ticks, detection_latency_us
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                ON CONFLICT (market_id, opened_at_ns) DO NOTHING
                "#,
            )
            .bind(event.market_id)
            .bind(event.opened_at_ns)
            .bind(event.closed_at_ns)
            .bind(event.closing_yes_ask)
            .bind(event.closing_no_ask)
            .bind(event.closing_combined)
            .bind(event.closing_spread)
            .bind(event.spread_category.as_str())
            .bind(event.classification.open_duration_class.as_str())
            .bind(event.classification.close_reason.map(CloseReason::as_str))
            .bind(event.classification.opportunity_class.as_i16())
            .bind(event.tick_count as i32)
            .bind(event.trade_event_fired)
            .bind(event.volume_change_ticks as i32)
            .bind(event.detection_latency_us as i64)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    fn row_to_closed_window(row: sqlx::postgres::PgRow) -> Result<ClosedWindow, RepositoryError> {
        Ok(ClosedWindow {
            market_id: row.try_get("market_id")?,
            opened_at_ns: row.try_get("opened_at_ns")?,
            closed_at_ns: row.try_get("closed_at_ns")?,
            opening_yes_ask: row.try_get("opening_yes_ask")?,
            opening_no_ask: row.try_get("opening_no_ask")?,
            opening_combined: row.try_get("opening_combined")?,
            opening_spread: row.try_get("opening_spread")?,
            closing_yes_ask: row.try_get("closing_yes_ask")?,
            closing_no_ask: row.try_get("closing_no_ask")?,
            closing_combined: row.try_get("closing_combined")?,
            closing_spread: row.try_get("closing_spread")?,
            spread_category: row.try_get::<Option<String>, _>("spread_category")?.and_then(|s| SpreadCategory::parse(&s)),
            open_duration_class: row
                .try_get::<Option<String>, _>("open_duration_class")?
                .and_then(|s| OpenDurationClass::parse(&s)),
            close_reason: row.try_get::<Option<String>, _>("close_reason")?.and_then(|s| CloseReason::parse(&s)),
            opportunity_class: row.try_get("opportunity_class")?,
            tick_count: row.try_get("tick_count")?,
            trade_event_fired: row.try_get("trade_event_fired")?,
            volume_change_ticks: row.try_get("volume_change_ticks")?,
            detection_latency_us: row.try_get("detection_latency_us")?,
        })
    }

    pub async fn list_windows_for_market(&self, market_id: MarketId, limit: i64) -> Result<Vec<ClosedWindow>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM windows WHERE market_id = $1 ORDER BY opened_at_ns DESC LIMIT $2",
        )
        .bind(market_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_closed_window).collect()
    }

    pub async fn list_recent_closed_windows(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<ClosedWindow>, RepositoryError> {
        let since_ns = since.timestamp_nanos_opt().unwrap_or(0);
        let rows = sqlx::query(
            "SELECT * FROM windows WHERE closed_at_ns IS NOT NULL AND closed_at_ns >= $1 ORDER BY closed_at_ns DESC LIMIT $2",
        )
        .bind(since_ns)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_closed_window).collect()
    }

    pub async fn list_open_windows(&self) -> Result<Vec<ClosedWindow>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM windows WHERE closed_at_ns IS NULL ORDER BY opened_at_ns ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_closed_window).collect()
    }

    /// Upsert one market's rolling statistics row (computed by the
    /// Aggregator).
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_market_stats(
        &self,
        market_id: MarketId,
        window_count: i64,
        class_counts: [i64; 5],
        avg_duration_ms: f64,
        avg_spread: Decimal,
        max_spread: Decimal,
        noise_ratio: f64,
        composite_score: f64,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO market_stats (
                market_id, window_count, class_0_count, class_1_count, class_2_count, class_3_count, class_4_count,
                avg_duration_ms, avg_spread, max_spread, noise_ratio, composite_score, computed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
            ON CONFLICT (market_id) DO UPDATE SET
                window_count = EXCLUDED.window_count,
                class_0_count = EXCLUDED.class_0_count,
                class_1_count = EXCLUDED.class_1_count,
                class_2_count = EXCLUDED.class_2_count,
                class_3_count = EXCLUDED.class_3_count,
                class_4_count = EXCLUDED.class_4_count,
                avg_duration_ms = EXCLUDED.avg_duration_ms,
                avg_spread = EXCLUDED.avg_spread,
                max_spread = EXCLUDED.max_spread,
                noise_ratio = EXCLUDED.noise_ratio,
                composite_score = EXCLUDED.composite_score,
                computed_at = NOW()
            "#,
        )
        .bind(market_id)
        .bind(window_count)
        .bind(class_counts[0])
        .bind(class_counts[1])
        .bind(class_counts[2])
        .bind(class_counts[3])
        .bind(class_counts[4])
        .bind(avg_duration_ms)
        .bind(avg_spread)
        .bind(max_spread)
        .bind(noise_ratio)
        .bind(composite_score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn row_to_market_stats(row: sqlx::postgres::PgRow) -> Result<PersistedMarketStats, RepositoryError> {
        Ok(PersistedMarketStats {
            market_id: row.try_get("market_id")?,
            window_count: row.try_get("window_count")?,
            class_counts: [
                row.try_get("class_0_count")?,
                row.try_get("class_1_count")?,
                row.try_get("class_2_count")?,
                row.try_get("class_3_count")?,
                row.try_get("class_4_count")?,
            ],
            avg_duration_ms: row.try_get("avg_duration_ms")?,
            avg_spread: row.try_get("avg_spread")?,
            max_spread: row.try_get("max_spread")?,
            noise_ratio: row.try_get("noise_ratio")?,
            composite_score: row.try_get("composite_score")?,
            computed_at: row.try_get("computed_at")?,
        })
    }

    /// One market's latest rolling statistics, or `None` if the Aggregator
    /// hasn't computed a row for it yet.
    pub async fn get_market_stats(&self, market_id: MarketId) -> Result<Option<PersistedMarketStats>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM market_stats WHERE market_id = $1")
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_market_stats).transpose()
    }

    pub async fn list_market_stats(&self) -> Result<Vec<PersistedMarketStats>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM market_stats").fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_market_stats).collect()
    }
}
