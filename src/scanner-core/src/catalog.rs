//! Upstream catalog client: periodically fetches and filters the candidate
//! market set handed to the Subscription Controller.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{Market, OutcomeResolution};
use crate::repository::Repository;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("catalog response malformed: {0}")]
    Parse(String),
}

/// One page's raw descriptor, matching the upstream catalog's contract:
/// id, title, category, end timestamp, 24h volume, liquidity, outcome
/// labels, and token identifiers.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMarketDescriptor {
    pub id: String,
    pub title: String,
    pub category: String,
    pub end_date: String,
    pub volume_24h: Decimal,
    pub liquidity: Decimal,
    pub outcomes: Vec<String>,
    pub token_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CatalogFilters {
    pub min_volume_24h: Decimal,
    pub min_liquidity: Decimal,
    pub min_expiry: Duration,
    pub max_expiry: Duration,
}

/// Find the YES/NO token split for a descriptor, preferring outcome labels
/// and falling back to the positional convention (index 0 = YES, 1 = NO).
fn resolve_outcomes(outcomes: &[String]) -> ((usize, usize), OutcomeResolution) {
    let yes_pos = outcomes.iter().position(|o| {
        let lower = o.to_lowercase();
        lower == "yes" || lower == "up" || lower.contains("higher") || lower.contains("above")
    });
    let no_pos = outcomes.iter().position(|o| {
        let lower = o.to_lowercase();
        lower == "no" || lower == "down" || lower.contains("lower") || lower.contains("below")
    });
    match (yes_pos, no_pos) {
        (Some(y), Some(n)) if y != n => ((y, n), OutcomeResolution::Labelled),
        _ => ((0, 1), OutcomeResolution::Positional),
    }
}

/// Apply the three admission gates and the YES/NO split to one descriptor.
/// Returns `None` if the descriptor fails any gate or cannot be parsed.
pub fn admit(descriptor: &RawMarketDescriptor, filters: &CatalogFilters, now: DateTime<Utc>) -> Option<Market> {
    let end_time = DateTime::parse_from_rfc3339(&descriptor.end_date)
        .ok()?
        .with_timezone(&Utc);

    let until_expiry = (end_time - now).to_std().ok()?;
    if until_expiry < filters.min_expiry || until_expiry > filters.max_expiry {
        debug!(market = %descriptor.title, "rejected by expiry window gate");
        return None;
    }
    if descriptor.volume_24h < filters.min_volume_24h {
        debug!(market = %descriptor.title, "rejected by volume gate");
        return None;
    }
    if descriptor.liquidity < filters.min_liquidity {
        debug!(market = %descriptor.title, "rejected by liquidity gate");
        return None;
    }

    if descriptor.outcomes.len() != 2 || descriptor.token_ids.len() != 2 {
        debug!(market = %descriptor.title, "rejected: not a binary market");
        return None;
    }

    let ((yes_idx, no_idx), resolution) = resolve_outcomes(&descriptor.outcomes);
    if resolution == OutcomeResolution::Positional {
        debug!(market = %descriptor.title, "outcome labels ambiguous, defaulting to positional YES/NO");
    }

    Some(Market {
        id: Uuid::new_v4(),
        condition_id: descriptor.id.clone(),
        title: descriptor.title.clone(),
        category: descriptor.category.clone(),
        end_time,
        volume_24h: descriptor.volume_24h,
        liquidity: descriptor.liquidity,
        yes_token_id: descriptor.token_ids[yes_idx].clone(),
        no_token_id: descriptor.token_ids[no_idx].clone(),
        is_active: true,
        discovered_at: now,
        updated_at: now,
    })
}

/// HTTP client for the paged catalog endpoint.
pub struct CatalogClient {
    client: Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client builds"),
            base_url,
        }
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<RawMarketDescriptor>, CatalogError> {
        let url = format!("{}/markets", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;
        let descriptors = response.json::<Vec<RawMarketDescriptor>>().await?;
        Ok(descriptors)
    }

    /// Fetch every page, newest/soonest-first as the upstream orders them,
    /// up to a defensive cap so a misbehaving upstream can't loop forever.
    pub async fn fetch_all(&self) -> Result<Vec<RawMarketDescriptor>, CatalogError> {
        const PAGE_SIZE: usize = 200;
        const MAX_MARKETS: usize = 5000;

        let mut all = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.fetch_page(offset, PAGE_SIZE).await?;
            let got = page.len();
            all.extend(page);
            offset += PAGE_SIZE;
            if got < PAGE_SIZE || all.len() >= MAX_MARKETS {
                break;
            }
        }
        Ok(all)
    }
}

/// Periodic fetcher producing the desired market set for the Subscription
/// Controller. Fails soft: a transport error logs and the previous desired
/// set is retained rather than propagated.
pub struct CatalogFetcher {
    client: CatalogClient,
    filters: CatalogFilters,
    repo: Repository,
    last_desired: Mutex<Vec<Market>>,
}

impl CatalogFetcher {
    pub fn new(client: CatalogClient, filters: CatalogFilters, repo: Repository) -> Self {
        Self {
            client,
            filters,
            repo,
            last_desired: Mutex::new(Vec::new()),
        }
    }

    /// Fetch, filter, and persist the admitted markets. A market that fails
    /// to upsert is dropped from the desired set rather than handed to the
    /// Subscription Controller, since `windows`/`open_windows` both carry a
    /// foreign key to `markets`.
    pub async fn refresh(&self) -> Vec<Market> {
        match self.client.fetch_all().await {
            Ok(descriptors) => {
                let now = Utc::now();
                let admitted: Vec<Market> = descriptors
                    .iter()
                    .filter_map(|d| admit(d, &self.filters, now))
                    .collect();
                info!(count = admitted.len(), fetched = descriptors.len(), "catalog refreshed");

                let mut persisted = Vec::with_capacity(admitted.len());
                for market in admitted {
                    match self.repo.upsert_market(&market).await {
                        Ok(_) => persisted.push(market),
                        Err(e) => warn!(market_id = %market.id, error = %e, "failed to persist market, dropping from desired set"),
                    }
                }

                *self.last_desired.lock().expect("catalog mutex poisoned") = persisted.clone();
                persisted
            }
            Err(e) => {
                warn!(error = %e, "catalog fetch failed, retaining previous desired set");
                self.last_desired.lock().expect("catalog mutex poisoned").clone()
            }
        }
    }

    /// The most recently admitted/persisted desired set, used by the pinned
    /// watcher to select which markets in a rolling family should stay
    /// subscribed through a rollover.
    pub fn last_desired(&self) -> Vec<Market> {
        self.last_desired.lock().expect("catalog mutex poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn descriptor(outcomes: Vec<&str>, minutes_to_expiry: i64) -> RawMarketDescriptor {
        RawMarketDescriptor {
            id: "cond-1".into(),
            title: "Will BTC be above 100k?".into(),
            category: "crypto".into(),
            end_date: (Utc::now() + ChronoDuration::minutes(minutes_to_expiry)).to_rfc3339(),
            volume_24h: Decimal::new(50_000, 0),
            liquidity: Decimal::new(10_000, 0),
            outcomes: outcomes.into_iter().map(String::from).collect(),
            token_ids: vec!["tok-yes".into(), "tok-no".into()],
        }
    }

    fn filters() -> CatalogFilters {
        CatalogFilters {
            min_volume_24h: Decimal::new(1_000, 0),
            min_liquidity: Decimal::new(1_000, 0),
            min_expiry: Duration::from_secs(60),
            max_expiry: Duration::from_secs(3600 * 24 * 30),
        }
    }

    #[test]
    fn labelled_outcomes_resolve_by_label_not_position() {
        let d = descriptor(vec!["No", "Yes"], 120);
        let market = admit(&d, &filters(), Utc::now()).unwrap();
        assert_eq!(market.yes_token_id, "tok-no");
        assert_eq!(market.no_token_id, "tok-yes");
    }

    #[test]
    fn ambiguous_outcomes_default_positionally() {
        let d = descriptor(vec!["Team A", "Team B"], 120);
        let market = admit(&d, &filters(), Utc::now()).unwrap();
        assert_eq!(market.yes_token_id, "tok-yes");
        assert_eq!(market.no_token_id, "tok-no");
    }

    #[test]
    fn rejects_outside_expiry_window() {
        let too_soon = descriptor(vec!["Yes", "No"], 1);
        assert!(admit(&too_soon, &filters(), Utc::now()).is_none());

        let too_far = descriptor(vec!["Yes", "No"], 3600 * 24 * 365);
        assert!(admit(&too_far, &filters(), Utc::now()).is_none());
    }

    #[test]
    fn rejects_below_volume_or_liquidity_floor() {
        let mut d = descriptor(vec!["Yes", "No"], 120);
        d.volume_24h = Decimal::new(1, 0);
        assert!(admit(&d, &filters(), Utc::now()).is_none());

        let mut d2 = descriptor(vec!["Yes", "No"], 120);
        d2.liquidity = Decimal::new(1, 0);
        assert!(admit(&d2, &filters(), Utc::now()).is_none());
    }

    #[test]
    fn rejects_non_binary_markets() {
        let d = descriptor(vec!["A", "B", "C"], 120);
        assert!(admit(&d, &filters(), Utc::now()).is_none());
    }
}
