//! Subscription Controller (C8): reconciles the Catalog Fetcher's desired
//! market set with what the Store and Feed Connector currently watch, plus
//! a faster-cadence watcher for short-lifetime "pinned" market families.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

use crate::detector::DetectorInput;
use crate::models::{Market, MarketId, TokenId};
use crate::store::MarketStore;

/// Instructs the Feed Connector task to add or drop tokens from the live
/// subscription. Processed strictly in send order relative to frame reads.
#[derive(Debug, Clone)]
pub enum FeedControl {
    Subscribe(Vec<TokenId>),
    Unsubscribe(Vec<TokenId>),
}

pub struct SubscriptionController {
    store: Arc<MarketStore>,
    feed_control: mpsc::Sender<FeedControl>,
    removal: mpsc::Sender<DetectorInput>,
    watched: HashMap<String, Market>,
}

impl SubscriptionController {
    pub fn new(store: Arc<MarketStore>, feed_control: mpsc::Sender<FeedControl>, removal: mpsc::Sender<DetectorInput>) -> Self {
        Self {
            store,
            feed_control,
            removal,
            watched: HashMap::new(),
        }
    }

    /// Reconcile the desired set against what's watched. `to_add` is
    /// inserted into the Store then subscribed; `to_remove` is unsubscribed
    /// then removed from the Store — that order is mandatory so the token
    /// reverse map is still available when the unsubscribe frame is built.
    pub async fn reconcile(&mut self, desired: Vec<Market>) {
        let desired_ids: HashSet<String> = desired.iter().map(|m| m.condition_id.clone()).collect();
        let current_ids: HashSet<String> = self.watched.keys().cloned().collect();

        let to_add: Vec<Market> = desired
            .into_iter()
            .filter(|m| !current_ids.contains(&m.condition_id))
            .collect();
        let to_remove: Vec<Market> = self
            .watched
            .iter()
            .filter(|(id, m)| !desired_ids.contains(*id) && !self.store.is_pinned(m.id))
            .map(|(_, m)| m.clone())
            .collect();

        if !to_add.is_empty() {
            let tokens: Vec<TokenId> = to_add
                .iter()
                .flat_map(|m| [m.yes_token_id.clone(), m.no_token_id.clone()])
                .collect();
            for market in &to_add {
                self.store.insert_market(market.clone());
                self.watched.insert(market.condition_id.clone(), market.clone());
            }
            info!(count = to_add.len(), "subscribing to new markets");
            let _ = self.feed_control.send(FeedControl::Subscribe(tokens)).await;
        }

        if !to_remove.is_empty() {
            let tokens: Vec<TokenId> = to_remove
                .iter()
                .flat_map(|m| [m.yes_token_id.clone(), m.no_token_id.clone()])
                .collect();
            info!(count = to_remove.len(), "unsubscribing expired markets");
            let _ = self.feed_control.send(FeedControl::Unsubscribe(tokens)).await;
            for market in &to_remove {
                self.watched.remove(&market.condition_id);
                self.store.remove_market(market.id);
                let _ = self.removal.send(DetectorInput::Remove(market.id)).await;
            }
        }
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// The complete watched token set, used to resubscribe after a
    /// reconnect.
    pub fn all_tokens(&self) -> Vec<TokenId> {
        self.watched
            .values()
            .flat_map(|m| [m.yes_token_id.clone(), m.no_token_id.clone()])
            .collect()
    }
}

/// A family of recurring short-lifetime markets sharing a prefix, e.g. a
/// rolling 5-minute series. `current` is the nearest-future member;
/// `previous` members stay watched for a grace period past their expiry so
/// rollovers never leave a coverage gap.
#[derive(Debug, Clone, Copy)]
pub struct PinnedWatcherConfig {
    pub pre_subscribe_lead: Duration,
    pub unsubscribe_grace: Duration,
}

impl Default for PinnedWatcherConfig {
    fn default() -> Self {
        Self {
            pre_subscribe_lead: Duration::from_secs(30),
            unsubscribe_grace: Duration::from_secs(60),
        }
    }
}

/// Selects, per pinned prefix, which candidate markets should be pinned:
/// the current soonest-future member, plus the next member once within the
/// pre-subscribe lead, plus any just-expired member still within its grace
/// window.
pub fn select_pinned(
    prefixes: &[String],
    candidates: &[Market],
    now: DateTime<Utc>,
    config: PinnedWatcherConfig,
) -> HashSet<MarketId> {
    let mut pinned = HashSet::new();

    for prefix in prefixes {
        let mut family: Vec<&Market> = candidates.iter().filter(|m| m.title.starts_with(prefix.as_str())).collect();
        family.sort_by_key(|m| m.end_time);

        let current = family.iter().find(|m| m.end_time > now);
        if let Some(current) = current {
            pinned.insert(current.id);

            let lead = chrono::Duration::from_std(config.pre_subscribe_lead).unwrap_or_default();
            if current.end_time - now <= lead {
                if let Some(next) = family.iter().find(|m| m.end_time > current.end_time) {
                    pinned.insert(next.id);
                }
            }
        }

        let grace = chrono::Duration::from_std(config.unsubscribe_grace).unwrap_or_default();
        for member in &family {
            if member.end_time <= now && now - member.end_time <= grace {
                pinned.insert(member.id);
            }
        }
    }

    pinned
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn market(title: &str, minutes_from_now: i64) -> Market {
        Market {
            id: Uuid::new_v4(),
            condition_id: title.to_string(),
            title: title.to_string(),
            category: "crypto".into(),
            end_time: Utc::now() + chrono::Duration::minutes(minutes_from_now),
            volume_24h: Decimal::new(10_000, 0),
            liquidity: Decimal::new(10_000, 0),
            yes_token_id: format!("{title}-yes"),
            no_token_id: format!("{title}-no"),
            is_active: true,
            discovered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reconcile_adds_before_removes_in_separate_ordered_steps() {
        let store = Arc::new(MarketStore::new());
        let (feed_tx, mut feed_rx) = mpsc::channel(8);
        let (removal_tx, _removal_rx) = mpsc::channel(8);
        let mut controller = SubscriptionController::new(store.clone(), feed_tx, removal_tx);

        let m1 = market("BTC-5m-1", 5);
        controller.reconcile(vec![m1.clone()]).await;
        assert!(matches!(feed_rx.recv().await.unwrap(), FeedControl::Subscribe(_)));
        assert_eq!(controller.watched_count(), 1);
        assert!(store.get_market_for_token(&m1.yes_token_id).is_some());

        controller.reconcile(vec![]).await;
        assert!(matches!(feed_rx.recv().await.unwrap(), FeedControl::Unsubscribe(_)));
        assert_eq!(controller.watched_count(), 0);
        assert!(store.get_market_for_token(&m1.yes_token_id).is_none());
    }

    #[tokio::test]
    async fn pinned_markets_are_never_in_to_remove() {
        let store = Arc::new(MarketStore::new());
        let (feed_tx, mut feed_rx) = mpsc::channel(8);
        let (removal_tx, _removal_rx) = mpsc::channel(8);
        let mut controller = SubscriptionController::new(store.clone(), feed_tx, removal_tx);

        let m1 = market("BTC-5m-1", 5);
        controller.reconcile(vec![m1.clone()]).await;
        let _ = feed_rx.recv().await;
        store.pin(m1.id);

        controller.reconcile(vec![]).await;
        // No unsubscribe should be sent since the only watched market is pinned.
        assert!(feed_rx.try_recv().is_err());
        assert_eq!(controller.watched_count(), 1);
    }

    #[test]
    fn select_pinned_keeps_current_and_pre_subscribes_next_near_rollover() {
        let prefix = "BTC 5m".to_string();
        let current = market("BTC 5m #1", 0);
        let next = market("BTC 5m #2", 5);
        let candidates = vec![current.clone(), next.clone()];

        let far_config = PinnedWatcherConfig {
            pre_subscribe_lead: Duration::from_secs(5),
            unsubscribe_grace: Duration::from_secs(60),
        };
        let pinned = select_pinned(&[prefix.clone()], &candidates, Utc::now(), far_config);
        assert!(pinned.contains(&current.id));
        assert!(!pinned.contains(&next.id));

        let near_config = PinnedWatcherConfig {
            pre_subscribe_lead: Duration::from_secs(600),
            unsubscribe_grace: Duration::from_secs(60),
        };
        let pinned_near = select_pinned(&[prefix], &candidates, Utc::now(), near_config);
        assert!(pinned_near.contains(&current.id));
        assert!(pinned_near.contains(&next.id));
    }

    #[test]
    fn select_pinned_keeps_just_expired_member_within_grace() {
        let prefix = "BTC 5m".to_string();
        let expired = market("BTC 5m #1", -1);
        let candidates = vec![expired.clone()];
        let config = PinnedWatcherConfig {
            pre_subscribe_lead: Duration::from_secs(30),
            unsubscribe_grace: Duration::from_secs(300),
        };
        let pinned = select_pinned(&[prefix], &candidates, Utc::now(), config);
        assert!(pinned.contains(&expired.id));
    }
}
