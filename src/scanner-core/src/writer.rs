//! Bounded writer queue and the persistence task that drains it.
//!
//! A plain `mpsc::channel` cannot selectively evict older entries once full;
//! the overflow policy here (favour closes over opens) needs random-access
//! removal from the front of a deque, so the queue is hand-rolled instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use crate::models::{CloseWindowEvent, OpenWindowEvent, WindowEvent};
use crate::repository::{Repository, RepositoryError};

/// A queued persistence instruction. Opens are evicted in preference to
/// closes when the queue is full; closes carry the complete observables and
/// are cheap to insert standalone via UPDATE-or-INSERT.
#[derive(Debug, Clone)]
pub enum WriterMsg {
    Open(OpenWindowEvent),
    Close(CloseWindowEvent),
}

impl From<WindowEvent> for WriterMsg {
    fn from(event: WindowEvent) -> Self {
        match event {
            WindowEvent::Open(e) => WriterMsg::Open(e),
            WindowEvent::Close(e) => WriterMsg::Close(e),
        }
    }
}

struct Inner {
    queue: VecDeque<WriterMsg>,
    capacity: usize,
    dropped_opens: u64,
}

/// Bounded, large (thousands of entries) queue between the Window Consumer
/// and the Persistence Writer task.
pub struct WriterQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WriterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                dropped_opens: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Push a message, evicting the oldest queued Open on overflow. If the
    /// queue is full of Closes only, the new message is dropped and counted
    /// the same way (closes-only degradation, per the overflow policy).
    pub fn push(&self, msg: WriterMsg) {
        let mut inner = self.inner.lock().expect("writer queue mutex poisoned");
        if inner.queue.len() >= inner.capacity {
            if let Some(pos) = inner.queue.iter().position(|m| matches!(m, WriterMsg::Open(_))) {
                inner.queue.remove(pos);
                inner.dropped_opens += 1;
            } else {
                warn!("writer queue full of closes; dropping incoming message");
                inner.dropped_opens += 1;
                return;
            }
        }
        inner.queue.push_back(msg);
        drop(inner);
        self.notify.notify_one();
    }

    async fn pop(&self) -> WriterMsg {
        loop {
            {
                let mut inner = self.inner.lock().expect("writer queue mutex poisoned");
                if let Some(msg) = inner.queue.pop_front() {
                    return msg;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("writer queue mutex poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_opens(&self) -> u64 {
        self.inner.lock().expect("writer queue mutex poisoned").dropped_opens
    }
}

/// Drains the queue forever, applying the UPDATE-or-INSERT pairing policy.
/// Runs in its own task so that the hot path never blocks on store I/O.
pub struct PersistenceWriter {
    repo: Repository,
    overflow_events: AtomicU64,
}

impl PersistenceWriter {
    pub fn new(repo: Repository) -> Self {
        Self {
            repo,
            overflow_events: AtomicU64::new(0),
        }
    }

    pub async fn run(&self, queue: &WriterQueue, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = queue.pop() => {
                    if let Err(e) = self.apply(msg).await {
                        warn!(error = %e, "persistence write failed");
                    }
                    let dropped = queue.dropped_opens();
                    if dropped > self.overflow_events.swap(dropped, Ordering::Relaxed) {
                        warn!(dropped_opens = dropped, "writer queue overflow: opens dropped in favour of closes");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn apply(&self, msg: WriterMsg) -> Result<(), RepositoryError> {
        match msg {
            WriterMsg::Open(event) => self.repo.insert_open(&event).await,
            WriterMsg::Close(event) => self.repo.upsert_close(&event).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn open_msg(market_id: uuid::Uuid) -> WriterMsg {
        WriterMsg::Open(OpenWindowEvent {
            market_id,
            opened_at_ns: 1,
            opening_yes_ask: Decimal::new(45, 2),
            opening_no_ask: Decimal::new(50, 2),
            opening_combined: Decimal::new(95, 2),
            opening_spread: Decimal::new(5, 2),
        })
    }

    fn close_msg(market_id: uuid::Uuid) -> WriterMsg {
        use crate::classifier::classify;
        use crate::models::{OpenDurationClass, SpreadCategory, WindowObservables};
        let classification = classify(WindowObservables {
            open_duration_class: OpenDurationClass::MultiTick,
            trade_event_fired: true,
            volume_change_ticks: 2,
            price_shifted: false,
        });
        WriterMsg::Close(CloseWindowEvent {
            market_id,
            opened_at_ns: 1,
            closed_at_ns: 2,
            closing_yes_ask: Decimal::new(45, 2),
            closing_no_ask: Decimal::new(49, 2),
            closing_combined: Decimal::new(94, 2),
            closing_spread: Decimal::new(6, 2),
            spread_category: SpreadCategory::classify(Decimal::new(6, 2)),
            classification,
            tick_count: 3,
            trade_event_fired: true,
            volume_change_ticks: 2,
            detection_latency_us: 100,
        })
    }

    #[test]
    fn overflow_evicts_oldest_open_before_dropping_closes() {
        let queue = WriterQueue::new(2);
        queue.push(open_msg(Uuid::new_v4()));
        queue.push(close_msg(Uuid::new_v4()));
        assert_eq!(queue.len(), 2);

        queue.push(close_msg(Uuid::new_v4()));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_opens(), 1);

        let _ = Utc::now();
    }

    #[tokio::test]
    async fn pop_waits_until_a_message_is_pushed() {
        let queue = WriterQueue::new(4);
        queue.push(close_msg(Uuid::new_v4()));
        let msg = queue.pop().await;
        assert!(matches!(msg, WriterMsg::Close(_)));
    }
}
