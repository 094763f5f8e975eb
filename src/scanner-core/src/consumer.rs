//! Window Consumer (C6): drains the Detector's output and fans it out to
//! the Persistence Writer (mandatory) and any live subscribers (best
//! effort, never backpressured).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::models::WindowEvent;
use crate::writer::{WriterMsg, WriterQueue};

/// Monotonically-non-decreasing count of entries ever handed to the writer
/// queue. The writer queue's own `len()` is the live backlog figure; this
/// counter is the lifetime total the health endpoint reports alongside it.
#[derive(Clone, Default)]
pub struct PendingCounter(Arc<AtomicU64>);

impl PendingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct WindowConsumer {
    events: mpsc::Receiver<WindowEvent>,
    writer_queue: Arc<WriterQueue>,
    broadcast_tx: broadcast::Sender<WindowEvent>,
    pending: PendingCounter,
}

impl WindowConsumer {
    pub fn new(
        events: mpsc::Receiver<WindowEvent>,
        writer_queue: Arc<WriterQueue>,
        broadcast_tx: broadcast::Sender<WindowEvent>,
        pending: PendingCounter,
    ) -> Self {
        Self {
            events,
            writer_queue,
            broadcast_tx,
            pending,
        }
    }

    /// Run until the Detector's sender is dropped (shutdown).
    pub async fn run(&mut self) {
        while let Some(event) = self.events.recv().await {
            self.writer_queue.push(WriterMsg::from(event.clone()));
            self.pending.increment();

            // Best-effort fan-out: a `send` error just means there are no
            // live subscribers right now, which is not a failure.
            if self.broadcast_tx.receiver_count() > 0 {
                if let Err(e) = self.broadcast_tx.send(event) {
                    warn!(error = %e, "broadcast fan-out failed despite live receivers");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpenWindowEvent;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn sample_event() -> WindowEvent {
        WindowEvent::Open(OpenWindowEvent {
            market_id: Uuid::new_v4(),
            opened_at_ns: 1,
            opening_yes_ask: Decimal::new(45, 2),
            opening_no_ask: Decimal::new(50, 2),
            opening_combined: Decimal::new(95, 2),
            opening_spread: Decimal::new(5, 2),
        })
    }

    #[tokio::test]
    async fn forwards_to_writer_and_increments_pending_total() {
        let (tx, rx) = mpsc::channel(8);
        let (btx, mut brx) = broadcast::channel(8);
        let queue = Arc::new(WriterQueue::new(16));
        let pending = PendingCounter::new();
        let mut consumer = WindowConsumer::new(rx, queue.clone(), btx, pending.clone());

        tx.send(sample_event()).await.unwrap();
        drop(tx);
        consumer.run().await;

        assert_eq!(queue.len(), 1);
        assert_eq!(pending.total(), 1);
        assert!(brx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_or_absent_subscribers_never_block_the_producer() {
        let (tx, rx) = mpsc::channel(8);
        let (btx, _brx_dropped_immediately) = broadcast::channel(1);
        let queue = Arc::new(WriterQueue::new(16));
        let pending = PendingCounter::new();
        let mut consumer = WindowConsumer::new(rx, queue.clone(), btx, pending);

        for _ in 0..5 {
            tx.send(sample_event()).await.unwrap();
        }
        drop(tx);
        consumer.run().await;

        assert_eq!(queue.len(), 5);
    }
}
