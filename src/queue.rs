//! Bounded backpressure queue between the I/O task and the consumer.
//!
//! # Flow Control
//!
//! ```text
//! socket ──▶ I/O task ──push().await──▶ [ bounded mpsc ] ──poll(timeout)──▶ consumer
//!              ▲                              │
//!              └── blocks while full ─────────┘
//! ```
//!
//! When the queue is full the producer's `push` awaits. The I/O task stops
//! reading the socket, the kernel receive buffer fills and TCP flow control
//! slows the server down. Nothing is dropped because of a full queue.
//!
//! On reconnect the whole queue is replaced. Dropping the old
//! [`BackpressureQueue`] makes any stale producer's `push` fail with
//! [`ClientError::Shutdown`], which ends the stale I/O task.

use crate::batch::EventBatch;
use crate::error::{ClientError, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Producer half. Cloneable; owned by the I/O task.
#[derive(Debug)]
pub struct QueueProducer<E> {
    tx: mpsc::Sender<EventBatch<E>>,
}

impl<E> Clone for QueueProducer<E> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<E> QueueProducer<E> {
    /// Enqueue a batch, waiting while the queue is full.
    ///
    /// Fails with `Shutdown` once the consumer side has been dropped.
    pub async fn push(&self, batch: EventBatch<E>) -> Result<()> {
        self.tx.send(batch).await.map_err(|_| ClientError::Shutdown)
    }

    /// Whether the consumer side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct BackpressureQueue<E> {
    rx: mpsc::Receiver<EventBatch<E>>,
    capacity: usize,
}

impl<E> BackpressureQueue<E> {
    /// Create a bounded queue. A zero capacity is raised to 1.
    pub fn bounded(capacity: usize) -> (QueueProducer<E>, BackpressureQueue<E>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        (QueueProducer { tx }, BackpressureQueue { rx, capacity })
    }

    /// Wait up to `timeout` for the next batch.
    ///
    /// - `Ok(Some(batch))`: a batch was available
    /// - `Ok(None)`: timed out
    /// - `Err(Shutdown)`: every producer is gone and the queue is drained
    pub async fn poll(&mut self, timeout: Duration) -> Result<Option<EventBatch<E>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(batch)) => Ok(Some(batch)),
            Ok(None) => Err(ClientError::Shutdown),
            Err(_) => Ok(None),
        }
    }

    /// Take a batch without waiting.
    pub fn try_poll(&mut self) -> Option<EventBatch<E>> {
        self.rx.try_recv().ok()
    }

    /// Batches currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Close the queue and throw away whatever is buffered.
    ///
    /// Returns the number of discarded batches. Producers blocked in `push`
    /// are released with `Shutdown`.
    pub fn drain_discard(&mut self) -> usize {
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Discarded buffered batches on queue teardown");
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    fn batch(n: u64) -> EventBatch<u64> {
        EventBatch::new(vec![n], Position::binlog("binlog.000001", n))
    }

    #[tokio::test]
    async fn test_push_then_poll_in_order() {
        let (tx, mut rx) = BackpressureQueue::bounded(8);
        for i in 0..5 {
            tx.push(batch(i)).await.unwrap();
        }
        assert_eq!(rx.len(), 5);

        for i in 0..5 {
            let b = rx.poll(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(b.events, vec![i]);
        }
        assert!(rx.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout_returns_none() {
        let (_tx, mut rx) = BackpressureQueue::<u64>::bounded(1);
        let got = rx.poll(Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_poll_after_producers_dropped() {
        let (tx, mut rx) = BackpressureQueue::bounded(4);
        tx.push(batch(1)).await.unwrap();
        drop(tx);

        // Buffered batch still delivered
        assert!(rx.poll(Duration::from_millis(10)).await.unwrap().is_some());
        // Then shutdown
        assert!(matches!(
            rx.poll(Duration::from_millis(10)).await,
            Err(ClientError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_push_blocks_when_full() {
        let (tx, mut rx) = BackpressureQueue::bounded(1);
        tx.push(batch(1)).await.unwrap();

        let tx2 = tx.clone();
        let blocked = tokio::spawn(async move { tx2.push(batch(2)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished(), "push should wait for a free slot");

        let first = rx.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.events, vec![1]);

        blocked.await.unwrap().unwrap();
        let second = rx.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(second.events, vec![2]);
    }

    #[tokio::test]
    async fn test_push_fails_when_consumer_dropped() {
        let (tx, rx) = BackpressureQueue::bounded(2);
        drop(rx);
        assert!(tx.is_closed());
        assert!(matches!(tx.push(batch(1)).await, Err(ClientError::Shutdown)));
    }

    #[tokio::test]
    async fn test_drain_discard_releases_blocked_producer() {
        let (tx, mut rx) = BackpressureQueue::bounded(1);
        tx.push(batch(1)).await.unwrap();

        let tx2 = tx.clone();
        let blocked = tokio::spawn(async move { tx2.push(batch(2)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(rx.drain_discard(), 1);
        assert!(matches!(blocked.await.unwrap(), Err(ClientError::Shutdown)));
    }

    #[test]
    fn test_zero_capacity_raised() {
        let (_tx, rx) = BackpressureQueue::<u64>::bounded(0);
        assert_eq!(rx.capacity(), 1);
    }
}
