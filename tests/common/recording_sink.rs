//! Sink that records what it was given.

use replication_client::sink::{BoxFuture, SinkError};
use replication_client::{EventBatch, EventSink, Position};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct RecordingSink {
    positions: Mutex<Vec<Position>>,
    events: AtomicUsize,
    fail_first: AtomicUsize,
    attempts: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::failing_first(0)
    }

    /// Reject the first `n` applies.
    pub fn failing_first(n: usize) -> Self {
        Self {
            positions: Mutex::new(Vec::new()),
            events: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(n),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Positions of accepted batches, in apply order.
    pub fn positions(&self) -> Vec<Position> {
        self.positions.lock().unwrap().clone()
    }

    pub fn events(&self) -> usize {
        self.events.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl<E: Send + Sync + 'static> EventSink<E> for RecordingSink {
    fn apply<'a>(&'a self, batch: &'a EventBatch<E>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError::from("target unavailable"));
            }
            self.positions.lock().unwrap().push(batch.position.clone());
            self.events.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        })
    }
}
