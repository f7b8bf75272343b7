// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Downstream sink integration.
//!
//! The dispatch loop hands every polled batch to an [`EventSink`]. The
//! sink is where change events turn into side effects: rows written to a
//! target database, messages published to a broker, a search index
//! updated. The client never interprets what the sink does; it only
//! needs to know whether the batch was applied.
//!
//! # Example
//!
//! ```rust,no_run
//! use replication_client::batch::EventBatch;
//! use replication_client::sink::{BoxFuture, EventSink, SinkError};
//!
//! struct PrintSink;
//!
//! impl EventSink<String> for PrintSink {
//!     fn apply<'a>(&'a self, batch: &'a EventBatch<String>) -> BoxFuture<'a, ()> {
//!         Box::pin(async move {
//!             for event in &batch.events {
//!                 println!("{} @ {}", event, batch.position);
//!             }
//!             Ok(())
//!         })
//!     }
//! }
//! ```

use crate::batch::EventBatch;
use std::future::Future;
use std::pin::Pin;

/// Result type for sink operations.
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = SinkResult<T>> + Send + 'a>>;

/// Simplified error for sink operations.
#[derive(Debug, Clone)]
pub struct SinkError(pub String);

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for SinkError {}

impl From<String> for SinkError {
    fn from(s: String) -> Self {
        SinkError(s)
    }
}

impl From<&str> for SinkError {
    fn from(s: &str) -> Self {
        SinkError(s.to_string())
    }
}

/// Consumer of decoded batches.
///
/// `apply` must be idempotent per batch: after a crash or reconnect the
/// same batch may be delivered again, and a rejected batch is retried.
pub trait EventSink<E>: Send + Sync + 'static {
    /// Apply every event in `batch`, in order.
    fn apply<'a>(&'a self, batch: &'a EventBatch<E>) -> BoxFuture<'a, ()>;

    /// Whether the sink can take more work right now.
    ///
    /// The dispatcher stops polling while this returns `false`, which
    /// lets the queue fill and pushes backpressure onto the socket.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Sink that accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpSink;

impl<E: Send + Sync + 'static> EventSink<E> for NoOpSink {
    fn apply<'a>(&'a self, _batch: &'a EventBatch<E>) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Position;

    #[tokio::test]
    async fn test_noop_sink_accepts() {
        let sink = NoOpSink;
        let batch = EventBatch::new(vec![1u8, 2, 3], Position::binlog("binlog.000001", 4));
        assert!(sink.apply(&batch).await.is_ok());
        assert!(EventSink::<u8>::is_ready(&sink));
    }

    #[test]
    fn test_sink_error_display() {
        let err: SinkError = "target unavailable".into();
        assert_eq!(err.to_string(), "target unavailable");
        let err: SinkError = String::from("x").into();
        assert_eq!(err.0, "x");
    }
}
