//! Event batches.
//!
//! A batch is the unit handed from the I/O task to the consumer. It carries
//! the decoded events in source order and the position the consumer should
//! checkpoint once the batch is applied.
//!
//! ```text
//! binlog (tx mode):   [Write, Update, ..., Xid]  position = xid log_pos
//! binlog (non-tx):    [Query]                    position = event log_pos
//! stream:             [DataRecord, ...]          position = (id, ack_id)
//! ```

use crate::position::Position;
use std::time::Instant;

/// Events decoded from one wire-level unit, with the position they advance to.
#[derive(Debug, Clone)]
pub struct EventBatch<E> {
    /// Events in source order.
    pub events: Vec<E>,
    /// Position reached once every event in this batch is applied.
    pub position: Position,
    /// Server-issued ack id (stream variant only).
    pub ack_id: Option<String>,
    /// When the I/O task finished decoding this batch.
    pub received_at: Instant,
}

impl<E> EventBatch<E> {
    pub fn new(events: Vec<E>, position: Position) -> Self {
        Self {
            events,
            position,
            ack_id: None,
            received_at: Instant::now(),
        }
    }

    /// Attach the server ack id.
    pub fn with_ack_id(mut self, ack_id: impl Into<String>) -> Self {
        self.ack_id = Some(ack_id.into());
        self
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time since the batch was decoded.
    pub fn age(&self) -> std::time::Duration {
        self.received_at.elapsed()
    }
}
