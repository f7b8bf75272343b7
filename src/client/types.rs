//! Client state types.
//!
//! Defines the state machine for the change client lifecycle.
//!
//! # State Transitions
//!
//! ```text
//!              subscribe()
//! Created ─────────────────────→ Streaming ←──────────────┐
//!    │                              │                     │
//!    │                              │ (disconnect)        │ (resubscribed)
//!    │                              ↓                     │
//!    │                         Reconnecting ──────────────┘
//!    │                              │
//!    │                              │ (budget exhausted)
//!    │                              ↓
//!    │                           GivenUp
//!    │                              │
//!    └──────── close() ─────────────┴──────────→ Closed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `ChangeClient::new()`. No connection.
//! - **Streaming**: A session is live and batches flow into the queue.
//! - **Reconnecting**: The session dropped; the supervisor is resubscribing.
//! - **GivenUp**: The reconnect budget ran out. Terminal until `close()`.
//! - **Closed**: `close()` was called. Terminal.

use crate::position::Position;

/// State of a change client.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Built but not subscribed.
    Created,

    /// Streaming changes.
    Streaming,

    /// Connection lost; reconnect in progress.
    ///
    /// `poll()` returns `Ok(None)` while the queue is being replaced.
    Reconnecting,

    /// Reconnect budget exhausted.
    ///
    /// The error callback has received `GivenUp`. Check logs for the
    /// individual attempt failures.
    GivenUp,

    /// Closed by the caller.
    Closed,
}

impl ClientState {
    /// Whether batches can still be polled (now or after a reconnect).
    pub fn is_running(self) -> bool {
        matches!(self, ClientState::Streaming | ClientState::Reconnecting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClientState::GivenUp | ClientState::Closed)
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Created => write!(f, "Created"),
            ClientState::Streaming => write!(f, "Streaming"),
            ClientState::Reconnecting => write!(f, "Reconnecting"),
            ClientState::GivenUp => write!(f, "GivenUp"),
            ClientState::Closed => write!(f, "Closed"),
        }
    }
}

/// Health snapshot of a client.
///
/// Collected from cached state only; no network I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: ClientState,
    /// `host:port` of the source.
    pub endpoint: String,
    /// Batches buffered for the consumer.
    pub queue_depth: usize,
    pub queue_capacity: usize,
    /// Reconnect attempts spent since the last successful resubscribe.
    pub retry_attempts: u32,
    /// Session generation (increments on every reconnect attempt).
    pub generation: u64,
    /// Last position the consumer checkpointed.
    pub last_checkpoint: Option<Position>,
    /// Streaming and the queue is not saturated.
    pub healthy: bool,
}
