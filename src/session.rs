//! Shared connection state for a single session.
//!
//! # Connection Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Negotiating → Authenticating → LoggedIn → Streaming
//!      ↑             │             │               │             ↑  ↓        │
//!      └─────────────┴─────────────┴───────────────┴─────────────┴──┘────────┘
//!                                (failure)
//!   any state ──close()──▶ Closed (terminal)
//! ```
//!
//! For the CDC stream variant, `Negotiating` means "greeting received,
//! waiting to log in" and `Authenticating` means a login request is in
//! flight.
//!
//! Only the owning session mutates the state. Observers (the client facade,
//! tests) subscribe through a `watch` receiver.

use crate::error::{ClientError, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tokio::sync::watch;
use tracing::debug;

/// State of one protocol connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Socket open, waiting for / processing the server greeting.
    Negotiating,
    /// Credentials sent, waiting for the verdict.
    Authenticating,
    /// Authenticated and ready for commands.
    LoggedIn,
    /// Change events are flowing; the command path is closed.
    Streaming,
    /// Closed on purpose. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Negotiating => "Negotiating",
            ConnectionState::Authenticating => "Authenticating",
            ConnectionState::LoggedIn => "LoggedIn",
            ConnectionState::Streaming => "Streaming",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(s)
    }
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Negotiating) => true,
            (Negotiating, Authenticating) => true,
            // Auth switch / fast-auth keep us in Authenticating
            (Authenticating, Authenticating) => true,
            (Authenticating, LoggedIn) => true,
            (LoggedIn, Streaming) => true,
            // stop_streaming returns the CDC session to the command path
            (Streaming, LoggedIn) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// State holder owned by a session.
pub struct SessionState {
    endpoint: String,
    state: RwLock<ConnectionState>,
    tx: watch::Sender<ConnectionState>,
    closing: AtomicBool,
}

impl SessionState {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self {
            endpoint: endpoint.into(),
            state: RwLock::new(ConnectionState::Disconnected),
            tx,
            closing: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, rejecting illegal transitions with `InvalidState`.
    pub fn transition(&self, next: ConnectionState) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let current = *state;
        if current == next && next != ConnectionState::Authenticating {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(ClientError::invalid_state(
                format!("transition to {}", next),
                current,
            ));
        }
        *state = next;
        drop(state);
        debug!(endpoint = %self.endpoint, from = %current, to = %next, "Session state changed");
        self.tx.send_replace(next);
        Ok(())
    }

    /// Require the session to be in `expected`.
    pub fn expect(&self, expected: ConnectionState) -> Result<()> {
        let current = self.get();
        if current == expected {
            Ok(())
        } else {
            Err(ClientError::invalid_state(expected, current))
        }
    }

    /// Mark the session as intentionally closing.
    ///
    /// Returns `false` if it was already marked (close is idempotent).
    pub fn begin_close(&self) -> bool {
        let first = self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            let _ = self.transition(ConnectionState::Closed);
        }
        first
    }

    /// Whether `close()` was called. Disconnects after this are expected.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = SessionState::new("db:3306");
        assert_eq!(state.get(), ConnectionState::Disconnected);

        for next in [
            ConnectionState::Connecting,
            ConnectionState::Negotiating,
            ConnectionState::Authenticating,
            ConnectionState::LoggedIn,
            ConnectionState::Streaming,
        ] {
            state.transition(next).unwrap();
            assert_eq!(state.get(), next);
        }
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let state = SessionState::new("db:3306");
        let err = state.transition(ConnectionState::Streaming).unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_closed_is_terminal() {
        let state = SessionState::new("db:3306");
        state.transition(ConnectionState::Connecting).unwrap();
        assert!(state.begin_close());
        assert_eq!(state.get(), ConnectionState::Closed);
        assert!(state.transition(ConnectionState::Connecting).is_err());
        assert!(state.transition(ConnectionState::Disconnected).is_err());
    }

    #[test]
    fn test_begin_close_idempotent() {
        let state = SessionState::new("db:3306");
        assert!(state.begin_close());
        assert!(!state.begin_close());
        assert!(state.is_closing());
    }

    #[test]
    fn test_failure_returns_to_disconnected() {
        let state = SessionState::new("db:3306");
        state.transition(ConnectionState::Connecting).unwrap();
        state.transition(ConnectionState::Negotiating).unwrap();
        state.transition(ConnectionState::Disconnected).unwrap();
        assert_eq!(state.get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_streaming_back_to_logged_in() {
        assert!(ConnectionState::Streaming.can_transition_to(ConnectionState::LoggedIn));
        assert!(!ConnectionState::LoggedIn.can_transition_to(ConnectionState::Negotiating));
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_changes() {
        let state = SessionState::new("db:3306");
        let mut rx = state.subscribe();
        state.transition(ConnectionState::Connecting).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }

    #[test]
    fn test_expect() {
        let state = SessionState::new("db:3306");
        assert!(state.expect(ConnectionState::Disconnected).is_ok());
        let err = state.expect(ConnectionState::LoggedIn).unwrap_err();
        assert!(err.to_string().contains("LoggedIn"));
    }

    #[test]
    fn test_display() {
        assert_eq!(ConnectionState::LoggedIn.to_string(), "LoggedIn");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }
}
