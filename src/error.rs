// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication client.
//!
//! Errors are categorized by where they come from (the transport, the
//! server, the decoder, the checkpoint store) so the reconnection
//! supervisor and the consumer can tell them apart.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Transport` | Yes | Connect refused, reset, EOF, idle peer |
//! | `ConnectTimeout` | Yes | TCP connect did not finish in time |
//! | `Timeout` | Yes | No correlated response within the command deadline |
//! | `Server` | No | Error packet/response sent by the server |
//! | `Protocol` | No | Malformed frame, schema cache miss, unexpected message |
//! | `Unsupported` | No | Checksum algorithm, auth plugin or column type we can't handle |
//! | `PositionStore` | No | Local SQLite errors (needs operator attention) |
//! | `Codec` | No | CDC frame could not be (de)serialized |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Session/client state machine violation |
//! | `GivenUp` | No | Reconnect budget exhausted |
//! | `Shutdown` | No | Client closed |
//! | `Internal` | No | Missing response or other client-side failure |
//!
//! # Retry Behavior
//!
//! [`ClientError::is_retryable()`] classifies errors for logging and for
//! callers doing their own retries. The reconnection supervisor spends
//! the same budget on every failure kind, but it logs protocol errors
//! separately from transport errors.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while capturing changes.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport failure talking to the source.
    ///
    /// Connection refused, reset by peer, unexpected EOF, or no traffic
    /// for longer than the heartbeat idle limit.
    #[error("Transport error ({endpoint}): {message}")]
    Transport {
        endpoint: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// TCP connect did not complete within the connect timeout.
    #[error("Connect to {endpoint} timed out after {}ms", timeout.as_millis())]
    ConnectTimeout { endpoint: String, timeout: Duration },

    /// No correlated response arrived within the command deadline.
    ///
    /// Client-side; the server never answered.
    #[error("Timed out after {}ms waiting for {operation}", timeout.as_millis())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// Error reported by the server (MySQL ERR packet, CDC FAILED response).
    ///
    /// Does not by itself terminate the transport.
    #[error("Server error {code} ({sql_state}): {message}")]
    Server {
        code: String,
        sql_state: String,
        message: String,
    },

    /// Malformed or out-of-order data from the server.
    ///
    /// Fatal to the current session. A row event referencing an unknown
    /// table id lands here.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Something the server asked for that this client does not implement.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// SQLite error during position checkpointing.
    #[error("Position store error: {0}")]
    PositionStore(#[from] sqlx::Error),

    /// CDC frame (de)serialization failure.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Reconnect budget exhausted; the client stopped permanently.
    #[error("Gave up reconnecting after {attempts} attempts")]
    GivenUp { attempts: u32 },

    /// Client is closed or closing.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected client-side failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Create a transport error from an I/O error.
    pub fn transport(endpoint: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a transport error without source.
    pub fn transport_msg(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            endpoint: endpoint.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a server error.
    pub fn server(
        code: impl ToString,
        sql_state: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Server {
            code: code.to_string(),
            sql_state: sql_state.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl ToString, actual: impl ToString) -> Self {
        Self::InvalidState {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::ConnectTimeout { .. } => true,
            Self::Timeout { .. } => true,
            Self::Server { .. } => false, // Bad credentials, bad command
            Self::Protocol(_) => false,   // Decoder/version bug
            Self::Unsupported(_) => false,
            Self::PositionStore(_) => false,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::GivenUp { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether this is a protocol-level failure (reported distinctly from
    /// transport failures).
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Unsupported(_) | Self::Codec(_))
    }

    /// Static label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::ConnectTimeout { .. } => "connect_timeout",
            Self::Timeout { .. } => "timeout",
            Self::Server { .. } => "server",
            Self::Protocol(_) => "protocol",
            Self::Unsupported(_) => "unsupported",
            Self::PositionStore(_) => "position_store",
            Self::Codec(_) => "codec",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::GivenUp { .. } => "given_up",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
