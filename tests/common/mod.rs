//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Binlog event builders (checksum off)
//! - In-process mock MySQL server speaking just enough of the replication protocol
//! - In-process mock CDC server
//! - Recording sink for dispatcher assertions
//! - Test logging (`RUST_LOG` overrides the default filter)

#![allow(dead_code)]

pub mod binlog;
pub mod mock_cdc;
pub mod mock_mysql;
pub mod recording_sink;

pub use binlog::*;
pub use mock_cdc::*;
pub use mock_mysql::*;
pub use recording_sink::*;

use replication_client::{ChangeClient, EventBatch, Subscriber};
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent). Output goes through the test
/// harness, so it only shows for failing tests or with `--nocapture`.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("replication_client=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Poll until a batch arrives or `deadline` passes. Reconnects make
/// `poll` return `Ok(None)` for a while, so a single poll is not enough.
pub async fn poll_batch<S: Subscriber>(
    client: &ChangeClient<S>,
    deadline: Duration,
) -> Option<EventBatch<S::Event>> {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        match client.poll(Duration::from_millis(50)).await {
            Ok(Some(batch)) => return Some(batch),
            Ok(None) => {}
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    None
}

/// Wait until `check` holds or `deadline` passes.
pub async fn eventually<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let until = tokio::time::Instant::now() + deadline;
    while tokio::time::Instant::now() < until {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
