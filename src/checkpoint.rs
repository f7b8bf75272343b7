// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Position checkpoint persistence.
//!
//! The consumer records the last position it fully applied; after a crash
//! or a reconnect the client resumes from there. Storage is abstracted by
//! [`PositionStore`] so embedders can bring their own (etcd, a table in the
//! target database, ...). Two implementations ship with the crate:
//!
//! - [`MemoryPositionStore`]: process-local, for tests and ephemeral jobs
//! - [`SqlitePositionStore`]: SQLite in WAL mode, debounced writes
//!
//! # Debounced Writes
//!
//! To reduce SQLite write pressure, positions are debounced:
//! - `save()` updates the in-memory cache immediately and marks the key dirty
//! - `flush_dirty()` persists all dirty positions to disk in a batch
//! - The dispatcher calls `flush()` periodically (every few seconds)
//! - On shutdown, `close()` flushes so nothing acknowledged is lost
//!
//! A crash between `save()` and the next flush loses at most one flush
//! interval of progress. On restart we re-read events that were already
//! applied, which is fine under at-least-once delivery.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. We handle this with:
//! - Automatic retry with exponential backoff
//! - A bounded number of attempts (5)
//! - Cache-first writes (cache is updated immediately, disk write retried)
//!
//! ## Checkpoint Semantics
//!
//! The store holds the position **after** the last applied batch. Positions
//! are stored as JSON so both binlog and stream coordinates fit one table.
//!
//! ```text
//! poll batch @ binlog.000003:4711 → sink.apply → save(key, binlog.000003:4711)
//!                                  (crash here = replay the batch, idempotent)
//! ```

use crate::error::{ClientError, Result};
use crate::position::Position;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Boxed future returned by [`PositionStore`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Durable storage for consumer checkpoints.
///
/// Keys are chosen by the caller; the usual choice is the endpoint
/// (`host:port`) plus a job name.
pub trait PositionStore: Send + Sync + 'static {
    /// Record `position` for `key`. May be buffered until [`flush`](Self::flush).
    fn save(&self, key: &str, position: Position) -> StoreFuture<'_, ()>;

    /// Last recorded position for `key`.
    fn load(&self, key: &str) -> StoreFuture<'_, Option<Position>>;

    /// Persist anything buffered. Returns how many keys were written.
    fn flush(&self) -> StoreFuture<'_, usize> {
        Box::pin(async { Ok(0) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MemoryPositionStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local store. Lost on restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryPositionStore {
    positions: Arc<DashMap<String, Position>>,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl PositionStore for MemoryPositionStore {
    fn save(&self, key: &str, position: Position) -> StoreFuture<'_, ()> {
        self.positions.insert(key.to_string(), position);
        Box::pin(async { Ok(()) })
    }

    fn load(&self, key: &str) -> StoreFuture<'_, Option<Position>> {
        let found = self.positions.get(key).map(|p| p.value().clone());
        Box::pin(async move { Ok(found) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SqlitePositionStore
// ═══════════════════════════════════════════════════════════════════════════════

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::checkpoint_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Persistent position storage backed by SQLite.
///
/// Supports debounced writes: updates go to cache immediately,
/// and are flushed to disk periodically via `flush_dirty()`.
pub struct SqlitePositionStore {
    pool: SqlitePool,
    /// In-memory cache for fast reads
    cache: Arc<RwLock<HashMap<String, Position>>>,
    /// Keys with dirty (not yet persisted) positions
    dirty: Arc<RwLock<HashSet<String>>>,
    path: String,
}

impl SqlitePositionStore {
    /// Open (or create) a store at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path, true).await
    }

    /// Open with explicit journal mode.
    pub async fn open(path: impl AsRef<Path>, wal_mode: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing position store");

        let url = if path_str == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path_str)
        };
        let journal = if wal_mode {
            sqlx::sqlite::SqliteJournalMode::Wal
        } else {
            sqlx::sqlite::SqliteJournalMode::Memory
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ClientError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        // An in-memory database lives per connection, so pin the pool to one.
        let max_connections = if path_str == ":memory:" { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                key TEXT PRIMARY KEY,
                position TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, position FROM positions")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (key, raw) in rows {
            match serde_json::from_str::<Position>(&raw) {
                Ok(position) => {
                    debug!(key = %key, position = %position, "Loaded position from disk");
                    cache.insert(key, position);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable stored position");
                }
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored positions from previous run");
        }

        Ok(Self {
            pool,
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: path_str,
        })
    }

    /// Get the position for a key (from cache).
    pub async fn get(&self, key: &str) -> Option<Position> {
        self.cache.read().await.get(key).cloned()
    }

    /// Update the position for a key (debounced).
    ///
    /// Updates cache immediately, marks the key dirty.
    /// Call `flush_dirty()` periodically to persist to disk.
    pub async fn set(&self, key: &str, position: Position) {
        debug!(key = %key, position = %position, "Position updated (pending flush)");
        self.cache.write().await.insert(key.to_string(), position);
        self.dirty.write().await.insert(key.to_string());
    }

    /// Flush all dirty positions to disk.
    ///
    /// Returns the number of positions flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty_keys: Vec<String> = self.dirty.write().await.drain().collect();

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let cache = self.cache.read().await;
        let pool = &self.pool;

        let mut flushed = 0;
        let mut errors = 0;

        for key in &dirty_keys {
            let Some(position) = cache.get(key) else {
                continue;
            };
            let encoded = serde_json::to_string(position)?;
            let key_owned = key.clone();

            let result = execute_with_retry("checkpoint_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO positions (key, position, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(key) DO UPDATE SET
                        position = excluded.position,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&key_owned)
                .bind(&encoded)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(key = %key, error = %e, "Failed to flush position");
                    // Re-mark as dirty so we retry next flush
                    self.dirty.write().await.insert(key.clone());
                }
            }
        }

        if flushed > 0 || errors > 0 {
            debug!(flushed, errors, "Flushed dirty positions");
            crate::metrics::record_checkpoint_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(ClientError::Internal(format!(
                "Failed to flush {} positions",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Delete the position for a key (e.g. when a job is retired).
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.cache.write().await.remove(key);
        self.dirty.write().await.remove(key);

        let pool = &self.pool;
        let key_owned = key.to_string();

        execute_with_retry("checkpoint_delete", || async {
            sqlx::query("DELETE FROM positions WHERE key = ?")
                .bind(&key_owned)
                .execute(pool)
                .await
        })
        .await?;

        info!(key = %key, "Deleted position");
        Ok(())
    }

    /// All cached positions (for diagnostics).
    pub async fn get_all(&self) -> HashMap<String, Position> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint_wal", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the pool gracefully.
    ///
    /// Flushes any dirty positions and checkpoints WAL before closing.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty positions on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty positions on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Position store closed");
    }
}

impl PositionStore for SqlitePositionStore {
    fn save(&self, key: &str, position: Position) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.set(&key, position).await;
            Ok(())
        })
    }

    fn load(&self, key: &str) -> StoreFuture<'_, Option<Position>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.get(&key).await) })
    }

    fn flush(&self) -> StoreFuture<'_, usize> {
        Box::pin(self.flush_dirty())
    }
}
