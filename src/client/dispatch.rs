//! Consumer dispatch loop.
//!
//! Polls a [`ChangeClient`], applies each batch to an [`EventSink`], then
//! acks and checkpoints it:
//!
//! ```text
//! poll ──▶ sink.apply ──ok──▶ client.ack ──▶ store.save (debounced)
//!              │
//!              └─err──▶ log + metrics, sleep (doubling, capped), apply same batch again
//! ```
//!
//! A rejected batch is retried as-is. Nothing upstream moves while it is
//! retried: the queue fills and the session stops reading the socket.
//!
//! # Graceful Shutdown
//!
//! The loop watches `shutdown_rx` with a biased `select!`, so it stops
//! between batches or during a sink retry sleep. Dropping the sender
//! counts as a shutdown. The store is flushed on
//! the way out. A batch applied but not yet saved is replayed after a
//! restart, which is why sinks must be idempotent.

use super::ChangeClient;
use crate::checkpoint::PositionStore;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::sink::EventSink;
use crate::supervisor::Subscriber;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Counters returned when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub batches: u64,
    pub events: u64,
    pub sink_failures: u64,
    pub flushes: u64,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
    /// `shutdown_rx` fired.
    Shutdown,
    /// The client stopped running (closed or gave up).
    ClientStopped,
}

/// Run the dispatch loop until shutdown or until the client stops.
///
/// `key` names the checkpoint in `store`. The client must already be
/// subscribed.
pub async fn run_dispatcher<S, K, P>(
    client: Arc<ChangeClient<S>>,
    sink: Arc<K>,
    store: Arc<P>,
    key: String,
    config: ClientConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(DispatchExit, DispatchStats)>
where
    S: Subscriber,
    K: EventSink<S::Event>,
    P: PositionStore,
{
    let endpoint = client.endpoint().to_string();
    let span = info_span!("dispatch", endpoint = %endpoint, key = %key);

    async move {
        info!("Starting dispatcher");

        let poll_timeout = config.dispatch.poll_timeout_duration();
        let retry_base = config.dispatch.sink_retry_delay_duration();
        let retry_max = config.dispatch.sink_retry_max_delay_duration();
        let flush_interval = config.checkpoint.flush_interval_duration();

        let mut stats = DispatchStats::default();
        let mut last_flush = Instant::now();

        let exit = 'outer: loop {
            if *shutdown_rx.borrow() {
                break DispatchExit::Shutdown;
            }

            // Hold off polling while the sink is saturated
            while !sink.is_ready() {
                tokio::select! {
                    biased;
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break 'outer DispatchExit::Shutdown;
                        }
                    }
                    _ = tokio::time::sleep(retry_base) => {}
                }
            }

            let polled = tokio::select! {
                biased;
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break DispatchExit::Shutdown;
                    }
                    continue;
                }
                polled = client.poll(poll_timeout) => polled,
            };

            let batch = match polled {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    maybe_flush(&*store, flush_interval, &mut last_flush, &mut stats).await;
                    continue;
                }
                Err(ClientError::InvalidState { actual, .. }) => {
                    info!(state = %actual, "Client no longer running, stopping dispatcher");
                    break DispatchExit::ClientStopped;
                }
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(e);
                }
            };

            // Apply, retrying the same batch until the sink accepts it
            let mut delay = retry_base;
            loop {
                match sink.apply(&batch).await {
                    Ok(()) => break,
                    Err(e) => {
                        stats.sink_failures += 1;
                        metrics::record_sink_failure(&endpoint);
                        warn!(
                            error = %e,
                            position = %batch.position,
                            events = batch.len(),
                            retry_in_ms = delay.as_millis() as u64,
                            "Sink rejected batch, retrying"
                        );
                        tokio::select! {
                            biased;
                            result = shutdown_rx.changed() => {
                                if result.is_err() || *shutdown_rx.borrow() {
                                    break 'outer DispatchExit::Shutdown;
                                }
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = delay.saturating_mul(2).min(retry_max);
                    }
                }
            }

            stats.batches += 1;
            stats.events += batch.len() as u64;

            if let Err(e) = client.ack(&batch).await {
                // Checkpoint is already recorded locally; the server ack is best effort
                warn!(error = %e, position = %batch.position, "Ack failed");
            }
            if let Err(e) = store.save(&key, batch.position.clone()).await {
                warn!(error = %e, position = %batch.position, "Failed to save checkpoint");
            }
            debug!(position = %batch.position, events = batch.len(), "Batch applied");

            maybe_flush(&*store, flush_interval, &mut last_flush, &mut stats).await;
        };

        match store.flush().await {
            Ok(flushed) => {
                stats.flushes += 1;
                info!(flushed, "Final checkpoint flush complete");
            }
            Err(e) => error!(error = %e, "Final checkpoint flush failed"),
        }

        info!(
            batches = stats.batches,
            events = stats.events,
            sink_failures = stats.sink_failures,
            exit = ?exit,
            "Dispatcher stopped"
        );
        Ok((exit, stats))
    }
    .instrument(span)
    .await
}

async fn maybe_flush<P: PositionStore>(
    store: &P,
    interval: Duration,
    last_flush: &mut Instant,
    stats: &mut DispatchStats,
) {
    if last_flush.elapsed() < interval {
        return;
    }
    *last_flush = Instant::now();
    match store.flush().await {
        Ok(flushed) => {
            stats.flushes += 1;
            if flushed > 0 {
                debug!(flushed, "Flushed checkpoints");
            }
        }
        Err(e) => warn!(error = %e, "Checkpoint flush failed"),
    }
}
