// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client facade.
//!
//! [`ChangeClient`] is what consumers hold. It wraps a [`Supervisor`] and
//! the task that watches for disconnects.
//!
//! # Usage
//!
//! ```rust,no_run
//! use replication_client::client::ChangeClient;
//! use replication_client::config::{ClientConfig, ConnectInfo};
//! use replication_client::mysql::BinlogSubscriber;
//! use replication_client::Position;
//! use std::time::Duration;
//!
//! # async fn example() -> replication_client::Result<()> {
//! let info = ConnectInfo::new("127.0.0.1", 3306, "repl", "secret", 1001);
//! let config = ClientConfig::default();
//! let client = ChangeClient::new(BinlogSubscriber::new(info, &config), config);
//!
//! client.subscribe(Some(Position::binlog("binlog.000001", 4))).await?;
//! while let Some(batch) = client.poll(Duration::from_millis(500)).await? {
//!     // apply batch.events somewhere
//!     client.ack(&batch).await?;
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
mod types;

pub use types::{ClientState, HealthCheck};

use crate::batch::EventBatch;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::position::Position;
use crate::supervisor::{Disconnect, Subscriber, Supervisor};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

/// Resumable change-capture client.
pub struct ChangeClient<S: Subscriber> {
    supervisor: Arc<Supervisor<S>>,
    disconnects: Mutex<Option<mpsc::UnboundedReceiver<Disconnect>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    subscribing: AtomicBool,
    config: ClientConfig,
}

impl<S: Subscriber> ChangeClient<S> {
    pub fn new(subscriber: S, config: ClientConfig) -> Self {
        let (supervisor, disconnects) = Supervisor::new(subscriber, &config);
        Self {
            supervisor,
            disconnects: Mutex::new(Some(disconnects)),
            watcher: Mutex::new(None),
            subscribing: AtomicBool::new(false),
            config,
        }
    }

    /// Connect and begin streaming from `position`.
    ///
    /// `None` starts wherever the source starts new subscribers. Errors
    /// from this first connect are returned here and do not trigger a
    /// reconnect. A client subscribes at most once; a failed first
    /// subscribe may be retried.
    pub async fn subscribe(&self, position: Option<Position>) -> Result<()> {
        if self.supervisor.is_closed() {
            return Err(ClientError::Shutdown);
        }
        if self
            .subscribing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ClientError::invalid_state(ClientState::Created, self.state()));
        }

        if let Err(e) = self.supervisor.start(position).await {
            self.subscribing.store(false, Ordering::Release);
            return Err(e);
        }

        let disconnects = self
            .disconnects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = disconnects {
            let span = info_span!("watcher", endpoint = %self.supervisor.endpoint());
            let handle = tokio::spawn(Arc::clone(&self.supervisor).run_watcher(rx).instrument(span));
            *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }
        info!(endpoint = %self.supervisor.endpoint(), "Subscribed");
        Ok(())
    }

    /// Next batch, `Ok(None)` on timeout.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<EventBatch<S::Event>>> {
        self.supervisor.poll(timeout).await
    }

    /// Record `position` as the consumer checkpoint without telling the
    /// source.
    pub fn checkpoint(&self, position: Position) {
        self.supervisor.checkpoint(position);
    }

    /// Checkpoint the batch position and acknowledge it to the source.
    pub async fn ack(&self, batch: &EventBatch<S::Event>) -> Result<()> {
        self.ack_position(&batch.position).await
    }

    pub async fn ack_position(&self, position: &Position) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ClientError::invalid_state("Streaming", state));
        }
        self.supervisor.ack(position).await
    }

    /// Stop everything. Safe to call more than once.
    pub async fn close(&self) {
        self.supervisor.close().await;

        let watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = watcher {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(endpoint = %self.supervisor.endpoint(), error = %e, "Watcher task failed");
                }
            }
        }
    }

    pub fn state(&self) -> ClientState {
        self.supervisor.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.supervisor.state_receiver()
    }

    /// Register a callback for asynchronous errors: disconnects, protocol
    /// failures and the final `GivenUp`.
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.supervisor.set_error_callback(Arc::new(callback));
    }

    pub fn endpoint(&self) -> &str {
        self.supervisor.endpoint()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Position a reconnect would resume from right now.
    pub fn resume_position(&self) -> Option<Position> {
        self.supervisor.resume_position()
    }

    pub fn subscriber(&self) -> &S {
        self.supervisor.subscriber()
    }

    /// Snapshot of client health.
    ///
    /// Never blocks on the queue; while a poll holds it the depth is the
    /// value recorded by that poll.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        HealthCheck {
            state,
            endpoint: self.supervisor.endpoint().to_string(),
            queue_depth: self.supervisor.queue_depth(),
            queue_capacity: self.supervisor.queue_capacity(),
            retry_attempts: self.supervisor.retry_attempts(),
            generation: self.supervisor.generation(),
            last_checkpoint: self.supervisor.last_checkpoint(),
            healthy: state == ClientState::Streaming,
        }
    }
}

impl<S: Subscriber> Drop for ChangeClient<S> {
    fn drop(&mut self) {
        let watcher = self.watcher.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = watcher {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueProducer;
    use crate::supervisor::{DisconnectNotifier, StreamingSession, SubscribeContext};
    use futures::future::BoxFuture;
    use std::sync::atomic::AtomicUsize;

    /// Subscriber that always opens, keeping the context for the test.
    #[derive(Default)]
    struct Loopback {
        opens: AtomicUsize,
        fail_first: AtomicBool,
        contexts: Mutex<Vec<(QueueProducer<String>, DisconnectNotifier)>>,
    }

    struct LoopbackSession {
        closed: Arc<AtomicUsize>,
    }

    impl StreamingSession for LoopbackSession {
        fn close(&self) -> BoxFuture<'_, ()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    impl Subscriber for Loopback {
        type Event = String;
        type Session = LoopbackSession;

        fn endpoint(&self) -> String {
            "loopback:1".to_string()
        }

        fn open(&self, ctx: SubscribeContext<String>) -> BoxFuture<'_, Result<LoopbackSession>> {
            Box::pin(async move {
                self.opens.fetch_add(1, Ordering::SeqCst);
                if self.fail_first.swap(false, Ordering::SeqCst) {
                    return Err(ClientError::server(1045, "28000", "Access denied"));
                }
                self.contexts.lock().unwrap().push((ctx.producer, ctx.disconnect));
                Ok(LoopbackSession {
                    closed: Arc::new(AtomicUsize::new(0)),
                })
            })
        }

        fn acknowledge<'a>(&'a self, _s: &'a LoopbackSession, _p: &'a Position) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn client() -> ChangeClient<Loopback> {
        ChangeClient::new(Loopback::default(), ClientConfig::for_testing())
    }

    fn producer(client: &ChangeClient<Loopback>) -> QueueProducer<String> {
        client.subscriber().contexts.lock().unwrap().last().unwrap().0.clone()
    }

    #[tokio::test]
    async fn test_subscribe_only_once() {
        let client = client();
        client.subscribe(None).await.unwrap();
        assert_eq!(client.state(), ClientState::Streaming);

        let err = client.subscribe(None).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
        assert_eq!(client.subscriber().opens.load(Ordering::SeqCst), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_failed_subscribe_returns_error_and_can_retry() {
        let subscriber = Loopback::default();
        subscriber.fail_first.store(true, Ordering::SeqCst);
        let client = ChangeClient::new(subscriber, ClientConfig::for_testing());

        let err = client.subscribe(None).await.unwrap_err();
        assert!(matches!(err, ClientError::Server { .. }));
        assert_eq!(client.state(), ClientState::Created);

        client.subscribe(None).await.unwrap();
        assert_eq!(client.state(), ClientState::Streaming);
        client.close().await;
    }

    #[tokio::test]
    async fn test_poll_and_ack_checkpoint() {
        let client = client();
        client.subscribe(Some(Position::binlog("binlog.000001", 4))).await.unwrap();

        let tx = producer(&client);
        tx.push(EventBatch::new(vec!["a".to_string()], Position::binlog("binlog.000001", 120)))
            .await
            .unwrap();

        let batch = client.poll(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(batch.events, vec!["a"]);
        client.ack(&batch).await.unwrap();

        let health = client.health_check();
        assert_eq!(health.last_checkpoint, Some(Position::binlog("binlog.000001", 120)));
        assert!(health.healthy);
        assert_eq!(health.queue_depth, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_poll_timeout_returns_none() {
        let client = client();
        client.subscribe(None).await.unwrap();
        let got = client.poll(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
        client.close().await;
    }

    #[tokio::test]
    async fn test_double_close_and_poll_after_close() {
        let client = client();
        client.subscribe(None).await.unwrap();

        client.close().await;
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);

        let err = client.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
        assert!(matches!(client.subscribe(None).await, Err(ClientError::Shutdown)));

        // Late disconnect from the closed session is ignored
        let notifier = client.subscriber().contexts.lock().unwrap()[0].1.clone();
        notifier.notify(ClientError::transport_msg("loopback:1", "eof"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.subscriber().opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_before_subscribe() {
        let client = client();
        client.close().await;
        assert_eq!(client.state(), ClientState::Closed);
    }

    #[tokio::test]
    async fn test_on_error_sees_disconnect() {
        let client = client();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        client.on_error(move |e| {
            if e.is_retryable() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.subscribe(None).await.unwrap();

        let notifier = client.subscriber().contexts.lock().unwrap()[0].1.clone();
        notifier.notify(ClientError::transport_msg("loopback:1", "reset"));

        let mut rx = client.state_receiver();
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.subscriber().opens.load(Ordering::SeqCst) < 2 {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        client.close().await;
    }
}
