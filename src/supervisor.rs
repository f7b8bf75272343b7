//! Reconnection supervisor.
//!
//! Owns the live session and its queue, watches for disconnects and
//! resubscribes from the consumer's checkpoint.
//!
//! # Lifecycle
//!
//! ```text
//!                 ┌──────────── Disconnect{generation, error} ◀── I/O task
//!                 ▼
//!   watcher ── stale generation? ──yes──▶ ignore
//!                 │ no
//!                 ▼
//!        reconnecting CAS false→true ──lost──▶ ignore
//!                 │ won
//!                 ▼
//!   spawn reconnect task:
//!     for n in 0..max_retries:
//!        new queue + subscriber.open(resume_position())
//!          ok  → swap queue and session, reset budget, Streaming
//!          err → sleep(base << n) unless last attempt (aborted by close)
//!     exhausted → GivenUp, error callback, subscriber.release()
//! ```
//!
//! Every session is tagged with a generation number. The I/O task of a
//! session reports its death at most once through its
//! [`DisconnectNotifier`]; signals carrying any generation other than the
//! live one are ignored. The watcher waits for a reconnect task to finish
//! before it reads the next signal, so a new session that dies right after
//! being installed still gets its own reconnect.

use crate::batch::EventBatch;
use crate::client::ClientState;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::position::Position;
use crate::queue::{BackpressureQueue, QueueProducer};
use crate::resilience::RetryBudget;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Callback invoked with every asynchronous error.
pub type ErrorCallback = Arc<dyn Fn(&ClientError) + Send + Sync>;

/// A session died.
#[derive(Debug)]
pub struct Disconnect {
    pub generation: u64,
    pub error: ClientError,
}

/// Handle an I/O task uses to report that its session died.
///
/// Fires at most once; later calls are no-ops.
#[derive(Clone, Debug)]
pub struct DisconnectNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<Disconnect>,
    fired: Arc<AtomicBool>,
}

impl DisconnectNotifier {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<Disconnect>) -> Self {
        Self {
            generation,
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Notifier for a session with no supervisor. Signals go nowhere.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self::new(0, tx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the session as dead. Returns `false` if already reported.
    pub fn notify(&self, error: ClientError) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(Disconnect {
            generation: self.generation,
            error,
        });
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Everything a subscriber needs to open one session.
pub struct SubscribeContext<E> {
    pub generation: u64,
    /// Where to resume. `None` means "wherever the source starts new
    /// subscribers" (current binlog head, a fresh CDC stream).
    pub position: Option<Position>,
    /// Producer half of this session's queue.
    pub producer: QueueProducer<E>,
    pub disconnect: DisconnectNotifier,
    /// Forwards to the client's error callback, whenever it is set.
    pub on_error: ErrorCallback,
}

/// A live streaming session.
pub trait StreamingSession: Send + Sync + 'static {
    /// Close the session. Idempotent. Must not report a disconnect.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Protocol-specific way to open a streaming session.
///
/// Implemented by [`crate::mysql::BinlogSubscriber`] and
/// [`crate::stream::StreamSubscriber`].
pub trait Subscriber: Send + Sync + 'static {
    type Event: Send + 'static;
    type Session: StreamingSession;

    /// `host:port` of the source, for logs and metrics.
    fn endpoint(&self) -> String;

    /// Connect, authenticate and begin streaming into `ctx.producer`.
    fn open(&self, ctx: SubscribeContext<Self::Event>) -> BoxFuture<'_, Result<Self::Session>>;

    /// Tell the source the consumer is done with everything up to `position`.
    fn acknowledge<'a>(
        &'a self,
        session: &'a Self::Session,
        position: &'a Position,
    ) -> BoxFuture<'a, Result<()>>;

    /// Called once after the supervisor gives up.
    fn release(&self, last_position: Option<Position>) -> BoxFuture<'_, ()> {
        let _ = last_position;
        Box::pin(async {})
    }
}

#[derive(Debug, Default)]
struct ResumePositions {
    initial: Option<Position>,
    last_polled: Option<Position>,
    checkpoint: Option<Position>,
}

/// Shared core behind [`crate::client::ChangeClient`].
pub struct Supervisor<S: Subscriber> {
    subscriber: S,
    endpoint: String,
    queue_capacity: usize,
    budget: RetryBudget,
    state_tx: watch::Sender<ClientState>,
    close_tx: watch::Sender<bool>,
    closed: AtomicBool,
    reconnecting: AtomicBool,
    next_generation: AtomicU64,
    /// Generation of the installed session; 0 while none is live.
    live_generation: AtomicU64,
    session: RwLock<Option<Arc<S::Session>>>,
    queue: tokio::sync::Mutex<Option<BackpressureQueue<S::Event>>>,
    queue_swapped: Notify,
    last_depth: AtomicUsize,
    positions: Mutex<ResumePositions>,
    error_callback: Arc<RwLock<Option<ErrorCallback>>>,
    disconnect_tx: mpsc::UnboundedSender<Disconnect>,
}

impl<S: Subscriber> Supervisor<S> {
    pub fn new(subscriber: S, config: &ClientConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<Disconnect>) {
        let (state_tx, _) = watch::channel(ClientState::Created);
        let (close_tx, _) = watch::channel(false);
        let (disconnect_tx, disconnect_rx) = mpsc::unbounded_channel();
        let endpoint = subscriber.endpoint();

        let supervisor = Arc::new(Self {
            subscriber,
            endpoint,
            queue_capacity: config.queue.capacity,
            budget: RetryBudget::new(config.reconnect.policy()),
            state_tx,
            close_tx,
            closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            live_generation: AtomicU64::new(0),
            session: RwLock::new(None),
            queue: tokio::sync::Mutex::new(None),
            queue_swapped: Notify::new(),
            last_depth: AtomicUsize::new(0),
            positions: Mutex::new(ResumePositions::default()),
            error_callback: Arc::new(RwLock::new(None)),
            disconnect_tx,
        });
        (supervisor, disconnect_rx)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn subscriber(&self) -> &S {
        &self.subscriber
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.budget.attempts()
    }

    pub fn generation(&self) -> u64 {
        self.live_generation.load(Ordering::Acquire)
    }

    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.error_callback.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Open the first session. Errors are returned to the caller and do
    /// not touch the retry budget.
    pub async fn start(&self, position: Option<Position>) -> Result<()> {
        self.lock_positions().initial = position.clone();
        info!(endpoint = %self.endpoint, position = ?position, "Subscribing");
        self.open_session(position).await
    }

    /// Where a new session should start: the consumer checkpoint, else the
    /// last batch handed out by `poll`, else the initial position.
    pub fn resume_position(&self) -> Option<Position> {
        let positions = self.lock_positions();
        positions
            .checkpoint
            .clone()
            .or_else(|| positions.last_polled.clone())
            .or_else(|| positions.initial.clone())
    }

    pub fn last_checkpoint(&self) -> Option<Position> {
        self.lock_positions().checkpoint.clone()
    }

    /// Record the consumer checkpoint.
    pub fn checkpoint(&self, position: Position) {
        let mut positions = self.lock_positions();
        if let Some(previous) = &positions.checkpoint {
            if previous.partial_cmp(&position) == Some(std::cmp::Ordering::Greater) {
                warn!(
                    endpoint = %self.endpoint,
                    previous = %previous,
                    position = %position,
                    "Checkpoint moved backwards"
                );
            }
        }
        positions.checkpoint = Some(position);
    }

    /// Checkpoint and acknowledge `position` to the source.
    pub async fn ack(&self, position: &Position) -> Result<()> {
        self.checkpoint(position.clone());
        let Some(session) = self.current_session() else {
            // Between sessions; the next session resumes from the checkpoint.
            debug!(endpoint = %self.endpoint, position = %position, "No live session, ack recorded locally");
            return Ok(());
        };
        self.subscriber.acknowledge(&session, position).await?;
        metrics::record_ack(&self.endpoint);
        Ok(())
    }

    /// Take the next batch.
    pub async fn poll(&self, timeout: Duration) -> Result<Option<EventBatch<S::Event>>> {
        let state = self.state();
        if !state.is_running() {
            return Err(ClientError::invalid_state("Streaming", state));
        }

        let started = Instant::now();
        let swapped = self.queue_swapped.notified();
        tokio::pin!(swapped);
        let outcome = {
            let mut slot = self.queue.lock().await;
            let Some(queue) = slot.as_mut() else {
                return Err(ClientError::invalid_state("Streaming", self.state()));
            };
            let outcome = queue.poll(timeout).await;
            if matches!(outcome, Err(ClientError::Shutdown)) {
                // Register while the lock still blocks the swap
                swapped.as_mut().enable();
            }
            let depth = queue.len();
            self.last_depth.store(depth, Ordering::Relaxed);
            metrics::set_queue_depth(&self.endpoint, depth);
            outcome
        };

        match outcome {
            Ok(Some(batch)) => {
                self.lock_positions().last_polled = Some(batch.position.clone());
                metrics::record_poll_wait(started.elapsed(), true);
                Ok(Some(batch))
            }
            Ok(None) => {
                metrics::record_poll_wait(started.elapsed(), false);
                Ok(None)
            }
            Err(ClientError::Shutdown) => {
                // The session's producer is gone; a replacement queue is on its way.
                let state = self.state();
                if !state.is_running() {
                    return Err(ClientError::invalid_state("Streaming", state));
                }
                let remaining = timeout.saturating_sub(started.elapsed());
                let _ = tokio::time::timeout(remaining, swapped).await;
                metrics::record_poll_wait(started.elapsed(), false);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Buffered batches (best effort while a poll holds the queue).
    pub fn queue_depth(&self) -> usize {
        match self.queue.try_lock() {
            Ok(slot) => slot.as_ref().map_or(0, |q| q.len()),
            Err(_) => self.last_depth.load(Ordering::Relaxed),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Close everything. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_tx.send(true);
        self.set_state(ClientState::Closed);
        self.live_generation.store(0, Ordering::Release);

        if let Some(session) = self.take_session() {
            session.close().await;
        }
        if let Some(mut queue) = self.queue.lock().await.take() {
            queue.drain_discard();
        }
        self.queue_swapped.notify_waiters();
        info!(endpoint = %self.endpoint, "Client closed");
    }

    /// Watch for disconnects until closed.
    pub async fn run_watcher(self: Arc<Self>, mut disconnects: mpsc::UnboundedReceiver<Disconnect>) {
        let mut close_rx = self.close_tx.subscribe();
        loop {
            let disconnect = tokio::select! {
                biased;
                _ = close_rx.wait_for(|closed| *closed) => break,
                msg = disconnects.recv() => match msg {
                    Some(d) => d,
                    None => break,
                },
            };

            if !self.accept_disconnect(&disconnect) {
                continue;
            }

            let span = info_span!("reconnect", endpoint = %self.endpoint);
            let task = tokio::spawn(Arc::clone(&self).reconnect().instrument(span));
            if let Err(e) = task.await {
                error!(endpoint = %self.endpoint, error = %e, "Reconnect task panicked");
                self.reconnecting.store(false, Ordering::Release);
            }
        }
        debug!(endpoint = %self.endpoint, "Disconnect watcher stopped");
    }

    fn accept_disconnect(&self, disconnect: &Disconnect) -> bool {
        if self.is_closed() {
            debug!(endpoint = %self.endpoint, "Ignoring disconnect after close");
            return false;
        }
        let live = self.live_generation.load(Ordering::Acquire);
        if disconnect.generation != live {
            debug!(
                endpoint = %self.endpoint,
                generation = disconnect.generation,
                live,
                "Ignoring disconnect from stale session"
            );
            return false;
        }

        self.report_error(&disconnect.error);

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(endpoint = %self.endpoint, "Reconnect already in progress");
            return false;
        }
        true
    }

    async fn reconnect(self: Arc<Self>) {
        let mut close_rx = self.close_tx.subscribe();
        self.live_generation.store(0, Ordering::Release);
        self.set_state(ClientState::Reconnecting);

        if let Some(old) = self.take_session() {
            old.close().await;
        }

        let policy = self.budget.policy().clone();
        while let Some(attempt) = self.budget.try_spend() {
            if self.is_closed() {
                self.reconnecting.store(false, Ordering::Release);
                return;
            }

            metrics::record_reconnect_attempt(&self.endpoint, attempt);
            let position = self.resume_position();
            info!(
                endpoint = %self.endpoint,
                attempt,
                max_retries = policy.max_retries,
                position = ?position,
                "Reconnecting"
            );

            match self.open_session(position).await {
                Ok(()) => {
                    info!(endpoint = %self.endpoint, attempt, "Resubscribed");
                    self.budget.reset();
                    self.reconnecting.store(false, Ordering::Release);
                    return;
                }
                Err(ClientError::Shutdown) if self.is_closed() => {
                    self.reconnecting.store(false, Ordering::Release);
                    return;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(endpoint = %self.endpoint, attempt, error = %e, "Reconnect attempt failed");
                    } else {
                        error!(
                            endpoint = %self.endpoint,
                            attempt,
                            error = %e,
                            kind = e.kind(),
                            "Reconnect attempt failed with non-transient error"
                        );
                    }

                    if self.budget.has_remaining_after(attempt) {
                        let delay = policy.delay_for_attempt(attempt);
                        debug!(endpoint = %self.endpoint, attempt, delay_ms = delay.as_millis() as u64, "Backing off");
                        tokio::select! {
                            biased;
                            _ = close_rx.wait_for(|closed| *closed) => {
                                debug!(endpoint = %self.endpoint, "Backoff aborted by close");
                                self.reconnecting.store(false, Ordering::Release);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        self.give_up().await;
        self.reconnecting.store(false, Ordering::Release);
    }

    async fn give_up(&self) {
        if self.is_closed() {
            return;
        }
        let attempts = self.budget.attempts();
        error!(endpoint = %self.endpoint, attempts, "Reconnect budget exhausted, giving up");
        metrics::record_given_up(&self.endpoint);
        self.set_state(ClientState::GivenUp);
        self.report_error(&ClientError::GivenUp { attempts });

        if let Some(mut queue) = self.queue.lock().await.take() {
            let discarded = queue.drain_discard();
            if discarded > 0 {
                metrics::record_queue_discarded(&self.endpoint, discarded);
            }
        }
        self.queue_swapped.notify_waiters();

        self.subscriber.release(self.resume_position()).await;
    }

    async fn open_session(&self, position: Option<Position>) -> Result<()> {
        let generation = self.next_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (producer, queue) = BackpressureQueue::bounded(self.queue_capacity);
        let ctx = SubscribeContext {
            generation,
            position,
            producer,
            disconnect: DisconnectNotifier::new(generation, self.disconnect_tx.clone()),
            on_error: self.forward_errors(),
        };

        let session = match self.subscriber.open(ctx).await {
            Ok(session) => Arc::new(session),
            Err(e) => {
                metrics::record_connection(&self.endpoint, false);
                return Err(e);
            }
        };
        metrics::record_connection(&self.endpoint, true);

        let mut slot = self.queue.lock().await;
        if self.is_closed() {
            drop(slot);
            session.close().await;
            return Err(ClientError::Shutdown);
        }
        if let Some(mut old) = slot.replace(queue) {
            let discarded = old.drain_discard();
            if discarded > 0 {
                info!(endpoint = %self.endpoint, discarded, "Dropped batches buffered by the previous session");
                metrics::record_queue_discarded(&self.endpoint, discarded);
            }
        }
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(session);
        self.live_generation.store(generation, Ordering::Release);
        drop(slot);

        self.set_state(ClientState::Streaming);
        self.queue_swapped.notify_waiters();
        debug!(endpoint = %self.endpoint, generation, "Session installed");
        Ok(())
    }

    fn forward_errors(&self) -> ErrorCallback {
        let slot = Arc::clone(&self.error_callback);
        Arc::new(move |err: &ClientError| {
            let callback = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(callback) = callback {
                callback(err);
            }
        })
    }

    fn report_error(&self, err: &ClientError) {
        match err {
            ClientError::Server { code, .. } => {
                error!(endpoint = %self.endpoint, error = %err, "Server reported an error on the stream");
                metrics::record_server_error(&self.endpoint, code);
            }
            e if e.is_protocol() => {
                error!(endpoint = %self.endpoint, error = %err, kind = err.kind(), "Protocol failure on the stream");
                metrics::record_protocol_error(&self.endpoint, err.kind());
            }
            ClientError::GivenUp { .. } => {}
            _ => {
                warn!(endpoint = %self.endpoint, error = %err, "Connection lost");
            }
        }

        let callback = self
            .error_callback
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }

    fn set_state(&self, next: ClientState) {
        let changed = self.state_tx.send_if_modified(|state| {
            let allowed = match *state {
                ClientState::Closed => false,
                ClientState::GivenUp => next == ClientState::Closed,
                current => current != next,
            };
            if allowed {
                *state = next;
            }
            allowed
        });
        if changed {
            metrics::set_client_state(&next.to_string());
        }
    }

    fn current_session(&self) -> Option<Arc<S::Session>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_session(&self) -> Option<Arc<S::Session>> {
        self.session.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn lock_positions(&self) -> std::sync::MutexGuard<'_, ResumePositions> {
        self.positions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use std::collections::VecDeque;

    /// Subscriber whose `open` outcomes are scripted by the test.
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<()>>>,
        opened: Mutex<Vec<(tokio::time::Instant, Option<Position>)>>,
        contexts: Mutex<Vec<(QueueProducer<u64>, DisconnectNotifier)>>,
        released: AtomicUsize,
        acked: Mutex<Vec<Position>>,
    }

    impl Scripted {
        fn script(outcomes: Vec<Result<()>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }

        fn last_context(&self) -> (QueueProducer<u64>, DisconnectNotifier) {
            self.contexts.lock().unwrap().last().cloned().unwrap()
        }
    }

    struct ScriptedSession;

    impl StreamingSession for ScriptedSession {
        fn close(&self) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    impl Subscriber for Scripted {
        type Event = u64;
        type Session = ScriptedSession;

        fn endpoint(&self) -> String {
            "scripted:0".to_string()
        }

        fn open(&self, ctx: SubscribeContext<u64>) -> BoxFuture<'_, Result<ScriptedSession>> {
            Box::pin(async move {
                self.opened
                    .lock()
                    .unwrap()
                    .push((tokio::time::Instant::now(), ctx.position.clone()));
                let outcome = self
                    .outcomes
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Err(ClientError::transport_msg("scripted:0", "refused")));
                outcome?;
                self.contexts.lock().unwrap().push((ctx.producer, ctx.disconnect));
                Ok(ScriptedSession)
            })
        }

        fn acknowledge<'a>(&'a self, _session: &'a ScriptedSession, position: &'a Position) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.acked.lock().unwrap().push(position.clone());
                Ok(())
            })
        }

        fn release(&self, _last_position: Option<Position>) -> BoxFuture<'_, ()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {})
        }
    }

    fn test_config(max_retries: u32, base_delay: &str) -> ClientConfig {
        let mut config = ClientConfig::for_testing();
        config.reconnect = ReconnectConfig {
            max_retries,
            base_delay: base_delay.to_string(),
            max_delay: "1h".to_string(),
        };
        config
    }

    fn batch(n: u64) -> EventBatch<u64> {
        EventBatch::new(vec![n], Position::binlog("binlog.000001", n))
    }

    async fn wait_for_state(sup: &Supervisor<Scripted>, want: ClientState) {
        let mut rx = sup.state_receiver();
        tokio::time::timeout(Duration::from_secs(3600), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    fn refused() -> Result<()> {
        Err(ClientError::transport_msg("scripted:0", "refused"))
    }

    #[tokio::test]
    async fn test_start_installs_session() {
        let (sup, _rx) = Supervisor::new(Scripted::script(vec![Ok(())]), &test_config(3, "10ms"));
        sup.start(Some(Position::binlog("binlog.000001", 4))).await.unwrap();

        assert_eq!(sup.state(), ClientState::Streaming);
        assert_eq!(sup.generation(), 1);

        let (producer, _) = sup.subscriber().last_context();
        producer.push(batch(7)).await.unwrap();
        let got = sup.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(got.events, vec![7]);
        assert_eq!(sup.resume_position(), Some(Position::binlog("binlog.000001", 7)));
    }

    #[tokio::test]
    async fn test_start_failure_is_returned() {
        let (sup, _rx) = Supervisor::new(Scripted::script(vec![refused()]), &test_config(3, "10ms"));
        let err = sup.start(None).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sup.state(), ClientState::Created);
        assert_eq!(sup.retry_attempts(), 0);
    }

    #[tokio::test]
    async fn test_poll_before_start_is_invalid_state() {
        let (sup, _rx) = Supervisor::new(Scripted::default(), &test_config(3, "10ms"));
        let err = sup.poll(Duration::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_bound_exact_attempts_and_delays() {
        let subscriber = Scripted::script(vec![Ok(()), refused(), refused(), refused()]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "100ms"));
        sup.start(None).await.unwrap();

        let given_up = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&given_up);
        sup.set_error_callback(Arc::new(move |e| {
            if matches!(e, ClientError::GivenUp { attempts: 3 }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        tokio::spawn(Arc::clone(&sup).run_watcher(rx));
        let (_, notifier) = sup.subscriber().last_context();
        notifier.notify(ClientError::transport_msg("scripted:0", "reset"));

        wait_for_state(&sup, ClientState::GivenUp).await;

        let opened = sup.subscriber().opened.lock().unwrap().clone();
        // Initial open + exactly 3 reconnect attempts
        assert_eq!(opened.len(), 4);
        assert_eq!(opened[2].0 - opened[1].0, Duration::from_millis(100));
        assert_eq!(opened[3].0 - opened[2].0, Duration::from_millis(200));

        assert_eq!(given_up.load(Ordering::SeqCst), 1);
        assert_eq!(sup.subscriber().released.load(Ordering::SeqCst), 1);
        assert!(matches!(
            sup.poll(Duration::from_millis(1)).await,
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resumes_from_checkpoint() {
        let subscriber = Scripted::script(vec![Ok(()), refused(), Ok(())]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "50ms"));
        sup.start(Some(Position::binlog("binlog.000001", 4))).await.unwrap();
        tokio::spawn(Arc::clone(&sup).run_watcher(rx));

        let (producer, notifier) = sup.subscriber().last_context();
        producer.push(batch(100)).await.unwrap();
        producer.push(batch(200)).await.unwrap();

        let first = sup.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        sup.ack(&first.position).await.unwrap();
        // Polled but never acked
        let _second = sup.poll(Duration::from_millis(10)).await.unwrap().unwrap();

        drop(producer);
        notifier.notify(ClientError::transport_msg("scripted:0", "eof"));

        // Wait for the reconnect cycle to finish
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.state(), ClientState::Streaming);
        assert_eq!(sup.retry_attempts(), 0);

        let opened = sup.subscriber().opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 3);
        for (_, position) in &opened[1..] {
            assert_eq!(position, &Some(Position::binlog("binlog.000001", 100)));
        }
        assert_eq!(sup.subscriber().acked.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_and_duplicate_disconnects_ignored() {
        let subscriber = Scripted::script(vec![Ok(()), Ok(())]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "10ms"));
        sup.start(None).await.unwrap();
        tokio::spawn(Arc::clone(&sup).run_watcher(rx));

        let (_, notifier) = sup.subscriber().last_context();
        assert!(notifier.notify(ClientError::transport_msg("scripted:0", "reset")));
        // Same notifier fires once
        assert!(!notifier.notify(ClientError::transport_msg("scripted:0", "reset again")));
        // Signal from a generation that never was live
        DisconnectNotifier::new(99, sup.disconnect_tx.clone())
            .notify(ClientError::transport_msg("scripted:0", "ghost"));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.state(), ClientState::Streaming);
        assert_eq!(sup.subscriber().open_count(), 2);
        assert_eq!(sup.generation(), 2);

        // The original session's generation is stale now
        DisconnectNotifier::new(1, sup.disconnect_tx.clone())
            .notify(ClientError::transport_msg("scripted:0", "late"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.subscriber().open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_backoff_stops_attempts() {
        let subscriber = Scripted::script(vec![Ok(()), refused(), refused(), refused()]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "10s"));
        sup.start(None).await.unwrap();
        tokio::spawn(Arc::clone(&sup).run_watcher(rx));

        let (_, notifier) = sup.subscriber().last_context();
        notifier.notify(ClientError::transport_msg("scripted:0", "reset"));

        // First reconnect attempt fails, then we sit in a 10s backoff
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sup.subscriber().open_count(), 2);
        assert_eq!(sup.state(), ClientState::Reconnecting);

        sup.close().await;
        sup.close().await;
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(sup.state(), ClientState::Closed);
        assert_eq!(sup.subscriber().open_count(), 2);
        assert_eq!(sup.subscriber().released.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_error_reported_before_reconnect() {
        let subscriber = Scripted::script(vec![Ok(()), Ok(())]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "10ms"));
        sup.start(None).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sup.set_error_callback(Arc::new(move |e| sink.lock().unwrap().push(e.kind())));
        tokio::spawn(Arc::clone(&sup).run_watcher(rx));

        let (_, notifier) = sup.subscriber().last_context();
        notifier.notify(ClientError::protocol("unknown table id 123"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(seen.lock().unwrap().as_slice(), &["protocol"]);
        assert_eq!(sup.state(), ClientState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_returns_none_while_reconnecting() {
        let subscriber = Scripted::script(vec![Ok(()), refused(), Ok(())]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "500ms"));
        sup.start(None).await.unwrap();
        tokio::spawn(Arc::clone(&sup).run_watcher(rx));

        let (producer, notifier) = sup.subscriber().last_context();
        drop(producer);
        notifier.notify(ClientError::transport_msg("scripted:0", "eof"));

        let got = sup.poll(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wakes_when_replacement_queue_installed() {
        let subscriber = Scripted::script(vec![Ok(()), Ok(())]);
        let (sup, rx) = Supervisor::new(subscriber, &test_config(3, "10ms"));
        sup.start(None).await.unwrap();

        let (producer, notifier) = sup.subscriber().last_context();
        drop(producer);

        let poller = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                let got = sup.poll(Duration::from_secs(30)).await.unwrap();
                (got.is_none(), started.elapsed())
            })
        };
        // Let the poller find the dead queue and park
        tokio::time::sleep(Duration::from_millis(1)).await;

        tokio::spawn(Arc::clone(&sup).run_watcher(rx));
        notifier.notify(ClientError::transport_msg("scripted:0", "eof"));

        let (empty, waited) = poller.await.unwrap();
        assert!(empty);
        assert!(waited < Duration::from_secs(1), "poll slept through the swap: {:?}", waited);
        assert_eq!(sup.generation(), 2);

        // The new queue delivers
        let (producer, _) = sup.subscriber().last_context();
        producer.push(batch(9)).await.unwrap();
        let got = sup.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(got.events, vec![9]);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (sup, _rx) = Supervisor::new(Scripted::script(vec![Ok(())]), &test_config(3, "10ms"));
        sup.start(None).await.unwrap();
        sup.close().await;
        sup.close().await;
        assert_eq!(sup.state(), ClientState::Closed);
        assert!(sup.is_closed());
        assert_eq!(sup.queue_depth(), 0);
    }

    #[test]
    fn test_detached_notifier() {
        let notifier = DisconnectNotifier::detached();
        assert_eq!(notifier.generation(), 0);
        assert!(notifier.notify(ClientError::Shutdown));
        assert!(notifier.has_fired());
    }
}
