//! One CDC protocol connection.
//!
//! ```text
//! connect ──greeting──▶ Negotiating ──login──▶ Authenticating ──ok──▶ LoggedIn
//!                                                                       │
//!                                    stop_streaming ◀── Streaming ◀── stream_data /
//!                                                                    start_streaming
//! ```
//!
//! Requests are correlated by `requestId` through a single pending slot.
//! Everything the I/O task cannot place goes to the generic handler:
//! responses for a request nobody waits for, responses with a foreign
//! id, and data records while no stream is attached. A `FAILED` response
//! is reported to the error callback exactly once, whether or not a
//! request was waiting for it.

use super::codec::{CdcCodecError, ClientCodec};
use super::decoder::StreamDecoder;
use super::message::{CdcRequest, CdcResponse, DataRecord, RequestBody, ResponseResult, SchemaTable};
use crate::config::{ConnectInfo, SessionConfig};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::pending::PendingRequest;
use crate::queue::QueueProducer;
use crate::session::{ConnectionState, SessionState};
use crate::supervisor::{DisconnectNotifier, ErrorCallback};
use futures::{SinkExt, StreamExt};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, info_span, trace, warn, Instrument};

type FrameReader = FramedRead<OwnedReadHalf, ClientCodec>;
type FrameWriter = FramedWrite<OwnedWriteHalf, ClientCodec>;

/// Receives responses the session could not place.
pub type GenericHandler = Arc<dyn Fn(&CdcResponse) + Send + Sync>;

fn codec_error(endpoint: &str, err: CdcCodecError) -> ClientError {
    match err {
        CdcCodecError::Io(e) => ClientError::transport(endpoint, e),
        CdcCodecError::Json(e) => ClientError::Codec(e.to_string()),
    }
}

fn failure(response: &CdcResponse) -> ClientError {
    let code = response.error_code.clone().unwrap_or_default();
    let message = response
        .error_message
        .clone()
        .unwrap_or_else(|| "request failed".to_string());
    ClientError::server(&code, code.clone(), message)
}

/// Request id generator: `<connection nonce>-<counter>`.
#[derive(Debug)]
pub struct RequestIds {
    nonce: String,
    counter: AtomicU64,
}

impl RequestIds {
    pub fn new(seed: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let digest = Sha256::digest(format!("{}-{}-{}", std::process::id(), nanos, seed));
        Self::with_nonce(hex::encode(&digest[..8]))
    }

    pub fn with_nonce(nonce: impl Into<String>) -> Self {
        Self {
            nonce: nonce.into(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> (u64, String) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        (n, format!("{}-{}", self.nonce, n))
    }

    /// Counter of an id this generator issued.
    pub fn parse(&self, request_id: &str) -> Option<u64> {
        request_id
            .strip_prefix(self.nonce.as_str())?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
}

#[derive(Default)]
struct Hooks {
    on_error: RwLock<Option<ErrorCallback>>,
    generic: RwLock<Option<GenericHandler>>,
}

impl Hooks {
    fn report_error(&self, endpoint: &str, err: &ClientError) {
        if let ClientError::Server { code, .. } = err {
            metrics::record_server_error(endpoint, code);
        }
        warn!(endpoint = %endpoint, error = %err, "CDC server reported an error");
        let callback = self.on_error.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }

    fn unhandled(&self, endpoint: &str, response: &CdcResponse) {
        let handler = self.generic.read().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(handler) => handler(response),
            None => warn!(
                endpoint = %endpoint,
                request_id = %response.request_id,
                status = ?response.status,
                "Unhandled CDC response"
            ),
        }
    }
}

enum Control {
    Attach {
        producer: QueueProducer<DataRecord>,
        disconnect: DisconnectNotifier,
        ack: oneshot::Sender<()>,
    },
    Detach {
        ack: oneshot::Sender<()>,
    },
}

struct Attached {
    decoder: StreamDecoder,
    producer: QueueProducer<DataRecord>,
    disconnect: DisconnectNotifier,
}

/// A connected CDC session.
pub struct StreamSession {
    endpoint: String,
    command_timeout: Duration,
    server_version: String,
    state: Arc<SessionState>,
    writer: tokio::sync::Mutex<FrameWriter>,
    request_lock: tokio::sync::Mutex<()>,
    ids: Arc<RequestIds>,
    pending: Arc<PendingRequest<CdcResponse>>,
    hooks: Arc<Hooks>,
    control: mpsc::UnboundedSender<Control>,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Connect and wait for the server greeting.
    pub async fn connect(info: &ConnectInfo, config: &SessionConfig) -> Result<Self> {
        let endpoint = info.endpoint();
        let state = Arc::new(SessionState::new(endpoint.clone()));
        state.transition(ConnectionState::Connecting)?;

        let connect_timeout = config.connect_timeout_duration();
        let stream = match tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((info.host.as_str(), info.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientError::transport(endpoint, e)),
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    endpoint,
                    timeout: connect_timeout,
                })
            }
        };
        let _ = stream.set_nodelay(true);
        let seed = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, ClientCodec::new());
        let writer = FramedWrite::new(write_half, ClientCodec::new());
        state.transition(ConnectionState::Negotiating)?;

        let command_timeout = config.command_timeout_duration();
        let server_version = match tokio::time::timeout(command_timeout, reader.next()).await {
            Ok(Some(Ok(greeting))) => greeting_version(&greeting)?,
            Ok(Some(Err(e))) => return Err(codec_error(&endpoint, e)),
            Ok(None) => {
                return Err(ClientError::transport_msg(
                    &endpoint,
                    "connection closed before server greeting",
                ))
            }
            Err(_) => {
                return Err(ClientError::Timeout {
                    operation: "server greeting".to_string(),
                    timeout: command_timeout,
                })
            }
        };

        let ids = Arc::new(RequestIds::new(&seed));
        let pending = Arc::new(PendingRequest::new());
        let hooks = Arc::new(Hooks::default());
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let io = IoTask {
            endpoint: endpoint.clone(),
            state: Arc::clone(&state),
            ids: Arc::clone(&ids),
            pending: Arc::clone(&pending),
            hooks: Arc::clone(&hooks),
        };
        let span = info_span!("cdc_io", endpoint = %endpoint);
        let handle = tokio::spawn(io.run(reader, control_rx).instrument(span));

        info!(endpoint = %endpoint, server_version = %server_version, "CDC server greeting received");
        Ok(Self {
            endpoint,
            command_timeout,
            server_version,
            state,
            writer: tokio::sync::Mutex::new(writer),
            request_lock: tokio::sync::Mutex::new(()),
            ids,
            pending,
            hooks,
            control: control_tx,
            io_task: Mutex::new(Some(handle)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Callback for `FAILED` responses. Called once per response.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.hooks.on_error.write().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Handler for responses no request is waiting for.
    pub fn set_generic_handler(&self, handler: GenericHandler) {
        *self.hooks.generic.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.state.expect(ConnectionState::Negotiating)?;
        self.state.transition(ConnectionState::Authenticating)?;
        self.request(RequestBody::login(username, password)).await?;
        self.state.transition(ConnectionState::LoggedIn)?;
        debug!(endpoint = %self.endpoint, username, "CDC login succeeded");
        Ok(())
    }

    /// Create a stream and start delivering its records to `producer`.
    /// Returns the server-assigned streaming id.
    pub async fn start_streaming(
        &self,
        database: &str,
        schema_tables: Vec<SchemaTable>,
        full: bool,
        producer: QueueProducer<DataRecord>,
        disconnect: DisconnectNotifier,
    ) -> Result<String> {
        self.state.expect(ConnectionState::LoggedIn)?;
        self.attach(producer, disconnect).await?;
        let body = RequestBody::StreamData {
            database: database.to_string(),
            source_schema_tables: schema_tables,
            full,
        };
        let streaming_id = match self.request(body).await {
            Ok(CdcResponse {
                result: Some(ResponseResult::StreamData { streaming_id }),
                ..
            }) => streaming_id,
            Ok(_) => {
                self.detach().await;
                return Err(ClientError::protocol("STREAM_DATA response without streaming id"));
            }
            Err(e) => {
                self.detach().await;
                return Err(e);
            }
        };
        self.enter_streaming();
        info!(endpoint = %self.endpoint, streaming_id = %streaming_id, database, full, "CDC stream created");
        Ok(streaming_id)
    }

    /// Resume an existing stream after `from_ack_id`.
    pub async fn restart_streaming(
        &self,
        streaming_id: &str,
        from_ack_id: Option<&str>,
        producer: QueueProducer<DataRecord>,
        disconnect: DisconnectNotifier,
    ) -> Result<()> {
        self.state.expect(ConnectionState::LoggedIn)?;
        self.attach(producer, disconnect).await?;
        let body = RequestBody::StartStreaming {
            streaming_id: streaming_id.to_string(),
            from_ack_id: from_ack_id.map(str::to_string),
        };
        if let Err(e) = self.request(body).await {
            self.detach().await;
            return Err(e);
        }
        self.enter_streaming();
        info!(endpoint = %self.endpoint, streaming_id, from_ack_id = ?from_ack_id, "CDC stream restarted");
        Ok(())
    }

    /// Stop a stream. The server keeps it for a later restart.
    pub async fn stop_streaming(&self, streaming_id: &str) -> Result<()> {
        self.streaming_command(RequestBody::StopStreaming {
            streaming_id: streaming_id.to_string(),
        })
        .await
    }

    /// Stop a stream and release it on the server.
    pub async fn drop_streaming(&self, streaming_id: &str) -> Result<()> {
        self.streaming_command(RequestBody::DropStreaming {
            streaming_id: streaming_id.to_string(),
        })
        .await
    }

    /// Acknowledge everything up to `ack_id`. The server does not answer.
    pub async fn ack(&self, streaming_id: &str, ack_id: &str) -> Result<()> {
        self.state.expect(ConnectionState::Streaming)?;
        let (_, request_id) = self.ids.next();
        let body = RequestBody::AckStreaming {
            streaming_id: streaming_id.to_string(),
            ack_id: ack_id.to_string(),
        };
        self.send(CdcRequest::new(request_id, body)).await?;
        metrics::record_ack(&self.endpoint);
        trace!(endpoint = %self.endpoint, streaming_id, ack_id, "Acked");
        Ok(())
    }

    /// Close the session. Idempotent; never reports a disconnect.
    pub async fn close(&self) {
        if !self.state.begin_close() {
            return;
        }
        let _ = self.pending.resolve_current(Err(ClientError::Shutdown));
        if let Ok(mut writer) =
            tokio::time::timeout(Duration::from_millis(200), self.writer.lock()).await
        {
            let _ = tokio::time::timeout(Duration::from_millis(200), writer.close()).await;
        }
        if let Some(handle) = self.io_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        debug!(endpoint = %self.endpoint, "CDC session closed");
    }

    /// The connection may already have died after the server accepted the
    /// stream; that death was reported through the disconnect notifier.
    fn enter_streaming(&self) {
        if let Err(e) = self.state.transition(ConnectionState::Streaming) {
            debug!(endpoint = %self.endpoint, error = %e, "Connection ended as the stream started");
        }
    }

    async fn streaming_command(&self, body: RequestBody) -> Result<()> {
        let current = self.state.get();
        if !matches!(current, ConnectionState::LoggedIn | ConnectionState::Streaming) {
            return Err(ClientError::invalid_state(ConnectionState::LoggedIn, current));
        }
        self.request(body).await?;
        if current == ConnectionState::Streaming {
            self.detach().await;
            self.state.transition(ConnectionState::LoggedIn)?;
        }
        Ok(())
    }

    async fn request(&self, body: RequestBody) -> Result<CdcResponse> {
        let _guard = self.request_lock.lock().await;
        let operation = body.name();
        let (id, request_id) = self.ids.next();
        let waiter = self.pending.install(id);
        if let Err(e) = self.send(CdcRequest::new(request_id, body)).await {
            self.pending.clear(id);
            return Err(e);
        }
        let started = Instant::now();
        let result = waiter.wait(&self.pending, operation, self.command_timeout).await;
        metrics::record_command_latency(&self.endpoint, operation, started.elapsed());
        result
    }

    async fn send(&self, request: CdcRequest) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(request)
            .await
            .map_err(|e| codec_error(&self.endpoint, e))
    }

    async fn attach(
        &self,
        producer: QueueProducer<DataRecord>,
        disconnect: DisconnectNotifier,
    ) -> Result<()> {
        let (ack, done) = oneshot::channel();
        let control = Control::Attach {
            producer,
            disconnect,
            ack,
        };
        if self.control.send(control).is_err() || done.await.is_err() {
            return Err(ClientError::transport_msg(&self.endpoint, "I/O task stopped"));
        }
        Ok(())
    }

    async fn detach(&self) {
        let (ack, done) = oneshot::channel();
        if self.control.send(Control::Detach { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if let Some(handle) = self.io_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

fn greeting_version(greeting: &CdcResponse) -> Result<String> {
    if greeting.is_failed() {
        return Err(failure(greeting));
    }
    match &greeting.result {
        Some(ResponseResult::ServerGreeting { server_version, .. }) => Ok(server_version.clone()),
        _ => Err(ClientError::protocol("expected server greeting")),
    }
}

struct IoTask {
    endpoint: String,
    state: Arc<SessionState>,
    ids: Arc<RequestIds>,
    pending: Arc<PendingRequest<CdcResponse>>,
    hooks: Arc<Hooks>,
}

impl IoTask {
    async fn run(self, mut reader: FrameReader, mut control: mpsc::UnboundedReceiver<Control>) {
        let mut attached: Option<Attached> = None;
        let exit = loop {
            tokio::select! {
                biased;
                ctrl = control.recv() => match ctrl {
                    Some(Control::Attach { producer, disconnect, ack }) => {
                        attached = Some(Attached {
                            decoder: StreamDecoder::new(self.endpoint.clone()),
                            producer,
                            disconnect,
                        });
                        let _ = ack.send(());
                    }
                    Some(Control::Detach { ack }) => {
                        attached = None;
                        let _ = ack.send(());
                    }
                    None => break None,
                },
                frame = reader.next() => match frame {
                    Some(Ok(response)) => {
                        if let Err(e) = self.handle(&mut attached, response).await {
                            break Some(e);
                        }
                    }
                    Some(Err(e)) => break Some(codec_error(&self.endpoint, e)),
                    None => break Some(ClientError::transport_msg(&self.endpoint, "connection closed by server")),
                },
            }
        };

        if let Some(id) = self.pending.current_id() {
            self.pending.clear(id);
        }
        let Some(error) = exit else {
            return;
        };
        if self.state.is_closing() {
            trace!(endpoint = %self.endpoint, error = %error, "I/O task stopped after close");
            return;
        }
        match attached {
            Some(_) if matches!(error, ClientError::Shutdown) => {
                debug!(endpoint = %self.endpoint, "Queue replaced; stale session stopping");
            }
            Some(attached) => {
                warn!(endpoint = %self.endpoint, error = %error, "CDC stream failed");
                attached.disconnect.notify(error);
            }
            None => debug!(endpoint = %self.endpoint, error = %error, "CDC connection ended"),
        }
        let _ = self.state.transition(ConnectionState::Disconnected);
    }

    async fn handle(&self, attached: &mut Option<Attached>, mut response: CdcResponse) -> Result<()> {
        if response.is_failed() {
            self.handle_failure(response);
            return Ok(());
        }

        if response.is_data() {
            let Some(stream) = attached.as_mut() else {
                self.hooks.unhandled(&self.endpoint, &response);
                return Ok(());
            };
            if let Some(result) = response.result.take() {
                if let Some(batch) = stream.decoder.decode(result)? {
                    metrics::record_batch_decoded(&self.endpoint, batch.len());
                    stream.producer.push(batch).await?;
                }
            }
            return Ok(());
        }

        match self.ids.parse(&response.request_id) {
            Some(id) => {
                if let Err(Ok(unclaimed)) = self.pending.resolve(id, Ok(response)) {
                    self.hooks.unhandled(&self.endpoint, &unclaimed);
                }
            }
            None => self.hooks.unhandled(&self.endpoint, &response),
        }
        Ok(())
    }

    fn handle_failure(&self, response: CdcResponse) {
        self.hooks.report_error(&self.endpoint, &failure(&response));
        let resolved = self
            .ids
            .parse(&response.request_id)
            .map(|id| self.pending.resolve(id, Err(failure(&response))).is_ok())
            .unwrap_or(false);
        if !resolved {
            self.hooks.unhandled(&self.endpoint, &response);
        }
    }
}
