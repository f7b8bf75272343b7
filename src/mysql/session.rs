//! One MySQL replication connection.
//!
//! # Pipeline
//!
//! ```text
//!  TcpStream ─┬─ read half ─▶ FramedRead<MySqlPacketCodec> ─▶ I/O task
//!             │                   (length + seq, reassembly)     │
//!             │                                                  ▼
//!             │                                 mode stage (one of):
//!             │                                  Negotiating → raw packets to connect()
//!             │                                  Command     → ResultSetAssembler → pending slot
//!             │                                  Streaming   → BinlogDecoder → queue
//!             │
//!             └─ write half ◀─ FramedWrite<MySqlPacketCodec> ◀─ send_command (async mutex)
//! ```
//!
//! Both codec halves share one [`SequenceTracker`]: every inbound packet
//! sets the next outbound sequence id, every command resets it.
//!
//! The mode stage is switched by control messages from the session. The
//! switch to streaming is acknowledged before the dump command is
//! written, so no binlog packet can land in the command stage.

use super::auth::{AuthPlugin, FAST_AUTH_SUCCESS, PERFORM_FULL_AUTH};
use super::codec::{MySqlPacket, MySqlPacketCodec, SequenceTracker};
use super::decoder::{BinlogDecoder, CRC32_CHECKSUM_LEN};
use super::event::BinlogEvent;
use super::packet::{
    com_binlog_dump, com_query, com_quit, com_register_slave, parse_server_version,
    AuthSwitchRequest, CapabilityFlags, CommandResponse, ErrPacket, Handshake, HandshakeResponse,
    ResultSet, ResultSetAssembler,
};
use crate::config::{ConnectInfo, SessionConfig};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::pending::PendingRequest;
use crate::position::Position;
use crate::queue::QueueProducer;
use crate::session::{ConnectionState, SessionState};
use crate::supervisor::DisconnectNotifier;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, info_span, trace, warn, Instrument};

type PacketReader = FramedRead<OwnedReadHalf, MySqlPacketCodec>;
type PacketWriter = FramedWrite<OwnedWriteHalf, MySqlPacketCodec>;

/// Streaming parameters for [`MySqlSession::begin_streaming`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub heartbeat_interval: Duration,
    /// Assemble row events into whole transactions.
    pub transactional: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            transactional: true,
        }
    }
}

enum Control {
    Command {
        ack: oneshot::Sender<()>,
    },
    Stream {
        decoder: BinlogDecoder,
        producer: QueueProducer<BinlogEvent>,
        disconnect: DisconnectNotifier,
        ack: oneshot::Sender<()>,
    },
}

enum Mode {
    Negotiating(mpsc::UnboundedSender<Bytes>),
    Command(ResultSetAssembler),
    Streaming {
        decoder: BinlogDecoder,
        producer: QueueProducer<BinlogEvent>,
        disconnect: DisconnectNotifier,
    },
}

impl Mode {
    fn name(&self) -> &'static str {
        match self {
            Mode::Negotiating(_) => "negotiating",
            Mode::Command(_) => "command",
            Mode::Streaming { .. } => "streaming",
        }
    }
}

enum Inbound {
    Packet(MySqlPacket),
    Failed(std::io::Error),
    Eof,
    Idle,
}

/// A connected, authenticated MySQL session.
pub struct MySqlSession {
    info: ConnectInfo,
    endpoint: String,
    command_timeout: Duration,
    state: Arc<SessionState>,
    handshake: Handshake,
    local_port: u16,
    writer: tokio::sync::Mutex<PacketWriter>,
    command_lock: tokio::sync::Mutex<()>,
    sequence: SequenceTracker,
    pending: Arc<PendingRequest<CommandResponse>>,
    control: mpsc::UnboundedSender<Control>,
    next_request: AtomicU64,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl MySqlSession {
    /// Connect and authenticate. Returns once the session accepts commands.
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
        let local_port = stream.local_addr().map(|a| a.port()).unwrap_or(0);

        let (read_half, write_half) = stream.into_split();
        let sequence = SequenceTracker::new();
        let reader = FramedRead::new(read_half, MySqlPacketCodec::new(sequence.clone()));
        let mut writer = FramedWrite::new(write_half, MySqlPacketCodec::new(sequence.clone()));

        let pending = Arc::new(PendingRequest::new());
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let io = IoTask {
            endpoint: endpoint.clone(),
            idle_timeout: config.idle_timeout(),
            state: Arc::clone(&state),
            pending: Arc::clone(&pending),
        };
        let span = info_span!("mysql_io", endpoint = %endpoint);
        let handle = tokio::spawn(
            io.run(reader, control_rx, Mode::Negotiating(raw_tx))
                .instrument(span),
        );

        let command_timeout = config.command_timeout_duration();
        let mut negotiation = Negotiation {
            info,
            endpoint: &endpoint,
            state: &state,
            writer: &mut writer,
            raw: raw_rx,
            timeout: command_timeout,
        };
        let handshake = match negotiation.run().await {
            Ok(handshake) => handshake,
            Err(e) => {
                handle.abort();
                return Err(e);
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if control_tx.send(Control::Command { ack: ack_tx }).is_err() || ack_rx.await.is_err() {
            handle.abort();
            return Err(ClientError::transport_msg(
                &endpoint,
                "connection closed right after authentication",
            ));
        }
        state.transition(ConnectionState::LoggedIn)?;
        info!(
            endpoint = %endpoint,
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            "Authenticated"
        );

        Ok(Self {
            info: info.clone(),
            endpoint,
            command_timeout,
            state,
            handshake,
            local_port,
            writer: tokio::sync::Mutex::new(writer),
            command_lock: tokio::sync::Mutex::new(()),
            sequence,
            pending,
            control: control_tx,
            next_request: AtomicU64::new(1),
            io_task: Mutex::new(Some(handle)),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn server_version(&self) -> &str {
        &self.handshake.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.handshake.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn state_receiver(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Send one command and wait for its complete response.
    ///
    /// Rejected with `InvalidState` once streaming has begun or the
    /// session is closed.
    pub async fn send_command(&self, payload: Bytes, operation: &str) -> Result<CommandResponse> {
        let _guard = self.command_lock.lock().await;
        self.state.expect(ConnectionState::LoggedIn)?;

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let waiter = self.pending.install(request_id);
        self.sequence.reset();
        if let Err(e) = self.write(payload).await {
            self.pending.clear(request_id);
            return Err(e);
        }

        let started = Instant::now();
        let result = waiter.wait(&self.pending, operation, self.command_timeout).await;
        metrics::record_command_latency(&self.endpoint, operation, started.elapsed());
        result
    }

    /// Run a statement that returns no rows.
    ///
    /// `Ok(false)` when the connection went away without answering.
    pub async fn execute(&self, sql: &str) -> Result<bool> {
        match self.send_command(com_query(sql), "COM_QUERY").await {
            Ok(CommandResponse::Ok(_)) => Ok(true),
            Ok(CommandResponse::Err(err)) => Err(err.into_error()),
            Ok(CommandResponse::ResultSet(_)) => {
                Err(ClientError::protocol("unexpected response type"))
            }
            Err(ClientError::Internal(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run a statement and return the affected row count.
    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        match self.send_command(com_query(sql), "COM_QUERY").await {
            Ok(CommandResponse::Ok(ok)) => Ok(ok.affected_rows),
            Ok(CommandResponse::Err(err)) => Err(err.into_error()),
            Ok(CommandResponse::ResultSet(_)) => {
                Err(ClientError::protocol("unexpected response type"))
            }
            Err(ClientError::Internal(_)) => Err(ClientError::Internal(
                "Could not get MySQL OK packet".to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Run a query and return its text result set.
    pub async fn execute_query(&self, sql: &str) -> Result<ResultSet> {
        match self.send_command(com_query(sql), "COM_QUERY").await {
            Ok(CommandResponse::ResultSet(rs)) => Ok(rs),
            Ok(CommandResponse::Err(err)) => Err(err.into_error()),
            Ok(CommandResponse::Ok(_)) => Err(ClientError::protocol("unexpected response type")),
            Err(ClientError::Internal(_)) => Err(ClientError::Internal(
                "Could not get MySQL FieldCount/ColumnDefinition/TextResultSetRow packet"
                    .to_string(),
            )),
            Err(e) => Err(e),
        }
    }

    /// Negotiate the checksum, register as a replica and start the dump
    /// from `position`. Decoded batches go to `producer`; the I/O task
    /// reports its death through `disconnect`.
    pub async fn begin_streaming(
        &self,
        position: &Position,
        options: &StreamOptions,
        producer: QueueProducer<BinlogEvent>,
        disconnect: DisconnectNotifier,
    ) -> Result<()> {
        let Position::Binlog {
            file_name, offset, ..
        } = position
        else {
            return Err(ClientError::Config(format!(
                "binlog session cannot resume from {}",
                position
            )));
        };
        let offset = u32::try_from(*offset).map_err(|_| {
            ClientError::Config(format!("binlog offset {} exceeds COM_BINLOG_DUMP range", offset))
        })?;

        let checksum_len = self.negotiate_checksum().await?;

        let nanos = options.heartbeat_interval.as_nanos();
        self.execute(&format!("SET @master_heartbeat_period = {}", nanos))
            .await?;

        match self
            .send_command(
                com_register_slave(self.info.server_id, self.local_port),
                "COM_REGISTER_SLAVE",
            )
            .await?
        {
            CommandResponse::Ok(_) => {}
            CommandResponse::Err(err) => return Err(err.into_error()),
            CommandResponse::ResultSet(_) => {
                return Err(ClientError::protocol("unexpected response to COM_REGISTER_SLAVE"))
            }
        }

        let _guard = self.command_lock.lock().await;
        self.state.expect(ConnectionState::LoggedIn)?;

        let decoder = BinlogDecoder::new(
            self.endpoint.clone(),
            file_name.clone(),
            checksum_len,
            options.transactional,
        );
        let (ack_tx, ack_rx) = oneshot::channel();
        let control = Control::Stream {
            decoder,
            producer,
            disconnect,
            ack: ack_tx,
        };
        if self.control.send(control).is_err() || ack_rx.await.is_err() {
            return Err(ClientError::transport_msg(&self.endpoint, "I/O task stopped"));
        }

        self.state.transition(ConnectionState::Streaming)?;
        self.sequence.reset();
        self.write(com_binlog_dump(offset, 0, self.info.server_id, file_name))
            .await?;
        info!(
            endpoint = %self.endpoint,
            file = %file_name,
            offset,
            checksum_len,
            transactional = options.transactional,
            "Binlog dump started"
        );
        Ok(())
    }

    async fn negotiate_checksum(&self) -> Result<usize> {
        if parse_server_version(&self.handshake.server_version) < (5, 6, 0) {
            return Ok(0);
        }
        self.execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        let rs = self.execute_query("SELECT @@global.binlog_checksum").await?;
        checksum_length(rs.first_value().unwrap_or(""))
    }

    /// Current binlog coordinates of the server.
    pub async fn master_status(&self) -> Result<Position> {
        let rs = match self.execute_query("SHOW MASTER STATUS").await {
            Ok(rs) => rs,
            // 8.4 removed the old spelling
            Err(ClientError::Server { .. }) => self.execute_query("SHOW BINARY LOG STATUS").await?,
            Err(e) => return Err(e),
        };
        let file = rs
            .value(0, "File")
            .ok_or_else(|| ClientError::Config("binary logging is disabled on the source".into()))?;
        let offset = rs
            .value(0, "Position")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| ClientError::protocol("SHOW MASTER STATUS returned no position"))?;
        Ok(Position::binlog(file, offset))
    }

    /// Close the session. Idempotent; never reports a disconnect.
    pub async fn close(&self) {
        if !self.state.begin_close() {
            return;
        }
        let _ = self.pending.resolve_current(Err(ClientError::Shutdown));
        // Best effort: the server may already be gone.
        self.sequence.reset();
        if let Ok(mut writer) = tokio::time::timeout(Duration::from_millis(200), self.writer.lock()).await {
            let _ = tokio::time::timeout(Duration::from_millis(200), writer.send(com_quit())).await;
        }
        self.abort_io();
        debug!(endpoint = %self.endpoint, "Session closed");
    }

    fn abort_io(&self) {
        if let Some(handle) = self.io_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    async fn write(&self, payload: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer
            .send(payload)
            .await
            .map_err(|e| ClientError::transport(&self.endpoint, e))
    }
}

impl Drop for MySqlSession {
    fn drop(&mut self) {
        self.abort_io();
    }
}

/// `NONE` → 0, `CRC32` → 4.
pub fn checksum_length(value: &str) -> Result<usize> {
    match value.trim().to_ascii_uppercase().as_str() {
        "NONE" => Ok(0),
        "CRC32" => Ok(CRC32_CHECKSUM_LEN),
        other => Err(ClientError::Unsupported(format!(
            "unsupported binlog checksum {}",
            other
        ))),
    }
}

/// Greeting and authentication, before the session object exists.
struct Negotiation<'a> {
    info: &'a ConnectInfo,
    endpoint: &'a str,
    state: &'a SessionState,
    writer: &'a mut PacketWriter,
    raw: mpsc::UnboundedReceiver<Bytes>,
    timeout: Duration,
}

impl Negotiation<'_> {
    async fn run(&mut self) -> Result<Handshake> {
        self.state.transition(ConnectionState::Negotiating)?;
        let greeting = self.next("server greeting").await?;
        let handshake = Handshake::parse(&greeting)?;
        debug!(
            server_version = %handshake.server_version,
            connection_id = handshake.connection_id,
            plugin = %handshake.auth_plugin_name,
            "Server greeting"
        );

        // Unknown default plugins get a native scramble; the server will
        // ask for a switch if it disagrees.
        let mut plugin = AuthPlugin::from_name(&handshake.auth_plugin_name).unwrap_or(AuthPlugin::Native);
        let response = HandshakeResponse {
            capability_flags: CapabilityFlags::client_default(self.info.database.is_some()),
            username: self.info.username.clone(),
            auth_response: plugin.scramble(&self.info.password, &handshake.auth_plugin_data),
            database: self.info.database.clone(),
            auth_plugin_name: plugin.name().to_string(),
        };
        self.state.transition(ConnectionState::Authenticating)?;
        self.write(response.encode()).await?;

        loop {
            let packet = self.next("authentication result").await?;
            match packet.first() {
                Some(0x00) => return Ok(handshake),
                Some(0xFF) => return Err(ErrPacket::parse(&packet)?.into_error()),
                Some(0xFE) => {
                    let switch = AuthSwitchRequest::parse(&packet)?;
                    plugin = AuthPlugin::from_name(&switch.plugin_name)?;
                    debug!(plugin = plugin.name(), "Auth switch requested");
                    self.state.transition(ConnectionState::Authenticating)?;
                    let scramble = plugin.scramble(&self.info.password, &switch.plugin_data);
                    self.write(Bytes::from(scramble)).await?;
                }
                Some(0x01) if packet.get(1) == Some(&FAST_AUTH_SUCCESS) => {
                    trace!("Fast auth accepted");
                }
                Some(0x01) if packet.get(1) == Some(&PERFORM_FULL_AUTH) => {
                    return Err(ClientError::Unsupported(
                        "caching_sha2_password full authentication requires TLS or RSA key exchange"
                            .to_string(),
                    ));
                }
                _ => {
                    return Err(ClientError::protocol(format!(
                        "unexpected packet during authentication: {:02X?}",
                        &packet[..packet.len().min(8)]
                    )))
                }
            }
        }
    }

    async fn next(&mut self, what: &str) -> Result<Bytes> {
        match tokio::time::timeout(self.timeout, self.raw.recv()).await {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(ClientError::transport_msg(
                self.endpoint,
                format!("connection closed while waiting for {}", what),
            )),
            Err(_) => Err(ClientError::Timeout {
                operation: what.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn write(&mut self, payload: Bytes) -> Result<()> {
        self.writer
            .send(payload)
            .await
            .map_err(|e| ClientError::transport(self.endpoint, e))
    }
}

/// Reader side of a session.
struct IoTask {
    endpoint: String,
    idle_timeout: Duration,
    state: Arc<SessionState>,
    pending: Arc<PendingRequest<CommandResponse>>,
}

impl IoTask {
    async fn run(
        self,
        mut reader: PacketReader,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut mode: Mode,
    ) {
        let exit = loop {
            let idle = matches!(mode, Mode::Streaming { .. }).then_some(self.idle_timeout);
            let inbound = tokio::select! {
                biased;
                ctrl = control.recv() => match ctrl {
                    Some(ctrl) => {
                        mode = self.switch(ctrl);
                        continue;
                    }
                    // Session dropped
                    None => break None,
                },
                inbound = next_inbound(&mut reader, idle) => inbound,
            };

            let packet = match inbound {
                Inbound::Packet(packet) => packet,
                Inbound::Eof => {
                    break Some(ClientError::transport_msg(&self.endpoint, "connection closed by server"))
                }
                Inbound::Failed(e) => break Some(ClientError::transport(&self.endpoint, e)),
                Inbound::Idle => {
                    break Some(ClientError::transport_msg(
                        &self.endpoint,
                        format!("idle timeout: no packet for {:?}", self.idle_timeout),
                    ))
                }
            };

            if let Err(e) = self.handle(&mut mode, packet.payload).await {
                break Some(e);
            }
        };

        // Dropping the waiter's sender tells send_command there is no answer.
        if let Some(id) = self.pending.current_id() {
            self.pending.clear(id);
        }

        let Some(error) = exit else {
            trace!(endpoint = %self.endpoint, "I/O task stopped by session");
            return;
        };
        if self.state.is_closing() {
            trace!(endpoint = %self.endpoint, error = %error, "I/O task stopped after close");
            return;
        }
        match mode {
            Mode::Streaming { disconnect, .. } => {
                match &error {
                    ClientError::Shutdown => {
                        debug!(endpoint = %self.endpoint, "Queue replaced; stale session stopping");
                    }
                    e => {
                        warn!(endpoint = %self.endpoint, error = %e, "Binlog stream failed");
                        disconnect.notify(error);
                    }
                }
            }
            other => {
                debug!(endpoint = %self.endpoint, mode = other.name(), error = %error, "Connection ended");
            }
        }
        let _ = self.state.transition(ConnectionState::Disconnected);
    }

    fn switch(&self, control: Control) -> Mode {
        match control {
            Control::Command { ack } => {
                let _ = ack.send(());
                Mode::Command(ResultSetAssembler::new())
            }
            Control::Stream {
                decoder,
                producer,
                disconnect,
                ack,
            } => {
                let _ = ack.send(());
                Mode::Streaming {
                    decoder,
                    producer,
                    disconnect,
                }
            }
        }
    }

    async fn handle(&self, mode: &mut Mode, payload: Bytes) -> Result<()> {
        match mode {
            Mode::Negotiating(raw) => {
                let _ = raw.send(payload);
                Ok(())
            }
            Mode::Command(assembler) => {
                let result = match assembler.feed(&payload) {
                    Ok(None) => return Ok(()),
                    Ok(Some(response)) => Ok(response),
                    Err(e) => Err(e),
                };
                if let Err(unclaimed) = self.pending.resolve_current(result) {
                    warn!(
                        endpoint = %self.endpoint,
                        response = ?unclaimed.as_ref().map(command_kind),
                        "Response with no waiting command"
                    );
                }
                Ok(())
            }
            Mode::Streaming {
                decoder, producer, ..
            } => {
                if let Some(batch) = decoder.decode(&payload)? {
                    metrics::record_batch_decoded(&self.endpoint, batch.len());
                    producer.push(batch).await?;
                }
                Ok(())
            }
        }
    }
}

fn command_kind(response: &CommandResponse) -> &'static str {
    match response {
        CommandResponse::Ok(_) => "ok",
        CommandResponse::Err(_) => "err",
        CommandResponse::ResultSet(_) => "result_set",
    }
}

async fn next_inbound(reader: &mut PacketReader, idle: Option<Duration>) -> Inbound {
    let next = match idle {
        Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => reader.next().await,
    };
    match next {
        Some(Ok(packet)) => Inbound::Packet(packet),
        Some(Err(e)) => Inbound::Failed(e),
        None => Inbound::Eof,
    }
}
