//! CDC flavour of [`Subscriber`].

use super::message::{DataRecord, SchemaTable};
use super::session::StreamSession;
use crate::client::ChangeClient;
use crate::config::{ClientConfig, ConnectInfo, SessionConfig};
use crate::error::{ClientError, Result};
use crate::position::Position;
use crate::supervisor::{ErrorCallback, StreamingSession, SubscribeContext, Subscriber};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Change client reading a CDC stream.
pub type StreamClient = ChangeClient<StreamSubscriber>;

/// What to stream when no stream exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub database: String,
    pub schema_tables: Vec<SchemaTable>,
    /// Inventory dump before incremental changes.
    pub full: bool,
}

impl StreamRequest {
    pub fn new(database: impl Into<String>, schema_tables: Vec<SchemaTable>) -> Self {
        Self {
            database: database.into(),
            schema_tables,
            full: false,
        }
    }

    pub fn with_full(mut self, full: bool) -> Self {
        self.full = full;
        self
    }
}

/// Opens CDC sessions against one server.
///
/// The first subscribe without a position creates a stream; every later
/// open (including reconnects) restarts that stream from the resume
/// position's ack id.
pub struct StreamSubscriber {
    info: ConnectInfo,
    session: SessionConfig,
    request: StreamRequest,
    streaming_id: Mutex<Option<String>>,
}

impl StreamSubscriber {
    pub fn new(info: ConnectInfo, config: &ClientConfig, request: StreamRequest) -> Self {
        Self {
            info,
            session: config.session.clone(),
            request,
            streaming_id: Mutex::new(None),
        }
    }

    /// Server-assigned id of the stream, once created.
    pub fn streaming_id(&self) -> Option<String> {
        self.streaming_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn login(&self, on_error: Option<ErrorCallback>) -> Result<StreamSession> {
        let session = StreamSession::connect(&self.info, &self.session).await?;
        if let Some(callback) = on_error {
            session.set_error_callback(callback);
        }
        if let Err(e) = session.login(&self.info.username, &self.info.password).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn start(&self, session: &StreamSession, ctx: SubscribeContext<DataRecord>) -> Result<()> {
        match ctx.position {
            Some(Position::Stream {
                streaming_id,
                ack_id,
            }) => {
                session
                    .restart_streaming(&streaming_id, Some(&ack_id), ctx.producer, ctx.disconnect)
                    .await?;
                self.remember(streaming_id);
            }
            Some(other) => {
                return Err(ClientError::Config(format!(
                    "CDC stream cannot resume from {}",
                    other
                )))
            }
            None => match self.streaming_id() {
                // Created earlier but nothing consumed yet
                Some(streaming_id) => {
                    session
                        .restart_streaming(&streaming_id, None, ctx.producer, ctx.disconnect)
                        .await?;
                }
                None => {
                    let streaming_id = session
                        .start_streaming(
                            &self.request.database,
                            self.request.schema_tables.clone(),
                            self.request.full,
                            ctx.producer,
                            ctx.disconnect,
                        )
                        .await?;
                    self.remember(streaming_id);
                }
            },
        }
        Ok(())
    }

    fn remember(&self, streaming_id: String) {
        *self.streaming_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(streaming_id);
    }
}

impl StreamingSession for StreamSession {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(StreamSession::close(self))
    }
}

impl Subscriber for StreamSubscriber {
    type Event = DataRecord;
    type Session = StreamSession;

    fn endpoint(&self) -> String {
        self.info.endpoint()
    }

    fn open(&self, ctx: SubscribeContext<DataRecord>) -> BoxFuture<'_, Result<StreamSession>> {
        Box::pin(async move {
            debug!(endpoint = %self.info.endpoint(), generation = ctx.generation, "Opening CDC session");
            let session = self.login(Some(Arc::clone(&ctx.on_error))).await?;
            if let Err(e) = self.start(&session, ctx).await {
                session.close().await;
                return Err(e);
            }
            Ok(session)
        })
    }

    fn acknowledge<'a>(
        &'a self,
        session: &'a StreamSession,
        position: &'a Position,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match position {
                Position::Stream {
                    streaming_id,
                    ack_id,
                } => session.ack(streaming_id, ack_id).await,
                other => Err(ClientError::Config(format!(
                    "cannot acknowledge {} on a CDC stream",
                    other
                ))),
            }
        })
    }

    /// Tell the server the stream is abandoned so it can free it. Best
    /// effort over a fresh connection.
    fn release(&self, last_position: Option<Position>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let streaming_id = match last_position {
                Some(Position::Stream { streaming_id, .. }) => Some(streaming_id),
                _ => self.streaming_id(),
            };
            let Some(streaming_id) = streaming_id else {
                return;
            };
            let result = async {
                let session = self.login(None).await?;
                let stopped = session.stop_streaming(&streaming_id).await;
                session.close().await;
                stopped
            }
            .await;
            match result {
                Ok(()) => info!(endpoint = %self.info.endpoint(), streaming_id = %streaming_id, "Stopped abandoned CDC stream"),
                Err(e) => warn!(endpoint = %self.info.endpoint(), streaming_id = %streaming_id, error = %e, "Could not stop abandoned CDC stream"),
            }
        })
    }
}
