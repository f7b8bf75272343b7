//! Binlog flavour of [`Subscriber`].

use super::event::BinlogEvent;
use super::session::{MySqlSession, StreamOptions};
use crate::client::ChangeClient;
use crate::config::{ClientConfig, ConnectInfo, SessionConfig};
use crate::error::Result;
use crate::position::Position;
use crate::supervisor::{StreamingSession, SubscribeContext, Subscriber};
use futures::future::BoxFuture;
use tracing::{debug, info};

/// Change client reading a MySQL binlog.
pub type BinlogClient = ChangeClient<BinlogSubscriber>;

/// Opens binlog dump sessions against one MySQL server.
#[derive(Debug, Clone)]
pub struct BinlogSubscriber {
    info: ConnectInfo,
    session: SessionConfig,
    transactional: bool,
}

impl BinlogSubscriber {
    pub fn new(info: ConnectInfo, config: &ClientConfig) -> Self {
        Self {
            info,
            session: config.session.clone(),
            transactional: true,
        }
    }

    /// Deliver each event as its own batch instead of whole transactions.
    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn connect_info(&self) -> &ConnectInfo {
        &self.info
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    async fn start(&self, session: &MySqlSession, ctx: SubscribeContext<BinlogEvent>) -> Result<()> {
        let position = match ctx.position {
            Some(position) => position,
            None => {
                let head = session.master_status().await?;
                info!(endpoint = %session.endpoint(), position = %head, "No resume position, starting at binlog head");
                head
            }
        };
        let options = StreamOptions {
            heartbeat_interval: self.session.heartbeat_interval_duration(),
            transactional: self.transactional,
        };
        session
            .begin_streaming(&position, &options, ctx.producer, ctx.disconnect)
            .await
    }
}

impl StreamingSession for MySqlSession {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(MySqlSession::close(self))
    }
}

impl Subscriber for BinlogSubscriber {
    type Event = BinlogEvent;
    type Session = MySqlSession;

    fn endpoint(&self) -> String {
        self.info.endpoint()
    }

    fn open(&self, ctx: SubscribeContext<BinlogEvent>) -> BoxFuture<'_, Result<MySqlSession>> {
        Box::pin(async move {
            debug!(endpoint = %self.info.endpoint(), generation = ctx.generation, "Opening binlog session");
            let session = MySqlSession::connect(&self.info, &self.session).await?;
            if let Err(e) = self.start(&session, ctx).await {
                session.close().await;
                return Err(e);
            }
            Ok(session)
        })
    }

    /// MySQL keeps no replica-side progress: acknowledgement only moves
    /// the local checkpoint.
    fn acknowledge<'a>(
        &'a self,
        _session: &'a MySqlSession,
        _position: &'a Position,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
