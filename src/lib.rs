//! # Replication Client
//!
//! A resumable change-capture client. It holds a persistent connection to
//! a source's change stream, decodes change events, buffers them under
//! backpressure and resumes from the consumer's checkpoint after a
//! network failure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           replication-client                            │
//! │                                                                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌────────────────┐               │
//! │  │ Session      │──►│ Decoder      │──►│ Backpressure   │──► poll()     │
//! │  │ (I/O task)   │   │ (tx assembly)│   │ Queue (bounded)│               │
//! │  └──────────────┘   └──────────────┘   └────────────────┘               │
//! │         │ disconnect{generation}                         ack() ◄──      │
//! │         ▼                                                  │            │
//! │  ┌──────────────┐  resubscribe from checkpoint   ┌──────────────────┐   │
//! │  │ Supervisor   │◄───────────────────────────────│ Checkpoint /     │   │
//! │  │ (backoff)    │                                │ PositionStore    │   │
//! │  └──────────────┘                                └──────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Sources
//!
//! 1. **MySQL binlog** ([`mysql`]): registers as a replica and decodes
//!    row events against their table maps, grouped into transactions.
//! 2. **CDC stream** ([`stream`]): length-delimited JSON protocol with
//!    login, stream creation and ack-driven flow control.
//!
//! Delivery is at-least-once. After a reconnect the stream resumes from
//! the last checkpoint, so a consumer may see a batch twice.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_client::config::{ClientConfig, ConnectInfo};
//! use replication_client::stream::{SchemaTable, StreamClient, StreamRequest, StreamSubscriber};
//! use std::time::Duration;
//!
//! # async fn example() -> replication_client::Result<()> {
//! let config = ClientConfig::default();
//! let info = ConnectInfo::new("127.0.0.1", 33071, "root", "root", 0);
//! let request = StreamRequest::new("sharding_db", vec![SchemaTable::new("", "t_order")]);
//! let client = StreamClient::new(StreamSubscriber::new(info, &config, request), config);
//!
//! client.subscribe(None).await?;
//! while let Some(batch) = client.poll(Duration::from_secs(1)).await? {
//!     for record in &batch.events {
//!         println!("{} {:?}", record.qualified_table(), record.operation);
//!     }
//!     client.ack(&batch).await?;
//! }
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod mysql;
pub mod pending;
pub mod position;
pub mod queue;
pub mod resilience;
pub mod session;
pub mod sink;
pub mod stream;
pub mod supervisor;

// Re-exports for convenience
pub use batch::EventBatch;
pub use checkpoint::{MemoryPositionStore, PositionStore, SqlitePositionStore};
pub use client::dispatch::{run_dispatcher, DispatchExit, DispatchStats};
pub use client::{ChangeClient, ClientState, HealthCheck};
pub use config::{ClientConfig, ConnectInfo};
pub use error::{ClientError, Result};
pub use mysql::{BinlogClient, BinlogEvent, BinlogSubscriber};
pub use position::Position;
pub use queue::{BackpressureQueue, QueueProducer};
pub use session::ConnectionState;
pub use sink::{EventSink, NoOpSink, SinkError};
pub use stream::{DataRecord, StreamClient, StreamSubscriber};
pub use supervisor::{StreamingSession, Subscriber};
