//! MySQL binlog replication.
//!
//! The client registers as a replica (`COM_REGISTER_SLAVE`) and asks for
//! a binlog dump from a file/offset. Row events are decoded against the
//! table maps preceding them and grouped into transactions.

pub mod auth;
pub mod codec;
pub mod decoder;
pub mod event;
pub mod packet;
pub mod reader;
pub mod rows;
pub mod session;
pub mod subscriber;

pub use decoder::{BinlogDecoder, SchemaMappingCache};
pub use event::{BinlogEvent, ColumnValue, EventKind, QueryEvent, RowChange, RowsEvent, TableMapEvent};
pub use session::{MySqlSession, StreamOptions};
pub use subscriber::{BinlogClient, BinlogSubscriber};
