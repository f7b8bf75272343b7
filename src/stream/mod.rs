//! CDC stream protocol client.
//!
//! Length-delimited JSON frames over TCP. The server pushes data records
//! for a stream and advances its send window when the client acks them.

pub mod codec;
pub mod decoder;
pub mod message;
pub mod session;
pub mod subscriber;

pub use codec::{CdcCodec, CdcCodecError, ClientCodec, ServerCodec};
pub use decoder::StreamDecoder;
pub use message::{
    CdcRequest, CdcResponse, DataChangeType, DataRecord, RequestBody, ResponseResult,
    ResponseStatus, SchemaTable,
};
pub use session::{GenericHandler, StreamSession};
pub use subscriber::{StreamClient, StreamRequest, StreamSubscriber};
