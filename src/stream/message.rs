//! CDC protocol messages.
//!
//! Every frame is one JSON object. Requests carry a `requestId` the
//! server echoes in its response; pushed data records carry the id of
//! the request that opened the stream.
//!
//! ```json
//! {"version":1,"requestId":"3f2a…-7","body":{"type":"LOGIN","username":"root","password":"4813…"}}
//! {"requestId":"3f2a…-7","status":"SUCCEED","result":{"type":"LOGIN"}}
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdcRequest {
    pub version: u32,
    pub request_id: String,
    pub body: RequestBody,
}

impl CdcRequest {
    pub fn new(request_id: impl Into<String>, body: RequestBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            body,
        }
    }
}

/// `schema.table` filter for a new stream. An empty schema means the
/// database's default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaTable {
    #[serde(default)]
    pub schema: String,
    pub table: String,
}

impl SchemaTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestBody {
    #[serde(rename_all = "camelCase")]
    Login { username: String, password: String },
    /// Create a stream. `full` asks for an inventory dump before the
    /// incremental changes.
    #[serde(rename_all = "camelCase")]
    StreamData {
        database: String,
        source_schema_tables: Vec<SchemaTable>,
        full: bool,
    },
    /// Resume an existing stream after the given ack.
    #[serde(rename_all = "camelCase")]
    StartStreaming {
        streaming_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_ack_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StopStreaming { streaming_id: String },
    #[serde(rename_all = "camelCase")]
    DropStreaming { streaming_id: String },
    #[serde(rename_all = "camelCase")]
    AckStreaming { streaming_id: String, ack_id: String },
}

impl RequestBody {
    /// Build a login body. The password is sent as the uppercase hex
    /// SHA-256 of the plaintext.
    pub fn login(username: impl Into<String>, password: &str) -> Self {
        RequestBody::Login {
            username: username.into(),
            password: hash_password(password),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestBody::Login { .. } => "LOGIN",
            RequestBody::StreamData { .. } => "STREAM_DATA",
            RequestBody::StartStreaming { .. } => "START_STREAMING",
            RequestBody::StopStreaming { .. } => "STOP_STREAMING",
            RequestBody::DropStreaming { .. } => "DROP_STREAMING",
            RequestBody::AckStreaming { .. } => "ACK_STREAMING",
        }
    }
}

pub fn hash_password(password: &str) -> String {
    hex::encode_upper(Sha256::digest(password.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Succeed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdcResponse {
    #[serde(default)]
    pub request_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResponseResult>,
}

impl CdcResponse {
    pub fn succeed(request_id: impl Into<String>, result: Option<ResponseResult>) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Succeed,
            error_code: None,
            error_message: None,
            result,
        }
    }

    pub fn failed(
        request_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            status: ResponseStatus::Failed,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            result: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == ResponseStatus::Failed
    }

    pub fn is_data(&self) -> bool {
        matches!(self.result, Some(ResponseResult::DataRecords { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseResult {
    #[serde(rename_all = "camelCase")]
    ServerGreeting {
        server_version: String,
        protocol_version: u32,
    },
    Login,
    #[serde(rename_all = "camelCase")]
    StreamData { streaming_id: String },
    #[serde(rename_all = "camelCase")]
    DataRecords {
        streaming_id: String,
        ack_id: String,
        records: Vec<DataRecord>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataChangeType {
    Insert,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// One changed row with its own table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRecord {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    pub table: String,
    pub operation: DataChangeType,
    #[serde(default)]
    pub before: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub after: BTreeMap<String, serde_json::Value>,
    /// Commit time in epoch milliseconds.
    #[serde(default)]
    pub commit_time: i64,
    /// Last record of its source transaction.
    #[serde(default)]
    pub transaction_commit: bool,
}

impl DataRecord {
    /// `schema.table`, or just the table when the schema is empty.
    pub fn qualified_table(&self) -> String {
        if self.schema.is_empty() {
            self.table.clone()
        } else {
            format!("{}.{}", self.schema, self.table)
        }
    }
}
