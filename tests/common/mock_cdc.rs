//! In-process CDC server.
//!
//! Answers login and stream requests on every connection, then pushes the
//! next [`CdcScript`] to whichever connection started streaming.

use futures::{SinkExt, StreamExt};
use replication_client::stream::{
    CdcResponse, DataChangeType, DataRecord, RequestBody, ResponseResult, ServerCodec,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const STREAMING_ID: &str = "s1";

/// Records pushed once a connection starts streaming.
#[derive(Debug, Clone, Default)]
pub struct CdcScript {
    pub batches: Vec<(String, Vec<DataRecord>)>,
    /// Close the connection once this ack id arrives.
    pub drop_after_ack: Option<String>,
    /// `FAILED` frame `(code, message)` sent after the batches.
    pub failure: Option<(String, String)>,
}

impl CdcScript {
    pub fn batch(mut self, ack_id: &str, records: Vec<DataRecord>) -> Self {
        self.batches.push((ack_id.to_string(), records));
        self
    }

    pub fn drop_after(mut self, ack_id: &str) -> Self {
        self.drop_after_ack = Some(ack_id.to_string());
        self
    }

    pub fn fail(mut self, code: &str, message: &str) -> Self {
        self.failure = Some((code.to_string(), message.to_string()));
        self
    }
}

struct Shared {
    scripts: Mutex<Vec<CdcScript>>,
    requests: Mutex<Vec<RequestBody>>,
    connections: AtomicUsize,
    reject_restarts: AtomicBool,
}

pub struct MockCdc {
    port: u16,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockCdc {
    pub async fn start(scripts: Vec<CdcScript>) -> Self {
        super::init_test_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut scripts = scripts;
        scripts.reverse();
        let shared = Arc::new(Shared {
            scripts: Mutex::new(scripts),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            reject_restarts: AtomicBool::new(false),
        });
        let accept_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(sock, Arc::clone(&accept_shared)));
            }
        });
        Self { port, shared, handle }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Every request body received, across connections.
    pub fn requests(&self) -> Vec<RequestBody> {
        self.shared.requests.lock().unwrap().clone()
    }

    /// Answer every later `START_STREAMING` with `FAILED`; logins still
    /// succeed.
    pub fn reject_restarts(&self) {
        self.shared.reject_restarts.store(true, Ordering::SeqCst);
    }

    pub fn stop_requests(&self) -> Vec<RequestBody> {
        self.requests()
            .into_iter()
            .filter(|r| matches!(r, RequestBody::StopStreaming { .. }))
            .collect()
    }

    pub fn start_requests(&self) -> Vec<RequestBody> {
        self.requests()
            .into_iter()
            .filter(|r| matches!(r, RequestBody::StartStreaming { .. }))
            .collect()
    }
}

impl Drop for MockCdc {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(sock: TcpStream, shared: Arc<Shared>) {
    let mut conn = Framed::new(sock, ServerCodec::new());
    let greeting = CdcResponse::succeed(
        "",
        Some(ResponseResult::ServerGreeting {
            server_version: "5.4.0".into(),
            protocol_version: 1,
        }),
    );
    if conn.send(greeting).await.is_err() {
        return;
    }

    let mut drop_after: Option<String> = None;
    while let Some(Ok(request)) = conn.next().await {
        shared.requests.lock().unwrap().push(request.body.clone());
        let request_id = request.request_id.clone();
        let (result, streams) = match &request.body {
            RequestBody::Login { .. } => (Some(ResponseResult::Login), false),
            RequestBody::StreamData { .. } => (
                Some(ResponseResult::StreamData {
                    streaming_id: STREAMING_ID.into(),
                }),
                true,
            ),
            RequestBody::StartStreaming { .. } if shared.reject_restarts.load(Ordering::SeqCst) => {
                let failed = CdcResponse::failed(request_id, "1001", "stream unavailable");
                if conn.send(failed).await.is_err() {
                    return;
                }
                continue;
            }
            RequestBody::StartStreaming { .. } => (None, true),
            RequestBody::StopStreaming { .. } | RequestBody::DropStreaming { .. } => (None, false),
            RequestBody::AckStreaming { ack_id, .. } => {
                if drop_after.as_deref() == Some(ack_id.as_str()) {
                    return;
                }
                continue;
            }
        };
        if conn.send(CdcResponse::succeed(request_id.clone(), result)).await.is_err() {
            return;
        }
        if !streams {
            continue;
        }
        let script = shared.scripts.lock().unwrap().pop().unwrap_or_default();
        drop_after = script.drop_after_ack.clone();
        for (ack_id, records) in script.batches {
            let data = ResponseResult::DataRecords {
                streaming_id: STREAMING_ID.into(),
                ack_id,
                records,
            };
            if conn.send(CdcResponse::succeed(request_id.clone(), Some(data))).await.is_err() {
                return;
            }
        }
        if let Some((code, message)) = script.failure {
            if conn.send(CdcResponse::failed(request_id.clone(), code, message)).await.is_err() {
                return;
            }
        }
    }
}

pub fn order_record(id: i64) -> DataRecord {
    let mut after = BTreeMap::new();
    after.insert("order_id".to_string(), json!(id));
    after.insert("status".to_string(), json!("NEW"));
    DataRecord {
        database: "sharding_db".into(),
        schema: String::new(),
        table: "t_order".into(),
        operation: DataChangeType::Insert,
        before: BTreeMap::new(),
        after,
        commit_time: 1_700_000_000_000,
        transaction_commit: true,
    }
}
