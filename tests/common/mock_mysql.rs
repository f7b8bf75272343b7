//! In-process MySQL source.
//!
//! Speaks the handshake, answers the handful of queries a binlog client
//! issues before dumping, and plays one [`DumpScript`] per
//! `COM_BINLOG_DUMP`. Every dump request is recorded so tests can assert
//! where a reconnect resumed.

use bytes::{BufMut, BytesMut};
use replication_client::mysql::packet::CapabilityFlags;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;

/// What the server does after a dump request.
#[derive(Debug, Clone)]
pub enum DumpScript {
    /// Send the events and keep the connection open.
    Hold(Vec<Vec<u8>>),
    /// Send the events and close the socket.
    Drop(Vec<Vec<u8>>),
}

/// A recorded `COM_BINLOG_DUMP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub file_name: String,
    pub offset: u32,
    pub server_id: u32,
}

struct Shared {
    head: (String, u32),
    scripts: Mutex<Vec<DumpScript>>,
    dumps: Mutex<Vec<DumpRequest>>,
    connections: AtomicUsize,
    accepting: AtomicBool,
    kill: watch::Sender<u64>,
}

pub struct MockMySql {
    port: u16,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockMySql {
    /// `head` is what `SHOW MASTER STATUS` reports. Scripts are consumed
    /// in order; dumps beyond them hold with no events.
    pub async fn start(head: (&str, u32), scripts: Vec<DumpScript>) -> Self {
        super::init_test_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut scripts = scripts;
        scripts.reverse();
        let shared = Arc::new(Shared {
            head: (head.0.to_string(), head.1),
            scripts: Mutex::new(scripts),
            dumps: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            kill: watch::channel(0).0,
        });
        let accept_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                if !accept_shared.accepting.load(Ordering::SeqCst) {
                    drop(sock);
                    continue;
                }
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

    pub fn dumps(&self) -> Vec<DumpRequest> {
        self.shared.dumps.lock().unwrap().clone()
    }

    /// Close every held dump connection.
    pub fn kill_streams(&self) {
        self.shared.kill.send_modify(|kills| *kills += 1);
    }

    /// Accept and immediately drop further connections.
    pub fn stop_accepting(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
    }
}

impl Drop for MockMySql {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut sock: TcpStream, shared: Arc<Shared>) {
    if sock.write_all(&frame(0, &greeting("8.0.27"))).await.is_err() {
        return;
    }
    let Some((seq, _auth)) = read_packet(&mut sock).await else {
        return;
    };
    if sock.write_all(&frame(seq.wrapping_add(1), &ok())).await.is_err() {
        return;
    }

    while let Some((_, command)) = read_packet(&mut sock).await {
        let replies = match command.first() {
            Some(&COM_QUIT) | None => return,
            Some(&COM_QUERY) => answer_query(&command[1..], &shared),
            Some(&COM_BINLOG_DUMP) => {
                dump(&mut sock, &command, &shared).await;
                return;
            }
            // COM_REGISTER_SLAVE, COM_PING and anything else
            Some(_) => vec![ok()],
        };
        if write_all(&mut sock, &replies).await.is_err() {
            return;
        }
    }
}

fn answer_query(sql: &[u8], shared: &Shared) -> Vec<Vec<u8>> {
    let sql = String::from_utf8_lossy(sql);
    if sql.starts_with("SELECT @@global.binlog_checksum") {
        text_result(&["@@global.binlog_checksum"], &[&["NONE"]])
    } else if sql.starts_with("SHOW MASTER STATUS") {
        let offset = shared.head.1.to_string();
        text_result(&["File", "Position"], &[&[shared.head.0.as_str(), offset.as_str()]])
    } else {
        vec![ok()]
    }
}

async fn dump(sock: &mut TcpStream, command: &[u8], shared: &Shared) {
    let offset = u32::from_le_bytes(command[1..5].try_into().unwrap());
    let server_id = u32::from_le_bytes(command[7..11].try_into().unwrap());
    let file_name = String::from_utf8_lossy(&command[11..]).into_owned();
    shared.dumps.lock().unwrap().push(DumpRequest {
        file_name,
        offset,
        server_id,
    });
    let script = shared
        .scripts
        .lock()
        .unwrap()
        .pop()
        .unwrap_or(DumpScript::Hold(Vec::new()));

    match script {
        DumpScript::Hold(events) => {
            let mut kill_rx = shared.kill.subscribe();
            if write_all(sock, &events).await.is_err() {
                return;
            }
            let mut sink = [0u8; 64];
            loop {
                tokio::select! {
                    _ = kill_rx.changed() => return,
                    read = sock.read(&mut sink) => match read {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    },
                }
            }
        }
        DumpScript::Drop(events) => {
            let _ = write_all(sock, &events).await;
            let _ = sock.shutdown().await;
        }
    }
}

async fn write_all(sock: &mut TcpStream, payloads: &[Vec<u8>]) -> std::io::Result<()> {
    let mut out = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        out.extend_from_slice(&frame((i as u8).wrapping_add(1), payload));
    }
    sock.write_all(&out).await
}

pub fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = vec![len as u8, (len >> 8) as u8, (len >> 16) as u8, seq];
    out.extend_from_slice(payload);
    out
}

pub async fn read_packet(sock: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    sock.read_exact(&mut header).await.ok()?;
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    let mut payload = vec![0u8; len];
    sock.read_exact(&mut payload).await.ok()?;
    Some((header[3], payload))
}

pub fn greeting(version: &str) -> Vec<u8> {
    let mut out = vec![10u8];
    out.extend_from_slice(version.as_bytes());
    out.push(0);
    out.extend_from_slice(&42u32.to_le_bytes());
    out.extend_from_slice(b"abcdefgh");
    out.push(0);
    let caps = CapabilityFlags::client_default(false).value();
    out.extend_from_slice(&(caps as u16).to_le_bytes());
    out.push(45);
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    out.push(21);
    out.extend_from_slice(&[0u8; 10]);
    out.extend_from_slice(b"ijklmnopqrst\0");
    out.extend_from_slice(b"mysql_native_password\0");
    out
}

pub fn ok() -> Vec<u8> {
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

/// Column count, definitions, EOF, rows, EOF.
pub fn text_result(columns: &[&str], rows: &[&[&str]]) -> Vec<Vec<u8>> {
    let mut out = vec![vec![columns.len() as u8]];
    for column in columns {
        let mut def = BytesMut::new();
        for part in ["def", "", "", "", column, column] {
            def.put_u8(part.len() as u8);
            def.put_slice(part.as_bytes());
        }
        def.put_u8(0x0c);
        def.put_slice(&[0x21, 0x00, 0xff, 0x00, 0x00, 0x00, 0xfd, 0x00, 0x00, 0x1f, 0x00, 0x00]);
        out.push(def.to_vec());
    }
    out.push(vec![0xFE, 0, 0, 2, 0]);
    for row in rows {
        let mut encoded = Vec::new();
        for value in row.iter() {
            encoded.push(value.len() as u8);
            encoded.extend_from_slice(value.as_bytes());
        }
        out.push(encoded);
    }
    out.push(vec![0xFE, 0, 0, 2, 0]);
    out
}
