//! Binlog event builders.
//!
//! Every event is produced as a streaming packet payload (leading `0x00`
//! status byte) with checksums off, matching a source whose
//! `binlog_checksum` is `NONE`.

pub const QUERY_EVENT: u8 = 2;
pub const XID_EVENT: u8 = 16;
pub const TABLE_MAP_EVENT: u8 = 19;
pub const WRITE_ROWS_EVENT_V2: u8 = 30;

pub const SERVER_ID: u32 = 1;
pub const TABLE_ID: u64 = 42;
const TIMESTAMP: u32 = 1_700_000_000;
const HEADER_LEN: usize = 19;

/// Status byte, 19-byte header and body.
pub fn event(event_type: u8, log_pos: u32, body: &[u8]) -> Vec<u8> {
    let event_length = (HEADER_LEN + body.len()) as u32;
    let mut out = vec![0x00];
    out.extend_from_slice(&TIMESTAMP.to_le_bytes());
    out.push(event_type);
    out.extend_from_slice(&SERVER_ID.to_le_bytes());
    out.extend_from_slice(&event_length.to_le_bytes());
    out.extend_from_slice(&log_pos.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// `shop.orders (id BIGINT NOT NULL, status VARCHAR(255) NULL)`.
pub fn table_map(log_pos: u32) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&TABLE_ID.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.push(4);
    body.extend_from_slice(b"shop\0");
    body.push(6);
    body.extend_from_slice(b"orders\0");
    body.push(2);
    body.extend_from_slice(&[0x08, 0x0f]);
    body.push(2);
    body.extend_from_slice(&[0xff, 0x00]);
    body.push(0b10);
    event(TABLE_MAP_EVENT, log_pos, &body)
}

pub fn write_rows(log_pos: u32, id: i64, status: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&TABLE_ID.to_le_bytes()[..6]);
    body.extend_from_slice(&1u16.to_le_bytes());
    body.extend_from_slice(&2u16.to_le_bytes());
    body.push(2);
    body.push(0b11);
    body.push(0x00);
    body.extend_from_slice(&id.to_le_bytes());
    body.push(status.len() as u8);
    body.extend_from_slice(status.as_bytes());
    event(WRITE_ROWS_EVENT_V2, log_pos, &body)
}

pub fn xid(log_pos: u32, xid: u64) -> Vec<u8> {
    event(XID_EVENT, log_pos, &xid.to_le_bytes())
}

pub fn query(log_pos: u32, sql: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&7u32.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(4);
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes());
    body.extend_from_slice(b"shop\0");
    body.extend_from_slice(sql.as_bytes());
    event(QUERY_EVENT, log_pos, &body)
}

/// BEGIN, table map, one insert, XID. The transaction ends at `end_pos`.
pub fn insert_transaction(start_pos: u32, end_pos: u32, id: i64) -> Vec<Vec<u8>> {
    let step = (end_pos - start_pos) / 4;
    vec![
        query(start_pos + step, "BEGIN"),
        table_map(start_pos + 2 * step),
        write_rows(start_pos + 3 * step, id, "NEW"),
        xid(end_pos, id as u64),
    ]
}
