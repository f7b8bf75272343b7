//! Binlog stream decoder.
//!
//! Turns the packets that follow `COM_BINLOG_DUMP` into [`EventBatch`]es.
//!
//! ```text
//! packet ─▶ status byte ─▶ 19-byte header ─▶ strip checksum ─▶ event body
//!                                                                 │
//!            ┌──────────────┬──────────────┬──────────────┬───────┘
//!            ▼              ▼              ▼              ▼
//!         FDE/ROTATE    TABLE_MAP      rows/QUERY/XID   other
//!        (state only)  (schema cache)       │        Placeholder
//!                                           ▼
//!                                  transaction assembly ─▶ batch
//! ```
//!
//! The decoder is pure: the same packets against the same cache state
//! always yield the same batches. Malformed input is a
//! [`ClientError::Protocol`], never a panic.

use super::event::{event_type, BinlogEvent, BinlogEventHeader, EventKind, QueryEvent, RowsEvent, TableMapEvent};
use super::packet::{is_eof_packet, ErrPacket};
use super::reader::PayloadReader;
use super::rows::{decode_rows, decode_table_map, peek_table_id, RowImageKind};
use crate::batch::EventBatch;
use crate::error::{ClientError, Result};
use crate::position::Position;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// CRC32 trailer length when `binlog_checksum = CRC32`.
pub const CRC32_CHECKSUM_LEN: usize = 4;

const CHECKSUM_ALG_CRC32: u8 = 1;

/// Table id → table map for one binlog session.
///
/// Built fresh for every subscription; never shared between sessions.
#[derive(Debug, Clone)]
pub struct SchemaMappingCache {
    endpoint: String,
    tables: HashMap<u64, Arc<TableMapEvent>>,
}

impl SchemaMappingCache {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tables: HashMap::new(),
        }
    }

    /// Insert or replace the map for a table id.
    pub fn insert(&mut self, table: TableMapEvent) -> Arc<TableMapEvent> {
        let table = Arc::new(table);
        self.tables.insert(table.table_id, Arc::clone(&table));
        table
    }

    pub fn get(&self, table_id: u64) -> Option<&Arc<TableMapEvent>> {
        self.tables.get(&table_id)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Stateful decoder for one binlog stream.
#[derive(Debug)]
pub struct BinlogDecoder {
    schema: SchemaMappingCache,
    checksum_len: usize,
    file_name: String,
    transactional: bool,
    in_transaction: bool,
    buffer: Vec<BinlogEvent>,
}

impl BinlogDecoder {
    /// `file_name` is the file the dump starts in; ROTATE events move it.
    pub fn new(
        endpoint: impl Into<String>,
        file_name: impl Into<String>,
        checksum_len: usize,
        transactional: bool,
    ) -> Self {
        Self {
            schema: SchemaMappingCache::new(endpoint),
            checksum_len,
            file_name: file_name.into(),
            transactional,
            in_transaction: false,
            buffer: Vec::new(),
        }
    }

    pub fn checksum_len(&self) -> usize {
        self.checksum_len
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn schema(&self) -> &SchemaMappingCache {
        &self.schema
    }

    /// Events held back waiting for the transaction's commit.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Decode one streaming packet payload.
    ///
    /// Returns a batch when the packet completes one: any event in
    /// non-transactional mode, a commit in transactional mode.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Option<EventBatch<BinlogEvent>>> {
        match self.decode_event(payload)? {
            Some(event) => Ok(self.assemble(event)),
            None => Ok(None),
        }
    }

    /// Decode one packet into at most one event, without transaction
    /// assembly.
    pub fn decode_event(&mut self, payload: &[u8]) -> Result<Option<BinlogEvent>> {
        match payload.first() {
            Some(0x00) => {}
            Some(0xFF) => return Err(ErrPacket::parse(payload)?.into_error()),
            Some(0xFE) if is_eof_packet(payload) => {
                return Err(ClientError::transport_msg(
                    self.schema.endpoint(),
                    "server ended the binlog stream",
                ))
            }
            Some(other) => {
                return Err(ClientError::protocol(format!(
                    "unexpected binlog packet status 0x{:02X}",
                    other
                )))
            }
            None => return Err(ClientError::protocol("empty binlog packet")),
        }

        let mut r = PayloadReader::new(&payload[1..]);
        let header = read_header(&mut r)?;
        let body_len = (header.event_length as usize)
            .checked_sub(BinlogEventHeader::LEN)
            .ok_or_else(|| {
                ClientError::protocol(format!(
                    "binlog event length {} shorter than its header",
                    header.event_length
                ))
            })?;
        if r.remaining() < body_len {
            return Err(ClientError::protocol(format!(
                "truncated binlog event type {}: header says {} body bytes, {} present",
                header.event_type,
                body_len,
                r.remaining()
            )));
        }
        let full_body = r.bytes(body_len)?;

        if header.event_type == event_type::FORMAT_DESCRIPTION {
            self.on_format_description(full_body)?;
            return Ok(None);
        }

        let body = strip_checksum(full_body, self.checksum_len)?;
        trace!(event_type = header.event_type, log_pos = header.log_pos, "Binlog event");

        let kind = match header.event_type {
            event_type::ROTATE => {
                self.on_rotate(body)?;
                return Ok(None);
            }
            event_type::HEARTBEAT => return Ok(None),
            event_type::TABLE_MAP => {
                let table = decode_table_map(body)?;
                debug!(
                    endpoint = %self.schema.endpoint(),
                    table_id = table.table_id,
                    schema = %table.schema,
                    table = %table.table,
                    "Table map cached"
                );
                self.schema.insert(table);
                return Ok(None);
            }
            event_type::WRITE_ROWS_V1 => EventKind::Write(self.rows(body, false, RowImageKind::Write)?),
            event_type::UPDATE_ROWS_V1 => EventKind::Update(self.rows(body, false, RowImageKind::Update)?),
            event_type::DELETE_ROWS_V1 => EventKind::Delete(self.rows(body, false, RowImageKind::Delete)?),
            event_type::WRITE_ROWS_V2 => EventKind::Write(self.rows(body, true, RowImageKind::Write)?),
            event_type::UPDATE_ROWS_V2 => EventKind::Update(self.rows(body, true, RowImageKind::Update)?),
            event_type::DELETE_ROWS_V2 => EventKind::Delete(self.rows(body, true, RowImageKind::Delete)?),
            event_type::QUERY => EventKind::Query(decode_query(body)?),
            event_type::XID => EventKind::Xid {
                xid: PayloadReader::new(body).u64_le()?,
            },
            other => EventKind::Placeholder { event_type: other },
        };

        Ok(Some(BinlogEvent {
            file_name: self.file_name.clone(),
            log_pos: header.log_pos as u64,
            server_id: header.server_id,
            timestamp: header.timestamp,
            kind,
        }))
    }

    fn on_format_description(&mut self, body: &[u8]) -> Result<()> {
        let idx = body
            .len()
            .checked_sub(1 + self.checksum_len)
            .ok_or_else(|| ClientError::protocol("format description event too short"))?;
        let alg = body[idx];
        self.checksum_len = if alg == CHECKSUM_ALG_CRC32 {
            CRC32_CHECKSUM_LEN
        } else {
            0
        };
        debug!(checksum_alg = alg, checksum_len = self.checksum_len, "Format description");
        Ok(())
    }

    fn on_rotate(&mut self, body: &[u8]) -> Result<()> {
        let mut r = PayloadReader::new(body);
        let position = r.u64_le()?;
        let next = String::from_utf8_lossy(r.rest()).into_owned();
        if next.is_empty() {
            return Err(ClientError::protocol("rotate event without file name"));
        }
        debug!(
            endpoint = %self.schema.endpoint(),
            from = %self.file_name,
            to = %next,
            position,
            "Binlog rotated"
        );
        self.file_name = next;
        Ok(())
    }

    fn rows(&self, body: &[u8], v2: bool, kind: RowImageKind) -> Result<RowsEvent> {
        let table_id = peek_table_id(body)?;
        let Some(table) = self.schema.get(table_id) else {
            return Err(ClientError::protocol(format!(
                "rows event for unknown table id {} on {}",
                table_id,
                self.schema.endpoint()
            )));
        };
        let rows = decode_rows(body, table, v2, kind)?;
        Ok(RowsEvent {
            table_id,
            table: Arc::clone(table),
            rows,
        })
    }

    fn assemble(&mut self, event: BinlogEvent) -> Option<EventBatch<BinlogEvent>> {
        if let EventKind::Query(q) = &event.kind {
            if q.is_begin() {
                if self.transactional {
                    if !self.buffer.is_empty() {
                        debug!(dropped = self.buffer.len(), "BEGIN discarded an unterminated transaction");
                    }
                    self.buffer.clear();
                    self.in_transaction = true;
                }
                return None;
            }
        }

        if !self.transactional {
            return Some(self.single(event));
        }

        let closes = match &event.kind {
            EventKind::Xid { .. } => true,
            EventKind::Query(q) => q.is_commit(),
            _ => false,
        };
        if closes {
            self.in_transaction = false;
            self.buffer.push(event);
            let events = std::mem::take(&mut self.buffer);
            return Some(self.batch(events));
        }

        let buffering = self.in_transaction || !self.buffer.is_empty();
        match &event.kind {
            EventKind::Write(_) | EventKind::Update(_) | EventKind::Delete(_) => {
                self.buffer.push(event);
                None
            }
            EventKind::Placeholder { .. } if buffering => {
                self.buffer.push(event);
                None
            }
            _ => Some(self.single(event)),
        }
    }

    fn single(&self, event: BinlogEvent) -> EventBatch<BinlogEvent> {
        self.batch(vec![event])
    }

    /// Position of a batch is that of its last event.
    fn batch(&self, events: Vec<BinlogEvent>) -> EventBatch<BinlogEvent> {
        let position = events
            .last()
            .map(|e| Position::Binlog {
                file_name: e.file_name.clone(),
                offset: e.log_pos,
                server_id: e.server_id,
            })
            .unwrap_or_else(|| Position::binlog(self.file_name.clone(), 0));
        EventBatch::new(events, position)
    }
}

fn read_header(r: &mut PayloadReader<'_>) -> Result<BinlogEventHeader> {
    let header = BinlogEventHeader {
        timestamp: r.u32_le()?,
        event_type: r.u8()?,
        server_id: r.u32_le()?,
        event_length: r.u32_le()?,
        log_pos: r.u32_le()?,
        flags: r.u16_le()?,
    };
    if (header.event_length as usize) < BinlogEventHeader::LEN {
        return Err(ClientError::protocol(format!(
            "binlog event length {} shorter than its header",
            header.event_length
        )));
    }
    Ok(header)
}

fn strip_checksum(body: &[u8], checksum_len: usize) -> Result<&[u8]> {
    body.len()
        .checked_sub(checksum_len)
        .map(|len| &body[..len])
        .ok_or_else(|| ClientError::protocol("binlog event shorter than its checksum"))
}

fn decode_query(body: &[u8]) -> Result<QueryEvent> {
    let mut r = PayloadReader::new(body);
    let thread_id = r.u32_le()?;
    let exec_time = r.u32_le()?;
    let db_len = r.u8()? as usize;
    let error_code = r.u16_le()?;
    let status_len = r.u16_le()? as usize;
    r.skip(status_len)?;
    let database = String::from_utf8_lossy(r.bytes(db_len)?).into_owned();
    r.skip(1)?;
    let sql = String::from_utf8_lossy(r.rest()).into_owned();
    Ok(QueryEvent {
        thread_id,
        exec_time,
        error_code,
        database,
        sql,
    })
}
