//! Decoded binlog events.
//!
//! Everything here is plain data: the decoder produces it, the consumer
//! reads it. Row images are positional, one [`ColumnValue`] per column of
//! the table map in effect when the row event was decoded.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Binlog event type codes the decoder understands.
pub mod event_type {
    pub const QUERY: u8 = 2;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const HEARTBEAT: u8 = 27;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
}

/// Column types as written in TABLE_MAP events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use ColumnType::*;
        Some(match value {
            0 => Decimal,
            1 => Tiny,
            2 => Short,
            3 => Long,
            4 => Float,
            5 => Double,
            6 => Null,
            7 => Timestamp,
            8 => LongLong,
            9 => Int24,
            10 => Date,
            11 => Time,
            12 => DateTime,
            13 => Year,
            14 => NewDate,
            15 => Varchar,
            16 => Bit,
            17 => Timestamp2,
            18 => DateTime2,
            19 => Time2,
            245 => Json,
            246 => NewDecimal,
            247 => Enum,
            248 => Set,
            249 => TinyBlob,
            250 => MediumBlob,
            251 => LongBlob,
            252 => Blob,
            253 => VarString,
            254 => String,
            255 => Geometry,
            _ => return None,
        })
    }
}

/// Common 19-byte v4 event header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BinlogEventHeader {
    pub timestamp: u32,
    pub event_type: u8,
    pub server_id: u32,
    pub event_length: u32,
    /// Offset of the next event in the current file.
    pub log_pos: u32,
    pub flags: u16,
}

impl BinlogEventHeader {
    pub const LEN: usize = 19;
}

/// One column of a table map: type plus its type-specific metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub column_type: ColumnType,
    pub meta: u16,
    pub nullable: bool,
}

/// TABLE_MAP: binds a table id to a schema/table and its column layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateValue {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeValue {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub micros: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateTimeValue {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

/// A decoded column value.
///
/// String-ish columns stay raw bytes: the binlog carries no charset per
/// value, so decoding text is left to the consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f32),
    Double(f64),
    /// Exact decimal rendering, e.g. `"-1234.56"`.
    Decimal(String),
    Year(u16),
    Date(DateValue),
    Time(TimeValue),
    DateTime(DateTimeValue),
    /// Seconds since the epoch (UTC) plus fraction.
    Timestamp { seconds: u32, micros: u32 },
    Bytes(Vec<u8>),
    /// 1-based index into the enum's values.
    Enum(u16),
    /// Bitmask over the set's members.
    Set(u64),
    Bit(Vec<u8>),
    /// MySQL binary JSON, undecoded.
    Json(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ColumnValue::Bytes(b) | ColumnValue::Bit(b) | ColumnValue::Json(b) => Some(b),
            _ => None,
        }
    }
}

/// One changed row. Inserts have only `after`, deletes only `before`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowChange {
    pub before: Option<Vec<ColumnValue>>,
    pub after: Option<Vec<ColumnValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowsEvent {
    pub table_id: u64,
    #[serde(skip)]
    pub table: Arc<TableMapEvent>,
    pub rows: Vec<RowChange>,
}

impl RowsEvent {
    pub fn schema_name(&self) -> &str {
        &self.table.schema
    }

    pub fn table_name(&self) -> &str {
        &self.table.table
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub exec_time: u32,
    pub error_code: u16,
    pub database: String,
    pub sql: String,
}

impl QueryEvent {
    pub fn is_begin(&self) -> bool {
        self.sql.trim().eq_ignore_ascii_case("BEGIN")
    }

    /// Non-transactional engines end with a `COMMIT` query instead of XID.
    pub fn is_commit(&self) -> bool {
        self.sql.trim().eq_ignore_ascii_case("COMMIT")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    Write(RowsEvent),
    Update(RowsEvent),
    Delete(RowsEvent),
    Query(QueryEvent),
    Xid { xid: u64 },
    /// Any event type we don't decode; carries only its position.
    Placeholder { event_type: u8 },
}

impl EventKind {
    pub fn is_rows(&self) -> bool {
        matches!(
            self,
            EventKind::Write(_) | EventKind::Update(_) | EventKind::Delete(_)
        )
    }
}

/// A decoded binlog event with its source coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinlogEvent {
    pub file_name: String,
    /// End offset of this event (the next event's start).
    pub log_pos: u64,
    pub server_id: u32,
    pub timestamp: u32,
    pub kind: EventKind,
}

impl fmt::Display for BinlogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            EventKind::Write(_) => "write",
            EventKind::Update(_) => "update",
            EventKind::Delete(_) => "delete",
            EventKind::Query(_) => "query",
            EventKind::Xid { .. } => "xid",
            EventKind::Placeholder { .. } => "placeholder",
        };
        write!(f, "{}@{}:{}", kind, self.file_name, self.log_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_type_codes() {
        assert_eq!(ColumnType::from_u8(8), Some(ColumnType::LongLong));
        assert_eq!(ColumnType::from_u8(246), Some(ColumnType::NewDecimal));
        assert_eq!(ColumnType::from_u8(255), Some(ColumnType::Geometry));
        assert_eq!(ColumnType::from_u8(100), None);
        assert_eq!(ColumnType::Varchar as u8, 15);
    }

    #[test]
    fn test_query_markers() {
        let q = |sql: &str| QueryEvent {
            thread_id: 1,
            exec_time: 0,
            error_code: 0,
            database: "db".into(),
            sql: sql.into(),
        };
        assert!(q("BEGIN").is_begin());
        assert!(q(" begin ").is_begin());
        assert!(!q("BEGIN WORK; SELECT 1").is_begin());
        assert!(q("COMMIT").is_commit());
    }

    #[test]
    fn test_event_display() {
        let event = BinlogEvent {
            file_name: "binlog.000001".into(),
            log_pos: 4,
            server_id: 1,
            timestamp: 0,
            kind: EventKind::Xid { xid: 9 },
        };
        assert_eq!(event.to_string(), "xid@binlog.000001:4");
    }
}
