//! MySQL command-phase packets.
//!
//! Parsing for the server greeting, OK/ERR/EOF and text result sets, and
//! builders for the handful of commands a replica sends.

use super::reader::PayloadReader;
use crate::error::{ClientError, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;
pub const COM_BINLOG_DUMP: u8 = 0x12;
pub const COM_REGISTER_SLAVE: u8 = 0x15;

const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xFE;
const ERR_HEADER: u8 = 0xFF;

/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const MAX_PACKET_SIZE: u32 = 16_777_215;

/// Client/server capability bits used during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
    pub const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
    pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// What this client asks for. No `CLIENT_DEPRECATE_EOF`: result sets
    /// keep their EOF markers.
    pub fn client_default(with_database: bool) -> Self {
        let mut flags = Self::CLIENT_LONG_PASSWORD
            | Self::CLIENT_LONG_FLAG
            | Self::CLIENT_PROTOCOL_41
            | Self::CLIENT_TRANSACTIONS
            | Self::CLIENT_SECURE_CONNECTION
            | Self::CLIENT_MULTI_RESULTS
            | Self::CLIENT_PLUGIN_AUTH;
        if with_database {
            flags |= Self::CLIENT_CONNECT_WITH_DB;
        }
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Initial greeting (protocol version 10).
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    /// Scramble, both parts joined, trailing NUL removed.
    pub auth_plugin_data: Vec<u8>,
    pub auth_plugin_name: String,
}

impl Handshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.first() == Some(&ERR_HEADER) {
            return Err(ErrPacket::parse(payload)?.into_error());
        }
        let mut r = PayloadReader::new(payload);
        let protocol_version = r.u8()?;
        if protocol_version != 10 {
            return Err(ClientError::Unsupported(format!(
                "handshake protocol version {}",
                protocol_version
            )));
        }
        let server_version = String::from_utf8_lossy(r.null_terminated()?).into_owned();
        let connection_id = r.u32_le()?;
        let mut auth_plugin_data = r.bytes(8)?.to_vec();
        r.skip(1)?;
        let cap_lower = r.u16_le()? as u32;

        // Pre-4.1 servers stop here
        if r.is_empty() {
            return Ok(Self {
                protocol_version,
                server_version,
                connection_id,
                capability_flags: CapabilityFlags::new(cap_lower),
                character_set: 0,
                status_flags: 0,
                auth_plugin_data,
                auth_plugin_name: String::new(),
            });
        }

        let character_set = r.u8()?;
        let status_flags = r.u16_le()?;
        let cap_upper = r.u16_le()? as u32;
        let capability_flags = CapabilityFlags::new(cap_upper << 16 | cap_lower);
        let auth_data_len = r.u8()? as usize;
        r.skip(10)?;

        if capability_flags.has(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let part2_len = auth_data_len.saturating_sub(8).max(13).min(r.remaining());
            let part2 = r.bytes(part2_len)?;
            let end = part2.iter().position(|b| *b == 0).unwrap_or(part2.len());
            auth_plugin_data.extend_from_slice(&part2[..end]);
        }

        let auth_plugin_name = if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let rest = r.rest();
            let end = rest.iter().position(|b| *b == 0).unwrap_or(rest.len());
            String::from_utf8_lossy(&rest[..end]).into_owned()
        } else {
            String::new()
        };

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data,
            auth_plugin_name,
        })
    }

    /// `(major, minor, patch)` parsed from the version string. Suffixes
    /// such as `-log` or `-MariaDB` are ignored.
    pub fn version(&self) -> (u32, u32, u32) {
        parse_server_version(&self.server_version)
    }
}

pub fn parse_server_version(version: &str) -> (u32, u32, u32) {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().unwrap_or(0));
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

/// `HandshakeResponse41`.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub capability_flags: CapabilityFlags,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin_name: String,
}

impl HandshakeResponse {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.username.len() + self.auth_response.len());
        buf.put_u32_le(self.capability_flags.value());
        buf.put_u32_le(MAX_PACKET_SIZE);
        buf.put_u8(CHARSET_UTF8MB4);
        buf.put_slice(&[0u8; 23]);
        buf.put_slice(self.username.as_bytes());
        buf.put_u8(0);
        buf.put_u8(self.auth_response.len() as u8);
        buf.put_slice(&self.auth_response);
        if let Some(db) = &self.database {
            if self.capability_flags.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
                buf.put_slice(db.as_bytes());
                buf.put_u8(0);
            }
        }
        if self.capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            buf.put_slice(self.auth_plugin_name.as_bytes());
            buf.put_u8(0);
        }
        buf.freeze()
    }
}

/// Auth switch request (`0xFE` during authentication).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin_name: String,
    pub plugin_data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != EOF_HEADER {
            return Err(ClientError::protocol("not an auth switch request"));
        }
        let plugin_name = String::from_utf8_lossy(r.null_terminated()?).into_owned();
        let mut plugin_data = r.rest().to_vec();
        if plugin_data.last() == Some(&0) {
            plugin_data.pop();
        }
        Ok(Self {
            plugin_name,
            plugin_data,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

impl OkPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let header = r.u8()?;
        if header != OK_HEADER && header != EOF_HEADER {
            return Err(ClientError::protocol(format!("not an OK packet: 0x{:02X}", header)));
        }
        let affected_rows = r.lenenc_int()?.unwrap_or(0);
        let last_insert_id = r.lenenc_int()?.unwrap_or(0);
        let (status_flags, warnings) = if r.remaining() >= 4 {
            (r.u16_le()?, r.u16_le()?)
        } else {
            (0, 0)
        };
        let info = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl ErrPacket {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        if r.u8()? != ERR_HEADER {
            return Err(ClientError::protocol("not an ERR packet"));
        }
        let code = r.u16_le()?;
        let sql_state = if r.remaining() >= 6 && r.peek_u8()? == b'#' {
            r.skip(1)?;
            String::from_utf8_lossy(r.bytes(5)?).into_owned()
        } else {
            "HY000".to_string()
        };
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        Ok(Self {
            code,
            sql_state,
            message,
        })
    }

    pub fn into_error(self) -> ClientError {
        ClientError::server(self.code, self.sql_state, self.message)
    }
}

/// EOF marker: `0xFE` and shorter than 9 bytes.
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut r = PayloadReader::new(payload);
        let _catalog = r.lenenc_string()?;
        let schema = r.lenenc_string()?;
        let table = r.lenenc_string()?;
        let _org_table = r.lenenc_string()?;
        let name = r.lenenc_string()?;
        let _org_name = r.lenenc_string()?;
        let _fixed_len = r.lenenc_int()?;
        let _charset = r.u16_le()?;
        let column_length = r.u32_le()?;
        let column_type = r.u8()?;
        let flags = r.u16_le()?;
        let decimals = r.u8()?;
        Ok(Self {
            schema,
            table,
            name,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }
}

/// Text-protocol result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// First column of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }

    /// Value of column `name` in row `row`.
    pub fn value(&self, row: usize, name: &str) -> Option<&str> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    Ok(OkPacket),
    Err(ErrPacket),
    ResultSet(ResultSet),
}

#[derive(Debug, Default)]
enum AssemblerState {
    #[default]
    Start,
    Columns {
        expected: usize,
        columns: Vec<ColumnDefinition>,
    },
    ColumnsEof {
        columns: Vec<ColumnDefinition>,
    },
    Rows {
        columns: Vec<ColumnDefinition>,
        rows: Vec<Vec<Option<String>>>,
    },
}

/// Folds the packets answering one command into a [`CommandResponse`].
///
/// ```text
/// OK | ERR                                       → done
/// column count → column def × n → EOF → row* → EOF → ResultSet
/// ```
#[derive(Debug, Default)]
pub struct ResultSetAssembler {
    state: AssemblerState,
}

impl ResultSetAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, AssemblerState::Start)
    }

    pub fn reset(&mut self) {
        self.state = AssemblerState::Start;
    }

    /// Feed one packet. Returns the response once it is complete.
    ///
    /// On error the assembler is reset.
    pub fn feed(&mut self, payload: &[u8]) -> Result<Option<CommandResponse>> {
        let result = self.step(payload);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn step(&mut self, payload: &[u8]) -> Result<Option<CommandResponse>> {
        match std::mem::take(&mut self.state) {
            AssemblerState::Start => {
                if is_ok_packet(payload) {
                    return Ok(Some(CommandResponse::Ok(OkPacket::parse(payload)?)));
                }
                if is_err_packet(payload) {
                    return Ok(Some(CommandResponse::Err(ErrPacket::parse(payload)?)));
                }
                if is_eof_packet(payload) {
                    return Err(ClientError::protocol("unexpected EOF packet at start of response"));
                }
                let count = PayloadReader::new(payload)
                    .lenenc_int()?
                    .ok_or_else(|| ClientError::protocol("NULL column count"))?;
                if count == 0 {
                    return Err(ClientError::protocol("result set with zero columns"));
                }
                let expected = usize::try_from(count)
                    .map_err(|_| ClientError::protocol("column count overflow"))?;
                self.state = AssemblerState::Columns {
                    expected,
                    columns: Vec::with_capacity(expected.min(1024)),
                };
                Ok(None)
            }
            AssemblerState::Columns {
                expected,
                mut columns,
            } => {
                if is_err_packet(payload) {
                    return Ok(Some(CommandResponse::Err(ErrPacket::parse(payload)?)));
                }
                columns.push(ColumnDefinition::parse(payload)?);
                self.state = if columns.len() == expected {
                    AssemblerState::ColumnsEof { columns }
                } else {
                    AssemblerState::Columns { expected, columns }
                };
                Ok(None)
            }
            AssemblerState::ColumnsEof { columns } => {
                if !is_eof_packet(payload) {
                    return Err(ClientError::protocol("expected EOF after column definitions"));
                }
                self.state = AssemblerState::Rows {
                    columns,
                    rows: Vec::new(),
                };
                Ok(None)
            }
            AssemblerState::Rows { columns, mut rows } => {
                if is_eof_packet(payload) {
                    return Ok(Some(CommandResponse::ResultSet(ResultSet { columns, rows })));
                }
                if is_err_packet(payload) {
                    return Ok(Some(CommandResponse::Err(ErrPacket::parse(payload)?)));
                }
                let mut r = PayloadReader::new(payload);
                let mut row = Vec::with_capacity(columns.len());
                for _ in 0..columns.len() {
                    row.push(r.lenenc_bytes()?.map(|b| String::from_utf8_lossy(b).into_owned()));
                }
                rows.push(row);
                self.state = AssemblerState::Rows { columns, rows };
                Ok(None)
            }
        }
    }
}

pub fn com_query(sql: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + sql.len());
    buf.put_u8(COM_QUERY);
    buf.put_slice(sql.as_bytes());
    buf.freeze()
}

pub fn com_quit() -> Bytes {
    Bytes::from_static(&[COM_QUIT])
}

/// `COM_REGISTER_SLAVE` with empty host/user/password.
pub fn com_register_slave(server_id: u32, port: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(18);
    buf.put_u8(COM_REGISTER_SLAVE);
    buf.put_u32_le(server_id);
    buf.put_u8(0); // hostname
    buf.put_u8(0); // user
    buf.put_u8(0); // password
    buf.put_u16_le(port);
    buf.put_u32_le(0); // replication rank
    buf.put_u32_le(0); // master id
    buf.freeze()
}

/// `COM_BINLOG_DUMP`. Offsets above `u32::MAX` are not addressable by
/// this command.
pub fn com_binlog_dump(offset: u32, flags: u16, server_id: u32, file_name: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(11 + file_name.len());
    buf.put_u8(COM_BINLOG_DUMP);
    buf.put_u32_le(offset);
    buf.put_u16_le(flags);
    buf.put_u32_le(server_id);
    buf.put_slice(file_name.as_bytes());
    buf.freeze()
}
