//! Binlog event layouts: the 19-byte common header and the control
//! events the streamer reacts to (format description, rotate, query,
//! XID, table map).

use crate::error::{StreamError, StreamResult};
use crate::log::log_buffer::LogBuffer;

/// Recognized binlog event type codes.
pub mod event_type {
    pub const QUERY: u8 = 2;
    pub const ROTATE: u8 = 4;
    pub const FORMAT_DESCRIPTION: u8 = 15;
    pub const XID: u8 = 16;
    pub const TABLE_MAP: u8 = 19;
    pub const WRITE_ROWS_V1: u8 = 23;
    pub const UPDATE_ROWS_V1: u8 = 24;
    pub const DELETE_ROWS_V1: u8 = 25;
    pub const WRITE_ROWS_V2: u8 = 30;
    pub const UPDATE_ROWS_V2: u8 = 31;
    pub const DELETE_ROWS_V2: u8 = 32;
    pub const MARIA_GTID: u8 = 162;
    pub const MARIA_WRITE_ROWS_COMPRESSED: u8 = 166;
    pub const MARIA_UPDATE_ROWS_COMPRESSED: u8 = 167;
    pub const MARIA_DELETE_ROWS_COMPRESSED: u8 = 168;
}

/// MySQL column type codes as they appear in table-map metadata.
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

pub const BINLOG_CHECKSUM_LEN: usize = 4;

/// The 19-byte header every binlog event starts with.
#[derive(Debug, Clone)]
pub struct LogHeader {
    pub when: u32,
    pub kind: u8,
    pub server_id: u32,
    pub event_len: u32,
    /// Position of the next event in the current file.
    pub log_pos: u32,
    pub flags: u16,
}

impl LogHeader {
    pub const LEN: usize = 19;

    pub fn from_buffer(buf: &mut LogBuffer) -> StreamResult<LogHeader> {
        Ok(LogHeader {
            when: buf.get_uint32()?,
            kind: buf.get_uint8()?,
            server_id: buf.get_uint32()?,
            event_len: buf.get_uint32()?,
            log_pos: buf.get_uint32()?,
            flags: buf.get_uint16()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FormatDescriptionEvent {
    pub binlog_version: u16,
    pub server_version: String,
}

impl FormatDescriptionEvent {
    pub fn from_buffer(buf: &mut LogBuffer) -> StreamResult<FormatDescriptionEvent> {
        let binlog_version = buf.get_uint16()?;
        let server_version = buf.get_fix_string(50)?;
        let server_version = server_version.trim_end_matches('\0').to_string();
        Ok(FormatDescriptionEvent {
            binlog_version,
            server_version,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_file: String,
}

impl RotateEvent {
    pub fn from_buffer(buf: &mut LogBuffer) -> StreamResult<RotateEvent> {
        let position = buf.get_uint64()?;
        let next_file = buf.get_fix_string(buf.remaining())?;
        Ok(RotateEvent {
            position,
            next_file,
        })
    }
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub thread_id: u32,
    pub schema: String,
    pub query: String,
}

impl QueryEvent {
    pub fn from_buffer(buf: &mut LogBuffer) -> StreamResult<QueryEvent> {
        let thread_id = buf.get_uint32()?;
        let _exec_time = buf.get_uint32()?;
        let schema_len = buf.get_uint8()? as usize;
        let _error_code = buf.get_uint16()?;
        let status_vars_len = buf.get_uint16()? as usize;
        buf.forward(status_vars_len)?;
        let schema = buf.get_fix_string(schema_len)?;
        // NUL between schema and query text
        buf.forward(1)?;
        let query = buf.get_fix_string(buf.remaining())?;
        Ok(QueryEvent {
            thread_id,
            schema,
            query,
        })
    }
}

#[derive(Debug, Clone)]
pub struct XidEvent {
    pub xid: u64,
}

impl XidEvent {
    pub fn from_buffer(buf: &mut LogBuffer) -> StreamResult<XidEvent> {
        Ok(XidEvent {
            xid: buf.get_uint64()?,
        })
    }
}

/// Table-map descriptor cached per server-assigned table id.
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_count: usize,
    pub types: Vec<u8>,
    pub metadata: Vec<u16>,
    /// Physical types after resolving STRING overloads to ENUM/SET.
    pub real_types: Vec<u8>,
    /// Fetched lazily from the metadata side connection.
    pub column_names: Option<Vec<String>>,
    /// Per-column ENUM literal tables, populated on demand.
    pub enum_literals: Vec<Option<Vec<String>>>,
    /// False when the table is outside the capture set; row events that
    /// reference an inactive map skip their images wholesale.
    pub active: bool,
}

impl TableMapEvent {
    pub fn from_buffer(buf: &mut LogBuffer) -> StreamResult<TableMapEvent> {
        let table_id = buf.get_uint48()?;
        let _flags = buf.get_uint16()?;
        let schema_len = buf.get_uint8()? as usize;
        let schema = buf.get_fix_string(schema_len)?;
        buf.forward(1)?;
        let table_len = buf.get_uint8()? as usize;
        let table = buf.get_fix_string(table_len)?;
        buf.forward(1)?;
        let column_count = buf.get_packed_long()?;
        if column_count < 0 {
            return Err(StreamError::Protocol("negative column count".to_string()));
        }
        let column_count = column_count as usize;
        let types = buf.get_data(column_count)?;
        let meta_block = buf.get_packed_bytes()?.ok_or_else(|| {
            StreamError::Protocol("table map without metadata block".to_string())
        })?;
        let mut meta_buf = LogBuffer::from(meta_block);
        let mut metadata = Vec::with_capacity(column_count);
        for &t in &types {
            metadata.push(Self::read_metadata(t, &mut meta_buf)?);
        }

        let mut real_types = types.clone();
        for (i, t) in real_types.iter_mut().enumerate() {
            if *t == column_type::STRING {
                let hi = (metadata[i] >> 8) as u8;
                if hi == column_type::ENUM || hi == column_type::SET {
                    *t = hi;
                }
            }
        }

        Ok(TableMapEvent {
            table_id,
            schema,
            table,
            column_count,
            types,
            metadata,
            real_types,
            column_names: None,
            enum_literals: vec![None; column_count],
            active: false,
        })
    }

    fn read_metadata(kind: u8, buf: &mut LogBuffer) -> StreamResult<u16> {
        use column_type::*;
        Ok(match kind {
            FLOAT | DOUBLE | TIMESTAMP2 | DATETIME2 | TIME2 | JSON | TINY_BLOB | MEDIUM_BLOB
            | LONG_BLOB | BLOB | GEOMETRY => buf.get_uint8()? as u16,
            VARCHAR | VAR_STRING | BIT | NEWDECIMAL => buf.get_uint16()?,
            // STRING carries (real type, length) big-endian style
            ENUM | SET | STRING => buf.get_uint16_big_endian()?,
            _ => 0,
        })
    }

    /// Whether a cached descriptor still describes the same physical
    /// table. When this fails, the ENUM literal cache and fetched column
    /// names are stale and must be discarded.
    pub fn same_identity(&self, other: &TableMapEvent) -> bool {
        self.schema == other.schema
            && self.table == other.table
            && self.column_count == other.column_count
    }
}
