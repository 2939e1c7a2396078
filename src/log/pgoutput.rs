//! pgoutput protocol (version 1) decoding.
//!
//! CopyData payloads off the replication stream carry either a keepalive
//! (`k`) or XLogData (`w`) wrapping one pgoutput message. The decoder
//! mirrors the binlog side: a relation cache keyed by server-assigned id,
//! transaction tracking, and projection down to the capture set.

use std::collections::HashMap;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::capture::CaptureConfig;
use crate::error::{StreamError, StreamResult};
use crate::log::log_buffer::LogBuffer;
use crate::record::{render_dml, CdcEvent, ColumnValue, EventKind, RowImage, RowValues};

// pgoutput message leads
const MSG_BEGIN: u8 = b'B';
const MSG_COMMIT: u8 = b'C';
const MSG_ORIGIN: u8 = b'O';
const MSG_RELATION: u8 = b'R';
const MSG_TYPE: u8 = b'Y';
const MSG_INSERT: u8 = b'I';
const MSG_UPDATE: u8 = b'U';
const MSG_DELETE: u8 = b'D';
const MSG_TRUNCATE: u8 = b'T';
const MSG_MESSAGE: u8 = b'M';

// PostgreSQL type oids whose text form is numeric
const PG_TYPE_INT8: u32 = 20;
const PG_TYPE_INT2: u32 = 21;
const PG_TYPE_INT4: u32 = 23;
const PG_TYPE_OID: u32 = 26;
const PG_TYPE_FLOAT4: u32 = 700;
const PG_TYPE_FLOAT8: u32 = 701;
const PG_TYPE_NUMERIC: u32 = 1700;

#[derive(Debug, Clone)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub typmod: i32,
}

#[derive(Debug, Clone)]
pub struct RelationEntry {
    pub relid: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<RelationColumn>,
    pub active: bool,
}

/// One CopyData payload from the replication stream.
#[derive(Debug)]
pub enum ReplicationMessage {
    Keepalive {
        end_lsn: u64,
        timestamp: u64,
        reply_requested: bool,
    },
    XLogData {
        start_lsn: u64,
        end_lsn: u64,
        send_time: u64,
        payload: Vec<u8>,
    },
}

pub fn parse_copy_data(bytes: Vec<u8>) -> StreamResult<ReplicationMessage> {
    let mut buf = LogBuffer::from(bytes);
    match buf.get_uint8()? {
        b'k' => Ok(ReplicationMessage::Keepalive {
            end_lsn: buf.get_uint64_big_endian()?,
            timestamp: buf.get_uint64_big_endian()?,
            reply_requested: buf.get_uint8()? != 0,
        }),
        b'w' => {
            let start_lsn = buf.get_uint64_big_endian()?;
            let end_lsn = buf.get_uint64_big_endian()?;
            let send_time = buf.get_uint64_big_endian()?;
            let payload = buf.get_data(buf.remaining())?;
            Ok(ReplicationMessage::XLogData {
                start_lsn,
                end_lsn,
                send_time,
                payload,
            })
        }
        other => Err(StreamError::Protocol(format!(
            "unknown copy data lead '{}'",
            other as char
        ))),
    }
}

/// Standby status update: write = flush = apply = `lsn`, no reply asked.
pub fn standby_status_update(lsn: u64, timestamp_micros: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(34);
    out.push(b'r');
    out.extend_from_slice(&lsn.to_be_bytes());
    out.extend_from_slice(&lsn.to_be_bytes());
    out.extend_from_slice(&lsn.to_be_bytes());
    out.extend_from_slice(&timestamp_micros.to_be_bytes());
    out.push(0);
    out
}

pub struct PgContext {
    pub current_lsn: u64,
    pub txn: Option<String>,
    pub relations: HashMap<u32, RelationEntry>,
    /// Set by a COMMIT message; the stream loop checkpoints and clears it.
    pub committed: bool,
}

impl PgContext {
    pub fn new(start_lsn: u64) -> PgContext {
        PgContext {
            current_lsn: start_lsn,
            txn: None,
            relations: HashMap::new(),
            committed: false,
        }
    }

    fn ensure_txn(&mut self) -> String {
        if self.txn.is_none() {
            self.txn = Some(Uuid::new_v4().to_string());
        }
        self.txn.clone().unwrap()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TupleValue {
    Null,
    /// TOASTed column not present in this image.
    Unchanged,
    Text(Vec<u8>),
}

#[derive(Default)]
pub struct PgDecoder;

impl PgDecoder {
    pub fn new() -> PgDecoder {
        PgDecoder
    }

    /// Dispatch one pgoutput message.
    pub fn handle_message(
        &mut self,
        payload: Vec<u8>,
        ctx: &mut PgContext,
        capture: &mut CaptureConfig,
    ) -> StreamResult<Vec<CdcEvent>> {
        let mut buf = LogBuffer::from(payload);
        let lead = buf.get_uint8()?;
        match lead {
            MSG_BEGIN => {
                let _final_lsn = buf.get_uint64_big_endian()?;
                let _commit_ts = buf.get_uint64_big_endian()?;
                let xid = buf.get_uint32_big_endian()?;
                ctx.txn = Some(Uuid::new_v4().to_string());
                trace!("begin xid {}", xid);
                Ok(Vec::new())
            }
            MSG_COMMIT => {
                let _flags = buf.get_uint8()?;
                let _commit_lsn = buf.get_uint64_big_endian()?;
                let end_lsn = buf.get_uint64_big_endian()?;
                let _ts = buf.get_uint64_big_endian()?;
                if end_lsn > ctx.current_lsn {
                    ctx.current_lsn = end_lsn;
                }
                ctx.txn = None;
                ctx.committed = true;
                Ok(Vec::new())
            }
            MSG_RELATION => {
                self.handle_relation(&mut buf, ctx, capture)?;
                Ok(Vec::new())
            }
            MSG_INSERT => {
                let relid = buf.get_uint32_big_endian()?;
                let tuple_kind = buf.get_uint8()?;
                if tuple_kind != b'N' {
                    return Err(StreamError::Protocol(format!(
                        "insert with tuple kind '{}'",
                        tuple_kind as char
                    )));
                }
                let values = read_tuple(&mut buf)?;
                self.emit_dml(ctx, capture, relid, EventKind::Insert, None, values)
            }
            MSG_UPDATE => {
                let relid = buf.get_uint32_big_endian()?;
                let mut old_values = None;
                let mut kind = buf.get_uint8()?;
                if kind == b'K' || kind == b'O' {
                    old_values = Some(read_tuple(&mut buf)?);
                    kind = buf.get_uint8()?;
                }
                if kind != b'N' {
                    return Err(StreamError::Protocol(format!(
                        "update without new tuple (kind '{}')",
                        kind as char
                    )));
                }
                let new_values = read_tuple(&mut buf)?;
                self.emit_dml(ctx, capture, relid, EventKind::Update, old_values, new_values)
            }
            MSG_DELETE => {
                let relid = buf.get_uint32_big_endian()?;
                let tuple_kind = buf.get_uint8()?;
                if tuple_kind != b'K' && tuple_kind != b'O' {
                    return Err(StreamError::Protocol(format!(
                        "delete with tuple kind '{}'",
                        tuple_kind as char
                    )));
                }
                let values = read_tuple(&mut buf)?;
                self.emit_dml(ctx, capture, relid, EventKind::Delete, None, values)
            }
            MSG_ORIGIN | MSG_TYPE | MSG_TRUNCATE | MSG_MESSAGE => {
                debug!("skipping pgoutput message '{}'", lead as char);
                Ok(Vec::new())
            }
            other => {
                debug!("unknown pgoutput message '{}'", other as char);
                Ok(Vec::new())
            }
        }
    }

    fn handle_relation(
        &mut self,
        buf: &mut LogBuffer,
        ctx: &mut PgContext,
        capture: &mut CaptureConfig,
    ) -> StreamResult<()> {
        let relid = buf.get_uint32_big_endian()?;
        let schema = buf.get_string_nul()?;
        let table = buf.get_string_nul()?;
        let _replica_identity = buf.get_uint8()?;
        let natts = buf.get_uint16_big_endian()?;
        let mut columns = Vec::with_capacity(natts as usize);
        for _ in 0..natts {
            columns.push(RelationColumn {
                flags: buf.get_uint8()?,
                name: buf.get_string_nul()?,
                type_oid: buf.get_uint32_big_endian()?,
                typmod: buf.get_int32_big_endian()?,
            });
        }

        let active = capture.captures_dml(&schema, &table);
        if active {
            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            capture.resolve_columns(&schema, &table, &names);
        }
        debug!(
            "relation {} -> {}.{} ({} column(s), active={})",
            relid, schema, table, natts, active
        );
        ctx.relations.insert(
            relid,
            RelationEntry {
                relid,
                schema,
                table,
                columns,
                active,
            },
        );
        Ok(())
    }

    fn emit_dml(
        &mut self,
        ctx: &mut PgContext,
        capture: &CaptureConfig,
        relid: u32,
        kind: EventKind,
        old_values: Option<Vec<TupleValue>>,
        new_values: Vec<TupleValue>,
    ) -> StreamResult<Vec<CdcEvent>> {
        let txn = ctx.ensure_txn();
        let Some(relation) = ctx.relations.get(&relid) else {
            return Err(StreamError::Decode(format!(
                "row message for unknown relation {}",
                relid
            )));
        };
        if !relation.active {
            return Ok(Vec::new());
        }
        let Some(table_capture) = capture.table(&relation.schema, &relation.table) else {
            return Ok(Vec::new());
        };

        let project = |values: &[TupleValue]| -> RowValues {
            table_capture
                .projected()
                .into_iter()
                .map(|(index, name)| {
                    let type_oid = relation
                        .columns
                        .get(index)
                        .map(|c| c.type_oid)
                        .unwrap_or(0);
                    let value = match values.get(index) {
                        Some(TupleValue::Text(bytes)) => render_text_value(bytes, type_oid),
                        Some(TupleValue::Null) | Some(TupleValue::Unchanged) | None => {
                            ColumnValue::Null
                        }
                    };
                    (name.to_string(), value)
                })
                .collect()
        };

        let row = match kind {
            EventKind::Update => RowImage::BeforeAfter {
                before: old_values.as_deref().map(&project).unwrap_or_default(),
                after: project(&new_values),
            },
            _ => RowImage::Plain(project(&new_values)),
        };

        let json = render_dml(
            kind,
            "schema",
            &relation.schema,
            &relation.table,
            &txn,
            &table_capture.primary_keys,
            &[row],
        );
        Ok(vec![CdcEvent {
            db: relation.schema.clone(),
            table: relation.table.clone(),
            json,
            txn,
            position: ctx.current_lsn,
            file: String::new(),
        }])
    }
}

fn read_tuple(buf: &mut LogBuffer) -> StreamResult<Vec<TupleValue>> {
    let ncols = buf.get_uint16_big_endian()?;
    let mut values = Vec::with_capacity(ncols as usize);
    for _ in 0..ncols {
        match buf.get_uint8()? {
            b'n' => values.push(TupleValue::Null),
            b'u' => values.push(TupleValue::Unchanged),
            b't' => {
                let len = buf.get_int32_big_endian()?;
                if len < 0 {
                    return Err(StreamError::Protocol("negative tuple length".to_string()));
                }
                values.push(TupleValue::Text(buf.get_data(len as usize)?));
            }
            other => {
                return Err(StreamError::Protocol(format!(
                    "unknown tuple column kind '{}'",
                    other as char
                )));
            }
        }
    }
    Ok(values)
}

/// Text-mode values pass through verbatim. Numeric types come out bare
/// when their text actually parses; everything else is quoted.
fn render_text_value(bytes: &[u8], type_oid: u32) -> ColumnValue {
    let text = String::from_utf8_lossy(bytes).into_owned();
    let numeric = matches!(
        type_oid,
        PG_TYPE_INT2 | PG_TYPE_INT4 | PG_TYPE_INT8 | PG_TYPE_OID | PG_TYPE_FLOAT4
            | PG_TYPE_FLOAT8 | PG_TYPE_NUMERIC
    );
    if numeric && text.parse::<f64>().is_ok() {
        ColumnValue::Number(text)
    } else {
        ColumnValue::Text(text)
    }
}

/// Allows the stream loop to log positions the same way the server does.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xffff_ffff)
}
