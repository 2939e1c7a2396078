//! MySQL/MariaDB binlog event dispatch.
//!
//! The decoder consumes one raw event at a time (header plus body, as
//! pulled off the dump stream), maintains the per-connection state —
//! checksum mode, table-map cache, open transaction, current position —
//! and emits owned CDC records for everything the capture set keeps.

use std::collections::HashMap;
use std::io::Read;

use str_utils::StartsWithIgnoreAsciiCase;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::capture::CaptureConfig;
use crate::error::{StreamError, StreamResult};
use crate::instance::metadata::EntryPosition;
use crate::instance::table_meta_cache::TableMetaCache;
use crate::log::event::{
    event_type, FormatDescriptionEvent, LogHeader, QueryEvent, RotateEvent, TableMapEvent,
    XidEvent, BINLOG_CHECKSUM_LEN,
};
use crate::log::log_buffer::LogBuffer;
use crate::log::rows::{decode_row_images, parse_bitmap_section, parse_rows_header};
use crate::record::{render_commit, render_ddl, render_dml, CdcEvent, EventKind};

pub struct LogContext {
    pub position: EntryPosition,
    pub checksum: bool,
    pub maps: HashMap<u64, TableMapEvent>,
    /// Open transaction id; empty iff no transaction is open.
    pub txn: Option<String>,
    pub server_version: Option<String>,
    /// Schema of the most recent table map, used to gate COMMIT records.
    pub last_map_schema: String,
    /// Set on ROTATE so the stream loop persists a checkpoint at once.
    pub force_checkpoint: bool,
}

impl LogContext {
    pub fn new(position: EntryPosition, checksum: bool) -> LogContext {
        LogContext {
            position,
            checksum,
            maps: HashMap::new(),
            txn: None,
            server_version: None,
            last_map_schema: String::new(),
            force_checkpoint: false,
        }
    }

    /// Current transaction id, opening a transaction if none is open.
    pub fn ensure_txn(&mut self) -> String {
        if self.txn.is_none() {
            self.txn = Some(Uuid::new_v4().to_string());
        }
        self.txn.clone().unwrap()
    }

    pub fn close_txn(&mut self) {
        self.txn = None;
    }
}

#[derive(Default)]
pub struct LogDecoder;

impl LogDecoder {
    pub fn new() -> LogDecoder {
        LogDecoder
    }

    /// Decode one raw event. Returns the CDC records it produced; decode
    /// failures inside the event body are returned as errors for the
    /// stream loop to log, leaving the context consistent so the next
    /// event realigns the stream.
    pub fn decode(
        &mut self,
        raw: Vec<u8>,
        ctx: &mut LogContext,
        capture: &mut CaptureConfig,
        meta_cache: &mut TableMetaCache,
    ) -> StreamResult<Vec<CdcEvent>> {
        let mut buf = LogBuffer::from(raw);
        let header = LogHeader::from_buffer(&mut buf)?;
        if ctx.checksum {
            let limit = buf.limit();
            if limit < BINLOG_CHECKSUM_LEN {
                return Err(StreamError::Protocol("event shorter than checksum".into()));
            }
            buf.new_limit(limit - BINLOG_CHECKSUM_LEN)?;
        }

        let events = match header.kind {
            event_type::FORMAT_DESCRIPTION => {
                let fd = FormatDescriptionEvent::from_buffer(&mut buf)?;
                debug!(
                    "format description: binlog v{} server {}",
                    fd.binlog_version, fd.server_version
                );
                ctx.server_version = Some(fd.server_version);
                Vec::new()
            }
            event_type::ROTATE => {
                let rotate = RotateEvent::from_buffer(&mut buf)?;
                debug!("rotate to {}:{}", rotate.next_file, rotate.position);
                ctx.position =
                    EntryPosition::from_position(rotate.next_file, rotate.position);
                // descriptors do not survive a file switch
                ctx.maps.clear();
                ctx.force_checkpoint = true;
                return Ok(Vec::new());
            }
            event_type::QUERY => self.handle_query(&mut buf, ctx, capture)?,
            event_type::XID => {
                let xid = XidEvent::from_buffer(&mut buf)?;
                let mut events = Vec::new();
                if !ctx.last_map_schema.is_empty() && capture.captures_ddl(&ctx.last_map_schema) {
                    let txn = ctx.ensure_txn();
                    let schema = ctx.last_map_schema.clone();
                    events.push(CdcEvent {
                        db: schema.clone(),
                        table: String::new(),
                        json: render_commit("db", &schema, &txn, xid.xid),
                        txn,
                        position: header.log_pos as u64,
                        file: ctx.position.journal_name.clone(),
                    });
                }
                ctx.close_txn();
                events
            }
            event_type::TABLE_MAP => {
                self.handle_table_map(&mut buf, ctx, capture, meta_cache)?;
                Vec::new()
            }
            event_type::WRITE_ROWS_V1 | event_type::WRITE_ROWS_V2 => {
                self.handle_rows(&mut buf, &header, ctx, capture, EventKind::Insert, false)?
            }
            event_type::UPDATE_ROWS_V1 | event_type::UPDATE_ROWS_V2 => {
                self.handle_rows(&mut buf, &header, ctx, capture, EventKind::Update, false)?
            }
            event_type::DELETE_ROWS_V1 | event_type::DELETE_ROWS_V2 => {
                self.handle_rows(&mut buf, &header, ctx, capture, EventKind::Delete, false)?
            }
            event_type::MARIA_WRITE_ROWS_COMPRESSED => {
                self.handle_rows(&mut buf, &header, ctx, capture, EventKind::Insert, true)?
            }
            event_type::MARIA_UPDATE_ROWS_COMPRESSED => {
                self.handle_rows(&mut buf, &header, ctx, capture, EventKind::Update, true)?
            }
            event_type::MARIA_DELETE_ROWS_COMPRESSED => {
                self.handle_rows(&mut buf, &header, ctx, capture, EventKind::Delete, true)?
            }
            event_type::MARIA_GTID => {
                trace!("mariadb gtid event at {}", header.log_pos);
                Vec::new()
            }
            other => {
                trace!("skipping event type {} at {}", other, header.log_pos);
                Vec::new()
            }
        };

        if header.log_pos > 0 {
            ctx.position.position = header.log_pos as u64;
        }
        Ok(events)
    }

    fn handle_query(
        &mut self,
        buf: &mut LogBuffer,
        ctx: &mut LogContext,
        capture: &CaptureConfig,
    ) -> StreamResult<Vec<CdcEvent>> {
        let query = QueryEvent::from_buffer(buf)?;
        let sql = query.query.trim_start();

        if sql.starts_with_ignore_ascii_case("BEGIN") {
            ctx.ensure_txn();
            return Ok(Vec::new());
        }
        if sql.starts_with_ignore_ascii_case("COMMIT")
            || sql.starts_with_ignore_ascii_case("ROLLBACK")
        {
            ctx.close_txn();
            return Ok(Vec::new());
        }

        let kind = if sql.starts_with_ignore_ascii_case("CREATE") {
            EventKind::Create
        } else if sql.starts_with_ignore_ascii_case("ALTER") {
            EventKind::Alter
        } else if sql.starts_with_ignore_ascii_case("DROP") {
            EventKind::Drop
        } else if sql.starts_with_ignore_ascii_case("TRUNCATE") {
            EventKind::Truncate
        } else if sql.starts_with_ignore_ascii_case("RENAME") {
            EventKind::Rename
        } else {
            trace!("unclassified query in {}: {:.40}", query.schema, sql);
            return Ok(Vec::new());
        };

        if !capture.captures_ddl(&query.schema) {
            return Ok(Vec::new());
        }
        let txn = ctx.ensure_txn();
        Ok(vec![CdcEvent {
            db: query.schema.clone(),
            table: String::new(),
            json: render_ddl(kind, "db", &query.schema, &txn, sql),
            txn,
            position: ctx.position.position,
            file: ctx.position.journal_name.clone(),
        }])
    }

    fn handle_table_map(
        &mut self,
        buf: &mut LogBuffer,
        ctx: &mut LogContext,
        capture: &mut CaptureConfig,
        meta_cache: &mut TableMetaCache,
    ) -> StreamResult<()> {
        let mut map = TableMapEvent::from_buffer(buf)?;
        ctx.last_map_schema = map.schema.clone();

        if !capture.captures_dml(&map.schema, &map.table) {
            map.active = false;
            ctx.maps.insert(map.table_id, map);
            return Ok(());
        }
        map.active = true;

        let identity_changed = match ctx.maps.get(&map.table_id) {
            Some(cached) => !cached.same_identity(&map),
            None => true,
        };
        if identity_changed {
            meta_cache.invalidate(&map.schema, &map.table);
        }
        match meta_cache.get_table_meta(&map.schema, &map.table) {
            Ok(meta) => {
                if meta.column_names.len() == map.column_count {
                    map.column_names = Some(meta.column_names.clone());
                    map.enum_literals = meta.enum_literals.clone();
                    capture.resolve_columns(&map.schema, &map.table, &meta.column_names);
                } else {
                    warn!(
                        "{}.{}: metadata has {} column(s), table map announces {}",
                        map.schema,
                        map.table,
                        meta.column_names.len(),
                        map.column_count
                    );
                }
            }
            Err(e) => {
                warn!(
                    "column names unavailable for {}.{}: {}",
                    map.schema, map.table, e
                );
            }
        }
        ctx.maps.insert(map.table_id, map);
        Ok(())
    }

    fn handle_rows(
        &mut self,
        buf: &mut LogBuffer,
        header: &LogHeader,
        ctx: &mut LogContext,
        capture: &CaptureConfig,
        kind: EventKind,
        compressed: bool,
    ) -> StreamResult<Vec<CdcEvent>> {
        let v2 = matches!(
            header.kind,
            event_type::WRITE_ROWS_V2 | event_type::UPDATE_ROWS_V2 | event_type::DELETE_ROWS_V2
        );
        let is_update = kind == EventKind::Update;

        // a row event implies a transaction even without an explicit BEGIN
        let txn = ctx.ensure_txn();

        let body;
        let mut inflated_buf;
        let active_buf: &mut LogBuffer;
        if compressed {
            let table_id = buf.get_uint48()?;
            let _flags = buf.get_uint16()?;
            inflated_buf = LogBuffer::from(inflate_rows(buf)?);
            body = parse_bitmap_section(&mut inflated_buf, table_id, is_update)?;
            active_buf = &mut inflated_buf;
        } else {
            body = parse_rows_header(buf, v2, is_update)?;
            active_buf = buf;
        }

        let Some(map) = ctx.maps.get(&body.table_id) else {
            return Err(StreamError::Decode(format!(
                "rows event for unmapped table id {}",
                body.table_id
            )));
        };
        if !map.active {
            // outside the capture set: skip the images wholesale
            return Ok(Vec::new());
        }
        if map.column_count != body.column_count {
            return Err(StreamError::Decode(format!(
                "{}.{}: rows event has {} column(s), table map {}",
                map.schema, map.table, body.column_count, map.column_count
            )));
        }
        let Some(table_capture) = capture.table(&map.schema, &map.table) else {
            return Ok(Vec::new());
        };

        let rows = decode_row_images(active_buf, map, table_capture, &body, is_update)?;
        let json = render_dml(
            kind,
            "db",
            &map.schema,
            &map.table,
            &txn,
            &table_capture.primary_keys,
            &rows,
        );
        Ok(vec![CdcEvent {
            db: map.schema.clone(),
            table: map.table.clone(),
            json,
            txn,
            position: header.log_pos as u64,
            file: ctx.position.journal_name.clone(),
        }])
    }
}

/// MariaDB compressed rows: one header byte whose low bits give the
/// width of the uncompressed-length field, the length itself, then a
/// zlib stream covering the rest of the event.
fn inflate_rows(buf: &mut LogBuffer) -> StreamResult<Vec<u8>> {
    let head = buf.get_uint8()?;
    let len_bytes = (head & 0x07) as usize;
    let mut expected = 0usize;
    for i in 0..len_bytes {
        expected |= (buf.get_uint8()? as usize) << (8 * i);
    }
    let compressed = buf.get_data(buf.remaining())?;
    let mut out = Vec::with_capacity(expected);
    flate2::read::ZlibDecoder::new(&compressed[..])
        .read_to_end(&mut out)
        .map_err(|e| StreamError::Protocol(format!("inflate failed: {}", e)))?;
    if expected > 0 && out.len() != expected {
        return Err(StreamError::Protocol(format!(
            "inflate size mismatch: expected {}, got {}",
            expected,
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaEntry;
    use crate::instance::table_meta_cache::TableMeta;
    use crate::log::event::column_type;

    fn capture() -> CaptureConfig {
        let entries: Vec<SchemaEntry> = serde_json::from_str(
            r#"[{"name": "shop", "capture_dml": true, "capture_ddl": true,
                 "tables": [{"name": "orders", "columns": ["id", "total"], "primary_key": ["id"]}]}]"#,
        )
        .unwrap();
        CaptureConfig::from_entries(&entries)
    }

    fn seeded_meta_cache() -> TableMetaCache {
        let mut cache = TableMetaCache::from(None);
        cache.put(
            "shop",
            "orders",
            TableMeta {
                column_names: vec!["id".into(), "name".into(), "total".into()],
                enum_literals: vec![None, None, None],
            },
        );
        cache
    }

    fn frame_event(kind: u8, body: &[u8], log_pos: u32) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        raw.push(kind);
        raw.extend_from_slice(&1u32.to_le_bytes());
        raw.extend_from_slice(&((LogHeader::LEN + body.len()) as u32).to_le_bytes());
        raw.extend_from_slice(&log_pos.to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes());
        raw.extend_from_slice(body);
        raw
    }

    fn table_map_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_le_bytes()[..6]);
        body.extend_from_slice(&[0, 0]);
        body.push(4);
        body.extend_from_slice(b"shop\0");
        body.push(6);
        body.extend_from_slice(b"orders\0");
        body.push(3);
        body.extend_from_slice(&[
            column_type::LONG,
            column_type::VARCHAR,
            column_type::NEWDECIMAL,
        ]);
        body.push(4);
        body.extend_from_slice(&[64, 0]);
        body.extend_from_slice(&[10, 2]);
        body.push(0);
        body
    }

    fn write_rows_v2_body() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_le_bytes()[..6]);
        body.extend_from_slice(&[0, 0]);
        body.extend_from_slice(&2u16.to_le_bytes()); // v2 extra: nothing
        body.push(3); // column count
        body.push(0b111); // present bitmap
        body.push(0); // null bitmap
        body.extend_from_slice(&42i32.to_le_bytes());
        body.push(4);
        body.extend_from_slice(b"ACME");
        let mut dec = Vec::new();
        dec.extend_from_slice(&19u32.to_be_bytes());
        dec.push(95);
        dec[0] |= 0x80;
        body.extend_from_slice(&dec);
        body
    }

    fn query_body(schema: &str, sql: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.push(schema.len() as u8);
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(schema.as_bytes());
        body.push(0);
        body.extend_from_slice(sql.as_bytes());
        body
    }

    fn new_ctx() -> LogContext {
        LogContext::new(
            EntryPosition::from_position("mysql-bin.000042".into(), 4),
            false,
        )
    }

    #[test]
    fn test_insert_end_to_end() {
        let mut decoder = LogDecoder::new();
        let mut ctx = new_ctx();
        let mut capture = capture();
        let mut meta = seeded_meta_cache();

        let events = decoder
            .decode(
                frame_event(event_type::QUERY, &query_body("shop", "BEGIN"), 100),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert!(events.is_empty());
        let txn = ctx.txn.clone().unwrap();

        decoder
            .decode(
                frame_event(event_type::TABLE_MAP, &table_map_body(), 200),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        let events = decoder
            .decode(
                frame_event(event_type::WRITE_ROWS_V2, &write_rows_v2_body(), 300),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.db, "shop");
        assert_eq!(event.table, "orders");
        assert_eq!(event.txn, txn);
        assert_eq!(event.position, 300);
        assert_eq!(event.file, "mysql-bin.000042");
        assert_eq!(
            event.json,
            format!(
                r#"{{"type":"INSERT","txn":"{}","db":"shop","table":"orders","primary_key":["id"],"rows":[{{"id":42,"total":"19.95"}}]}}"#,
                txn
            )
        );

        // XID closes the transaction and emits a COMMIT record
        // (capture_ddl is on for shop).
        let mut xid_body = Vec::new();
        xid_body.extend_from_slice(&77u64.to_le_bytes());
        let events = decoder
            .decode(
                frame_event(event_type::XID, &xid_body, 400),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].json.contains("\"xid\":77"));
        assert!(ctx.txn.is_none());
        assert_eq!(ctx.position.position, 400);
    }

    #[test]
    fn test_uncaptured_table_skips_rows() {
        let mut decoder = LogDecoder::new();
        let mut ctx = new_ctx();
        let entries: Vec<SchemaEntry> =
            serde_json::from_str(r#"[{"name": "other", "tables": []}]"#).unwrap();
        let mut capture = CaptureConfig::from_entries(&entries);
        let mut meta = TableMetaCache::from(None);

        decoder
            .decode(
                frame_event(event_type::TABLE_MAP, &table_map_body(), 200),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert!(!ctx.maps.get(&7).unwrap().active);
        let events = decoder
            .decode(
                frame_event(event_type::WRITE_ROWS_V2, &write_rows_v2_body(), 300),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_rotate_updates_position_and_clears_maps() {
        let mut decoder = LogDecoder::new();
        let mut ctx = new_ctx();
        let mut capture = capture();
        let mut meta = seeded_meta_cache();
        decoder
            .decode(
                frame_event(event_type::TABLE_MAP, &table_map_body(), 200),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert!(!ctx.maps.is_empty());

        let mut body = Vec::new();
        body.extend_from_slice(&4u64.to_le_bytes());
        body.extend_from_slice(b"mysql-bin.000043");
        decoder
            .decode(
                frame_event(event_type::ROTATE, &body, 0),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert_eq!(ctx.position.journal_name, "mysql-bin.000043");
        assert_eq!(ctx.position.position, 4);
        assert!(ctx.maps.is_empty());
        assert!(ctx.force_checkpoint);
    }

    #[test]
    fn test_ddl_classification_and_gate() {
        let mut decoder = LogDecoder::new();
        let mut ctx = new_ctx();
        let mut capture = capture();
        let mut meta = seeded_meta_cache();
        let events = decoder
            .decode(
                frame_event(
                    event_type::QUERY,
                    &query_body("shop", "ALTER TABLE orders ADD COLUMN x INT"),
                    500,
                ),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].json.starts_with(r#"{"type":"ALTER""#));

        // DDL in a schema without capture_ddl is dropped
        let events = decoder
            .decode(
                frame_event(event_type::QUERY, &query_body("crm", "DROP TABLE t"), 600),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_txn_constant_across_transaction() {
        let mut decoder = LogDecoder::new();
        let mut ctx = new_ctx();
        let mut capture = capture();
        let mut meta = seeded_meta_cache();
        decoder
            .decode(
                frame_event(event_type::QUERY, &query_body("shop", "BEGIN"), 100),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        decoder
            .decode(
                frame_event(event_type::TABLE_MAP, &table_map_body(), 200),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        let first = decoder
            .decode(
                frame_event(event_type::WRITE_ROWS_V2, &write_rows_v2_body(), 300),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        decoder
            .decode(
                frame_event(event_type::TABLE_MAP, &table_map_body(), 350),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        let second = decoder
            .decode(
                frame_event(event_type::WRITE_ROWS_V2, &write_rows_v2_body(), 400),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert!(!first[0].txn.is_empty());
        assert_eq!(first[0].txn, second[0].txn);
    }

    #[test]
    fn test_compressed_rows_inflate() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut decoder = LogDecoder::new();
        let mut ctx = new_ctx();
        let mut capture = capture();
        let mut meta = seeded_meta_cache();
        decoder
            .decode(
                frame_event(event_type::TABLE_MAP, &table_map_body(), 200),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();

        // the section after the post-header, compressed
        let mut section = Vec::new();
        section.push(3);
        section.push(0b111);
        section.push(0);
        section.extend_from_slice(&42i32.to_le_bytes());
        section.push(4);
        section.extend_from_slice(b"ACME");
        let mut dec = Vec::new();
        dec.extend_from_slice(&19u32.to_be_bytes());
        dec.push(95);
        dec[0] |= 0x80;
        section.extend_from_slice(&dec);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&section).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_le_bytes()[..6]);
        body.extend_from_slice(&[0, 0]);
        body.push(0x80 | 1); // one length byte
        body.push(section.len() as u8);
        body.extend_from_slice(&compressed);

        let events = decoder
            .decode(
                frame_event(event_type::MARIA_WRITE_ROWS_COMPRESSED, &body, 700),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].json.contains(r#""id":42"#));
    }

    #[test]
    fn test_checksum_trailer_excluded() {
        let mut decoder = LogDecoder::new();
        let mut ctx = LogContext::new(
            EntryPosition::from_position("mysql-bin.000042".into(), 4),
            true,
        );
        let mut capture = capture();
        let mut meta = seeded_meta_cache();
        // rotate body plus 4 trailing checksum bytes that must not be
        // read as part of the file name
        let mut body = Vec::new();
        body.extend_from_slice(&4u64.to_le_bytes());
        body.extend_from_slice(b"mysql-bin.000050");
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        decoder
            .decode(
                frame_event(event_type::ROTATE, &body, 0),
                &mut ctx,
                &mut capture,
                &mut meta,
            )
            .unwrap();
        assert_eq!(ctx.position.journal_name, "mysql-bin.000050");
    }
}
