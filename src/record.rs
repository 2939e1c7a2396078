//! The row-change record handed to publishers, and its JSON rendering.
//!
//! One event is one compact JSON object with no surrounding whitespace.
//! Keys are emitted in a fixed order: `type`, `txn`, `db`/`schema`,
//! `table`, `primary_key`, then the kind-specific payload (`rows`,
//! `query`, or `xid`).

use std::fmt;

pub const BLOB_PREVIEW_LIMIT: usize = 200;

/// Owned event as delivered to sinks. Every string is a deep copy so the
/// decoder can reuse its scratch buffers the moment the record is built.
#[derive(Debug, Clone, PartialEq)]
pub struct CdcEvent {
    pub db: String,
    pub table: String,
    pub json: String,
    pub txn: String,
    /// Byte offset (MySQL) or LSN (PostgreSQL).
    pub position: u64,
    /// Binlog file name; empty for PostgreSQL.
    pub file: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Truncate,
    Rename,
    Commit,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Insert => "INSERT",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::Create => "CREATE",
            EventKind::Alter => "ALTER",
            EventKind::Drop => "DROP",
            EventKind::Truncate => "TRUNCATE",
            EventKind::Rename => "RENAME",
            EventKind::Commit => "COMMIT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded column value, already shaped for JSON emission.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// Emitted bare: integers, floats, decimals, unresolved ENUM indexes.
    Number(String),
    /// Emitted quoted with escaping.
    Text(String),
}

/// A single row image: captured `(name, value)` pairs in physical order.
pub type RowValues = Vec<(String, ColumnValue)>;

#[derive(Debug, Clone)]
pub enum RowImage {
    Plain(RowValues),
    BeforeAfter { before: RowValues, after: RowValues },
}

/// JSON string escaping: `"` and `\` are escaped, `\n`/`\r`/`\t` use the
/// short forms, any other control byte becomes `\u00XX`.
pub fn json_escape_into(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
}

pub fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    json_escape_into(&mut out, s);
    out
}

/// Lossy preview of a binary payload: printable ASCII kept, everything
/// else replaced by `.`, truncated at [`BLOB_PREVIEW_LIMIT`] bytes with a
/// trailing `...`.
pub fn blob_preview(bytes: &[u8]) -> String {
    let truncated = bytes.len() > BLOB_PREVIEW_LIMIT;
    let shown = &bytes[..bytes.len().min(BLOB_PREVIEW_LIMIT)];
    let mut out = String::with_capacity(shown.len() + 3);
    for &b in shown {
        if (0x20..0x7f).contains(&b) {
            out.push(b as char);
        } else {
            out.push('.');
        }
    }
    if truncated {
        out.push_str("...");
    }
    out
}

fn write_value(out: &mut String, value: &ColumnValue) {
    match value {
        ColumnValue::Null => out.push_str("null"),
        ColumnValue::Number(n) => out.push_str(n),
        ColumnValue::Text(s) => {
            out.push('"');
            json_escape_into(out, s);
            out.push('"');
        }
    }
}

fn write_row(out: &mut String, row: &RowValues) {
    out.push('{');
    for (i, (name, value)) in row.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('"');
        json_escape_into(out, name);
        out.push_str("\":");
        write_value(out, value);
    }
    out.push('}');
}

fn write_prologue(
    out: &mut String,
    kind: EventKind,
    txn: &str,
    schema_key: &str,
    schema: &str,
) {
    out.push_str("{\"type\":\"");
    out.push_str(kind.as_str());
    out.push_str("\",\"txn\":\"");
    json_escape_into(out, txn);
    out.push_str("\",\"");
    out.push_str(schema_key);
    out.push_str("\":\"");
    json_escape_into(out, schema);
    out.push('"');
}

/// Render an INSERT/UPDATE/DELETE payload. `schema_key` is `"db"` for
/// MySQL and `"schema"` for PostgreSQL. `primary_keys` is emitted only
/// when configured.
pub fn render_dml(
    kind: EventKind,
    schema_key: &str,
    schema: &str,
    table: &str,
    txn: &str,
    primary_keys: &[String],
    rows: &[RowImage],
) -> String {
    let mut out = String::with_capacity(128);
    write_prologue(&mut out, kind, txn, schema_key, schema);
    out.push_str(",\"table\":\"");
    json_escape_into(&mut out, table);
    out.push('"');
    if !primary_keys.is_empty() {
        out.push_str(",\"primary_key\":[");
        for (i, pk) in primary_keys.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push('"');
            json_escape_into(&mut out, pk);
            out.push('"');
        }
        out.push(']');
    }
    out.push_str(",\"rows\":[");
    for (i, row) in rows.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match row {
            RowImage::Plain(values) => write_row(&mut out, values),
            RowImage::BeforeAfter { before, after } => {
                out.push_str("{\"before\":");
                write_row(&mut out, before);
                out.push_str(",\"after\":");
                write_row(&mut out, after);
                out.push('}');
            }
        }
    }
    out.push_str("]}");
    out
}

/// Render a DDL payload; the table is not always known, so only the
/// schema and the escaped query text are carried.
pub fn render_ddl(kind: EventKind, schema_key: &str, schema: &str, txn: &str, query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 64);
    write_prologue(&mut out, kind, txn, schema_key, schema);
    out.push_str(",\"query\":\"");
    json_escape_into(&mut out, query);
    out.push_str("\"}");
    out
}

/// Render a MySQL COMMIT payload carrying the XID.
pub fn render_commit(schema_key: &str, schema: &str, txn: &str, xid: u64) -> String {
    let mut out = String::with_capacity(96);
    write_prologue(&mut out, EventKind::Commit, txn, schema_key, schema);
    out.push_str(",\"xid\":");
    out.push_str(&xid.to_string());
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escaping() {
        assert_eq!(json_escape("a\"b\\c"), "a\\\"b\\\\c");
        assert_eq!(json_escape("x\ny\rz\t"), "x\\ny\\rz\\t");
        assert_eq!(json_escape("\u{0}\u{7}"), "\\u0000\\u0007");
        assert_eq!(json_escape("plain"), "plain");
    }

    #[test]
    fn test_blob_preview() {
        assert_eq!(blob_preview(b"abc\x00\x01def"), "abc..def");
        let long = vec![b'x'; 300];
        let preview = blob_preview(&long);
        assert_eq!(preview.len(), BLOB_PREVIEW_LIMIT + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_render_insert() {
        let rows = vec![RowImage::Plain(vec![
            ("id".to_string(), ColumnValue::Number("42".into())),
            ("total".to_string(), ColumnValue::Text("19.95".into())),
        ])];
        let json = render_dml(
            EventKind::Insert,
            "db",
            "shop",
            "orders",
            "txn-1",
            &["id".to_string()],
            &rows,
        );
        assert_eq!(
            json,
            r#"{"type":"INSERT","txn":"txn-1","db":"shop","table":"orders","primary_key":["id"],"rows":[{"id":42,"total":"19.95"}]}"#
        );
    }

    #[test]
    fn test_render_update_before_after() {
        let rows = vec![RowImage::BeforeAfter {
            before: vec![("id".to_string(), ColumnValue::Number("1".into()))],
            after: vec![("id".to_string(), ColumnValue::Number("2".into()))],
        }];
        let json = render_dml(EventKind::Update, "schema", "public", "t", "x", &[], &rows);
        assert_eq!(
            json,
            r#"{"type":"UPDATE","txn":"x","schema":"public","table":"t","rows":[{"before":{"id":1},"after":{"id":2}}]}"#
        );
    }

    #[test]
    fn test_render_ddl_and_commit() {
        let ddl = render_ddl(EventKind::Alter, "db", "shop", "t1", "ALTER TABLE \"x\"");
        assert_eq!(
            ddl,
            r#"{"type":"ALTER","txn":"t1","db":"shop","query":"ALTER TABLE \"x\""}"#
        );
        let commit = render_commit("db", "shop", "t1", 77);
        assert_eq!(commit, r#"{"type":"COMMIT","txn":"t1","db":"shop","xid":77}"#);
    }

    #[test]
    fn test_primary_key_omitted_when_unconfigured() {
        let json = render_dml(EventKind::Delete, "db", "s", "t", "x", &[], &[]);
        assert!(!json.contains("primary_key"));
    }
}
