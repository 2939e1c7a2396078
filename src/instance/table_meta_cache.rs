//! Column-name and ENUM-literal lookups through the metadata side
//! connection.
//!
//! Table-map events carry machine types but no names; names are read from
//! the column labels of a `SELECT * ... LIMIT 0` resultset, and ENUM
//! literal tables from `SHOW COLUMNS`. Results are cached per
//! `schema.table` and invalidated when a replacement descriptor with a
//! different identity arrives.

use std::collections::HashMap;

use tracing::debug;

use crate::channel::mysql_socket::MysqlConnection;
use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, Default)]
pub struct TableMeta {
    pub column_names: Vec<String>,
    /// Aligned with `column_names`; `Some` only for ENUM columns.
    pub enum_literals: Vec<Option<Vec<String>>>,
}

pub struct TableMetaCache {
    table_meta: HashMap<String, TableMeta>,
    connection: Option<MysqlConnection>,
}

impl TableMetaCache {
    pub fn from(connection: Option<MysqlConnection>) -> TableMetaCache {
        TableMetaCache {
            table_meta: HashMap::new(),
            connection,
        }
    }

    fn key(schema: &str, table: &str) -> String {
        format!("{}.{}", schema, table)
    }

    /// Pre-seed an entry, also used when a test has no live connection.
    pub fn put(&mut self, schema: &str, table: &str, meta: TableMeta) {
        self.table_meta.insert(Self::key(schema, table), meta);
    }

    pub fn invalidate(&mut self, schema: &str, table: &str) {
        self.table_meta.remove(&Self::key(schema, table));
    }

    pub fn get_table_meta(&mut self, schema: &str, table: &str) -> StreamResult<&TableMeta> {
        let key = Self::key(schema, table);
        if !self.table_meta.contains_key(&key) {
            let meta = self.fetch(schema, table)?;
            self.table_meta.insert(key.clone(), meta);
        }
        Ok(self.table_meta.get(&key).unwrap())
    }

    fn fetch(&mut self, schema: &str, table: &str) -> StreamResult<TableMeta> {
        let connection = self.connection.as_mut().ok_or_else(|| {
            StreamError::Decode(format!(
                "no metadata connection to resolve columns of {}.{}",
                schema, table
            ))
        })?;

        let probe = connection.query(&format!(
            "SELECT * FROM `{}`.`{}` LIMIT 0",
            schema, table
        ))?;
        let column_names = probe.column_names();
        debug!(
            "fetched {} column name(s) for {}.{}",
            column_names.len(),
            schema,
            table
        );

        let mut enum_literals = vec![None; column_names.len()];
        let described = connection.query(&format!("SHOW COLUMNS FROM `{}`.`{}`", schema, table))?;
        for row in &described.rows {
            let (Some(Some(field)), Some(Some(kind))) = (row.columns.first(), row.columns.get(1))
            else {
                continue;
            };
            if let Some(literals) = parse_enum_literals(kind) {
                if let Some(index) = column_names.iter().position(|n| n == field) {
                    enum_literals[index] = Some(literals);
                }
            }
        }

        Ok(TableMeta {
            column_names,
            enum_literals,
        })
    }
}

/// Parse `enum('open','paid','cancelled')` into its literal list.
fn parse_enum_literals(column_type: &str) -> Option<Vec<String>> {
    use str_utils::StartsWithIgnoreAsciiCase;

    let trimmed = column_type.trim();
    if !trimmed.starts_with_ignore_ascii_case("enum(") || !trimmed.ends_with(')') {
        return None;
    }
    let inner = &trimmed[5..trimmed.len() - 1];
    let mut literals = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_quote => in_quote = true,
            '\'' if in_quote => {
                // doubled quote is an escaped quote inside the literal
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    current.push('\'');
                } else {
                    in_quote = false;
                    literals.push(std::mem::take(&mut current));
                }
            }
            ',' if !in_quote => {}
            c if in_quote => current.push(c),
            _ => {}
        }
    }
    Some(literals)
}
