//! Capture set: which schemas, tables and columns are exported.
//!
//! Built once from the configuration and then resolved incrementally as
//! table-map/relation messages arrive: each configured column name is bound
//! to its index in the physical column order announced by the server, so
//! the projection can walk the row image in stream order.

use crate::config::SchemaEntry;

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    schemas: Vec<SchemaCapture>,
}

#[derive(Debug, Clone)]
pub struct SchemaCapture {
    pub name: String,
    pub capture_dml: bool,
    pub capture_ddl: bool,
    pub tables: Vec<TableCapture>,
}

#[derive(Debug, Clone)]
pub struct TableCapture {
    pub name: String,
    pub capture_all_columns: bool,
    pub columns: Vec<ColumnCapture>,
    pub primary_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ColumnCapture {
    pub name: String,
    /// Index in the physical column order; bound at the first
    /// table-map/relation for the table.
    pub index: Option<usize>,
}

impl CaptureConfig {
    pub fn from_entries(entries: &[SchemaEntry]) -> CaptureConfig {
        let schemas = entries
            .iter()
            .map(|s| SchemaCapture {
                name: s.name.clone(),
                capture_dml: s.capture_dml,
                capture_ddl: s.capture_ddl,
                tables: s
                    .tables
                    .iter()
                    .map(|t| TableCapture {
                        name: t.name.clone(),
                        capture_all_columns: t.capture_all_columns,
                        columns: t
                            .columns
                            .iter()
                            .map(|c| ColumnCapture {
                                name: c.clone(),
                                index: None,
                            })
                            .collect(),
                        primary_keys: t.primary_key.clone(),
                    })
                    .collect(),
            })
            .collect();
        CaptureConfig { schemas }
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaCapture> {
        self.schemas.iter().find(|s| s.name == name)
    }

    pub fn schema_mut(&mut self, name: &str) -> Option<&mut SchemaCapture> {
        self.schemas.iter_mut().find(|s| s.name == name)
    }

    pub fn table(&self, schema: &str, table: &str) -> Option<&TableCapture> {
        self.schema(schema)?.tables.iter().find(|t| t.name == table)
    }

    pub fn table_mut(&mut self, schema: &str, table: &str) -> Option<&mut TableCapture> {
        self.schema_mut(schema)?
            .tables
            .iter_mut()
            .find(|t| t.name == table)
    }

    /// Whether row events of `schema.table` are exported at all. This gate
    /// runs before the row image is decoded.
    pub fn captures_dml(&self, schema: &str, table: &str) -> bool {
        match self.schema(schema) {
            Some(s) => s.capture_dml && s.tables.iter().any(|t| t.name == table),
            None => false,
        }
    }

    pub fn captures_ddl(&self, schema: &str) -> bool {
        self.schema(schema).map(|s| s.capture_ddl).unwrap_or(false)
    }

    /// Bind configured column names to their physical indexes.
    ///
    /// Under `capture_all_columns` the column list is rebuilt from the
    /// announced order; otherwise each configured name is looked up and
    /// unknown names stay unbound (and are skipped by the projection).
    pub fn resolve_columns(&mut self, schema: &str, table: &str, physical: &[String]) {
        let Some(t) = self.table_mut(schema, table) else {
            return;
        };
        if t.capture_all_columns {
            t.columns = physical
                .iter()
                .enumerate()
                .map(|(i, name)| ColumnCapture {
                    name: name.clone(),
                    index: Some(i),
                })
                .collect();
        } else {
            for col in &mut t.columns {
                col.index = physical.iter().position(|n| n == &col.name);
            }
        }
    }
}

impl TableCapture {
    /// Captured `(physical_index, column_name)` pairs in physical order.
    pub fn projected(&self) -> Vec<(usize, &str)> {
        let mut out: Vec<(usize, &str)> = self
            .columns
            .iter()
            .filter_map(|c| c.index.map(|i| (i, c.name.as_str())))
            .collect();
        out.sort_by_key(|(i, _)| *i);
        out
    }

    /// Whether the physical index is one of the captured columns.
    pub fn captures_index(&self, index: usize) -> bool {
        self.columns.iter().any(|c| c.index == Some(index))
    }
}
