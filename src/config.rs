//! Configuration file model.
//!
//! The streamer is driven by a single JSON document. Exactly one of
//! `master_server` (MySQL/MariaDB) or `postgres_server` must be present;
//! the capture tree lives under `capture.databases` or `capture.schemas`
//! depending on dialect. Legacy spellings from older deployments are
//! accepted: `max_queu_depth` for the publisher queue depth, and a bare
//! string for `primary_key`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::capture::CaptureConfig;
use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub master_server: Option<ServerConfig>,
    pub postgres_server: Option<ServerConfig>,
    pub replication: ReplicationConfig,
    pub capture: CaptureSection,
    #[serde(default)]
    pub publishers: Vec<PublisherEntry>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    pub log_level: Option<String>,
    pub stdout_level: Option<String>,
    pub log_file: Option<String>,
    // Rotation knobs are parsed for compatibility; rotation itself is the
    // logging backend's concern.
    pub max_log_count: Option<u32>,
    pub max_file_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// MySQL only.
    pub timezone: Option<String>,
    /// PostgreSQL only.
    pub dbname: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    // MySQL side
    pub server_id: Option<u32>,
    pub binlog_file: Option<String>,
    pub binlog_position: Option<u64>,
    // PostgreSQL side
    pub slot_name: Option<String>,
    pub publication_name: Option<String>,
    /// `HEX/HEX` LSN string.
    pub start_lsn: Option<String>,
    // Checkpointing
    #[serde(default)]
    pub save_last_position: bool,
    #[serde(default)]
    pub save_position_event_count: u64,
    pub checkpoint_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureSection {
    #[serde(default)]
    pub databases: Vec<SchemaEntry>,
    #[serde(default)]
    pub schemas: Vec<SchemaEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub capture_dml: bool,
    #[serde(default)]
    pub capture_ddl: bool,
    #[serde(default)]
    pub tables: Vec<TableEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableEntry {
    pub name: String,
    #[serde(default)]
    pub capture_all_columns: bool,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default, deserialize_with = "string_or_seq", alias = "primary_keys")]
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherEntry {
    pub plugin: PluginConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Accepted for compatibility with shared-library deployments; sinks
    /// here are resolved through the static factory registry instead.
    pub library_path: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default, alias = "max_queu_depth")]
    pub max_queue_depth: usize,
    #[serde(default)]
    pub publish_databases: Vec<String>,
    #[serde(default)]
    pub publish_schemas: Vec<String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// `primary_key` historically accepted either `"id"` or `["id", "ts"]`.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrSeq {
        One(String),
        Many(Vec<String>),
    }
    Ok(match StringOrSeq::deserialize(deserializer)? {
        StringOrSeq::One(s) => vec![s],
        StringOrSeq::Many(v) => v,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mysql,
    Postgres,
}

impl Config {
    pub fn load(path: &Path) -> StreamResult<Config> {
        let text = fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| StreamError::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn dialect(&self) -> Dialect {
        if self.master_server.is_some() {
            Dialect::Mysql
        } else {
            Dialect::Postgres
        }
    }

    pub fn server(&self) -> &ServerConfig {
        match self.dialect() {
            Dialect::Mysql => self.master_server.as_ref().unwrap(),
            Dialect::Postgres => self.postgres_server.as_ref().unwrap(),
        }
    }

    /// The dialect's capture tree (`databases` for MySQL, `schemas` for
    /// PostgreSQL; whichever is non-empty wins for lenient configs).
    pub fn capture_entries(&self) -> &[SchemaEntry] {
        match self.dialect() {
            Dialect::Mysql if !self.capture.databases.is_empty() => &self.capture.databases,
            Dialect::Postgres if !self.capture.schemas.is_empty() => &self.capture.schemas,
            _ if !self.capture.databases.is_empty() => &self.capture.databases,
            _ => &self.capture.schemas,
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig::from_entries(self.capture_entries())
    }

    fn validate(&self) -> StreamResult<()> {
        if self.master_server.is_none() && self.postgres_server.is_none() {
            return Err(StreamError::Config(
                "one of master_server or postgres_server is required".into(),
            ));
        }
        if self.master_server.is_some() && self.postgres_server.is_some() {
            return Err(StreamError::Config(
                "master_server and postgres_server are mutually exclusive".into(),
            ));
        }
        match self.dialect() {
            Dialect::Mysql => {
                if self.replication.server_id.is_none() {
                    return Err(StreamError::Config(
                        "replication.server_id is required for MySQL".into(),
                    ));
                }
            }
            Dialect::Postgres => {
                if self.replication.slot_name.is_none()
                    || self.replication.publication_name.is_none()
                {
                    return Err(StreamError::Config(
                        "replication.slot_name and publication_name are required for PostgreSQL"
                            .into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    const MYSQL_CONFIG: &str = r#"{
        "logging": {"log_level": "debug"},
        "master_server": {"host": "127.0.0.1", "port": 3306, "username": "repl", "password": "s3cret"},
        "replication": {"server_id": 1001, "binlog_file": "mysql-bin.000001", "binlog_position": 4,
                        "save_last_position": true, "save_position_event_count": 100,
                        "checkpoint_file": "/tmp/cp.txt"},
        "capture": {"databases": [
            {"name": "shop", "capture_dml": true, "capture_ddl": true,
             "tables": [{"name": "orders", "columns": ["id", "total"], "primary_key": ["id"]}]}
        ]},
        "publishers": [
            {"plugin": {"name": "file", "active": true, "max_queu_depth": 64,
                        "publish_databases": ["shop"],
                        "config": {"file_path": "/tmp/out.jsonl", "flush_every_event": "yes"}}}
        ]
    }"#;

    #[test]
    fn test_mysql_config_roundtrip() {
        let c = parse(MYSQL_CONFIG);
        assert_eq!(c.dialect(), Dialect::Mysql);
        assert_eq!(c.server().host, "127.0.0.1");
        assert_eq!(c.replication.server_id, Some(1001));
        assert_eq!(c.publishers.len(), 1);
        // legacy spelling
        assert_eq!(c.publishers[0].plugin.max_queue_depth, 64);
        let tables = &c.capture_entries()[0].tables;
        assert_eq!(tables[0].primary_key, vec!["id"]);
        c.validate().unwrap();
    }

    #[test]
    fn test_primary_key_accepts_bare_string() {
        let entry: TableEntry =
            serde_json::from_str(r#"{"name": "t", "primary_key": "id"}"#).unwrap();
        assert_eq!(entry.primary_key, vec!["id"]);
        let entry: TableEntry =
            serde_json::from_str(r#"{"name": "t", "primary_key": ["a", "b"]}"#).unwrap();
        assert_eq!(entry.primary_key, vec!["a", "b"]);
    }

    #[test]
    fn test_postgres_config() {
        let c = parse(
            r#"{
            "postgres_server": {"host": "::1", "port": 5432, "username": "cdc", "dbname": "app"},
            "replication": {"slot_name": "s", "publication_name": "p", "start_lsn": "0/16B2B80"},
            "capture": {"schemas": [{"name": "public", "tables": [{"name": "t", "capture_all_columns": true}]}]}
        }"#,
        );
        assert_eq!(c.dialect(), Dialect::Postgres);
        assert_eq!(c.capture_entries()[0].name, "public");
        c.validate().unwrap();
    }

    #[test]
    fn test_both_servers_rejected() {
        let c = parse(
            r#"{
            "master_server": {"host": "a", "port": 1, "username": "u"},
            "postgres_server": {"host": "b", "port": 2, "username": "u"},
            "replication": {"server_id": 1},
            "capture": {}
        }"#,
        );
        assert!(c.validate().is_err());
    }
}
