//! MySQL/MariaDB streaming runtime: connect, probe, dump, decode,
//! fan out, checkpoint.

use tracing::{error, info, warn};

use crate::capture::CaptureConfig;
use crate::channel::mysql_socket::MysqlConnection;
use crate::config::Config;
use crate::error::{StreamError, StreamResult};
use crate::instance::checkpoint::CheckpointStore;
use crate::instance::metadata::EntryPosition;
use crate::instance::running::Supervisor;
use crate::instance::table_meta_cache::TableMetaCache;
use crate::log::decoder::{LogContext, LogDecoder};
use crate::publish::manager::PublisherManager;

pub struct MysqlStreamer {
    connection: MysqlConnection,
    meta_cache: TableMetaCache,
    decoder: LogDecoder,
    capture: CaptureConfig,
}

impl MysqlStreamer {
    pub fn from_config(config: &Config) -> StreamResult<MysqlStreamer> {
        let server = config.server();
        let mut connection = MysqlConnection::from_schema(
            server.host.clone(),
            server.port,
            server.username.clone(),
            server.password.clone(),
            String::new(),
        );
        connection.set_slave_id(config.replication.server_id.unwrap_or(0));
        Ok(MysqlStreamer {
            connection,
            meta_cache: TableMetaCache::from(None),
            decoder: LogDecoder::new(),
            capture: config.capture_config(),
        })
    }

    fn find_start_position(
        &mut self,
        config: &Config,
        checkpoint: &CheckpointStore,
    ) -> StreamResult<EntryPosition> {
        if config.replication.save_last_position {
            if let Some(position) = checkpoint.load_mysql()? {
                info!("resuming from checkpoint {}", position);
                return Ok(position);
            }
        }
        if let (Some(file), Some(position)) = (
            &config.replication.binlog_file,
            config.replication.binlog_position,
        ) {
            return Ok(EntryPosition::from_position(file.clone(), position));
        }
        // fall back to the server's current head
        let status = self.connection.query("SHOW MASTER STATUS")?;
        let row = status.rows.first().ok_or_else(|| {
            StreamError::Connection(
                "SHOW MASTER STATUS returned nothing; check REPLICATION CLIENT privilege"
                    .to_string(),
            )
        })?;
        let file = row.columns.first().cloned().flatten().unwrap_or_default();
        let position = row
            .columns
            .get(1)
            .cloned()
            .flatten()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);
        Ok(EntryPosition::from_position(file, position))
    }

    /// Run until shutdown or a terminal stream error.
    pub fn run(
        &mut self,
        config: &Config,
        checkpoint: &CheckpointStore,
        manager: &PublisherManager,
        supervisor: &Supervisor,
    ) -> StreamResult<()> {
        self.connection.connect()?;
        let server_id = self.connection.query_server_id().unwrap_or(0);
        info!("master server_id {}", server_id);

        let checksum = self.connection.probe_checksum()?;
        info!("binlog checksum {}", if checksum { "CRC32" } else { "off" });
        self.connection.announce_capabilities()?;

        // side session for column names and ENUM literals
        let mut meta_connection = self.connection.fork();
        meta_connection.connect()?;
        self.meta_cache = TableMetaCache::from(Some(meta_connection));

        let position = self.find_start_position(config, checkpoint)?;
        let mut ctx = LogContext::new(position.clone(), checksum);

        if let Some(stream) = self.connection.try_clone_stream() {
            supervisor.watch_socket(stream);
        }
        self.connection
            .dump(&position.journal_name, position.position as u32)?;

        let result = self.stream_loop(&mut ctx, checkpoint, manager, supervisor);

        // final checkpoint is best-effort
        if config.replication.save_last_position {
            if let Err(e) = checkpoint.save_mysql(&ctx.position) {
                warn!("final checkpoint failed: {}", e);
            }
        }
        self.connection.disconnect();
        result
    }

    fn stream_loop(
        &mut self,
        ctx: &mut LogContext,
        checkpoint: &CheckpointStore,
        manager: &PublisherManager,
        supervisor: &Supervisor,
    ) -> StreamResult<()> {
        while supervisor.running() {
            let raw = match self.connection.fetch_binlog_event() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    info!("binlog stream ended by server");
                    break;
                }
                Err(e) => {
                    if !supervisor.running() {
                        break;
                    }
                    return Err(e);
                }
            };

            let events = match self.decoder.decode(raw, ctx, &mut self.capture, &mut self.meta_cache)
            {
                Ok(events) => events,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    // resynchronize on the next event boundary
                    error!("event decode failed ({}): {}", e.kind(), e);
                    continue;
                }
            };

            let produced = !events.is_empty();
            for event in &events {
                manager.publish_event(event);
            }

            let force = std::mem::take(&mut ctx.force_checkpoint);
            if (produced || force) && checkpoint.should_save(force) {
                if let Err(e) = checkpoint.save_mysql(&ctx.position) {
                    warn!("checkpoint write failed: {}", e);
                }
            }
        }
        Ok(())
    }
}
