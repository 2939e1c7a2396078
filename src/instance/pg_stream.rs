//! PostgreSQL streaming runtime: slot clamp, START_REPLICATION, poll
//! loop, standby feedback, checkpoint at commit boundaries.

use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::capture::CaptureConfig;
use crate::channel::pg_socket::PgConnection;
use crate::config::Config;
use crate::error::{StreamError, StreamResult};
use crate::instance::checkpoint::CheckpointStore;
use crate::instance::metadata::Lsn;
use crate::instance::running::Supervisor;
use crate::log::pgoutput::{
    format_lsn, parse_copy_data, standby_status_update, PgContext, PgDecoder, ReplicationMessage,
};
use crate::publish::manager::PublisherManager;
use crate::utils::time::postgres_feedback_micros;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub struct PgStreamer {
    connection: PgConnection,
    decoder: PgDecoder,
    capture: CaptureConfig,
}

impl PgStreamer {
    pub fn from_config(config: &Config) -> StreamResult<PgStreamer> {
        let server = config.server();
        let dbname = server.dbname.clone().ok_or_else(|| {
            StreamError::Config("postgres_server.dbname is required".to_string())
        })?;
        Ok(PgStreamer {
            connection: PgConnection::new(
                server.host.clone(),
                server.port,
                server.username.clone(),
                server.password.clone(),
                dbname,
            ),
            decoder: PgDecoder::new(),
            capture: config.capture_config(),
        })
    }

    fn find_start_lsn(
        &mut self,
        config: &Config,
        checkpoint: &CheckpointStore,
        slot: &str,
    ) -> StreamResult<Lsn> {
        let mut start = Lsn(0);
        if config.replication.save_last_position {
            if let Some(lsn) = checkpoint.load_lsn()? {
                info!("resuming from checkpoint {}", lsn);
                start = lsn;
            }
        }
        if start == Lsn(0) {
            if let Some(text) = &config.replication.start_lsn {
                start = text.parse()?;
            }
        }

        // never start ahead of what the server has confirmed for the slot
        let confirmed = self.connection.simple_query(&format!(
            "SELECT confirmed_flush_lsn FROM pg_replication_slots WHERE slot_name = '{}'",
            slot
        ))?;
        let Some(confirmed_text) = confirmed
            .rows
            .first()
            .and_then(|row| row.first().cloned().flatten())
        else {
            return Err(StreamError::Connection(format!(
                "replication slot `{}` not found",
                slot
            )));
        };
        let confirmed: Lsn = confirmed_text.parse()?;
        if start > confirmed {
            warn!(
                "start LSN {} is ahead of slot's confirmed {}, clamping down",
                start, confirmed
            );
            start = confirmed;
        }
        Ok(start)
    }

    pub fn run(
        &mut self,
        config: &Config,
        checkpoint: &CheckpointStore,
        manager: &PublisherManager,
        supervisor: &Supervisor,
    ) -> StreamResult<()> {
        let slot = config.replication.slot_name.clone().unwrap();
        let publication = config.replication.publication_name.clone().unwrap();

        self.connection.connect(true)?;
        let start = self.find_start_lsn(config, checkpoint, &slot)?;
        self.connection
            .start_replication(&slot, &start.to_string(), &publication)?;

        let mut ctx = PgContext::new(start.value());
        let result = self.stream_loop(&mut ctx, checkpoint, manager, supervisor);

        // final feedback so the server persists confirmed_flush_lsn, then
        // the final checkpoint; both best-effort
        self.connection
            .send_copy_data(&standby_status_update(
                ctx.current_lsn,
                postgres_feedback_micros(),
            ))
            .ok();
        self.connection.send_copy_done().ok();
        if config.replication.save_last_position {
            if let Err(e) = checkpoint.save_lsn(Lsn(ctx.current_lsn)) {
                warn!("final checkpoint failed: {}", e);
            }
        }
        self.connection.close();
        result
    }

    fn stream_loop(
        &mut self,
        ctx: &mut PgContext,
        checkpoint: &CheckpointStore,
        manager: &PublisherManager,
        supervisor: &Supervisor,
    ) -> StreamResult<()> {
        let mut last_status = Instant::now();
        while supervisor.running() {
            if last_status.elapsed() >= STATUS_INTERVAL {
                self.send_status(ctx.current_lsn)?;
                last_status = Instant::now();
            }

            let payload = match self.connection.read_copy_data(POLL_TIMEOUT) {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    if !supervisor.running() {
                        break;
                    }
                    return Err(e);
                }
            };

            match parse_copy_data(payload)? {
                ReplicationMessage::Keepalive {
                    end_lsn,
                    reply_requested,
                    ..
                } => {
                    if end_lsn > ctx.current_lsn {
                        ctx.current_lsn = end_lsn;
                    }
                    if reply_requested {
                        self.send_status(ctx.current_lsn)?;
                        last_status = Instant::now();
                    }
                }
                ReplicationMessage::XLogData {
                    end_lsn, payload, ..
                } => {
                    if end_lsn > ctx.current_lsn {
                        ctx.current_lsn = end_lsn;
                    }
                    let events =
                        match self.decoder.handle_message(payload, ctx, &mut self.capture) {
                            Ok(events) => events,
                            Err(e) if e.is_fatal() => return Err(e),
                            Err(e) => {
                                error!("pgoutput decode failed ({}): {}", e.kind(), e);
                                continue;
                            }
                        };

                    let produced = !events.is_empty();
                    for event in &events {
                        manager.publish_event(event);
                    }

                    // commits always advance the checkpoint
                    let committed = std::mem::take(&mut ctx.committed);
                    if (produced || committed) && checkpoint.should_save(committed) {
                        if let Err(e) = checkpoint.save_lsn(Lsn(ctx.current_lsn)) {
                            warn!("checkpoint write failed: {}", e);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn send_status(&mut self, lsn: u64) -> StreamResult<()> {
        debug!("standby status update at {}", format_lsn(lsn));
        self.connection
            .send_copy_data(&standby_status_update(lsn, postgres_feedback_micros()))
    }
}
