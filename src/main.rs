use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mini_cdc::config::{Config, Dialect};
use mini_cdc::instance::checkpoint::CheckpointStore;
use mini_cdc::instance::mysql_stream::MysqlStreamer;
use mini_cdc::instance::pg_stream::PgStreamer;
use mini_cdc::instance::running::Supervisor;
use mini_cdc::publish::api::PublisherRegistry;
use mini_cdc::publish::manager::PublisherManager;

#[derive(Parser)]
#[command(name = "mini-cdc", about = "Stream database changes to pluggable sinks")]
struct Cli {
    /// JSON configuration file.
    config: PathBuf,
}

fn init_logging(config: &Config) {
    let level = config
        .logging
        .log_level
        .as_deref()
        .or(config.logging.stdout_level.as_deref())
        .unwrap_or("info");
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(1);
        }
    };
    init_logging(&config);

    match run(&config) {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::from(1)
        }
    }
}

fn run(config: &Config) -> mini_cdc::StreamResult<()> {
    let checkpoint = CheckpointStore::new(
        config.replication.checkpoint_file.as_ref().map(PathBuf::from),
        config.replication.save_position_event_count,
    );

    let registry = PublisherRegistry::with_builtin_sinks();
    let mut manager = PublisherManager::new();
    manager.load(&registry, &config.publishers)?;
    manager.start_all()?;

    let supervisor = Supervisor::new()?;

    let result = match config.dialect() {
        Dialect::Mysql => {
            let mut streamer = MysqlStreamer::from_config(config)?;
            streamer.run(config, &checkpoint, &manager, &supervisor)
        }
        Dialect::Postgres => {
            let mut streamer = PgStreamer::from_config(config)?;
            streamer.run(config, &checkpoint, &manager, &supervisor)
        }
    };

    // publishers drain and tear down whether or not the stream ended well
    manager.log_health();
    manager.shutdown();

    match result {
        // a socket error after a shutdown request is a normal exit
        Err(e) if !supervisor.running() && !e.is_fatal() => {
            info!("stream closed during shutdown: {}", e);
            Ok(())
        }
        other => other,
    }
}
