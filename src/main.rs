//! CLI entry point for the CDC consumer
//!
//! Parses configuration from arguments and environment, initializes tracing,
//! and drives a replication session with the default logging consumer. The
//! libpq-backed session is synchronous, so it runs in a blocking task while
//! the async edge handles Ctrl-C.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use pgcdc::core::ReplicationConfig;
use pgcdc::events::LogStore;
use pgcdc::replication::{PgReplicationTransport, ReplicationSession};
use pgcdc::{InMemoryMetadataStore, SourceDBHandler};

#[derive(Parser, Debug)]
#[command(name = "pgcdc", about = "PostgreSQL logical CDC consumer", version)]
struct Args {
    /// Source database connection string
    #[arg(long, env = "PGCDC_DSN")]
    dsn: String,

    /// Publication to subscribe to
    #[arg(long, env = "PGCDC_PUBLICATION", default_value = "pub")]
    publication: String,

    /// Replication slot; created if missing
    #[arg(long, env = "PGCDC_SLOT", default_value = "sub")]
    slot: String,

    /// LSN to resume from ("X/X" or 0 for the slot's confirmed position)
    #[arg(long, env = "PGCDC_LSN", default_value = "0")]
    start_lsn: String,

    /// Log change events only, without per-message transaction chatter
    #[arg(long, env = "PGCDC_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();
    let config = ReplicationConfig::new(args.dsn, args.publication, args.slot, &args.start_lsn)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down after the current message");
            signal.store(true, Ordering::SeqCst);
        }
    });

    let quiet = args.quiet;
    let result = tokio::task::spawn_blocking(move || run(config, quiet, shutdown)).await?;

    match result {
        Ok(()) => {
            info!("replication session completed");
            Ok(())
        }
        Err(err) => {
            error!("replication session failed: {err}");
            Err(err.into())
        }
    }
}

fn run(
    config: ReplicationConfig,
    quiet: bool,
    shutdown: Arc<AtomicBool>,
) -> pgcdc::ReplicationResult<()> {
    let source = SourceDBHandler::connect(&config.dsn)?;
    let database = source.database().to_string();
    let transport = PgReplicationTransport::connect(&config)?;

    let mut store = LogStore::new(quiet);
    let mut session = ReplicationSession::new(
        config,
        transport,
        Box::new(InMemoryMetadataStore::new()),
        Box::new(source),
        database,
    )
    .with_shutdown_signal(shutdown);

    session.run(&mut store)
}
