//! Floe CLI: replay a change event journal into BigQuery.
//!
//! Reads newline-delimited JSON change events from a file (or stdin) and
//! applies them through the consumer. The committed offset lives in a
//! local state file, so a re-run resumes where the last one stopped and
//! redelivered events are absorbed by the replay handling.

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use floe::context::FileContext;
use floe::{BigQueryTarget, ChangeEvent, Config, EventConsumer};

/// Floe - replay-safe CDC replication into BigQuery
#[derive(Parser, Debug)]
#[command(name = "floe")]
#[command(about = "Applies a stream of change events to BigQuery via a GCS staging bucket")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: String,

    /// Path to the event journal; '-' reads from stdin
    #[arg(short, long, default_value = "-")]
    events: String,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = Args::parse();

    info!("Loading config from {}", args.config);
    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.metrics.enabled {
        match config.metrics.address.parse() {
            Ok(addr) => {
                if let Err(e) = floe_core::metrics::init_global(addr) {
                    eprintln!("Failed to start metrics server: {e}");
                    return ExitCode::FAILURE;
                }
            }
            Err(e) => {
                eprintln!("Invalid metrics address '{}': {e}", config.metrics.address);
                return ExitCode::FAILURE;
            }
        }
    }

    let context = match FileContext::open(
        &config.state_path,
        &config.application_name,
        config.source,
        config.max_retry_seconds,
        config.tables(),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to open state file '{}': {e}", config.state_path);
            return ExitCode::FAILURE;
        }
    };

    let target = BigQueryTarget::new(config);
    if let Err(e) = target.initialize(context.as_ref()).await {
        error!(error = %e, "Initialization failed");
        return ExitCode::FAILURE;
    }

    let consumer = match target.create_consumer(context.clone()).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to build the consumer");
            return ExitCode::FAILURE;
        }
    };
    consumer.start();

    let committed_sequence = context.committed_offset().map(|(_, seq)| seq).unwrap_or(0);
    if committed_sequence > 0 {
        info!(committed_sequence, "Skipping events at or below the committed sequence number");
    }

    let result = match replay_events(&args.events, &consumer, committed_sequence).await {
        Ok(applied) => {
            info!(applied, "Event journal drained, flushing remaining batches");
            consumer.flush().await.map(|()| applied)
        }
        Err(e) => Err(e),
    };

    consumer.stop().await;

    match result {
        Ok(applied) => {
            info!(applied, "Replication finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Replication failed");
            ExitCode::FAILURE
        }
    }
}

async fn replay_events(
    path: &str,
    consumer: &EventConsumer,
    committed_sequence: i64,
) -> Result<u64, floe::ReplicationError> {
    let reader: Box<dyn tokio::io::AsyncRead + Unpin> = if path == "-" {
        Box::new(tokio::io::stdin())
    } else {
        match tokio::fs::File::open(path).await {
            Ok(file) => Box::new(file),
            Err(e) => {
                return Err(floe::ReplicationError::Setup {
                    message: format!("Failed to open event journal '{path}': {e}"),
                });
            }
        }
    };
    let mut lines = BufReader::new(reader).lines();
    let mut applied: u64 = 0;

    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| floe::ReplicationError::Setup {
        message: format!("Failed to set up SIGINT handler: {e}"),
    })?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| floe::ReplicationError::Setup {
        message: format!("Failed to set up SIGTERM handler: {e}"),
    })?;

    loop {
        let line = tokio::select! {
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "Shutting down on signal");
                return Ok(applied);
            }
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "Shutting down on signal");
                return Ok(applied);
            }
            line = lines.next_line() => line,
        };

        let Some(line) = line.map_err(|e| floe::ReplicationError::Setup {
            message: format!("Failed to read event journal: {e}"),
        })?
        else {
            return Ok(applied);
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: ChangeEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed event line");
                continue;
            }
        };

        if event.sequence_number() <= committed_sequence {
            continue;
        }

        match event {
            ChangeEvent::Ddl(ddl) => consumer.apply_ddl(ddl).await?,
            ChangeEvent::Dml(dml) => consumer.apply_dml(dml).await?,
        }
        applied += 1;
    }
}
