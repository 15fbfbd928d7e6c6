//! changestream-applier CLI - offline change stream translation for reverse replication.

use changestream_applier::failsafe::{FailsafeElement, SystemClock, ThrottledLogger};
use changestream_applier::sink::{InMemoryRowStore, MemorySink};
use changestream_applier::state::CheckpointState;
use changestream_applier::{
    failsafe_channels, ApplierStats, CatalogHandle, Config, FailureRouter, PartitionApplier,
    RangeTracker, ReplicateError, SchemaCatalog, Timestamp, TimestampRange, WriteTranslator,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Payloads buffered between the event file reader and the applier.
const EVENT_BUFFER: usize = 1024;

#[derive(Parser)]
#[command(name = "changestream-applier")]
#[command(about = "Translate change stream events into MySQL writes")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to checkpoint file for resume capability
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a file of change events through one partition
    Translate {
        /// JSON-lines file with one change event per line
        #[arg(long)]
        events: PathBuf,

        /// Partition token used for checkpointing
        #[arg(long, default_value = "default")]
        partition: String,

        /// Inclusive start of the partition's commit time range (RFC 3339)
        #[arg(long, default_value = "1970-01-01T00:00:00Z")]
        start: Timestamp,

        /// Exclusive end of the partition's commit time range (RFC 3339)
        #[arg(long)]
        end: Option<Timestamp>,

        /// JSON file with row versions served to full-row point reads
        #[arg(long)]
        rows: Option<PathBuf>,

        /// Write dead-lettered events to this JSON-lines file
        #[arg(long)]
        dead_letter: Option<PathBuf>,

        /// Write events with failed writes to this JSON-lines file
        #[arg(long)]
        retry: Option<PathBuf>,
    },

    /// Load and validate the schema catalog
    CheckCatalog,

    /// Compute where a partition range would be split
    Split {
        /// Inclusive start of the range (RFC 3339)
        #[arg(long)]
        start: Timestamp,

        /// Exclusive end of the range (RFC 3339)
        #[arg(long)]
        end: Timestamp,

        /// Last claimed commit timestamp (RFC 3339)
        #[arg(long)]
        claimed: Option<Timestamp>,

        /// Share of the remaining work kept by the primary range
        #[arg(long, default_value = "0.5")]
        fraction: f64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ReplicateError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)
        .map_err(|e| ReplicateError::Config(e.to_string()))?;

    // Split is pure range arithmetic and needs no configuration.
    if let Commands::Split {
        start,
        end,
        claimed,
        fraction,
    } = cli.command
    {
        return split(start, end, claimed, fraction, cli.output_json);
    }

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Split { .. } => unreachable!(), // Handled above
        Commands::CheckCatalog => check_catalog(&config, cli.output_json),
        Commands::Translate {
            events,
            partition,
            start,
            end,
            rows,
            dead_letter,
            retry,
        } => {
            let cancel_token = setup_signal_handler().await?;
            let args = TranslateArgs {
                events,
                partition,
                start,
                end,
                rows,
                dead_letter,
                retry,
            };
            translate(config, args, cli.state_file, cli.output_json, cancel_token).await
        }
    }
}

struct TranslateArgs {
    events: PathBuf,
    partition: String,
    start: Timestamp,
    end: Option<Timestamp>,
    rows: Option<PathBuf>,
    dead_letter: Option<PathBuf>,
    retry: Option<PathBuf>,
}

async fn translate(
    config: Config,
    args: TranslateArgs,
    state_file: Option<PathBuf>,
    output_json: bool,
    cancel_token: CancellationToken,
) -> Result<(), ReplicateError> {
    let catalog = SchemaCatalog::load(&config.catalog.path)?;
    info!(
        "Loaded {} table mappings from {:?}",
        catalog.len(),
        config.catalog.path
    );

    let mut translator =
        WriteTranslator::new(config.coercer()).with_retry_policy(config.translation.read_retry.policy());
    if let Some(path) = &args.rows {
        let store = InMemoryRowStore::load(path).await?;
        translator = translator.with_point_reader(Arc::new(store));
    }

    let config_hash = config.hash();
    let mut state = match &state_file {
        Some(path) if path.exists() => {
            let state = CheckpointState::load(path)?;
            state.validate_config(&config_hash)?;
            info!("Resuming run {} from {:?}", state.run_id, path);
            state
        }
        _ => CheckpointState::new(config_hash),
    };

    let policy = config.partition.claim_policy;
    let tracker = match state.tracker_for(&args.partition, policy)? {
        Some(tracker) => {
            info!(
                "Partition {} resumes in {} after {:?}",
                args.partition,
                tracker.range(),
                tracker.last_claimed().map(|t| t.to_string())
            );
            tracker
        }
        None => {
            let range = match args.end {
                Some(end) => TimestampRange::new(args.start, end)?,
                None => TimestampRange::unbounded_from(args.start),
            };
            RangeTracker::new(range, policy)
        }
    };

    let (senders, mut receivers) = failsafe_channels();
    let router = FailureRouter::with_logger(
        senders,
        ThrottledLogger::new(SystemClock, config.failsafe.log_interval()),
    );
    let sink = Arc::new(MemorySink::new());
    let mut applier = PartitionApplier::new(
        args.partition.clone(),
        tracker,
        CatalogHandle::new(catalog),
        translator,
        sink.clone(),
        router,
    );

    let content = std::fs::read_to_string(&args.events)?;
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let feeder = tokio::spawn(async move {
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if tx.send(line.to_string()).await.is_err() {
                break;
            }
        }
    });

    let result = tokio::select! {
        result = applier.run(rx) => Some(result),
        _ = cancel_token.cancelled() => None,
    };
    feeder.abort();

    state.record(&args.partition, applier.checkpoint());
    let outcome = match result {
        Some(Ok(stats)) => {
            state.mark_completed();
            Ok(stats)
        }
        Some(Err(e)) => {
            state.mark_failed();
            Err(e)
        }
        None => {
            warn!("Cancelled; saving progress for partition {}", args.partition);
            state.mark_cancelled();
            Err(ReplicateError::Cancelled)
        }
    };
    if let Some(path) = &state_file {
        state.save(path)?;
        info!("Checkpoint saved to {:?}", path);
    }

    let dead_lettered = drain(&mut receivers.dead_letter, args.dead_letter.as_deref())?;
    let retried = drain(&mut receivers.retry, args.retry.as_deref())?;
    let stats = outcome?;

    let statements = sink.statements().await;
    let progress = applier.progress_handle();
    if output_json {
        let result = serde_json::json!({
            "run_id": state.run_id,
            "partition": args.partition,
            "statements": statements.iter().map(|s| s.sql.as_str()).collect::<Vec<_>>(),
            "stats": stats,
            "last_claimed": progress.last_claimed().map(|t| t.to_string()),
            "done": progress.is_done(),
            "dead_letter_written": dead_lettered,
            "retry_written": retried,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for statement in &statements {
            println!("{};", statement);
        }
        print_summary(&state.run_id, &args.partition, &stats, progress.is_done());
    }

    Ok(())
}

fn print_summary(run_id: &str, partition: &str, stats: &ApplierStats, done: bool) {
    eprintln!("\nTranslation completed!");
    eprintln!("  Run ID: {}", run_id);
    eprintln!("  Partition: {}{}", partition, if done { " (done)" } else { "" });
    eprintln!("  Applied: {}", stats.applied);
    eprintln!("  Skipped: {}", stats.skipped);
    eprintln!("  Dropped: {}", stats.dropped);
    eprintln!("  Dead-lettered: {}", stats.dead_lettered);
    eprintln!("  Retried: {}", stats.retried);
}

/// Move everything queued on a failure channel into a JSON-lines file.
/// Without a file the elements are only counted.
fn drain(
    receiver: &mut UnboundedReceiver<FailsafeElement>,
    path: Option<&Path>,
) -> Result<usize, ReplicateError> {
    let mut file = match path {
        Some(path) => Some(std::io::BufWriter::new(std::fs::File::create(path)?)),
        None => None,
    };
    let mut count = 0;
    while let Ok(element) = receiver.try_recv() {
        if let Some(file) = file.as_mut() {
            writeln!(file, "{}", serde_json::to_string(&element)?)?;
        }
        count += 1;
    }
    if let Some(mut file) = file {
        file.flush()?;
    }
    Ok(count)
}

fn check_catalog(config: &Config, output_json: bool) -> Result<(), ReplicateError> {
    let catalog = SchemaCatalog::load(&config.catalog.path)?;
    let tables = catalog.tables();

    if output_json {
        let listing: Vec<_> = tables
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id(),
                    "change_stream_table": t.target_table(),
                    "mysql_table": t.source_table(),
                    "primary_keys": t.primary_keys(),
                    "columns": t.source_columns().count(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        println!("Catalog OK: {} tables", tables.len());
        for table in &tables {
            let keys: Vec<&str> = table.primary_keys().iter().map(|k| k.as_str()).collect();
            println!(
                "  {} -> {} ({} columns, keys: [{}])",
                table.target_table(),
                table.source_table(),
                table.source_columns().count(),
                keys.join(", ")
            );
        }
    }
    Ok(())
}

fn split(
    start: Timestamp,
    end: Timestamp,
    claimed: Option<Timestamp>,
    fraction: f64,
    output_json: bool,
) -> Result<(), ReplicateError> {
    let range = TimestampRange::new(start, end)?;
    let mut tracker = RangeTracker::resume(range, claimed, Default::default())?;
    let split = tracker.try_split(fraction);

    if output_json {
        let result = match split {
            Some((primary, residual)) => serde_json::json!({
                "primary": primary,
                "residual": residual,
            }),
            None => serde_json::json!({ "primary": range, "residual": null }),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        match split {
            Some((primary, residual)) => {
                println!("Primary:  {}", primary);
                println!("Residual: {}", residual);
            }
            None => println!("No split point in {}", range),
        }
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    // RUST_LOG wins over --verbosity when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr; stdout carries statements and results.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, ReplicateError> {
    let cancel_token = CancellationToken::new();

    let token_int = cancel_token.clone();
    let token_term = cancel_token.clone();

    tokio::spawn(async move {
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT handler");
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Saving checkpoint and shutting down...");
        token_int.cancel();
    });

    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Saving checkpoint and shutting down...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, ReplicateError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to setup Ctrl-C handler");
        eprintln!("\nReceived Ctrl-C. Saving checkpoint and shutting down...");
        token.cancel();
    });

    Ok(cancel_token)
}
