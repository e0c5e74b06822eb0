//! kv-verify CLI - verify a migrated key-value data set row by row.

use clap::{Parser, Subcommand};
use kv_verify::{CheckSummary, Config, Orchestrator, RunStatus, VerifyError};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Exit code for a completed run that found mismatches.
const EXIT_NOT_CLEAN: u8 = 1;

#[derive(Parser)]
#[command(name = "kv-verify")]
#[command(about = "Verify a key-value migration by scanning the source and checking every row in the destination")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Also append plain-text log lines to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Timeout in seconds for graceful shutdown (default: 60)
    #[arg(long, default_value = "60")]
    shutdown_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full verification
    Run {
        /// Override the number of token ranges
        #[arg(long)]
        token_ranges: Option<usize>,

        /// Override rows per verification batch
        #[arg(long)]
        batch_size: Option<usize>,

        /// Expected number of source keys
        #[arg(long)]
        expected_keys: Option<u64>,
    },

    /// Test database connections
    HealthCheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, VerifyError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format, cli.log_file.as_deref())?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout);

    match cli.command {
        Commands::Run {
            token_ranges,
            batch_size,
            expected_keys,
        } => {
            // Apply overrides
            if let Some(n) = token_ranges {
                config.check.token_ranges = n;
            }
            if let Some(n) = batch_size {
                config.check.batch_size = n;
            }
            if let Some(n) = expected_keys {
                config.check.expected_key_count = Some(n);
            }
            config.validate()?;

            let orchestrator = Orchestrator::new(config).await?;
            let summary =
                run_with_shutdown(&orchestrator, cancel_token, cli.shutdown_timeout).await?;

            if cli.output_json {
                println!("{}", summary.to_json()?);
            } else {
                print_summary(&summary);
            }

            if summary.status == RunStatus::Cancelled {
                return Err(VerifyError::Cancelled);
            }
            if !summary.is_clean() {
                return Ok(ExitCode::from(EXIT_NOT_CLEAN));
            }
        }

        Commands::HealthCheck => {
            let orchestrator = Orchestrator::unconnected(config)?;
            let result = orchestrator.health_check().await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source: {} ({}ms)",
                    if result.source_connected { "OK" } else { "FAILED" },
                    result.source_latency_ms
                );
                if let Some(ref err) = result.source_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "  Destination: {} ({}ms)",
                    if result.destination_connected { "OK" } else { "FAILED" },
                    result.destination_latency_ms
                );
                if let Some(ref err) = result.destination_error {
                    println!("    Error: {}", err);
                }
                println!(
                    "\n  Overall: {}",
                    if result.healthy { "HEALTHY" } else { "UNHEALTHY" }
                );
            }

            if !result.healthy {
                return Err(VerifyError::store("health-check", "one or more stores unreachable"));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Run the verification, giving up `shutdown_timeout` seconds after a
/// shutdown signal if the pipeline has not drained by then.
async fn run_with_shutdown(
    orchestrator: &Orchestrator,
    cancel: CancellationToken,
    shutdown_timeout: u64,
) -> Result<CheckSummary, VerifyError> {
    let grace = cancel.clone();
    let run = orchestrator.run(cancel);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result,
        _ = async {
            grace.cancelled().await;
            tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
        } => {
            eprintln!("Shutdown timeout of {}s exceeded, exiting", shutdown_timeout);
            Err(VerifyError::Cancelled)
        }
    }
}

fn print_summary(summary: &CheckSummary) {
    let status_msg = if summary.is_clean() {
        "Verification passed!"
    } else if summary.status == RunStatus::Cancelled {
        "Verification cancelled."
    } else {
        "Verification found problems."
    };
    println!("\n{}", status_msg);
    println!("  Run ID: {}", summary.run_id);
    println!("  Duration: {:.2}s", summary.duration_seconds);
    println!("  Rows scanned: {}", summary.rows_scanned);
    println!(
        "  Checked: {} ({} success, {} fail, {} error)",
        summary.totals.checked(),
        summary.totals.success,
        summary.totals.fail,
        summary.totals.error
    );
    println!(
        "  Ranges: {}/{} ({} abandoned)",
        summary.ranges_scanned, summary.ranges_total, summary.ranges_failed
    );
    println!("  Throughput: {} rows/sec", summary.rows_per_second);
    if let Some(expected) = summary.expected_key_count {
        println!("  Expected keys: {}", expected);
    }
    for failed in &summary.failed_ranges {
        println!("  Abandoned range {}: {}", failed.range, failed.error);
    }
    if !summary.failed_keys.is_empty() {
        let keys: Vec<String> = summary.failed_keys.iter().map(|k| k.to_string()).collect();
        println!(
            "  Failed keys{}: {}",
            if summary.failed_keys_truncated { " (truncated)" } else { "" },
            keys.join(", ")
        );
    }
}

fn setup_logging(verbosity: &str, format: &str, log_file: Option<&Path>) -> Result<(), VerifyError> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let stdout_layer = if format == "json" {
        fmt::layer().json().with_target(false).boxed()
    } else {
        fmt::layer()
            .with_span_events(FmtSpan::CLOSE)
            .with_target(false)
            .boxed()
    };

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_target(false)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| VerifyError::Config(format!("logging setup failed: {}", e)))
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("Failed to install {} handler: {}", name, e);
                    return;
                }
            };
            stream.recv().await;
            eprintln!(
                "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
                name, shutdown_timeout
            );
            token.cancel();
        });
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Failed to install Ctrl-C handler: {}", e);
            return;
        }
        eprintln!(
            "\nReceived Ctrl-C. Shutting down gracefully (timeout: {}s)...",
            shutdown_timeout
        );
        token.cancel();
    });

    cancel_token
}
