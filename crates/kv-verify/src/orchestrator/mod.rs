//! Verification orchestrator - wires the pipeline stages together.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::check::{run_batcher, spawn_verifiers, Verifier, VerifierSettings};
use crate::config::{CheckConfig, Config};
use crate::error::{Result, VerifyError};
use crate::report::{ReportAggregator, RunningTotals, Totals};
use crate::ring::RangePartitioner;
use crate::scan::{spawn_range_feeder, spawn_scanners, FailedRange, ScanProgress, SourceScanner};
use crate::store::{Key, PgStore, Store};

/// Verification orchestrator.
pub struct Orchestrator {
    source: Arc<dyn Store>,
    destination: Arc<dyn Store>,
    check: CheckConfig,
    progress: Option<Arc<ScanProgress>>,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => f.write_str("completed"),
            RunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of a verification run.
#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status.
    pub status: RunStatus,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Success/fail/error counts.
    pub totals: Totals,

    /// Rows read from the source.
    pub rows_scanned: u64,

    /// Average check throughput (rows/second).
    pub rows_per_second: u64,

    /// Ranges the domain was split into.
    pub ranges_total: u64,

    /// Ranges scanned to completion.
    pub ranges_scanned: u64,

    /// Ranges abandoned after a scan error.
    pub ranges_failed: u64,

    /// The abandoned ranges, in token order.
    pub failed_ranges: Vec<FailedRange>,

    /// Keys that failed or errored, capped at `max_failed_keys`.
    pub failed_keys: Vec<Key>,

    /// More keys failed than `failed_keys` holds.
    pub failed_keys_truncated: bool,

    /// Number of source keys the operator expects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_key_count: Option<u64>,
}

impl CheckSummary {
    /// A run is clean when it completed, every row matched, no range was
    /// abandoned and the scanned row count meets any expected key count.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed
            && self.totals.fail == 0
            && self.totals.error == 0
            && self.ranges_failed == 0
            && self
                .expected_key_count
                .map_or(true, |expected| expected == self.rows_scanned)
    }

    /// Serialize the summary as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Connectivity of both stores.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_error: Option<String>,
    pub destination_connected: bool,
    pub destination_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_error: Option<String>,
    pub healthy: bool,
}

impl Orchestrator {
    /// Connect both PostgreSQL stores described by `config`.
    pub async fn new(config: Config) -> Result<Self> {
        let source = PgStore::connect("source", &config.source).await?;
        let destination = PgStore::connect("destination", &config.destination).await?;
        Ok(Self {
            source: Arc::new(source),
            destination: Arc::new(destination),
            check: config.check,
            progress: None,
        })
    }

    /// Build both PostgreSQL pools without probing them, so that
    /// [`Orchestrator::health_check`] can report each store on its own.
    pub fn unconnected(config: Config) -> Result<Self> {
        Ok(Self {
            source: Arc::new(PgStore::new("source", &config.source)?),
            destination: Arc::new(PgStore::new("destination", &config.destination)?),
            check: config.check,
            progress: None,
        })
    }

    /// Build an orchestrator over already-connected stores.
    pub fn with_stores(
        source: Arc<dyn Store>,
        destination: Arc<dyn Store>,
        check: CheckConfig,
    ) -> Self {
        Self {
            source,
            destination,
            check,
            progress: None,
        }
    }

    /// Report scan counters into `progress` so they can be read while a
    /// run is in flight. Counters accumulate across runs.
    pub fn with_progress(mut self, progress: Arc<ScanProgress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Ping both stores.
    pub async fn health_check(&self) -> Result<HealthCheckResult> {
        let (source_ok, source_latency_ms, source_error) = probe(self.source.as_ref()).await;
        let (dest_ok, destination_latency_ms, destination_error) =
            probe(self.destination.as_ref()).await;

        Ok(HealthCheckResult {
            source_connected: source_ok,
            source_latency_ms,
            source_error,
            destination_connected: dest_ok,
            destination_latency_ms,
            destination_error,
            healthy: source_ok && dest_ok,
        })
    }

    /// Run a full verification.
    ///
    /// Cancelling `cancel` stops every stage and yields a summary with
    /// [`RunStatus::Cancelled`]. A pipeline fault in any stage aborts the
    /// run with an error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<CheckSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        let check = &self.check;

        check.validate()?;
        let domain = check.domain()?;
        let partitioner = RangePartitioner::new(domain, check.token_ranges)?;
        let ranges_total = partitioner.len() as u64;

        info!(
            "Run {}: verifying {} -> {} over [{},{}] in {} ranges (batch {}, {} scanners, {} verifiers)",
            run_id,
            self.source.name(),
            self.destination.name(),
            domain.min,
            domain.max,
            ranges_total,
            check.batch_size,
            check.origin_read_parallelism,
            check.target_read_parallelism
        );

        // Stops every stage on a fault without touching the caller's token.
        let pipeline = cancel.child_token();

        let (range_tx, range_rx) = async_channel::bounded(check.origin_read_parallelism);
        let (row_tx, row_rx) = async_channel::bounded(check.row_queue_capacity());
        let (batch_tx, batch_rx) = async_channel::bounded(check.target_read_parallelism);
        let (report_tx, report_rx) = async_channel::bounded(check.report_queue_capacity());

        let progress = self
            .progress
            .clone()
            .unwrap_or_else(|| Arc::new(ScanProgress::new()));
        let totals = Arc::new(RunningTotals::new());

        // Stages are started downstream first.
        let aggregator = tokio::spawn(
            ReportAggregator::new(totals.clone(), progress.clone(), check.status_interval())
                .with_max_failed_keys(check.max_failed_keys)
                .run(report_rx),
        );

        let verifier = Arc::new(Verifier::new(
            self.destination.clone(),
            VerifierSettings::from(check),
        ));
        let verifiers = spawn_verifiers(
            verifier,
            check.target_read_parallelism,
            batch_rx,
            report_tx,
            pipeline.clone(),
        );

        let batcher = tokio::spawn(run_batcher(
            row_rx,
            batch_tx,
            check.batch_size,
            pipeline.clone(),
        ));

        let scanner = Arc::new(SourceScanner::new(
            self.source.clone(),
            check.page_size,
            progress.clone(),
        ));
        let scanners = spawn_scanners(
            scanner,
            check.origin_read_parallelism,
            range_rx,
            row_tx,
            pipeline.clone(),
        );

        let feeder = spawn_range_feeder(partitioner, range_tx, pipeline.clone());

        let (_, scanner_results, _, _) = tokio::try_join!(
            watch_stage("range feeder", feeder, &pipeline),
            watch_stages("scanner", scanners, &pipeline),
            watch_stage("batcher", batcher, &pipeline),
            watch_stages("verifier", verifiers, &pipeline),
        )?;

        let aggregate = aggregator.await.map_err(|e| {
            VerifyError::PipelineFault(format!("report aggregator task failed: {}", e))
        })?;
        let totals = aggregate.totals;

        let mut failed_ranges: Vec<FailedRange> = scanner_results.into_iter().flatten().collect();
        failed_ranges.sort_by_key(|f| f.range.start);

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let completed_at = Utc::now();
        let duration_seconds = started.elapsed().as_secs_f64();
        let rows_per_second = if duration_seconds > 0.0 {
            (totals.checked() as f64 / duration_seconds) as u64
        } else {
            0
        };

        let summary = CheckSummary {
            run_id,
            status,
            started_at,
            completed_at,
            duration_seconds,
            totals,
            rows_scanned: progress.rows_scanned(),
            rows_per_second,
            ranges_total,
            ranges_scanned: progress.ranges_scanned(),
            ranges_failed: progress.ranges_failed(),
            failed_ranges,
            failed_keys: aggregate.failed_keys,
            failed_keys_truncated: aggregate.failed_keys_truncated,
            expected_key_count: check.expected_key_count,
        };

        info!(
            "Run {} {}: {} success, {} fail, {} error, {}/{} ranges scanned in {:.1}s ({})",
            summary.run_id,
            summary.status,
            summary.totals.success,
            summary.totals.fail,
            summary.totals.error,
            summary.ranges_scanned,
            summary.ranges_total,
            summary.duration_seconds,
            if summary.is_clean() { "clean" } else { "NOT clean" }
        );

        Ok(summary)
    }
}

async fn probe(store: &dyn Store) -> (bool, u64, Option<String>) {
    let start = Instant::now();
    let result = store.health_check().await;
    let latency = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => (true, latency, None),
        Err(e) => (false, latency, Some(e.to_string())),
    }
}

/// Await a stage task, cancelling the rest of the pipeline if it fails.
async fn watch_stage<T>(
    stage: &str,
    handle: JoinHandle<Result<T>>,
    pipeline: &CancellationToken,
) -> Result<T> {
    let result = match handle.await {
        Ok(result) => result,
        Err(e) => Err(VerifyError::PipelineFault(format!(
            "{} task failed: {}",
            stage, e
        ))),
    };
    if let Err(ref e) = result {
        error!("{} stage failed: {}", stage, e);
        pipeline.cancel();
    }
    result
}

async fn watch_stages<T>(
    stage: &str,
    handles: Vec<JoinHandle<Result<T>>>,
    pipeline: &CancellationToken,
) -> Result<Vec<T>> {
    try_join_all(
        handles
            .into_iter()
            .map(|handle| watch_stage(stage, handle, pipeline)),
    )
    .await
}
