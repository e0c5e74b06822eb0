//! Result aggregation and status reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_channel::Receiver;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::check::CheckReport;
use crate::scan::ScanProgress;
use crate::store::Key;

/// Run-wide success/fail/error counters.
///
/// Counts only ever increase.
#[derive(Debug, Default)]
pub struct RunningTotals {
    success: AtomicU64,
    fail: AtomicU64,
    error: AtomicU64,
}

impl RunningTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch report into the totals.
    pub fn add(&self, report: &CheckReport) {
        self.success
            .fetch_add(report.success_count, Ordering::Relaxed);
        self.fail.fetch_add(report.fail_count, Ordering::Relaxed);
        self.error.fetch_add(report.error_count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Totals {
        Totals {
            success: self.success.load(Ordering::Relaxed),
            fail: self.fail.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RunningTotals`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub success: u64,
    pub fail: u64,
    pub error: u64,
}

impl Totals {
    /// Rows checked against the destination.
    pub fn checked(&self) -> u64 {
        self.success + self.fail + self.error
    }
}

/// What the aggregator hands back once the report queue closes.
#[derive(Debug, Clone, Default)]
pub struct AggregateResult {
    pub totals: Totals,
    /// Failed and errored keys, up to the configured limit.
    pub failed_keys: Vec<Key>,
    /// More keys failed than were kept.
    pub failed_keys_truncated: bool,
}

/// Consumes batch reports until the report queue closes.
pub struct ReportAggregator {
    totals: Arc<RunningTotals>,
    progress: Arc<ScanProgress>,
    status_interval: Duration,
    max_failed_keys: usize,
}

impl ReportAggregator {
    pub fn new(
        totals: Arc<RunningTotals>,
        progress: Arc<ScanProgress>,
        status_interval: Duration,
    ) -> Self {
        Self {
            totals,
            progress,
            status_interval,
            max_failed_keys: 0,
        }
    }

    /// Keep up to `limit` failed keys for the final result.
    pub fn with_max_failed_keys(mut self, limit: usize) -> Self {
        self.max_failed_keys = limit;
        self
    }

    /// Drain `reports`, logging problems as they arrive and a status line on
    /// every tick. Returns once every sender has gone.
    pub async fn run(self, reports: Receiver<CheckReport>) -> AggregateResult {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.status_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        ticker.tick().await;

        let mut reports_seen = 0u64;
        let mut failed_keys = Vec::new();
        let mut failed_keys_truncated = false;
        loop {
            tokio::select! {
                report = reports.recv() => match report {
                    Ok(report) => {
                        reports_seen += 1;
                        self.record(&report);
                        let room = self.max_failed_keys.saturating_sub(failed_keys.len());
                        if report.failed_keys.len() > room {
                            failed_keys_truncated = true;
                        }
                        failed_keys.extend(report.failed_keys.into_iter().take(room));
                    }
                    Err(_) => break,
                },
                _ = ticker.tick() => self.log_status(started),
            }
        }

        let totals = self.totals.snapshot();
        info!(
            "Verification finished in {:.1}s: {} rows scanned, {} checked ({} success, {} fail, {} error) from {} batches, {} ranges abandoned",
            started.elapsed().as_secs_f64(),
            self.progress.rows_scanned(),
            totals.checked(),
            totals.success,
            totals.fail,
            totals.error,
            reports_seen,
            self.progress.ranges_failed()
        );
        AggregateResult {
            totals,
            failed_keys,
            failed_keys_truncated,
        }
    }

    fn record(&self, report: &CheckReport) {
        if report.has_problems() {
            let keys: Vec<String> = report.failed_keys.iter().map(|k| k.to_string()).collect();
            warn!(
                "Batch had {} failed and {} errored rows: {}",
                report.fail_count,
                report.error_count,
                keys.join(", ")
            );
        }
        self.totals.add(report);
    }

    fn log_status(&self, started: Instant) {
        let totals = self.totals.snapshot();
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            (totals.checked() as f64 / elapsed) as u64
        } else {
            0
        };
        info!(
            "Status: {} rows scanned, {} checked ({} success, {} fail, {} error), {} ranges done, {} abandoned, {} rows/s",
            self.progress.rows_scanned(),
            totals.checked(),
            totals.success,
            totals.fail,
            totals.error,
            self.progress.ranges_scanned(),
            self.progress.ranges_failed(),
            rate
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(success: u64, fail: u64, error: u64) -> CheckReport {
        CheckReport {
            success_count: success,
            fail_count: fail,
            error_count: error,
            failed_keys: (0..fail + error).map(|i| Key::from(format!("bad-{}", i))).collect(),
        }
    }

    #[test]
    fn test_totals_accumulate() {
        let totals = RunningTotals::new();
        totals.add(&report(10, 1, 0));
        totals.add(&report(5, 0, 2));
        assert_eq!(
            totals.snapshot(),
            Totals {
                success: 15,
                fail: 1,
                error: 2
            }
        );
        assert_eq!(totals.snapshot().checked(), 18);
    }

    #[tokio::test]
    async fn test_aggregation_with_concurrent_producers() {
        let totals = Arc::new(RunningTotals::new());
        let aggregator = ReportAggregator::new(
            totals.clone(),
            Arc::new(ScanProgress::new()),
            Duration::from_secs(30),
        )
        .with_max_failed_keys(10);
        let (tx, rx) = async_channel::bounded(8);
        let consumer = tokio::spawn(aggregator.run(rx));

        let producers: Vec<_> = (0..8u64)
            .map(|p| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    for i in 0..50u64 {
                        tx.send(report(p + i, i % 2, p % 3)).await.unwrap();
                    }
                })
            })
            .collect();
        drop(tx);
        for p in producers {
            p.await.unwrap();
        }

        let mut expected = Totals::default();
        for p in 0..8u64 {
            for i in 0..50u64 {
                expected.success += p + i;
                expected.fail += i % 2;
                expected.error += p % 3;
            }
        }

        let result = consumer.await.unwrap();
        assert_eq!(result.totals, expected);
        assert_eq!(totals.snapshot(), expected);
        assert_eq!(result.failed_keys.len(), 10);
        assert!(result.failed_keys_truncated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_ticks_do_not_consume_reports() {
        let totals = Arc::new(RunningTotals::new());
        let aggregator = ReportAggregator::new(
            totals.clone(),
            Arc::new(ScanProgress::new()),
            Duration::from_millis(10),
        );
        let (tx, rx) = async_channel::bounded(1);
        let consumer = tokio::spawn(aggregator.run(rx));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            tx.send(report(1, 0, 0)).await.unwrap();
        }
        drop(tx);

        let result = consumer.await.unwrap();
        assert_eq!(result.totals.success, 3);
        assert!(result.failed_keys.is_empty());
        assert!(!result.failed_keys_truncated);
    }
}
