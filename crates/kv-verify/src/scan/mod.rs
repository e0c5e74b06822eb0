//! Source range scanning.
//!
//! A pool of scanner workers shares one bounded range queue. Each worker
//! pages through its range against the source store and pushes every row
//! into the bounded row queue, so a slow verifier stalls the scan instead
//! of growing memory.
//!
//! A scan error abandons the rest of that range. The range is logged,
//! counted and handed back to the caller; the run carries on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, VerifyError};
use crate::ring::{RangePartitioner, TokenRange};
use crate::store::{Row, Store};

/// Shared scan counters.
#[derive(Debug, Default)]
pub struct ScanProgress {
    rows_scanned: AtomicU64,
    ranges_scanned: AtomicU64,
    ranges_failed: AtomicU64,
}

impl ScanProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows handed to the row queue so far.
    pub fn rows_scanned(&self) -> u64 {
        self.rows_scanned.load(Ordering::Relaxed)
    }

    /// Ranges scanned to completion.
    pub fn ranges_scanned(&self) -> u64 {
        self.ranges_scanned.load(Ordering::Relaxed)
    }

    /// Ranges abandoned after a scan error.
    pub fn ranges_failed(&self) -> u64 {
        self.ranges_failed.load(Ordering::Relaxed)
    }
}

/// A range whose scan was abandoned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRange {
    pub range: TokenRange,
    /// Rows of this range already forwarded before the failure.
    pub rows_before_failure: u64,
    pub error: String,
}

/// How a single range scan ended.
#[derive(Debug)]
pub enum RangeOutcome {
    Completed { rows: u64 },
    Failed(FailedRange),
    Cancelled,
}

/// Pages through token ranges of the source store.
pub struct SourceScanner {
    source: Arc<dyn Store>,
    page_size: usize,
    progress: Arc<ScanProgress>,
}

impl SourceScanner {
    pub fn new(source: Arc<dyn Store>, page_size: usize, progress: Arc<ScanProgress>) -> Self {
        Self {
            source,
            page_size,
            progress,
        }
    }

    pub fn progress(&self) -> &Arc<ScanProgress> {
        &self.progress
    }

    /// Scan one range to completion, forwarding every row.
    ///
    /// Store errors are reported through [`RangeOutcome::Failed`]. The only
    /// error returned is a pipeline fault: the row queue closing while the
    /// run is not cancelled.
    pub async fn scan_range(
        &self,
        range: TokenRange,
        rows: &Sender<Row>,
        cancel: &CancellationToken,
    ) -> Result<RangeOutcome> {
        let mut paging = None;
        let mut forwarded = 0u64;

        loop {
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(RangeOutcome::Cancelled),
                page = self.source.scan_page(&range, self.page_size, paging.take()) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        "Abandoning range {} on {} after {} rows: {}",
                        range,
                        self.source.name(),
                        forwarded,
                        e
                    );
                    self.progress.ranges_failed.fetch_add(1, Ordering::Relaxed);
                    return Ok(RangeOutcome::Failed(FailedRange {
                        range,
                        rows_before_failure: forwarded,
                        error: e.to_string(),
                    }));
                }
            };

            for row in page.rows {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(RangeOutcome::Cancelled),
                    res = rows.send(row) => res,
                };
                if sent.is_err() {
                    if cancel.is_cancelled() {
                        return Ok(RangeOutcome::Cancelled);
                    }
                    return Err(VerifyError::PipelineFault(format!(
                        "row queue closed while scanning range {}",
                        range
                    )));
                }
                forwarded += 1;
                self.progress.rows_scanned.fetch_add(1, Ordering::Relaxed);
            }

            match page.next {
                Some(next) => paging = Some(next),
                None => break,
            }
        }

        self.progress.ranges_scanned.fetch_add(1, Ordering::Relaxed);
        debug!("Range {} complete: {} rows", range, forwarded);
        Ok(RangeOutcome::Completed { rows: forwarded })
    }
}

/// Feed every range of the partition into the range queue.
///
/// Returns the number of ranges queued. Dropping the sender at the end
/// closes the queue for the scanner workers.
pub fn spawn_range_feeder(
    partitioner: RangePartitioner,
    ranges: Sender<TokenRange>,
    cancel: CancellationToken,
) -> JoinHandle<Result<u64>> {
    tokio::spawn(async move {
        let mut queued = 0u64;
        for range in &partitioner {
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = ranges.send(range) => res,
            };
            if sent.is_err() {
                if cancel.is_cancelled() {
                    break;
                }
                return Err(VerifyError::PipelineFault(
                    "range queue closed before all ranges were queued".into(),
                ));
            }
            queued += 1;
        }
        debug!("Range feeder queued {} ranges", queued);
        Ok(queued)
    })
}

/// Start `workers` scanner tasks sharing one range queue.
///
/// Each worker returns the ranges it had to abandon.
pub fn spawn_scanners(
    scanner: Arc<SourceScanner>,
    workers: usize,
    ranges: Receiver<TokenRange>,
    rows: Sender<Row>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<Result<Vec<FailedRange>>>> {
    (0..workers)
        .map(|worker_id| {
            let scanner = scanner.clone();
            let ranges = ranges.clone();
            let rows = rows.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let mut failed = Vec::new();
                let mut completed = 0u64;
                loop {
                    let range = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        range = ranges.recv() => match range {
                            Ok(range) => range,
                            Err(_) => break,
                        },
                    };

                    match scanner.scan_range(range, &rows, &cancel).await? {
                        RangeOutcome::Completed { .. } => completed += 1,
                        RangeOutcome::Failed(f) => failed.push(f),
                        RangeOutcome::Cancelled => break,
                    }
                }

                debug!(
                    "Scanner {} finished: {} ranges complete, {} abandoned",
                    worker_id,
                    completed,
                    failed.len()
                );
                Ok(failed)
            })
        })
        .collect()
}
