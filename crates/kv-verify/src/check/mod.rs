//! Cross-store row comparison.
//!
//! Each batch of source rows is checked against the destination with one
//! concurrent point lookup per row. Every row lands in exactly one of three
//! buckets:
//!
//! - **success**: the destination row exists and key, value and ttl match
//! - **fail**: the destination row is missing or a field differs
//! - **error**: the lookup returned an error or timed out
//!
//! A batch produces one [`CheckReport`].

mod batch;

pub use batch::run_batcher;

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CheckConfig;
use crate::error::{Result, VerifyError};
use crate::store::{Key, Row, Store};

/// How ttl values are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TtlPolicy {
    /// Ttls must be identical.
    #[default]
    Strict,
    /// Ttls may drift by up to this many seconds. Absent on one side only
    /// is still a mismatch.
    Tolerance(u64),
}

impl TtlPolicy {
    pub fn matches(&self, source: Option<i64>, destination: Option<i64>) -> bool {
        match (self, source, destination) {
            (_, None, None) => true,
            (TtlPolicy::Strict, Some(a), Some(b)) => a == b,
            (TtlPolicy::Tolerance(secs), Some(a), Some(b)) => {
                (i128::from(a) - i128::from(b)).unsigned_abs() <= u128::from(*secs)
            }
            _ => false,
        }
    }
}

/// Result of checking a single row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
    Error,
}

/// Classify a source row against the result of its destination lookup.
pub fn classify(source: &Row, lookup: &Result<Option<Row>>, policy: TtlPolicy) -> Outcome {
    match lookup {
        Err(_) => Outcome::Error,
        Ok(None) => Outcome::Fail,
        Ok(Some(dest)) => {
            if dest.key == source.key
                && dest.value == source.value
                && policy.matches(source.ttl, dest.ttl)
            {
                Outcome::Success
            } else {
                Outcome::Fail
            }
        }
    }
}

/// Per-batch verification counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub success_count: u64,
    pub fail_count: u64,
    pub error_count: u64,
    /// Keys that failed or errored, in batch order.
    pub failed_keys: Vec<Key>,
}

impl CheckReport {
    /// Rows accounted for by this report.
    pub fn total(&self) -> u64 {
        self.success_count + self.fail_count + self.error_count
    }

    pub fn has_problems(&self) -> bool {
        self.fail_count > 0 || self.error_count > 0
    }

    fn record(&mut self, key: &Key, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success_count += 1,
            Outcome::Fail => {
                self.fail_count += 1;
                self.failed_keys.push(key.clone());
            }
            Outcome::Error => {
                self.error_count += 1;
                self.failed_keys.push(key.clone());
            }
        }
    }
}

/// Lookup behavior for the verifier.
#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub ttl_policy: TtlPolicy,
    pub lookup_timeout: Option<Duration>,
    pub lookup_retries: u32,
    pub retry_delay: Duration,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            ttl_policy: TtlPolicy::Strict,
            lookup_timeout: None,
            lookup_retries: 0,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl From<&CheckConfig> for VerifierSettings {
    fn from(config: &CheckConfig) -> Self {
        Self {
            ttl_policy: config.ttl_policy(),
            lookup_timeout: config.lookup_timeout(),
            lookup_retries: config.lookup_retries,
            retry_delay: config.retry_delay(),
        }
    }
}

/// Compares batches of source rows against the destination store.
pub struct Verifier {
    target: Arc<dyn Store>,
    settings: VerifierSettings,
}

impl Verifier {
    pub fn new(target: Arc<dyn Store>, settings: VerifierSettings) -> Self {
        Self { target, settings }
    }

    /// Check every row of a batch concurrently and summarize.
    pub async fn verify_batch(&self, batch: &[Row]) -> CheckReport {
        let lookups = batch.iter().map(|row| self.lookup(&row.key));
        let results = join_all(lookups).await;

        let mut report = CheckReport::default();
        for (row, result) in batch.iter().zip(results.iter()) {
            if let Err(e) = result {
                debug!("Lookup of {} on {} failed: {}", row.key, self.target.name(), e);
            }
            report.record(&row.key, classify(row, result, self.settings.ttl_policy));
        }
        report
    }

    /// Single lookup with the configured timeout and retry policy.
    async fn lookup(&self, key: &Key) -> Result<Option<Row>> {
        let mut attempt = 0u32;
        loop {
            let result = self.lookup_once(key).await;
            match result {
                Err(e) if attempt < self.settings.lookup_retries => {
                    attempt += 1;
                    // Linear backoff
                    let delay = self.settings.retry_delay * attempt;
                    debug!(
                        "Lookup of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        key,
                        attempt,
                        self.settings.lookup_retries + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn lookup_once(&self, key: &Key) -> Result<Option<Row>> {
        match self.settings.lookup_timeout {
            Some(limit) => tokio::time::timeout(limit, self.target.lookup(key))
                .await
                .map_err(|_| VerifyError::Timeout(limit))?,
            None => self.target.lookup(key).await,
        }
    }
}

/// Start `workers` verifier tasks sharing one batch queue.
///
/// Each worker holds at most one batch at a time. A worker returns the
/// number of batches it verified.
pub fn spawn_verifiers(
    verifier: Arc<Verifier>,
    workers: usize,
    batches: Receiver<Vec<Row>>,
    reports: Sender<CheckReport>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<Result<u64>>> {
    (0..workers)
        .map(|worker_id| {
            let verifier = verifier.clone();
            let batches = batches.clone();
            let reports = reports.clone();
            let cancel = cancel.clone();

            tokio::spawn(async move {
                let mut verified = 0u64;
                loop {
                    let batch = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        batch = batches.recv() => match batch {
                            Ok(batch) => batch,
                            Err(_) => break,
                        },
                    };

                    let report = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        report = verifier.verify_batch(&batch) => report,
                    };

                    let sent = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        res = reports.send(report) => res,
                    };
                    if sent.is_err() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        return Err(VerifyError::PipelineFault(format!(
                            "verifier {}: report queue closed",
                            worker_id
                        )));
                    }
                    verified += 1;
                }

                debug!("Verifier {} finished after {} batches", worker_id, verified);
                Ok(verified)
            })
        })
        .collect()
}
