//! Batching boundary between the scanner and the verifier.

use async_channel::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, VerifyError};
use crate::store::Row;

/// Groups scanned rows into fixed-size batches.
///
/// Runs until the row queue closes, then flushes the partial batch and drops
/// its sender so the verifier pool sees the batch queue close.
pub async fn run_batcher(
    rows: Receiver<Row>,
    batches: Sender<Vec<Row>>,
    batch_size: usize,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut current = Vec::with_capacity(batch_size);
    let mut sent = 0u64;

    while let Ok(row) = rows.recv().await {
        current.push(row);
        if current.len() == batch_size {
            let full = std::mem::replace(&mut current, Vec::with_capacity(batch_size));
            if !forward(&batches, full, &cancel).await? {
                return Ok(sent);
            }
            sent += 1;
        }
    }

    if !current.is_empty() && !cancel.is_cancelled() {
        debug!("Flushing final partial batch of {} rows", current.len());
        if forward(&batches, current, &cancel).await? {
            sent += 1;
        }
    }

    debug!("Batcher finished after {} batches", sent);
    Ok(sent)
}

/// Send a batch, racing cancellation. Returns false if cancelled.
async fn forward(
    batches: &Sender<Vec<Row>>,
    batch: Vec<Row>,
    cancel: &CancellationToken,
) -> Result<bool> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(false),
        res = batches.send(batch) => match res {
            Ok(()) => Ok(true),
            Err(_) if cancel.is_cancelled() => Ok(false),
            Err(_) => Err(VerifyError::PipelineFault(
                "batch queue closed while rows were still flowing".into(),
            )),
        },
    }
}
