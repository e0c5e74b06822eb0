//! # kv-verify
//!
//! Post-migration verification for ring-sharded key-value stores.
//!
//! Every row of the source store is scanned, range by range, and looked up
//! in the destination to confirm key, value and ttl match:
//!
//! - **Range partitioning** of the 64-bit token ring, covering it exactly once
//! - **Parallel paged scans** of the source with bounded backpressure
//! - **Batched concurrent lookups** against the destination
//! - **Aggregated counts** with mismatched keys logged for remediation
//!
//! ## Example
//!
//! ```rust,no_run
//! use kv_verify::{Config, Orchestrator};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> kv_verify::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config).await?;
//!     let summary = orchestrator.run(CancellationToken::new()).await?;
//!     println!("{} rows checked, clean: {}", summary.totals.checked(), summary.is_clean());
//!     Ok(())
//! }
//! ```

pub mod check;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod ring;
pub mod scan;
pub mod store;

// Re-exports for convenient access
pub use check::{CheckReport, TtlPolicy, Verifier, VerifierSettings};
pub use config::{CheckConfig, Config, StoreConfig};
pub use error::{Result, VerifyError};
pub use orchestrator::{CheckSummary, HealthCheckResult, Orchestrator, RunStatus};
pub use report::{RunningTotals, Totals};
pub use ring::{RangePartitioner, TokenDomain, TokenRange};
pub use scan::{FailedRange, ScanProgress, SourceScanner};
pub use store::{Key, MemoryStore, PgStore, Row, Store, Value};
