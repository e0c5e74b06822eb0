//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::check::TtlPolicy;
use crate::error::Result;
use crate::ring::TokenDomain;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Store the data was migrated from.
    pub source: StoreConfig,

    /// Store the data was migrated to.
    pub destination: StoreConfig,

    /// Pipeline tuning.
    #[serde(default)]
    pub check: CheckConfig,
}

/// Connection and table layout for one side of the comparison.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Schema holding the key-value table (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Key-value table name (default: "keyvalue").
    #[serde(default = "default_table")]
    pub table: String,

    /// Key column (default: "key").
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Value column (default: "value").
    #[serde(default = "default_value_column")]
    pub value_column: String,

    /// TTL column in seconds. Rows carry no TTL when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_column: Option<String>,

    /// SSL mode (default: "require").
    #[serde(default = "default_require")]
    pub ssl_mode: String,

    /// PEM bundle of trusted CAs for verify-ca / verify-full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_root_cert: Option<String>,

    /// Pool size (default: 32).
    #[serde(default = "default_connections")]
    pub max_connections: usize,
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("key_column", &self.key_column)
            .field("value_column", &self.value_column)
            .field("ttl_column", &self.ttl_column)
            .field("ssl_mode", &self.ssl_mode)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Pipeline sizing and comparison policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Number of token ranges the ring is split into.
    #[serde(default = "default_token_ranges")]
    pub token_ranges: usize,

    /// Rows per verification batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Ranges scanned concurrently against the source.
    #[serde(default = "default_origin_parallelism")]
    pub origin_read_parallelism: usize,

    /// Batches verified concurrently against the destination.
    #[serde(default = "default_target_parallelism")]
    pub target_read_parallelism: usize,

    /// Rows per source scan page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Seconds between status lines.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,

    /// Per-lookup timeout. Unbounded when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_timeout_ms: Option<u64>,

    /// Extra attempts for an erroring lookup (default: 0, no retry).
    #[serde(default)]
    pub lookup_retries: u32,

    /// Base delay between lookup retries, multiplied by the attempt number.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Allowed TTL drift in seconds. Strict equality when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_tolerance_secs: Option<u64>,

    /// Failed keys kept in the run summary (default: 10000).
    #[serde(default = "default_max_failed_keys")]
    pub max_failed_keys: usize,

    /// Expected number of source keys, used to judge a run clean.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_key_count: Option<u64>,

    /// Lowest token to verify (default: i64::MIN).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_min: Option<i64>,

    /// Highest token to verify (default: i64::MAX).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_max: Option<i64>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            token_ranges: default_token_ranges(),
            batch_size: default_batch_size(),
            origin_read_parallelism: default_origin_parallelism(),
            target_read_parallelism: default_target_parallelism(),
            page_size: default_page_size(),
            status_interval_secs: default_status_interval(),
            lookup_timeout_ms: None,
            lookup_retries: 0,
            retry_delay_ms: default_retry_delay(),
            ttl_tolerance_secs: None,
            max_failed_keys: default_max_failed_keys(),
            expected_key_count: None,
            token_min: None,
            token_max: None,
        }
    }
}

impl CheckConfig {
    /// Token domain to partition.
    pub fn domain(&self) -> Result<TokenDomain> {
        TokenDomain::new(
            self.token_min.unwrap_or(i64::MIN),
            self.token_max.unwrap_or(i64::MAX),
        )
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    pub fn lookup_timeout(&self) -> Option<Duration> {
        self.lookup_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// TTL comparison policy.
    pub fn ttl_policy(&self) -> TtlPolicy {
        match self.ttl_tolerance_secs {
            Some(secs) => TtlPolicy::Tolerance(secs),
            None => TtlPolicy::Strict,
        }
    }

    /// Capacity of the row queue between scanner and batcher.
    pub fn row_queue_capacity(&self) -> usize {
        self.batch_size * self.target_read_parallelism
    }

    /// Capacity of the report queue, sized for a full burst of reports.
    pub fn report_queue_capacity(&self) -> usize {
        self.batch_size * self.target_read_parallelism
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "keyvalue".to_string()
}

fn default_key_column() -> String {
    "key".to_string()
}

fn default_value_column() -> String {
    "value".to_string()
}

fn default_require() -> String {
    "require".to_string()
}

fn default_connections() -> usize {
    32
}

fn default_token_ranges() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    512
}

fn default_origin_parallelism() -> usize {
    4
}

fn default_target_parallelism() -> usize {
    32
}

fn default_page_size() -> usize {
    100_000
}

fn default_status_interval() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    200
}

fn default_max_failed_keys() -> usize {
    10_000
}
