//! Store abstraction shared by the source and destination sides.
//!
//! The pipeline only needs two read-only operations from a store:
//!
//! - [`Store::scan_page`]: one page of a token-range scan
//! - [`Store::lookup`]: a point read by key
//!
//! Both must be safe to retry. Backends:
//!
//! - [`PgStore`]: PostgreSQL key-value table hashed with `hashtextextended`
//! - [`MemoryStore`]: in-process store with fault injection

mod memory;
mod postgres;
mod tls;

pub use memory::{token_for, MemoryStore};
pub use postgres::PgStore;
pub use tls::{SslMode, TlsBuilder};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Serialize, Serializer};
use std::fmt;

use crate::error::Result;
use crate::ring::TokenRange;

/// Opaque row key, compared byte for byte.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(pub Bytes);

impl Key {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key(Bytes::from(v))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => {
                f.write_str("0x")?;
                for b in self.0.iter() {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self)
    }
}

/// Opaque row value, compared byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(pub Bytes);

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value(Bytes::from(s))
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value(Bytes::from(v))
    }
}

/// A single key/value pair with its remaining time-to-live in seconds.
///
/// `value` is `None` for a stored NULL, which never equals an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub key: Key,
    pub value: Option<Value>,
    pub ttl: Option<i64>,
}

impl Row {
    pub fn new(key: impl Into<Key>, value: impl Into<Value>, ttl: Option<i64>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ttl,
        }
    }

    /// A row whose value is NULL.
    pub fn null(key: impl Into<Key>, ttl: Option<i64>) -> Self {
        Self {
            key: key.into(),
            value: None,
            ttl,
        }
    }
}

/// Store-defined resume token for the next page of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagingState(pub Bytes);

/// One page of a range scan.
#[derive(Debug, Default)]
pub struct Page {
    /// Rows in this page.
    pub rows: Vec<Row>,
    /// Resume point for the next page; `None` when the range is exhausted.
    pub next: Option<PagingState>,
}

/// Read access to a key-value store sharded on a 64-bit token ring.
///
/// Implementations are shared by every worker of a run, so they must be
/// `Send + Sync` and internally pooled.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one page of rows whose token lies in `range` (inclusive).
    ///
    /// Pass `None` for the first page and the previous page's `next` after
    /// that. The scan is complete when a page comes back with `next == None`.
    async fn scan_page(
        &self,
        range: &TokenRange,
        page_size: usize,
        paging: Option<PagingState>,
    ) -> Result<Page>;

    /// Point read by exact key.
    async fn lookup(&self, key: &Key) -> Result<Option<Row>>;

    /// Verify the store is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Name used in logs and errors ("source", "destination", ...).
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_utf8() {
        assert_eq!(Key::from("user:42").to_string(), "user:42");
    }

    #[test]
    fn test_key_display_binary_as_hex() {
        let key = Key::from(vec![0xff, 0x00, 0x1a]);
        assert_eq!(key.to_string(), "0xff001a");
    }

    #[test]
    fn test_key_serializes_as_display_text() {
        let keys = vec![Key::from("a"), Key::from(vec![0x80])];
        assert_eq!(serde_json::to_string(&keys).unwrap(), r#"["a","0x80"]"#);
    }

    #[test]
    fn test_row_equality_is_exact() {
        let a = Row::new("k", "v", Some(10));
        assert_eq!(a, Row::new("k", "v", Some(10)));
        assert_ne!(a, Row::new("k", "v ", Some(10)));
        assert_ne!(a, Row::new("k", "v", None));
        assert_ne!(Row::new("k", "", None), Row::null("k", None));
    }
}
