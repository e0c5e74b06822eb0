//! In-process store with fault injection.
//!
//! Rows are ordered by `(token, key)` exactly like a ring-sharded store
//! returns them, so paging and range boundaries behave the same way as a
//! real backend. Faults can be injected per range and per key.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use super::{Key, Page, PagingState, Row, Store};
use crate::error::{Result, VerifyError};
use crate::ring::TokenRange;

/// Token of a key: the first 8 bytes of its SHA-256, big-endian.
pub fn token_for(key: &[u8]) -> i64 {
    let digest = Sha256::digest(key);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(buf)
}

#[derive(Debug, Clone, Copy)]
struct ScanFault {
    token: i64,
    after_pages: usize,
}

#[derive(Default)]
struct Faults {
    scans: Vec<ScanFault>,
    failing_keys: HashSet<Key>,
    stalled_keys: HashMap<Key, Duration>,
}

/// In-memory [`Store`].
pub struct MemoryStore {
    name: String,
    rows: RwLock<BTreeMap<(i64, Key), Row>>,
    index: RwLock<HashMap<Key, i64>>,
    faults: RwLock<Faults>,
    latency: Option<Duration>,
    scan_calls: AtomicU64,
    lookup_calls: AtomicU64,
    lookups_by_key: Mutex<HashMap<Key, u32>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            index: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            latency: None,
            scan_calls: AtomicU64::new(0),
            lookup_calls: AtomicU64::new(0),
            lookups_by_key: Mutex::new(HashMap::new()),
        }
    }

    /// Delay every scan page and lookup by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert or replace a row at its hashed token.
    pub fn insert(&self, row: Row) {
        let token = token_for(row.key.as_bytes());
        self.insert_at(token, row);
    }

    /// Insert or replace a row at an explicit token.
    pub fn insert_at(&self, token: i64, row: Row) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = index.insert(row.key.clone(), token) {
            rows.remove(&(old, row.key.clone()));
        }
        rows.insert((token, row.key.clone()), row);
    }

    /// Remove a row by key.
    pub fn remove(&self, key: &Key) -> Option<Row> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let token = index.remove(key)?;
        self.rows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(token, key.clone()))
    }

    /// Token assigned to a stored key.
    pub fn token_of(&self, key: &Key) -> Option<i64> {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count rows whose token lies in `range`.
    pub fn count_in_range(&self, range: &TokenRange) -> usize {
        self.rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|(token, _)| range.contains(*token))
            .count()
    }

    /// Make scans of any range containing `token` fail once `after_pages`
    /// pages have been served (0 fails the first page).
    pub fn fail_scan_at(&self, token: i64, after_pages: usize) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .scans
            .push(ScanFault { token, after_pages });
    }

    /// Make every lookup of `key` fail.
    pub fn fail_lookup(&self, key: impl Into<Key>) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .failing_keys
            .insert(key.into());
    }

    /// Delay every lookup of `key` by `delay`.
    pub fn stall_lookup(&self, key: impl Into<Key>, delay: Duration) {
        self.faults
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .stalled_keys
            .insert(key.into(), delay);
    }

    /// Total `scan_page` calls served.
    pub fn scan_calls(&self) -> u64 {
        self.scan_calls.load(Ordering::Relaxed)
    }

    /// Total `lookup` calls served.
    pub fn lookup_calls(&self) -> u64 {
        self.lookup_calls.load(Ordering::Relaxed)
    }

    /// Number of times `key` was looked up.
    pub fn lookups_of(&self, key: &Key) -> u32 {
        self.lookups_by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Snapshot of per-key lookup counts.
    pub fn lookup_counts(&self) -> HashMap<Key, u32> {
        self.lookups_by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn encode_paging(token: i64, key: &Key) -> PagingState {
        let mut buf = BytesMut::with_capacity(8 + key.0.len());
        buf.put_i64(token);
        buf.put_slice(&key.0);
        PagingState(buf.freeze())
    }

    fn decode_paging(&self, state: &PagingState) -> Result<(i64, Key)> {
        if state.0.len() < 8 {
            return Err(VerifyError::store(&self.name, "malformed paging state"));
        }
        let mut token = [0u8; 8];
        token.copy_from_slice(&state.0[..8]);
        Ok((i64::from_be_bytes(token), Key(state.0.slice(8..))))
    }

    fn scan_fault_for(&self, range: &TokenRange, page_index: usize) -> bool {
        self.faults
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scans
            .iter()
            .any(|f| range.contains(f.token) && f.after_pages == page_index)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn scan_page(
        &self,
        range: &TokenRange,
        page_size: usize,
        paging: Option<PagingState>,
    ) -> Result<Page> {
        self.scan_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let lower = match &paging {
            Some(state) => Bound::Excluded(self.decode_paging(state)?),
            None => Bound::Included((range.start, Key(Bytes::new()))),
        };
        let upper = if range.end == i64::MAX {
            Bound::Unbounded
        } else {
            Bound::Excluded((range.end + 1, Key(Bytes::new())))
        };

        // Page index is recovered from how many rows precede the cursor.
        let page_index = match &lower {
            Bound::Excluded(cursor) => {
                let seen = self
                    .rows
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .range((
                        Bound::Included((range.start, Key(Bytes::new()))),
                        Bound::Included(cursor.clone()),
                    ))
                    .count();
                seen / page_size.max(1)
            }
            _ => 0,
        };
        if self.scan_fault_for(range, page_index) {
            return Err(VerifyError::store(
                &self.name,
                format!("injected scan failure for range {} page {}", range, page_index),
            ));
        }

        let rows = self.rows.read().unwrap_or_else(PoisonError::into_inner);
        let mut page: Vec<Row> = Vec::with_capacity(page_size.min(1024));
        let mut last = None;
        let mut more = false;
        for ((token, key), row) in rows.range((lower, upper)) {
            if page.len() == page_size {
                more = true;
                break;
            }
            page.push(row.clone());
            last = Some((*token, key.clone()));
        }

        let next = match (more, last) {
            (true, Some((token, key))) => Some(Self::encode_paging(token, &key)),
            _ => None,
        };
        Ok(Page { rows: page, next })
    }

    async fn lookup(&self, key: &Key) -> Result<Option<Row>> {
        self.lookup_calls.fetch_add(1, Ordering::Relaxed);
        *self
            .lookups_by_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert(0) += 1;

        let (failing, stall) = {
            let faults = self.faults.read().unwrap_or_else(PoisonError::into_inner);
            (
                faults.failing_keys.contains(key),
                faults.stalled_keys.get(key).copied(),
            )
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(VerifyError::store(
                &self.name,
                format!("injected lookup failure for key {}", key),
            ));
        }

        let Some(token) = self.token_of(key) else {
            return Ok(None);
        };
        Ok(self
            .rows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(token, key.clone()))
            .cloned())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> MemoryStore {
        let store = MemoryStore::new("test");
        for i in 0..n {
            store.insert(Row::new(format!("key-{}", i), format!("value-{}", i), None));
        }
        store
    }

    async fn drain(store: &MemoryStore, range: TokenRange, page_size: usize) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        let mut paging = None;
        loop {
            let page = store.scan_page(&range, page_size, paging).await?;
            rows.extend(page.rows);
            match page.next {
                Some(next) => paging = Some(next),
                None => return Ok(rows),
            }
        }
    }

    #[test]
    fn test_token_for_is_stable() {
        assert_eq!(token_for(b"abc"), token_for(b"abc"));
        assert_ne!(token_for(b"abc"), token_for(b"abd"));
    }

    #[tokio::test]
    async fn test_full_scan_pages_every_row_once() {
        let store = store_with(250);
        let full = TokenRange::new(i64::MIN, i64::MAX);
        let rows = drain(&store, full, 40).await.unwrap();
        assert_eq!(rows.len(), 250);
        let unique: HashSet<_> = rows.iter().map(|r| r.key.clone()).collect();
        assert_eq!(unique.len(), 250);
        // 250 rows / 40 per page: 7 pages, the last one short.
        assert_eq!(store.scan_calls(), 7);
    }

    #[tokio::test]
    async fn test_scan_respects_inclusive_bounds() {
        let store = MemoryStore::new("test");
        store.insert_at(10, Row::new("a", "1", None));
        store.insert_at(20, Row::new("b", "2", None));
        store.insert_at(21, Row::new("c", "3", None));
        store.insert_at(i64::MAX, Row::new("d", "4", None));

        let rows = drain(&store, TokenRange::new(10, 20), 10).await.unwrap();
        let keys: Vec<String> = rows.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        let rows = drain(&store, TokenRange::new(21, i64::MAX), 1).await.unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_scan_fault_on_first_page() {
        let store = MemoryStore::new("test");
        store.insert_at(5, Row::new("a", "1", None));
        store.fail_scan_at(5, 0);
        assert!(store
            .scan_page(&TokenRange::new(0, 10), 10, None)
            .await
            .is_err());
        // Ranges not containing the token are unaffected.
        assert!(store
            .scan_page(&TokenRange::new(6, 10), 10, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_scan_fault_after_first_page() {
        let store = MemoryStore::new("test");
        for t in 0..5 {
            store.insert_at(t, Row::new(format!("k{}", t), "v", None));
        }
        store.fail_scan_at(0, 1);
        let range = TokenRange::new(0, 10);
        let first = store.scan_page(&range, 2, None).await.unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(store.scan_page(&range, 2, first.next).await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_and_faults() {
        let store = store_with(3);
        let hit = store.lookup(&Key::from("key-1")).await.unwrap();
        assert_eq!(hit, Some(Row::new("key-1", "value-1", None)));
        assert_eq!(store.lookup(&Key::from("missing")).await.unwrap(), None);

        store.fail_lookup("key-2");
        assert!(store.lookup(&Key::from("key-2")).await.is_err());
        assert_eq!(store.lookups_of(&Key::from("key-2")), 1);
        assert_eq!(store.lookup_calls(), 3);
    }

    #[test]
    fn test_reinsert_replaces_row() {
        let store = MemoryStore::new("test");
        store.insert(Row::new("k", "old", None));
        store.insert(Row::new("k", "new", Some(5)));
        assert_eq!(store.len(), 1);
        assert!(store.remove(&Key::from("k")).is_some());
        assert!(store.is_empty());
    }
}
