//! Token ring partitioning.
//!
//! The source store shards rows by a signed 64-bit token. A full scan is
//! split into contiguous inclusive [`TokenRange`]s that cover a
//! [`TokenDomain`] exactly once, so scanner workers can read the ring in
//! parallel without overlap.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, VerifyError};

/// Inclusive slice of the token ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenRange {
    /// First token (inclusive).
    pub start: i64,
    /// Last token (inclusive).
    pub end: i64,
}

impl TokenRange {
    /// Create a new range. `start` must not exceed `end`.
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start <= end, "token range start {} > end {}", start, end);
        Self { start, end }
    }

    /// Number of tokens in the range.
    pub fn width(&self) -> u128 {
        (self.end as i128 - self.start as i128 + 1) as u128
    }

    /// Check if a token falls inside the range.
    pub fn contains(&self, token: i64) -> bool {
        self.start <= token && token <= self.end
    }
}

impl fmt::Display for TokenRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.start, self.end)
    }
}

/// The portion of the ring to verify, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDomain {
    pub min: i64,
    pub max: i64,
}

impl TokenDomain {
    /// The whole signed 64-bit ring.
    pub const FULL: TokenDomain = TokenDomain {
        min: i64::MIN,
        max: i64::MAX,
    };

    /// Create a domain, rejecting an inverted one.
    pub fn new(min: i64, max: i64) -> Result<Self> {
        if min > max {
            return Err(VerifyError::Config(format!(
                "token domain min {} is greater than max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Number of tokens in the domain. The full ring holds 2^64 tokens.
    pub fn size(&self) -> u128 {
        (self.max as i128 - self.min as i128 + 1) as u128
    }
}

impl Default for TokenDomain {
    fn default() -> Self {
        Self::FULL
    }
}

/// Upper bound of a range of `width` tokens starting at `start`, clamped to
/// `max`. Computed in 128-bit space so the ring extremes never wrap.
pub fn clamped_end(start: i64, width: u128, max: i64) -> i64 {
    debug_assert!(width >= 1);
    let end = start as i128 + width as i128 - 1;
    if end >= max as i128 {
        max
    } else {
        end as i64
    }
}

/// Splits a [`TokenDomain`] into at most `count` contiguous ranges.
///
/// Every range is `ceil(size / count)` tokens wide except the last, which
/// ends exactly at the domain maximum.
#[derive(Debug, Clone)]
pub struct RangePartitioner {
    domain: TokenDomain,
    count: usize,
    width: u128,
}

impl RangePartitioner {
    /// Create a partitioner for `count` ranges over `domain`.
    pub fn new(domain: TokenDomain, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(VerifyError::Config(
                "token range count must be at least 1".into(),
            ));
        }
        let size = domain.size();
        let count_wide = count as u128;
        let width = size.div_ceil(count_wide);
        Ok(Self {
            domain,
            count,
            width,
        })
    }

    /// Width of every range but the last.
    pub fn range_width(&self) -> u128 {
        self.width
    }

    /// Requested range count.
    pub fn requested(&self) -> usize {
        self.count
    }

    /// Number of ranges the iterator will actually yield.
    pub fn len(&self) -> usize {
        self.domain.size().div_ceil(self.width) as usize
    }

    /// Always false: a domain holds at least one token.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Lazily produce the ranges in ascending order.
    pub fn ranges(&self) -> TokenRanges {
        TokenRanges {
            next_start: Some(self.domain.min),
            max: self.domain.max,
            width: self.width,
        }
    }
}

impl IntoIterator for &RangePartitioner {
    type Item = TokenRange;
    type IntoIter = TokenRanges;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges()
    }
}

/// Iterator over the ranges of a [`RangePartitioner`].
#[derive(Debug, Clone)]
pub struct TokenRanges {
    next_start: Option<i64>,
    max: i64,
    width: u128,
}

impl Iterator for TokenRanges {
    type Item = TokenRange;

    fn next(&mut self) -> Option<TokenRange> {
        let start = self.next_start?;
        let end = clamped_end(start, self.width, self.max);

        // Emit the range ending at max, then stop.
        self.next_start = if end == self.max { None } else { Some(end + 1) };

        Some(TokenRange::new(start, end))
    }
}

impl std::iter::FusedIterator for TokenRanges {}
