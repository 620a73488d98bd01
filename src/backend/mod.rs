//! Storage backend contract.
//!
//! The content store and both registries persist everything through
//! [`StorageBackend`]: a partitioned, ordered key-value store with
//! conditional puts. Two implementations ship with the crate:
//!
//! - [`MemoryBackend`]: sharded in-memory tables, with fault hooks for tests
//! - [`FileBackend`]: the same tables made durable by an append-only,
//!   checksummed operation log
//!
//! Every call takes a [`Deadline`]. An expired deadline yields
//! `HubError::Timeout`; backends never retry on their own.

mod file;
mod memory;
mod table;

pub use file::FileBackend;
pub use memory::{BackendFault, MemoryBackend};

use crate::error::{HubError, Result};
use std::ops::Bound;
use std::time::{Duration, Instant};

/// A stored key-value pair.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Point in time after which an operation gives up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Deadline(None)
    }

    /// Expire `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// [`Deadline::after`] for `Some`, no deadline for `None`.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map(Self::after).unwrap_or_default()
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.0.map(|at| Instant::now() >= at).unwrap_or(false)
    }

    /// Fail with `Timeout` if the deadline has passed.
    pub fn check(&self, op: &'static str, partition: &str) -> Result<()> {
        if self.expired() {
            Err(HubError::Timeout {
                op,
                partition: partition.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

/// Key range within a partition: `start` inclusive, `end` exclusive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

impl ScanRange {
    /// The whole partition.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            start: Some(prefix.to_vec()),
            end: prefix_end(prefix),
        }
    }

    /// True when no key can fall inside the range.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Some(s), Some(e)) => s >= e,
            _ => false,
        }
    }

    pub(crate) fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        let start = match &self.start {
            Some(s) => Bound::Included(s.as_slice()),
            None => Bound::Unbounded,
        };
        let end = match &self.end {
            Some(e) => Bound::Excluded(e.as_slice()),
            None => Bound::Unbounded,
        };
        (start, end)
    }
}

/// Smallest key greater than every key with the given prefix.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Durable, partitioned, ordered key-value storage.
///
/// Thread safety: all methods may be called concurrently.
pub trait StorageBackend: Send + Sync {
    /// Current value of `key`, if any.
    fn get(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<Option<Vec<u8>>>;

    /// Unconditional write.
    fn put(&self, partition: &str, key: &[u8], value: Vec<u8>, deadline: Deadline) -> Result<()>;

    /// Write `new` only if the current value equals `expected`
    /// (`None` = key absent). Returns whether the write happened.
    fn compare_and_swap(
        &self,
        partition: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Vec<u8>,
        deadline: Deadline,
    ) -> Result<bool>;

    /// Returns whether the key existed.
    fn delete(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<bool>;

    /// Returns the number of keys removed.
    fn delete_range(&self, partition: &str, range: &ScanRange, deadline: Deadline) -> Result<u64>;

    /// Entries in key order (descending when `reverse`), at most `limit`.
    fn scan(
        &self,
        partition: &str,
        range: &ScanRange,
        reverse: bool,
        limit: Option<usize>,
        deadline: Deadline,
    ) -> Result<Vec<Entry>>;
}
