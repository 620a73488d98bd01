//! In-memory partition tables shared by both backends.

use super::{Entry, ScanRange};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

type Partition = RwLock<BTreeMap<Vec<u8>, Vec<u8>>>;

/// Ordered tables, one per partition. Partitions live in separate
/// `DashMap` shards and carry their own lock, so work on different
/// partitions never contends.
#[derive(Default)]
pub(crate) struct Tables {
    partitions: DashMap<String, Partition>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.partitions
            .get(partition)
            .and_then(|p| p.read().get(key).cloned())
    }

    pub fn put(&self, partition: &str, key: &[u8], value: Vec<u8>) {
        if let Some(part) = self.partitions.get(partition) {
            part.write().insert(key.to_vec(), value);
            return;
        }
        self.partitions
            .entry(partition.to_string())
            .or_default()
            .write()
            .insert(key.to_vec(), value);
    }

    pub fn compare_and_swap(
        &self,
        partition: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> bool {
        let swap = |map: &mut BTreeMap<Vec<u8>, Vec<u8>>, new: Vec<u8>| {
            if map.get(key).map(Vec::as_slice) != expected {
                return false;
            }
            map.insert(key.to_vec(), new);
            true
        };
        if let Some(part) = self.partitions.get(partition) {
            let mut map = part.write();
            return swap(&mut *map, new);
        }
        let part = self.partitions.entry(partition.to_string()).or_default();
        let mut map = part.write();
        swap(&mut *map, new)
    }

    /// Whether `key` currently holds `expected`.
    pub fn matches(&self, partition: &str, key: &[u8], expected: Option<&[u8]>) -> bool {
        let current = self.get(partition, key);
        current.as_deref() == expected
    }

    pub fn delete(&self, partition: &str, key: &[u8]) -> bool {
        self.partitions
            .get(partition)
            .map(|p| p.write().remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn delete_range(&self, partition: &str, range: &ScanRange) -> u64 {
        if range.is_empty() {
            return 0;
        }
        let Some(part) = self.partitions.get(partition) else {
            return 0;
        };
        let mut map = part.write();
        let doomed: Vec<Vec<u8>> = map
            .range::<[u8], _>(range.bounds())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            map.remove(key);
        }
        doomed.len() as u64
    }

    pub fn scan(
        &self,
        partition: &str,
        range: &ScanRange,
        reverse: bool,
        limit: Option<usize>,
    ) -> Vec<Entry> {
        if range.is_empty() || limit == Some(0) {
            return Vec::new();
        }
        let Some(part) = self.partitions.get(partition) else {
            return Vec::new();
        };
        let map = part.read();
        let iter = map.range::<[u8], _>(range.bounds());
        let limit = limit.unwrap_or(usize::MAX);
        if reverse {
            iter.rev()
                .take(limit)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            iter.take(limit).map(|(k, v)| (k.clone(), v.clone())).collect()
        }
    }

    /// Number of keys in `range`.
    pub fn count(&self, partition: &str, range: &ScanRange) -> u64 {
        if range.is_empty() {
            return 0;
        }
        self.partitions
            .get(partition)
            .map(|p| p.read().range::<[u8], _>(range.bounds()).count() as u64)
            .unwrap_or(0)
    }

    /// Snapshot of every partition, for log compaction.
    pub fn dump(&self) -> Vec<(String, Vec<Entry>)> {
        self.partitions
            .iter()
            .map(|p| {
                let entries = p
                    .value()
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (p.key().clone(), entries)
            })
            .collect()
    }
}
