//! In-memory backend with deterministic fault hooks.

use super::table::Tables;
use super::{Deadline, Entry, ScanRange, StorageBackend};
use crate::error::{HubError, Result};
use parking_lot::Mutex;
use std::time::Duration;

/// Failure behaviour injected into a [`MemoryBackend`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendFault {
    /// Every call fails with `StorageUnavailable`.
    Unavailable,
    /// Allow this many more `put` calls, then fail every later one.
    FailPutsAfter(usize),
    /// Sleep before each call (deadlines are checked after the sleep).
    Latency(Duration),
}

#[derive(Debug, Default)]
struct FaultState {
    unavailable: bool,
    puts_remaining: Option<usize>,
    latency: Option<Duration>,
}

/// Non-durable backend. Partitions are sharded; each carries its own lock.
#[derive(Default)]
pub struct MemoryBackend {
    tables: Tables,
    faults: Mutex<FaultState>,
}

impl MemoryBackend {
    /// Create an empty backend with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fault. Faults stay active until [`clear_faults`](Self::clear_faults).
    pub fn inject(&self, fault: BackendFault) {
        let mut faults = self.faults.lock();
        match fault {
            BackendFault::Unavailable => faults.unavailable = true,
            BackendFault::FailPutsAfter(n) => faults.puts_remaining = Some(n),
            BackendFault::Latency(d) => faults.latency = Some(d),
        }
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        *self.faults.lock() = FaultState::default();
    }

    fn before(&self, op: &'static str, partition: &str, deadline: Deadline) -> Result<()> {
        deadline.check(op, partition)?;

        let (unavailable, latency) = {
            let faults = self.faults.lock();
            (faults.unavailable, faults.latency)
        };
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        if unavailable {
            return Err(HubError::unavailable(op, partition, "backend unavailable"));
        }
        deadline.check(op, partition)
    }

    fn consume_put(&self, partition: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        match faults.puts_remaining {
            Some(0) => Err(HubError::unavailable("put", partition, "injected write failure")),
            Some(n) => {
                faults.puts_remaining = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<Option<Vec<u8>>> {
        self.before("get", partition, deadline)?;
        Ok(self.tables.get(partition, key))
    }

    fn put(&self, partition: &str, key: &[u8], value: Vec<u8>, deadline: Deadline) -> Result<()> {
        self.before("put", partition, deadline)?;
        self.consume_put(partition)?;
        self.tables.put(partition, key, value);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        partition: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Vec<u8>,
        deadline: Deadline,
    ) -> Result<bool> {
        self.before("compare_and_swap", partition, deadline)?;
        Ok(self.tables.compare_and_swap(partition, key, expected, new))
    }

    fn delete(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<bool> {
        self.before("delete", partition, deadline)?;
        Ok(self.tables.delete(partition, key))
    }

    fn delete_range(&self, partition: &str, range: &ScanRange, deadline: Deadline) -> Result<u64> {
        self.before("delete_range", partition, deadline)?;
        Ok(self.tables.delete_range(partition, range))
    }

    fn scan(
        &self,
        partition: &str,
        range: &ScanRange,
        reverse: bool,
        limit: Option<usize>,
        deadline: Deadline,
    ) -> Result<Vec<Entry>> {
        self.before("scan", partition, deadline)?;
        Ok(self.tables.scan(partition, range, reverse, limit))
    }
}
