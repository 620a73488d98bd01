//! Per-channel key assignment.

use super::{decode_key_record, partition_for, LATEST_RECORD};
use crate::backend::{Deadline, StorageBackend};
use crate::clock::Clock;
use crate::error::{HubError, Result};
use crate::types::{ContentKey, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Last key issued for one channel, as this process knows it.
#[derive(Debug, Default)]
struct Cursor {
    last: Option<ContentKey>,
    loaded: bool,
}

/// Issues strictly increasing keys per channel.
///
/// Each channel has its own cursor behind its own mutex, so writers to
/// different channels never wait on each other. The durable high-water
/// mark is advanced with a compare-and-swap; losing the race (another
/// process wrote first) reloads the mark and tries again.
pub struct KeySequencer {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    cursors: DashMap<String, Arc<Mutex<Cursor>>>,
    max_cas_retries: usize,
}

impl KeySequencer {
    /// Create a sequencer that gives up after `max_cas_retries` lost races.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        max_cas_retries: usize,
    ) -> Self {
        Self {
            backend,
            clock,
            cursors: DashMap::new(),
            max_cas_retries: max_cas_retries.max(1),
        }
    }

    /// Reserve `count` contiguous keys, all sharing one timestamp.
    pub fn reserve(&self, channel: &str, count: u32, deadline: Deadline) -> Result<Vec<ContentKey>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let exhausted = || HubError::Conflict(format!("key space of {channel} is exhausted"));
        let first = self.advance(channel, deadline, |last, now| {
            let start = next_after(last, now).ok_or_else(exhausted)?;
            let start = if start.sequence.checked_add(count - 1).is_some() {
                start
            } else {
                let millis = start.millis.checked_add(1).ok_or_else(exhausted)?;
                ContentKey::new(millis, 0)
            };
            let mark = ContentKey::new(start.millis, start.sequence + (count - 1));
            if mark == ContentKey::MAX {
                return Err(exhausted());
            }
            Ok((start, mark))
        })?;

        Ok((0..count)
            .map(|i| ContentKey::new(first.millis, first.sequence + i))
            .collect())
    }

    /// Reserve a caller-chosen key; it must lie beyond every issued key.
    /// [`ContentKey::MAX`] is refused since nothing could follow it.
    pub fn reserve_exact(&self, channel: &str, key: ContentKey, deadline: Deadline) -> Result<ContentKey> {
        if key == ContentKey::MAX {
            return Err(HubError::InvalidRequest(format!(
                "key {key} is reserved and cannot be assigned"
            )));
        }
        self.advance(channel, deadline, |last, _| match last {
            Some(last) if key <= last => Err(HubError::Conflict(format!(
                "key {key} is not after the last issued key {last}"
            ))),
            _ => Ok((key, key)),
        })
    }

    /// Highest key ever issued for the channel, committed or not.
    pub fn high_water_mark(&self, channel: &str, deadline: Deadline) -> Result<Option<ContentKey>> {
        self.load(channel, deadline)
    }

    /// Drop the in-memory cursor; the next reservation reloads it.
    pub fn forget(&self, channel: &str) {
        self.cursors.remove(channel);
    }

    /// Run one reservation. `plan` maps (last issued, now) to the first
    /// reserved key and the new high-water mark.
    fn advance<F>(&self, channel: &str, deadline: Deadline, plan: F) -> Result<ContentKey>
    where
        F: Fn(Option<ContentKey>, Timestamp) -> Result<(ContentKey, ContentKey)>,
    {
        let partition = partition_for(channel);
        let cursor = self.cursor(channel);
        let mut cursor = cursor.lock();

        for _ in 0..self.max_cas_retries {
            if !cursor.loaded {
                cursor.last = self.load(channel, deadline)?;
                cursor.loaded = true;
            }

            let (first, mark) = plan(cursor.last, self.clock.now())?;
            let expected = cursor.last.map(|k| k.to_bytes());
            let swapped = self.backend.compare_and_swap(
                &partition,
                LATEST_RECORD,
                expected.as_ref().map(|b| &b[..]),
                mark.to_bytes().to_vec(),
                deadline,
            );

            match swapped {
                Ok(true) => {
                    cursor.last = Some(mark);
                    return Ok(first);
                }
                Ok(false) => cursor.loaded = false,
                Err(e) => {
                    // The write may or may not have landed.
                    cursor.loaded = false;
                    return Err(e);
                }
            }
        }

        warn!(channel, retries = self.max_cas_retries, "gave up advancing high-water mark");
        Err(HubError::Conflict(format!(
            "high-water mark of {channel} kept moving"
        )))
    }

    fn cursor(&self, channel: &str) -> Arc<Mutex<Cursor>> {
        if let Some(cursor) = self.cursors.get(channel) {
            return Arc::clone(cursor.value());
        }
        Arc::clone(self.cursors.entry(channel.to_string()).or_default().value())
    }

    fn load(&self, channel: &str, deadline: Deadline) -> Result<Option<ContentKey>> {
        self.backend
            .get(&partition_for(channel), LATEST_RECORD, deadline)?
            .map(|raw| decode_key_record(&raw))
            .transpose()
    }
}

/// Smallest key that may follow `last` at time `now`. A clock that moved
/// backwards keeps the old timestamp and bumps the sequence. `None` once
/// the key space is used up.
fn next_after(last: Option<ContentKey>, now: Timestamp) -> Option<ContentKey> {
    match last {
        Some(last) if now.0 <= last.millis => last.successor(),
        _ => Some(ContentKey::first_at(now)),
    }
}
