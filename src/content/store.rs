//! Content store: insert, lookup, queries and pruning per channel.

use super::{
    decode_key_record, item_key, partition_for, KeyScan, KeySequencer, FLOOR_RECORD, ITEM_END,
    ITEM_PREFIX,
};
use crate::backend::{Deadline, ScanRange, StorageBackend};
use crate::channels::validate_channel_name;
use crate::clock::Clock;
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crate::types::{Content, ContentKey, Direction, DirectionQuery, TimeQuery, Traces};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// On-backend form of an item.
#[derive(Serialize, Deserialize)]
struct StoredContent {
    content_type: Option<String>,
    trace: bool,
    data: Vec<u8>,
    checksum: u32,
}

impl StoredContent {
    fn encode(content: &Content) -> Result<Vec<u8>> {
        let stored = StoredContent {
            content_type: content.content_type.clone(),
            trace: content.trace,
            data: content.data.clone(),
            checksum: crc32fast::hash(&content.data),
        };
        Ok(rmp_serde::to_vec(&stored)?)
    }

    fn decode(raw: &[u8], key: ContentKey) -> Result<Content> {
        let stored: StoredContent = rmp_serde::from_slice(raw)?;
        let computed = crc32fast::hash(&stored.data);
        if computed != stored.checksum {
            return Err(HubError::Corruption(format!(
                "checksum mismatch for item {key}: expected {}, got {computed}",
                stored.checksum
            )));
        }
        Ok(Content {
            content_type: stored.content_type,
            data: stored.data,
            trace: stored.trace,
            key: Some(key),
        })
    }
}

/// Append-only, per-channel content storage.
///
/// Every operation takes a [`Deadline`] that is passed to each backend
/// call. Nothing is retried here; retry policy belongs to the caller.
pub struct ContentStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    sequencer: KeySequencer,
    settle_window: Duration,
    page_size: usize,
}

impl ContentStore {
    /// Create a store; page size and settling window come from `config`.
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>, config: &HubConfig) -> Self {
        let sequencer = KeySequencer::new(
            Arc::clone(&backend),
            Arc::clone(&clock),
            config.max_cas_retries,
        );
        Self {
            backend,
            clock,
            sequencer,
            settle_window: config.settle_window(),
            page_size: config.scan_page_size,
        }
    }

    // --- Writes ---

    /// Assign the next key and persist the item.
    ///
    /// Content that already carries a key (replication) keeps it, provided
    /// the key lies beyond everything issued so far.
    pub fn insert(&self, channel: &str, content: &Content, deadline: Deadline) -> Result<ContentKey> {
        validate_channel_name(channel)?;

        let key = match content.key {
            Some(key) => self.sequencer.reserve_exact(channel, key, deadline)?,
            None => self.reserve(channel, 1, deadline)?[0],
        };
        self.commit(channel, key, content, deadline)?;

        debug!(channel, %key, bytes = content.len(), "inserted content");
        Ok(key)
    }

    /// Insert a batch under contiguous keys, in input order.
    ///
    /// On failure the error lists the keys already committed.
    pub fn insert_bulk(&self, channel: &str, items: &[Content], deadline: Deadline) -> Result<Vec<ContentKey>> {
        validate_channel_name(channel)?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        if items.iter().any(|item| item.key.is_some()) {
            return Err(HubError::InvalidRequest(
                "bulk content may not carry preassigned keys".into(),
            ));
        }
        let count = u32::try_from(items.len())
            .map_err(|_| HubError::InvalidRequest(format!("batch of {} items is too large", items.len())))?;

        let failed = |successful_keys: Vec<ContentKey>, source: HubError| HubError::BulkInsertFailed {
            channel: channel.to_string(),
            successful_keys,
            source: Box::new(source),
        };

        let keys = self
            .reserve(channel, count, deadline)
            .map_err(|e| failed(Vec::new(), e))?;

        let mut committed = Vec::with_capacity(keys.len());
        for (key, item) in keys.into_iter().zip(items) {
            if let Err(e) = self.commit(channel, key, item, deadline) {
                warn!(channel, %key, committed = committed.len(), error = %e, "bulk insert stopped");
                return Err(failed(committed, e));
            }
            committed.push(key);
        }

        debug!(channel, items = committed.len(), "inserted bulk content");
        Ok(committed)
    }

    fn reserve(&self, channel: &str, count: u32, deadline: Deadline) -> Result<Vec<ContentKey>> {
        self.sequencer.reserve(channel, count, deadline)
    }

    fn commit(&self, channel: &str, key: ContentKey, content: &Content, deadline: Deadline) -> Result<()> {
        let value = StoredContent::encode(content)?;
        self.backend
            .put(&partition_for(channel), &item_key(&key), value, deadline)
    }

    // --- Reads ---

    /// One item. Keys at or below the floor read as not found.
    pub fn get(&self, channel: &str, key: ContentKey, deadline: Deadline) -> Result<Content> {
        validate_channel_name(channel)?;
        let not_found = || HubError::ContentNotFound {
            channel: channel.to_string(),
            key,
        };

        if self.floor(channel, deadline)?.map_or(false, |floor| key <= floor) {
            return Err(not_found());
        }
        let raw = self
            .backend
            .get(&partition_for(channel), &item_key(&key), deadline)?
            .ok_or_else(not_found)?;
        StoredContent::decode(&raw, key)
    }

    /// Feed every present item among `keys` to `callback`, in key order.
    /// Missing keys are skipped.
    pub fn get_values<I, F>(&self, channel: &str, keys: I, mut callback: F, deadline: Deadline) -> Result<()>
    where
        I: IntoIterator<Item = ContentKey>,
        F: FnMut(Content),
    {
        let mut keys: Vec<ContentKey> = keys.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        for key in keys {
            match self.get(channel, key, deadline) {
                Ok(content) => callback(content),
                Err(HubError::ContentNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Keys in the query's time range, in the query's direction.
    pub fn query_by_time(&self, query: &TimeQuery, deadline: Deadline) -> Result<KeyScan> {
        validate_channel_name(&query.channel)?;

        let (lower, upper) = match query.direction {
            Direction::Forward => (
                ContentKey::first_at(query.start),
                query.end.map(ContentKey::first_at),
            ),
            Direction::Backward => (
                ContentKey::first_at(query.start.plus(Duration::from_millis(1))),
                query
                    .end
                    .map(|end| ContentKey::first_at(end.plus(Duration::from_millis(1)))),
            ),
        };
        let upper = if query.stable {
            Some(min_upper(upper, self.stable_cutoff()))
        } else {
            upper
        };

        self.scan(
            &query.channel,
            lower,
            upper,
            query.direction == Direction::Backward,
            deadline,
        )
    }

    /// Up to `count` keys strictly after (forward) or before (backward)
    /// the reference key, returned in ascending order.
    pub fn get_keys(&self, query: &DirectionQuery, deadline: Deadline) -> Result<Vec<ContentKey>> {
        validate_channel_name(&query.channel)?;
        if query.count == 0 {
            return Ok(Vec::new());
        }
        let cutoff = query.stable.then(|| self.stable_cutoff());

        match query.direction {
            Direction::Forward => {
                let Some(after) = query.from.successor() else {
                    return Ok(Vec::new());
                };
                self.scan(&query.channel, after, cutoff, false, deadline)?
                    .with_limit(query.count)
                    .collect_keys()
            }
            Direction::Backward => {
                let upper = min_upper(cutoff, query.from);
                let mut keys = self
                    .scan(&query.channel, ContentKey::MIN, Some(upper), true, deadline)?
                    .with_limit(query.count)
                    .collect_keys()?;
                keys.reverse();
                Ok(keys)
            }
        }
    }

    /// Greatest committed key not above `limit`.
    pub fn get_latest(
        &self,
        channel: &str,
        limit: Option<ContentKey>,
        traces: &mut Traces,
        deadline: Deadline,
    ) -> Result<Option<ContentKey>> {
        validate_channel_name(channel)?;
        traces.add(format!("latest {channel} limit {limit:?}"));

        let upper = limit.and_then(ContentKey::successor);
        let latest = self
            .scan(channel, ContentKey::MIN, upper, true, deadline)?
            .with_limit(1)
            .next()
            .transpose()?;

        traces.add(format!("latest {channel} found {latest:?}"));
        Ok(latest)
    }

    /// The key `n` places below the newest committed key (0 = newest).
    pub fn nth_newest(&self, channel: &str, n: usize, deadline: Deadline) -> Result<Option<ContentKey>> {
        validate_channel_name(channel)?;
        self.scan(channel, ContentKey::MIN, None, true, deadline)?
            .nth(n)
            .transpose()
    }

    /// Highest key ever issued for the channel, committed or not.
    pub fn high_water_mark(&self, channel: &str, deadline: Deadline) -> Result<Option<ContentKey>> {
        self.sequencer.high_water_mark(channel, deadline)
    }

    /// Everything at or below this key has been pruned.
    pub fn floor(&self, channel: &str, deadline: Deadline) -> Result<Option<ContentKey>> {
        self.backend
            .get(&partition_for(channel), FLOOR_RECORD, deadline)?
            .map(|raw| decode_key_record(&raw))
            .transpose()
    }

    // --- Pruning ---

    /// Remove every item with key ≤ `key`. Returns the resulting floor,
    /// or `None` when the channel has never issued a key.
    ///
    /// The floor only moves forward: an older key is a no-op apart from
    /// finishing any physical deletion a failed earlier call left behind.
    /// It never rises above the high-water mark, so every later insert
    /// lands above it.
    pub fn delete_before(
        &self,
        channel: &str,
        key: ContentKey,
        deadline: Deadline,
    ) -> Result<Option<ContentKey>> {
        validate_channel_name(channel)?;
        let partition = partition_for(channel);

        let key = match self.sequencer.high_water_mark(channel, deadline)? {
            Some(mark) => key.min(mark),
            None => return self.floor(channel, deadline),
        };

        let floor = loop {
            let current = self.backend.get(&partition, FLOOR_RECORD, deadline)?;
            let current_key = current.as_deref().map(decode_key_record).transpose()?;
            if current_key.map_or(false, |floor| floor >= key) {
                break current_key.unwrap_or(key);
            }
            if self.backend.compare_and_swap(
                &partition,
                FLOOR_RECORD,
                current.as_deref(),
                key.to_bytes().to_vec(),
                deadline,
            )? {
                break key;
            }
        };

        let end = floor
            .successor()
            .map_or_else(|| ITEM_END.to_vec(), |next| item_key(&next));
        let removed = self
            .backend
            .delete_range(&partition, &ScanRange::between(ITEM_PREFIX, end), deadline)?;

        if removed > 0 {
            info!(channel, %floor, removed, "pruned content");
        }
        Ok(Some(floor))
    }

    /// Remove all content and the floor. The high-water mark stays, so a
    /// recreated channel never reissues an old key.
    pub fn delete(&self, channel: &str, deadline: Deadline) -> Result<()> {
        validate_channel_name(channel)?;
        let partition = partition_for(channel);
        let removed = self
            .backend
            .delete_range(&partition, &ScanRange::prefix(ITEM_PREFIX), deadline)?;
        self.backend.delete(&partition, FLOOR_RECORD, deadline)?;
        info!(channel, removed, "deleted channel content");
        Ok(())
    }

    // --- Helpers ---

    /// Exclusive upper bound that leaves out the settling window.
    fn stable_cutoff(&self) -> ContentKey {
        let settled = self.clock.now().minus(self.settle_window);
        ContentKey::first_at(settled.plus(Duration::from_millis(1)))
    }

    /// Scan `[lower, upper)` above the retention floor.
    fn scan(
        &self,
        channel: &str,
        lower: ContentKey,
        upper: Option<ContentKey>,
        reverse: bool,
        deadline: Deadline,
    ) -> Result<KeyScan> {
        let (lower, upper) = match self.floor(channel, deadline)? {
            Some(floor) => match floor.successor() {
                Some(next) => (lower.max(next), upper),
                None => (floor, Some(floor)),
            },
            None => (lower, upper),
        };
        Ok(KeyScan::new(
            Arc::clone(&self.backend),
            partition_for(channel),
            lower,
            upper,
            reverse,
            self.page_size,
            deadline,
        ))
    }
}

fn min_upper(upper: Option<ContentKey>, bound: ContentKey) -> ContentKey {
    upper.map_or(bound, |u| u.min(bound))
}
