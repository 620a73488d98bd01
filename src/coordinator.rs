//! Per-channel orchestration of the registry and the content store.
//!
//! The coordinator is the public query surface: it checks channel
//! existence and lifecycle before touching content, keeps in-memory
//! latest/floor caches, serializes bulk inserts, and applies retention.

use crate::backend::Deadline;
use crate::channels::{validate_channel_name, ChannelRegistry};
use crate::clock::Clock;
use crate::config::HubConfig;
use crate::content::ContentStore;
use crate::error::{HubError, Result};
use crate::types::{
    BulkContent, ChannelConfig, ChannelState, Content, ContentKey, DirectionQuery, Latest,
    RetentionPolicy, TimeQuery, Traces,
};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Write-side locks for one channel.
#[derive(Default)]
struct ChannelLocks {
    /// Inserts hold this shared; channel deletion holds it exclusively so
    /// no write lands after the content is gone.
    writes: RwLock<()>,
    /// Serializes bulk inserts.
    bulk: Mutex<()>,
}

/// Entry point for channel operations.
///
/// Owns the in-memory latest and floor caches and the per-channel write
/// locks. Every call checks that the channel exists and is not being
/// deleted before it reaches the [`ContentStore`].
pub struct ChannelCoordinator {
    registry: Arc<ChannelRegistry>,
    store: Arc<ContentStore>,
    clock: Arc<dyn Clock>,
    settle_window: Duration,
    request_timeout: Option<Duration>,
    latest: DashMap<String, ContentKey>,
    floors: DashMap<String, ContentKey>,
    deleting: DashSet<String>,
    locks: DashMap<String, Arc<ChannelLocks>>,
}

impl ChannelCoordinator {
    /// Create a coordinator over a registry and store sharing one backend.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<ContentStore>,
        clock: Arc<dyn Clock>,
        config: &HubConfig,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            settle_window: config.settle_window(),
            request_timeout: config.request_timeout(),
            latest: DashMap::new(),
            floors: DashMap::new(),
            deleting: DashSet::new(),
            locks: DashMap::new(),
        }
    }

    /// The channel registry behind this coordinator.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// The content store behind this coordinator.
    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    // --- Channel configuration ---

    /// Register a new channel.
    pub fn create_channel(&self, config: ChannelConfig) -> Result<ChannelConfig> {
        self.registry.create(config)
    }

    /// Channel config; `allow_cache = false` forces a backend read.
    pub fn get_channel_config(&self, name: &str, allow_cache: bool) -> Result<ChannelConfig> {
        self.registry.get(name, allow_cache)
    }

    /// Channel config, served from the cache when fresh.
    pub fn get_cached_channel_config(&self, name: &str) -> Result<ChannelConfig> {
        self.registry.get_cached(name)
    }

    /// All channels, ordered by name.
    pub fn channels(&self) -> Result<Vec<ChannelConfig>> {
        self.registry.list()
    }

    /// Channels carrying `tag`, ordered by name.
    pub fn channels_by_tag(&self, tag: &str) -> Result<Vec<ChannelConfig>> {
        self.registry.list_by_tag(tag)
    }

    /// Every tag in use.
    pub fn tags(&self) -> Result<Vec<String>> {
        self.registry.list_tags()
    }

    /// Replace `old` with `new`; `Conflict` if the stored config moved on.
    pub fn update_channel(&self, new: ChannelConfig, old: &ChannelConfig) -> Result<ChannelConfig> {
        self.registry.update(new, old)
    }

    /// Whether the channel exists.
    pub fn channel_exists(&self, name: &str) -> Result<bool> {
        self.registry.exists(name)
    }

    /// Whether the channel mirrors an upstream source.
    pub fn is_replicating(&self, name: &str) -> Result<bool> {
        self.registry.is_replicating(name)
    }

    /// Lifecycle state as seen by this process.
    pub fn channel_state(&self, name: &str) -> Result<ChannelState> {
        validate_channel_name(name)?;
        if self.deleting.contains(name) {
            return Ok(ChannelState::Deleting);
        }
        Ok(if self.registry.exists(name)? {
            ChannelState::Active
        } else {
            ChannelState::Absent
        })
    }

    // --- Writes ---

    /// Insert one item and return its key.
    ///
    /// Replicating channels accept only content carrying its source key;
    /// other channels never accept a preassigned key.
    pub fn insert(&self, channel: &str, content: &Content) -> Result<ContentKey> {
        validate_channel_name(channel)?;
        let locks = self.locks(channel);
        let _writes = locks.writes.read();
        let config = self.writable_config(channel)?;

        match (config.is_replicating(), content.key) {
            (true, None) => {
                return Err(HubError::InvalidRequest(format!(
                    "channel {channel} is replicating and only accepts keyed content"
                )))
            }
            (false, Some(_)) => {
                return Err(HubError::InvalidRequest(format!(
                    "channel {channel} does not accept preassigned keys"
                )))
            }
            _ => {}
        }

        let key = self.store.insert(channel, content, self.deadline())?;
        self.note_latest(channel, key);
        Ok(key)
    }

    /// Insert a batch as one logical operation. Bulk inserts into one
    /// channel run one at a time.
    pub fn insert_bulk(&self, bulk: &BulkContent) -> Result<Vec<ContentKey>> {
        let channel = bulk.channel.as_str();
        validate_channel_name(channel)?;
        let locks = self.locks(channel);
        let _writes = locks.writes.read();
        let _bulk = locks.bulk.lock();
        let config = self.writable_config(channel)?;

        if config.is_replicating() {
            return Err(HubError::InvalidRequest(format!(
                "channel {channel} is replicating and does not accept bulk content"
            )));
        }

        match self.store.insert_bulk(channel, &bulk.items, self.deadline()) {
            Ok(keys) => {
                if let Some(last) = keys.last() {
                    self.note_latest(channel, *last);
                }
                Ok(keys)
            }
            Err(e) => {
                if let HubError::BulkInsertFailed {
                    successful_keys, ..
                } = &e
                {
                    if let Some(last) = successful_keys.last() {
                        self.note_latest(channel, *last);
                    }
                }
                Err(e)
            }
        }
    }

    // --- Reads ---

    /// One item, unless it is missing or below the retention floor.
    pub fn get_value(&self, channel: &str, key: ContentKey) -> Result<Content> {
        self.require_channel(channel)?;
        if self.below_floor(channel, key) {
            return Err(HubError::ContentNotFound {
                channel: channel.to_string(),
                key,
            });
        }
        self.store.get(channel, key, self.deadline())
    }

    /// Feed each present item among `keys` to `callback`, in key order.
    pub fn get_values<I, F>(&self, channel: &str, keys: I, callback: F) -> Result<()>
    where
        I: IntoIterator<Item = ContentKey>,
        F: FnMut(Content),
    {
        self.require_channel(channel)?;
        let floor = self.cached_floor(channel);
        let keys = keys
            .into_iter()
            .filter(|key| floor.map_or(true, |floor| *key > floor));
        self.store.get_values(channel, keys, callback, self.deadline())
    }

    /// Lazily scan keys in a time range, in the query's direction.
    pub fn query_by_time(
        &self,
        query: &TimeQuery,
    ) -> Result<impl Iterator<Item = Result<ContentKey>> + Send> {
        self.require_channel(&query.channel)?;
        let floor = self.cached_floor(&query.channel);
        let scan = self.store.query_by_time(query, self.deadline())?;
        Ok(scan.filter(move |item| match (item, floor) {
            (Ok(key), Some(floor)) => *key > floor,
            _ => true,
        }))
    }

    /// Up to `count` keys after or before the reference, ascending.
    pub fn get_keys(&self, query: &DirectionQuery) -> Result<Vec<ContentKey>> {
        self.require_channel(&query.channel)?;
        let mut keys = self.store.get_keys(query, self.deadline())?;
        if let Some(floor) = self.cached_floor(&query.channel) {
            keys.retain(|key| *key > floor);
        }
        Ok(keys)
    }

    /// The newest committed key. A stable read ignores the settling
    /// window; an unstable read is served from memory when possible.
    pub fn get_latest(&self, channel: &str, stable: bool, trace: bool) -> Result<Latest> {
        self.require_channel(channel)?;
        let mut traces = Traces::new();

        if !stable {
            if let Some(key) = self.latest.get(channel).map(|k| *k) {
                if !self.below_floor(channel, key) {
                    traces.add(format!("latest {channel} from cache {key}"));
                    return Ok(Latest {
                        key: Some(key),
                        traces: trace.then_some(traces),
                    });
                }
            }
        }

        let limit = stable.then(|| ContentKey::last_at(self.clock.now().minus(self.settle_window)));
        let key = self
            .store
            .get_latest(channel, limit, &mut traces, self.deadline())?
            .filter(|key| !self.below_floor(channel, *key));
        if let (false, Some(key)) = (stable, key) {
            self.note_latest(channel, key);
        }

        Ok(Latest {
            key,
            traces: trace.then_some(traces),
        })
    }

    // --- Retention ---

    /// Prune everything at or below `key`. Returns the resulting floor,
    /// which never exceeds the newest key the channel has issued.
    pub fn delete_before(&self, channel: &str, key: ContentKey) -> Result<Option<ContentKey>> {
        self.require_channel(channel)?;
        let Some(floor) = self.store.delete_before(channel, key, self.deadline())? else {
            return Ok(None);
        };

        self.floors
            .entry(channel.to_string())
            .and_modify(|cached| *cached = (*cached).max(floor))
            .or_insert(floor);
        self.latest.remove_if(channel, |_, latest| *latest <= floor);
        Ok(Some(floor))
    }

    /// Apply the channel's retention policy from a fresh config read.
    /// Returns the new floor when anything was pruned.
    pub fn enforce_retention(&self, channel: &str) -> Result<Option<ContentKey>> {
        let config = self.registry.get(channel, false)?;
        let deadline = self.deadline();

        let cutoff = match config.retention {
            RetentionPolicy::Forever => return Ok(None),
            RetentionPolicy::MaxAge { days } => {
                let oldest_kept = self
                    .clock
                    .now()
                    .minus(Duration::from_millis(u64::from(days) * MILLIS_PER_DAY));
                let mut traces = Traces::new();
                self.store.get_latest(
                    channel,
                    Some(ContentKey::last_at(oldest_kept)),
                    &mut traces,
                    deadline,
                )?
            }
            RetentionPolicy::MaxItems { count } => {
                let n = usize::try_from(count).unwrap_or(usize::MAX);
                self.store.nth_newest(channel, n, deadline)?
            }
        };

        let Some(key) = cutoff else {
            return Ok(None);
        };
        let floor = self.delete_before(channel, key)?;
        if let Some(floor) = floor {
            debug!(channel, %floor, "enforced retention");
        }
        Ok(floor)
    }

    /// Apply retention to every channel. A failing channel is logged and
    /// skipped. Returns how many channels were pruned.
    pub fn enforce_retention_all(&self) -> Result<usize> {
        let mut pruned = 0;
        for config in self.registry.list()? {
            match self.enforce_retention(&config.name) {
                Ok(Some(_)) => pruned += 1,
                Ok(None) => {}
                Err(e) => warn!(channel = %config.name, error = %e, "retention sweep failed"),
            }
        }
        Ok(pruned)
    }

    // --- Deletion ---

    /// Delete a channel and all of its content. Returns whether it
    /// existed.
    ///
    /// While this runs the channel is `Deleting`: inserts fail with
    /// `ChannelDeleting`, reads keep serving committed content.
    pub fn delete(&self, channel: &str) -> Result<bool> {
        validate_channel_name(channel)?;
        if !self.registry.exists(channel)? {
            return Ok(false);
        }
        if !self.begin_delete(channel) {
            return Err(HubError::ChannelDeleting(channel.to_string()));
        }

        let result = self.finish_delete(channel);
        self.deleting.remove(channel);
        let existed = result?;

        info!(channel, "deleted channel");
        Ok(existed)
    }

    /// Mark a channel as deleting. False if it already was.
    pub(crate) fn begin_delete(&self, channel: &str) -> bool {
        self.deleting.insert(channel.to_string())
    }

    fn finish_delete(&self, channel: &str) -> Result<bool> {
        let locks = self.locks(channel);
        let _writes = locks.writes.write();

        self.store.delete(channel, self.deadline())?;
        let existed = self.registry.delete(channel)?;
        self.latest.remove(channel);
        self.floors.remove(channel);
        self.locks.remove(channel);
        Ok(existed)
    }

    // --- Helpers ---

    fn deadline(&self) -> Deadline {
        Deadline::from_timeout(self.request_timeout)
    }

    fn locks(&self, channel: &str) -> Arc<ChannelLocks> {
        if let Some(locks) = self.locks.get(channel) {
            return Arc::clone(locks.value());
        }
        Arc::clone(self.locks.entry(channel.to_string()).or_default().value())
    }

    /// Cached config of a channel that may take writes.
    fn writable_config(&self, channel: &str) -> Result<ChannelConfig> {
        if self.deleting.contains(channel) {
            return Err(HubError::ChannelDeleting(channel.to_string()));
        }
        self.registry.get_cached(channel)
    }

    fn require_channel(&self, channel: &str) -> Result<()> {
        self.registry.get_cached(channel).map(|_| ())
    }

    fn note_latest(&self, channel: &str, key: ContentKey) {
        self.latest
            .entry(channel.to_string())
            .and_modify(|cached| *cached = (*cached).max(key))
            .or_insert(key);
    }

    fn cached_floor(&self, channel: &str) -> Option<ContentKey> {
        self.floors.get(channel).map(|floor| *floor)
    }

    fn below_floor(&self, channel: &str, key: ContentKey) -> bool {
        self.cached_floor(channel).map_or(false, |floor| key <= floor)
    }
}
