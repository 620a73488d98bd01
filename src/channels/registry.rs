//! Authoritative channel configuration with tag index.

use super::{validate_channel_name, validate_tag, ChannelCache};
use crate::backend::{Deadline, ScanRange, StorageBackend};
use crate::clock::Clock;
use crate::error::{HubError, Result};
use crate::types::ChannelConfig;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const CHANNELS_PARTITION: &str = "channels";
const TAGS_PARTITION: &str = "tags";

/// Tag index entries are `<tag>\0<channel>`.
fn tag_entry(tag: &str, channel: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(tag.len() + 1 + channel.len());
    key.extend_from_slice(tag.as_bytes());
    key.push(0);
    key.extend_from_slice(channel.as_bytes());
    key
}

fn split_tag_entry(raw: &[u8]) -> Option<(String, String)> {
    let pos = raw.iter().position(|&b| b == 0)?;
    let tag = String::from_utf8(raw[..pos].to_vec()).ok()?;
    let channel = String::from_utf8(raw[pos + 1..].to_vec()).ok()?;
    Some((tag, channel))
}

/// Create, read, update and delete channel configs.
///
/// Reads may be served from the injected [`ChannelCache`]; every
/// successful write invalidates the name it touched.
///
/// Tag index entries are written before the config that carries the tag
/// and removed only after the config that drops it, so the index is
/// always a superset of the stored tags. Readers check every entry
/// against the config and ignore leftovers from failed writes.
pub struct ChannelRegistry {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    cache: Arc<ChannelCache>,
    /// Names deleted during this registry's lifetime.
    retired: RwLock<HashSet<String>>,
    request_timeout: Option<Duration>,
}

impl ChannelRegistry {
    /// Create a registry over `backend`. Reads and writes use
    /// `request_timeout` as their deadline.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        cache: Arc<ChannelCache>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            backend,
            clock,
            cache,
            retired: RwLock::new(HashSet::new()),
            request_timeout,
        }
    }

    /// The config cache shared with other readers.
    pub fn cache(&self) -> &ChannelCache {
        &self.cache
    }

    fn deadline(&self) -> Deadline {
        Deadline::from_timeout(self.request_timeout)
    }

    /// Register a new channel. The creation time is stamped here.
    pub fn create(&self, config: ChannelConfig) -> Result<ChannelConfig> {
        validate_channel_name(&config.name)?;
        for tag in &config.tags {
            validate_tag(tag)?;
        }
        if self.retired.read().contains(&config.name) {
            return Err(HubError::AlreadyExists(format!(
                "channel {} (name retired after deletion)",
                config.name
            )));
        }

        let deadline = self.deadline();
        let mut config = config;
        config.created = self.clock.now();
        let encoded = rmp_serde::to_vec(&config)?;

        for tag in &config.tags {
            self.backend
                .put(TAGS_PARTITION, &tag_entry(tag, &config.name), Vec::new(), deadline)?;
        }
        let created = self.backend.compare_and_swap(
            CHANNELS_PARTITION,
            config.name.as_bytes(),
            None,
            encoded,
            deadline,
        )?;
        if !created {
            return Err(HubError::AlreadyExists(format!("channel {}", config.name)));
        }
        self.cache.invalidate(&config.name);

        info!(channel = %config.name, tags = config.tags.len(), "created channel");
        Ok(config)
    }

    /// Look a channel up. `allow_cache = false` forces a backend read.
    pub fn get(&self, name: &str, allow_cache: bool) -> Result<ChannelConfig> {
        validate_channel_name(name)?;
        if allow_cache {
            if let Some(config) = self.cache.get(name) {
                return Ok(config);
            }
        }

        let generation = self.cache.generation(name);
        let config = self
            .read_stored(name, self.deadline())?
            .map(|(config, _)| config)
            .ok_or_else(|| HubError::ChannelNotFound(name.to_string()))?;
        self.cache.insert(config.clone(), generation);
        Ok(config)
    }

    /// [`get`](Self::get) with the cache allowed.
    pub fn get_cached(&self, name: &str) -> Result<ChannelConfig> {
        self.get(name, true)
    }

    /// Whether the channel exists, answered from the cache when possible.
    pub fn exists(&self, name: &str) -> Result<bool> {
        match self.get(name, true) {
            Ok(_) => Ok(true),
            Err(HubError::ChannelNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the channel mirrors an upstream source.
    pub fn is_replicating(&self, name: &str) -> Result<bool> {
        Ok(self.get(name, true)?.is_replicating())
    }

    /// Replace `old` with `new`, failing with `Conflict` if the stored
    /// config is no longer `old`.
    pub fn update(&self, new: ChannelConfig, old: &ChannelConfig) -> Result<ChannelConfig> {
        validate_channel_name(&new.name)?;
        if new.name != old.name {
            return Err(HubError::InvalidRequest(format!(
                "channel name is immutable ({} -> {})",
                old.name, new.name
            )));
        }
        for tag in &new.tags {
            validate_tag(tag)?;
        }

        let deadline = self.deadline();
        let (stored, stored_raw) = self
            .read_stored(&old.name, deadline)?
            .ok_or_else(|| HubError::ChannelNotFound(old.name.clone()))?;
        if &stored != old {
            self.cache.invalidate(&old.name);
            return Err(HubError::Conflict(format!(
                "channel {} changed since it was read",
                old.name
            )));
        }

        let mut new = new;
        new.created = stored.created;
        for tag in new.tags.difference(&stored.tags) {
            self.backend
                .put(TAGS_PARTITION, &tag_entry(tag, &new.name), Vec::new(), deadline)?;
        }
        let swapped = self.backend.compare_and_swap(
            CHANNELS_PARTITION,
            new.name.as_bytes(),
            Some(&stored_raw),
            rmp_serde::to_vec(&new)?,
            deadline,
        )?;
        self.cache.invalidate(&new.name);
        if !swapped {
            return Err(HubError::Conflict(format!(
                "channel {} changed during update",
                new.name
            )));
        }

        let dropped: Vec<&String> = stored.tags.difference(&new.tags).collect();
        self.remove_tag_entries(&new.name, dropped, deadline);

        info!(channel = %new.name, "updated channel");
        Ok(new)
    }

    /// Remove a channel config. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        validate_channel_name(name)?;
        let deadline = self.deadline();
        let Some((stored, _)) = self.read_stored(name, deadline)? else {
            self.cache.invalidate(name);
            return Ok(false);
        };

        self.backend
            .delete(CHANNELS_PARTITION, name.as_bytes(), deadline)?;
        self.retired.write().insert(name.to_string());
        self.cache.invalidate(name);
        self.remove_tag_entries(name, &stored.tags, deadline);

        info!(channel = name, "deleted channel config");
        Ok(true)
    }

    /// All channels, ordered by name.
    pub fn list(&self) -> Result<Vec<ChannelConfig>> {
        self.backend
            .scan(CHANNELS_PARTITION, &ScanRange::all(), false, None, self.deadline())?
            .into_iter()
            .map(|(_, raw)| Ok(rmp_serde::from_slice(&raw)?))
            .collect()
    }

    /// Channels carrying `tag`, ordered by name.
    pub fn list_by_tag(&self, tag: &str) -> Result<Vec<ChannelConfig>> {
        validate_tag(tag)?;
        let prefix = tag_entry(tag, "");
        let entries = self.backend.scan(
            TAGS_PARTITION,
            &ScanRange::prefix(&prefix),
            false,
            None,
            self.deadline(),
        )?;

        let mut configs = Vec::with_capacity(entries.len());
        for (raw, _) in entries {
            let Some((_, channel)) = split_tag_entry(&raw) else {
                continue;
            };
            match self.get(&channel, true) {
                Ok(config) if config.tags.contains(tag) => configs.push(config),
                // Left behind by a failed or unfinished write.
                Ok(_) | Err(HubError::ChannelNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(configs)
    }

    /// Every tag carried by some channel, sorted and unique.
    pub fn list_tags(&self) -> Result<Vec<String>> {
        let tags: BTreeSet<String> = self
            .list()?
            .into_iter()
            .flat_map(|config| config.tags)
            .collect();
        Ok(tags.into_iter().collect())
    }

    /// Best effort: a failure leaves entries that readers skip.
    fn remove_tag_entries<'a, I>(&self, channel: &str, tags: I, deadline: Deadline)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            if let Err(e) = self
                .backend
                .delete(TAGS_PARTITION, &tag_entry(tag, channel), deadline)
            {
                warn!(channel, tag = %tag, error = %e, "left stale tag index entry");
            }
        }
    }

    fn read_stored(&self, name: &str, deadline: Deadline) -> Result<Option<(ChannelConfig, Vec<u8>)>> {
        match self.backend.get(CHANNELS_PARTITION, name.as_bytes(), deadline)? {
            Some(raw) => Ok(Some((rmp_serde::from_slice(&raw)?, raw))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFault, Entry, MemoryBackend};
    use crate::clock::ManualClock;
    use crate::types::{RetentionPolicy, Timestamp};
    use parking_lot::Mutex;

    type Hook = Box<dyn FnOnce() + Send>;

    /// Runs a hook once, right after the next config read returns.
    struct HookedBackend {
        inner: Arc<MemoryBackend>,
        after_config_read: Mutex<Option<Hook>>,
    }

    impl StorageBackend for HookedBackend {
        fn get(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<Option<Vec<u8>>> {
            let value = self.inner.get(partition, key, deadline)?;
            if partition == CHANNELS_PARTITION {
                if let Some(hook) = self.after_config_read.lock().take() {
                    hook();
                }
            }
            Ok(value)
        }

        fn put(&self, partition: &str, key: &[u8], value: Vec<u8>, deadline: Deadline) -> Result<()> {
            self.inner.put(partition, key, value, deadline)
        }

        fn compare_and_swap(
            &self,
            partition: &str,
            key: &[u8],
            expected: Option<&[u8]>,
            new: Vec<u8>,
            deadline: Deadline,
        ) -> Result<bool> {
            self.inner.compare_and_swap(partition, key, expected, new, deadline)
        }

        fn delete(&self, partition: &str, key: &[u8], deadline: Deadline) -> Result<bool> {
            self.inner.delete(partition, key, deadline)
        }

        fn delete_range(&self, partition: &str, range: &ScanRange, deadline: Deadline) -> Result<u64> {
            self.inner.delete_range(partition, range, deadline)
        }

        fn scan(
            &self,
            partition: &str,
            range: &ScanRange,
            reverse: bool,
            limit: Option<usize>,
            deadline: Deadline,
        ) -> Result<Vec<Entry>> {
            self.inner.scan(partition, range, reverse, limit, deadline)
        }
    }

    fn registry() -> (ChannelRegistry, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Timestamp(42)));
        let cache = Arc::new(ChannelCache::new(100, 4, Duration::from_secs(60)));
        (
            ChannelRegistry::new(backend.clone(), clock, cache, None),
            backend,
        )
    }

    #[test]
    fn test_create_and_get() {
        let (registry, _) = registry();
        let created = registry
            .create(ChannelConfig::new("weather").with_tag("noaa"))
            .unwrap();
        assert_eq!(created.created, Timestamp(42));

        let fetched = registry.get("weather", false).unwrap();
        assert_eq!(fetched, created);
        assert!(registry.exists("weather").unwrap());
        assert!(!registry.exists("other").unwrap());
    }

    #[test]
    fn test_duplicate_create() {
        let (registry, _) = registry();
        registry.create(ChannelConfig::new("weather")).unwrap();
        let err = registry.create(ChannelConfig::new("weather")).unwrap_err();
        assert!(matches!(err, HubError::AlreadyExists(_)));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.create(ChannelConfig::new("bad name")),
            Err(HubError::InvalidChannelName(_))
        ));
        assert!(matches!(
            registry.create(ChannelConfig::new("ok").with_tag("bad tag")),
            Err(HubError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_cached_read_survives_backend_outage() {
        let (registry, backend) = registry();
        registry.create(ChannelConfig::new("weather")).unwrap();
        registry.get("weather", true).unwrap();

        backend.inject(BackendFault::Unavailable);
        assert!(registry.get("weather", true).is_ok());
        assert!(registry.get("weather", false).is_err());
    }

    #[test]
    fn test_update_with_stale_old_conflicts() {
        let (registry, _) = registry();
        let v1 = registry.create(ChannelConfig::new("weather")).unwrap();

        let v2 = registry
            .update(v1.clone().with_tag("a"), &v1)
            .unwrap();
        assert!(v2.tags.contains("a"));

        // A second writer still holding v1 loses.
        let err = registry
            .update(
                v1.clone().with_retention(RetentionPolicy::MaxAge { days: 3 }),
                &v1,
            )
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
        assert_eq!(registry.get("weather", false).unwrap(), v2);
    }

    #[test]
    fn test_update_invalidates_cache_and_preserves_created() {
        let (registry, _) = registry();
        let v1 = registry.create(ChannelConfig::new("weather")).unwrap();
        registry.get("weather", true).unwrap();

        let mut changed = v1.clone().with_description("hourly");
        changed.created = Timestamp(9_999);
        let v2 = registry.update(changed, &v1).unwrap();

        assert_eq!(v2.created, v1.created);
        assert_eq!(registry.get("weather", true).unwrap().description, "hourly");
    }

    #[test]
    fn test_rename_is_rejected() {
        let (registry, _) = registry();
        let v1 = registry.create(ChannelConfig::new("weather")).unwrap();
        let err = registry
            .update(ChannelConfig::new("climate"), &v1)
            .unwrap_err();
        assert!(matches!(err, HubError::InvalidRequest(_)));
    }

    #[test]
    fn test_tag_index_follows_updates() {
        let (registry, _) = registry();
        let a = registry
            .create(ChannelConfig::new("a").with_tags(["x", "y"]))
            .unwrap();
        registry
            .create(ChannelConfig::new("b").with_tag("y"))
            .unwrap();

        assert_eq!(registry.list_tags().unwrap(), vec!["x", "y"]);
        let names = |tag: &str| -> Vec<String> {
            registry
                .list_by_tag(tag)
                .unwrap()
                .into_iter()
                .map(|c| c.name)
                .collect()
        };
        assert_eq!(names("y"), vec!["a", "b"]);

        let mut retagged = a.clone();
        retagged.tags = ["z".to_string()].into_iter().collect();
        registry.update(retagged, &a).unwrap();

        assert_eq!(names("x"), Vec::<String>::new());
        assert_eq!(names("y"), vec!["b"]);
        assert_eq!(names("z"), vec!["a"]);
        assert_eq!(registry.list_tags().unwrap(), vec!["y", "z"]);
    }

    #[test]
    fn test_delete_retires_name() {
        let (registry, _) = registry();
        registry
            .create(ChannelConfig::new("weather").with_tag("t"))
            .unwrap();
        registry.get("weather", true).unwrap();

        assert!(registry.delete("weather").unwrap());
        assert!(!registry.delete("weather").unwrap());
        assert!(matches!(
            registry.get("weather", true),
            Err(HubError::ChannelNotFound(_))
        ));
        assert!(registry.list_tags().unwrap().is_empty());
        assert!(matches!(
            registry.create(ChannelConfig::new("weather")),
            Err(HubError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_delete_during_uncached_read_is_not_cached() {
        let inner = Arc::new(MemoryBackend::new());
        let backend = Arc::new(HookedBackend {
            inner: inner.clone(),
            after_config_read: Mutex::new(None),
        });
        let clock = Arc::new(ManualClock::new(Timestamp(42)));
        let cache = Arc::new(ChannelCache::new(100, 4, Duration::from_secs(60)));
        let registry = ChannelRegistry::new(backend.clone(), clock.clone(), cache.clone(), None);
        let writer = ChannelRegistry::new(inner, clock, cache, None);
        registry.create(ChannelConfig::new("weather")).unwrap();

        // The delete completes between the backend read and the cache fill.
        *backend.after_config_read.lock() = Some(Box::new(move || {
            assert!(writer.delete("weather").unwrap());
        }));
        assert!(registry.get("weather", true).is_ok());

        assert!(registry.cache().get("weather").is_none());
        assert!(matches!(
            registry.get("weather", true),
            Err(HubError::ChannelNotFound(_))
        ));
    }

    #[test]
    fn test_failed_create_leaves_no_channel_and_can_retry() {
        let (registry, backend) = registry();
        backend.inject(BackendFault::FailPutsAfter(1));
        let config = ChannelConfig::new("weather").with_tags(["x", "y"]);
        assert!(matches!(
            registry.create(config.clone()),
            Err(HubError::StorageUnavailable { .. })
        ));

        backend.clear_faults();
        assert!(!registry.exists("weather").unwrap());
        assert!(registry.list_by_tag("x").unwrap().is_empty());
        assert!(registry.list_tags().unwrap().is_empty());

        registry.create(config).unwrap();
        for tag in ["x", "y"] {
            let names: Vec<_> = registry
                .list_by_tag(tag)
                .unwrap()
                .into_iter()
                .map(|c| c.name)
                .collect();
            assert_eq!(names, vec!["weather"]);
        }
    }

    #[test]
    fn test_failed_update_keeps_index_consistent() {
        let (registry, backend) = registry();
        let v1 = registry
            .create(ChannelConfig::new("weather").with_tag("a"))
            .unwrap();

        let mut retagged = v1.clone();
        retagged.tags = ["b".to_string(), "c".to_string()].into_iter().collect();
        backend.inject(BackendFault::FailPutsAfter(1));
        assert!(registry.update(retagged.clone(), &v1).is_err());
        backend.clear_faults();

        let stored = registry.get("weather", false).unwrap();
        assert_eq!(stored, v1);
        for tag in ["a", "b", "c"] {
            let listed = !registry.list_by_tag(tag).unwrap().is_empty();
            assert_eq!(listed, stored.tags.contains(tag), "tag {tag}");
        }
        assert_eq!(registry.list_tags().unwrap(), vec!["a"]);

        registry.update(retagged, &v1).unwrap();
        assert!(registry.list_by_tag("a").unwrap().is_empty());
        assert_eq!(registry.list_by_tag("b").unwrap().len(), 1);
        assert_eq!(registry.list_by_tag("c").unwrap().len(), 1);
        assert_eq!(registry.list_tags().unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn test_list_is_ordered() {
        let (registry, _) = registry();
        for name in ["c", "a", "b"] {
            registry.create(ChannelConfig::new(name)).unwrap();
        }
        let names: Vec<_> = registry.list().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
