//! Durable group registry with change notifications.

use super::types::{Group, GroupEvent, GroupWatch, WatchId};
use super::GroupValidator;
use crate::backend::{Deadline, ScanRange, StorageBackend};
use crate::config::HubConfig;
use crate::error::{HubError, Result};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const GROUPS_PARTITION: &str = "groups";

/// CRUD over named groups.
pub struct GroupRegistry {
    backend: Arc<dyn StorageBackend>,
    validator: Arc<dyn GroupValidator>,
    watchers: RwLock<HashMap<WatchId, Sender<GroupEvent>>>,
    next_watch: AtomicU64,
    watch_buffer: usize,
    max_cas_retries: usize,
    request_timeout: Option<Duration>,
}

impl GroupRegistry {
    /// Create a registry; watch buffers are sized from `config`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        validator: Arc<dyn GroupValidator>,
        config: &HubConfig,
    ) -> Self {
        Self {
            backend,
            validator,
            watchers: RwLock::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
            watch_buffer: config.group_watch_buffer.max(1),
            max_cas_retries: config.max_cas_retries.max(1),
            request_timeout: config.request_timeout(),
        }
    }

    /// Insert or update a group. Returns the group it replaced.
    ///
    /// An existing group keeps its channel URL forever; an upsert that
    /// changes it fails with `Conflict`.
    pub fn upsert(&self, group: Group) -> Result<Option<Group>> {
        self.validator.validate(&group)?;
        let deadline = self.deadline();

        for _ in 0..self.max_cas_retries {
            let raw = self
                .backend
                .get(GROUPS_PARTITION, group.name.as_bytes(), deadline)?;
            let previous: Option<Group> = raw
                .as_deref()
                .map(rmp_serde::from_slice)
                .transpose()?;

            if let Some(previous) = &previous {
                if previous.channel_url != group.channel_url {
                    return Err(HubError::Conflict(format!(
                        "channel binding of group {} is immutable ({} -> {})",
                        group.name, previous.channel_url, group.channel_url
                    )));
                }
                if previous == &group {
                    debug!(group = %group.name, "upsert group unchanged");
                    return Ok(Some(previous.clone()));
                }
            }

            let swapped = self.backend.compare_and_swap(
                GROUPS_PARTITION,
                group.name.as_bytes(),
                raw.as_deref(),
                rmp_serde::to_vec(&group)?,
                deadline,
            )?;
            if swapped {
                info!(
                    group = %group.name,
                    channel = %group.channel_url,
                    created = previous.is_none(),
                    "upsert group"
                );
                self.broadcast(GroupEvent::Upserted {
                    group,
                    previous: previous.clone(),
                });
                return Ok(previous);
            }
        }

        warn!(group = %group.name, retries = self.max_cas_retries, "gave up upserting group");
        Err(HubError::Conflict(format!(
            "group {} kept changing during upsert",
            group.name
        )))
    }

    /// The named group, if it exists.
    pub fn get(&self, name: &str) -> Result<Option<Group>> {
        self.backend
            .get(GROUPS_PARTITION, name.as_bytes(), self.deadline())?
            .map(|raw| Ok(rmp_serde::from_slice(&raw)?))
            .transpose()
    }

    /// All groups, ordered by name.
    pub fn list(&self) -> Result<Vec<Group>> {
        self.backend
            .scan(GROUPS_PARTITION, &ScanRange::all(), false, None, self.deadline())?
            .into_iter()
            .map(|(_, raw)| Ok(rmp_serde::from_slice(&raw)?))
            .collect()
    }

    /// Groups bound to `channel_url`.
    pub fn groups_for_channel(&self, channel_url: &str) -> Result<Vec<Group>> {
        let mut groups = self.list()?;
        groups.retain(|g| g.channel_url == channel_url);
        Ok(groups)
    }

    /// Remove a group. Deleting an absent group is not an error; the
    /// return value says whether anything was removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let removed = self
            .backend
            .delete(GROUPS_PARTITION, name.as_bytes(), self.deadline())?;
        if removed {
            info!(group = name, "deleted group");
            self.broadcast(GroupEvent::Deleted {
                name: name.to_string(),
            });
        }
        Ok(removed)
    }

    // --- Watching ---

    /// Follow group changes from now on.
    pub fn watch(&self) -> GroupWatch {
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.watch_buffer);
        self.watchers.write().insert(id, sender);
        GroupWatch { id, receiver }
    }

    /// Stop delivering events to a watcher.
    pub fn unwatch(&self, id: WatchId) {
        self.watchers.write().remove(&id);
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> usize {
        self.watchers.read().len()
    }

    /// Send to every watcher; watchers with a full buffer are dropped.
    fn broadcast(&self, event: GroupEvent) {
        let mut to_remove = Vec::new();
        {
            let watchers = self.watchers.read();
            for (id, sender) in watchers.iter() {
                if sender.try_send(event.clone()).is_err() {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut watchers = self.watchers.write();
            for id in to_remove {
                if let Some(sender) = watchers.remove(&id) {
                    warn!(watch = id.0, "dropped slow group watcher");
                    let _ = sender.try_send(GroupEvent::Dropped);
                }
            }
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::from_timeout(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendFault, MemoryBackend};
    use crate::groups::DefaultGroupValidator;

    const X: &str = "http://hub/channel/X";
    const Y: &str = "http://hub/channel/Y";

    fn registry_with(config: HubConfig) -> (GroupRegistry, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = GroupRegistry::new(backend.clone(), Arc::new(DefaultGroupValidator), &config);
        (registry, backend)
    }

    fn registry() -> GroupRegistry {
        registry_with(HubConfig::default()).0
    }

    fn g1(channel_url: &str) -> Group {
        Group::new("g1", channel_url, "http://client/callback")
    }

    #[test]
    fn test_binding_is_immutable() {
        let registry = registry();
        assert_eq!(registry.upsert(g1(X)).unwrap(), None);

        let err = registry.upsert(g1(Y)).unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));

        let previous = registry.upsert(g1(X).with_batch_size(5)).unwrap();
        assert_eq!(previous, Some(g1(X)));
        assert_eq!(registry.get("g1").unwrap().unwrap().batch_size, 5);
    }

    #[test]
    fn test_identical_upsert_returns_previous() {
        let registry = registry();
        registry.upsert(g1(X)).unwrap();
        assert_eq!(registry.upsert(g1(X)).unwrap(), Some(g1(X)));
    }

    #[test]
    fn test_invalid_group_touches_nothing() {
        let (registry, backend) = registry_with(HubConfig::default());
        backend.inject(BackendFault::Unavailable);
        let err = registry.upsert(g1("not a url")).unwrap_err();
        assert!(matches!(err, HubError::InvalidRequest(_)));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let registry = registry();
        registry.upsert(g1(X)).unwrap();
        assert!(registry.delete("g1").unwrap());
        assert!(!registry.delete("g1").unwrap());
        assert_eq!(registry.get("g1").unwrap(), None);
    }

    #[test]
    fn test_list_and_groups_for_channel() {
        let registry = registry();
        registry.upsert(g1(X)).unwrap();
        registry
            .upsert(Group::new("g2", Y, "http://client/other"))
            .unwrap();
        registry
            .upsert(Group::new("g0", X, "http://client/zero"))
            .unwrap();

        let names: Vec<_> = registry.list().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["g0", "g1", "g2"]);

        let on_x: Vec<_> = registry
            .groups_for_channel(X)
            .unwrap()
            .into_iter()
            .map(|g| g.name)
            .collect();
        assert_eq!(on_x, vec!["g0", "g1"]);
    }

    #[test]
    fn test_watch_sees_changes() {
        let registry = registry();
        let watch = registry.watch();

        registry.upsert(g1(X)).unwrap();
        registry.upsert(g1(X).with_paused(true)).unwrap();
        registry.delete("g1").unwrap();

        let timeout = Duration::from_millis(100);
        assert_eq!(
            watch.recv_timeout(timeout).unwrap(),
            GroupEvent::Upserted {
                group: g1(X),
                previous: None
            }
        );
        assert_eq!(
            watch.recv_timeout(timeout).unwrap(),
            GroupEvent::Upserted {
                group: g1(X).with_paused(true),
                previous: Some(g1(X))
            }
        );
        assert_eq!(
            watch.recv_timeout(timeout).unwrap(),
            GroupEvent::Deleted { name: "g1".into() }
        );
        assert!(watch.try_recv().is_err());
    }

    #[test]
    fn test_slow_watcher_is_dropped() {
        let (registry, _) = registry_with(HubConfig {
            group_watch_buffer: 2,
            ..Default::default()
        });
        let _watch = registry.watch();

        for i in 0..5 {
            registry
                .upsert(Group::new(format!("g{i}"), X, "http://client/cb"))
                .unwrap();
        }
        assert_eq!(registry.watcher_count(), 0);
    }

    #[test]
    fn test_unwatch() {
        let registry = registry();
        let watch = registry.watch();
        assert_eq!(registry.watcher_count(), 1);
        registry.unwatch(watch.id);
        assert_eq!(registry.watcher_count(), 0);
    }
}
