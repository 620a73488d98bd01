//! One-call assembly of every hub component around a shared backend.

use crate::backend::{FileBackend, MemoryBackend, StorageBackend};
use crate::channels::{ChannelCache, ChannelRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::{FileBackendConfig, HubConfig};
use crate::content::ContentStore;
use crate::coordinator::ChannelCoordinator;
use crate::error::Result;
use crate::groups::{DefaultGroupValidator, GroupRegistry, GroupValidator};
use std::sync::Arc;
use tracing::info;

/// The content hub.
///
/// Thread safety: `Hub` is `Send + Sync`; share it behind an `Arc`.
pub struct Hub {
    config: HubConfig,
    backend: Arc<dyn StorageBackend>,
    file: Option<Arc<FileBackend>>,
    channels: ChannelCoordinator,
    groups: GroupRegistry,
}

impl Hub {
    /// A hub whose state lives only in memory.
    pub fn in_memory(config: HubConfig) -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()), Arc::new(SystemClock), config)
    }

    /// A durable hub stored in `file_config.path`.
    pub fn open(file_config: FileBackendConfig, config: HubConfig) -> Result<Self> {
        let file = Arc::new(FileBackend::open(file_config)?);
        info!(path = %file.path().display(), "opened hub");

        let mut hub = Self::with_backend(file.clone(), Arc::new(SystemClock), config);
        hub.file = Some(file);
        Ok(hub)
    }

    /// Assemble a hub from explicit parts.
    pub fn with_backend(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        config: HubConfig,
    ) -> Self {
        Self::with_validator(backend, clock, Arc::new(DefaultGroupValidator), config)
    }

    pub fn with_validator(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        validator: Arc<dyn GroupValidator>,
        config: HubConfig,
    ) -> Self {
        let cache = Arc::new(ChannelCache::new(
            config.channel_cache_capacity,
            config.channel_cache_stripes,
            config.channel_cache_ttl(),
        ));
        let registry = Arc::new(ChannelRegistry::new(
            Arc::clone(&backend),
            Arc::clone(&clock),
            cache,
            config.request_timeout(),
        ));
        let store = Arc::new(ContentStore::new(
            Arc::clone(&backend),
            Arc::clone(&clock),
            &config,
        ));
        let channels = ChannelCoordinator::new(registry, store, clock, &config);
        let groups = GroupRegistry::new(Arc::clone(&backend), validator, &config);

        Self {
            config,
            backend,
            file: None,
            channels,
            groups,
        }
    }

    /// Channel configuration and content operations.
    pub fn channels(&self) -> &ChannelCoordinator {
        &self.channels
    }

    /// Group registry.
    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    /// Direct access to the content store, bypassing channel checks.
    pub fn content(&self) -> &ContentStore {
        self.channels.store()
    }

    /// Backend shared by every component.
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Configuration the hub was built with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Rewrite the durable log with only live state. A no-op for
    /// in-memory hubs.
    pub fn compact(&self) -> Result<()> {
        match &self.file {
            Some(file) => file.compact(),
            None => Ok(()),
        }
    }
}
