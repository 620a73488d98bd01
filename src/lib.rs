//! # Content Hub
//!
//! A multi-tenant store of ordered, immutable content, organised into
//! named channels, with a registry of durable group subscriptions.
//!
//! ## Core Concepts
//!
//! - **Channels**: Named streams with tags, a retention policy and an
//!   optional replication source
//! - **Content keys**: Millisecond timestamp plus sequence; strictly
//!   increasing per channel and never reused
//! - **Queries**: Lazy time-range scans and next/previous navigation, with
//!   an optional settling window that hides still-arriving items
//! - **Retention**: A monotonic per-channel floor below which nothing is
//!   visible
//! - **Groups**: Subscriptions bound permanently to one channel URL
//!
//! ## Example
//!
//! ```ignore
//! use contenthub::{ChannelConfig, Content, Hub, HubConfig, TimeQuery};
//!
//! let hub = Hub::in_memory(HubConfig::default());
//! hub.channels().create_channel(ChannelConfig::new("weather"))?;
//!
//! let key = hub.channels().insert("weather", &Content::new("sunny"))?;
//! let latest = hub.channels().get_latest("weather", false, false)?;
//! assert_eq!(latest.key, Some(key));
//!
//! for key in hub.channels().query_by_time(&TimeQuery::all("weather"))? {
//!     println!("{}", key?);
//! }
//! ```

pub mod backend;
pub mod channels;
pub mod clock;
pub mod config;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod groups;
pub mod hub;
pub mod types;

// Re-exports
pub use backend::{BackendFault, Deadline, FileBackend, MemoryBackend, ScanRange, StorageBackend};
pub use channels::{validate_channel_name, ChannelCache, ChannelRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FileBackendConfig, HubConfig};
pub use content::{ContentStore, KeyScan, KeySequencer};
pub use coordinator::ChannelCoordinator;
pub use error::{HubError, Result};
pub use groups::{
    DefaultGroupValidator, Group, GroupEvent, GroupRegistry, GroupValidator, GroupWatch, WatchId,
};
pub use hub::Hub;
pub use types::{
    BulkContent, ChannelConfig, ChannelState, Content, ContentKey, Direction, DirectionQuery,
    Latest, RetentionPolicy, TimeQuery, Timestamp, TraceEntry, Traces,
};
