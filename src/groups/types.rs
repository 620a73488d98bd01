//! Group subscription types.

use serde::{Deserialize, Serialize};

/// A durable subscription bound to one channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Unique.
    pub name: String,

    /// Channel the group follows. Immutable once the group exists.
    pub channel_url: String,

    /// Where the dispatcher delivers new content.
    pub callback_url: String,

    /// Concurrent deliveries in flight.
    /// Default: 1
    pub parallel_calls: u32,

    /// Keys per delivery.
    /// Default: 1
    pub batch_size: u32,

    pub paused: bool,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        channel_url: impl Into<String>,
        callback_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            channel_url: channel_url.into(),
            callback_url: callback_url.into(),
            parallel_calls: 1,
            batch_size: 1,
            paused: false,
        }
    }

    pub fn with_parallel_calls(mut self, parallel_calls: u32) -> Self {
        self.parallel_calls = parallel_calls;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = paused;
        self
    }

    /// Name of the channel the URL points at, if it is well formed.
    pub fn channel_name(&self) -> Option<&str> {
        super::channel_from_url(&self.channel_url)
    }
}

/// Change to the set of groups.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    /// A group was created (`previous` is `None`) or changed.
    Upserted {
        group: Group,
        previous: Option<Group>,
    },

    Deleted { name: String },

    /// The watcher fell behind and was disconnected.
    Dropped,
}

/// Unique identifier for a watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Receiving end of a group watch.
pub struct GroupWatch {
    pub id: WatchId,
    pub receiver: crossbeam_channel::Receiver<GroupEvent>,
}

impl GroupWatch {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<GroupEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<GroupEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<GroupEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
