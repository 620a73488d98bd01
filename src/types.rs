//! Core types for the content hub.

use crate::error::HubError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as u64)
    }

    pub fn millis(self) -> u64 {
        self.0
    }

    pub fn plus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn minus(self, d: Duration) -> Self {
        Timestamp(self.0.saturating_sub(d.as_millis() as u64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identifier of one content item within a channel.
///
/// Keys order by timestamp, then by sequence. Within one channel no two
/// committed items share a key, and a key is never issued twice.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ContentKey {
    pub millis: u64,
    pub sequence: u32,
}

impl ContentKey {
    /// Width of the binary encoding.
    pub const ENCODED_LEN: usize = 12;

    pub const MIN: ContentKey = ContentKey {
        millis: 0,
        sequence: 0,
    };

    pub const MAX: ContentKey = ContentKey {
        millis: u64::MAX,
        sequence: u32::MAX,
    };

    pub fn new(millis: u64, sequence: u32) -> Self {
        Self { millis, sequence }
    }

    /// Smallest key at the given instant.
    pub fn first_at(ts: Timestamp) -> Self {
        Self::new(ts.0, 0)
    }

    /// Largest key at the given instant.
    pub fn last_at(ts: Timestamp) -> Self {
        Self::new(ts.0, u32::MAX)
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp(self.millis)
    }

    /// The next key in total order, or `None` for [`ContentKey::MAX`].
    pub fn successor(self) -> Option<Self> {
        if self.sequence < u32::MAX {
            Some(Self::new(self.millis, self.sequence + 1))
        } else {
            self.millis.checked_add(1).map(|millis| Self::new(millis, 0))
        }
    }

    /// Big-endian encoding; byte order equals key order.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.millis.to_be_bytes());
        out[8..].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut millis = [0u8; 8];
        let mut sequence = [0u8; 4];
        millis.copy_from_slice(&bytes[..8]);
        sequence.copy_from_slice(&bytes[8..]);
        Some(Self::new(u64::from_be_bytes(millis), u32::from_be_bytes(sequence)))
    }

    /// Fixed-width lowercase hex. Two encoded keys compare as strings
    /// exactly as the keys compare.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({}:{})", self.millis, self.sequence)
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ContentKey {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HubError::InvalidRequest(format!("malformed content key: {s:?}"));

        if s.len() != Self::ENCODED_LEN * 2
            || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(invalid());
        }
        let bytes = hex::decode(s).map_err(|_| invalid())?;
        Self::from_bytes(&bytes).ok_or_else(invalid)
    }
}

/// An opaque payload with metadata.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Content {
    pub content_type: Option<String>,
    pub data: Vec<u8>,
    /// Ask downstream collaborators to trace this item.
    pub trace: bool,
    /// Assigned key. Set by the caller only for replicated content, which
    /// keeps the key it had at its source.
    pub key: Option<ContentKey>,
}

impl Content {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_key(mut self, key: ContentKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A batch of items bound for one channel.
#[derive(Clone, Debug, Default)]
pub struct BulkContent {
    pub channel: String,
    pub items: Vec<Content>,
}

impl BulkContent {
    pub fn new(channel: impl Into<String>, items: Vec<Content>) -> Self {
        Self {
            channel: channel.into(),
            items,
        }
    }
}

/// How long a channel keeps its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Forever,
    /// Prune items older than this many days.
    MaxAge { days: u32 },
    /// Keep only the newest `count` items.
    MaxItems { count: u64 },
}

/// Channel configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Unique, immutable.
    pub name: String,
    pub tags: BTreeSet<String>,
    pub retention: RetentionPolicy,
    /// External source this channel mirrors, if any.
    pub replication_source: Option<String>,
    pub description: String,
    /// Stamped by the registry on creation.
    pub created: Timestamp,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeSet::new(),
            retention: RetentionPolicy::Forever,
            replication_source: None,
            description: String::new(),
            created: Timestamp::default(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_replication_source(mut self, source: impl Into<String>) -> Self {
        self.replication_source = Some(source.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn is_replicating(&self) -> bool {
        self.replication_source.is_some()
    }
}

/// Scan direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

/// Keys in an absolute time range.
///
/// Forward queries cover `[start, end)`, backward queries `(start, end]`.
/// A missing `end` leaves the range open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeQuery {
    pub channel: String,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub direction: Direction,
    /// Stop short of the settling window.
    pub stable: bool,
}

impl TimeQuery {
    pub fn new(channel: impl Into<String>, start: Timestamp) -> Self {
        Self {
            channel: channel.into(),
            start,
            end: None,
            direction: Direction::Forward,
            stable: false,
        }
    }

    /// Everything the channel holds.
    pub fn all(channel: impl Into<String>) -> Self {
        Self::new(channel, Timestamp(0))
    }

    pub fn until(mut self, end: Timestamp) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }
}

/// Up to `count` keys strictly after (or before) `from`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectionQuery {
    pub channel: String,
    pub from: ContentKey,
    pub count: usize,
    pub direction: Direction,
    pub stable: bool,
}

impl DirectionQuery {
    pub fn next(channel: impl Into<String>, from: ContentKey, count: usize) -> Self {
        Self {
            channel: channel.into(),
            from,
            count,
            direction: Direction::Forward,
            stable: false,
        }
    }

    pub fn previous(channel: impl Into<String>, from: ContentKey, count: usize) -> Self {
        Self {
            direction: Direction::Backward,
            ..Self::next(channel, from, count)
        }
    }

    pub fn with_stable(mut self, stable: bool) -> Self {
        self.stable = stable;
        self
    }
}

/// One diagnostic timing entry.
#[derive(Clone, Debug)]
pub struct TraceEntry {
    pub elapsed: Duration,
    pub message: String,
}

/// Diagnostic timings collected while serving a request.
#[derive(Clone, Debug)]
pub struct Traces {
    started: Instant,
    entries: Vec<TraceEntry>,
}

impl Traces {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, message: impl Into<String>) {
        self.entries.push(TraceEntry {
            elapsed: self.started.elapsed(),
            message: message.into(),
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Traces {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a latest lookup.
#[derive(Clone, Debug, Default)]
pub struct Latest {
    pub key: Option<ContentKey>,
    /// Present when tracing was requested.
    pub traces: Option<Traces>,
}

/// Lifecycle of a channel as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Active,
    Deleting,
    Absent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_is_time_then_sequence() {
        assert!(ContentKey::new(5, 9) < ContentKey::new(6, 0));
        assert!(ContentKey::new(5, 1) < ContentKey::new(5, 2));
        assert!(ContentKey::first_at(Timestamp(5)) < ContentKey::last_at(Timestamp(5)));
    }

    #[test]
    fn test_key_hex_parse() {
        let key = ContentKey::new(1_700_000_000_123, 7);
        let encoded = key.to_string();
        assert_eq!(encoded.len(), 24);
        assert_eq!(encoded.parse::<ContentKey>().unwrap(), key);
    }

    #[test]
    fn test_key_rejects_malformed_strings() {
        assert!("".parse::<ContentKey>().is_err());
        assert!("zz".repeat(12).parse::<ContentKey>().is_err());
        assert!("0".repeat(23).parse::<ContentKey>().is_err());
        // Uppercase would break the string ordering guarantee.
        assert!("0000018BCFE56800000000FF".parse::<ContentKey>().is_err());
    }

    #[test]
    fn test_successor_rolls_into_next_millisecond() {
        assert_eq!(ContentKey::new(3, 4).successor(), Some(ContentKey::new(3, 5)));
        assert_eq!(
            ContentKey::new(3, u32::MAX).successor(),
            Some(ContentKey::new(4, 0))
        );
        assert_eq!(ContentKey::new(u64::MAX, 7).successor(), Some(ContentKey::new(u64::MAX, 8)));
        assert_eq!(ContentKey::MAX.successor(), None);
    }

    #[test]
    fn test_channel_config_builders() {
        let config = ChannelConfig::new("weather")
            .with_tags(["a", "b"])
            .with_tag("c")
            .with_retention(RetentionPolicy::MaxItems { count: 10 })
            .with_replication_source("http://upstream/channel/weather");

        assert_eq!(config.tags.len(), 3);
        assert!(config.is_replicating());
        assert_eq!(config.retention, RetentionPolicy::MaxItems { count: 10 });
    }

    #[test]
    fn test_traces_record_in_order() {
        let mut traces = Traces::new();
        traces.add("first");
        traces.add("second");
        let messages: Vec<_> = traces.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert!(traces.entries()[0].elapsed <= traces.entries()[1].elapsed);
    }
}
