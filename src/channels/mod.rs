//! Channel configuration: registry, cache and name rules.

mod cache;
mod registry;

pub use cache::ChannelCache;
pub use registry::ChannelRegistry;

use crate::error::{HubError, Result};

/// Longest accepted channel name or tag.
pub const MAX_NAME_LEN: usize = 48;

/// Reject names outside `[A-Za-z0-9_-]{1,48}`.
pub fn validate_channel_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(HubError::InvalidChannelName(name.to_string()))
    }
}

/// Tags additionally allow `:`.
pub fn validate_tag(tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_NAME_LEN
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':'));
    if valid {
        Ok(())
    } else {
        Err(HubError::InvalidRequest(format!("invalid tag: {tag:?}")))
    }
}
