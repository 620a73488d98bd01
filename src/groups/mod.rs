//! Group subscriptions: durable bindings of a callback to one channel.
//!
//! The registry guards one invariant above all: a group's channel URL
//! never changes after creation. Delivery itself happens elsewhere; the
//! dispatcher reads groups from here and follows changes through
//! [`GroupRegistry::watch`].

mod registry;
mod types;

pub use registry::GroupRegistry;
pub use types::{Group, GroupEvent, GroupWatch, WatchId};

use crate::channels::{validate_channel_name, MAX_NAME_LEN};
use crate::error::{HubError, Result};

/// Checks a group before it is stored.
pub trait GroupValidator: Send + Sync {
    fn validate(&self, group: &Group) -> Result<()>;
}

/// Field rules applied by default.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultGroupValidator;

impl GroupValidator for DefaultGroupValidator {
    fn validate(&self, group: &Group) -> Result<()> {
        let invalid = |reason: String| Err(HubError::InvalidRequest(reason));

        let name_ok = !group.name.is_empty()
            && group.name.len() <= MAX_NAME_LEN
            && group
                .name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !name_ok {
            return invalid(format!("invalid group name: {:?}", group.name));
        }
        if channel_from_url(&group.channel_url).is_none() {
            return invalid(format!("invalid channel url: {:?}", group.channel_url));
        }
        if split_http_url(&group.callback_url).is_none() {
            return invalid(format!("invalid callback url: {:?}", group.callback_url));
        }
        if group.parallel_calls == 0 {
            return invalid("parallel_calls must be at least 1".into());
        }
        if group.batch_size == 0 {
            return invalid("batch_size must be at least 1".into());
        }
        Ok(())
    }
}

/// `(host, path)` of an http(s) URL with a non-empty host.
fn split_http_url(url: &str) -> Option<(&str, &str)> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
    if host.is_empty() || host.contains(char::is_whitespace) {
        return None;
    }
    Some((host, path))
}

/// Channel name from `http(s)://host/.../channel/<name>`.
pub fn channel_from_url(url: &str) -> Option<&str> {
    let (_, path) = split_http_url(url)?;
    let mut segments = path.trim_end_matches('/').rsplit('/');
    let name = segments.next()?;
    if segments.next()? != "channel" {
        return None;
    }
    validate_channel_name(name).ok().map(|_| name)
}
