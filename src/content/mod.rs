//! Ordered, append-only content storage.
//!
//! Each channel owns one backend partition holding:
//! - items under `i/<key bytes>`
//! - the high-water mark of issued keys under `m/latest`
//! - the retention floor under `m/floor`
//!
//! Keys are reserved first (a conditional write advancing the high-water
//! mark) and committed second (the item write). A key whose commit never
//! happens is skipped forever: it is never visible and never reissued.

mod scan;
mod sequencer;
mod store;

pub use scan::KeyScan;
pub use sequencer::KeySequencer;
pub use store::ContentStore;

use crate::error::{HubError, Result};
use crate::types::ContentKey;

pub(crate) const ITEM_PREFIX: &[u8] = b"i/";
/// First byte string past every item key.
pub(crate) const ITEM_END: &[u8] = b"i0";
pub(crate) const LATEST_RECORD: &[u8] = b"m/latest";
pub(crate) const FLOOR_RECORD: &[u8] = b"m/floor";

pub(crate) fn partition_for(channel: &str) -> String {
    format!("content/{channel}")
}

pub(crate) fn item_key(key: &ContentKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(ITEM_PREFIX.len() + ContentKey::ENCODED_LEN);
    out.extend_from_slice(ITEM_PREFIX);
    out.extend_from_slice(&key.to_bytes());
    out
}

pub(crate) fn decode_item_key(raw: &[u8]) -> Result<ContentKey> {
    raw.strip_prefix(ITEM_PREFIX)
        .and_then(ContentKey::from_bytes)
        .ok_or_else(|| HubError::Corruption(format!("bad item key: {}", hex::encode(raw))))
}

pub(crate) fn decode_key_record(raw: &[u8]) -> Result<ContentKey> {
    ContentKey::from_bytes(raw)
        .ok_or_else(|| HubError::Corruption(format!("bad key record: {}", hex::encode(raw))))
}
