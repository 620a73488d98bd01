//! Lazy, paged iteration over committed keys.

use super::{decode_item_key, item_key, ITEM_END};
use crate::backend::{Deadline, ScanRange, StorageBackend};
use crate::error::Result;
use crate::types::ContentKey;
use std::collections::VecDeque;
use std::sync::Arc;

/// Keys in `[lower, upper)` of one channel, fetched a page at a time.
///
/// Only committed items exist in the backend, so a reserved key whose
/// write is still in flight never shows up. Items committed during the
/// scan may or may not be seen; re-issuing the same query restarts it.
pub struct KeyScan {
    backend: Arc<dyn StorageBackend>,
    partition: String,
    lower: ContentKey,
    upper: Option<ContentKey>,
    reverse: bool,
    page_size: usize,
    deadline: Deadline,
    limit: Option<usize>,
    buffer: VecDeque<ContentKey>,
    exhausted: bool,
}

impl KeyScan {
    pub(crate) fn new(
        backend: Arc<dyn StorageBackend>,
        partition: String,
        lower: ContentKey,
        upper: Option<ContentKey>,
        reverse: bool,
        page_size: usize,
        deadline: Deadline,
    ) -> Self {
        let exhausted = matches!(upper, Some(upper) if upper <= lower);
        Self {
            backend,
            partition,
            lower,
            upper,
            reverse,
            page_size: page_size.max(1),
            deadline,
            limit: None,
            buffer: VecDeque::new(),
            exhausted,
        }
    }

    /// Stop after `limit` keys.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Drain the scan into a vector, in scan order.
    pub fn collect_keys(self) -> Result<Vec<ContentKey>> {
        self.collect()
    }

    fn fetch_page(&mut self) -> Result<()> {
        let page = match self.limit {
            Some(limit) => self.page_size.min(limit),
            None => self.page_size,
        };
        let range = ScanRange {
            start: Some(item_key(&self.lower)),
            end: Some(
                self.upper
                    .map(|k| item_key(&k))
                    .unwrap_or_else(|| ITEM_END.to_vec()),
            ),
        };

        let entries = self
            .backend
            .scan(&self.partition, &range, self.reverse, Some(page), self.deadline)?;
        if entries.len() < page {
            self.exhausted = true;
        }

        for (raw, _) in entries {
            self.buffer.push_back(decode_item_key(&raw)?);
        }

        match (self.reverse, self.buffer.back()) {
            (false, Some(last)) => match last.successor() {
                Some(next) => self.lower = next,
                None => self.exhausted = true,
            },
            (true, Some(last)) => self.upper = Some(*last),
            _ => self.exhausted = true,
        }
        Ok(())
    }
}

impl Iterator for KeyScan {
    type Item = Result<ContentKey>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.limit == Some(0) {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                self.buffer.clear();
                return Some(Err(e));
            }
        }

        let key = self.buffer.pop_front()?;
        if let Some(limit) = self.limit.as_mut() {
            *limit -= 1;
        }
        Some(Ok(key))
    }
}
