//! Striped TTL cache for channel configs.

use crate::types::ChannelConfig;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct CachedConfig {
    config: ChannelConfig,
    fetched: Instant,
}

struct Stripe {
    entries: LruCache<String, CachedConfig>,
    /// Bumped on every invalidation in this stripe.
    generation: u64,
}

/// Recently read channel configs.
///
/// Names hash to one of several independently locked LRU stripes, so
/// readers of different channels rarely share a lock. Entries expire after
/// the TTL; writers invalidate explicitly.
///
/// A reader that misses takes a [`generation`](Self::generation) before
/// reading the backend and hands it back to [`insert`](Self::insert). If
/// the stripe was invalidated in between, the possibly stale value is
/// not cached.
pub struct ChannelCache {
    stripes: Vec<Mutex<Stripe>>,
    ttl: Duration,
}

impl ChannelCache {
    /// Create a cache holding about `capacity` configs over `stripes` locks.
    pub fn new(capacity: usize, stripes: usize, ttl: Duration) -> Self {
        let stripes = stripes.max(1);
        let per_stripe = NonZeroUsize::new(capacity.div_ceil(stripes)).unwrap_or(NonZeroUsize::MIN);
        Self {
            stripes: (0..stripes)
                .map(|_| {
                    Mutex::new(Stripe {
                        entries: LruCache::new(per_stripe),
                        generation: 0,
                    })
                })
                .collect(),
            ttl,
        }
    }

    /// A cached config younger than the TTL.
    pub fn get(&self, name: &str) -> Option<ChannelConfig> {
        let mut guard = self.stripe(name).lock();
        let stripe = &mut *guard;
        let cached = stripe
            .entries
            .get(name)
            .map(|c| (c.fetched.elapsed() < self.ttl, c.config.clone()));
        match cached {
            Some((true, config)) => Some(config),
            Some((false, _)) => {
                stripe.entries.pop(name);
                None
            }
            None => None,
        }
    }

    /// Invalidation counter of the stripe holding `name`.
    pub fn generation(&self, name: &str) -> u64 {
        self.stripe(name).lock().generation
    }

    /// Cache a config read after `generation` was taken. Returns false,
    /// caching nothing, when the stripe has been invalidated since.
    pub fn insert(&self, config: ChannelConfig, generation: u64) -> bool {
        let mut stripe = self.stripe(&config.name).lock();
        if stripe.generation != generation {
            return false;
        }
        let name = config.name.clone();
        stripe.entries.put(
            name,
            CachedConfig {
                config,
                fetched: Instant::now(),
            },
        );
        true
    }

    pub fn invalidate(&self, name: &str) {
        let mut stripe = self.stripe(name).lock();
        stripe.generation = stripe.generation.wrapping_add(1);
        stripe.entries.pop(name);
    }

    pub fn clear(&self) {
        for stripe in &self.stripes {
            let mut stripe = stripe.lock();
            stripe.generation = stripe.generation.wrapping_add(1);
            stripe.entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn stripe(&self, name: &str) -> &Mutex<Stripe> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[idx]
    }
}
