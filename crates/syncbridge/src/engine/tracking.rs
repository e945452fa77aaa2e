//! Bounded, expiring memory of what the engine has already handled.
//!
//! Two caches live here, both scoped to one engine:
//!
//! - processed change tags, so a replicated change is applied at most once
//!   and the engine's own writes are not applied back to their source
//! - pending removals, so a partition delete made by the engine itself is not
//!   turned into a source-service removal

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::Config;
use crate::doc::DocumentUrl;
use crate::tag::ChangeTag;

/// LRU set whose entries also expire after a fixed lifetime.
pub struct TtlCache<K: Hash + Eq> {
    entries: Mutex<LruCache<K, Instant>>,
    ttl: Duration,
}

impl<K: Hash + Eq> TtlCache<K> {
    /// Cache holding at most `capacity` keys for `ttl` each.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Remember `key`, refreshing its lifetime.
    pub fn insert(&self, key: K) {
        self.entries.lock().put(key, Instant::now());
    }

    /// Whether `key` is remembered and not expired.
    pub fn contains(&self, key: &K) -> bool {
        let mut entries = self.entries.lock();
        let fresh = entries.get(key).map(|at| at.elapsed() < self.ttl);
        if fresh == Some(false) {
            entries.pop(key);
        }
        fresh == Some(true)
    }

    /// Forget `key`, returning whether it was remembered and not expired.
    pub fn take(&self, key: &K) -> bool {
        self.entries
            .lock()
            .pop(key)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Number of remembered keys, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A record the engine itself deleted from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingRemoval {
    /// Partition the record was deleted from.
    pub url: DocumentUrl,
    /// Service path.
    pub service: String,
    /// Record id.
    pub id: String,
}

/// The engine's tracking caches.
pub struct Tracking {
    /// Tags already applied or produced locally.
    pub processed: TtlCache<ChangeTag>,
    /// Deletions made by the event bridge.
    pub pending_removals: TtlCache<PendingRemoval>,
}

impl Tracking {
    /// Caches sized from `config`.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            processed: TtlCache::new(config.processed_tag_capacity, config.tracking_ttl()),
            pending_removals: TtlCache::new(
                config.pending_removal_capacity,
                config.tracking_ttl(),
            ),
        }
    }
}
