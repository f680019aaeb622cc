//! Bounded in-process cache with fresh/stale/expired lifetimes.
//!
//! ```text
//! stored_at        stored_at + ttl                 stale_until
//!     |---- fresh ----|------------ stale ------------|---- expired ---->
//! ```
//!
//! Expired entries are not served by [`InProcessCache::get`], but they stay in the map until
//! capacity eviction or [`InProcessCache::purge_expired`] so a failed refetch can still fall back
//! to them through [`InProcessCache::peek_any`].
//!
//! Eviction is least-recently-stored: reads use `peek` and never promote an entry.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    num::NonZeroUsize,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::time::Instant;

use crate::types::{CacheKey, Provider};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: DateTime<Utc>,
    stored_instant: Instant,
    ttl: Duration,
    stale_until: Instant,
}

impl<V> CacheEntry<V> {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_instant)
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.stale_until
    }
}

/// A cached value with the wall-clock time it was stored.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue<V> {
    pub value: V,
    pub stored_at: DateTime<Utc>,
    pub age: Duration,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// Younger than its TTL.
    Fresh(CachedValue<V>),
    /// Past its TTL but inside the stale window.
    Stale(CachedValue<V>),
    /// Absent or expired.
    Miss,
}

impl<V> Lookup<V> {
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub evictions: u64,
}

/// Bounded key→entry map holding the latest successful response per cache key.
pub struct InProcessCache<V> {
    entries: Mutex<LruCache<CacheKey, CacheEntry<V>>>,
    capacity: usize,
    stale_multiplier: u32,
    evictions: AtomicU64,
}

impl<V: Clone> InProcessCache<V> {
    /// Creates a cache holding at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize, stale_multiplier: u32) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            capacity: capacity.get(),
            stale_multiplier: stale_multiplier.max(1),
            evictions: AtomicU64::new(0),
        }
    }

    /// Classifies the entry for `key` as fresh, stale, or miss.
    pub fn get(&self, key: &CacheKey) -> Lookup<V> {
        let now = Instant::now();
        let entries = self.entries.lock();
        let Some(entry) = entries.peek(key) else {
            return Lookup::Miss;
        };

        let age = entry.age(now);
        if entry.is_expired(now) {
            return Lookup::Miss;
        }

        let cached = CachedValue { value: entry.value.clone(), stored_at: entry.stored_at, age };
        if age < entry.ttl {
            Lookup::Fresh(cached)
        } else {
            Lookup::Stale(cached)
        }
    }

    /// Returns whatever is held for `key`, including expired entries not yet evicted.
    pub fn peek_any(&self, key: &CacheKey) -> Option<CachedValue<V>> {
        let now = Instant::now();
        self.entries.lock().peek(key).map(|entry| CachedValue {
            value: entry.value.clone(),
            stored_at: entry.stored_at,
            age: entry.age(now),
        })
    }

    /// Stores `value` under `key`.
    ///
    /// The entry lives for `max(ttl, stale_duration)` in total, where `stale_duration` defaults
    /// to `ttl * stale_multiplier`. Storing an existing key overwrites it and makes it the most
    /// recently stored entry. Returns the entry's wall-clock store time.
    pub fn put(
        &self,
        key: CacheKey,
        value: V,
        ttl: Duration,
        stale_duration: Option<Duration>,
    ) -> DateTime<Utc> {
        let now = Instant::now();
        let stored_at = Utc::now();
        let lifetime = stale_duration
            .unwrap_or_else(|| ttl.saturating_mul(self.stale_multiplier))
            .max(ttl);

        let entry = CacheEntry {
            value,
            stored_at,
            stored_instant: now,
            ttl,
            stale_until: now + lifetime,
        };

        let evicted = self.entries.lock().push(key.clone(), entry);
        if let Some((evicted_key, _)) = evicted {
            if evicted_key != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(key = %evicted_key, "cache entry evicted at capacity");
            }
        }
        stored_at
    }

    /// Removes one entry. Returns `true` if it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Removes every entry whose key is scoped to `provider`. Returns how many were removed.
    pub fn invalidate_provider(&self, provider: &Provider) -> usize {
        let mut entries = self.entries.lock();
        let doomed: Vec<CacheKey> = entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| key.belongs_to(provider))
            .cloned()
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    /// Drops entries past their stale window. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<CacheKey> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
