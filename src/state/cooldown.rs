use std::{hash::Hash, time::Duration};

use dashmap::{DashMap, mapref::entry::Entry};
use tokio::time::Instant;

/// Short-TTL key → last-seen map.
///
/// Entries older than the TTL are treated as absent and are physically
/// removed by [`CooldownCache::evict_expired`]. One instance per concern,
/// owned by whoever constructs it.
#[derive(Debug)]
pub struct CooldownCache<K>
where
    K: Eq + Hash,
{
    ttl: Duration,
    entries: DashMap<K, Instant>,
}

impl<K> CooldownCache<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty cache whose entries stay fresh for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record `key` as seen now.
    pub fn touch(&self, key: K) {
        self.entries.insert(key, Instant::now());
    }

    /// Time left before `key` expires, if it is still fresh.
    pub fn remaining(&self, key: &K) -> Option<Duration> {
        let seen = *self.entries.get(key)?;
        self.ttl.checked_sub(seen.elapsed()).filter(|left| !left.is_zero())
    }

    /// Whether `key` was touched less than one TTL ago.
    pub fn is_fresh(&self, key: &K) -> bool {
        self.remaining(key).is_some()
    }

    /// Returns `true` when `key` is a duplicate inside the TTL window;
    /// otherwise records it and returns `false`. Duplicates do not extend the window.
    pub fn check_and_touch(&self, key: K) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().elapsed() < self.ttl {
                    true
                } else {
                    entry.insert(Instant::now());
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Instant::now());
                false
            }
        }
    }

    /// Remove `key`, reporting whether it was still fresh.
    pub fn take_fresh(&self, key: &K) -> bool {
        self.entries
            .remove(key)
            .is_some_and(|(_, seen)| seen.elapsed() < self.ttl)
    }

    /// Drop `key` so it is no longer considered seen.
    pub fn forget(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry.
    pub fn evict_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, seen| seen.elapsed() < ttl);
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn duplicates_inside_ttl_are_detected() {
        let cache = CooldownCache::new(Duration::from_secs(5));
        assert!(!cache.check_and_touch("a"));
        assert!(cache.check_and_touch("a"));
        advance(Duration::from_secs(4)).await;
        assert!(cache.check_and_touch("a"));
        advance(Duration::from_secs(2)).await;
        assert!(!cache.check_and_touch("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_counts_down() {
        let cache = CooldownCache::new(Duration::from_secs(60));
        cache.touch(7u64);
        advance(Duration::from_secs(45)).await;
        assert_eq!(cache.remaining(&7), Some(Duration::from_secs(15)));
        advance(Duration::from_secs(15)).await;
        assert_eq!(cache.remaining(&7), None);
        assert!(!cache.is_fresh(&8));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_and_take() {
        let cache = CooldownCache::new(Duration::from_secs(1));
        cache.touch(1u8);
        cache.touch(2u8);
        assert!(cache.take_fresh(&1));
        assert!(!cache.take_fresh(&1));
        cache.forget(&2);
        assert!(!cache.check_and_touch(2u8));
        advance(Duration::from_secs(2)).await;
        cache.evict_expired();
        assert!(cache.is_empty());
    }
}
