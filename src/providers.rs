//! Content routing table: who provides which key.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::common::{Key, PeerId};

/// Default bound on tracked content keys.
pub const MAX_PROVIDER_KEYS: usize = 2000;

/// Default bound on providers tracked per key.
pub const MAX_PROVIDERS_PER_KEY: usize = 20;

/// Default lifetime of a provider record.
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
/// Bounded multi-map of content key to provider peers with per-entry TTL.
///
/// Expired entries are pruned lazily on read; insertions beyond the per-key
/// bound evict the oldest provider.
pub struct ContentRoutingTable {
    keys: LruCache<Key, LruCache<PeerId, Instant>>,
    max_providers_per_key: NonZeroUsize,
    provider_ttl: Duration,
}

impl ContentRoutingTable {
    pub fn new(provider_ttl: Duration) -> Self {
        Self::with_bounds(provider_ttl, MAX_PROVIDER_KEYS, MAX_PROVIDERS_PER_KEY)
    }

    pub fn with_bounds(
        provider_ttl: Duration,
        max_keys: usize,
        max_providers_per_key: usize,
    ) -> Self {
        ContentRoutingTable {
            keys: LruCache::new(NonZeroUsize::new(max_keys).expect("non zero")),
            max_providers_per_key: NonZeroUsize::new(max_providers_per_key).expect("non zero"),
            provider_ttl,
        }
    }

    // === Public Methods ===

    /// Insert or refresh a provider for a key.
    pub fn add_provider(&mut self, key: &Key, peer: PeerId) {
        if let Some(providers) = self.keys.get_mut(key) {
            providers.put(peer, Instant::now());
        } else {
            let mut providers = LruCache::new(self.max_providers_per_key);
            providers.put(peer, Instant::now());
            self.keys.put(key.clone(), providers);
        }
    }

    /// Known unexpired providers for a key, newest first, up to `limit`.
    pub fn get_providers_for(&mut self, key: &Key, limit: usize) -> Vec<PeerId> {
        let ttl = self.provider_ttl;

        let Some(providers) = self.keys.get_mut(key) else {
            return Vec::new();
        };

        let expired: Vec<PeerId> = providers
            .iter()
            .filter(|(_, inserted)| inserted.elapsed() >= ttl)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in expired {
            providers.pop(&peer);
        }

        if providers.is_empty() {
            self.keys.pop(key);
            return Vec::new();
        }

        providers
            .iter()
            .take(limit)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn providers_are_deduped() {
        let mut table = ContentRoutingTable::new(DEFAULT_PROVIDER_TTL);
        let key = Key::new(&b"content"[..]);
        let peer = PeerId::random();

        for _ in 0..5 {
            table.add_provider(&key, peer);
        }

        assert_eq!(table.get_providers_for(&key, usize::MAX), vec![peer]);
    }

    #[test]
    fn newest_first_and_limited() {
        let mut table = ContentRoutingTable::new(DEFAULT_PROVIDER_TTL);
        let key = Key::new(&b"content"[..]);

        let first = PeerId::random();
        let second = PeerId::random();
        let third = PeerId::random();

        table.add_provider(&key, first);
        table.add_provider(&key, second);
        table.add_provider(&key, third);

        assert_eq!(
            table.get_providers_for(&key, usize::MAX),
            vec![third, second, first]
        );
        assert_eq!(table.get_providers_for(&key, 2), vec![third, second]);
    }

    #[test]
    fn per_key_bound_evicts_oldest() {
        let mut table = ContentRoutingTable::with_bounds(DEFAULT_PROVIDER_TTL, 10, 2);
        let key = Key::new(&b"content"[..]);

        let first = PeerId::random();
        let second = PeerId::random();
        let third = PeerId::random();

        table.add_provider(&key, first);
        table.add_provider(&key, second);
        table.add_provider(&key, third);

        let providers = table.get_providers_for(&key, usize::MAX);
        assert_eq!(providers, vec![third, second]);
    }

    #[test]
    fn expired_entries_are_pruned_on_read() {
        let mut table = ContentRoutingTable::new(Duration::ZERO);
        let key = Key::new(&b"content"[..]);

        table.add_provider(&key, PeerId::random());

        assert!(table.get_providers_for(&key, usize::MAX).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn unknown_key_has_no_providers() {
        let mut table = ContentRoutingTable::new(DEFAULT_PROVIDER_TTL);

        assert!(table
            .get_providers_for(&Key::new(&b"nope"[..]), usize::MAX)
            .is_empty());
    }
}
