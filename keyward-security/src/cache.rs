use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use keyward_cache::{GenerationalCache, Lookup};

use crate::jwks::{KeySet, SigningKey};

/// Key sets cached per provider URI.
///
/// An entry is stale once it is `max_age` old or has been invalidated.
/// [`lookup`](Self::lookup) only answers from fresh entries;
/// [`lookup_stale`](Self::lookup_stale) also accepts stale ones and exists
/// for the rate-limited fallback path.
#[derive(Clone)]
pub struct KeyCache {
    sets: GenerationalCache<String, Arc<KeySet>>,
}

impl KeyCache {
    pub fn new(max_age: Duration, max_entries: NonZeroUsize) -> Self {
        Self {
            sets: GenerationalCache::new(max_age, max_entries),
        }
    }

    /// Key `kid` from a fresh entry for `provider`.
    pub fn lookup(&self, provider: &str, kid: &str) -> Option<Arc<SigningKey>> {
        self.sets.get(provider).fresh()?.find(kid)
    }

    /// Key `kid` from any entry for `provider`, fresh or stale.
    pub fn lookup_stale(&self, provider: &str, kid: &str) -> Option<Arc<SigningKey>> {
        self.sets.get(provider).any()?.find(kid)
    }

    /// The whole key set cached for `provider`.
    pub fn key_set(&self, provider: &str) -> Lookup<Arc<KeySet>> {
        self.sets.get(provider)
    }

    /// Install `key_set` for its provider, replacing any previous entry.
    /// Returns the new generation.
    pub fn store(&self, key_set: Arc<KeySet>) -> u64 {
        self.sets.insert(key_set.provider().to_owned(), key_set)
    }

    /// Reserve a commit ticket before starting a fetch for `provider`.
    pub fn reserve(&self, provider: &str) -> u64 {
        self.sets.reserve(&provider.to_owned())
    }

    /// Install `key_set` only if `ticket` is still the latest reservation
    /// for its provider.
    pub fn store_if_latest(&self, key_set: Arc<KeySet>, ticket: u64) -> bool {
        self.sets
            .commit(key_set.provider().to_owned(), key_set, ticket)
    }

    /// Force the next [`lookup`](Self::lookup) for `provider` to miss.
    pub fn invalidate(&self, provider: &str) -> bool {
        self.sets.invalidate(provider)
    }

    /// Invalidate `provider`'s entry only if it is still `generation`.
    pub fn invalidate_generation(&self, provider: &str, generation: u64) -> bool {
        self.sets.invalidate_generation(provider, generation)
    }

    /// Hand back a ticket whose fetch failed.
    pub fn release(&self, provider: &str, ticket: u64) {
        self.sets.release(&provider.to_owned(), ticket)
    }

    pub fn generation(&self, provider: &str) -> Option<u64> {
        self.sets.generation(provider)
    }

    pub fn max_age(&self) -> Duration {
        self.sets.max_age()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Providers holding a commit ticket.
    pub fn ticket_count(&self) -> usize {
        self.sets.ticket_count()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
