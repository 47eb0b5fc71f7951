use dashmap::DashMap;
use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a [`GenerationalCache::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    /// Entry exists, is younger than `max_age` and has not been invalidated.
    Fresh(V),
    /// Entry exists but is past `max_age` or was invalidated.
    Stale(V),
    Miss,
}

impl<V> Lookup<V> {
    /// The value, only if fresh.
    pub fn fresh(self) -> Option<V> {
        match self {
            Lookup::Fresh(v) => Some(v),
            _ => None,
        }
    }

    /// The value regardless of staleness.
    pub fn any(self) -> Option<V> {
        match self {
            Lookup::Fresh(v) | Lookup::Stale(v) => Some(v),
            Lookup::Miss => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Lookup::Fresh(_))
    }
}

struct Entry<V> {
    value: V,
    fetched_at: Instant,
    generation: u64,
    invalidated: bool,
}

/// A thread-safe, bounded cache backed by `DashMap`.
///
/// Every stored value carries the instant it was stored and a generation
/// number drawn from a cache-wide counter, so generations only ever grow.
/// Values are replaced wholesale; readers clone the value out (use `Arc`
/// for anything large) and never observe a partial update.
///
/// Writers that run long operations before storing (a network fetch, say)
/// can [`reserve`](Self::reserve) a ticket first and later
/// [`commit`](Self::commit) with it. The commit only lands if no newer
/// ticket was reserved for that key in the meantime.
///
/// When a new key would push the cache past `max_entries`, the entry with
/// the oldest store instant is evicted. A key's ticket is dropped with its
/// entry unless a newer reservation is outstanding, and a writer whose work
/// failed hands its ticket back with [`release`](Self::release), so tickets
/// stay bounded by entries plus reservations in progress.
#[derive(Clone)]
pub struct GenerationalCache<K, V> {
    entries: Arc<DashMap<K, Entry<V>>>,
    tickets: Arc<DashMap<K, u64>>,
    counter: Arc<AtomicU64>,
    max_age: Duration,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> GenerationalCache<K, V> {
    /// Create a cache whose entries go stale after `max_age` and which holds
    /// at most `max_entries` keys.
    pub fn new(max_age: Duration, max_entries: NonZeroUsize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            tickets: Arc::new(DashMap::new()),
            counter: Arc::new(AtomicU64::new(0)),
            max_age,
            max_entries: max_entries.get(),
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Look up a value and classify it as fresh or stale.
    ///
    /// Stale entries are kept so callers can fall back to them; they are
    /// only dropped by eviction, [`remove`](Self::remove) or replacement.
    pub fn get<Q>(&self, key: &Q) -> Lookup<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get(key) {
            Some(entry) if entry.invalidated || entry.fetched_at.elapsed() >= self.max_age => {
                Lookup::Stale(entry.value.clone())
            }
            Some(entry) => Lookup::Fresh(entry.value.clone()),
            None => Lookup::Miss,
        }
    }

    /// Store a value unconditionally. Returns the new generation.
    pub fn insert(&self, key: K, value: V) -> u64 {
        let mut ticket = self.tickets.entry(key.clone()).or_insert(0);
        let generation = self.next_generation();
        *ticket = generation;
        let evicted = self.install(key, value, generation);
        drop(ticket);
        self.forget_tickets(evicted);
        generation
    }

    /// Reserve a commit ticket for `key`. Any ticket reserved earlier for
    /// the same key can no longer commit.
    pub fn reserve(&self, key: &K) -> u64 {
        let generation = self.next_generation();
        self.tickets.insert(key.clone(), generation);
        generation
    }

    /// Store `value` if `ticket` is still the latest one reserved for `key`.
    ///
    /// The stored entry's generation is the ticket. Returns `false` (and
    /// leaves the cache untouched) when the ticket has been superseded.
    pub fn commit(&self, key: K, value: V, ticket: u64) -> bool {
        // Holding the ticket guard keeps `reserve` out until the entry is in.
        let Some(latest) = self.tickets.get(&key) else {
            return false;
        };
        if *latest != ticket {
            return false;
        }
        let evicted = self.install(key, value, ticket);
        drop(latest);
        self.forget_tickets(evicted);
        true
    }

    /// Give back `ticket` for `key` after the work it was reserved for
    /// failed. No-op if a newer ticket has been reserved since.
    pub fn release(&self, key: &K, ticket: u64) {
        self.tickets.remove_if(key, |_, latest| *latest == ticket);
    }

    /// Mark an entry so the next [`get`](Self::get) reports it as stale.
    /// Returns `false` if there was nothing to invalidate.
    pub fn invalidate<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.invalidated = true;
                true
            }
            None => false,
        }
    }

    /// Like [`invalidate`](Self::invalidate), but only if the stored entry
    /// still has `generation`.
    pub fn invalidate_generation<Q>(&self, key: &Q, generation: u64) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.generation == generation => {
                entry.invalidated = true;
                true
            }
            _ => false,
        }
    }

    /// Remove a specific entry from the cache.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some((key, entry)) = self.entries.remove(key) {
            self.forget_tickets(vec![(key, entry.generation)]);
        }
    }

    /// Remove all entries. Tickets reserved for work still in progress stay
    /// valid.
    pub fn clear(&self) {
        let removed: Vec<(K, u64)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.generation))
            .collect();
        self.entries.clear();
        self.forget_tickets(removed);
    }

    /// Generation of the entry currently stored under `key`.
    pub fn generation<Q>(&self, key: &Q) -> Option<u64>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.get(key).map(|entry| entry.generation)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of keys currently holding a ticket.
    pub fn ticket_count(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_generation(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Store the entry, evicting as needed. Returns what was evicted so the
    /// caller can drop those tickets once it no longer holds a ticket guard.
    fn install(&self, key: K, value: V, generation: u64) -> Vec<(K, u64)> {
        let mut evicted = Vec::new();
        while !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            match self.evict_oldest() {
                Some(oldest) => evicted.push(oldest),
                None => break,
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                fetched_at: Instant::now(),
                generation,
                invalidated: false,
            },
        );
        evicted
    }

    fn evict_oldest(&self) -> Option<(K, u64)> {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().fetched_at)
            .map(|entry| entry.key().clone())?;
        let (key, entry) = self.entries.remove(&oldest)?;
        Some((key, entry.generation))
    }

    /// Drop the tickets of removed entries, keeping any reserved since.
    fn forget_tickets(&self, removed: Vec<(K, u64)>) {
        for (key, generation) in removed {
            self.tickets.remove_if(&key, |_, latest| *latest == generation);
        }
    }
}
