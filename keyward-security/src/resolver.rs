use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use keyward_rate_limit::{Acquire, RateLimiter};
use tracing::{debug, info, warn};

use crate::cache::KeyCache;
use crate::config::{ConfigError, VerifierConfig};
use crate::error::{FetchError, KeyResolutionError};
use crate::jwks::{JwksFetcher, KeySet, SigningKey};

type FetchResult = Result<Arc<KeySet>, FetchError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// A fetch currently running for one provider.
#[derive(Clone)]
struct InFlight {
    ticket: u64,
    fetch: SharedFetch,
}

enum Pending<T> {
    Ready(T),
    Fetch(InFlight),
}

/// Resolves `(provider, kid)` pairs to signing keys.
///
/// Answers from the [`KeyCache`] when it can. Otherwise it fetches the
/// provider's key set, subject to a per-provider [`RateLimiter`]. Concurrent
/// misses for one provider share a single fetch: the first caller starts it
/// as a task, later callers await the same shared future, and all of them
/// see the same outcome.
///
/// Construct one per process (or per trust domain) and share it behind an
/// `Arc`.
pub struct KeyResolver {
    cache: KeyCache,
    limiter: RateLimiter<String>,
    fetcher: Arc<dyn JwksFetcher>,
    in_flight: Arc<DashMap<String, InFlight>>,
    fetch_timeout: Duration,
}

impl KeyResolver {
    pub fn new(
        fetcher: Arc<dyn JwksFetcher>,
        cache: KeyCache,
        limiter: RateLimiter<String>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            limiter,
            fetcher,
            in_flight: Arc::new(DashMap::new()),
            fetch_timeout,
        }
    }

    /// Build a resolver with the cache, rate-limit and timeout settings of
    /// `config`.
    pub fn from_config(
        fetcher: Arc<dyn JwksFetcher>,
        config: &VerifierConfig,
    ) -> Result<Self, ConfigError> {
        let cache = KeyCache::new(config.cache_max_age(), config.cache_capacity()?);
        let limiter = RateLimiter::per_minute(config.rate_limit()?);
        Ok(Self::new(fetcher, cache, limiter, config.fetch_timeout()))
    }

    pub fn cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Return the key `kid` published by `provider`.
    ///
    /// 1. Fresh cache hit: returned without I/O.
    /// 2. Otherwise join the provider's in-flight fetch, or start one if the
    ///    rate limiter admits it. When it does not, a stale cached copy of
    ///    the key is served; without one the call fails with `RateLimited`.
    /// 3. If the fetched set lacks `kid`, the provider's entry is invalidated
    ///    and the call fails with `UnknownKeyId`.
    ///
    /// Fetch failures are returned as-is; nothing is retried here.
    pub async fn resolve(
        &self,
        provider: &str,
        kid: &str,
    ) -> Result<Arc<SigningKey>, KeyResolutionError> {
        if let Some(key) = self.cache.lookup(provider, kid) {
            debug!(provider, kid, "Signing key served from cache");
            return Ok(key);
        }

        let pending = self.join_or_start(
            provider,
            || self.cache.lookup(provider, kid),
            || self.cache.lookup_stale(provider, kid),
        )?;
        let running = match pending {
            Pending::Ready(key) => return Ok(key),
            Pending::Fetch(running) => running,
        };

        let key_set = running.fetch.await?;
        match key_set.find(kid) {
            Some(key) => Ok(key),
            None => {
                // Only the entry this fetch installed; a newer one may hold the kid.
                self.cache.invalidate_generation(provider, running.ticket);
                warn!(provider, kid, keys = key_set.len(), "Key id not published by provider");
                Err(KeyResolutionError::UnknownKeyId {
                    provider: provider.to_owned(),
                    kid: kid.to_owned(),
                })
            }
        }
    }

    /// Return the whole key set published by `provider`.
    ///
    /// Goes through the same cache, rate limit and in-flight fetch as
    /// [`resolve`](Self::resolve); a rate-limited call falls back to a stale
    /// cached set.
    pub async fn key_set(&self, provider: &str) -> Result<Arc<KeySet>, KeyResolutionError> {
        if let Some(key_set) = self.cache.key_set(provider).fresh() {
            debug!(provider, "Key set served from cache");
            return Ok(key_set);
        }

        let pending = self.join_or_start(
            provider,
            || self.cache.key_set(provider).fresh(),
            || self.cache.key_set(provider).any(),
        )?;
        match pending {
            Pending::Ready(key_set) => Ok(key_set),
            Pending::Fetch(running) => Ok(running.fetch.await?),
        }
    }

    /// Number of fetches currently running.
    pub fn fetches_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn join_or_start<T>(
        &self,
        provider: &str,
        fresh: impl FnOnce() -> Option<T>,
        stale: impl FnOnce() -> Option<T>,
    ) -> Result<Pending<T>, KeyResolutionError> {
        let slot = match self.in_flight.entry(provider.to_owned()) {
            Entry::Occupied(running) => {
                debug!(provider, ticket = running.get().ticket, "Joining in-flight JWKS fetch");
                return Ok(Pending::Fetch(running.get().clone()));
            }
            Entry::Vacant(slot) => slot,
        };

        // A fetch may have committed between our first lookup and taking the slot.
        if let Some(hit) = fresh() {
            return Ok(Pending::Ready(hit));
        }

        if let Acquire::Denied { retry_after } = self.limiter.try_acquire(slot.key()) {
            if let Some(hit) = stale() {
                warn!(provider, "JWKS refresh rate limited, serving stale keys");
                return Ok(Pending::Ready(hit));
            }
            warn!(provider, retry_after_secs = retry_after.as_secs(), "JWKS refresh rate limited");
            return Err(KeyResolutionError::RateLimited {
                provider: provider.to_owned(),
                retry_after,
            });
        }

        let ticket = self.cache.reserve(provider);
        let running = InFlight {
            ticket,
            fetch: self.spawn_fetch(provider.to_owned(), ticket),
        };
        slot.insert(running.clone());
        Ok(Pending::Fetch(running))
    }

    /// Run one fetch as its own task so it completes (and commits) even if
    /// every caller waiting on it goes away.
    fn spawn_fetch(&self, provider: String, ticket: u64) -> SharedFetch {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = self.cache.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let timeout = self.fetch_timeout;

        debug!(provider = %provider, ticket, "Starting JWKS fetch");
        let task = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, fetcher.fetch(&provider)).await {
                Ok(Ok(key_set)) => {
                    let key_set = Arc::new(key_set);
                    if cache.store_if_latest(Arc::clone(&key_set), ticket) {
                        info!(provider = %provider, keys = key_set.len(), ticket, "JWKS refreshed");
                    } else {
                        debug!(provider = %provider, ticket, "JWKS fetch superseded, not cached");
                    }
                    Ok(key_set)
                }
                Ok(Err(err)) => Err(err),
                Err(_) => Err(FetchError::Timeout(timeout)),
            };
            if let Err(err) = &result {
                cache.release(&provider, ticket);
                warn!(provider = %provider, error = %err, "JWKS fetch failed");
            }
            in_flight.remove_if(&provider, |_, running| running.ticket == ticket);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(FetchError::Network(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared()
    }
}
