mod common;

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::time::Duration;

use common::{jwks_for, FakeProvider, PROVIDER};
use futures_util::future::join_all;
use keyward_rate_limit::RateLimiter;
use keyward_security::{
    FetchError, JwksFetcher, KeyCache, KeyResolutionError, KeyResolver, KeySet,
};

const MAX_AGE: Duration = Duration::from_secs(600);

fn resolver_with(provider: &Arc<FakeProvider>, max_age: Duration, per_minute: u32) -> KeyResolver {
    KeyResolver::new(
        Arc::clone(provider) as Arc<dyn JwksFetcher>,
        KeyCache::new(max_age, NonZeroUsize::new(5).unwrap()),
        RateLimiter::per_minute(NonZeroU32::new(per_minute).unwrap()),
        Duration::from_secs(5),
    )
}

fn resolver(provider: &Arc<FakeProvider>) -> KeyResolver {
    resolver_with(provider, MAX_AGE, 10)
}

// ── Cache behaviour ──

#[tokio::test(start_paused = true)]
async fn first_resolve_fetches_then_hits_cache() {
    let provider = Arc::new(FakeProvider::publishing(&["k1", "k2"]));
    let resolver = resolver(&provider);

    let key = resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert_eq!(key.kid(), "k1");
    assert_eq!(provider.calls(), 1);

    let again = resolver.resolve(PROVIDER, "k1").await.unwrap();
    let sibling = resolver.resolve(PROVIDER, "k2").await.unwrap();
    assert!(Arc::ptr_eq(&key, &again));
    assert_eq!(sibling.kid(), "k2");
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn entry_is_fresh_until_max_age() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver(&provider);

    resolver.resolve(PROVIDER, "k1").await.unwrap();
    tokio::time::advance(MAX_AGE - Duration::from_secs(1)).await;
    resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert_eq!(provider.calls(), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn providers_are_cached_independently() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver(&provider);

    resolver.resolve("https://a.example.test/jwks", "k1").await.unwrap();
    resolver.resolve("https://b.example.test/jwks", "k1").await.unwrap();
    assert_eq!(provider.calls(), 2);
    assert_eq!(resolver.cache().len(), 2);
}

// ── Coalescing ──

#[tokio::test(start_paused = true)]
async fn concurrent_misses_share_one_fetch() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]).with_delay(Duration::from_millis(100)));
    let resolver = resolver(&provider);

    let results = join_all((0..10).map(|_| resolver.resolve(PROVIDER, "k1"))).await;
    assert_eq!(provider.calls(), 1);
    for result in results {
        assert_eq!(result.unwrap().kid(), "k1");
    }
    assert_eq!(resolver.fetches_in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn coalesced_callers_share_a_failure() {
    let provider = Arc::new(
        FakeProvider::failing(FetchError::Status(502)).with_delay(Duration::from_millis(100)),
    );
    let resolver = resolver(&provider);

    let results = join_all((0..5).map(|_| resolver.resolve(PROVIDER, "k1"))).await;
    assert_eq!(provider.calls(), 1);
    for result in results {
        assert!(matches!(
            result,
            Err(KeyResolutionError::Fetch(FetchError::Status(502)))
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn coalesced_callers_asking_for_different_kids() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]).with_delay(Duration::from_millis(50)));
    let resolver = resolver(&provider);

    let (known, unknown) = tokio::join!(
        resolver.resolve(PROVIDER, "k1"),
        resolver.resolve(PROVIDER, "k2"),
    );
    assert_eq!(known.unwrap().kid(), "k1");
    assert!(matches!(unknown, Err(KeyResolutionError::UnknownKeyId { .. })));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn fetch_completes_after_caller_gives_up() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]).with_delay(Duration::from_millis(100)));
    let resolver = resolver(&provider);

    let gave_up = tokio::time::timeout(
        Duration::from_millis(10),
        resolver.resolve(PROVIDER, "k1"),
    )
    .await;
    assert!(gave_up.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(resolver.cache().key_set(PROVIDER).is_fresh());
    assert_eq!(resolver.fetches_in_flight(), 0);

    resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_misses_across_threads_share_one_fetch() {
    for round in 0..20 {
        let provider =
            Arc::new(FakeProvider::publishing(&["k1"]).with_delay(Duration::from_millis(20)));
        let resolver = Arc::new(resolver(&provider));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move { resolver.resolve(PROVIDER, "k1").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().kid(), "k1");
        }
        assert_eq!(provider.calls(), 1, "round {round}");
        assert_eq!(resolver.fetches_in_flight(), 0);
    }
}

// ── Unknown key ids ──

#[tokio::test(start_paused = true)]
async fn unknown_kid_invalidates_and_refetches_next_time() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver(&provider);

    let err = resolver.resolve(PROVIDER, "k2").await.unwrap_err();
    match err {
        KeyResolutionError::UnknownKeyId { provider: p, kid } => {
            assert_eq!(p, PROVIDER);
            assert_eq!(kid, "k2");
        }
        other => panic!("expected UnknownKeyId, got {other:?}"),
    }
    assert!(!resolver.cache().key_set(PROVIDER).is_fresh());

    // The provider rotates its keys.
    provider.publish(jwks_for(&["k1", "k2"]));
    let key = resolver.resolve(PROVIDER, "k2").await.unwrap();
    assert_eq!(key.kid(), "k2");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn generation_advances_on_each_refresh() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver(&provider);

    resolver.resolve(PROVIDER, "k1").await.unwrap();
    let first = resolver.cache().generation(PROVIDER).unwrap();

    resolver.resolve(PROVIDER, "missing").await.unwrap_err();
    let second = resolver.cache().generation(PROVIDER).unwrap();
    assert!(second > first);
}

#[tokio::test(start_paused = true)]
async fn unknown_kid_leaves_newer_entry_alone() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]).with_delay(Duration::from_millis(100)));
    let resolver = Arc::new(resolver(&provider));

    let lookup = tokio::spawn({
        let resolver = Arc::clone(&resolver);
        async move { resolver.resolve(PROVIDER, "k9").await }
    });
    tokio::task::yield_now().await;
    assert_eq!(resolver.fetches_in_flight(), 1);

    // A newer set holding k9 lands while the slow fetch is still running.
    let rotated = jwks_for(&["k1", "k9"]).to_string();
    resolver
        .cache()
        .store(Arc::new(KeySet::from_jwks_json(PROVIDER, rotated.as_bytes()).unwrap()));

    let err = lookup.await.unwrap().unwrap_err();
    assert!(matches!(err, KeyResolutionError::UnknownKeyId { .. }));
    assert!(resolver.cache().key_set(PROVIDER).is_fresh());

    let key = resolver.resolve(PROVIDER, "k9").await.unwrap();
    assert_eq!(key.kid(), "k9");
    assert_eq!(provider.calls(), 1);
}

// ── Whole key sets ──

#[tokio::test(start_paused = true)]
async fn key_set_is_fetched_once_and_cached() {
    let provider = Arc::new(FakeProvider::publishing(&["k1", "k2"]).with_delay(Duration::from_millis(50)));
    let resolver = resolver(&provider);

    let (first, second) = tokio::join!(resolver.key_set(PROVIDER), resolver.key_set(PROVIDER));
    let first = first.unwrap();
    assert!(Arc::ptr_eq(&first, &second.unwrap()));
    assert_eq!(first.len(), 2);

    resolver.resolve(PROVIDER, "k2").await.unwrap();
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn key_set_obeys_the_rate_limit() {
    let provider = Arc::new(FakeProvider::failing(FetchError::Status(503)));
    let resolver = resolver_with(&provider, MAX_AGE, 1);

    let err = resolver.key_set(PROVIDER).await.unwrap_err();
    assert!(matches!(err, KeyResolutionError::Fetch(FetchError::Status(503))));

    provider.recover();
    let err = resolver.key_set(PROVIDER).await.unwrap_err();
    assert!(matches!(err, KeyResolutionError::RateLimited { .. }));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_key_set_served_when_rate_limited() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver_with(&provider, Duration::from_secs(10), 1);

    let fetched = resolver.key_set(PROVIDER).await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;

    let stale = resolver.key_set(PROVIDER).await.unwrap();
    assert!(Arc::ptr_eq(&fetched, &stale));
    assert_eq!(provider.calls(), 1);
}

// ── Rate limiting ──

#[tokio::test(start_paused = true)]
async fn refresh_budget_is_enforced() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver_with(&provider, MAX_AGE, 2);

    for _ in 0..2 {
        let err = resolver.resolve(PROVIDER, "missing").await.unwrap_err();
        assert!(matches!(err, KeyResolutionError::UnknownKeyId { .. }));
    }
    let err = resolver.resolve(PROVIDER, "missing").await.unwrap_err();
    match err {
        KeyResolutionError::RateLimited {
            provider: p,
            retry_after,
        } => {
            assert_eq!(p, PROVIDER);
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(provider.calls(), 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    let err = resolver.resolve(PROVIDER, "missing").await.unwrap_err();
    assert!(matches!(err, KeyResolutionError::UnknownKeyId { .. }));
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn at_most_ten_fetches_per_minute() {
    let provider = Arc::new(FakeProvider::publishing(&[]));
    let resolver = resolver(&provider);

    for _ in 0..30 {
        let _ = resolver.resolve(PROVIDER, "missing").await;
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    // 30 attempts over 30 seconds: only the first ten may reach the network.
    assert_eq!(provider.calls(), 10);
}

#[tokio::test(start_paused = true)]
async fn stale_key_served_when_rate_limited() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver_with(&provider, Duration::from_secs(10), 1);

    resolver.resolve(PROVIDER, "k1").await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;

    let key = resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert_eq!(key.kid(), "k1");
    assert_eq!(provider.calls(), 1);

    // A kid the stale set never held cannot be served.
    let err = resolver.resolve(PROVIDER, "k2").await.unwrap_err();
    assert!(matches!(err, KeyResolutionError::RateLimited { .. }));
}

#[tokio::test(start_paused = true)]
async fn invalidated_key_served_when_rate_limited() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver_with(&provider, MAX_AGE, 1);

    resolver.resolve(PROVIDER, "k1").await.unwrap();
    resolver.cache().invalidate(PROVIDER);

    let key = resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert_eq!(key.kid(), "k1");
    assert_eq!(provider.calls(), 1);
}

// ── Fetch failures ──

#[tokio::test(start_paused = true)]
async fn fetch_errors_propagate() {
    let provider = Arc::new(FakeProvider::failing(FetchError::Status(500)));
    let resolver = resolver(&provider);

    let err = resolver.resolve(PROVIDER, "k1").await.unwrap_err();
    assert!(matches!(err, KeyResolutionError::Fetch(FetchError::Status(500))));
    assert!(resolver.cache().is_empty());
    assert_eq!(resolver.fetches_in_flight(), 0);
    assert_eq!(resolver.cache().ticket_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_previous_entry() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]));
    let resolver = resolver_with(&provider, Duration::from_secs(10), 10);

    resolver.resolve(PROVIDER, "k1").await.unwrap();
    tokio::time::advance(Duration::from_secs(11)).await;

    provider.fail_with(FetchError::Network("connection reset".into()));
    let err = resolver.resolve(PROVIDER, "k1").await.unwrap_err();
    assert!(matches!(err, KeyResolutionError::Fetch(FetchError::Network(_))));
    assert!(resolver.cache().lookup_stale(PROVIDER, "k1").is_some());

    provider.recover();
    resolver.resolve(PROVIDER, "k1").await.unwrap();
    assert!(resolver.cache().key_set(PROVIDER).is_fresh());
    assert_eq!(provider.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_times_out() {
    let provider = Arc::new(FakeProvider::publishing(&["k1"]).with_delay(Duration::from_secs(30)));
    let resolver = resolver(&provider);

    let err = resolver.resolve(PROVIDER, "k1").await.unwrap_err();
    assert!(matches!(
        err,
        KeyResolutionError::Fetch(FetchError::Timeout(t)) if t == Duration::from_secs(5)
    ));
    assert!(resolver.cache().is_empty());
}
