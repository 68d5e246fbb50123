use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rustc_hash::FxHashSet;
use tokio::time::advance;
use walletdata_test::{setup, MockRemoteCaller};

use walletdata_service::{CacheContents, CacheError, CoalescingCache, RemoteCaller};

const TTL: Duration = Duration::from_secs(10);

fn members(ids: &[&str]) -> FxHashSet<String> {
    ids.iter().map(|id| id.to_string()).collect()
}

fn quotes_remote() -> Arc<MockRemoteCaller<f64>> {
    let remote = Arc::new(MockRemoteCaller::new());
    remote.respond("usd", "bitcoin", 64000.0);
    remote.respond("usd", "ethereum", 3100.0);
    remote.respond("usd", "solana", 140.0);
    remote
}

fn quotes_cache(remote: Arc<MockRemoteCaller<f64>>) -> CoalescingCache<MockRemoteCaller<f64>> {
    CoalescingCache::new("quotes", remote, TTL)
}

#[tokio::test]
async fn test_blank_scope_fails_without_side_effects() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    let result = cache.fetch("  ", &members(&["bitcoin"])).await;

    assert!(matches!(result, Err(CacheError::InvalidArguments(_))));
    assert_eq!(remote.call_count(), 0);
}

#[tokio::test]
async fn test_empty_member_set_is_a_noop() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    assert_eq!(cache.fetch("usd", &members(&[])).await.unwrap(), HashMap::new());
    // Blank ids are dropped, so an all-blank set degenerates to the same.
    assert_eq!(
        cache.fetch("usd", &members(&["", "  "])).await.unwrap(),
        HashMap::new()
    );
    assert_eq!(remote.call_count(), 0);
}

#[tokio::test]
async fn test_blank_members_are_dropped_from_the_request() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    let result = cache.fetch("usd", &members(&["bitcoin", " "])).await.unwrap();

    assert_eq!(result, HashMap::from([("bitcoin".to_owned(), 64000.0)]));
    let calls = remote.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.iter().collect::<Vec<_>>(), vec!["bitcoin"]);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_members_are_served_from_memory() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    let first = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    advance(Duration::from_secs(5)).await;
    let second = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(remote.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_members_are_refetched() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    advance(TTL + Duration::from_secs(1)).await;
    cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();

    assert_eq!(remote.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_only_the_stale_subset_goes_remote() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    advance(Duration::from_secs(5)).await;

    // bitcoin is still fresh; only ethereum needs the remote source.
    let result = cache
        .fetch("usd", &members(&["bitcoin", "ethereum"]))
        .await
        .unwrap();

    assert_eq!(result.len(), 2);
    let calls = remote.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1.iter().collect::<Vec<_>>(), vec!["ethereum"]);
}

#[tokio::test(start_paused = true)]
async fn test_related_concurrent_fetches_are_coalesced() {
    setup();
    let remote = quotes_remote();
    remote.set_latency(Duration::from_secs(1));
    let cache = quotes_cache(Arc::clone(&remote));

    // Both fetches need ethereum. The second one waits on the first and then
    // goes remote only for the member the first did not cover.
    let eth_sol = members(&["ethereum", "solana"]);
    let eth_btc = members(&["ethereum", "bitcoin"]);
    let (first, second) = tokio::join!(
        cache.fetch("usd", &eth_sol),
        cache.fetch("usd", &eth_btc),
    );

    assert_eq!(first.unwrap().len(), 2);
    assert_eq!(second.unwrap().len(), 2);
    assert_eq!(remote.calls_for_member("ethereum"), 1);

    let calls = remote.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[0].1.iter().collect::<Vec<_>>(),
        vec!["ethereum", "solana"]
    );
    assert_eq!(calls[1].1.iter().collect::<Vec<_>>(), vec!["bitcoin"]);
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_fetches_do_not_contend() {
    setup();
    let remote = quotes_remote();
    remote.set_latency(Duration::from_secs(1));
    let cache = quotes_cache(Arc::clone(&remote));

    // Same scope, disjoint members: both go remote on their own.
    let btc = members(&["bitcoin"]);
    let sol = members(&["solana"]);
    let (first, second) = tokio::join!(cache.fetch("usd", &btc), cache.fetch("usd", &sol));

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(remote.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scopes_are_isolated() {
    setup();
    let remote = quotes_remote();
    remote.respond("eur", "bitcoin", 59000.0);
    let cache = quotes_cache(Arc::clone(&remote));

    let usd = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    let eur = cache.fetch("eur", &members(&["bitcoin"])).await.unwrap();

    assert_eq!(usd["bitcoin"], 64000.0);
    assert_eq!(eur["bitcoin"], 59000.0);
    assert_eq!(remote.call_count(), 2);
}

#[tokio::test]
async fn test_remote_failure_caches_nothing() {
    setup();
    let remote = quotes_remote();
    remote.fail_with(CacheError::Api("rate limited".into()));
    let cache = quotes_cache(Arc::clone(&remote));

    let result = cache.fetch("usd", &members(&["bitcoin"])).await;
    assert!(matches!(result, Err(CacheError::Api(_))));

    // After recovering, the member is fetched again: the failed call left no
    // durable state and released its in-flight lock.
    remote.recover();
    let result = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    assert_eq!(result["bitcoin"], 64000.0);
    assert_eq!(remote.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_fetch_releases_its_lock() {
    setup();
    let remote = quotes_remote();
    remote.set_latency(Duration::from_secs(60));
    let cache = quotes_cache(Arc::clone(&remote));

    let racing = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.fetch("usd", &members(&["bitcoin"])).await })
    };
    // Let the spawned fetch register its in-flight entry, then cancel it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    racing.abort();
    assert!(racing.await.unwrap_err().is_cancelled());

    remote.set_latency(Duration::ZERO);
    let result = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    assert_eq!(result["bitcoin"], 64000.0);
    assert_eq!(remote.call_count(), 2);
}

#[tokio::test]
async fn test_silently_omitted_member_fails_the_whole_call() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    // "dogecoin" is not configured, so the remote response omits it.
    let result = cache
        .fetch("usd", &members(&["bitcoin", "dogecoin"]))
        .await;

    assert!(matches!(result, Err(CacheError::CacheOperation(_))));

    // The members that did come back were cached before the call failed.
    let result = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    assert_eq!(result["bitcoin"], 64000.0);
    assert_eq!(remote.call_count(), 1);
}

#[tokio::test]
async fn test_clear_drops_all_entries() {
    setup();
    let remote = quotes_remote();
    let cache = quotes_cache(Arc::clone(&remote));

    cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    cache.clear();
    cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();

    assert_eq!(remote.call_count(), 2);
}

/// Answers every call with the whole scope table, like a batch endpoint that
/// ignores the requested subset.
struct BatchRemote;

impl RemoteCaller for BatchRemote {
    type Value = f64;

    fn call<'a>(
        &'a self,
        _scope_id: &'a str,
        _member_ids: &'a FxHashSet<String>,
    ) -> BoxFuture<'a, CacheContents<HashMap<String, f64>>> {
        Box::pin(async {
            Ok(HashMap::from([
                ("bitcoin".to_owned(), 64000.0),
                ("ethereum".to_owned(), 3100.0),
            ]))
        })
    }
}

#[tokio::test]
async fn test_extra_remote_members_are_cached_too() {
    setup();
    let cache = CoalescingCache::new("quotes", Arc::new(BatchRemote), TTL);

    let result = cache.fetch("usd", &members(&["bitcoin"])).await.unwrap();
    assert_eq!(result, HashMap::from([("bitcoin".to_owned(), 64000.0)]));

    // ethereum arrived as a byproduct of the first call and is served from
    // memory without another remote round trip. The debug form exposes an
    // empty lock table, proving the first fetch cleaned up after itself.
    assert!(format!("{cache:?}").contains("in-flight requests: 0"));
    let result = cache.fetch("usd", &members(&["ethereum"])).await.unwrap();
    assert_eq!(result["ethereum"], 3100.0);
}
