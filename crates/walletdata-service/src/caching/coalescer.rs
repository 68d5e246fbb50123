use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;

use crate::utils::defer::defer;

use super::{CacheContents, CacheError, RequestKey};

/// The remote source a [`CoalescingCache`] fetches from.
///
/// Implementations are expected to carry their own timeout. Returning a map
/// that omits some of the requested members is legal; the cache treats an
/// omitted member as still missing and fails the fetch that needed it.
pub trait RemoteCaller: Send + Sync + 'static {
    type Value: Clone + Send + Sync + 'static;

    fn call<'a>(
        &'a self,
        scope_id: &'a str,
        member_ids: &'a FxHashSet<String>,
    ) -> BoxFuture<'a, CacheContents<HashMap<String, Self::Value>>>;
}

/// A cached value for one member, timestamped with the instant it was
/// fetched. Entries are immutable; refreshing a member replaces its entry.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    fetched_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

/// One coalesced fetch currently in flight.
///
/// The lock is held by the caller performing the remote call for
/// `key.member_ids()`; related callers wait on it and then re-read the cache.
struct InFlight {
    key: RequestKey,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl InFlight {
    /// Creates an entry with its lock already held by the creator, so the
    /// entry is never observable unlocked while its fetch is pending.
    fn new_held(
        scope_id: &str,
        member_ids: FxHashSet<String>,
    ) -> (Arc<Self>, OwnedMutexGuard<()>) {
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::clone(&lock)
            .try_lock_owned()
            .expect("the lock is freshly created");
        let flight = Arc::new(InFlight {
            key: RequestKey::new(scope_id, member_ids),
            lock,
        });
        (flight, guard)
    }
}

type ScopedEntries<V> = FxHashMap<String, FxHashMap<String, CacheEntry<V>>>;

/// A bounded-staleness cache that coalesces concurrent overlapping fetches
/// into one [`RemoteCaller`] invocation.
///
/// All synchronization is internal; instances are cheap to clone and clones
/// share the same durable cache and lock table.
pub struct CoalescingCache<R: RemoteCaller> {
    name: &'static str,
    remote: Arc<R>,
    ttl: Duration,

    /// The durable cache: per scope id, the set of timestamped member entries.
    entries: Arc<Mutex<ScopedEntries<R::Value>>>,

    /// The transient in-flight lock table. All check-or-create mutations
    /// happen under this one mutex, even though the fetches themselves run
    /// unlocked and concurrently.
    in_flight: Arc<Mutex<Vec<Arc<InFlight>>>>,
}

impl<R: RemoteCaller> std::fmt::Debug for CoalescingCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|table| table.len())
            .unwrap_or_default();
        f.debug_struct("CoalescingCache")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .field("in-flight requests", &in_flight)
            .finish()
    }
}

impl<R: RemoteCaller> Clone for CoalescingCache<R> {
    fn clone(&self) -> Self {
        CoalescingCache {
            name: self.name,
            remote: Arc::clone(&self.remote),
            ttl: self.ttl,
            entries: Arc::clone(&self.entries),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<R: RemoteCaller> CoalescingCache<R> {
    pub fn new(name: &'static str, remote: Arc<R>, ttl: Duration) -> Self {
        CoalescingCache {
            name,
            remote,
            ttl,
            entries: Default::default(),
            in_flight: Default::default(),
        }
    }

    /// Fetches values for `member_ids` within `scope_id`.
    ///
    /// Members cached within the TTL are served from memory; the rest are
    /// fetched from the remote source, deduplicated against any related fetch
    /// already in flight. The returned map covers exactly the requested
    /// members (blank ids are dropped).
    ///
    /// # Errors
    ///
    /// - [`CacheError::InvalidArguments`] if `scope_id` is blank. No side
    ///   effects.
    /// - [`CacheError::Api`] if the remote call failed. Nothing is cached and
    ///   the in-flight lock is released.
    /// - [`CacheError::CacheOperation`] if a requested member is still absent
    ///   after a successful remote call. The call fails as a whole rather
    ///   than returning partial data.
    pub async fn fetch(
        &self,
        scope_id: &str,
        member_ids: &FxHashSet<String>,
    ) -> CacheContents<HashMap<String, R::Value>> {
        if scope_id.trim().is_empty() {
            return Err(CacheError::InvalidArguments(
                "scope id must not be blank".into(),
            ));
        }

        let requested: FxHashSet<String> = member_ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .cloned()
            .collect();
        if requested.is_empty() {
            return Ok(HashMap::new());
        }

        metric!(counter("coalescer.fetch") += 1, "cache" => self.name);

        loop {
            let (resolved, missing) = self.partition(scope_id, &requested);
            if missing.is_empty() {
                metric!(counter("coalescer.memory.hit") += 1, "cache" => self.name);
                return Ok(resolved);
            }

            let (flight, held) = self.check_or_create_flight(scope_id, missing);

            let Some(held) = held else {
                // A related fetch is in flight. Wait for it to finish, then
                // re-evaluate the cache; any members it did not cover are
                // picked up by the next loop iteration under a lock of their
                // own, so they stay visible to other concurrent callers.
                metric!(counter("coalescer.coalesced_wait") += 1, "cache" => self.name);
                tracing::trace!(
                    cache = self.name,
                    key = %flight.key,
                    "Waiting on a related in-flight fetch"
                );
                drop(flight.lock.lock().await);
                continue;
            };

            // The lock-table entry is removed on every exit path, including
            // caller cancellation, so no waiter is left behind.
            let _cleanup = {
                let table = Arc::clone(&self.in_flight);
                let flight = Arc::clone(&flight);
                defer(move || {
                    let mut table = table.lock().unwrap();
                    table.retain(|entry| !Arc::ptr_eq(entry, &flight));
                })
            };

            // Released before the cleanup guard runs.
            let _guard = held;

            // The cache may have been populated by the fetch that released
            // this very lock; only go remote for what is still missing.
            let (_, still_missing) = self.partition(scope_id, &requested);
            if !still_missing.is_empty() {
                tracing::debug!(
                    cache = self.name,
                    scope_id,
                    members = still_missing.len(),
                    "Fetching members from the remote source"
                );
                metric!(counter("coalescer.remote_call") += 1, "cache" => self.name);
                metric!(
                    histogram("coalescer.remote_call.members") = still_missing.len() as u64,
                    "cache" => self.name,
                );

                let fetched = self.remote.call(scope_id, &still_missing).await?;
                self.insert(scope_id, fetched);
            }

            return self.collect(scope_id, &requested);
        }
    }

    /// Drops all durable entries for all scopes.
    ///
    /// In-flight fetches are unaffected; their results repopulate the cache.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Splits `requested` into fresh values served from the cache and the
    /// stale-or-absent remainder.
    fn partition(
        &self,
        scope_id: &str,
        requested: &FxHashSet<String>,
    ) -> (HashMap<String, R::Value>, FxHashSet<String>) {
        let entries = self.entries.lock().unwrap();
        let scoped = entries.get(scope_id);

        let mut resolved = HashMap::with_capacity(requested.len());
        let mut missing = FxHashSet::default();

        for id in requested {
            match scoped.and_then(|scoped| scoped.get(id)) {
                Some(entry) if !entry.is_expired(self.ttl) => {
                    resolved.insert(id.clone(), entry.value.clone());
                }
                _ => {
                    missing.insert(id.clone());
                }
            }
        }

        (resolved, missing)
    }

    /// Finds a related in-flight fetch to wait on, or registers a new one
    /// with its lock already held.
    ///
    /// The whole check-or-create sequence, including taking the new entry's
    /// lock, is a single atomic region under the table mutex: a registered
    /// entry is never observable unlocked while its fetch is pending, so two
    /// callers racing to fetch overlapping members cannot both end up as
    /// creators for the same members. A returned guard means the caller
    /// created (and thus owns) the entry.
    fn check_or_create_flight(
        &self,
        scope_id: &str,
        missing: FxHashSet<String>,
    ) -> (Arc<InFlight>, Option<OwnedMutexGuard<()>>) {
        let mut table = self.in_flight.lock().unwrap();

        if let Some(pos) = table
            .iter()
            .position(|entry| entry.key.is_related(scope_id, &missing))
        {
            let is_locked = table[pos].lock.try_lock().is_err();
            if is_locked {
                // A related fetch is running, wait on it.
                return (Arc::clone(&table[pos]), None);
            }

            // A prior holder finished but its entry was not yet cleaned up.
            // Replace it with a fresh, already-held entry inside this same
            // critical section.
            let (flight, guard) = InFlight::new_held(scope_id, missing);
            table[pos] = Arc::clone(&flight);
            return (flight, Some(guard));
        }

        let (flight, guard) = InFlight::new_held(scope_id, missing);
        table.push(Arc::clone(&flight));
        (flight, Some(guard))
    }

    /// Merges remote results into the durable cache. New entries win over
    /// existing ones for the same member; members the caller did not ask for
    /// are kept as well.
    fn insert(&self, scope_id: &str, fetched: HashMap<String, R::Value>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let scoped = entries.entry(scope_id.to_owned()).or_default();
        for (id, value) in fetched {
            scoped.insert(
                id,
                CacheEntry {
                    value,
                    fetched_at: now,
                },
            );
        }
    }

    /// Assembles the response for the full originally-requested member set
    /// from the cache.
    fn collect(
        &self,
        scope_id: &str,
        requested: &FxHashSet<String>,
    ) -> CacheContents<HashMap<String, R::Value>> {
        let entries = self.entries.lock().unwrap();
        let scoped = entries.get(scope_id);

        let mut resolved = HashMap::with_capacity(requested.len());
        for id in requested {
            match scoped.and_then(|scoped| scoped.get(id)) {
                Some(entry) => {
                    resolved.insert(id.clone(), entry.value.clone());
                }
                None => {
                    tracing::error!(
                        cache = self.name,
                        scope_id,
                        member_id = id.as_str(),
                        "Member missing from the cache after a successful remote call"
                    );
                    return Err(CacheError::CacheOperation(format!(
                        "member '{id}' missing after remote call"
                    )));
                }
            }
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRemote;

    impl RemoteCaller for NoopRemote {
        type Value = u32;

        fn call<'a>(
            &'a self,
            _scope_id: &'a str,
            _member_ids: &'a FxHashSet<String>,
        ) -> BoxFuture<'a, CacheContents<HashMap<String, u32>>> {
            Box::pin(async { Ok(HashMap::new()) })
        }
    }

    fn members(ids: &[&str]) -> FxHashSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn test_registered_flight_is_never_observable_unlocked() {
        let cache = CoalescingCache::new("quotes", Arc::new(NoopRemote), Duration::from_secs(10));

        // The creator receives the entry's lock straight out of the
        // registration critical section.
        let (flight, held) =
            cache.check_or_create_flight("usd", members(&["bitcoin", "ethereum"]));
        assert!(held.is_some());

        // An overlapping caller arriving before the creator has made any
        // progress must find the entry locked and become a waiter, not a
        // second creator.
        let (related, held) = cache.check_or_create_flight("usd", members(&["ethereum"]));
        assert!(held.is_none());
        assert!(Arc::ptr_eq(&flight, &related));

        // Disjoint members register independently.
        let (_, held) = cache.check_or_create_flight("usd", members(&["solana"]));
        assert!(held.is_some());
    }

    #[test]
    fn test_stale_unlocked_entry_is_replaced() {
        let cache = CoalescingCache::new("quotes", Arc::new(NoopRemote), Duration::from_secs(10));

        let (stale, held) = cache.check_or_create_flight("usd", members(&["bitcoin"]));
        drop(held);

        // The holder released its lock but its cleanup guard has not run
        // yet; the next related caller replaces the entry and owns the
        // fresh one instead of waiting on nobody.
        let (fresh, held) = cache.check_or_create_flight("usd", members(&["bitcoin"]));
        assert!(held.is_some());
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(cache.in_flight.lock().unwrap().len(), 1);
    }
}
