//! # The pull-model caching layer
//!
//! This module implements the request/response side of the data-freshness
//! layer: a caller awaits [`CoalescingCache::fetch`] for a set of member ids
//! inside a scope (for example: asset ids priced in one fiat currency), and
//! the cache decides which members can be served from memory and which have
//! to go back to the remote source.
//!
//! ## Coalescing
//!
//! The expensive part of a fetch is the [`RemoteCaller`] invocation, so the
//! cache guarantees that among any number of concurrently-executing fetches
//! with *related* keys (same scope, intersecting member sets) at most one
//! performs the remote call for a given member. This is done with an
//! in-flight lock table: the first caller to need a set of members registers
//! a lock for them and performs the call; related callers find that lock,
//! wait on it, and then re-read the now-populated cache. Unrelated requests
//! (different scope, or disjoint members) never contend.
//!
//! The lock table is transient state: an entry lives only for the duration of
//! one coalesced fetch and is removed on every exit path, including caller
//! cancellation. The durable state is the per-scope set of timestamped
//! entries, which only ever moves forward: a member's value is replaced by a
//! strictly newer fetch and never rolled back.
//!
//! ## Staleness
//!
//! Every cached member carries the instant it was fetched. A member older
//! than the configured TTL is treated exactly like a missing one. A fetch
//! that finds all requested members fresh returns straight from memory
//! without touching the lock table at all.
//!
//! ## Errors
//!
//! [`CacheError`] is the single error type of this layer. Remote failures are
//! propagated verbatim to the caller with no partial cache mutation, bad
//! input fails before any side effect, and internal inconsistencies (a member
//! the remote silently omitted) fail the whole call rather than returning
//! partial data.

mod coalescer;
mod error;
mod key;

pub use coalescer::{CoalescingCache, RemoteCaller};
pub use error::{CacheContents, CacheError};
pub use key::RequestKey;
