//! The data-freshness layer of the wallet backend.
//!
//! Many independent consumers (screens, background refreshers, widgets) ask
//! for the same externally-sourced, rate-limited data: fiat quotes for a set
//! of assets, network/account/staking balances. This crate provides the two
//! delivery models they share:
//!
//! - [`caching::CoalescingCache`], the pull model: callers await a keyed
//!   request/response resource. Concurrent overlapping requests are coalesced
//!   into one remote call, and results are kept in a bounded-staleness cache.
//! - [`sharing::SharedFlowDistributor`], the push model: callers subscribe to
//!   a continuous stream of values. One upstream subscription is multiplexed
//!   across all observers of a key, with replay, retry-with-fallback, and
//!   idle teardown.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod sharing;
pub mod utils;

pub use caching::{CacheContents, CacheError, CoalescingCache, RemoteCaller, RequestKey};
pub use config::Config;
pub use sharing::{FlowProducer, ProduceError, SharedFlowDistributor, Store, StoreProducer};
