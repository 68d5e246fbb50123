//! # The push-model sharing layer
//!
//! Continuously-updating data (a balance several screens display at once) is
//! delivered through [`SharedFlowDistributor::subscribe`]: a lazy, infinite,
//! push-based stream of values. The distributor multiplexes one upstream
//! subscription per derived key across any number of observers.
//!
//! ## Lifecycle
//!
//! The upstream is instantiated when the first observer attaches. A
//! newly-attaching observer immediately receives the most recent value if one
//! was emitted and is still within its replay window; otherwise it waits for
//! the next emission. When the last observer detaches, a grace-period timer
//! starts; the upstream is only cancelled if no observer attaches before it
//! elapses. Attaching during the grace period cancels the pending teardown.
//!
//! ## Failure handling
//!
//! Observers never see a terminal error. When the upstream fails, the
//! [`FlowProducer`]'s declared fallback value (if any) is emitted to all
//! current observers, and after a fixed backoff the upstream is resubscribed
//! from scratch. This loops for as long as the subscription is alive. A
//! fallback is a value, not an error channel: observers cannot tell it from
//! real data unless the value type itself encodes the distinction.
//!
//! Consecutive equal values are suppressed, and all observers of a key see
//! emissions in the same relative order.

mod distributor;
mod producer;

pub use distributor::SharedFlowDistributor;
pub use producer::{FlowProducer, ProduceError, Store, StoreProducer};
