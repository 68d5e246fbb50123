use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

/// A transient upstream failure.
///
/// The distributor never surfaces this to observers; it substitutes the
/// producer's fallback value (if declared) and retries in the background.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("upstream failed: {0}")]
pub struct ProduceError(pub String);

/// A description of how to produce a continuous value stream for a key.
///
/// Producers are stateless and side-effect-free to construct; all lifecycle
/// state lives in the [`SharedFlowDistributor`](super::SharedFlowDistributor).
pub trait FlowProducer: Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Value: Clone + PartialEq + Send + Sync + 'static;

    /// Derives the string under which subscriptions for `key` are shared,
    /// e.g. `"balance_{wallet_id}_{network}"`. Callers of the distributor own
    /// this mapping; the distributor itself stays generic.
    fn derive_key(&self, key: &Self::Key) -> String;

    /// Instantiates the underlying stream. The stream is expected to be
    /// infinite; ending is treated like an outage and triggers a
    /// resubscription after the backoff.
    fn produce(&self, key: &Self::Key) -> BoxStream<'static, Result<Self::Value, ProduceError>>;

    /// The value to show while the real stream is unavailable.
    ///
    /// `None` means no fallback: observers simply stop receiving values
    /// during an outage and resume once the upstream recovers.
    fn fallback(&self, _key: &Self::Key) -> Option<Self::Value> {
        None
    }
}

/// A key-value holder that downstream fetchers write into and that producers
/// read from. Writing is done by an external collaborator; this layer only
/// observes. Implementations synchronize internally.
pub trait Store: Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Pushes the current value whenever it changes.
    fn observe(&self, key: &Self::Key) -> BoxStream<'static, Self::Value>;
}

type DeriveFn<K> = Box<dyn Fn(&K) -> String + Send + Sync>;
type FallbackFn<K, V> = Box<dyn Fn(&K) -> Option<V> + Send + Sync>;

/// Adapts a [`Store`] into a [`FlowProducer`].
///
/// Most producers in the wallet are exactly this shape: observe one store
/// key, share the stream, optionally declare a fallback.
pub struct StoreProducer<S: Store> {
    store: Arc<S>,
    derive: DeriveFn<S::Key>,
    fallback: FallbackFn<S::Key, S::Value>,
}

impl<S: Store> StoreProducer<S> {
    pub fn new<D>(store: Arc<S>, derive: D) -> Self
    where
        D: Fn(&S::Key) -> String + Send + Sync + 'static,
    {
        StoreProducer {
            store,
            derive: Box::new(derive),
            fallback: Box::new(|_| None),
        }
    }

    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&S::Key) -> Option<S::Value> + Send + Sync + 'static,
    {
        self.fallback = Box::new(fallback);
        self
    }
}

impl<S: Store> FlowProducer for StoreProducer<S>
where
    S::Value: PartialEq,
{
    type Key = S::Key;
    type Value = S::Value;

    fn derive_key(&self, key: &Self::Key) -> String {
        (self.derive)(key)
    }

    fn produce(&self, key: &Self::Key) -> BoxStream<'static, Result<Self::Value, ProduceError>> {
        self.store.observe(key).map(Ok).boxed()
    }

    fn fallback(&self, key: &Self::Key) -> Option<Self::Value> {
        (self.fallback)(key)
    }
}
