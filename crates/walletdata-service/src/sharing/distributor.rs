use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{stream, Stream, StreamExt};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SharingConfig;

use super::FlowProducer;

/// State of one shared subscription: the single upstream driver plus the
/// bookkeeping needed for replay, observer counting and idle teardown.
struct Subscription<V> {
    /// Fan-out channel between the upstream driver and attached observers.
    sender: broadcast::Sender<V>,
    /// Replay buffer of size one: the last-emitted value.
    replay: Arc<Mutex<Option<V>>>,
    /// Number of currently-attached observers.
    observers: usize,
    /// Bumped on every attach; lets a pending grace timer detect that the
    /// subscription was picked up again.
    epoch: u64,
    /// When the last observer detached, if currently idle.
    idle_since: Option<Instant>,
    /// Cancels the upstream driver task.
    driver: CancellationToken,
    /// Cancels the pending grace-period teardown, if any.
    teardown: Option<CancellationToken>,
}

type SubscriptionTable<V> = Arc<Mutex<FxHashMap<String, Subscription<V>>>>;

/// Multiplexes one upstream subscription per derived key across any number of
/// observers.
///
/// All synchronization is internal; instances are cheap to clone and clones
/// share the same subscription table.
pub struct SharedFlowDistributor<P: FlowProducer> {
    producer: Arc<P>,
    config: SharingConfig,
    subscriptions: SubscriptionTable<P::Value>,
}

impl<P: FlowProducer> Clone for SharedFlowDistributor<P> {
    fn clone(&self) -> Self {
        SharedFlowDistributor {
            producer: Arc::clone(&self.producer),
            config: self.config,
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }
}

impl<P: FlowProducer> std::fmt::Debug for SharedFlowDistributor<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions = self
            .subscriptions
            .try_lock()
            .map(|table| table.len())
            .unwrap_or_default();
        f.debug_struct("SharedFlowDistributor")
            .field("config", &self.config)
            .field("subscriptions", &subscriptions)
            .finish()
    }
}

/// Everything a freshly-attached observer needs to start consuming.
struct Attached<V: Send + 'static> {
    guard: ObserverGuard<V>,
    replay: Option<V>,
    receiver: broadcast::Receiver<V>,
}

impl<P: FlowProducer> SharedFlowDistributor<P> {
    pub fn new(producer: Arc<P>, config: SharingConfig) -> Self {
        SharedFlowDistributor {
            producer,
            config,
            subscriptions: Default::default(),
        }
    }

    /// Subscribes to the continuous value stream for `key`.
    ///
    /// The returned stream is lazy: the shared upstream is only created (or
    /// attached to) on first poll. It is infinite and never yields an error;
    /// cancel it by dropping it, which detaches this observer without
    /// affecting others.
    pub fn subscribe(&self, key: P::Key) -> BoxStream<'static, P::Value> {
        let this = self.clone();
        stream::once(async move { this.attach(&key) })
            .flat_map(|attached| {
                let Attached {
                    guard,
                    replay,
                    receiver,
                } = attached;
                // The guard rides along with the stream and detaches this
                // observer when the stream is dropped.
                stream::iter(replay)
                    .chain(recv_stream(receiver))
                    .map(move |value| {
                        let _ = &guard;
                        value
                    })
            })
            .boxed()
    }

    /// The producer this distributor shares.
    pub fn producer(&self) -> &P {
        &self.producer
    }

    /// The number of observers currently attached to `key`.
    pub fn subscriber_count(&self, key: &P::Key) -> usize {
        let derived = self.producer.derive_key(key);
        let table = self.subscriptions.lock().unwrap();
        table.get(&derived).map_or(0, |sub| sub.observers)
    }

    /// Whether a shared upstream for `key` is currently alive (attached
    /// observers, or idle within the grace period).
    pub fn is_active(&self, key: &P::Key) -> bool {
        let derived = self.producer.derive_key(key);
        self.subscriptions.lock().unwrap().contains_key(&derived)
    }

    fn attach(&self, key: &P::Key) -> Attached<P::Value> {
        let derived = self.producer.derive_key(key);
        let mut table = self.subscriptions.lock().unwrap();

        let subscription = table
            .entry(derived.clone())
            .or_insert_with(|| self.create_subscription(key, &derived));

        if let Some(teardown) = subscription.teardown.take() {
            teardown.cancel();
        }

        // The replay buffer survives going idle only for the configured
        // expiry window. Expired replays are dropped so the observer waits
        // for the next real emission instead.
        let replay_expired = subscription
            .idle_since
            .is_some_and(|idle| idle.elapsed() > self.config.replay_expiry);
        subscription.idle_since = None;
        subscription.observers += 1;
        subscription.epoch += 1;

        metric!(counter("distributor.attach") += 1);

        // Subscribing to the channel and reading the replay buffer happens
        // under the replay mutex, which the driver also holds while sending:
        // the observer can neither miss a value nor see one twice.
        let (receiver, replay) = {
            let mut slot = subscription.replay.lock().unwrap();
            if replay_expired {
                *slot = None;
            }
            (subscription.sender.subscribe(), slot.clone())
        };

        Attached {
            guard: ObserverGuard {
                derived_key: derived,
                subscriptions: Arc::clone(&self.subscriptions),
                grace_period: self.config.grace_period,
            },
            replay,
            receiver,
        }
    }

    fn create_subscription(&self, key: &P::Key, derived: &str) -> Subscription<P::Value> {
        tracing::debug!(key = derived, "Creating shared subscription");
        metric!(counter("distributor.subscription.created") += 1);

        let (sender, _) = broadcast::channel(self.config.channel_capacity);
        let replay = Arc::new(Mutex::new(None));
        let driver = CancellationToken::new();

        tokio::spawn(run_upstream(
            Arc::clone(&self.producer),
            key.clone(),
            derived.to_owned(),
            sender.clone(),
            Arc::clone(&replay),
            self.config.retry_backoff,
            driver.clone(),
        ));

        Subscription {
            sender,
            replay,
            observers: 0,
            epoch: 0,
            idle_since: None,
            driver,
            teardown: None,
        }
    }
}

/// Detaches an observer on drop.
///
/// When the last observer of a key detaches, a cancellable grace-period timer
/// is started; the upstream is torn down only if no observer attaches before
/// it fires.
struct ObserverGuard<V: Send + 'static> {
    derived_key: String,
    subscriptions: SubscriptionTable<V>,
    grace_period: Duration,
}

impl<V: Send + 'static> Drop for ObserverGuard<V> {
    fn drop(&mut self) {
        let mut table = self.subscriptions.lock().unwrap();
        let Some(subscription) = table.get_mut(&self.derived_key) else {
            return;
        };

        subscription.observers -= 1;
        metric!(counter("distributor.detach") += 1);
        if subscription.observers > 0 {
            return;
        }

        // The grace period is anchored at the detach itself, not at the
        // first poll of the timer task.
        let now = Instant::now();
        let deadline = now + self.grace_period;
        subscription.idle_since = Some(now);
        let teardown = CancellationToken::new();
        subscription.teardown = Some(teardown.clone());
        let epoch = subscription.epoch;

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime to host the timer, e.g. the owning runtime is
            // shutting down. Tear the subscription down right away.
            if let Some(subscription) = table.remove(&self.derived_key) {
                subscription.driver.cancel();
            }
            return;
        };

        let key = self.derived_key.clone();
        let subscriptions = Arc::clone(&self.subscriptions);
        handle.spawn(async move {
            tokio::select! {
                _ = teardown.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let mut table = subscriptions.lock().unwrap();
                    let still_idle = table
                        .get(&key)
                        .is_some_and(|sub| sub.observers == 0 && sub.epoch == epoch);
                    if still_idle {
                        tracing::debug!(key = key.as_str(), "Tearing down idle shared subscription");
                        metric!(counter("distributor.subscription.torn_down") += 1);
                        if let Some(subscription) = table.remove(&key) {
                            subscription.driver.cancel();
                        }
                    }
                }
            }
        });
    }
}

/// Drives the single upstream for one derived key.
///
/// Values are deduplicated against the last sent one, stored in the replay
/// buffer, and fanned out to observers. On upstream failure the declared
/// fallback is emitted and the upstream is resubscribed after a fixed
/// backoff, indefinitely, until the subscription is torn down.
async fn run_upstream<P: FlowProducer>(
    producer: Arc<P>,
    key: P::Key,
    derived_key: String,
    sender: broadcast::Sender<P::Value>,
    replay: Arc<Mutex<Option<P::Value>>>,
    backoff: Duration,
    cancel: CancellationToken,
) {
    let mut last_sent: Option<P::Value> = None;

    let send = |value: P::Value, last_sent: &mut Option<P::Value>| {
        *last_sent = Some(value.clone());
        // Update the replay buffer and the channel atomically with respect
        // to attaching observers.
        let mut slot = replay.lock().unwrap();
        *slot = Some(value.clone());
        sender.send(value).ok();
    };

    loop {
        let mut upstream = producer.produce(&key);

        let failed = loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = upstream.next() => item,
            };

            match item {
                Some(Ok(value)) => {
                    // Consecutive equal values are suppressed.
                    if last_sent.as_ref() == Some(&value) {
                        continue;
                    }
                    send(value, &mut last_sent);
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        key = derived_key.as_str(),
                        error = &error as &dyn std::error::Error,
                        "Upstream failed, retrying after backoff"
                    );
                    metric!(counter("distributor.upstream.failure") += 1);
                    break true;
                }
                None => {
                    tracing::debug!(
                        key = derived_key.as_str(),
                        "Upstream ended, resubscribing after backoff"
                    );
                    break false;
                }
            }
        };

        if failed {
            if let Some(fallback) = producer.fallback(&key) {
                if last_sent.as_ref() != Some(&fallback) {
                    metric!(counter("distributor.fallback.emitted") += 1);
                    send(fallback, &mut last_sent);
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
}

/// Turns a broadcast receiver into a stream, skipping over lagged gaps.
fn recv_stream<V: Clone + Send + 'static>(
    receiver: broadcast::Receiver<V>,
) -> impl Stream<Item = V> + Send {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(value) => return Some((value, receiver)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Observer lagged behind the shared stream");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
