//! Helpers for testing the data-freshness layer.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - The mocks here are deterministic on purpose: combined with
//!    `#[tokio::test(start_paused = true)]`, sleeps in scripted producers and
//!    remote-call latencies advance virtual time instead of wall-clock time.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{stream, StreamExt};
use rustc_hash::FxHashSet;
use tokio::sync::broadcast;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use walletdata_service::caching::{CacheContents, CacheError, RemoteCaller};
use walletdata_service::sharing::{FlowProducer, ProduceError, Store};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the
///    `walletdata-service` crate and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("walletdata_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A programmable [`RemoteCaller`] that records every invocation.
///
/// Responses are configured per scope and member with [`respond`](Self::respond).
/// The mock answers with the intersection of the configured members and the
/// requested ones, so silently-omitted members can be simulated by simply not
/// configuring them.
#[derive(Default)]
pub struct MockRemoteCaller<V> {
    responses: Mutex<HashMap<String, HashMap<String, V>>>,
    failure: Mutex<Option<CacheError>>,
    latency: Mutex<Duration>,
    calls: Mutex<Vec<(String, BTreeSet<String>)>>,
}

impl<V: Clone + Send + Sync + 'static> MockRemoteCaller<V> {
    pub fn new() -> Self {
        MockRemoteCaller {
            responses: Default::default(),
            failure: Default::default(),
            latency: Default::default(),
            calls: Default::default(),
        }
    }

    /// Configures the value returned for `member_id` within `scope_id`.
    pub fn respond(&self, scope_id: &str, member_id: &str, value: V) {
        self.responses
            .lock()
            .unwrap()
            .entry(scope_id.to_owned())
            .or_default()
            .insert(member_id.to_owned(), value);
    }

    /// Makes every subsequent call fail with `error`.
    pub fn fail_with(&self, error: CacheError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    /// Clears a failure configured with [`fail_with`](Self::fail_with).
    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Artificial latency applied to every call; combined with paused time
    /// this holds a call in flight while concurrent fetches race against it.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// All recorded invocations, in order, with sorted member sets.
    pub fn calls(&self) -> Vec<(String, BTreeSet<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// How many recorded invocations requested `member_id`.
    pub fn calls_for_member(&self, member_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, members)| members.contains(member_id))
            .count()
    }
}

impl<V: Clone + Send + Sync + 'static> RemoteCaller for MockRemoteCaller<V> {
    type Value = V;

    fn call<'a>(
        &'a self,
        scope_id: &'a str,
        member_ids: &'a FxHashSet<String>,
    ) -> BoxFuture<'a, CacheContents<HashMap<String, V>>> {
        self.calls.lock().unwrap().push((
            scope_id.to_owned(),
            member_ids.iter().cloned().collect::<BTreeSet<_>>(),
        ));

        let latency = *self.latency.lock().unwrap();
        let failure = self.failure.lock().unwrap().clone();
        let response: HashMap<String, V> = {
            let responses = self.responses.lock().unwrap();
            responses
                .get(scope_id)
                .map(|scoped| {
                    member_ids
                        .iter()
                        .filter_map(|id| scoped.get(id).map(|value| (id.clone(), value.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };

        Box::pin(async move {
            if latency > Duration::ZERO {
                tokio::time::sleep(latency).await;
            }
            match failure {
                Some(error) => Err(error),
                None => Ok(response),
            }
        })
    }
}

/// An observable in-memory key-value holder.
///
/// [`put`](Self::put) plays the role of the external fetcher collaborator:
/// it stores the value and pushes it to every active observer.
pub struct MockStore<V> {
    values: Mutex<HashMap<String, V>>,
    channels: Mutex<HashMap<String, broadcast::Sender<V>>>,
}

impl<V: Clone + Send + Sync + 'static> MockStore<V> {
    pub fn new() -> Self {
        MockStore {
            values: Default::default(),
            channels: Default::default(),
        }
    }

    pub fn put(&self, key: &str, value: V) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_owned(), value.clone());
        if let Some(sender) = self.channels.lock().unwrap().get(key) {
            sender.send(value).ok();
        }
    }

    fn sender(&self, key: &str) -> broadcast::Sender<V> {
        self.channels
            .lock()
            .unwrap()
            .entry(key.to_owned())
            .or_insert_with(|| broadcast::channel(16).0)
            .clone()
    }
}

impl<V: Clone + Send + Sync + 'static> Default for MockStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Store for MockStore<V> {
    type Key = String;
    type Value = V;

    fn observe(&self, key: &Self::Key) -> BoxStream<'static, V> {
        // Subscribe first so a concurrent `put` is either seen as the
        // current value or received from the channel.
        let receiver = self.sender(key).subscribe();
        let current = self.values.lock().unwrap().get(key).cloned();

        let updates = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(value) => return Some((value, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        stream::iter(current).chain(updates).boxed()
    }
}

/// One step of a [`ScriptedProducer`] run.
pub enum Step<V> {
    /// Emit a value.
    Emit(V),
    /// Fail the upstream with the given cause.
    Fail(&'static str),
    /// Sleep before the next step.
    Wait(Duration),
    /// End the stream (the distributor treats this like an outage without a
    /// fallback emission).
    End,
}

/// A [`FlowProducer`] driven by per-run scripts.
///
/// Every `produce` invocation consumes the next queued run; a run with no
/// explicit [`Step::End`] stays pending forever after its last step, like a
/// healthy upstream that currently has nothing new to say. The number of
/// `produce` invocations is recorded, which makes single-upstream assertions
/// trivial.
pub struct ScriptedProducer<V> {
    runs: Mutex<VecDeque<Vec<Step<V>>>>,
    produced: AtomicUsize,
    fallback: Option<V>,
}

impl<V: Clone + PartialEq + Send + Sync + 'static> ScriptedProducer<V> {
    pub fn new() -> Self {
        ScriptedProducer {
            runs: Default::default(),
            produced: AtomicUsize::new(0),
            fallback: None,
        }
    }

    pub fn with_fallback(fallback: V) -> Self {
        ScriptedProducer {
            runs: Default::default(),
            produced: AtomicUsize::new(0),
            fallback: Some(fallback),
        }
    }

    /// Queues the script for the next upstream run.
    pub fn push_run(&self, steps: Vec<Step<V>>) {
        self.runs.lock().unwrap().push_back(steps);
    }

    /// How many times an upstream stream was instantiated.
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> Default for ScriptedProducer<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> FlowProducer for ScriptedProducer<V> {
    type Key = String;
    type Value = V;

    fn derive_key(&self, key: &String) -> String {
        key.clone()
    }

    fn produce(&self, _key: &String) -> BoxStream<'static, Result<V, ProduceError>> {
        self.produced.fetch_add(1, Ordering::SeqCst);
        let steps = self.runs.lock().unwrap().pop_front().unwrap_or_default();

        stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next() {
                    Some(Step::Emit(value)) => return Some((Ok(value), steps)),
                    Some(Step::Fail(cause)) => {
                        return Some((Err(ProduceError(cause.to_owned())), steps))
                    }
                    Some(Step::Wait(duration)) => {
                        tokio::time::sleep(duration).await;
                        continue;
                    }
                    Some(Step::End) => return None,
                    None => {
                        // Out of steps: stay pending like a quiet upstream.
                        futures::future::pending::<()>().await;
                        unreachable!()
                    }
                }
            }
        })
        .boxed()
    }

    fn fallback(&self, _key: &String) -> Option<V> {
        self.fallback.clone()
    }
}
