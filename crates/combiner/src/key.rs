//! Per-key de-duplication of concurrent asynchronous calls (stampede
//! protection).
//!
//! Callers asking for the same key while a call for it is outstanding attach
//! to that call instead of starting another one. Once the call completes the
//! key's holder is reset, so the next request starts a fresh round instead
//! of reusing a cached result or a cached failure.

use std::hash::Hash;
use std::sync::Arc;

use coalesce_core::{CoalesceResult, ResponseFuture};
use coalesce_flusher::{EngineRuntime, RequestQueueBatcher, TaskExecutor};
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

/// Result handed to every caller attached to one round.
pub type Coalesced<V> = Shared<BoxFuture<'static, CoalesceResult<V>>>;

struct Round<V> {
    /// Callers that joined this round, including ones that have since
    /// dropped their future; zero exactly when `future` is `None`.
    attached: usize,
    future: Option<Coalesced<V>>,
}

struct Holder<V> {
    round: Mutex<Round<V>>,
}

impl<V> Holder<V> {
    fn new() -> Self {
        Self {
            round: Mutex::new(Round {
                attached: 0,
                future: None,
            }),
        }
    }

    fn clear(&self) -> usize {
        let mut round = self.round.lock();
        let attached = std::mem::take(&mut round.attached);
        round.future = None;
        attached
    }
}

/// Coalesces calls per key with a supplier chosen at each call site.
pub struct KeyCombiner<K, V> {
    name: String,
    holders: DashMap<K, Arc<Holder<V>>>,
    executor: Arc<dyn TaskExecutor>,
}

impl<K, V> KeyCombiner<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            name: name.into(),
            holders: DashMap::new(),
            executor,
        }
    }

    pub fn with_tokio(name: impl Into<String>) -> CoalesceResult<Self> {
        Ok(Self::new(name, EngineRuntime::tokio()?.executor))
    }

    /// Returns the outstanding call for `key`, or starts one with `supplier`.
    /// `supplier` runs under the key's lock and must only build the future.
    pub fn add_with<F>(&self, key: K, supplier: F) -> Coalesced<V>
    where
        F: FnOnce(K) -> BoxFuture<'static, CoalesceResult<V>>,
    {
        let holder = Arc::clone(
            self.holders
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Holder::new()))
                .value(),
        );

        let mut round = holder.round.lock();
        round.attached += 1;
        if let Some(future) = &round.future {
            metrics::counter!("combiner.key.coalesced", "engine" => self.name.clone())
                .increment(1);
            trace!(engine = %self.name, ?key, attached = round.attached, "Attached to call in flight");
            return future.clone();
        }

        metrics::counter!("combiner.key.invocations", "engine" => self.name.clone()).increment(1);
        debug!(engine = %self.name, ?key, "Starting call");
        let future = supplier(key).shared();
        round.future = Some(future.clone());
        drop(round);

        // Drive the call to completion even if every caller drops its future,
        // then reset the holder for the next round.
        let driver = future.clone();
        let name = self.name.clone();
        self.executor.execute(Box::pin(async move {
            let failed = driver.await.is_err();
            let attached = holder.clear();
            trace!(engine = %name, attached, failed, "Call finished, holder reset");
        }));
        future
    }

    /// Keys with a call currently outstanding.
    pub fn in_flight_keys(&self) -> usize {
        self.holders
            .iter()
            .filter(|entry| entry.value().round.lock().future.is_some())
            .count()
    }

    /// Callers that joined the outstanding call for `key`, whether or not
    /// they are still polling it. Zero when no call is outstanding.
    pub fn attached(&self, key: &K) -> usize {
        self.holders
            .get(key)
            .map(|holder| holder.round.lock().attached)
            .unwrap_or(0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

type KeySupplier<K, V> = Arc<dyn Fn(K) -> BoxFuture<'static, CoalesceResult<V>> + Send + Sync>;

/// Coalesces calls per key around one fixed asynchronous supplier.
pub struct KeyCoalescer<K, V> {
    combiner: KeyCombiner<K, V>,
    supplier: KeySupplier<K, V>,
}

impl<K, V> KeyCoalescer<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F>(name: impl Into<String>, supplier: F, executor: Arc<dyn TaskExecutor>) -> Self
    where
        F: Fn(K) -> BoxFuture<'static, CoalesceResult<V>> + Send + Sync + 'static,
    {
        let combiner = KeyCombiner::new(name, executor);
        info!(engine = %combiner.name, "Key coalescer initialized");
        Self {
            combiner,
            supplier: Arc::new(supplier),
        }
    }

    pub fn with_tokio<F>(name: impl Into<String>, supplier: F) -> CoalesceResult<Self>
    where
        F: Fn(K) -> BoxFuture<'static, CoalesceResult<V>> + Send + Sync + 'static,
    {
        Ok(Self::new(name, supplier, EngineRuntime::tokio()?.executor))
    }

    /// De-duplicates in front of a batcher: one queued request per key at a time.
    pub fn over_batcher(
        batcher: RequestQueueBatcher<K, V>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let name = format!("{}.dedup", batcher.name());
        Self::new(
            name,
            move |key: K| -> BoxFuture<'static, CoalesceResult<V>> {
                let response: ResponseFuture<V> = batcher.add(key);
                response.boxed()
            },
            executor,
        )
    }

    pub fn add(&self, key: K) -> Coalesced<V> {
        let supplier = Arc::clone(&self.supplier);
        self.combiner.add_with(key, move |key| supplier(key))
    }

    /// Same as [`add`](Self::add) but with an ad-hoc supplier for this call.
    pub fn add_with<F>(&self, key: K, supplier: F) -> Coalesced<V>
    where
        F: FnOnce(K) -> BoxFuture<'static, CoalesceResult<V>>,
    {
        self.combiner.add_with(key, supplier)
    }

    pub fn in_flight_keys(&self) -> usize {
        self.combiner.in_flight_keys()
    }

    pub fn attached(&self, key: &K) -> usize {
        self.combiner.attached(key)
    }

    pub fn name(&self) -> &str {
        self.combiner.name()
    }
}
