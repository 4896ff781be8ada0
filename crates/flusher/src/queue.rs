//! Request queue batcher: each `add` enqueues a request together with the
//! promise of its response, and the batch handler receives a whole slot's
//! worth of them at once.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use coalesce_core::{promise, CoalesceError, CoalesceResult, FlusherConfig, Promise, ResponseFuture};
use crossbeam_queue::SegQueue;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::executor::EngineRuntime;
use crate::pool::{ObjectPool, Pooled};
use crate::trigger::{Slot, SlotDrain, TimeTrigger};

/// Requests of one batch in insertion order.
pub type Requests<Req> = Pooled<Vec<Req>>;

/// The same requests paired with the promises their callers are waiting on.
pub type PendingRequests<Req, Resp> = Pooled<Vec<(Req, Promise<Resp>)>>;

/// The batch operation behind a [`RequestQueueBatcher`].
///
/// For `Resp = ()` the batcher completes every promise once the returned
/// future finishes, whatever its outcome. For any other response type the
/// handler resolves the promises itself; on failure the batcher fails the
/// promises it left unresolved with the handler's error, and on success it
/// fails leftovers with [`CoalesceError::Unresolved`].
pub trait RequestHandler<Req, Resp>: Send + Sync + 'static {
    fn handle_requests(
        &self,
        requests: Requests<Req>,
        pending: PendingRequests<Req, Resp>,
    ) -> BoxFuture<'static, CoalesceResult<()>>;
}

impl<F, Req, Resp> RequestHandler<Req, Resp> for F
where
    F: Fn(Requests<Req>, PendingRequests<Req, Resp>) -> BoxFuture<'static, CoalesceResult<()>>
        + Send
        + Sync
        + 'static,
{
    fn handle_requests(
        &self,
        requests: Requests<Req>,
        pending: PendingRequests<Req, Resp>,
    ) -> BoxFuture<'static, CoalesceResult<()>> {
        self(requests, pending)
    }
}

pub struct QueueSlot<Req, Resp> {
    queue: SegQueue<(Req, Promise<Resp>)>,
}

impl<Req, Resp> Default for QueueSlot<Req, Resp> {
    fn default() -> Self {
        Self {
            queue: SegQueue::new(),
        }
    }
}

impl<Req: Send + 'static, Resp: Send + 'static> Slot for QueueSlot<Req, Resp> {
    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// `Some(())` when `Resp` is the unit type, so the batcher can complete
/// no-value responses on the handler's behalf.
fn unit_response<Resp: 'static>() -> Option<Resp> {
    let unit: Box<dyn Any> = Box::new(());
    unit.downcast::<Resp>().ok().map(|value| *value)
}

pub struct QueueDrain<Req, Resp> {
    name: String,
    quota: usize,
    handler: Arc<dyn RequestHandler<Req, Resp>>,
    pairs: Arc<ObjectPool<Vec<(Req, Promise<Resp>)>>>,
    requests: Arc<ObjectPool<Vec<Req>>>,
    promises: Arc<ObjectPool<Vec<Promise<Resp>>>>,
    batches: AtomicU64,
}

impl<Req, Resp> QueueDrain<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn new(
        name: String,
        config: &FlusherConfig,
        handler: Arc<dyn RequestHandler<Req, Resp>>,
    ) -> Self {
        let quota = config.flush_quota;
        Self {
            name,
            quota,
            handler,
            pairs: ObjectPool::new(config.pool_max_idle, move || Vec::with_capacity(quota)),
            requests: ObjectPool::new(config.pool_max_idle, move || Vec::with_capacity(quota)),
            promises: ObjectPool::new(config.pool_max_idle, move || Vec::with_capacity(quota)),
            batches: AtomicU64::new(0),
        }
    }

    /// Starts the handler on one chunk and settles the promises it leaves behind.
    fn run_batch(&self, pending: PendingRequests<Req, Resp>) -> BoxFuture<'static, ()> {
        let mut requests = self.requests.get();
        requests.extend(pending.iter().map(|(req, _)| req.clone()));
        let mut promises = self.promises.get();
        promises.extend(pending.iter().map(|(_, promise)| promise.clone()));

        let size = pending.len();
        let batch_no = self.batches.fetch_add(1, Ordering::Relaxed);
        let name = self.name.clone();
        metrics::histogram!("flusher.batch_size", "engine" => name.clone()).record(size as f64);

        let outcome = self.handler.handle_requests(requests, pending);
        async move {
            let outcome = outcome.await;
            settle(&name, batch_no, outcome, &promises);
            metrics::counter!("flusher.flushed", "engine" => name).increment(size as u64);
        }
        .boxed()
    }
}

fn settle<Resp: 'static>(
    name: &str,
    batch_no: u64,
    outcome: CoalesceResult<()>,
    promises: &[Promise<Resp>],
) {
    if let Err(err) = &outcome {
        metrics::counter!("flusher.handler_errors", "engine" => name.to_string()).increment(1);
        error!(engine = %name, batch_no, error = %err, "Batch handler failed");
    }

    if unit_response::<Resp>().is_some() {
        for promise in promises {
            if let Some(unit) = unit_response::<Resp>() {
                promise.complete(unit);
            }
        }
        return;
    }

    let leftover = match outcome {
        Ok(()) => CoalesceError::Unresolved,
        Err(err) => err,
    };
    let unresolved = promises
        .iter()
        .filter(|promise| promise.fail(leftover.clone()))
        .count();
    if unresolved > 0 && leftover == CoalesceError::Unresolved {
        warn!(
            engine = %name,
            batch_no,
            unresolved,
            "Batch handler left requests unresolved"
        );
    }
}

impl<Req, Resp> SlotDrain for QueueDrain<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    type Slot = QueueSlot<Req, Resp>;

    fn drain(&self, slot: &Self::Slot, _by_timeout: bool) -> BoxFuture<'static, ()> {
        let mut batches = Vec::new();
        loop {
            let mut pending = self.pairs.get();
            while pending.len() < self.quota {
                match slot.queue.pop() {
                    Some(pair) => pending.push(pair),
                    None => break,
                }
            }
            if pending.is_empty() {
                break;
            }
            batches.push(self.run_batch(pending));
        }

        if batches.is_empty() {
            return future::ready(()).boxed();
        }
        future::join_all(batches).map(|_| ()).boxed()
    }
}

/// Time + quota triggered batcher over a queue of `(request, promise)` pairs.
pub struct RequestQueueBatcher<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    trigger: Arc<TimeTrigger<QueueDrain<Req, Resp>>>,
}

impl<Req, Resp> Clone for RequestQueueBatcher<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            trigger: Arc::clone(&self.trigger),
        }
    }
}

impl<Req, Resp> RequestQueueBatcher<Req, Resp>
where
    Req: Clone + Send + 'static,
    Resp: Send + 'static,
{
    pub fn new(
        name: impl Into<String>,
        config: &FlusherConfig,
        handler: impl RequestHandler<Req, Resp>,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Self> {
        config.validate()?;
        let name = name.into();
        let drain = QueueDrain::new(name.clone(), config, Arc::new(handler));
        let trigger = TimeTrigger::new(name.clone(), config, drain, runtime)?;
        info!(
            engine = %name,
            flush_quota = config.flush_quota,
            flush_timeout_ms = config.flush_timeout_ms,
            "Request queue batcher initialized"
        );
        Ok(Self { trigger })
    }

    /// Builds the batcher on the current tokio runtime.
    pub fn with_tokio(
        name: impl Into<String>,
        config: &FlusherConfig,
        handler: impl RequestHandler<Req, Resp>,
    ) -> CoalesceResult<Self> {
        Self::new(name, config, handler, EngineRuntime::tokio()?)
    }

    /// Enqueues one request. Never blocks and never runs the handler inline.
    pub fn add(&self, req: Req) -> ResponseFuture<Resp> {
        let (promise, response) = promise();
        let size = self.trigger.with_active_slot(|slot| {
            slot.queue.push((req, promise));
            slot.queue.len()
        });
        self.trigger.after_add(size);
        response
    }

    /// Forces a drain of the active slot. Returns `false` if a flush is
    /// already running.
    pub fn flush(&self, by_timeout: bool) -> bool {
        self.trigger.flush(by_timeout)
    }

    pub fn pending(&self) -> usize {
        self.trigger.pending()
    }

    pub fn name(&self) -> &str {
        self.trigger.name()
    }

    pub fn flush_quota(&self) -> usize {
        self.trigger.quota()
    }
}

impl<Req> RequestQueueBatcher<Req, ()>
where
    Req: Clone + Send + 'static,
{
    /// Enqueues every request; resolves once all of them have been flushed.
    pub fn add_all(
        &self,
        requests: impl IntoIterator<Item = Req>,
    ) -> impl std::future::Future<Output = CoalesceResult<()>> + Send + 'static {
        let responses: Vec<_> = requests.into_iter().map(|req| self.add(req)).collect();
        future::try_join_all(responses).map(|done| done.map(|_| ()))
    }
}
