//! Counter batcher: for batches where only the number of accumulated
//! requests matters, e.g. incrementing a hit counter in one write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use coalesce_core::{promise, CoalesceResult, FlusherConfig, Promise, SharedResponse};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{error, info};

use crate::executor::EngineRuntime;
use crate::trigger::{Slot, SlotDrain, TimeTrigger};

/// The batch operation behind a [`CounterBatcher`]: receives the total count
/// accumulated during one cycle.
pub trait CounterHandler: Send + Sync + 'static {
    fn handle_requests(&self, count: u64) -> BoxFuture<'static, CoalesceResult<()>>;
}

impl<F> CounterHandler for F
where
    F: Fn(u64) -> BoxFuture<'static, CoalesceResult<()>> + Send + Sync + 'static,
{
    fn handle_requests(&self, count: u64) -> BoxFuture<'static, CoalesceResult<()>> {
        self(count)
    }
}

/// The promise every add of one cycle shares.
struct Cycle {
    promise: Promise<()>,
    response: SharedResponse<()>,
}

impl Cycle {
    fn new() -> Self {
        let (promise, response) = promise();
        Self {
            promise,
            response: response.shared(),
        }
    }
}

pub struct CounterSlot {
    count: AtomicU64,
    cycle: RwLock<Cycle>,
}

impl Default for CounterSlot {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            cycle: RwLock::new(Cycle::new()),
        }
    }
}

impl Slot for CounterSlot {
    fn len(&self) -> usize {
        usize::try_from(self.count.load(Ordering::SeqCst)).unwrap_or(usize::MAX)
    }
}

pub struct CounterDrain {
    name: String,
    handler: Arc<dyn CounterHandler>,
}

impl SlotDrain for CounterDrain {
    type Slot = CounterSlot;

    fn drain(&self, slot: &CounterSlot, _by_timeout: bool) -> BoxFuture<'static, ()> {
        // No producer is registered on `slot`, so the count and the promise
        // are swapped as a pair.
        let count = slot.count.swap(0, Ordering::SeqCst);
        let finished = std::mem::replace(&mut *slot.cycle.write(), Cycle::new());

        if count == 0 {
            finished.promise.complete(());
            return future::ready(()).boxed();
        }

        metrics::histogram!("flusher.batch_size", "engine" => self.name.clone())
            .record(count as f64);
        let name = self.name.clone();
        let outcome = self.handler.handle_requests(count);
        async move {
            if let Err(err) = outcome.await {
                metrics::counter!("flusher.handler_errors", "engine" => name.clone())
                    .increment(1);
                error!(engine = %name, count, error = %err, "Counter handler failed");
            }
            // No response to carry: the cycle completes either way.
            finished.promise.complete(());
            metrics::counter!("flusher.flushed", "engine" => name).increment(count);
        }
        .boxed()
    }
}

/// Time + quota triggered accumulation of a bare count.
#[derive(Clone)]
pub struct CounterBatcher {
    trigger: Arc<TimeTrigger<CounterDrain>>,
}

impl CounterBatcher {
    pub fn new(
        name: impl Into<String>,
        config: &FlusherConfig,
        handler: impl CounterHandler,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Self> {
        let name = name.into();
        let drain = CounterDrain {
            name: name.clone(),
            handler: Arc::new(handler),
        };
        let trigger = TimeTrigger::new(name.clone(), config, drain, runtime)?;
        info!(
            engine = %name,
            flush_quota = config.flush_quota,
            flush_timeout_ms = config.flush_timeout_ms,
            "Counter batcher initialized"
        );
        Ok(Self { trigger })
    }

    pub fn with_tokio(
        name: impl Into<String>,
        config: &FlusherConfig,
        handler: impl CounterHandler,
    ) -> CoalesceResult<Self> {
        Self::new(name, config, handler, EngineRuntime::tokio()?)
    }

    /// Adds `n` to the open cycle and returns that cycle's shared response.
    pub fn add(&self, n: u64) -> SharedResponse<()> {
        let (response, total) = self.trigger.with_active_slot(|slot| {
            let response = slot.cycle.read().response.clone();
            let total = slot.count.fetch_add(n, Ordering::SeqCst).saturating_add(n);
            (response, total)
        });
        self.trigger
            .after_add(usize::try_from(total).unwrap_or(usize::MAX));
        response
    }

    pub fn flush(&self, by_timeout: bool) -> bool {
        self.trigger.flush(by_timeout)
    }

    /// Count accumulated in the open cycle.
    pub fn pending(&self) -> usize {
        self.trigger.pending()
    }

    pub fn name(&self) -> &str {
        self.trigger.name()
    }
}
