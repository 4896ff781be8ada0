//! Double-buffered accumulation with quota and time flush triggers.
//!
//! Producers write into the active slot of a pair; a flush flips the active
//! index under an [`AtomicGate`] and hands the previous slot to the executor.
//! The gate stays closed until that slot has been emptied, so a slot is
//! never written again before then. The batch work the drain produced runs
//! after the gate opens, and several batches may be in flight at once.
//!
//! A producer registers itself on a slot before writing and re-checks the
//! active index afterwards. The drain waits for the registrations on its slot
//! to reach zero, so an item is either in the slot when it is drained or was
//! redirected to the new active slot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coalesce_core::{CoalesceError, CoalesceResult, FlusherConfig};
use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::executor::{EngineRuntime, MilliTimer, TaskExecutor};
use crate::gate::AtomicGate;

/// Accumulation container that alternates between active and draining.
pub trait Slot: Default + Send + Sync + 'static {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns the contents of a slot that just left service into batch work.
pub trait SlotDrain: Send + Sync + 'static {
    type Slot: Slot;

    /// Empties `slot` and returns the work that processes what it held.
    /// Called with no producer writing to `slot`. The slot must be empty when
    /// this returns; the returned work runs after the slot is back in service.
    fn drain(&self, slot: &Self::Slot, by_timeout: bool) -> BoxFuture<'static, ()>;
}

struct WriterGuard<'a>(&'a AtomicUsize);

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Flushes when the active slot reaches `quota` entries.
pub struct QuotaTrigger<D: SlotDrain> {
    name: String,
    quota: usize,
    slots: [D::Slot; 2],
    writers: [AtomicUsize; 2],
    /// `false` selects slot 0, `true` slot 1.
    switch: AtomicBool,
    gate: Arc<AtomicGate>,
    drain: D,
    executor: Arc<dyn TaskExecutor>,
}

impl<D: SlotDrain> QuotaTrigger<D> {
    pub fn new(
        name: impl Into<String>,
        quota: usize,
        drain: D,
        executor: Arc<dyn TaskExecutor>,
    ) -> CoalesceResult<Arc<Self>> {
        if quota == 0 {
            return Err(CoalesceError::Config(
                "flush_quota must be a positive integer".into(),
            ));
        }
        Ok(Arc::new(Self {
            name: name.into(),
            quota,
            slots: [D::Slot::default(), D::Slot::default()],
            writers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            switch: AtomicBool::new(false),
            gate: Arc::new(AtomicGate::new()),
            drain,
            executor,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn quota(&self) -> usize {
        self.quota
    }

    pub fn drain_strategy(&self) -> &D {
        &self.drain
    }

    pub fn active_index(&self) -> usize {
        usize::from(self.switch.load(Ordering::SeqCst))
    }

    /// Entries waiting in the active slot.
    pub fn pending(&self) -> usize {
        self.slots[self.active_index()].len()
    }

    pub fn is_flushing(&self) -> bool {
        self.gate.is_locked()
    }

    /// Runs `write` against the active slot.
    pub fn with_active_slot<R>(&self, write: impl FnOnce(&D::Slot) -> R) -> R {
        loop {
            let index = self.active_index();
            self.writers[index].fetch_add(1, Ordering::SeqCst);
            let guard = WriterGuard(&self.writers[index]);
            if self.active_index() != index {
                // Flipped between the read and the registration.
                drop(guard);
                continue;
            }
            let out = write(&self.slots[index]);
            drop(guard);
            return out;
        }
    }

    /// Quota check made after each add with the slot size the add observed.
    pub fn try_flush_when_add(self: &Arc<Self>, size: usize) {
        if size >= self.quota {
            self.flush(false);
        }
    }

    /// Flips the active slot and drains the previous one on the executor.
    /// Returns `false` without doing anything if a flush is already running.
    pub fn flush(self: &Arc<Self>, by_timeout: bool) -> bool {
        let Some(guard) = self.gate.try_lock_owned() else {
            metrics::counter!("flusher.gate_contended", "engine" => self.name.clone())
                .increment(1);
            trace!(engine = %self.name, by_timeout, "Flush already in progress");
            return false;
        };

        let old_switch = self.switch.fetch_xor(true, Ordering::SeqCst);
        let old_index = usize::from(old_switch);
        debug!(
            engine = %self.name,
            by_timeout,
            from = old_index,
            to = 1 - old_index,
            "Switched active slot"
        );

        let this = Arc::clone(self);
        self.executor.execute(Box::pin(async move {
            let work = this.take_slot(old_index, by_timeout).await;
            drop(guard);
            this.flush_backlog();
            work.await;
        }));
        true
    }

    /// Waits out the producers still registered on the old slot, then empties
    /// it into batch work.
    async fn take_slot(&self, old_index: usize, by_timeout: bool) -> BoxFuture<'static, ()> {
        while self.writers[old_index].load(Ordering::SeqCst) != 0 {
            tokio::task::yield_now().await;
        }

        let slot = &self.slots[old_index];
        let size = slot.len();
        metrics::counter!("flusher.flush_cycles", "engine" => self.name.clone()).increment(1);
        debug!(engine = %self.name, by_timeout, size, "Draining slot");

        self.drain.drain(slot, by_timeout)
    }

    /// Producers that hit the quota while the gate was closed could not
    /// flush; pick their backlog up now.
    fn flush_backlog(self: &Arc<Self>) {
        if self.pending() >= self.quota {
            debug!(engine = %self.name, pending = self.pending(), "Flushing backlog");
            self.flush(false);
        }
    }
}

/// Adds a self-rearming timer so an entry waits at most `flush_timeout`
/// even when the quota is never reached.
pub struct TimeTrigger<D: SlotDrain> {
    quota: Arc<QuotaTrigger<D>>,
    flush_timeout: Duration,
    /// Adds seen since the timer was armed; zero means disarmed.
    timer_armed: AtomicUsize,
    timer: Arc<dyn MilliTimer>,
}

impl<D: SlotDrain> TimeTrigger<D> {
    pub fn new(
        name: impl Into<String>,
        config: &FlusherConfig,
        drain: D,
        runtime: EngineRuntime,
    ) -> CoalesceResult<Arc<Self>> {
        config.validate()?;
        let quota = QuotaTrigger::new(name, config.flush_quota, drain, runtime.executor)?;
        Ok(Arc::new(Self {
            quota,
            flush_timeout: config.flush_timeout(),
            timer_armed: AtomicUsize::new(0),
            timer: runtime.timer,
        }))
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    pub fn is_timer_armed(&self) -> bool {
        self.timer_armed.load(Ordering::SeqCst) > 0
    }

    pub fn flush(&self, by_timeout: bool) -> bool {
        self.quota.flush(by_timeout)
    }

    /// Bookkeeping after an entry landed in a slot whose size is now `size`.
    pub fn after_add(self: &Arc<Self>, size: usize) {
        self.quota.try_flush_when_add(size);
        self.touch_timer();
    }

    fn touch_timer(self: &Arc<Self>) {
        if self.timer_armed.fetch_add(1, Ordering::SeqCst) == 0 {
            trace!(engine = %self.quota.name, "Arming flush timer");
            self.start_timer();
        }
    }

    fn start_timer(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.timer
            .schedule(self.flush_timeout, Box::new(move || this.on_timeout()));
    }

    fn on_timeout(self: &Arc<Self>) {
        let observed = self.timer_armed.load(Ordering::SeqCst);
        if !self.quota.flush(true) {
            // Lost to a running flush that may have started before our adds.
            self.start_timer();
            return;
        }
        if self.timer_armed.fetch_sub(observed, Ordering::SeqCst) == observed {
            trace!(engine = %self.quota.name, "Disarming flush timer");
            return;
        }
        self.start_timer();
    }
}

impl<D: SlotDrain> std::ops::Deref for TimeTrigger<D> {
    type Target = Arc<QuotaTrigger<D>>;

    fn deref(&self) -> &Self::Target {
        &self.quota
    }
}
