//! Non-blocking CAS gate: at most one flush runs at a time and a caller that
//! loses the race returns immediately instead of queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct AtomicGate {
    locked: AtomicBool,
}

impl AtomicGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `body` if the gate is free, releasing it afterwards even if
    /// `body` panics. Returns `None` without running `body` when the gate is
    /// already held.
    pub fn try_run<R>(&self, body: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.try_lock()?;
        Some(body())
    }

    pub fn try_lock(&self) -> Option<GateGuard<'_>> {
        self.acquire().then_some(GateGuard { gate: self })
    }

    /// Like [`try_lock`](Self::try_lock) but the guard can move into a
    /// spawned task, keeping the gate closed until that task finishes.
    pub fn try_lock_owned(self: &Arc<Self>) -> Option<OwnedGateGuard> {
        self.acquire().then(|| OwnedGateGuard {
            gate: Arc::clone(self),
        })
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct GateGuard<'a> {
    gate: &'a AtomicGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

pub struct OwnedGateGuard {
    gate: Arc<AtomicGate>,
}

impl Drop for OwnedGateGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}
