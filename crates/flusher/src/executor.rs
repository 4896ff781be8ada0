//! Seams to the host runtime: where drains run and how the flush timer fires.

use std::sync::Arc;
use std::time::Duration;

use coalesce_core::{CoalesceError, CoalesceResult};
use futures::future::BoxFuture;
use tokio::runtime::Handle;

/// Runs drain work off the producer's call path.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: BoxFuture<'static, ()>);
}

/// One-shot millisecond timer. Re-arming is done by scheduling again.
pub trait MilliTimer: Send + Sync {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send + 'static>);
}

/// Executor and timer an engine instance runs on.
#[derive(Clone)]
pub struct EngineRuntime {
    pub executor: Arc<dyn TaskExecutor>,
    pub timer: Arc<dyn MilliTimer>,
}

impl EngineRuntime {
    pub fn new(executor: Arc<dyn TaskExecutor>, timer: Arc<dyn MilliTimer>) -> Self {
        Self { executor, timer }
    }

    /// Both seams backed by the tokio runtime the caller is running in.
    pub fn tokio() -> CoalesceResult<Self> {
        let runtime = Arc::new(TokioRuntime::current()?);
        Ok(Self {
            executor: runtime.clone(),
            timer: runtime,
        })
    }
}

impl std::fmt::Debug for EngineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct TokioRuntime {
    handle: Handle,
}

impl TokioRuntime {
    pub fn current() -> CoalesceResult<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|e| CoalesceError::Runtime(e.to_string()))
    }

    pub fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }
}

impl TaskExecutor for TokioRuntime {
    fn execute(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }
}

impl MilliTimer for TokioRuntime {
    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send + 'static>) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
    }
}
