//! Micro-batching engines: requests accumulate in a double-buffered slot and
//! are drained into one batch operation per quota or timeout.
#![warn(clippy::unwrap_used)]

pub mod counter;
pub mod executor;
pub mod gate;
pub mod pool;
pub mod queue;
pub mod trigger;

pub use counter::{CounterBatcher, CounterHandler};
pub use executor::{EngineRuntime, MilliTimer, TaskExecutor, TokioRuntime};
pub use gate::AtomicGate;
pub use pool::{ObjectPool, PoolStats, Pooled, Recycle};
pub use queue::{PendingRequests, RequestHandler, RequestQueueBatcher, Requests};
pub use trigger::{QuotaTrigger, Slot, SlotDrain, TimeTrigger};
