//! Shared building blocks for the coalescing engines: configuration, the
//! error taxonomy and the promise/future completion primitive.

pub mod config;
pub mod error;
pub mod promise;

pub use config::{BenchConfig, FlusherConfig, GroupConfig, WorkloadConfig};
pub use error::{CoalesceError, CoalesceResult};
pub use promise::{promise, Promise, ResponseFuture, SharedResponse};
