//! Coalescers layered over the flush engine: per-key call de-duplication
//! and group batching with result correlation.

#![warn(clippy::unwrap_used)]

pub mod accessor;
pub mod group;
pub mod key;

pub use accessor::{Accessor, JoinKey};
pub use group::{GroupCoalescer, GroupRunCombiner};
pub use key::{Coalesced, KeyCoalescer, KeyCombiner};
