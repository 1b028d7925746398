//! Tiered scheduler: a presence bitmask over per-class queues.
//!
//! Split into focused submodules:
//! - `core`: TieredScheduler struct, construction, queue storage, and `register`
//! - `matching`: best-fit `acquire` with energy relaxation and stale-bit recovery

mod core;
mod matching;

pub use self::core::{BoundedScheduler, TieredScheduler, UnboundedScheduler};
pub use self::matching::INSPECT_LIMIT;
