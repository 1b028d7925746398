//! Per-class concurrent queues.
//!
//! Two interchangeable non-blocking MPMC implementations:
//! - [`BoundedRingQueue`]: fixed capacity, FIFO, `put` fails when full.
//! - [`UnboundedChunkQueue`]: chain of fixed-size chunks, FIFO, always accepts.

pub mod chunked;
pub mod ring;

use bitfleet_core::{QueueConfig, QueueKind};

pub use chunked::UnboundedChunkQueue;
pub use ring::BoundedRingQueue;

/// The capability the scheduler needs from a class queue.
///
/// Neither operation blocks. `put` hands the value back when the queue
/// cannot take it; `try_take` returns `None` when the queue is empty.
pub trait ClassQueue<T>: Send + Sync {
    const KIND: QueueKind;

    /// Build an empty queue sized by the scheduler's queue settings.
    fn from_config(config: &QueueConfig) -> Self
    where
        Self: Sized;

    fn put(&self, value: T) -> Result<(), T>;

    fn try_take(&self) -> Option<T>;

    /// Emptiness hint; may be stale by the time the caller acts on it.
    fn is_empty(&self) -> bool;
}
