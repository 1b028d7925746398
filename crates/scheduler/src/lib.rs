pub mod bitmask;
pub mod classifier;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scheduler;

pub use bitmask::BitmaskIndex;
pub use classifier::{ClassKey, SizeClassifier};
pub use error::ScheduleError;
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use queue::{BoundedRingQueue, ClassQueue, UnboundedChunkQueue};
pub use scheduler::{BoundedScheduler, TieredScheduler, UnboundedScheduler, INSPECT_LIMIT};
