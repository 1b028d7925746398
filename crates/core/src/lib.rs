pub mod config;
pub mod entity;
pub mod error;

pub use config::{ClassConfig, Config, DimensionConfig, QueueConfig, QueueKind, TierConfig};
pub use entity::*;
pub use error::*;
