use serde::{Deserialize, Serialize};

/// Region slot that aggregates every region for cross-region lookups.
pub const GLOBAL_REGION: usize = 0;

/// A schedulable worker: a device offering `capacity` (MB of free memory)
/// in one region at one energy level.
///
/// Fields are read-only once built. A resource is moved into the scheduler
/// by `register` and moved back out by a successful `acquire`; it is never
/// held by both at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    id: String,
    capacity: u64,
    region: usize,
    energy: u8,
}

impl Resource {
    pub fn new(id: impl Into<String>, capacity: u64, region: usize, energy: u8) -> Self {
        Self {
            id: id.into(),
            capacity,
            region,
            energy,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True capacity, kept alongside the quantized class.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn region(&self) -> usize {
        self.region
    }

    pub fn energy(&self) -> u8 {
        self.energy
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}MB, region {}, energy {})",
            self.id, self.capacity, self.region, self.energy
        )
    }
}
