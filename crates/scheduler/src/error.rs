use bitfleet_core::{FleetError, Resource};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error(transparent)]
    Fleet(#[from] FleetError),

    /// The bounded class queue was full. The rejected resource is handed back.
    #[error("class queue full at tier {tier} class {class}, rejected {resource}")]
    Overflow {
        tier: usize,
        class: u32,
        resource: Box<Resource>,
    },

    /// Resources were taken out of a class queue during a clamped-class scan
    /// and could not be put back. They are handed to the caller, who now owns them.
    #[error("{} resource(s) displaced from tier {tier} class {class}", .resources.len())]
    Displaced {
        tier: usize,
        class: u32,
        resources: Vec<Resource>,
    },
}

impl ScheduleError {
    /// Resources the caller now owns because the scheduler could not keep them.
    pub fn into_resources(self) -> Vec<Resource> {
        match self {
            ScheduleError::Fleet(_) => Vec::new(),
            ScheduleError::Overflow { resource, .. } => vec![*resource],
            ScheduleError::Displaced { resources, .. } => resources,
        }
    }
}
