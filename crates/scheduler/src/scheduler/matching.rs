use std::ops::Range;

use bitfleet_core::{FleetError, Resource, GLOBAL_REGION};
use crossbeam::utils::Backoff;
use tracing::{debug, trace, warn};

use crate::classifier::ClassKey;
use crate::error::ScheduleError;
use crate::queue::ClassQueue;

use super::TieredScheduler;

/// Most resources inspected per visit to a class whose members may be too small.
pub const INSPECT_LIMIT: usize = 4096;

enum Take {
    Found(Resource),
    /// Every source queue was observed empty.
    Empty,
    /// Resources were present but none was large enough.
    NoFit,
    /// Nothing was taken while another acquire held members of the class in hand.
    Busy,
}

impl<Q: ClassQueue<Resource>> TieredScheduler<Q> {
    /// Take the smallest resource with at least `need` capacity in `region`,
    /// relaxing the energy requirement from `min_energy` down to 0.
    ///
    /// Region [`GLOBAL_REGION`] searches every region. `Ok(None)` means
    /// nothing fits at any permitted energy level.
    pub fn acquire(
        &self,
        need: u64,
        region: usize,
        min_energy: u8,
    ) -> Result<Option<Resource>, ScheduleError> {
        self.dimensions.check_region(region)?;
        self.dimensions.check_energy(min_energy)?;
        let floor = self.classifier.classify(need);

        for level in (0..=min_energy).rev() {
            let outcome = self.find_at_level(need, floor, region, level);
            if let Err(ScheduleError::Displaced { resources, .. }) = &outcome {
                // The match, if there was one, travels back with the displaced resources.
                if resources.iter().any(|r| r.capacity() >= need) {
                    self.metrics.record_acquired(level < min_energy);
                }
            }
            if let Some(resource) = outcome? {
                let borrowed = level < min_energy;
                if borrowed {
                    debug!(
                        "Borrowed {} at energy {} for request {}MB (wanted >= {})",
                        resource, level, need, min_energy
                    );
                }
                self.metrics.record_acquired(borrowed);
                return Ok(Some(resource));
            }
        }

        self.metrics.record_exhausted();
        Ok(None)
    }

    /// [`acquire`](Self::acquire) in `region`, then across all regions.
    pub fn acquire_with_fallback(
        &self,
        need: u64,
        region: usize,
        min_energy: u8,
    ) -> Result<Option<Resource>, ScheduleError> {
        match self.acquire(need, region, min_energy)? {
            Some(resource) => Ok(Some(resource)),
            None if region != GLOBAL_REGION => self.acquire(need, GLOBAL_REGION, min_energy),
            None => Ok(None),
        }
    }

    /// Signed entry point for callers holding untrusted integers.
    pub fn try_acquire(
        &self,
        need: i64,
        region: usize,
        min_energy: u8,
    ) -> Result<Option<Resource>, ScheduleError> {
        let need = u64::try_from(need).map_err(|_| FleetError::NegativeCapacity(need))?;
        self.acquire(need, region, min_energy)
    }

    fn find_at_level(
        &self,
        need: u64,
        floor: ClassKey,
        region: usize,
        level: u8,
    ) -> Result<Option<Resource>, ScheduleError> {
        for tier in floor.tier..self.classifier.tiers() {
            // Any class of a higher tier already exceeds the request's floor.
            let min_class = if tier == floor.tier { floor.class } else { 0 };
            if let Some(resource) = self.find_in_tier(need, region, level, tier, min_class)? {
                return Ok(Some(resource));
            }
        }
        Ok(None)
    }

    fn find_in_tier(
        &self,
        need: u64,
        region: usize,
        level: u8,
        tier: usize,
        min_class: u32,
    ) -> Result<Option<Resource>, ScheduleError> {
        let mut mask = self.index.candidate_mask(region, level, tier, min_class);
        let mut retried = 0u64;
        let mut waited = 0u64;

        while mask != 0 {
            let class = mask.trailing_zeros();
            let bit = 1u64 << class;
            let key = ClassKey { tier, class };

            match self.take_from_class(need, region, level, key)? {
                Take::Found(resource) => return Ok(Some(resource)),
                Take::NoFit => mask &= !bit,
                Take::Empty => {
                    self.index.clear_if_empty(region, level, key);
                    self.metrics.record_stale_bit();
                    trace!("Cleared stale bit {} at region {} energy {}", key, region, level);

                    // A register may have landed between the failed take and the clear.
                    if !self.sources_empty(region, level, key) {
                        self.index.remark(region, level, key);
                        if retried & bit == 0 {
                            retried |= bit;
                            continue;
                        }
                    }
                    mask &= !bit;
                }
                Take::Busy => {
                    // The bit stays: members are in hand elsewhere and will be put back.
                    self.wait_for_inspections(region, level, key);
                    if waited & bit == 0 {
                        waited |= bit;
                        continue;
                    }
                    mask &= !bit;
                }
            }
        }
        Ok(None)
    }

    /// Queues backing the bit `(region, level, key)`: one regional queue, or
    /// the same class in every region for the aggregate.
    fn sources(&self, region: usize) -> Range<usize> {
        if region == GLOBAL_REGION {
            0..self.dimensions.regions
        } else {
            region..region + 1
        }
    }

    fn sources_empty(&self, region: usize, level: u8, key: ClassKey) -> bool {
        self.sources(region)
            .filter_map(|source| self.queue(source, level, key))
            .all(|queue| queue.is_empty())
    }

    fn inspection_in_sources(&self, region: usize, level: u8, key: ClassKey) -> bool {
        self.sources(region)
            .any(|source| self.inspection_in_flight(source, level, key))
    }

    /// Spin until no inspection holds members of the class. Each inspection
    /// takes at most [`INSPECT_LIMIT`] resources and never blocks.
    fn wait_for_inspections(&self, region: usize, level: u8, key: ClassKey) {
        let backoff = Backoff::new();
        while self.inspection_in_sources(region, level, key) {
            backoff.snooze();
        }
    }

    fn take_from_class(
        &self,
        need: u64,
        region: usize,
        level: u8,
        key: ClassKey,
    ) -> Result<Take, ScheduleError> {
        // Classes whose smallest member already covers the request need no inspection.
        let partial = self.classifier.class_min_capacity(key) < need;
        let mut saw_undersized = false;

        for source in self.sources(region) {
            let Some(queue) = self.queue(source, level, key) else {
                continue;
            };
            if !partial {
                if let Some(resource) = queue.try_take() {
                    return Ok(Take::Found(resource));
                }
                continue;
            }

            let _inspection = self.begin_inspection(source, level, key);
            let mut set_aside = Vec::new();
            let mut found = None;
            while set_aside.len() < INSPECT_LIMIT {
                match queue.try_take() {
                    Some(resource) if resource.capacity() >= need => {
                        found = Some(resource);
                        break;
                    }
                    Some(resource) => set_aside.push(resource),
                    None => break,
                }
            }

            if !set_aside.is_empty() {
                saw_undersized = true;
                self.metrics.record_undersized(set_aside.len() as u64);
                found = self.restore(key, set_aside, found)?;
            }
            if let Some(resource) = found {
                return Ok(Take::Found(resource));
            }
        }

        Ok(if self.inspection_in_sources(region, level, key) {
            Take::Busy
        } else if saw_undersized {
            Take::NoFit
        } else {
            Take::Empty
        })
    }

    /// Put set-aside resources back. If any is refused, everything in hand,
    /// including `found`, goes to the caller.
    fn restore(
        &self,
        key: ClassKey,
        set_aside: Vec<Resource>,
        found: Option<Resource>,
    ) -> Result<Option<Resource>, ScheduleError> {
        let mut displaced: Vec<Resource> = set_aside
            .into_iter()
            .filter_map(|resource| self.enqueue(key, resource).err())
            .collect();
        if displaced.is_empty() {
            return Ok(found);
        }

        self.metrics.record_displaced(displaced.len() as u64);
        warn!(
            "{} undersized resource(s) in {} could not be re-queued",
            displaced.len(),
            key
        );
        displaced.extend(found);
        Err(ScheduleError::Displaced {
            tier: key.tier,
            class: key.class,
            resources: displaced,
        })
    }
}
