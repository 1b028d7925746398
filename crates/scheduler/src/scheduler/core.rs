use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use bitfleet_core::{Config, DimensionConfig, FleetError, QueueConfig, Resource};
use tracing::{debug, info, warn};

use crate::bitmask::BitmaskIndex;
use crate::classifier::{ClassKey, SizeClassifier};
use crate::error::ScheduleError;
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::queue::{BoundedRingQueue, ClassQueue, UnboundedChunkQueue};

/// Matches resource requests against registered resources by capacity class,
/// region, and energy level.
///
/// One queue exists per `(region, energy level, tier, class)`. Queues are
/// created the first time a resource lands in them; the presence index tells
/// `acquire` which ones are worth visiting.
pub struct TieredScheduler<Q = UnboundedChunkQueue<Resource>> {
    pub(super) classifier: SizeClassifier,
    pub(super) index: BitmaskIndex,
    pub(super) dimensions: DimensionConfig,
    queue_config: QueueConfig,
    queues: Box<[OnceLock<Q>]>,
    /// Inspections per queue currently holding set-aside members in hand.
    inspecting: Box<[AtomicUsize]>,
    pub(super) metrics: SchedulerMetrics,
}

/// Scheduler whose class queues are fixed-capacity rings.
pub type BoundedScheduler = TieredScheduler<BoundedRingQueue<Resource>>;

/// Scheduler whose class queues grow without bound.
pub type UnboundedScheduler = TieredScheduler<UnboundedChunkQueue<Resource>>;

impl<Q: ClassQueue<Resource>> TieredScheduler<Q> {
    /// Build a scheduler from validated construction-time constants.
    pub fn new(config: &Config) -> Result<Self, FleetError> {
        config.validate()?;
        if config.queue.kind != Q::KIND {
            warn!(
                "Configured queue kind {} ignored; this scheduler uses {} queues",
                config.queue.kind,
                Q::KIND
            );
        }

        let classifier = SizeClassifier::new(&config.classes)?;
        let dimensions = config.dimensions.clone();
        let index = BitmaskIndex::new(
            dimensions.regions,
            dimensions.energy_levels,
            classifier.tiers(),
        );
        let slots = dimensions.regions
            * usize::from(dimensions.energy_levels)
            * classifier.tiers()
            * classifier.width() as usize;
        let queues = (0..slots).map(|_| OnceLock::new()).collect();
        let inspecting = (0..slots).map(|_| AtomicUsize::new(0)).collect();

        info!(
            "Scheduler ready: {} regions x {} energy levels x {} tiers x {} classes ({} queues)",
            dimensions.regions,
            dimensions.energy_levels,
            classifier.tiers(),
            classifier.width(),
            Q::KIND
        );

        Ok(Self {
            classifier,
            index,
            dimensions,
            queue_config: config.queue.clone(),
            queues,
            inspecting,
            metrics: SchedulerMetrics::default(),
        })
    }

    pub fn classifier(&self) -> &SizeClassifier {
        &self.classifier
    }

    pub fn index(&self) -> &BitmaskIndex {
        &self.index
    }

    pub fn dimensions(&self) -> &DimensionConfig {
        &self.dimensions
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn slot(&self, region: usize, level: u8, key: ClassKey) -> usize {
        let levels = usize::from(self.dimensions.energy_levels);
        ((region * levels + usize::from(level)) * self.classifier.tiers() + key.tier)
            * self.classifier.width() as usize
            + key.class as usize
    }

    /// The class queue, if anything was ever registered into it.
    pub(super) fn queue(&self, region: usize, level: u8, key: ClassKey) -> Option<&Q> {
        self.queues[self.slot(region, level, key)].get()
    }

    fn queue_or_init(&self, region: usize, level: u8, key: ClassKey) -> &Q {
        self.queues[self.slot(region, level, key)].get_or_init(|| Q::from_config(&self.queue_config))
    }

    /// Announce that members of this queue are about to leave it temporarily.
    /// The queue counts as occupied until the returned guard drops.
    pub(super) fn begin_inspection(
        &self,
        region: usize,
        level: u8,
        key: ClassKey,
    ) -> Inspection<'_> {
        let counter = &self.inspecting[self.slot(region, level, key)];
        counter.fetch_add(1, Ordering::SeqCst);
        Inspection { counter }
    }

    /// Whether any inspection of this queue still holds members in hand.
    pub(super) fn inspection_in_flight(&self, region: usize, level: u8, key: ClassKey) -> bool {
        self.inspecting[self.slot(region, level, key)].load(Ordering::SeqCst) > 0
    }

    /// Hand a resource to the scheduler.
    ///
    /// Returns the class it was filed under. With bounded queues a full class
    /// rejects the resource and hands it back inside
    /// [`ScheduleError::Overflow`].
    pub fn register(&self, resource: Resource) -> Result<ClassKey, ScheduleError> {
        self.dimensions.check_region(resource.region())?;
        self.dimensions.check_energy(resource.energy())?;
        let key = self.classifier.classify(resource.capacity());

        match self.enqueue(key, resource) {
            Ok(()) => {
                self.metrics.record_registered();
                Ok(key)
            }
            Err(resource) => {
                self.metrics.record_overflow();
                debug!("Class queue {} full, rejected {}", key, resource);
                Err(ScheduleError::Overflow {
                    tier: key.tier,
                    class: key.class,
                    resource: Box::new(resource),
                })
            }
        }
    }

    /// Mark, then put, then make sure the mark survived a concurrent clear.
    pub(super) fn enqueue(&self, key: ClassKey, resource: Resource) -> Result<(), Resource> {
        let (region, level) = (resource.region(), resource.energy());
        self.index.mark_present(region, level, key);
        self.queue_or_init(region, level, key).put(resource)?;
        self.index.ensure_present(region, level, key);
        Ok(())
    }
}

/// Live inspection of one class queue. Dropping it ends the inspection,
/// including on the error path.
pub(super) struct Inspection<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for Inspection<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
