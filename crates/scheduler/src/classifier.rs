//! Piecewise-linear capacity quantizer.
//!
//! Tier 0 covers `[0, limit_0]`, tier `i` covers `(limit_{i-1}, limit_i]`,
//! each in fixed `step`-wide classes re-based to start at 0 within the tier.
//! Class indices are pinned to `width - 1`: capacities at or beyond the top
//! of a tier (and anything above the last limit) collapse into that tier's
//! top class. The scheduler compensates by verifying true capacity in
//! classes whose minimum is below a request.

use bitfleet_core::{ClassConfig, FleetError};
use serde::Serialize;

/// A size class: the capacity band and the bit position within that band's mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClassKey {
    pub tier: usize,
    pub class: u32,
}

impl std::fmt::Display for ClassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}/c{}", self.tier, self.class)
    }
}

#[derive(Debug, Clone, Copy)]
struct Band {
    /// Exclusive lower bound (0 for the first tier, where it is inclusive).
    lower: u64,
    limit: u64,
    step: u64,
}

#[derive(Debug, Clone)]
pub struct SizeClassifier {
    width: u32,
    bands: Vec<Band>,
}

impl SizeClassifier {
    pub fn new(config: &ClassConfig) -> Result<Self, FleetError> {
        config.validate()?;
        let mut lower = 0;
        let bands = config
            .tiers
            .iter()
            .map(|tier| {
                let band = Band { lower, limit: tier.limit, step: tier.step };
                lower = tier.limit;
                band
            })
            .collect();
        Ok(Self { width: config.width, bands })
    }

    /// Classes per tier.
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn tiers(&self) -> usize {
        self.bands.len()
    }

    /// Map a capacity to its class. Monotonic within a tier.
    pub fn classify(&self, capacity: u64) -> ClassKey {
        let tier = self
            .bands
            .iter()
            .position(|band| capacity <= band.limit)
            .unwrap_or(self.bands.len() - 1);
        let band = self.bands[tier];
        let index = capacity.saturating_sub(band.lower) / band.step;
        let class = index.min(u64::from(self.width - 1)) as u32;
        ClassKey { tier, class }
    }

    /// Signed entry point for callers holding untrusted integers.
    pub fn try_classify(&self, capacity: i64) -> Result<ClassKey, FleetError> {
        u64::try_from(capacity)
            .map(|c| self.classify(c))
            .map_err(|_| FleetError::NegativeCapacity(capacity))
    }

    /// Smallest capacity a resource in `key` can have.
    ///
    /// Exact inverse of [`classify`](Self::classify) for unclamped classes: every
    /// capacity mapping to `key` is at least this, and below it plus one step.
    pub fn class_min_capacity(&self, key: ClassKey) -> u64 {
        let band = self.bands[key.tier];
        band.lower + u64::from(key.class) * band.step
    }

    /// Capacity at which `tier` starts clamping into its top class.
    pub fn nominal_top(&self, tier: usize) -> u64 {
        let band = self.bands[tier];
        band.lower + u64::from(self.width) * band.step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitfleet_core::TierConfig;
    use proptest::prelude::*;

    fn default_classifier() -> SizeClassifier {
        SizeClassifier::new(&ClassConfig::default()).unwrap()
    }

    fn key(tier: usize, class: u32) -> ClassKey {
        ClassKey { tier, class }
    }

    #[test]
    fn tier0_steps_of_64() {
        let c = default_classifier();
        assert_eq!(c.classify(0), key(0, 0));
        assert_eq!(c.classify(63), key(0, 0));
        assert_eq!(c.classify(64), key(0, 1));
        assert_eq!(c.classify(100), key(0, 1));
        assert_eq!(c.classify(150), key(0, 2));
        assert_eq!(c.classify(200), key(0, 3));
        assert_eq!(c.classify(4095), key(0, 63));
    }

    #[test]
    fn tier0_top_is_clamped() {
        let c = default_classifier();
        // 4096 / 64 == 64, one past the last bit
        assert_eq!(c.classify(4096), key(0, 63));
    }

    #[test]
    fn tier1_is_rebased() {
        let c = default_classifier();
        assert_eq!(c.classify(4097), key(1, 0));
        assert_eq!(c.classify(4200), key(1, 0));
        assert_eq!(c.classify(4096 + 192), key(1, 1));
        assert_eq!(c.classify(12000), key(1, 41));
    }

    #[test]
    fn beyond_last_tier_clamps_to_top_class() {
        let c = default_classifier();
        assert_eq!(c.classify(16384), key(1, 63));
        assert_eq!(c.classify(30000), key(1, 63));
        assert_eq!(c.classify(u64::MAX), key(1, 63));
    }

    #[test]
    fn class_min_capacity_matches_bands() {
        let c = default_classifier();
        assert_eq!(c.class_min_capacity(key(0, 0)), 0);
        assert_eq!(c.class_min_capacity(key(0, 3)), 192);
        assert_eq!(c.class_min_capacity(key(0, 63)), 4032);
        assert_eq!(c.class_min_capacity(key(1, 0)), 4096);
        assert_eq!(c.class_min_capacity(key(1, 63)), 4096 + 63 * 192);
    }

    #[test]
    fn nominal_tops() {
        let c = default_classifier();
        assert_eq!(c.nominal_top(0), 4096);
        assert_eq!(c.nominal_top(1), 16384);
    }

    #[test]
    fn try_classify_rejects_negative() {
        let c = default_classifier();
        assert!(matches!(c.try_classify(-1), Err(FleetError::NegativeCapacity(-1))));
        assert_eq!(c.try_classify(150).unwrap(), key(0, 2));
    }

    #[test]
    fn single_tier_narrow_width() {
        let config = ClassConfig {
            width: 8,
            tiers: vec![TierConfig { limit: 1000, step: 100 }],
        };
        let c = SizeClassifier::new(&config).unwrap();
        assert_eq!(c.tiers(), 1);
        assert_eq!(c.classify(799), key(0, 7));
        // Above the nominal top (800) but inside the tier limit.
        assert_eq!(c.classify(950), key(0, 7));
        assert_eq!(c.classify(5000), key(0, 7));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ClassConfig { width: 65, tiers: vec![] };
        assert!(SizeClassifier::new(&config).is_err());
    }

    proptest! {
        #[test]
        fn classification_is_monotonic_within_tier(a in 0u64..20_000, b in 0u64..20_000) {
            let c = default_classifier();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let (klo, khi) = (c.classify(lo), c.classify(hi));
            prop_assert!(klo.tier <= khi.tier);
            if klo.tier == khi.tier {
                prop_assert!(klo.class <= khi.class);
            }
        }

        #[test]
        fn at_or_above_nominal_top_is_top_class(extra in 0u64..1_000_000) {
            let c = default_classifier();
            let top = c.width() - 1;
            prop_assert_eq!(c.classify(c.nominal_top(1) + extra).class, top);
            // Tier 0's nominal top coincides with its limit.
            prop_assert_eq!(c.classify(c.nominal_top(0)).class, top);
        }

        #[test]
        fn class_min_capacity_bounds_members(capacity in 0u64..16_384) {
            let c = default_classifier();
            let k = c.classify(capacity);
            let min = c.class_min_capacity(k);
            prop_assert!(min <= capacity);
            if k.class < c.width() - 1 {
                let step = if k.tier == 0 { 64 } else { 192 };
                prop_assert!(capacity < min + step);
            }
        }
    }
}
