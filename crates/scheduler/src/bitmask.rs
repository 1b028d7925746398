//! Presence index: one atomic word per `(region, energy, tier)` cell, bit `k`
//! set while class `k`'s queue is believed non-empty.
//!
//! The bits are hints. A set bit may front an empty queue (a consumer drained
//! it, or a producer marked before enqueuing); consumers clear such bits as
//! they observe them. Region 0 aggregates every region, and its word is
//! updated independently of the regional word, so the two can briefly
//! disagree.

use std::sync::atomic::{AtomicU64, Ordering};

use bitfleet_core::GLOBAL_REGION;
use crossbeam::utils::CachePadded;

use crate::classifier::ClassKey;

/// Mask of every class at or above `min_class`.
pub fn at_or_above(min_class: u32) -> u64 {
    if min_class >= u64::BITS {
        0
    } else {
        !((1u64 << min_class) - 1)
    }
}

pub struct BitmaskIndex {
    words: Box<[CachePadded<AtomicU64>]>,
    energy_levels: usize,
    tiers: usize,
}

impl BitmaskIndex {
    pub fn new(regions: usize, energy_levels: u8, tiers: usize) -> Self {
        let energy_levels = usize::from(energy_levels);
        let words = (0..regions * energy_levels * tiers)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self {
            words,
            energy_levels,
            tiers,
        }
    }

    fn word(&self, region: usize, level: u8, tier: usize) -> &AtomicU64 {
        &self.words[(region * self.energy_levels + usize::from(level)) * self.tiers + tier]
    }

    /// Set the class bit in the resource's own cell and in the aggregate cell.
    pub fn mark_present(&self, region: usize, level: u8, key: ClassKey) {
        let bit = 1u64 << key.class;
        self.word(region, level, key.tier).fetch_or(bit, Ordering::SeqCst);
        if region != GLOBAL_REGION {
            self.word(GLOBAL_REGION, level, key.tier)
                .fetch_or(bit, Ordering::SeqCst);
        }
    }

    /// Re-set any bit a consumer cleared while a producer was enqueuing.
    ///
    /// Called by `register` after the value is in the queue. Both cells are
    /// checked with a plain load first so the common case stays read-only.
    pub fn ensure_present(&self, region: usize, level: u8, key: ClassKey) {
        let bit = 1u64 << key.class;
        let cells = if region == GLOBAL_REGION {
            &[GLOBAL_REGION][..]
        } else {
            &[region, GLOBAL_REGION][..]
        };
        for &cell in cells {
            let word = self.word(cell, level, key.tier);
            if word.load(Ordering::SeqCst) & bit == 0 {
                word.fetch_or(bit, Ordering::SeqCst);
            }
        }
    }

    /// Re-set a single cell's bit (no aggregate propagation).
    pub fn remark(&self, region: usize, level: u8, key: ClassKey) {
        self.word(region, level, key.tier)
            .fetch_or(1u64 << key.class, Ordering::SeqCst);
    }

    /// Clear the class bit in one cell.
    ///
    /// Only the consumer that has just observed the class queue empty calls
    /// this. A concurrent `mark_present` may re-set the bit immediately,
    /// which is correct: the queue may have become non-empty again.
    pub fn clear_if_empty(&self, region: usize, level: u8, key: ClassKey) {
        self.word(region, level, key.tier)
            .fetch_and(!(1u64 << key.class), Ordering::SeqCst);
    }

    pub fn live_mask(&self, region: usize, level: u8, tier: usize) -> u64 {
        self.word(region, level, tier).load(Ordering::SeqCst)
    }

    /// Live classes of `tier` at or above `min_class`.
    pub fn candidate_mask(&self, region: usize, level: u8, tier: usize, min_class: u32) -> u64 {
        self.live_mask(region, level, tier) & at_or_above(min_class)
    }

    pub fn is_marked(&self, region: usize, level: u8, key: ClassKey) -> bool {
        self.live_mask(region, level, key.tier) & (1u64 << key.class) != 0
    }
}
