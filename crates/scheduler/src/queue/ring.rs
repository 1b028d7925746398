//! Bounded MPMC ring with per-slot sequence numbers.
//!
//! Slot `i` starts with sequence `i`. A producer at position `p` may claim
//! the slot only while its sequence equals `p`, and publishes `p + 1` after
//! writing. A consumer at position `p` needs sequence `p + 1`, and republishes
//! `p + capacity` after reading so the slot opens again one lap later. The
//! sequence, not the index, decides ownership, which rules out ABA on wrap.
//!
//! Ordering is FIFO. There is no LIFO mode.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use bitfleet_core::{QueueConfig, QueueKind};
use crossbeam::utils::{Backoff, CachePadded};

use super::ClassQueue;

struct Slot<T> {
    seq: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct BoundedRingQueue<T> {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    mask: u64,
    slots: Box<[Slot<T>]>,
}

// Safety: a slot's value is only touched by the thread that won the CAS for
// its position, and hand-off between threads goes through the slot sequence.
unsafe impl<T: Send> Send for BoundedRingQueue<T> {}
unsafe impl<T: Send> Sync for BoundedRingQueue<T> {}

impl<T> BoundedRingQueue<T> {
    /// Capacity is rounded up to a power of two, minimum 2.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
            mask: capacity as u64 - 1,
            slots,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, pos: u64) -> &Slot<T> {
        &self.slots[(pos & self.mask) as usize]
    }

    /// Append `value`, or hand it back if every slot is occupied.
    pub fn put(&self, value: T) -> Result<(), T> {
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::SeqCst);
            let slot = self.slot(tail);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(tail) as i64;

            if diff == 0 {
                if self
                    .tail
                    .compare_exchange_weak(tail, tail + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: winning the CAS makes this thread the slot's only writer for this lap.
                    unsafe { (*slot.value.get()).write(value) };
                    slot.seq.store(tail + 1, Ordering::Release);
                    return Ok(());
                }
            } else if diff < 0 {
                // Slot still holds last lap's value.
                return Err(value);
            }
            // Another producer got ahead; reload the tail.
            backoff.spin();
        }
    }

    /// Remove the oldest value, if any.
    pub fn try_take(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::SeqCst);
            let slot = self.slot(head);
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(head + 1) as i64;

            if diff == 0 {
                if self
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok()
                {
                    // Safety: sequence head+1 means the value was published, and the CAS
                    // gives this thread sole ownership of it.
                    let value = unsafe { (*slot.value.get()).assume_init_read() };
                    slot.seq.store(head + self.mask + 1, Ordering::Release);
                    return Some(value);
                }
            } else if diff < 0 {
                return None;
            }
            backoff.spin();
        }
    }

    /// Approximate number of queued values.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::SeqCst);
        let tail = self.tail.load(Ordering::SeqCst);
        tail.saturating_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send> ClassQueue<T> for BoundedRingQueue<T> {
    const KIND: QueueKind = QueueKind::Bounded;

    fn from_config(config: &QueueConfig) -> Self {
        Self::with_capacity(config.ring_capacity)
    }

    fn put(&self, value: T) -> Result<(), T> {
        BoundedRingQueue::put(self, value)
    }

    fn try_take(&self) -> Option<T> {
        BoundedRingQueue::try_take(self)
    }

    fn is_empty(&self) -> bool {
        BoundedRingQueue::is_empty(self)
    }
}

impl<T> Drop for BoundedRingQueue<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for pos in head..tail {
            let idx = (pos & self.mask) as usize;
            // Safety: positions in [head, tail) hold published, unread values and
            // `&mut self` rules out a producer still mid-write.
            unsafe { self.slots[idx].value.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn capacity_rounds_to_power_of_two() {
        assert_eq!(BoundedRingQueue::<u32>::with_capacity(0).capacity(), 2);
        assert_eq!(BoundedRingQueue::<u32>::with_capacity(1).capacity(), 2);
        assert_eq!(BoundedRingQueue::<u32>::with_capacity(5).capacity(), 8);
        assert_eq!(BoundedRingQueue::<u32>::with_capacity(1024).capacity(), 1024);
    }

    #[test]
    fn fifo_order() {
        let q = BoundedRingQueue::with_capacity(8);
        for i in 0..5 {
            q.put(i).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| q.try_take()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(q.try_take().is_none());
    }

    #[test]
    fn overflow_fails_exactly_once_at_capacity_plus_one() {
        let q = BoundedRingQueue::with_capacity(4);
        let results: Vec<_> = (0..5).map(|i| q.put(i)).collect();
        assert!(results[..4].iter().all(|r| r.is_ok()));
        assert_eq!(results[4], Err(4));
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn slots_are_reused_after_wrap() {
        let q = BoundedRingQueue::with_capacity(2);
        for lap in 0..100 {
            q.put(lap * 2).unwrap();
            q.put(lap * 2 + 1).unwrap();
            assert!(q.put(-1).is_err());
            assert_eq!(q.try_take(), Some(lap * 2));
            assert_eq!(q.try_take(), Some(lap * 2 + 1));
            assert!(q.is_empty());
        }
    }

    #[test]
    fn drop_releases_queued_values() {
        let marker = Arc::new(());
        {
            let q = BoundedRingQueue::with_capacity(4);
            q.put(Arc::clone(&marker)).unwrap();
            q.put(Arc::clone(&marker)).unwrap();
            q.put(Arc::clone(&marker)).unwrap();
            drop(q.try_take());
            assert_eq!(Arc::strong_count(&marker), 3);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;
        let q = BoundedRingQueue::with_capacity(256);
        let taken = std::sync::Mutex::new(Vec::new());
        let remaining = std::sync::atomic::AtomicUsize::new(PRODUCERS * PER_PRODUCER);

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let q = &q;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut v = p * PER_PRODUCER + i;
                        while let Err(back) = q.put(v) {
                            v = back;
                            std::thread::yield_now();
                        }
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    let mut local = Vec::new();
                    while remaining.load(Ordering::SeqCst) > 0 {
                        if let Some(v) = q.try_take() {
                            remaining.fetch_sub(1, Ordering::SeqCst);
                            local.push(v);
                        } else {
                            std::thread::yield_now();
                        }
                    }
                    taken.lock().unwrap().extend(local);
                });
            }
        });

        let taken = taken.into_inner().unwrap();
        assert_eq!(taken.len(), PRODUCERS * PER_PRODUCER);
        let distinct: HashSet<_> = taken.into_iter().collect();
        assert_eq!(distinct.len(), PRODUCERS * PER_PRODUCER);
    }
}
