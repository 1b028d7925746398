//! Unbounded MPMC queue built from a singly-linked chain of fixed-size chunks.
//!
//! Producers reserve a slot with `fetch_add` on the tail chunk's reservation
//! counter. A producer that lands past the end installs (or finds) the next
//! chunk with one CAS on `next`, helps swing the shared tail pointer, and
//! retries. Losing the install race is success: the winner's chunk is used.
//!
//! Consumers claim with a CAS on the head chunk's claim counter, and only for
//! indices producers have already reserved. An empty `try_take` therefore
//! never burns a slot that a later `put` will fill. A claimed slot may still
//! be mid-write; the consumer waits on the slot's `ready` flag with a
//! spin-then-yield backoff.
//!
//! Drained chunks are retired through `crossbeam::epoch` once both the head
//! and tail pointers have moved past them. The tail never lags behind the
//! head: the head only advances after the tail has been pushed off the chunk
//! being retired.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
#[cfg(test)]
use std::sync::Arc;

use bitfleet_core::{QueueConfig, QueueKind};
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam::utils::{Backoff, CachePadded};

use super::ClassQueue;

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    ready: AtomicBool,
}

struct Chunk<T> {
    slots: Box<[Slot<T>]>,
    /// Slots claimed by consumers. Never exceeds `slots.len()`.
    head: AtomicUsize,
    /// Slots reserved by producers. Overshoots `slots.len()` once the chunk is full.
    tail: AtomicUsize,
    next: Atomic<Chunk<T>>,
    /// Bumped when the chunk is freed.
    #[cfg(test)]
    freed: Option<Arc<AtomicUsize>>,
}

impl<T> Chunk<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity)
                .map(|_| Slot {
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                    ready: AtomicBool::new(false),
                })
                .collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            next: Atomic::null(),
            #[cfg(test)]
            freed: None,
        }
    }

    /// Reserved slots that lie inside this chunk.
    fn reserved(&self) -> usize {
        self.tail.load(Ordering::SeqCst).min(self.slots.len())
    }
}

impl<T> Drop for Chunk<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = (*self.tail.get_mut()).min(self.slots.len());
        for slot in &mut self.slots[head..tail] {
            if *slot.ready.get_mut() {
                // Safety: ready and unclaimed, so the value is initialized and owned here.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
        #[cfg(test)]
        if let Some(freed) = &self.freed {
            freed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct UnboundedChunkQueue<T> {
    head: CachePadded<Atomic<Chunk<T>>>,
    tail: CachePadded<Atomic<Chunk<T>>>,
    chunk_capacity: usize,
    /// Chunks of this queue freed so far.
    #[cfg(test)]
    freed: Arc<AtomicUsize>,
}

// Safety: slot values move between threads only through the reservation and
// claim counters plus the per-slot ready flag; chunks are freed via epochs.
unsafe impl<T: Send> Send for UnboundedChunkQueue<T> {}
unsafe impl<T: Send> Sync for UnboundedChunkQueue<T> {}

impl<T> UnboundedChunkQueue<T> {
    pub fn with_chunk_capacity(chunk_capacity: usize) -> Self {
        let chunk_capacity = chunk_capacity.max(1);
        #[cfg(test)]
        let freed = Arc::new(AtomicUsize::new(0));
        #[cfg_attr(not(test), allow(unused_mut))]
        let mut first = Chunk::new(chunk_capacity);
        #[cfg(test)]
        {
            first.freed = Some(Arc::clone(&freed));
        }
        // Safety: the queue is not shared yet.
        let guard = unsafe { epoch::unprotected() };
        let first = Owned::new(first).into_shared(guard);
        Self {
            head: CachePadded::new(Atomic::from(first)),
            tail: CachePadded::new(Atomic::from(first)),
            chunk_capacity,
            #[cfg(test)]
            freed,
        }
    }

    fn new_chunk(&self) -> Chunk<T> {
        #[cfg_attr(not(test), allow(unused_mut))]
        let mut chunk = Chunk::new(self.chunk_capacity);
        #[cfg(test)]
        {
            chunk.freed = Some(Arc::clone(&self.freed));
        }
        chunk
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    /// Append `value`. Never fails.
    pub fn put(&self, value: T) {
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // Safety: the tail pointer is never null and never points at a retired chunk.
            let chunk = unsafe { tail.deref() };

            let idx = chunk.tail.fetch_add(1, Ordering::SeqCst);
            if idx < chunk.slots.len() {
                let slot = &chunk.slots[idx];
                // Safety: the reservation gives this thread the only write to the slot.
                unsafe { (*slot.value.get()).write(value) };
                slot.ready.store(true, Ordering::Release);
                return;
            }

            let next = self.next_or_install(chunk, guard);
            let _ = self.tail.compare_exchange(
                tail,
                next,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            );
            backoff.spin();
        }
    }

    /// The chunk after `chunk`, allocating it if nobody has yet.
    fn next_or_install<'g>(&self, chunk: &Chunk<T>, guard: &'g Guard) -> Shared<'g, Chunk<T>> {
        let next = chunk.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            return next;
        }
        let fresh = Owned::new(self.new_chunk());
        match chunk.next.compare_exchange(
            Shared::null(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        ) {
            Ok(installed) => installed,
            // Lost the race; our chunk is dropped and the winner's is authoritative.
            Err(err) => err.current,
        }
    }

    /// Remove the oldest value, if any.
    pub fn try_take(&self) -> Option<T> {
        let guard = &epoch::pin();
        let backoff = Backoff::new();
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // Safety: the head pointer is never null; retired chunks are unlinked first.
            let chunk = unsafe { head.deref() };
            let claimed = chunk.head.load(Ordering::SeqCst);

            if claimed < chunk.slots.len() {
                if claimed >= chunk.reserved() {
                    return None;
                }
                if chunk
                    .head
                    .compare_exchange_weak(claimed, claimed + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_err()
                {
                    backoff.spin();
                    continue;
                }
                return Some(Self::read_slot(&chunk.slots[claimed]));
            }

            // Every slot of this chunk is claimed; move on if there is a successor.
            let next = chunk.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return None;
            }
            let _ = self.tail.compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard);
            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                // Safety: neither shared pointer references `head` any more, and readers
                // that still hold it are pinned.
                unsafe { guard.defer_destroy(head) };
            }
        }
    }

    fn read_slot(slot: &Slot<T>) -> T {
        // The producer reserved this index but may not have written yet.
        let backoff = Backoff::new();
        while !slot.ready.load(Ordering::Acquire) {
            backoff.snooze();
        }
        // Safety: ready is set exactly once after the write, and the claim CAS made
        // this thread the slot's only reader.
        unsafe { (*slot.value.get()).assume_init_read() }
    }

    /// True when no reserved slot is left unclaimed. A hint under concurrency.
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let mut current = self.head.load(Ordering::Acquire, guard);
        // Safety: chunks reachable from the head are protected by the guard.
        while let Some(chunk) = unsafe { current.as_ref() } {
            if chunk.head.load(Ordering::SeqCst) < chunk.reserved() {
                return false;
            }
            if chunk.tail.load(Ordering::SeqCst) < chunk.slots.len() {
                return true;
            }
            current = chunk.next.load(Ordering::Acquire, guard);
        }
        true
    }
}

impl<T: Send> ClassQueue<T> for UnboundedChunkQueue<T> {
    const KIND: QueueKind = QueueKind::Unbounded;

    fn from_config(config: &QueueConfig) -> Self {
        Self::with_chunk_capacity(config.chunk_capacity)
    }

    fn put(&self, value: T) -> Result<(), T> {
        UnboundedChunkQueue::put(self, value);
        Ok(())
    }

    fn try_take(&self) -> Option<T> {
        UnboundedChunkQueue::try_take(self)
    }

    fn is_empty(&self) -> bool {
        UnboundedChunkQueue::is_empty(self)
    }
}

impl<T> Drop for UnboundedChunkQueue<T> {
    fn drop(&mut self) {
        // Safety: `&mut self` means no other thread can reach the chain.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard);
            while !current.is_null() {
                let next = current.deref().next.load(Ordering::Relaxed, guard);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fifo_across_chunks() {
        let q = UnboundedChunkQueue::with_chunk_capacity(4);
        for i in 0..10 {
            q.put(i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| q.try_take()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn empty_take_does_not_swallow_later_put() {
        let q = UnboundedChunkQueue::with_chunk_capacity(4);
        assert!(q.try_take().is_none());
        assert!(q.try_take().is_none());
        q.put("a");
        assert_eq!(q.try_take(), Some("a"));
        q.put("b");
        q.put("c");
        assert_eq!(q.try_take(), Some("b"));
        assert!(!q.is_empty());
        assert_eq!(q.try_take(), Some("c"));
        assert!(q.try_take().is_none());
    }

    #[test]
    fn exhausted_chunk_without_successor_is_empty() {
        let q = UnboundedChunkQueue::with_chunk_capacity(2);
        q.put(1);
        q.put(2);
        assert_eq!(q.try_take(), Some(1));
        assert_eq!(q.try_take(), Some(2));
        assert!(q.try_take().is_none());
        assert!(q.is_empty());
        // The next put lands past the end and links a fresh chunk.
        q.put(3);
        assert!(!q.is_empty());
        assert_eq!(q.try_take(), Some(3));
    }

    #[test]
    fn chunk_capacity_of_zero_is_raised() {
        let q = UnboundedChunkQueue::with_chunk_capacity(0);
        assert_eq!(q.chunk_capacity(), 1);
        q.put(7);
        q.put(8);
        assert_eq!(q.try_take(), Some(7));
        assert_eq!(q.try_take(), Some(8));
    }

    #[test]
    fn trait_put_always_accepts() {
        let q: UnboundedChunkQueue<u64> = ClassQueue::from_config(&QueueConfig {
            chunk_capacity: 8,
            ..QueueConfig::default()
        });
        for i in 0..100 {
            assert!(ClassQueue::put(&q, i).is_ok());
        }
        assert_eq!(ClassQueue::try_take(&q), Some(0));
    }

    #[test]
    fn drop_releases_unconsumed_values() {
        let marker = Arc::new(());
        {
            let q = UnboundedChunkQueue::with_chunk_capacity(3);
            for _ in 0..7 {
                q.put(Arc::clone(&marker));
            }
            drop(q.try_take());
            drop(q.try_take());
            drop(q.try_take());
            drop(q.try_take());
            assert_eq!(Arc::strong_count(&marker), 4);
        }
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn drained_chunks_are_freed() {
        let q = UnboundedChunkQueue::with_chunk_capacity(2);
        for i in 0..10 {
            q.put(i);
        }
        // Five full chunks. Draining them moves the head onto the last one.
        let drained: Vec<_> = std::iter::from_fn(|| q.try_take()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());

        // Retired chunks are freed once the epoch moves on.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while q.freed.load(Ordering::SeqCst) < 4 && std::time::Instant::now() < deadline {
            epoch::pin().flush();
            std::thread::yield_now();
        }
        assert_eq!(q.freed.load(Ordering::SeqCst), 4);

        let freed = Arc::clone(&q.freed);
        drop(q);
        assert_eq!(freed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 20_000;
        let q = UnboundedChunkQueue::with_chunk_capacity(64);
        let taken = Mutex::new(Vec::new());
        let remaining = AtomicUsize::new(PRODUCERS * PER_PRODUCER);

        std::thread::scope(|s| {
            for p in 0..PRODUCERS {
                let q = &q;
                s.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        q.put(p * PER_PRODUCER + i);
                    }
                });
            }
            for _ in 0..4 {
                s.spawn(|| {
                    let mut local = Vec::new();
                    while remaining.load(Ordering::SeqCst) > 0 {
                        match q.try_take() {
                            Some(v) => {
                                remaining.fetch_sub(1, Ordering::SeqCst);
                                local.push(v);
                            }
                            None => std::thread::yield_now(),
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
        assert!(q.is_empty());
    }

    #[test]
    fn per_producer_order_is_preserved() {
        let q = UnboundedChunkQueue::with_chunk_capacity(16);
        std::thread::scope(|s| {
            for p in 0..2u32 {
                let q = &q;
                s.spawn(move || {
                    for i in 0..5_000u32 {
                        q.put((p, i));
                    }
                });
            }
        });
        let mut last = [None::<u32>; 2];
        while let Some((p, i)) = q.try_take() {
            if let Some(prev) = last[p as usize] {
                assert!(i > prev, "producer {p} went backwards: {prev} then {i}");
            }
            last[p as usize] = Some(i);
        }
        assert_eq!(last, [Some(4_999), Some(4_999)]);
    }
}
