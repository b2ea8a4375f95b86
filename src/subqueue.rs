// Fixed-capacity lock-free MPMC ring. Every slot packs (generation, value)
// into one 128-bit word so inspect and claim are single atomic operations.
// The generation stored in a physical slot advances by exactly `capacity`
// per reuse, which is what lets both sides detect empty and full without a
// shared size counter.

use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use portable_atomic::AtomicU128;

pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Reserved record index: no successor, empty free list, nothing pending.
pub(crate) const NIL: u32 = u32::MAX;
/// Fence value meaning "not stamped yet"; compares above every real epoch.
pub(crate) const FENCE_NONE: u64 = u64::MAX;

/// Looks-full verdicts a producer may retry after seeing fresh consumer
/// progress, before giving the attempt back to the caller.
const ENQUEUE_PATIENCE: usize = 4;

#[inline]
fn pack(generation: u64, value: u64) -> u128 {
    ((generation as u128) << 64) | value as u128
}

#[inline]
fn generation_of(pair: u128) -> u64 {
    (pair >> 64) as u64
}

#[inline]
fn value_of(pair: u128) -> u64 {
    pair as u64
}

#[repr(transparent)]
struct Slot(AtomicU128);

impl Slot {
    fn new() -> Slot {
        Slot(AtomicU128::new(0))
    }
}

/// Fast-path verdict for one bounded enqueue attempt against one ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Stored,
    /// Consumer cursor verified unmoved: genuinely out of space.
    Full,
    /// Patience ran out while the consumer kept advancing; restart with
    /// fresh queue state instead of growing.
    Contended,
}

/// One ring in the chain. Records live in the pool slab for the queue's
/// whole life and are re-initialized per use; `next` is written at most
/// once per life, under the structural lock.
#[repr(C, align(64))]
pub(crate) struct Subqueue {
    capacity: AtomicU64,
    mask: AtomicU64,
    slots: AtomicPtr<Slot>,
    pub(crate) next: AtomicU32,
    next_free: AtomicU32,
    pub(crate) retire_fence: AtomicU64,
    pub(crate) free_fence: AtomicU64,
    pub(crate) ancestor_count: AtomicU64,
    _pad0: [u8; CACHE_LINE_SIZE - 56],
    /// Authoritative consumer cursor: count of items dequeued so far.
    pub(crate) tail: AtomicU64,
    _pad1: [u8; CACHE_LINE_SIZE - 8],
    /// Producer-side cursor cache. Best effort: either may lag, and
    /// `head_hint` may even regress when a slower producer publishes last.
    /// A bad hint costs retries, never correctness.
    head_hint: AtomicU64,
    tail_hint: AtomicU64,
    _pad2: [u8; CACHE_LINE_SIZE - 16],
    pub(crate) enqueue_collisions: AtomicU64,
    _pad3: [u8; CACHE_LINE_SIZE - 8],
    pub(crate) dequeue_collisions: AtomicU64,
}

impl Subqueue {
    fn vacant() -> Subqueue {
        Subqueue {
            capacity: AtomicU64::new(0),
            mask: AtomicU64::new(0),
            slots: AtomicPtr::new(ptr::null_mut()),
            next: AtomicU32::new(NIL),
            next_free: AtomicU32::new(NIL),
            retire_fence: AtomicU64::new(FENCE_NONE),
            free_fence: AtomicU64::new(FENCE_NONE),
            ancestor_count: AtomicU64::new(0),
            _pad0: [0; CACHE_LINE_SIZE - 56],
            tail: AtomicU64::new(0),
            _pad1: [0; CACHE_LINE_SIZE - 8],
            head_hint: AtomicU64::new(0),
            tail_hint: AtomicU64::new(0),
            _pad2: [0; CACHE_LINE_SIZE - 16],
            enqueue_collisions: AtomicU64::new(0),
            _pad3: [0; CACHE_LINE_SIZE - 8],
            dequeue_collisions: AtomicU64::new(0),
        }
    }

    /// Bring a vacant record up for a new life. The caller holds the
    /// structural lock (or has exclusive access at construction); nothing
    /// can reach the record until it is linked.
    fn init(&self, capacity: u64) {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(self.slots.load(Ordering::Relaxed).is_null());
        let mut ring = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            ring.push(Slot::new());
        }
        let ring = Box::into_raw(ring.into_boxed_slice()) as *mut Slot;
        self.capacity.store(capacity, Ordering::Relaxed);
        self.mask.store(capacity - 1, Ordering::Relaxed);
        self.next.store(NIL, Ordering::Relaxed);
        self.next_free.store(NIL, Ordering::Relaxed);
        self.retire_fence.store(FENCE_NONE, Ordering::Relaxed);
        self.free_fence.store(FENCE_NONE, Ordering::Relaxed);
        self.ancestor_count.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.head_hint.store(0, Ordering::Relaxed);
        self.tail_hint.store(0, Ordering::Relaxed);
        self.enqueue_collisions.store(0, Ordering::Relaxed);
        self.dequeue_collisions.store(0, Ordering::Relaxed);
        // Storage last; the record becomes reachable only through the
        // caller's release-ordered link.
        self.slots.store(ring, Ordering::Release);
    }

    /// Drop the ring storage. Requires the structural lock plus an epoch
    /// proof that no thread can still address this record.
    fn release_storage(&self) {
        let ring = self.slots.swap(ptr::null_mut(), Ordering::Relaxed);
        if ring.is_null() {
            return;
        }
        let len = self.capacity.load(Ordering::Relaxed) as usize;
        unsafe {
            drop(Box::from_raw(slice::from_raw_parts_mut(ring, len)));
        }
    }

    #[inline]
    fn ring(&self) -> &[Slot] {
        let ring = self.slots.load(Ordering::Acquire);
        debug_assert!(!ring.is_null());
        let len = self.capacity.load(Ordering::Relaxed) as usize;
        unsafe { slice::from_raw_parts(ring, len) }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// True when no published item remains at the consumer cursor. Only
    /// decisive once producers provably moved off this ring; before that
    /// the answer can go stale immediately.
    pub(crate) fn is_drained(&self) -> bool {
        let ring = self.ring();
        let mask = self.mask.load(Ordering::Relaxed);
        let next = self.tail.load(Ordering::Acquire) + 1;
        generation_of(ring[(next & mask) as usize].0.load(Ordering::Acquire)) < next
    }

    /// Claim the next item. `None` means empty at the current cursor; the
    /// caller decides whether to follow the chain.
    pub(crate) fn pop(&self) -> Option<u64> {
        let ring = self.ring();
        let mask = self.mask.load(Ordering::Relaxed);
        let mut collisions = 0u64;
        loop {
            let claimed = self.tail.load(Ordering::Acquire) + 1;
            let snap = ring[(claimed & mask) as usize].0.load(Ordering::Acquire);
            if generation_of(snap) < claimed {
                // Nothing published at this position yet.
                return None;
            }
            if self
                .tail
                .compare_exchange(claimed - 1, claimed, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Winning the cursor pins the snapshot: the slot cannot be
                // rewritten until the cursor passes it by a full lap.
                debug_assert_eq!(generation_of(snap), claimed);
                if collisions > 0 {
                    self.dequeue_collisions
                        .fetch_add(collisions, Ordering::Relaxed);
                }
                return Some(value_of(snap));
            }
            collisions += 1;
        }
    }

    /// One bounded enqueue attempt.
    pub(crate) fn push(&self, value: u64) -> PushOutcome {
        let mut head = self.head_hint.load(Ordering::Relaxed);
        let mut tail = self.tail_hint.load(Ordering::Relaxed);
        for _ in 0..ENQUEUE_PATIENCE {
            match self.claim(value, &mut head, tail) {
                Ok(tries) => {
                    if tries > 1 {
                        self.enqueue_collisions
                            .fetch_add(tries - 1, Ordering::Relaxed);
                    }
                    self.head_hint.store(head, Ordering::Relaxed);
                    return PushOutcome::Stored;
                }
                Err(tries) => {
                    if tries > 1 {
                        self.enqueue_collisions
                            .fetch_add(tries - 1, Ordering::Relaxed);
                    }
                    let observed = self.tail.load(Ordering::Acquire);
                    debug_assert!(observed >= tail);
                    if observed <= tail {
                        return PushOutcome::Full;
                    }
                    // The consumer moved; remember how far and go again.
                    tail = observed;
                    self.tail_hint.fetch_max(observed, Ordering::Relaxed);
                }
            }
        }
        PushOutcome::Contended
    }

    /// Scan forward from the cached head for a claimable slot. `Ok(tries)`
    /// stored the value; `Err(tries)` reports looks-full against the
    /// consumer progress handed in. `tries` counts pair-CAS attempts so the
    /// caller can account collisions.
    fn claim(&self, value: u64, head: &mut u64, tail: u64) -> Result<u64, u64> {
        let ring = self.ring();
        let mask = self.mask.load(Ordering::Relaxed);
        let mut tries = 0u64;
        loop {
            *head += 1;
            let slot = &ring[(*head & mask) as usize];
            let snap = slot.0.load(Ordering::Acquire);
            let generation = generation_of(snap);
            if generation >= *head {
                // Another producer already owns this position.
                continue;
            }
            if generation > tail {
                // A full lap ahead of the consumer, as far as we know.
                *head -= 1;
                return Err(tries);
            }
            tries += 1;
            if slot
                .0
                .compare_exchange(
                    snap,
                    pack(*head, value),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(tries);
            }
        }
    }
}

impl Drop for Subqueue {
    fn drop(&mut self) {
        self.release_storage();
    }
}

/// Slab of ring records. Capacities strictly double from the initial size
/// to the ceiling, so a chain can touch at most log2(max/initial) + 1
/// records at once; the slab is sized to that bound, never reallocates,
/// and record indices stay stable for the queue's whole life.
pub(crate) struct SubqueuePool {
    records: Box<[Subqueue]>,
    /// Next never-used record. Moves only under the structural lock.
    fresh: AtomicU32,
    /// Recycled records, epoch-proven before admission. Lock-protected.
    free_head: AtomicU32,
}

impl SubqueuePool {
    pub(crate) fn new(initial_capacity: u64, max_capacity: u64) -> SubqueuePool {
        debug_assert!(initial_capacity.is_power_of_two());
        debug_assert!(max_capacity.is_power_of_two());
        debug_assert!(initial_capacity <= max_capacity);
        let lives =
            (max_capacity.trailing_zeros() - initial_capacity.trailing_zeros() + 1) as usize;
        let mut records = Vec::with_capacity(lives);
        for _ in 0..lives {
            records.push(Subqueue::vacant());
        }
        SubqueuePool {
            records: records.into_boxed_slice(),
            fresh: AtomicU32::new(0),
            free_head: AtomicU32::new(NIL),
        }
    }

    #[inline]
    pub(crate) fn get(&self, index: u32) -> &Subqueue {
        &self.records[index as usize]
    }

    /// Take a record (recycled first) and initialize its ring. The caller
    /// holds the structural lock or has exclusive access at construction.
    pub(crate) fn alloc(&self, capacity: u64) -> u32 {
        let index = match self.free_head.load(Ordering::Relaxed) {
            NIL => {
                let fresh = self.fresh.load(Ordering::Relaxed);
                assert!(
                    (fresh as usize) < self.records.len(),
                    "subqueue record slab exhausted"
                );
                self.fresh.store(fresh + 1, Ordering::Relaxed);
                fresh
            }
            head => {
                let next = self.get(head).next_free.load(Ordering::Relaxed);
                self.free_head.store(next, Ordering::Relaxed);
                head
            }
        };
        self.get(index).init(capacity);
        index
    }

    /// Release a record's ring and recycle the record. Requires the
    /// structural lock and the epoch proof for the record's free fence;
    /// past that proof no stale handle to `index` can exist.
    pub(crate) fn recycle(&self, index: u32) {
        let record = self.get(index);
        record.release_storage();
        record
            .next_free
            .store(self.free_head.load(Ordering::Relaxed), Ordering::Relaxed);
        self.free_head.store(index, Ordering::Relaxed);
    }
}

#[cfg(test)]
impl SubqueuePool {
    pub(crate) fn fresh_used(&self) -> u32 {
        self.fresh.load(Ordering::Relaxed)
    }

    pub(crate) fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut cursor = self.free_head.load(Ordering::Relaxed);
        while cursor != NIL {
            len += 1;
            cursor = self.get(cursor).next_free.load(Ordering::Relaxed);
        }
        len
    }
}
