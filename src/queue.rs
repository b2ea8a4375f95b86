// Growable MPMC queue: a chain of lock-free rings. Producers write into
// the newest ring, consumers drain the oldest. A full ring gets a
// double-capacity successor linked behind the structural lock; a drained
// ring is retired and recycled once the epoch registry proves no thread
// can still touch it. At most one retired ring awaits release at a time,
// so chain garbage collection advances one link per proof.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::epoch;
use crate::lock::{DefaultLock, StructuralLock};
use crate::subqueue::{PushOutcome, SubqueuePool, FENCE_NONE, NIL};

/// Ring capacity selected when `new` is passed zero.
const DEFAULT_INITIAL_CAPACITY: u64 = 32;
/// Growth ceiling selected when `new` is passed zero.
const DEFAULT_MAX_CAPACITY: u64 = 1 << 59;

/// Contention and progress counters, snapshotted from the consumer-facing
/// ring. Statistics are carried forward when a ring retires, so the
/// numbers are cumulative for the whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Extra pair-CAS attempts producers needed beyond the first.
    pub enqueue_collisions: u64,
    /// Consumer cursor races lost.
    pub dequeue_collisions: u64,
    /// Items dequeued over the queue's life.
    pub processed: u64,
}

/// Mostly-atomic growable MPMC queue of `u64` values.
///
/// Shared by reference; wrap in `Arc` to hand it to threads. `enqueue`
/// blocks (retrying and growing) until the value is stored; `dequeue` is a
/// non-blocking poll.
pub struct Queue {
    pool: SubqueuePool,
    max_capacity: u64,
    /// Producer-facing record; advances only under the lock.
    enq: AtomicU32,
    /// Consumer-facing record; advances only under the lock.
    deq: AtomicU32,
    /// At most one retired record awaiting physical release.
    pending_free: AtomicU32,
    lock: DefaultLock,
}

impl Queue {
    /// Build a queue with the given initial ring capacity and growth
    /// ceiling; zero selects the defaults (32 and 1 << 59). Panics on
    /// non-power-of-two capacities or `initial > max`: sizing errors are
    /// configuration bugs, not runtime conditions.
    pub fn new(initial_capacity: u64, max_capacity: u64) -> Queue {
        let initial = if initial_capacity == 0 {
            DEFAULT_INITIAL_CAPACITY
        } else {
            initial_capacity
        };
        let max = if max_capacity == 0 {
            DEFAULT_MAX_CAPACITY
        } else {
            max_capacity
        };
        assert!(
            initial.is_power_of_two(),
            "initial capacity must be a power of two"
        );
        assert!(max.is_power_of_two(), "max capacity must be a power of two");
        assert!(
            initial <= max,
            "initial capacity must not exceed max capacity"
        );
        let pool = SubqueuePool::new(initial, max);
        let first = pool.alloc(initial);
        Queue {
            pool,
            max_capacity: max,
            enq: AtomicU32::new(first),
            deq: AtomicU32::new(first),
            pending_free: AtomicU32::new(NIL),
            lock: DefaultLock::new(),
        }
    }

    /// Store `value`. Only returns once the value is in a ring: full rings
    /// grow the chain, contended attempts restart. Panics if growth would
    /// exceed the configured ceiling.
    pub fn enqueue(&self, value: u64) {
        // The pin spans the whole attempt, growth included: a thread that
        // can still address a ring is pinned no later than that ring's
        // retirement fence, so the ring outlives every use of `index`.
        let _guard = epoch::pin();
        loop {
            let index = self.enq.load(Ordering::Acquire);
            match self.pool.get(index).push(value) {
                PushOutcome::Stored => return,
                PushOutcome::Contended => continue,
                PushOutcome::Full => self.grow(index),
            }
        }
    }

    /// Non-blocking poll. Walks the chain from the consumer-facing ring;
    /// each empty ring triggers at most two maintenance steps: release the
    /// pending record once its free fence is proven, then retire the
    /// current ring once it is drained, fenced, and proven.
    pub fn dequeue(&self) -> Option<u64> {
        let _guard = epoch::pin();
        let mut index = self.deq.load(Ordering::Acquire);
        loop {
            let subq = self.pool.get(index);
            if let Some(value) = subq.pop() {
                return Some(value);
            }
            self.try_release_pending();
            let next = subq.next.load(Ordering::Acquire);
            if next == NIL {
                return None;
            }
            self.try_retire(index, next);
            index = next;
        }
    }

    /// Snapshot of the consumer-facing ring's carried statistics.
    pub fn stats(&self) -> QueueStats {
        let _guard = epoch::pin();
        let subq = self.pool.get(self.deq.load(Ordering::Acquire));
        QueueStats {
            enqueue_collisions: subq.enqueue_collisions.load(Ordering::Relaxed),
            dequeue_collisions: subq.dequeue_collisions.load(Ordering::Relaxed),
            processed: subq.ancestor_count.load(Ordering::Relaxed)
                + subq.tail.load(Ordering::Relaxed),
        }
    }

    /// Capacity of the ring producers currently target.
    pub fn capacity(&self) -> u64 {
        let _guard = epoch::pin();
        self.pool.get(self.enq.load(Ordering::Acquire)).capacity()
    }

    /// Slow path: link a double-capacity successor behind the lock. The
    /// caller is pinned, so `index` cannot be recycled while we wait.
    fn grow(&self, index: u32) {
        self.lock.lock();
        // Revalidate: the loser of a growth race (or a producer whose full
        // verdict went stale while it waited here) finds the producer
        // pointer moved on and just retries.
        if self.enq.load(Ordering::Acquire) == index {
            let full = self.pool.get(index);
            debug_assert_eq!(full.next.load(Ordering::Acquire), NIL);
            let grown = full.capacity() * 2;
            assert!(
                grown <= self.max_capacity,
                "queue grew past its configured max capacity"
            );
            let successor = self.pool.alloc(grown);
            full.next.store(successor, Ordering::Release);
            self.enq.store(successor, Ordering::Release);
            // The successor must be visible before the fence exists, so a
            // producer pinned after the fence cannot still see `full`.
            fence(Ordering::SeqCst);
            full.retire_fence.store(epoch::advance(), Ordering::Release);
        }
        self.lock.unlock();
    }

    /// Maintenance step 1: physically release the pending record once its
    /// own free fence is proven passed.
    fn try_release_pending(&self) {
        let pending = self.pending_free.load(Ordering::Acquire);
        if pending == NIL {
            return;
        }
        // The record can be released and re-allocated between these two
        // loads, in which case its fresh life's fence reads as unstamped.
        let fence_value = self.pool.get(pending).free_fence.load(Ordering::Acquire);
        if fence_value == FENCE_NONE || !epoch::is_safe(fence_value) {
            return;
        }
        self.lock.lock();
        // Reload: another consumer may have released it, and a newer,
        // unproven record may already hang here.
        let pending = self.pending_free.load(Ordering::Acquire);
        if pending != NIL
            && epoch::is_safe(self.pool.get(pending).free_fence.load(Ordering::Acquire))
        {
            self.pool.recycle(pending);
            self.pending_free.store(NIL, Ordering::Release);
        }
        self.lock.unlock();
    }

    /// Maintenance step 2: retire a drained ring into `pending_free` once
    /// producers provably moved past it and nothing else is pending.
    fn try_retire(&self, index: u32, next: u32) {
        let subq = self.pool.get(index);
        let retire_fence = subq.retire_fence.load(Ordering::Acquire);
        if retire_fence == FENCE_NONE
            || self.pending_free.load(Ordering::Acquire) != NIL
            || !epoch::is_safe(retire_fence)
        {
            return;
        }
        self.lock.lock();
        // Past the retirement proof no producer can publish here anymore,
        // so one drained probe is decisive. A straggler that slipped one
        // last item in after our empty pop keeps the ring alive; the next
        // pass returns the item.
        if self.pending_free.load(Ordering::Acquire) == NIL
            && self.deq.load(Ordering::Acquire) == index
            && subq.is_drained()
        {
            // Carry statistics into the survivor first so a stats snapshot
            // never dips while the consumer pointer flips over.
            let successor = self.pool.get(next);
            successor.enqueue_collisions.fetch_add(
                subq.enqueue_collisions.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            successor.dequeue_collisions.fetch_add(
                subq.dequeue_collisions.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            successor.ancestor_count.store(
                subq.ancestor_count.load(Ordering::Relaxed) + subq.tail.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
            self.deq.store(next, Ordering::Release);
            // Same publication discipline as growth: the consumer pointer
            // must be visible before the free fence exists, so a consumer
            // pinned after the fence cannot still walk onto this record.
            fence(Ordering::SeqCst);
            subq.free_fence.store(epoch::advance(), Ordering::Release);
            self.pending_free.store(index, Ordering::Release);
        }
        self.lock.unlock();
    }
}

impl Default for Queue {
    fn default() -> Queue {
        Queue::new(0, 0)
    }
}
