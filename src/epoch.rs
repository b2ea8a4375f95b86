// Process-wide epoch registry for deferred reclamation. One global epoch
// counter plus one pinned-epoch record per thread; a structure fenced at
// epoch F may be reclaimed once every registered thread is either idle or
// pinned strictly after F.

use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Record state: registered but outside any critical section.
const IDLE: u64 = u64::MAX;
/// Record state: the owning thread exited; the record may be re-claimed.
const RELEASED: u64 = u64::MAX - 1;

/// Per-thread registry entry. Entries are leaked on first registration and
/// stay on the list forever, so the list length is bounded by the peak
/// number of concurrent threads, not by how many threads ever ran.
struct ThreadRecord {
    /// Pinned epoch, or one of the sentinels above. Both sentinels compare
    /// greater than any real fence, so `is_safe` skips them for free.
    status: CachePadded<AtomicU64>,
    /// Push-once list link; immutable after publication.
    next: AtomicPtr<ThreadRecord>,
}

struct Registry {
    head: AtomicPtr<ThreadRecord>,
    /// Global epoch. Starts at 1 so a stale zero can never look current.
    epoch: AtomicU64,
    /// Highest fence already proven safe; proofs are monotone.
    watermark: AtomicU64,
}

static REGISTRY: Registry = Registry {
    head: AtomicPtr::new(ptr::null_mut()),
    epoch: AtomicU64::new(1),
    watermark: AtomicU64::new(0),
};

struct LocalHandle {
    record: *const ThreadRecord,
}

impl LocalHandle {
    fn acquire() -> LocalHandle {
        // Prefer re-claiming a record released by an exited thread.
        let mut cursor = REGISTRY.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let record = unsafe { &*cursor };
            if record.status.load(Ordering::Relaxed) == RELEASED
                && record
                    .status
                    .compare_exchange(RELEASED, IDLE, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return LocalHandle { record: cursor };
            }
            cursor = record.next.load(Ordering::Acquire);
        }
        let record: &'static ThreadRecord = Box::leak(Box::new(ThreadRecord {
            status: CachePadded::new(AtomicU64::new(IDLE)),
            next: AtomicPtr::new(ptr::null_mut()),
        }));
        let mut head = REGISTRY.head.load(Ordering::Relaxed);
        loop {
            record.next.store(head, Ordering::Relaxed);
            match REGISTRY.head.compare_exchange_weak(
                head,
                record as *const ThreadRecord as *mut ThreadRecord,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => head = current,
            }
        }
        LocalHandle { record }
    }
}

impl Drop for LocalHandle {
    fn drop(&mut self) {
        unsafe { &*self.record }
            .status
            .store(RELEASED, Ordering::Release);
    }
}

thread_local! {
    static LOCAL: LocalHandle = LocalHandle::acquire();
}

/// An epoch-pinned critical section; dropping the guard unpins.
/// Not nestable on one thread, and deliberately `!Send`.
pub(crate) struct Guard {
    record: *const ThreadRecord,
}

/// Pin the calling thread at the current epoch. While the guard lives,
/// no fence issued at or after the pinned value can be proven safe.
pub(crate) fn pin() -> Guard {
    LOCAL.with(|local| {
        let record = unsafe { &*local.record };
        debug_assert!(
            record.status.load(Ordering::Relaxed) == IDLE,
            "epoch pin is not reentrant"
        );
        record
            .status
            .store(REGISTRY.epoch.load(Ordering::Acquire), Ordering::Relaxed);
        // Orders the pin against the critical-section loads that follow;
        // pairs with the fence at the head of `is_safe`.
        fence(Ordering::SeqCst);
        Guard {
            record: local.record,
        }
    })
}

impl Drop for Guard {
    fn drop(&mut self) {
        unsafe { &*self.record }.status.store(IDLE, Ordering::Release);
    }
}

/// Bump the global epoch and return its previous value, to be stamped as a
/// retirement or free fence.
pub(crate) fn advance() -> u64 {
    REGISTRY.epoch.fetch_add(1, Ordering::SeqCst)
}

/// True once every registered thread has provably moved past `fence_value`.
/// The proof is monotone: once safe, always safe.
pub(crate) fn is_safe(fence_value: u64) -> bool {
    if fence_value <= REGISTRY.watermark.load(Ordering::Acquire) {
        return true;
    }
    debug_assert!(fence_value < REGISTRY.epoch.load(Ordering::Relaxed));
    // Pairs with the fence in `pin`: either we observe the pin, or the
    // pinning thread observes every write made before this proof is used.
    fence(Ordering::SeqCst);
    let mut cursor = REGISTRY.head.load(Ordering::Acquire);
    while !cursor.is_null() {
        let record = unsafe { &*cursor };
        if record.status.load(Ordering::Acquire) <= fence_value {
            return false;
        }
        cursor = record.next.load(Ordering::Acquire);
    }
    REGISTRY.watermark.fetch_max(fence_value, Ordering::AcqRel);
    true
}
