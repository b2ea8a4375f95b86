// Structural-change lock. Growth and retirement serialize on this; the
// per-item fast paths never touch it. On Linux the kernel's PI futex keeps
// the holder boosted to the highest waiter's priority; everywhere else (and
// under Miri) a plain mutex gives the same exclusion without the latency
// bound.

/// Raw lock seam for the structural slow paths. `unlock` must only be
/// called by the thread that holds the lock.
pub(crate) trait StructuralLock: Send + Sync {
    fn lock(&self);
    fn unlock(&self);
}

#[cfg(all(target_os = "linux", not(miri)))]
mod pi {
    use std::cell::Cell;
    use std::ptr;
    use std::sync::atomic::{AtomicU32, Ordering};

    thread_local! {
        static CACHED_TID: Cell<u32> = Cell::new(0);
    }

    fn current_tid() -> u32 {
        CACHED_TID.with(|tid| {
            let cached = tid.get();
            if cached != 0 {
                return cached;
            }
            let fresh = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
            tid.set(fresh);
            fresh
        })
    }

    /// Priority-inheriting futex lock. The word holds 0 when free, else the
    /// holder's TID; the kernel sets `FUTEX_WAITERS` on top when anyone
    /// blocks, which is what forces unlock through the syscall.
    pub(crate) struct PiLock {
        word: AtomicU32,
    }

    impl PiLock {
        pub(crate) const fn new() -> PiLock {
            PiLock {
                word: AtomicU32::new(0),
            }
        }

        fn futex(&self, op: libc::c_int) -> libc::c_long {
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.word as *const AtomicU32 as *mut u32,
                    op,
                    0u32,
                    ptr::null::<libc::timespec>(),
                    ptr::null_mut::<u32>(),
                    0u32,
                )
            }
        }
    }

    impl super::StructuralLock for PiLock {
        fn lock(&self) {
            let tid = current_tid();
            loop {
                if self
                    .word
                    .compare_exchange(0, tid, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                // Contended: the kernel queues us, boosts the holder, and
                // on handoff writes our TID into the word itself.
                if self.futex(libc::FUTEX_LOCK_PI) == 0 {
                    return;
                }
                // EINTR or a racing unlock; retry from the fast path.
            }
        }

        fn unlock(&self) {
            let tid = current_tid();
            if self
                .word
                .compare_exchange(tid, 0, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                // Waiters are queued; hand the lock to the top one.
                self.futex(libc::FUTEX_UNLOCK_PI);
            }
        }
    }
}

mod portable {
    use std::sync::{Condvar, Mutex};

    /// Plain blocking lock for platforms without PI futexes. Relaxes the
    /// priority-inversion latency bound, never correctness.
    pub(crate) struct FallbackLock {
        held: Mutex<bool>,
        lifted: Condvar,
    }

    impl FallbackLock {
        pub(crate) const fn new() -> FallbackLock {
            FallbackLock {
                held: Mutex::new(false),
                lifted: Condvar::new(),
            }
        }
    }

    impl super::StructuralLock for FallbackLock {
        fn lock(&self) {
            let mut held = self.held.lock().unwrap();
            while *held {
                held = self.lifted.wait(held).unwrap();
            }
            *held = true;
        }

        fn unlock(&self) {
            *self.held.lock().unwrap() = false;
            self.lifted.notify_one();
        }
    }
}

#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) use pi::PiLock;
#[allow(unused_imports)]
pub(crate) use portable::FallbackLock;

#[cfg(all(target_os = "linux", not(miri)))]
pub(crate) type DefaultLock = PiLock;
#[cfg(any(not(target_os = "linux"), miri))]
pub(crate) type DefaultLock = portable::FallbackLock;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    struct Shared<L> {
        lock: L,
        counter: UnsafeCell<u64>,
    }

    unsafe impl<L: StructuralLock> Sync for Shared<L> {}

    fn exclusion<L, F>(make: F)
    where
        L: StructuralLock + 'static,
        F: FnOnce() -> L,
    {
        const THREADS: u64 = 4;
        const ROUNDS: u64 = 10_000;

        let shared = Arc::new(Shared {
            lock: make(),
            counter: UnsafeCell::new(0),
        });
        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..ROUNDS {
                    shared.lock.lock();
                    // Non-atomic on purpose: lost updates would expose a
                    // broken lock.
                    unsafe { *shared.counter.get() += 1 };
                    shared.lock.unlock();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        shared.lock.lock();
        let total = unsafe { *shared.counter.get() };
        shared.lock.unlock();
        assert_eq!(total, THREADS * ROUNDS, "increments must not be lost");
    }

    #[test]
    fn fallback_lock_excludes() {
        exclusion(FallbackLock::new);
    }

    #[cfg(all(target_os = "linux", not(miri)))]
    #[test]
    fn pi_lock_excludes() {
        exclusion(PiLock::new);
    }

    #[cfg(all(target_os = "linux", not(miri)))]
    #[test]
    fn pi_lock_reacquire_after_contention() {
        let lock = Arc::new(PiLock::new());
        lock.lock();
        let contender = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock();
                lock.unlock();
            })
        };
        // Give the contender time to hit the futex path.
        thread::sleep(std::time::Duration::from_millis(20));
        lock.unlock();
        contender.join().unwrap();
        // The word must be fully released again.
        lock.lock();
        lock.unlock();
    }
}
