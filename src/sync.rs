//! Process-shared synchronization primitives.
//!
//! The allocator's lock lives inside the shared segment, so it must be
//! configured with `PTHREAD_PROCESS_SHARED` to have a stable identity in
//! every process mapping the segment. This module wraps the pthread
//! attribute dance for both the mutex the allocator uses and the rwlock
//! made available to clients that build their own structures on top of
//! the heap (a shared-buffer layer, for instance).
//!
//! `rustix` does not wrap the pthread API, so this module talks to
//! `libc` directly.

use crate::error::{Error, Result};
use rustix::io::Errno;
use std::mem::MaybeUninit;

/// Map a pthread return code onto `Error::LockInit`.
fn check(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::LockInit(Errno::from_raw_os_error(rc)))
    }
}

/// Initialize a mutex in shared memory for cross-process use.
///
/// # Safety
///
/// `mutex` must point to uninitialized, writable storage that outlives
/// every process using the lock (in practice: inside the shared
/// segment). The mutex must not already be initialized.
pub unsafe fn init_shared_mutex(mutex: *mut libc::pthread_mutex_t) -> Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    // SAFETY: attr is valid local storage for a mutexattr.
    check(unsafe { libc::pthread_mutexattr_init(attr.as_mut_ptr()) })?;

    let result = (|| {
        // SAFETY: attr was initialized above; mutex is valid per the caller.
        check(unsafe {
            libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
        })?;
        // SAFETY: as above.
        check(unsafe { libc::pthread_mutex_init(mutex, attr.as_ptr()) })
    })();

    // SAFETY: attr was initialized above; destroy regardless of outcome.
    unsafe { libc::pthread_mutexattr_destroy(attr.as_mut_ptr()) };
    result
}

/// Initialize a reader/writer lock in shared memory for cross-process use.
///
/// The allocator itself does not take rwlocks; this exists for clients
/// that keep their own read-mostly structures inside the segment.
///
/// # Safety
///
/// Same contract as [`init_shared_mutex`], for `lock`.
pub unsafe fn init_shared_rwlock(lock: *mut libc::pthread_rwlock_t) -> Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_rwlockattr_t>::uninit();
    // SAFETY: attr is valid local storage for a rwlockattr.
    check(unsafe { libc::pthread_rwlockattr_init(attr.as_mut_ptr()) })?;

    let result = (|| {
        // SAFETY: attr was initialized above; lock is valid per the caller.
        check(unsafe {
            libc::pthread_rwlockattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED)
        })?;
        // SAFETY: as above.
        check(unsafe { libc::pthread_rwlock_init(lock, attr.as_ptr()) })
    })();

    // SAFETY: attr was initialized above; destroy regardless of outcome.
    unsafe { libc::pthread_rwlockattr_destroy(attr.as_mut_ptr()) };
    result
}

/// RAII guard for a pthread mutex in shared memory.
///
/// Unlocks on drop. Lock and unlock failures on a correctly initialized
/// process-shared mutex are programmer errors and are debug-asserted,
/// matching the allocator's no-recovery policy.
pub(crate) struct MutexGuard {
    mutex: *mut libc::pthread_mutex_t,
}

/// Lock `mutex` and return a guard that unlocks on drop.
///
/// # Safety
///
/// `mutex` must point to a mutex initialized by [`init_shared_mutex`]
/// and must stay mapped for the guard's lifetime.
pub(crate) unsafe fn lock(mutex: *mut libc::pthread_mutex_t) -> MutexGuard {
    // SAFETY: mutex is initialized and mapped per the caller.
    let _rc = unsafe { libc::pthread_mutex_lock(mutex) };
    debug_assert_eq!(_rc, 0, "pthread_mutex_lock failed");
    MutexGuard { mutex }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        // SAFETY: the guard was created from an initialized, mapped mutex.
        let _rc = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        debug_assert_eq!(_rc, 0, "pthread_mutex_unlock failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;
    use std::thread;

    struct Shared {
        mutex: UnsafeCell<libc::pthread_mutex_t>,
        counter: UnsafeCell<u64>,
    }

    // SAFETY: the counter is only touched while the mutex is held.
    unsafe impl Send for Shared {}
    unsafe impl Sync for Shared {}

    #[test]
    fn test_mutex_init_and_guard() {
        let shared = Shared {
            mutex: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            counter: UnsafeCell::new(0),
        };
        unsafe {
            init_shared_mutex(shared.mutex.get()).unwrap();
            let guard = lock(shared.mutex.get());
            *shared.counter.get() += 1;
            drop(guard);
        }
        assert_eq!(unsafe { *shared.counter.get() }, 1);
    }

    #[test]
    fn test_mutex_excludes_across_threads() {
        let shared = Arc::new(Shared {
            mutex: UnsafeCell::new(unsafe { MaybeUninit::zeroed().assume_init() }),
            counter: UnsafeCell::new(0),
        });
        unsafe {
            init_shared_mutex(shared.mutex.get()).unwrap();
        }

        let mut handles = vec![];
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    unsafe {
                        let _guard = lock(shared.mutex.get());
                        *shared.counter.get() += 1;
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(unsafe { *shared.counter.get() }, 40_000);
    }

    #[test]
    fn test_rwlock_init() {
        let mut rwlock = MaybeUninit::<libc::pthread_rwlock_t>::zeroed();
        unsafe {
            init_shared_rwlock(rwlock.as_mut_ptr()).unwrap();
            // The lock must be functional after initialization.
            assert_eq!(libc::pthread_rwlock_rdlock(rwlock.as_mut_ptr()), 0);
            assert_eq!(libc::pthread_rwlock_unlock(rwlock.as_mut_ptr()), 0);
            assert_eq!(libc::pthread_rwlock_wrlock(rwlock.as_mut_ptr()), 0);
            assert_eq!(libc::pthread_rwlock_unlock(rwlock.as_mut_ptr()), 0);
            libc::pthread_rwlock_destroy(rwlock.as_mut_ptr());
        }
    }
}
