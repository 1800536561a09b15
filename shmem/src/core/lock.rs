//! Process-shared locks that stay usable when a holder dies.
//!
//! Every lock in the segment is a `raw_sync` mutex plus the time of its last
//! successful acquisition. An acquisition that times out while that time is
//! older than the staleness threshold assumes the holder is gone, releases the
//! mutex on its behalf and tries exactly once more. A holder that is alive but
//! slower than the threshold loses its lock the same way.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use tracing::{debug, error, warn};

use super::{now_ms, Timestamp, LOCK_TIMEOUT_MS, STALE_LOCK_MS};
use crate::errors::{Result, ShmemLibError};

/// Bytes reserved for the OS mutex (`pthread_mutex_t` is 40 bytes on 64-bit Linux).
pub(crate) const RAW_LOCK_SPACE: usize = 64;

/// First and longest pause between polls of a busy lock.
const POLL_START: Duration = Duration::from_micros(50);
const POLL_MAX: Duration = Duration::from_millis(2);

#[derive(Clone, Debug, PartialEq)]
pub struct LockPolicy {
    /// Wait per attempt.
    pub timeout: Duration,
    /// Age of the last acquisition after which a holder is presumed dead.
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            timeout: Duration::from_millis(LOCK_TIMEOUT_MS),
            stale_after: Duration::from_millis(STALE_LOCK_MS),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum LockWait {
    /// Wait up to the policy timeout per attempt.
    Timed,
    /// A single zero-wait attempt, plus one more after a forced release.
    Try,
}

#[repr(C, align(16))]
pub(crate) struct SharedLock {
    raw: UnsafeCell<[u8; RAW_LOCK_SPACE]>,
    last_lock: AtomicI64,
}

impl SharedLock {
    /// Lays out a fresh mutex at `this`.
    ///
    /// # Safety
    /// `this` must point to writable memory inside a mapping that outlives
    /// every process using the lock, and no one may be using it yet.
    pub(crate) unsafe fn init(this: *mut SharedLock) -> Result<()> {
        let raw = ptr::addr_of_mut!((*this).raw) as *mut u8;
        let needed = Mutex::size_of(Some(raw));
        if needed > RAW_LOCK_SPACE {
            return Err(ShmemLibError::Mismatch(format!(
                "platform mutex needs {} bytes, {} reserved",
                needed, RAW_LOCK_SPACE
            )));
        }
        ptr::write(ptr::addr_of_mut!((*this).last_lock), AtomicI64::new(now_ms()));
        let (lock, _) = Mutex::new(raw, this as *mut u8).map_err(ShmemLibError::lock)?;
        // The mutex lives on in shared memory; this process-local handle only
        // wraps it.
        mem::forget(lock);
        Ok(())
    }

    pub(crate) fn last_lock_time(&self) -> Timestamp {
        self.last_lock.load(Ordering::Acquire)
    }

    fn open(&self) -> Result<Box<dyn LockImpl>> {
        let raw = self.raw.get() as *mut u8;
        let (lock, _) = unsafe { Mutex::from_existing(raw, self as *const _ as *mut u8) }
            .map_err(ShmemLibError::lock)?;
        Ok(lock)
    }

    fn try_once(lock: &dyn LockImpl) -> bool {
        // raw_sync does not carry nanoseconds over into seconds when it builds
        // an absolute deadline, so only zero-length waits are passed to it.
        match lock.try_lock(Timeout::Val(Duration::from_secs(0))) {
            Ok(guard) => {
                // Released by RawGuard instead.
                mem::forget(guard);
                true
            }
            Err(_) => false,
        }
    }

    /// Polls until the lock is taken or `wait` has elapsed.
    fn attempt(lock: &dyn LockImpl, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut pause = POLL_START;
        loop {
            if Self::try_once(lock) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(pause.min(deadline - now));
            pause = (pause * 2).min(POLL_MAX);
        }
    }

    fn locked(&self, raw: Box<dyn LockImpl>) -> RawGuard<'_> {
        self.last_lock.store(now_ms(), Ordering::Release);
        RawGuard {
            raw,
            _lock: PhantomData,
        }
    }

    pub(crate) fn acquire(
        &self,
        policy: &LockPolicy,
        wait: LockWait,
        label: &str,
    ) -> Result<RawGuard<'_>> {
        let per_attempt = match wait {
            LockWait::Timed => policy.timeout,
            LockWait::Try => Duration::from_millis(0),
        };
        let raw = self.open()?;
        if Self::attempt(raw.as_ref(), per_attempt) {
            return Ok(self.locked(raw));
        }

        let held_for = now_ms() - self.last_lock_time();
        if held_for <= policy.stale_after.as_millis() as i64 {
            debug!(lock = label, held_for_ms = held_for, "lock busy");
            return Err(ShmemLibError::LockTimeout {
                label: label.to_string(),
            });
        }

        warn!(
            lock = label,
            held_for_ms = held_for,
            "lock held for too long, forcing its release"
        );
        if let Err(e) = raw.release() {
            warn!(lock = label, error = %e, "forced release reported an error");
        }
        if Self::attempt(raw.as_ref(), per_attempt) {
            return Ok(self.locked(raw));
        }
        warn!(lock = label, "lock still unavailable after forced release");
        Err(ShmemLibError::LockRecoveryFailed {
            label: label.to_string(),
        })
    }
}

pub(crate) struct RawGuard<'a> {
    raw: Box<dyn LockImpl>,
    _lock: PhantomData<&'a SharedLock>,
}

impl Drop for RawGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.raw.release() {
            error!(error = %e, "failed to release shared lock");
        }
    }
}

/// A value in shared memory guarded by a [`SharedLock`].
#[repr(C)]
pub(crate) struct ShmMutex<T> {
    lock: SharedLock,
    data: UnsafeCell<T>,
}

impl<T> ShmMutex<T> {
    /// # Safety
    /// Same contract as [`SharedLock::init`]; `value` is moved into place.
    pub(crate) unsafe fn init(this: *mut ShmMutex<T>, value: T) -> Result<()> {
        ptr::write(UnsafeCell::raw_get(ptr::addr_of!((*this).data)), value);
        SharedLock::init(ptr::addr_of_mut!((*this).lock))
    }

    pub(crate) fn lock(
        &self,
        policy: &LockPolicy,
        wait: LockWait,
        label: &str,
    ) -> Result<ShmMutexGuard<'_, T>> {
        let raw = self.lock.acquire(policy, wait, label)?;
        Ok(ShmMutexGuard {
            _raw: raw,
            data: &self.data,
        })
    }

    pub(crate) fn last_lock_time(&self) -> Timestamp {
        self.lock.last_lock_time()
    }
}

pub(crate) struct ShmMutexGuard<'a, T> {
    _raw: RawGuard<'a>,
    data: &'a UnsafeCell<T>,
}

impl<T> Deref for ShmMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.data.get() }
    }
}

impl<T> DerefMut for ShmMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::sync::Arc;
    use std::thread;

    struct Boxed(Box<MaybeUninit<ShmMutex<u64>>>);

    unsafe impl Send for Boxed {}
    unsafe impl Sync for Boxed {}

    impl Boxed {
        fn new() -> Boxed {
            let mut slot = Box::new(MaybeUninit::<ShmMutex<u64>>::zeroed());
            unsafe { ShmMutex::init(slot.as_mut_ptr(), 0).unwrap() };
            Boxed(slot)
        }

        fn get(&self) -> &ShmMutex<u64> {
            unsafe { &*self.0.as_ptr() }
        }
    }

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            timeout: Duration::from_millis(50),
            stale_after: Duration::from_millis(200),
        }
    }

    #[test]
    fn lock_and_release() {
        let m = Boxed::new();
        {
            let mut guard = m.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
            *guard += 1;
        }
        let guard = m.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
        assert_eq!(*guard, 1);
    }

    #[test]
    fn busy_lock_times_out_before_staleness() {
        let m = Boxed::new();
        let held = m.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
        let policy = LockPolicy {
            timeout: Duration::from_millis(20),
            stale_after: Duration::from_secs(60),
        };
        let err = m.get().lock(&policy, LockWait::Try, "t").err().unwrap();
        assert!(matches!(err, ShmemLibError::LockTimeout { .. }));
        assert!(err.is_transient());
        drop(held);
    }

    #[test]
    fn sub_second_timeout_is_waited_out() {
        let m = Arc::new(Boxed::new());
        let holder = Arc::clone(&m);
        thread::spawn(move || {
            let guard = holder.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
            mem::forget(guard);
        })
        .join()
        .unwrap();

        let policy = LockPolicy {
            timeout: Duration::from_millis(999),
            stale_after: Duration::from_secs(60),
        };
        let started = Instant::now();
        let err = m.get().lock(&policy, LockWait::Timed, "t").err().unwrap();
        let waited = started.elapsed();
        assert!(matches!(err, ShmemLibError::LockTimeout { .. }));
        assert!(waited >= Duration::from_millis(990), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(3), "waited {:?}", waited);
    }

    #[test]
    fn waiter_gets_the_lock_once_it_is_released() {
        let m = Arc::new(Boxed::new());
        let held = m.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
        let waiter = Arc::clone(&m);
        let policy = LockPolicy {
            timeout: Duration::from_millis(1_500),
            stale_after: Duration::from_secs(60),
        };
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let mut guard = waiter.get().lock(&policy, LockWait::Timed, "t").unwrap();
            *guard = 3;
            started.elapsed()
        });
        thread::sleep(Duration::from_millis(200));
        drop(held);
        let waited = handle.join().unwrap();
        assert!(waited >= Duration::from_millis(150), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(1_500), "waited {:?}", waited);
        assert_eq!(*m.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap(), 3);
    }

    #[test]
    fn abandoned_lock_is_forced_open() {
        let m = Arc::new(Boxed::new());
        let holder = Arc::clone(&m);
        thread::spawn(move || {
            let guard = holder.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
            // The holder "crashes" without unlocking.
            mem::forget(guard);
        })
        .join()
        .unwrap();

        thread::sleep(Duration::from_millis(250));
        let before = m.get().last_lock_time();
        let mut guard = m.get().lock(&fast_policy(), LockWait::Timed, "t").unwrap();
        *guard = 7;
        drop(guard);
        assert!(m.get().last_lock_time() > before);
    }
}
