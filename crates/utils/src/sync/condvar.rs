use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::{check, ShmMutexGuard, SyncError, INITIALISED};

/// A process-shared condition variable, paired with a [`super::ShmMutex`].
///
/// Timed waits run on `CLOCK_MONOTONIC`.
#[repr(C)]
pub struct ShmCondvar {
    inner: UnsafeCell<libc::pthread_cond_t>,
    initialised: AtomicU32,
}

unsafe impl Send for ShmCondvar {}
unsafe impl Sync for ShmCondvar {}

impl ShmCondvar {
    pub fn init(&self) -> Result<(), SyncError> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        unsafe {
            check(
                "pthread_condattr_init",
                libc::pthread_condattr_init(attr.as_mut_ptr()),
            )?;
            let result = Self::init_with_attr(self.inner.get(), attr.as_mut_ptr());
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            result?;
        }
        self.initialised.store(INITIALISED, Ordering::Release);
        Ok(())
    }

    unsafe fn init_with_attr(
        cond: *mut libc::pthread_cond_t,
        attr: *mut libc::pthread_condattr_t,
    ) -> Result<(), SyncError> {
        check(
            "pthread_condattr_setpshared",
            libc::pthread_condattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED),
        )?;
        check(
            "pthread_condattr_setclock",
            libc::pthread_condattr_setclock(attr, libc::CLOCK_MONOTONIC),
        )?;
        check("pthread_cond_init", libc::pthread_cond_init(cond, attr))
    }

    fn ensure_initialised(&self) -> Result<(), SyncError> {
        if self.initialised.load(Ordering::Acquire) == INITIALISED {
            Ok(())
        } else {
            Err(SyncError::Uninitialised {
                primitive: "condition variable",
            })
        }
    }

    /// Atomically releases the guarded mutex and blocks; the mutex is held
    /// again when this returns. Wake-ups may be spurious.
    pub fn wait(&self, guard: &mut ShmMutexGuard<'_>) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        let code = unsafe { libc::pthread_cond_wait(self.inner.get(), guard.raw()) };
        guard.reacquired("pthread_cond_wait", code)
    }

    /// Waits until `condition` returns false.
    pub fn wait_while<F>(
        &self,
        guard: &mut ShmMutexGuard<'_>,
        mut condition: F,
    ) -> Result<(), SyncError>
    where
        F: FnMut() -> bool,
    {
        while condition() {
            self.wait(guard)?;
        }
        Ok(())
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    /// Returns `true` when the wait timed out.
    pub fn wait_timeout(
        &self,
        guard: &mut ShmMutexGuard<'_>,
        timeout: Duration,
    ) -> Result<bool, SyncError> {
        self.ensure_initialised()?;
        let deadline = monotonic_deadline(timeout)?;
        let code =
            unsafe { libc::pthread_cond_timedwait(self.inner.get(), guard.raw(), &deadline) };
        if code == libc::ETIMEDOUT {
            return Ok(true);
        }
        guard.reacquired("pthread_cond_timedwait", code)?;
        Ok(false)
    }

    pub fn notify_one(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        check("pthread_cond_signal", unsafe {
            libc::pthread_cond_signal(self.inner.get())
        })
    }

    pub fn notify_all(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.inner.get())
        })
    }

    /// Tears the condition variable down. No process may be waiting on it.
    pub fn destroy(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        check("pthread_cond_destroy", unsafe {
            libc::pthread_cond_destroy(self.inner.get())
        })?;
        self.initialised.store(0, Ordering::Release);
        Ok(())
    }
}

fn monotonic_deadline(timeout: Duration) -> Result<libc::timespec, SyncError> {
    let mut now = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, now.as_mut_ptr()) } != 0 {
        return Err(SyncError::last_os("clock_gettime"));
    }
    let now = unsafe { now.assume_init() };
    Ok(add_duration(now, timeout))
}

pub(super) fn add_duration(base: libc::timespec, timeout: Duration) -> libc::timespec {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    let mut secs = (base.tv_sec as i64).saturating_add(timeout.as_secs() as i64);
    let mut nanos = base.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    if nanos >= NANOS_PER_SEC {
        secs = secs.saturating_add(1);
        nanos -= NANOS_PER_SEC;
    }
    libc::timespec {
        tv_sec: secs as libc::time_t,
        tv_nsec: nanos as _,
    }
}
