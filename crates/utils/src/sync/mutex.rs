use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{check, SyncError, INITIALISED};

/// A robust, process-shared mutex living in shared memory.
///
/// If a process dies while holding the lock, the next locker recovers it and
/// a warning is logged instead of every other process deadlocking.
#[repr(C)]
pub struct ShmMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
    initialised: AtomicU32,
}

unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

/// Holds the lock until dropped.
///
/// Not `Send`: the thread that locked must be the one to unlock.
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl ShmMutexGuard<'_> {
    pub(super) fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.mutex.inner.get()
    }

    pub(super) fn reacquired(&self, op: &'static str, code: i32) -> Result<(), SyncError> {
        self.mutex.acquired(op, code)
    }
}

/// Outcome of [`ShmMutex::try_lock`].
pub enum TryLock<'a> {
    Locked(ShmMutexGuard<'a>),
    Busy,
}

impl<'a> TryLock<'a> {
    pub fn into_guard(self) -> Option<ShmMutexGuard<'a>> {
        match self {
            Self::Locked(guard) => Some(guard),
            Self::Busy => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl ShmMutex {
    /// Initialises the mutex in place as process-shared and robust.
    pub fn init(&self) -> Result<(), SyncError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check(
                "pthread_mutexattr_init",
                libc::pthread_mutexattr_init(attr.as_mut_ptr()),
            )?;
            let result = Self::init_with_attr(self.inner.get(), attr.as_mut_ptr());
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            result?;
        }
        self.initialised.store(INITIALISED, Ordering::Release);
        Ok(())
    }

    unsafe fn init_with_attr(
        mutex: *mut libc::pthread_mutex_t,
        attr: *mut libc::pthread_mutexattr_t,
    ) -> Result<(), SyncError> {
        check(
            "pthread_mutexattr_setpshared",
            libc::pthread_mutexattr_setpshared(attr, libc::PTHREAD_PROCESS_SHARED),
        )?;
        check(
            "pthread_mutexattr_setrobust",
            libc::pthread_mutexattr_setrobust(attr, libc::PTHREAD_MUTEX_ROBUST),
        )?;
        check("pthread_mutex_init", libc::pthread_mutex_init(mutex, attr))
    }

    fn ensure_initialised(&self) -> Result<(), SyncError> {
        if self.initialised.load(Ordering::Acquire) == INITIALISED {
            Ok(())
        } else {
            Err(SyncError::Uninitialised {
                primitive: "mutex",
            })
        }
    }

    /// Blocks until the lock is held.
    pub fn lock(&self) -> Result<ShmMutexGuard<'_>, SyncError> {
        self.ensure_initialised()?;
        let code = unsafe { libc::pthread_mutex_lock(self.inner.get()) };
        self.acquired("pthread_mutex_lock", code)?;
        Ok(self.guard())
    }

    /// Takes the lock only if nobody holds it.
    pub fn try_lock(&self) -> Result<TryLock<'_>, SyncError> {
        self.ensure_initialised()?;
        let code = unsafe { libc::pthread_mutex_trylock(self.inner.get()) };
        if code == libc::EBUSY {
            return Ok(TryLock::Busy);
        }
        self.acquired("pthread_mutex_trylock", code)?;
        Ok(TryLock::Locked(self.guard()))
    }

    fn guard(&self) -> ShmMutexGuard<'_> {
        ShmMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    /// Interprets the return code of a call that acquires the mutex.
    fn acquired(&self, op: &'static str, code: i32) -> Result<(), SyncError> {
        match code {
            0 => Ok(()),
            libc::EOWNERDEAD => {
                tracing::warn!(op, "Recovered mutex abandoned by a dead process");
                check("pthread_mutex_consistent", unsafe {
                    libc::pthread_mutex_consistent(self.inner.get())
                })
            }
            other => Err(SyncError::os(op, other)),
        }
    }

    fn unlock(&self) {
        let code = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if code != 0 {
            tracing::error!(
                error = %std::io::Error::from_raw_os_error(code),
                "failed to unlock process-shared mutex"
            );
        }
    }

    /// Tears the mutex down. It must not be locked by anyone.
    pub fn destroy(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        check("pthread_mutex_destroy", unsafe {
            libc::pthread_mutex_destroy(self.inner.get())
        })?;
        self.initialised.store(0, Ordering::Release);
        Ok(())
    }
}
