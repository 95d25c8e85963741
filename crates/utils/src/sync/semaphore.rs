use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use super::condvar::add_duration;
use super::{SyncError, INITIALISED};

/// A process-shared counting semaphore.
#[repr(C)]
pub struct ShmSemaphore {
    inner: UnsafeCell<libc::sem_t>,
    initialised: AtomicU32,
}

unsafe impl Send for ShmSemaphore {}
unsafe impl Sync for ShmSemaphore {}

/// Outcome of [`ShmSemaphore::try_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryWait {
    Decremented,
    WouldBlock,
}

impl ShmSemaphore {
    pub fn init(&self, initial: u32) -> Result<(), SyncError> {
        if unsafe { libc::sem_init(self.inner.get(), 1, initial) } != 0 {
            return Err(SyncError::last_os("sem_init"));
        }
        self.initialised.store(INITIALISED, Ordering::Release);
        Ok(())
    }

    fn ensure_initialised(&self) -> Result<(), SyncError> {
        if self.initialised.load(Ordering::Acquire) == INITIALISED {
            Ok(())
        } else {
            Err(SyncError::Uninitialised {
                primitive: "semaphore",
            })
        }
    }

    /// Blocks until the value is positive, then decrements it.
    /// Interrupted waits are retried.
    pub fn wait(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(SyncError::Os {
                    op: "sem_wait",
                    source: err,
                });
            }
        }
    }

    pub fn try_wait(&self) -> Result<TryWait, SyncError> {
        self.ensure_initialised()?;
        loop {
            if unsafe { libc::sem_trywait(self.inner.get()) } == 0 {
                return Ok(TryWait::Decremented);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(TryWait::WouldBlock),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(SyncError::Os {
                        op: "sem_trywait",
                        source: err,
                    })
                }
            }
        }
    }

    /// Waits at most `timeout`. Returns `true` when the semaphore was
    /// decremented, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, SyncError> {
        self.ensure_initialised()?;
        let mut now = MaybeUninit::<libc::timespec>::uninit();
        // sem_timedwait only understands CLOCK_REALTIME deadlines.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, now.as_mut_ptr()) } != 0 {
            return Err(SyncError::last_os("clock_gettime"));
        }
        let deadline = add_duration(unsafe { now.assume_init() }, timeout);

        loop {
            if unsafe { libc::sem_timedwait(self.inner.get(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => {
                    return Err(SyncError::Os {
                        op: "sem_timedwait",
                        source: err,
                    })
                }
            }
        }
    }

    pub fn post(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        if unsafe { libc::sem_post(self.inner.get()) } != 0 {
            return Err(SyncError::last_os("sem_post"));
        }
        Ok(())
    }

    /// Current value; only a snapshot.
    pub fn value(&self) -> Result<u32, SyncError> {
        self.ensure_initialised()?;
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.inner.get(), &mut value) } != 0 {
            return Err(SyncError::last_os("sem_getvalue"));
        }
        Ok(value.max(0) as u32)
    }

    pub fn destroy(&self) -> Result<(), SyncError> {
        self.ensure_initialised()?;
        if unsafe { libc::sem_destroy(self.inner.get()) } != 0 {
            return Err(SyncError::last_os("sem_destroy"));
        }
        self.initialised.store(0, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::sync::tests::Scratch;

    #[test]
    fn post_then_wait_keeps_count() {
        let scratch = Scratch::<ShmSemaphore>::new("sem_count");
        let sem = scratch.get();
        sem.init(2).unwrap();

        sem.post().unwrap();
        assert_eq!(sem.value().unwrap(), 3);
        sem.wait().unwrap();
        sem.wait().unwrap();
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn try_wait_on_zero_would_block() {
        let scratch = Scratch::<ShmSemaphore>::new("sem_try");
        let sem = scratch.get();
        sem.init(1).unwrap();

        assert_eq!(sem.try_wait().unwrap(), TryWait::Decremented);
        assert_eq!(sem.try_wait().unwrap(), TryWait::WouldBlock);
        assert_eq!(sem.value().unwrap(), 0);
    }

    #[test]
    fn wait_blocks_until_post_from_other_mapping() {
        let scratch = Scratch::<ShmSemaphore>::new("sem_block");
        scratch.get().init(0).unwrap();
        let view = scratch.attach();

        let start = Instant::now();
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            view.get().post().unwrap();
        });

        scratch.get().wait().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        poster.join().unwrap();
    }

    #[test]
    fn wait_timeout_reports_expiry() {
        let scratch = Scratch::<ShmSemaphore>::new("sem_timeout");
        let sem = scratch.get();
        sem.init(0).unwrap();

        assert!(!sem.wait_timeout(Duration::from_millis(30)).unwrap());
        sem.post().unwrap();
        assert!(sem.wait_timeout(Duration::from_millis(30)).unwrap());
    }

    #[test]
    fn uninitialised_semaphore_is_rejected() {
        let scratch = Scratch::<ShmSemaphore>::new("sem_uninit");
        let err = scratch.get().post().unwrap_err();
        assert!(matches!(err, SyncError::Uninitialised { .. }));
        assert!(matches!(
            scratch.get().value(),
            Err(SyncError::Uninitialised { .. })
        ));
    }
}
