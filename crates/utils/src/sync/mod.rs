//! Process-shared synchronization primitives.
//!
//! Each primitive wraps the POSIX object configured for
//! `PTHREAD_PROCESS_SHARED` use. None of them can be constructed directly:
//! they only exist as fields of a layout mapped from a
//! [`SharedRegion`](crate::shared_memory::SharedRegion), and are initialised
//! in place with `init`.

use std::io;

use thiserror::Error;

mod condvar;
mod mutex;
mod semaphore;

pub use condvar::ShmCondvar;
pub use mutex::{ShmMutex, ShmMutexGuard, TryLock};
pub use semaphore::{ShmSemaphore, TryWait};

/// Marker stored next to each primitive once `init` succeeded.
const INITIALISED: u32 = 0x5359_4e43;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The primitive was never initialised in shared memory.
    #[error("{primitive} used before initialisation in a shared region")]
    Uninitialised { primitive: &'static str },

    /// The operating system rejected the call; shared state can no longer be trusted.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SyncError {
    fn os(op: &'static str, code: i32) -> Self {
        Self::Os {
            op,
            source: io::Error::from_raw_os_error(code),
        }
    }

    fn last_os(op: &'static str) -> Self {
        Self::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// OS-level failures leave shared state suspect; the process should stop.
    pub fn is_environment(&self) -> bool {
        matches!(self, Self::Os { .. })
    }
}

/// Maps a pthread-style return code to a result.
fn check(op: &'static str, code: i32) -> Result<(), SyncError> {
    if code == 0 {
        Ok(())
    } else {
        Err(SyncError::os(op, code))
    }
}
