//! Cross-process game event log.
//!
//! Any process that knows the queue name can enqueue lines through a
//! [`LogProducer`]; enqueueing never blocks and drops the line when the
//! queue is full. A single [`GameLogger`] owns the consumer thread that
//! appends the lines to the log file.

use thiserror::Error;
use utils::{ShmError, SyncError};

mod logger;
mod queue;

pub use logger::{format_line, GameLogger, LogProducer};
pub use queue::{LogQueue, LogRecord, RecordKind, MAX_TEXT_LEN, QUEUE_CAPACITY};

#[derive(Error, Debug)]
pub enum LogError {
    #[error("log queue region: {0}")]
    Region(#[from] ShmError),
    #[error("log queue primitive: {0}")]
    Sync(#[from] SyncError),
    #[error("log file I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("log consumer thread panicked")]
    ConsumerPanicked,
}

/// Formats and enqueues a line on a [`LogProducer`], like `format!`.
///
/// Evaluates to `true` if the line was queued, `false` if it was dropped.
#[macro_export]
macro_rules! game_log {
    ($producer:expr, $($arg:tt)*) => {
        $producer.log_fmt(::std::format_args!($($arg)*))
    };
}
