use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{Local, TimeZone};
use tracing::{debug, error, info, warn};

use crate::queue::{LogQueue, LogRecord, RecordKind};
use crate::LogError;

const SHUTDOWN_RETRY: Duration = Duration::from_millis(100);

/// Renders one log file line: `YYYY-MM-DD HH:MM:SS.mmm [pid] text`.
pub fn format_line(record: &LogRecord) -> String {
    let stamp = match Local.timestamp_millis_opt(record.timestamp_ms).single() {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
    };
    format!("{stamp} [{}] {}", record.pid, record.text)
}

/// Enqueues lines on a shared log queue from any process.
#[derive(Debug, Clone)]
pub struct LogProducer {
    queue: Arc<LogQueue>,
}

impl LogProducer {
    /// Attaches to the queue owned by another process's [`GameLogger`].
    pub fn attach(queue_name: &str) -> Result<Self, LogError> {
        Ok(Self {
            queue: Arc::new(LogQueue::attach(queue_name)?),
        })
    }

    /// Queues `text`. Never blocks; returns `false` if the line was dropped.
    pub fn log(&self, text: &str) -> bool {
        match self.queue.try_push(&LogRecord::message(text)) {
            Ok(queued) => queued,
            Err(e) => {
                debug!(error = %e, "game log enqueue failed");
                false
            }
        }
    }

    pub fn log_fmt(&self, args: fmt::Arguments<'_>) -> bool {
        match args.as_str() {
            Some(text) => self.log(text),
            None => self.log(&args.to_string()),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

/// Owns the consumer thread that drains a [`LogQueue`] into a file.
#[derive(Debug)]
pub struct GameLogger {
    queue: Arc<LogQueue>,
    path: PathBuf,
    consumer: Option<JoinHandle<Result<u64, LogError>>>,
    remove_on_shutdown: bool,
}

impl GameLogger {
    /// Creates the named queue, starts the consumer and writes a banner.
    /// The queue region is removed again on shutdown.
    pub fn start(queue_name: &str, path: impl AsRef<Path>) -> Result<Self, LogError> {
        let queue = LogQueue::create(queue_name)?;
        let mut logger = Self::spawn(queue, path)?;
        logger.remove_on_shutdown = true;
        logger
            .producer()
            .log(&format!("game log started (queue {queue_name})"));
        Ok(logger)
    }

    /// Starts a consumer for an existing queue, appending to `path`.
    pub fn spawn(queue: LogQueue, path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let queue = Arc::new(queue);

        let consumer_queue = Arc::clone(&queue);
        let consumer = std::thread::Builder::new()
            .name("game-log-consumer".to_string())
            .spawn(move || consume(&consumer_queue, file))?;

        info!(queue = %queue.name(), path = %path.display(), "Game log consumer started");
        Ok(Self {
            queue,
            path,
            consumer: Some(consumer),
            remove_on_shutdown: false,
        })
    }

    /// A producer sharing this logger's mapping.
    pub fn producer(&self) -> LogProducer {
        LogProducer {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dropped(&self) -> u64 {
        self.queue.dropped()
    }

    /// Sends the shutdown marker and waits for the consumer to finish.
    /// Every line queued before the call is written first.
    pub fn shutdown(mut self) -> Result<u64, LogError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<u64, LogError> {
        let Some(consumer) = self.consumer.take() else {
            return Ok(0);
        };
        // A consumer that died early never frees a slot, so the marker is
        // only retried while the thread is still alive.
        let marker = LogRecord::shutdown();
        while !self.queue.push_timeout(&marker, SHUTDOWN_RETRY)? {
            if consumer.is_finished() {
                warn!(queue = %self.queue.name(), "game log consumer already exited");
                break;
            }
        }
        let written = consumer.join().map_err(|_| LogError::ConsumerPanicked)??;

        if self.remove_on_shutdown {
            if let Err(e) = utils::shared_memory::remove_region(self.queue.name()) {
                warn!(queue = %self.queue.name(), error = %e, "failed to remove log queue region");
            }
        }
        info!(
            written,
            dropped = self.queue.dropped(),
            "Game log consumer stopped"
        );
        Ok(written)
    }
}

impl Drop for GameLogger {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(error = %e, "game log shutdown failed");
        }
    }
}

/// Consumer loop. Returns the number of lines written.
///
/// A failed write is reported and the loop keeps draining, so producers and
/// the shutdown marker never wait on a full queue.
fn consume(queue: &LogQueue, mut file: File) -> Result<u64, LogError> {
    let mut written = 0;
    let mut failed = 0u64;
    loop {
        let record = queue.pop()?;
        if record.kind == RecordKind::Shutdown {
            if failed > 0 {
                warn!(failed, "game log lines could not be written");
            }
            return Ok(written);
        }
        match write_line(queue, &mut file, &format_line(&record)) {
            Ok(()) => written += 1,
            Err(e) => {
                if failed == 0 {
                    error!(error = %e, "failed to write game log line");
                }
                failed += 1;
            }
        }
    }
}

fn write_line(queue: &LogQueue, file: &mut File, line: &str) -> Result<(), LogError> {
    let _guard = queue.file_lock().lock()?;
    writeln!(file, "{line}")?;
    file.flush()?;
    Ok(())
}
