use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use utils::shared_memory::{LayoutHeader, SharedLayout, SharedMemoryHandle};
use utils::sync::{ShmMutex, ShmSemaphore, TryWait};

use crate::LogError;

/// Number of lines the queue holds before new ones are dropped.
pub const QUEUE_CAPACITY: usize = 10;
/// Longest line text kept, in bytes; longer text is truncated.
pub const MAX_TEXT_LEN: usize = 1023;

const KIND_MESSAGE: u32 = 0;
const KIND_SHUTDOWN: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Message,
    /// Reserved marker telling the consumer to stop.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub pid: u32,
    /// Milliseconds since the Unix epoch, taken when the line was enqueued.
    pub timestamp_ms: i64,
    pub text: String,
}

impl LogRecord {
    pub fn message(text: &str) -> Self {
        Self {
            kind: RecordKind::Message,
            pid: std::process::id(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            text: truncate_utf8(text, MAX_TEXT_LEN).to_string(),
        }
    }

    pub fn shutdown() -> Self {
        Self {
            kind: RecordKind::Shutdown,
            pid: std::process::id(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            text: String::new(),
        }
    }
}

/// Cuts `text` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[repr(C)]
struct LogSlot {
    kind: AtomicU32,
    pid: AtomicU32,
    timestamp_ms: AtomicI64,
    len: AtomicU32,
    text: UnsafeCell<[u8; MAX_TEXT_LEN]>,
}

// `text` is only touched while holding the queue lock.
unsafe impl Sync for LogSlot {}

impl LogSlot {
    fn write(&self, record: &LogRecord) {
        let kind = match record.kind {
            RecordKind::Message => KIND_MESSAGE,
            RecordKind::Shutdown => KIND_SHUTDOWN,
        };
        let bytes = truncate_utf8(&record.text, MAX_TEXT_LEN).as_bytes();
        unsafe {
            let text = &mut *self.text.get();
            text[..bytes.len()].copy_from_slice(bytes);
        }
        self.kind.store(kind, Ordering::Relaxed);
        self.pid.store(record.pid, Ordering::Relaxed);
        self.timestamp_ms
            .store(record.timestamp_ms, Ordering::Relaxed);
        self.len.store(bytes.len() as u32, Ordering::Relaxed);
    }

    fn read(&self) -> LogRecord {
        let len = (self.len.load(Ordering::Relaxed) as usize).min(MAX_TEXT_LEN);
        let text = unsafe {
            let text = &*self.text.get();
            String::from_utf8_lossy(&text[..len]).into_owned()
        };
        let kind = if self.kind.load(Ordering::Relaxed) == KIND_SHUTDOWN {
            RecordKind::Shutdown
        } else {
            RecordKind::Message
        };
        LogRecord {
            kind,
            pid: self.pid.load(Ordering::Relaxed),
            timestamp_ms: self.timestamp_ms.load(Ordering::Relaxed),
            text,
        }
    }
}

/// Shared layout of the log queue region.
#[repr(C)]
pub(crate) struct LogQueueLayout {
    header: LayoutHeader,
    queue_lock: ShmMutex,
    /// Serialises writers of the log file across processes.
    file_lock: ShmMutex,
    free_slots: ShmSemaphore,
    used_slots: ShmSemaphore,
    head: AtomicU32,
    tail: AtomicU32,
    dropped: AtomicU64,
    slots: [LogSlot; QUEUE_CAPACITY],
}

unsafe impl SharedLayout for LogQueueLayout {
    const VERSION: u32 = 1;

    fn header(&self) -> &LayoutHeader {
        &self.header
    }
}

/// Bounded FIFO of log records in a named shared memory region.
pub struct LogQueue {
    handle: SharedMemoryHandle<LogQueueLayout>,
}

impl LogQueue {
    /// Creates the queue region, or reuses a compatible one left in place.
    pub fn create(name: &str) -> Result<Self, LogError> {
        let handle = SharedMemoryHandle::<LogQueueLayout>::create(name, |layout| {
            layout.queue_lock.init()?;
            layout.file_lock.init()?;
            layout.free_slots.init(QUEUE_CAPACITY as u32)?;
            layout.used_slots.init(0)?;
            Ok(())
        })?;
        Ok(Self { handle })
    }

    /// Attaches to a queue created by another process.
    pub fn attach(name: &str) -> Result<Self, LogError> {
        let handle = SharedMemoryHandle::<LogQueueLayout>::open(name)?;
        Ok(Self { handle })
    }

    fn layout(&self) -> &LogQueueLayout {
        self.handle.get_state()
    }

    pub fn name(&self) -> &str {
        self.handle.get_identifier()
    }

    /// Enqueues without blocking. Returns `false` (and counts the drop)
    /// when every slot is taken.
    pub fn try_push(&self, record: &LogRecord) -> Result<bool, LogError> {
        let layout = self.layout();
        match layout.free_slots.try_wait()? {
            TryWait::Decremented => {
                self.store(record)?;
                Ok(true)
            }
            TryWait::WouldBlock => {
                layout.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(false)
            }
        }
    }

    /// Enqueues, waiting for a free slot if needed.
    pub fn push(&self, record: &LogRecord) -> Result<(), LogError> {
        self.layout().free_slots.wait()?;
        self.store(record)
    }

    /// Like [`LogQueue::push`], but gives up after `timeout`. Returns whether
    /// the record was queued. Nothing is counted as dropped.
    pub fn push_timeout(&self, record: &LogRecord, timeout: Duration) -> Result<bool, LogError> {
        if !self.layout().free_slots.wait_timeout(timeout)? {
            return Ok(false);
        }
        self.store(record)?;
        Ok(true)
    }

    fn store(&self, record: &LogRecord) -> Result<(), LogError> {
        let layout = self.layout();
        {
            let _guard = layout.queue_lock.lock()?;
            let tail = layout.tail.load(Ordering::Relaxed) as usize % QUEUE_CAPACITY;
            layout.slots[tail].write(record);
            layout
                .tail
                .store(((tail + 1) % QUEUE_CAPACITY) as u32, Ordering::Relaxed);
        }
        layout.used_slots.post()?;
        Ok(())
    }

    /// Blocks until a record is available and removes it.
    pub fn pop(&self) -> Result<LogRecord, LogError> {
        let layout = self.layout();
        layout.used_slots.wait()?;
        let record = {
            let _guard = layout.queue_lock.lock()?;
            let head = layout.head.load(Ordering::Relaxed) as usize % QUEUE_CAPACITY;
            let record = layout.slots[head].read();
            layout
                .head
                .store(((head + 1) % QUEUE_CAPACITY) as u32, Ordering::Relaxed);
            record
        };
        layout.free_slots.post()?;
        Ok(record)
    }

    /// Records waiting for the consumer.
    pub fn pending(&self) -> Result<usize, LogError> {
        Ok(self.layout().used_slots.value()? as usize)
    }

    /// Lines dropped because the queue was full, across every producer.
    pub fn dropped(&self) -> u64 {
        self.layout().dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn file_lock(&self) -> &ShmMutex {
        &self.layout().file_lock
    }
}

impl std::fmt::Debug for LogQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogQueue")
            .field("name", &self.name())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use similar_asserts::assert_eq;

    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    pub(crate) fn unique_name(test_name: &str) -> String {
        format!(
            "test_log_{}_{}_{}",
            test_name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn records_come_out_in_fifo_order() {
        let name = unique_name("fifo");
        let queue = LogQueue::create(&name).unwrap();

        for i in 0..3 {
            let record = LogRecord::message(&format!("line {i}"));
            assert!(queue.try_push(&record).unwrap());
        }
        assert_eq!(queue.pending().unwrap(), 3);

        for i in 0..3 {
            assert_eq!(queue.pop().unwrap().text, format!("line {i}"));
        }
        assert_eq!(queue.pending().unwrap(), 0);
        utils::shared_memory::remove_region(&name).unwrap();
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let name = unique_name("full");
        let queue = LogQueue::create(&name).unwrap();

        for i in 0..QUEUE_CAPACITY {
            let record = LogRecord::message(&i.to_string());
            assert!(queue.try_push(&record).unwrap());
        }
        assert!(!queue.try_push(&LogRecord::message("overflow")).unwrap());
        assert!(!queue.try_push(&LogRecord::message("overflow")).unwrap());
        assert_eq!(queue.dropped(), 2);

        // Space frees up once the consumer takes one.
        queue.pop().unwrap();
        assert!(queue.try_push(&LogRecord::message("fits")).unwrap());
        utils::shared_memory::remove_region(&name).unwrap();
    }

    #[test]
    fn timed_push_gives_up_on_a_full_queue() {
        let name = unique_name("timed");
        let queue = LogQueue::create(&name).unwrap();
        for i in 0..QUEUE_CAPACITY {
            queue.push(&LogRecord::message(&i.to_string())).unwrap();
        }

        let timeout = Duration::from_millis(20);
        let marker = LogRecord::shutdown();
        assert!(!queue.push_timeout(&marker, timeout).unwrap());
        assert_eq!(queue.dropped(), 0);

        queue.pop().unwrap();
        assert!(queue.push_timeout(&marker, timeout).unwrap());
        utils::shared_memory::remove_region(&name).unwrap();
    }

    #[test]
    fn ring_wraps_around() {
        let name = unique_name("wrap");
        let queue = LogQueue::create(&name).unwrap();

        for round in 0..3 {
            for i in 0..QUEUE_CAPACITY {
                let record = LogRecord::message(&format!("{round}-{i}"));
                queue.push(&record).unwrap();
            }
            for i in 0..QUEUE_CAPACITY {
                assert_eq!(queue.pop().unwrap().text, format!("{round}-{i}"));
            }
        }
        utils::shared_memory::remove_region(&name).unwrap();
    }

    #[test]
    fn attached_producer_shares_the_queue() {
        let name = unique_name("attach");
        let owner = LogQueue::create(&name).unwrap();
        let producer = LogQueue::attach(&name).unwrap();

        producer.try_push(&LogRecord::message("from afar")).unwrap();
        let record = owner.pop().unwrap();
        assert_eq!(record.kind, RecordKind::Message);
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.text, "from afar");
        utils::shared_memory::remove_region(&name).unwrap();
    }

    #[test]
    fn long_text_is_truncated_on_char_boundary() {
        let text = "é".repeat(600);
        let record = LogRecord::message(&text);
        assert!(record.text.len() <= MAX_TEXT_LEN);
        assert_eq!(record.text.len(), 1022);
        assert!(record.text.chars().all(|c| c == 'é'));
    }

    #[test]
    fn attach_missing_queue_fails_not_found() {
        let err = LogQueue::attach(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, LogError::Region(ref e) if e.is_recoverable()));
    }
}
