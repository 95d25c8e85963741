//! Process-shared building blocks: named shared memory regions, the
//! synchronization primitives that live inside them, and logging setup.

pub mod logging;
pub mod shared_memory;
pub mod sync;

pub use shared_memory::ShmError;
pub use sync::SyncError;
