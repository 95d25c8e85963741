//! Shared Memory Module
//! Named, fixed-size memory regions mapped read/write into every process that
//! attaches them, plus the typed handle used to lay structures out inside.

use std::ffi::CString;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use shared_memory::Shmem;
use shared_memory::ShmemConf;
use shared_memory::ShmemError;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::sync::SyncError;

pub mod handle;

pub use handle::SharedMemoryHandle;

/// Directory where POSIX shared memory objects show up on Linux.
pub const SHM_DIR: &str = "/dev/shm";
/// Longest region name accepted (NAME_MAX without the leading slash).
const MAX_NAME_LEN: usize = 254;
/// Magic word stored at the start of every typed layout.
pub const LAYOUT_MAGIC: u32 = 0x5453_544c;

const LAYOUT_UNINIT: u32 = 0;
const LAYOUT_INITIALISING: u32 = 1;
const LAYOUT_READY: u32 = 2;

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("shared memory region `{name}` not found")]
    NotFound { name: String },

    #[error("failed to allocate shared memory region `{name}`: {reason}")]
    Allocation { name: String, reason: String },

    #[error("shared memory region `{name}` is still being initialised")]
    NotReady { name: String },

    #[error("layout mismatch in shared memory region `{name}`: {reason}")]
    LayoutMismatch { name: String, reason: String },

    #[error("invalid shared memory region name `{0}`")]
    InvalidName(String),

    #[error("failed to remove shared memory region `{name}`: {source}")]
    Remove {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid region pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("failed to list {SHM_DIR}: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("failed to initialise primitive in shared memory: {0}")]
    Sync(#[from] SyncError),
}

impl ShmError {
    /// Whether the caller may retry later (region missing or half-built).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::NotReady { .. })
    }
}

/// A named block of memory shared between processes.
///
/// Dropping the region only unmaps it. Removing the name is explicit through
/// [`SharedRegion::destroy`], and mappings that other processes already hold
/// stay valid after that.
pub struct SharedRegion {
    shmem: Shmem,
    name: String,
}

// The mapping is plain shared memory; every structure placed inside it is
// responsible for its own synchronization.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Opens or creates the region `name` with exactly `size` bytes.
    ///
    /// Re-creating an existing region with the same size attaches to it;
    /// a different size is an allocation error.
    pub fn create(name: &str, size: usize) -> Result<Self, ShmError> {
        validate_name(name)?;
        if size == 0 {
            return Err(ShmError::Allocation {
                name: name.to_string(),
                reason: "size must be non-zero".to_string(),
            });
        }

        match ShmemConf::new().size(size).os_id(name).create() {
            Ok(mut shmem) => {
                // Removing the name is an explicit decision, never a side effect of drop.
                shmem.set_owner(false);
                info!(identifier = %name, size, "Created shared memory region");
                Ok(Self {
                    shmem,
                    name: name.to_string(),
                })
            }
            Err(ShmemError::MappingIdExists) => {
                let region = Self::attach(name).map_err(|e| match e {
                    ShmError::NotReady { .. } => e,
                    e => ShmError::Allocation {
                        name: name.to_string(),
                        reason: format!("region vanished while re-creating: {e}"),
                    },
                })?;
                if region.len() != size {
                    return Err(ShmError::Allocation {
                        name: name.to_string(),
                        reason: format!(
                            "existing region has {} bytes, requested {size}",
                            region.len()
                        ),
                    });
                }
                debug!(identifier = %name, size, "Region already exists, attached instead");
                Ok(region)
            }
            Err(e) => Err(ShmError::Allocation {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Maps an existing region.
    pub fn attach(name: &str) -> Result<Self, ShmError> {
        validate_name(name)?;
        match ShmemConf::new().os_id(name).open() {
            Ok(shmem) if shmem.len() == 0 => Err(ShmError::NotReady {
                name: name.to_string(),
            }),
            Ok(shmem) => Ok(Self {
                shmem,
                name: name.to_string(),
            }),
            Err(ShmemError::MapOpenFailed(code)) if code == libc::ENOENT as u32 => {
                Err(ShmError::NotFound {
                    name: name.to_string(),
                })
            }
            // The creator has opened the name but not sized it yet.
            Err(e) if region_file_len(name) == Some(0) => {
                debug!(identifier = %name, error = %e, "Region exists but is not sized yet");
                Err(ShmError::NotReady {
                    name: name.to_string(),
                })
            }
            Err(e) => Err(ShmError::Allocation {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Unmaps this process's view; the region stays for other attachers.
    pub fn detach(self) {
        debug!(identifier = %self.name, "Detached shared memory region");
    }

    /// Unmaps this view and removes the name from the namespace.
    ///
    /// Later `attach` calls fail with [`ShmError::NotFound`]; mappings held by
    /// other processes remain usable until they detach.
    pub fn destroy(self) -> Result<(), ShmError> {
        let name = self.name.clone();
        drop(self);
        remove_region(&name)?;
        info!(identifier = %name, "Destroyed shared memory region");
        Ok(())
    }

    /// Start of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.shmem.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.shmem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Removes a region name without mapping it.
pub fn remove_region(name: &str) -> Result<(), ShmError> {
    validate_name(name)?;
    let os_name = CString::new(format!("/{}", name.trim_start_matches('/')))
        .map_err(|_| ShmError::InvalidName(name.to_string()))?;

    if unsafe { libc::shm_unlink(os_name.as_ptr()) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOENT) {
        Err(ShmError::NotFound {
            name: name.to_string(),
        })
    } else {
        Err(ShmError::Remove {
            name: name.to_string(),
            source: err,
        })
    }
}

/// Lists region names under [`SHM_DIR`] matching a glob pattern.
pub fn find_regions(pattern: &str) -> Result<Vec<String>, ShmError> {
    let mut names = Vec::new();
    for entry in glob::glob(&format!("{SHM_DIR}/{pattern}"))? {
        let path = entry?;
        if !path.is_file() {
            continue;
        }
        if let Some(name) = region_name_from_path(&path) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Removes every region matching `pattern`, returning the names removed.
///
/// Meant for startup, to clear regions left behind by crashed runs.
pub fn cleanup_regions(pattern: &str) -> Result<Vec<String>, ShmError> {
    let mut removed = Vec::new();
    for name in find_regions(pattern)? {
        match remove_region(&name) {
            Ok(()) => {
                info!(identifier = %name, "Removed leftover shared memory region");
                removed.push(name);
            }
            Err(ShmError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

fn region_file_len(name: &str) -> Option<u64> {
    let path = Path::new(SHM_DIR).join(name.trim_start_matches('/'));
    std::fs::metadata(path).ok().map(|meta| meta.len())
}

fn region_name_from_path(path: &Path) -> Option<String> {
    path.strip_prefix(SHM_DIR)
        .ok()
        .map(|relative| relative.to_string_lossy().to_string())
}

fn validate_name(name: &str) -> Result<(), ShmError> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.len() > MAX_NAME_LEN || bare.contains('/') || bare.contains('\0') {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Header placed first in every typed layout so mismatched attachers fail fast.
#[repr(C)]
#[derive(Debug)]
pub struct LayoutHeader {
    magic: AtomicU32,
    version: AtomicU32,
    layout_size: AtomicU64,
    state: AtomicU32,
}

impl LayoutHeader {
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == LAYOUT_READY
    }

    /// Claims the right to initialise an all-zero layout.
    fn try_begin_init(&self) -> Result<(), u32> {
        self.state
            .compare_exchange(
                LAYOUT_UNINIT,
                LAYOUT_INITIALISING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
    }

    fn finish_init(&self, version: u32, layout_size: usize) {
        self.magic.store(LAYOUT_MAGIC, Ordering::Relaxed);
        self.version.store(version, Ordering::Relaxed);
        self.layout_size
            .store(layout_size as u64, Ordering::Relaxed);
        self.state.store(LAYOUT_READY, Ordering::Release);
    }

    fn abort_init(&self) {
        self.state.store(LAYOUT_UNINIT, Ordering::Release);
    }

    fn validate(&self, name: &str, version: u32, layout_size: usize) -> Result<(), ShmError> {
        if !self.is_ready() {
            return Err(ShmError::NotReady {
                name: name.to_string(),
            });
        }
        let mismatch = |reason: String| ShmError::LayoutMismatch {
            name: name.to_string(),
            reason,
        };
        let magic = self.magic.load(Ordering::Relaxed);
        if magic != LAYOUT_MAGIC {
            return Err(mismatch(format!("bad magic {magic:#x}")));
        }
        let found = self.version.load(Ordering::Relaxed);
        if found != version {
            return Err(mismatch(format!("version {found}, expected {version}")));
        }
        let size = self.layout_size.load(Ordering::Relaxed);
        if size != layout_size as u64 {
            let detail = format!("layout is {size} bytes, expected {layout_size}");
            return Err(mismatch(detail));
        }
        Ok(())
    }
}

/// A `#[repr(C)]` structure that can be placed in a [`SharedRegion`].
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, valid when every byte is zero, and
/// only use interior mutability that is safe to share between processes
/// (atomics and the primitives in [`crate::sync`]).
pub unsafe trait SharedLayout: Sync {
    /// Bumped whenever the field layout changes.
    const VERSION: u32;

    fn header(&self) -> &LayoutHeader;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use similar_asserts::assert_eq;

    use super::*;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(test_name: &str) -> String {
        format!(
            "test_region_{}_{}_{}",
            test_name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn region_file_exists(name: &str) -> bool {
        Path::new(&format!("{SHM_DIR}/{name}")).exists()
    }

    #[test]
    fn create_maps_zeroed_memory_visible_to_attachers() {
        let name = unique_name("create_attach");
        let creator = SharedRegion::create(&name, 4096).unwrap();
        assert_eq!(creator.len(), 4096);
        assert!(region_file_exists(&name));

        let bytes = unsafe { std::slice::from_raw_parts(creator.as_ptr(), creator.len()) };
        assert!(bytes.iter().all(|&b| b == 0));

        let attacher = SharedRegion::attach(&name).unwrap();
        assert_eq!(attacher.len(), 4096);
        unsafe {
            *creator.as_ptr().add(17) = 0xAB;
            assert_eq!(*attacher.as_ptr().add(17), 0xAB);
        }

        attacher.detach();
        creator.destroy().unwrap();
    }

    #[test]
    fn recreate_with_same_size_is_idempotent() {
        let name = unique_name("idempotent");
        let first = SharedRegion::create(&name, 1024).unwrap();
        unsafe { *first.as_ptr() = 7 };

        let second = SharedRegion::create(&name, 1024).unwrap();
        assert_eq!(unsafe { *second.as_ptr() }, 7);

        second.detach();
        first.destroy().unwrap();
    }

    #[test]
    fn recreate_with_different_size_fails() {
        let name = unique_name("size_mismatch");
        let first = SharedRegion::create(&name, 1024).unwrap();

        let err = SharedRegion::create(&name, 2048).unwrap_err();
        assert!(matches!(err, ShmError::Allocation { .. }), "got {err:?}");

        first.destroy().unwrap();
    }

    #[test]
    fn attach_missing_region_is_not_found() {
        let err = SharedRegion::attach(&unique_name("missing")).unwrap_err();
        assert!(matches!(err, ShmError::NotFound { .. }), "got {err:?}");
        assert!(err.is_recoverable());
    }

    #[test]
    fn attach_before_creator_sizes_region_is_not_ready() {
        let name = unique_name("unsized");
        std::fs::File::create(format!("{SHM_DIR}/{name}")).unwrap();

        let err = SharedRegion::attach(&name).unwrap_err();
        assert!(matches!(err, ShmError::NotReady { .. }), "{err:?}");
        assert!(err.is_recoverable());

        remove_region(&name).unwrap();
    }

    #[test]
    fn detach_keeps_region_for_other_attachers() {
        let name = unique_name("detach");
        let creator = SharedRegion::create(&name, 256).unwrap();
        creator.detach();

        assert!(region_file_exists(&name));
        let again = SharedRegion::attach(&name).unwrap();
        again.destroy().unwrap();
    }

    #[test]
    fn destroy_removes_name_but_live_mappings_stay_valid() {
        let name = unique_name("destroy");
        let creator = SharedRegion::create(&name, 512).unwrap();
        let survivor = SharedRegion::attach(&name).unwrap();

        creator.destroy().unwrap();
        assert!(!region_file_exists(&name));
        assert!(matches!(
            SharedRegion::attach(&name),
            Err(ShmError::NotFound { .. })
        ));

        unsafe {
            *survivor.as_ptr().add(3) = 42;
            assert_eq!(*survivor.as_ptr().add(3), 42);
        }
        survivor.detach();
    }

    #[test]
    fn destroy_twice_reports_not_found() {
        let name = unique_name("destroy_twice");
        let creator = SharedRegion::create(&name, 64).unwrap();
        let other = SharedRegion::attach(&name).unwrap();
        creator.destroy().unwrap();
        assert!(matches!(other.destroy(), Err(ShmError::NotFound { .. })));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(matches!(
            SharedRegion::create("", 16),
            Err(ShmError::InvalidName(_))
        ));
        assert!(matches!(
            SharedRegion::create("a/b", 16),
            Err(ShmError::InvalidName(_))
        ));
        assert!(matches!(
            SharedRegion::create(&unique_name("zero"), 0),
            Err(ShmError::Allocation { .. })
        ));
    }

    #[test]
    fn find_and_cleanup_regions_by_pattern() {
        let prefix = unique_name("cleanup");
        let a = SharedRegion::create(&format!("{prefix}_a"), 64).unwrap();
        let b = SharedRegion::create(&format!("{prefix}_b"), 64).unwrap();
        a.detach();
        b.detach();

        let found = find_regions(&format!("{prefix}_*")).unwrap();
        assert_eq!(found, vec![format!("{prefix}_a"), format!("{prefix}_b")]);

        let removed = cleanup_regions(&format!("{prefix}_*")).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(find_regions(&format!("{prefix}_*")).unwrap().is_empty());
    }
}
