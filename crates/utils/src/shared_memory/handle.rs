use std::marker::PhantomData;

use tracing::info;
use tracing::warn;

use super::{SharedLayout, SharedRegion, ShmError};

/// Typed access to a [`SharedRegion`] holding a `T`.
pub struct SharedMemoryHandle<T: SharedLayout> {
    region: SharedRegion,
    _layout: PhantomData<T>,
}

impl<T: SharedLayout> SharedMemoryHandle<T> {
    /// Creates (or re-opens) the region and initialises `T` in place.
    ///
    /// `init` runs only when this call is the first to claim the zeroed
    /// region. If a compatible layout is already initialised it is reused
    /// untouched, since re-initialising live primitives would corrupt them.
    pub fn create<F>(identifier: &str, init: F) -> Result<Self, ShmError>
    where
        F: FnOnce(&T) -> Result<(), ShmError>,
    {
        let region = SharedRegion::create(identifier, std::mem::size_of::<T>())?;
        Self::check_alignment(&region)?;

        // Safety: the mapping is at least size_of::<T>() bytes, suitably
        // aligned, and T is valid when zeroed.
        let state = unsafe { &*(region.as_ptr() as *const T) };
        let header = state.header();

        match header.try_begin_init() {
            Ok(()) => {
                if let Err(e) = init(state) {
                    header.abort_init();
                    return Err(e);
                }
                header.finish_init(T::VERSION, std::mem::size_of::<T>());
                info!(
                    identifier = %identifier,
                    version = T::VERSION,
                    "Initialised shared layout"
                );
            }
            Err(_) => {
                header.validate(identifier, T::VERSION, std::mem::size_of::<T>())?;
                warn!(identifier = %identifier, "Shared layout already initialised, reusing it");
            }
        }

        Ok(Self {
            region,
            _layout: PhantomData,
        })
    }

    /// Opens an existing, fully initialised region.
    pub fn open(identifier: &str) -> Result<Self, ShmError> {
        let region = SharedRegion::attach(identifier)?;
        if region.is_empty() {
            return Err(ShmError::NotReady {
                name: identifier.to_string(),
            });
        }
        if region.len() < std::mem::size_of::<T>() {
            return Err(ShmError::LayoutMismatch {
                name: identifier.to_string(),
                reason: format!(
                    "region has {} bytes, layout needs {}",
                    region.len(),
                    std::mem::size_of::<T>()
                ),
            });
        }
        Self::check_alignment(&region)?;

        let state = unsafe { &*(region.as_ptr() as *const T) };
        state
            .header()
            .validate(identifier, T::VERSION, std::mem::size_of::<T>())?;

        Ok(Self {
            region,
            _layout: PhantomData,
        })
    }

    fn check_alignment(region: &SharedRegion) -> Result<(), ShmError> {
        if region.as_ptr() as usize % std::mem::align_of::<T>() != 0 {
            return Err(ShmError::LayoutMismatch {
                name: region.name().to_string(),
                reason: "mapping is not aligned for the layout".to_string(),
            });
        }
        Ok(())
    }

    /// Gets a reference to the shared state.
    pub fn get_state(&self) -> &T {
        unsafe { &*(self.region.as_ptr() as *const T) }
    }

    /// Gets the shared memory identifier.
    pub fn get_identifier(&self) -> &str {
        self.region.name()
    }

    /// Unmaps this view only.
    pub fn detach(self) {
        self.region.detach();
    }

    /// Unmaps this view and removes the region name.
    pub fn destroy(self) -> Result<(), ShmError> {
        self.region.destroy()
    }
}

impl<T: SharedLayout> std::fmt::Debug for SharedMemoryHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryHandle")
            .field("region", &self.region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::shared_memory::LayoutHeader;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn unique_name(test_name: &str) -> String {
        format!(
            "test_handle_{}_{}_{}",
            test_name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[repr(C)]
    struct Counter {
        header: LayoutHeader,
        value: AtomicU32,
    }

    unsafe impl SharedLayout for Counter {
        const VERSION: u32 = 1;

        fn header(&self) -> &LayoutHeader {
            &self.header
        }
    }

    #[repr(C)]
    struct CounterV2 {
        header: LayoutHeader,
        value: AtomicU32,
    }

    unsafe impl SharedLayout for CounterV2 {
        const VERSION: u32 = 2;

        fn header(&self) -> &LayoutHeader {
            &self.header
        }
    }

    #[test]
    fn create_runs_initialiser_once() {
        let name = unique_name("init_once");
        let first = SharedMemoryHandle::<Counter>::create(&name, |state| {
            state.value.store(5, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

        let second = SharedMemoryHandle::<Counter>::create(&name, |state| {
            state.value.store(99, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();

        assert_eq!(second.get_state().value.load(Ordering::Relaxed), 5);
        assert_eq!(first.get_state().header.version(), 1);

        second.detach();
        first.destroy().unwrap();
    }

    #[test]
    fn open_sees_creator_writes() {
        let name = unique_name("open");
        let creator = SharedMemoryHandle::<Counter>::create(&name, |_| Ok(())).unwrap();
        let opened = SharedMemoryHandle::<Counter>::open(&name).unwrap();

        creator.get_state().value.fetch_add(3, Ordering::AcqRel);
        assert_eq!(opened.get_state().value.load(Ordering::Acquire), 3);
        assert_eq!(opened.get_identifier(), name);

        opened.detach();
        creator.destroy().unwrap();
    }

    #[test]
    fn open_rejects_other_layout_version() {
        let name = unique_name("version");
        let creator = SharedMemoryHandle::<Counter>::create(&name, |_| Ok(())).unwrap();

        let err = SharedMemoryHandle::<CounterV2>::open(&name).unwrap_err();
        assert!(
            matches!(err, ShmError::LayoutMismatch { .. }),
            "got {err:?}"
        );

        creator.destroy().unwrap();
    }

    #[test]
    fn open_before_initialisation_is_not_ready() {
        let name = unique_name("not_ready");
        let raw = SharedRegion::create(&name, std::mem::size_of::<Counter>()).unwrap();

        let err = SharedMemoryHandle::<Counter>::open(&name).unwrap_err();
        assert!(matches!(err, ShmError::NotReady { .. }), "got {err:?}");
        assert!(err.is_recoverable());

        raw.destroy().unwrap();
    }

    #[test]
    fn open_of_unsized_region_is_not_ready() {
        let name = unique_name("unsized");
        std::fs::File::create(format!("{}/{name}", crate::shared_memory::SHM_DIR)).unwrap();

        let err = SharedMemoryHandle::<Counter>::open(&name).unwrap_err();
        assert!(matches!(err, ShmError::NotReady { .. }), "got {err:?}");

        crate::shared_memory::remove_region(&name).unwrap();
    }

    #[test]
    fn failed_initialiser_leaves_region_claimable() {
        let name = unique_name("abort");
        let err = SharedMemoryHandle::<Counter>::create(&name, |_| {
            Err(ShmError::InvalidName("forced".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, ShmError::InvalidName(_)));

        let retry = SharedMemoryHandle::<Counter>::create(&name, |state| {
            state.value.store(1, Ordering::Relaxed);
            Ok(())
        })
        .unwrap();
        assert_eq!(retry.get_state().value.load(Ordering::Relaxed), 1);
        retry.destroy().unwrap();
    }
}
