// Host allocator - vk::AllocationCallbacks backed by an upstream allocator
//
// Vulkan does not pass the size back on free, so every live allocation is
// recorded in a fixed-capacity map keyed by address. The driver may call these
// callbacks from its own threads, which makes the map the one structure in the
// crate that needs full concurrent read/write safety.

use ash::vk;
use parking_lot::Mutex;
use std::alloc::Layout;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// General purpose allocator the host allocator delegates to.
pub trait UpstreamAllocator: Send + Sync {
    /// Returns null on failure.
    fn allocate(&self, size: usize, alignment: usize) -> *mut u8;

    /// # Safety
    /// `ptr` must come from `allocate` on the same allocator with the same
    /// size and alignment.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, alignment: usize);
}

/// Upstream allocator over the Rust global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl UpstreamAllocator for SystemAllocator {
    fn allocate(&self, size: usize, alignment: usize) -> *mut u8 {
        match Layout::from_size_align(size.max(1), alignment.max(1)) {
            Ok(layout) => unsafe { std::alloc::alloc(layout) },
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize, alignment: usize) {
        if let Ok(layout) = Layout::from_size_align(size.max(1), alignment.max(1)) {
            std::alloc::dealloc(ptr, layout);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    pub size: usize,
    pub alignment: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    Full,
    Duplicate,
}

/// Fixed-capacity concurrent address -> record map
#[derive(Debug)]
pub struct AllocationMap {
    capacity: usize,
    entries: Mutex<HashMap<usize, AllocationRecord>>,
}

impl AllocationMap {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    pub fn insert(&self, key: usize, record: AllocationRecord) -> Result<(), InsertError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(InsertError::Duplicate);
        }
        if entries.len() >= self.capacity {
            return Err(InsertError::Full);
        }
        entries.insert(key, record);
        Ok(())
    }

    pub fn get(&self, key: usize) -> Option<AllocationRecord> {
        self.entries.lock().get(&key).copied()
    }

    pub fn remove(&self, key: usize) -> Option<AllocationRecord> {
        self.entries.lock().remove(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct HostAllocator {
    upstream: Arc<dyn UpstreamAllocator>,
    records: AllocationMap,
    internal_bytes: AtomicU64,
}

impl HostAllocator {
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::with_upstream(Arc::new(SystemAllocator), capacity)
    }

    /// Route every host allocation through a caller-supplied allocator.
    pub fn with_upstream(upstream: Arc<dyn UpstreamAllocator>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            upstream,
            records: AllocationMap::with_capacity(capacity),
            internal_bytes: AtomicU64::new(0),
        })
    }

    /// Allocate through the upstream allocator and record the block.
    ///
    /// Panics if the tracking map is full: the capacity is sized up front and
    /// running out means bookkeeping can no longer be trusted.
    pub fn allocate(&self, size: usize, alignment: usize) -> *mut c_void {
        if size == 0 {
            return std::ptr::null_mut();
        }
        let ptr = self.upstream.allocate(size, alignment);
        if ptr.is_null() {
            log::warn!("Upstream allocator failed for {} bytes (align {})", size, alignment);
            return std::ptr::null_mut();
        }
        let record = AllocationRecord { size, alignment };
        if let Err(e) = self.records.insert(ptr as usize, record) {
            panic!(
                "host allocation map insert failed ({:?}) at {:p}; capacity {}",
                e,
                ptr,
                self.records.capacity()
            );
        }
        ptr.cast()
    }

    /// # Safety
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn deallocate(&self, ptr: *mut c_void) {
        if ptr.is_null() {
            return;
        }
        match self.records.remove(ptr as usize) {
            Some(record) => self.upstream.deallocate(ptr.cast(), record.size, record.alignment),
            None => log::error!("Ignoring free of untracked host pointer {:p}", ptr),
        }
    }

    /// # Safety
    /// `ptr` must be null or a live pointer returned by this allocator.
    ///
    /// Bytes past the copied prefix are left uninitialized.
    pub unsafe fn reallocate(&self, ptr: *mut c_void, size: usize, alignment: usize) -> *mut c_void {
        if size == 0 {
            self.deallocate(ptr);
            return std::ptr::null_mut();
        }
        let new_ptr = self.allocate(size, alignment);
        if new_ptr.is_null() {
            // Original block stays valid when reallocation fails.
            return std::ptr::null_mut();
        }
        if !ptr.is_null() {
            if let Some(old) = self.records.get(ptr as usize) {
                let count = old.size.min(size);
                std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), new_ptr.cast::<u8>(), count);
            }
            self.deallocate(ptr);
        }
        new_ptr
    }

    pub fn record(&self, ptr: *const c_void) -> Option<AllocationRecord> {
        self.records.get(ptr as usize)
    }

    pub fn live_allocations(&self) -> usize {
        self.records.len()
    }

    /// Bytes the driver reports as allocated internally (executable memory etc).
    pub fn internal_bytes(&self) -> u64 {
        self.internal_bytes.load(Ordering::Relaxed)
    }

    fn notify_internal(&self, size: usize, allocated: bool) {
        if allocated {
            self.internal_bytes.fetch_add(size as u64, Ordering::Relaxed);
        } else {
            self.internal_bytes.fetch_sub(size as u64, Ordering::Relaxed);
        }
    }

    /// Callback table pointing back at this allocator.
    pub fn callbacks(self: &Arc<Self>) -> HostCallbacks {
        let callbacks = vk::AllocationCallbacks {
            p_user_data: Arc::as_ptr(self) as *mut c_void,
            pfn_allocation: Some(vk_allocate),
            pfn_reallocation: Some(vk_reallocate),
            pfn_free: Some(vk_free),
            pfn_internal_allocation: Some(vk_internal_allocation),
            pfn_internal_free: Some(vk_internal_free),
        };
        HostCallbacks {
            callbacks,
            _owner: Arc::clone(self),
        }
    }
}

/// `vk::AllocationCallbacks` that keep their allocator alive.
pub struct HostCallbacks {
    callbacks: vk::AllocationCallbacks,
    _owner: Arc<HostAllocator>,
}

// SAFETY: p_user_data points at the Arc-owned HostAllocator held in `_owner`,
// whose state is internally synchronized.
unsafe impl Send for HostCallbacks {}
unsafe impl Sync for HostCallbacks {}

impl HostCallbacks {
    pub fn as_vk(&self) -> &vk::AllocationCallbacks {
        &self.callbacks
    }
}

unsafe fn allocator<'a>(user_data: *mut c_void) -> &'a HostAllocator {
    &*(user_data as *const HostAllocator)
}

unsafe extern "system" fn vk_allocate(
    user_data: *mut c_void,
    size: usize,
    alignment: usize,
    _scope: vk::SystemAllocationScope,
) -> *mut c_void {
    allocator(user_data).allocate(size, alignment)
}

unsafe extern "system" fn vk_reallocate(
    user_data: *mut c_void,
    original: *mut c_void,
    size: usize,
    alignment: usize,
    _scope: vk::SystemAllocationScope,
) -> *mut c_void {
    allocator(user_data).reallocate(original, size, alignment)
}

unsafe extern "system" fn vk_free(user_data: *mut c_void, memory: *mut c_void) {
    allocator(user_data).deallocate(memory)
}

unsafe extern "system" fn vk_internal_allocation(
    user_data: *mut c_void,
    size: usize,
    _ty: vk::InternalAllocationType,
    _scope: vk::SystemAllocationScope,
) {
    allocator(user_data).notify_internal(size, true)
}

unsafe extern "system" fn vk_internal_free(
    user_data: *mut c_void,
    size: usize,
    _ty: vk::InternalAllocationType,
    _scope: vk::SystemAllocationScope,
) {
    allocator(user_data).notify_internal(size, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// System allocator that logs every call it sees.
    #[derive(Default)]
    struct Recording {
        allocations: Mutex<Vec<(usize, usize, usize)>>,
        frees: Mutex<Vec<(usize, usize, usize)>>,
    }

    impl UpstreamAllocator for Recording {
        fn allocate(&self, size: usize, alignment: usize) -> *mut u8 {
            let ptr = SystemAllocator.allocate(size, alignment);
            self.allocations.lock().push((ptr as usize, size, alignment));
            ptr
        }

        unsafe fn deallocate(&self, ptr: *mut u8, size: usize, alignment: usize) {
            self.frees.lock().push((ptr as usize, size, alignment));
            SystemAllocator.deallocate(ptr, size, alignment)
        }
    }

    #[test]
    fn upstream_frees_with_recorded_size_and_alignment() {
        let upstream = Arc::new(Recording::default());
        let host = HostAllocator::with_upstream(upstream.clone(), 8);

        let a = host.allocate(48, 16);
        let b = host.allocate(200, 64);
        let grown = unsafe { host.reallocate(a, 96, 32) };
        unsafe {
            host.deallocate(b);
            host.deallocate(grown);
            // Not ours: never reaches upstream.
            host.deallocate(0x1000 as *mut c_void);
        }

        let allocations = upstream.allocations.lock().clone();
        let frees = upstream.frees.lock().clone();
        assert_eq!(allocations.len(), 3);
        assert_eq!(
            frees,
            vec![
                (a as usize, 48, 16),
                (b as usize, 200, 64),
                (grown as usize, 96, 32),
            ]
        );
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn allocate_deallocate_restores_emptiness() {
        let host = HostAllocator::new(64);
        let sizes = [16usize, 100, 4096, 1];
        let ptrs: Vec<_> = sizes.iter().map(|&s| host.allocate(s, 16)).collect();
        assert_eq!(host.live_allocations(), sizes.len());
        for (&p, &s) in ptrs.iter().zip(&sizes) {
            assert_eq!(host.record(p), Some(AllocationRecord { size: s, alignment: 16 }));
            assert_eq!(p as usize % 16, 0);
        }
        for p in ptrs {
            unsafe { host.deallocate(p) };
        }
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn reallocate_copies_prefix_and_replaces_record() {
        let host = HostAllocator::new(8);
        let p = host.allocate(8, 8);
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4, 5, 6, 7, 8].as_ptr(), p.cast(), 8) };

        let grown = unsafe { host.reallocate(p, 32, 8) };
        assert_eq!(host.live_allocations(), 1);
        assert_eq!(host.record(grown).map(|r| r.size), Some(32));
        let prefix = unsafe { std::slice::from_raw_parts(grown.cast::<u8>(), 8) };
        assert_eq!(prefix, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let shrunk = unsafe { host.reallocate(grown, 4, 8) };
        let prefix = unsafe { std::slice::from_raw_parts(shrunk.cast::<u8>(), 4) };
        assert_eq!(prefix, &[1, 2, 3, 4]);

        let gone = unsafe { host.reallocate(shrunk, 0, 8) };
        assert!(gone.is_null());
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn reallocate_from_null_is_allocate() {
        let host = HostAllocator::new(4);
        let p = unsafe { host.reallocate(std::ptr::null_mut(), 24, 4) };
        assert!(!p.is_null());
        assert_eq!(host.record(p).map(|r| r.size), Some(24));
        unsafe { host.deallocate(p) };
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    #[should_panic(expected = "host allocation map insert failed")]
    fn exceeding_capacity_is_fatal() {
        let host = HostAllocator::new(2);
        for _ in 0..3 {
            host.allocate(8, 8);
        }
    }

    #[test]
    fn map_rejects_duplicates_and_overflow() {
        let map = AllocationMap::with_capacity(1);
        let rec = AllocationRecord { size: 1, alignment: 1 };
        assert_eq!(map.insert(10, rec), Ok(()));
        assert_eq!(map.insert(10, rec), Err(InsertError::Duplicate));
        assert_eq!(map.insert(11, rec), Err(InsertError::Full));
        assert_eq!(map.remove(10), Some(rec));
        assert!(map.is_empty());
    }

    #[test]
    fn concurrent_callers_keep_map_consistent() {
        let host = HostAllocator::new(4 * 256);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let host = Arc::clone(&host);
                thread::spawn(move || {
                    let mut live = Vec::new();
                    for i in 0..256usize {
                        let size = 8 + (i + t) % 64;
                        live.push((host.allocate(size, 8) as usize, size));
                        if i % 3 == 0 {
                            let (p, s) = live.swap_remove(0);
                            assert_eq!(host.record(p as *const c_void).map(|r| r.size), Some(s));
                            unsafe { host.deallocate(p as *mut c_void) };
                        }
                    }
                    live
                })
            })
            .collect();

        let live: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(host.live_allocations(), live.len());
        for (p, s) in live {
            assert_eq!(host.record(p as *const c_void).map(|r| r.size), Some(s));
            unsafe { host.deallocate(p as *mut c_void) };
        }
        assert_eq!(host.live_allocations(), 0);
    }

    #[test]
    fn callbacks_route_into_allocator() {
        let host = HostAllocator::new(4);
        let callbacks = host.callbacks();
        let vk_cb = callbacks.as_vk();
        unsafe {
            let alloc = vk_cb.pfn_allocation.unwrap();
            let free = vk_cb.pfn_free.unwrap();
            let p = alloc(vk_cb.p_user_data, 64, 16, vk::SystemAllocationScope::OBJECT);
            assert_eq!(host.live_allocations(), 1);
            free(vk_cb.p_user_data, p);
            let notify = vk_cb.pfn_internal_allocation.unwrap();
            notify(
                vk_cb.p_user_data,
                128,
                vk::InternalAllocationType::EXECUTABLE,
                vk::SystemAllocationScope::DEVICE,
            );
        }
        assert_eq!(host.live_allocations(), 0);
        assert_eq!(host.internal_bytes(), 128);
    }
}
