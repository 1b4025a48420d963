// Synchronization primitives
//
// Fixed-capacity fence pool. Capacity is a backpressure knob: running out is
// an error for the caller, the pool never grows on its own.

use ash::vk;
use ash::vk::Handle;
use std::collections::VecDeque;

use crate::error::{Result, RuntimeError};

/// Native fence operations the pool needs.
pub trait FenceDevice {
    fn create_fence(&self) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()>;
}

/// `FenceDevice` over a real logical device.
pub struct NativeFences<'a> {
    pub device: &'a ash::Device,
    pub callbacks: Option<&'a vk::AllocationCallbacks>,
}

impl FenceDevice for NativeFences<'_> {
    fn create_fence(&self) -> Result<vk::Fence> {
        let info = vk::FenceCreateInfo::builder();
        unsafe { self.device.create_fence(&info, self.callbacks) }
            .map_err(|e| RuntimeError::native_init("fence", "pool", e))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, self.callbacks) };
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe { self.device.reset_fences(fences) }?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FencePool {
    fences: Vec<vk::Fence>,
    /// `(raw handle, index)` sorted by handle.
    lookup: Vec<(u64, usize)>,
    in_use: Vec<bool>,
    free: VecDeque<usize>,
}

impl FencePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capacity(&self) -> usize {
        self.fences.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Create or destroy fences to reach exactly `size`, then mark all idle.
    ///
    /// Callers must make sure no fence is in flight.
    pub fn resize<D: FenceDevice>(&mut self, device: &D, size: usize) -> Result<()> {
        while self.fences.len() > size {
            if let Some(fence) = self.fences.pop() {
                device.destroy_fence(fence);
            }
        }
        while self.fences.len() < size {
            self.fences.push(device.create_fence()?);
        }
        device.reset_fences(&self.fences)?;

        self.lookup = self
            .fences
            .iter()
            .enumerate()
            .map(|(i, f)| (f.as_raw(), i))
            .collect();
        self.lookup.sort_unstable();
        self.in_use = vec![false; size];
        self.free = (0..size).collect();

        log::debug!("Fence pool resized to {}", size);
        Ok(())
    }

    pub fn take(&mut self) -> Result<vk::Fence> {
        let index = self.free.pop_front().ok_or(RuntimeError::AvailableFenceNotFound {
            capacity: self.fences.len(),
        })?;
        self.in_use[index] = true;
        Ok(self.fences[index])
    }

    /// Hand a fence back. It is reset and `fence` is cleared to null.
    ///
    /// The fence must have signalled (or never been submitted).
    pub fn release<D: FenceDevice>(&mut self, device: &D, fence: &mut vk::Fence) -> Result<()> {
        let index = self
            .lookup
            .binary_search_by_key(&fence.as_raw(), |&(raw, _)| raw)
            .map(|pos| self.lookup[pos].1)
            .map_err(|_| RuntimeError::FenceNotOwned(*fence))?;
        if !self.in_use[index] {
            return Err(RuntimeError::FenceNotOwned(*fence));
        }
        device.reset_fences(std::slice::from_ref(fence))?;
        self.in_use[index] = false;
        self.free.push_back(index);
        *fence = vk::Fence::null();
        Ok(())
    }

    pub fn clear<D: FenceDevice>(&mut self, device: &D) -> Result<()> {
        self.resize(device, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct CountingDevice {
        next: Cell<u64>,
        live: RefCell<Vec<u64>>,
        resets: Cell<usize>,
    }

    impl FenceDevice for CountingDevice {
        fn create_fence(&self) -> Result<vk::Fence> {
            // descending raw values so handle order differs from index order
            let raw = 1000 - self.next.get();
            self.next.set(self.next.get() + 1);
            self.live.borrow_mut().push(raw);
            Ok(vk::Fence::from_raw(raw))
        }

        fn destroy_fence(&self, fence: vk::Fence) {
            self.live.borrow_mut().retain(|&r| r != fence.as_raw());
        }

        fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
            self.resets.set(self.resets.get() + fences.len());
            Ok(())
        }
    }

    #[test]
    fn take_until_exhausted() {
        let device = CountingDevice::default();
        let mut pool = FencePool::new();
        pool.resize(&device, 3).unwrap();

        let taken: Vec<_> = (0..3).map(|_| pool.take().unwrap()).collect();
        assert_eq!(taken.len(), 3);
        assert!(matches!(
            pool.take(),
            Err(RuntimeError::AvailableFenceNotFound { capacity: 3 })
        ));
    }

    #[test]
    fn cycling_never_exhausts() {
        let device = CountingDevice::default();
        let mut pool = FencePool::new();
        let n = 4;
        pool.resize(&device, n).unwrap();
        for _ in 0..3 * n {
            let mut fence = pool.take().unwrap();
            pool.release(&device, &mut fence).unwrap();
            assert_eq!(fence, vk::Fence::null());
        }
        assert_eq!(pool.available(), n);
    }

    #[test]
    fn take_is_fifo_over_indices() {
        let device = CountingDevice::default();
        let mut pool = FencePool::new();
        pool.resize(&device, 3).unwrap();
        let a = pool.take().unwrap();
        let mut b = pool.take().unwrap();
        pool.release(&device, &mut b).unwrap();
        let c = pool.take().unwrap();
        // index 2 was queued before the released index 1
        assert_ne!(c, a);
        assert_eq!(c.as_raw(), 1000 - 2);
        assert_eq!(pool.take().unwrap().as_raw(), 1000 - 1);
    }

    #[test]
    fn foreign_and_double_returns_are_rejected() {
        let device = CountingDevice::default();
        let mut pool = FencePool::new();
        pool.resize(&device, 2).unwrap();

        let mut stranger = vk::Fence::from_raw(42);
        assert!(matches!(
            pool.release(&device, &mut stranger),
            Err(RuntimeError::FenceNotOwned(_))
        ));

        let mut fence = pool.take().unwrap();
        let mut copy = fence;
        pool.release(&device, &mut fence).unwrap();
        assert!(matches!(pool.release(&device, &mut copy), Err(RuntimeError::FenceNotOwned(_))));
    }

    #[test]
    fn shrink_destroys_from_tail_and_resets_free_list() {
        let device = CountingDevice::default();
        let mut pool = FencePool::new();
        pool.resize(&device, 4).unwrap();
        pool.take().unwrap();
        pool.resize(&device, 2).unwrap();
        assert_eq!(*device.live.borrow(), vec![1000, 999]);
        assert_eq!(pool.available(), 2);

        pool.clear(&device).unwrap();
        assert!(device.live.borrow().is_empty());
        assert_eq!(pool.capacity(), 0);
    }
}
