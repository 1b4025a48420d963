// Buffers - typed windows over gpu-allocator backed storage
//
// A `Buffer<T>` is an element window `[offset, offset + len)` over shared
// storage. Views and reinterpretations share the storage and never copy.
// Heap usage is reported to the device's capability registry on creation and
// on drop of the last window.

use ash::vk;
use bitflags::bitflags;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use super::device::DeviceShared;
use crate::error::{Result, RuntimeError};

bitflags! {
    /// Placement and access hints for a buffer
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const PREFER_DEVICE = 1 << 0;
        const PREFER_HOST = 1 << 1;
        /// Host reads back in arbitrary order.
        const RANDOM_ACCESS = 1 << 2;
        /// Host writes front to back, never reads.
        const SEQUENTIAL_WRITE = 1 << 3;
    }
}

impl BufferUsage {
    pub fn location(self) -> MemoryLocation {
        if self.contains(Self::PREFER_HOST) {
            if self.contains(Self::RANDOM_ACCESS) {
                MemoryLocation::GpuToCpu
            } else {
                MemoryLocation::CpuToGpu
            }
        } else if self.contains(Self::PREFER_DEVICE) {
            MemoryLocation::GpuOnly
        } else if self.contains(Self::RANDOM_ACCESS) {
            MemoryLocation::GpuToCpu
        } else if self.contains(Self::SEQUENTIAL_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        }
    }
}

const BUFFER_USAGE_FLAGS: vk::BufferUsageFlags = vk::BufferUsageFlags::from_raw(
    vk::BufferUsageFlags::STORAGE_BUFFER.as_raw()
        | vk::BufferUsageFlags::UNIFORM_BUFFER.as_raw()
        | vk::BufferUsageFlags::TRANSFER_SRC.as_raw()
        | vk::BufferUsageFlags::TRANSFER_DST.as_raw(),
);

pub(crate) struct BufferStorage {
    device: Arc<DeviceShared>,
    pub(crate) buffer: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
    size: u64,
    usage: BufferUsage,
    heap: Option<usize>,
}

impl BufferStorage {
    pub(crate) fn new(device: &Arc<DeviceShared>, name: &str, size: u64, usage: BufferUsage) -> Result<Self> {
        let raw = device.raw();
        let info = vk::BufferCreateInfo::builder()
            .size(size.max(4))
            .usage(BUFFER_USAGE_FLAGS)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { raw.create_buffer(&info, device.callbacks()) }
            .map_err(|e| RuntimeError::native_init("buffer", name, e))?;

        let requirements = unsafe { raw.get_buffer_memory_requirements(buffer) };
        let allocation = device.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: usage.location(),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                unsafe { raw.destroy_buffer(buffer, device.callbacks()) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { raw.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { raw.destroy_buffer(buffer, device.callbacks()) };
            // already failing; a second error from free adds nothing
            let _ = device.free(allocation);
            return Err(RuntimeError::native_init("buffer", name, e));
        }

        let heap = device
            .registry()
            .heap_for_memory(requirements.memory_type_bits, allocation.memory_properties());
        if let Some(heap) = heap {
            device.registry().notify_allocation(heap, allocation.size());
        }
        device.namer().name(buffer, name);

        Ok(Self {
            device: Arc::clone(device),
            buffer,
            size,
            usage,
            heap,
            allocation: Mutex::new(Some(allocation)),
        })
    }

    pub(crate) fn is_owned_by(&self, device: &Arc<DeviceShared>) -> bool {
        Arc::ptr_eq(&self.device, device)
    }

    fn with_mapped<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut guard = self.allocation.lock();
        guard.as_mut().and_then(|a| a.mapped_slice_mut()).map(f)
    }

    fn is_host_visible(&self) -> bool {
        self.allocation
            .lock()
            .as_ref()
            .map_or(false, |a| a.mapped_ptr().is_some())
    }
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        unsafe { self.device.raw().destroy_buffer(self.buffer, self.device.callbacks()) };
        if let Some(allocation) = self.allocation.lock().take() {
            if let Some(heap) = self.heap {
                self.device.registry().notify_deallocation(heap, allocation.size());
            }
            if let Err(e) = self.device.free(allocation) {
                log::error!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Bytes needed for `len` elements of `T`.
fn byte_len<T>(len: usize) -> Result<u64> {
    len.checked_mul(std::mem::size_of::<T>())
        .and_then(|bytes| u64::try_from(bytes).ok())
        .ok_or_else(|| {
            RuntimeError::init_failed(
                "buffer",
                format!("{} x {}", len, std::any::type_name::<T>()),
                "size overflows",
            )
        })
}

/// Typed window over device memory.
pub struct Buffer<T> {
    pub(crate) storage: Arc<BufferStorage>,
    /// Byte offset into the storage.
    offset: u64,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> Clone for Buffer<T> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            offset: self.offset,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.storage.buffer)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("usage", &self.storage.usage)
            .finish()
    }
}

impl<T: Pod> Buffer<T> {
    pub(crate) fn new(device: &Arc<DeviceShared>, name: &str, len: usize, usage: BufferUsage) -> Result<Self> {
        let size = byte_len::<T>(len)?;
        Ok(Self {
            storage: Arc::new(BufferStorage::new(device, name, size, usage)?),
            offset: 0,
            len,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn byte_offset(&self) -> u64 {
        self.offset
    }

    /// Never overflows: every window lies inside storage sized by `byte_len`.
    pub fn byte_size(&self) -> u64 {
        (self.len * std::mem::size_of::<T>()) as u64
    }

    /// Size of the whole underlying storage, shared by every view.
    pub fn storage_bytes(&self) -> u64 {
        self.storage.size
    }

    pub fn handle(&self) -> vk::Buffer {
        self.storage.buffer
    }

    pub fn usage(&self) -> BufferUsage {
        self.storage.usage
    }

    pub fn is_host_visible(&self) -> bool {
        self.storage.is_host_visible()
    }

    pub(crate) fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.storage.buffer,
            offset: self.offset,
            range: self.byte_size().max(1),
        }
    }

    /// Sub-window of `range` elements sharing this buffer's memory.
    pub fn view(&self, range: Range<usize>) -> Result<Buffer<T>> {
        if range.start > range.end || range.end > self.len {
            return Err(RuntimeError::init_failed(
                "buffer view",
                format!("{:?}", range),
                format!("outside buffer of {} elements", self.len),
            ));
        }
        Ok(Buffer {
            storage: Arc::clone(&self.storage),
            offset: self.offset + (range.start * std::mem::size_of::<T>()) as u64,
            len: range.len(),
            _marker: PhantomData,
        })
    }

    /// Same bytes seen as elements of `U`.
    pub fn reinterpret<U: Pod>(&self) -> Result<Buffer<U>> {
        let size_u = std::mem::size_of::<U>() as u64;
        let bytes = self.byte_size();
        if size_u == 0 || bytes % size_u != 0 || self.offset % std::mem::align_of::<U>() as u64 != 0 {
            return Err(RuntimeError::init_failed(
                "buffer view",
                std::any::type_name::<U>(),
                format!("{} bytes at offset {} do not divide into elements", bytes, self.offset),
            ));
        }
        Ok(Buffer {
            storage: Arc::clone(&self.storage),
            offset: self.offset,
            len: (bytes / size_u) as usize,
            _marker: PhantomData,
        })
    }

    fn byte_range(&self) -> Range<usize> {
        self.offset as usize..(self.offset + self.byte_size()) as usize
    }

    /// Copy `data` into the start of the window.
    pub fn write(&self, data: &[T]) -> Result<()> {
        if data.len() > self.len {
            return Err(RuntimeError::init_failed(
                "buffer write",
                format!("{} elements", data.len()),
                format!("buffer holds {}", self.len),
            ));
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let range = self.byte_range();
        let written = self
            .storage
            .with_mapped(|mapped| mapped[range.start..range.start + bytes.len()].copy_from_slice(bytes));
        if written.is_some() {
            return Ok(());
        }

        let staging = Buffer::<T>::new(&self.storage.device, "staging_upload", data.len(), BufferUsage::PREFER_HOST)?;
        staging.write(data)?;
        self.view(0..data.len())?.copy_from(&staging)
    }

    pub fn read(&self) -> Result<Vec<T>> {
        let range = self.byte_range();
        let read = self.storage.with_mapped(|mapped| {
            let mut values = vec![T::zeroed(); self.len];
            bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(&mapped[range.clone()]);
            values
        });
        if let Some(values) = read {
            return Ok(values);
        }

        let staging = Buffer::<T>::new(
            &self.storage.device,
            "staging_readback",
            self.len,
            BufferUsage::PREFER_HOST | BufferUsage::RANDOM_ACCESS,
        )?;
        staging.copy_from(self)?;
        staging.read()
    }

    /// Fill the window with a repeated 32-bit pattern.
    pub fn fill(&self, pattern: u32) -> Result<()> {
        let size = self.byte_size();
        if self.offset % 4 != 0 || size % 4 != 0 {
            return Err(RuntimeError::init_failed(
                "buffer fill",
                format!("offset {} size {}", self.offset, size),
                "fill window must be 4-byte aligned",
            ));
        }
        if size == 0 {
            return Ok(());
        }
        let (buffer, offset) = (self.storage.buffer, self.offset);
        self.storage.device.run_one_shot("buffer_fill", |device, cmd| unsafe {
            device.cmd_fill_buffer(cmd, buffer, offset, size, pattern);
        })
    }

    /// Copy all of `src` into this window; lengths must match.
    pub fn copy_from(&self, src: &Buffer<T>) -> Result<()> {
        if src.len != self.len {
            return Err(RuntimeError::init_failed(
                "buffer copy",
                format!("{} -> {} elements", src.len, self.len),
                "length mismatch",
            ));
        }
        if self.len == 0 {
            return Ok(());
        }
        let region = vk::BufferCopy {
            src_offset: src.offset,
            dst_offset: self.offset,
            size: self.byte_size(),
        };
        let (src_buffer, dst_buffer) = (src.storage.buffer, self.storage.buffer);
        self.storage.device.run_one_shot("buffer_copy", |device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src_buffer, dst_buffer, &[region]);
        })
    }
}
