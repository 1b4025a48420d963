// Vulkan Device - logical device and compute dispatch
//
// Responsibilities:
// - Queue negotiation + logical device creation
// - Memory allocator, command/descriptor pools, fence pool
// - Shader module and kernel caches
// - Kernel launch, completion waits, one-shot transfers

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use std::ffi::CString;
use std::sync::Arc;

use super::buffer::{Buffer, BufferStorage, BufferUsage};
use super::capability::{CapabilityRegistry, PIPELINE_EXECUTABLE_PROPERTIES};
use super::debug::{LabelGuard, ObjectNamer};
use super::dispatch::DispatchTable;
use super::host_alloc::HostCallbacks;
use super::instance::InstanceShared;
use super::pipeline::{KernelCache, KernelEntry, KernelLayout, KernelSignature, NativeKernelBuilder};
use super::queue::{negotiate, Capability, QueuePlan, QueueRequest};
use super::shader::{module_id, ShaderModuleCache};
use super::sync::{FencePool, NativeFences};
use crate::error::{Result, RuntimeError};

const PORTABILITY_SUBSET: &str = "VK_KHR_portability_subset";
const SWAPCHAIN: &str = "VK_KHR_swapchain";

const MAX_DESCRIPTOR_SETS: u32 = 256;
const MAX_DESCRIPTORS_PER_TYPE: u32 = 1024;

/// Device lifecycle, in the only order it can be walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceState {
    Uninitialized,
    Initializing,
    Ready,
    Destroying,
    Destroyed,
}

/// Lifecycle cell shared between a device and its watchers.
#[derive(Debug)]
struct Lifecycle(Arc<Mutex<DeviceState>>);

impl Lifecycle {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(DeviceState::Uninitialized)))
    }

    fn get(&self) -> DeviceState {
        *self.0.lock()
    }

    /// Move forward to `next`; backward or repeated moves are refused.
    fn advance(&self, next: DeviceState) -> bool {
        let mut state = self.0.lock();
        if next <= *state {
            log::warn!("Ignoring device state change {:?} -> {:?}", *state, next);
            return false;
        }
        log::debug!("Device state {:?} -> {:?}", *state, next);
        *state = next;
        true
    }

    fn share(&self) -> Self {
        Self(Arc::clone(&self.0))
    }

    fn watch(&self) -> StateWatch {
        StateWatch(Arc::clone(&self.0))
    }
}

/// Read-only view of a device's lifecycle. Outlives the device, so teardown
/// progress stays observable after the last handle is dropped.
#[derive(Debug, Clone)]
pub struct StateWatch(Arc<Mutex<DeviceState>>);

impl StateWatch {
    pub fn get(&self) -> DeviceState {
        *self.0.lock()
    }
}

/// Shader-visible features turned on when the hardware has them.
fn enabled_features(supported: &vk::PhysicalDeviceFeatures) -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        shader_int64: supported.shader_int64,
        shader_int16: supported.shader_int16,
        shader_float64: supported.shader_float64,
        ..Default::default()
    }
}

/// Work groups per dimension covering `global`; unused dimensions get 1.
pub fn group_counts(work_group_size: &[u32], global: [u32; 3]) -> [u32; 3] {
    let mut groups = [1u32; 3];
    for (d, &local) in work_group_size.iter().enumerate().take(3) {
        let local = u64::from(local.max(1));
        groups[d] = ((u64::from(global[d]) + local - 1) / local) as u32;
    }
    groups
}

/// Reject a descriptor window the device cannot bind to a slot of type `ty`.
fn check_binding(
    kernel: &str,
    binding: u32,
    ty: vk::DescriptorType,
    info: &vk::DescriptorBufferInfo,
    limits: &vk::PhysicalDeviceLimits,
) -> Result<()> {
    let (kind, alignment, max_range) = if ty == vk::DescriptorType::UNIFORM_BUFFER {
        (
            "uniform",
            limits.min_uniform_buffer_offset_alignment,
            limits.max_uniform_buffer_range,
        )
    } else {
        (
            "storage",
            limits.min_storage_buffer_offset_alignment,
            limits.max_storage_buffer_range,
        )
    };
    if alignment > 0 && info.offset % alignment != 0 {
        return Err(RuntimeError::init_failed(
            "launch",
            kernel,
            format!(
                "{} binding {} offset {} is not a multiple of {}",
                kind, binding, info.offset, alignment
            ),
        ));
    }
    if info.range > u64::from(max_range) {
        return Err(RuntimeError::init_failed(
            "launch",
            kernel,
            format!(
                "{} binding {} range {} exceeds device limit {}",
                kind, binding, info.range, max_range
            ),
        ));
    }
    Ok(())
}

#[derive(Default)]
struct Pools {
    command: vk::CommandPool,
    descriptor: vk::DescriptorPool,
}

/// Native objects owned by the logical device. Dropping it tears everything
/// down in reverse creation order, which also unwinds a half-built device.
struct DeviceCore {
    /// Same functions as `table.device()`.
    device: ash::Device,
    table: Arc<DispatchTable>,
    callbacks: HostCallbacks,
    allocator: Mutex<Option<Allocator>>,
    pools: Mutex<Pools>,
    fences: Mutex<FencePool>,
    lifecycle: Lifecycle,
}

impl DeviceCore {
    fn native_fences(&self) -> NativeFences<'_> {
        NativeFences {
            device: &self.device,
            callbacks: Some(self.callbacks.as_vk()),
        }
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        // A half-built device never reached the shared teardown.
        if self.lifecycle.get() < DeviceState::Destroying {
            self.lifecycle.advance(DeviceState::Destroying);
        }
        if let Err(e) = unsafe { self.device.device_wait_idle() } {
            log::warn!("device_wait_idle during teardown failed: {:?}", e);
        }
        let callbacks = Some(self.callbacks.as_vk());
        let fences = NativeFences {
            device: &self.device,
            callbacks,
        };
        if let Err(e) = self.fences.get_mut().clear(&fences) {
            log::warn!("Failed to clear fence pool: {}", e);
        }
        let pools = self.pools.get_mut();
        unsafe {
            if pools.descriptor != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(pools.descriptor, callbacks);
            }
            if pools.command != vk::CommandPool::null() {
                self.device.destroy_command_pool(pools.command, callbacks);
            }
        }
        // Allocator frees its memory blocks through the device.
        drop(self.allocator.get_mut().take());
        unsafe { self.device.destroy_device(callbacks) };
        self.lifecycle.advance(DeviceState::Destroyed);
    }
}

pub(crate) struct DeviceShared {
    core: DeviceCore,
    registry: Arc<CapabilityRegistry>,
    plan: QueuePlan,
    queues: Vec<Mutex<vk::Queue>>,
    modules: Mutex<ShaderModuleCache>,
    kernels: Mutex<KernelCache>,
    namer: ObjectNamer,
    statistics: Option<vk::KhrPipelineExecutablePropertiesFn>,
    wait_timeout_ns: u64,
    state: Lifecycle,
    // Last: the instance must outlive the device.
    _backend: Arc<InstanceShared>,
}

impl DeviceShared {
    pub(crate) fn raw(&self) -> &ash::Device {
        &self.core.device
    }

    pub(crate) fn callbacks(&self) -> Option<&vk::AllocationCallbacks> {
        Some(self.core.callbacks.as_vk())
    }

    pub(crate) fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub(crate) fn namer(&self) -> &ObjectNamer {
        &self.namer
    }

    pub(crate) fn allocate(&self, desc: &AllocationCreateDesc<'_>) -> Result<Allocation> {
        let mut guard = self.core.allocator.lock();
        let allocator = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::init_failed("allocator", self.registry.device_name.clone(), "not available"))?;
        Ok(allocator.allocate(desc)?)
    }

    pub(crate) fn free(&self, allocation: Allocation) -> Result<()> {
        let mut guard = self.core.allocator.lock();
        match guard.as_mut() {
            Some(allocator) => Ok(allocator.free(allocation)?),
            None => Ok(()),
        }
    }

    fn kernel_builder(&self) -> NativeKernelBuilder<'_> {
        NativeKernelBuilder {
            device: &self.core.device,
            callbacks: Some(self.core.callbacks.as_vk()),
            namer: &self.namer,
            statistics: self.statistics.as_ref(),
        }
    }

    fn compute_queue_count(&self) -> usize {
        self.plan
            .get(Capability::Compute)
            .map_or(0, |a| a.queue_count as usize)
    }

    fn queue(&self, index: usize) -> Result<&Mutex<vk::Queue>> {
        self.queues.get(index).ok_or_else(|| {
            RuntimeError::init_failed(
                "queue",
                index.to_string(),
                format!("device has {} queues", self.queues.len()),
            )
        })
    }

    /// Device-wide idle wait; every queue is locked for the duration.
    fn wait_idle(&self) -> Result<()> {
        let _queues: Vec<_> = self.queues.iter().map(|q| q.lock()).collect();
        unsafe { self.core.device.device_wait_idle() }?;
        Ok(())
    }

    fn allocate_descriptor_set(&self, kernel: &KernelEntry) -> Result<vk::DescriptorSet> {
        if kernel.layout.bindings.is_empty() {
            return Ok(vk::DescriptorSet::null());
        }
        let pools = self.core.pools.lock();
        let set_layouts = [kernel.handles.descriptor_set_layout];
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pools.descriptor)
            .set_layouts(&set_layouts);
        let sets = unsafe { self.core.device.allocate_descriptor_sets(&info) }?;
        Ok(sets[0])
    }

    /// Record a command buffer and submit it on compute queue `queue_index`.
    /// Every failure path hands the partial submission's objects back.
    fn record_and_submit(
        self: &Arc<Self>,
        label: &str,
        queue_index: usize,
        descriptor_set: vk::DescriptorSet,
        resources: Vec<Arc<BufferStorage>>,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<Submission> {
        let mut submission = Submission {
            device: Arc::clone(self),
            queue_index,
            label: label.to_string(),
            command_buffer: vk::CommandBuffer::null(),
            descriptor_set,
            fence: vk::Fence::null(),
            resources,
            submitted: false,
            completed: false,
        };

        if queue_index >= self.compute_queue_count() {
            return Err(RuntimeError::init_failed(
                "submission",
                label,
                format!(
                    "queue index {} out of range ({} compute queues)",
                    queue_index,
                    self.compute_queue_count()
                ),
            ));
        }
        let queue = self.queue(queue_index)?;
        let device = &self.core.device;

        {
            // Declared after `submission`, so released before it on early return.
            let pools = self.core.pools.lock();
            let info = vk::CommandBufferAllocateInfo::builder()
                .command_pool(pools.command)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            submission.command_buffer = unsafe { device.allocate_command_buffers(&info) }?[0];
            let cmd = submission.command_buffer;

            let begin = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin) }?;
            {
                let _label = LabelGuard::begin(self.namer.utils(), cmd, label);
                record(device, cmd);
            }
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(
                    vk::AccessFlags::HOST_READ
                        | vk::AccessFlags::SHADER_READ
                        | vk::AccessFlags::TRANSFER_READ,
                )
                .build();
            unsafe {
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST
                        | vk::PipelineStageFlags::COMPUTE_SHADER
                        | vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
                device.end_command_buffer(cmd)
            }?;
        }

        submission.fence = self.core.fences.lock().take()?;
        let command_buffers = [submission.command_buffer];
        let submit = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        {
            let queue = queue.lock();
            unsafe { device.queue_submit(*queue, &[submit], submission.fence) }?;
        }
        submission.submitted = true;
        log::trace!("Submitted {} on queue {}", label, queue_index);
        Ok(submission)
    }

    /// Record, submit and wait. Used by buffer transfers.
    pub(crate) fn run_one_shot(
        self: &Arc<Self>,
        label: &str,
        record: impl FnOnce(&ash::Device, vk::CommandBuffer),
    ) -> Result<()> {
        let mut submission =
            self.record_and_submit(label, 0, vk::DescriptorSet::null(), Vec::new(), record)?;
        submission.wait(self.wait_timeout_ns)
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        log::info!("Destroying device {}...", self.registry.device_name);
        self.state.advance(DeviceState::Destroying);
        if let Err(e) = self.wait_idle() {
            log::warn!("wait idle before teardown failed: {}", e);
        }
        // Kernels reference modules, so they go first.
        let builder = self.kernel_builder();
        self.kernels.lock().destroy_all(&builder);
        self.modules.lock().destroy_all(&builder);
        // `core` drops right after this: fences, pools, allocator, device.
    }
}

/// Everything needed to build one kernel.
#[derive(Debug, Clone)]
pub struct KernelSource<'a> {
    /// SPIR-V bytes of the containing module.
    pub binary: &'a [u8],
    pub module_name: &'a str,
    /// Entry point inside the module.
    pub entry_point: &'a str,
    pub signature: KernelSignature,
}

/// A cached pipeline plus its layout. Clones share the same native objects.
#[derive(Clone)]
pub struct Kernel {
    entry: Arc<KernelEntry>,
    device: Arc<DeviceShared>,
}

impl Kernel {
    pub fn name(&self) -> String {
        self.entry.qualified_name()
    }

    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn layout(&self) -> &KernelLayout {
        &self.entry.layout
    }

    pub fn entry(&self) -> &Arc<KernelEntry> {
        &self.entry
    }

    /// Both handles refer to the same cache entry.
    pub fn same_as(&self, other: &Kernel) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name())
            .field("id", &format_args!("{:#018x}", self.entry.id))
            .finish()
    }
}

/// A buffer bound to a kernel descriptor slot.
#[derive(Clone)]
pub struct BufferBinding {
    storage: Arc<BufferStorage>,
    info: vk::DescriptorBufferInfo,
}

impl BufferBinding {
    pub fn new<T: Pod>(buffer: &Buffer<T>) -> Self {
        Self {
            storage: Arc::clone(&buffer.storage),
            info: buffer.descriptor_info(),
        }
    }
}

impl<T: Pod> From<&Buffer<T>> for BufferBinding {
    fn from(buffer: &Buffer<T>) -> Self {
        Self::new(buffer)
    }
}

#[derive(Default)]
pub struct LaunchParams<'a> {
    /// Total invocations per dimension.
    pub global_size: [u32; 3],
    pub storage_buffers: Vec<BufferBinding>,
    pub uniform_buffers: Vec<BufferBinding>,
    /// Raw bytes per scalar/vector argument, in declaration order.
    pub args: Vec<&'a [u8]>,
    /// Index into the device's compute queues.
    pub queue_index: usize,
}

/// An in-flight command buffer. Dropping it waits for completion.
pub struct Submission {
    device: Arc<DeviceShared>,
    queue_index: usize,
    label: String,
    command_buffer: vk::CommandBuffer,
    descriptor_set: vk::DescriptorSet,
    fence: vk::Fence,
    /// Buffers kept alive until the GPU is done with them.
    resources: Vec<Arc<BufferStorage>>,
    submitted: bool,
    completed: bool,
}

impl Submission {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn queue_index(&self) -> usize {
        self.queue_index
    }

    /// Non-blocking completion check.
    pub fn is_complete(&self) -> Result<bool> {
        if self.completed || !self.submitted {
            return Ok(true);
        }
        Ok(unsafe { self.device.core.device.get_fence_status(self.fence) }?)
    }

    fn wait(&mut self, timeout_ns: u64) -> Result<()> {
        if self.completed || !self.submitted {
            return Ok(());
        }
        let fences = [self.fence];
        match unsafe { self.device.core.device.wait_for_fences(&fences, true, timeout_ns) } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                return Err(RuntimeError::Timeout {
                    what: "submission",
                    timeout_ns,
                })
            }
            Err(e) => return Err(e.into()),
        }
        self.completed = true;
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        let shared = Arc::clone(&self.device);
        let device = &shared.core.device;
        {
            let pools = shared.core.pools.lock();
            if self.command_buffer != vk::CommandBuffer::null() {
                unsafe { device.free_command_buffers(pools.command, &[self.command_buffer]) };
                self.command_buffer = vk::CommandBuffer::null();
            }
            if self.descriptor_set != vk::DescriptorSet::null() {
                if let Err(e) = unsafe { device.free_descriptor_sets(pools.descriptor, &[self.descriptor_set]) } {
                    log::warn!("Failed to free descriptor set for {}: {:?}", self.label, e);
                }
                self.descriptor_set = vk::DescriptorSet::null();
            }
        }
        if self.fence != vk::Fence::null() {
            let mut fence = self.fence;
            if let Err(e) = shared.core.fences.lock().release(&shared.core.native_fences(), &mut fence) {
                log::warn!("Failed to return fence for {}: {}", self.label, e);
            }
            self.fence = vk::Fence::null();
        }
        self.resources.clear();
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        if self.submitted && !self.completed {
            if let Err(e) = self.wait(u64::MAX) {
                log::error!("Waiting for {} on drop failed: {}", self.label, e);
            }
        }
        self.release();
    }
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("label", &self.label)
            .field("queue_index", &self.queue_index)
            .field("completed", &self.completed)
            .finish()
    }
}

pub enum WaitTarget<'a> {
    /// Every queue of the device.
    Device,
    /// One entry of the flat queue array.
    Queue(usize),
    Submission(&'a mut Submission),
}

/// Logical device created from one capability registry.
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    pub(crate) fn new(backend: Arc<InstanceShared>, registry: Arc<CapabilityRegistry>) -> Result<Self> {
        let id = registry.index.to_string();
        log::info!("Creating device {}: {}", id, registry.device_name);
        let config = &backend.config;
        let state = Lifecycle::new();
        state.advance(DeviceState::Initializing);

        let window_system = backend.window_extension.is_some();
        let mut requests = vec![QueueRequest {
            capability: Capability::Compute,
            count: None,
        }];
        if window_system {
            requests.push(QueueRequest {
                capability: Capability::Graphics,
                count: Some(1),
            });
        }
        let plan = negotiate(&registry.queue_families, &requests)?;
        for a in plan.assignments() {
            log::info!(
                "  {} queues: family {}, {} queue(s) from #{}",
                a.capability.name(),
                a.family_index,
                a.queue_count,
                a.first_queue
            );
        }

        let debug_utils = backend.debug.as_ref().map(|d| d.utils.clone());
        let capture_statistics = debug_utils.is_some() && registry.supports_pipeline_statistics();
        if debug_utils.is_some()
            && !capture_statistics
            && registry.is_extension_supported(PIPELINE_EXECUTABLE_PROPERTIES)
        {
            log::debug!(
                "{} listed without pipelineExecutableInfo; statistics off",
                PIPELINE_EXECUTABLE_PROPERTIES
            );
        }

        let mut extension_names: Vec<&str> = Vec::new();
        if window_system && registry.is_extension_supported(SWAPCHAIN) {
            extension_names.push(SWAPCHAIN);
        }
        if capture_statistics {
            extension_names.push(PIPELINE_EXECUTABLE_PROPERTIES);
        }
        if registry.is_extension_supported(PORTABILITY_SUBSET) {
            extension_names.push(PORTABILITY_SUBSET);
        }
        let extension_cstrs: Vec<CString> = extension_names
            .iter()
            .filter_map(|n| CString::new(*n).ok())
            .collect();
        let extension_ptrs: Vec<_> = extension_cstrs.iter().map(|s| s.as_ptr()).collect();

        let family_counts = plan.family_queue_counts();
        let priorities: Vec<Vec<f32>> = family_counts
            .iter()
            .map(|&(_, count)| vec![1.0; count as usize])
            .collect();
        let queue_infos: Vec<_> = family_counts
            .iter()
            .zip(&priorities)
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
                    .build()
            })
            .collect();

        let features = enabled_features(&registry.features);
        let mut executable_features = vk::PhysicalDevicePipelineExecutablePropertiesFeaturesKHR::builder()
            .pipeline_executable_info(true)
            .build();
        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .enabled_features(&features);
        if capture_statistics {
            create_info = create_info.push_next(&mut executable_features);
        }

        let instance = backend.instance();
        let callbacks = backend.host.callbacks();
        let raw = unsafe { instance.create_device(registry.physical_device, &create_info, Some(callbacks.as_vk())) }
            .map_err(|e| RuntimeError::native_init("device", id.clone(), e))?;

        let table = match backend.table.bind_to_device(&raw) {
            Ok(table) => table,
            Err(e) => {
                unsafe { raw.destroy_device(Some(callbacks.as_vk())) };
                return Err(e);
            }
        };
        // From here on, an early return drops `core` and unwinds what exists.
        let core = DeviceCore {
            device: raw,
            table,
            callbacks,
            allocator: Mutex::new(None),
            pools: Mutex::new(Pools::default()),
            fences: Mutex::new(FencePool::new()),
            lifecycle: state.share(),
        };

        let mut queues = Vec::with_capacity(plan.total_queues() as usize);
        for a in plan.assignments() {
            for i in 0..a.queue_count {
                let queue = unsafe { core.device.get_device_queue(a.family_index, a.first_queue + i) };
                queues.push(Mutex::new(queue));
            }
        }

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: core.device.clone(),
            physical_device: registry.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        *core.allocator.lock() = Some(allocator);

        let namer = ObjectNamer::new(debug_utils, core.device.handle());
        let compute = plan
            .get(Capability::Compute)
            .ok_or_else(|| RuntimeError::init_failed("device", id.clone(), "no compute queue family"))?;
        {
            let mut pools = core.pools.lock();
            let info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(compute.family_index)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            pools.command = unsafe { core.device.create_command_pool(&info, Some(core.callbacks.as_vk())) }
                .map_err(|e| RuntimeError::native_init("command pool", id.clone(), e))?;
            namer.name(pools.command, &format!("device{}_command_pool", id));

            let sizes = [
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: MAX_DESCRIPTORS_PER_TYPE,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: MAX_DESCRIPTORS_PER_TYPE,
                },
            ];
            let info = vk::DescriptorPoolCreateInfo::builder()
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                .max_sets(MAX_DESCRIPTOR_SETS)
                .pool_sizes(&sizes);
            pools.descriptor = unsafe { core.device.create_descriptor_pool(&info, Some(core.callbacks.as_vk())) }
                .map_err(|e| RuntimeError::native_init("descriptor pool", id.clone(), e))?;
            namer.name(pools.descriptor, &format!("device{}_descriptor_pool", id));
        }

        core.fences
            .lock()
            .resize(&core.native_fences(), config.gpu.fence_pool_size)?;

        let statistics = capture_statistics.then(|| {
            let handle = core.device.handle();
            vk::KhrPipelineExecutablePropertiesFn::load(|name| unsafe {
                std::mem::transmute((instance.fp_v1_0().get_device_proc_addr)(handle, name.as_ptr()))
            })
        });

        namer.name(core.device.handle(), &format!("device{}_{}", id, registry.device_name));
        state.advance(DeviceState::Ready);
        log::info!(
            "Device {} ready: {} queue(s), {} fence(s){}",
            id,
            queues.len(),
            config.gpu.fence_pool_size,
            if capture_statistics { ", pipeline statistics on" } else { "" }
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                core,
                registry,
                plan,
                queues,
                modules: Mutex::new(ShaderModuleCache::new()),
                kernels: Mutex::new(KernelCache::new()),
                namer,
                statistics,
                wait_timeout_ns: config.gpu.wait_timeout_ns.unwrap_or(u64::MAX),
                state,
                _backend: backend,
            }),
        })
    }

    pub fn device_info(&self) -> &Arc<CapabilityRegistry> {
        &self.shared.registry
    }

    pub fn dispatch_table(&self) -> &Arc<DispatchTable> {
        &self.shared.core.table
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state.get()
    }

    /// Lifecycle handle that keeps reporting after the device is gone.
    pub fn state_watch(&self) -> StateWatch {
        self.shared.state.watch()
    }

    pub fn queue_plan(&self) -> &QueuePlan {
        &self.shared.plan
    }

    pub fn queue_count(&self) -> usize {
        self.shared.queues.len()
    }

    pub fn compute_queue_count(&self) -> usize {
        self.shared.compute_queue_count()
    }

    pub fn debug_enabled(&self) -> bool {
        self.shared.namer.is_enabled()
    }

    pub fn fence_pool_capacity(&self) -> usize {
        self.shared.core.fences.lock().capacity()
    }

    pub fn available_fences(&self) -> usize {
        self.shared.core.fences.lock().available()
    }

    /// Resize the fence pool after waiting for the device to go idle.
    pub fn set_fence_size(&self, size: usize) -> Result<()> {
        self.shared.wait_idle()?;
        let mut fences = self.shared.core.fences.lock();
        let held = fences.capacity() - fences.available();
        if held > 0 {
            return Err(RuntimeError::init_failed(
                "fence pool",
                self.shared.registry.index.to_string(),
                format!("{} fence(s) still held by submissions", held),
            ));
        }
        fences.resize(&self.shared.core.native_fences(), size)?;
        log::debug!("Fence pool resized to {}", size);
        Ok(())
    }

    pub fn module_count(&self) -> usize {
        self.shared.modules.lock().len()
    }

    pub fn kernel_count(&self) -> usize {
        self.shared.kernels.lock().len()
    }

    /// Build (or fetch from cache) the module and kernel named by `source`.
    pub fn create_kernel(&self, source: &KernelSource<'_>) -> Result<Kernel> {
        let builder = self.shared.kernel_builder();
        let module = self.shared.modules.lock().get_or_create(
            &builder,
            module_id(source.module_name),
            source.binary,
            source.module_name,
        )?;
        let entry = self.shared.kernels.lock().get_or_create(
            &builder,
            &module,
            source.entry_point,
            &source.signature,
            self.shared.registry.preferred_work_group_size,
        )?;
        Ok(Kernel {
            entry,
            device: Arc::clone(&self.shared),
        })
    }

    pub fn create_buffer<T: Pod>(&self, name: &str, len: usize, usage: BufferUsage) -> Result<Buffer<T>> {
        Buffer::new(&self.shared, name, len, usage)
    }

    /// Bind buffers and arguments, record one dispatch and submit it.
    pub fn launch(&self, kernel: &Kernel, params: &LaunchParams<'_>) -> Result<Submission> {
        let entry = &kernel.entry;
        let name = entry.qualified_name();
        if !Arc::ptr_eq(&kernel.device, &self.shared) {
            return Err(RuntimeError::init_failed("launch", name, "kernel belongs to another device"));
        }

        let layout = &entry.layout;
        let storage = layout.descriptor_count(vk::DescriptorType::STORAGE_BUFFER) as usize;
        let uniform = layout.descriptor_count(vk::DescriptorType::UNIFORM_BUFFER) as usize;
        if params.storage_buffers.len() != storage || params.uniform_buffers.len() != uniform {
            return Err(RuntimeError::init_failed(
                "launch",
                name,
                format!(
                    "expected {} storage and {} uniform buffers, got {} and {}",
                    storage,
                    uniform,
                    params.storage_buffers.len(),
                    params.uniform_buffers.len()
                ),
            ));
        }
        let bound: Vec<&BufferBinding> = params
            .storage_buffers
            .iter()
            .chain(&params.uniform_buffers)
            .collect();
        if bound.iter().any(|b| !b.storage.is_owned_by(&self.shared)) {
            return Err(RuntimeError::init_failed("launch", name, "buffer belongs to another device"));
        }
        let arg_block = layout.args.pack(&params.args)?;

        let limits = &self.shared.registry.properties.limits;
        let buffer_infos: Vec<_> = layout
            .bindings
            .iter()
            .zip(&bound)
            .map(|(b, buffer)| (b.binding, b.ty, buffer.info))
            .collect();
        for (binding, ty, info) in &buffer_infos {
            check_binding(&name, *binding, *ty, info, limits)?;
        }

        let descriptor_set = self.shared.allocate_descriptor_set(entry)?;
        let writes: Vec<_> = buffer_infos
            .iter()
            .map(|(binding, ty, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(descriptor_set)
                    .dst_binding(*binding)
                    .descriptor_type(*ty)
                    .buffer_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        if !writes.is_empty() {
            unsafe { self.shared.core.device.update_descriptor_sets(&writes, &[]) };
        }

        let groups = group_counts(&layout.work_group_size, params.global_size);
        let handles = entry.handles;
        let resources = bound.iter().map(|b| Arc::clone(&b.storage)).collect();

        self.shared.record_and_submit(
            &name,
            params.queue_index,
            descriptor_set,
            resources,
            |device, cmd| unsafe {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, handles.pipeline);
                if descriptor_set != vk::DescriptorSet::null() {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::COMPUTE,
                        handles.pipeline_layout,
                        0,
                        &[descriptor_set],
                        &[],
                    );
                }
                if !arg_block.is_empty() {
                    device.cmd_push_constants(
                        cmd,
                        handles.pipeline_layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        &arg_block,
                    );
                }
                device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
            },
        )
    }

    pub fn wait_for_completion(&self, target: WaitTarget<'_>) -> Result<()> {
        match target {
            WaitTarget::Device => self.shared.wait_idle(),
            WaitTarget::Queue(index) => {
                let queue = self.shared.queue(index)?.lock();
                unsafe { self.shared.core.device.queue_wait_idle(*queue) }?;
                Ok(())
            }
            WaitTarget::Submission(submission) => {
                if !Arc::ptr_eq(&submission.device, &self.shared) {
                    return Err(RuntimeError::init_failed(
                        "submission",
                        submission.label.clone(),
                        "submitted on another device",
                    ));
                }
                submission.wait(self.shared.wait_timeout_ns)
            }
        }
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.shared.wait_idle()
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("registry", &self.shared.registry)
            .field("queues", &self.shared.queues.len())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_counts_round_up_per_dimension() {
        assert_eq!(group_counts(&[256], [1000, 0, 0]), [4, 1, 1]);
        assert_eq!(group_counts(&[256], [256, 7, 7]), [1, 1, 1]);
        assert_eq!(group_counts(&[8, 8, 4], [17, 8, 1]), [3, 1, 1]);
        assert_eq!(group_counts(&[16, 16], [u32::MAX, 1, 1]), [268_435_456, 1, 1]);
    }

    #[test]
    fn zero_sized_dispatch_issues_no_groups() {
        assert_eq!(group_counts(&[64], [0, 0, 0]), [0, 1, 1]);
    }

    fn limits() -> vk::PhysicalDeviceLimits {
        vk::PhysicalDeviceLimits {
            min_storage_buffer_offset_alignment: 64,
            min_uniform_buffer_offset_alignment: 256,
            max_storage_buffer_range: 1 << 27,
            max_uniform_buffer_range: 1 << 16,
            ..Default::default()
        }
    }

    fn window(offset: u64, range: u64) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: vk::Buffer::null(),
            offset,
            range,
        }
    }

    #[test]
    fn misaligned_views_cannot_be_bound() {
        let limits = limits();
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        let uniform = vk::DescriptorType::UNIFORM_BUFFER;

        // view(10..20) of a u32 buffer starts at byte 40
        assert!(check_binding("k", 0, storage, &window(40, 40), &limits).is_err());
        assert!(check_binding("k", 0, storage, &window(128, 40), &limits).is_ok());
        assert!(check_binding("k", 2, uniform, &window(128, 16), &limits).is_err());
        assert!(check_binding("k", 2, uniform, &window(512, 16), &limits).is_ok());
        assert!(check_binding("k", 1, storage, &window(0, 4), &limits).is_ok());
    }

    #[test]
    fn oversized_windows_cannot_be_bound() {
        let limits = limits();
        let err = check_binding(
            "saxpy",
            2,
            vk::DescriptorType::UNIFORM_BUFFER,
            &window(0, (1 << 16) + 4),
            &limits,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::InitializationFailed { object: "launch", .. }));
        assert!(err.to_string().contains("uniform binding 2"));
        assert!(check_binding("saxpy", 0, vk::DescriptorType::STORAGE_BUFFER, &window(0, 1 << 16), &limits).is_ok());
    }

    #[test]
    fn lifecycle_only_moves_forward() {
        let lifecycle = Lifecycle::new();
        let watch = lifecycle.watch();
        assert_eq!(watch.get(), DeviceState::Uninitialized);
        assert!(lifecycle.advance(DeviceState::Initializing));
        assert!(lifecycle.advance(DeviceState::Ready));
        assert!(!lifecycle.advance(DeviceState::Ready));
        assert!(!lifecycle.advance(DeviceState::Initializing));
        assert_eq!(lifecycle.get(), DeviceState::Ready);

        // A failed build jumps straight into teardown.
        let failed = Lifecycle::new();
        assert!(failed.advance(DeviceState::Initializing));
        assert!(failed.advance(DeviceState::Destroying));
        assert!(failed.share().advance(DeviceState::Destroyed));
        assert_eq!(failed.watch().get(), DeviceState::Destroyed);
        drop(lifecycle);
        assert_eq!(watch.get(), DeviceState::Ready);
    }

    #[test]
    fn only_supported_features_are_enabled() {
        let supported = vk::PhysicalDeviceFeatures {
            shader_int64: vk::TRUE,
            shader_float64: vk::FALSE,
            geometry_shader: vk::TRUE,
            ..Default::default()
        };
        let enabled = enabled_features(&supported);
        assert_eq!(enabled.shader_int64, vk::TRUE);
        assert_eq!(enabled.shader_float64, vk::FALSE);
        assert_eq!(enabled.geometry_shader, vk::FALSE);
    }
}
