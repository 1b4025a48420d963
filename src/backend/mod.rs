// Backend module - Vulkan compute backend
//
// Design: thin wrappers around ash; native objects are owned by the struct
// that created them and destroyed in reverse creation order.

pub mod buffer;
pub mod capability;
pub mod debug;
pub mod device;
pub mod dispatch;
pub mod host_alloc;
pub mod instance;
pub mod pipeline;
pub mod queue;
pub mod shader;
pub mod sync;

pub use buffer::{Buffer, BufferUsage};
pub use capability::CapabilityRegistry;
pub use device::{
    BufferBinding, Device, DeviceState, Kernel, KernelSource, LaunchParams, StateWatch, Submission, WaitTarget,
};
pub use dispatch::{DispatchTable, LoaderSource};
pub use host_alloc::{HostAllocator, SystemAllocator, UpstreamAllocator};
pub use instance::VulkanBackend;
pub use pipeline::{ArgKind, KernelSignature, ScalarKind};
