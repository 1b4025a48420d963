// polydispatch - describe a compute kernel once, dispatch it on any backend
//
// Layout:
// - config:   runtime settings (polydispatch.toml) and host-supplied handles
// - error:    error taxonomy shared by every module
// - platform: closed set of execution backends
// - backend:  the Vulkan implementation

pub mod backend;
pub mod config;
pub mod error;
pub mod platform;

pub use backend::{
    ArgKind, Buffer, BufferBinding, BufferUsage, CapabilityRegistry, Device, Kernel, KernelSignature,
    KernelSource, LaunchParams, ScalarKind, Submission, WaitTarget,
};
pub use config::{ExternalContext, RuntimeConfig};
pub use error::{Result, RuntimeError};
pub use platform::{BackendKind, DeviceInfo, Platform, SubPlatform};
