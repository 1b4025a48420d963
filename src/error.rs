// Runtime error taxonomy
//
// Every fallible operation in the library returns `Result<T>`. Errors are
// raised at the failure point and never retried internally.

use ash::vk;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The Vulkan shared library could not be loaded.
    #[error("Vulkan library not found: {0}")]
    LibraryNotFound(String),

    /// Instance, device, queue-family or object setup failed.
    #[error("{object} '{id}' initialization failed: {reason}{}", fmt_result(.result))]
    InitializationFailed {
        object: &'static str,
        id: String,
        reason: String,
        result: Option<vk::Result>,
    },

    /// Window-system integration was requested but no surface extension exists.
    #[error("no window surface extension available (requested by configuration)")]
    WindowSurfaceNotFound,

    /// Every fence in the pool is in flight.
    #[error("no available fence in pool of capacity {capacity}")]
    AvailableFenceNotFound { capacity: usize },

    /// A fence was handed back to a pool that never issued it.
    #[error("fence {0:?} does not belong to this pool")]
    FenceNotOwned(vk::Fence),

    /// A bounded wait expired before the GPU signalled completion.
    #[error("timed out after {timeout_ns} ns waiting for {what}")]
    Timeout { what: &'static str, timeout_ns: u64 },

    #[error("Vulkan call failed: {0}")]
    Native(#[from] vk::Result),

    #[error("GPU memory allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn fmt_result(result: &Option<vk::Result>) -> String {
    match result {
        Some(r) => format!(" ({r:?})"),
        None => String::new(),
    }
}

impl RuntimeError {
    pub fn init_failed(object: &'static str, id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InitializationFailed {
            object,
            id: id.into(),
            reason: reason.into(),
            result: None,
        }
    }

    /// Wrap a native object-creation failure with the object's logical name.
    pub fn native_init(object: &'static str, id: impl Into<String>, result: vk::Result) -> Self {
        Self::InitializationFailed {
            object,
            id: id.into(),
            reason: "native object creation failed".to_string(),
            result: Some(result),
        }
    }
}
