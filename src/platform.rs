// Platform - the set of execution backends available to a process
//
// Backends form a closed set. Only the Vulkan backend is implemented; the CPU
// kind exists so callers can name it.

use std::fmt;
use std::sync::Arc;

use crate::backend::{CapabilityRegistry, Device, VulkanBackend};
use crate::config::{ExternalContext, RuntimeConfig};
use crate::error::{Result, RuntimeError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Cpu,
    Vulkan,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Vulkan => write!(f, "vulkan"),
        }
    }
}

/// Description of one device, tagged with the backend that enumerated it.
#[derive(Clone, Debug)]
pub enum DeviceInfo {
    Vulkan(Arc<CapabilityRegistry>),
}

impl DeviceInfo {
    pub fn kind(&self) -> BackendKind {
        match self {
            DeviceInfo::Vulkan(_) => BackendKind::Vulkan,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DeviceInfo::Vulkan(registry) => &registry.device_name,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            DeviceInfo::Vulkan(registry) => registry.index,
        }
    }
}

pub enum SubPlatform {
    Vulkan(VulkanBackend),
}

impl SubPlatform {
    pub fn kind(&self) -> BackendKind {
        match self {
            SubPlatform::Vulkan(backend) => backend.kind(),
        }
    }

    pub fn is_available(&self) -> bool {
        match self {
            SubPlatform::Vulkan(backend) => backend.is_available(),
        }
    }

    pub fn num_of_devices(&self) -> usize {
        match self {
            SubPlatform::Vulkan(backend) => backend.num_of_devices(),
        }
    }

    pub fn device_info_list(&self) -> Vec<DeviceInfo> {
        match self {
            SubPlatform::Vulkan(backend) => backend
                .device_info_list()
                .iter()
                .cloned()
                .map(DeviceInfo::Vulkan)
                .collect(),
        }
    }

    pub fn create_device(&self, info: &DeviceInfo) -> Result<Device> {
        match (self, info) {
            (SubPlatform::Vulkan(backend), DeviceInfo::Vulkan(registry)) => backend.create_device(registry),
        }
    }
}

impl fmt::Debug for SubPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubPlatform")
            .field("kind", &self.kind())
            .field("devices", &self.num_of_devices())
            .finish()
    }
}

/// Every backend that came up in this process.
#[derive(Debug, Default)]
pub struct Platform {
    sub_platforms: Vec<SubPlatform>,
}

impl Platform {
    /// Bring up each backend enabled in `config`. The first backend that
    /// fails stops the bootstrap and its error is returned; whether to retry
    /// without it is up to the caller.
    pub fn new(config: &RuntimeConfig, external: ExternalContext) -> Result<Self> {
        let mut sub_platforms = Vec::new();
        if config.gpu.enabled {
            sub_platforms.push(SubPlatform::Vulkan(VulkanBackend::new(config, external)?));
        } else {
            log::info!("GPU backend disabled by configuration");
        }
        Ok(Self { sub_platforms })
    }

    pub fn sub_platforms(&self) -> &[SubPlatform] {
        &self.sub_platforms
    }

    pub fn sub_platform(&self, kind: BackendKind) -> Option<&SubPlatform> {
        self.sub_platforms.iter().find(|p| p.kind() == kind)
    }

    pub fn device_info_list(&self) -> Vec<DeviceInfo> {
        self.sub_platforms
            .iter()
            .flat_map(SubPlatform::device_info_list)
            .collect()
    }

    pub fn create_device(&self, info: &DeviceInfo) -> Result<Device> {
        let sub_platform = self.sub_platform(info.kind()).ok_or_else(|| {
            RuntimeError::init_failed("device", info.name().to_string(), format!("no {} backend", info.kind()))
        })?;
        sub_platform.create_device(info)
    }
}
