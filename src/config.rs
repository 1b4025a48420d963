// =============================================================================
// CONFIGURATION - Load runtime settings from polydispatch.toml
// =============================================================================
//
// Provides sensible defaults if the config file is missing or has errors.
// Native handles supplied by a host application are not serializable and
// travel separately in `ExternalContext`.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::backend::host_alloc::UpstreamAllocator;

/// Environment variable listing validation message ids to silence,
/// comma separated, decimal or `0x` hex.
pub const SUPPRESS_ENV_VAR: &str = "POLYDISPATCH_SUPPRESS_VALIDATION";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub application: ApplicationConfig,
    pub gpu: GpuConfig,
    pub debug: DebugConfig,
}

/// Application identity reported to the driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    pub version: Version,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "polydispatch".to_string(),
            version: Version { major: 0, minor: 1, patch: 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn to_vk(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }
}

/// GPU backend settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub enabled: bool,
    pub window_system_integration: bool,
    /// Initial fence pool capacity for every device.
    pub fence_pool_size: usize,
    /// Capacity of the host allocation tracking map.
    pub host_allocation_capacity: usize,
    /// Fence wait timeout; `None` waits practically forever.
    pub wait_timeout_ns: Option<u64>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_system_integration: false,
            fence_pool_size: 1,
            host_allocation_capacity: 1 << 16,
            wait_timeout_ns: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DebugConfig {
    pub enabled: bool,
    /// Validation message ids that are known to be benign.
    pub suppressed_message_ids: BTreeSet<i32>,
}

impl RuntimeConfig {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        let mut config = Self::load_from_path("polydispatch.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load polydispatch.toml: {:#}. Using defaults.", e);
            RuntimeConfig::default()
        });
        if let Ok(value) = std::env::var(SUPPRESS_ENV_VAR) {
            config.debug.suppressed_message_ids.extend(parse_message_ids(&value));
        }
        config
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(RuntimeConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Parse a comma separated id list. Malformed entries are skipped with a warning.
pub fn parse_message_ids(value: &str) -> Vec<i32> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| {
            let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16).map(|v| v as i32).ok(),
                None => s.parse::<i32>().ok(),
            };
            if parsed.is_none() {
                log::warn!("Ignoring malformed message id '{}' in {}", s, SUPPRESS_ENV_VAR);
            }
            parsed
        })
        .collect()
}

/// Native context owned by a host application that wants to share its
/// already-initialized Vulkan instance, or its allocator, with this runtime.
#[derive(Clone, Default)]
pub struct ExternalContext {
    pub instance: Option<vk::Instance>,
    pub get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    /// Backs every host allocation the driver makes; the system allocator
    /// when unset.
    pub upstream_allocator: Option<Arc<dyn UpstreamAllocator>>,
}

impl std::fmt::Debug for ExternalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalContext")
            .field("instance", &self.instance)
            .field("get_instance_proc_addr", &self.get_instance_proc_addr.is_some())
            .field("upstream_allocator", &self.upstream_allocator.is_some())
            .finish()
    }
}
