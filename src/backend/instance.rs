// Vulkan backend - instance bootstrap and device enumeration
//
// Responsibilities:
// - Loader + instance creation (or adoption of a host-provided instance)
// - Extension/layer negotiation, validation messenger in debug mode
// - One capability registry per physical device
// - Device creation for registries this backend owns

use ash::vk;
use std::ffi::CString;
use std::sync::Arc;

use super::capability::{extension_list, layer_list, CapabilityRegistry, SortedNameList};
use super::debug::{DebugMessageFilter, DebugMessenger};
use super::device::Device;
use super::dispatch::{DispatchTable, LoaderSource};
use super::host_alloc::{HostAllocator, HostCallbacks};
use crate::config::{ExternalContext, RuntimeConfig};
use crate::error::{Result, RuntimeError};
use crate::platform::BackendKind;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";
const DEBUG_UTILS: &str = "VK_EXT_debug_utils";
const SURFACE: &str = "VK_KHR_surface";
const PORTABILITY_ENUMERATION: &str = "VK_KHR_portability_enumeration";

/// Window-system surface extensions in preference order for this platform.
#[cfg(target_os = "windows")]
const WINDOW_EXTENSIONS: &[&str] = &["VK_KHR_win32_surface"];
#[cfg(target_os = "android")]
const WINDOW_EXTENSIONS: &[&str] = &["VK_KHR_android_surface"];
#[cfg(any(target_os = "macos", target_os = "ios"))]
const WINDOW_EXTENSIONS: &[&str] = &["VK_EXT_metal_surface"];
#[cfg(not(any(
    target_os = "windows",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
const WINDOW_EXTENSIONS: &[&str] = &[
    "VK_KHR_wayland_surface",
    "VK_KHR_xcb_surface",
    "VK_KHR_xlib_surface",
];

/// Surface extension to enable, if window-system integration is requested.
pub fn window_extension_for(
    requested: bool,
    available: &SortedNameList,
    candidates: &[&'static str],
) -> Result<Option<&'static str>> {
    if !requested {
        return Ok(None);
    }
    select_window_extension(available, candidates)
        .map(Some)
        .ok_or(RuntimeError::WindowSurfaceNotFound)
}

/// First candidate the loader supports, together with `VK_KHR_surface`.
pub fn select_window_extension(available: &SortedNameList, candidates: &[&'static str]) -> Option<&'static str> {
    if !available.contains(SURFACE) {
        return None;
    }
    candidates.iter().copied().find(|name| available.contains(name))
}

/// State shared between the backend and every device created from it.
pub(crate) struct InstanceShared {
    pub(crate) table: Arc<DispatchTable>,
    instance: ash::Instance,
    pub(crate) host: Arc<HostAllocator>,
    pub(crate) callbacks: HostCallbacks,
    pub(crate) config: RuntimeConfig,
    pub(crate) api_version: u32,
    pub(crate) extensions: SortedNameList,
    pub(crate) layers: SortedNameList,
    pub(crate) window_extension: Option<&'static str>,
    pub(crate) debug: Option<DebugMessenger>,
    owns_instance: bool,
}

impl InstanceShared {
    pub(crate) fn instance(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan instance...");
        if let Some(debug) = self.debug.take() {
            debug.destroy(Some(self.callbacks.as_vk()));
        }
        if self.owns_instance {
            unsafe { self.instance().destroy_instance(Some(self.callbacks.as_vk())) };
        }
        if self.host.live_allocations() > 0 {
            log::warn!("{} host allocations outlived the instance", self.host.live_allocations());
        }
    }
}

pub struct VulkanBackend {
    shared: Arc<InstanceShared>,
    devices: Vec<Arc<CapabilityRegistry>>,
}

impl VulkanBackend {
    /// Bootstrap the instance and enumerate physical devices.
    pub fn new(config: &RuntimeConfig, external: ExternalContext) -> Result<Self> {
        log::info!("Creating Vulkan backend: {}", config.application.name);

        let source = match external.get_instance_proc_addr {
            Some(f) => LoaderSource::External(f),
            None => LoaderSource::SharedLibrary,
        };
        let loader = DispatchTable::load(source)?;
        let capacity = config.gpu.host_allocation_capacity;
        let host = match external.upstream_allocator {
            Some(upstream) => HostAllocator::with_upstream(upstream, capacity),
            None => HostAllocator::new(capacity),
        };
        let callbacks = host.callbacks();

        let entry = loader.entry();
        #[allow(unused_unsafe)]
        let loader_version = unsafe { entry.try_enumerate_instance_version() }?
            .unwrap_or(vk::API_VERSION_1_0);
        let api_version = loader_version.min(vk::API_VERSION_1_3);
        #[allow(unused_unsafe)]
        let extensions = extension_list(&unsafe { entry.enumerate_instance_extension_properties(None) }?);
        #[allow(unused_unsafe)]
        let layers = layer_list(&unsafe { entry.enumerate_instance_layer_properties() }?);

        let window_extension =
            window_extension_for(config.gpu.window_system_integration, &extensions, WINDOW_EXTENSIONS)?;
        if let Some(selected) = window_extension {
            log::info!("Window-system integration: {}", selected);
        }

        let debug_enabled = config.debug.enabled && extensions.contains(DEBUG_UTILS);
        if config.debug.enabled && !debug_enabled {
            log::warn!("Debug mode requested but {} is unavailable", DEBUG_UTILS);
        }

        let (instance_handle, owns_instance) = match external.instance {
            Some(handle) => {
                log::info!("Adopting externally owned Vulkan instance {:?}", handle);
                (handle, false)
            }
            None => {
                let instance = Self::create_instance(
                    entry,
                    config,
                    api_version,
                    &extensions,
                    &layers,
                    window_extension,
                    debug_enabled,
                    &callbacks,
                )?;
                (instance.handle(), true)
            }
        };
        let table = loader.bind_to_instance(instance_handle);
        let instance = table.instance()?.clone();

        let debug = if debug_enabled && owns_instance {
            let filter = DebugMessageFilter::new(config.debug.suppressed_message_ids.iter().copied());
            // Messenger failure is not fatal; the instance is still usable.
            match DebugMessenger::new(entry, &instance, filter, Some(callbacks.as_vk())) {
                Ok(m) => Some(m),
                Err(e) => {
                    log::warn!("Failed to create debug messenger: {}", e);
                    None
                }
            }
        } else {
            None
        };

        // From here on the instance is torn down by InstanceShared::drop.
        let shared = Arc::new(InstanceShared {
            table,
            instance,
            host,
            callbacks,
            config: config.clone(),
            api_version,
            extensions,
            layers,
            window_extension,
            debug,
            owns_instance,
        });

        let devices = Self::enumerate_devices(&shared)?;
        log::info!("Found {} Vulkan device(s)", devices.len());

        Ok(Self { shared, devices })
    }

    #[allow(clippy::too_many_arguments)]
    fn create_instance(
        entry: &ash::Entry,
        config: &RuntimeConfig,
        api_version: u32,
        extensions: &SortedNameList,
        layers: &SortedNameList,
        window_extension: Option<&'static str>,
        debug_enabled: bool,
        callbacks: &HostCallbacks,
    ) -> Result<ash::Instance> {
        let app_name = CString::new(config.application.name.as_str())
            .map_err(|_| RuntimeError::Config("application name contains NUL".to_string()))?;
        let engine_name = CString::new("polydispatch").unwrap_or_default();

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(config.application.version.to_vk())
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut extension_names: Vec<&str> = Vec::new();
        if debug_enabled {
            extension_names.push(DEBUG_UTILS);
        }
        if let Some(window) = window_extension {
            extension_names.push(SURFACE);
            extension_names.push(window);
        }
        let mut flags = vk::InstanceCreateFlags::empty();
        if extensions.contains(PORTABILITY_ENUMERATION) {
            extension_names.push(PORTABILITY_ENUMERATION);
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let mut layer_names: Vec<&str> = Vec::new();
        if debug_enabled {
            if layers.contains(VALIDATION_LAYER) {
                layer_names.push(VALIDATION_LAYER);
            } else {
                log::warn!("{} not installed; running without validation", VALIDATION_LAYER);
            }
        }

        let extension_cstrs = to_cstrings(&extension_names);
        let layer_cstrs = to_cstrings(&layer_names);
        let extension_ptrs: Vec<_> = extension_cstrs.iter().map(|s| s.as_ptr()).collect();
        let layer_ptrs: Vec<_> = layer_cstrs.iter().map(|s| s.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extension_ptrs)
            .enabled_layer_names(&layer_ptrs);

        unsafe { entry.create_instance(&create_info, Some(callbacks.as_vk())) }
            .map_err(|e| RuntimeError::native_init("instance", config.application.name.clone(), e))
    }

    fn enumerate_devices(shared: &InstanceShared) -> Result<Vec<Arc<CapabilityRegistry>>> {
        let physical_devices = unsafe { shared.instance().enumerate_physical_devices() }
            .map_err(|e| RuntimeError::native_init("instance", "physical devices", e))?;
        physical_devices
            .into_iter()
            .enumerate()
            .map(|(index, pd)| {
                CapabilityRegistry::fetch(&shared.table, pd, index, shared.api_version).map(Arc::new)
            })
            .collect()
    }

    pub fn create_device(&self, info: &Arc<CapabilityRegistry>) -> Result<Device> {
        if !self.devices.iter().any(|d| Arc::ptr_eq(d, info)) {
            return Err(RuntimeError::init_failed(
                "device",
                info.device_name.clone(),
                "device info not owned by this backend",
            ));
        }
        Device::new(Arc::clone(&self.shared), Arc::clone(info))
    }

    pub fn device_info_list(&self) -> &[Arc<CapabilityRegistry>] {
        &self.devices
    }

    pub fn num_of_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn kind(&self) -> BackendKind {
        BackendKind::Vulkan
    }

    pub fn is_available(&self) -> bool {
        self.shared.table.is_ready() && self.devices.iter().any(|d| d.supports_compute())
    }

    pub fn api_version(&self) -> u32 {
        self.shared.api_version
    }

    pub fn window_extension(&self) -> Option<&'static str> {
        self.shared.window_extension
    }

    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.shared.extensions.contains(name)
    }

    pub fn is_layer_supported(&self, name: &str) -> bool {
        self.shared.layers.contains(name)
    }

    pub fn debug_enabled(&self) -> bool {
        self.shared.debug.is_some()
    }

    pub fn host_allocator(&self) -> &Arc<HostAllocator> {
        &self.shared.host
    }

    /// Heap usage hook for devices created by this backend.
    pub fn notify_allocation(&self, device_index: usize, heap: usize, bytes: u64) {
        if let Some(d) = self.devices.get(device_index) {
            d.notify_allocation(heap, bytes);
        }
    }

    pub fn notify_deallocation(&self, device_index: usize, heap: usize, bytes: u64) {
        if let Some(d) = self.devices.get(device_index) {
            d.notify_deallocation(heap, bytes);
        }
    }
}

fn to_cstrings(names: &[&str]) -> Vec<CString> {
    names
        .iter()
        .filter_map(|n| CString::new(*n).ok())
        .collect()
}
