// Dispatch table - resolved Vulkan entry points
//
// Three scopes: the loader entry (global commands), an instance-level table
// and a device-level table. Binding to a narrower scope produces a new table
// that shares the loaded library with its parent, so the backend and every
// device it creates hold their own `Arc<DispatchTable>`. Device functions are
// resolved once, by `create_device`, and the device table adopts them.

use ash::{vk, Entry};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};

/// Where the root `vkGetInstanceProcAddr` comes from
#[derive(Clone, Copy)]
pub enum LoaderSource {
    /// Load the platform Vulkan loader library.
    SharedLibrary,
    /// Use an entry point supplied by a host that already loaded Vulkan.
    External(vk::PFN_vkGetInstanceProcAddr),
}

#[derive(Clone)]
pub struct DispatchTable {
    entry: Entry,
    instance: Option<ash::Instance>,
    device: Option<ash::Device>,
}

impl DispatchTable {
    pub fn load(source: LoaderSource) -> Result<Arc<Self>> {
        let entry = match source {
            LoaderSource::SharedLibrary => unsafe { Entry::load() }
                .map_err(|e| RuntimeError::LibraryNotFound(e.to_string()))?,
            LoaderSource::External(get_instance_proc_addr) => unsafe {
                Entry::from_static_fn(vk::StaticFn { get_instance_proc_addr })
            },
        };
        log::debug!("Vulkan loader resolved");
        Ok(Arc::new(Self {
            entry,
            instance: None,
            device: None,
        }))
    }

    /// Instance-scoped table sharing this table's loader.
    pub fn bind_to_instance(&self, instance: vk::Instance) -> Arc<Self> {
        let instance = unsafe { ash::Instance::load(self.entry.static_fn(), instance) };
        Arc::new(Self {
            entry: self.entry.clone(),
            instance: Some(instance),
            device: None,
        })
    }

    /// Device-scoped table around the functions `create_device` resolved.
    /// The instance table must already be bound.
    pub fn bind_to_device(&self, device: &ash::Device) -> Result<Arc<Self>> {
        let instance = self.instance()?;
        Ok(Arc::new(Self {
            entry: self.entry.clone(),
            instance: Some(instance.clone()),
            device: Some(device.clone()),
        }))
    }

    /// Global commands plus instance creation are resolvable.
    pub fn is_ready(&self) -> bool {
        // Every loaded entry can at least report the loader version.
        #[allow(unused_unsafe)]
        let version = unsafe { self.entry.try_enumerate_instance_version() };
        version.is_ok()
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn instance(&self) -> Result<&ash::Instance> {
        self.instance
            .as_ref()
            .ok_or_else(|| RuntimeError::init_failed("dispatch table", "instance", "not bound to an instance"))
    }

    pub fn device(&self) -> Result<&ash::Device> {
        self.device
            .as_ref()
            .ok_or_else(|| RuntimeError::init_failed("dispatch table", "device", "not bound to a device"))
    }

    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::raw::c_char;

    unsafe extern "system" fn resolve_nothing(_: vk::Instance, _: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    fn loader() -> Arc<DispatchTable> {
        DispatchTable::load(LoaderSource::External(resolve_nothing)).unwrap()
    }

    #[test]
    fn external_loader_is_ready_without_instance() {
        let table = loader();
        assert!(table.is_ready());
        assert!(!table.has_instance());
        assert!(!table.has_device());
        assert!(table.instance().is_err());
        assert!(table.device().is_err());
    }

    #[test]
    fn instance_scope_narrows_without_device() {
        let table = loader().bind_to_instance(vk::Instance::null());
        assert!(table.has_instance());
        assert!(!table.has_device());
        assert_eq!(table.instance().unwrap().handle(), vk::Instance::null());
        assert!(matches!(
            table.device(),
            Err(RuntimeError::InitializationFailed { object: "dispatch table", .. })
        ));
    }
}
