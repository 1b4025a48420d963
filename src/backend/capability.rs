// Capability registry - per physical device snapshot
//
// Fetched once at enumeration and immutable afterwards, except for the heap
// usage counters which allocation notifications update atomically, possibly
// from driver threads.

use ash::vk;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicU64, Ordering};

use super::dispatch::DispatchTable;
use crate::error::Result;

pub(crate) const PIPELINE_EXECUTABLE_PROPERTIES: &str = "VK_KHR_pipeline_executable_properties";

const KNOWN_VENDORS: &[(u32, &str)] = &[
    (0x1002, "AMD"),
    (0x1010, "ImgTec"),
    (0x106B, "Apple"),
    (0x10DE, "NVIDIA"),
    (0x13B5, "ARM"),
    (0x5143, "Qualcomm"),
    (0x8086, "Intel"),
    (0x10005, "Mesa"),
];

pub fn vendor_name(vendor_id: u32) -> &'static str {
    KNOWN_VENDORS
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| *name)
        .unwrap_or("unknown")
}

/// Largest power of two not exceeding `limit` (1 for a zero limit).
pub fn preferred_work_group_size(limit: u32) -> u32 {
    if limit == 0 {
        1
    } else {
        1 << (31 - limit.leading_zeros())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedVersion {
    pub name: String,
    pub version: u32,
}

/// Name list sorted once so membership is a binary search.
#[derive(Debug, Clone, Default)]
pub struct SortedNameList {
    entries: Vec<NamedVersion>,
}

impl SortedNameList {
    pub fn from_unsorted(mut entries: Vec<NamedVersion>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&NamedVersion> {
        let idx = self.entries.partition_point(|e| e.name.as_str() < name);
        self.entries.get(idx).filter(|e| e.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedVersion> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn c_name(raw: &[c_char]) -> String {
    unsafe { CStr::from_ptr(raw.as_ptr()) }.to_string_lossy().into_owned()
}

pub(crate) fn extension_list(props: &[vk::ExtensionProperties]) -> SortedNameList {
    SortedNameList::from_unsorted(
        props
            .iter()
            .map(|p| NamedVersion {
                name: c_name(&p.extension_name),
                version: p.spec_version,
            })
            .collect(),
    )
}

pub(crate) fn layer_list(props: &[vk::LayerProperties]) -> SortedNameList {
    SortedNameList::from_unsorted(
        props
            .iter()
            .map(|p| NamedVersion {
                name: c_name(&p.layer_name),
                version: p.spec_version,
            })
            .collect(),
    )
}

#[derive(Debug)]
pub struct MemoryHeap {
    pub size: vk::DeviceSize,
    pub flags: vk::MemoryHeapFlags,
    used: AtomicU64,
}

impl MemoryHeap {
    pub fn new(size: vk::DeviceSize, flags: vk::MemoryHeapFlags) -> Self {
        Self {
            size,
            flags,
            used: AtomicU64::new(0),
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn is_device_local(&self) -> bool {
        self.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL)
    }

    pub(crate) fn add(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub(&self, bytes: u64) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// Optional feature/property sub-records, each fetched by its own query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureRecord {
    Subgroup {
        size: u32,
        stages: vk::ShaderStageFlags,
        operations: vk::SubgroupFeatureFlags,
    },
    Float16Int8 {
        float16: bool,
        int8: bool,
    },
    Storage8Bit {
        storage_buffer: bool,
        uniform_and_storage_buffer: bool,
    },
    Storage16Bit {
        storage_buffer: bool,
        uniform_and_storage_buffer: bool,
    },
    PipelineExecutableInfo {
        supported: bool,
    },
}

/// The executable-info feature bit was queried and found set.
pub fn pipeline_executable_info(records: &[FeatureRecord]) -> bool {
    records
        .iter()
        .any(|r| matches!(r, FeatureRecord::PipelineExecutableInfo { supported: true }))
}

pub struct CapabilityRegistry {
    pub physical_device: vk::PhysicalDevice,
    pub index: usize,
    pub vendor_id: u32,
    pub vendor_name: &'static str,
    pub device_name: String,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub memory_types: Vec<vk::MemoryType>,
    pub heaps: Vec<MemoryHeap>,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub extensions: SortedNameList,
    pub layers: SortedNameList,
    pub feature_records: Vec<FeatureRecord>,
    pub preferred_work_group_size: u32,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("index", &self.index)
            .field("device_name", &self.device_name)
            .field("vendor", &self.vendor_name)
            .field("queue_families", &self.queue_families.len())
            .field("extensions", &self.extensions.len())
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Query everything the runtime needs to know about one physical device.
    pub fn fetch(
        table: &DispatchTable,
        physical_device: vk::PhysicalDevice,
        index: usize,
        instance_api_version: u32,
    ) -> Result<Self> {
        let instance = table.instance()?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let extensions =
            extension_list(&unsafe { instance.enumerate_device_extension_properties(physical_device) }?);
        #[allow(deprecated)]
        let layers = layer_list(&unsafe { instance.enumerate_device_layer_properties(physical_device) }?);

        let memory_types = memory.memory_types[..memory.memory_type_count as usize].to_vec();
        let heaps = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .map(|h| MemoryHeap::new(h.size, h.flags))
            .collect();

        let api_version = properties.api_version.min(instance_api_version);
        let feature_records = fetch_feature_records(instance, physical_device, api_version, &extensions);

        let registry = Self {
            physical_device,
            index,
            vendor_id: properties.vendor_id,
            vendor_name: vendor_name(properties.vendor_id),
            device_name: c_name(&properties.device_name),
            preferred_work_group_size: preferred_work_group_size(
                properties.limits.max_compute_work_group_invocations,
            ),
            properties,
            features,
            memory_types,
            heaps,
            queue_families,
            extensions,
            layers,
            feature_records,
        };

        log::info!(
            "Device {}: {} ({}), API {}.{}.{}, {} queue families, preferred work-group {}",
            index,
            registry.device_name,
            registry.vendor_name,
            vk::api_version_major(api_version),
            vk::api_version_minor(api_version),
            vk::api_version_patch(api_version),
            registry.queue_families.len(),
            registry.preferred_work_group_size
        );

        Ok(registry)
    }

    /// Pipeline statistics need both the extension and its feature bit.
    pub fn supports_pipeline_statistics(&self) -> bool {
        self.is_extension_supported(PIPELINE_EXECUTABLE_PROPERTIES)
            && pipeline_executable_info(&self.feature_records)
    }

    pub fn is_extension_supported(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    pub fn is_layer_supported(&self, name: &str) -> bool {
        self.layers.contains(name)
    }

    pub fn supports_compute(&self) -> bool {
        self.queue_families
            .iter()
            .any(|f| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::COMPUTE))
    }

    pub fn subgroup_size(&self) -> Option<u32> {
        self.feature_records.iter().find_map(|r| match r {
            FeatureRecord::Subgroup { size, .. } => Some(*size),
            _ => None,
        })
    }

    /// Heap backing the first memory type allowed by `type_bits` with exactly `flags`.
    pub fn heap_for_memory(&self, type_bits: u32, flags: vk::MemoryPropertyFlags) -> Option<usize> {
        self.memory_types
            .iter()
            .enumerate()
            .filter(|(i, _)| type_bits & (1 << i) != 0)
            .find(|(_, t)| t.property_flags == flags)
            .or_else(|| {
                self.memory_types
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| type_bits & (1 << i) != 0)
                    .find(|(_, t)| t.property_flags.contains(flags))
            })
            .map(|(_, t)| t.heap_index as usize)
    }

    pub fn notify_allocation(&self, heap: usize, bytes: u64) {
        if let Some(h) = self.heaps.get(heap) {
            h.add(bytes);
        }
    }

    pub fn notify_deallocation(&self, heap: usize, bytes: u64) {
        if let Some(h) = self.heaps.get(heap) {
            h.sub(bytes);
        }
    }

    pub fn total_used(&self) -> u64 {
        self.heaps.iter().map(MemoryHeap::used).sum()
    }
}

fn available(api_version: u32, core_since: u32, extensions: &SortedNameList, name: &str) -> bool {
    api_version >= core_since || extensions.contains(name)
}

fn fetch_feature_records(
    instance: &ash::Instance,
    pd: vk::PhysicalDevice,
    api_version: u32,
    extensions: &SortedNameList,
) -> Vec<FeatureRecord> {
    let mut records = Vec::new();
    // The *2 queries themselves are core in 1.1.
    if api_version < vk::API_VERSION_1_1 {
        return records;
    }

    let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
    let mut props2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut subgroup);
    unsafe { instance.get_physical_device_properties2(pd, &mut props2) };
    records.push(FeatureRecord::Subgroup {
        size: subgroup.subgroup_size,
        stages: subgroup.supported_stages,
        operations: subgroup.supported_operations,
    });

    if available(api_version, vk::API_VERSION_1_2, extensions, "VK_KHR_shader_float16_int8") {
        let mut f16 = vk::PhysicalDeviceShaderFloat16Int8Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut f16);
        unsafe { instance.get_physical_device_features2(pd, &mut features2) };
        records.push(FeatureRecord::Float16Int8 {
            float16: f16.shader_float16 == vk::TRUE,
            int8: f16.shader_int8 == vk::TRUE,
        });
    }

    if available(api_version, vk::API_VERSION_1_2, extensions, "VK_KHR_8bit_storage") {
        let mut s8 = vk::PhysicalDevice8BitStorageFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut s8);
        unsafe { instance.get_physical_device_features2(pd, &mut features2) };
        records.push(FeatureRecord::Storage8Bit {
            storage_buffer: s8.storage_buffer8_bit_access == vk::TRUE,
            uniform_and_storage_buffer: s8.uniform_and_storage_buffer8_bit_access == vk::TRUE,
        });
    }

    if available(api_version, vk::API_VERSION_1_1, extensions, "VK_KHR_16bit_storage") {
        let mut s16 = vk::PhysicalDevice16BitStorageFeatures::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut s16);
        unsafe { instance.get_physical_device_features2(pd, &mut features2) };
        records.push(FeatureRecord::Storage16Bit {
            storage_buffer: s16.storage_buffer16_bit_access == vk::TRUE,
            uniform_and_storage_buffer: s16.uniform_and_storage_buffer16_bit_access == vk::TRUE,
        });
    }

    if extensions.contains(PIPELINE_EXECUTABLE_PROPERTIES) {
        let mut exec = vk::PhysicalDevicePipelineExecutablePropertiesFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut exec);
        unsafe { instance.get_physical_device_features2(pd, &mut features2) };
        records.push(FeatureRecord::PipelineExecutableInfo {
            supported: exec.pipeline_executable_info == vk::TRUE,
        });
    }

    records
}
