// Compute pipeline creation and caching
//
// A kernel is a shader module entry point bound to a descriptor set layout
// (storage buffers first, then uniform buffers), a pipeline layout with a
// fixed push-constant range, and specialization constants:
//   [work-group size per dimension..., work dimension, local arg sizes...]
// each a 4-byte constant at consecutive offsets.

use ash::vk;
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::Arc;

use super::capability::c_name;
use super::debug::ObjectNamer;
use super::shader::{spirv_words, stable_hash, ShaderModuleEntry};
use crate::error::{Result, RuntimeError};

/// Push constant bytes available to kernel arguments.
pub const PUSH_CONSTANT_SIZE: u32 = 128;

/// Scalar element types a kernel argument can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    I32,
    U32,
    F32,
    I64,
    U64,
    F64,
}

impl ScalarKind {
    pub fn size(self) -> u32 {
        match self {
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 4,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 8,
        }
    }
}

/// Plain-data kernel argument passed through push constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Scalar(ScalarKind),
    /// 2, 3 or 4 lanes.
    Vector(ScalarKind, u32),
}

impl ArgKind {
    fn size(self) -> u32 {
        match self {
            ArgKind::Scalar(s) => s.size(),
            ArgKind::Vector(s, lanes) => s.size() * lanes,
        }
    }

    /// std430: vec2 aligns to two scalars, vec3 and vec4 to four.
    fn alignment(self) -> u32 {
        match self {
            ArgKind::Scalar(s) => s.size(),
            ArgKind::Vector(s, 2) => s.size() * 2,
            ArgKind::Vector(s, _) => s.size() * 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgField {
    pub offset: u32,
    pub size: u32,
    pub alignment: u32,
}

/// Byte layout of a kernel's push-constant argument block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgLayout {
    pub fields: Vec<ArgField>,
    pub size: u32,
    pub alignment: u32,
}

fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

impl ArgLayout {
    pub fn compute(args: &[ArgKind]) -> Result<Self> {
        let mut offset = 0;
        let mut max_align = 1;
        let mut fields = Vec::with_capacity(args.len());
        for (i, &arg) in args.iter().enumerate() {
            if let ArgKind::Vector(_, lanes) = arg {
                if !(2..=4).contains(&lanes) {
                    return Err(RuntimeError::init_failed(
                        "argument layout",
                        i.to_string(),
                        format!("vector with {} lanes", lanes),
                    ));
                }
            }
            let alignment = arg.alignment();
            offset = align_up(offset, alignment);
            fields.push(ArgField {
                offset,
                size: arg.size(),
                alignment,
            });
            offset += arg.size();
            max_align = max_align.max(alignment);
        }
        Ok(Self {
            fields,
            size: align_up(offset, max_align),
            alignment: max_align,
        })
    }

    /// Write each field's bytes at its offset; padding is zero.
    pub fn pack(&self, values: &[&[u8]]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(RuntimeError::init_failed(
                "argument block",
                format!("{} values", values.len()),
                format!("kernel takes {} arguments", self.fields.len()),
            ));
        }
        let mut out = vec![0u8; self.size as usize];
        for (i, (field, bytes)) in self.fields.iter().zip(values).enumerate() {
            if bytes.len() != field.size as usize {
                return Err(RuntimeError::init_failed(
                    "argument block",
                    i.to_string(),
                    format!("expected {} bytes, got {}", field.size, bytes.len()),
                ));
            }
            let start = field.offset as usize;
            out[start..start + bytes.len()].copy_from_slice(bytes);
        }
        Ok(out)
    }
}

/// Argument shape of a compiled kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSignature {
    pub work_dim: u32,
    pub storage_buffers: u32,
    pub uniform_buffers: u32,
    /// Byte size of each work-group local argument.
    pub local_arg_sizes: Vec<u32>,
    pub args: Vec<ArgKind>,
}

/// Split a power-of-two work-group size across `work_dim` dimensions.
pub fn work_group_size(preferred: u32, work_dim: u32) -> Vec<u32> {
    let bits = preferred.max(1).trailing_zeros();
    (0..work_dim)
        .map(|d| {
            let extra = u32::from(d < bits % work_dim);
            1 << (bits / work_dim + extra)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecializationEntry {
    pub constant_id: u32,
    pub offset: u32,
    pub size: u32,
}

/// Everything about a kernel's binary interface that can be derived without
/// touching the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLayout {
    pub work_dim: u32,
    pub work_group_size: Vec<u32>,
    pub bindings: Vec<DescriptorBinding>,
    pub specialization: Vec<SpecializationEntry>,
    pub specialization_data: Vec<u32>,
    pub args: ArgLayout,
}

impl KernelLayout {
    pub fn new(name: &str, signature: &KernelSignature, preferred_work_group: u32) -> Result<Self> {
        if !(1..=3).contains(&signature.work_dim) {
            return Err(RuntimeError::init_failed(
                "kernel",
                name,
                format!("work dimension {} outside 1..=3", signature.work_dim),
            ));
        }

        let storage = (0..signature.storage_buffers).map(|binding| DescriptorBinding {
            binding,
            ty: vk::DescriptorType::STORAGE_BUFFER,
        });
        let uniform = (0..signature.uniform_buffers).map(|i| DescriptorBinding {
            binding: signature.storage_buffers + i,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
        });
        let bindings = storage.chain(uniform).collect();

        let work_group_size = work_group_size(preferred_work_group, signature.work_dim);
        let mut specialization_data = work_group_size.clone();
        specialization_data.push(signature.work_dim);
        specialization_data.extend_from_slice(&signature.local_arg_sizes);
        let specialization = (0..specialization_data.len() as u32)
            .map(|i| SpecializationEntry {
                constant_id: i,
                offset: i * 4,
                size: 4,
            })
            .collect();

        let args = ArgLayout::compute(&signature.args)?;
        if args.size > PUSH_CONSTANT_SIZE {
            return Err(RuntimeError::init_failed(
                "kernel",
                name,
                format!("arguments need {} bytes, push range is {}", args.size, PUSH_CONSTANT_SIZE),
            ));
        }

        Ok(Self {
            work_dim: signature.work_dim,
            work_group_size,
            bindings,
            specialization,
            specialization_data,
            args,
        })
    }

    pub fn descriptor_count(&self, ty: vk::DescriptorType) -> u32 {
        self.bindings.iter().filter(|b| b.ty == ty).count() as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHandles {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
}

#[derive(Debug)]
pub struct KernelEntry {
    pub id: u64,
    pub name: String,
    pub module: Arc<ShaderModuleEntry>,
    pub layout: KernelLayout,
    pub handles: KernelHandles,
}

impl KernelEntry {
    pub fn qualified_name(&self) -> String {
        format!("{}_{}", self.module.name, self.name)
    }
}

pub fn kernel_id(module_name: &str, kernel_name: &str) -> u64 {
    stable_hash(&[module_name, kernel_name])
}

/// Native object construction behind the module and kernel caches.
pub trait KernelBuilder {
    fn create_module(&self, name: &str, binary: &[u8]) -> Result<vk::ShaderModule>;
    fn destroy_module(&self, module: vk::ShaderModule);
    fn create_kernel(
        &self,
        module: &ShaderModuleEntry,
        kernel_name: &str,
        layout: &KernelLayout,
    ) -> Result<KernelHandles>;
    fn destroy_kernel(&self, handles: &KernelHandles);
}

#[derive(Debug, Default)]
pub struct KernelCache {
    entries: HashMap<u64, Arc<KernelEntry>>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<B: KernelBuilder + ?Sized>(
        &mut self,
        builder: &B,
        module: &Arc<ShaderModuleEntry>,
        kernel_name: &str,
        signature: &KernelSignature,
        preferred_work_group: u32,
    ) -> Result<Arc<KernelEntry>> {
        let id = kernel_id(&module.name, kernel_name);
        if let Some(entry) = self.entries.get(&id) {
            log::debug!("Kernel cache hit: {}_{}", module.name, kernel_name);
            return Ok(Arc::clone(entry));
        }

        let qualified = format!("{}_{}", module.name, kernel_name);
        let layout = KernelLayout::new(&qualified, signature, preferred_work_group)?;
        let handles = builder.create_kernel(module, kernel_name, &layout)?;
        let entry = Arc::new(KernelEntry {
            id,
            name: kernel_name.to_string(),
            module: Arc::clone(module),
            layout,
            handles,
        });
        self.entries.insert(id, Arc::clone(&entry));
        log::debug!("Created kernel {} ({:#018x})", qualified, id);
        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn destroy_all<B: KernelBuilder + ?Sized>(&mut self, builder: &B) {
        for (_, entry) in self.entries.drain() {
            builder.destroy_kernel(&entry.handles);
        }
    }
}

/// `KernelBuilder` over a real logical device.
pub struct NativeKernelBuilder<'a> {
    pub device: &'a ash::Device,
    pub callbacks: Option<&'a vk::AllocationCallbacks>,
    pub namer: &'a ObjectNamer,
    /// Loaded when pipeline statistics should be captured.
    pub statistics: Option<&'a vk::KhrPipelineExecutablePropertiesFn>,
}

impl NativeKernelBuilder<'_> {
    fn create_set_layout(&self, name: &str, layout: &KernelLayout) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = layout
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.ty)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        unsafe { self.device.create_descriptor_set_layout(&info, self.callbacks) }
            .map_err(|e| RuntimeError::native_init("descriptor set layout", name, e))
    }

    fn create_pipeline_layout(
        &self,
        name: &str,
        set_layout: vk::DescriptorSetLayout,
    ) -> Result<vk::PipelineLayout> {
        let push_constant_ranges = [vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)
            .build()];
        let set_layouts = [set_layout];
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        unsafe { self.device.create_pipeline_layout(&info, self.callbacks) }
            .map_err(|e| RuntimeError::native_init("pipeline layout", name, e))
    }

    fn create_pipeline(
        &self,
        name: &str,
        module: vk::ShaderModule,
        entry_point: &str,
        pipeline_layout: vk::PipelineLayout,
        layout: &KernelLayout,
    ) -> Result<vk::Pipeline> {
        let map_entries: Vec<_> = layout
            .specialization
            .iter()
            .map(|e| vk::SpecializationMapEntry {
                constant_id: e.constant_id,
                offset: e.offset,
                size: e.size as usize,
            })
            .collect();
        let specialization_info = vk::SpecializationInfo::builder()
            .map_entries(&map_entries)
            .data(bytemuck::cast_slice(&layout.specialization_data));

        let entry_point = CString::new(entry_point)
            .map_err(|_| RuntimeError::init_failed("pipeline", name, "entry point contains NUL"))?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(&entry_point)
            .specialization_info(&specialization_info)
            .build();

        let flags = if self.statistics.is_some() {
            vk::PipelineCreateFlags::CAPTURE_STATISTICS_KHR
        } else {
            vk::PipelineCreateFlags::empty()
        };
        let info = vk::ComputePipelineCreateInfo::builder()
            .flags(flags)
            .stage(stage)
            .layout(pipeline_layout)
            .build();

        let pipelines = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[info], self.callbacks)
        }
        .map_err(|(_, e)| RuntimeError::native_init("pipeline", name, e))?;
        Ok(pipelines[0])
    }

    fn log_statistics(&self, name: &str, pipeline: vk::Pipeline) {
        let Some(fns) = self.statistics else { return };
        let device = self.device.handle();
        let pipeline_info = vk::PipelineInfoKHR::builder().pipeline(pipeline);

        let executables = unsafe {
            two_call(|count, data| {
                (fns.get_pipeline_executable_properties_khr)(device, &*pipeline_info, count, data)
            })
        };
        let executables: Vec<vk::PipelineExecutablePropertiesKHR> = match executables {
            Ok(v) => v,
            Err(e) => {
                log::debug!("Pipeline statistics unavailable for {}: {}", name, e);
                return;
            }
        };

        for (index, executable) in executables.iter().enumerate() {
            let info = vk::PipelineExecutableInfoKHR::builder()
                .pipeline(pipeline)
                .executable_index(index as u32);
            let stats: Vec<vk::PipelineExecutableStatisticKHR> = match unsafe {
                two_call(|count, data| {
                    (fns.get_pipeline_executable_statistics_khr)(device, &*info, count, data)
                })
            } {
                Ok(v) => v,
                Err(_) => continue,
            };
            log::debug!("{} [{}]", name, c_name(&executable.name));
            for stat in stats {
                let value = unsafe {
                    match stat.format {
                        vk::PipelineExecutableStatisticFormatKHR::BOOL32 => stat.value.b32.to_string(),
                        vk::PipelineExecutableStatisticFormatKHR::INT64 => stat.value.i64.to_string(),
                        vk::PipelineExecutableStatisticFormatKHR::UINT64 => stat.value.u64.to_string(),
                        vk::PipelineExecutableStatisticFormatKHR::FLOAT64 => stat.value.f64.to_string(),
                        _ => "?".to_string(),
                    }
                };
                log::debug!("    {}: {}", c_name(&stat.name), value);
            }
        }
    }
}

/// Size-then-fill enumeration over a raw Vulkan query.
unsafe fn two_call<T: Default + Clone>(
    mut query: impl FnMut(*mut u32, *mut T) -> vk::Result,
) -> std::result::Result<Vec<T>, vk::Result> {
    let mut count = 0u32;
    query(&mut count, std::ptr::null_mut()).result()?;
    let mut data = vec![T::default(); count as usize];
    query(&mut count, data.as_mut_ptr()).result()?;
    data.truncate(count as usize);
    Ok(data)
}

impl KernelBuilder for NativeKernelBuilder<'_> {
    fn create_module(&self, name: &str, binary: &[u8]) -> Result<vk::ShaderModule> {
        let words = spirv_words(binary)?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let module = unsafe { self.device.create_shader_module(&info, self.callbacks) }
            .map_err(|e| RuntimeError::native_init("shader module", name, e))?;
        self.namer.name(module, name);
        Ok(module)
    }

    fn destroy_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, self.callbacks) };
    }

    fn create_kernel(
        &self,
        module: &ShaderModuleEntry,
        kernel_name: &str,
        layout: &KernelLayout,
    ) -> Result<KernelHandles> {
        let name = format!("{}_{}", module.name, kernel_name);

        let descriptor_set_layout = self.create_set_layout(&name, layout)?;
        let pipeline_layout = match self.create_pipeline_layout(&name, descriptor_set_layout) {
            Ok(l) => l,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_set_layout(descriptor_set_layout, self.callbacks) };
                return Err(e);
            }
        };
        let pipeline = match self.create_pipeline(&name, module.handle, kernel_name, pipeline_layout, layout) {
            Ok(p) => p,
            Err(e) => unsafe {
                self.device.destroy_pipeline_layout(pipeline_layout, self.callbacks);
                self.device.destroy_descriptor_set_layout(descriptor_set_layout, self.callbacks);
                return Err(e);
            },
        };

        self.namer.name(descriptor_set_layout, &format!("{}_descriptor_set_layout", name));
        self.namer.name(pipeline_layout, &format!("{}_pipeline_layout", name));
        self.namer.name(pipeline, &format!("{}_pipeline", name));
        self.log_statistics(&name, pipeline);

        Ok(KernelHandles {
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
        })
    }

    fn destroy_kernel(&self, handles: &KernelHandles) {
        unsafe {
            self.device.destroy_pipeline(handles.pipeline, self.callbacks);
            self.device.destroy_pipeline_layout(handles.pipeline_layout, self.callbacks);
            self.device
                .destroy_descriptor_set_layout(handles.descriptor_set_layout, self.callbacks);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::shader::{module_id, ShaderModuleCache};
    use ash::vk::Handle;
    use std::cell::Cell;

    #[derive(Default)]
    pub(crate) struct CountingBuilder {
        next: Cell<u64>,
        pub modules_built: Cell<usize>,
        pub modules_destroyed: Cell<usize>,
        pub kernels_built: Cell<usize>,
        pub kernels_destroyed: Cell<usize>,
    }

    impl CountingBuilder {
        fn next(&self) -> u64 {
            self.next.set(self.next.get() + 1);
            self.next.get()
        }
    }

    impl KernelBuilder for CountingBuilder {
        fn create_module(&self, _name: &str, _binary: &[u8]) -> Result<vk::ShaderModule> {
            self.modules_built.set(self.modules_built.get() + 1);
            Ok(vk::ShaderModule::from_raw(self.next()))
        }

        fn destroy_module(&self, _module: vk::ShaderModule) {
            self.modules_destroyed.set(self.modules_destroyed.get() + 1);
        }

        fn create_kernel(&self, _: &ShaderModuleEntry, _: &str, _: &KernelLayout) -> Result<KernelHandles> {
            self.kernels_built.set(self.kernels_built.get() + 1);
            Ok(KernelHandles {
                descriptor_set_layout: vk::DescriptorSetLayout::from_raw(self.next()),
                pipeline_layout: vk::PipelineLayout::from_raw(self.next()),
                pipeline: vk::Pipeline::from_raw(self.next()),
            })
        }

        fn destroy_kernel(&self, _handles: &KernelHandles) {
            self.kernels_destroyed.set(self.kernels_destroyed.get() + 1);
        }
    }

    fn signature(work_dim: u32, storage: u32, uniform: u32, locals: &[u32]) -> KernelSignature {
        KernelSignature {
            work_dim,
            storage_buffers: storage,
            uniform_buffers: uniform,
            local_arg_sizes: locals.to_vec(),
            args: Vec::new(),
        }
    }

    #[test]
    fn bindings_put_storage_before_uniform() {
        let layout = KernelLayout::new("k", &signature(1, 2, 1, &[]), 256).unwrap();
        assert_eq!(
            layout.bindings,
            vec![
                DescriptorBinding { binding: 0, ty: vk::DescriptorType::STORAGE_BUFFER },
                DescriptorBinding { binding: 1, ty: vk::DescriptorType::STORAGE_BUFFER },
                DescriptorBinding { binding: 2, ty: vk::DescriptorType::UNIFORM_BUFFER },
            ]
        );
        // one work-group component, the dimension, no locals
        assert_eq!(layout.specialization_data, vec![256, 1]);
        assert_eq!(layout.specialization.len(), 2);
    }

    #[test]
    fn specialization_entries_are_consecutive_words() {
        let layout = KernelLayout::new("k", &signature(3, 1, 0, &[64, 128]), 256).unwrap();
        assert_eq!(layout.specialization_data, vec![8, 8, 4, 3, 64, 128]);
        for (i, e) in layout.specialization.iter().enumerate() {
            assert_eq!(*e, SpecializationEntry { constant_id: i as u32, offset: 4 * i as u32, size: 4 });
        }
    }

    #[test]
    fn work_group_split_preserves_product() {
        for preferred in [1u32, 2, 64, 256, 1024] {
            for dim in 1..=3 {
                let sizes = work_group_size(preferred, dim);
                assert_eq!(sizes.len(), dim as usize);
                assert_eq!(sizes.iter().product::<u32>(), preferred);
            }
        }
        assert_eq!(work_group_size(1024, 2), vec![32, 32]);
    }

    #[test]
    fn bad_work_dim_rejected() {
        assert!(KernelLayout::new("k", &signature(0, 1, 0, &[]), 64).is_err());
        assert!(KernelLayout::new("k", &signature(4, 1, 0, &[]), 64).is_err());
    }

    #[test]
    fn arg_layout_follows_std430() {
        use ScalarKind::*;
        let layout = ArgLayout::compute(&[
            ArgKind::Scalar(F32),
            ArgKind::Vector(F32, 2),
            ArgKind::Vector(F32, 3),
            ArgKind::Scalar(U32),
            ArgKind::Scalar(F64),
        ])
        .unwrap();
        let offsets: Vec<_> = layout.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 28, 32]);
        assert_eq!(layout.size, 48);
        assert_eq!(layout.alignment, 16);
    }

    #[test]
    fn arg_pack_places_bytes_and_zeroes_padding() {
        let layout = ArgLayout::compute(&[
            ArgKind::Scalar(ScalarKind::U32),
            ArgKind::Vector(ScalarKind::U32, 2),
        ])
        .unwrap();
        let a = 7u32.to_ne_bytes();
        let b: [u8; 8] = bytemuck::cast([1u32, 2u32]);
        let blob = layout.pack(&[&a[..], &b[..]]).unwrap();
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[0..4], &a);
        assert_eq!(&blob[4..8], &[0, 0, 0, 0]);
        assert_eq!(&blob[8..16], &b);
        assert!(layout.pack(&[&a[..]]).is_err());
        assert!(layout.pack(&[&a[..], &a[..]]).is_err());
    }

    #[test]
    fn oversized_arguments_rejected() {
        let mut sig = signature(1, 0, 0, &[]);
        sig.args = vec![ArgKind::Vector(ScalarKind::F64, 4); 5];
        assert!(KernelLayout::new("k", &sig, 64).is_err());
    }

    #[test]
    fn kernel_built_once_per_module_and_name() {
        let builder = CountingBuilder::default();
        let mut modules = ShaderModuleCache::new();
        let mut kernels = KernelCache::new();

        let module = modules.get_or_create(&builder, module_id("blur"), &[0; 4], "blur").unwrap();
        let sig = signature(1, 2, 1, &[]);
        let a = kernels.get_or_create(&builder, &module, "main", &sig, 64).unwrap();
        let again = modules.get_or_create(&builder, module_id("blur"), &[0; 4], "blur").unwrap();
        let b = kernels.get_or_create(&builder, &again, "main", &sig, 64).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.handles, b.handles);
        assert_eq!(builder.kernels_built.get(), 1);
        assert_eq!(builder.modules_built.get(), 1);
        assert_eq!(a.qualified_name(), "blur_main");

        let other = kernels.get_or_create(&builder, &module, "sharpen", &sig, 64).unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
        assert_eq!(builder.kernels_built.get(), 2);

        kernels.destroy_all(&builder);
        modules.destroy_all(&builder);
        assert_eq!(builder.kernels_destroyed.get(), 2);
        assert_eq!(builder.modules_destroyed.get(), 1);
    }
}
