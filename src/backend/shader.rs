// Shader module loading and caching
//
// Vulkan uses SPIR-V bytecode for shaders. Modules are content-addressed by a
// stable hash of their name, so each one is created at most once per device.

use ash::vk;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use super::pipeline::KernelBuilder;
use crate::error::{Result, RuntimeError};

/// 64-bit FNV-1a over a sequence of names, stable across processes.
pub fn stable_hash(parts: &[&str]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for b in part.bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0100_0000_01b3);
        }
        // separator so ("ab", "c") and ("a", "bc") differ
        h ^= 0xff;
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

pub fn module_id(module_name: &str) -> u64 {
    stable_hash(&[module_name])
}

/// SPIR-V bytes as 32-bit words, copying only when the input is misaligned.
pub fn spirv_words(code: &[u8]) -> Result<Cow<'_, [u32]>> {
    if code.len() % 4 != 0 || code.is_empty() {
        return Err(RuntimeError::init_failed(
            "shader module",
            format!("{} bytes", code.len()),
            "SPIR-V size is not a non-zero multiple of 4",
        ));
    }
    Ok(match bytemuck::try_cast_slice::<u8, u32>(code) {
        Ok(words) => Cow::Borrowed(words),
        Err(_) => Cow::Owned(
            code.chunks_exact(4)
                .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    })
}

#[derive(Debug)]
pub struct ShaderModuleEntry {
    pub id: u64,
    pub name: String,
    pub handle: vk::ShaderModule,
}

#[derive(Debug, Default)]
pub struct ShaderModuleCache {
    entries: HashMap<u64, Arc<ShaderModuleEntry>>,
}

impl ShaderModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<B: KernelBuilder + ?Sized>(
        &mut self,
        builder: &B,
        id: u64,
        binary: &[u8],
        name: &str,
    ) -> Result<Arc<ShaderModuleEntry>> {
        if let Some(entry) = self.entries.get(&id) {
            log::debug!("Shader module cache hit: {}", name);
            return Ok(Arc::clone(entry));
        }
        let handle = builder.create_module(name, binary)?;
        let entry = Arc::new(ShaderModuleEntry {
            id,
            name: name.to_string(),
            handle,
        });
        self.entries.insert(id, Arc::clone(&entry));
        log::debug!("Created shader module {} ({:#018x})", name, id);
        Ok(entry)
    }

    pub fn get(&self, id: u64) -> Option<&Arc<ShaderModuleEntry>> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Destroy every module. Kernels built from them must be gone already.
    pub fn destroy_all<B: KernelBuilder + ?Sized>(&mut self, builder: &B) {
        for (_, entry) in self.entries.drain() {
            builder.destroy_module(entry.handle);
        }
    }
}
