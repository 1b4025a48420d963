// =============================================================================
// POLYDISPATCH - device inspection tool
// =============================================================================
//
// Brings up every enabled backend, lists the devices it found and, for each
// device with a compute queue, creates a logical device and reports the
// negotiated queue layout.
//
// Usage: polydispatch [config.toml]
//
// =============================================================================

use anyhow::{Context, Result};
use log::LevelFilter;
use polydispatch::config::RuntimeConfig;
use polydispatch::platform::{DeviceInfo, Platform};
use polydispatch::{ExternalContext, RuntimeError};

fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load_from_path(&path)
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => RuntimeConfig::load(),
    };

    init_logging(&config);
    log::info!(
        "Starting {} (debug {})",
        config.application.name,
        if config.debug.enabled { "on" } else { "off" }
    );

    let platform = match Platform::new(&config, ExternalContext::default()) {
        Ok(platform) => platform,
        Err(e @ RuntimeError::LibraryNotFound(_)) => {
            log::warn!("{}", e);
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to bring up backends"),
    };
    let devices = platform.device_info_list();
    if devices.is_empty() {
        log::warn!("No devices available");
        return Ok(());
    }

    for info in &devices {
        report(&platform, info)?;
    }
    Ok(())
}

fn init_logging(config: &RuntimeConfig) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(if config.debug.enabled {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    // RUST_LOG still wins when set.
    builder.parse_default_env();
    builder.init();
}

fn report(platform: &Platform, info: &DeviceInfo) -> Result<()> {
    let DeviceInfo::Vulkan(registry) = info;
    println!(
        "[{}] {} #{}: {} ({})",
        info.kind(),
        info.name(),
        info.index(),
        registry.vendor_name,
        format_version(registry.properties.api_version)
    );
    println!(
        "    preferred work-group {}, subgroup {:?}, {} extensions",
        registry.preferred_work_group_size,
        registry.subgroup_size(),
        registry.extensions.len()
    );
    for (i, heap) in registry.heaps.iter().enumerate() {
        println!(
            "    heap {}: {} MiB{}",
            i,
            heap.size >> 20,
            if heap.is_device_local() { " (device local)" } else { "" }
        );
    }

    if !registry.supports_compute() {
        println!("    no compute queue family, skipping");
        return Ok(());
    }

    let device = platform
        .create_device(info)
        .with_context(|| format!("Failed to create device {}", info.name()))?;
    for a in device.queue_plan().assignments() {
        println!(
            "    {} -> family {} queues {}..{}",
            a.capability.name(),
            a.family_index,
            a.first_queue,
            a.first_queue + a.queue_count
        );
    }
    println!("    fence pool: {}", device.fence_pool_capacity());
    Ok(())
}

fn format_version(version: u32) -> String {
    format!(
        "Vulkan {}.{}.{}",
        ash::vk::api_version_major(version),
        ash::vk::api_version_minor(version),
        ash::vk::api_version_patch(version)
    )
}
