// End-to-end checks against a real Vulkan device.
//
// Every test returns early when no loader or compute-capable device exists,
// so the suite stays green on machines without a GPU.

use polydispatch::backend::queue::Capability;
use polydispatch::{
    ArgKind, BufferBinding, BufferUsage, Device, DeviceInfo, ExternalContext, KernelSignature,
    KernelSource, LaunchParams, Platform, RuntimeConfig, RuntimeError, ScalarKind, WaitTarget,
};
use polydispatch::backend::DeviceState;

/// `void main() {}` with LocalSize 1 1 1, SPIR-V 1.0.
const NOOP_SPIRV: [u32; 35] = [
    0x0723_0203, 0x0001_0000, 0, 5, 0,
    (2 << 16) | 17, 1,                          // OpCapability Shader
    (3 << 16) | 14, 0, 1,                       // OpMemoryModel Logical GLSL450
    (5 << 16) | 15, 5, 1, 0x6e69_616d, 0,       // OpEntryPoint GLCompute %1 "main"
    (6 << 16) | 16, 1, 17, 1, 1, 1,             // OpExecutionMode %1 LocalSize 1 1 1
    (2 << 16) | 19, 2,                          // %2 = OpTypeVoid
    (3 << 16) | 33, 3, 2,                       // %3 = OpTypeFunction %2
    (5 << 16) | 54, 2, 1, 0, 3,                 // %1 = OpFunction %2 None %3
    (2 << 16) | 248, 4,                         // %4 = OpLabel
    (1 << 16) | 253,                            // OpReturn
    (1 << 16) | 56,                             // OpFunctionEnd
];

fn noop_binary() -> Vec<u8> {
    NOOP_SPIRV.iter().flat_map(|w| w.to_ne_bytes()).collect()
}

fn signature() -> KernelSignature {
    KernelSignature {
        work_dim: 1,
        storage_buffers: 2,
        uniform_buffers: 1,
        local_arg_sizes: Vec::new(),
        args: vec![ArgKind::Scalar(ScalarKind::U32)],
    }
}

fn open_device(debug: bool) -> Option<(Platform, Device)> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = RuntimeConfig::default();
    config.debug.enabled = debug;
    let platform = match Platform::new(&config, ExternalContext::default()) {
        Ok(platform) => platform,
        Err(e) => {
            eprintln!("skipping: no Vulkan backend: {e}");
            return None;
        }
    };
    let info = platform.device_info_list().into_iter().find(|info| match info {
        DeviceInfo::Vulkan(registry) => registry.supports_compute(),
    })?;
    match platform.create_device(&info) {
        Ok(device) => Some((platform, device)),
        Err(e) => {
            eprintln!("skipping: device creation failed: {e}");
            None
        }
    }
}

#[test]
fn device_comes_up_with_compute_queues() {
    let Some((_platform, device)) = open_device(false) else { return };
    assert_eq!(device.state(), DeviceState::Ready);
    assert!(device.compute_queue_count() >= 1);
    let compute = device.queue_plan().get(Capability::Compute).unwrap();
    assert_eq!(compute.offset, 0);
    assert_eq!(device.fence_pool_capacity(), 1);
    assert_eq!(device.available_fences(), 1);

    device.set_fence_size(4).unwrap();
    assert_eq!(device.fence_pool_capacity(), 4);
    device.wait_for_completion(WaitTarget::Device).unwrap();
    device.wait_for_completion(WaitTarget::Queue(0)).unwrap();
    assert!(device.wait_for_completion(WaitTarget::Queue(usize::MAX)).is_err());

    let watch = device.state_watch();
    drop(device);
    assert_eq!(watch.get(), DeviceState::Destroyed);
}

#[test]
fn kernels_are_cached_and_laid_out() {
    let Some((_platform, device)) = open_device(true) else { return };
    let binary = noop_binary();
    let source = KernelSource {
        binary: &binary,
        module_name: "noop",
        entry_point: "main",
        signature: signature(),
    };
    let first = device.create_kernel(&source).unwrap();
    let second = device.create_kernel(&source).unwrap();
    assert!(first.same_as(&second));
    assert_eq!(device.module_count(), 1);
    assert_eq!(device.kernel_count(), 1);
    assert_eq!(first.name(), "noop_main");

    let layout = first.layout();
    let bindings: Vec<_> = layout.bindings.iter().map(|b| (b.binding, b.ty)).collect();
    assert_eq!(
        bindings,
        vec![
            (0, ash::vk::DescriptorType::STORAGE_BUFFER),
            (1, ash::vk::DescriptorType::STORAGE_BUFFER),
            (2, ash::vk::DescriptorType::UNIFORM_BUFFER),
        ]
    );
    assert_eq!(layout.specialization_data.len(), 2);
    assert_eq!(layout.specialization_data[1], 1);
}

#[test]
fn launch_round_trips_fences() {
    let Some((_platform, device)) = open_device(true) else { return };
    let binary = noop_binary();
    let kernel = device
        .create_kernel(&KernelSource {
            binary: &binary,
            module_name: "noop",
            entry_point: "main",
            signature: signature(),
        })
        .unwrap();

    let input = device.create_buffer::<f32>("input", 64, BufferUsage::PREFER_DEVICE).unwrap();
    let output = device.create_buffer::<f32>("output", 64, BufferUsage::PREFER_DEVICE).unwrap();
    let params_buf = device.create_buffer::<u32>("params", 4, BufferUsage::PREFER_HOST).unwrap();
    let count = 64u32.to_ne_bytes();

    let params = LaunchParams {
        global_size: [64, 1, 1],
        storage_buffers: vec![BufferBinding::from(&input), BufferBinding::from(&output)],
        uniform_buffers: vec![BufferBinding::from(&params_buf)],
        args: vec![&count[..]],
        queue_index: 0,
    };

    let mut submission = device.launch(&kernel, &params).unwrap();
    assert_eq!(device.available_fences(), 0);

    // The only fence is in flight.
    match device.launch(&kernel, &params) {
        Err(RuntimeError::AvailableFenceNotFound { capacity }) => assert_eq!(capacity, 1),
        other => panic!("expected fence exhaustion, got {other:?}"),
    }

    device
        .wait_for_completion(WaitTarget::Submission(&mut submission))
        .unwrap();
    assert!(submission.is_complete().unwrap());
    assert_eq!(device.available_fences(), 1);

    // Dropping an unwaited submission blocks until it finishes.
    drop(device.launch(&kernel, &params).unwrap());
    assert_eq!(device.available_fences(), 1);

    let missing_uniform = LaunchParams {
        global_size: [64, 1, 1],
        storage_buffers: vec![BufferBinding::from(&input), BufferBinding::from(&output)],
        uniform_buffers: Vec::new(),
        args: vec![&count[..]],
        queue_index: 0,
    };
    assert!(device.launch(&kernel, &missing_uniform).is_err());

    let bad_queue = LaunchParams {
        queue_index: device.compute_queue_count(),
        ..params
    };
    assert!(device.launch(&kernel, &bad_queue).is_err());
    assert_eq!(device.available_fences(), 1);
}

#[test]
fn buffers_move_data_and_track_heap_usage() {
    let Some((_platform, device)) = open_device(false) else { return };
    let before = device.device_info().total_used();

    let host = device.create_buffer::<u32>("host", 256, BufferUsage::PREFER_HOST).unwrap();
    let gpu = device.create_buffer::<u32>("gpu", 256, BufferUsage::PREFER_DEVICE).unwrap();
    assert!(device.device_info().total_used() > before);

    let data: Vec<u32> = (0..256).collect();
    host.write(&data).unwrap();
    assert_eq!(host.read().unwrap(), data);

    gpu.copy_from(&host).unwrap();
    assert_eq!(gpu.read().unwrap(), data);

    gpu.fill(0xdead_beef).unwrap();
    gpu.view(10..20).unwrap().fill(0).unwrap();
    let filled = gpu.read().unwrap();
    assert!(filled[..10].iter().all(|&v| v == 0xdead_beef));
    assert!(filled[10..20].iter().all(|&v| v == 0));
    assert!(filled[20..].iter().all(|&v| v == 0xdead_beef));

    let bytes = host.reinterpret::<u8>().unwrap();
    assert_eq!(bytes.len(), 1024);
    assert!(host.view(200..300).is_err());

    drop(host);
    drop(bytes);
    drop(gpu);
    assert_eq!(device.device_info().total_used(), before);
}
