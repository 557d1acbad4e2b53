//! Command layer on a real Vulkan device
//!
//! These tests require a Vulkan-capable GPU and are marked #[ignore] by default.
//! Run with: cargo test -- --ignored
//!
//! No shaders are involved: they exercise the staging path, copies and
//! barriers, the deferred replay path, and resource cleanup.

use ash::{vk, Device, Entry, Instance};
use std::ffi::CString;
use std::sync::Arc;
use vkcompute_command::{
    ComputeRecorder, DeviceRef, ExecutionMode, HostTensor, RecorderConfig, TensorAllocator,
    TransferRecorder, VulkanDevice,
};

// =============================================================================
// TEST UTILITIES
// =============================================================================

/// Minimal Vulkan context: instance, first physical device, one compute queue.
struct TestVulkanContext {
    _entry: Entry,
    instance: Instance,
    device: Arc<Device>,
    gpu: DeviceRef,
}

impl TestVulkanContext {
    fn new() -> Result<Self, String> {
        let entry = unsafe { Entry::load() }.map_err(|e| format!("Failed to load Vulkan: {:?}", e))?;

        let app_name = CString::new("vkcompute-command test").map_err(|e| e.to_string())?;
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| format!("Failed to create instance: {:?}", e))?;

        let physical_device = unsafe { instance.enumerate_physical_devices() }
            .map_err(|e| format!("Failed to enumerate devices: {:?}", e))?
            .first()
            .copied()
            .ok_or_else(|| "No Vulkan devices found".to_string())?;

        let queue_family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let compute_queue_family = queue_family_properties
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|idx| idx as u32)
            .ok_or_else(|| "No compute queue family found".to_string())?;

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_queue_family)
            .queue_priorities(&queue_priorities);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| format!("Failed to create device: {:?}", e))?;
        let device = Arc::new(device);

        // VK_KHR_push_descriptor is not enabled: recorders take the deferred path
        let gpu: DeviceRef = Arc::new(VulkanDevice::new(
            &instance,
            physical_device,
            device.clone(),
            compute_queue_family,
            false,
        ));

        Ok(Self {
            _entry: entry,
            instance,
            device,
            gpu,
        })
    }
}

impl Drop for TestVulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn config() -> RecorderConfig {
    RecorderConfig {
        device_arena_size: 4 * 1024 * 1024,
        staging_arena_size: 1024 * 1024,
        ..RecorderConfig::default()
    }
}

// =============================================================================
// INTEGRATION TESTS
// =============================================================================

#[test]
#[ignore] // Requires GPU
fn test_transfer_round_trip_on_gpu() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = TestVulkanContext::new().expect("Vulkan context");
    let allocator = TensorAllocator::new(ctx.gpu.clone(), &config()).unwrap();

    let values: Vec<f32> = (0..1024).map(|i| i as f32 * 0.5).collect();
    let host = HostTensor::from_f32(&[32, 32], &values).unwrap();

    let mut transfer = TransferRecorder::new(ctx.gpu.clone(), &allocator).unwrap();
    let tensor = transfer.record_upload(&host).unwrap();
    transfer.submit().unwrap();
    transfer.wait().unwrap();

    let slot = transfer.record_download(&tensor).unwrap();
    transfer.submit().unwrap();
    transfer.wait().unwrap();

    assert_eq!(transfer.take_download(slot).unwrap(), host);
}

#[test]
#[ignore] // Requires GPU
fn test_deferred_copy_chain_on_gpu() {
    let _ = env_logger::builder().is_test(true).try_init();
    let ctx = TestVulkanContext::new().expect("Vulkan context");
    let allocator = TensorAllocator::new(ctx.gpu.clone(), &config()).unwrap();

    let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
    let host = HostTensor::from_f32(&[4, 4, 4], &values).unwrap();

    let src = allocator.create_with_staging(&[4, 4, 4], 4).unwrap();
    let dst = allocator.create_with_staging(&[4, 4, 4], 4).unwrap();
    src.write_staging(host.data()).unwrap();

    let mut cmd = ComputeRecorder::new(ctx.gpu.clone(), &RecorderConfig::default()).unwrap();
    assert_eq!(cmd.mode(), ExecutionMode::Deferred);

    cmd.begin().unwrap();
    cmd.record_upload(&src).unwrap();
    cmd.record_upload_compute_barrier(&src).unwrap();
    cmd.record_clone(&src, &dst).unwrap();
    cmd.record_compute_download_barrier(&dst).unwrap();
    cmd.record_download(&dst).unwrap();
    cmd.submit_and_wait().unwrap();

    assert_eq!(dst.read_staging().unwrap(), host);
}
