//! TransferRecorder against the software device
//!
//! # Test Coverage
//!
//! 1. **Staging layout** - prefix-sum offsets regardless of direction
//! 2. **Batching** - one staging buffer and one submission per cycle
//! 3. **Boundary** - empty batches
//! 4. **Interop** - transfers feeding compute work and back

use std::sync::Arc;
use vkcompute_command::sim::{SimCommand, SimDevice, SimFailure};
use vkcompute_command::transfer::{TransferDirection, TransferState};
use vkcompute_command::{
    CommandErrorKind, ComputeRecorder, DeviceTensor, HostTensor, RecorderConfig,
    TensorAllocator, TransferRecorder,
};

fn setup() -> (Arc<SimDevice>, TensorAllocator) {
    let _ = env_logger::builder().is_test(true).try_init();

    let device = SimDevice::new(true);
    let config = RecorderConfig {
        device_arena_size: 64 * 1024,
        staging_arena_size: 16 * 1024,
        ..RecorderConfig::default()
    };
    let allocator = TensorAllocator::new(device.clone(), &config).unwrap();
    (device, allocator)
}

fn ramp(len: usize, start: f32) -> HostTensor {
    let values: Vec<f32> = (0..len).map(|i| start + i as f32).collect();
    HostTensor::from_f32(&[len as u32], &values).unwrap()
}

/// (src_offset, dst_offset, size) of every executed copy
fn copies(device: &SimDevice) -> Vec<(u64, u64, u64)> {
    device
        .executed_commands()
        .iter()
        .filter_map(|c| match c {
            SimCommand::CopyBuffer { regions, .. } => Some(regions[0]),
            _ => None,
        })
        .collect()
}

#[test]
fn test_three_uploads_staging_offsets() {
    let (device, allocator) = setup();
    let a = ramp(4, 0.0);
    let b = ramp(8, 10.0);
    let c = ramp(2, 20.0);
    assert_eq!((a.byte_size(), b.byte_size(), c.byte_size()), (16, 32, 8));

    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let ta = transfer.record_upload(&a).unwrap();
    let tb = transfer.record_upload(&b).unwrap();
    let tc = transfer.record_upload(&c).unwrap();

    let (offsets, total) = transfer.staging_layout();
    assert_eq!(offsets, vec![0, 16, 48]);
    assert_eq!(total, 56);

    let buffers_before = device.stats().buffers_created;
    transfer.submit().unwrap();
    assert_eq!(device.stats().buffers_created - buffers_before, 1);
    transfer.wait().unwrap();

    assert_eq!(
        copies(&device),
        vec![
            (0, ta.offset(), 16),
            (16, tb.offset(), 32),
            (48, tc.offset(), 8),
        ]
    );

    for (tensor, host) in [(&ta, &a), (&tb, &b), (&tc, &c)] {
        let bytes = device
            .read_buffer(tensor.buffer(), tensor.offset(), tensor.byte_size())
            .unwrap();
        assert_eq!(bytes, host.data());
    }
}

#[test]
fn test_offsets_ignore_direction() {
    let (device, allocator) = setup();
    let up = ramp(4, 1.0);
    let existing = allocator.create(&[6], 4).unwrap();
    device
        .write_buffer(existing.buffer(), existing.offset(), ramp(6, 100.0).data())
        .unwrap();

    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let uploaded = transfer.record_upload(&up).unwrap();
    let slot = transfer.record_download(&existing).unwrap();
    let again = transfer.record_upload(&up).unwrap();

    assert_eq!(
        transfer.pending_entries(),
        vec![
            (TransferDirection::Upload, 16),
            (TransferDirection::Download, 24),
            (TransferDirection::Upload, 16),
        ]
    );
    assert_eq!(transfer.staging_layout(), (vec![0, 16, 40], 56));

    transfer.submit().unwrap();
    transfer.wait().unwrap();

    assert_eq!(
        copies(&device),
        vec![
            (0, uploaded.offset(), 16),
            (existing.offset(), 16, 24),
            (40, again.offset(), 16),
        ]
    );
    assert_eq!(transfer.take_download(slot).unwrap(), ramp(6, 100.0));
    assert_eq!(transfer.pending(), 0);
}

#[test]
fn test_empty_batch() {
    let (device, allocator) = setup();
    let buffers = device.live_buffers();

    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    assert_eq!(transfer.staging_layout(), (vec![], 0));
    transfer.submit().unwrap();
    assert_eq!(device.live_buffers(), buffers + 1);
    transfer.wait().unwrap();

    assert_eq!(device.live_buffers(), buffers);
    assert_eq!(device.mapped_memory(), 0);
    assert_eq!(device.stats().submits, 1);
    assert!(copies(&device).is_empty());
    assert_eq!(transfer.state(), TransferState::Recording);
}

#[test]
fn test_zero_sized_tensor_keeps_layout() {
    let (device, allocator) = setup();
    let empty = HostTensor::zeros(&[0], 4).unwrap();
    let data = ramp(3, 5.0);

    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    transfer.record_upload(&empty).unwrap();
    let tensor = transfer.record_upload(&data).unwrap();
    assert_eq!(transfer.staging_layout(), (vec![0, 0], 12));

    transfer.submit().unwrap();
    transfer.wait().unwrap();

    // Zero-byte copies are not issued
    assert_eq!(copies(&device), vec![(0, tensor.offset(), 12)]);
}

#[test]
fn test_wait_before_submit_is_rejected() {
    let (device, allocator) = setup();
    let mut transfer = TransferRecorder::new(device, &allocator).unwrap();
    let err = transfer.wait().unwrap_err();
    assert!(matches!(
        err,
        CommandErrorKind::InvalidState {
            operation: "wait",
            state: "recording"
        }
    ));
}

#[test]
fn test_device_lost_during_wait() {
    let (device, allocator) = setup();
    let host = ramp(4, 0.0);

    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let tensor = transfer.record_upload(&host).unwrap();
    let slot = transfer.record_download(&tensor).unwrap();
    transfer.submit().unwrap();

    device.fail_next(SimFailure::Wait);
    let err = transfer.wait().unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(transfer.state(), TransferState::Failed);
    assert!(transfer.take_download(slot).is_none());
    assert!(transfer.submit().is_err());
}

#[test]
fn test_transfer_feeds_compute() {
    let (device, allocator) = setup();
    let layout = device.create_pipeline_layout();
    let set_layout = device.create_descriptor_set_layout(2);
    let template = device.create_update_template();
    let negate = device.create_pipeline(|inv| {
        let out: Vec<u8> = inv.bindings[0]
            .chunks_exact(4)
            .flat_map(|b| (-f32::from_le_bytes([b[0], b[1], b[2], b[3]])).to_le_bytes())
            .collect();
        inv.bindings[1].copy_from_slice(&out);
    });

    let host = ramp(8, 1.0);
    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let input = transfer.record_upload(&host).unwrap();
    transfer.submit().unwrap();
    transfer.wait().unwrap();

    let output: DeviceTensor = allocator.create(&[8], 4).unwrap();
    let mut cmd = ComputeRecorder::new(device.clone(), &RecorderConfig::default()).unwrap();
    cmd.begin().unwrap();
    cmd.record_bind_pipeline(negate).unwrap();
    cmd.record_update_bindings(layout, set_layout, template, &[&input, &output])
        .unwrap();
    cmd.record_dispatch([1, 1, 1]).unwrap();
    cmd.record_compute_download_barrier(&output).unwrap();
    cmd.submit_and_wait().unwrap();

    let slot = transfer.record_download(&output).unwrap();
    transfer.submit().unwrap();
    transfer.wait().unwrap();

    let expected: Vec<f32> = host.to_f32().iter().map(|v| -v).collect();
    assert_eq!(transfer.take_download(slot).unwrap().to_f32(), expected);
}

#[test]
fn test_dropped_upload_target_is_not_reused_while_pending() {
    let (device, allocator) = setup();
    let stale = HostTensor::from_f32(&[4], &[9.0; 4]).unwrap();
    let fresh = HostTensor::from_f32(&[4], &[1.0, 2.0, 3.0, 4.0]).unwrap();

    let mut first = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let a = first.record_upload(&stale).unwrap();
    assert_eq!(a.offset(), 0);
    drop(a);

    // The first batch still owns offset 0
    let mut second = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let b = second.record_upload(&fresh).unwrap();
    assert_ne!(b.offset(), 0);
    second.submit().unwrap();
    second.wait().unwrap();

    first.submit().unwrap();
    first.wait().unwrap();
    assert_eq!(allocator.stats().device.used_bytes, 256);

    let slot = second.record_download(&b).unwrap();
    second.submit().unwrap();
    second.wait().unwrap();
    assert_eq!(
        second.take_download(slot).unwrap().to_f32(),
        vec![1.0, 2.0, 3.0, 4.0]
    );
}

#[test]
fn test_dropped_download_source_stays_reserved() {
    let (device, allocator) = setup();
    let host = ramp(4, 5.0);

    let mut transfer = TransferRecorder::new(device.clone(), &allocator).unwrap();
    let tensor = transfer.record_upload(&host).unwrap();
    transfer.submit().unwrap();
    transfer.wait().unwrap();

    let slot = transfer.record_download(&tensor).unwrap();
    drop(tensor);

    // A tensor created now must not land on the pending download's region
    let other = allocator.create(&[4], 4).unwrap();
    assert_ne!(other.offset(), 0);

    transfer.submit().unwrap();
    transfer.wait().unwrap();
    assert_eq!(transfer.take_download(slot).unwrap(), host);
    assert_eq!(allocator.stats().device.used_bytes, 256);
}
