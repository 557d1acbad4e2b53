//! Recorded compute operations
//!
//! [`DeferredOp`] is the unit both recording strategies share: direct
//! recording encodes each op into the live command buffer as soon as it is
//! built, deferred recording appends it to a log and encodes the whole log
//! at submit time. Encoding is the same function either way.

use ash::vk;

use crate::device::GpuDevice;
use crate::tensor::DeviceTensor;

/// Byte range of a device buffer covered by a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl From<&DeviceTensor> for BufferRange {
    fn from(tensor: &DeviceTensor) -> Self {
        Self {
            buffer: tensor.buffer(),
            offset: tensor.offset(),
            size: tensor.byte_size(),
        }
    }
}

/// Visibility transition a buffer barrier establishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// Transfer write → shader read/write
    UploadToCompute,

    /// Shader read/write → transfer read
    ComputeToDownload,

    /// Shader write → shader read
    ComputeToCompute,
}

/// Access and stage masks of one barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl BarrierKind {
    pub fn masks(self) -> BarrierMasks {
        match self {
            BarrierKind::UploadToCompute => BarrierMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            },
            BarrierKind::ComputeToDownload => BarrierMasks {
                src_access: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                dst_access: vk::AccessFlags::TRANSFER_READ,
                src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            },
            BarrierKind::ComputeToCompute => BarrierMasks {
                src_access: vk::AccessFlags::SHADER_WRITE,
                dst_access: vk::AccessFlags::SHADER_READ,
                src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            },
        }
    }
}

/// One 32-bit push constant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constant {
    I32(i32),
    U32(u32),
    F32(f32),
}

impl Constant {
    pub fn to_le_bytes(self) -> [u8; 4] {
        match self {
            Constant::I32(v) => v.to_le_bytes(),
            Constant::U32(v) => v.to_le_bytes(),
            Constant::F32(v) => v.to_le_bytes(),
        }
    }
}

/// Pack constants into the byte block pushed at offset 0.
pub fn encode_constants(constants: &[Constant]) -> Vec<u8> {
    constants.iter().flat_map(|c| c.to_le_bytes()).collect()
}

/// One recorded compute operation.
#[derive(Clone, Debug)]
pub enum DeferredOp {
    Begin,
    CopyRegion {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyRegions {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    BindPipeline(vk::Pipeline),
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        bytes: Vec<u8>,
    },
    Dispatch([u32; 3]),
    Barrier {
        kind: BarrierKind,
        range: BufferRange,
    },
    End,
}

impl DeferredOp {
    /// Encode into `command_buffer`, which must be recording.
    ///
    /// `Begin` and `End` change the command buffer's state and are handled by
    /// the owning [`crate::command::CommandContext`]; they encode nothing.
    ///
    /// # Safety
    ///
    /// Every handle in the op must belong to `device` and stay alive until
    /// the submission that executes it has completed.
    pub unsafe fn encode(&self, device: &dyn GpuDevice, command_buffer: vk::CommandBuffer) {
        log::trace!("encode {:?}", self);
        match self {
            DeferredOp::Begin | DeferredOp::End => {}
            DeferredOp::CopyRegion { src, dst, region } => {
                device.cmd_copy_buffer(command_buffer, *src, *dst, std::slice::from_ref(region));
            }
            DeferredOp::CopyRegions { src, dst, regions } => {
                device.cmd_copy_buffer(command_buffer, *src, *dst, regions);
            }
            DeferredOp::BindPipeline(pipeline) => {
                device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::COMPUTE, *pipeline);
            }
            DeferredOp::BindDescriptorSet { layout, set } => {
                device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    *layout,
                    0,
                    std::slice::from_ref(set),
                    &[],
                );
            }
            DeferredOp::PushConstants { layout, bytes } => {
                device.cmd_push_constants(
                    command_buffer,
                    *layout,
                    vk::ShaderStageFlags::COMPUTE,
                    0,
                    bytes,
                );
            }
            DeferredOp::Dispatch([x, y, z]) => {
                device.cmd_dispatch(command_buffer, *x, *y, *z);
            }
            DeferredOp::Barrier { kind, range } => {
                let masks = kind.masks();
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(masks.src_access)
                    .dst_access_mask(masks.dst_access)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(range.buffer)
                    .offset(range.offset)
                    .size(range.size);

                device.cmd_pipeline_barrier(
                    command_buffer,
                    masks.src_stage,
                    masks.dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    std::slice::from_ref(&barrier),
                    &[],
                );
            }
        }
    }
}
