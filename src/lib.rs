//! Vulkan compute command layer
//!
//! Records and submits GPU work for a neural-network inference engine.
//! Sits between per-layer kernels (which decide what to dispatch) and the
//! Vulkan API (via ash).
//!
//! # Architecture
//!
//! - [`CommandContext`]: one queue, one command pool, one primary command
//!   buffer and one fence, with begin/end/submit/wait
//! - [`ComputeRecorder`]: copies, pipeline binds, buffer bindings, push
//!   constants, dispatches and barriers for one unit of compute work;
//!   records directly or through a replay log depending on whether the
//!   device supports `VK_KHR_push_descriptor`
//! - [`TransferRecorder`]: batches uploads and downloads through a single
//!   staging buffer per submission
//!
//! Both recorders talk to the device through [`GpuDevice`]. [`VulkanDevice`]
//! is the ash implementation; [`SimDevice`] runs everything on host memory.
//!
//! # Example
//!
//! ```rust,ignore
//! use vkcompute_command::{RecorderConfig, TensorAllocator, TransferRecorder, HostTensor};
//!
//! vkcompute_command::init_logging();
//! let config = RecorderConfig::from_env()?;
//! let allocator = TensorAllocator::new(device.clone(), &config)?;
//!
//! let input = HostTensor::from_f32(&[4, 4], &values)?;
//! let mut transfer = TransferRecorder::new(device.clone(), &allocator)?;
//! let tensor = transfer.record_upload(&input)?;
//! transfer.submit()?;
//! transfer.wait()?;
//! ```

pub mod allocator;
pub mod buffer;
pub mod command;
pub mod compute;
pub mod config;
pub mod device;
pub mod error;
pub mod record;
pub mod sim;
pub mod tensor;
pub mod transfer;

pub use allocator::{AllocatorStats, ArenaStats, MemoryArena, TensorAllocator};
pub use buffer::StagingBuffer;
pub use command::{BufferState, CommandContext};
pub use compute::{ComputeRecorder, ExecutionMode, RecorderState};
pub use config::RecorderConfig;
pub use device::{DeviceInfo, DeviceRef, GpuDevice, VulkanDevice};
pub use error::{status_of, CommandErrorKind};
pub use record::{BarrierKind, BufferRange, Constant, DeferredOp};
pub use sim::SimDevice;
pub use tensor::{DeviceTensor, HostTensor};
pub use transfer::{staging_layout, DownloadSlot, TransferRecorder};

/// Initialise `env_logger` (respects `RUST_LOG`). Safe to call repeatedly.
pub fn init_logging() {
    if env_logger::try_init().is_ok() {
        log::info!(
            "vkcompute_command logging initialized (version {})",
            env!("CARGO_PKG_VERSION")
        );
    }
}
