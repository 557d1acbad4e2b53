//! Command context: one queue, one pool, one primary command buffer, one fence
//!
//! Every unit of recorded work goes through a [`CommandContext`]. The
//! context only ever has a single command buffer outstanding, and the fence
//! tracks that buffer's last submission.
//!
//! ```text
//!   Initial ──begin──▶ Recording ──end──▶ Executable ──submit──▶ Pending
//!      ▲                                                           │
//!      └──────────────────────────── wait ─────────────────────────┘
//! ```

use ash::vk;

use crate::device::DeviceRef;
use crate::error::CommandErrorKind;

/// Lifecycle of the context's command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferState {
    Initial,
    Recording,
    Executable,
    Pending,
}

impl BufferState {
    pub fn name(self) -> &'static str {
        match self {
            BufferState::Initial => "initial",
            BufferState::Recording => "recording",
            BufferState::Executable => "executable",
            BufferState::Pending => "pending",
        }
    }
}

/// Exclusively owned command pool, command buffer and fence on a shared queue.
pub struct CommandContext {
    /// Queue handle (owned by the device)
    queue: vk::Queue,

    queue_family: u32,

    command_pool: vk::CommandPool,

    /// The single primary command buffer allocated from `command_pool`
    command_buffer: vk::CommandBuffer,

    /// Signaled when the last submission completes
    fence: vk::Fence,

    state: BufferState,

    device: DeviceRef,
}

impl CommandContext {
    /// Create a context on queue 0 of `queue_family`.
    ///
    /// # Arguments
    ///
    /// * `device` - Device the queue belongs to
    /// * `queue_family` - Queue family index for submissions
    ///
    /// # Errors
    ///
    /// Returns `CommandErrorKind::ResourceCreation` if the pool, buffer or
    /// fence cannot be created. Anything created before the failure is
    /// released when the partial context is dropped.
    pub fn new(device: DeviceRef, queue_family: u32) -> Result<Self, CommandErrorKind> {
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let mut context = Self {
            queue,
            queue_family,
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            state: BufferState::Initial,
            device,
        };

        context.create_pool()?;
        context.create_buffer()?;
        context.create_fence()?;

        log::info!("Created CommandContext: queue_family={}", queue_family);
        Ok(context)
    }

    fn create_pool(&mut self) -> Result<(), CommandErrorKind> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        self.command_pool = unsafe { self.device.create_command_pool(&pool_info) }
            .map_err(|e| CommandErrorKind::creation("command pool", e))?;
        Ok(())
    }

    fn create_buffer(&mut self) -> Result<(), CommandErrorKind> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| CommandErrorKind::creation("command buffer", e))?;

        self.command_buffer = buffers
            .first()
            .copied()
            .ok_or_else(|| CommandErrorKind::creation("command buffer", vk::Result::ERROR_UNKNOWN))?;
        Ok(())
    }

    fn create_fence(&mut self) -> Result<(), CommandErrorKind> {
        self.fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default()) }
            .map_err(|e| CommandErrorKind::creation("fence", e))?;
        Ok(())
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[BufferState],
    ) -> Result<(), CommandErrorKind> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            log::error!("{} called on a {} command buffer", operation, self.state.name());
            Err(CommandErrorKind::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    /// Start recording with the one-time-submit hint.
    pub fn begin_recording(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state(
            "begin_recording",
            &[BufferState::Initial, BufferState::Executable],
        )?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)
        }
        .map_err(|e| CommandErrorKind::execution("begin_command_buffer", e))?;

        self.state = BufferState::Recording;
        log::debug!("Command buffer recording started");
        Ok(())
    }

    pub fn end_recording(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("end_recording", &[BufferState::Recording])?;

        unsafe { self.device.end_command_buffer(self.command_buffer) }
            .map_err(|e| CommandErrorKind::execution("end_command_buffer", e))?;

        self.state = BufferState::Executable;
        log::debug!("Command buffer recording ended");
        Ok(())
    }

    /// Submit the command buffer; the fence signals on completion.
    ///
    /// No semaphores: units of work on one context never overlap.
    pub fn submit(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("submit", &[BufferState::Executable])?;

        unsafe { self.device.reset_fences(&[self.fence]) }
            .map_err(|e| CommandErrorKind::execution("reset_fences", e))?;

        let submit_info =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&self.command_buffer));

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], self.fence)
        }
        .map_err(|e| CommandErrorKind::execution("queue_submit", e))?;

        self.state = BufferState::Pending;
        log::debug!("Command buffer submitted");
        Ok(())
    }

    /// Block on the fence without a timeout.
    pub fn wait(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("wait", &[BufferState::Pending])?;

        unsafe { self.device.wait_for_fences(&[self.fence], true, u64::MAX) }
            .map_err(|e| CommandErrorKind::execution("wait_for_fences", e))?;

        self.state = BufferState::Initial;
        log::debug!("Command buffer execution complete");
        Ok(())
    }

    /// Command buffer handle for recording commands
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }
}

impl Drop for CommandContext {
    fn drop(&mut self) {
        log::debug!("Dropping CommandContext (state={})", self.state.name());
        unsafe {
            if self.state == BufferState::Pending {
                // Resources of an in-flight submission must outlive it
                if let Err(e) = self.device.wait_for_fences(&[self.fence], true, u64::MAX) {
                    log::warn!("Wait before destroying CommandContext failed: {:?}", e);
                }
            }
            if self.fence != vk::Fence::null() {
                self.device.destroy_fence(self.fence);
            }
            if self.command_buffer != vk::CommandBuffer::null() {
                self.device
                    .free_command_buffers(self.command_pool, &[self.command_buffer]);
            }
            if self.command_pool != vk::CommandPool::null() {
                self.device.destroy_command_pool(self.command_pool);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimFailure};

    #[test]
    fn test_lifecycle() {
        let device = SimDevice::new(true);
        let mut context = CommandContext::new(device.clone(), 0).unwrap();
        assert_eq!(context.state(), BufferState::Initial);

        context.begin_recording().unwrap();
        context.end_recording().unwrap();
        context.submit().unwrap();
        assert_eq!(context.state(), BufferState::Pending);
        context.wait().unwrap();

        // Fence is reset per submit, so a second cycle works
        context.begin_recording().unwrap();
        context.end_recording().unwrap();
        context.submit().unwrap();
        context.wait().unwrap();
        assert_eq!(device.stats().submits, 2);
    }

    #[test]
    fn test_begin_twice_is_rejected() {
        let device = SimDevice::new(true);
        let mut context = CommandContext::new(device, 0).unwrap();
        context.begin_recording().unwrap();
        assert!(matches!(
            context.begin_recording(),
            Err(CommandErrorKind::InvalidState {
                operation: "begin_recording",
                state: "recording"
            })
        ));
    }

    #[test]
    fn test_wait_without_submit_is_rejected() {
        let device = SimDevice::new(true);
        let mut context = CommandContext::new(device, 0).unwrap();
        let err = context.wait().unwrap_err();
        assert_eq!(err.status(), -2);
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = SimDevice::new(true);
        {
            let _context = CommandContext::new(device.clone(), 0).unwrap();
            assert_eq!(device.live_command_pools(), 1);
            assert_eq!(device.live_command_buffers(), 1);
            assert_eq!(device.live_fences(), 1);
        }
        assert_eq!(device.live_command_pools(), 0);
        assert_eq!(device.live_command_buffers(), 0);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn test_failed_construction_releases_partial_state() {
        for failure in [SimFailure::CommandPool, SimFailure::CommandBuffer, SimFailure::Fence] {
            let device = SimDevice::new(true);
            device.fail_next(failure);

            let err = CommandContext::new(device.clone(), 0).err().unwrap();
            assert_eq!(err.status(), -1);
            assert_eq!(device.live_command_pools(), 0);
            assert_eq!(device.live_command_buffers(), 0);
            assert_eq!(device.live_fences(), 0);
        }
    }

    #[test]
    fn test_submit_failure_is_device_error() {
        let device = SimDevice::new(true);
        let mut context = CommandContext::new(device.clone(), 0).unwrap();
        context.begin_recording().unwrap();
        context.end_recording().unwrap();

        device.fail_next(SimFailure::Submit);
        let err = context.submit().unwrap_err();
        assert!(matches!(err, CommandErrorKind::DeviceExecution { .. }));
        assert_eq!(context.state(), BufferState::Executable);
    }
}
