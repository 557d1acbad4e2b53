//! Compute command recording
//!
//! A [`ComputeRecorder`] accumulates one unit of compute work (copies,
//! pipeline binds, buffer bindings, push constants, dispatches, barriers)
//! and submits it exactly once.
//!
//! # Execution modes
//!
//! - **Direct**: the device supports `VK_KHR_push_descriptor`. `begin()`
//!   opens the command buffer and every `record_*` call is encoded into it
//!   immediately. Buffer bindings are pushed with the pipeline's update
//!   template.
//! - **Deferred**: no push descriptors (or `force_deferred` is set). Every
//!   call is appended to a log of [`DeferredOp`]s that is replayed into the
//!   command buffer at `submit()`. Buffer bindings allocate a descriptor
//!   pool + set at record time, so replay allocates nothing.
//!
//! The mode is decided once at construction; both produce the same command
//! stream for the same calls.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut cmd = ComputeRecorder::new(device.clone(), &RecorderConfig::default())?;
//! cmd.begin()?;
//! cmd.record_upload(&input)?;
//! cmd.record_upload_compute_barrier(&input)?;
//! cmd.record_bind_pipeline(pipeline)?;
//! cmd.record_update_bindings(layout, set_layout, template, &[&input, &output])?;
//! cmd.record_dispatch([groups, 1, 1])?;
//! cmd.record_compute_download_barrier(&output)?;
//! cmd.record_download(&output)?;
//! cmd.submit_and_wait()?;
//! ```

use ash::vk;

use crate::command::CommandContext;
use crate::config::RecorderConfig;
use crate::device::DeviceRef;
use crate::error::CommandErrorKind;
use crate::record::{encode_constants, BarrierKind, BufferRange, Constant, DeferredOp};
use crate::tensor::DeviceTensor;

/// Recorder lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Created,
    Recording,
    Ended,
    Submitted,
    Waited,
    /// A resource or device error aborted the unit of work
    Failed,
}

impl RecorderState {
    pub fn name(self) -> &'static str {
        match self {
            RecorderState::Created => "created",
            RecorderState::Recording => "recording",
            RecorderState::Ended => "ended",
            RecorderState::Submitted => "submitted",
            RecorderState::Waited => "waited",
            RecorderState::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Direct,
    Deferred,
}

impl ExecutionMode {
    /// Deferred unless push descriptors are available and not overridden.
    pub fn select(supports_push_descriptor: bool, config: &RecorderConfig) -> Self {
        if supports_push_descriptor && !config.force_deferred {
            ExecutionMode::Direct
        } else {
            ExecutionMode::Deferred
        }
    }
}

/// Descriptor pool and the single set allocated from it.
#[derive(Clone, Copy, Debug)]
struct DescriptorAllocation {
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

/// Descriptor allocations owned by one deferred recorder.
struct DescriptorAllocations {
    entries: Vec<DescriptorAllocation>,
    device: DeviceRef,
}

impl Drop for DescriptorAllocations {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("Freeing {} descriptor pool/set pairs", self.entries.len());
        }
        for allocation in self.entries.drain(..) {
            unsafe {
                if let Err(e) = self
                    .device
                    .free_descriptor_sets(allocation.pool, &[allocation.set])
                {
                    log::warn!("Failed to free descriptor set: {:?}", e);
                }
                self.device.destroy_descriptor_pool(allocation.pool);
            }
        }
    }
}

enum Strategy {
    Direct,
    Deferred {
        ops: Vec<DeferredOp>,
        descriptors: DescriptorAllocations,
    },
}

/// One unit of compute work on its own [`CommandContext`].
pub struct ComputeRecorder {
    /// Dropped before `strategy`: command buffer resources go first, then
    /// the descriptor sets they referenced
    context: CommandContext,

    strategy: Strategy,

    /// Clones of every tensor a recorded command touches. Their arena
    /// regions stay reserved until `wait()` returns or the recorder drops.
    retained: Vec<DeviceTensor>,

    state: RecorderState,
}

impl ComputeRecorder {
    /// Create a recorder on the device's compute queue family.
    ///
    /// # Errors
    ///
    /// Returns `CommandErrorKind::ResourceCreation` if the command context
    /// cannot be created.
    pub fn new(device: DeviceRef, config: &RecorderConfig) -> Result<Self, CommandErrorKind> {
        let info = *device.info();
        let mode = ExecutionMode::select(info.supports_push_descriptor, config);

        let context = CommandContext::new(device.clone(), info.compute_queue_family)?;

        let strategy = match mode {
            ExecutionMode::Direct => Strategy::Direct,
            ExecutionMode::Deferred => Strategy::Deferred {
                ops: Vec::new(),
                descriptors: DescriptorAllocations {
                    entries: Vec::new(),
                    device,
                },
            },
        };

        log::info!("Created ComputeRecorder: mode={:?}", mode);

        Ok(Self {
            context,
            strategy,
            retained: Vec::new(),
            state: RecorderState::Created,
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        match self.strategy {
            Strategy::Direct => ExecutionMode::Direct,
            Strategy::Deferred { .. } => ExecutionMode::Deferred,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Logged operations (always empty in direct mode).
    pub fn deferred_ops(&self) -> &[DeferredOp] {
        match &self.strategy {
            Strategy::Direct => &[],
            Strategy::Deferred { ops, .. } => ops,
        }
    }

    /// Number of descriptor pool/set pairs owned by this recorder.
    pub fn descriptor_allocation_count(&self) -> usize {
        match &self.strategy {
            Strategy::Direct => 0,
            Strategy::Deferred { descriptors, .. } => descriptors.entries.len(),
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: RecorderState,
    ) -> Result<(), CommandErrorKind> {
        if self.state == expected {
            return Ok(());
        }
        log::error!(
            "{} called on a {} recorder (expected {})",
            operation,
            self.state.name(),
            expected.name()
        );
        Err(CommandErrorKind::InvalidState {
            operation,
            state: self.state.name(),
        })
    }

    /// Poison the recorder if `result` carries a fatal error.
    fn track<T>(&mut self, result: Result<T, CommandErrorKind>) -> Result<T, CommandErrorKind> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("ComputeRecorder failed: {}", e);
                self.state = RecorderState::Failed;
            }
        }
        result
    }

    /// Encode now (direct) or append to the log (deferred).
    fn issue(&mut self, op: DeferredOp) {
        match &mut self.strategy {
            Strategy::Direct => unsafe {
                op.encode(self.context.device().as_ref(), self.context.command_buffer());
            },
            Strategy::Deferred { ops, .. } => {
                log::trace!("defer {:?}", op);
                ops.push(op);
            }
        }
    }

    /// Tensors held alive by recorded commands.
    pub fn retained_tensors(&self) -> usize {
        self.retained.len()
    }

    fn retain(&mut self, tensors: &[&DeviceTensor]) {
        self.retained.extend(tensors.iter().map(|&t| t.clone()));
    }

    pub fn begin(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("begin", RecorderState::Created)?;

        match self.strategy {
            Strategy::Direct => {
                let result = self.context.begin_recording();
                self.track(result)?;
            }
            Strategy::Deferred { .. } => self.issue(DeferredOp::Begin),
        }

        self.state = RecorderState::Recording;
        log::debug!("ComputeRecorder recording ({:?})", self.mode());
        Ok(())
    }

    fn record_copy(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    ) -> Result<(), CommandErrorKind> {
        if region.size == 0 {
            log::debug!("Skipping zero-sized copy");
            return Ok(());
        }
        self.issue(DeferredOp::CopyRegion { src, dst, region });
        Ok(())
    }

    /// Copy a tensor's staging region into its device storage.
    pub fn record_upload(&mut self, tensor: &DeviceTensor) -> Result<(), CommandErrorKind> {
        self.expect_state("record_upload", RecorderState::Recording)?;
        let (staging, staging_offset) = tensor.staging().ok_or(CommandErrorKind::MissingStaging)?;

        self.retain(&[tensor]);
        self.record_copy(
            staging,
            tensor.buffer(),
            vk::BufferCopy {
                src_offset: staging_offset,
                dst_offset: tensor.offset(),
                size: tensor.byte_size(),
            },
        )
    }

    /// Copy a tensor's device storage into its staging region.
    pub fn record_download(&mut self, tensor: &DeviceTensor) -> Result<(), CommandErrorKind> {
        self.expect_state("record_download", RecorderState::Recording)?;
        let (staging, staging_offset) = tensor.staging().ok_or(CommandErrorKind::MissingStaging)?;

        self.retain(&[tensor]);
        self.record_copy(
            tensor.buffer(),
            staging,
            vk::BufferCopy {
                src_offset: tensor.offset(),
                dst_offset: staging_offset,
                size: tensor.byte_size(),
            },
        )
    }

    /// Copy `src` into `dst` (device to device, `src.byte_size()` bytes).
    pub fn record_clone(
        &mut self,
        src: &DeviceTensor,
        dst: &DeviceTensor,
    ) -> Result<(), CommandErrorKind> {
        self.expect_state("record_clone", RecorderState::Recording)?;
        if dst.byte_size() < src.byte_size() {
            return Err(CommandErrorKind::ShapeMismatch {
                expected: src.byte_size() as usize,
                actual: dst.byte_size() as usize,
            });
        }

        self.retain(&[src, dst]);
        self.record_copy(
            src.buffer(),
            dst.buffer(),
            vk::BufferCopy {
                src_offset: src.offset(),
                dst_offset: dst.offset(),
                size: src.byte_size(),
            },
        )
    }

    /// Copy one byte range; offsets are absolute within the tensors' buffers.
    pub fn record_copy_region(
        &mut self,
        src: &DeviceTensor,
        dst: &DeviceTensor,
        region: vk::BufferCopy,
    ) -> Result<(), CommandErrorKind> {
        self.record_copy_regions(src, dst, std::slice::from_ref(&region))
    }

    /// Copy several byte ranges between the same pair of buffers.
    pub fn record_copy_regions(
        &mut self,
        src: &DeviceTensor,
        dst: &DeviceTensor,
        regions: &[vk::BufferCopy],
    ) -> Result<(), CommandErrorKind> {
        self.expect_state("record_copy_regions", RecorderState::Recording)?;

        let regions: Vec<vk::BufferCopy> = regions.iter().copied().filter(|r| r.size > 0).collect();
        if regions.is_empty() {
            return Ok(());
        }

        self.retain(&[src, dst]);
        self.issue(DeferredOp::CopyRegions {
            src: src.buffer(),
            dst: dst.buffer(),
            regions,
        });
        Ok(())
    }

    pub fn record_bind_pipeline(&mut self, pipeline: vk::Pipeline) -> Result<(), CommandErrorKind> {
        self.expect_state("record_bind_pipeline", RecorderState::Recording)?;
        self.issue(DeferredOp::BindPipeline(pipeline));
        Ok(())
    }

    /// Bind `bindings` as storage buffers 0..N-1 of set 0.
    ///
    /// Direct mode pushes them with `update_template`. Deferred mode
    /// allocates and writes a fresh descriptor set now (one pool per set,
    /// sized to N storage buffers) and logs only the bind; the pair lives
    /// until the recorder is dropped.
    ///
    /// # Errors
    ///
    /// `EmptyBinding` if a tensor has no bytes (a zero-range binding is
    /// invalid); nothing is recorded and the recorder stays usable.
    /// `ResourceCreation` if the descriptor pool or set cannot be allocated.
    /// The recorder is then failed and must not be submitted.
    pub fn record_update_bindings(
        &mut self,
        pipeline_layout: vk::PipelineLayout,
        set_layout: vk::DescriptorSetLayout,
        update_template: vk::DescriptorUpdateTemplate,
        bindings: &[&DeviceTensor],
    ) -> Result<(), CommandErrorKind> {
        self.expect_state("record_update_bindings", RecorderState::Recording)?;

        if let Some(index) = bindings.iter().position(|t| t.is_empty()) {
            log::error!("record_update_bindings: binding {} is an empty tensor", index);
            return Err(CommandErrorKind::EmptyBinding { index });
        }

        let buffer_infos: Vec<vk::DescriptorBufferInfo> =
            bindings.iter().map(|t| t.descriptor_info()).collect();

        let result = match &mut self.strategy {
            Strategy::Direct => {
                log::trace!("push {} buffer bindings", buffer_infos.len());
                unsafe {
                    self.context.device().cmd_push_descriptor_set_with_template(
                        self.context.command_buffer(),
                        update_template,
                        pipeline_layout,
                        0,
                        &buffer_infos,
                    );
                }
                Ok(())
            }
            Strategy::Deferred { ops, descriptors } => {
                allocate_descriptor_set(&descriptors.device, set_layout, &buffer_infos).map(
                    |allocation| {
                        descriptors.entries.push(allocation);
                        ops.push(DeferredOp::BindDescriptorSet {
                            layout: pipeline_layout,
                            set: allocation.set,
                        });
                    },
                )
            }
        };
        self.track(result)?;

        self.retain(bindings);
        Ok(())
    }

    /// Push constants at offset 0, visible to the compute stage.
    pub fn record_push_constants(
        &mut self,
        pipeline_layout: vk::PipelineLayout,
        constants: &[Constant],
    ) -> Result<(), CommandErrorKind> {
        self.expect_state("record_push_constants", RecorderState::Recording)?;
        if constants.is_empty() {
            return Ok(());
        }

        self.issue(DeferredOp::PushConstants {
            layout: pipeline_layout,
            bytes: encode_constants(constants),
        });
        Ok(())
    }

    pub fn record_dispatch(&mut self, group_count: [u32; 3]) -> Result<(), CommandErrorKind> {
        self.expect_state("record_dispatch", RecorderState::Recording)?;
        self.issue(DeferredOp::Dispatch(group_count));
        Ok(())
    }

    fn record_barrier(
        &mut self,
        operation: &'static str,
        kind: BarrierKind,
        tensor: &DeviceTensor,
    ) -> Result<(), CommandErrorKind> {
        self.expect_state(operation, RecorderState::Recording)?;
        self.retain(&[tensor]);
        self.issue(DeferredOp::Barrier {
            kind,
            range: BufferRange::from(tensor),
        });
        Ok(())
    }

    /// Transfer writes to `tensor` become visible to shaders.
    pub fn record_upload_compute_barrier(
        &mut self,
        tensor: &DeviceTensor,
    ) -> Result<(), CommandErrorKind> {
        self.record_barrier(
            "record_upload_compute_barrier",
            BarrierKind::UploadToCompute,
            tensor,
        )
    }

    /// Shader writes to `tensor` become visible to transfer reads.
    pub fn record_compute_download_barrier(
        &mut self,
        tensor: &DeviceTensor,
    ) -> Result<(), CommandErrorKind> {
        self.record_barrier(
            "record_compute_download_barrier",
            BarrierKind::ComputeToDownload,
            tensor,
        )
    }

    /// Shader writes to `tensor` become visible to later shader reads.
    pub fn record_compute_compute_barrier(
        &mut self,
        tensor: &DeviceTensor,
    ) -> Result<(), CommandErrorKind> {
        self.record_barrier(
            "record_compute_compute_barrier",
            BarrierKind::ComputeToCompute,
            tensor,
        )
    }

    pub fn end(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("end", RecorderState::Recording)?;

        match self.strategy {
            Strategy::Direct => {
                let result = self.context.end_recording();
                self.track(result)?;
            }
            Strategy::Deferred { .. } => self.issue(DeferredOp::End),
        }

        self.state = RecorderState::Ended;
        Ok(())
    }

    /// Submit the recorded work. Deferred mode replays the log first.
    pub fn submit(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("submit", RecorderState::Ended)?;

        let result = self.replay().and_then(|_| self.context.submit());
        self.track(result)?;

        self.state = RecorderState::Submitted;
        log::debug!("ComputeRecorder submitted");
        Ok(())
    }

    fn replay(&mut self) -> Result<(), CommandErrorKind> {
        let Strategy::Deferred { ops, .. } = &self.strategy else {
            return Ok(());
        };

        log::debug!("Replaying {} deferred ops", ops.len());
        for op in ops {
            match op {
                DeferredOp::Begin => self.context.begin_recording()?,
                DeferredOp::End => self.context.end_recording()?,
                op => unsafe {
                    op.encode(self.context.device().as_ref(), self.context.command_buffer());
                },
            }
        }
        Ok(())
    }

    /// Block until the submitted work has completed.
    pub fn wait(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("wait", RecorderState::Submitted)?;

        let result = self.context.wait();
        self.track(result)?;

        self.retained.clear();
        self.state = RecorderState::Waited;
        log::debug!("ComputeRecorder work complete");
        Ok(())
    }

    /// `end()` (if still recording), `submit()`, then `wait()`.
    pub fn submit_and_wait(&mut self) -> Result<(), CommandErrorKind> {
        if self.state == RecorderState::Recording {
            self.end()?;
        }
        self.submit()?;
        self.wait()
    }
}

/// Allocate one descriptor set sized for `buffer_infos` from a pool of its own
/// and write the buffers into bindings 0..N-1.
fn allocate_descriptor_set(
    device: &DeviceRef,
    set_layout: vk::DescriptorSetLayout,
    buffer_infos: &[vk::DescriptorBufferInfo],
) -> Result<DescriptorAllocation, CommandErrorKind> {
    let pool_sizes = [vk::DescriptorPoolSize {
        ty: vk::DescriptorType::STORAGE_BUFFER,
        descriptor_count: (buffer_infos.len() as u32).max(1),
    }];

    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
        .max_sets(1)
        .pool_sizes(&pool_sizes);

    let pool = unsafe { device.create_descriptor_pool(&pool_info) }
        .map_err(|e| CommandErrorKind::creation("descriptor pool", e))?;

    let set_layouts = [set_layout];
    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(pool)
        .set_layouts(&set_layouts);

    let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
        Ok(sets) if !sets.is_empty() => sets[0],
        Ok(_) => {
            unsafe { device.destroy_descriptor_pool(pool) };
            return Err(CommandErrorKind::creation(
                "descriptor set",
                vk::Result::ERROR_UNKNOWN,
            ));
        }
        Err(e) => {
            unsafe { device.destroy_descriptor_pool(pool) };
            return Err(CommandErrorKind::creation("descriptor set", e));
        }
    };

    let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
        .iter()
        .enumerate()
        .map(|(binding, info)| {
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(binding as u32)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(std::slice::from_ref(info))
        })
        .collect();

    unsafe { device.update_descriptor_sets(&writes) };

    log::debug!(
        "Allocated descriptor set {:?} with {} storage buffers",
        set,
        buffer_infos.len()
    );
    Ok(DescriptorAllocation { pool, set })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCommand, SimDevice, SimFailure};

    fn deferred_config() -> RecorderConfig {
        RecorderConfig {
            force_deferred: true,
            ..RecorderConfig::default()
        }
    }

    #[test]
    fn test_mode_selection() {
        let config = RecorderConfig::default();
        assert_eq!(ExecutionMode::select(true, &config), ExecutionMode::Direct);
        assert_eq!(ExecutionMode::select(false, &config), ExecutionMode::Deferred);
        assert_eq!(
            ExecutionMode::select(true, &deferred_config()),
            ExecutionMode::Deferred
        );
    }

    #[test]
    fn test_record_before_begin_is_rejected() {
        let device = SimDevice::new(true);
        let mut cmd = ComputeRecorder::new(device, &RecorderConfig::default()).unwrap();
        let err = cmd.record_dispatch([1, 1, 1]).unwrap_err();
        assert!(matches!(
            err,
            CommandErrorKind::InvalidState {
                operation: "record_dispatch",
                state: "created"
            }
        ));
        // Misuse does not poison the recorder
        assert_eq!(cmd.state(), RecorderState::Created);
    }

    #[test]
    fn test_deferred_log_order() {
        let device = SimDevice::new(false);
        let pipeline = device.create_pipeline(|_| {});
        let layout = device.create_pipeline_layout();

        let mut cmd = ComputeRecorder::new(device.clone(), &RecorderConfig::default()).unwrap();
        assert_eq!(cmd.mode(), ExecutionMode::Deferred);

        cmd.begin().unwrap();
        cmd.record_bind_pipeline(pipeline).unwrap();
        cmd.record_push_constants(layout, &[Constant::I32(3)]).unwrap();
        cmd.record_dispatch([2, 1, 1]).unwrap();
        cmd.end().unwrap();

        let kinds: Vec<&str> = cmd
            .deferred_ops()
            .iter()
            .map(|op| match op {
                DeferredOp::Begin => "begin",
                DeferredOp::BindPipeline(_) => "bind_pipeline",
                DeferredOp::PushConstants { .. } => "push_constants",
                DeferredOp::Dispatch(_) => "dispatch",
                DeferredOp::End => "end",
                _ => "other",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["begin", "bind_pipeline", "push_constants", "dispatch", "end"]
        );

        // Nothing reaches the device until submit
        assert_eq!(device.stats().submits, 0);
        cmd.submit_and_wait().unwrap();
        assert_eq!(
            device.executed_commands().last(),
            Some(&SimCommand::Dispatch([2, 1, 1]))
        );
    }

    #[test]
    fn test_direct_mode_encodes_immediately() {
        let device = SimDevice::new(true);
        let mut cmd = ComputeRecorder::new(device, &RecorderConfig::default()).unwrap();
        cmd.begin().unwrap();
        cmd.record_dispatch([1, 1, 1]).unwrap();
        assert!(cmd.deferred_ops().is_empty());
        assert_eq!(cmd.descriptor_allocation_count(), 0);
    }

    #[test]
    fn test_descriptor_failure_poisons_recorder() {
        let device = SimDevice::new(false);
        let layout = device.create_pipeline_layout();
        let set_layout = device.create_descriptor_set_layout(1);
        let template = device.create_update_template();
        let tensor = DeviceTensor::from_buffer(vk::Buffer::null(), 0, &[4], 4).unwrap();

        let mut cmd = ComputeRecorder::new(device.clone(), &RecorderConfig::default()).unwrap();
        cmd.begin().unwrap();

        device.fail_next(SimFailure::DescriptorSet);
        let err = cmd
            .record_update_bindings(layout, set_layout, template, &[&tensor])
            .unwrap_err();
        assert_eq!(err.status(), -1);
        assert_eq!(cmd.state(), RecorderState::Failed);

        // Pool of the failed allocation was released immediately
        assert!(device.live_descriptor_pools().is_empty());
        assert!(matches!(
            cmd.end(),
            Err(CommandErrorKind::InvalidState { state: "failed", .. })
        ));
    }

    #[test]
    fn test_empty_binding_is_rejected() {
        for supports_push in [true, false] {
            let device = SimDevice::new(supports_push);
            let layout = device.create_pipeline_layout();
            let set_layout = device.create_descriptor_set_layout(2);
            let template = device.create_update_template();
            let full = DeviceTensor::from_buffer(vk::Buffer::null(), 0, &[4], 4).unwrap();
            let empty = DeviceTensor::from_buffer(vk::Buffer::null(), 256, &[0, 3], 4).unwrap();

            let mut cmd = ComputeRecorder::new(device.clone(), &RecorderConfig::default()).unwrap();
            cmd.begin().unwrap();

            let err = cmd
                .record_update_bindings(layout, set_layout, template, &[&full, &empty])
                .unwrap_err();
            assert!(matches!(err, CommandErrorKind::EmptyBinding { index: 1 }));
            assert_eq!(err.status(), -4);

            assert_eq!(cmd.state(), RecorderState::Recording);
            assert_eq!(cmd.retained_tensors(), 0);
            assert_eq!(device.stats().descriptor_pools_created, 0);
            assert_eq!(cmd.deferred_ops().len(), usize::from(!supports_push));
        }
    }

    #[test]
    fn test_wait_requires_submit() {
        let device = SimDevice::new(true);
        let mut cmd = ComputeRecorder::new(device, &RecorderConfig::default()).unwrap();
        cmd.begin().unwrap();
        cmd.end().unwrap();
        assert!(cmd.wait().is_err());
        cmd.submit().unwrap();
        assert!(cmd.submit().is_err());
        cmd.wait().unwrap();
        assert_eq!(cmd.state(), RecorderState::Waited);
    }
}
