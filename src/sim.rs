//! Software device for running the command layer without a GPU
//!
//! `SimDevice` implements [`GpuDevice`] on host memory. Command buffers are
//! recorded as lists of [`SimCommand`]s and executed in order when they are
//! submitted: copies move bytes between the host arrays backing device
//! memory, dispatches call the kernel closure registered for the bound
//! pipeline, barriers are only traced. Fences signal when execution
//! finishes, so `queue_submit` followed by `wait_for_fences` behaves like a
//! device that is infinitely fast.
//!
//! Object lifetimes are tracked so tests can assert that recorders release
//! exactly what they allocated, and any creation call can be made to fail
//! once with [`SimDevice::fail_next`].
//!
//! # Example
//!
//! ```rust,ignore
//! let device = SimDevice::new(true);
//! let pipeline = device.create_pipeline(|inv| {
//!     let input = inv.bindings[0].clone();
//!     inv.bindings[1].copy_from_slice(&input);
//! });
//! ```

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::c_void;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::{DeviceInfo, GpuDevice};

/// Memory type index of device-local, non-mappable memory
pub const DEVICE_LOCAL_MEMORY_TYPE: u32 = 0;

/// Memory type index of host-visible, host-coherent memory
pub const HOST_VISIBLE_MEMORY_TYPE: u32 = 1;

/// Alignment reported in buffer memory requirements
const SIM_ALIGNMENT: u64 = 256;

/// Size of the push constant block
const PUSH_CONSTANT_BLOCK: usize = 128;

/// Kernel body executed for a dispatch against the bound pipeline.
pub type SimKernel = Arc<dyn Fn(&mut KernelInvocation<'_>) + Send + Sync>;

/// Arguments handed to a [`SimKernel`].
///
/// `bindings[i]` holds the bytes of storage-buffer binding `i` (the exact
/// `offset..offset+range` window that was bound). Changes are written back
/// to device memory after the kernel returns, in binding order.
pub struct KernelInvocation<'a> {
    pub bindings: &'a mut [Vec<u8>],
    pub push_constants: &'a [u8],
    pub group_count: [u32; 3],
}

impl KernelInvocation<'_> {
    /// Read push constant `index` as a little-endian 32-bit word.
    pub fn constant_u32(&self, index: usize) -> u32 {
        let start = index * 4;
        self.push_constants
            .get(start..start + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .unwrap_or(0)
    }

    pub fn constant_f32(&self, index: usize) -> f32 {
        f32::from_bits(self.constant_u32(index))
    }
}

/// Creation or execution call that can be made to fail once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimFailure {
    CommandPool,
    CommandBuffer,
    Fence,
    DescriptorPool,
    DescriptorSet,
    Buffer,
    Memory,
    MapMemory,
    Submit,
    Wait,
}

/// One command as executed by the software queue.
#[derive(Clone, Debug, PartialEq)]
pub enum SimCommand {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        /// (src_offset, dst_offset, size)
        regions: Vec<(u64, u64, u64)>,
    },
    BindPipeline(vk::Pipeline),
    BindDescriptorSet {
        layout: vk::PipelineLayout,
        set: vk::DescriptorSet,
    },
    PushDescriptorSet {
        layout: vk::PipelineLayout,
        /// (buffer, offset, range) for bindings 0..N-1
        buffers: Vec<(vk::Buffer, u64, u64)>,
    },
    PushConstants {
        layout: vk::PipelineLayout,
        offset: u32,
        bytes: Vec<u8>,
    },
    Dispatch([u32; 3]),
    BufferBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
    },
}

/// Live descriptor pool as seen by tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorPoolSnapshot {
    pub pool: vk::DescriptorPool,
    pub max_sets: u32,
    pub storage_buffer_slots: u32,
    pub live_sets: usize,
}

/// Cumulative creation counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub command_pools_created: usize,
    pub command_buffers_allocated: usize,
    pub fences_created: usize,
    pub descriptor_pools_created: usize,
    pub descriptor_sets_allocated: usize,
    pub buffers_created: usize,
    pub memory_allocated: usize,
    pub submits: usize,
}

struct SimCommandBuffer {
    pool: u64,
    recording: bool,
    commands: Vec<SimCommand>,
}

struct SimDescriptorPool {
    max_sets: u32,
    storage_slots: u32,
    used_slots: u32,
    free_individual: bool,
    sets: HashSet<u64>,
}

struct SimDescriptorSet {
    pool: u64,
    slots: u32,
    bindings: BTreeMap<u32, (vk::Buffer, u64, u64)>,
}

struct SimBuffer {
    size: u64,
    memory: Option<(u64, u64)>,
}

struct SimMemory {
    data: Box<[u8]>,
    memory_type: u32,
    mapped: bool,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    command_pools: HashSet<u64>,
    command_buffers: HashMap<u64, SimCommandBuffer>,
    fences: HashMap<u64, bool>,
    descriptor_pools: HashMap<u64, SimDescriptorPool>,
    descriptor_sets: HashMap<u64, SimDescriptorSet>,
    set_layouts: HashMap<u64, u32>,
    buffers: HashMap<u64, SimBuffer>,
    memories: HashMap<u64, SimMemory>,
    pipelines: HashMap<u64, SimKernel>,
    executed: Vec<SimCommand>,
    armed: HashSet<SimFailure>,
    stats: SimStats,
}

/// Bindings and constants visible to the next dispatch.
#[derive(Default)]
struct ExecutionState {
    pipeline: Option<u64>,
    bindings: Vec<(vk::Buffer, u64, u64)>,
    push_constants: Vec<u8>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_failure(&mut self, failure: SimFailure) -> bool {
        self.armed.remove(&failure)
    }

    /// Resolve `buffer[offset..offset+size]` to (memory, byte start).
    fn resolve(&self, buffer: vk::Buffer, offset: u64, size: u64) -> VkResult<(u64, usize)> {
        let sim_buffer = self.buffers.get(&buffer.as_raw()).ok_or_else(|| {
            log::error!("SimDevice: unknown buffer {:?}", buffer);
            vk::Result::ERROR_DEVICE_LOST
        })?;
        let (memory, base) = sim_buffer.memory.ok_or_else(|| {
            log::error!("SimDevice: buffer {:?} has no memory bound", buffer);
            vk::Result::ERROR_DEVICE_LOST
        })?;
        if offset + size > sim_buffer.size {
            log::error!(
                "SimDevice: range {}+{} exceeds buffer {:?} of {} bytes",
                offset,
                size,
                buffer,
                sim_buffer.size
            );
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        Ok((memory, (base + offset) as usize))
    }

    fn read(&self, buffer: vk::Buffer, offset: u64, size: u64) -> VkResult<Vec<u8>> {
        let (memory, start) = self.resolve(buffer, offset, size)?;
        let data = &self.memories[&memory].data;
        Ok(data[start..start + size as usize].to_vec())
    }

    fn write(&mut self, buffer: vk::Buffer, offset: u64, bytes: &[u8]) -> VkResult<()> {
        let (memory, start) = self.resolve(buffer, offset, bytes.len() as u64)?;
        let data = &mut self
            .memories
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_DEVICE_LOST)?
            .data;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn range_of(&self, buffer: vk::Buffer, offset: u64, range: u64) -> u64 {
        if range == vk::WHOLE_SIZE {
            self.buffers
                .get(&buffer.as_raw())
                .map(|b| b.size.saturating_sub(offset))
                .unwrap_or(0)
        } else {
            range
        }
    }

    fn record(&mut self, command_buffer: vk::CommandBuffer, command: SimCommand) {
        match self.command_buffers.get_mut(&command_buffer.as_raw()) {
            Some(cb) if cb.recording => cb.commands.push(command),
            _ => log::warn!(
                "SimDevice: {:?} recorded outside recording state, ignored",
                command
            ),
        }
    }

    fn execute(&mut self, command: &SimCommand, exec: &mut ExecutionState) -> VkResult<()> {
        match command {
            SimCommand::CopyBuffer { src, dst, regions } => {
                for &(src_offset, dst_offset, size) in regions {
                    let bytes = self.read(*src, src_offset, size)?;
                    self.write(*dst, dst_offset, &bytes)?;
                }
            }
            SimCommand::BindPipeline(pipeline) => {
                exec.pipeline = Some(pipeline.as_raw());
            }
            SimCommand::BindDescriptorSet { set, .. } => {
                let sim_set = self.descriptor_sets.get(&set.as_raw()).ok_or_else(|| {
                    log::error!("SimDevice: bound descriptor set {:?} does not exist", set);
                    vk::Result::ERROR_DEVICE_LOST
                })?;
                exec.bindings = sim_set.bindings.values().copied().collect();
            }
            SimCommand::PushDescriptorSet { buffers, .. } => {
                exec.bindings = buffers.clone();
            }
            SimCommand::PushConstants { offset, bytes, .. } => {
                let start = *offset as usize;
                if exec.push_constants.len() < start + bytes.len() {
                    exec.push_constants.resize(start + bytes.len(), 0);
                }
                exec.push_constants[start..start + bytes.len()].copy_from_slice(bytes);
            }
            SimCommand::Dispatch(group_count) => {
                let pipeline = exec.pipeline.ok_or_else(|| {
                    log::error!("SimDevice: dispatch without a bound pipeline");
                    vk::Result::ERROR_DEVICE_LOST
                })?;
                let kernel = self.pipelines.get(&pipeline).cloned().ok_or_else(|| {
                    log::error!("SimDevice: pipeline {:#x} has no kernel", pipeline);
                    vk::Result::ERROR_DEVICE_LOST
                })?;

                let windows: Vec<(vk::Buffer, u64, u64)> = exec
                    .bindings
                    .iter()
                    .map(|&(buffer, offset, range)| {
                        (buffer, offset, self.range_of(buffer, offset, range))
                    })
                    .collect();
                let mut bindings = windows
                    .iter()
                    .map(|&(buffer, offset, size)| self.read(buffer, offset, size))
                    .collect::<VkResult<Vec<_>>>()?;

                let mut invocation = KernelInvocation {
                    bindings: &mut bindings,
                    push_constants: &exec.push_constants,
                    group_count: *group_count,
                };
                kernel(&mut invocation);

                for (&(buffer, offset, _), bytes) in windows.iter().zip(bindings.iter()) {
                    self.write(buffer, offset, bytes)?;
                }
            }
            SimCommand::BufferBarrier { .. } => {}
        }
        self.executed.push(command.clone());
        Ok(())
    }
}

/// Host-memory implementation of [`GpuDevice`].
pub struct SimDevice {
    info: DeviceInfo,
    state: Mutex<SimState>,
}

impl SimDevice {
    /// Create a software device.
    ///
    /// `supports_push_descriptor` is reported through [`DeviceInfo`] and
    /// decides which execution mode compute recorders pick.
    pub fn new(supports_push_descriptor: bool) -> Arc<Self> {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties::default();
        memory_properties.memory_type_count = 2;
        memory_properties.memory_types[DEVICE_LOCAL_MEMORY_TYPE as usize].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL;
        memory_properties.memory_types[HOST_VISIBLE_MEMORY_TYPE as usize].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        memory_properties.memory_heap_count = 1;
        memory_properties.memory_heaps[0].size = 1 << 30;

        Arc::new(Self {
            info: DeviceInfo {
                compute_queue_family: 0,
                supports_push_descriptor,
                memory_properties,
            },
            state: Mutex::new(SimState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A kernel that panicked poisons the lock; the state is still usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm a one-shot failure for the next matching call.
    pub fn fail_next(&self, failure: SimFailure) {
        self.state().armed.insert(failure);
    }

    /// Register a compute pipeline whose dispatches run `kernel`.
    pub fn create_pipeline<F>(&self, kernel: F) -> vk::Pipeline
    where
        F: Fn(&mut KernelInvocation<'_>) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let handle = state.handle();
        state.pipelines.insert(handle, Arc::new(kernel));
        vk::Pipeline::from_raw(handle)
    }

    pub fn create_pipeline_layout(&self) -> vk::PipelineLayout {
        vk::PipelineLayout::from_raw(self.state().handle())
    }

    /// Descriptor set layout with `binding_count` storage-buffer bindings.
    pub fn create_descriptor_set_layout(&self, binding_count: u32) -> vk::DescriptorSetLayout {
        let mut state = self.state();
        let handle = state.handle();
        state.set_layouts.insert(handle, binding_count);
        vk::DescriptorSetLayout::from_raw(handle)
    }

    pub fn create_update_template(&self) -> vk::DescriptorUpdateTemplate {
        vk::DescriptorUpdateTemplate::from_raw(self.state().handle())
    }

    /// Read bytes straight out of a bound buffer.
    pub fn read_buffer(&self, buffer: vk::Buffer, offset: u64, size: u64) -> VkResult<Vec<u8>> {
        self.state().read(buffer, offset, size)
    }

    /// Write bytes straight into a bound buffer.
    pub fn write_buffer(&self, buffer: vk::Buffer, offset: u64, bytes: &[u8]) -> VkResult<()> {
        self.state().write(buffer, offset, bytes)
    }

    /// Commands executed by the queue so far, in execution order.
    pub fn executed_commands(&self) -> Vec<SimCommand> {
        self.state().executed.clone()
    }

    pub fn clear_executed(&self) {
        self.state().executed.clear();
    }

    pub fn stats(&self) -> SimStats {
        self.state().stats
    }

    pub fn live_descriptor_pools(&self) -> Vec<DescriptorPoolSnapshot> {
        let state = self.state();
        let mut pools: Vec<DescriptorPoolSnapshot> = state
            .descriptor_pools
            .iter()
            .map(|(&handle, pool)| DescriptorPoolSnapshot {
                pool: vk::DescriptorPool::from_raw(handle),
                max_sets: pool.max_sets,
                storage_buffer_slots: pool.storage_slots,
                live_sets: pool.sets.len(),
            })
            .collect();
        pools.sort_by_key(|p| p.pool.as_raw());
        pools
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state().descriptor_sets.len()
    }

    pub fn live_command_pools(&self) -> usize {
        self.state().command_pools.len()
    }

    pub fn live_command_buffers(&self) -> usize {
        self.state().command_buffers.len()
    }

    pub fn live_fences(&self) -> usize {
        self.state().fences.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_memory(&self) -> usize {
        self.state().memories.len()
    }

    pub fn mapped_memory(&self) -> usize {
        self.state().memories.values().filter(|m| m.mapped).count()
    }
}

impl GpuDevice for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    unsafe fn get_device_queue(&self, queue_family_index: u32, queue_index: u32) -> vk::Queue {
        vk::Queue::from_raw(0x5100_0000 | ((queue_family_index as u64) << 8) | queue_index as u64)
    }

    unsafe fn create_command_pool(
        &self,
        _create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool> {
        let mut state = self.state();
        if state.take_failure(SimFailure::CommandPool) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let handle = state.handle();
        state.command_pools.insert(handle);
        state.stats.command_pools_created += 1;
        Ok(vk::CommandPool::from_raw(handle))
    }

    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state();
        let raw = pool.as_raw();
        state.command_pools.remove(&raw);
        state.command_buffers.retain(|_, cb| cb.pool != raw);
    }

    unsafe fn allocate_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>> {
        let mut state = self.state();
        if state.take_failure(SimFailure::CommandBuffer) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let pool = allocate_info.command_pool.as_raw();
        if !state.command_pools.contains(&pool) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let mut buffers = Vec::new();
        for _ in 0..allocate_info.command_buffer_count {
            let handle = state.handle();
            state.command_buffers.insert(
                handle,
                SimCommandBuffer {
                    pool,
                    recording: false,
                    commands: Vec::new(),
                },
            );
            state.stats.command_buffers_allocated += 1;
            buffers.push(vk::CommandBuffer::from_raw(handle));
        }
        Ok(buffers)
    }

    unsafe fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state();
        for buffer in buffers {
            state.command_buffers.remove(&buffer.as_raw());
        }
    }

    unsafe fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()> {
        let mut state = self.state();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if cb.recording {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        cb.recording = true;
        cb.commands.clear();
        Ok(())
    }

    unsafe fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state();
        let cb = state
            .command_buffers
            .get_mut(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !cb.recording {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        cb.recording = false;
        Ok(())
    }

    unsafe fn create_fence(&self, create_info: &vk::FenceCreateInfo<'_>) -> VkResult<vk::Fence> {
        let mut state = self.state();
        if state.take_failure(SimFailure::Fence) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let handle = state.handle();
        let signaled = create_info.flags.contains(vk::FenceCreateFlags::SIGNALED);
        state.fences.insert(handle, signaled);
        state.stats.fences_created += 1;
        Ok(vk::Fence::from_raw(handle))
    }

    unsafe fn destroy_fence(&self, fence: vk::Fence) {
        self.state().fences.remove(&fence.as_raw());
    }

    unsafe fn reset_fences(&self, fences: &[vk::Fence]) -> VkResult<()> {
        let mut state = self.state();
        for fence in fences {
            *state
                .fences
                .get_mut(&fence.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)? = false;
        }
        Ok(())
    }

    unsafe fn wait_for_fences(
        &self,
        fences: &[vk::Fence],
        _wait_all: bool,
        _timeout: u64,
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.take_failure(SimFailure::Wait) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        let all_signaled = fences
            .iter()
            .all(|f| state.fences.get(&f.as_raw()).copied().unwrap_or(false));
        if all_signaled {
            Ok(())
        } else {
            // Nothing is in flight on a synchronous queue: this wait would never return.
            log::error!("SimDevice: waiting on a fence that can never signal");
            Err(vk::Result::TIMEOUT)
        }
    }

    unsafe fn queue_submit(
        &self,
        _queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state();
        if state.take_failure(SimFailure::Submit) {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        state.stats.submits += 1;

        for submit in submits {
            let command_buffers = if submit.command_buffer_count == 0 {
                &[][..]
            } else {
                std::slice::from_raw_parts(
                    submit.p_command_buffers,
                    submit.command_buffer_count as usize,
                )
            };

            for command_buffer in command_buffers {
                let commands = match state.command_buffers.get(&command_buffer.as_raw()) {
                    Some(cb) if !cb.recording => cb.commands.clone(),
                    _ => {
                        log::error!(
                            "SimDevice: submitted {:?} is not executable",
                            command_buffer
                        );
                        return Err(vk::Result::ERROR_UNKNOWN);
                    }
                };

                let mut exec = ExecutionState {
                    push_constants: vec![0; PUSH_CONSTANT_BLOCK],
                    ..Default::default()
                };
                for command in &commands {
                    state.execute(command, &mut exec)?;
                }
            }
        }

        if fence != vk::Fence::null() {
            *state
                .fences
                .get_mut(&fence.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)? = true;
        }
        Ok(())
    }

    unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        let regions = regions
            .iter()
            .map(|r| (r.src_offset, r.dst_offset, r.size))
            .collect();
        self.state()
            .record(command_buffer, SimCommand::CopyBuffer { src, dst, regions });
    }

    unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.state()
            .record(command_buffer, SimCommand::BindPipeline(pipeline));
    }

    unsafe fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        _first_set: u32,
        descriptor_sets: &[vk::DescriptorSet],
        _dynamic_offsets: &[u32],
    ) {
        let mut state = self.state();
        for &set in descriptor_sets {
            state.record(command_buffer, SimCommand::BindDescriptorSet { layout, set });
        }
    }

    unsafe fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        _stage_flags: vk::ShaderStageFlags,
        offset: u32,
        constants: &[u8],
    ) {
        self.state().record(
            command_buffer,
            SimCommand::PushConstants {
                layout,
                offset,
                bytes: constants.to_vec(),
            },
        );
    }

    unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.state()
            .record(command_buffer, SimCommand::Dispatch([x, y, z]));
    }

    unsafe fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        _dependency_flags: vk::DependencyFlags,
        _memory_barriers: &[vk::MemoryBarrier<'_>],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier<'_>],
        _image_memory_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        let mut state = self.state();
        for barrier in buffer_memory_barriers {
            state.record(
                command_buffer,
                SimCommand::BufferBarrier {
                    src_stage: src_stage_mask,
                    dst_stage: dst_stage_mask,
                    src_access: barrier.src_access_mask,
                    dst_access: barrier.dst_access_mask,
                    buffer: barrier.buffer,
                    offset: barrier.offset,
                    size: barrier.size,
                },
            );
        }
    }

    unsafe fn cmd_push_descriptor_set_with_template(
        &self,
        command_buffer: vk::CommandBuffer,
        _update_template: vk::DescriptorUpdateTemplate,
        layout: vk::PipelineLayout,
        _set: u32,
        buffer_infos: &[vk::DescriptorBufferInfo],
    ) {
        if !self.info.supports_push_descriptor {
            log::error!("SimDevice: push descriptor used on a device without support");
        }
        let buffers = buffer_infos
            .iter()
            .map(|info| (info.buffer, info.offset, info.range))
            .collect();
        self.state()
            .record(command_buffer, SimCommand::PushDescriptorSet { layout, buffers });
    }

    unsafe fn create_descriptor_pool(
        &self,
        create_info: &vk::DescriptorPoolCreateInfo<'_>,
    ) -> VkResult<vk::DescriptorPool> {
        let mut state = self.state();
        if state.take_failure(SimFailure::DescriptorPool) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let pool_sizes = if create_info.pool_size_count == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(
                create_info.p_pool_sizes,
                create_info.pool_size_count as usize,
            )
        };
        let storage_slots = pool_sizes
            .iter()
            .filter(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .map(|s| s.descriptor_count)
            .sum();

        let handle = state.handle();
        state.descriptor_pools.insert(
            handle,
            SimDescriptorPool {
                max_sets: create_info.max_sets,
                storage_slots,
                used_slots: 0,
                free_individual: create_info
                    .flags
                    .contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET),
                sets: HashSet::new(),
            },
        );
        state.stats.descriptor_pools_created += 1;
        Ok(vk::DescriptorPool::from_raw(handle))
    }

    unsafe fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state();
        if let Some(sim_pool) = state.descriptor_pools.remove(&pool.as_raw()) {
            for set in sim_pool.sets {
                state.descriptor_sets.remove(&set);
            }
        }
    }

    unsafe fn allocate_descriptor_sets(
        &self,
        allocate_info: &vk::DescriptorSetAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        if state.take_failure(SimFailure::DescriptorSet) {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let layouts = std::slice::from_raw_parts(
            allocate_info.p_set_layouts,
            allocate_info.descriptor_set_count as usize,
        );
        let pool_handle = allocate_info.descriptor_pool.as_raw();

        let mut sets = Vec::new();
        for layout in layouts {
            let slots = *state
                .set_layouts
                .get(&layout.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            let pool = state
                .descriptor_pools
                .get(&pool_handle)
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if pool.sets.len() as u32 >= pool.max_sets
                || pool.used_slots + slots > pool.storage_slots
            {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }

            let handle = state.handle();
            if let Some(pool) = state.descriptor_pools.get_mut(&pool_handle) {
                pool.sets.insert(handle);
                pool.used_slots += slots;
            }
            state.descriptor_sets.insert(
                handle,
                SimDescriptorSet {
                    pool: pool_handle,
                    slots,
                    bindings: BTreeMap::new(),
                },
            );
            state.stats.descriptor_sets_allocated += 1;
            sets.push(vk::DescriptorSet::from_raw(handle));
        }
        Ok(sets)
    }

    unsafe fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        descriptor_sets: &[vk::DescriptorSet],
    ) -> VkResult<()> {
        let mut state = self.state();
        let pool_handle = pool.as_raw();
        let free_individual = state
            .descriptor_pools
            .get(&pool_handle)
            .map(|p| p.free_individual)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if !free_individual {
            log::error!("SimDevice: freeing a set from a pool without FREE_DESCRIPTOR_SET");
            return Err(vk::Result::ERROR_UNKNOWN);
        }

        for set in descriptor_sets {
            let sim_set = state
                .descriptor_sets
                .remove(&set.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if sim_set.pool != pool_handle {
                log::error!("SimDevice: set {:?} freed through a foreign pool", set);
                return Err(vk::Result::ERROR_UNKNOWN);
            }
            if let Some(p) = state.descriptor_pools.get_mut(&pool_handle) {
                p.sets.remove(&set.as_raw());
                p.used_slots -= sim_set.slots;
            }
        }
        Ok(())
    }

    unsafe fn update_descriptor_sets(&self, writes: &[vk::WriteDescriptorSet<'_>]) {
        let mut state = self.state();
        for write in writes {
            if write.p_buffer_info.is_null() {
                continue;
            }
            let infos =
                std::slice::from_raw_parts(write.p_buffer_info, write.descriptor_count as usize);
            match state.descriptor_sets.get_mut(&write.dst_set.as_raw()) {
                Some(set) => {
                    for (i, info) in infos.iter().enumerate() {
                        set.bindings.insert(
                            write.dst_binding + i as u32,
                            (info.buffer, info.offset, info.range),
                        );
                    }
                }
                None => log::error!("SimDevice: update of unknown set {:?}", write.dst_set),
            }
        }
    }

    unsafe fn create_buffer(&self, create_info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer> {
        let mut state = self.state();
        if state.take_failure(SimFailure::Buffer) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        if create_info.size == 0 {
            log::error!("SimDevice: buffer size must be greater than zero");
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let handle = state.handle();
        state.buffers.insert(
            handle,
            SimBuffer {
                size: create_info.size,
                memory: None,
            },
        );
        state.stats.buffers_created += 1;
        Ok(vk::Buffer::from_raw(handle))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.state().buffers.remove(&buffer.as_raw());
    }

    unsafe fn get_buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let size = self
            .state()
            .buffers
            .get(&buffer.as_raw())
            .map(|b| b.size)
            .unwrap_or(0);
        vk::MemoryRequirements {
            size: size.div_ceil(SIM_ALIGNMENT) * SIM_ALIGNMENT,
            alignment: SIM_ALIGNMENT,
            memory_type_bits: (1 << DEVICE_LOCAL_MEMORY_TYPE) | (1 << HOST_VISIBLE_MEMORY_TYPE),
        }
    }

    unsafe fn allocate_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory> {
        let mut state = self.state();
        if state.take_failure(SimFailure::Memory) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let handle = state.handle();
        state.memories.insert(
            handle,
            SimMemory {
                data: vec![0u8; allocate_info.allocation_size as usize].into_boxed_slice(),
                memory_type: allocate_info.memory_type_index,
                mapped: false,
            },
        );
        state.stats.memory_allocated += 1;
        Ok(vk::DeviceMemory::from_raw(handle))
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        self.state().memories.remove(&memory.as_raw());
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        let mut state = self.state();
        let memory_size = state
            .memories
            .get(&memory.as_raw())
            .map(|m| m.data.len() as u64)
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let sim_buffer = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if offset + sim_buffer.size > memory_size {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        sim_buffer.memory = Some((memory.as_raw(), offset));
        Ok(())
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut c_void> {
        let mut state = self.state();
        if state.take_failure(SimFailure::MapMemory) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let sim_memory = state
            .memories
            .get_mut(&memory.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if sim_memory.memory_type != HOST_VISIBLE_MEMORY_TYPE || sim_memory.mapped {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let len = sim_memory.data.len() as u64;
        if offset > len || (size != vk::WHOLE_SIZE && offset + size > len) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        sim_memory.mapped = true;
        Ok(sim_memory.data.as_mut_ptr().add(offset as usize) as *mut c_void)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        if let Some(m) = self.state().memories.get_mut(&memory.as_raw()) {
            m.mapped = false;
        }
    }
}
