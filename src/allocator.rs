//! Arena-backed tensor memory
//!
//! # Architecture
//!
//! ```text
//! TensorAllocator
//!   ├── device arena  (DEVICE_LOCAL, one VkDeviceMemory + one VkBuffer)
//!   │     ├── region [0..256)
//!   │     └── region [256..1280)
//!   └── staging arena (HOST_VISIBLE | HOST_COHERENT)
//!         └── region [0..256)
//! ```
//!
//! Every arena creates a single buffer spanning its whole allocation, so a
//! tensor is addressed as (arena buffer, byte offset). Regions go back to the
//! free list when the last tensor handle referencing them is dropped.

use ash::vk;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::buffer::find_memory_type;
use crate::config::RecorderConfig;
use crate::device::DeviceRef;
use crate::error::CommandErrorKind;
use crate::tensor::{checked_byte_size, DeviceTensor, HostTensor};

/// Minimum allocation granularity (256 bytes, covers minStorageBufferOffsetAlignment)
pub const ALLOCATION_GRANULARITY: u64 = 256;

fn align_up(size: u64) -> u64 {
    size.max(1)
        .div_ceil(ALLOCATION_GRANULARITY)
        .saturating_mul(ALLOCATION_GRANULARITY)
}

// =============================================================================
// MEMORY ARENA
// =============================================================================

/// Single memory allocation sub-allocated first-fit.
pub struct MemoryArena {
    memory: vk::DeviceMemory,

    /// Buffer spanning the whole allocation
    buffer: vk::Buffer,

    total_size: u64,

    properties: vk::MemoryPropertyFlags,

    /// Free list: (offset, size) pairs sorted by offset, never adjacent
    free_list: Mutex<Vec<(u64, u64)>>,

    /// Memory may only be mapped once at a time
    map_lock: Mutex<()>,

    device: DeviceRef,
}

impl MemoryArena {
    /// Create a new memory arena
    ///
    /// # Arguments
    ///
    /// * `device` - Device to allocate from
    /// * `size` - Total arena size in bytes
    /// * `properties` - Memory property flags
    /// * `usage` - Usage of the spanning buffer
    pub fn new(
        device: DeviceRef,
        size: u64,
        properties: vk::MemoryPropertyFlags,
        usage: vk::BufferUsageFlags,
    ) -> Result<Arc<Self>, CommandErrorKind> {
        let total_size = align_up(size);
        let mut arena = Self {
            memory: vk::DeviceMemory::null(),
            buffer: vk::Buffer::null(),
            total_size,
            properties,
            free_list: Mutex::new(vec![(0, total_size)]),
            map_lock: Mutex::new(()),
            device,
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(total_size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        arena.buffer = unsafe { arena.device.create_buffer(&buffer_info) }
            .map_err(|e| CommandErrorKind::creation("arena buffer", e))?;

        let requirements = unsafe { arena.device.get_buffer_memory_requirements(arena.buffer) };

        let memory_type_index = find_memory_type(
            &arena.device.info().memory_properties,
            requirements.memory_type_bits,
            properties,
        )
        .ok_or_else(|| {
            log::error!("No suitable memory type found for arena ({:?})", properties);
            CommandErrorKind::NoSuitableMemoryType(properties)
        })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        arena.memory = unsafe { arena.device.allocate_memory(&alloc_info) }
            .map_err(|e| CommandErrorKind::creation("arena memory", e))?;

        unsafe { arena.device.bind_buffer_memory(arena.buffer, arena.memory, 0) }
            .map_err(|e| CommandErrorKind::creation("arena memory binding", e))?;

        log::info!(
            "Created MemoryArena: size={} bytes ({} MB), properties={:?}",
            total_size,
            total_size / (1024 * 1024),
            properties
        );

        Ok(Arc::new(arena))
    }

    fn free_list(&self) -> MutexGuard<'_, Vec<(u64, u64)>> {
        self.free_list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `size` bytes (rounded up to [`ALLOCATION_GRANULARITY`]).
    pub fn allocate(self: &Arc<Self>, size: u64) -> Result<ArenaRegion, CommandErrorKind> {
        let aligned_size = align_up(size);
        let mut free_list = self.free_list();

        let index = free_list
            .iter()
            .position(|&(_, free_size)| free_size >= aligned_size)
            .ok_or_else(|| {
                let free: u64 = free_list.iter().map(|(_, s)| s).sum();
                log::error!(
                    "Arena out of memory: requested {} bytes, {} free",
                    aligned_size,
                    free
                );
                CommandErrorKind::OutOfArenaMemory {
                    requested: aligned_size,
                    free,
                }
            })?;

        let (offset, free_size) = free_list[index];
        if free_size == aligned_size {
            free_list.remove(index);
        } else {
            free_list[index] = (offset + aligned_size, free_size - aligned_size);
        }

        log::debug!("Allocated {} bytes at offset {}", aligned_size, offset);

        Ok(ArenaRegion {
            arena: Arc::clone(self),
            offset,
            size: aligned_size,
        })
    }

    /// Return a region to the free list, merging with its neighbours.
    fn free_region(&self, offset: u64, size: u64) {
        let mut free_list = self.free_list();

        let index = free_list.partition_point(|&(o, _)| o < offset);
        free_list.insert(index, (offset, size));

        // Merge with next
        if index + 1 < free_list.len() {
            let (next_offset, next_size) = free_list[index + 1];
            if offset + size == next_offset {
                free_list[index].1 += next_size;
                free_list.remove(index + 1);
            }
        }
        // Merge with previous
        if index > 0 {
            let (prev_offset, prev_size) = free_list[index - 1];
            if prev_offset + prev_size == offset {
                free_list[index - 1].1 += free_list[index].1;
                free_list.remove(index);
            }
        }

        log::debug!("Freed {} bytes at offset {}", size, offset);
    }

    /// Map `[offset, offset+len)`, run `f` on the mapped bytes, unmap.
    fn with_mapped<R>(
        &self,
        offset: u64,
        len: usize,
        f: impl FnOnce(*mut u8) -> R,
    ) -> Result<R, CommandErrorKind> {
        if !self.is_host_visible() {
            return Err(CommandErrorKind::NoSuitableMemoryType(
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            ));
        }
        if len == 0 {
            return Ok(f(std::ptr::null_mut()));
        }

        let _guard = self.map_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let ptr = unsafe { self.device.map_memory(self.memory, offset, len as u64) }
            .map_err(|e| CommandErrorKind::creation("arena memory mapping", e))?;
        let result = f(ptr as *mut u8);
        unsafe { self.device.unmap_memory(self.memory) };
        Ok(result)
    }

    /// Buffer spanning the arena
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Get arena statistics
    pub fn stats(&self) -> ArenaStats {
        let free_list = self.free_list();
        let free_bytes: u64 = free_list.iter().map(|(_, size)| size).sum();

        ArenaStats {
            total_bytes: self.total_size,
            used_bytes: self.total_size - free_bytes,
            free_bytes,
            free_regions: free_list.len(),
        }
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        log::info!("Destroying MemoryArena (size={} bytes)", self.total_size);
        unsafe {
            if self.buffer != vk::Buffer::null() {
                self.device.destroy_buffer(self.buffer);
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory);
            }
        }
    }
}

/// Arena memory statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub free_bytes: u64,
    pub free_regions: usize,
}

/// Byte range owned within a [`MemoryArena`]; returned to it on drop.
pub struct ArenaRegion {
    arena: Arc<MemoryArena>,
    offset: u64,
    size: u64,
}

impl ArenaRegion {
    pub fn buffer(&self) -> vk::Buffer {
        self.arena.buffer
    }

    /// Offset of the region within the arena buffer
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Copy `data` into the start of the region (host-visible arenas only).
    pub fn write(&self, data: &[u8]) -> Result<(), CommandErrorKind> {
        self.check_len(data.len())?;
        self.arena.with_mapped(self.offset, data.len(), |ptr| unsafe {
            if !ptr.is_null() {
                std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
            }
        })?;
        log::debug!("Wrote {} bytes to region at offset {}", data.len(), self.offset);
        Ok(())
    }

    /// Copy the start of the region into `out` (host-visible arenas only).
    pub fn read(&self, out: &mut [u8]) -> Result<(), CommandErrorKind> {
        self.check_len(out.len())?;
        let len = out.len();
        self.arena.with_mapped(self.offset, len, |ptr| unsafe {
            if !ptr.is_null() {
                std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len);
            }
        })?;
        log::debug!("Read {} bytes from region at offset {}", len, self.offset);
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<(), CommandErrorKind> {
        if len as u64 > self.size {
            return Err(CommandErrorKind::ShapeMismatch {
                expected: self.size as usize,
                actual: len,
            });
        }
        Ok(())
    }
}

impl Drop for ArenaRegion {
    fn drop(&mut self) {
        self.arena.free_region(self.offset, self.size);
    }
}

// =============================================================================
// TENSOR ALLOCATOR
// =============================================================================

/// Device-local and staging arenas used to materialise tensors.
pub struct TensorAllocator {
    /// Storage for tensors read and written by compute work
    device_arena: Arc<MemoryArena>,

    /// Host-visible per-tensor staging
    staging_arena: Arc<MemoryArena>,
}

impl TensorAllocator {
    /// Create both arenas with the sizes from `config`.
    pub fn new(device: DeviceRef, config: &RecorderConfig) -> Result<Self, CommandErrorKind> {
        let device_arena = MemoryArena::new(
            device.clone(),
            config.device_arena_size,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        let staging_arena = MemoryArena::new(
            device,
            config.staging_arena_size,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
        )?;

        log::info!(
            "Created TensorAllocator: device={} MB, staging={} MB",
            config.device_arena_size / (1024 * 1024),
            config.staging_arena_size / (1024 * 1024)
        );

        Ok(Self {
            device_arena,
            staging_arena,
        })
    }

    /// Device tensor of the given shape, no staging.
    pub fn create(&self, shape: &[u32], elem_size: usize) -> Result<DeviceTensor, CommandErrorKind> {
        let bytes = shape_bytes(shape, elem_size)?;
        let region = self.device_arena.allocate(bytes)?;
        Ok(DeviceTensor::from_region(region, None, shape.to_vec(), elem_size))
    }

    /// Device tensor with the same shape and element size as `host`.
    pub fn create_like(&self, host: &HostTensor) -> Result<DeviceTensor, CommandErrorKind> {
        self.create(host.shape(), host.elem_size())
    }

    /// Device tensor plus a staging region of the same size.
    pub fn create_with_staging(
        &self,
        shape: &[u32],
        elem_size: usize,
    ) -> Result<DeviceTensor, CommandErrorKind> {
        let bytes = shape_bytes(shape, elem_size)?;
        let region = self.device_arena.allocate(bytes)?;
        let staging = self.staging_arena.allocate(bytes)?;
        Ok(DeviceTensor::from_region(
            region,
            Some(staging),
            shape.to_vec(),
            elem_size,
        ))
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            device: self.device_arena.stats(),
            staging: self.staging_arena.stats(),
        }
    }
}

fn shape_bytes(shape: &[u32], elem_size: usize) -> Result<u64, CommandErrorKind> {
    checked_byte_size(shape, elem_size).map(|bytes| bytes as u64)
}

/// Allocator statistics
#[derive(Debug, Clone, Copy)]
pub struct AllocatorStats {
    pub device: ArenaStats,
    pub staging: ArenaStats,
}

// =============================================================================
// TESTS
// =============================================================================
