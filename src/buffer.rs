//! Host-visible staging buffers
//!
//! A staging buffer is the intermediate hop for host↔device copies: host
//! bytes are written through a persistent mapping, the device copies out of
//! (or into) it with `vkCmdCopyBuffer`, and the buffer is destroyed once the
//! transfer that needed it has completed.

use ash::vk;
use std::ptr::NonNull;

use crate::device::DeviceRef;
use crate::error::CommandErrorKind;

/// Buffer + dedicated memory, mappable from the host.
///
/// Drop releases everything that was created, even if construction failed
/// half way (handles that were never created stay null and are skipped).
pub struct StagingBuffer {
    /// Vulkan buffer handle
    buffer: vk::Buffer,

    /// Memory backing the buffer
    memory: vk::DeviceMemory,

    /// Size requested by the caller in bytes
    size: vk::DeviceSize,

    /// Host address of the mapping while mapped
    mapped: Option<NonNull<u8>>,

    device: DeviceRef,
}

impl StagingBuffer {
    /// Create a host-visible, host-coherent buffer usable as copy source and destination.
    ///
    /// # Arguments
    ///
    /// * `device` - Device the buffer lives on
    /// * `size` - Size in bytes (must be non-zero)
    pub fn new(device: DeviceRef, size: vk::DeviceSize) -> Result<Self, CommandErrorKind> {
        let mut staging = Self {
            buffer: vk::Buffer::null(),
            memory: vk::DeviceMemory::null(),
            size,
            mapped: None,
            device,
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        staging.buffer = unsafe { staging.device.create_buffer(&buffer_info) }
            .map_err(|e| CommandErrorKind::creation("staging buffer", e))?;

        let requirements = unsafe { staging.device.get_buffer_memory_requirements(staging.buffer) };

        let properties =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let memory_type_index = find_memory_type(
            &staging.device.info().memory_properties,
            requirements.memory_type_bits,
            properties,
        )
        .ok_or_else(|| {
            log::error!("No host-visible memory type for staging buffer");
            CommandErrorKind::NoSuitableMemoryType(properties)
        })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        staging.memory = unsafe { staging.device.allocate_memory(&alloc_info) }
            .map_err(|e| CommandErrorKind::creation("staging memory", e))?;

        unsafe {
            staging
                .device
                .bind_buffer_memory(staging.buffer, staging.memory, 0)
        }
        .map_err(|e| CommandErrorKind::creation("staging memory binding", e))?;

        log::debug!(
            "Created staging buffer: size={} bytes, allocation={} bytes",
            size,
            requirements.size
        );

        Ok(staging)
    }

    /// Map the whole buffer into host address space.
    pub fn map(&mut self) -> Result<(), CommandErrorKind> {
        if self.mapped.is_some() {
            return Ok(());
        }

        let ptr = unsafe { self.device.map_memory(self.memory, 0, self.size) }
            .map_err(|e| CommandErrorKind::creation("staging memory mapping", e))?;

        self.mapped = NonNull::new(ptr as *mut u8);
        if self.mapped.is_none() {
            return Err(CommandErrorKind::creation(
                "staging memory mapping",
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            ));
        }
        Ok(())
    }

    /// Copy `data` into the mapping at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), CommandErrorKind> {
        let base = self.mapped_range(offset, data.len(), "write_at")?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Copy `out.len()` bytes out of the mapping at `offset`.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> Result<(), CommandErrorKind> {
        let base = self.mapped_range(offset, out.len(), "read_at")?;
        unsafe {
            std::ptr::copy_nonoverlapping(base.as_ptr().add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    fn mapped_range(
        &self,
        offset: usize,
        len: usize,
        operation: &'static str,
    ) -> Result<NonNull<u8>, CommandErrorKind> {
        let base = self.mapped.ok_or(CommandErrorKind::InvalidState {
            operation,
            state: "unmapped",
        })?;
        if (offset + len) as u64 > self.size {
            return Err(CommandErrorKind::ShapeMismatch {
                expected: self.size as usize,
                actual: offset + len,
            });
        }
        Ok(base)
    }

    pub fn unmap(&mut self) {
        if self.mapped.take().is_some() {
            unsafe { self.device.unmap_memory(self.memory) };
        }
    }

    /// Get the buffer handle for use in commands
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the buffer size in bytes
    pub fn len(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        log::debug!("Destroying staging buffer (size={})", self.size);
        self.unmap();
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

/// Find suitable memory type for buffer allocation.
///
/// Searches through available memory types for one that:
/// 1. Is supported by the buffer (type_filter)
/// 2. Has all required properties
///
/// # Returns
///
/// Memory type index if found, None otherwise
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimFailure};

    #[test]
    fn test_find_memory_type() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        let result = find_memory_type(
            &props,
            0b11,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        );
        assert_eq!(result, Some(1));

        // Type 1 excluded by the filter
        let result = find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert_eq!(result, None);
    }

    #[test]
    fn test_write_then_read_through_mapping() {
        let device = SimDevice::new(true);
        let mut staging = StagingBuffer::new(device.clone(), 16).unwrap();
        staging.map().unwrap();
        staging.write_at(4, &[9, 8, 7]).unwrap();

        let mut out = [0u8; 3];
        staging.read_at(4, &mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);

        assert!(staging.write_at(15, &[1, 2]).is_err());
    }

    #[test]
    fn test_unmapped_access_is_rejected() {
        let device = SimDevice::new(true);
        let mut staging = StagingBuffer::new(device, 8).unwrap();
        assert!(matches!(
            staging.write_at(0, &[1]),
            Err(CommandErrorKind::InvalidState { .. })
        ));
    }

    #[test]
    fn test_drop_after_failed_memory_allocation() {
        let device = SimDevice::new(true);
        device.fail_next(SimFailure::Memory);

        let result = StagingBuffer::new(device.clone(), 32);
        assert!(matches!(
            result,
            Err(CommandErrorKind::ResourceCreation { .. })
        ));
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_memory(), 0);
    }

    #[test]
    fn test_drop_releases_mapped_buffer() {
        let device = SimDevice::new(true);
        {
            let mut staging = StagingBuffer::new(device.clone(), 8).unwrap();
            staging.map().unwrap();
            assert_eq!(device.mapped_memory(), 1);
        }
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.live_memory(), 0);
    }
}
