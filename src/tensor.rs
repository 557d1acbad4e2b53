//! Host and device tensors
//!
//! A [`HostTensor`] owns its bytes in host memory. A [`DeviceTensor`] is a
//! view of `(buffer, offset)` in device memory plus the shape needed to
//! compute its byte size, and optionally a host-visible staging region of
//! the same size. Cloning a device tensor shares the underlying allocation.

use ash::vk;
use std::sync::Arc;

use crate::allocator::ArenaRegion;
use crate::error::CommandErrorKind;

fn element_count(shape: &[u32]) -> usize {
    shape.iter().map(|&d| d as usize).product()
}

/// Byte size of a `shape` of `elem_size`-byte elements, or `ShapeOverflow`
/// when the product does not fit in `usize`. Every constructor goes through
/// this, so the unchecked accessors on built tensors cannot wrap.
pub(crate) fn checked_byte_size(
    shape: &[u32],
    elem_size: usize,
) -> Result<usize, CommandErrorKind> {
    shape
        .iter()
        .try_fold(elem_size, |acc, &d| acc.checked_mul(d as usize))
        .ok_or_else(|| CommandErrorKind::ShapeOverflow {
            shape: shape.to_vec(),
            elem_size,
        })
}

/// Tensor in host memory.
#[derive(Clone, Debug, PartialEq)]
pub struct HostTensor {
    shape: Vec<u32>,
    elem_size: usize,
    data: Vec<u8>,
}

impl HostTensor {
    /// Zero-filled tensor.
    pub fn zeros(shape: &[u32], elem_size: usize) -> Result<Self, CommandErrorKind> {
        let bytes = checked_byte_size(shape, elem_size)?;
        Ok(Self {
            shape: shape.to_vec(),
            elem_size,
            data: vec![0; bytes],
        })
    }

    /// Wrap raw bytes; `data.len()` must equal element count × `elem_size`.
    pub fn from_bytes(
        shape: &[u32],
        elem_size: usize,
        data: Vec<u8>,
    ) -> Result<Self, CommandErrorKind> {
        let expected = checked_byte_size(shape, elem_size)?;
        if data.len() != expected {
            return Err(CommandErrorKind::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            elem_size,
            data,
        })
    }

    pub fn from_f32(shape: &[u32], values: &[f32]) -> Result<Self, CommandErrorKind> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(shape, 4, data)
    }

    /// Host tensor matching a device tensor's shape and element size.
    pub fn zeros_like(tensor: &DeviceTensor) -> Result<Self, CommandErrorKind> {
        Self::zeros(tensor.shape(), tensor.elem_size())
    }

    /// Interpret the bytes as little-endian f32 values.
    pub fn to_f32(&self) -> Vec<f32> {
        self.data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Where a device tensor's bytes live.
#[derive(Clone)]
enum Storage {
    /// Region of a [`crate::allocator::MemoryArena`], released with the last clone
    Arena(Arc<ArenaRegion>),

    /// Buffer owned by the caller
    External { buffer: vk::Buffer, offset: u64 },
}

/// Tensor in device memory, addressed as (buffer, byte offset).
#[derive(Clone)]
pub struct DeviceTensor {
    storage: Storage,
    staging: Option<Arc<ArenaRegion>>,
    shape: Vec<u32>,
    elem_size: usize,
}

impl DeviceTensor {
    pub(crate) fn from_region(
        region: ArenaRegion,
        staging: Option<ArenaRegion>,
        shape: Vec<u32>,
        elem_size: usize,
    ) -> Self {
        Self {
            storage: Storage::Arena(Arc::new(region)),
            staging: staging.map(Arc::new),
            shape,
            elem_size,
        }
    }

    /// View of a caller-owned buffer. The buffer must outlive every
    /// submission that references the tensor.
    pub fn from_buffer(
        buffer: vk::Buffer,
        offset: u64,
        shape: &[u32],
        elem_size: usize,
    ) -> Result<Self, CommandErrorKind> {
        checked_byte_size(shape, elem_size)?;
        Ok(Self {
            storage: Storage::External { buffer, offset },
            staging: None,
            shape: shape.to_vec(),
            elem_size,
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        match &self.storage {
            Storage::Arena(region) => region.buffer(),
            Storage::External { buffer, .. } => *buffer,
        }
    }

    /// Byte offset of the tensor within [`DeviceTensor::buffer`]
    pub fn offset(&self) -> u64 {
        match &self.storage {
            Storage::Arena(region) => region.offset(),
            Storage::External { offset, .. } => *offset,
        }
    }

    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }

    pub fn byte_size(&self) -> u64 {
        (self.element_count() * self.elem_size) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.byte_size() == 0
    }

    pub fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// Staging buffer and offset within it, if the tensor has one.
    pub fn staging(&self) -> Option<(vk::Buffer, u64)> {
        self.staging.as_ref().map(|s| (s.buffer(), s.offset()))
    }

    /// Binding window for descriptor writes.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.buffer(),
            offset: self.offset(),
            range: self.byte_size(),
        }
    }

    /// Fill the staging region from host bytes.
    pub fn write_staging(&self, data: &[u8]) -> Result<(), CommandErrorKind> {
        let staging = self.staging.as_ref().ok_or(CommandErrorKind::MissingStaging)?;
        if data.len() as u64 != self.byte_size() {
            return Err(CommandErrorKind::ShapeMismatch {
                expected: self.byte_size() as usize,
                actual: data.len(),
            });
        }
        staging.write(data)
    }

    /// Copy the staging region out into a new host tensor.
    pub fn read_staging(&self) -> Result<HostTensor, CommandErrorKind> {
        let staging = self.staging.as_ref().ok_or(CommandErrorKind::MissingStaging)?;
        let mut host = HostTensor::zeros_like(self)?;
        staging.read(host.data_mut())?;
        Ok(host)
    }
}

impl std::fmt::Debug for DeviceTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("buffer", &self.buffer())
            .field("offset", &self.offset())
            .field("shape", &self.shape)
            .field("elem_size", &self.elem_size)
            .field("staging", &self.staging())
            .finish()
    }
}
