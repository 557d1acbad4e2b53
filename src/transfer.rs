//! Batched host↔device transfers
//!
//! A [`TransferRecorder`] collects uploads and downloads, then moves all of
//! them through one staging buffer in one submission:
//!
//! ```text
//!   staging buffer (sized to the sum of all entries, in record order)
//!   ┌──────────┬────────────────────┬──────┐
//!   │ upload 0 │ download 1         │ up 2 │
//!   └──────────┴────────────────────┴──────┘
//!   0          s0                   s0+s1  s0+s1+s2
//! ```
//!
//! `submit()` writes upload sources into their slots and records one copy
//! per entry; `wait()` reads download slots back out and releases the
//! staging buffer. Both compute slot offsets with [`staging_layout`] over
//! the same entry list, so they always agree.

use ash::vk;
use std::collections::HashMap;

use crate::allocator::TensorAllocator;
use crate::buffer::StagingBuffer;
use crate::command::CommandContext;
use crate::device::DeviceRef;
use crate::error::CommandErrorKind;
use crate::tensor::{DeviceTensor, HostTensor};

/// Handle to the result of one `record_download`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DownloadSlot(u64);

/// Direction of one pending transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Each entry holds a clone of its device tensor, so the arena region stays
/// reserved until the batch has been waited on even if the caller drops
/// every handle first.
enum TransferEntry<'a> {
    Upload {
        source: &'a HostTensor,
        target: DeviceTensor,
    },
    Download {
        destination: HostTensor,
        slot: DownloadSlot,
        source: DeviceTensor,
    },
}

impl TransferEntry<'_> {
    fn size(&self) -> vk::DeviceSize {
        match self {
            TransferEntry::Upload { source, .. } => source.byte_size() as vk::DeviceSize,
            TransferEntry::Download { destination, .. } => {
                destination.byte_size() as vk::DeviceSize
            }
        }
    }

    fn direction(&self) -> TransferDirection {
        match self {
            TransferEntry::Upload { .. } => TransferDirection::Upload,
            TransferEntry::Download { .. } => TransferDirection::Download,
        }
    }
}

/// Staging offset of every entry (left-to-right prefix sum) and the total.
pub fn staging_layout<I>(sizes: I) -> (Vec<vk::DeviceSize>, vk::DeviceSize)
where
    I: IntoIterator<Item = vk::DeviceSize>,
{
    let mut total = 0;
    let offsets = sizes
        .into_iter()
        .map(|size| {
            let offset = total;
            total += size;
            offset
        })
        .collect();
    (offsets, total)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    /// Accepting record calls
    Recording,
    Submitted,
    Failed,
}

impl TransferState {
    pub fn name(self) -> &'static str {
        match self {
            TransferState::Recording => "recording",
            TransferState::Submitted => "submitted",
            TransferState::Failed => "failed",
        }
    }
}

/// Batches uploads and downloads into one submission per cycle.
///
/// Upload sources are borrowed until the batch that reads them has been
/// submitted. The recorder can run any number of record/submit/wait cycles.
pub struct TransferRecorder<'a> {
    /// Declared first: an in-flight submission is waited out before the
    /// staging buffer below is destroyed
    context: CommandContext,

    allocator: &'a TensorAllocator,

    entries: Vec<TransferEntry<'a>>,

    /// Only present between `submit()` and `wait()`
    staging: Option<StagingBuffer>,

    completed: HashMap<DownloadSlot, HostTensor>,

    next_slot: u64,

    state: TransferState,
}

impl<'a> TransferRecorder<'a> {
    /// Create a recorder on the device's compute queue family; device
    /// tensors for uploads come from `allocator`.
    pub fn new(device: DeviceRef, allocator: &'a TensorAllocator) -> Result<Self, CommandErrorKind> {
        let queue_family = device.info().compute_queue_family;
        let context = CommandContext::new(device, queue_family)?;

        Ok(Self {
            context,
            allocator,
            entries: Vec::new(),
            staging: None,
            completed: HashMap::new(),
            next_slot: 0,
            state: TransferState::Recording,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Number of entries waiting for the next submit.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Direction and size of each pending entry, in record order.
    pub fn pending_entries(&self) -> Vec<(TransferDirection, vk::DeviceSize)> {
        self.entries
            .iter()
            .map(|e| (e.direction(), e.size()))
            .collect()
    }

    /// Staging offsets and total size for the pending entries.
    pub fn staging_layout(&self) -> (Vec<vk::DeviceSize>, vk::DeviceSize) {
        staging_layout(self.entries.iter().map(TransferEntry::size))
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: TransferState,
    ) -> Result<(), CommandErrorKind> {
        if self.state == expected {
            return Ok(());
        }
        log::error!("{} called on a {} transfer", operation, self.state.name());
        Err(CommandErrorKind::InvalidState {
            operation,
            state: self.state.name(),
        })
    }

    fn track<T>(&mut self, result: Result<T, CommandErrorKind>) -> Result<T, CommandErrorKind> {
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("TransferRecorder failed: {}", e);
                self.state = TransferState::Failed;
            }
        }
        result
    }

    /// Allocate a device tensor shaped like `host` and schedule `host` to be
    /// copied into it.
    pub fn record_upload(&mut self, host: &'a HostTensor) -> Result<DeviceTensor, CommandErrorKind> {
        self.expect_state("record_upload", TransferState::Recording)?;

        let tensor = self.allocator.create_like(host)?;
        self.entries.push(TransferEntry::Upload {
            source: host,
            target: tensor.clone(),
        });

        log::trace!(
            "record_upload: {} bytes -> {:?}+{}",
            host.byte_size(),
            tensor.buffer(),
            tensor.offset()
        );
        Ok(tensor)
    }

    /// Schedule `tensor` to be copied back to the host. The result is
    /// claimed with [`TransferRecorder::take_download`] after `wait()`.
    pub fn record_download(&mut self, tensor: &DeviceTensor) -> Result<DownloadSlot, CommandErrorKind> {
        self.expect_state("record_download", TransferState::Recording)?;

        let destination = HostTensor::zeros_like(tensor)?;
        let slot = DownloadSlot(self.next_slot);
        self.next_slot += 1;

        self.entries.push(TransferEntry::Download {
            destination,
            slot,
            source: tensor.clone(),
        });

        log::trace!(
            "record_download: {:?}+{} ({} bytes) -> {:?}",
            tensor.buffer(),
            tensor.offset(),
            tensor.byte_size(),
            slot
        );
        Ok(slot)
    }

    /// Stage every upload and submit one copy per entry.
    ///
    /// # Errors
    ///
    /// Staging allocation, mapping or submission failures leave nothing
    /// transferred and fail the recorder; `wait()` must not be called.
    pub fn submit(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("submit", TransferState::Recording)?;
        let result = self.stage_and_submit();
        self.track(result)?;

        self.state = TransferState::Submitted;
        Ok(())
    }

    fn stage_and_submit(&mut self) -> Result<(), CommandErrorKind> {
        let (offsets, total) = self.staging_layout();

        // Vulkan buffers cannot be empty
        let mut staging = StagingBuffer::new(self.context.device().clone(), total.max(1))?;
        staging.map()?;

        for (entry, &offset) in self.entries.iter().zip(&offsets) {
            if let TransferEntry::Upload { source, .. } = entry {
                staging.write_at(offset as usize, source.data())?;
            }
        }

        self.context.begin_recording()?;
        let device = self.context.device();
        let command_buffer = self.context.command_buffer();
        for (entry, &staging_offset) in self.entries.iter().zip(&offsets) {
            let size = entry.size();
            if size == 0 {
                continue;
            }
            match entry {
                TransferEntry::Upload { target, .. } => unsafe {
                    device.cmd_copy_buffer(
                        command_buffer,
                        staging.handle(),
                        target.buffer(),
                        &[vk::BufferCopy {
                            src_offset: staging_offset,
                            dst_offset: target.offset(),
                            size,
                        }],
                    );
                },
                TransferEntry::Download { source, .. } => unsafe {
                    device.cmd_copy_buffer(
                        command_buffer,
                        source.buffer(),
                        staging.handle(),
                        &[vk::BufferCopy {
                            src_offset: source.offset(),
                            dst_offset: staging_offset,
                            size,
                        }],
                    );
                },
            }
        }
        self.context.end_recording()?;
        self.context.submit()?;

        log::debug!(
            "Transfer submitted: {} entries, {} staging bytes",
            self.entries.len(),
            total
        );
        self.staging = Some(staging);
        Ok(())
    }

    /// Wait for the batch, copy downloads out, release the staging buffer.
    pub fn wait(&mut self) -> Result<(), CommandErrorKind> {
        self.expect_state("wait", TransferState::Submitted)?;
        let result = self.wait_and_collect();
        self.track(result)?;

        self.state = TransferState::Recording;
        Ok(())
    }

    fn wait_and_collect(&mut self) -> Result<(), CommandErrorKind> {
        self.context.wait()?;

        let (offsets, _) = self.staging_layout();
        let mut staging = self.staging.take().ok_or(CommandErrorKind::InvalidState {
            operation: "wait",
            state: "unstaged",
        })?;

        for (entry, offset) in self.entries.drain(..).zip(offsets) {
            if let TransferEntry::Download {
                mut destination,
                slot,
                ..
            } = entry
            {
                staging.read_at(offset as usize, destination.data_mut())?;
                self.completed.insert(slot, destination);
            }
        }

        staging.unmap();
        drop(staging);

        log::debug!("Transfer complete");
        Ok(())
    }

    /// Claim a finished download. `None` until the batch containing it has
    /// been waited on, and after the result was taken once.
    pub fn take_download(&mut self, slot: DownloadSlot) -> Option<HostTensor> {
        self.completed.remove(&slot)
    }
}
