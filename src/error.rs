//! Error types for command recording and transfer operations
//!
//! Every failure in this layer is fatal to the current unit of work. The
//! variants split along the three ways a unit of work can fail: a resource
//! could not be created, an operation was called in the wrong state, or the
//! device reported an error while executing submitted work.

use ash::vk;
use thiserror::Error;

/// Enumeration of all possible command-layer errors.
#[derive(Error, Debug)]
pub enum CommandErrorKind {
    /// Pool, buffer, fence, descriptor or staging allocation failed
    #[error("Failed to create {resource}: {result:?}")]
    ResourceCreation {
        resource: &'static str,
        result: vk::Result,
    },

    /// Operation called outside its valid recorder/context state
    #[error("{operation} is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    /// Queue submission or fence wait reported a device error
    #[error("{operation} failed on device: {result:?}")]
    DeviceExecution {
        operation: &'static str,
        result: vk::Result,
    },

    /// No memory type satisfies the requested property flags
    #[error("No suitable memory type found for {0:?}")]
    NoSuitableMemoryType(vk::MemoryPropertyFlags),

    /// Arena has no free region large enough
    #[error("Arena out of memory: requested {requested} bytes, {free} bytes free")]
    OutOfArenaMemory { requested: u64, free: u64 },

    /// Tensor has no host-visible staging buffer to copy through
    #[error("Tensor has no staging buffer")]
    MissingStaging,

    /// Byte length does not match shape × element size
    #[error("Shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// Element count × element size does not fit in a byte size
    #[error("Tensor of shape {shape:?} with {elem_size}-byte elements overflows")]
    ShapeOverflow { shape: Vec<u32>, elem_size: usize },

    /// Storage-buffer binding with no bytes to bind
    #[error("Binding {index} is an empty tensor")]
    EmptyBinding { index: usize },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CommandErrorKind {
    /// Integer status for callers that follow the 0 / negative convention.
    pub fn status(&self) -> i32 {
        match self {
            CommandErrorKind::ResourceCreation { .. }
            | CommandErrorKind::NoSuitableMemoryType(_)
            | CommandErrorKind::OutOfArenaMemory { .. } => -1,
            CommandErrorKind::InvalidState { .. } => -2,
            CommandErrorKind::DeviceExecution { .. } => -3,
            CommandErrorKind::MissingStaging
            | CommandErrorKind::ShapeMismatch { .. }
            | CommandErrorKind::ShapeOverflow { .. }
            | CommandErrorKind::EmptyBinding { .. }
            | CommandErrorKind::Config(_) => -4,
        }
    }

    /// Whether this error leaves the device-side unit of work unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommandErrorKind::ResourceCreation { .. }
                | CommandErrorKind::DeviceExecution { .. }
                | CommandErrorKind::NoSuitableMemoryType(_)
                | CommandErrorKind::OutOfArenaMemory { .. }
        )
    }

    pub(crate) fn creation(resource: &'static str, result: vk::Result) -> Self {
        log::error!("Failed to create {}: {:?}", resource, result);
        CommandErrorKind::ResourceCreation { resource, result }
    }

    pub(crate) fn execution(operation: &'static str, result: vk::Result) -> Self {
        log::error!("{} failed: {:?}", operation, result);
        CommandErrorKind::DeviceExecution { operation, result }
    }
}

impl From<serde_json::Error> for CommandErrorKind {
    fn from(err: serde_json::Error) -> Self {
        CommandErrorKind::Config(err.to_string())
    }
}

/// Fold a result into the 0 / negative status convention.
pub fn status_of<T>(result: &Result<T, CommandErrorKind>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommandErrorKind::ResourceCreation {
            resource: "command pool",
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        };
        assert!(err.to_string().contains("command pool"));
        assert!(err.to_string().contains("ERROR_OUT_OF_DEVICE_MEMORY"));
    }

    #[test]
    fn test_status_codes_are_negative() {
        let errors = [
            CommandErrorKind::creation("fence", vk::Result::ERROR_OUT_OF_HOST_MEMORY),
            CommandErrorKind::InvalidState {
                operation: "record_dispatch",
                state: "created",
            },
            CommandErrorKind::execution("queue_submit", vk::Result::ERROR_DEVICE_LOST),
            CommandErrorKind::MissingStaging,
        ];

        let codes: Vec<i32> = errors.iter().map(|e| e.status()).collect();
        assert_eq!(codes, vec![-1, -2, -3, -4]);
    }

    #[test]
    fn test_protocol_misuse_is_not_fatal() {
        let err = CommandErrorKind::InvalidState {
            operation: "wait",
            state: "recording",
        };
        assert!(!err.is_fatal());
        assert!(!CommandErrorKind::EmptyBinding { index: 0 }.is_fatal());
        assert!(
            CommandErrorKind::execution("wait_for_fences", vk::Result::ERROR_DEVICE_LOST).is_fatal()
        );
    }

    #[test]
    fn test_status_of() {
        let ok: Result<(), CommandErrorKind> = Ok(());
        let err: Result<(), CommandErrorKind> = Err(CommandErrorKind::MissingStaging);
        assert_eq!(status_of(&ok), 0);
        assert_eq!(status_of(&err), -4);
    }
}
