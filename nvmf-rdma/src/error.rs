//! Error types for the NVMe-oF host engine

use crate::transport::{WcOpcode, WcStatus};
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, NvmfError>;

/// Work completion reported as failed by the transport.
///
/// The opcode is the side the completion was classified as (send or
/// receive); verbs does not define the opcode of an unsuccessful completion.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{opcode:?} WC status {}: {status:?}", status_code(.status))]
pub struct WorkCompletionError {
    pub opcode: WcOpcode,
    pub status: WcStatus,
}

fn status_code(status: &WcStatus) -> u32 {
    *status as u32
}

#[derive(Error, Debug)]
pub enum NvmfError {
    /// Every command identifier is occupied; poll and retry.
    #[error("Submission queue full")]
    QueueFull,

    #[error("No in-flight entry for command identifier {0}")]
    UnknownCommandIdentifier(u16),

    #[error("Transport failure: {0}")]
    TransportFailure(#[from] WorkCompletionError),

    #[error("Cannot allocate new region - limit of {regions} regions reached")]
    OutOfMemory { regions: usize },

    #[error("Double release of buffer")]
    DoubleRelease,

    #[error("Buffer used after release")]
    ReleasedBuffer,

    #[error("Timeout after {0:?} waiting for completion")]
    Timeout(Duration),

    #[error("Queue pair released")]
    QueuePairReleased,

    #[error("Operation result already retrieved")]
    ResultConsumed,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid {field} value 0x{value:x}")]
    InvalidWireValue { field: &'static str, value: u32 },

    #[error("Access of {len} bytes at index {index} out of bounds (capacity {capacity})")]
    OutOfBounds {
        index: usize,
        len: usize,
        capacity: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NvmfError {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        NvmfError::InvalidArgument(message.into())
    }

    /// Errors `poll` reports for a single completion record
    ///
    /// They leave the queue pair and every other in-flight command intact,
    /// so a waiter on some other command keeps polling.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            NvmfError::UnknownCommandIdentifier(_)
                | NvmfError::InvalidWireValue { .. }
                | NvmfError::InvalidArgument(_)
        )
    }

    pub(crate) fn invalid_wire(field: &'static str, value: impl Into<u32>) -> Self {
        NvmfError::InvalidWireValue {
            field,
            value: value.into(),
        }
    }
}
