//! Error types for nvme-io

use crate::nvme::{SeqId, Status};

/// Result type for nvme-io operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for nvme-io operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer size is zero or exceeds the platform maximum
    #[error("Buffer allocation of {size} bytes failed (max {max})")]
    Allocation { size: usize, max: usize },

    /// Field access outside the buffer, reversed, or wider than 8 bytes
    #[error("Byte range [{hi}:{lo}] invalid for buffer of {len} bytes")]
    Range { hi: usize, lo: usize, len: usize },

    /// Outstanding commands reached the queue depth
    #[error("Submission queue full (depth {depth})")]
    QueueFull { depth: usize },

    /// `waitdone` was already called successfully on this handle
    #[error("Command {0} already completed")]
    AlreadyCompleted(SeqId),

    /// Device reported a failure for the command
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Feature not supported by the device
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// Status payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Device posted a completion for an id with no outstanding command
    #[error("Completion for unknown command {0}")]
    UnknownCompletion(SeqId),

    /// Invalid argument provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Reading an external resource (firmware image) failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background poller thread panicked
    #[error("Poller thread panicked")]
    PollerPanic,
}

/// Failure of a single command as seen by `waitdone`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// No completion was posted within the command timeout
    #[error("command timed out")]
    Timeout,

    /// Command was aborted (controller shutdown or abort status)
    #[error("command aborted")]
    Aborted,

    /// Completion carried a non-success status
    #[error("status {0}")]
    StatusCode(Status),
}

impl Error {
    /// True if this is a device timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Device(DeviceError::Timeout))
    }
}

impl DeviceError {
    /// Classify a completion status. `None` means success.
    pub fn from_status(status: Status) -> Option<Self> {
        if !status.is_error() {
            None
        } else if status.is_abort() {
            Some(DeviceError::Aborted)
        } else {
            Some(DeviceError::StatusCode(status))
        }
    }
}
