//! Session errors

use thiserror::Error;

use crate::protocol::{CodecError, ResponseKind};

/// Errors from session-level operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Registry is empty
    #[error("No devices connected")]
    NoDevices,

    /// `init` was not acknowledged
    #[error("Debug session could not be initialized")]
    NotInitialized,

    /// No matching acknowledgement before the deadline
    #[error("Timed out after {timeout_ms}ms waiting for {expected:?} acknowledgement")]
    Timeout {
        /// Acknowledgement being waited for
        expected: ResponseKind,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// Last device disconnected while a request was pending
    #[error("Connection to all devices lost while waiting for a response")]
    TransportLost,

    /// Acknowledgement of the right kind with unusable content
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Element index at or past the element count
    #[error("Element {index} is out of range for variable '{name}'")]
    ElementOutOfRange {
        /// Variable name
        name: String,
        /// Requested index
        index: u32,
    },

    /// A monitoring loop is already running
    #[error("Monitoring is already active")]
    MonitoringActive,

    /// Value could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),
}
