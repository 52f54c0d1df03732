//! OTA errors

use std::path::PathBuf;

use thiserror::Error;

use super::OtaStatus;

/// Reasons an update cannot be started
#[derive(Error, Debug)]
pub enum OtaError {
    /// Path does not name a regular file
    #[error("Firmware file not found: {0}")]
    NotFound(PathBuf),

    /// File has zero length
    #[error("Firmware file is empty: {0}")]
    Empty(PathBuf),

    /// File could not be read
    #[error("Cannot read firmware file {path}: {source}")]
    Io {
        /// Firmware file
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// A job is already running
    #[error("OTA update already in progress ({0})")]
    Busy(OtaStatus),

    /// No target given and no device connected
    #[error("No devices available for update")]
    NoTargets,
}
