//! Over-the-air firmware update
//!
//! Workflow: validate → prepare → transfer chunks → verify → install → reboot.
//! Directives are fire-and-forget frames sent through the [`SessionEngine`]
//! device registry; the device is given a fixed settle time after each one.
//!
//! [`SessionEngine`]: crate::session::SessionEngine

mod engine;
mod error;
mod firmware;
mod frames;

pub use engine::{OtaEngine, OtaStatusSnapshot};
pub use error::OtaError;
pub use firmware::{extract_version, file_checksum, validate_firmware, FirmwareInfo};
pub use frames::{chunk_frame, command_frame, OtaDirective};

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default firmware chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Version reported when neither the file name nor `version.txt` has one
pub const DEFAULT_FIRMWARE_VERSION: &str = "1.0.0";

/// OTA job state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaStatus {
    /// No job; ready to start one
    Idle,
    /// Checking the firmware file
    Validating,
    /// Announcing the image to devices
    Preparing,
    /// Sending chunks
    Transferring,
    /// Checksum verification
    Verifying,
    /// Install directive sent
    Installing,
    /// Last job finished
    Completed,
    /// Last job failed
    Failed,
    /// Last job was cancelled
    Cancelled,
}

impl OtaStatus {
    /// Lower-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaStatus::Idle => "idle",
            OtaStatus::Validating => "validating",
            OtaStatus::Preparing => "preparing",
            OtaStatus::Transferring => "transferring",
            OtaStatus::Verifying => "verifying",
            OtaStatus::Installing => "installing",
            OtaStatus::Completed => "completed",
            OtaStatus::Failed => "failed",
            OtaStatus::Cancelled => "cancelled",
        }
    }

    /// A job is running in this state
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            OtaStatus::Idle | OtaStatus::Completed | OtaStatus::Failed | OtaStatus::Cancelled
        )
    }

    /// Cancellation is only honoured before the point of no return
    pub fn is_cancellable(&self) -> bool {
        matches!(self, OtaStatus::Preparing | OtaStatus::Transferring)
    }
}

impl fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OTA engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    /// Bytes per chunk frame
    pub chunk_size: usize,
    /// Settle time after the prepare directive, per device
    pub prepare_settle_ms: u64,
    /// Pause between consecutive chunks
    pub chunk_delay_ms: u64,
    /// Settle time after the verify directive, per device
    pub verify_settle_ms: u64,
    /// Settle time after the install directive, per device
    pub install_settle_ms: u64,
    /// Send verify directives carrying the firmware checksum
    pub verify_checksum: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            prepare_settle_ms: 500,
            chunk_delay_ms: 10,
            verify_settle_ms: 1000,
            install_settle_ms: 2000,
            verify_checksum: true,
        }
    }
}

impl OtaConfig {
    /// Settle time after `PREPARE`
    pub fn prepare_settle(&self) -> Duration {
        Duration::from_millis(self.prepare_settle_ms)
    }

    /// Pause between chunks
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    /// Settle time after `VERIFY`
    pub fn verify_settle(&self) -> Duration {
        Duration::from_millis(self.verify_settle_ms)
    }

    /// Settle time after `INSTALL`
    pub fn install_settle(&self) -> Duration {
        Duration::from_millis(self.install_settle_ms)
    }

    /// Chunk size, never zero
    pub fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
