//! Firmware file validation

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{OtaError, DEFAULT_FIRMWARE_VERSION};

/// Facts about a firmware image, computed once before a job starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Path as given
    pub file_path: PathBuf,
    /// File name without directory
    pub file_name: String,
    /// Size in bytes
    pub file_size: u64,
    /// Lower-case hex SHA-256 of the file contents
    pub checksum: String,
    /// Firmware version
    pub version: String,
    /// Chunks needed at `chunk_size`
    pub chunk_count: u64,
    /// Bytes per chunk
    pub chunk_size: usize,
}

/// Inspect a firmware file without starting a job
pub fn validate_firmware(path: &Path, chunk_size: usize) -> Result<FirmwareInfo, OtaError> {
    if !path.is_file() {
        return Err(OtaError::NotFound(path.to_path_buf()));
    }
    let io_error = |source: std::io::Error| OtaError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file_size = std::fs::metadata(path).map_err(io_error)?.len();
    if file_size == 0 {
        return Err(OtaError::Empty(path.to_path_buf()));
    }

    let chunk_size = chunk_size.max(1);
    let info = FirmwareInfo {
        file_path: path.to_path_buf(),
        file_name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        file_size,
        checksum: file_checksum(path).map_err(io_error)?,
        version: extract_version(path),
        chunk_count: file_size.div_ceil(chunk_size as u64),
        chunk_size,
    };

    info!(
        file = %info.file_name,
        size = info.file_size,
        version = %info.version,
        chunks = info.chunk_count,
        "Firmware validated"
    );
    Ok(info)
}

/// SHA-256 of a file, streamed in 4 KiB blocks
pub fn file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 4096];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Version from a `<name>_v<version>.<bin|hex>` file name, else from a
/// sibling `version.txt`, else the default.
pub fn extract_version(path: &Path) -> String {
    if let Some(version) = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(version_from_name)
    {
        return version;
    }

    if let Some(parent) = path.parent() {
        let version_file = parent.join("version.txt");
        if let Ok(content) = std::fs::read_to_string(&version_file) {
            let version = content.trim();
            if !version.is_empty() {
                debug!(file = %version_file.display(), version, "Version read from version.txt");
                return version.to_string();
            }
        }
    }

    DEFAULT_FIRMWARE_VERSION.to_string()
}

fn version_from_name(file_name: &str) -> Option<String> {
    let re = Regex::new(r"_v(.+?)(?:\.bin|\.hex)?$").ok()?;
    let version = re.captures(file_name)?.get(1)?.as_str();
    Some(version.to_string())
}
