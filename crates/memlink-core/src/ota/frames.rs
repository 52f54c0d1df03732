//! OTA directive and chunk frames

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// Control directives sent during an update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OtaDirective {
    /// Announce the image and reserve space
    Prepare,
    /// Check the received image against its checksum
    Verify,
    /// Switch to the new image
    Install,
    /// Restart into the new image
    Reboot,
}

impl OtaDirective {
    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaDirective::Prepare => "PREPARE",
            OtaDirective::Verify => "VERIFY",
            OtaDirective::Install => "INSTALL",
            OtaDirective::Reboot => "REBOOT",
        }
    }
}

/// Seconds since the epoch with millisecond resolution
fn timestamp() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// `{"type":"ota_command","command":..,"data":..,"timestamp":..}`
pub fn command_frame(directive: OtaDirective, data: JsonValue) -> String {
    json!({
        "type": "ota_command",
        "command": directive.as_str(),
        "data": data,
        "timestamp": timestamp(),
    })
    .to_string()
}

/// One self-contained chunk of the image, payload hex-encoded
pub fn chunk_frame(chunk_num: u64, bytes: &[u8]) -> String {
    json!({
        "type": "ota_chunk",
        "chunk_num": chunk_num,
        "data": hex::encode(bytes),
        "size": bytes.len(),
        "crc32": crc32fast::hash(bytes),
        "timestamp": timestamp(),
    })
    .to_string()
}
