//! Frame encoding and decoding
//!
//! Every frame is a single JSON object. Commands carry a `cmd` discriminator,
//! acknowledgements a `res` discriminator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use super::{encode_value, BitWidth, CodecError, ElementType, RawValue, HEX_PREFIX};

/// Commands understood by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Open a debug session
    Init {
        /// Connection token
        con_id: String,
    },
    /// Close the debug session
    End {
        /// Connection token
        con_id: String,
    },
    /// Read one element of memory
    MemRead {
        /// `0x`-prefixed eight-digit address
        #[serde(rename = "add")]
        address: String,
        /// Two-digit access width in bits
        size: String,
    },
    /// Write one element of memory
    MemWrite {
        /// `0x`-prefixed eight-digit address
        #[serde(rename = "add")]
        address: String,
        /// Two-digit access width in bits
        size: String,
        /// `0b`-prefixed value bits
        data: String,
    },
}

impl Command {
    /// Render the command as a text frame
    pub fn to_frame(&self) -> String {
        // Only string fields, so serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Kind of acknowledgement this command expects
    pub fn expected_response(&self) -> ResponseKind {
        match self {
            Command::Init { .. } => ResponseKind::Init,
            Command::End { .. } => ResponseKind::End,
            Command::MemRead { .. } => ResponseKind::MemRead,
            Command::MemWrite { .. } => ResponseKind::MemWrite,
        }
    }
}

/// Acknowledgement kinds, used to correlate a response with its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// `init` acknowledgement
    Init,
    /// `end` acknowledgement
    End,
    /// `mem_read` result
    MemRead,
    /// `mem_write` result
    MemWrite,
}

/// A decoded device frame
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Session opened
    InitAck {
        /// Connection token echoed by the device
        con_id: String,
    },
    /// Session closed
    EndAck {
        /// Connection token echoed by the device
        con_id: String,
    },
    /// Result of a memory read
    MemReadAck {
        /// Address the device actually read
        address: u32,
        /// Decoded value bits
        value: RawValue,
        /// Value text exactly as received
        raw_value: String,
    },
    /// Result of a memory write
    MemWriteAck {
        /// Address the device wrote
        address: u32,
        /// Device reported `success`
        success: bool,
    },
    /// Malformed or unrecognized frame
    Error {
        /// Frame text as received
        raw: String,
        /// Why it could not be decoded
        reason: String,
    },
}

impl Response {
    /// Correlation kind, `None` for error frames
    pub fn kind(&self) -> Option<ResponseKind> {
        match self {
            Response::InitAck { .. } => Some(ResponseKind::Init),
            Response::EndAck { .. } => Some(ResponseKind::End),
            Response::MemReadAck { .. } => Some(ResponseKind::MemRead),
            Response::MemWriteAck { .. } => Some(ResponseKind::MemWrite),
            Response::Error { .. } => None,
        }
    }

    /// Frame could not be decoded
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

/// Format an address as `0x` followed by eight upper-case hex digits
pub fn format_address(address: u32) -> String {
    format!("{}{:08X}", HEX_PREFIX, address)
}

/// Parse a hex address, with or without the `0x` prefix
pub fn parse_address(text: &str) -> Result<u32, CodecError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(CodecError::InvalidAddress(text.to_string()));
    }
    u32::from_str_radix(digits, 16).map_err(|_| CodecError::InvalidAddress(text.to_string()))
}

/// Build an `init` frame
pub fn encode_init(connection_id: &str) -> String {
    Command::Init {
        con_id: connection_id.to_string(),
    }
    .to_frame()
}

/// Build an `end` frame
pub fn encode_end(connection_id: &str) -> String {
    Command::End {
        con_id: connection_id.to_string(),
    }
    .to_frame()
}

/// Build a `mem_read` frame
pub fn encode_mem_read(address: u32, width: BitWidth) -> String {
    Command::MemRead {
        address: format_address(address),
        size: width.size_field(),
    }
    .to_frame()
}

/// Build a `mem_write` frame, encoding `value` as binary text of `width` bits
pub fn encode_mem_write(
    address: u32,
    width: BitWidth,
    value: f64,
    element_type: ElementType,
) -> Result<String, CodecError> {
    let data = encode_value(value, width, element_type)?;
    Ok(Command::MemWrite {
        address: format_address(address),
        size: width.size_field(),
        data,
    }
    .to_frame())
}

/// Decode a device frame. Never fails: bad input becomes [`Response::Error`].
pub fn decode_response(message: &str) -> Response {
    match try_decode(message) {
        Ok(response) => response,
        Err(reason) => {
            debug!(%reason, frame = message, "Undecodable frame");
            Response::Error {
                raw: message.to_string(),
                reason,
            }
        }
    }
}

fn try_decode(message: &str) -> Result<Response, String> {
    let parsed: JsonValue =
        serde_json::from_str(message).map_err(|e| format!("invalid JSON: {}", e))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| "frame is not a JSON object".to_string())?;
    let kind = str_field(object, "res").ok_or_else(|| "missing 'res' field".to_string())?;

    match kind {
        "init" => Ok(Response::InitAck {
            con_id: str_field(object, "con_id").unwrap_or_default().to_string(),
        }),
        "end" => Ok(Response::EndAck {
            con_id: str_field(object, "con_id").unwrap_or_default().to_string(),
        }),
        "mem_read" => {
            let address = address_field(object)?;
            let raw_value = str_field(object, "value")
                .ok_or_else(|| "missing 'value' field".to_string())?;
            let value = RawValue::parse(raw_value).map_err(|e| e.to_string())?;
            Ok(Response::MemReadAck {
                address,
                value,
                raw_value: raw_value.to_string(),
            })
        }
        "mem_write" => {
            let address = address_field(object)?;
            let success = str_field(object, "state") == Some("success");
            Ok(Response::MemWriteAck { address, success })
        }
        other => Err(format!("unknown response kind '{}'", other)),
    }
}

fn str_field<'a>(object: &'a Map<String, JsonValue>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(JsonValue::as_str)
}

fn address_field(object: &Map<String, JsonValue>) -> Result<u32, String> {
    let text = str_field(object, "add").ok_or_else(|| "missing 'add' field".to_string())?;
    parse_address(text).map_err(|e| e.to_string())
}
