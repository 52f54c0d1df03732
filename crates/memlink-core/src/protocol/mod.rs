//! Device Protocol
//!
//! Implements the JSON text-frame protocol spoken by debug gateways:
//! session handshake (`init`/`end`), memory reads and memory writes.
//!
//! Scalar values travel as prefixed binary text (`0b0101...`), with integers
//! clamped to the target width and floats sent as their raw IEEE-754 bytes.

mod codec;
mod error;
mod types;
mod value;

pub use codec::{
    decode_response, encode_end, encode_init, encode_mem_read, encode_mem_write, format_address,
    parse_address, Command, Response, ResponseKind,
};
pub use error::CodecError;
pub use types::{map_type_to_bit_width, BitWidth, ElementType};
pub use value::{decode_value, encode_value, RawValue};

/// Default session token used in the `init`/`end` handshake
pub const DEFAULT_CONNECTION_ID: &str = "01";

/// Default timeout for acknowledgements in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Prefix of binary encoded values
pub const BINARY_PREFIX: &str = "0b";

/// Prefix of hex encoded values and addresses
pub const HEX_PREFIX: &str = "0x";
