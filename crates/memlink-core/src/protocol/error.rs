//! Codec errors

use thiserror::Error;

use super::ElementType;

/// Errors that can occur while encoding or decoding protocol values
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Address text is not hex
    #[error("Invalid address: '{0}'")]
    InvalidAddress(String),

    /// Float requested at a width other than 32 or 64 bits
    #[error("{element_type} cannot be encoded in {bits} bits")]
    InvalidFloatWidth {
        /// Requested type
        element_type: ElementType,
        /// Requested width
        bits: u32,
    },

    /// NaN given for an integer type
    #[error("Cannot encode non-numeric value (NaN) as {0}")]
    NotANumber(ElementType),

    /// Value text is not binary, hex or decimal
    #[error("Invalid value text: '{0}'")]
    InvalidValue(String),

    /// Received bit count does not suit the element type
    #[error("Received {bits} bits, cannot decode as {element_type}")]
    WidthMismatch {
        /// Expected type
        element_type: ElementType,
        /// Bits received
        bits: u32,
    },
}
