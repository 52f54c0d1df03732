//! Binary text representation of scalar values
//!
//! Integers are written most significant bit first, clamped to the range of
//! the access width. Floats are written as the little-endian byte sequence of
//! their IEEE-754 pattern, which is the device's native layout.

use tracing::{debug, warn};

use super::{BitWidth, CodecError, ElementType, BINARY_PREFIX, HEX_PREFIX};

/// A value as carried in a `mem_read` acknowledgement, before it is typed
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// Bit pattern in transmission order. `bits` is the number of digits
    /// received (four per hex digit).
    Bits { pattern: u64, bits: u32 },
    /// Plain decimal text without a recognized prefix
    Decimal(f64),
}

impl RawValue {
    /// Parse `0b...`, `0x...` or plain decimal text
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let text = text.trim();
        let invalid = || CodecError::InvalidValue(text.to_string());

        if let Some(digits) = strip_prefix_ignore_case(text, BINARY_PREFIX) {
            if digits.is_empty() || digits.len() > 64 {
                return Err(invalid());
            }
            let pattern = u64::from_str_radix(digits, 2).map_err(|_| invalid())?;
            return Ok(RawValue::Bits {
                pattern,
                bits: digits.len() as u32,
            });
        }

        if let Some(digits) = strip_prefix_ignore_case(text, HEX_PREFIX) {
            if digits.is_empty() || digits.len() > 16 {
                return Err(invalid());
            }
            let pattern = u64::from_str_radix(digits, 16).map_err(|_| invalid())?;
            return Ok(RawValue::Bits {
                pattern,
                bits: digits.len() as u32 * 4,
            });
        }

        debug!(text, "No binary prefix on value, decoding as float64");
        text.parse::<f64>()
            .map(RawValue::Decimal)
            .map_err(|_| invalid())
    }

    /// Interpret the value as an element of the given type
    pub fn decode(&self, element_type: ElementType) -> Result<f64, CodecError> {
        let (pattern, bits) = match *self {
            RawValue::Decimal(v) => return Ok(v),
            RawValue::Bits { pattern, bits } => (pattern, bits),
        };

        if element_type.is_float() {
            let expected = element_type.bit_width().bits();
            if bits != expected {
                return Err(CodecError::WidthMismatch { element_type, bits });
            }
            // Bytes arrive in memory order, so the first byte is the LSB.
            let wire_bytes = pattern.to_be_bytes();
            let bytes = &wire_bytes[8 - (bits as usize / 8)..];
            return Ok(match element_type {
                ElementType::F32 => {
                    let mut buf = [0u8; 4];
                    buf.copy_from_slice(bytes);
                    f32::from_le_bytes(buf) as f64
                }
                _ => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(bytes);
                    f64::from_le_bytes(buf)
                }
            });
        }

        let width = element_type.bit_width().bits();
        if bits != width {
            debug!(
                received = bits,
                expected = width,
                %element_type,
                "Value width differs from element type, truncating"
            );
        }
        let masked = pattern & mask(width);
        if element_type.is_signed() && (masked >> (width - 1)) & 1 == 1 {
            // Sign-extend from `width` bits.
            let extended = (masked | !mask(width)) as i64;
            Ok(extended as f64)
        } else {
            Ok(masked as f64)
        }
    }
}

/// Encode `value` as a prefixed binary string of exactly `width` digits
pub fn encode_value(
    value: f64,
    width: BitWidth,
    element_type: ElementType,
) -> Result<String, CodecError> {
    let bits = width.bits();

    if element_type.is_float() {
        let bytes = match (element_type, width) {
            (ElementType::F32, BitWidth::W32) => (value as f32).to_le_bytes().to_vec(),
            (ElementType::F64, BitWidth::W64) => value.to_le_bytes().to_vec(),
            _ => return Err(CodecError::InvalidFloatWidth { element_type, bits }),
        };
        let digits: String = bytes.iter().map(|b| format!("{:08b}", b)).collect();
        return Ok(format!("{}{}", BINARY_PREFIX, digits));
    }

    if value.is_nan() {
        return Err(CodecError::NotANumber(element_type));
    }

    let (min, max) = if element_type.is_signed() {
        (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
    } else {
        (0i128, (1i128 << bits) - 1)
    };

    let truncated = value.trunc();
    let clamped = if truncated <= min as f64 {
        min
    } else if truncated >= max as f64 {
        max
    } else {
        truncated as i128
    };
    if truncated < min as f64 || truncated > max as f64 {
        warn!(value, clamped = clamped as f64, %element_type, bits, "Value out of range, clamped");
    }

    let pattern = (clamped as u128) & (mask(bits) as u128);
    Ok(format!(
        "{}{:0width$b}",
        BINARY_PREFIX,
        pattern,
        width = bits as usize
    ))
}

/// Decode value text from a `mem_read` acknowledgement
pub fn decode_value(text: &str, element_type: ElementType) -> Result<f64, CodecError> {
    RawValue::parse(text)?.decode(element_type)
}

fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        text.get(prefix.len()..)
    } else {
        None
    }
}
