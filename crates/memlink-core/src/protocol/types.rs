//! Element types and access widths

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Data type of one element of a device variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// Unsigned 8-bit integer (`uint8_t`)
    U8,
    /// Signed 8-bit integer (`int8_t`)
    I8,
    /// Unsigned 16-bit integer (`uint16_t`)
    U16,
    /// Signed 16-bit integer (`int16_t`)
    I16,
    /// Unsigned 32-bit integer (`uint32_t`)
    U32,
    /// Signed 32-bit integer (`int32_t`)
    I32,
    /// 32-bit floating point (`float`)
    F32,
    /// 64-bit floating point (`double`)
    F64,
}

impl ElementType {
    /// Every supported element type
    pub const ALL: [ElementType; 8] = [
        ElementType::U8,
        ElementType::I8,
        ElementType::U16,
        ElementType::I16,
        ElementType::U32,
        ElementType::I32,
        ElementType::F32,
        ElementType::F64,
    ];

    /// Parse a loosely spelled type name.
    ///
    /// Matching ignores case, underscores and whitespace and accepts the
    /// usual C spellings (`unsigned int`, `signed char`, `Uint32_t`) as well
    /// as short forms (`u16`, `S08`, `f32`). A bare `char` maps to `int8_t`.
    pub fn normalize(s: &str) -> Option<Self> {
        let lowered = s.trim().to_ascii_lowercase();
        let stem = lowered.strip_suffix("_t").unwrap_or(&lowered);
        let key: String = stem
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect();

        match key.as_str() {
            "uint8" | "u8" | "u08" | "unsignedchar" | "uchar" | "byte" => Some(ElementType::U8),
            "int8" | "i8" | "s8" | "s08" | "signedchar" | "char" | "sbyte" => {
                Some(ElementType::I8)
            }
            "uint16" | "u16" | "unsignedshort" | "unsignedshortint" | "ushort" | "word" => {
                Some(ElementType::U16)
            }
            "int16" | "i16" | "s16" | "short" | "shortint" | "signedshort" | "sword" => {
                Some(ElementType::I16)
            }
            "uint32" | "u32" | "unsignedint" | "unsigned" | "uint" | "unsignedlong" | "dword" => {
                Some(ElementType::U32)
            }
            "int32" | "i32" | "s32" | "int" | "signedint" | "signed" | "long" | "sdword" => {
                Some(ElementType::I32)
            }
            "float" | "f32" | "float32" | "single" => Some(ElementType::F32),
            "double" | "f64" | "float64" => Some(ElementType::F64),
            _ => None,
        }
    }

    /// Canonical C spelling of the type
    pub fn c_name(&self) -> &'static str {
        match self {
            ElementType::U8 => "uint8_t",
            ElementType::I8 => "int8_t",
            ElementType::U16 => "uint16_t",
            ElementType::I16 => "int16_t",
            ElementType::U32 => "uint32_t",
            ElementType::I32 => "int32_t",
            ElementType::F32 => "float",
            ElementType::F64 => "double",
        }
    }

    /// Size of one element in device memory
    pub fn size_bytes(&self) -> u32 {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }

    /// Access width used for reads and writes of this type
    pub fn bit_width(&self) -> BitWidth {
        match self.size_bytes() {
            1 => BitWidth::W8,
            2 => BitWidth::W16,
            4 => BitWidth::W32,
            _ => BitWidth::W64,
        }
    }

    /// Signed integers and floats
    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            ElementType::I8 | ElementType::I16 | ElementType::I32 | ElementType::F32 | ElementType::F64
        )
    }

    /// IEEE-754 float
    pub fn is_float(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.c_name())
    }
}

/// Width of a single memory access on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitWidth {
    /// 8-bit access
    W8,
    /// 16-bit access
    W16,
    /// 32-bit access
    W32,
    /// 64-bit access
    W64,
}

impl BitWidth {
    /// Number of bits
    pub fn bits(&self) -> u32 {
        match self {
            BitWidth::W8 => 8,
            BitWidth::W16 => 16,
            BitWidth::W32 => 32,
            BitWidth::W64 => 64,
        }
    }

    /// Look up a width from a bit count
    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(BitWidth::W8),
            16 => Some(BitWidth::W16),
            32 => Some(BitWidth::W32),
            64 => Some(BitWidth::W64),
            _ => None,
        }
    }

    /// Two-digit size field used in `mem_read`/`mem_write` frames ("08", "16", ...)
    pub fn size_field(&self) -> String {
        format!("{:02}", self.bits())
    }
}

/// Map a type name to its access width.
///
/// Names are normalized first; anything still unknown falls back to 32 bits
/// so that a legitimate 32-bit value is never truncated.
pub fn map_type_to_bit_width(type_name: &str) -> BitWidth {
    match ElementType::normalize(type_name) {
        Some(element_type) => element_type.bit_width(),
        None => {
            warn!(type_name, "Unrecognized element type, defaulting to 32-bit access");
            BitWidth::W32
        }
    }
}
