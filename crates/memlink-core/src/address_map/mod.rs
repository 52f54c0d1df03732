//! Address Map
//!
//! Translates between named device variables and memory addresses.
//! Variable sets are loaded in bulk (typically from a memory map exported
//! from the firmware ELF) and stay immutable until replaced.

mod error;
mod map;
mod variable;

pub use error::AddressMapError;
pub use map::{AddressMap, LoadReport, MatchKind, Resolution};
pub use variable::{Variable, VariableDefinition};
