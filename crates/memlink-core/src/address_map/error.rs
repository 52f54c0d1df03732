//! Address map errors

use thiserror::Error;

/// Reasons a variable definition is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressMapError {
    /// Name is blank after trimming
    #[error("Variable has an empty name")]
    EmptyName,

    /// Address text is not a hex number
    #[error("Variable '{name}': invalid hex address '{address}'")]
    InvalidAddress {
        /// Variable name
        name: String,
        /// Address text as given
        address: String,
    },

    /// Element count below one
    #[error("Variable '{name}': element count must be at least 1, got {count}")]
    InvalidElementCount {
        /// Variable name
        name: String,
        /// Count as given
        count: i64,
    },

    /// Type name not recognized
    #[error("Variable '{name}': unknown element type '{data_type}'")]
    UnknownType {
        /// Variable name
        name: String,
        /// Type name as given
        data_type: String,
    },

    /// Same name already present in the batch
    #[error("Variable '{0}' is defined more than once")]
    DuplicateName(String),

    /// Last element would not fit in 32 bits
    #[error("Variable '{0}' extends past the end of the 32-bit address space")]
    AddressOverflow(String),

    /// Malformed CSV row
    #[error("Line {line}: {message}")]
    CsvRow {
        /// One-based line number
        line: usize,
        /// What was wrong with the row
        message: String,
    },
}
