//! Variable records

use serde::{Deserialize, Serialize};

use super::AddressMapError;
use crate::protocol::{format_address, parse_address, ElementType};

/// A variable record as supplied by the caller, not yet validated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    /// Variable name as written in the source
    pub name: String,
    /// Base address as hex text (`0x20000000`)
    pub address: String,
    /// Number of elements (1 for scalars)
    pub elements: i64,
    /// Element type name, loosely spelled (`uint32`, `unsigned short`, ...)
    pub data_type: String,
}

impl VariableDefinition {
    /// Build a record from raw fields
    pub fn new(name: &str, address: &str, elements: i64, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            elements,
            data_type: data_type.to_string(),
        }
    }

    /// Parse `name,address,elements,type` rows.
    ///
    /// A leading header row is skipped, as are rows with fewer than four
    /// columns. Rows whose element count is not an integer are reported.
    pub fn parse_csv(content: &str) -> (Vec<VariableDefinition>, Vec<AddressMapError>) {
        let mut definitions = Vec::new();
        let mut errors = Vec::new();

        for (index, line) in content.lines().enumerate() {
            let columns: Vec<&str> = line.split(',').map(str::trim).collect();
            if columns.len() < 4 {
                continue;
            }
            if index == 0 && parse_address(columns[1]).is_err() {
                continue;
            }

            match columns[2].parse::<i64>() {
                Ok(elements) => definitions.push(VariableDefinition::new(
                    columns[0],
                    columns[1],
                    elements,
                    columns[3],
                )),
                Err(_) => errors.push(AddressMapError::CsvRow {
                    line: index + 1,
                    message: format!("invalid element count '{}'", columns[2]),
                }),
            }
        }

        (definitions, errors)
    }

    /// Validate into a [`Variable`]
    pub fn validate(&self) -> Result<Variable, AddressMapError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(AddressMapError::EmptyName);
        }

        let base_address =
            parse_address(&self.address).map_err(|_| AddressMapError::InvalidAddress {
                name: name.to_string(),
                address: self.address.clone(),
            })?;

        if self.elements < 1 || self.elements > u32::MAX as i64 {
            return Err(AddressMapError::InvalidElementCount {
                name: name.to_string(),
                count: self.elements,
            });
        }

        let element_type =
            ElementType::normalize(&self.data_type).ok_or_else(|| AddressMapError::UnknownType {
                name: name.to_string(),
                data_type: self.data_type.clone(),
            })?;

        let variable = Variable {
            name: name.to_string(),
            base_address,
            element_count: self.elements as u32,
            element_type,
        };
        if variable.end_address() > u64::from(u32::MAX) + 1 {
            return Err(AddressMapError::AddressOverflow(variable.name));
        }
        Ok(variable)
    }
}

/// A named memory region on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    /// Variable name
    pub name: String,
    /// Address of element 0
    pub base_address: u32,
    /// At least 1
    pub element_count: u32,
    /// Element type
    pub element_type: ElementType,
}

impl Variable {
    /// Element counts below 1 are raised to 1
    pub fn new(name: &str, base_address: u32, element_count: u32, element_type: ElementType) -> Self {
        Self {
            name: name.to_string(),
            base_address,
            element_count: element_count.max(1),
            element_type,
        }
    }

    /// More than one element
    pub fn is_array(&self) -> bool {
        self.element_count > 1
    }

    /// Bytes per element
    pub fn element_size(&self) -> u32 {
        self.element_type.size_bytes()
    }

    /// One past the last byte of the variable
    pub fn end_address(&self) -> u64 {
        u64::from(self.base_address) + u64::from(self.element_count) * u64::from(self.element_size())
    }

    /// Address of element `index`
    pub fn element_address(&self, index: u32) -> Option<u32> {
        if index >= self.element_count {
            return None;
        }
        let offset = u64::from(index) * u64::from(self.element_size());
        u32::try_from(u64::from(self.base_address) + offset).ok()
    }

    /// Addresses of all elements, in index order
    pub fn element_addresses(&self) -> Vec<u32> {
        (0..self.element_count)
            .filter_map(|i| self.element_address(i))
            .collect()
    }

    /// `name` for scalars, `name[i]` for array elements
    pub fn element_name(&self, index: u32) -> String {
        if self.is_array() {
            format!("{}[{}]", self.name, index)
        } else {
            self.name.clone()
        }
    }

    /// Whether `address` falls anywhere inside the variable
    pub fn contains(&self, address: u32) -> bool {
        let address = u64::from(address);
        address >= u64::from(self.base_address) && address < self.end_address()
    }

    /// Base address in wire format
    pub fn address_text(&self) -> String {
        format_address(self.base_address)
    }
}
