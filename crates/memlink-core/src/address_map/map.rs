//! Address-indexed variable set

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{AddressMapError, Variable, VariableDefinition};
use crate::protocol::format_address;

/// How an address was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchKind {
    /// Address is exactly the start of an element
    Exact,
    /// Address lies inside a variable but not on an element boundary
    Fuzzy,
    /// Address is outside every loaded variable
    Unknown,
}

/// Result of resolving an address to a parameter name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Resolved parameter name
    pub name: String,
    /// How the name was found
    pub kind: MatchKind,
    /// Index of the variable in load order, when matched
    pub variable: Option<usize>,
    /// Element index within the variable, when matched
    pub element: Option<u32>,
}

/// Outcome of [`AddressMap::load`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Variables accepted
    pub loaded: usize,
    /// Rejected entries, in input order
    pub errors: Vec<AddressMapError>,
}

impl LoadReport {
    /// Every entry was accepted
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// The loaded variable set with an exact element-address index
#[derive(Debug, Clone, Default)]
pub struct AddressMap {
    variables: Vec<Variable>,
    /// element address -> (variable index, element index)
    exact: HashMap<u32, (usize, u32)>,
}

impl AddressMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from a set of definitions (see [`AddressMap::load`])
    pub fn from_definitions(definitions: &[VariableDefinition]) -> (Self, LoadReport) {
        let mut map = Self::new();
        let report = map.load(definitions);
        (map, report)
    }

    /// Replace the whole variable set.
    ///
    /// Each definition is validated on its own; rejected ones are reported
    /// and the rest are kept. The previous set is only swapped out once the
    /// new one is fully built.
    pub fn load(&mut self, definitions: &[VariableDefinition]) -> LoadReport {
        let mut variables = Vec::with_capacity(definitions.len());
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for definition in definitions {
            match definition.validate() {
                Ok(variable) => {
                    if !names.insert(variable.name.clone()) {
                        warn!(name = %variable.name, "Duplicate variable rejected");
                        errors.push(AddressMapError::DuplicateName(variable.name));
                        continue;
                    }
                    debug!(
                        name = %variable.name,
                        address = %variable.address_text(),
                        elements = variable.element_count,
                        element_type = %variable.element_type,
                        "Loaded variable"
                    );
                    variables.push(variable);
                }
                Err(e) => {
                    warn!(error = %e, "Variable definition rejected");
                    errors.push(e);
                }
            }
        }

        let mut exact = HashMap::new();
        for (var_index, variable) in variables.iter().enumerate() {
            for element in 0..variable.element_count {
                if let Some(address) = variable.element_address(element) {
                    // On overlap the first loaded variable keeps the address.
                    exact.entry(address).or_insert((var_index, element));
                }
            }
        }

        let loaded = variables.len();
        *self = Self { variables, exact };
        info!(loaded, rejected = errors.len(), "Variable set loaded");

        LoadReport { loaded, errors }
    }

    /// Drop every variable
    pub fn clear(&mut self) {
        self.variables.clear();
        self.exact.clear();
    }

    /// Variables in load order
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    /// No variables loaded
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Look up a variable by exact name
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Total number of addressable elements across all variables
    pub fn element_count(&self) -> usize {
        self.variables.iter().map(|v| v.element_count as usize).sum()
    }

    /// Parameter names in load order: arrays list the base name followed
    /// by every `name[i]`.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.element_count());
        for variable in &self.variables {
            names.push(variable.name.clone());
            if variable.is_array() {
                names.extend((0..variable.element_count).map(|i| variable.element_name(i)));
            }
        }
        names
    }

    /// Resolve an address to a variable element.
    ///
    /// Exact element addresses are tried first, then range containment. The
    /// range fallback is an approximation: a misaligned address is attributed
    /// to the element it falls inside, which may not be what the device meant.
    pub fn resolve(&self, address: u32) -> Resolution {
        if let Some(&(var_index, element)) = self.exact.get(&address) {
            return Resolution {
                name: self.variables[var_index].element_name(element),
                kind: MatchKind::Exact,
                variable: Some(var_index),
                element: Some(element),
            };
        }

        for (var_index, variable) in self.variables.iter().enumerate() {
            if variable.contains(address) {
                let element = (address - variable.base_address) / variable.element_size();
                debug!(
                    address = %format_address(address),
                    name = %variable.name,
                    element,
                    "Misaligned address resolved by range"
                );
                return Resolution {
                    name: variable.element_name(element),
                    kind: MatchKind::Fuzzy,
                    variable: Some(var_index),
                    element: Some(element),
                };
            }
        }

        Resolution {
            name: format!("Unknown_0x{:08X}", address),
            kind: MatchKind::Unknown,
            variable: None,
            element: None,
        }
    }

    /// Name of the element at `address` (see [`AddressMap::resolve`])
    pub fn resolve_address(&self, address: u32) -> String {
        self.resolve(address).name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ElementType;
    use pretty_assertions::assert_eq;

    fn sample_map() -> AddressMap {
        let (map, report) = AddressMap::from_definitions(&[
            VariableDefinition::new("V", "0x20000000", 4, "uint32_t"),
            VariableDefinition::new("flag", "0x20000100", 1, "uint8_t"),
        ]);
        assert!(report.is_clean());
        map
    }

    #[test]
    fn test_exact_resolution() {
        let map = sample_map();
        assert_eq!(map.resolve_address(0x2000_0000), "V[0]");
        assert_eq!(map.resolve_address(0x2000_0004), "V[1]");
        assert_eq!(map.resolve_address(0x2000_0100), "flag");
        assert_eq!(map.resolve(0x2000_0004).kind, MatchKind::Exact);
    }

    #[test]
    fn test_fuzzy_resolution() {
        let map = sample_map();
        let resolution = map.resolve(0x2000_0006);
        assert_eq!(resolution.name, "V[1]");
        assert_eq!(resolution.kind, MatchKind::Fuzzy);
        assert_eq!(resolution.element, Some(1));
    }

    #[test]
    fn test_unknown_resolution() {
        let map = sample_map();
        assert_eq!(map.resolve_address(0x2000_0010), "Unknown_0x20000010");
        assert_eq!(map.resolve_address(0x0000_00AB), "Unknown_0x000000AB");
        assert_eq!(map.resolve(0x10).kind, MatchKind::Unknown);
    }

    #[test]
    fn test_load_keeps_valid_entries() {
        let mut map = AddressMap::new();
        let report = map.load(&[
            VariableDefinition::new("good", "0x1000", 1, "uint16_t"),
            VariableDefinition::new("bad_addr", "0xQQ", 1, "uint16_t"),
            VariableDefinition::new("bad_count", "0x2000", 0, "uint16_t"),
            VariableDefinition::new("good", "0x3000", 1, "uint16_t"),
        ]);
        assert_eq!(report.loaded, 1);
        assert_eq!(report.errors.len(), 3);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("good").unwrap().element_type, ElementType::U16);
    }

    #[test]
    fn test_load_replaces_previous_set() {
        let mut map = sample_map();
        map.load(&[VariableDefinition::new("other", "0x4000", 1, "float")]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.resolve_address(0x2000_0000), "Unknown_0x20000000");
        assert_eq!(map.resolve_address(0x4000), "other");
    }

    #[test]
    fn test_parameter_names() {
        let map = sample_map();
        assert_eq!(
            map.parameter_names(),
            vec!["V", "V[0]", "V[1]", "V[2]", "V[3]", "flag"]
        );
    }
}
