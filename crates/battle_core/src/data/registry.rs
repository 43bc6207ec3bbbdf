//! Registry of all unit types in a rule set.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::unit_data::UnitType;
use crate::error::{BattleError, Result};
use crate::ids::UnitTypeId;

/// All unit types, indexed by [`UnitTypeId`].
///
/// # Example RON
///
/// ```ron
/// UnitTypeRegistry(
///     types: [
///         (name: "infantry", domain: Land, cost: 3, attack: 1, defense: 2),
///         (name: "fighter", domain: Air, cost: 10, attack: 3, defense: 4),
///     ],
/// )
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTypeRegistry {
    types: Vec<UnitType>,
}

impl UnitTypeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type and return its id. Re-registering a name replaces it.
    pub fn register(&mut self, unit_type: UnitType) -> UnitTypeId {
        if let Some(existing) = self.types.iter().position(|t| t.name == unit_type.name) {
            self.types[existing] = unit_type;
            return UnitTypeId(existing as u16);
        }
        self.types.push(unit_type);
        UnitTypeId((self.types.len() - 1) as u16)
    }

    /// Look up a type by id.
    pub fn get(&self, id: UnitTypeId) -> Result<&UnitType> {
        self.types
            .get(id.0 as usize)
            .ok_or(BattleError::UnknownUnitTypeId(id))
    }

    /// Look up a type id by name.
    pub fn id_of(&self, name: &str) -> Result<UnitTypeId> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| UnitTypeId(i as u16))
            .ok_or_else(|| BattleError::UnknownUnitType(name.to_string()))
    }

    /// Iterate `(id, type)` in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (UnitTypeId, &UnitType)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (UnitTypeId(i as u16), t))
    }

    /// Number of registered types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when no types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Parse a registry from RON.
    pub fn from_ron_str(ron: &str) -> Result<Self> {
        ron::from_str(ron)
            .map_err(|e| BattleError::InvalidState(format!("Failed to parse unit types: {e}")))
    }

    /// Load a registry from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BattleError::InvalidState(format!("Failed to read unit types: {e}")))?;
        Self::from_ron_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Domain;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = UnitTypeRegistry::new();
        let inf = registry.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        let tank = registry.register(UnitType::new("armour", Domain::Land, 5, 3, 3));
        assert_eq!(registry.id_of("armour").unwrap(), tank);
        assert_eq!(registry.get(inf).unwrap().defense, 2);
        assert!(registry.id_of("battleship").is_err());
    }

    #[test]
    fn test_reregister_replaces() {
        let mut registry = UnitTypeRegistry::new();
        let first = registry.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        let again = registry.register(UnitType::new("infantry", Domain::Land, 4, 1, 2));
        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first).unwrap().cost, 4);
    }

    #[test]
    fn test_from_ron() {
        let registry = UnitTypeRegistry::from_ron_str(
            r#"(types: [(name: "fighter", domain: Air, cost: 10, attack: 3, defense: 4)])"#,
        )
        .unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(UnitTypeId(0)).unwrap().is_air());
    }
}
