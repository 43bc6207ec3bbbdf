//! Unit type definitions for data-driven rule sets.

use serde::{Deserialize, Serialize};

/// Movement domain of a unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum Domain {
    /// Ground units.
    #[default]
    Land,
    /// Ships.
    Sea,
    /// Aircraft.
    Air,
}

/// Boolean abilities a unit type may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnitTrait {
    /// Submarine: first strike, may submerge, cannot be hit by air without a destroyer.
    Submarine,
    /// Destroyer: cancels enemy submarine advantages.
    Destroyer,
    /// Infrastructure: never counts as a combat unit.
    Infrastructure,
    /// Fires once in the opening round and is then removed.
    Suicide,
    /// Removed as soon as it scores a hit.
    SuicideOnHit,
    /// Strategic bomber: may raid production.
    StrategicBomber,
    /// May intercept bombing raids.
    Interceptor,
    /// May fight in air battles.
    AirBattle,
    /// May be scrambled from an airbase.
    Scrambler,
    /// Airbase enabling scrambles from its territory.
    Airbase,
    /// Transport that also fights.
    CombatTransport,
    /// Changes owner when its territory is captured.
    Capturable,
    /// Air transport carrying paratroopers.
    AirTransport,
    /// May be carried by an air transport.
    AirTransportable,
    /// Never takes part in battle.
    NotInBattle,
}

/// Anti-aircraft profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AaProfile {
    /// AA type name; each type fires as its own step.
    pub aa_type: String,
    /// Hit strength of each AA die.
    pub attack: u32,
    /// Dice per gun (None: one die per eligible target).
    #[serde(default)]
    pub max_attacks: Option<u32>,
    /// Domains the gun may target.
    #[serde(default = "default_aa_targets")]
    pub targets: Vec<Domain>,
    /// Fires when attacking.
    #[serde(default)]
    pub offensive: bool,
    /// Fires when defending.
    #[serde(default = "default_true")]
    pub defensive: bool,
    /// Last round in which the gun fires (0 or less: every round).
    #[serde(default = "default_aa_rounds")]
    pub max_rounds: i32,
}

fn default_aa_targets() -> Vec<Domain> {
    vec![Domain::Air]
}

const fn default_true() -> bool {
    true
}

const fn default_aa_rounds() -> i32 {
    1
}

const fn default_one() -> u32 {
    1
}

/// Data-driven unit type.
///
/// # Example RON
///
/// ```ron
/// UnitType(
///     name: "destroyer",
///     domain: Sea,
///     cost: 8,
///     attack: 2,
///     defense: 2,
///     movement: 2,
///     traits: [Destroyer],
///     bombard: Some(2),
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitType {
    /// Unique name, referenced by scenarios and rules.
    pub name: String,

    /// Movement domain.
    pub domain: Domain,

    /// Production cost, used for unit value tallies.
    pub cost: u32,

    /// Attack strength.
    #[serde(default)]
    pub attack: u32,

    /// Defense strength.
    #[serde(default)]
    pub defense: u32,

    /// Dice rolled when attacking.
    #[serde(default = "default_one")]
    pub attack_rolls: u32,

    /// Dice rolled when defending.
    #[serde(default = "default_one")]
    pub defense_rolls: u32,

    /// Hits needed to kill a unit of this type.
    #[serde(default = "default_one")]
    pub hit_points: u32,

    /// Movement points per turn.
    #[serde(default)]
    pub movement: u32,

    /// Abilities.
    #[serde(default)]
    pub traits: Vec<UnitTrait>,

    /// Shore bombardment strength.
    #[serde(default)]
    pub bombard: Option<u32>,

    /// Anti-aircraft capability.
    #[serde(default)]
    pub aa: Option<AaProfile>,

    /// Attack strength in air battles.
    #[serde(default)]
    pub air_attack: u32,

    /// Defense strength in air battles.
    #[serde(default)]
    pub air_defense: u32,

    /// Cargo capacity as a transport.
    #[serde(default)]
    pub transport_capacity: u32,

    /// Space taken as transport cargo.
    #[serde(default)]
    pub transport_cost: u32,

    /// Air capacity as a carrier.
    #[serde(default)]
    pub carrier_capacity: u32,

    /// Space taken on a carrier.
    #[serde(default)]
    pub carrier_cost: u32,

    /// Scrambles an airbase allows per turn (None: unlimited).
    #[serde(default)]
    pub max_scramble_count: Option<u32>,

    /// Distance scrambled units may fly.
    #[serde(default)]
    pub max_scramble_distance: u32,

    /// Bombing damage the unit can absorb.
    #[serde(default)]
    pub max_damage: u32,

    /// Type the unit turns into once damaged.
    #[serde(default)]
    pub damaged_changes_into: Option<String>,
}

impl UnitType {
    /// Minimal type with the given name, domain and strengths.
    #[must_use]
    pub fn new(name: impl Into<String>, domain: Domain, cost: u32, attack: u32, defense: u32) -> Self {
        Self {
            name: name.into(),
            domain,
            cost,
            attack,
            defense,
            attack_rolls: 1,
            defense_rolls: 1,
            hit_points: 1,
            movement: 1,
            traits: Vec::new(),
            bombard: None,
            aa: None,
            air_attack: 0,
            air_defense: 0,
            transport_capacity: 0,
            transport_cost: 0,
            carrier_capacity: 0,
            carrier_cost: 0,
            max_scramble_count: None,
            max_scramble_distance: 0,
            max_damage: 0,
            damaged_changes_into: None,
        }
    }

    /// Add a trait (builder style).
    #[must_use]
    pub fn with_trait(mut self, unit_trait: UnitTrait) -> Self {
        if !self.traits.contains(&unit_trait) {
            self.traits.push(unit_trait);
        }
        self
    }

    /// Check for a trait.
    #[must_use]
    pub fn has(&self, unit_trait: UnitTrait) -> bool {
        self.traits.contains(&unit_trait)
    }

    /// Aircraft.
    #[must_use]
    pub fn is_air(&self) -> bool {
        self.domain == Domain::Air
    }

    /// Ship.
    #[must_use]
    pub fn is_sea(&self) -> bool {
        self.domain == Domain::Sea
    }

    /// Ground unit.
    #[must_use]
    pub fn is_land(&self) -> bool {
        self.domain == Domain::Land
    }

    /// Submarine.
    #[must_use]
    pub fn is_sub(&self) -> bool {
        self.has(UnitTrait::Submarine)
    }

    /// Destroyer.
    #[must_use]
    pub fn is_destroyer(&self) -> bool {
        self.has(UnitTrait::Destroyer)
    }

    /// Infrastructure.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        self.has(UnitTrait::Infrastructure)
    }

    /// Any transport.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        self.transport_capacity > 0
    }

    /// Sea transport that does not fight.
    #[must_use]
    pub fn is_non_combat_transport(&self) -> bool {
        self.is_sea() && self.is_transport() && !self.has(UnitTrait::CombatTransport)
    }

    /// Aircraft carrier.
    #[must_use]
    pub fn is_carrier(&self) -> bool {
        self.carrier_capacity > 0
    }

    /// Fighter that can land on carriers.
    #[must_use]
    pub fn can_land_on_carrier(&self) -> bool {
        self.is_air() && self.carrier_cost > 0
    }

    /// Anti-aircraft gun.
    #[must_use]
    pub fn is_aa(&self) -> bool {
        self.aa.is_some()
    }

    /// Can absorb bombing damage.
    #[must_use]
    pub fn can_be_damaged(&self) -> bool {
        self.max_damage > 0
    }

    /// Base strength for the side the unit fights on.
    #[must_use]
    pub const fn strength(&self, defending: bool) -> u32 {
        if defending {
            self.defense
        } else {
            self.attack
        }
    }

    /// Dice rolled for the side the unit fights on.
    #[must_use]
    pub const fn rolls(&self, defending: bool) -> u32 {
        if defending {
            self.defense_rolls
        } else {
            self.attack_rolls
        }
    }

    /// Strength in an air battle.
    #[must_use]
    pub const fn air_strength(&self, defending: bool) -> u32 {
        if defending {
            self.air_defense
        } else {
            self.air_attack
        }
    }

    /// Unit has any combat value on the given side.
    #[must_use]
    pub fn has_combat_ability(&self, defending: bool) -> bool {
        self.strength(defending) > 0 && self.rolls(defending) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_type() -> UnitType {
        UnitType::new("submarine", Domain::Sea, 6, 2, 1).with_trait(UnitTrait::Submarine)
    }

    #[test]
    fn test_traits() {
        let sub = create_test_type();
        assert!(sub.is_sub());
        assert!(!sub.is_destroyer());
        assert!(sub.is_sea());
    }

    #[test]
    fn test_strength_by_side() {
        let sub = create_test_type();
        assert_eq!(sub.strength(false), 2);
        assert_eq!(sub.strength(true), 1);
        assert!(sub.has_combat_ability(true));
    }

    #[test]
    fn test_non_combat_transport() {
        let mut transport = UnitType::new("transport", Domain::Sea, 7, 0, 0);
        transport.transport_capacity = 5;
        assert!(transport.is_non_combat_transport());
        let armed = transport.with_trait(UnitTrait::CombatTransport);
        assert!(!armed.is_non_combat_transport());
    }

    #[test]
    fn test_ron_defaults() {
        let ty: UnitType =
            ron::from_str(r#"(name: "infantry", domain: Land, cost: 3, attack: 1, defense: 2)"#)
                .unwrap();
        assert_eq!(ty.hit_points, 1);
        assert_eq!(ty.attack_rolls, 1);
        assert!(ty.traits.is_empty());
    }
}
