//! Rule variants consulted by the engine.
//!
//! Every toggle is a plain field on [`BattleRules`]. Rule files are RON and
//! may list only the fields they change; everything else keeps its default.
//!
//! ```ron
//! BattleRules(
//!     ww2v2: true,
//!     transport_casualties_restricted: true,
//!     sea_battle_rounds: 0,
//! )
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BattleError, Result};

/// Configurable rule set for one game.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BattleRules {
    /// Second-edition rules (sneak attacks, plane retreat, bombing caps).
    pub ww2v2: bool,
    /// Defending submarines also get the first-strike round.
    pub defending_subs_sneak_attack: bool,
    /// Submarines may retreat or submerge before the fire phase.
    pub sub_retreat_before_battle: bool,
    /// Submarines may submerge at the battle site instead of retreating.
    pub submersible_subs: bool,
    /// Unescorted transports die automatically.
    pub transport_casualties_restricted: bool,
    /// Air needs a friendly destroyer to target submarines.
    pub air_attack_sub_restricted: bool,
    /// Allied air on a carrier is not cargo of that carrier.
    pub allied_air_independent: bool,
    /// Attacking planes may retreat from amphibious assaults.
    pub attacker_retreat_planes: bool,
    /// Non-amphibious land attackers may retreat from amphibious assaults.
    pub partial_amphibious_retreat: bool,
    /// Units hit by bombardment still fire back this round.
    pub naval_bombard_casualties_return_fire: bool,
    /// Suicide and munition casualties do not fire back.
    pub suicide_and_munition_casualties_restricted: bool,
    /// Defending suicide and munition units never fire.
    pub defending_suicide_and_munition_units_do_not_fire: bool,
    /// Non-combat transports do not block retreat routes.
    pub ignore_transport_in_movement: bool,
    /// Submarines do not block retreat routes.
    pub ignore_sub_in_movement: bool,
    /// Retreating units stay at the battle site.
    pub retreating_units_remain_in_place: bool,
    /// Rounds for an air battle (0 or less means unlimited).
    pub air_battle_rounds: i32,
    /// Air battle attackers may withdraw between rounds.
    pub air_battle_attackers_can_retreat: bool,
    /// Air battle defenders may withdraw between rounds.
    pub air_battle_defenders_can_retreat: bool,
    /// Bombing raids are escorted through an air battle first.
    pub raids_may_be_preceded_by_air_battles: bool,
    /// Ground and sea battles are preceded by an air battle over the site.
    pub battles_may_be_preceded_by_air_battles: bool,
    /// Scrambled units may join air battles.
    pub can_scramble_into_air_battles: bool,
    /// Defender may scramble air from airbases.
    pub scramble_rules_in_effect: bool,
    /// Scrambled units fly back to their origin at the end of the phase.
    pub scrambled_units_return_to_base: bool,
    /// Scrambling only into sea zones.
    pub scramble_to_sea_only: bool,
    /// Scrambling only from islands.
    pub scramble_from_island_only: bool,
    /// Kamikaze tokens may be spent against ships.
    pub use_kamikaze_suicide_attacks: bool,
    /// Unit type names that kamikaze tokens may target; empty means ships.
    pub kamikaze_targets: Vec<String>,
    /// Kamikaze attacks only in zones with a battle or amphibious assault.
    pub kamikaze_only_where_battles_are: bool,
    /// Enemy territories left without defenders are taken over.
    pub abandoned_territories_may_be_taken_over: bool,
    /// At most one bombarding unit per amphibious land attacker.
    pub shore_bombard_per_ground_unit_restricted: bool,
    /// Low luck dice.
    pub low_luck: bool,
    /// Sides of every die.
    pub dice_sides: u32,
    /// Round limit for land battles (0 or less means unlimited).
    pub land_battle_rounds: i32,
    /// Round limit for sea battles (0 or less means unlimited).
    pub sea_battle_rounds: i32,
    /// Strategic bombing damages units instead of draining PUs.
    pub damage_from_bombing_done_to_units: bool,
    /// Bombing damage per bomber is capped at the territory production.
    pub limit_sbr_damage_to_production: bool,
    /// PU fee for entering a neutral territory (negative disables the fee).
    pub neutral_charge: i64,
    /// Transports can take control of a sea zone.
    pub transport_control_sea_zone: bool,
    /// Submarines cannot take control of a sea zone.
    pub subs_control_sea_zone_restricted: bool,
}

impl Default for BattleRules {
    fn default() -> Self {
        Self {
            ww2v2: false,
            defending_subs_sneak_attack: false,
            sub_retreat_before_battle: false,
            submersible_subs: false,
            transport_casualties_restricted: false,
            air_attack_sub_restricted: false,
            allied_air_independent: true,
            attacker_retreat_planes: false,
            partial_amphibious_retreat: false,
            naval_bombard_casualties_return_fire: false,
            suicide_and_munition_casualties_restricted: false,
            defending_suicide_and_munition_units_do_not_fire: false,
            ignore_transport_in_movement: false,
            ignore_sub_in_movement: false,
            retreating_units_remain_in_place: false,
            air_battle_rounds: 1,
            air_battle_attackers_can_retreat: false,
            air_battle_defenders_can_retreat: false,
            raids_may_be_preceded_by_air_battles: false,
            battles_may_be_preceded_by_air_battles: false,
            can_scramble_into_air_battles: false,
            scramble_rules_in_effect: false,
            scrambled_units_return_to_base: false,
            scramble_to_sea_only: false,
            scramble_from_island_only: false,
            use_kamikaze_suicide_attacks: false,
            kamikaze_targets: Vec::new(),
            kamikaze_only_where_battles_are: false,
            abandoned_territories_may_be_taken_over: false,
            shore_bombard_per_ground_unit_restricted: false,
            low_luck: false,
            dice_sides: 6,
            land_battle_rounds: -1,
            sea_battle_rounds: -1,
            damage_from_bombing_done_to_units: false,
            limit_sbr_damage_to_production: false,
            neutral_charge: -1,
            transport_control_sea_zone: false,
            subs_control_sea_zone_restricted: false,
        }
    }
}

impl BattleRules {
    /// Parse rules from a RON string.
    pub fn from_ron_str(ron: &str) -> Result<Self> {
        ron::from_str(ron).map_err(|e| BattleError::InvalidState(format!("Failed to parse rules: {e}")))
    }

    /// Load rules from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BattleError::InvalidState(format!("Failed to read rules file: {e}")))?;
        Self::from_ron_str(&contents)
    }

    /// Round limit for a battle at a land or water site.
    #[must_use]
    pub const fn max_rounds(&self, water: bool) -> i32 {
        if water {
            self.sea_battle_rounds
        } else {
            self.land_battle_rounds
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let rules = BattleRules::default();
        assert_eq!(rules.dice_sides, 6);
        assert_eq!(rules.max_rounds(true), -1);
        assert!(rules.allied_air_independent);
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let rules = BattleRules::from_ron_str("(ww2v2: true, land_battle_rounds: 3)").unwrap();
        assert!(rules.ww2v2);
        assert_eq!(rules.max_rounds(false), 3);
        assert_eq!(rules.dice_sides, 6);
    }

    #[test]
    fn test_bad_ron_is_error() {
        assert!(BattleRules::from_ron_str("(ww2v2: maybe)").is_err());
    }
}
