//! Dice rolls for firing groups.
//!
//! A die shows a value in `0..sides` and hits when the value is below the
//! firing unit's strength. Low luck replaces the individual dice with
//! `total_power / sides` guaranteed hits plus one die for the remainder.

use serde::{Deserialize, Serialize};

use crate::bridge::Bridge;
use crate::error::Result;
use crate::ids::{PlayerId, UnitId};

/// Which strength value a unit fires with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StrengthKind {
    /// Attack or defence.
    Normal,
    /// Air-battle attack or defence.
    AirBattle,
    /// Shore bombardment.
    Bombard,
}

/// One rolled die.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Die {
    /// Face value in `0..sides`.
    pub value: u32,
    /// Strength rolled against.
    pub strength: u32,
    /// Scored a hit.
    pub hit: bool,
    /// Unit the die belongs to (none under low luck).
    pub firer: Option<UnitId>,
}

/// Result of one firing group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiceRoll {
    /// Every die rolled.
    pub rolls: Vec<Die>,
    /// Total hits.
    pub hits: u32,
}

impl DiceRoll {
    /// Face values, in roll order.
    #[must_use]
    pub fn values(&self) -> Vec<u32> {
        self.rolls.iter().map(|d| d.value).collect()
    }

    /// Units whose die hit.
    #[must_use]
    pub fn hitting_units(&self) -> Vec<UnitId> {
        let mut units: Vec<UnitId> = self.rolls.iter().filter(|d| d.hit).filter_map(|d| d.firer).collect();
        units.sort_unstable();
        units.dedup();
        units
    }

    /// Roll for a group of units on one side.
    ///
    /// # Errors
    ///
    /// Fails on an unknown unit or a dice failure from the bridge.
    pub fn roll_units(
        bridge: &mut dyn Bridge,
        firers: &[UnitId],
        defending: bool,
        kind: StrengthKind,
        player: PlayerId,
        annotation: &str,
    ) -> Result<Self> {
        let sides = bridge.state().rules.dice_sides;
        let low_luck = bridge.state().rules.low_luck;
        let mut dice_per_unit = Vec::with_capacity(firers.len());
        for &id in firers {
            let t = bridge.state().unit_type(id)?;
            let (strength, rolls) = match kind {
                StrengthKind::Normal => (t.strength(defending), t.rolls(defending)),
                StrengthKind::AirBattle => (t.air_strength(defending), 1),
                StrengthKind::Bombard => (t.bombard.unwrap_or(t.attack), 1),
            };
            if strength > 0 && rolls > 0 {
                dice_per_unit.push((id, strength.min(sides), rolls));
            }
        }

        if low_luck {
            let power: u32 = dice_per_unit.iter().map(|&(_, s, r)| s * r).sum();
            return Self::roll_low_luck(bridge, power, sides, player, annotation);
        }

        let count: u32 = dice_per_unit.iter().map(|&(_, _, r)| r).sum();
        let values = bridge.roll_dice(sides, count, player, annotation)?;
        let mut values = values.into_iter();
        let mut roll = Self::default();
        for (id, strength, rolls) in dice_per_unit {
            for _ in 0..rolls {
                let Some(value) = values.next() else { break };
                let hit = value < strength;
                roll.hits += u32::from(hit);
                roll.rolls.push(Die {
                    value,
                    strength,
                    hit,
                    firer: Some(id),
                });
            }
        }
        Ok(roll)
    }

    /// Roll AA fire from `guns` against `targets`.
    ///
    /// The dice count is the lesser of the targets and the guns times their
    /// attacks per gun.
    pub fn roll_aa(
        bridge: &mut dyn Bridge,
        targets: &[UnitId],
        guns: &[UnitId],
        player: PlayerId,
        annotation: &str,
    ) -> Result<Self> {
        let sides = bridge.state().rules.dice_sides;
        let mut strength = 0;
        let mut shots: u32 = 0;
        let target_count = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        for &id in guns {
            if let Some(aa) = &bridge.state().unit_type(id)?.aa {
                strength = strength.max(aa.attack.min(sides));
                shots = shots.saturating_add(aa.max_attacks.unwrap_or(target_count));
            }
        }
        let count = shots.min(target_count);
        if count == 0 || strength == 0 {
            return Ok(Self::default());
        }
        if bridge.state().rules.low_luck {
            return Self::roll_low_luck(bridge, count * strength, sides, player, annotation);
        }
        let values = bridge.roll_dice(sides, count, player, annotation)?;
        let mut roll = Self::default();
        for value in values {
            let hit = value < strength;
            roll.hits += u32::from(hit);
            roll.rolls.push(Die {
                value,
                strength,
                hit,
                firer: None,
            });
        }
        Ok(roll)
    }

    fn roll_low_luck(
        bridge: &mut dyn Bridge,
        power: u32,
        sides: u32,
        player: PlayerId,
        annotation: &str,
    ) -> Result<Self> {
        let mut roll = Self {
            rolls: Vec::new(),
            hits: power / sides,
        };
        let remainder = power % sides;
        if remainder > 0 {
            let value = bridge.roll_dice(sides, 1, player, annotation)?[0];
            let hit = value < remainder;
            roll.hits += u32::from(hit);
            roll.rolls.push(Die {
                value,
                strength: remainder,
                hit,
                firer: None,
            });
        }
        Ok(roll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use crate::data::{AaProfile, Domain, UnitType, UnitTypeRegistry};
    use crate::ids::TerritoryId;
    use crate::rules::BattleRules;
    use crate::state::{GameState, Player, Territory};

    fn create_test_bridge(low_luck: bool) -> (LocalBridge<crate::bridge::AutoPlayer>, Vec<UnitId>) {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("armour", Domain::Land, 5, 3, 3));
        let mut gun = UnitType::new("aaGun", Domain::Land, 5, 0, 0);
        gun.aa = Some(AaProfile {
            aa_type: "AA".into(),
            attack: 1,
            max_attacks: Some(3),
            targets: vec![Domain::Air],
            offensive: false,
            defensive: true,
            max_rounds: 1,
        });
        types.register(gun);
        let rules = BattleRules {
            low_luck,
            ..BattleRules::default()
        };
        let mut state = GameState::new(rules, types);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_territory(Territory::new(TerritoryId(0), "A", false));
        let mut units = Vec::new();
        for _ in 0..3 {
            units.push(state.spawn_unit("armour", PlayerId(0), TerritoryId(0)).unwrap());
        }
        units.push(state.spawn_unit("aaGun", PlayerId(0), TerritoryId(0)).unwrap());
        (LocalBridge::auto(state, 11), units)
    }

    #[test]
    fn test_hits_below_strength() {
        let (mut bridge, units) = create_test_bridge(false);
        bridge.queue_dice([2, 3, 0]);
        let roll =
            DiceRoll::roll_units(&mut bridge, &units[..3], false, StrengthKind::Normal, PlayerId(0), "fire").unwrap();
        assert_eq!(roll.hits, 2);
        assert_eq!(roll.hitting_units(), vec![units[0], units[2]]);
    }

    #[test]
    fn test_low_luck_guaranteed_hits() {
        let (mut bridge, units) = create_test_bridge(true);
        // 3 * 3 = 9 power on d6: one sure hit plus a die against 3.
        bridge.queue_dice([4]);
        let roll =
            DiceRoll::roll_units(&mut bridge, &units[..3], false, StrengthKind::Normal, PlayerId(0), "fire").unwrap();
        assert_eq!(roll.hits, 1);
        assert_eq!(roll.rolls.len(), 1);
    }

    #[test]
    fn test_aa_dice_capped_by_targets() {
        let (mut bridge, units) = create_test_bridge(false);
        bridge.queue_dice([0, 5]);
        let targets = [UnitId(100), UnitId(101)];
        let roll = DiceRoll::roll_aa(&mut bridge, &targets, &units[3..], PlayerId(0), "aa").unwrap();
        assert_eq!(roll.rolls.len(), 2);
        assert_eq!(roll.hits, 1);
    }
}
