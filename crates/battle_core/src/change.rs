//! Atomic, undoable game-state mutations.
//!
//! The engine never writes to [`GameState`] directly. It builds a
//! [`Change`] and hands it to the bridge, which applies it and keeps the
//! inverse so the whole turn can be rolled back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{BattleError, Result};
use crate::ids::{PlayerId, TerritoryId, UnitId, UnitTypeId};
use crate::state::{GameState, Unit};

/// A per-unit field that a change can set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitProperty {
    /// Combat hits taken.
    Hits(u32),
    /// Bombing damage taken.
    BombingDamage(u32),
    /// Submerged flag.
    Submerged(bool),
    /// Fought this turn.
    WasInCombat(bool),
    /// Fought in an air battle this turn.
    WasInAirBattle(bool),
    /// Scrambled this turn.
    Scrambled(bool),
    /// Scramble origin.
    Origin(Option<TerritoryId>),
    /// Scrambles launched from an airbase.
    Launched(u32),
    /// Movement points left.
    MovementLeft(u32),
    /// Carrying transport.
    TransportedBy(Option<UnitId>),
    /// Transport that unloaded the unit.
    UnloadedFrom(Option<UnitId>),
    /// Landed from the sea this turn.
    Amphibious(bool),
    /// Owning player.
    Owner(PlayerId),
    /// Unit type.
    Type(UnitTypeId),
}

impl UnitProperty {
    /// Write this value into the unit and return the value it replaced.
    fn swap_into(self, unit: &mut Unit) -> Self {
        match self {
            Self::Hits(v) => Self::Hits(std::mem::replace(&mut unit.hits, v)),
            Self::BombingDamage(v) => Self::BombingDamage(std::mem::replace(&mut unit.bombing_damage, v)),
            Self::Submerged(v) => Self::Submerged(std::mem::replace(&mut unit.submerged, v)),
            Self::WasInCombat(v) => Self::WasInCombat(std::mem::replace(&mut unit.was_in_combat, v)),
            Self::WasInAirBattle(v) => Self::WasInAirBattle(std::mem::replace(&mut unit.was_in_air_battle, v)),
            Self::Scrambled(v) => Self::Scrambled(std::mem::replace(&mut unit.was_scrambled, v)),
            Self::Origin(v) => Self::Origin(std::mem::replace(&mut unit.scramble_origin, v)),
            Self::Launched(v) => Self::Launched(std::mem::replace(&mut unit.launched, v)),
            Self::MovementLeft(v) => Self::MovementLeft(std::mem::replace(&mut unit.movement_left, v)),
            Self::TransportedBy(v) => Self::TransportedBy(std::mem::replace(&mut unit.transported_by, v)),
            Self::UnloadedFrom(v) => Self::UnloadedFrom(std::mem::replace(&mut unit.unloaded_from, v)),
            Self::Amphibious(v) => Self::Amphibious(std::mem::replace(&mut unit.was_amphibious, v)),
            Self::Owner(v) => Self::Owner(std::mem::replace(&mut unit.owner, v)),
            Self::Type(v) => Self::Type(std::mem::replace(&mut unit.type_id, v)),
        }
    }
}

/// A player resource a change can adjust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resource {
    /// Production units.
    Pus,
    /// Kamikaze tokens.
    KamikazeTokens,
}

/// One atomic mutation of the game state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    /// Move units to a territory.
    MoveUnits {
        /// Units to move.
        units: Vec<UnitId>,
        /// Destination.
        to: TerritoryId,
    },
    /// Delete units from the map.
    RemoveUnits {
        /// Units to delete.
        units: Vec<UnitId>,
    },
    /// Put fully formed units on the map.
    AddUnits {
        /// Units to add.
        units: Vec<Unit>,
    },
    /// Change territory ownership.
    SetOwner {
        /// Territory.
        territory: TerritoryId,
        /// New owner.
        owner: Option<PlayerId>,
    },
    /// Set one field on a unit.
    SetUnitProperty {
        /// Unit.
        unit: UnitId,
        /// New value.
        property: UnitProperty,
    },
    /// Adjust a player resource by a signed amount.
    ChangeResource {
        /// Player.
        player: PlayerId,
        /// Resource.
        resource: Resource,
        /// Signed delta.
        delta: i64,
    },
    /// Several changes applied in order.
    Composite(Vec<Change>),
}

impl Change {
    /// Shorthand for [`Change::SetUnitProperty`].
    #[must_use]
    pub const fn set(unit: UnitId, property: UnitProperty) -> Self {
        Self::SetUnitProperty { unit, property }
    }

    /// Shorthand for [`Change::MoveUnits`].
    #[must_use]
    pub fn move_units(units: &[UnitId], to: TerritoryId) -> Self {
        Self::MoveUnits {
            units: units.to_vec(),
            to,
        }
    }

    /// Shorthand for [`Change::RemoveUnits`].
    #[must_use]
    pub fn remove_units(units: &[UnitId]) -> Self {
        Self::RemoveUnits { units: units.to_vec() }
    }

    /// True when applying the change does nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::MoveUnits { units, .. } | Self::RemoveUnits { units } => units.is_empty(),
            Self::AddUnits { units } => units.is_empty(),
            Self::ChangeResource { delta, .. } => *delta == 0,
            Self::Composite(changes) => changes.iter().all(Self::is_empty),
            Self::SetOwner { .. } | Self::SetUnitProperty { .. } => false,
        }
    }

    /// Apply to the state and return the inverse change.
    ///
    /// # Errors
    ///
    /// Fails on a missing unit, territory or player, or when a resource
    /// would go negative.
    pub fn apply(self, state: &mut GameState) -> Result<Self> {
        match self {
            Self::MoveUnits { units, to } => {
                state.territory(to)?;
                let mut back: BTreeMap<TerritoryId, Vec<UnitId>> = BTreeMap::new();
                for id in units {
                    let unit = state.unit_mut(id)?;
                    back.entry(unit.location).or_default().push(id);
                    unit.location = to;
                }
                Ok(Self::Composite(
                    back.into_iter()
                        .map(|(from, units)| Self::MoveUnits { units, to: from })
                        .collect(),
                ))
            }
            Self::RemoveUnits { units } => {
                let mut removed = Vec::with_capacity(units.len());
                for id in units {
                    removed.push(state.take_unit(id)?);
                }
                Ok(Self::AddUnits { units: removed })
            }
            Self::AddUnits { units } => {
                let ids = units.iter().map(|u| u.id).collect();
                for unit in units {
                    state.territory(unit.location)?;
                    state.insert_unit(unit);
                }
                Ok(Self::RemoveUnits { units: ids })
            }
            Self::SetOwner { territory, owner } => {
                let t = state.territory_mut(territory)?;
                let previous = std::mem::replace(&mut t.owner, owner);
                Ok(Self::SetOwner {
                    territory,
                    owner: previous,
                })
            }
            Self::SetUnitProperty { unit, property } => {
                let previous = property.swap_into(state.unit_mut(unit)?);
                Ok(Self::SetUnitProperty {
                    unit,
                    property: previous,
                })
            }
            Self::ChangeResource {
                player,
                resource,
                delta,
            } => {
                let p = state.player_mut(player)?;
                match resource {
                    Resource::Pus => {
                        let next = p.pus + delta;
                        if next < 0 {
                            return Err(BattleError::InvalidState(format!(
                                "{player} would hold {next} PUs"
                            )));
                        }
                        p.pus = next;
                    }
                    Resource::KamikazeTokens => {
                        let next = i64::from(p.kamikaze_tokens) + delta;
                        p.kamikaze_tokens = u32::try_from(next).map_err(|_| {
                            BattleError::InvalidState(format!("{player} would hold {next} kamikaze tokens"))
                        })?;
                    }
                }
                Ok(Self::ChangeResource {
                    player,
                    resource,
                    delta: -delta,
                })
            }
            Self::Composite(changes) => {
                let mut inverses = Vec::with_capacity(changes.len());
                for change in changes {
                    inverses.push(change.apply(state)?);
                }
                inverses.reverse();
                Ok(Self::Composite(inverses))
            }
        }
    }
}

/// Inverses of every applied change, newest last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    inverses: Vec<Change>,
}

impl ChangeLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a change and remember its inverse.
    pub fn apply(&mut self, change: Change, state: &mut GameState) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let inverse = change.apply(state)?;
        self.inverses.push(inverse);
        Ok(())
    }

    /// Number of recorded changes, usable as a rollback mark.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inverses.len()
    }

    /// True when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inverses.is_empty()
    }

    /// Undo changes newest first until `mark` remain.
    pub fn rollback_to(&mut self, mark: usize, state: &mut GameState) -> Result<()> {
        while self.inverses.len() > mark {
            if let Some(inverse) = self.inverses.pop() {
                inverse.apply(state)?;
            }
        }
        Ok(())
    }

    /// Undo every recorded change.
    pub fn rollback(&mut self, state: &mut GameState) -> Result<()> {
        self.rollback_to(0, state)
    }

    /// Forget the recorded inverses (end of turn).
    pub fn clear(&mut self) {
        self.inverses.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_state() -> (GameState, UnitId) {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        let mut state = GameState::new(BattleRules::default(), types);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_territory(Territory::new(TerritoryId(0), "A", false));
        state.add_territory(Territory::new(TerritoryId(1), "B", false));
        let unit = state.spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        (state, unit)
    }

    #[test]
    fn test_move_and_undo() {
        let (mut state, unit) = create_test_state();
        let before = state.state_hash();
        let inverse = Change::move_units(&[unit], TerritoryId(1)).apply(&mut state).unwrap();
        assert_eq!(state.unit(unit).unwrap().location, TerritoryId(1));
        inverse.apply(&mut state).unwrap();
        assert_eq!(state.state_hash(), before);
    }

    #[test]
    fn test_remove_restores_full_unit() {
        let (mut state, unit) = create_test_state();
        Change::set(unit, UnitProperty::Hits(1)).apply(&mut state).unwrap();
        let inverse = Change::remove_units(&[unit]).apply(&mut state).unwrap();
        assert!(!state.has_unit(unit));
        inverse.apply(&mut state).unwrap();
        assert_eq!(state.unit(unit).unwrap().hits, 1);
    }

    #[test]
    fn test_resource_cannot_go_negative() {
        let (mut state, _) = create_test_state();
        let change = Change::ChangeResource {
            player: PlayerId(0),
            resource: Resource::Pus,
            delta: -5,
        };
        assert!(change.apply(&mut state).is_err());
    }

    #[test]
    fn test_change_log_rollback() {
        let (mut state, unit) = create_test_state();
        let before = state.state_hash();
        let mut log = ChangeLog::new();
        log.apply(Change::set(unit, UnitProperty::Submerged(true)), &mut state).unwrap();
        log.apply(Change::move_units(&[unit], TerritoryId(1)), &mut state).unwrap();
        log.apply(
            Change::SetOwner {
                territory: TerritoryId(1),
                owner: Some(PlayerId(0)),
            },
            &mut state,
        )
        .unwrap();
        assert_eq!(log.len(), 3);
        log.rollback(&mut state).unwrap();
        assert_eq!(state.state_hash(), before);
        assert!(log.is_empty());
    }
}
