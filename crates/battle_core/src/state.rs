//! Game state consumed by the engine.
//!
//! Territories, units, players and their relationships. The engine only
//! reads this directly; every mutation goes through a [`Change`] applied
//! by the bridge.
//!
//! [`Change`]: crate::change::Change

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::data::{UnitType, UnitTypeRegistry};
use crate::error::{BattleError, Result};
use crate::ids::{PlayerId, TerritoryId, UnitId, UnitTypeId};
use crate::rules::BattleRules;

/// A land territory or sea zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Territory {
    /// Identifier.
    pub id: TerritoryId,
    /// Display name.
    pub name: String,
    /// Sea zone.
    pub water: bool,
    /// Current owner (`None`: neutral land or unowned water).
    pub owner: Option<PlayerId>,
    /// Owner at game start, used for liberation.
    #[serde(default)]
    pub original_owner: Option<PlayerId>,
    /// Production value, the ceiling for bombing damage.
    #[serde(default)]
    pub production: u32,
    /// Capital of this player.
    #[serde(default)]
    pub capital_of: Option<PlayerId>,
    /// Adjacent territories.
    #[serde(default)]
    pub neighbors: BTreeSet<TerritoryId>,
    /// Owner's enemies may spend kamikaze tokens here.
    #[serde(default)]
    pub kamikaze_zone: bool,
}

impl Territory {
    /// Create a territory with no neighbours.
    #[must_use]
    pub fn new(id: TerritoryId, name: impl Into<String>, water: bool) -> Self {
        Self {
            id,
            name: name.into(),
            water,
            owner: None,
            original_owner: None,
            production: 0,
            capital_of: None,
            neighbors: BTreeSet::new(),
            kamikaze_zone: false,
        }
    }
}

/// One unit on the map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Unit {
    /// Identifier.
    pub id: UnitId,
    /// Index into the unit type registry.
    pub type_id: UnitTypeId,
    /// Owning player.
    pub owner: PlayerId,
    /// Territory the unit is in.
    pub location: TerritoryId,
    /// Combat hits taken.
    #[serde(default)]
    pub hits: u32,
    /// Bombing damage taken.
    #[serde(default)]
    pub bombing_damage: u32,
    /// Submerged submarine.
    #[serde(default)]
    pub submerged: bool,
    /// Fought (or was moved into combat) this turn.
    #[serde(default)]
    pub was_in_combat: bool,
    /// Took part in an air battle this turn.
    #[serde(default)]
    pub was_in_air_battle: bool,
    /// Scrambled this turn.
    #[serde(default)]
    pub was_scrambled: bool,
    /// Territory a scrambled unit launched from.
    #[serde(default)]
    pub scramble_origin: Option<TerritoryId>,
    /// Scrambles launched from this airbase this turn.
    #[serde(default)]
    pub launched: u32,
    /// Movement points left this turn.
    #[serde(default)]
    pub movement_left: u32,
    /// Transport (or carrier) currently carrying this unit.
    #[serde(default)]
    pub transported_by: Option<UnitId>,
    /// Transport that unloaded this unit this turn.
    #[serde(default)]
    pub unloaded_from: Option<UnitId>,
    /// Landed from the sea this turn.
    #[serde(default)]
    pub was_amphibious: bool,
    /// Disabled and unable to fight.
    #[serde(default)]
    pub disabled: bool,
}

impl Unit {
    /// Create a fresh, undamaged unit.
    #[must_use]
    pub const fn new(id: UnitId, type_id: UnitTypeId, owner: PlayerId, location: TerritoryId) -> Self {
        Self {
            id,
            type_id,
            owner,
            location,
            hits: 0,
            bombing_damage: 0,
            submerged: false,
            was_in_combat: false,
            was_in_air_battle: false,
            was_scrambled: false,
            scramble_origin: None,
            launched: 0,
            movement_left: 0,
            transported_by: None,
            unloaded_from: None,
            was_amphibious: false,
            disabled: false,
        }
    }
}

/// A nation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Player {
    /// Identifier.
    pub id: PlayerId,
    /// Display name.
    pub name: String,
    /// Players sharing an alliance are allied; everyone else is at war.
    pub alliance: u32,
    /// Production units held.
    #[serde(default)]
    pub pus: i64,
    /// Kamikaze tokens held.
    #[serde(default)]
    pub kamikaze_tokens: u32,
    /// Hit strength of one kamikaze token.
    #[serde(default)]
    pub kamikaze_power: u32,
}

impl Player {
    /// Create a player with no resources.
    #[must_use]
    pub fn new(id: PlayerId, name: impl Into<String>, alliance: u32) -> Self {
        Self {
            id,
            name: name.into(),
            alliance,
            pus: 0,
            kamikaze_tokens: 0,
            kamikaze_power: 0,
        }
    }
}

/// The whole map: the context every engine operation reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    /// Rule toggles.
    pub rules: BattleRules,
    /// Unit type definitions.
    pub unit_types: UnitTypeRegistry,
    /// Player whose turn it is.
    pub current_player: Option<PlayerId>,
    territories: BTreeMap<TerritoryId, Territory>,
    units: BTreeMap<UnitId, Unit>,
    players: BTreeMap<PlayerId, Player>,
    next_unit_id: u32,
}

impl GameState {
    /// Create an empty state with the given rules and unit types.
    #[must_use]
    pub fn new(rules: BattleRules, unit_types: UnitTypeRegistry) -> Self {
        Self {
            rules,
            unit_types,
            ..Self::default()
        }
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Insert or replace a territory.
    pub fn add_territory(&mut self, territory: Territory) {
        self.territories.insert(territory.id, territory);
    }

    /// Connect two territories both ways.
    pub fn connect(&mut self, a: TerritoryId, b: TerritoryId) -> Result<()> {
        self.territory_mut(a)?.neighbors.insert(b);
        self.territory_mut(b)?.neighbors.insert(a);
        Ok(())
    }

    /// Insert or replace a player.
    pub fn add_player(&mut self, player: Player) {
        self.players.insert(player.id, player);
    }

    /// Allocate a fresh unit id.
    pub fn allocate_unit_id(&mut self) -> UnitId {
        let id = UnitId(self.next_unit_id);
        self.next_unit_id += 1;
        id
    }

    /// Create a unit of the named type, owned by `owner`, at `location`.
    pub fn spawn_unit(&mut self, type_name: &str, owner: PlayerId, location: TerritoryId) -> Result<UnitId> {
        let type_id = self.unit_types.id_of(type_name)?;
        self.territory(location)?;
        self.player(owner)?;
        let id = self.allocate_unit_id();
        let mut unit = Unit::new(id, type_id, owner, location);
        unit.movement_left = self.unit_types.get(type_id)?.movement;
        self.units.insert(id, unit);
        Ok(id)
    }

    /// Insert a fully formed unit (used when undoing a removal).
    pub fn insert_unit(&mut self, unit: Unit) {
        if unit.id.0 >= self.next_unit_id {
            self.next_unit_id = unit.id.0 + 1;
        }
        self.units.insert(unit.id, unit);
    }

    /// Delete a unit, returning it.
    pub fn take_unit(&mut self, id: UnitId) -> Result<Unit> {
        self.units.remove(&id).ok_or(BattleError::UnknownUnit(id))
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    /// Territory by id.
    pub fn territory(&self, id: TerritoryId) -> Result<&Territory> {
        self.territories.get(&id).ok_or(BattleError::UnknownTerritory(id))
    }

    /// Mutable territory by id.
    pub fn territory_mut(&mut self, id: TerritoryId) -> Result<&mut Territory> {
        self.territories.get_mut(&id).ok_or(BattleError::UnknownTerritory(id))
    }

    /// Iterate all territories in id order.
    pub fn territories(&self) -> impl Iterator<Item = &Territory> {
        self.territories.values()
    }

    /// Territory by name.
    pub fn territory_named(&self, name: &str) -> Option<&Territory> {
        self.territories.values().find(|t| t.name == name)
    }

    /// Unit by id.
    pub fn unit(&self, id: UnitId) -> Result<&Unit> {
        self.units.get(&id).ok_or(BattleError::UnknownUnit(id))
    }

    /// Mutable unit by id.
    pub fn unit_mut(&mut self, id: UnitId) -> Result<&mut Unit> {
        self.units.get_mut(&id).ok_or(BattleError::UnknownUnit(id))
    }

    /// True if the unit still exists.
    #[must_use]
    pub fn has_unit(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    /// Iterate all units in id order.
    pub fn units(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// Type of a unit.
    pub fn unit_type(&self, id: UnitId) -> Result<&UnitType> {
        self.unit_types.get(self.unit(id)?.type_id)
    }

    /// Player by id.
    pub fn player(&self, id: PlayerId) -> Result<&Player> {
        self.players.get(&id).ok_or(BattleError::UnknownPlayer(id))
    }

    /// Mutable player by id.
    pub fn player_mut(&mut self, id: PlayerId) -> Result<&mut Player> {
        self.players.get_mut(&id).ok_or(BattleError::UnknownPlayer(id))
    }

    /// Iterate all players in id order.
    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Units in a territory, sorted by id.
    #[must_use]
    pub fn units_at(&self, territory: TerritoryId) -> Vec<UnitId> {
        self.units
            .values()
            .filter(|u| u.location == territory)
            .map(|u| u.id)
            .collect()
    }

    /// Adjacent territories.
    pub fn neighbors(&self, territory: TerritoryId) -> Result<&BTreeSet<TerritoryId>> {
        Ok(&self.territory(territory)?.neighbors)
    }

    /// Territories within `distance` steps, excluding the start.
    pub fn neighbors_within(&self, territory: TerritoryId, distance: u32) -> Result<BTreeSet<TerritoryId>> {
        let mut seen = BTreeSet::from([territory]);
        let mut frontier = vec![territory];
        for _ in 0..distance {
            let mut next = Vec::new();
            for current in frontier {
                for &n in self.neighbors(current)? {
                    if seen.insert(n) {
                        next.push(n);
                    }
                }
            }
            frontier = next;
        }
        seen.remove(&territory);
        Ok(seen)
    }

    /// A land territory with no land neighbours.
    pub fn is_island(&self, territory: TerritoryId) -> Result<bool> {
        let t = self.territory(territory)?;
        if t.water {
            return Ok(false);
        }
        for &n in &t.neighbors {
            if !self.territory(n)?.water {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Same player or same alliance.
    #[must_use]
    pub fn are_allied(&self, a: PlayerId, b: PlayerId) -> bool {
        if a == b {
            return true;
        }
        match (self.players.get(&a), self.players.get(&b)) {
            (Some(pa), Some(pb)) => pa.alliance == pb.alliance,
            _ => false,
        }
    }

    /// Not allied.
    #[must_use]
    pub fn at_war(&self, a: PlayerId, b: PlayerId) -> bool {
        !self.are_allied(a, b)
    }

    /// Territory owned by an enemy of `player`. Neutral land counts as
    /// enemy; unowned water does not.
    pub fn is_enemy_territory(&self, player: PlayerId, territory: TerritoryId) -> Result<bool> {
        let t = self.territory(territory)?;
        Ok(match t.owner {
            Some(owner) => self.at_war(player, owner),
            None => !t.water,
        })
    }

    /// Any unit at the site owned by an enemy of `player`.
    pub fn has_enemy_units(&self, player: PlayerId, territory: TerritoryId) -> bool {
        self.units
            .values()
            .any(|u| u.location == territory && self.at_war(player, u.owner))
    }

    // ========================================================================
    // Filters
    // ========================================================================

    /// Keep the units matching `pred`.
    pub fn filter_units<F>(&self, units: &[UnitId], pred: F) -> Result<Vec<UnitId>>
    where
        F: Fn(&Unit, &UnitType) -> bool,
    {
        let mut out = Vec::with_capacity(units.len());
        for &id in units {
            let unit = self.unit(id)?;
            if pred(unit, self.unit_types.get(unit.type_id)?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// True if any unit matches.
    pub fn any_unit<F>(&self, units: &[UnitId], pred: F) -> Result<bool>
    where
        F: Fn(&Unit, &UnitType) -> bool,
    {
        for &id in units {
            let unit = self.unit(id)?;
            if pred(unit, self.unit_types.get(unit.type_id)?) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True if every unit matches (vacuously true for an empty slice).
    pub fn all_units<F>(&self, units: &[UnitId], pred: F) -> Result<bool>
    where
        F: Fn(&Unit, &UnitType) -> bool,
    {
        for &id in units {
            let unit = self.unit(id)?;
            if !pred(unit, self.unit_types.get(unit.type_id)?) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Units at the territory matching `pred`.
    pub fn units_at_matching<F>(&self, territory: TerritoryId, pred: F) -> Result<Vec<UnitId>>
    where
        F: Fn(&Unit, &UnitType) -> bool,
    {
        self.filter_units(&self.units_at(territory), pred)
    }

    /// Deterministic hash of territories, units and players.
    #[must_use]
    pub fn state_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for t in self.territories.values() {
            t.hash(&mut hasher);
        }
        for u in self.units.values() {
            u.hash(&mut hasher);
        }
        for p in self.players.values() {
            p.hash(&mut hasher);
        }
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Domain;

    fn create_test_state() -> GameState {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        let mut state = GameState::new(BattleRules::default(), types);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.add_player(Player::new(PlayerId(2), "Pink", 0));
        state.add_territory(Territory::new(TerritoryId(0), "Island", false));
        state.add_territory(Territory::new(TerritoryId(1), "Sea", true));
        state.add_territory(Territory::new(TerritoryId(2), "Coast", false));
        state.connect(TerritoryId(0), TerritoryId(1)).unwrap();
        state.connect(TerritoryId(1), TerritoryId(2)).unwrap();
        state
    }

    #[test]
    fn test_relationships() {
        let state = create_test_state();
        assert!(state.are_allied(PlayerId(0), PlayerId(2)));
        assert!(state.at_war(PlayerId(0), PlayerId(1)));
    }

    #[test]
    fn test_spawn_and_units_at() {
        let mut state = create_test_state();
        let a = state.spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        let b = state.spawn_unit("infantry", PlayerId(1), TerritoryId(0)).unwrap();
        assert_eq!(state.units_at(TerritoryId(0)), vec![a, b]);
        assert!(state.has_enemy_units(PlayerId(0), TerritoryId(0)));
        assert!(state.spawn_unit("tank", PlayerId(0), TerritoryId(0)).is_err());
    }

    #[test]
    fn test_island_and_distance() {
        let state = create_test_state();
        assert!(state.is_island(TerritoryId(0)).unwrap());
        assert!(!state.is_island(TerritoryId(1)).unwrap());
        let near = state.neighbors_within(TerritoryId(0), 2).unwrap();
        assert_eq!(near, BTreeSet::from([TerritoryId(1), TerritoryId(2)]));
    }

    #[test]
    fn test_state_hash_changes_with_units() {
        let mut state = create_test_state();
        let before = state.state_hash();
        state.spawn_unit("infantry", PlayerId(0), TerritoryId(2)).unwrap();
        assert_ne!(before, state.state_hash());
    }
}
