//! Where the attackers came from.
//!
//! Battles that can be amphibious keep track of the territories each
//! attacking unit arrived from, the land units that came ashore from the
//! sea, and the ships bombarding in support. The battle stays amphibious
//! exactly as long as at least one amphibious land attacker is left.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::battle::common::push_new;
use crate::error::Result;
use crate::ids::{TerritoryId, UnitId};
use crate::matches;
use crate::route::Route;
use crate::state::GameState;

/// Origin bookkeeping of a battle's attackers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentState {
    attacking_from: BTreeMap<TerritoryId, Vec<UnitId>>,
    amphibious_land_attackers: Vec<UnitId>,
    amphibious_origins: BTreeSet<TerritoryId>,
    bombarding_units: Vec<UnitId>,
}

impl DependentState {
    /// Nothing recorded yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record units arriving along `route`.
    pub fn record_attack(&mut self, route: &Route, units: &[UnitId], state: &GameState) -> Result<()> {
        let from = route.territory_before_end();
        push_new(self.attacking_from.entry(from).or_default(), units);
        if route.is_unload(state)? {
            let land = state.filter_units(units, matches::is_land)?;
            if !land.is_empty() {
                self.amphibious_origins.insert(from);
                push_new(&mut self.amphibious_land_attackers, &land);
            }
        }
        Ok(())
    }

    /// Forget units that left the attack.
    pub fn remove_units(&mut self, units: &[UnitId]) {
        for list in self.attacking_from.values_mut() {
            list.retain(|u| !units.contains(u));
        }
        self.attacking_from.retain(|_, list| !list.is_empty());
        self.amphibious_land_attackers.retain(|u| !units.contains(u));
        self.bombarding_units.retain(|u| !units.contains(u));
        if self.amphibious_land_attackers.is_empty() {
            self.amphibious_origins.clear();
            self.bombarding_units.clear();
        }
    }

    /// At least one land unit came ashore from the sea.
    #[must_use]
    pub fn is_amphibious(&self) -> bool {
        !self.amphibious_land_attackers.is_empty()
    }

    /// Territories units attacked from.
    #[must_use]
    pub fn attacking_from(&self) -> BTreeSet<TerritoryId> {
        self.attacking_from.keys().copied().collect()
    }

    /// Origin territory to the units that attacked from it.
    #[must_use]
    pub const fn attacking_from_map(&self) -> &BTreeMap<TerritoryId, Vec<UnitId>> {
        &self.attacking_from
    }

    /// Sea zones the amphibious landings came from.
    #[must_use]
    pub const fn amphibious_attack_territories(&self) -> &BTreeSet<TerritoryId> {
        &self.amphibious_origins
    }

    /// Land units that came ashore.
    #[must_use]
    pub fn amphibious_land_attackers(&self) -> &[UnitId] {
        &self.amphibious_land_attackers
    }

    /// Ships bombarding in support.
    #[must_use]
    pub fn bombarding_units(&self) -> &[UnitId] {
        &self.bombarding_units
    }

    /// Assign a bombarding ship.
    pub fn add_bombarding_unit(&mut self, unit: UnitId) {
        push_new(&mut self.bombarding_units, &[unit]);
    }

    /// Drop the bombardment (the ships fired or are gone).
    pub fn clear_bombarding_units(&mut self) {
        self.bombarding_units.clear();
    }

    /// Attacking units that did not come ashore from the sea.
    #[must_use]
    pub fn non_amphibious(&self, attacking: &[UnitId]) -> Vec<UnitId> {
        attacking
            .iter()
            .copied()
            .filter(|u| !self.amphibious_land_attackers.contains(u))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::ids::PlayerId;
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_state() -> (GameState, Vec<UnitId>) {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        types.register(UnitType::new("fighter", Domain::Air, 10, 3, 4));
        let mut state = GameState::new(BattleRules::default(), types);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_territory(Territory::new(TerritoryId(0), "Sea", true));
        state.add_territory(Territory::new(TerritoryId(1), "Beach", false));
        state.add_territory(Territory::new(TerritoryId(2), "Inland", false));
        let inf = state.spawn_unit("infantry", PlayerId(0), TerritoryId(1)).unwrap();
        let ftr = state.spawn_unit("fighter", PlayerId(0), TerritoryId(1)).unwrap();
        let walk = state.spawn_unit("infantry", PlayerId(0), TerritoryId(1)).unwrap();
        (state, vec![inf, ftr, walk])
    }

    #[test]
    fn test_unload_makes_amphibious() {
        let (state, units) = create_test_state();
        let mut dep = DependentState::new();
        dep.record_attack(&Route::single(TerritoryId(0), TerritoryId(1)), &units[..2], &state)
            .unwrap();
        dep.record_attack(&Route::single(TerritoryId(2), TerritoryId(1)), &units[2..], &state)
            .unwrap();
        assert!(dep.is_amphibious());
        assert_eq!(dep.amphibious_land_attackers(), &[units[0]]);
        assert_eq!(dep.attacking_from(), BTreeSet::from([TerritoryId(0), TerritoryId(2)]));
        assert_eq!(dep.non_amphibious(&units), vec![units[1], units[2]]);
    }

    #[test]
    fn test_losing_landing_clears_bombardment() {
        let (state, units) = create_test_state();
        let mut dep = DependentState::new();
        dep.record_attack(&Route::single(TerritoryId(0), TerritoryId(1)), &units[..1], &state)
            .unwrap();
        dep.add_bombarding_unit(UnitId(40));
        dep.remove_units(&units[..1]);
        assert!(!dep.is_amphibious());
        assert!(dep.bombarding_units().is_empty());
        assert!(dep.amphibious_attack_territories().is_empty());
    }
}
