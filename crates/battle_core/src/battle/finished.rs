//! Conquests resolved when the move was made.
//!
//! Blitzes and walk-ins take the territory immediately. The battle entry
//! only remains so later battles can strip units from it and so the turn
//! has a record of the conquest.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::battle::common::{BattleCore, BattleResultDescription, Side, WhoWon};
use crate::battle::dependent::DependentState;
use crate::bridge::Bridge;
use crate::change::{Change, UnitProperty};
use crate::error::Result;
use crate::ids::UnitId;
use crate::route::Route;
use crate::state::GameState;
use crate::tracker::BattleTracker;

/// Already-decided battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedBattle {
    core: BattleCore,
    dependent: DependentState,
    result: BattleResultDescription,
}

impl FinishedBattle {
    /// New entry that will report `result` (conquered or blitzed).
    #[must_use]
    pub fn new(core: BattleCore, result: BattleResultDescription) -> Self {
        Self {
            core,
            dependent: DependentState::new(),
            result,
        }
    }

    /// Shared state.
    #[must_use]
    pub const fn core(&self) -> &BattleCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut BattleCore {
        &mut self.core
    }

    /// Origin bookkeeping.
    #[must_use]
    pub const fn dependent(&self) -> &DependentState {
        &self.dependent
    }

    /// Result written when fought.
    #[must_use]
    pub const fn preset_result(&self) -> BattleResultDescription {
        self.result
    }

    /// No attackers left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.attacking_units.is_empty()
    }

    /// Join units entering along `route`.
    pub fn add_attack(&mut self, route: &Route, units: &[UnitId], state: &GameState) -> Result<()> {
        self.dependent.record_attack(route, units, state)?;
        self.core.add_units(Side::Attacker, units);
        Ok(())
    }

    /// Take units back out (their move was undone).
    pub fn remove_attack(&mut self, units: &[UnitId]) {
        self.core.attacking_units.retain(|u| !units.contains(u));
        self.dependent.remove_units(units);
    }

    /// Write the preset result, release carried aircraft and deregister.
    pub fn fight(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let released: Vec<Change> = {
            let state = bridge.state();
            state
                .filter_units(&self.core.attacking_units, |u, t| t.is_air() && u.transported_by.is_some())?
                .into_iter()
                .map(|u| Change::set(u, UnitProperty::TransportedBy(None)))
                .collect()
        };
        if !released.is_empty() {
            bridge.apply_change(Change::Composite(released))?;
        }
        tracker.record_finished_attacks(self.core.site, self.dependent.attacking_from_map().clone());
        self.core.finish(WhoWon::Attacker, self.result, tracker, bridge)
    }

    /// Strip units lost (or withdrawn) in a preceding battle. Losing every
    /// attacker turns the conquest into a loss.
    pub fn units_lost_in_preceding_battle(
        &mut self,
        units: &[UnitId],
        withdrawn: bool,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        let mut lost: Vec<UnitId> = units
            .iter()
            .copied()
            .filter(|u| self.core.attacking_units.contains(u))
            .collect();
        lost.extend(self.core.dependents_of(&lost, bridge.state()));
        if lost.is_empty() {
            return Ok(());
        }
        self.dependent.remove_units(&lost);
        if withdrawn {
            self.core.remove_from_sets(&lost);
        } else {
            self.core.remove(&lost, tracker, bridge)?;
        }
        if self.core.attacking_units.is_empty() && !self.core.is_over() {
            debug!(battle = %self.core.id, "finished battle lost every attacker");
            self.core.finish(WhoWon::Defender, BattleResultDescription::Lost, tracker, bridge)?;
        }
        Ok(())
    }
}
