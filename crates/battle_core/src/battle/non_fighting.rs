//! Uncontested entries that had to wait on another battle.
//!
//! Land units unloaded into an empty enemy territory can only take it once
//! the sea battle they were carried through is over. The entry is tracked as
//! a battle with no fighting so the dependency edge has something to block.

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::battle::common::{territory_name, BattleCore, BattleResultDescription, Side, WhoWon};
use crate::battle::dependent::DependentState;
use crate::bridge::Bridge;
use crate::error::{BattleError, Result};
use crate::ids::UnitId;
use crate::route::Route;
use crate::state::GameState;
use crate::tracker::BattleTracker;

/// Battle without combat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonFightingBattle {
    core: BattleCore,
    dependent: DependentState,
}

impl NonFightingBattle {
    /// New entry with no units yet.
    #[must_use]
    pub fn new(core: BattleCore) -> Self {
        Self {
            core,
            dependent: DependentState::new(),
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

    /// Allied ground units hold the site.
    fn has_attacking_units(&self, state: &GameState) -> Result<bool> {
        let attacker = self.core.attacker;
        let held = state.units_at_matching(self.core.site, |u, t| {
            state.are_allied(u.owner, attacker) && !t.is_air() && !t.is_infrastructure()
        })?;
        Ok(!held.is_empty())
    }

    /// Resolve the entry once nothing blocks it.
    ///
    /// # Errors
    ///
    /// [`BattleError::InvariantViolation`] while a prerequisite battle is
    /// still pending.
    pub fn fight(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let pending = tracker.get_dependent_on(self.core.id);
        if !pending.is_empty() {
            error!(battle = %self.core.id, ?pending, "non-fighting battle fought before its prerequisites");
            return Err(BattleError::InvariantViolation(format!(
                "{} must wait for {} battles",
                self.core.id,
                pending.len()
            )));
        }
        let site = self.core.site;
        if self.has_attacking_units(bridge.state())? {
            let arriving = self.core.attacking_units.clone();
            tracker.take_over(site, self.core.attacker, &arriving, bridge)?;
            tracker.add_to_conquered(site);
            bridge.history_event(
                format!("{} taken without a fight", territory_name(bridge.state(), site)),
                &arriving,
            );
            self.core.finish(WhoWon::Attacker, BattleResultDescription::Blitzed, tracker, bridge)
        } else {
            self.core.finish(WhoWon::Defender, BattleResultDescription::Lost, tracker, bridge)
        }
    }

    /// Strip units lost (or withdrawn) in a preceding battle. Once no
    /// attacker is left the entry disappears without a record.
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
            debug!(battle = %self.core.id, "non-fighting battle emptied");
            self.core
                .finish_without_record(WhoWon::Defender, BattleResultDescription::Lost, tracker)?;
        }
        Ok(())
    }
}
