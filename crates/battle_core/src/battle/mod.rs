//! Battles.
//!
//! Every engagement is one [`Battle`] value: a closed set of variants that
//! share a [`BattleCore`] and dispatch the common operations. Battles never
//! hold references to each other; the tracker owns them and the dependency
//! edges between them, keyed by [`BattleId`].

pub mod air;
pub mod bombing;
pub mod common;
pub mod dependent;
pub mod finished;
pub mod fought;
pub mod non_fighting;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub use air::{AirBattle, AirStep};
pub use bombing::{BombingRaidBattle, BombingStep};
pub use common::{BattleCore, BattleResultDescription, BattleType, ReturnFire, Side, WhoWon};
pub use dependent::DependentState;
pub use finished::FinishedBattle;
pub use fought::{FiringOrder, FoughtBattle, FoughtStep};
pub use non_fighting::NonFightingBattle;

use crate::bridge::Bridge;
use crate::error::Result;
use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId};
use crate::state::GameState;
use crate::tracker::{AttackMove, BattleTracker};

/// One pending engagement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Battle {
    /// Multi-round combined-arms battle.
    Fought(FoughtBattle),
    /// Air battle or air raid.
    Air(AirBattle),
    /// Strategic bombing raid.
    Bombing(BombingRaidBattle),
    /// Entry waiting on a preceding battle.
    NonFighting(NonFightingBattle),
    /// Conquest already made.
    Finished(FinishedBattle),
}

impl Battle {
    /// Shared state.
    #[must_use]
    pub const fn core(&self) -> &BattleCore {
        match self {
            Self::Fought(b) => b.core(),
            Self::Air(b) => b.core(),
            Self::Bombing(b) => b.core(),
            Self::NonFighting(b) => b.core(),
            Self::Finished(b) => b.core(),
        }
    }

    pub(crate) fn core_mut(&mut self) -> &mut BattleCore {
        match self {
            Self::Fought(b) => b.core_mut(),
            Self::Air(b) => b.core_mut(),
            Self::Bombing(b) => b.core_mut(),
            Self::NonFighting(b) => b.core_mut(),
            Self::Finished(b) => b.core_mut(),
        }
    }

    /// Battle id.
    #[must_use]
    pub const fn id(&self) -> BattleId {
        self.core().id
    }

    /// Battle site.
    #[must_use]
    pub const fn site(&self) -> TerritoryId {
        self.core().site
    }

    /// Battle type.
    #[must_use]
    pub const fn battle_type(&self) -> BattleType {
        self.core().battle_type
    }

    /// Attacking player.
    #[must_use]
    pub const fn attacker(&self) -> PlayerId {
        self.core().attacker
    }

    /// Defending player.
    #[must_use]
    pub const fn defender(&self) -> PlayerId {
        self.core().defender
    }

    /// Battle has ended.
    #[must_use]
    pub const fn is_over(&self) -> bool {
        self.core().is_over()
    }

    /// No attackers left; the battle need not be fought.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Fought(b) => b.is_empty(),
            Self::Air(b) => b.is_empty(),
            Self::Bombing(b) => b.is_empty(),
            Self::NonFighting(b) => b.is_empty(),
            Self::Finished(b) => b.is_empty(),
        }
    }

    /// A fight was started and is waiting to be resumed.
    #[must_use]
    pub const fn is_executing(&self) -> bool {
        match self {
            Self::Fought(b) => b.stack().is_executing(),
            Self::Air(b) => b.stack().is_executing(),
            Self::Bombing(b) => b.stack().is_executing(),
            Self::NonFighting(_) | Self::Finished(_) => false,
        }
    }

    /// Origin bookkeeping, for variants that can be amphibious.
    #[must_use]
    pub const fn dependent(&self) -> Option<&DependentState> {
        match self {
            Self::Fought(b) => Some(b.dependent()),
            Self::NonFighting(b) => Some(b.dependent()),
            Self::Finished(b) => Some(b.dependent()),
            Self::Air(_) | Self::Bombing(_) => None,
        }
    }

    /// Some attackers landed from the sea.
    #[must_use]
    pub fn is_amphibious(&self) -> bool {
        self.dependent().is_some_and(DependentState::is_amphibious)
    }

    /// Territories the attack came from.
    #[must_use]
    pub fn attacking_from(&self) -> BTreeSet<TerritoryId> {
        self.dependent().map(DependentState::attacking_from).unwrap_or_default()
    }

    /// Sea zones amphibious attackers unloaded from.
    #[must_use]
    pub fn amphibious_attack_territories(&self) -> BTreeSet<TerritoryId> {
        self.dependent()
            .map(|d| d.amphibious_attack_territories().clone())
            .unwrap_or_default()
    }

    /// Attacking land units that came ashore.
    #[must_use]
    pub fn amphibious_land_attackers(&self) -> Vec<UnitId> {
        self.dependent()
            .map(|d| d.amphibious_land_attackers().to_vec())
            .unwrap_or_default()
    }

    /// Ships assigned to bombard.
    #[must_use]
    pub fn bombarding_units(&self) -> Vec<UnitId> {
        self.dependent().map(|d| d.bombarding_units().to_vec()).unwrap_or_default()
    }

    /// Assign a ship to bombard. Only fought battles bombard.
    pub fn add_bombarding_unit(&mut self, unit: UnitId) {
        if let Self::Fought(b) = self {
            b.dependent_mut().add_bombarding_unit(unit);
        }
    }

    /// Step labels still queued, next to run first.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<String> {
        match self {
            Self::Fought(b) => b.pending_steps().iter().filter_map(FoughtStep::label).collect(),
            Self::Air(b) => b.pending_steps(),
            Self::Bombing(b) => b.pending_steps(),
            Self::NonFighting(_) | Self::Finished(_) => Vec::new(),
        }
    }

    /// Join the units of a move to this battle.
    pub fn add_attack(&mut self, attack: &AttackMove, bridge: &mut dyn Bridge) -> Result<()> {
        match self {
            Self::Fought(b) => b.add_attack(&attack.route, &attack.units, bridge),
            Self::Air(b) => {
                b.add_attack(&attack.units);
                Ok(())
            }
            Self::Bombing(b) => {
                b.add_attack(&attack.units, &attack.targets);
                Ok(())
            }
            Self::NonFighting(b) => b.add_attack(&attack.route, &attack.units, bridge.state()),
            Self::Finished(b) => b.add_attack(&attack.route, &attack.units, bridge.state()),
        }
    }

    /// Take units of an undone move back out.
    pub fn remove_attack(&mut self, units: &[UnitId]) {
        match self {
            Self::Fought(b) => b.remove_attack(units),
            Self::Air(b) => b.remove_attack(units),
            Self::Bombing(b) => b.remove_attack(units),
            Self::NonFighting(b) => b.remove_attack(units),
            Self::Finished(b) => b.remove_attack(units),
        }
    }

    /// Strip units a prerequisite battle destroyed (or withdrew).
    pub fn units_lost_in_preceding_battle(
        &mut self,
        units: &[UnitId],
        withdrawn: bool,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        match self {
            Self::Fought(b) => b.units_lost_in_preceding_battle(units, withdrawn, tracker, bridge),
            Self::Air(b) => {
                b.units_lost_in_preceding_battle(units);
                Ok(())
            }
            Self::Bombing(b) => {
                b.units_lost_in_preceding_battle(units);
                Ok(())
            }
            Self::NonFighting(b) => b.units_lost_in_preceding_battle(units, withdrawn, tracker, bridge),
            Self::Finished(b) => b.units_lost_in_preceding_battle(units, withdrawn, tracker, bridge),
        }
    }

    /// Refresh the defenders from the units now at the site.
    pub fn reset_defending_units(&mut self, state: &GameState) -> Result<()> {
        match self {
            Self::Fought(b) => b.reset_defending_units(state),
            Self::Air(b) => b.update_defending_units(state)?,
            Self::Bombing(b) => b.update_defending_units(state),
            Self::NonFighting(_) | Self::Finished(_) => {}
        }
        Ok(())
    }

    /// Run (or resume) the battle.
    pub fn fight(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        match self {
            Self::Fought(b) => b.fight(tracker, bridge),
            Self::Air(b) => b.fight(tracker, bridge),
            Self::Bombing(b) => b.fight(tracker, bridge),
            Self::NonFighting(b) => b.fight(tracker, bridge),
            Self::Finished(b) => b.fight(tracker, bridge),
        }
    }

    /// End the battle without a result and deregister it.
    pub fn cancel(&mut self, tracker: &mut BattleTracker) -> Result<()> {
        match self {
            Self::Fought(b) => b.clear_stack(),
            Self::Air(b) => b.clear_stack(),
            Self::Bombing(b) => b.clear_stack(),
            Self::NonFighting(_) | Self::Finished(_) => {}
        }
        let id = self.id();
        self.core_mut().mark_over()?;
        tracker.records.remove(id);
        tracker.remove_battle(id);
        Ok(())
    }
}
