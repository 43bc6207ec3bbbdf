//! Multi-round combined-arms combat.
//!
//! Each round is a list of [`FoughtStep`] values pushed onto the battle's
//! step stack. The list is rebuilt from the forces left at the start of
//! every round, and [`FoughtStep::NextRound`] is always the last step: it
//! must find the stack empty before it pushes the next round.
//!
//! ## Round order
//!
//! 1. AA fire (attacker guns, then defender guns)
//! 2. First round only: bombardment, suicide units, paratroops
//! 3. Optional submarine withdrawal before the fire phase
//! 4. Undefended transports and units that cannot fight are removed
//! 5. Submarine sneak attacks, then the main exchange ([`FiringOrder`])
//! 6. Casualties removed, end check, retreat questions

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::battle::common::{
    fire_phase, fire_states, push_new, territory_name, units_to_text, BattleCore, BattleResultDescription, FireKind,
    FireState, ReturnFire, Side, WhoWon,
};
use crate::battle::dependent::DependentState;
use crate::bridge::{Bridge, DisplayEvent, RetreatRequest, SoundClip};
use crate::change::{Change, UnitProperty};
use crate::data::{UnitTrait, UnitType};
use crate::error::{BattleError, Result};
use crate::ids::{TerritoryId, UnitId};
use crate::matches;
use crate::route::Route;
use crate::rules::BattleRules;
use crate::stack::ExecutionStack;
use crate::state::{GameState, Unit};
use crate::tracker::BattleTracker;

/// One step of a fought battle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FoughtStep {
    /// AA guns of one side fire, one step per AA type.
    FireAa {
        /// Side owning the guns.
        side: Side,
    },
    /// A firing group in flight.
    Fire(FireState),
    /// Bombarding ships fire (first round).
    NavalBombardment,
    /// Attacking suicide units fire (first round).
    SuicideAttack,
    /// Defending suicide units fire (first round).
    SuicideDefend,
    /// Set aside units that cannot fight here.
    RemoveNonCombatants,
    /// Paratroopers leave their air transports.
    LandParatroops,
    /// Attackers spend their remaining movement.
    MarkNoMovementLeft,
    /// Ask the attacker about withdrawing submarines.
    AttackerSubsRetreat,
    /// Ask the defender about withdrawing submarines.
    DefenderSubsRetreat,
    /// Remove suicide units that have fired.
    CheckSuicideUnits,
    /// Undefended transports die, then sides that cannot fight lose.
    RemoveUndefendedTransports,
    /// Submarines facing only aircraft submerge.
    SubmergeSubsVsOnlyAir,
    /// Defending submarines fire.
    DefendSubs(ReturnFire),
    /// Attacking submarines fire.
    AttackSubs(ReturnFire),
    /// Attacking aircraft fire at everything but submarines.
    AttackAirOnNonSubs,
    /// Attacking non-submarines fire.
    AttackNonSubs,
    /// Defending aircraft fire at everything but submarines.
    DefendAirOnNonSubs,
    /// Defending non-submarines fire.
    DefendNonSubs,
    /// Remove the units hit this round.
    ClearWaitingToDie,
    /// Decide whether the battle is over.
    CheckEnd,
    /// Attacking planes may leave an amphibious assault.
    PlanesRetreat,
    /// Non-amphibious attackers may leave an amphibious assault.
    PartialAmphibiousRetreat,
    /// The attacker may withdraw.
    AttackerRetreat,
    /// Start the next round.
    NextRound,
}

impl FoughtStep {
    /// Name shown in the round's step list, if the step is shown at all.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        let text = match self {
            Self::FireAa { side: Side::Attacker } => "Attacker AA fire",
            Self::FireAa { side: Side::Defender } => "Defender AA fire",
            Self::Fire(fire) => return Some(fire.step_name.clone()),
            Self::NavalBombardment => "Naval bombardment",
            Self::SuicideAttack => "Suicide attack",
            Self::SuicideDefend => "Suicide defence",
            Self::LandParatroops => "Land paratroops",
            Self::AttackerSubsRetreat => "Attacker subs withdraw?",
            Self::DefenderSubsRetreat => "Defender subs withdraw?",
            Self::RemoveUndefendedTransports => "Remove undefended transports",
            Self::SubmergeSubsVsOnlyAir => "Submerge subs facing aircraft",
            Self::DefendSubs(_) => "Defender subs fire",
            Self::AttackSubs(_) => "Attacker subs fire",
            Self::AttackAirOnNonSubs => "Attacker aircraft fire",
            Self::AttackNonSubs => "Attackers fire",
            Self::DefendAirOnNonSubs => "Defender aircraft fire",
            Self::DefendNonSubs => "Defenders fire",
            Self::ClearWaitingToDie => "Remove casualties",
            Self::PlanesRetreat => "Attacker planes withdraw?",
            Self::PartialAmphibiousRetreat => "Attacker non-amphibious units withdraw?",
            Self::AttackerRetreat => "Attacker withdraw?",
            Self::RemoveNonCombatants
            | Self::MarkNoMovementLeft
            | Self::CheckSuicideUnits
            | Self::CheckEnd
            | Self::NextRound => return None,
        };
        Some(text.to_string())
    }
}

// ============================================================================
// Firing order
// ============================================================================

/// Sneak-attack and return-fire rules for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiringOrder {
    /// Return fire of units hit by attacking submarines.
    pub vs_attacking_subs: ReturnFire,
    /// Return fire of units hit by defending submarines.
    pub vs_defending_subs: ReturnFire,
    /// Defending submarines fire before everyone else.
    pub defender_subs_fire_first: bool,
    /// Only the attacker's submarines get a sneak attack.
    pub only_attacker_sneak_attack: bool,
    /// Defending submarines fire together with the other defenders.
    pub defending_subs_fire_with_all_defenders: bool,
    /// Defending submarines may sneak attack under these rules.
    pub defending_subs_sneak_attack: bool,
}

impl FiringOrder {
    /// Derive the order from the rules and destroyer presence.
    #[must_use]
    pub fn new(rules: &BattleRules, attacker_has_destroyer: bool, defender_has_destroyer: bool) -> Self {
        let sneak3 = rules.ww2v2 || rules.defending_subs_sneak_attack;
        let sneak2 = !attacker_has_destroyer && sneak3;
        let attacking_subs_sneak = !defender_has_destroyer;

        let vs_attacking_subs = if !attacking_subs_sneak {
            ReturnFire::All
        } else if sneak2 || rules.ww2v2 {
            ReturnFire::Subs
        } else {
            ReturnFire::None
        };
        let vs_defending_subs = if !sneak2 {
            ReturnFire::All
        } else if attacking_subs_sneak || rules.ww2v2 {
            ReturnFire::Subs
        } else {
            ReturnFire::None
        };
        let dsff = vs_attacking_subs == ReturnFire::All && vs_defending_subs == ReturnFire::None;
        Self {
            vs_attacking_subs,
            vs_defending_subs,
            defender_subs_fire_first: dsff,
            only_attacker_sneak_attack: !dsff
                && vs_attacking_subs == ReturnFire::None
                && vs_defending_subs == ReturnFire::All,
            defending_subs_fire_with_all_defenders: !dsff && !rules.ww2v2 && vs_defending_subs == ReturnFire::All,
            defending_subs_sneak_attack: sneak3,
        }
    }

    /// Fire steps of the main exchange, in order.
    #[must_use]
    pub fn steps(&self, air_attack_sub_restricted: bool) -> Vec<FoughtStep> {
        let dsff = self.defender_subs_fire_first;
        let dsfwad = self.defending_subs_fire_with_all_defenders;
        let sneak3 = self.defending_subs_sneak_attack;
        let mut steps = Vec::new();
        if dsff {
            steps.push(FoughtStep::DefendSubs(self.vs_defending_subs));
        }
        steps.push(FoughtStep::AttackSubs(self.vs_attacking_subs));
        if sneak3 && !dsff && !dsfwad {
            steps.push(FoughtStep::DefendSubs(self.vs_defending_subs));
        }
        if air_attack_sub_restricted {
            steps.push(FoughtStep::AttackAirOnNonSubs);
        }
        steps.push(FoughtStep::AttackNonSubs);
        if !dsff && (!sneak3 || dsfwad) {
            steps.push(FoughtStep::DefendSubs(self.vs_defending_subs));
        }
        if air_attack_sub_restricted {
            steps.push(FoughtStep::DefendAirOnNonSubs);
        }
        steps.push(FoughtStep::DefendNonSubs);
        steps
    }
}

// ============================================================================
// Fought battle
// ============================================================================

/// Full land or sea battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoughtBattle {
    core: BattleCore,
    dependent: DependentState,
    stack: ExecutionStack<FoughtStep>,
}

impl FoughtBattle {
    /// New battle defended by every enemy of the attacker at the site.
    #[must_use]
    pub fn new(core: BattleCore, state: &GameState) -> Self {
        let mut battle = Self {
            core,
            dependent: DependentState::new(),
            stack: ExecutionStack::new(),
        };
        battle.reset_defending_units(state);
        battle
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

    pub(crate) fn dependent_mut(&mut self) -> &mut DependentState {
        &mut self.dependent
    }

    /// Pending steps.
    #[must_use]
    pub const fn stack(&self) -> &ExecutionStack<FoughtStep> {
        &self.stack
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// No attackers left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.attacking_units.is_empty() && self.core.attacking_waiting_to_die.is_empty()
    }

    /// Defenders become every enemy of the attacker at the site.
    pub fn reset_defending_units(&mut self, state: &GameState) {
        let site = self.core.site;
        let attacker = self.core.attacker;
        self.core.defending_units = state
            .units()
            .filter(|u| u.location == site && state.at_war(u.owner, attacker))
            .map(|u| u.id)
            .collect();
    }

    /// Join units moving along `route` to the attack.
    pub fn add_attack(&mut self, route: &Route, units: &[UnitId], bridge: &mut dyn Bridge) -> Result<()> {
        let attacker = self.core.attacker;
        let water = self.core.water;
        let mut changes = Vec::new();
        let attacking = {
            let state = bridge.state();
            let mut attacking = if state.rules.ww2v2 {
                state.filter_units(units, matches::owned_by(attacker))?
            } else {
                units.to_vec()
            };
            self.dependent.record_attack(route, &attacking, state)?;

            for &id in &attacking {
                let cargo: Vec<UnitId> = state
                    .units()
                    .filter(|u| u.transported_by == Some(id))
                    .map(|u| u.id)
                    .collect();
                if !cargo.is_empty() {
                    push_new(self.core.dependent_units.entry(id).or_default(), &cargo);
                }
            }

            if !state.rules.allied_air_independent {
                let allied_air = state.filter_units(&attacking, |u, t| {
                    u.owner != attacker && t.can_land_on_carrier() && u.transported_by.is_none()
                })?;
                let carriers = state.filter_units(&attacking, |u, t| u.owner == attacker && t.is_carrier())?;
                let mut room: Vec<(UnitId, u32)> = Vec::with_capacity(carriers.len());
                for carrier in carriers {
                    room.push((carrier, state.unit_type(carrier)?.carrier_capacity));
                }
                for plane in allied_air {
                    let cost = state.unit_type(plane)?.carrier_cost;
                    if let Some(slot) = room.iter_mut().find(|slot| slot.1 >= cost) {
                        slot.1 -= cost;
                        changes.push(Change::set(plane, UnitProperty::TransportedBy(Some(slot.0))));
                        push_new(self.core.dependent_units.entry(slot.0).or_default(), &[plane]);
                        attacking.retain(|&u| u != plane);
                    }
                }
            }

            for &id in &attacking {
                let unit = state.unit(id)?;
                let t = state.unit_types.get(unit.type_id)?;
                let spent = if water { !t.is_air() && !t.is_land() } else { !t.is_air() };
                if spent && unit.movement_left > 0 {
                    changes.push(Change::set(id, UnitProperty::MovementLeft(0)));
                }
            }
            attacking
        };
        self.core.add_units(Side::Attacker, &attacking);
        if !changes.is_empty() {
            bridge.apply_change(Change::Composite(changes))?;
        }
        self.reset_defending_units(bridge.state());
        Ok(())
    }

    /// Take units back out of the attack (their move was undone).
    pub fn remove_attack(&mut self, units: &[UnitId]) {
        self.core.attacking_units.retain(|u| !units.contains(u));
        self.dependent.remove_units(units);
        for u in units {
            self.core.dependent_units.remove(u);
        }
        for deps in self.core.dependent_units.values_mut() {
            deps.retain(|u| !units.contains(u));
        }
    }

    /// Strip units a preceding battle destroyed (or withdrew) from the attack.
    pub fn units_lost_in_preceding_battle(
        &mut self,
        units: &[UnitId],
        withdrawn: bool,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if self.core.is_over() {
            return Ok(());
        }
        let mut lost: Vec<UnitId> = units
            .iter()
            .copied()
            .filter(|u| self.core.attacking_units.contains(u))
            .collect();
        let cargo = self.core.dependents_of(&lost, bridge.state());
        push_new(&mut lost, &cargo);
        if lost.is_empty() {
            return Ok(());
        }
        debug!(battle = %self.core.id, ?lost, withdrawn, "units lost in preceding battle");
        self.dependent.remove_units(&lost);
        self.core.remove_from_sets(&lost);
        if !withdrawn {
            let site = self.core.site;
            let here: Vec<UnitId> = {
                let state = bridge.state();
                lost.iter()
                    .copied()
                    .filter(|&u| state.unit(u).is_ok_and(|unit| unit.location == site))
                    .collect()
            };
            self.core.remove(&here, tracker, bridge)?;
        }
        if self.core.attacking_units.is_empty() {
            self.core.finish(WhoWon::Defender, BattleResultDescription::Lost, tracker, bridge)?;
        }
        Ok(())
    }

    /// Step labels still queued, next to run first.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<FoughtStep> {
        self.stack.steps().iter().rev().cloned().collect()
    }

    // ========================================================================
    // Fight
    // ========================================================================

    /// Run the battle until it ends or a decision is pending.
    ///
    /// # Errors
    ///
    /// [`BattleError::Suspended`] leaves the interrupted step queued; calling
    /// `fight` again resumes from it.
    pub fn fight(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if self.core.is_over() {
            return Err(BattleError::InvariantViolation(format!("{} fought after it ended", self.core.id)));
        }
        if self.stack.is_executing() {
            debug!(battle = %self.core.id, round = self.core.round, "resuming battle");
            self.show(bridge);
            return self.drain(tracker, bridge);
        }

        self.drop_missing_units(bridge.state());
        self.core.snapshot_starting_units();
        info!(
            battle = %self.core.id,
            site = %self.core.site,
            attackers = self.core.attacking_units.len(),
            defenders = self.core.defending_units.len(),
            "battle started"
        );
        let mut everyone = self.core.attacking_units.clone();
        everyone.extend_from_slice(&self.core.defending_units);
        bridge.history_event(
            format!("Battle in {}", territory_name(bridge.state(), self.core.site)),
            &everyone,
        );
        self.show(bridge);

        let (attackers_fight, defenders_fight) = {
            let state = bridge.state();
            (
                state.any_unit(&self.core.attacking_units, matches::is_not_infrastructure)?,
                state.any_unit(&self.core.defending_units, matches::is_not_infrastructure)?,
            )
        };
        if !attackers_fight {
            return self.defender_wins(tracker, bridge);
        }
        if !defenders_fight {
            return self.attacker_wins(tracker, bridge);
        }

        let clip = if self.core.water { SoundClip::BattleSea } else { SoundClip::BattleLand };
        bridge.play_sound(clip, self.core.attacker);
        let steps = self.round_steps(true, bridge.state())?;
        self.list_steps(&steps, bridge);
        self.stack.push_all(steps);
        self.drain(tracker, bridge)
    }

    fn drain(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let mut stack = std::mem::take(&mut self.stack);
        let result = stack.execute(|step, stack| self.run_step(step, stack, tracker, bridge));
        self.stack = stack;
        if let Err(e) = &result {
            if e.is_suspension() {
                debug!(battle = %self.core.id, round = self.core.round, "battle suspended");
            } else {
                error!(battle = %self.core.id, error = %e, "battle step failed");
            }
        }
        result
    }

    fn show(&self, bridge: &mut dyn Bridge) {
        let title = self.core.title(bridge.state());
        bridge.notify(DisplayEvent::ShowBattle {
            battle: self.core.id,
            site: self.core.site,
            title,
            attackers: self.core.attacking_units.clone(),
            defenders: self.core.defending_units.clone(),
        });
    }

    fn list_steps(&self, steps: &[FoughtStep], bridge: &mut dyn Bridge) {
        bridge.notify(DisplayEvent::ListSteps {
            battle: self.core.id,
            steps: steps.iter().filter_map(FoughtStep::label).collect(),
        });
    }

    fn drop_missing_units(&mut self, state: &GameState) {
        let site = self.core.site;
        let present = |u: &UnitId| state.unit(*u).is_ok_and(|unit| unit.location == site);
        self.core.attacking_units.retain(present);
        self.core.defending_units.retain(present);
    }

    /// Steps of one round.
    fn round_steps(&self, first_run: bool, state: &GameState) -> Result<Vec<FoughtStep>> {
        let rules = &state.rules;
        let mut steps = Vec::new();
        if !self.aa_guns(Side::Attacker, state)?.is_empty() {
            steps.push(FoughtStep::FireAa { side: Side::Attacker });
        }
        if !self.aa_guns(Side::Defender, state)?.is_empty() {
            steps.push(FoughtStep::FireAa { side: Side::Defender });
        }
        if first_run {
            if !self.dependent.bombarding_units().is_empty() {
                steps.push(FoughtStep::NavalBombardment);
            }
            steps.push(FoughtStep::SuicideAttack);
            if !rules.defending_suicide_and_munition_units_do_not_fire {
                steps.push(FoughtStep::SuicideDefend);
            }
            steps.push(FoughtStep::RemoveNonCombatants);
            steps.push(FoughtStep::LandParatroops);
            steps.push(FoughtStep::MarkNoMovementLeft);
        } else {
            steps.push(FoughtStep::RemoveNonCombatants);
        }
        if rules.sub_retreat_before_battle {
            steps.push(FoughtStep::AttackerSubsRetreat);
            steps.push(FoughtStep::DefenderSubsRetreat);
        }
        steps.push(FoughtStep::CheckSuicideUnits);
        steps.push(FoughtStep::RemoveUndefendedTransports);
        if rules.air_attack_sub_restricted {
            steps.push(FoughtStep::SubmergeSubsVsOnlyAir);
        }

        let attacker_destroyer = state.any_unit(&self.core.attacking_units, matches::is_destroyer)?;
        let defender_destroyer = state.any_unit(&self.core.defending_units, matches::is_destroyer)?;
        let order = FiringOrder::new(rules, attacker_destroyer, defender_destroyer);
        debug!(
            battle = %self.core.id,
            round = self.core.round,
            ?order.vs_attacking_subs,
            ?order.vs_defending_subs,
            only_attacker_sneak_attack = order.only_attacker_sneak_attack,
            "firing order"
        );
        steps.extend(order.steps(rules.air_attack_sub_restricted));

        steps.push(FoughtStep::ClearWaitingToDie);
        steps.push(FoughtStep::CheckSuicideUnits);
        steps.push(FoughtStep::CheckEnd);
        steps.push(FoughtStep::AttackerSubsRetreat);
        steps.push(FoughtStep::DefenderSubsRetreat);
        steps.push(FoughtStep::PlanesRetreat);
        steps.push(FoughtStep::PartialAmphibiousRetreat);
        steps.push(FoughtStep::AttackerRetreat);
        steps.push(FoughtStep::NextRound);
        Ok(steps)
    }

    fn run_step(
        &mut self,
        step: FoughtStep,
        stack: &mut ExecutionStack<FoughtStep>,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if self.core.is_over() {
            return Ok(());
        }
        if let Some(label) = step.label() {
            debug!(battle = %self.core.id, round = self.core.round, step = %label, "step");
        }
        match step {
            FoughtStep::FireAa { side } => self.fire_aa(side, stack, bridge.state()),
            FoughtStep::Fire(fire) => {
                if let Some(next) = fire_phase(&mut self.core, fire, tracker, bridge)? {
                    stack.push(FoughtStep::Fire(next));
                }
                Ok(())
            }
            FoughtStep::NavalBombardment => self.naval_bombardment(stack, bridge.state()),
            FoughtStep::SuicideAttack => self.suicide_fire(Side::Attacker, stack, bridge.state()),
            FoughtStep::SuicideDefend => self.suicide_fire(Side::Defender, stack, bridge.state()),
            FoughtStep::RemoveNonCombatants => self.remove_non_combatants(bridge.state()),
            FoughtStep::LandParatroops => self.land_paratroops(bridge),
            FoughtStep::MarkNoMovementLeft => self.mark_no_movement_left(bridge),
            FoughtStep::AttackerSubsRetreat => self.attacker_subs_retreat(tracker, bridge),
            FoughtStep::DefenderSubsRetreat => self.defender_subs_retreat(tracker, bridge),
            FoughtStep::CheckSuicideUnits => self.check_suicide_units(tracker, bridge),
            FoughtStep::RemoveUndefendedTransports => {
                self.remove_undefended_transports(Side::Defender, tracker, bridge)?;
                self.remove_undefended_transports(Side::Attacker, tracker, bridge)?;
                self.roll_left(Side::Attacker, tracker, bridge)?;
                self.roll_left(Side::Defender, tracker, bridge)
            }
            FoughtStep::SubmergeSubsVsOnlyAir => self.submerge_subs_vs_only_air(bridge),
            FoughtStep::DefendSubs(rf) => self.defend_subs(rf, stack, bridge.state()),
            FoughtStep::AttackSubs(rf) => self.attack_subs(rf, stack, bridge.state()),
            FoughtStep::AttackAirOnNonSubs => self.air_on_non_subs(Side::Attacker, stack, bridge.state()),
            FoughtStep::AttackNonSubs => self.non_subs(Side::Attacker, stack, bridge.state()),
            FoughtStep::DefendAirOnNonSubs => self.air_on_non_subs(Side::Defender, stack, bridge.state()),
            FoughtStep::DefendNonSubs => self.non_subs(Side::Defender, stack, bridge.state()),
            FoughtStep::ClearWaitingToDie => self.core.clear_waiting_to_die(tracker, bridge),
            FoughtStep::CheckEnd => self.check_end(tracker, bridge),
            FoughtStep::PlanesRetreat => self.planes_retreat(tracker, bridge),
            FoughtStep::PartialAmphibiousRetreat => self.partial_amphibious_retreat(tracker, bridge),
            FoughtStep::AttackerRetreat => self.attacker_retreat(tracker, bridge),
            FoughtStep::NextRound => self.next_round(stack, bridge),
        }
    }

    fn next_round(&mut self, stack: &mut ExecutionStack<FoughtStep>, bridge: &mut dyn Bridge) -> Result<()> {
        if !stack.is_empty() {
            error!(battle = %self.core.id, pending = stack.len(), "steps left at round boundary");
            return Err(BattleError::InvariantViolation(format!(
                "{} has {} steps queued at the round boundary",
                self.core.id,
                stack.len()
            )));
        }
        self.core.round += 1;
        let steps = self.round_steps(false, bridge.state())?;
        self.list_steps(&steps, bridge);
        stack.push_all(steps);
        Ok(())
    }

    // ========================================================================
    // Fire steps
    // ========================================================================

    /// AA guns of `side` usable this round, by AA type.
    fn aa_guns(&self, side: Side, state: &GameState) -> Result<BTreeMap<String, Vec<UnitId>>> {
        let mut guns: BTreeMap<String, Vec<UnitId>> = BTreeMap::new();
        for &id in self.core.units(side) {
            let t = state.unit_type(id)?;
            let Some(aa) = &t.aa else { continue };
            let allowed = if side.is_defender() { aa.defensive } else { aa.offensive };
            let in_round = aa.max_rounds <= 0 || i64::from(self.core.round) <= i64::from(aa.max_rounds);
            if allowed && in_round {
                guns.entry(aa.aa_type.clone()).or_default().push(id);
            }
        }
        Ok(guns)
    }

    fn fire_aa(&self, side: Side, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        let mut fires = Vec::new();
        for (aa_type, guns) in self.aa_guns(side, state)?.into_iter().rev() {
            let Some(profile) = state.unit_type(guns[0])?.aa.clone() else { continue };
            let targets = state.filter_units(self.core.units(side.other()), |_, t| profile.targets.contains(&t.domain))?;
            if targets.is_empty() {
                continue;
            }
            let name = format!("{aa_type} fire");
            fires.push(FoughtStep::Fire(FireState::new(
                side,
                FireKind::Aa { aa_type },
                guns,
                targets,
                ReturnFire::None,
                name,
            )));
        }
        stack.push_all(fires);
        Ok(())
    }

    fn push_fire(
        &self,
        stack: &mut ExecutionStack<FoughtStep>,
        state: &GameState,
        side: Side,
        kind: &FireKind,
        firers: &[UnitId],
        targets: &[UnitId],
        return_fire: ReturnFire,
        name: &str,
    ) -> Result<()> {
        let fires = fire_states(state, side, kind, firers, targets, return_fire, name)?;
        stack.push_all(fires.into_iter().map(FoughtStep::Fire).collect::<Vec<_>>());
        Ok(())
    }

    fn naval_bombardment(&mut self, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        let ships: Vec<UnitId> = self
            .dependent
            .bombarding_units()
            .iter()
            .copied()
            .filter(|&u| state.has_unit(u))
            .collect();
        if ships.is_empty() {
            return Ok(());
        }
        let targets = state.filter_units(&self.core.defending_units, matches::is_not_infrastructure)?;
        let rf = if state.rules.naval_bombard_casualties_return_fire {
            ReturnFire::All
        } else {
            ReturnFire::None
        };
        self.push_fire(stack, state, Side::Attacker, &FireKind::Bombard, &ships, &targets, rf, "Bombard")
    }

    fn suicide_fire(&self, side: Side, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        let rules = &state.rules;
        if side.is_defender() && rules.defending_suicide_and_munition_units_do_not_fire {
            return Ok(());
        }
        let firers = state.filter_units(self.core.units(side), matches::is_suicide)?;
        if firers.is_empty() {
            return Ok(());
        }
        let mut targets = state.filter_units(self.core.units(side.other()), |u, t| {
            !t.is_infrastructure() && !t.has(UnitTrait::Suicide) && u.transported_by.is_none()
        })?;
        if rules.air_attack_sub_restricted && !state.any_unit(self.core.units(side), matches::is_destroyer)? {
            targets = state.filter_units(&targets, matches::is_not_sub)?;
        }
        if state.all_units(&firers, matches::is_sub)? {
            targets = state.filter_units(&targets, matches::is_not_air)?;
        }
        let rf = if rules.suicide_and_munition_casualties_restricted {
            ReturnFire::None
        } else {
            ReturnFire::All
        };
        let name = if side.is_defender() { "Suicide defence" } else { "Suicide attack" };
        self.push_fire(stack, state, side, &FireKind::Normal, &firers, &targets, rf, name)
    }

    fn attack_subs(&self, rf: ReturnFire, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        let firers = state.filter_units(&self.core.attacking_units, matches::is_sub)?;
        if firers.is_empty() {
            return Ok(());
        }
        let targets = state.filter_units(&self.core.defending_units, matches::is_not_air)?;
        self.push_fire(stack, state, Side::Attacker, &FireKind::Normal, &firers, &targets, rf, "Attacker subs fire")
    }

    fn defend_subs(&self, rf: ReturnFire, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        if self.core.attacking_units.is_empty() {
            return Ok(());
        }
        let firers = state.filter_units(&self.core.firing_units(Side::Defender), matches::is_sub)?;
        if firers.is_empty() {
            return Ok(());
        }
        let targets = state.filter_units(&self.core.attacking_units, matches::is_not_air)?;
        self.push_fire(stack, state, Side::Defender, &FireKind::Normal, &firers, &targets, rf, "Defender subs fire")
    }

    /// Air may hit submarines unless the site is water, the targets include a
    /// submarine and the firing side has no destroyer.
    fn can_air_attack_subs(&self, fired_at: &[UnitId], firing: &[UnitId], state: &GameState) -> Result<bool> {
        Ok(!(self.core.water
            && state.any_unit(fired_at, matches::is_sub)?
            && !state.any_unit(firing, matches::is_destroyer)?))
    }

    fn side_firers(&self, side: Side, state: &GameState) -> Result<Vec<UnitId>> {
        let units = self.core.firing_units(side);
        if side == Side::Attacker && !state.rules.allied_air_independent {
            return state.filter_units(&units, matches::owned_by(self.core.attacker));
        }
        Ok(units)
    }

    fn air_on_non_subs(&self, side: Side, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        let enemy = self.core.units(side.other());
        if enemy.is_empty() {
            return Ok(());
        }
        let units = self.side_firers(side, state)?;
        if self.can_air_attack_subs(enemy, &units, state)? {
            return Ok(());
        }
        let firers = state.filter_units(&units, matches::is_air)?;
        let targets = state.filter_units(enemy, matches::is_not_sub)?;
        let name = if side.is_defender() { "Defender aircraft fire" } else { "Attacker aircraft fire" };
        self.push_fire(stack, state, side, &FireKind::Normal, &firers, &targets, ReturnFire::All, name)
    }

    fn non_subs(&self, side: Side, stack: &mut ExecutionStack<FoughtStep>, state: &GameState) -> Result<()> {
        let enemy = self.core.units(side.other());
        if enemy.is_empty() {
            return Ok(());
        }
        let mut firers = state.filter_units(&self.side_firers(side, state)?, matches::is_not_sub)?;
        if state.rules.air_attack_sub_restricted && !self.can_air_attack_subs(enemy, &firers, state)? {
            firers = state.filter_units(&firers, matches::is_not_air)?;
        }
        let name = if side.is_defender() { "Defenders fire" } else { "Attackers fire" };
        self.push_fire(stack, state, side, &FireKind::Normal, &firers, enemy, ReturnFire::All, name)
    }

    // ========================================================================
    // Housekeeping steps
    // ========================================================================

    fn remove_non_combatants(&mut self, state: &GameState) -> Result<()> {
        let in_battle = matches::can_be_in_battle(self.core.water);
        let mut out = Vec::new();
        for side in [Side::Attacker, Side::Defender] {
            out.extend(state.filter_units(self.core.units(side), |u, t| !in_battle(u, t))?);
        }
        if !out.is_empty() {
            debug!(battle = %self.core.id, units = ?out, "non-combatants set aside");
            self.core.set_aside(&out);
        }
        Ok(())
    }

    fn land_paratroops(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let (planes, cargo) = {
            let state = bridge.state();
            let planes = state.filter_units(&self.core.attacking_units, |_, t| {
                t.is_air() && t.has(UnitTrait::AirTransport)
            })?;
            let site = self.core.site;
            let cargo: Vec<(UnitId, UnitId)> = state
                .units()
                .filter(|u| u.location == site)
                .filter_map(|u| u.transported_by.filter(|t| planes.contains(t)).map(|t| (u.id, t)))
                .collect();
            (planes, cargo)
        };
        if cargo.is_empty() {
            return Ok(());
        }
        let mut changes = Vec::with_capacity(cargo.len() * 2);
        let mut landed = Vec::with_capacity(cargo.len());
        for (unit, plane) in cargo {
            changes.push(Change::set(unit, UnitProperty::TransportedBy(None)));
            changes.push(Change::set(unit, UnitProperty::UnloadedFrom(Some(plane))));
            landed.push(unit);
        }
        bridge.apply_change(Change::Composite(changes))?;
        for plane in &planes {
            self.core.dependent_units.remove(plane);
        }
        self.core.add_units(Side::Attacker, &landed);
        bridge.history_event(format!("{} land", units_to_text(bridge.state(), &landed)), &landed);
        Ok(())
    }

    fn mark_no_movement_left(&self, bridge: &mut dyn Bridge) -> Result<()> {
        let changes: Vec<Change> = {
            let state = bridge.state();
            state
                .filter_units(&self.core.attacking_units, |u, t| !t.is_air() && u.movement_left > 0)?
                .into_iter()
                .map(|u| Change::set(u, UnitProperty::MovementLeft(0)))
                .collect()
        };
        if changes.is_empty() {
            return Ok(());
        }
        bridge.apply_change(Change::Composite(changes))
    }

    fn check_suicide_units(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let dead = {
            let state = bridge.state();
            let mut dead = state.filter_units(&self.core.attacking_units, matches::is_suicide)?;
            if !state.rules.defending_suicide_and_munition_units_do_not_fire {
                dead.extend(state.filter_units(&self.core.defending_units, matches::is_suicide)?);
            }
            dead
        };
        if dead.is_empty() {
            return Ok(());
        }
        bridge.notify(DisplayEvent::DeadUnits {
            battle: self.core.id,
            units: dead.clone(),
        });
        self.core.remove(&dead, tracker, bridge)?;
        Ok(())
    }

    fn remove_undefended_transports(
        &mut self,
        side: Side,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        let doomed = {
            let state = bridge.state();
            if !state.rules.transport_casualties_restricted || !self.core.water {
                return Ok(());
            }
            if side == Side::Attacker
                && (self.can_attacker_retreat(state, tracker)?
                    || state.any_unit(&self.core.attacking_units, matches::is_air)?)
            {
                return Ok(());
            }
            let mine = state.filter_units(self.core.units(side), |u, t| !t.is_land() && !u.submerged)?;
            if mine.is_empty() || !state.all_units(&mine, matches::is_non_combat_transport)? {
                return Ok(());
            }
            let enemy_defending = side.other().is_defender();
            let enemy_can_attack = state.any_unit(self.core.units(side.other()), |_, t| {
                (t.is_sea() || t.is_air()) && t.has_combat_ability(enemy_defending)
            })?;
            if !enemy_can_attack {
                return Ok(());
            }
            mine
        };
        bridge.history_event(
            format!("{} undefended and destroyed", units_to_text(bridge.state(), &doomed)),
            &doomed,
        );
        bridge.notify(DisplayEvent::DeadUnits {
            battle: self.core.id,
            units: doomed.clone(),
        });
        self.core.remove(&doomed, tracker, bridge)?;
        Ok(())
    }

    /// A side with nothing able to fight in the battle's domain loses the
    /// rest of its combat units when the enemy can still fight.
    fn roll_left(&mut self, side: Side, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let doomed = {
            let state = bridge.state();
            if side == Side::Attacker && self.can_attacker_retreat(state, tracker)? {
                return Ok(());
            }
            let water = self.core.water;
            let of_domain = move |u: &Unit, t: &UnitType| !u.submerged && if water { t.is_sea() } else { t.is_land() };
            let defending = side.is_defender();
            let can_fight =
                state.any_unit(self.core.units(side), |u, t| of_domain(u, t) && t.has_combat_ability(defending))?;
            let enemy_can_fight = state.any_unit(self.core.units(side.other()), |u, t| {
                of_domain(u, t) && t.has_combat_ability(!defending)
            })?;
            if can_fight || !enemy_can_fight {
                return Ok(());
            }
            state.filter_units(self.core.units(side), |u, t| of_domain(u, t) && !t.is_infrastructure())?
        };
        if doomed.is_empty() {
            return Ok(());
        }
        bridge.notify(DisplayEvent::DeadUnits {
            battle: self.core.id,
            units: doomed.clone(),
        });
        self.core.remove(&doomed, tracker, bridge)?;
        Ok(())
    }

    fn submerge_subs_vs_only_air(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let (side, subs) = {
            let state = bridge.state();
            if !self.core.water {
                return Ok(());
            }
            let att = &self.core.attacking_units;
            let def = &self.core.defending_units;
            if !att.is_empty() && state.all_units(att, matches::is_air)? && state.any_unit(def, matches::is_sub)? {
                (Side::Defender, state.filter_units(def, matches::is_sub)?)
            } else if !def.is_empty()
                && state.all_units(def, matches::is_air)?
                && state.any_unit(att, matches::is_sub)?
            {
                (Side::Attacker, state.filter_units(att, matches::is_sub)?)
            } else {
                return Ok(());
            }
        };
        self.submerge(side, &subs, bridge)
    }

    // ========================================================================
    // End of round
    // ========================================================================

    fn check_end(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let state = bridge.state();
        let attackers_left = state.any_unit(&self.core.attacking_units, matches::is_not_infrastructure)?;
        if !attackers_left {
            if !state.rules.transport_casualties_restricted {
                return self.defender_wins(tracker, bridge);
            }
            let attacker = self.core.attacker;
            let transports = state.units_at_matching(self.core.site, |u, t| {
                state.are_allied(u.owner, attacker) && t.is_non_combat_transport()
            })?;
            if transports.is_empty() || self.core.round > 1 {
                return self.defender_wins(tracker, bridge);
            }
            let in_battle = matches::can_be_in_battle(self.core.water);
            let owned = state.units_at_matching(self.core.site, |u, t| u.owner == attacker && in_battle(u, t))?;
            debug!(battle = %self.core.id, units = ?owned, "attackers reset to owned units");
            self.core.attacking_units = owned;
            return Ok(());
        }
        let defenders_left = state.any_unit(&self.core.defending_units, matches::is_not_infrastructure)?;
        if !defenders_left {
            self.remove_undefended_transports(Side::Attacker, tracker, bridge)?;
            self.roll_left(Side::Defender, tracker, bridge)?;
            return self.attacker_wins(tracker, bridge);
        }
        let attack_value = state.any_unit(&self.core.attacking_units, matches::has_strength(false))?;
        let defence_value = state.any_unit(&self.core.defending_units, matches::has_strength(true))?;
        if self.core.max_rounds_reached() || (!attack_value && !defence_value) {
            return self.nobody_wins(tracker, bridge);
        }
        Ok(())
    }

    fn attacker_wins(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let non_air = bridge.state().any_unit(&self.core.attacking_units, matches::is_not_air)?;
        let result = if non_air {
            tracker.add_to_conquered(self.core.site);
            let arriving = self.core.attacking_units.clone();
            tracker.take_over(self.core.site, self.core.attacker, &arriving, bridge)?;
            BattleResultDescription::Conquered
        } else {
            BattleResultDescription::WonWithoutConquering
        };
        self.end_battle(WhoWon::Attacker, result, tracker, bridge)
    }

    fn defender_wins(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if self.core.water {
            let stranded = {
                let state = bridge.state();
                let air = state.filter_units(&self.core.defending_units, matches::is_air)?;
                let mut needed = 0;
                for &plane in &air {
                    needed += state.unit_type(plane)?.carrier_cost;
                }
                let defender = self.core.defender;
                let mut room = 0;
                for carrier in state.units_at_matching(self.core.site, |u, t| {
                    t.is_carrier() && state.are_allied(u.owner, defender)
                })? {
                    room += state.unit_type(carrier)?.carrier_capacity;
                }
                if needed > room {
                    air
                } else {
                    Vec::new()
                }
            };
            if !stranded.is_empty() {
                tracker.add_defending_air_that_can_not_land(self.core.site, &stranded);
            }
        }
        self.end_battle(WhoWon::Defender, BattleResultDescription::Lost, tracker, bridge)
    }

    fn nobody_wins(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        self.end_battle(WhoWon::Draw, BattleResultDescription::Stalemate, tracker, bridge)
    }

    fn end_battle(
        &mut self,
        who_won: WhoWon,
        result: BattleResultDescription,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        self.core.clear_waiting_to_die(tracker, bridge)?;
        let released: Vec<Change> = {
            let state = bridge.state();
            let attacker = self.core.attacker;
            let mut released = Vec::new();
            for deps in self.core.dependent_units.values() {
                for &u in deps {
                    let Ok(unit) = state.unit(u) else { continue };
                    let air = state.unit_types.get(unit.type_id)?.is_air();
                    if air && unit.owner != attacker && unit.transported_by.is_some() {
                        released.push(Change::set(u, UnitProperty::TransportedBy(None)));
                    }
                }
            }
            released
        };
        if !released.is_empty() {
            bridge.apply_change(Change::Composite(released))?;
        }
        tracker.record_finished_attacks(self.core.site, self.dependent.attacking_from_map().clone());
        self.core.finish(who_won, result, tracker, bridge)
    }

    // ========================================================================
    // Retreats
    // ========================================================================

    /// The attacker may withdraw at all.
    fn can_attacker_retreat(&self, state: &GameState, tracker: &BattleTracker) -> Result<bool> {
        if self.dependent.is_amphibious() {
            return Ok(false);
        }
        let defenders = &self.core.defending_units;
        if state.rules.transport_casualties_restricted
            && !defenders.is_empty()
            && state.all_units(defenders, matches::is_non_combat_transport)?
        {
            return Ok(false);
        }
        Ok(!self.attacker_retreat_territories(state, tracker)?.is_empty())
    }

    /// Legal destinations for a full attacker retreat.
    pub fn attacker_retreat_territories(&self, state: &GameState, tracker: &BattleTracker) -> Result<Vec<TerritoryId>> {
        let rules = &state.rules;
        let site = self.core.site;
        let attackers = &self.core.attacking_units;
        if state.all_units(attackers, matches::is_air)? || rules.retreating_units_remain_in_place {
            return Ok(vec![site]);
        }
        let attacker = self.core.attacker;
        let mut options: BTreeSet<TerritoryId> = self.dependent.attacking_from();
        if rules.ww2v2 {
            for (from, units) in self.dependent.attacking_from_map() {
                if state.all_units(units, matches::is_air)? {
                    options.remove(from);
                }
            }
        }
        options.remove(&site);
        let mut legal = Vec::with_capacity(options.len());
        for t in options {
            if state.is_enemy_territory(attacker, t)? {
                continue;
            }
            let territory = state.territory(t)?;
            if territory.water && tracker.was_fought_over(t) {
                continue;
            }
            let blocking = state.units_at_matching(t, |u, ty| {
                state.at_war(u.owner, attacker)
                    && !ty.is_infrastructure()
                    && !(rules.ignore_sub_in_movement && ty.is_sub())
                    && !(rules.ignore_transport_in_movement && ty.is_non_combat_transport())
            })?;
            if blocking.is_empty() {
                legal.push(t);
            }
        }
        if !self.core.water && state.any_unit(attackers, matches::is_land)? {
            let mut land = Vec::with_capacity(legal.len());
            for t in legal {
                if !state.territory(t)?.water {
                    land.push(t);
                }
            }
            legal = land;
        }
        if state.any_unit(attackers, matches::is_sea)? {
            let mut sea = Vec::with_capacity(legal.len());
            for t in legal {
                if state.territory(t)?.water {
                    sea.push(t);
                }
            }
            legal = sea;
        }
        Ok(legal)
    }

    fn query_retreat(
        &self,
        side: Side,
        options: Vec<TerritoryId>,
        submerge: bool,
        message: String,
        bridge: &mut dyn Bridge,
    ) -> Result<Option<TerritoryId>> {
        let request = RetreatRequest {
            battle: self.core.id,
            site: self.core.site,
            submerge,
            options,
            message,
        };
        let player = self.core.player(side);
        match bridge.remote().retreat_query(player, &request)? {
            Some(t) if request.options.contains(&t) => Ok(Some(t)),
            Some(t) => {
                warn!(battle = %self.core.id, player = %player, destination = %t, "illegal retreat destination ignored");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn submerge(&mut self, side: Side, subs: &[UnitId], bridge: &mut dyn Bridge) -> Result<()> {
        if subs.is_empty() {
            return Ok(());
        }
        let changes = subs.iter().map(|&u| Change::set(u, UnitProperty::Submerged(true))).collect();
        bridge.apply_change(Change::Composite(changes))?;
        self.core.mark_retreated(side, subs);
        let message = format!("{} submerged", units_to_text(bridge.state(), subs));
        bridge.history_event(message.clone(), subs);
        bridge.play_sound(SoundClip::Submerge, self.core.player(side));
        bridge.notify(DisplayEvent::Retreat {
            battle: self.core.id,
            message,
            units: subs.to_vec(),
        });
        Ok(())
    }

    /// Move units (and their cargo) out of the battle.
    fn retreat_units(
        &mut self,
        side: Side,
        units: &[UnitId],
        to: TerritoryId,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let mut all = units.to_vec();
        if to != self.core.site {
            let site = self.core.site;
            let cargo: Vec<UnitId> = {
                let state = bridge.state();
                self.core
                    .dependents_of(units, state)
                    .into_iter()
                    .filter(|&u| state.unit(u).is_ok_and(|unit| unit.location == site))
                    .collect()
            };
            push_new(&mut all, &cargo);
            bridge.apply_change(Change::move_units(&all, to))?;
        }
        self.core.mark_retreated(side, &all);
        self.dependent.remove_units(&all);
        let message = format!(
            "{} retreated to {}",
            units_to_text(bridge.state(), &all),
            territory_name(bridge.state(), to)
        );
        bridge.history_event(message.clone(), &all);
        bridge.play_sound(SoundClip::Retreat, self.core.player(side));
        bridge.notify(DisplayEvent::Retreat {
            battle: self.core.id,
            message,
            units: all.clone(),
        });
        if side == Side::Attacker {
            for blocked in tracker.get_blocked(self.core.id) {
                tracker.with_battle(blocked, |battle, tracker| {
                    battle.units_lost_in_preceding_battle(&all, true, tracker, bridge)
                })?;
            }
        }
        Ok(())
    }

    fn attacker_subs_retreat(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let (subs, options, submerge) = {
            let state = bridge.state();
            let subs = state.filter_units(&self.core.attacking_units, matches::is_sub)?;
            if subs.is_empty()
                || state.any_unit(&self.core.firing_units(Side::Defender), matches::is_destroyer)?
            {
                return Ok(());
            }
            if state.rules.submersible_subs {
                (subs, vec![self.core.site], true)
            } else {
                (subs, self.attacker_retreat_territories(state, tracker)?, false)
            }
        };
        if options.is_empty() {
            return Ok(());
        }
        let message = if submerge { "Submerge subs?" } else { "Retreat subs?" };
        match self.query_retreat(Side::Attacker, options, submerge, message.into(), bridge)? {
            Some(_) if submerge => self.submerge(Side::Attacker, &subs, bridge),
            Some(to) => self.retreat_units(Side::Attacker, &subs, to, tracker, bridge),
            None => Ok(()),
        }
    }

    fn defender_subs_retreat(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let (subs, options) = {
            let state = bridge.state();
            let subs = state.filter_units(&self.core.defending_units, matches::is_sub)?;
            if subs.is_empty()
                || state.any_unit(&self.core.firing_units(Side::Attacker), matches::is_destroyer)?
            {
                return Ok(());
            }
            let defender = self.core.defender;
            let mut options = Vec::new();
            for &n in state.neighbors(self.core.site)? {
                if state.territory(n)?.water && !state.has_enemy_units(defender, n) {
                    options.push(n);
                }
            }
            if state.rules.submersible_subs {
                options.push(self.core.site);
            }
            (subs, options)
        };
        if options.is_empty() {
            return Ok(());
        }
        match self.query_retreat(Side::Defender, options, false, "Retreat or submerge subs?".into(), bridge)? {
            Some(to) if to == self.core.site => self.submerge(Side::Defender, &subs, bridge),
            Some(to) => self.retreat_units(Side::Defender, &subs, to, tracker, bridge),
            None => Ok(()),
        }
    }

    fn planes_retreat(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let planes = {
            let state = bridge.state();
            if !self.dependent.is_amphibious() || !(state.rules.ww2v2 || state.rules.attacker_retreat_planes) {
                return Ok(());
            }
            state.filter_units(&self.core.attacking_units, matches::is_air)?
        };
        if planes.is_empty() {
            return Ok(());
        }
        let site = self.core.site;
        if self
            .query_retreat(Side::Attacker, vec![site], false, "Retreat planes?".into(), bridge)?
            .is_some()
        {
            self.retreat_units(Side::Attacker, &planes, site, tracker, bridge)?;
        }
        Ok(())
    }

    fn partial_amphibious_retreat(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if !self.dependent.is_amphibious() || !bridge.state().rules.partial_amphibious_retreat {
            return Ok(());
        }
        let units = self.dependent.non_amphibious(&self.core.attacking_units);
        if units.is_empty() {
            return Ok(());
        }
        let site = self.core.site;
        if self
            .query_retreat(Side::Attacker, vec![site], false, "Retreat non-amphibious units?".into(), bridge)?
            .is_some()
        {
            self.retreat_units(Side::Attacker, &units, site, tracker, bridge)?;
        }
        Ok(())
    }

    fn attacker_retreat(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let options = {
            let state = bridge.state();
            if !self.can_attacker_retreat(state, tracker)? {
                return Ok(());
            }
            self.attacker_retreat_territories(state, tracker)?
        };
        let Some(to) = self.query_retreat(Side::Attacker, options, false, "Retreat?".into(), bridge)? else {
            return Ok(());
        };
        let units = self.core.attacking_units.clone();
        self.retreat_units(Side::Attacker, &units, to, tracker, bridge)?;
        self.defender_wins(tracker, bridge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroyer_forces_return_fire_against_attacking_subs() {
        let rules = BattleRules::default();
        let order = FiringOrder::new(&rules, false, true);
        assert_eq!(order.vs_attacking_subs, ReturnFire::All);
        assert!(!order.defender_subs_fire_first);
    }

    #[test]
    fn test_classic_sneak_attack_without_destroyers() {
        let rules = BattleRules::default();
        let order = FiringOrder::new(&rules, false, false);
        assert_eq!(order.vs_attacking_subs, ReturnFire::None);
        assert_eq!(order.vs_defending_subs, ReturnFire::All);
        assert!(order.only_attacker_sneak_attack);
        assert!(order.defending_subs_fire_with_all_defenders);
        assert_eq!(
            order.steps(false),
            vec![
                FoughtStep::AttackSubs(ReturnFire::None),
                FoughtStep::AttackNonSubs,
                FoughtStep::DefendSubs(ReturnFire::All),
                FoughtStep::DefendNonSubs,
            ]
        );
    }

    #[test]
    fn test_second_edition_both_sides_sneak() {
        let rules = BattleRules {
            ww2v2: true,
            ..BattleRules::default()
        };
        let order = FiringOrder::new(&rules, false, false);
        assert_eq!(order.vs_attacking_subs, ReturnFire::Subs);
        assert_eq!(order.vs_defending_subs, ReturnFire::Subs);
        assert_eq!(
            order.steps(true),
            vec![
                FoughtStep::AttackSubs(ReturnFire::Subs),
                FoughtStep::DefendSubs(ReturnFire::Subs),
                FoughtStep::AttackAirOnNonSubs,
                FoughtStep::AttackNonSubs,
                FoughtStep::DefendAirOnNonSubs,
                FoughtStep::DefendNonSubs,
            ]
        );
    }

    #[test]
    fn test_defending_subs_fire_first_against_destroyer_only_attacker() {
        let rules = BattleRules {
            defending_subs_sneak_attack: true,
            ..BattleRules::default()
        };
        // Defender has a destroyer, attacker does not.
        let order = FiringOrder::new(&rules, false, true);
        assert_eq!(order.vs_attacking_subs, ReturnFire::All);
        assert_eq!(order.vs_defending_subs, ReturnFire::None);
        assert!(order.defender_subs_fire_first);
        assert_eq!(order.steps(false)[0], FoughtStep::DefendSubs(ReturnFire::None));
    }

    #[test]
    fn test_step_labels() {
        assert_eq!(FoughtStep::AttackNonSubs.label().as_deref(), Some("Attackers fire"));
        assert!(FoughtStep::NextRound.label().is_none());
    }
}
