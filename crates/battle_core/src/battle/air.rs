//! Air battles.
//!
//! Fought ahead of a normal battle ([`BattleType::AirBattle`]) or ahead of
//! a bombing raid ([`BattleType::AirRaid`]). Interceptors launch, both sides
//! fire with their air values, and once the battle is decided the surviving
//! bombers of a raid fly on to a bombing raid registered against the same
//! site.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::battle::common::{
    fire_phase, fire_states, push_new, territory_name, units_to_text, BattleCore, BattleResultDescription, BattleType,
    FireKind, FireState, ReturnFire, Side, WhoWon,
};
use crate::bridge::{Bridge, DisplayEvent, RetreatRequest, SoundClip};
use crate::change::{Change, UnitProperty};
use crate::data::UnitTrait;
use crate::error::{BattleError, Result};
use crate::ids::{PlayerId, TerritoryId, UnitId};
use crate::matches;
use crate::route::Route;
use crate::stack::ExecutionStack;
use crate::state::GameState;
use crate::tracker::{AttackMove, BattleTracker};

/// One step of an air battle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AirStep {
    /// The defender picks its interceptors.
    InterceptorsLaunch,
    /// Attackers fire.
    AttackersFire,
    /// Defenders fire.
    DefendersFire,
    /// A firing group in flight.
    Fire(FireState),
    /// Remove casualties and spent suicide units.
    Cleanup,
    /// Send surviving bombers on to their raid.
    MakeBattle,
    /// Write the result.
    End,
    /// Attackers may withdraw.
    AttackerRetreat,
    /// Defenders may withdraw.
    DefenderRetreat,
    /// Start the next round.
    NextRound,
}

impl AirStep {
    fn label(&self) -> Option<&str> {
        match self {
            Self::InterceptorsLaunch => Some("Defender launches interceptors"),
            Self::AttackersFire => Some("Attackers fire"),
            Self::DefendersFire => Some("Defenders fire"),
            Self::Fire(fire) => Some(&fire.step_name),
            Self::AttackerRetreat => Some("Attackers withdraw?"),
            Self::DefenderRetreat => Some("Defenders withdraw?"),
            Self::Cleanup | Self::MakeBattle | Self::End | Self::NextRound => None,
        }
    }
}

/// Air battle or air raid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AirBattle {
    core: BattleCore,
    stack: ExecutionStack<AirStep>,
    intercepted: bool,
    /// Bombers already sent on to a raid.
    dispatched: Vec<UnitId>,
}

impl AirBattle {
    /// New air battle, defenders filled in from the site.
    pub fn new(core: BattleCore, state: &GameState) -> Result<Self> {
        let mut battle = Self {
            core,
            stack: ExecutionStack::new(),
            intercepted: false,
            dispatched: Vec::new(),
        };
        battle.update_defending_units(state)?;
        Ok(battle)
    }

    /// Shared state.
    #[must_use]
    pub const fn core(&self) -> &BattleCore {
        &self.core
    }

    pub(crate) fn core_mut(&mut self) -> &mut BattleCore {
        &mut self.core
    }

    /// Pending steps.
    #[must_use]
    pub const fn stack(&self) -> &ExecutionStack<AirStep> {
        &self.stack
    }

    /// Bombers already registered against their raid.
    #[must_use]
    pub fn dispatched_bombers(&self) -> &[UnitId] {
        &self.dispatched
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    fn is_raid(&self) -> bool {
        self.core.battle_type == BattleType::AirRaid
    }

    /// No attackers left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.attacking_units.is_empty()
    }

    /// Defenders are the enemy aircraft at the site able to take part.
    pub fn update_defending_units(&mut self, state: &GameState) -> Result<()> {
        let site = self.core.site;
        self.core.defending_units = defending_interceptors(state, site, self.core.attacker, self.is_raid())?;
        Ok(())
    }

    /// Join attacking aircraft.
    pub fn add_attack(&mut self, units: &[UnitId]) {
        self.core.add_units(Side::Attacker, units);
    }

    /// Take aircraft back out (their move was undone).
    pub fn remove_attack(&mut self, units: &[UnitId]) {
        self.core.attacking_units.retain(|u| !units.contains(u));
    }

    /// Air battles precede everything else; lost units are only stripped.
    pub fn units_lost_in_preceding_battle(&mut self, units: &[UnitId]) {
        self.core.remove_from_sets(units);
    }

    fn should_fight(&self, state: &GameState) -> Result<bool> {
        if self.core.defending_units.is_empty() {
            return Ok(false);
        }
        if self.is_raid() {
            state.any_unit(&self.core.attacking_units, matches::is_strategic_bomber)
        } else {
            Ok(!self.core.attacking_units.is_empty())
        }
    }

    fn decided(&self, state: &GameState) -> Result<bool> {
        Ok(!self.should_fight(state)? || self.core.max_rounds_reached())
    }

    /// Step labels still queued, next to run first.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<String> {
        self.stack.steps().iter().rev().filter_map(|s| s.label().map(str::to_string)).collect()
    }

    // ========================================================================
    // Fight
    // ========================================================================

    /// Run the air battle until it ends or a decision is pending.
    pub fn fight(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if self.core.is_over() {
            return Err(BattleError::InvariantViolation(format!("{} fought after it ended", self.core.id)));
        }
        if self.stack.is_executing() {
            self.show(bridge);
            return self.drain(tracker, bridge);
        }
        self.update_defending_units(bridge.state())?;
        self.core.snapshot_starting_units();
        info!(
            battle = %self.core.id,
            site = %self.core.site,
            kind = %self.core.battle_type,
            attackers = self.core.attacking_units.len(),
            defenders = self.core.defending_units.len(),
            "air battle started"
        );
        bridge.history_event(
            format!("Air battle in {}", territory_name(bridge.state(), self.core.site)),
            &self.core.attacking_units,
        );
        self.show(bridge);
        let steps = self.round_steps(true, bridge.state())?;
        self.list_steps(&steps, bridge);
        self.stack.push_all(steps);
        self.drain(tracker, bridge)
    }

    /// Close an air battle that can have no defenders without fighting it.
    /// The bombing raid it escorts is still registered.
    pub fn finish_headless(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        self.make_battle(tracker, bridge)?;
        self.core
            .finish_without_record(WhoWon::Attacker, BattleResultDescription::NoBattle, tracker)
    }

    fn drain(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let mut stack = std::mem::take(&mut self.stack);
        let result = stack.execute(|step, stack| self.run_step(step, stack, tracker, bridge));
        self.stack = stack;
        if let Err(e) = &result {
            if e.is_suspension() {
                debug!(battle = %self.core.id, "air battle suspended");
            } else {
                error!(battle = %self.core.id, error = %e, "air battle step failed");
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

    fn list_steps(&self, steps: &[AirStep], bridge: &mut dyn Bridge) {
        bridge.notify(DisplayEvent::ListSteps {
            battle: self.core.id,
            steps: steps.iter().filter_map(|s| s.label().map(str::to_string)).collect(),
        });
    }

    fn round_steps(&self, first_run: bool, state: &GameState) -> Result<Vec<AirStep>> {
        let mut steps = Vec::new();
        if self.should_fight(state)? {
            if first_run {
                steps.push(AirStep::InterceptorsLaunch);
            }
            steps.push(AirStep::AttackersFire);
            steps.push(AirStep::DefendersFire);
            steps.push(AirStep::Cleanup);
        }
        steps.extend([
            AirStep::MakeBattle,
            AirStep::End,
            AirStep::AttackerRetreat,
            AirStep::DefenderRetreat,
            AirStep::NextRound,
        ]);
        Ok(steps)
    }

    fn run_step(
        &mut self,
        step: AirStep,
        stack: &mut ExecutionStack<AirStep>,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if self.core.is_over() {
            return Ok(());
        }
        match step {
            AirStep::InterceptorsLaunch => self.launch_interceptors(bridge),
            AirStep::AttackersFire => self.push_fire(Side::Attacker, stack, bridge.state()),
            AirStep::DefendersFire => self.push_fire(Side::Defender, stack, bridge.state()),
            AirStep::Fire(fire) => {
                if let Some(next) = fire_phase(&mut self.core, fire, tracker, bridge)? {
                    stack.push(AirStep::Fire(next));
                }
                Ok(())
            }
            AirStep::Cleanup => self.cleanup(tracker, bridge),
            AirStep::MakeBattle => {
                if self.decided(bridge.state())? {
                    self.make_battle(tracker, bridge)?;
                }
                Ok(())
            }
            AirStep::End => {
                if self.decided(bridge.state())? {
                    self.end(tracker, bridge)?;
                }
                Ok(())
            }
            AirStep::AttackerRetreat => self.retreat(Side::Attacker, tracker, bridge),
            AirStep::DefenderRetreat => self.retreat(Side::Defender, tracker, bridge),
            AirStep::NextRound => {
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
        }
    }

    fn launch_interceptors(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let candidates = self.core.defending_units.clone();
        let defender = self.core.defender;
        let chosen = if self.is_raid() {
            bridge.remote().select_interceptors(defender, self.core.id, &candidates)?
        } else {
            candidates.clone()
        };
        if let Some(stray) = chosen.iter().find(|u| !candidates.contains(u)) {
            error!(battle = %self.core.id, unit = %stray, "interceptor chosen from outside the candidates");
            return Err(BattleError::IllegalSelection {
                player: defender,
                message: format!("{stray} cannot intercept here"),
            });
        }
        let withheld: Vec<UnitId> = candidates.iter().copied().filter(|u| !chosen.contains(u)).collect();
        self.core.defending_units.clear();
        push_new(&mut self.core.defending_units, &chosen);
        if !withheld.is_empty() {
            let grounded = withheld
                .iter()
                .map(|&u| Change::set(u, UnitProperty::WasInAirBattle(true)))
                .collect();
            bridge.apply_change(Change::Composite(grounded))?;
            self.core.mark_retreated(Side::Defender, &withheld);
            debug!(battle = %self.core.id, units = ?withheld, "interceptors withheld");
        }
        if !self.core.defending_units.is_empty() {
            self.intercepted = true;
            bridge.play_sound(SoundClip::BattleAir, self.core.attacker);
            let text = format!(
                "{} interceptors launch over {}",
                units_to_text(bridge.state(), &self.core.defending_units),
                territory_name(bridge.state(), self.core.site)
            );
            bridge.history_event(text, &self.core.defending_units);
        }
        Ok(())
    }

    fn push_fire(&self, side: Side, stack: &mut ExecutionStack<AirStep>, state: &GameState) -> Result<()> {
        if !self.intercepted {
            return Ok(());
        }
        let firers = self.core.firing_units(side);
        let targets = self.core.units(side.other());
        let name = if side.is_defender() { "Defenders fire" } else { "Attackers fire" };
        let fires = fire_states(state, side, &FireKind::AirBattle, &firers, targets, ReturnFire::All, name)?;
        stack.push_all(fires.into_iter().map(AirStep::Fire).collect::<Vec<_>>());
        Ok(())
    }

    fn cleanup(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if !self.intercepted {
            return Ok(());
        }
        self.core.clear_waiting_to_die(tracker, bridge)?;
        let spent = {
            let state = bridge.state();
            let raid = self.is_raid();
            let mut spent = state.filter_units(&self.core.attacking_units, |u, t| {
                matches::is_suicide(u, t) && !(raid && t.has(UnitTrait::StrategicBomber))
            })?;
            spent.extend(state.filter_units(&self.core.defending_units, matches::is_suicide)?);
            spent
        };
        if !spent.is_empty() {
            self.core.remove(&spent, tracker, bridge)?;
        }
        Ok(())
    }

    /// Mark everyone as having flown in an air battle and register the
    /// bombing raid for the surviving bombers.
    ///
    /// Each bomber is dispatched once; a run interrupted at a target
    /// question picks up with the first bomber not yet dispatched.
    fn make_battle(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if !self.is_raid() {
            return Ok(());
        }
        let site = self.core.site;
        let attacker = self.core.attacker;
        let (flags, bombers, targets) = {
            let state = bridge.state();
            let mut everyone = self.core.attacking_units.clone();
            everyone.extend_from_slice(&self.core.defending_units);
            let flags: Vec<Change> = state
                .filter_units(&everyone, |u, _| !u.was_in_air_battle)?
                .into_iter()
                .map(|u| Change::set(u, UnitProperty::WasInAirBattle(true)))
                .collect();
            let bombers = state.filter_units(&self.core.attacking_units, matches::is_strategic_bomber)?;
            let targets = state.units_at_matching(site, |u, t| {
                state.at_war(u.owner, attacker)
                    && t.can_be_damaged()
                    && u.bombing_damage < t.max_damage
                    && u.transported_by.is_none()
            })?;
            (flags, bombers, targets)
        };
        if !flags.is_empty() {
            bridge.apply_change(Change::Composite(flags))?;
        }
        if bombers.is_empty() {
            return Ok(());
        }
        let to_units = bridge.state().rules.damage_from_bombing_done_to_units;
        for bomber in bombers {
            if self.dispatched.contains(&bomber) || (to_units && targets.is_empty()) {
                continue;
            }
            let mut raid = AttackMove::new(Route::scripted(site), vec![bomber], attacker)
                .bombing()
                .air_battle_completed();
            let target = if targets.len() > 1 && to_units {
                match bridge.remote().select_bombing_target(attacker, bomber, &targets)? {
                    Some(t) if targets.contains(&t) => Some(t),
                    Some(t) => {
                        return Err(BattleError::IllegalSelection {
                            player: attacker,
                            message: format!("{t} is not a bombing target for {bomber}"),
                        });
                    }
                    None => targets.first().copied(),
                }
            } else {
                targets.first().copied()
            };
            if let Some(target) = target {
                raid = raid.with_target(target, &[bomber]);
            }
            tracker.add_battle(&raid, bridge)?;
            self.dispatched.push(bomber);
        }
        if let Some(raid) = tracker.pending_battle_id(site, BattleType::BombingRaid) {
            for dependent in [BattleType::Normal, BattleType::AirBattle] {
                if let Some(blocked) = tracker.pending_battle_id(site, dependent) {
                    tracker.add_dependency(blocked, raid)?;
                }
            }
        }
        Ok(())
    }

    fn end(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let attacker = self.core.attacker;
        let (who_won, result) = if self.core.attacking_units.is_empty() {
            let result = if self.is_raid() {
                BattleResultDescription::Lost
            } else {
                BattleResultDescription::AirBattleLost
            };
            (WhoWon::Defender, result)
        } else if self.is_raid() {
            if bridge.state().any_unit(&self.core.attacking_units, matches::is_strategic_bomber)? {
                let result = if self.core.defending_units.is_empty() {
                    BattleResultDescription::WonWithoutConquering
                } else {
                    BattleResultDescription::WonWithEnemyLeft
                };
                (WhoWon::Attacker, result)
            } else {
                (WhoWon::Draw, BattleResultDescription::Stalemate)
            }
        } else if self.core.defending_units.is_empty() {
            (WhoWon::Attacker, BattleResultDescription::AirBattleWin)
        } else {
            (WhoWon::Draw, BattleResultDescription::AirBattleStalemate)
        };
        if who_won == WhoWon::Attacker {
            bridge.play_sound(SoundClip::BattleAir, attacker);
        }
        self.core.finish(who_won, result, tracker, bridge)
    }

    fn retreat(&mut self, side: Side, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let allowed = {
            let state = bridge.state();
            let rule = if side.is_defender() {
                state.rules.air_battle_defenders_can_retreat
            } else {
                state.rules.air_battle_attackers_can_retreat
            };
            rule && !self.decided(state)?
        };
        let units = self.core.units(side).to_vec();
        if !allowed || units.is_empty() {
            return Ok(());
        }
        let site = self.core.site;
        let player = self.core.player(side);
        let request = RetreatRequest {
            battle: self.core.id,
            site,
            submerge: false,
            options: vec![site],
            message: format!("{} retreat?", bridge.state().player(player).map_or("", |p| p.name.as_str())),
        };
        match bridge.remote().retreat_query(player, &request)? {
            None => return Ok(()),
            Some(t) if t != site => {
                tracing::warn!(battle = %self.core.id, destination = %t, "illegal retreat destination ignored");
                return Ok(());
            }
            Some(_) => {}
        }
        if side == Side::Attacker {
            for blocked in tracker.get_blocked(self.core.id) {
                tracker.with_battle(blocked, |battle, tracker| {
                    battle.units_lost_in_preceding_battle(&units, true, tracker, bridge)
                })?;
            }
        }
        self.core.mark_retreated(side, &units);
        let flags = units
            .iter()
            .map(|&u| Change::set(u, UnitProperty::WasInAirBattle(true)))
            .collect();
        bridge.apply_change(Change::Composite(flags))?;
        let message = format!("{} retreated", units_to_text(bridge.state(), &units));
        bridge.history_event(message.clone(), &units);
        bridge.play_sound(SoundClip::Retreat, player);
        bridge.notify(DisplayEvent::Retreat {
            battle: self.core.id,
            message,
            units,
        });
        Ok(())
    }
}

/// Enemy aircraft at `site` able to meet an air attack by `attacker`.
///
/// Raids are met by interceptors, other air battles by air-battle capable
/// units. Scrambled aircraft join only when scrambling into air battles is
/// allowed.
pub fn defending_interceptors(state: &GameState, site: TerritoryId, attacker: PlayerId, raid: bool) -> Result<Vec<UnitId>> {
    let scrambled_ok = state.rules.can_scramble_into_air_battles;
    state.units_at_matching(site, |u, t| {
        let capable = if raid {
            matches::can_intercept(u, t)
        } else {
            matches::can_air_battle(u, t)
        };
        capable && state.at_war(u.owner, attacker) && !u.disabled && (scrambled_ok || !u.was_scrambled)
    })
}

/// Attacking aircraft that escort a move into an air battle.
pub fn attacking_escorts(state: &GameState, units: &[UnitId], raid: bool) -> Result<Vec<UnitId>> {
    state.filter_units(units, |u, t| {
        !u.disabled
            && t.is_air()
            && (matches::can_escort(u, t) || t.air_attack > 0 || (raid && matches::is_strategic_bomber(u, t)))
    })
}

/// Whether an air battle at `site` could meet any defender: interceptors
/// already there, or (when scrambling into air battles is allowed) enemy
/// scramblers within reach.
pub fn could_have_defenders(state: &GameState, site: TerritoryId, attacker: PlayerId, raid: bool) -> Result<bool> {
    if !defending_interceptors(state, site, attacker, raid)?.is_empty() {
        return Ok(true);
    }
    if !state.rules.scramble_rules_in_effect || !state.rules.can_scramble_into_air_battles {
        return Ok(false);
    }
    let reach = state.unit_types.iter().map(|(_, t)| t.max_scramble_distance).max().unwrap_or(0);
    if reach == 0 {
        return Ok(false);
    }
    for t in state.neighbors_within(site, reach)? {
        let scramblers = state.units_at_matching(t, |u, ty| {
            matches::can_scramble(u, ty) && state.at_war(u.owner, attacker) && ty.max_scramble_distance > 0
        })?;
        if !scramblers.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::battle::Battle;
    use crate::bridge::{LocalBridge, RemotePlayer};
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::ids::BattleId;
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    const WORKS: TerritoryId = TerritoryId(1);

    /// Picks the last target offered and can stall once on a chosen question.
    #[derive(Debug, Default)]
    struct RaidCommander {
        target_questions: Vec<UnitId>,
        interceptor_questions: u32,
        stall_at: Option<usize>,
    }

    impl RemotePlayer for RaidCommander {
        fn select_interceptors(&mut self, _player: PlayerId, _battle: BattleId, candidates: &[UnitId]) -> Result<Vec<UnitId>> {
            self.interceptor_questions += 1;
            Ok(candidates.to_vec())
        }

        fn select_bombing_target(&mut self, player: PlayerId, bomber: UnitId, targets: &[UnitId]) -> Result<Option<UnitId>> {
            self.target_questions.push(bomber);
            if self.stall_at == Some(self.target_questions.len()) {
                self.stall_at = None;
                return Err(BattleError::Suspended(player));
            }
            Ok(targets.last().copied())
        }
    }

    struct Raid {
        bridge: LocalBridge<RaidCommander>,
        tracker: BattleTracker,
        bombers: Vec<UnitId>,
        factories: Vec<UnitId>,
        fighter: UnitId,
    }

    fn create_raid(commander: RaidCommander) -> Raid {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("fighter", Domain::Air, 10, 3, 4).with_trait(UnitTrait::Interceptor));
        types.register(UnitType::new("bomber", Domain::Air, 12, 4, 1).with_trait(UnitTrait::StrategicBomber));
        let mut factory = UnitType::new("factory", Domain::Land, 15, 0, 0).with_trait(UnitTrait::Infrastructure);
        factory.max_damage = 20;
        types.register(factory);
        let rules = BattleRules {
            raids_may_be_preceded_by_air_battles: true,
            damage_from_bombing_done_to_units: true,
            ..BattleRules::default()
        };
        let mut state = GameState::new(rules, types);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        let mut home = Territory::new(TerritoryId(0), "Airstrip", false);
        home.owner = Some(PlayerId(0));
        state.add_territory(home);
        let mut works = Territory::new(WORKS, "Works", false);
        works.owner = Some(PlayerId(1));
        works.production = 10;
        state.add_territory(works);
        state.connect(TerritoryId(0), WORKS).unwrap();
        state.current_player = Some(PlayerId(0));
        let factories = vec![
            state.spawn_unit("factory", PlayerId(1), WORKS).unwrap(),
            state.spawn_unit("factory", PlayerId(1), WORKS).unwrap(),
        ];
        let fighter = state.spawn_unit("fighter", PlayerId(1), WORKS).unwrap();
        let bombers = vec![
            state.spawn_unit("bomber", PlayerId(0), WORKS).unwrap(),
            state.spawn_unit("bomber", PlayerId(0), WORKS).unwrap(),
        ];

        let mut bridge = LocalBridge::new(state, 11, commander);
        let mut tracker = BattleTracker::new();
        let attack = AttackMove::new(Route::single(TerritoryId(0), WORKS), bombers.clone(), PlayerId(0)).bombing();
        tracker.add_battle(&attack, &mut bridge).unwrap();
        Raid {
            bridge,
            tracker,
            bombers,
            factories,
            fighter,
        }
    }

    /// Close the air raid as if it had no defenders and hand back its core.
    fn finish_unopposed(raid: &mut Raid) -> Result<BattleCore> {
        let id = raid.tracker.pending_battle_id(WORKS, BattleType::AirRaid).unwrap();
        let bridge = &mut raid.bridge;
        raid.tracker.with_battle(id, |battle, tracker| {
            battle.reset_defending_units(bridge.state())?;
            let Battle::Air(air) = battle else {
                panic!("air raid expected");
            };
            air.finish_headless(tracker, bridge)?;
            Ok(air.core().clone())
        })
    }

    fn bombing_targets(raid: &Raid) -> BTreeMap<UnitId, Vec<UnitId>> {
        match raid.tracker.get_pending_battle(WORKS, BattleType::BombingRaid) {
            Some(Battle::Bombing(b)) => b.targets().iter().map(|(t, bs)| (*t, bs.iter().copied().collect())).collect(),
            _ => BTreeMap::new(),
        }
    }

    #[test]
    fn test_raid_with_interceptors_waits_on_air_raid() {
        let raid = create_raid(RaidCommander::default());
        let air = raid.tracker.pending_battle_id(WORKS, BattleType::AirRaid).unwrap();
        assert!(raid.tracker.pending_battle_id(WORKS, BattleType::BombingRaid).is_none());
        let Some(Battle::Air(battle)) = raid.tracker.get_pending_battle_by_id(air) else {
            panic!("air raid expected");
        };
        assert_eq!(battle.core().defending_units(), &[raid.fighter]);
    }

    #[test]
    fn test_unopposed_air_raid_ends_without_battle() {
        let mut raid = create_raid(RaidCommander::default());
        let id = raid.tracker.pending_battle_id(WORKS, BattleType::AirRaid).unwrap();
        raid.bridge.state_mut().take_unit(raid.fighter).unwrap();

        let core = finish_unopposed(&mut raid).unwrap();

        assert_eq!(core.who_won(), WhoWon::Attacker);
        assert_eq!(core.result(), Some(BattleResultDescription::NoBattle));
        assert!(raid.tracker.get_pending_battle_by_id(id).is_none());
        assert!(raid.tracker.records.get(id).is_none());
        let bombing = raid.tracker.pending_battle_id(WORKS, BattleType::BombingRaid).unwrap();
        assert!(raid.tracker.get_dependent_on(bombing).is_empty());
        assert_eq!(raid.bridge.remote_mut().interceptor_questions, 0);
        assert!(!raid
            .bridge
            .events()
            .iter()
            .any(|e| matches!(e, DisplayEvent::ListSteps { .. })));
    }

    #[test]
    fn test_bombers_dispatched_once_across_suspension() {
        let mut raid = create_raid(RaidCommander {
            stall_at: Some(2),
            ..RaidCommander::default()
        });
        raid.bridge.state_mut().take_unit(raid.fighter).unwrap();

        let err = finish_unopposed(&mut raid).unwrap_err();
        assert!(err.is_suspension());
        let Some(Battle::Air(air)) = raid.tracker.get_pending_battle(WORKS, BattleType::AirRaid) else {
            panic!("air raid still pending");
        };
        assert_eq!(air.dispatched_bombers(), &raid.bombers[..1]);

        finish_unopposed(&mut raid).unwrap();

        let first = raid.bombers[0];
        let second = raid.bombers[1];
        assert_eq!(raid.bridge.remote_mut().target_questions, vec![first, second, second]);
        let targets = bombing_targets(&raid);
        assert_eq!(targets.get(&raid.factories[1]), Some(&vec![first, second]));
        assert_eq!(targets.values().map(Vec::len).sum::<usize>(), 2);
    }
}
