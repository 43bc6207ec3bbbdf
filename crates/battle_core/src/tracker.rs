//! Battle tracker.
//!
//! Owns every pending [`Battle`] of the turn, keyed by site and type, the
//! dependency edges between them, the battle record log and the turn's
//! conquest bookkeeping. Edges are index based: a battle never holds a
//! reference to another, it only names it by [`BattleId`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::battle::air::{attacking_escorts, could_have_defenders};
use crate::battle::common::{determine_defender, territory_name};
use crate::battle::{
    AirBattle, Battle, BattleCore, BattleResultDescription, BattleType, BombingRaidBattle, FinishedBattle,
    FoughtBattle, NonFightingBattle,
};
use crate::bridge::{Bridge, SoundClip};
use crate::change::{Change, Resource, UnitProperty};
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId};
use crate::matches;
use crate::records::BattleRecords;
use crate::route::Route;
use crate::state::GameState;

// ============================================================================
// Attack moves
// ============================================================================

/// Units that moved into a battle, as reported by the movement layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttackMove {
    /// Route the units took.
    pub route: Route,
    /// Units that moved.
    pub units: Vec<UnitId>,
    /// Moving player.
    pub player: PlayerId,
    /// Strategic bombing move.
    pub bombing: bool,
    /// Bombing target to the bombers assigned to it.
    pub targets: BTreeMap<UnitId, BTreeSet<UnitId>>,
    /// The escorting air battle already happened.
    pub air_battle_completed: bool,
}

impl AttackMove {
    /// Plain attack.
    #[must_use]
    pub fn new(route: Route, units: Vec<UnitId>, player: PlayerId) -> Self {
        Self {
            route,
            units,
            player,
            bombing: false,
            targets: BTreeMap::new(),
            air_battle_completed: false,
        }
    }

    /// Mark as a bombing move.
    #[must_use]
    pub fn bombing(mut self) -> Self {
        self.bombing = true;
        self
    }

    /// Skip the escorting air battle.
    #[must_use]
    pub fn air_battle_completed(mut self) -> Self {
        self.air_battle_completed = true;
        self
    }

    /// Assign bombers to a target.
    #[must_use]
    pub fn with_target(mut self, target: UnitId, bombers: &[UnitId]) -> Self {
        self.targets.entry(target).or_default().extend(bombers.iter().copied());
        self
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Registry of the turn's battles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleTracker {
    battles: BTreeMap<BattleId, Battle>,
    keys: BTreeMap<(TerritoryId, BattleType), BattleId>,
    /// Blocked battle to the battles it waits on.
    dependencies: BTreeMap<BattleId, BTreeSet<BattleId>>,
    next_id: u64,
    /// Records of this turn's battles.
    pub records: BattleRecords,
    conquered: BTreeSet<TerritoryId>,
    blitzed: BTreeSet<TerritoryId>,
    fought_over: BTreeSet<TerritoryId>,
    bombarded_from: BTreeSet<TerritoryId>,
    no_bombard_allowed: BTreeSet<TerritoryId>,
    defending_air_that_can_not_land: BTreeMap<TerritoryId, Vec<UnitId>>,
    finished_attack_from: BTreeMap<TerritoryId, BTreeMap<TerritoryId, Vec<UnitId>>>,
}

impl BattleTracker {
    /// Empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Battle registered for `(site, battle_type)`.
    #[must_use]
    pub fn pending_battle_id(&self, site: TerritoryId, battle_type: BattleType) -> Option<BattleId> {
        self.keys.get(&(site, battle_type)).copied()
    }

    /// Battle registered for `(site, battle_type)`.
    #[must_use]
    pub fn get_pending_battle(&self, site: TerritoryId, battle_type: BattleType) -> Option<&Battle> {
        self.pending_battle_id(site, battle_type)
            .and_then(|id| self.battles.get(&id))
    }

    /// Battle by id.
    #[must_use]
    pub fn get_pending_battle_by_id(&self, id: BattleId) -> Option<&Battle> {
        self.battles.get(&id)
    }

    /// Mutable battle by id.
    pub fn battle_mut(&mut self, id: BattleId) -> Result<&mut Battle> {
        self.battles.get_mut(&id).ok_or(BattleError::UnknownBattle(id))
    }

    /// Every pending battle, in creation order.
    pub fn battles(&self) -> impl Iterator<Item = &Battle> {
        self.battles.values()
    }

    /// Air raid or bombing raid at `site`.
    #[must_use]
    pub fn pending_bombing_battle(&self, site: TerritoryId) -> Option<BattleId> {
        self.pending_battle_id(site, BattleType::AirRaid)
            .or_else(|| self.pending_battle_id(site, BattleType::BombingRaid))
    }

    /// Normal battle or air battle at `site`.
    #[must_use]
    pub fn pending_non_bombing_battle(&self, site: TerritoryId) -> Option<BattleId> {
        self.pending_battle_id(site, BattleType::Normal)
            .or_else(|| self.pending_battle_id(site, BattleType::AirBattle))
    }

    /// Non-empty battles of one type.
    #[must_use]
    pub fn pending_battles(&self, battle_type: BattleType) -> Vec<BattleId> {
        self.battles
            .values()
            .filter(|b| !b.is_empty() && b.battle_type() == battle_type)
            .map(Battle::id)
            .collect()
    }

    /// Sites of non-empty battles that are (or are not) bombing runs.
    #[must_use]
    pub fn pending_battle_sites(&self, bombing: bool) -> BTreeSet<TerritoryId> {
        self.battles
            .values()
            .filter(|b| !b.is_empty() && b.battle_type().is_bombing_run() == bombing)
            .map(Battle::site)
            .collect()
    }

    /// Battle type to the sites of its non-empty battles.
    #[must_use]
    pub fn pending_battle_listing(&self) -> BTreeMap<BattleType, BTreeSet<TerritoryId>> {
        let mut listing: BTreeMap<BattleType, BTreeSet<TerritoryId>> = BTreeMap::new();
        for battle in self.battles.values().filter(|b| !b.is_empty()) {
            listing.entry(battle.battle_type()).or_default().insert(battle.site());
        }
        listing
    }

    /// Nothing left to fight.
    #[must_use]
    pub fn has_no_pending_battles(&self) -> bool {
        self.battles.values().all(Battle::is_empty)
    }

    /// Battle whose fight was interrupted.
    #[must_use]
    pub fn executing_battle(&self) -> Option<BattleId> {
        self.battles.values().find(|b| b.is_executing()).map(Battle::id)
    }

    fn is_registered(&self, id: BattleId) -> bool {
        self.keys.values().any(|&v| v == id)
    }

    /// Existing battle for `(site, battle_type)`, or a new one.
    ///
    /// New battles open their record straight away.
    pub fn get_or_create_battle(
        &mut self,
        site: TerritoryId,
        attacker: PlayerId,
        battle_type: BattleType,
        state: &GameState,
    ) -> Result<BattleId> {
        if let Some(id) = self.pending_battle_id(site, battle_type) {
            return Ok(id);
        }
        let core = self.new_core(site, attacker, battle_type, state)?;
        let battle = match battle_type {
            BattleType::Normal => Battle::Fought(FoughtBattle::new(core, state)),
            BattleType::AirBattle | BattleType::AirRaid => Battle::Air(AirBattle::new(core, state)?),
            BattleType::BombingRaid => Battle::Bombing(BombingRaidBattle::new(core, state)),
        };
        Ok(self.register(battle))
    }

    fn get_or_create_non_fighting(&mut self, site: TerritoryId, attacker: PlayerId, state: &GameState) -> Result<BattleId> {
        if let Some(id) = self.pending_battle_id(site, BattleType::Normal) {
            return Ok(id);
        }
        let core = self.new_core(site, attacker, BattleType::Normal, state)?;
        Ok(self.register(Battle::NonFighting(NonFightingBattle::new(core))))
    }

    fn get_or_create_finished(
        &mut self,
        site: TerritoryId,
        attacker: PlayerId,
        result: BattleResultDescription,
        state: &GameState,
    ) -> Result<BattleId> {
        if let Some(id) = self.pending_battle_id(site, BattleType::Normal) {
            return Ok(id);
        }
        let core = self.new_core(site, attacker, BattleType::Normal, state)?;
        Ok(self.register(Battle::Finished(FinishedBattle::new(core, result))))
    }

    fn new_core(
        &mut self,
        site: TerritoryId,
        attacker: PlayerId,
        battle_type: BattleType,
        state: &GameState,
    ) -> Result<BattleCore> {
        let defender = determine_defender(state, site, attacker)?;
        let id = BattleId(self.next_id);
        self.next_id += 1;
        BattleCore::new(id, site, attacker, defender, battle_type, state)
    }

    fn register(&mut self, battle: Battle) -> BattleId {
        let id = battle.id();
        let core = battle.core();
        self.records
            .add_battle(id, core.site, core.attacker, core.defender, core.battle_type);
        self.keys.insert((battle.site(), battle.battle_type()), id);
        debug!(battle = %id, site = %battle.site(), kind = %battle.battle_type(), "battle registered");
        self.battles.insert(id, battle);
        id
    }

    /// Check a battle out, run `f` on it and put it back unless it
    /// deregistered itself meanwhile.
    pub fn with_battle<T, F>(&mut self, id: BattleId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Battle, &mut Self) -> Result<T>,
    {
        let mut battle = self.battles.remove(&id).ok_or(BattleError::UnknownBattle(id))?;
        let out = f(&mut battle, self);
        if self.keys.get(&(battle.site(), battle.battle_type())) == Some(&id) {
            self.battles.insert(id, battle);
        }
        out
    }

    /// Deregister a battle that ended, releasing its edges.
    pub fn remove_battle(&mut self, id: BattleId) {
        let site = self.keys.iter().find(|(_, &v)| v == id).map(|((site, _), _)| *site);
        self.drop_battle(id);
        if let Some(site) = site {
            self.fought_over.insert(site);
        }
    }

    fn drop_battle(&mut self, id: BattleId) {
        self.keys.retain(|_, v| *v != id);
        self.battles.remove(&id);
        self.dependencies.remove(&id);
        for blocking in self.dependencies.values_mut() {
            blocking.remove(&id);
        }
        self.dependencies.retain(|_, blocking| !blocking.is_empty());
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    /// `blocked` may not be fought before `blocking` ends.
    ///
    /// # Errors
    ///
    /// [`BattleError::InvariantViolation`] when the edge would close a cycle.
    pub fn add_dependency(&mut self, blocked: BattleId, blocking: BattleId) -> Result<()> {
        if blocked == blocking || self.depends_on(blocking, blocked) {
            error!(%blocked, %blocking, "dependency would create a cycle");
            return Err(BattleError::InvariantViolation(format!(
                "{blocked} cannot depend on {blocking}"
            )));
        }
        self.dependencies.entry(blocked).or_default().insert(blocking);
        Ok(())
    }

    /// `from` waits on `to`, directly or transitively.
    fn depends_on(&self, from: BattleId, to: BattleId) -> bool {
        let mut seen = BTreeSet::new();
        let mut open = vec![from];
        while let Some(current) = open.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(blocking) = self.dependencies.get(&current) {
                if blocking.contains(&to) {
                    return true;
                }
                open.extend(blocking.iter().copied());
            }
        }
        false
    }

    /// Unresolved, non-empty battles `blocked` waits on.
    #[must_use]
    pub fn get_dependent_on(&self, blocked: BattleId) -> Vec<BattleId> {
        self.dependencies
            .get(&blocked)
            .map(|blocking| {
                blocking
                    .iter()
                    .copied()
                    .filter(|b| match self.battles.get(b) {
                        Some(battle) => !battle.is_empty(),
                        None => self.is_registered(*b),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Battles waiting on `blocking`.
    #[must_use]
    pub fn get_blocked(&self, blocking: BattleId) -> Vec<BattleId> {
        self.dependencies
            .keys()
            .copied()
            .filter(|&blocked| self.get_dependent_on(blocked).contains(&blocking))
            .collect()
    }

    // ========================================================================
    // Adding battles
    // ========================================================================

    /// Create or join whatever battles a move implies.
    pub fn add_battle(&mut self, attack: &AttackMove, bridge: &mut dyn Bridge) -> Result<()> {
        let site = attack.route.end();
        let player = attack.player;
        if attack.bombing {
            let air_first = {
                let state = bridge.state();
                !attack.air_battle_completed
                    && state.rules.raids_may_be_preceded_by_air_battles
                    && could_have_defenders(state, site, player, true)?
            };
            if air_first {
                self.add_air_battle(attack, &attack.units, BattleType::AirRaid, bridge)?;
            } else {
                self.add_bombing_battle(attack, bridge)?;
            }
            self.mark_was_in_combat(&attack.units, bridge)?;
            return Ok(());
        }

        let escorts = {
            let state = bridge.state();
            if !attack.air_battle_completed
                && state.rules.battles_may_be_preceded_by_air_battles
                && could_have_defenders(state, site, player, false)?
            {
                attacking_escorts(state, &attack.units, false)?
            } else {
                Vec::new()
            }
        };
        self.add_air_battle(attack, &escorts, BattleType::AirBattle, bridge)?;
        self.add_must_fight_battle(attack, bridge)?;
        let surface = bridge
            .state()
            .any_unit(&attack.units, |_, t| t.is_land() || t.is_sea())?;
        if surface {
            self.add_empty_battle(attack, bridge)?;
        }
        Ok(())
    }

    fn add_bombing_battle(&mut self, attack: &AttackMove, bridge: &mut dyn Bridge) -> Result<()> {
        let site = attack.route.end();
        let id = self.get_or_create_battle(site, attack.player, BattleType::BombingRaid, bridge.state())?;
        self.battle_mut(id)?.add_attack(attack, bridge)?;
        for dependent in [BattleType::Normal, BattleType::AirBattle] {
            if let Some(blocked) = self.pending_battle_id(site, dependent) {
                self.add_dependency(blocked, id)?;
            }
        }
        Ok(())
    }

    fn add_air_battle(
        &mut self,
        attack: &AttackMove,
        units: &[UnitId],
        battle_type: BattleType,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let site = attack.route.end();
        let id = self.get_or_create_battle(site, attack.player, battle_type, bridge.state())?;
        let escort = AttackMove {
            units: units.to_vec(),
            ..attack.clone()
        };
        self.battle_mut(id)?.add_attack(&escort, bridge)?;
        if battle_type.is_bombing_run() {
            if let Some(blocked) = self.pending_battle_id(site, BattleType::AirBattle) {
                self.add_dependency(blocked, id)?;
            }
        } else {
            for blocking in [BattleType::AirRaid, BattleType::BombingRaid] {
                if let Some(blocking) = self.pending_battle_id(site, blocking) {
                    self.add_dependency(id, blocking)?;
                }
            }
        }
        if let Some(blocked) = self.pending_battle_id(site, BattleType::Normal) {
            self.add_dependency(blocked, id)?;
        }
        Ok(())
    }

    /// Sea battle the units were unloaded from, for an unloading route.
    fn dependent_amphibious_assault(&self, route: &Route, state: &GameState) -> Result<Option<BattleId>> {
        if !route.is_unload(state)? {
            return Ok(None);
        }
        Ok(self.pending_battle_id(route.territory_before_end(), BattleType::Normal))
    }

    fn add_must_fight_battle(&mut self, attack: &AttackMove, bridge: &mut dyn Bridge) -> Result<()> {
        let site = attack.route.end();
        let player = attack.player;
        let (fight, precede, land) = {
            let state = bridge.state();
            let enemies = state.units_at_matching(site, matches::enemy_of(state, player))?;
            let only_infrastructure = state.all_units(&enemies, matches::is_infrastructure)?;
            let precede = self.dependent_amphibious_assault(&attack.route, state)?;
            let land = state.any_unit(&attack.units, matches::is_land)?;
            (!enemies.is_empty() && !only_infrastructure, precede, land)
        };
        if !fight {
            return Ok(());
        }
        let id = self.get_or_create_battle(site, player, BattleType::Normal, bridge.state())?;
        self.battle_mut(id)?.add_attack(attack, bridge)?;
        if let Some(precede) = precede.filter(|_| land) {
            self.add_dependency(id, precede)?;
        }
        if let Some(bombing) = self.pending_bombing_battle(site) {
            self.add_dependency(id, bombing)?;
        }
        if let Some(air) = self.pending_battle_id(site, BattleType::AirBattle) {
            self.add_dependency(id, air)?;
        }
        Ok(())
    }

    /// Enemy territory with no enemy combat units that `player` may take.
    fn conquerable(state: &GameState, player: PlayerId, territory: TerritoryId) -> Result<bool> {
        let t = state.territory(territory)?;
        if t.water && t.owner.is_none() {
            return Ok(false);
        }
        if !state.is_enemy_territory(player, territory)? {
            return Ok(false);
        }
        let defenders = state.units_at_matching(territory, |u, ty| {
            state.at_war(player, u.owner) && !ty.is_infrastructure()
        })?;
        Ok(defenders.is_empty())
    }

    /// Conquests along and at the end of a move that meets no defenders.
    fn add_empty_battle(&mut self, attack: &AttackMove, bridge: &mut dyn Bridge) -> Result<()> {
        let route = &attack.route;
        let player = attack.player;
        let site = route.end();
        let (middle, end_conquerable, precede, hold_for_scramble) = {
            let state = bridge.state();
            let units = &attack.units;
            let can_conquer = state.filter_units(units, |u, _| {
                !u.transported_by.is_some_and(|t| units.contains(&t))
            })?;
            if !state.any_unit(&can_conquer, matches::is_not_air)? {
                return Ok(());
            }
            let mut middle = Vec::new();
            let steps = route.steps();
            for &t in steps.iter().take(steps.len().saturating_sub(1)) {
                if t != site && !middle.contains(&t) && Self::conquerable(state, player, t)? {
                    middle.push(t);
                }
            }
            let end_conquerable = Self::conquerable(state, player, site)?;
            let precede = match self.dependent_amphibious_assault(route, state)? {
                Some(id) => Some(id),
                None => self.pending_bombing_battle(site),
            };
            let hold_for_scramble =
                state.rules.scramble_rules_in_effect && route.is_unload(state)? && route.has_exactly_one_step();
            (middle, end_conquerable, precede, hold_for_scramble)
        };

        for current in middle {
            let water = bridge.state().territory(current)?.water;
            if !water {
                self.blitzed.insert(current);
            }
            self.conquered.insert(current);
            let id = self.get_or_create_finished(current, player, BattleResultDescription::Blitzed, bridge.state())?;
            self.battle_mut(id)?.add_attack(attack, bridge)?;
            self.take_over(current, player, &attack.units, bridge)?;
        }

        if !end_conquerable {
            return Ok(());
        }
        if precede.is_some() || hold_for_scramble {
            let id = self.get_or_create_non_fighting(site, player, bridge.state())?;
            self.battle_mut(id)?.add_attack(attack, bridge)?;
            if let Some(precede) = precede {
                self.add_dependency(id, precede)?;
            }
        } else {
            let water = bridge.state().territory(site)?.water;
            if !water {
                self.blitzed.insert(site);
            }
            self.conquered.insert(site);
            let id = self.get_or_create_finished(site, player, BattleResultDescription::Conquered, bridge.state())?;
            self.battle_mut(id)?.add_attack(attack, bridge)?;
            self.take_over(site, player, &attack.units, bridge)?;
        }
        Ok(())
    }

    fn mark_was_in_combat(&self, units: &[UnitId], bridge: &mut dyn Bridge) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let changes = units
            .iter()
            .map(|&u| Change::set(u, UnitProperty::WasInCombat(true)))
            .collect();
        bridge.apply_change(Change::Composite(changes))
    }

    // ========================================================================
    // Undo and cancel
    // ========================================================================

    /// Take the units of an undone move out of every battle they joined.
    ///
    /// Battles left empty are deleted without a record. Territories on the
    /// route that are no longer held stop counting as conquered.
    pub fn undo_battle(&mut self, route: &Route, units: &[UnitId], player: PlayerId, bridge: &mut dyn Bridge) -> Result<()> {
        let ids: Vec<BattleId> = self.battles.keys().copied().collect();
        for id in ids {
            let Some(battle) = self.battles.get_mut(&id) else { continue };
            if battle.site() == route.start() {
                continue;
            }
            battle.remove_attack(units);
            if battle.is_empty() {
                debug!(battle = %id, "battle emptied by undo");
                self.records.remove(id);
                self.drop_battle(id);
            }
        }
        for t in route.all_territories() {
            let held = bridge
                .state()
                .territory(t)?
                .owner
                .is_some_and(|owner| bridge.state().are_allied(owner, player));
            if !held && self.conquered.remove(&t) {
                self.blitzed.remove(&t);
            }
        }
        let changes: Vec<Change> = units
            .iter()
            .filter(|&&u| bridge.state().has_unit(u))
            .map(|&u| Change::set(u, UnitProperty::WasInCombat(false)))
            .collect();
        if !changes.is_empty() {
            bridge.apply_change(Change::Composite(changes))?;
        }
        Ok(())
    }

    /// End a battle without a result (the territory was given up).
    pub fn cancel_battle(&mut self, id: BattleId) -> Result<()> {
        info!(battle = %id, "battle cancelled");
        self.with_battle(id, |battle, tracker| battle.cancel(tracker))
    }

    // ========================================================================
    // Fighting
    // ========================================================================

    /// Fight (or resume) one battle.
    ///
    /// # Errors
    ///
    /// [`BattleError::InvariantViolation`] while prerequisites are pending.
    pub fn fight(&mut self, id: BattleId, bridge: &mut dyn Bridge) -> Result<()> {
        let pending = self.get_dependent_on(id);
        if !pending.is_empty() {
            error!(battle = %id, ?pending, "battle fought before its prerequisites");
            return Err(BattleError::InvariantViolation(format!(
                "{id} fought while {} prerequisite battles are pending",
                pending.len()
            )));
        }
        self.with_battle(id, |battle, tracker| battle.fight(tracker, bridge))
    }

    /// Write out every conquest already made.
    pub fn clear_finished_battles(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let finished: Vec<BattleId> = self
            .battles
            .values()
            .filter(|b| matches!(b, Battle::Finished(_)))
            .map(Battle::id)
            .collect();
        for id in finished {
            self.with_battle(id, |battle, tracker| battle.fight(tracker, bridge))?;
        }
        Ok(())
    }

    /// Close air battles that cannot meet a single defender.
    pub fn clear_empty_air_battle_attacks(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let air: Vec<BattleId> = self
            .battles
            .values()
            .filter(|b| matches!(b, Battle::Air(_)))
            .map(Battle::id)
            .collect();
        for id in air {
            self.with_battle(id, |battle, tracker| {
                battle.reset_defending_units(bridge.state())?;
                match battle {
                    Battle::Air(air) if air.core().defending_units().is_empty() => air.finish_headless(tracker, bridge),
                    _ => Ok(()),
                }
            })?;
        }
        Ok(())
    }

    /// Fight every air raid, then every bombing raid.
    pub fn fight_air_raids_and_strategic_bombing(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        for battle_type in [BattleType::AirRaid, BattleType::BombingRaid] {
            for site in self.pending_battle_sites(true) {
                if let Some(id) = self.pending_battle_id(site, battle_type) {
                    self.fight(id, bridge)?;
                }
            }
        }
        Ok(())
    }

    /// Fight battles nobody can defend, and uncontested entries that are
    /// no longer blocked.
    pub fn fight_defenseless_battles(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        for id in self.pending_battles(BattleType::Normal) {
            let Some(battle) = self.battles.get(&id) else { continue };
            if !self.get_dependent_on(id).is_empty() {
                continue;
            }
            let state = bridge.state();
            let mut power = 0;
            for &unit in battle.core().defending_units() {
                let t = state.unit_type(unit)?;
                power += t.strength(true) * t.rolls(true);
            }
            if power == 0 {
                debug!(battle = %id, "fighting defenceless battle");
                self.fight(id, bridge)?;
            }
        }
        for site in self.pending_battle_sites(false) {
            let Some(id) = self.pending_battle_id(site, BattleType::Normal) else { continue };
            let unblocked_entry = matches!(self.battles.get(&id), Some(Battle::NonFighting(_)))
                && self.get_dependent_on(id).is_empty();
            if unblocked_entry {
                self.fight(id, bridge)?;
            }
        }
        Ok(())
    }

    /// Fight the only pending battle, if there is exactly one and it is not blocked.
    pub fn fight_battle_if_only_one(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let sites = self.pending_battle_sites(false);
        let mut only = sites.iter();
        if let (Some(&site), None) = (only.next(), only.next()) {
            if let Some(id) = self.pending_non_bombing_battle(site) {
                if self.get_dependent_on(id).is_empty() {
                    self.fight(id, bridge)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Conquest
    // ========================================================================

    /// Units among `arriving` able to take control of a sea zone.
    fn sea_zone_controllers(state: &GameState, arriving: &[UnitId]) -> Result<usize> {
        let rules = &state.rules;
        let controllers = state.filter_units(arriving, |u, t| {
            t.is_sea()
                && !u.submerged
                && (rules.transport_control_sea_zone || !t.is_non_combat_transport())
                && !(rules.subs_control_sea_zone_restricted && t.is_sub())
        })?;
        Ok(controllers.len())
    }

    /// Owner a liberated territory goes back to.
    fn liberated_owner(state: &GameState, territory: TerritoryId, original: PlayerId, player: PlayerId) -> PlayerId {
        let holds_capital = state
            .territories()
            .any(|t| t.capital_of == Some(original) && t.owner == Some(original));
        let is_their_capital = state
            .territory(territory)
            .is_ok_and(|t| t.capital_of == Some(original));
        if holds_capital || is_their_capital {
            original
        } else {
            player
        }
    }

    /// `player` takes `territory` with `arriving` units.
    ///
    /// Charges the neutral fee, seizes a capital's treasury, hands liberated
    /// territory back to its original owner and captures infrastructure.
    pub fn take_over(
        &mut self,
        territory: TerritoryId,
        player: PlayerId,
        arriving: &[UnitId],
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        let mut changes = Vec::new();
        let mut history = Vec::new();
        let owner_changed;
        {
            let state = bridge.state();
            let t = state.territory(territory)?;
            if t.water && t.owner.is_none() {
                return Ok(());
            }
            if t.water && !arriving.is_empty() && Self::sea_zone_controllers(state, arriving)? == 0 {
                return Ok(());
            }
            let owner_is_enemy = t.owner.map_or(true, |owner| state.at_war(player, owner));

            if t.owner.is_none() && !t.water && state.rules.neutral_charge >= 0 {
                let pus = state.player(player)?.pus;
                let charge = state.rules.neutral_charge.min(pus.max(0));
                changes.push(Change::ChangeResource {
                    player,
                    resource: Resource::Pus,
                    delta: -charge,
                });
                history.push(format!(
                    "{} loses {charge} PUs for violating the neutrality of {}",
                    state.player(player)?.name,
                    t.name
                ));
            }

            if let (true, Some(whose)) = (owner_is_enemy, t.capital_of) {
                if t.owner == Some(whose) {
                    let captured = state.player(whose)?.pus.max(0);
                    changes.push(Change::ChangeResource {
                        player: whose,
                        resource: Resource::Pus,
                        delta: -captured,
                    });
                    changes.push(Change::ChangeResource {
                        player,
                        resource: Resource::Pus,
                        delta: captured,
                    });
                    history.push(format!(
                        "{} captures {captured} PUs while taking {} capital",
                        state.player(player)?.name,
                        state.player(whose)?.name
                    ));
                }
            }

            let original_allied = t
                .original_owner
                .filter(|&orig| state.are_allied(orig, player) && t.owner != Some(orig));
            let new_owner = match original_allied {
                Some(orig) if owner_is_enemy => Self::liberated_owner(state, territory, orig, player),
                _ => player,
            };

            if owner_is_enemy {
                changes.push(Change::SetOwner {
                    territory,
                    owner: Some(new_owner),
                });
                history.push(format!("{} takes {}", state.player(new_owner)?.name, t.name));
            }
            owner_changed = owner_is_enemy;

            let damageable_enemies = state.units_at_matching(territory, |u, ty| {
                state.at_war(player, u.owner) && ty.can_be_damaged()
            })?;
            if !damageable_enemies.is_empty() {
                if let Some(raid) = self.pending_bombing_battle(territory) {
                    if self.battles.get(&raid).is_some_and(|b| !b.is_empty()) {
                        error!(site = %territory, battle = %raid, "territory taken before its bombing raid");
                        return Err(BattleError::InvariantViolation(format!(
                            "bombing raid {raid} must be fought before {} is taken",
                            t.name
                        )));
                    }
                }
            }

            let destroyed = state.units_at_matching(territory, |u, ty| {
                state.at_war(player, u.owner) && u.disabled && !ty.is_infrastructure()
            })?;
            if !destroyed.is_empty() {
                changes.push(Change::remove_units(&destroyed));
            }
            let captured = state.units_at_matching(territory, |u, ty| {
                state.at_war(player, u.owner) && !u.disabled && (ty.is_infrastructure() || matches::is_capturable(u, ty))
            })?;
            for unit in captured {
                changes.push(Change::set(unit, UnitProperty::Owner(new_owner)));
                changes.push(Change::set(unit, UnitProperty::MovementLeft(0)));
            }

            if let Some(orig) = original_allied.filter(|&orig| owner_is_enemy && t.capital_of == Some(orig)) {
                for other in state.territories() {
                    let restore = other.original_owner == Some(orig)
                        && other.owner != Some(orig)
                        && other.owner.is_some_and(|o| state.are_allied(o, orig))
                        && other.id != territory;
                    if !restore {
                        continue;
                    }
                    changes.push(Change::SetOwner {
                        territory: other.id,
                        owner: Some(orig),
                    });
                    for unit in state.units_at_matching(other.id, |_, ty| ty.is_infrastructure())? {
                        changes.push(Change::set(unit, UnitProperty::Owner(orig)));
                    }
                    history.push(format!("{} is returned to {}", other.name, state.player(orig)?.name));
                }
            }

            let in_combat = if t.water {
                state.filter_units(arriving, matches::is_not_land)?
            } else {
                arriving.to_vec()
            };
            for unit in in_combat {
                changes.push(Change::set(unit, UnitProperty::WasInCombat(true)));
            }
        }

        if !changes.is_empty() {
            bridge.apply_change(Change::Composite(changes))?;
        }
        for line in history {
            bridge.history_event(line, &[]);
        }
        if owner_changed {
            bridge.play_sound(SoundClip::Conquered, player);
            info!(site = %territory, player = %player, "territory taken");
        }
        Ok(())
    }

    // ========================================================================
    // Turn bookkeeping
    // ========================================================================

    /// Record a conquest.
    pub fn add_to_conquered(&mut self, territory: TerritoryId) {
        self.conquered.insert(territory);
    }

    /// Taken this turn.
    #[must_use]
    pub fn was_conquered(&self, territory: TerritoryId) -> bool {
        self.conquered.contains(&territory)
    }

    /// Blitzed this turn.
    #[must_use]
    pub fn was_blitzed(&self, territory: TerritoryId) -> bool {
        self.blitzed.contains(&territory)
    }

    /// A battle ended there this turn.
    #[must_use]
    pub fn was_fought_over(&self, territory: TerritoryId) -> bool {
        self.fought_over.contains(&territory)
    }

    /// Territories conquered this turn.
    #[must_use]
    pub const fn conquered(&self) -> &BTreeSet<TerritoryId> {
        &self.conquered
    }

    /// Ships there already bombarded this turn.
    pub fn add_bombarded_from(&mut self, territory: TerritoryId) {
        self.bombarded_from.insert(territory);
    }

    /// Some ship bombarded from there this turn.
    #[must_use]
    pub fn was_bombarded_from(&self, territory: TerritoryId) -> bool {
        self.bombarded_from.contains(&territory)
    }

    /// Forbid bombardment from a territory (kamikaze strikes hit it).
    pub fn add_no_bombard_allowed(&mut self, territory: TerritoryId) {
        self.no_bombard_allowed.insert(territory);
    }

    /// Bombardment from there is forbidden.
    #[must_use]
    pub fn no_bombard_allowed_from(&self, territory: TerritoryId) -> bool {
        self.no_bombard_allowed.contains(&territory)
    }

    /// Defending aircraft at `site` left without a place to land.
    pub fn add_defending_air_that_can_not_land(&mut self, site: TerritoryId, units: &[UnitId]) {
        let stranded = self.defending_air_that_can_not_land.entry(site).or_default();
        for &u in units {
            if !stranded.contains(&u) {
                stranded.push(u);
            }
        }
    }

    /// Stranded defending aircraft by site.
    #[must_use]
    pub const fn defending_air_that_can_not_land(&self) -> &BTreeMap<TerritoryId, Vec<UnitId>> {
        &self.defending_air_that_can_not_land
    }

    /// Keep where the attackers of a finished battle came from.
    pub fn record_finished_attacks(&mut self, site: TerritoryId, attacking_from: BTreeMap<TerritoryId, Vec<UnitId>>) {
        let entry = self.finished_attack_from.entry(site).or_default();
        for (from, units) in attacking_from {
            let list = entry.entry(from).or_default();
            for u in units {
                if !list.contains(&u) {
                    list.push(u);
                }
            }
        }
    }

    /// Origins of the attackers of a finished battle.
    #[must_use]
    pub fn finished_attack_from(&self, site: TerritoryId) -> Option<&BTreeMap<TerritoryId, Vec<UnitId>>> {
        self.finished_attack_from.get(&site)
    }

    /// Forget the turn. Battle ids keep counting so ids stay unique.
    pub fn clear(&mut self) {
        self.battles.clear();
        self.keys.clear();
        self.dependencies.clear();
        self.conquered.clear();
        self.blitzed.clear();
        self.fought_over.clear();
        self.bombarded_from.clear();
        self.no_bombard_allowed.clear();
        self.defending_air_that_can_not_land.clear();
        self.finished_attack_from.clear();
    }

    /// Describe the pending battles for the history log.
    #[must_use]
    pub fn describe(&self, state: &GameState) -> Vec<String> {
        self.battles
            .values()
            .filter(|b| !b.is_empty())
            .map(|b| format!("{} in {}", b.battle_type(), territory_name(state, b.site())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::LocalBridge;
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_state() -> GameState {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        types.register(UnitType::new("fighter", Domain::Air, 10, 3, 4));
        let mut state = GameState::new(BattleRules::default(), types);
        for (id, name, water) in [(0, "Home", false), (1, "Border", false), (2, "Target", false), (3, "Sea", true)] {
            state.add_territory(Territory::new(TerritoryId(id), name, water));
        }
        state.connect(TerritoryId(0), TerritoryId(1)).unwrap();
        state.connect(TerritoryId(1), TerritoryId(2)).unwrap();
        state.connect(TerritoryId(2), TerritoryId(3)).unwrap();
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.territory_mut(TerritoryId(0)).unwrap().owner = Some(PlayerId(0));
        state.territory_mut(TerritoryId(1)).unwrap().owner = Some(PlayerId(1));
        state.territory_mut(TerritoryId(2)).unwrap().owner = Some(PlayerId(1));
        state
    }

    fn create_test_bridge() -> LocalBridge<crate::bridge::AutoPlayer> {
        LocalBridge::auto(create_test_state(), 7)
    }

    #[test]
    fn test_attack_into_defended_territory_creates_fought_battle() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(2)).unwrap();
        let attacker = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(1)).unwrap();
        let mut tracker = BattleTracker::new();

        let attack = AttackMove::new(Route::single(TerritoryId(1), TerritoryId(2)), vec![attacker], PlayerId(0));
        bridge.state_mut().unit_mut(attacker).unwrap().location = TerritoryId(2);
        tracker.add_battle(&attack, &mut bridge).unwrap();

        let id = tracker.pending_battle_id(TerritoryId(2), BattleType::Normal).unwrap();
        let battle = tracker.get_pending_battle_by_id(id).unwrap();
        assert!(matches!(battle, Battle::Fought(_)));
        assert_eq!(battle.core().attacking_units(), &[attacker]);
        assert_eq!(battle.defender(), PlayerId(1));
        assert!(tracker.records.get(id).is_some());
    }

    #[test]
    fn test_walk_in_creates_finished_battle_and_takes_over() {
        let mut bridge = create_test_bridge();
        let attacker = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(2)).unwrap();
        let mut tracker = BattleTracker::new();

        let attack = AttackMove::new(Route::single(TerritoryId(1), TerritoryId(2)), vec![attacker], PlayerId(0));
        tracker.add_battle(&attack, &mut bridge).unwrap();

        assert!(tracker.was_conquered(TerritoryId(2)));
        assert_eq!(bridge.state().territory(TerritoryId(2)).unwrap().owner, Some(PlayerId(0)));
        let id = tracker.pending_battle_id(TerritoryId(2), BattleType::Normal).unwrap();
        assert!(matches!(tracker.get_pending_battle_by_id(id), Some(Battle::Finished(_))));
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let mut tracker = BattleTracker::new();
        tracker.add_dependency(BattleId(1), BattleId(2)).unwrap();
        tracker.add_dependency(BattleId(2), BattleId(3)).unwrap();
        let err = tracker.add_dependency(BattleId(3), BattleId(1)).unwrap_err();
        assert!(err.is_fatal());
        assert!(tracker.add_dependency(BattleId(4), BattleId(4)).is_err());
    }

    #[test]
    fn test_remove_battle_releases_blocked() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(2)).unwrap();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(1)).unwrap();
        let a = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(2)).unwrap();
        let b = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(1)).unwrap();
        let mut tracker = BattleTracker::new();
        tracker
            .add_battle(&AttackMove::new(Route::single(TerritoryId(1), TerritoryId(2)), vec![a], PlayerId(0)), &mut bridge)
            .unwrap();
        tracker
            .add_battle(&AttackMove::new(Route::single(TerritoryId(0), TerritoryId(1)), vec![b], PlayerId(0)), &mut bridge)
            .unwrap();
        let first = tracker.pending_battle_id(TerritoryId(2), BattleType::Normal).unwrap();
        let second = tracker.pending_battle_id(TerritoryId(1), BattleType::Normal).unwrap();
        tracker.add_dependency(first, second).unwrap();

        assert_eq!(tracker.get_dependent_on(first), vec![second]);
        assert_eq!(tracker.get_blocked(second), vec![first]);
        assert!(tracker.fight(first, &mut bridge).unwrap_err().is_fatal());

        tracker.remove_battle(second);
        assert!(tracker.get_dependent_on(first).is_empty());
        assert!(tracker.was_fought_over(TerritoryId(1)));
    }

    #[test]
    fn test_undo_drops_emptied_battle_without_record() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(2)).unwrap();
        let attacker = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(2)).unwrap();
        let mut tracker = BattleTracker::new();
        let route = Route::single(TerritoryId(1), TerritoryId(2));
        tracker
            .add_battle(&AttackMove::new(route.clone(), vec![attacker], PlayerId(0)), &mut bridge)
            .unwrap();
        let id = tracker.pending_battle_id(TerritoryId(2), BattleType::Normal).unwrap();

        tracker.undo_battle(&route, &[attacker], PlayerId(0), &mut bridge).unwrap();
        assert!(tracker.get_pending_battle_by_id(id).is_none());
        assert!(tracker.records.get(id).is_none());
        assert!(!tracker.was_fought_over(TerritoryId(2)));
    }

    #[test]
    fn test_neutral_charge_capped_by_treasury() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().rules.neutral_charge = 3;
        bridge.state_mut().player_mut(PlayerId(0)).unwrap().pus = 2;
        bridge.state_mut().territory_mut(TerritoryId(2)).unwrap().owner = None;
        let attacker = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(2)).unwrap();
        let mut tracker = BattleTracker::new();

        tracker.take_over(TerritoryId(2), PlayerId(0), &[attacker], &mut bridge).unwrap();
        assert_eq!(bridge.state().player(PlayerId(0)).unwrap().pus, 0);
        assert_eq!(bridge.state().territory(TerritoryId(2)).unwrap().owner, Some(PlayerId(0)));
    }

    #[test]
    fn test_capital_capture_transfers_treasury() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().territory_mut(TerritoryId(2)).unwrap().capital_of = Some(PlayerId(1));
        bridge.state_mut().player_mut(PlayerId(1)).unwrap().pus = 20;
        bridge.state_mut().player_mut(PlayerId(0)).unwrap().pus = 5;
        let attacker = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(2)).unwrap();
        let mut tracker = BattleTracker::new();

        tracker.take_over(TerritoryId(2), PlayerId(0), &[attacker], &mut bridge).unwrap();
        assert_eq!(bridge.state().player(PlayerId(0)).unwrap().pus, 25);
        assert_eq!(bridge.state().player(PlayerId(1)).unwrap().pus, 0);
    }
}
