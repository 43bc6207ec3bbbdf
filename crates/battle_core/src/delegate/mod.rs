//! Turn-level battle driver.
//!
//! The delegate runs the pre-combat stages once per turn (battle setup,
//! scrambling, kamikaze strikes, bombardment assignment), auto-fights the
//! trivial battles and then hands battles out one at a time. Every stage is
//! guarded by a persisted flag, so a delegate restored from a checkpoint
//! never repeats a stage that already ran.

pub mod bombard;
pub mod kamikaze;
pub mod scramble;
pub mod setup;

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::battle::common::{determine_defender, territory_name, units_to_text};
use crate::battle::{Battle, BattleType};
use crate::bridge::Bridge;
use crate::change::{Change, UnitProperty};
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId};
use crate::records::BattleRecord;
use crate::state::GameState;
use crate::tracker::{AttackMove, BattleTracker};

/// Stages still to run this turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct StageFlags {
    /// Same-territory battles, abandoned territories, finished battles.
    pub initialize: bool,
    /// Defender scrambles.
    pub scramble: bool,
    /// Kamikaze strikes.
    pub kamikaze: bool,
    /// Air battles without defenders.
    pub clear_empty_air_battles: bool,
    /// Bombardment sources.
    pub bombardment: bool,
    /// Copy records into the statistics.
    pub record_statistics: bool,
    /// End-of-turn cleanup.
    pub cleanup: bool,
    /// Stranded defending aircraft.
    pub check_planes_can_land: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            initialize: true,
            scramble: true,
            kamikaze: true,
            clear_empty_air_battles: true,
            bombardment: true,
            record_statistics: true,
            cleanup: true,
            check_planes_can_land: true,
        }
    }
}

/// Decisions already settled inside stages that ask more than one question.
///
/// A stage interrupted by a suspension runs again on resume and skips
/// everything recorded here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Scramble sites whose defender has answered.
    pub scramble_sites: BTreeSet<TerritoryId>,
    /// Air scrambled this turn.
    pub scrambled: BTreeSet<UnitId>,
    /// Enemies whose kamikaze strikes are resolved.
    pub kamikaze_players: BTreeSet<PlayerId>,
    /// Ships assigned to a bombardment or declined.
    pub bombard_ships: BTreeSet<UnitId>,
}

/// Battle phase of one player's turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleDelegate {
    tracker: BattleTracker,
    flags: StageFlags,
    progress: StageProgress,
    current: Option<BattleId>,
    statistics: Vec<BattleRecord>,
}

fn current_player(state: &GameState) -> Result<PlayerId> {
    state
        .current_player
        .ok_or_else(|| BattleError::InvalidState("no player is taking a turn".into()))
}

impl BattleDelegate {
    /// Delegate with an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Battles of this turn.
    #[must_use]
    pub const fn tracker(&self) -> &BattleTracker {
        &self.tracker
    }

    /// Mutable tracker, for the movement layer.
    pub fn tracker_mut(&mut self) -> &mut BattleTracker {
        &mut self.tracker
    }

    /// Stages still pending.
    #[must_use]
    pub const fn flags(&self) -> StageFlags {
        self.flags
    }

    /// Decisions settled in stages that have not finished.
    #[must_use]
    pub const fn progress(&self) -> &StageProgress {
        &self.progress
    }

    /// Battle being fought, if any.
    #[must_use]
    pub const fn current_battle(&self) -> Option<BattleId> {
        self.current
    }

    /// Records of earlier turns.
    #[must_use]
    pub fn statistics(&self) -> &[BattleRecord] {
        &self.statistics
    }

    /// Report a combat move to the tracker.
    pub fn add_attack(&mut self, attack: &AttackMove, bridge: &mut dyn Bridge) -> Result<()> {
        self.tracker.add_battle(attack, bridge)
    }

    /// Type to sites of the battles still to fight.
    #[must_use]
    pub fn battles(&self) -> std::collections::BTreeMap<BattleType, BTreeSet<TerritoryId>> {
        self.tracker.pending_battle_listing()
    }

    /// First pending battle whose prerequisites are all resolved.
    #[must_use]
    pub fn next_battle(&self) -> Option<(TerritoryId, BattleType)> {
        if let Some(b) = self.current.and_then(|id| self.tracker.get_pending_battle_by_id(id)) {
            return Some((b.site(), b.battle_type()));
        }
        self.tracker
            .battles()
            .filter(|b| !b.is_over() && !b.is_empty())
            .find(|b| self.tracker.get_dependent_on(b.id()).is_empty())
            .map(|b| (b.site(), b.battle_type()))
    }

    /// Player input is still needed.
    #[must_use]
    pub fn requires_user_input(&self) -> bool {
        self.current.is_some() || !self.tracker.has_no_pending_battles()
    }

    // ========================================================================
    // Start
    // ========================================================================

    /// Run the pre-combat stages and the automatic fights.
    ///
    /// Safe to call again after a suspension: finished stages are skipped
    /// and an interrupted battle is resumed first.
    pub fn start(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let player = current_player(bridge.state())?;
        info!(player = %player, "battle phase started");

        if self.current.is_some() {
            self.fight_current_battle(bridge)?;
        }
        if self.flags.initialize {
            setup::initialize(&mut self.tracker, player, bridge)?;
            self.flags.initialize = false;
        }
        if self.flags.scramble {
            scramble::do_scrambling(&mut self.tracker, &mut self.progress, player, bridge)?;
            self.flags.scramble = false;
        }
        if self.flags.kamikaze {
            kamikaze::do_kamikaze_attacks(&mut self.tracker, &mut self.progress, player, bridge)?;
            self.flags.kamikaze = false;
        }
        if self.flags.clear_empty_air_battles {
            self.tracker.clear_empty_air_battle_attacks(bridge)?;
            self.flags.clear_empty_air_battles = false;
        }
        if self.flags.bombardment {
            bombard::add_bombardment_sources(&mut self.tracker, &mut self.progress, player, bridge)?;
            self.flags.bombardment = false;
        }

        let auto = self
            .tracker
            .fight_air_raids_and_strategic_bombing(bridge)
            .and_then(|()| self.tracker.fight_defenseless_battles(bridge))
            .and_then(|()| self.tracker.fight_battle_if_only_one(bridge));
        if let Err(e) = auto {
            if e.is_suspension() {
                self.current = self.tracker.executing_battle();
                debug!(battle = ?self.current, "automatic fight suspended");
            }
            return Err(e);
        }
        Ok(())
    }

    // ========================================================================
    // Fighting
    // ========================================================================

    /// Fight the battle of `battle_type` at `territory`.
    ///
    /// # Errors
    ///
    /// [`BattleError::Rejected`] while another battle is current, when there
    /// is no such battle or when a prerequisite battle must be fought first.
    pub fn fight_battle(&mut self, territory: TerritoryId, battle_type: BattleType, bridge: &mut dyn Bridge) -> Result<()> {
        let requested = self.tracker.pending_battle_id(territory, battle_type);
        if let Some(current) = self.current.filter(|&c| Some(c) != requested) {
            let message = match self.tracker.get_pending_battle_by_id(current) {
                Some(b) => format!(
                    "Must finish {} in {} first",
                    b.battle_type(),
                    territory_name(bridge.state(), b.site())
                ),
                None => format!("Must finish {current} first"),
            };
            warn!(site = %territory, "{message}");
            return Err(BattleError::Rejected(message));
        }
        let Some(id) = requested else {
            let message = format!("No pending battle in {}", territory_name(bridge.state(), territory));
            warn!(site = %territory, "{message}");
            return Err(BattleError::Rejected(message));
        };
        if let Some(first) = self.tracker.get_dependent_on(id).first() {
            let message = match self.tracker.get_pending_battle_by_id(*first) {
                Some(b) => format!(
                    "Must complete {} in {} first",
                    b.battle_type(),
                    territory_name(bridge.state(), b.site())
                ),
                None => format!("Must complete {first} first"),
            };
            warn!(site = %territory, "{message}");
            return Err(BattleError::Rejected(message));
        }
        self.current = Some(id);
        self.fight_current_battle(bridge)
    }

    /// Resume the current battle.
    pub fn fight_current_battle(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let Some(id) = self.current else {
            return Err(BattleError::Rejected("No battle is being fought".into()));
        };
        if self.tracker.get_pending_battle_by_id(id).is_none() {
            self.current = None;
            return Ok(());
        }
        self.tracker.fight(id, bridge)?;
        if self.tracker.get_pending_battle_by_id(id).map_or(true, Battle::is_over) {
            self.current = None;
            #[cfg(debug_assertions)]
            debug!(battle = %id, hash = bridge.state().state_hash(), "battle resolved");
        }
        Ok(())
    }

    /// Drop the current battle if it is `id`.
    pub fn clear_current_battle(&mut self, id: BattleId) {
        if self.current == Some(id) {
            self.current = None;
        }
    }

    // ========================================================================
    // End
    // ========================================================================

    /// Close the battle phase.
    ///
    /// # Errors
    ///
    /// [`BattleError::Rejected`] while battles remain to be fought.
    pub fn end(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        if self.current.is_some() || !self.tracker.has_no_pending_battles() {
            let sites = self.tracker.describe(bridge.state()).join(", ");
            warn!(%sites, "battle phase ended with battles pending");
            return Err(BattleError::Rejected(format!("Battles remain to be fought: {sites}")));
        }
        let player = current_player(bridge.state())?;
        if self.flags.record_statistics {
            self.statistics.extend(self.tracker.records.iter().cloned());
            self.flags.record_statistics = false;
        }
        if self.flags.cleanup {
            self.tracker.records.clear();
            scramble::scrambling_cleanup(bridge)?;
            air_battle_cleanup(bridge)?;
            self.flags.cleanup = false;
        }
        if self.flags.check_planes_can_land {
            self.check_defending_planes_can_land(player, bridge)?;
            self.flags.check_planes_can_land = false;
        }
        self.tracker.clear();
        self.flags = StageFlags::default();
        self.progress = StageProgress::default();
        info!(player = %player, "battle phase ended");
        Ok(())
    }

    /// Land (or lose) defending aircraft whose base was lost.
    fn check_defending_planes_can_land(&mut self, player: PlayerId, bridge: &mut dyn Bridge) -> Result<()> {
        let stranded = self.tracker.defending_air_that_can_not_land().clone();
        for (site, air) in stranded {
            let mut air: Vec<UnitId> = air
                .into_iter()
                .filter(|&u| bridge.state().unit(u).is_ok_and(|unit| unit.location == site))
                .collect();
            if air.is_empty() {
                continue;
            }
            let (lands, carriers, islands) = {
                let state = bridge.state();
                let defender = determine_defender(state, site, player)?;
                let mut lands = Vec::new();
                let mut carriers = Vec::new();
                let mut islands = Vec::new();
                for &n in state.neighbors(site)? {
                    let t = state.territory(n)?;
                    if t.water {
                        let room = carrier_room(state, n, defender)?;
                        if room > 0 {
                            carriers.push((n, room));
                        }
                    } else if t.owner.is_some_and(|o| state.are_allied(o, defender)) && !self.tracker.was_conquered(n) {
                        lands.push(n);
                        if state.neighbors(n)?.len() == 1 {
                            islands.push(n);
                        }
                    }
                }
                (lands, carriers, islands)
            };

            let mut moves: Vec<(TerritoryId, Vec<UnitId>)> = Vec::new();
            if bridge.state().rules.ww2v2 {
                for (sea, room) in carriers {
                    let take: Vec<UnitId> = air.iter().copied().take(room as usize).collect();
                    if !take.is_empty() {
                        air.retain(|u| !take.contains(u));
                        moves.push((sea, take));
                    }
                }
                if let Some(&land) = lands.first() {
                    if !air.is_empty() {
                        moves.push((land, std::mem::take(&mut air)));
                    }
                }
            } else if let Some(&island) = islands.first() {
                moves.push((island, std::mem::take(&mut air)));
            }

            for (to, units) in moves {
                bridge.history_event(
                    format!(
                        "{} forced to land in {}",
                        units_to_text(bridge.state(), &units),
                        territory_name(bridge.state(), to)
                    ),
                    &units,
                );
                bridge.apply_change(Change::move_units(&units, to))?;
            }
            if !air.is_empty() {
                bridge.history_event(
                    format!("{} could not land and were killed", units_to_text(bridge.state(), &air)),
                    &air,
                );
                bridge.apply_change(Change::remove_units(&air))?;
                debug!(site = %site, lost = air.len(), "stranded defending air destroyed");
            }
        }
        Ok(())
    }
}

/// Free carrier space for `defender`'s side in a sea zone.
fn carrier_room(state: &GameState, sea: TerritoryId, defender: PlayerId) -> Result<u32> {
    let mut capacity = 0;
    let mut used = 0;
    for u in state.units_at(sea) {
        let unit = state.unit(u)?;
        if !state.are_allied(unit.owner, defender) {
            continue;
        }
        let t = state.unit_type(u)?;
        if t.is_carrier() {
            capacity += t.carrier_capacity;
        }
        if t.is_air() {
            used += t.carrier_cost;
        }
    }
    Ok(capacity.saturating_sub(used))
}

/// Clear the air-battle marks once raids are over.
fn air_battle_cleanup(bridge: &mut dyn Bridge) -> Result<()> {
    if !bridge.state().rules.raids_may_be_preceded_by_air_battles
        && !bridge.state().rules.battles_may_be_preceded_by_air_battles
    {
        return Ok(());
    }
    let changes: Vec<Change> = bridge
        .state()
        .units()
        .filter(|u| u.was_in_air_battle)
        .map(|u| Change::set(u.id, UnitProperty::WasInAirBattle(false)))
        .collect();
    if !changes.is_empty() {
        bridge.history_event("Cleaning up after air battles".into(), &[]);
        bridge.apply_change(Change::Composite(changes))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AutoPlayer, LocalBridge};
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::route::Route;
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_bridge() -> LocalBridge<AutoPlayer> {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        types.register(UnitType::new("factory", Domain::Land, 15, 0, 0).with_trait(crate::data::UnitTrait::Infrastructure));
        let mut state = GameState::new(BattleRules::default(), types);
        for (id, name) in [(0, "Home"), (1, "Front"), (2, "Beyond")] {
            state.add_territory(Territory::new(TerritoryId(id), name, false));
        }
        state.connect(TerritoryId(0), TerritoryId(1)).unwrap();
        state.connect(TerritoryId(1), TerritoryId(2)).unwrap();
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.territory_mut(TerritoryId(0)).unwrap().owner = Some(PlayerId(0));
        state.territory_mut(TerritoryId(1)).unwrap().owner = Some(PlayerId(1));
        state.territory_mut(TerritoryId(2)).unwrap().owner = Some(PlayerId(1));
        state.current_player = Some(PlayerId(0));
        LocalBridge::auto(state, 11)
    }

    fn attack(bridge: &mut LocalBridge<AutoPlayer>, delegate: &mut BattleDelegate, to: TerritoryId, count: usize) {
        let units: Vec<UnitId> = (0..count)
            .map(|_| bridge.state_mut().spawn_unit("infantry", PlayerId(0), to).unwrap())
            .collect();
        let from = TerritoryId(to.0 - 1);
        delegate
            .add_attack(&AttackMove::new(Route::single(from, to), units, PlayerId(0)), bridge)
            .unwrap();
    }

    #[test]
    fn test_unknown_battle_rejected() {
        let mut bridge = create_test_bridge();
        let mut delegate = BattleDelegate::new();
        let err = delegate
            .fight_battle(TerritoryId(2), BattleType::Normal, &mut bridge)
            .unwrap_err();
        assert!(matches!(err, BattleError::Rejected(ref m) if m.starts_with("No pending battle")));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_blocked_battle_rejected() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(1)).unwrap();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(2)).unwrap();
        let mut delegate = BattleDelegate::new();
        attack(&mut bridge, &mut delegate, TerritoryId(1), 3);
        attack(&mut bridge, &mut delegate, TerritoryId(2), 3);
        let first = delegate.tracker().pending_battle_id(TerritoryId(1), BattleType::Normal).unwrap();
        let second = delegate.tracker().pending_battle_id(TerritoryId(2), BattleType::Normal).unwrap();
        delegate.tracker_mut().add_dependency(second, first).unwrap();

        let err = delegate
            .fight_battle(TerritoryId(2), BattleType::Normal, &mut bridge)
            .unwrap_err();
        assert!(matches!(err, BattleError::Rejected(ref m) if m.starts_with("Must complete")));
        assert!(delegate.current_battle().is_none());
        assert_eq!(delegate.next_battle(), Some((TerritoryId(1), BattleType::Normal)));
    }

    #[test]
    fn test_start_fights_defenceless_battle() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().spawn_unit("factory", PlayerId(1), TerritoryId(1)).unwrap();
        let mut delegate = BattleDelegate::new();
        attack(&mut bridge, &mut delegate, TerritoryId(1), 1);

        delegate.start(&mut bridge).unwrap();
        assert!(delegate.tracker().has_no_pending_battles());
        assert_eq!(bridge.state().territory(TerritoryId(1)).unwrap().owner, Some(PlayerId(0)));
        assert!(!delegate.flags().initialize);
        assert!(!delegate.flags().bombardment);
    }

    #[test]
    fn test_end_resets_flags_and_keeps_statistics() {
        let mut bridge = create_test_bridge();
        let mut delegate = BattleDelegate::new();
        attack(&mut bridge, &mut delegate, TerritoryId(1), 1);
        delegate.start(&mut bridge).unwrap();
        delegate.end(&mut bridge).unwrap();

        assert_eq!(delegate.flags(), StageFlags::default());
        assert_eq!(delegate.statistics().len(), 1);
        assert!(delegate.tracker().records.is_empty());
        assert!(!delegate.tracker().was_conquered(TerritoryId(1)));
    }

    #[test]
    fn test_end_rejected_with_pending_battle() {
        let mut bridge = create_test_bridge();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(1)).unwrap();
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(2)).unwrap();
        let mut delegate = BattleDelegate::new();
        attack(&mut bridge, &mut delegate, TerritoryId(1), 2);
        attack(&mut bridge, &mut delegate, TerritoryId(2), 2);

        delegate.start(&mut bridge).unwrap();
        assert_eq!(delegate.battles().get(&BattleType::Normal).map(BTreeSet::len), Some(2));
        assert!(matches!(delegate.end(&mut bridge), Err(BattleError::Rejected(_))));
    }
}
