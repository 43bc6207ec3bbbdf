//! Defensive scrambling.
//!
//! Before any battle is fought the defender may fly scramble-capable air
//! from nearby airbases into pending battles. Scrambled units can create a
//! battle where there was none; sea battles created this way become
//! prerequisites of the amphibious assaults launched from them.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info};

use crate::battle::common::{determine_defender, territory_name};
use crate::battle::BattleType;
use crate::bridge::{Bridge, ScrambleSource};
use crate::change::{Change, UnitProperty};
use crate::delegate::StageProgress;
use crate::error::{BattleError, Result};
use crate::ids::{PlayerId, TerritoryId, UnitId};
use crate::matches;
use crate::route::Route;
use crate::state::GameState;
use crate::tracker::{AttackMove, BattleTracker};

/// Sites air may scramble into.
fn scramble_targets(tracker: &BattleTracker, state: &GameState) -> Result<BTreeSet<TerritoryId>> {
    let listing = tracker.pending_battle_listing();
    let mut types = vec![BattleType::Normal, BattleType::AirBattle];
    if state.rules.can_scramble_into_air_battles {
        types.extend([BattleType::AirRaid, BattleType::BombingRaid]);
    }
    let mut sites: BTreeSet<TerritoryId> = types
        .iter()
        .filter_map(|t| listing.get(t))
        .flatten()
        .copied()
        .collect();
    for battle in tracker.battles().filter(|b| !b.is_empty()) {
        sites.extend(battle.amphibious_attack_territories());
    }
    let mut targets = BTreeSet::new();
    for site in sites {
        if !state.rules.scramble_to_sea_only || state.territory(site)?.water {
            targets.insert(site);
        }
    }
    Ok(targets)
}

/// Scrambles still allowed from `territory` (None: unlimited).
fn airbase_allowance(state: &GameState, territory: TerritoryId, owner: PlayerId) -> Result<Option<u32>> {
    let mut total = 0;
    let mut any = false;
    for u in state.units_at_matching(territory, |u, t| {
        matches::is_airbase(u, t) && state.are_allied(u.owner, owner)
    })? {
        any = true;
        match state.unit_type(u)?.max_scramble_count {
            None => return Ok(None),
            Some(max) => total += max.saturating_sub(state.unit(u)?.launched),
        }
    }
    Ok(if any { Some(total) } else { Some(0) })
}

/// Airbases at `territory` able to launch `attacker`'s enemies' air.
fn sources_for(
    tracker: &BattleTracker,
    state: &GameState,
    site: TerritoryId,
    attacker: PlayerId,
    already: &BTreeSet<UnitId>,
) -> Result<BTreeMap<TerritoryId, ScrambleSource>> {
    let reach = state
        .unit_types
        .iter()
        .map(|(_, t)| t.max_scramble_distance)
        .max()
        .unwrap_or(0);
    let mut sources = BTreeMap::new();
    if reach == 0 {
        return Ok(sources);
    }
    for from in state.neighbors_within(site, reach)? {
        if from == site || tracker.pending_non_bombing_battle(from).is_some() {
            continue;
        }
        if state.rules.scramble_from_island_only && !state.is_island(from)? {
            continue;
        }
        let mut candidates = Vec::new();
        for u in state.units_at_matching(from, |u, t| {
            matches::can_scramble(u, t) && state.at_war(attacker, u.owner) && !already.contains(&u.id)
        })? {
            let t = state.unit_type(u)?;
            if state.neighbors_within(from, t.max_scramble_distance)?.contains(&site) {
                candidates.push(u);
            }
        }
        let Some(&first) = candidates.first() else {
            continue;
        };
        let owner = state.unit(first)?.owner;
        let max = match airbase_allowance(state, from, owner)? {
            None => u32::try_from(candidates.len()).unwrap_or(u32::MAX),
            Some(0) => continue,
            Some(n) => n,
        };
        sources.insert(from, ScrambleSource { max, candidates });
    }
    Ok(sources)
}

/// Check the defender's answer against what was offered.
fn validate(
    defender: PlayerId,
    sources: &BTreeMap<TerritoryId, ScrambleSource>,
    answer: &BTreeMap<TerritoryId, Vec<UnitId>>,
) -> Result<()> {
    for (from, units) in answer {
        let Some(source) = sources.get(from) else {
            error!(player = %defender, from = %from, "scramble from a territory that was not offered");
            return Err(BattleError::IllegalSelection {
                player: defender,
                message: format!("cannot scramble from {from}"),
            });
        };
        if units.iter().any(|u| !source.candidates.contains(u)) {
            error!(player = %defender, from = %from, "scrambled unit was not offered");
            return Err(BattleError::IllegalSelection {
                player: defender,
                message: format!("scrambled units from {from} were not offered"),
            });
        }
        if u32::try_from(units.len()).unwrap_or(u32::MAX) > source.max {
            error!(player = %defender, from = %from, max = source.max, "too many units scrambled");
            return Err(BattleError::IllegalSelection {
                player: defender,
                message: format!("trying to scramble {} out of {from}, max allowed is {}", units.len(), source.max),
            });
        }
    }
    Ok(())
}

/// Changes for `count` launches from the airbases at `from`.
fn use_allowance(state: &GameState, from: TerritoryId, owner: PlayerId, count: u32) -> Result<Vec<Change>> {
    let mut changes = Vec::new();
    let mut left = count;
    for u in state.units_at_matching(from, |u, t| matches::is_airbase(u, t) && state.are_allied(u.owner, owner))? {
        if left == 0 {
            break;
        }
        let Some(max) = state.unit_type(u)?.max_scramble_count else {
            continue;
        };
        let launched = state.unit(u)?.launched;
        let free = max.saturating_sub(launched);
        let used = free.min(left);
        if used > 0 {
            changes.push(Change::set(u, UnitProperty::Launched(launched + used)));
            left -= used;
        }
    }
    Ok(changes)
}

/// Ask defenders to scramble into every pending battle and apply the answers.
///
/// Sites recorded in `progress` were settled before a suspension and are
/// skipped.
pub fn do_scrambling(
    tracker: &mut BattleTracker,
    progress: &mut StageProgress,
    player: PlayerId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    if !bridge.state().rules.scramble_rules_in_effect {
        return Ok(());
    }
    let targets = scramble_targets(tracker, bridge.state())?;

    for site in targets {
        if progress.scramble_sites.contains(&site) {
            continue;
        }
        let sources = sources_for(tracker, bridge.state(), site, player, &progress.scrambled)?;
        if sources.is_empty() {
            continue;
        }
        let defender = {
            let state = bridge.state();
            let mut defender = None;
            if tracker.pending_non_bombing_battle(site).is_some() {
                defender = Some(determine_defender(state, site, player)?).filter(|&d| state.at_war(d, player));
            }
            if defender.is_none() {
                for from in sources.keys() {
                    let d = determine_defender(state, *from, player)?;
                    if state.at_war(d, player) {
                        defender = Some(d);
                        break;
                    }
                }
            }
            defender
        };
        let Some(defender) = defender else {
            continue;
        };

        let answer = bridge.remote().select_scramblers(defender, site, &sources)?;
        validate(defender, &sources, &answer)?;

        let mut scrambled_here = false;
        for (from, units) in answer {
            if units.is_empty() {
                continue;
            }
            let mut changes = {
                let state = bridge.state();
                let owner = state.unit(units[0])?.owner;
                use_allowance(state, from, owner, u32::try_from(units.len()).unwrap_or(u32::MAX))?
            };
            for &u in &units {
                changes.push(Change::set(u, UnitProperty::Origin(Some(from))));
                changes.push(Change::set(u, UnitProperty::Scrambled(true)));
            }
            changes.push(Change::move_units(&units, site));
            bridge.apply_change(Change::Composite(changes))?;
            bridge.history_event(
                format!(
                    "{} scrambles {} units out of {} to defend against the attack in {}",
                    bridge.state().player(defender)?.name,
                    units.len(),
                    territory_name(bridge.state(), from),
                    territory_name(bridge.state(), site)
                ),
                &units,
            );
            info!(site = %site, from = %from, count = units.len(), "units scrambled");
            progress.scrambled.extend(units);
            scrambled_here = true;
        }
        if scrambled_here {
            join_or_create_battle(tracker, player, defender, site, bridge)?;
        }
        progress.scramble_sites.insert(site);
    }
    Ok(())
}

/// Put scrambled units into the site's battle, opening one if needed.
fn join_or_create_battle(
    tracker: &mut BattleTracker,
    player: PlayerId,
    defender: PlayerId,
    site: TerritoryId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    if let Some(id) = tracker.pending_battle_id(site, BattleType::Normal) {
        tracker.battle_mut(id)?.reset_defending_units(bridge.state())?;
    } else {
        let mut attackers = bridge.state().units_at_matching(site, matches::owned_by(player))?;
        if let Some(raid) = tracker.pending_bombing_battle(site).and_then(|id| tracker.get_pending_battle_by_id(id)) {
            let raiders = raid.core().attacking_units();
            attackers.retain(|u| !raiders.contains(u));
        }
        if attackers.is_empty() {
            return Ok(());
        }
        bridge.history_event(
            format!(
                "{} scrambles to create a battle in territory {}",
                bridge.state().player(defender)?.name,
                territory_name(bridge.state(), site)
            ),
            &[],
        );
        tracker.add_battle(
            &AttackMove::new(Route::scripted(site), attackers, player).air_battle_completed(),
            bridge,
        )?;
    }

    let Some(battle) = tracker.pending_battle_id(site, BattleType::Normal) else {
        return Ok(());
    };
    if !bridge.state().territory(site)?.water {
        return Ok(());
    }
    let land: Vec<TerritoryId> = {
        let state = bridge.state();
        let mut land = Vec::new();
        for &n in state.neighbors(site)? {
            if !state.territory(n)?.water {
                land.push(n);
            }
        }
        land
    };
    for n in land {
        let Some(adjacent) = tracker.pending_battle_id(n, BattleType::Normal) else {
            continue;
        };
        let from_here = tracker
            .get_pending_battle_by_id(adjacent)
            .is_some_and(|b| b.is_amphibious() && b.amphibious_attack_territories().contains(&site));
        if from_here {
            debug!(blocked = %adjacent, blocking = %battle, "amphibious assault waits on scrambled sea battle");
            tracker.add_dependency(adjacent, battle)?;
        }
        tracker.battle_mut(adjacent)?.reset_defending_units(bridge.state())?;
    }
    Ok(())
}

/// Return scrambled air home, or leave it where it fought.
pub fn scrambling_cleanup(bridge: &mut dyn Bridge) -> Result<()> {
    if !bridge.state().rules.scramble_rules_in_effect {
        return Ok(());
    }
    let must_return = bridge.state().rules.scrambled_units_return_to_base;
    let scrambled: Vec<UnitId> = bridge.state().units().filter(|u| u.was_scrambled).map(|u| u.id).collect();
    for u in scrambled {
        let (home, at, owner) = {
            let unit = bridge.state().unit(u)?;
            (unit.scramble_origin, unit.location, unit.owner)
        };
        let home = home.filter(|&h| {
            must_return
                && h != at
                && bridge
                    .state()
                    .territory(h)
                    .is_ok_and(|t| t.owner.is_some_and(|o| bridge.state().are_allied(o, owner)))
        });
        let mut changes = vec![
            Change::set(u, UnitProperty::Origin(None)),
            Change::set(u, UnitProperty::Scrambled(false)),
        ];
        let text = match home {
            Some(h) => {
                changes.push(Change::move_units(&[u], h));
                format!(
                    "Moving scrambled unit from {} back to originating territory: {}",
                    territory_name(bridge.state(), at),
                    territory_name(bridge.state(), h)
                )
            }
            None => format!("Scrambled unit stays in territory {}", territory_name(bridge.state(), at)),
        };
        bridge.history_event(text, &[u]);
        bridge.apply_change(Change::Composite(changes))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{LocalBridge, RemotePlayer};
    use crate::data::{Domain, UnitTrait, UnitType, UnitTypeRegistry};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    #[derive(Debug, Default)]
    struct Greedy {
        overshoot: bool,
    }

    impl RemotePlayer for Greedy {
        fn select_scramblers(
            &mut self,
            _player: PlayerId,
            _site: TerritoryId,
            sources: &BTreeMap<TerritoryId, ScrambleSource>,
        ) -> Result<BTreeMap<TerritoryId, Vec<UnitId>>> {
            Ok(sources
                .iter()
                .map(|(t, s)| {
                    let take = if self.overshoot { s.candidates.len() } else { s.max as usize };
                    (*t, s.candidates.iter().copied().take(take).collect())
                })
                .collect())
        }
    }

    /// Sends one unit per source and can stall once at a chosen site.
    #[derive(Debug, Default)]
    struct OneEach {
        asked: Vec<TerritoryId>,
        stall_at: Option<TerritoryId>,
    }

    impl RemotePlayer for OneEach {
        fn select_scramblers(
            &mut self,
            player: PlayerId,
            site: TerritoryId,
            sources: &BTreeMap<TerritoryId, ScrambleSource>,
        ) -> Result<BTreeMap<TerritoryId, Vec<UnitId>>> {
            self.asked.push(site);
            if self.stall_at == Some(site) {
                self.stall_at = None;
                return Err(BattleError::Suspended(player));
            }
            Ok(sources.iter().map(|(t, s)| (*t, s.candidates[..1].to_vec())).collect())
        }
    }

    fn create_test_bridge<R: RemotePlayer>(remote: R) -> LocalBridge<R> {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        types.register(UnitType::new("destroyer", Domain::Sea, 8, 2, 2));
        let mut fighter = UnitType::new("fighter", Domain::Air, 10, 3, 4).with_trait(UnitTrait::Scrambler);
        fighter.max_scramble_distance = 1;
        types.register(fighter);
        let mut airfield = UnitType::new("airfield", Domain::Land, 12, 0, 0)
            .with_trait(UnitTrait::Airbase)
            .with_trait(UnitTrait::Infrastructure);
        airfield.max_scramble_count = Some(1);
        types.register(airfield);
        let rules = BattleRules {
            scramble_rules_in_effect: true,
            scrambled_units_return_to_base: true,
            ..BattleRules::default()
        };
        let mut state = GameState::new(rules, types);
        state.add_territory(Territory::new(TerritoryId(0), "Island", false));
        state.add_territory(Territory::new(TerritoryId(1), "Bay", true));
        state.connect(TerritoryId(0), TerritoryId(1)).unwrap();
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.territory_mut(TerritoryId(0)).unwrap().owner = Some(PlayerId(1));
        state.current_player = Some(PlayerId(0));
        LocalBridge::new(state, 5, remote)
    }

    fn setup_sea_battle<R: RemotePlayer>(bridge: &mut LocalBridge<R>, tracker: &mut BattleTracker) -> Vec<UnitId> {
        bridge.state_mut().spawn_unit("airfield", PlayerId(1), TerritoryId(0)).unwrap();
        let fighters = vec![
            bridge.state_mut().spawn_unit("fighter", PlayerId(1), TerritoryId(0)).unwrap(),
            bridge.state_mut().spawn_unit("fighter", PlayerId(1), TerritoryId(0)).unwrap(),
        ];
        bridge.state_mut().spawn_unit("destroyer", PlayerId(1), TerritoryId(1)).unwrap();
        let ship = bridge.state_mut().spawn_unit("destroyer", PlayerId(0), TerritoryId(1)).unwrap();
        tracker
            .add_battle(&AttackMove::new(Route::scripted(TerritoryId(1)), vec![ship], PlayerId(0)), bridge)
            .unwrap();
        fighters
    }

    #[test]
    fn test_scramble_limited_by_airbase() {
        let mut bridge = create_test_bridge(Greedy::default());
        let mut tracker = BattleTracker::new();
        let fighters = setup_sea_battle(&mut bridge, &mut tracker);

        do_scrambling(&mut tracker, &mut StageProgress::default(), PlayerId(0), &mut bridge).unwrap();
        let moved = bridge.state().unit(fighters[0]).unwrap();
        assert_eq!(moved.location, TerritoryId(1));
        assert!(moved.was_scrambled);
        assert_eq!(moved.scramble_origin, Some(TerritoryId(0)));
        assert_eq!(bridge.state().unit(fighters[1]).unwrap().location, TerritoryId(0));
        let battle = tracker.get_pending_battle(TerritoryId(1), BattleType::Normal).unwrap();
        assert!(battle.core().defending_units().contains(&fighters[0]));
    }

    #[test]
    fn test_scramble_over_allowance_is_fatal() {
        let mut bridge = create_test_bridge(Greedy { overshoot: true });
        let mut tracker = BattleTracker::new();
        setup_sea_battle(&mut bridge, &mut tracker);

        let err = do_scrambling(&mut tracker, &mut StageProgress::default(), PlayerId(0), &mut bridge).unwrap_err();
        assert!(matches!(err, BattleError::IllegalSelection { .. }));
    }

    #[test]
    fn test_cleanup_returns_to_base() {
        let mut bridge = create_test_bridge(Greedy::default());
        let mut tracker = BattleTracker::new();
        let fighters = setup_sea_battle(&mut bridge, &mut tracker);
        do_scrambling(&mut tracker, &mut StageProgress::default(), PlayerId(0), &mut bridge).unwrap();

        scrambling_cleanup(&mut bridge).unwrap();
        let home = bridge.state().unit(fighters[0]).unwrap();
        assert_eq!(home.location, TerritoryId(0));
        assert!(!home.was_scrambled);
        assert_eq!(home.scramble_origin, None);
    }

    #[test]
    fn test_resumed_scramble_skips_settled_sites() {
        let mut bridge = create_test_bridge(OneEach {
            stall_at: Some(TerritoryId(2)),
            ..OneEach::default()
        });
        let mut tracker = BattleTracker::new();
        let fighters = setup_sea_battle(&mut bridge, &mut tracker);
        {
            let state = bridge.state_mut();
            state.add_territory(Territory::new(TerritoryId(2), "Cove", true));
            state.connect(TerritoryId(0), TerritoryId(2)).unwrap();
            state.spawn_unit("airfield", PlayerId(1), TerritoryId(0)).unwrap();
            state.spawn_unit("destroyer", PlayerId(1), TerritoryId(2)).unwrap();
        }
        let ship = bridge.state_mut().spawn_unit("destroyer", PlayerId(0), TerritoryId(2)).unwrap();
        tracker
            .add_battle(&AttackMove::new(Route::scripted(TerritoryId(2)), vec![ship], PlayerId(0)), &mut bridge)
            .unwrap();
        let mut progress = StageProgress::default();

        let err = do_scrambling(&mut tracker, &mut progress, PlayerId(0), &mut bridge).unwrap_err();
        assert!(err.is_suspension());
        assert!(progress.scramble_sites.contains(&TerritoryId(1)));
        assert_eq!(progress.scrambled, BTreeSet::from([fighters[0]]));

        do_scrambling(&mut tracker, &mut progress, PlayerId(0), &mut bridge).unwrap();

        assert_eq!(bridge.remote_mut().asked, vec![TerritoryId(1), TerritoryId(2), TerritoryId(2)]);
        assert_eq!(bridge.state().unit(fighters[0]).unwrap().location, TerritoryId(1));
        assert_eq!(bridge.state().unit(fighters[1]).unwrap().location, TerritoryId(2));
        let cove = tracker.get_pending_battle(TerritoryId(2), BattleType::Normal).unwrap();
        assert!(cove.core().defending_units().contains(&fighters[1]));
    }
}
