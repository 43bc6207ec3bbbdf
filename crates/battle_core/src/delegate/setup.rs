//! Start-of-phase battle setup.
//!
//! Battles that no move reported: units sharing a territory with enemies
//! (emerging subs, units placed into contested sea zones) and territories
//! the player abandoned to enemy units during combat movement.

use std::collections::BTreeMap;

use tracing::{debug, error, info};

use crate::battle::common::territory_name;
use crate::battle::{Battle, BattleResultDescription, BattleType, WhoWon};
use crate::bridge::Bridge;
use crate::change::{Change, UnitProperty};
use crate::error::{BattleError, Result};
use crate::ids::{PlayerId, TerritoryId, UnitId};
use crate::matches;
use crate::route::Route;
use crate::state::GameState;
use crate::tracker::{AttackMove, BattleTracker};

/// First stage of the phase.
pub fn initialize(tracker: &mut BattleTracker, player: PlayerId, bridge: &mut dyn Bridge) -> Result<()> {
    setup_units_in_same_territory_battles(tracker, player, bridge)?;
    setup_territories_abandoned_to_the_enemy(tracker, player, bridge)?;
    tracker.clear_finished_battles(bridge)?;
    reset_max_scramble_count(bridge)
}

/// Units of `player` at `territory` plus the cargo they carry.
fn attackers_with_cargo(state: &GameState, player: PlayerId, territory: TerritoryId) -> Result<Vec<UnitId>> {
    let mut units = state.units_at_matching(territory, matches::owned_by(player))?;
    let cargo = state.units_at_matching(territory, matches::transported_by_any(&units))?;
    for u in cargo {
        if !units.contains(&u) {
            units.push(u);
        }
    }
    Ok(units)
}

/// Both sides field units that cannot do any damage.
fn is_stalemate(state: &GameState, attackers: &[UnitId], enemies: &[UnitId]) -> Result<bool> {
    if attackers.is_empty() || enemies.is_empty() {
        return Ok(false);
    }
    let sea_transport = |_: &crate::state::Unit, t: &crate::data::UnitType| t.is_sea() && t.is_non_combat_transport();
    if state.rules.ignore_transport_in_movement
        && state.all_units(attackers, sea_transport)?
        && state.all_units(enemies, sea_transport)?
    {
        return Ok(true);
    }
    Ok(state.all_units(attackers, |_, t| t.strength(false) == 0)?
        && state.all_units(enemies, |_, t| t.strength(true) == 0)?)
}

/// Open battles where `player` already shares a territory with enemies.
pub fn setup_units_in_same_territory_battles(
    tracker: &mut BattleTracker,
    player: PlayerId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    let sites: Vec<TerritoryId> = {
        let state = bridge.state();
        let mut sites = Vec::new();
        for t in state.territories() {
            let own = state.units_at_matching(t.id, matches::owned_by(player))?;
            if own.is_empty() {
                continue;
            }
            let enemy_territory = !(t.water && t.owner.is_none()) && state.is_enemy_territory(player, t.id)?;
            if state.has_enemy_units(player, t.id) || enemy_territory {
                sites.push(t.id);
            }
        }
        sites
    };

    for site in sites {
        let (mut attackers, enemies, water) = {
            let state = bridge.state();
            let attackers = attackers_with_cargo(state, player, site)?;
            let enemies = state.units_at_matching(site, matches::enemy_of(state, player))?;
            (attackers, enemies, state.territory(site)?.water)
        };
        let bombing = tracker.pending_bombing_battle(site);
        if let Some(raid) = bombing.and_then(|id| tracker.get_pending_battle_by_id(id)) {
            let raiders = raid.core().attacking_units().to_vec();
            attackers.retain(|u| !raiders.contains(u));
        }
        if bridge.state().all_units(&attackers, matches::is_infrastructure)? {
            continue;
        }

        if tracker.pending_battle_id(site, BattleType::Normal).is_none() {
            bridge.history_event(
                format!(
                    "{} creates battle in territory {}",
                    bridge.state().player(player)?.name,
                    territory_name(bridge.state(), site)
                ),
                &attackers,
            );
            tracker.add_battle(&AttackMove::new(Route::scripted(site), attackers.clone(), player), bridge)?;
        }
        let Some(id) = tracker.pending_battle_id(site, BattleType::Normal) else {
            continue;
        };
        if let Some(raid) = bombing {
            tracker.add_dependency(id, raid)?;
        }

        let missing: Vec<UnitId> = {
            let state = bridge.state();
            let battle = tracker.battle_mut(id)?;
            let joined = battle.core().attacking_units().to_vec();
            let carried = battle.core().dependents_of(&joined, state);
            let candidates: Vec<UnitId> = attackers
                .iter()
                .copied()
                .filter(|u| !joined.contains(u) && !carried.contains(u))
                .collect();
            if water {
                state.filter_units(&candidates, matches::is_not_land)?
            } else {
                state.filter_units(&candidates, |_, t| !t.is_sea())?
            }
        };
        if !missing.is_empty() {
            let join = AttackMove::new(Route::scripted(site), missing, player);
            tracker.battle_mut(id)?.add_attack(&join, bridge)?;
        }

        let stalemate = matches!(tracker.get_pending_battle_by_id(id), Some(Battle::Fought(_)))
            && is_stalemate(bridge.state(), &attackers, &enemies)?;
        if stalemate {
            info!(battle = %id, site = %site, "no side can do damage; stalemate");
            tracker.with_battle(id, |battle, tracker| {
                battle.core_mut().finish(WhoWon::Draw, BattleResultDescription::Stalemate, tracker, bridge)
            })?;
        }
    }
    Ok(())
}

/// Hand territories the player walked out of to the enemy units inside.
pub fn setup_territories_abandoned_to_the_enemy(
    tracker: &mut BattleTracker,
    player: PlayerId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    if !bridge.state().rules.abandoned_territories_may_be_taken_over {
        return Ok(());
    }
    let candidates: Vec<TerritoryId> = bridge
        .state()
        .territories()
        .filter(|t| !(t.water && t.owner.is_none()))
        .map(|t| t.id)
        .collect();

    for site in candidates {
        let (abandoned_to, units) = {
            let state = bridge.state();
            let Some(owner) = state.territory(site)?.owner else {
                continue;
            };
            let capturers = state.units_at_matching(site, |u, t| {
                state.at_war(player, u.owner) && state.at_war(owner, u.owner) && t.is_land() && !t.is_infrastructure()
            })?;
            if capturers.is_empty() {
                continue;
            }
            let mut counts: BTreeMap<PlayerId, usize> = BTreeMap::new();
            let mut units = Vec::new();
            for u in state.units_at_matching(site, matches::enemy_of(state, player))? {
                *counts.entry(state.unit(u)?.owner).or_default() += 1;
                units.push(u);
            }
            let cargo = state.units_at_matching(site, matches::transported_by_any(&units))?;
            for u in cargo {
                if !units.contains(&u) {
                    units.push(u);
                }
            }
            let Some(abandoned_to) = counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(p, _)| *p)
            else {
                continue;
            };

            let mut opposing = state.units_at_matching(site, |u, t| {
                units.iter().any(|&c| state.unit(c).is_ok_and(|cu| state.at_war(cu.owner, u.owner)))
                    && !t.is_air()
                    && !t.is_infrastructure()
            })?;
            if let Some(raid) = tracker.pending_bombing_battle(site).and_then(|id| tracker.get_pending_battle_by_id(id)) {
                let raiders = raid.core().attacking_units();
                opposing.retain(|u| !raiders.contains(u));
            }
            if !opposing.is_empty() {
                continue;
            }
            (abandoned_to, units)
        };

        if tracker.pending_battle_id(site, BattleType::Normal).is_some() {
            error!(site = %site, "abandoned territory also has a normal battle");
            return Err(BattleError::InvariantViolation(format!(
                "{} was abandoned while a battle is pending there",
                territory_name(bridge.state(), site)
            )));
        }
        bridge.history_event(
            format!(
                "{} has abandoned {} to {}",
                bridge.state().player(player)?.name,
                territory_name(bridge.state(), site),
                bridge.state().player(abandoned_to)?.name
            ),
            &units,
        );
        debug!(site = %site, to = %abandoned_to, "territory abandoned");
        tracker.take_over(site, abandoned_to, &units, bridge)?;
    }
    Ok(())
}

/// Give every airbase its full scramble allowance back.
pub fn reset_max_scramble_count(bridge: &mut dyn Bridge) -> Result<()> {
    if !bridge.state().rules.scramble_rules_in_effect {
        return Ok(());
    }
    let changes: Vec<Change> = bridge
        .state()
        .units()
        .filter(|u| u.launched > 0)
        .map(|u| Change::set(u.id, UnitProperty::Launched(0)))
        .collect();
    if !changes.is_empty() {
        bridge.history_event("Preparing airbases for possible scrambling".into(), &[]);
        bridge.apply_change(Change::Composite(changes))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{AutoPlayer, LocalBridge};
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    fn create_test_bridge(rules: BattleRules) -> LocalBridge<AutoPlayer> {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("infantry", Domain::Land, 3, 1, 2));
        types.register(UnitType::new("destroyer", Domain::Sea, 8, 2, 2));
        types.register(UnitType::new("transport", Domain::Sea, 7, 0, 0));
        let mut state = GameState::new(rules, types);
        state.add_territory(Territory::new(TerritoryId(0), "Coast", false));
        state.add_territory(Territory::new(TerritoryId(1), "Strait", true));
        state.connect(TerritoryId(0), TerritoryId(1)).unwrap();
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        state.add_player(Player::new(PlayerId(1), "Blue", 1));
        state.territory_mut(TerritoryId(0)).unwrap().owner = Some(PlayerId(1));
        state.current_player = Some(PlayerId(0));
        LocalBridge::auto(state, 3)
    }

    #[test]
    fn test_shared_sea_zone_opens_battle() {
        let mut bridge = create_test_bridge(BattleRules::default());
        let own = bridge.state_mut().spawn_unit("destroyer", PlayerId(0), TerritoryId(1)).unwrap();
        bridge.state_mut().spawn_unit("destroyer", PlayerId(1), TerritoryId(1)).unwrap();
        let mut tracker = BattleTracker::new();

        setup_units_in_same_territory_battles(&mut tracker, PlayerId(0), &mut bridge).unwrap();
        let battle = tracker.get_pending_battle(TerritoryId(1), BattleType::Normal).unwrap();
        assert_eq!(battle.core().attacking_units(), &[own]);
        assert!(bridge.history().iter().any(|h| h.text.contains("creates battle")));
    }

    #[test]
    fn test_harmless_fleets_end_in_stalemate() {
        let mut bridge = create_test_bridge(BattleRules::default());
        bridge.state_mut().spawn_unit("transport", PlayerId(0), TerritoryId(1)).unwrap();
        bridge.state_mut().spawn_unit("transport", PlayerId(1), TerritoryId(1)).unwrap();
        let mut tracker = BattleTracker::new();

        setup_units_in_same_territory_battles(&mut tracker, PlayerId(0), &mut bridge).unwrap();
        assert!(tracker.get_pending_battle(TerritoryId(1), BattleType::Normal).is_none());
        let record = tracker.records.iter().next().unwrap();
        assert_eq!(record.result, Some(BattleResultDescription::Stalemate));
        assert_eq!(record.who_won, WhoWon::Draw);
    }

    #[test]
    fn test_abandoned_territory_taken_by_enemy_units() {
        let rules = BattleRules {
            abandoned_territories_may_be_taken_over: true,
            ..BattleRules::default()
        };
        let mut bridge = create_test_bridge(rules);
        bridge.state_mut().territory_mut(TerritoryId(0)).unwrap().owner = Some(PlayerId(0));
        bridge.state_mut().spawn_unit("infantry", PlayerId(1), TerritoryId(0)).unwrap();
        let mut tracker = BattleTracker::new();

        setup_territories_abandoned_to_the_enemy(&mut tracker, PlayerId(0), &mut bridge).unwrap();
        assert_eq!(bridge.state().territory(TerritoryId(0)).unwrap().owner, Some(PlayerId(1)));
    }

    #[test]
    fn test_scramble_allowance_reset() {
        let rules = BattleRules {
            scramble_rules_in_effect: true,
            ..BattleRules::default()
        };
        let mut bridge = create_test_bridge(rules);
        let base = bridge.state_mut().spawn_unit("infantry", PlayerId(0), TerritoryId(0)).unwrap();
        bridge.state_mut().unit_mut(base).unwrap().launched = 2;

        reset_max_scramble_count(&mut bridge).unwrap();
        assert_eq!(bridge.state().unit(base).unwrap().launched, 0);
    }
}
