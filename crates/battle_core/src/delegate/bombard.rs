//! Shore bombardment assignment.
//!
//! Ships of the attacker sitting in a sea zone an amphibious assault was
//! launched from may bombard that assault. Each ship is assigned to one
//! battle before fighting starts.

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::battle::{Battle, BattleType};
use crate::bridge::Bridge;
use crate::delegate::StageProgress;
use crate::error::{BattleError, Result};
use crate::ids::{BattleId, PlayerId, TerritoryId, UnitId};
use crate::matches;
use crate::state::GameState;
use crate::tracker::BattleTracker;

/// Sea zones that amphibious assaults came from, with those assaults.
fn possible_bombarding_territories(
    tracker: &BattleTracker,
    state: &GameState,
) -> Result<BTreeMap<TerritoryId, Vec<BattleId>>> {
    let mut possible: BTreeMap<TerritoryId, Vec<BattleId>> = BTreeMap::new();
    for id in tracker.pending_battles(BattleType::Normal) {
        let Some(Battle::Fought(battle)) = tracker.get_pending_battle_by_id(id) else {
            continue;
        };
        let dependent = battle.dependent();
        if !dependent.is_amphibious() {
            continue;
        }
        for from in dependent.attacking_from() {
            if tracker.no_bombard_allowed_from(from) {
                continue;
            }
            let arrived = dependent.attacking_from_map().get(&from).map(Vec::as_slice).unwrap_or_default();
            if !arrived.is_empty() && state.all_units(arrived, matches::is_air)? {
                continue;
            }
            possible.entry(from).or_default().push(id);
        }
    }
    Ok(possible)
}

/// Battle has room for another bombarding ship.
fn has_bombard_room(battle: &Battle, restricted: bool) -> bool {
    !restricted || battle.bombarding_units().len() < battle.amphibious_land_attackers().len()
}

/// Assign `player`'s bombard-capable ships to amphibious assaults.
///
/// Ships in `progress` were assigned or declined before a suspension.
pub fn add_bombardment_sources(
    tracker: &mut BattleTracker,
    progress: &mut StageProgress,
    player: PlayerId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    let restricted = bridge.state().rules.shore_bombard_per_ground_unit_restricted;
    let possible = possible_bombarding_territories(tracker, bridge.state())?;

    for (from, mut battles) in possible {
        if tracker.pending_non_bombing_battle(from).is_some() || battles.is_empty() {
            continue;
        }
        let ships: Vec<UnitId> = {
            let state = bridge.state();
            let mut ships = state.units_at_matching(from, |u, t| u.owner == player && matches::can_bombard(u, t))?;
            let mut keyed = Vec::with_capacity(ships.len());
            for u in ships.drain(..) {
                let t = state.unit_type(u)?;
                keyed.push((t.bombard.unwrap_or(t.attack), u));
            }
            keyed.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
            keyed.into_iter().map(|(_, u)| u).collect()
        };

        for ship in ships {
            if progress.bombard_ships.contains(&ship) {
                continue;
            }
            let Some(chosen) = select_bombarding_battle(tracker, player, ship, &battles, restricted, bridge)? else {
                progress.bombard_ships.insert(ship);
                continue;
            };
            let battle = tracker.battle_mut(chosen)?;
            if !has_bombard_room(battle, restricted) {
                battles.retain(|&b| b != chosen);
                break;
            }
            battle.add_bombarding_unit(ship);
            tracker.add_bombarded_from(from);
            progress.bombard_ships.insert(ship);
            debug!(battle = %chosen, %ship, from = %from, "ship assigned to bombard");
        }
    }
    Ok(())
}

/// Battle `ship` bombards, or `None` when the attacker declines.
fn select_bombarding_battle(
    tracker: &BattleTracker,
    player: PlayerId,
    ship: UnitId,
    battles: &[BattleId],
    restricted: bool,
    bridge: &mut dyn Bridge,
) -> Result<Option<BattleId>> {
    if let [only] = battles {
        return Ok(Some(*only));
    }
    let options: Vec<BattleId> = battles
        .iter()
        .copied()
        .filter(|id| {
            tracker
                .get_pending_battle_by_id(*id)
                .is_some_and(|b| has_bombard_room(b, restricted))
        })
        .collect();
    if options.is_empty() {
        return Ok(None);
    }
    match bridge.remote().select_bombarding_battle(player, ship, &options)? {
        Some(id) if options.contains(&id) => Ok(Some(id)),
        Some(id) => {
            error!(player = %player, battle = %id, "bombarding battle was not offered");
            Err(BattleError::IllegalSelection {
                player,
                message: format!("{ship} cannot bombard {id}"),
            })
        }
        None => Ok(None),
    }
}
