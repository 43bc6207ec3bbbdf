//! Kamikaze strikes.
//!
//! Enemies of the player on turn spend kamikaze tokens against the
//! player's ships in their kamikaze zones. Each strike is rolled at once,
//! outside any battle, and forbids bombardment from the struck zone.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use crate::battle::common::{territory_name, units_to_text};
use crate::battle::BattleType;
use crate::bridge::{Bridge, SoundClip};
use crate::change::{Change, Resource, UnitProperty};
use crate::delegate::StageProgress;
use crate::error::{BattleError, Result};
use crate::ids::{PlayerId, TerritoryId, UnitId};
use crate::state::GameState;
use crate::tracker::BattleTracker;

/// Units of `player` a kamikaze token may target.
fn is_target(state: &GameState, player: PlayerId, unit: UnitId) -> Result<bool> {
    let u = state.unit(unit)?;
    if u.owner != player {
        return Ok(false);
    }
    let t = state.unit_type(unit)?;
    if state.rules.kamikaze_targets.is_empty() {
        Ok(t.is_sea() && !t.is_non_combat_transport() && !t.is_sub())
    } else {
        Ok(state.rules.kamikaze_targets.iter().any(|n| *n == t.name))
    }
}

/// An amphibious assault launched from `zone` is pending or was won.
fn amphibious_from(tracker: &BattleTracker, state: &GameState, zone: TerritoryId) -> Result<bool> {
    for &n in state.neighbors(zone)? {
        if state.territory(n)?.water {
            continue;
        }
        match tracker.get_pending_battle(n, BattleType::Normal) {
            Some(b) => {
                if b.is_amphibious() && b.amphibious_attack_territories().contains(&zone) {
                    return Ok(true);
                }
            }
            None => {
                if tracker.finished_attack_from(n).is_some_and(|from| from.contains_key(&zone)) {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Kamikaze zones per enemy of `player`.
fn kamikaze_zones(tracker: &BattleTracker, state: &GameState, player: PlayerId) -> Result<BTreeMap<PlayerId, Vec<TerritoryId>>> {
    let pending = tracker.pending_battle_sites(false);
    let mut zones: BTreeMap<PlayerId, Vec<TerritoryId>> = BTreeMap::new();
    for t in state.territories().filter(|t| t.kamikaze_zone) {
        let Some(owner) = t.original_owner else {
            continue;
        };
        if !state.at_war(player, owner) {
            continue;
        }
        if state.units_at(t.id).iter().all(|&u| state.unit(u).is_ok_and(|u| u.owner != player)) {
            continue;
        }
        if state.rules.kamikaze_only_where_battles_are
            && !pending.contains(&t.id)
            && !(t.water && amphibious_from(tracker, state, t.id)?)
        {
            continue;
        }
        zones.entry(owner).or_default().push(t.id);
    }
    Ok(zones)
}

/// Let every enemy spend its tokens and resolve the strikes.
///
/// Enemies already in `progress` are not asked again.
pub fn do_kamikaze_attacks(
    tracker: &mut BattleTracker,
    progress: &mut StageProgress,
    player: PlayerId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    if !bridge.state().rules.use_kamikaze_suicide_attacks {
        return Ok(());
    }
    let zones = kamikaze_zones(tracker, bridge.state(), player)?;
    for (enemy, zones) in zones {
        if progress.kamikaze_players.contains(&enemy) {
            continue;
        }
        let (tokens, power) = {
            let p = bridge.state().player(enemy)?;
            (p.kamikaze_tokens, p.kamikaze_power)
        };
        if tokens == 0 || power == 0 {
            continue;
        }
        let targets: BTreeMap<TerritoryId, Vec<UnitId>> = {
            let state = bridge.state();
            let mut targets = BTreeMap::new();
            for zone in zones {
                let mut valid = Vec::new();
                for u in state.units_at(zone) {
                    if is_target(state, player, u)? {
                        valid.push(u);
                    }
                }
                if !valid.is_empty() {
                    targets.insert(zone, valid);
                }
            }
            targets
        };
        if targets.is_empty() {
            continue;
        }
        let attacks = bridge.remote().select_kamikaze_attacks(enemy, &targets, tokens)?;
        let spent: u32 = attacks.values().sum();
        if spent > tokens {
            error!(player = %enemy, spent, tokens, "kamikaze attack overspends tokens");
            return Err(BattleError::IllegalSelection {
                player: enemy,
                message: format!("spent {spent} kamikaze tokens but holds {tokens}"),
            });
        }
        let offered: BTreeSet<UnitId> = targets.values().flatten().copied().collect();
        if let Some(bad) = attacks.keys().find(|u| !offered.contains(u)) {
            error!(player = %enemy, unit = %bad, "kamikaze attack on a unit that was not offered");
            return Err(BattleError::IllegalSelection {
                player: enemy,
                message: format!("{bad} is not a kamikaze target"),
            });
        }
        for (unit, count) in attacks {
            if count == 0 {
                continue;
            }
            let Some(zone) = targets.iter().find(|(_, units)| units.contains(&unit)).map(|(z, _)| *z) else {
                continue;
            };
            fire_kamikaze_attack(tracker, enemy, player, unit, count, power, zone, bridge)?;
        }
        progress.kamikaze_players.insert(enemy);
    }
    Ok(())
}

/// Roll `count` tokens of `power` against one unit.
fn fire_kamikaze_attack(
    tracker: &mut BattleTracker,
    enemy: PlayerId,
    player: PlayerId,
    unit: UnitId,
    count: u32,
    power: u32,
    zone: TerritoryId,
    bridge: &mut dyn Bridge,
) -> Result<()> {
    let sides = bridge.state().rules.dice_sides;
    let name = bridge.state().unit_type(unit)?.name.clone();
    let annotation = format!("Rolling for kamikaze attack on unit: {name}");
    let (hits, dice) = if bridge.state().rules.low_luck {
        let total = count * power;
        let mut hits = total / sides;
        let remainder = total % sides;
        let mut dice = Vec::new();
        if remainder > 0 {
            dice = bridge.roll_dice(sides, 1, enemy, &annotation)?;
            if dice.first().is_some_and(|&d| d < remainder) {
                hits += 1;
            }
        }
        (hits, dice)
    } else {
        let dice = bridge.roll_dice(sides, count, enemy, &annotation)?;
        let hits = u32::try_from(dice.iter().filter(|&&d| d < power).count()).unwrap_or(u32::MAX);
        (hits, dice)
    };

    let title = format!(
        "Kamikaze attack on {} scoring {hits} hits. Rolls: {dice:?}",
        units_to_text(bridge.state(), &[unit])
    );
    bridge.history_event(title, &[unit]);
    bridge.play_sound(SoundClip::Kamikaze, player);

    let mut changes = vec![Change::ChangeResource {
        player: enemy,
        resource: Resource::KamikazeTokens,
        delta: -i64::from(count),
    }];
    if hits > 0 {
        let current = bridge.state().unit(unit)?.hits;
        let hit_points = bridge.state().unit_type(unit)?.hit_points;
        if current + hits >= hit_points {
            changes.push(Change::remove_units(&[unit]));
        } else {
            changes.push(Change::set(unit, UnitProperty::Hits(current + hits)));
        }
    }
    bridge.apply_change(Change::Composite(changes))?;
    tracker.add_no_bombard_allowed(zone);
    debug!(zone = %territory_name(bridge.state(), zone), %unit, hits, "kamikaze attack resolved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{LocalBridge, RemotePlayer};
    use crate::data::{Domain, UnitType, UnitTypeRegistry};
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};

    #[derive(Debug)]
    struct AllIn;

    impl RemotePlayer for AllIn {
        fn select_kamikaze_attacks(
            &mut self,
            _player: PlayerId,
            targets: &BTreeMap<TerritoryId, Vec<UnitId>>,
            tokens: u32,
        ) -> Result<BTreeMap<UnitId, u32>> {
            Ok(targets.values().flatten().take(1).map(|&u| (u, tokens)).collect())
        }
    }

    fn create_test_bridge(low_luck: bool) -> (LocalBridge<AllIn>, UnitId) {
        let mut types = UnitTypeRegistry::new();
        let mut battleship = UnitType::new("battleship", Domain::Sea, 20, 4, 4);
        battleship.hit_points = 2;
        types.register(battleship);
        let rules = BattleRules {
            use_kamikaze_suicide_attacks: true,
            low_luck,
            ..BattleRules::default()
        };
        let mut state = GameState::new(rules, types);
        let mut zone = Territory::new(TerritoryId(0), "Home Waters", true);
        zone.kamikaze_zone = true;
        zone.original_owner = Some(PlayerId(1));
        state.add_territory(zone);
        state.add_player(Player::new(PlayerId(0), "Red", 0));
        let mut blue = Player::new(PlayerId(1), "Blue", 1);
        blue.kamikaze_tokens = 3;
        blue.kamikaze_power = 2;
        state.add_player(blue);
        state.current_player = Some(PlayerId(0));
        let ship = state.spawn_unit("battleship", PlayerId(0), TerritoryId(0)).unwrap();
        (LocalBridge::new(state, 9, AllIn), ship)
    }

    #[test]
    fn test_tokens_spent_and_ship_sunk() {
        let (mut bridge, ship) = create_test_bridge(false);
        bridge.queue_dice([0, 1, 5]);
        let mut tracker = BattleTracker::new();

        do_kamikaze_attacks(&mut tracker, &mut StageProgress::default(), PlayerId(0), &mut bridge).unwrap();
        assert!(!bridge.state().has_unit(ship));
        assert_eq!(bridge.state().player(PlayerId(1)).unwrap().kamikaze_tokens, 0);
        assert!(tracker.no_bombard_allowed_from(TerritoryId(0)));
    }

    #[test]
    fn test_single_hit_damages() {
        let (mut bridge, ship) = create_test_bridge(false);
        bridge.queue_dice([0, 4, 5]);
        let mut tracker = BattleTracker::new();

        do_kamikaze_attacks(&mut tracker, &mut StageProgress::default(), PlayerId(0), &mut bridge).unwrap();
        assert_eq!(bridge.state().unit(ship).unwrap().hits, 1);
    }

    #[test]
    fn test_low_luck_guaranteed_hit() {
        let (mut bridge, ship) = create_test_bridge(true);
        // 3 tokens of power 2: one sure hit, remainder 0.
        let mut tracker = BattleTracker::new();

        do_kamikaze_attacks(&mut tracker, &mut StageProgress::default(), PlayerId(0), &mut bridge).unwrap();
        assert_eq!(bridge.state().unit(ship).unwrap().hits, 1);
    }
}
