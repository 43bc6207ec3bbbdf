//! Strategic bombing raids.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::battle::common::{
    fire_phase, territory_name, BattleCore, BattleResultDescription, FireKind, FireState, ReturnFire, Side,
    WhoWon,
};
use crate::bridge::{Bridge, DisplayEvent, SoundClip};
use crate::change::{Change, Resource, UnitProperty};
use crate::data::Domain;
use crate::error::{BattleError, Result};
use crate::ids::UnitId;
use crate::matches;
use crate::stack::ExecutionStack;
use crate::state::GameState;
use crate::tracker::BattleTracker;

/// One step of a bombing raid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BombingStep {
    /// Defending AA fires at the bombers.
    FireAa,
    /// A firing group in flight.
    Fire(FireState),
    /// Surviving bombers deal their damage.
    ConductBombing,
    /// Suicide bombers die.
    RemoveSuicideAttackers,
    /// Write the result.
    End,
}

impl BombingStep {
    /// Name shown in the step list.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        match self {
            Self::FireAa => Some("AA fire".into()),
            Self::Fire(fire) => Some(fire.step_name.clone()),
            Self::ConductBombing => Some("Bombing".into()),
            Self::RemoveSuicideAttackers | Self::End => None,
        }
    }
}

/// Bombing raid against a territory or its damageable units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BombingRaidBattle {
    core: BattleCore,
    stack: ExecutionStack<BombingStep>,
    /// Target to the bombers assigned to it.
    targets: BTreeMap<UnitId, BTreeSet<UnitId>>,
    damage: u32,
}

impl BombingRaidBattle {
    /// New raid with no bombers yet.
    #[must_use]
    pub fn new(core: BattleCore, state: &GameState) -> Self {
        let mut battle = Self {
            core,
            stack: ExecutionStack::new(),
            targets: BTreeMap::new(),
            damage: 0,
        };
        battle.update_defending_units(state);
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

    /// Pending steps.
    #[must_use]
    pub const fn stack(&self) -> &ExecutionStack<BombingStep> {
        &self.stack
    }

    pub(crate) fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Damage dealt so far.
    #[must_use]
    pub const fn damage(&self) -> u32 {
        self.damage
    }

    /// Target to bombers.
    #[must_use]
    pub const fn targets(&self) -> &BTreeMap<UnitId, BTreeSet<UnitId>> {
        &self.targets
    }

    /// No bombers left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.core.attacking_units.is_empty()
    }

    /// Step labels still queued, next to run first.
    #[must_use]
    pub fn pending_steps(&self) -> Vec<String> {
        self.stack.steps().iter().rev().filter_map(BombingStep::label).collect()
    }

    /// Defenders are the enemy AA guns and bombing targets at the site.
    pub fn update_defending_units(&mut self, state: &GameState) {
        let site = self.core.site;
        let attacker = self.core.attacker;
        self.core.defending_units = state
            .units()
            .filter(|u| u.location == site && state.at_war(u.owner, attacker))
            .filter(|u| {
                state.unit_types.get(u.type_id).is_ok_and(|t| {
                    t.can_be_damaged() || t.aa.as_ref().is_some_and(|aa| aa.defensive && aa.targets.contains(&Domain::Air))
                })
            })
            .map(|u| u.id)
            .collect();
    }

    /// Join bombers, with their chosen targets.
    pub fn add_attack(&mut self, units: &[UnitId], targets: &BTreeMap<UnitId, BTreeSet<UnitId>>) {
        self.core.add_units(Side::Attacker, units);
        for (target, bombers) in targets {
            self.targets.entry(*target).or_default().extend(bombers.iter().copied());
        }
    }

    /// Take bombers back out (their move was undone).
    pub fn remove_attack(&mut self, units: &[UnitId]) {
        self.core.attacking_units.retain(|u| !units.contains(u));
        for bombers in self.targets.values_mut() {
            bombers.retain(|b| !units.contains(b));
        }
        self.targets.retain(|_, bombers| !bombers.is_empty());
    }

    /// Strip bombers lost before the raid.
    pub fn units_lost_in_preceding_battle(&mut self, units: &[UnitId]) {
        self.remove_attack(units);
        self.core.remove_from_sets(units);
    }

    /// Target assigned to `bomber`.
    fn target_of(&self, bomber: UnitId) -> Option<UnitId> {
        self.targets
            .iter()
            .find(|(_, bombers)| bombers.contains(&bomber))
            .map(|(target, _)| *target)
    }

    fn damageable(&self, state: &GameState) -> Result<Vec<UnitId>> {
        state.filter_units(&self.core.defending_units, |u, t| {
            t.can_be_damaged() && u.bombing_damage < t.max_damage
        })
    }

    /// Run the raid.
    pub fn fight(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        if self.core.is_over() {
            return Err(BattleError::InvariantViolation(format!("{} fought after it ended", self.core.id)));
        }
        if self.stack.is_executing() {
            self.show(bridge);
            return self.drain(tracker, bridge);
        }

        let site = self.core.site;
        let nothing_to_bomb = {
            let state = bridge.state();
            self.core
                .attacking_units
                .retain(|&u| state.unit(u).is_ok_and(|unit| unit.location == site));
            self.update_defending_units(state);
            if state.rules.damage_from_bombing_done_to_units {
                self.damageable(state)?.is_empty()
            } else {
                state.territory(site)?.production == 0
            }
        };
        if self.core.attacking_units.is_empty() || nothing_to_bomb {
            debug!(battle = %self.core.id, "nothing to bomb");
            return self
                .core
                .finish(WhoWon::Draw, BattleResultDescription::NoBattle, tracker, bridge);
        }

        self.core.snapshot_starting_units();
        info!(battle = %self.core.id, site = %site, bombers = self.core.attacking_units.len(), "bombing raid started");
        bridge.play_sound(SoundClip::BattleBombing, self.core.attacker);
        bridge.history_event(
            format!("Bombing raid on {}", territory_name(bridge.state(), site)),
            &self.core.attacking_units,
        );
        self.show(bridge);
        bridge.notify(DisplayEvent::ListSteps {
            battle: self.core.id,
            steps: vec!["AA fire".into(), "Bombing".into()],
        });
        self.stack.push_all([
            BombingStep::FireAa,
            BombingStep::ConductBombing,
            BombingStep::RemoveSuicideAttackers,
            BombingStep::End,
        ]);
        self.drain(tracker, bridge)
    }

    fn drain(&mut self, tracker: &mut BattleTracker, bridge: &mut dyn Bridge) -> Result<()> {
        let mut stack = std::mem::take(&mut self.stack);
        let result = stack.execute(|step, stack| self.run_step(step, stack, tracker, bridge));
        self.stack = stack;
        if let Err(e) = &result {
            if !e.is_suspension() {
                error!(battle = %self.core.id, error = %e, "bombing step failed");
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

    fn run_step(
        &mut self,
        step: BombingStep,
        stack: &mut ExecutionStack<BombingStep>,
        tracker: &mut BattleTracker,
        bridge: &mut dyn Bridge,
    ) -> Result<()> {
        if self.core.is_over() {
            return Ok(());
        }
        match step {
            BombingStep::FireAa => self.fire_aa(stack, bridge.state()),
            BombingStep::Fire(fire) => {
                if let Some(next) = fire_phase(&mut self.core, fire, tracker, bridge)? {
                    stack.push(BombingStep::Fire(next));
                }
                Ok(())
            }
            BombingStep::ConductBombing => self.conduct_bombing(bridge),
            BombingStep::RemoveSuicideAttackers => {
                let spent = bridge.state().filter_units(&self.core.attacking_units, matches::is_suicide)?;
                if !spent.is_empty() {
                    bridge.notify(DisplayEvent::DeadUnits {
                        battle: self.core.id,
                        units: spent.clone(),
                    });
                    self.core.remove(&spent, tracker, bridge)?;
                }
                Ok(())
            }
            BombingStep::End => {
                let (who_won, result) = if self.damage > 0 {
                    (WhoWon::Attacker, BattleResultDescription::Bombed)
                } else {
                    (WhoWon::Defender, BattleResultDescription::Lost)
                };
                self.core.finish(who_won, result, tracker, bridge)
            }
        }
    }

    fn fire_aa(&self, stack: &mut ExecutionStack<BombingStep>, state: &GameState) -> Result<()> {
        let mut guns: BTreeMap<String, Vec<UnitId>> = BTreeMap::new();
        for &id in &self.core.defending_units {
            if let Some(aa) = &state.unit_type(id)?.aa {
                if aa.defensive && aa.targets.contains(&Domain::Air) {
                    guns.entry(aa.aa_type.clone()).or_default().push(id);
                }
            }
        }
        let bombers = state.filter_units(&self.core.attacking_units, matches::is_air)?;
        if bombers.is_empty() {
            return Ok(());
        }
        let fires: Vec<BombingStep> = guns
            .into_iter()
            .rev()
            .map(|(aa_type, group)| {
                let name = format!("{aa_type} fire");
                BombingStep::Fire(FireState::new(
                    Side::Defender,
                    FireKind::Aa { aa_type },
                    group,
                    bombers.clone(),
                    ReturnFire::None,
                    name,
                ))
            })
            .collect();
        stack.push_all(fires);
        Ok(())
    }

    fn conduct_bombing(&mut self, bridge: &mut dyn Bridge) -> Result<()> {
        let attacker = self.core.attacker;
        let site = self.core.site;
        let (sides, low_luck, cap, to_units) = {
            let state = bridge.state();
            let rules = &state.rules;
            let cap = (rules.ww2v2 || rules.limit_sbr_damage_to_production)
                .then(|| state.territory(site).map(|t| t.production))
                .transpose()?;
            (rules.dice_sides, rules.low_luck, cap, rules.damage_from_bombing_done_to_units)
        };

        let mut per_bomber: Vec<(UnitId, u32)> = Vec::new();
        let mut all_dice = Vec::new();
        for bomber in self.core.attacking_units.clone() {
            let rolls = bridge.state().unit_type(bomber)?.attack_rolls.max(1);
            let damage = if low_luck {
                rolls * ((sides + 1) / 2)
            } else {
                let dice = bridge.roll_dice(sides, rolls, attacker, "Bombing")?;
                let sum = dice.iter().map(|v| v + 1).sum();
                all_dice.extend(dice);
                sum
            };
            per_bomber.push((bomber, damage));
        }
        let rolled: u32 = per_bomber.iter().map(|&(_, d)| d).sum();
        bridge.notify(DisplayEvent::Dice {
            battle: self.core.id,
            step: "Bombing".into(),
            player: attacker,
            dice: all_dice,
            hits: rolled,
        });

        let mut budget = cap.map_or(rolled, |c| rolled.min(c));
        if to_units {
            let mut added: BTreeMap<UnitId, u32> = BTreeMap::new();
            let fallback = self.damageable(bridge.state())?;
            for (bomber, damage) in per_bomber {
                let Some(target) = self.target_of(bomber).or_else(|| fallback.first().copied()) else {
                    continue;
                };
                let room = {
                    let state = bridge.state();
                    let unit = state.unit(target)?;
                    let max = state.unit_types.get(unit.type_id)?.max_damage;
                    max.saturating_sub(unit.bombing_damage + added.get(&target).copied().unwrap_or(0))
                };
                let dealt = damage.min(room).min(budget);
                budget -= dealt;
                *added.entry(target).or_default() += dealt;
            }
            let mut changes = Vec::new();
            for (target, dealt) in &added {
                if *dealt > 0 {
                    let current = bridge.state().unit(*target)?.bombing_damage;
                    changes.push(Change::set(*target, UnitProperty::BombingDamage(current + dealt)));
                }
            }
            self.damage = added.values().sum();
            if !changes.is_empty() {
                bridge.apply_change(Change::Composite(changes))?;
            }
        } else {
            let (victim, pus) = {
                let state = bridge.state();
                let victim = state.territory(site)?.owner.unwrap_or(self.core.defender);
                (victim, state.player(victim)?.pus)
            };
            let lost = u32::try_from(pus.max(0)).unwrap_or(u32::MAX).min(budget);
            self.damage = lost;
            if lost > 0 {
                bridge.apply_change(Change::ChangeResource {
                    player: victim,
                    resource: Resource::Pus,
                    delta: -i64::from(lost),
                })?;
            }
        }

        debug!(battle = %self.core.id, rolled, dealt = self.damage, "bombing conducted");
        bridge.notify(DisplayEvent::Bombing {
            battle: self.core.id,
            damage: self.damage,
        });
        let bombers = self.core.attacking_units.clone();
        bridge.history_event(
            format!("Bombing raid on {} costs {} damage", territory_name(bridge.state(), site), self.damage),
            &bombers,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::{Battle, BattleType};
    use crate::bridge::{AutoPlayer, LocalBridge};
    use crate::data::{UnitTrait, UnitType, UnitTypeRegistry};
    use crate::ids::{PlayerId, TerritoryId};
    use crate::route::Route;
    use crate::rules::BattleRules;
    use crate::state::{Player, Territory};
    use crate::tracker::AttackMove;

    const RED: PlayerId = PlayerId(0);
    const BLUE: PlayerId = PlayerId(1);
    const WORKS: TerritoryId = TerritoryId(1);

    struct Raid {
        bridge: LocalBridge<AutoPlayer>,
        tracker: BattleTracker,
        factories: Vec<UnitId>,
    }

    fn create_test_raid(rules: BattleRules, factories: usize, bombers: usize) -> Raid {
        let mut types = UnitTypeRegistry::new();
        types.register(UnitType::new("bomber", Domain::Air, 12, 4, 1).with_trait(UnitTrait::StrategicBomber));
        let mut factory = UnitType::new("factory", Domain::Land, 15, 0, 0).with_trait(UnitTrait::Infrastructure);
        factory.max_damage = 20;
        types.register(factory);
        let mut state = GameState::new(rules, types);
        state.add_player(Player::new(RED, "Red", 0));
        let mut blue = Player::new(BLUE, "Blue", 1);
        blue.pus = 10;
        state.add_player(blue);
        state.add_territory(Territory::new(TerritoryId(0), "Airstrip", false));
        let mut works = Territory::new(WORKS, "Works", false);
        works.owner = Some(BLUE);
        works.production = 2;
        state.add_territory(works);
        state.connect(TerritoryId(0), WORKS).unwrap();
        state.current_player = Some(RED);
        let factories = (0..factories)
            .map(|_| state.spawn_unit("factory", BLUE, WORKS).unwrap())
            .collect();
        let bombers: Vec<UnitId> = (0..bombers)
            .map(|_| state.spawn_unit("bomber", RED, WORKS).unwrap())
            .collect();

        let mut bridge = LocalBridge::auto(state, 5);
        let mut tracker = BattleTracker::new();
        let attack = AttackMove::new(Route::single(TerritoryId(0), WORKS), bombers, RED).bombing();
        tracker.add_battle(&attack, &mut bridge).unwrap();
        Raid {
            bridge,
            tracker,
            factories,
        }
    }

    /// Fight the raid to the end, returning its outcome and the damage dealt.
    fn fight_raid(raid: &mut Raid) -> (WhoWon, Option<BattleResultDescription>, u32) {
        let id = raid.tracker.pending_battle_id(WORKS, BattleType::BombingRaid).unwrap();
        let bridge = &mut raid.bridge;
        raid.tracker
            .with_battle(id, |battle, tracker| {
                battle.fight(tracker, bridge)?;
                let Battle::Bombing(bombing) = battle else {
                    panic!("bombing raid expected");
                };
                Ok((bombing.core().who_won(), bombing.core().result(), bombing.damage()))
            })
            .unwrap()
    }

    #[test]
    fn test_low_luck_bombing_damages_units() {
        let rules = BattleRules {
            low_luck: true,
            damage_from_bombing_done_to_units: true,
            ..BattleRules::default()
        };
        let mut raid = create_test_raid(rules, 1, 2);

        let (who_won, result, damage) = fight_raid(&mut raid);

        assert_eq!(who_won, WhoWon::Attacker);
        assert_eq!(result, Some(BattleResultDescription::Bombed));
        assert_eq!(damage, 6);
        let state = raid.bridge.state();
        assert_eq!(state.unit(raid.factories[0]).unwrap().bombing_damage, 6);
        assert_eq!(raid.bridge.dice_position(), 0);
        assert!(raid.tracker.pending_battle_id(WORKS, BattleType::BombingRaid).is_none());
    }

    #[test]
    fn test_unit_damage_stops_at_max_damage() {
        let rules = BattleRules {
            low_luck: true,
            damage_from_bombing_done_to_units: true,
            ..BattleRules::default()
        };
        let mut raid = create_test_raid(rules, 1, 2);
        let factory = raid.factories[0];
        raid.bridge.state_mut().unit_mut(factory).unwrap().bombing_damage = 16;

        let (_, result, damage) = fight_raid(&mut raid);

        assert_eq!(result, Some(BattleResultDescription::Bombed));
        assert_eq!(damage, 4);
        assert_eq!(raid.bridge.state().unit(factory).unwrap().bombing_damage, 20);
    }

    #[test]
    fn test_pu_loss_capped_by_production() {
        let rules = BattleRules {
            low_luck: true,
            limit_sbr_damage_to_production: true,
            ..BattleRules::default()
        };
        let mut raid = create_test_raid(rules, 0, 2);

        let (who_won, _, damage) = fight_raid(&mut raid);

        assert_eq!(who_won, WhoWon::Attacker);
        assert_eq!(damage, 2);
        assert_eq!(raid.bridge.state().player(BLUE).unwrap().pus, 8);
    }

    #[test]
    fn test_uncapped_pu_loss_takes_full_roll() {
        let rules = BattleRules {
            low_luck: true,
            ..BattleRules::default()
        };
        let mut raid = create_test_raid(rules, 0, 2);

        let (_, _, damage) = fight_raid(&mut raid);

        assert_eq!(damage, 6);
        assert_eq!(raid.bridge.state().player(BLUE).unwrap().pus, 4);
    }

    #[test]
    fn test_nothing_to_bomb_is_no_battle() {
        let rules = BattleRules {
            damage_from_bombing_done_to_units: true,
            ..BattleRules::default()
        };
        let mut raid = create_test_raid(rules, 0, 1);

        let (who_won, result, damage) = fight_raid(&mut raid);

        assert_eq!(who_won, WhoWon::Draw);
        assert_eq!(result, Some(BattleResultDescription::NoBattle));
        assert_eq!(damage, 0);
    }
}
