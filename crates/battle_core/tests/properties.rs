//! Property tests over random forces, rules and dependency graphs.

use std::collections::{BTreeMap, BTreeSet};

use battle_core::battle::{BattleCore, BattleType, Side};
use battle_core::bridge::{Bridge, LocalBridge};
use battle_core::error::BattleError;
use battle_core::ids::{BattleId, UnitId};
use battle_core::route::Route;
use battle_core::rules::BattleRules;
use battle_core::tracker::{AttackMove, BattleTracker};
use battle_test_utils::determinism::strategies;
use battle_test_utils::fixtures::{add_land, play_battle_phase, spawn, two_player_state, BattleFixture, BLUE, RED};
use battle_test_utils::scripted::{Answer, ScriptedPlayer};
use proptest::prelude::*;

const MAX_SUSPENSIONS: usize = 40;

/// Every starting unit of `side` is accounted for exactly once.
fn accounted_for(core: &BattleCore, side: Side) -> bool {
    let starting: BTreeSet<UnitId> = core.starting_units(side).iter().copied().collect();
    if starting.is_empty() {
        return true;
    }
    let mut seen: BTreeSet<UnitId> = BTreeSet::new();
    seen.extend(core.units(side));
    seen.extend(core.retreated(side));
    seen.extend(core.waiting_to_die(side));
    seen.extend(core.killed().iter().filter(|u| starting.contains(u)));
    seen.extend(core.not_participating().iter().filter(|u| starting.contains(u)));
    seen == starting
}

/// Player that stalls at every retreat question before answering it.
fn hesitant_player() -> ScriptedPlayer {
    (0..MAX_SUSPENSIONS).fold(ScriptedPlayer::new(), |player, _| {
        player.retreat(Answer::Suspend).retreat(Answer::Default)
    })
}

fn reaches(edges: &BTreeMap<usize, BTreeSet<usize>>, from: usize, to: usize) -> bool {
    let mut seen = BTreeSet::new();
    let mut open = vec![from];
    while let Some(current) = open.pop() {
        if current == to {
            return true;
        }
        if seen.insert(current) {
            open.extend(edges.get(&current).into_iter().flatten().copied());
        }
    }
    false
}

/// Tracker with one pending land battle per frontier territory.
fn frontier_battles(count: u32) -> (LocalBridge<battle_core::bridge::AutoPlayer>, BattleTracker, Vec<BattleId>) {
    let mut state = two_player_state(BattleRules::default());
    let home = add_land(&mut state, 0, "Home", Some(RED));
    let mut moves = Vec::new();
    for i in 1..=count {
        let site = add_land(&mut state, i, &format!("Frontier {i}"), Some(BLUE));
        state.connect(home, site).unwrap();
        spawn(&mut state, "infantry", BLUE, site, 1);
        let attackers = spawn(&mut state, "infantry", RED, site, 1);
        moves.push(AttackMove::new(Route::single(home, site), attackers, RED));
    }
    let mut bridge = LocalBridge::auto(state, 0);
    let mut tracker = BattleTracker::new();
    let ids = moves
        .iter()
        .map(|attack| {
            tracker.add_battle(attack, &mut bridge).unwrap();
            tracker.pending_battle_id(attack.route.end(), BattleType::Normal).unwrap()
        })
        .collect();
    (bridge, tracker, ids)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_rounds_advance_and_units_stay_accounted(
        attackers in strategies::arb_land_force(),
        defenders in strategies::arb_land_force(),
        max_rounds in strategies::arb_max_rounds(),
        seed in strategies::arb_seed(),
    ) {
        let rules = BattleRules { land_battle_rounds: max_rounds, ..BattleRules::default() };
        let fixture = BattleFixture::land(rules, &attackers, &defenders);
        let mut bridge = fixture.bridge_with(seed, hesitant_player());
        let mut delegate = fixture.delegate(&mut bridge).unwrap();

        let mut last_round = 0;
        let mut finished = false;
        for _ in 0..=MAX_SUSPENSIONS {
            match play_battle_phase(&mut delegate, &mut bridge) {
                Ok(()) => {
                    finished = true;
                    break;
                }
                Err(e) => prop_assert!(e.is_suspension(), "unexpected error: {e}"),
            }
            let battle = delegate.tracker().get_pending_battle(fixture.site, BattleType::Normal).unwrap();
            let core = battle.core();
            prop_assert!(core.round >= last_round);
            if core.max_rounds > 0 {
                prop_assert!(i64::from(core.round) <= i64::from(core.max_rounds));
            }
            prop_assert!(accounted_for(core, Side::Attacker));
            prop_assert!(accounted_for(core, Side::Defender));
            last_round = core.round;
        }
        prop_assert!(finished);
        prop_assert!(delegate.tracker().has_no_pending_battles());
        prop_assert_eq!(delegate.statistics().len(), 1);
    }

    #[test]
    fn prop_finished_battles_stay_finished(
        attackers in strategies::arb_land_force(),
        defenders in strategies::arb_land_force(),
        seed in strategies::arb_seed(),
    ) {
        let fixture = BattleFixture::land(BattleRules::default(), &attackers, &defenders);
        let mut bridge = fixture.bridge(seed);
        let mut tracker = BattleTracker::new();
        tracker.add_battle(&fixture.attack(), &mut bridge).unwrap();
        let id = tracker.pending_battle_id(fixture.site, BattleType::Normal).unwrap();

        let mut finished = tracker
            .with_battle(id, |battle, tracker| {
                battle.fight(tracker, &mut bridge)?;
                Ok(battle.clone())
            })
            .unwrap();
        prop_assert!(finished.is_over());
        prop_assert!(tracker.records.get(id).is_some_and(|r| r.result.is_some()));
        prop_assert!(accounted_for(finished.core(), Side::Attacker));
        prop_assert!(accounted_for(finished.core(), Side::Defender));

        let before = bridge.state().state_hash();
        let err = finished.fight(&mut tracker, &mut bridge).unwrap_err();
        prop_assert!(matches!(err, BattleError::InvariantViolation(_)));
        prop_assert!(finished.cancel(&mut tracker).is_err());
        prop_assert_eq!(bridge.state().state_hash(), before);
    }

    #[test]
    fn prop_dependencies_never_form_cycles(
        edges in proptest::collection::vec((0usize..5, 0usize..5), 0..16),
    ) {
        let (mut bridge, mut tracker, ids) = frontier_battles(5);
        let mut model: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();

        for (blocked, blocking) in edges {
            let allowed = blocked != blocking && !reaches(&model, blocking, blocked);
            let result = tracker.add_dependency(ids[blocked], ids[blocking]);
            prop_assert_eq!(result.is_ok(), allowed);
            if allowed {
                model.entry(blocked).or_default().insert(blocking);
            } else {
                prop_assert!(matches!(result, Err(BattleError::InvariantViolation(_))));
            }
        }

        for (i, &id) in ids.iter().enumerate() {
            let waits: BTreeSet<BattleId> = model.get(&i).into_iter().flatten().map(|&j| ids[j]).collect();
            let reported: BTreeSet<BattleId> = tracker.get_dependent_on(id).into_iter().collect();
            prop_assert_eq!(&reported, &waits);
            if !waits.is_empty() {
                let err = tracker.fight(id, &mut bridge).unwrap_err();
                prop_assert!(matches!(err, BattleError::InvariantViolation(_)));
                prop_assert!(tracker.get_pending_battle_by_id(id).is_some());
            }
        }
    }
}
