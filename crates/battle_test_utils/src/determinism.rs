//! Determinism testing utilities.
//!
//! Provides a harness for verifying that battle resolution produces
//! identical results given identical inputs.
//!
//! # Testing Strategy
//!
//! Battles must be reproducible from a seed: a saved game replayed on
//! another machine, or a checkpoint restored mid-battle, has to reach the
//! same state. Sources of non-determinism include:
//!
//! - **HashMap iteration order**: Rust's default hasher is randomized.
//!   Every engine collection is a `BTreeMap`/`BTreeSet` keyed by ids.
//!
//! - **System randomness**: all dice come from the bridge's seeded
//!   `ChaCha8Rng`, whose stream position is checkpointed.
//!
//! - **Re-executed steps**: a suspended step that ran twice would roll
//!   twice. The step stack re-runs only the interrupted step.
//!
//! # Test Levels
//!
//! 1. **Unit tests**: individual steps (firing order, casualties, retreat)
//! 2. **Property tests**: random forces and seeds must still reproduce
//! 3. **Checkpoint tests**: suspend, serialize, restore and finish
//! 4. **Parallel tests**: running N battles on threads all match

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread;

use battle_core::bridge::{Bridge, LocalBridge, RemotePlayer};
use battle_core::snapshot::Checkpoint;

use crate::fixtures::{play_battle_phase, play_until_done, BattleFixture};
use crate::scripted::ScriptedPlayer;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Hashes from each run.
    pub hashes: Vec<u64>,
    /// Steps driven per run.
    pub steps: u64,
}

impl DeterminismResult {
    /// Get all unique hashes (should be 1 for a deterministic run).
    #[must_use]
    pub fn unique_hashes(&self) -> Vec<u64> {
        let mut unique: Vec<u64> = self.hashes.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }

    /// Assert that every run produced the same state, with a detailed error message.
    ///
    /// # Panics
    ///
    /// Panics if the runs produced different hashes.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let unique = self.unique_hashes();
            panic!(
                "Battle resolution is non-deterministic!\n\
                 Runs: {}\n\
                 Steps: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.steps,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a setup/step loop multiple times and verify determinism.
///
/// # Arguments
///
/// * `runs` - Number of times to run
/// * `steps` - Number of times `step` is applied per run
/// * `setup` - Function to create the initial state
/// * `step` - Function to advance the state
/// * `hash` - Function to compute the state hash
///
/// # Example
///
/// ```ignore
/// use battle_test_utils::determinism::verify_determinism;
///
/// let result = verify_determinism(
///     5,
///     1,
///     || fixture.bridge(42),
///     |bridge| { resolve(bridge); },
///     |bridge| bridge.state().state_hash(),
/// );
/// result.assert_deterministic();
/// ```
pub fn verify_determinism<S, Setup, Step, HashFn>(
    runs: usize,
    steps: u64,
    setup: Setup,
    step: Step,
    hash: HashFn,
) -> DeterminismResult
where
    Setup: Fn() -> S,
    Step: Fn(&mut S),
    HashFn: Fn(&S) -> u64,
{
    let mut hashes = Vec::with_capacity(runs);

    for _ in 0..runs {
        let mut state = setup();

        for _ in 0..steps {
            step(&mut state);
        }

        hashes.push(hash(&state));
    }

    let is_deterministic = hashes.windows(2).all(|w| w[0] == w[1]);

    DeterminismResult {
        is_deterministic,
        hashes,
        steps,
    }
}

/// Resolve the fixture's battle phase with default answers and hash the result.
///
/// A run that errors hashes as 0, so an error in one run but not another
/// still shows up as divergence.
#[must_use]
pub fn resolve_and_hash(fixture: &BattleFixture, seed: u64) -> u64 {
    let mut bridge = fixture.bridge(seed);
    let Ok(mut delegate) = fixture.delegate(&mut bridge) else {
        return 0;
    };
    match play_battle_phase(&mut delegate, &mut bridge) {
        Ok(()) => bridge.state().state_hash(),
        Err(_) => 0,
    }
}

/// Resolve the fixture twice with the same seed and compare final states.
#[must_use]
pub fn verify_battle_determinism(fixture: &BattleFixture, seed: u64) -> bool {
    verify_determinism(2, 1, || 0u64, |h| *h = resolve_and_hash(fixture, seed), |h| *h).is_deterministic
}

/// Resolve the fixture `num_runs` times on scoped threads and collect hashes.
pub fn run_parallel_battles(fixture: &BattleFixture, num_runs: usize, seed: u64) -> DeterminismResult {
    let hashes: Vec<u64> = thread::scope(|s| {
        let handles: Vec<_> = (0..num_runs)
            .map(|_| s.spawn(|| resolve_and_hash(fixture, seed)))
            .collect();

        handles.into_iter().map(|h| h.join().unwrap_or(0)).collect()
    });

    DeterminismResult {
        is_deterministic: hashes.windows(2).all(|w| w[0] == w[1]),
        hashes,
        steps: 1,
    }
}

/// Verify that a suspended battle, checkpointed to bytes and restored,
/// finishes in the same state as an uninterrupted run.
///
/// `interrupted` is the remote player for the interrupted run; it should
/// suspend at least once and otherwise answer like the default player.
pub fn verify_checkpoint_determinism(fixture: &BattleFixture, seed: u64, interrupted: ScriptedPlayer) -> bool {
    let expected = resolve_and_hash(fixture, seed);

    let mut bridge: LocalBridge<ScriptedPlayer> = fixture.bridge_with(seed, interrupted);
    let Ok(mut delegate) = fixture.delegate(&mut bridge) else {
        return false;
    };
    match play_battle_phase(&mut delegate, &mut bridge) {
        Ok(()) => return bridge.state().state_hash() == expected,
        Err(e) if e.is_suspension() => {}
        Err(_) => return false,
    }

    let Ok(bytes) = Checkpoint::capture(&delegate, &bridge).to_bytes() else {
        return false;
    };
    let Ok(checkpoint) = Checkpoint::from_bytes(&bytes) else {
        return false;
    };
    let remote = bridge.remote_mut().clone();
    let (mut restored, mut delegate) = checkpoint.restore(remote);
    match play_until_done(&mut delegate, &mut restored, 16) {
        Ok(_) => restored.state().state_hash() == expected,
        Err(_) => false,
    }
}

/// Compute a simple hash for any hashable value.
pub fn compute_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hash the state behind any bridge.
pub fn bridge_hash<R: RemotePlayer>(bridge: &LocalBridge<R>) -> u64 {
    bridge.state().state_hash()
}

/// Proptest strategies for battle testing.
///
/// These strategies generate random but reproducible forces, seeds and
/// rule variants for property-based testing.
pub mod strategies {
    use battle_core::rules::BattleRules;
    use proptest::prelude::*;

    /// Land unit types from the standard fixtures.
    pub const LAND_TYPES: [&str; 3] = ["infantry", "artillery", "armour"];

    /// Combat ship types from the standard fixtures.
    pub const SEA_TYPES: [&str; 4] = ["destroyer", "submarine", "cruiser", "battleship"];

    /// Generate a dice seed.
    pub fn arb_seed() -> impl Strategy<Value = u64> {
        any::<u64>()
    }

    /// Generate a force of `(type, count)` pairs drawn from `types`.
    pub fn arb_force(types: &'static [&'static str], max_each: usize) -> impl Strategy<Value = Vec<(&'static str, usize)>> {
        proptest::collection::vec((0..types.len(), 1..=max_each), 1..=types.len())
            .prop_map(move |picks| picks.into_iter().map(|(i, n)| (types[i], n)).collect())
    }

    /// Generate a land force.
    pub fn arb_land_force() -> impl Strategy<Value = Vec<(&'static str, usize)>> {
        arb_force(&LAND_TYPES, 4)
    }

    /// Generate a naval force.
    pub fn arb_sea_force() -> impl Strategy<Value = Vec<(&'static str, usize)>> {
        arb_force(&SEA_TYPES, 3)
    }

    /// Generate a round limit: unlimited or 1 to 5.
    pub fn arb_max_rounds() -> impl Strategy<Value = i32> {
        prop_oneof![Just(-1i32), 1i32..=5]
    }

    /// Generate rules varying the options that change the round structure.
    pub fn arb_rules() -> impl Strategy<Value = BattleRules> {
        (any::<bool>(), any::<bool>(), any::<bool>(), arb_max_rounds(), arb_max_rounds()).prop_map(
            |(ww2v2, low_luck, defending_subs_sneak_attack, land, sea)| BattleRules {
                ww2v2,
                low_luck,
                defending_subs_sneak_attack,
                land_battle_rounds: land,
                sea_battle_rounds: sea,
                ..BattleRules::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::Answer;
    use battle_core::rules::BattleRules;
    use proptest::prelude::*;

    // =========================================================================
    // Basic determinism tests
    // =========================================================================

    #[test]
    fn test_verify_determinism_simple() {
        let result = verify_determinism(3, 100, || 0u64, |n| *n += 1, |n| *n);

        assert!(result.is_deterministic);
        assert_eq!(result.hashes, vec![100, 100, 100]);
    }

    #[test]
    fn test_land_battle_determinism() {
        let fixture = BattleFixture::land(
            BattleRules::default(),
            &[("infantry", 3), ("artillery", 2), ("armour", 2)],
            &[("infantry", 5)],
        );
        assert!(verify_battle_determinism(&fixture, 42));
    }

    #[test]
    fn test_sea_battle_determinism() {
        let fixture = BattleFixture::sea(
            BattleRules::default(),
            &[("submarine", 2), ("destroyer", 1), ("battleship", 1)],
            &[("destroyer", 2), ("cruiser", 1), ("transport", 1)],
        );
        assert!(verify_battle_determinism(&fixture, 7));
    }

    #[test]
    fn test_parallel_battles() {
        let fixture = BattleFixture::land(BattleRules::default(), &[("armour", 4)], &[("infantry", 4)]);
        run_parallel_battles(&fixture, 4, 99).assert_deterministic();
    }

    #[test]
    fn test_checkpoint_mid_battle() {
        let fixture = BattleFixture::land(BattleRules::default(), &[("infantry", 6)], &[("infantry", 6)]);
        let interrupted = ScriptedPlayer::new()
            .casualties(Answer::Default)
            .casualties(Answer::Suspend);
        assert!(verify_checkpoint_determinism(&fixture, 5, interrupted));
    }

    // =========================================================================
    // Property tests
    // =========================================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_land_battles_are_deterministic(
            attackers in strategies::arb_land_force(),
            defenders in strategies::arb_land_force(),
            seed in strategies::arb_seed(),
        ) {
            let fixture = BattleFixture::land(BattleRules::default(), &attackers, &defenders);
            prop_assert!(verify_battle_determinism(&fixture, seed));
        }

        #[test]
        fn prop_sea_battles_are_deterministic(
            attackers in strategies::arb_sea_force(),
            defenders in strategies::arb_sea_force(),
            rules in strategies::arb_rules(),
            seed in strategies::arb_seed(),
        ) {
            let fixture = BattleFixture::sea(rules, &attackers, &defenders);
            prop_assert!(verify_battle_determinism(&fixture, seed));
        }
    }
}
