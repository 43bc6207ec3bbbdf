//! Battle resolution benchmarks for battle_core.
//!
//! Run with: `cargo bench -p battle_core`

// Benchmark binaries don't need docs on macro-generated functions
#![allow(missing_docs)]

use battle_core::bridge::Bridge;
use battle_core::rules::BattleRules;
use battle_test_utils::fixtures::{play_battle_phase, BattleFixture};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn resolve(fixture: &BattleFixture, seed: u64) -> u64 {
    let mut bridge = fixture.bridge(seed);
    let Ok(mut delegate) = fixture.delegate(&mut bridge) else {
        return 0;
    };
    match play_battle_phase(&mut delegate, &mut bridge) {
        Ok(()) => bridge.state().state_hash(),
        Err(_) => 0,
    }
}

/// Full battle phases over land and sea fixtures.
pub fn battle_benchmark(c: &mut Criterion) {
    let land = BattleFixture::land(
        BattleRules::default(),
        &[("infantry", 10), ("artillery", 6), ("armour", 6)],
        &[("infantry", 18), ("artillery", 4)],
    );
    c.bench_function("land_battle_22v22", |b| {
        let mut seed = 0u64;
        b.iter(|| {
            seed = seed.wrapping_add(1);
            black_box(resolve(&land, seed))
        });
    });

    let sea = BattleFixture::sea(
        BattleRules::default(),
        &[("submarine", 4), ("destroyer", 2), ("battleship", 2), ("carrier", 1)],
        &[("destroyer", 3), ("cruiser", 2), ("submarine", 2), ("transport", 3)],
    );
    c.bench_function("sea_battle_mixed_fleet", |b| {
        let mut seed = 0u64;
        b.iter(|| {
            seed = seed.wrapping_add(1);
            black_box(resolve(&sea, seed))
        });
    });

    let low_luck = BattleFixture::land(
        BattleRules {
            low_luck: true,
            ..BattleRules::default()
        },
        &[("infantry", 10), ("artillery", 6), ("armour", 6)],
        &[("infantry", 18), ("artillery", 4)],
    );
    c.bench_function("land_battle_low_luck", |b| {
        b.iter(|| black_box(resolve(&low_luck, 7)));
    });
}

criterion_group!(benches, battle_benchmark);
criterion_main!(benches);
