//! Benchmark suite for study-engine
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use study_engine::engine::SessionContext;
use study_engine::estimator::AbilityEstimator;
use study_engine::types::{ClockContext, ItemRecord, LearnerLoState};
use study_engine::{BlueprintTarget, EngineConfig, StudyEngine};

fn item(id: &str, lo: &str, system: &str, b: f64) -> ItemRecord {
    ItemRecord {
        item_id: id.to_string(),
        lo_id: lo.to_string(),
        system_id: system.to_string(),
        b,
        tau: vec![-0.5, -0.25, 0.0, 0.25, 0.5],
        median_time_seconds: 60.0,
        mean_score: 0.5,
    }
}

fn bench_ability_update(c: &mut Criterion) {
    let estimator = AbilityEstimator::new(EngineConfig::default());
    let probe = item("it-0", "lo-a", "sys-1", 0.1);
    let mut state = LearnerLoState::new("lo-a");
    state.items_attempted = 10; // pure EAP path

    c.bench_function("estimator_update", |b| {
        b.iter(|| estimator.update(black_box(&state), black_box(&probe), 3).unwrap())
    });
}

fn bench_next_step(c: &mut Criterion) {
    let mut engine = StudyEngine::new(EngineConfig::default(), "bench-learner");
    let mut items = Vec::new();
    for lo in 0..40 {
        for i in 0..8 {
            items.push(item(
                &format!("lo-{}-it-{}", lo, i),
                &format!("lo-{}", lo),
                &format!("sys-{}", lo % 4),
                -1.0 + 0.25 * i as f64,
            ));
        }
    }
    assert!(engine.load_catalog(items).is_empty());
    engine.load_blueprint(
        (0..4)
            .map(|s| BlueprintTarget::new(format!("sys-{}", s), 0.25))
            .collect(),
    );

    let clock = ClockContext::from_utc_timestamp(1_704_672_000);

    c.bench_function("next_step_320_items", |b| {
        b.iter(|| {
            let mut session = SessionContext::new(30.0);
            session.active_lo = Some("lo-0".to_string());
            let mut rng = ChaCha8Rng::seed_from_u64(42);
            engine.next_step(&mut session, &clock, &mut rng).unwrap()
        })
    });
}

criterion_group!(benches, bench_ability_update, bench_next_step);
criterion_main!(benches);
