//! Criterion benchmarks for stimulus selection.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features parallel
//!
//! Results are saved to target/criterion/

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use resonanz::catalog::{CatalogListing, PictureEntry, StimulusSet};
use resonanz::config::DecisionConfig;
use resonanz::decision::{score_candidate, DecisionEngine, DecisionInput};
use resonanz::model::{ModelBook, PredictiveModel};
use resonanz::prng::Prng;

const SIGNALS: usize = 6;
const STATES: usize = 4;

fn catalog(pictures: usize) -> StimulusSet {
    let listing = CatalogListing {
        pictures: (0..pictures)
            .map(|i| PictureEntry {
                name: format!("p{i}.png"),
                features: Vec::new(),
            })
            .collect(),
        keywords: (0..pictures / 4).map(|i| format!("word{i}")).collect(),
    };
    StimulusSet::new(listing, "bench")
}

fn book(stimuli: &StimulusSet, rng: &mut Prng) -> ModelBook {
    let mut book = ModelBook::with_catalog(stimuli.pictures().len(), stimuli.keywords().len());
    let mut model = || {
        let mean = (0..SIGNALS).map(|_| rng.gen_range_f32(-0.2, 0.2)).collect();
        let var: Vec<f32> = (0..SIGNALS).map(|_| rng.gen_range_f32(0.0, 0.01)).collect();
        Some(Arc::new(PredictiveModel::constant(SIGNALS + STATES, mean, &var)))
    };
    for slot in book.pictures.iter_mut() {
        *slot = model();
    }
    for slot in book.keywords.iter_mut() {
        *slot = model();
    }
    book
}

/// Scoring one candidate: prediction, clipping and weighted error.
fn bench_score(c: &mut Criterion) {
    let mut rng = Prng::new(7);
    let model = PredictiveModel::constant(SIGNALS + STATES, vec![0.1; SIGNALS], &[0.01; SIGNALS]);
    let signal: Vec<f32> = (0..SIGNALS).map(|_| rng.next_f32_01()).collect();
    let state = [1.0, 0.0, 0.0, 0.0];
    let target = [0.5; SIGNALS];
    let tolerance = [1.0; SIGNALS];

    c.bench_function("score_candidate", |b| {
        b.iter(|| {
            let input = DecisionInput {
                signal: &signal,
                state: &state,
                target: &target,
                tolerance: &tolerance,
                elapsed_secs: 0.1,
            };
            black_box(score_candidate(0, &model, &[], black_box(&input)))
        });
    });
}

/// Full selection over catalogs of growing size.
fn bench_select_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_next");

    for pictures in [16usize, 64, 256, 1024].iter() {
        group.throughput(Throughput::Elements(*pictures as u64));
        group.bench_with_input(BenchmarkId::from_parameter(pictures), pictures, |b, &pictures| {
            let mut rng = Prng::new(42);
            let stimuli = catalog(pictures);
            let models = book(&stimuli, &mut rng);
            let mut engine = DecisionEngine::new(DecisionConfig::default(), 0, rng.fork());
            let signal = vec![0.4; SIGNALS];
            let state = [0.0, 1.0, 0.0, 0.0];
            let target = vec![0.6; SIGNALS];
            let tolerance = vec![1.0; SIGNALS];

            b.iter(|| {
                let input = DecisionInput {
                    signal: &signal,
                    state: &state,
                    target: &target,
                    tolerance: &tolerance,
                    elapsed_secs: 0.1,
                };
                black_box(engine.select_next(&models, &stimuli, &input))
            });
        });
    }

    group.finish();
}

/// Blind selection pushes the whole Monte Carlo swarm every call.
fn bench_select_blind(c: &mut Criterion) {
    let mut rng = Prng::new(9);
    let stimuli = catalog(64);
    let models = book(&stimuli, &mut rng);
    let cfg = DecisionConfig {
        swarm_size: 1000,
        ..DecisionConfig::default()
    };
    let mut engine = DecisionEngine::new(cfg, 0, rng.fork());
    let state = [1.0, 0.0, 0.0, 0.0];
    let target = vec![0.6; SIGNALS];
    let tolerance = vec![1.0; SIGNALS];

    c.bench_function("select_blind_1000", |b| {
        b.iter(|| black_box(engine.select_blind(&models, &stimuli, &state, &target, &tolerance, 0.1)));
    });
}

criterion_group!(benches, bench_score, bench_select_next, bench_select_blind);
criterion_main!(benches);
