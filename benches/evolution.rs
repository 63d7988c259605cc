use criterion::{criterion_group, criterion_main, Criterion};
use spectrum_core::evolution::{rank, RankedEntry, SummaryStats};
use spectrum_core::model::{Activation, ExperimentMode, NumericType, PolicyNetwork};

fn bench_evolution(c: &mut Criterion) {
    let widths = [6, 128, 128, 3];
    let activations = [
        Activation::Linear,
        Activation::Relu,
        Activation::Relu,
        Activation::Tanh,
    ];
    let net = PolicyNetwork::random(
        NumericType::Float32,
        ExperimentMode::Standard,
        &widths,
        &activations,
        7,
    );

    c.bench_function("perturb_6x128x128x3_float32", |b| {
        b.iter(|| {
            let mut clone = net.clone();
            clone.perturb(0.1, 3);
            clone
        })
    });

    let int_net = PolicyNetwork::random(
        NumericType::Int16,
        ExperimentMode::Standard,
        &widths,
        &activations,
        7,
    );
    c.bench_function("perturb_6x128x128x3_int16", |b| {
        b.iter(|| {
            let mut clone = int_net.clone();
            clone.perturb(0.1, 3);
            clone
        })
    });

    c.bench_function("forward_6x128x128x3", |b| {
        b.iter(|| net.forward(&[10.1, -10.2, 10.3, -10.4, 10.5, -10.6]))
    });

    let progress: Vec<f64> = (0..1000).map(|i| ((i * 37) % 101) as f64 - 50.0).collect();
    c.bench_function("summary_stats_1000", |b| {
        b.iter(|| SummaryStats::compute(&progress))
    });

    let entries: Vec<RankedEntry> = (0..256)
        .map(|i| RankedEntry {
            variant: i,
            mean_progress: ((i * 53) % 97) as f64,
        })
        .collect();
    c.bench_function("rank_256_variants", |b| {
        b.iter(|| {
            let mut ranked = entries.clone();
            rank(&mut ranked);
            ranked
        })
    });
}

criterion_group!(benches, bench_evolution);
criterion_main!(benches);
