use std::{sync::Arc, time::Duration};

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use kfparticle::{
    construct_primary_vertex, diagonal_covariance, fit_candidates, ExecutionContext, FieldHandle,
    FieldMap, KFParticle, ThreadPolicy, UniformField, ZeroField,
};

const TIERS: [(&str, usize); 2] = [("small", 256), ("large", 16384)];
const KS_MASS: (f64, f64) = (0.497614, 0.005);

/// A K⁰ → π⁺π⁻ pair leaving the origin, each pion with an energy of 1 GeV.
fn kaon_daughters(field: FieldHandle) -> [KFParticle; 2] {
    let covariance = diagonal_covariance([1e-3; 6]);
    let daughter = |p: [f64; 6], charge: i32, field: FieldHandle| {
        let mass = (1.0 - p[3] * p[3] - p[4] * p[4] - p[5] * p[5]).sqrt();
        KFParticle::from_track(p, covariance, charge, mass, field)
    };
    [
        daughter([0.0, 0.0, 0.0, 0.3, 0.0, 0.0], 1, field.clone()),
        daughter([0.0, 0.0, 0.0, -0.25, 0.05, 0.0], -1, field),
    ]
}

fn jittered_candidates(field: FieldHandle, n: usize, seed: u64) -> Vec<Vec<KFParticle>> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..n)
        .map(|_| {
            let mut daughters = kaon_daughters(field.clone()).to_vec();
            for daughter in &mut daughters {
                daughter.transport_to_ds(rng.f64() * 2.0 - 1.0);
            }
            daughters
        })
        .collect()
}

fn primary_tracks(field: FieldHandle, n: usize, seed: u64) -> Vec<KFParticle> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..n)
        .map(|i| {
            let p = [rng.f64() - 0.5, rng.f64() - 0.5, 2.0 * rng.f64() - 1.0];
            let mut track = KFParticle::from_track(
                [0.0, 0.0, 0.0, p[0], p[1], p[2]],
                diagonal_covariance([0.01, 0.01, 0.01, 1e-3, 1e-3, 1e-3]),
                if i % 2 == 0 { 1 } else { -1 },
                0.13957,
                field.clone(),
            );
            track.transport_to_ds(1.0 + rng.f64());
            track
        })
        .collect()
}

fn candidate_benchmarks(c: &mut Criterion) {
    let fields: [(&str, FieldHandle); 2] = [
        ("uniform", Arc::new(UniformField::new(5.0))),
        (
            "map",
            Arc::new(FieldMap::new(|xyz: &[f64; 3]| {
                [0.0, 0.0, 5.0 / (1.0 + 1e-4 * xyz[2] * xyz[2])]
            })),
        ),
    ];
    let single = ExecutionContext::new(ThreadPolicy::Single).expect("single context");
    #[cfg(feature = "rayon")]
    let pooled = ExecutionContext::new(ThreadPolicy::Dedicated(4)).expect("dedicated pool");

    let mut group = c.benchmark_group("fit_candidates");
    group.sample_size(30);
    group.warm_up_time(Duration::from_millis(800));
    group.measurement_time(Duration::from_secs(2));
    for (field_label, field) in fields {
        for (label, n) in TIERS {
            let candidates = jittered_candidates(field.clone(), n, 0);
            group.throughput(Throughput::Elements(n as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("single_{field_label}"), label),
                &candidates,
                |b, candidates| {
                    b.iter(|| black_box(fit_candidates(&single, candidates, Some(KS_MASS))))
                },
            );
            #[cfg(feature = "rayon")]
            group.bench_with_input(
                BenchmarkId::new(format!("dedicated_4_{field_label}"), label),
                &candidates,
                |b, candidates| {
                    b.iter(|| black_box(fit_candidates(&pooled, candidates, Some(KS_MASS))))
                },
            );
        }
    }
    group.finish();
}

fn primary_vertex_benchmarks(c: &mut Criterion) {
    let field: FieldHandle = Arc::new(UniformField::new(5.0));
    let mut group = c.benchmark_group("construct_primary_vertex");
    for n in [8, 32, 128] {
        let tracks = primary_tracks(field.clone(), n, 1);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &tracks, |b, tracks| {
            b.iter(|| black_box(construct_primary_vertex(tracks, 3.5)))
        });
    }
    group.finish();
}

fn transport_benchmarks(c: &mut Criterion) {
    let fields: [(&str, FieldHandle); 3] = [
        ("line", Arc::new(ZeroField)),
        ("bz", Arc::new(UniformField::new(5.0))),
        (
            "general",
            Arc::new(FieldMap::new(|xyz: &[f64; 3]| {
                [0.0, 0.0, 5.0 / (1.0 + 1e-4 * xyz[2] * xyz[2])]
            })),
        ),
    ];
    let mut group = c.benchmark_group("transport");
    for (label, field) in fields {
        let [track, _] = kaon_daughters(field);
        group.bench_function(label, |b| {
            b.iter_batched(
                || track.clone(),
                |mut t| {
                    t.transport_to_ds(black_box(25.0));
                    t
                },
                BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    transport_benchmarks,
    candidate_benchmarks,
    primary_vertex_benchmarks
);
criterion_main!(benches);
