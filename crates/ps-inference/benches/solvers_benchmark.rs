use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ps_core::{DesignMatrix, Grouping, RandomStructure};
use ps_inference::{LmeConfig, fit_lme, fit_ols};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use std::hint::black_box;

fn dataset(n_groups: usize, per_group: usize, seed: u64) -> (DesignMatrix, Vec<f64>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let z = Normal::new(0.0, 1.0).unwrap();
    let mut rows = Vec::new();
    let mut y = Vec::new();
    let mut ids = Vec::new();
    for g in 0..n_groups {
        let u: f64 = 0.7 * z.sample(&mut rng);
        for _ in 0..per_group {
            let x1: f64 = z.sample(&mut rng);
            let x2: f64 = z.sample(&mut rng);
            rows.push(vec![1.0, x1, x2, x1 * x2]);
            y.push(0.5 * x1 + 0.3 * x2 + 0.2 * x1 * x2 + u + z.sample(&mut rng));
            ids.push(g);
        }
    }
    (DesignMatrix::from_rows(rows).unwrap(), y, ids)
}

fn bench_solvers(c: &mut Criterion) {
    let mut group = c.benchmark_group("fit");
    for &n_groups in &[10usize, 40] {
        let (x, y, ids) = dataset(n_groups, 20, 42);
        let intercept = RandomStructure {
            primary: Grouping { ids: ids.clone(), n_groups },
            nested: None,
            slope_columns: vec![],
        };
        let slopes = RandomStructure { slope_columns: vec![1], ..intercept.clone() };
        let config = LmeConfig::default();

        group.bench_with_input(BenchmarkId::new("ols", n_groups * 20), &n_groups, |b, _| {
            b.iter(|| black_box(fit_ols(&x, &y)))
        });
        group.bench_with_input(BenchmarkId::new("lme_intercept", n_groups * 20), &n_groups, |b, _| {
            b.iter(|| black_box(fit_lme(&x, &y, &intercept, &config)))
        });
        group.bench_with_input(BenchmarkId::new("lme_slopes", n_groups * 20), &n_groups, |b, _| {
            b.iter(|| black_box(fit_lme(&x, &y, &slopes, &config)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_solvers);
criterion_main!(benches);
