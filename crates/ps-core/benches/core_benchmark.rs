use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ps_core::FitResult;
use std::hint::black_box;

fn make_fit_result(n: usize) -> FitResult {
    // Positive definite covariance: A*A^T + eps*I.
    let mut a = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..n {
            a[i * n + j] = ((i + 1) as f64) * 1e-3 + ((j + 1) as f64) * 1e-4;
        }
    }

    let mut cov = vec![0.0f64; n * n];
    for i in 0..n {
        for j in 0..n {
            let mut s = 0.0;
            for k in 0..n {
                s += a[i * n + k] * a[j * n + k];
            }
            cov[i * n + j] = s;
        }
        cov[i * n + i] += 1e-3;
    }

    let std_errors = (0..n).map(|i| cov[i * n + i].sqrt()).collect::<Vec<_>>();
    FitResult {
        coefficients: vec![1.0; n],
        std_errors,
        covariance: cov,
        df_residual: 100.0,
        f_statistic: 1.0,
        f_df: n - 1,
        sigma2: 1.0,
        variance_components: vec![],
        converged: true,
        n_evaluations: 10,
    }
}

fn bench_pairwise_contrasts(c: &mut Criterion) {
    let mut group = c.benchmark_group("core_fitresult");

    for n in [4usize, 16, 64] {
        let fr = make_fit_result(n);
        group.bench_with_input(BenchmarkId::new("contrast_all_pairs", n), &n, |b, &nn| {
            b.iter(|| {
                let mut acc = 0.0;
                for i in 0..nn {
                    for j in (i + 1)..nn {
                        acc += fr.contrast(Some(i), Some(j)).map(|(_, se)| se).unwrap_or(0.0);
                    }
                }
                black_box(acc)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pairwise_contrasts);
criterion_main!(benches);
