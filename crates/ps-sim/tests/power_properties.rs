//! Statistical properties of the power engine.

use ps_core::Error;
use ps_inference::{Correction, analytical_power_t};
use ps_sim::{PowerAnalysis, PowerConfigBuilder, SampleSizeGrid};

fn margin_pct(p: f64, n_sims: usize) -> f64 {
    100.0 * (3.5 * (p * (1.0 - p) / n_sims as f64).sqrt() + 0.01)
}

fn single_predictor(beta: f64, n_sims: usize, alpha: f64) -> PowerAnalysis {
    let config = PowerConfigBuilder::new("y ~ x1")
        .set_effects([("x1", beta)])
        .set_n_simulations(n_sims)
        .set_alpha(alpha)
        .set_seed(11)
        .build()
        .unwrap();
    PowerAnalysis::new(config)
}

fn power_of(a: &PowerAnalysis, n: usize, test: &str) -> f64 {
    a.find_power(n, test, Correction::None).unwrap().test(test).unwrap().power
}

#[test]
fn power_increases_with_sample_size() {
    let a = single_predictor(0.3, 1000, 0.05);
    let p50 = power_of(&a, 50, "x1");
    let p200 = power_of(&a, 200, "x1");
    let p500 = power_of(&a, 500, "x1");
    assert!(p50 < p200 && p200 < p500, "{p50} {p200} {p500}");
}

#[test]
fn power_increases_with_effect_and_alpha() {
    let weak = power_of(&single_predictor(0.2, 800, 0.05), 80, "x1");
    let strong = power_of(&single_predictor(0.4, 800, 0.05), 80, "x1");
    assert!(weak < strong, "{weak} {strong}");

    // Same draw streams, so a looser alpha can only add rejections.
    let strict = power_of(&single_predictor(0.2, 800, 0.01), 80, "x1");
    let loose = power_of(&single_predictor(0.2, 800, 0.10), 80, "x1");
    assert!(strict <= weak && weak <= loose, "{strict} {weak} {loose}");
}

#[test]
fn type_one_error_is_calibrated() {
    let n_sims = 4000;
    let config = PowerConfigBuilder::new("y ~ x1 + x2")
        .set_n_simulations(n_sims)
        .set_seed(3)
        .build()
        .unwrap();
    let r = PowerAnalysis::new(config).find_power(60, "all", Correction::None).unwrap();
    for t in &r.tests {
        assert!(
            (t.power - 5.0).abs() <= margin_pct(0.05, n_sims),
            "{}: rejection rate {}%",
            t.test,
            t.power
        );
    }
}

#[test]
fn monte_carlo_matches_analytical_power() {
    let n_sims = 3000;
    for (beta, n) in [(0.3, 80), (0.25, 150)] {
        let analytical = 100.0 * analytical_power_t(beta, n, 2, 1.0, 1.0, 0.05).unwrap();
        let mc = power_of(&single_predictor(beta, n_sims, 0.05), n, "x1");
        assert!(
            (mc - analytical).abs() <= margin_pct(analytical / 100.0, n_sims),
            "beta {beta}, n {n}: MC {mc}% vs analytical {analytical}%"
        );
    }
}

#[test]
fn corrections_are_ordered() {
    let config = PowerConfigBuilder::new("y ~ x1 + x2 + x3 + x4")
        .set_effects([("x1", 0.25), ("x2", 0.2), ("x3", 0.15), ("x4", 0.0)])
        .set_n_simulations(1000)
        .set_seed(5)
        .build()
        .unwrap();
    let a = PowerAnalysis::new(config);
    let tests = "x1, x2, x3, x4";
    let run = |c| a.find_power(80, tests, c).unwrap();
    let (none, bonf, holm, fdr) =
        (run(Correction::None), run(Correction::Bonferroni), run(Correction::Holm), run(Correction::Fdr));

    for i in 0..4 {
        let raw = none.tests[i].power;
        let b = bonf.tests[i].corrected_power.unwrap();
        let h = holm.tests[i].corrected_power.unwrap();
        let f = fdr.tests[i].corrected_power.unwrap();
        assert_eq!(bonf.tests[i].power, raw);
        assert!(b <= h && h <= f && f <= raw, "{}: {b} {h} {f} {raw}", none.tests[i].test);
    }
}

#[test]
fn indefinite_correlation_is_rejected_before_simulating() {
    let err = PowerConfigBuilder::new("y ~ a + b + c")
        .set_correlation("a", "b", 0.9)
        .set_correlation("a", "c", 0.9)
        .set_correlation("b", "c", -0.9)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Config(ref m) if m.contains("positive semi-definite")), "{err}");
}

fn interaction_config(n_threads: usize) -> PowerAnalysis {
    let config = PowerConfigBuilder::new("y ~ x1 + x2 + x1:x2")
        .set_effects([("x1", 0.5), ("x2", 0.3), ("x1:x2", 0.2)])
        .set_n_simulations(1600)
        .set_seed(2024)
        .set_parallel(n_threads)
        .build()
        .unwrap();
    PowerAnalysis::new(config)
}

#[test]
fn end_to_end_run_is_reproducible() {
    let first = interaction_config(0).find_power(100, "all", Correction::Holm).unwrap();
    let second = interaction_config(0).find_power(100, "all", Correction::Holm).unwrap();
    let two_threads = interaction_config(2).find_power(100, "all", Correction::Holm).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.tests, two_threads.tests);

    assert_eq!(first.n_valid, 1600);
    assert_eq!(first.sample_size, 100);
    let x1 = first.test("x1").unwrap();
    assert!(x1.power > 90.0, "{}", x1.power);
    let inter = first.test("x1:x2").unwrap();
    assert!(inter.power > 20.0 && inter.power < 75.0, "{}", inter.power);
}

#[test]
fn sample_size_search_reuses_point_streams() {
    let a = single_predictor(0.3, 400, 0.05);
    let search = a.find_sample_size(SampleSizeGrid::new(40, 200, 40), 80.0, "x1", Correction::None).unwrap();
    assert_eq!(search.grid.len(), 5);
    assert_eq!(search.grid[1], a.find_power(80, "x1", Correction::None).unwrap());

    let first = search.first_reaching("x1").unwrap();
    let at = search.grid.iter().find(|r| r.sample_size == first).unwrap();
    assert!(at.test("x1").unwrap().power >= 80.0);
    assert!(search.grid.iter().filter(|r| r.sample_size < first).all(|r| r.test("x1").unwrap().power < 80.0));

    let unreachable = single_predictor(0.05, 200, 0.05)
        .find_sample_size(SampleSizeGrid::new(20, 60, 20), 90.0, "x1", Correction::None)
        .unwrap();
    assert_eq!(unreachable.first_reaching.get("x1"), Some(&None));
}
