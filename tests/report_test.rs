use std::fs;

use approx::assert_abs_diff_eq;
use nalgebra::DMatrix;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;
use tempfile::tempdir;
use virial_bins::report::correlation_matrix;
use virial_bins::{
    dump_bins, Aggregator, AnalysisConfig, AnalysisError, BinKey, BinStatistics, ResultReporter, RunStore,
};

#[test]
fn test_two_identical_runs_end_to_end() {
    let dir = tempdir().unwrap();
    let cfg = AnalysisConfig::from_toml_str(&format!(
        "n_points = 1\nrun_name = \"sw\"\nn_runs = 2\nt_ratio = 5.0\ndirectory = {:?}\n",
        dir.path().display().to_string()
    ))
    .unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.observables(), 1);
    for path in cfg.run_paths() {
        fs::write(path, "100\n[0] 100 100 2.0 1.0\n").unwrap();
    }

    let store = Aggregator::new(cfg.observables())
        .consolidate(&cfg.run_paths(), cfg.merged_path())
        .unwrap();
    assert!(cfg.merged_path().exists());
    let bin = store.get(&BinKey::from([0])).unwrap();
    assert_eq!(bin.unscreened_count(), 200);
    assert_eq!(bin.sample_count(), 200);
    assert_eq!(bin.avg(0), Some(2.0));
    assert_eq!(store.total_steps(), 200);

    let report = ResultReporter::new(cfg.t_ratio().unwrap())
        .unwrap()
        .aggregate(&store, store.total_steps(), true)
        .unwrap();
    let obs = report.observables[0];
    assert_eq!(obs.average, 2.0);
    assert_eq!(obs.between_bin_variance, 0.0);
    assert_abs_diff_eq!(obs.within_bin_error, 1.0, epsilon = 1e-15);
    assert_abs_diff_eq!(obs.error, 0.005_f64.sqrt(), epsilon = 1e-15);
    assert_abs_diff_eq!(obs.error, 0.0707106781, epsilon = 1e-9);
    assert_eq!(obs.variance_fraction, 0.0);
    assert_eq!(report.unscreened_fraction(), 1.0);
    assert_eq!(report.measured_fraction(), 1.0);
    assert_abs_diff_eq!(report.time_fraction(), 200.0 / (200.0 + 200.0 * 5.0), epsilon = 1e-15);

    report.write_csv(cfg.report_csv_path()).unwrap();
    let csv = fs::read_to_string(cfg.report_csv_path()).unwrap();
    let mut lines = csv.lines();
    assert!(lines.next().unwrap().starts_with("index,average,error"));
    assert!(lines.next().unwrap().starts_with("0,2,"));
}

#[test]
fn test_between_bin_spread_enters_error() {
    let bin = |avg: f64| BinStatistics::new(50, 50, vec![avg], vec![0.0]).unwrap();
    let store = RunStore::with_bins(
        1,
        false,
        100,
        vec![(BinKey::from([0]), bin(1.0)), (BinKey::from([1]), bin(3.0))],
    )
    .unwrap();
    let report = ResultReporter::new(1.0).unwrap().aggregate(&store, 100, false).unwrap();
    let obs = report.observables[0];
    assert_abs_diff_eq!(obs.average, 2.0, epsilon = 1e-15);
    assert_abs_diff_eq!(obs.between_bin_variance, 1.0, epsilon = 1e-12);
    assert_eq!(obs.within_bin_error, 0.0);
    assert_eq!(obs.variance_fraction, 1.0);
    assert_abs_diff_eq!(obs.error, 0.1, epsilon = 1e-12);
    assert!(report.correlation.is_none());
}

#[test]
fn test_unmeasured_bins_are_safe() {
    let store = RunStore::with_bins(
        2,
        true,
        300,
        vec![
            (BinKey::from([0, 0]), BinStatistics::unmeasured(120, 2, true)),
            (
                BinKey::from([0, 1]),
                BinStatistics::new(80, 40, vec![1.0, -1.0], vec![0.5, 0.5])
                    .unwrap()
                    .with_covariance(vec![0.1])
                    .unwrap(),
            ),
        ],
    )
    .unwrap();
    let report = ResultReporter::new(2.0).unwrap().aggregate(&store, 300, true).unwrap();
    assert_eq!(report.total_unscreened, 200);
    assert_eq!(report.total_sampled, 40);
    for obs in &report.observables {
        assert!(obs.average.is_finite() && obs.error.is_finite());
    }
    assert_abs_diff_eq!(report.observables[0].average, 80.0 / 300.0, epsilon = 1e-15);
    let corr = report.correlation.unwrap();
    assert!(corr.iter().all(|c| c.is_finite()));

    let mut dump = Vec::new();
    dump_bins(&store, &mut dump).unwrap();
    let text = String::from_utf8(dump).unwrap();
    assert!(text.lines().next().unwrap().starts_with("[0, 0] 120 0 unmeasured"));
    assert_eq!(text.lines().count(), 2);
}

#[test]
fn test_correlations_bounded() {
    let mut rng = Pcg64::seed_from_u64(99);
    let normal = Normal::new(0.0, 1.0).unwrap();
    let mut bins = Vec::new();
    for k in 0..8u32 {
        let c: u64 = rng.gen_range(20..80);
        let samples: Vec<Vec<f64>> = (0..c)
            .map(|_| {
                let x: f64 = normal.sample(&mut rng);
                let y: f64 = normal.sample(&mut rng);
                vec![x + k as f64, 0.9 * x + 0.1 * y, -x, y * y]
            })
            .collect();
        bins.push((
            BinKey::from([k]),
            BinStatistics::from_samples(c, 4, true, samples.iter().map(|s| s.as_slice())).unwrap(),
        ));
    }
    let steps = bins.iter().map(|(_, b)| b.unscreened_count()).sum::<u64>() * 2;
    let store = RunStore::with_bins(4, true, steps, bins).unwrap();
    let report = ResultReporter::new(1.0).unwrap().aggregate(&store, steps, true).unwrap();
    let corr = report.correlation.unwrap();
    for j in 0..4 {
        assert_eq!(corr[(j, j)], 1.0);
        for k in 0..4 {
            assert!((-1.0..=1.0).contains(&corr[(j, k)]));
            assert_eq!(corr[(j, k)], corr[(k, j)]);
        }
    }
    assert!(report.covariance.is_some());
}

#[test]
fn test_zero_covariance_reports_zero_correlation() {
    // second observable is identically zero
    let samples: Vec<[f64; 2]> = (0..10).map(|k| [k as f64, 0.0]).collect();
    let bin = BinStatistics::from_samples(10, 2, true, samples.iter().map(|s| s.as_slice())).unwrap();
    let store = RunStore::with_bins(2, true, 10, vec![(BinKey::from([0]), bin)]).unwrap();
    let report = ResultReporter::new(1.0).unwrap().aggregate(&store, 10, true).unwrap();
    let corr = report.correlation.unwrap();
    assert_eq!(corr[(0, 0)], 1.0);
    assert_eq!(corr[(0, 1)], 0.0);
    assert_eq!(corr[(1, 0)], 0.0);
    assert_eq!(corr[(1, 1)], 0.0);

    let degenerate = DMatrix::from_row_slice(2, 2, &[0.0, 1e-3, 1e-3, 4.0]);
    let c = correlation_matrix(&degenerate);
    assert_eq!(c[(0, 1)], 0.0);
    assert_eq!(c[(1, 1)], 1.0);
}

#[test]
fn test_zero_steps_is_sampling_error() {
    let store = RunStore::empty(3);
    let result = ResultReporter::new(1.0).unwrap().aggregate(&store, 0, false);
    assert!(matches!(result, Err(AnalysisError::Sampling(_))));
}

#[test]
fn test_missing_t_ratio_is_config_error() {
    let cfg = AnalysisConfig::from_toml_str("n_points = 3\nrun_name = \"hs\"\nn_runs = 4\n").unwrap();
    assert!(matches!(cfg.validate(), Err(AnalysisError::Config(_))));
    assert!(matches!(ResultReporter::new(-2.0), Err(AnalysisError::Config(_))));
}

#[test]
fn test_report_text_layout() {
    let bin = BinStatistics::new(10, 10, vec![1.5, 2.5], vec![0.25, 0.5])
        .unwrap()
        .with_covariance(vec![0.1])
        .unwrap();
    let store = RunStore::with_bins(2, true, 10, vec![(BinKey::from([1, 2]), bin)]).unwrap();
    let text = ResultReporter::new(1.0).unwrap().aggregate(&store, 10, true).unwrap().to_string();
    assert!(text.starts_with("1 sets"));
    assert!(text.contains(" 0 average: "));
    assert!(text.contains("# var frac:"));
    assert!(text.contains("Correlations:"));
    assert!(text.contains("fraction measured: 1"));
}
