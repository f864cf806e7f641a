use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_pcg::Pcg64;
use tempfile::tempdir;
use virial_bins::weights::{FALLBACK_WEIGHT, MIN_WEIGHT};
use virial_bins::{AnalysisError, BinKey, BinStatistics, RunStore, WeightRecomputer, WeightTable};

/// Bins whose means drift with the key and whose spread grows with it, so
/// the recomputed weights have something to balance.
fn skewed_store(seed: u64) -> RunStore {
    let mut rng = Pcg64::seed_from_u64(seed);
    let mut bins = Vec::new();
    let mut steps = 0;
    for k in 0..6u32 {
        let c: u64 = rng.gen_range(50..200);
        let sc = match k {
            0 => 0,
            1 => 1,
            _ => rng.gen_range(2..=c),
        };
        let normal = Normal::new(k as f64, 0.2 + k as f64).unwrap();
        let samples: Vec<Vec<f64>> = (0..sc)
            .map(|_| vec![normal.sample(&mut rng), 0.5 * normal.sample(&mut rng)])
            .collect();
        bins.push((
            BinKey::from([k]),
            BinStatistics::from_samples(c, 2, false, samples.iter().map(|s| s.as_slice())).unwrap(),
        ));
        steps += c;
    }
    RunStore::with_bins(2, false, steps * 3, bins).unwrap()
}

#[test]
fn test_recompute_is_deterministic() {
    let store = skewed_store(1);
    let recomputer = WeightRecomputer::new(8.0).unwrap();
    let (w1, s1) = recomputer.recompute(&store, store.total_steps()).unwrap();
    let (w2, s2) = recomputer.recompute(&store, store.total_steps()).unwrap();
    assert_eq!(w1, w2);
    assert_eq!(s1, s2);
    for ((_, a), (_, b)) in w1.iter().zip(w2.iter()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn test_every_bin_gets_a_positive_weight() {
    let store = skewed_store(2);
    let (weights, summary) = WeightRecomputer::new(4.0)
        .unwrap()
        .recompute(&store, store.total_steps())
        .unwrap();
    assert_eq!(weights.len(), store.len());
    for key in store.keys() {
        let w = weights.get(key).unwrap();
        assert!(w >= MIN_WEIGHT && w <= 1.0, "weight {w} for {key}");
    }
    // unmeasured and single-sample bins are always measured
    assert_eq!(weights.get(&BinKey::from([0])), Some(FALLBACK_WEIGHT));
    assert_eq!(weights.get(&BinKey::from([1])), Some(FALLBACK_WEIGHT));
    assert!(summary.e0 > 0.0);
    assert!(summary.k > 0.0);
    assert!(summary.t0_fraction > 0.0 && summary.t0_fraction < 1.0);
    assert!(summary.var0_fraction() >= 0.0 && summary.var0_fraction() <= 1.0);
}

#[test]
fn test_costlier_measurement_lowers_weights() {
    let store = skewed_store(3);
    let steps = store.total_steps();
    let (cheap, _) = WeightRecomputer::new(1.0).unwrap().recompute(&store, steps).unwrap();
    let (costly, _) = WeightRecomputer::new(100.0).unwrap().recompute(&store, steps).unwrap();
    for (key, w) in costly.iter() {
        assert!(w <= cheap.get(key).unwrap(), "weight rose for {key}");
    }
}

#[test]
fn test_noisier_bins_weigh_more() {
    let bin = |avg: f64, var: f64| BinStatistics::new(100, 50, vec![avg], vec![var]).unwrap();
    let store = RunStore::with_bins(
        1,
        false,
        10_000,
        vec![(BinKey::from([0]), bin(0.0, 0.01)), (BinKey::from([1]), bin(3.0, 4.0))],
    )
    .unwrap();
    let (weights, _) = WeightRecomputer::new(1e4).unwrap().recompute(&store, 10_000).unwrap();
    let quiet = weights.get(&BinKey::from([0])).unwrap();
    let noisy = weights.get(&BinKey::from([1])).unwrap();
    assert!(noisy > quiet);
}

#[test]
fn test_no_between_bin_variance_gives_uniform_weights() {
    let bin = BinStatistics::new(10, 10, vec![0.0], vec![0.0]).unwrap();
    let store = RunStore::with_bins(
        1,
        false,
        20,
        vec![(BinKey::from([0]), bin.clone()), (BinKey::from([1]), bin)],
    )
    .unwrap();
    let (weights, summary) = WeightRecomputer::new(2.0).unwrap().recompute(&store, 20).unwrap();
    assert!(weights.iter().all(|(_, w)| w == FALLBACK_WEIGHT));
    assert_eq!(summary.k, 0.0);
}

#[test]
fn test_invalid_inputs_rejected() {
    for t in [0.0, -1.0, f64::NAN, f64::INFINITY] {
        assert!(matches!(WeightRecomputer::new(t), Err(AnalysisError::Config(_))));
    }
    let store = skewed_store(4);
    let result = WeightRecomputer::new(1.0).unwrap().recompute(&store, 0);
    assert!(matches!(result, Err(AnalysisError::Sampling(_))));
}

#[test]
fn test_weight_file_round_trip() {
    let store = skewed_store(5);
    let (weights, _) = WeightRecomputer::new(3.0)
        .unwrap()
        .recompute(&store, store.total_steps())
        .unwrap();
    let dir = tempdir().unwrap();
    let path = dir.path().join("w.dat");
    weights.save(&path).unwrap();
    assert_eq!(WeightTable::load(&path).unwrap(), weights);
}
