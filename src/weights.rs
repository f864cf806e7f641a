// weights.rs - Recompute per-bin sampling weights from merged statistics

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::bin_key::BinKey;
use crate::error::{AnalysisError, Result};
use crate::run_store::RunStore;

/// Weight given to bins without usable statistics: always measure them.
pub const FALLBACK_WEIGHT: f64 = 1.0;

/// Smallest weight handed out. Keeps every weight strictly positive so the
/// sampler never stops measuring a bin altogether.
pub const MIN_WEIGHT: f64 = 1e-6;

/// Probability with which the sampler measures a configuration that falls
/// in each bin.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WeightTable {
    weights: BTreeMap<BinKey, f64>,
}

impl WeightTable {
    pub fn get(&self, key: &BinKey) -> Option<f64> {
        self.weights.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BinKey, f64)> {
        self.weights.iter().map(|(k, w)| (k, *w))
    }

    /// Overwrite `path` with one `[key] weight` line per bin.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| AnalysisError::io(path, e))?;
        let mut out = BufWriter::new(file);
        let written = self
            .weights
            .iter()
            .try_for_each(|(key, w)| writeln!(out, "{key} {w:?}"))
            .and_then(|_| out.flush());
        written.map_err(|e| AnalysisError::io(path, e))
    }

    /// Read a weight file written by [`WeightTable::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<WeightTable> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
        let mut weights = BTreeMap::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let lineno = idx + 1;
            let line = line.map_err(|e| AnalysisError::io(path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let close = line
                .find(']')
                .ok_or_else(|| AnalysisError::parse(path, lineno, "missing bin key"))?;
            let key: BinKey = line[..=close]
                .parse()
                .map_err(|e| AnalysisError::parse(path, lineno, format!("{e}")))?;
            let field = line[close + 1..].trim();
            let weight = field
                .parse::<f64>()
                .ok()
                .filter(|w| w.is_finite() && *w > 0.0)
                .ok_or_else(|| AnalysisError::parse(path, lineno, format!("invalid weight {field:?}")))?;
            weights.insert(key, weight);
        }
        Ok(WeightTable { weights })
    }
}

/// Efficiency figures computed alongside the new weights.
///
/// `e0` is the variance of the grand average due to unequal bin
/// populations, `e1` the within-bin variance under the current weights and
/// `e1_new` the within-bin variance expected under the new ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReweightSummary {
    pub e0: f64,
    pub e1: f64,
    pub e1_new: f64,
    /// Scale from sqrt(variance load) to weight; 0 when weights fell back
    /// to uniform.
    pub k: f64,
    /// Fraction of run time spent generating/screening with current weights.
    pub t0_fraction: f64,
    /// Same fraction expected with the new weights.
    pub t0_fraction_new: f64,
    /// Fraction of unscreened configurations the new weights would measure.
    pub measure_fraction: f64,
    pub difficulty: Difficulty,
}

/// Error × sqrt(time) figures of merit; smaller is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Difficulty {
    pub optimal: f64,
    pub actual: f64,
    pub all_measured: f64,
    pub none_measured: f64,
}

impl ReweightSummary {
    pub fn var0_fraction(&self) -> f64 {
        ratio(self.e0, self.e0 + self.e1)
    }

    pub fn var0_fraction_new(&self) -> f64 {
        ratio(self.e0, self.e0 + self.e1_new)
    }
}

/// Turns merged statistics into a new weight table.
///
/// A bin's weight grows with the square root of its variance load and
/// shrinks with the measurement cost `t_ratio` (time to measure one
/// configuration relative to generating and screening one). The result is
/// a pure function of the store: bins are visited in key order and sums
/// are taken in that order, so repeated calls are bit-identical.
#[derive(Debug, Clone, Copy)]
pub struct WeightRecomputer {
    t_ratio: f64,
    pad_variance: bool,
}

impl WeightRecomputer {
    pub fn new(t_ratio: f64) -> Result<Self> {
        if !t_ratio.is_finite() || t_ratio <= 0.0 {
            return Err(AnalysisError::Config(format!(
                "tRatio must be a positive finite number, got {t_ratio}"
            )));
        }
        Ok(Self { t_ratio, pad_variance: true })
    }

    /// Pad each bin's variance with `mean(x²)/sc` (on by default) so a bin
    /// whose samples happen to agree exactly keeps a nonzero weight.
    pub fn pad_variance(mut self, pad: bool) -> Self {
        self.pad_variance = pad;
        self
    }

    pub fn t_ratio(&self) -> f64 {
        self.t_ratio
    }

    pub fn recompute(&self, store: &RunStore, total_steps: u64) -> Result<(WeightTable, ReweightSummary)> {
        if total_steps == 0 {
            return Err(AnalysisError::Sampling("cannot reweight a run with zero steps".into()));
        }
        let steps = total_steps as f64;
        let n = store.observables();
        let bins: Vec<_> = store.iter().collect();

        let total_sampled = store.total_sampled();
        let mut load = vec![0.0_f64; bins.len()];
        let mut e0 = 0.0;
        let mut e1 = 0.0;
        let mut all_sq = 0.0;

        for i in 0..n {
            let sq: f64 = bins
                .iter()
                .filter(|(_, b)| b.is_measured())
                .map(|(_, b)| b.sample_count() as f64 * (b.vars()[i] + b.avgs()[i] * b.avgs()[i]))
                .sum();
            all_sq += sq;
            let avg_sq = ratio(sq, total_sampled as f64);

            let (mut e0a, mut e0a2) = (0.0, 0.0);
            for (slot, (_, bin)) in load.iter_mut().zip(&bins) {
                let c = bin.unscreened_count() as f64;
                if bin.unscreened_count() == 0 || !bin.is_measured() {
                    continue;
                }
                let sc = bin.sample_count() as f64;
                let avg = bin.avgs()[i];
                let var = bin.vars()[i];
                e0a += c * avg;
                e0a2 += c * avg * avg;
                if self.pad_variance {
                    *slot += avg_sq / sc;
                }
                if bin.sample_count() < 2 {
                    continue;
                }
                *slot += var;
                e1 += c * c / sc * var;
            }

            let mean = e0a / steps;
            // T - 1 keeps E0 positive even when every bin agrees so far
            e0 += e0a2 / (steps - 1.0).max(1.0) - mean * mean;
        }

        e1 /= steps;
        if e1 == 0.0 && self.pad_variance {
            e1 = ratio(ratio(all_sq, total_sampled as f64), total_sampled as f64);
        }

        let k = (1.0 / (e0 * self.t_ratio)).sqrt();
        let usable = e0 > 0.0 && k.is_finite();
        if !usable {
            warn!(e0, "no between-bin variance to balance against, using uniform weights");
        }

        let mut weights = BTreeMap::new();
        let (mut new_t1, mut all_t1, mut e1_new, mut e1_all) = (0.0, 0.0, 0.0, 0.0);
        let mut total_unscreened = 0u64;
        for (l, (key, bin)) in load.iter().zip(&bins) {
            let c = bin.unscreened_count();
            if c == 0 {
                weights.insert((*key).clone(), FALLBACK_WEIGHT);
                continue;
            }
            let w = if !usable || bin.sample_count() < 2 {
                FALLBACK_WEIGHT
            } else {
                (l.sqrt() * k).clamp(MIN_WEIGHT, 1.0)
            };
            weights.insert((*key).clone(), w);

            let c = c as f64;
            total_unscreened += bin.unscreened_count();
            new_t1 += c * w;
            all_t1 += c;
            if *l > 0.0 {
                e1_new += c * l / w;
                e1_all += c * l;
            }
        }

        new_t1 *= self.t_ratio / steps;
        all_t1 *= self.t_ratio / steps;
        e1_new /= steps;
        e1_all /= steps;
        let t0 = steps;
        let t1 = total_sampled as f64 * self.t_ratio;

        let summary = ReweightSummary {
            e0,
            e1,
            e1_new,
            k: if usable { k } else { 0.0 },
            t0_fraction: t0 / (t0 + t1),
            t0_fraction_new: 1.0 / (1.0 + new_t1),
            measure_fraction: ratio(new_t1 * steps / self.t_ratio, total_unscreened as f64),
            difficulty: Difficulty {
                optimal: ((e0 + e1_new) * (1.0 + new_t1)).sqrt(),
                actual: ((e0 + e1) * (1.0 + t1 / t0)).sqrt(),
                all_measured: ((e0 + e1_all) * (1.0 + all_t1)).sqrt(),
                none_measured: (e0 + e1_all).sqrt(),
            },
        };
        info!(
            bins = weights.len(),
            var0_frac = summary.var0_fraction(),
            var0_frac_opt = summary.var0_fraction_new(),
            t0_frac = summary.t0_fraction,
            new_t0_frac = summary.t0_fraction_new,
            measure_frac = summary.measure_fraction,
            "recomputed bin weights"
        );
        Ok((WeightTable { weights }, summary))
    }
}

/// `num / den`, or 0 when the denominator is 0.
fn ratio(num: f64, den: f64) -> f64 {
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}
