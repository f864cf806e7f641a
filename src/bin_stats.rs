// bin_stats.rs - Per-bin sample statistics and their pooled combination

use std::cmp::Ordering;
use std::fmt;

use crate::error::{AnalysisError, Result};

/// Number of strictly-upper-triangle pairs for `n` observables.
pub fn pair_count(n: usize) -> usize {
    n * n.saturating_sub(1) / 2
}

/// Row-major index of pair `(i, j)`, `i < j`, in the strict upper triangle.
pub(crate) fn pair_index(n: usize, i: usize, j: usize) -> usize {
    debug_assert!(i < j && j < n);
    (2 * n - i - 1) * i / 2 + (j - i - 1)
}

/// Accumulated statistics of one bin for a fixed-size vector of observables.
///
/// `avg`/`var`/`cov` describe the `sampled` measured configurations. When
/// several runs are pooled the moments are weighted by the unscreened count
/// of each measured contribution; `pooled` is that total weight. For a
/// bin that was never measured the moments are zero placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct BinStatistics {
    unscreened: u64,
    sampled: u64,
    pooled: u64,
    avg: Vec<f64>,
    var: Vec<f64>,
    /// Strict upper triangle of the covariance matrix; the diagonal is `var`.
    cov: Option<Vec<f64>>,
}

/// Why a set of raw numbers does not describe a valid bin.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidBin {
    SampledExceedsUnscreened { unscreened: u64, sampled: u64 },
    LengthMismatch { expected: usize, found: usize },
    NonFinite,
    NegativeVariance { index: usize, value: f64 },
    PooledWeight { unscreened: u64, sampled: u64, pooled: u64 },
}

impl fmt::Display for InvalidBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidBin::SampledExceedsUnscreened { unscreened, sampled } => write!(
                f,
                "sample count {sampled} exceeds unscreened count {unscreened}"
            ),
            InvalidBin::LengthMismatch { expected, found } => {
                write!(f, "expected {expected} values, found {found}")
            }
            InvalidBin::NonFinite => f.write_str("non-finite statistic"),
            InvalidBin::NegativeVariance { index, value } => {
                write!(f, "negative variance {value} for observable {index}")
            }
            InvalidBin::PooledWeight { unscreened, sampled, pooled } => write!(
                f,
                "pooled weight {pooled} outside {sampled}..={unscreened}"
            ),
        }
    }
}

impl std::error::Error for InvalidBin {}

impl BinStatistics {
    /// Bin that passed screening `unscreened` times but was never measured.
    pub fn unmeasured(unscreened: u64, observables: usize, covariance: bool) -> Self {
        Self {
            unscreened,
            sampled: 0,
            pooled: 0,
            avg: vec![0.0; observables],
            var: vec![0.0; observables],
            cov: covariance.then(|| vec![0.0; pair_count(observables)]),
        }
    }

    /// Bin from stored summary statistics. A bin with `sampled == 0` keeps
    /// only its counts.
    pub fn new(
        unscreened: u64,
        sampled: u64,
        avg: Vec<f64>,
        var: Vec<f64>,
    ) -> std::result::Result<Self, InvalidBin> {
        if sampled > unscreened {
            return Err(InvalidBin::SampledExceedsUnscreened { unscreened, sampled });
        }
        if avg.len() != var.len() {
            return Err(InvalidBin::LengthMismatch { expected: avg.len(), found: var.len() });
        }
        if sampled == 0 {
            return Ok(Self::unmeasured(unscreened, avg.len(), false));
        }
        if avg.iter().chain(var.iter()).any(|x| !x.is_finite()) {
            return Err(InvalidBin::NonFinite);
        }
        if let Some((index, &value)) = var.iter().enumerate().find(|(_, v)| **v < 0.0) {
            return Err(InvalidBin::NegativeVariance { index, value });
        }
        Ok(Self { unscreened, sampled, pooled: unscreened, avg, var, cov: None })
    }

    /// Attach off-diagonal covariances (strict upper triangle, row-major).
    pub fn with_covariance(mut self, upper: Vec<f64>) -> std::result::Result<Self, InvalidBin> {
        let expected = pair_count(self.avg.len());
        if upper.len() != expected {
            return Err(InvalidBin::LengthMismatch { expected, found: upper.len() });
        }
        if self.sampled == 0 {
            self.cov = Some(vec![0.0; expected]);
            return Ok(self);
        }
        if upper.iter().any(|x| !x.is_finite()) {
            return Err(InvalidBin::NonFinite);
        }
        self.cov = Some(upper);
        Ok(self)
    }

    /// Restore the pooling weight saved alongside a merged bin. A measured
    /// bin needs `sampled <= pooled <= unscreened`; an unmeasured one needs 0.
    pub fn with_pooled_weight(mut self, pooled: u64) -> std::result::Result<Self, InvalidBin> {
        let valid = if self.sampled == 0 {
            pooled == 0
        } else {
            pooled >= self.sampled && pooled <= self.unscreened
        };
        if !valid {
            return Err(InvalidBin::PooledWeight {
                unscreened: self.unscreened,
                sampled: self.sampled,
                pooled,
            });
        }
        self.pooled = pooled;
        Ok(self)
    }

    /// Statistics of raw measured values (one slice per configuration),
    /// `unscreened` being the number of configurations that passed
    /// screening, measured or not.
    pub fn from_samples<'a, I>(
        unscreened: u64,
        observables: usize,
        covariance: bool,
        samples: I,
    ) -> std::result::Result<Self, InvalidBin>
    where
        I: IntoIterator<Item = &'a [f64]>,
    {
        let mut acc = SampleAccumulator::new(observables, covariance);
        for values in samples {
            acc.push(values)?;
        }
        acc.finish(unscreened)
    }

    pub fn unscreened_count(&self) -> u64 {
        self.unscreened
    }

    pub fn sample_count(&self) -> u64 {
        self.sampled
    }

    pub fn is_measured(&self) -> bool {
        self.sampled > 0
    }

    pub fn observables(&self) -> usize {
        self.avg.len()
    }

    pub fn tracks_covariance(&self) -> bool {
        self.cov.is_some()
    }

    /// Sum of unscreened counts over the measured contributions.
    pub fn pooled_weight(&self) -> u64 {
        self.pooled
    }

    pub fn avg(&self, i: usize) -> Option<f64> {
        self.is_measured().then(|| self.avg[i])
    }

    pub fn var(&self, i: usize) -> Option<f64> {
        self.is_measured().then(|| self.var[i])
    }

    /// Covariance of observables `i` and `j`; `cov(i, i)` is the variance.
    pub fn cov(&self, i: usize, j: usize) -> Option<f64> {
        if !self.is_measured() {
            return None;
        }
        match i.cmp(&j) {
            Ordering::Equal => Some(self.var[i]),
            Ordering::Greater => self.cov(j, i),
            Ordering::Less => {
                let n = self.avg.len();
                self.cov.as_ref().map(|c| c[pair_index(n, i, j)])
            }
        }
    }

    pub fn avgs(&self) -> &[f64] {
        &self.avg
    }

    pub fn vars(&self) -> &[f64] {
        &self.var
    }

    pub fn cov_upper(&self) -> Option<&[f64]> {
        self.cov.as_deref()
    }

    /// Copy without covariance tracking.
    pub fn without_covariance(&self) -> Self {
        Self { cov: None, ..self.clone() }
    }

    /// Pooled combination of two disjoint samples of the same bin.
    ///
    /// Counts add. Moments are combined with the parallel-moments rule,
    /// weighting each side by its unscreened count. Covariance survives only
    /// if both sides track it. The operands are put in a canonical order
    /// first, so `a.merge(b)` and `b.merge(a)` are bit-identical.
    pub fn merge(&self, other: &BinStatistics) -> Result<BinStatistics> {
        if self.observables() != other.observables() {
            return Err(AnalysisError::Layout {
                expected: self.observables(),
                found: other.observables(),
            });
        }
        let (base, more) = if canonical_order(self, other) == Ordering::Less {
            (other, self)
        } else {
            (self, other)
        };

        let unscreened = base.unscreened + more.unscreened;
        let sampled = base.sampled + more.sampled;
        let keep_cov = base.cov.is_some() && more.cov.is_some();
        let n = base.observables();

        if more.pooled == 0 || base.pooled == 0 {
            let src = if base.pooled == 0 { more } else { base };
            let cov = if keep_cov { src.cov.clone() } else { None };
            return Ok(BinStatistics {
                unscreened,
                sampled,
                pooled: base.pooled + more.pooled,
                avg: src.avg.clone(),
                var: src.var.clone(),
                cov,
            });
        }

        let pooled = base.pooled + more.pooled;
        let f = more.pooled as f64 / pooled as f64;
        let g = base.pooled as f64 / pooled as f64;
        let delta: Vec<f64> = more.avg.iter().zip(&base.avg).map(|(m, b)| m - b).collect();

        let avg: Vec<f64> = base.avg.iter().zip(&delta).map(|(b, d)| b + f * d).collect();
        let var: Vec<f64> = (0..n)
            .map(|i| {
                let v = base.var[i] + f * (more.var[i] - base.var[i]) + f * g * delta[i] * delta[i];
                v.max(0.0)
            })
            .collect();

        let cov = match (&base.cov, &more.cov) {
            (Some(cb), Some(cm)) => {
                let mut out = Vec::with_capacity(cb.len());
                for i in 0..n {
                    for j in (i + 1)..n {
                        let k = pair_index(n, i, j);
                        out.push(cb[k] + f * (cm[k] - cb[k]) + f * g * delta[i] * delta[j]);
                    }
                }
                Some(out)
            }
            _ => None,
        };

        Ok(BinStatistics { unscreened, sampled, pooled, avg, var, cov })
    }
}

/// Larger pooled weight first; ties broken by counts and then bitwise on the
/// moments so the order is total.
fn canonical_order(a: &BinStatistics, b: &BinStatistics) -> Ordering {
    a.pooled
        .cmp(&b.pooled)
        .then(a.sampled.cmp(&b.sampled))
        .then(a.unscreened.cmp(&b.unscreened))
        .then_with(|| cmp_f64s(&a.avg, &b.avg))
        .then_with(|| cmp_f64s(&a.var, &b.var))
        .then_with(|| match (&a.cov, &b.cov) {
            (Some(x), Some(y)) => cmp_f64s(x, y),
            (x, y) => x.is_some().cmp(&y.is_some()),
        })
}

fn cmp_f64s(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Welford accumulation of raw measurements into a bin.
#[derive(Debug, Clone)]
pub struct SampleAccumulator {
    n: u64,
    mean: Vec<f64>,
    m2: Vec<f64>,
    co: Option<Vec<f64>>,
}

impl SampleAccumulator {
    pub fn new(observables: usize, covariance: bool) -> Self {
        Self {
            n: 0,
            mean: vec![0.0; observables],
            m2: vec![0.0; observables],
            co: covariance.then(|| vec![0.0; pair_count(observables)]),
        }
    }

    pub fn push(&mut self, values: &[f64]) -> std::result::Result<(), InvalidBin> {
        let n = self.mean.len();
        if values.len() != n {
            return Err(InvalidBin::LengthMismatch { expected: n, found: values.len() });
        }
        if values.iter().any(|x| !x.is_finite()) {
            return Err(InvalidBin::NonFinite);
        }
        self.n += 1;
        let count = self.n as f64;
        let old: Vec<f64> = values.iter().zip(&self.mean).map(|(x, m)| x - m).collect();
        for i in 0..n {
            self.mean[i] += old[i] / count;
            self.m2[i] += old[i] * (values[i] - self.mean[i]);
        }
        if let Some(co) = self.co.as_mut() {
            for i in 0..n {
                for j in (i + 1)..n {
                    co[pair_index(n, i, j)] += old[i] * (values[j] - self.mean[j]);
                }
            }
        }
        Ok(())
    }

    /// Population moments (divided by the sample count, not `n - 1`).
    pub fn finish(self, unscreened: u64) -> std::result::Result<BinStatistics, InvalidBin> {
        let n = self.mean.len();
        let covariance = self.co.is_some();
        if self.n == 0 {
            return Ok(BinStatistics::unmeasured(unscreened, n, covariance));
        }
        let count = self.n as f64;
        let var = self.m2.iter().map(|m| (m / count).max(0.0)).collect();
        let stats = BinStatistics::new(unscreened, self.n, self.mean, var)?;
        match self.co {
            Some(co) => stats.with_covariance(co.into_iter().map(|c| c / count).collect()),
            None => Ok(stats),
        }
    }
}
