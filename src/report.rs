// report.rs - Pooled averages, error bars and correlations from merged bins

use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use csv::WriterBuilder;
use nalgebra::DMatrix;
use tracing::debug;

use crate::error::{AnalysisError, Result};
use crate::run_store::RunStore;

/// Final estimate for one observable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObservableEstimate {
    pub index: usize,
    /// Grand average over all bins, normalized by the total step count.
    pub average: f64,
    /// One-sigma error including the between-bin term.
    pub error: f64,
    /// Variance from the spread of per-bin averages (E0).
    pub between_bin_variance: f64,
    /// Within-bin sampling variance, per step.
    pub within_bin_error: f64,
    /// Share of the total variance due to the between-bin term.
    pub variance_fraction: f64,
}

/// Everything printed at the end of an analysis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub total_steps: u64,
    pub bins: usize,
    pub total_sampled: u64,
    pub total_unscreened: u64,
    pub t_ratio: f64,
    pub observables: Vec<ObservableEstimate>,
    /// Centered pooled covariance, per step. Present only when covariance
    /// was requested and tracked by every input.
    pub covariance: Option<DMatrix<f64>>,
    pub correlation: Option<DMatrix<f64>>,
}

impl Report {
    /// Share of the run time spent generating and screening rather than
    /// measuring.
    pub fn time_fraction(&self) -> f64 {
        let t = self.total_steps as f64;
        t / (t + self.total_sampled as f64 * self.t_ratio)
    }

    /// Fraction of generated configurations that passed screening.
    pub fn unscreened_fraction(&self) -> f64 {
        self.total_unscreened as f64 / self.total_steps as f64
    }

    /// Fraction of unscreened configurations that were measured.
    pub fn measured_fraction(&self) -> f64 {
        if self.total_unscreened == 0 {
            return 0.0;
        }
        self.total_sampled as f64 / self.total_unscreened as f64
    }

    /// Per-observable table as CSV.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let to_io = |e: csv::Error| AnalysisError::io(path, io::Error::from(e));
        let mut wtr = WriterBuilder::new().from_path(path).map_err(to_io)?;
        wtr.write_record([
            "index",
            "average",
            "error",
            "between_bin_variance",
            "within_bin_error",
            "variance_fraction",
        ])
        .map_err(to_io)?;
        for o in &self.observables {
            wtr.write_record(&[
                o.index.to_string(),
                o.average.to_string(),
                o.error.to_string(),
                o.between_bin_variance.to_string(),
                o.within_bin_error.to_string(),
                o.variance_fraction.to_string(),
            ])
            .map_err(to_io)?;
        }
        wtr.flush().map_err(|e| AnalysisError::io(path, e))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} sets", self.bins)?;
        writeln!(f)?;
        for o in &self.observables {
            writeln!(
                f,
                "{:2} average: {:21.14e}   error: {:11.5e}   # var frac: {:5.3}",
                o.index, o.average, o.error, o.variance_fraction
            )?;
        }
        if let Some(corr) = &self.correlation {
            writeln!(f)?;
            writeln!(f, "Correlations:")?;
            for j in 0..corr.nrows() {
                write!(f, "{j:2} ")?;
                for k in 0..corr.ncols() {
                    write!(f, " {:7.4}", corr[(j, k)])?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f)?;
        writeln!(f, "total steps: {}", self.total_steps)?;
        writeln!(f, "number time fraction: {}", self.time_fraction())?;
        writeln!(f, "fraction not screened: {}", self.unscreened_fraction())?;
        write!(f, "fraction measured: {}", self.measured_fraction())
    }
}

/// Sums accumulated bin by bin, kept apart until the final combination.
struct PooledSums {
    e0a: Vec<f64>,
    e0a2: Vec<f64>,
    err_stdev: Vec<f64>,
    cov: Option<DMatrix<f64>>,
}

impl PooledSums {
    fn accumulate(store: &RunStore, covariance: bool) -> Self {
        let n = store.observables();
        let mut sums = PooledSums {
            e0a: vec![0.0; n],
            e0a2: vec![0.0; n],
            err_stdev: vec![0.0; n],
            cov: covariance.then(|| DMatrix::zeros(n, n)),
        };
        for (_, bin) in store.iter() {
            if !bin.is_measured() {
                continue;
            }
            let c = bin.unscreened_count() as f64;
            let sc = bin.sample_count() as f64;
            let avg = bin.avgs();
            for i in 0..n {
                let var = bin.vars()[i];
                sums.e0a[i] += c * avg[i];
                sums.e0a2[i] += c * avg[i] * avg[i];
                if var > 0.0 {
                    sums.err_stdev[i] += var / sc * c * c;
                }
            }
            if let Some(cov) = sums.cov.as_mut() {
                for i in 0..n {
                    for j in 0..n {
                        let cij = bin.cov(i, j).unwrap_or(0.0);
                        cov[(i, j)] += c * (cij + avg[i] * avg[j]);
                    }
                }
            }
        }
        sums
    }
}

/// Combines merged bins into the final [`Report`].
#[derive(Debug, Clone, Copy)]
pub struct ResultReporter {
    t_ratio: f64,
}

impl ResultReporter {
    /// `t_ratio` is the measurement cost relative to generating and
    /// screening one configuration; it only enters the time-fraction line.
    pub fn new(t_ratio: f64) -> Result<Self> {
        if !t_ratio.is_finite() || t_ratio <= 0.0 {
            return Err(AnalysisError::Config(format!(
                "tRatio must be a positive finite number, got {t_ratio}"
            )));
        }
        Ok(Self { t_ratio })
    }

    /// Pool every measured bin. Correlations are produced when `covariance`
    /// is set and the store carries covariance data.
    pub fn aggregate(&self, store: &RunStore, total_steps: u64, covariance: bool) -> Result<Report> {
        if total_steps == 0 {
            return Err(AnalysisError::Sampling("total step count is zero".into()));
        }
        let with_cov = covariance && store.tracks_covariance();
        if covariance && !with_cov {
            debug!("covariance requested but not tracked by the merged runs");
        }
        let steps = total_steps as f64;
        let sums = PooledSums::accumulate(store, with_cov);

        let mut observables = Vec::with_capacity(store.observables());
        let mut means = Vec::with_capacity(store.observables());
        for i in 0..store.observables() {
            let average = sums.e0a[i] / steps;
            let between = (sums.e0a2[i] / steps - average * average).max(0.0);
            let within = sums.err_stdev[i] / steps;
            let total = within + between;
            let error = (total / steps).sqrt();
            if !average.is_finite() || !error.is_finite() {
                return Err(AnalysisError::Sampling(format!(
                    "observable {i} pooled to a non-finite value"
                )));
            }
            let variance_fraction = if total == 0.0 { 0.0 } else { between / total };
            means.push(average);
            observables.push(ObservableEstimate {
                index: i,
                average,
                error,
                between_bin_variance: between,
                within_bin_error: within,
                variance_fraction,
            });
        }

        let (covariance, correlation) = match sums.cov {
            Some(mut cov) => {
                let n = cov.nrows();
                for j in 0..n {
                    for k in 0..n {
                        cov[(j, k)] -= means[j] * means[k] * steps;
                    }
                }
                let corr = correlation_matrix(&cov);
                (Some(cov / steps), Some(corr))
            }
            None => (None, None),
        };

        Ok(Report {
            total_steps,
            bins: store.len(),
            total_sampled: store.total_sampled(),
            total_unscreened: store.total_unscreened(),
            t_ratio: self.t_ratio,
            observables,
            covariance,
            correlation,
        })
    }
}

/// `cov[j][k] / sqrt(cov[j][j] cov[k][k])`, with an exactly-zero covariance
/// (or a degenerate denominator) mapped to 0.
pub fn correlation_matrix(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows();
    DMatrix::from_fn(n, n, |j, k| {
        let c = cov[(j, k)];
        if c == 0.0 {
            return 0.0;
        }
        if j == k {
            return if c > 0.0 { 1.0 } else { 0.0 };
        }
        let d = (cov[(j, j)] * cov[(k, k)]).sqrt();
        if d > 0.0 && d.is_finite() {
            (c / d).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    })
}

/// Detailed per-bin listing: key, counts and `avg ± sqrt(var/sc)` for every
/// observable.
pub fn dump_bins<W: Write>(store: &RunStore, out: &mut W) -> io::Result<()> {
    for (key, bin) in store.iter() {
        write!(out, "{key} {} {}", bin.unscreened_count(), bin.sample_count())?;
        if !bin.is_measured() {
            writeln!(out, " unmeasured")?;
            continue;
        }
        let sc = bin.sample_count() as f64;
        for (avg, var) in bin.avgs().iter().zip(bin.vars()) {
            write!(out, "  {avg:.6e} ± {:.3e}", (var / sc).sqrt())?;
        }
        writeln!(out)?;
    }
    Ok(())
}
