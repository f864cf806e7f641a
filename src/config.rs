// config.rs - Run configuration for one analysis pass (TOML + CLI overrides)

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::run_store::observables_for_points;

/// Parameters of an analysis pass.
///
/// Usually read from a TOML file and then patched by command-line flags.
/// `t_ratio` has no default: it is the measured cost of one measurement
/// relative to generating and screening one configuration, and must be
/// supplied for every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Points in the cluster; fixes the number of observables.
    #[serde(default)]
    pub n_points: usize,
    /// File name prefix shared by every run file.
    #[serde(default)]
    pub run_name: String,
    /// Run files to merge, numbered 1 through `n_runs`.
    #[serde(default = "AnalysisConfig::default_n_runs")]
    pub n_runs: usize,
    #[serde(default)]
    pub t_ratio: Option<f64>,
    /// Print every bin after the summary.
    #[serde(default)]
    pub dump_bins: bool,
    /// Report correlations when the run files carry covariances.
    #[serde(default = "AnalysisConfig::default_true")]
    pub covariance: bool,
    /// Parse and merge run files on the rayon pool.
    #[serde(default = "AnalysisConfig::default_true")]
    pub parallel: bool,
    /// Truncate bin keys to this many components before reweighting.
    #[serde(default)]
    pub rebin: Option<usize>,
    /// Components expected in every bin key; inferred per file when unset.
    #[serde(default)]
    pub key_arity: Option<usize>,
    /// Directory holding the run files; outputs are written next to them.
    #[serde(default = "AnalysisConfig::default_directory")]
    pub directory: PathBuf,
}

impl AnalysisConfig {
    fn default_n_runs() -> usize {
        1
    }
    fn default_true() -> bool {
        true
    }
    fn default_directory() -> PathBuf {
        PathBuf::from(".")
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AnalysisError::Config(format!("invalid config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| AnalysisError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Reject incomplete or out-of-range settings before any file is read.
    pub fn validate(&self) -> Result<()> {
        if self.n_points == 0 {
            return Err(AnalysisError::Config("n_points must be at least 1".into()));
        }
        if self.run_name.is_empty() {
            return Err(AnalysisError::Config("run_name is required".into()));
        }
        if self.n_runs == 0 {
            return Err(AnalysisError::Config("n_runs must be at least 1".into()));
        }
        self.t_ratio()?;
        if self.key_arity == Some(0) {
            return Err(AnalysisError::Config("key_arity must be at least 1".into()));
        }
        if self.rebin == Some(0) {
            return Err(AnalysisError::Config("rebin arity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn t_ratio(&self) -> Result<f64> {
        match self.t_ratio {
            None => Err(AnalysisError::Config(
                "tRatio is required (measurement cost relative to screening)".into(),
            )),
            Some(t) if !t.is_finite() || t <= 0.0 => Err(AnalysisError::Config(format!(
                "tRatio must be a positive finite number, got {t}"
            ))),
            Some(t) => Ok(t),
        }
    }

    pub fn observables(&self) -> usize {
        observables_for_points(self.n_points)
    }

    fn stem(&self) -> String {
        format!("{}{}", self.run_name, self.n_points)
    }

    /// `{run_name}{n_points}_run{k}_raw.dat` for k = 1..=n_runs.
    pub fn run_paths(&self) -> Vec<PathBuf> {
        (1..=self.n_runs)
            .map(|k| self.directory.join(format!("{}_run{k}_raw.dat", self.stem())))
            .collect()
    }

    pub fn merged_path(&self) -> PathBuf {
        self.directory.join(format!("{}_all.dat", self.stem()))
    }

    pub fn weights_path(&self) -> PathBuf {
        self.directory.join(format!("{}_weights.dat", self.stem()))
    }

    pub fn report_csv_path(&self) -> PathBuf {
        self.directory.join(format!("{}_report.csv", self.stem()))
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            n_points: 0,
            run_name: String::new(),
            n_runs: Self::default_n_runs(),
            t_ratio: None,
            dump_bins: false,
            covariance: true,
            parallel: true,
            rebin: None,
            key_arity: None,
            directory: Self::default_directory(),
        }
    }
}
