// aggregate.rs - Merge many independent run files into one combined store

use std::path::Path;

use indicatif::ProgressBar;
use rayon::prelude::*;
use tracing::info;

use crate::error::{AnalysisError, Result};
use crate::run_store::RunStore;

/// Loads run files and reduces them to a single [`RunStore`].
///
/// Because pooling is associative and commutative, files can be parsed on
/// the rayon pool and reduced pairwise in whatever shape rayon picks; the
/// sequential mode folds strictly in the order given.
#[derive(Debug, Clone)]
pub struct Aggregator {
    observables: usize,
    parallel: bool,
    key_arity: Option<usize>,
    progress: Option<ProgressBar>,
}

impl Aggregator {
    pub fn new(observables: usize) -> Self {
        Self { observables, parallel: true, key_arity: None, progress: None }
    }

    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Reject any bin line whose key does not have `arity` components.
    pub fn key_arity(mut self, arity: Option<usize>) -> Self {
        self.key_arity = arity;
        self
    }

    /// Tick `bar` once per file read.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Load and merge every file. Any missing or malformed file aborts the
    /// whole load; there is no partial result.
    pub fn load<P>(&self, paths: &[P]) -> Result<RunStore>
    where
        P: AsRef<Path> + Sync,
    {
        if paths.is_empty() {
            return Err(AnalysisError::Config("no run files to merge".into()));
        }
        let (observables, key_arity) = (self.observables, self.key_arity);
        let read = |path: &P| {
            let store = RunStore::load_with_arity(path, observables, key_arity);
            if let Some(bar) = &self.progress {
                bar.inc(1);
            }
            store
        };

        let merged = if self.parallel {
            paths
                .par_iter()
                .map(read)
                .try_reduce(|| RunStore::empty(observables), |a, b| a.merge(&b))?
        } else {
            let mut acc = RunStore::empty(observables);
            for path in paths {
                acc = acc.merge(&read(path)?)?;
            }
            acc
        };

        info!(
            files = paths.len(),
            bins = merged.len(),
            steps = merged.total_steps(),
            covariance = merged.tracks_covariance(),
            "merged run files"
        );
        Ok(merged)
    }

    /// Merge all run files and write the consolidated file to `out`.
    pub fn consolidate<P, Q>(&self, paths: &[P], out: Q) -> Result<RunStore>
    where
        P: AsRef<Path> + Sync,
        Q: AsRef<Path>,
    {
        let merged = self.load(paths)?;
        merged.save(&out)?;
        info!(path = %out.as_ref().display(), "wrote consolidated run file");
        Ok(merged)
    }
}

/// Sequential fold of in-memory stores, in the order given.
pub fn merge_all<'a, I>(observables: usize, stores: I) -> Result<RunStore>
where
    I: IntoIterator<Item = &'a RunStore>,
{
    stores
        .into_iter()
        .try_fold(RunStore::empty(observables), |acc, store| acc.merge(store))
}
