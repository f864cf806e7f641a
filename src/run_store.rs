// run_store.rs - Bin statistics of one run: load, merge, persist

use std::cmp::Ordering;
use std::collections::btree_map::{self, BTreeMap};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::bin_key::BinKey;
use crate::bin_stats::{pair_count, BinStatistics};
use crate::error::{AnalysisError, Result};

/// Header marker of files whose bin lines carry a pooling weight column.
const POOLED_TAG: &str = "pooled";

/// Observables measured for an `n_points` cluster: one per possible bond
/// count plus the full value.
pub fn observables_for_points(n_points: usize) -> usize {
    1 + n_points * n_points.saturating_sub(1) / 2
}

/// All bins of one run (or of several runs already merged), together with
/// the number of Monte Carlo steps they took.
///
/// Bins are kept in key order so every reduction over a store visits them
/// in the same sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStore {
    observables: usize,
    covariance: bool,
    total_steps: u64,
    bins: BTreeMap<BinKey, BinStatistics>,
}

impl RunStore {
    pub fn new(observables: usize, covariance: bool, total_steps: u64) -> Self {
        Self { observables, covariance, total_steps, bins: BTreeMap::new() }
    }

    /// Store with no bins and no steps; the identity of `merge`.
    pub fn empty(observables: usize) -> Self {
        Self::new(observables, false, 0)
    }

    pub fn with_bins<I>(observables: usize, covariance: bool, total_steps: u64, bins: I) -> Result<Self>
    where
        I: IntoIterator<Item = (BinKey, BinStatistics)>,
    {
        let mut store = Self::new(observables, covariance, total_steps);
        for (key, stats) in bins {
            store.insert(key, stats)?;
        }
        Ok(store)
    }

    /// Add a bin, pooling it with any bin already stored under `key`.
    pub fn insert(&mut self, key: BinKey, stats: BinStatistics) -> Result<()> {
        if stats.observables() != self.observables {
            return Err(AnalysisError::Layout {
                expected: self.observables,
                found: stats.observables(),
            });
        }
        if let Some(arity) = self.key_arity().filter(|a| *a != key.arity()) {
            return Err(AnalysisError::Config(format!(
                "bin {key} has {} components but the store's keys have {arity}",
                key.arity()
            )));
        }
        let stats = if self.covariance {
            if !stats.tracks_covariance() {
                return Err(AnalysisError::Config(format!(
                    "bin {key} has no covariance data but the store tracks covariance"
                )));
            }
            stats
        } else if stats.tracks_covariance() {
            stats.without_covariance()
        } else {
            stats
        };
        match self.bins.entry(key) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(stats);
            }
            btree_map::Entry::Occupied(mut slot) => {
                let merged = slot.get().merge(&stats)?;
                slot.insert(merged);
            }
        }
        Ok(())
    }

    pub fn observables(&self) -> usize {
        self.observables
    }

    pub fn tracks_covariance(&self) -> bool {
        self.covariance
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    /// Component count shared by every key, `None` while the store is empty.
    pub fn key_arity(&self) -> Option<usize> {
        self.bins.keys().next().map(BinKey::arity)
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn get(&self, key: &BinKey) -> Option<&BinStatistics> {
        self.bins.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BinKey, &BinStatistics)> {
        self.bins.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &BinKey> {
        self.bins.keys()
    }

    pub fn total_unscreened(&self) -> u64 {
        self.bins.values().map(|b| b.unscreened_count()).sum()
    }

    pub fn total_sampled(&self) -> u64 {
        self.bins.values().map(|b| b.sample_count()).sum()
    }

    /// Combined store of two disjoint runs. Neither input is modified.
    ///
    /// Step counts add and bins sharing a key are pooled. Covariance is kept
    /// only when both sides track it; a store without bins takes the other
    /// side's setting.
    pub fn merge(&self, other: &RunStore) -> Result<RunStore> {
        if self.observables != other.observables {
            return Err(AnalysisError::Layout {
                expected: self.observables,
                found: other.observables,
            });
        }
        if let (Some(a), Some(b)) = (self.key_arity(), other.key_arity()) {
            if a != b {
                return Err(AnalysisError::Config(format!(
                    "cannot merge stores keyed by {a} and {b} components"
                )));
            }
        }
        let covariance = match (self.is_empty(), other.is_empty()) {
            (true, _) => other.covariance,
            (_, true) => self.covariance,
            _ => self.covariance && other.covariance,
        };

        let mut bins = BTreeMap::new();
        let mut left = self.bins.iter().peekable();
        let mut right = other.bins.iter().peekable();
        loop {
            let order = match (left.peek(), right.peek()) {
                (None, None) => break,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some((ka, _)), Some((kb, _))) => ka.cmp(kb),
            };
            let (key, stats) = match order {
                Ordering::Less => take(left.next()),
                Ordering::Greater => take(right.next()),
                Ordering::Equal => {
                    let (key, a) = take(left.next());
                    let (_, b) = take(right.next());
                    let pooled = a.merge(&b)?;
                    (key, pooled)
                }
            };
            let stats = if covariance { stats } else { stats.without_covariance() };
            bins.insert(key, stats);
        }

        Ok(RunStore {
            observables: self.observables,
            covariance,
            total_steps: self.total_steps + other.total_steps,
            bins,
        })
    }

    /// Store whose keys are truncated to `arity` components; bins that
    /// collide after truncation are pooled.
    pub fn rebin(&self, arity: usize) -> Result<RunStore> {
        let mut out = RunStore::new(self.observables, self.covariance, self.total_steps);
        for (key, stats) in &self.bins {
            out.insert(key.truncated(arity), stats.clone())?;
        }
        debug!(from = self.len(), to = out.len(), arity, "rebinned store");
        Ok(out)
    }

    /// Read one run file.
    ///
    /// The first non-blank line is the step count, optionally followed by
    /// `pooled` when every bin line carries its pooling weight (files written
    /// by [`RunStore::save`]). Every further non-blank line is
    /// `[key] c sc [pooled] avg_0 var_0 ... [cov_01 cov_02 ...]`; the file
    /// either carries covariances on every line or on none, and all keys
    /// have the same number of components.
    pub fn load(path: impl AsRef<Path>, observables: usize) -> Result<RunStore> {
        Self::load_with_arity(path, observables, None)
    }

    /// As [`RunStore::load`], additionally requiring every key to have
    /// `key_arity` components when given.
    pub fn load_with_arity(
        path: impl AsRef<Path>,
        observables: usize,
        key_arity: Option<usize>,
    ) -> Result<RunStore> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
        let store = Self::parse(BufReader::new(file), path, observables, key_arity)?;
        debug!(path = %path.display(), bins = store.len(), steps = store.total_steps, "loaded run file");
        Ok(store)
    }

    /// Parse run-file text; `path` is only used in error messages.
    pub fn read_from<R: BufRead>(reader: R, path: &Path, observables: usize) -> Result<RunStore> {
        Self::parse(reader, path, observables, None)
    }

    fn parse<R: BufRead>(
        reader: R,
        path: &Path,
        observables: usize,
        mut key_arity: Option<usize>,
    ) -> Result<RunStore> {
        let pairs = pair_count(observables);

        let mut total_steps: Option<u64> = None;
        let mut counts = 2;
        let mut covariance: Option<bool> = None;
        let mut bins: Vec<(BinKey, BinStatistics)> = Vec::new();

        for (idx, line) in reader.lines().enumerate() {
            let lineno = idx + 1;
            let line = line.map_err(|e| AnalysisError::io(path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if total_steps.is_none() {
                let mut head = line.split_whitespace();
                let steps = head.next().and_then(|t| t.parse::<u64>().ok()).ok_or_else(|| {
                    AnalysisError::parse(path, lineno, format!("expected step count, found {line:?}"))
                })?;
                match (head.next(), head.next()) {
                    (None, _) => {}
                    (Some(POOLED_TAG), None) => counts = 3,
                    _ => {
                        return Err(AnalysisError::parse(
                            path,
                            lineno,
                            format!("unexpected text after step count in {line:?}"),
                        ))
                    }
                }
                total_steps = Some(steps);
                continue;
            }

            let close = line
                .find(']')
                .ok_or_else(|| AnalysisError::parse(path, lineno, "missing bin key"))?;
            let key: BinKey = line[..=close]
                .parse()
                .map_err(|e| AnalysisError::parse(path, lineno, format!("{e}")))?;
            match key_arity {
                None => key_arity = Some(key.arity()),
                Some(arity) if arity != key.arity() => {
                    return Err(AnalysisError::parse(
                        path,
                        lineno,
                        format!("bin key {key} has {} components, expected {arity}", key.arity()),
                    ));
                }
                Some(_) => {}
            }
            let fields: Vec<&str> = line[close + 1..].split_whitespace().collect();

            let plain_fields = counts + 2 * observables;
            let cov_fields = plain_fields + pairs;
            let has_cov = if fields.len() == cov_fields {
                true
            } else if fields.len() == plain_fields {
                false
            } else {
                return Err(AnalysisError::parse(
                    path,
                    lineno,
                    format!(
                        "expected {plain_fields} fields (or {cov_fields} with covariances), found {}",
                        fields.len()
                    ),
                ));
            };
            match covariance {
                None => covariance = Some(has_cov),
                Some(expected) if expected != has_cov => {
                    return Err(AnalysisError::parse(
                        path,
                        lineno,
                        "covariance columns present on some lines but not others",
                    ));
                }
                Some(_) => {}
            }

            let unscreened = parse_field::<u64>(fields[0], path, lineno, "unscreened count")?;
            let sampled = parse_field::<u64>(fields[1], path, lineno, "sample count")?;
            let mut avg = Vec::with_capacity(observables);
            let mut var = Vec::with_capacity(observables);
            for i in 0..observables {
                avg.push(parse_field::<f64>(fields[counts + 2 * i], path, lineno, "average")?);
                var.push(parse_field::<f64>(fields[counts + 1 + 2 * i], path, lineno, "variance")?);
            }
            let invalid = |e: crate::bin_stats::InvalidBin| AnalysisError::parse(path, lineno, e.to_string());
            let mut stats = BinStatistics::new(unscreened, sampled, avg, var).map_err(invalid)?;
            if counts == 3 {
                let pooled = parse_field::<u64>(fields[2], path, lineno, "pooled weight")?;
                stats = stats.with_pooled_weight(pooled).map_err(invalid)?;
            }
            if has_cov {
                let upper = fields[plain_fields..]
                    .iter()
                    .map(|f| parse_field::<f64>(f, path, lineno, "covariance"))
                    .collect::<Result<Vec<f64>>>()?;
                stats = stats.with_covariance(upper).map_err(invalid)?;
            }
            bins.push((key, stats));
        }

        let total_steps = total_steps
            .ok_or_else(|| AnalysisError::parse(path, 1, "empty run file, missing step count"))?;
        let store = RunStore::with_bins(observables, covariance.unwrap_or(false), total_steps, bins)?;

        let unscreened = store.total_unscreened();
        if unscreened > total_steps {
            warn!(
                path = %path.display(),
                unscreened,
                total_steps,
                "unscreened configurations exceed the step count"
            );
        }
        Ok(store)
    }

    /// Write the canonical text form read back by [`RunStore::load`].
    ///
    /// Each bin carries its pooling weight so that a consolidated file merges
    /// with further runs exactly as the in-memory store would.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| AnalysisError::io(path, e))?;
        let mut out = BufWriter::new(file);
        self.write_to(&mut out)
            .and_then(|_| out.flush())
            .map_err(|e| AnalysisError::io(path, e))?;
        debug!(path = %path.display(), bins = self.len(), "saved run file");
        Ok(())
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "{} {POOLED_TAG}", self.total_steps)?;
        for (key, stats) in &self.bins {
            write!(
                out,
                "{key} {} {} {}",
                stats.unscreened_count(),
                stats.sample_count(),
                stats.pooled_weight()
            )?;
            for (a, v) in stats.avgs().iter().zip(stats.vars()) {
                write!(out, " {a:?} {v:?}")?;
            }
            if self.covariance {
                if let Some(upper) = stats.cov_upper() {
                    for c in upper {
                        write!(out, " {c:?}")?;
                    }
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

fn take<'a>(entry: Option<(&'a BinKey, &'a BinStatistics)>) -> (BinKey, BinStatistics) {
    match entry {
        Some((k, v)) => (k.clone(), v.clone()),
        None => unreachable!("peeked entry vanished"),
    }
}

fn parse_field<T: std::str::FromStr>(field: &str, path: &Path, line: usize, what: &str) -> Result<T> {
    field
        .parse::<T>()
        .map_err(|_| AnalysisError::parse(path, line, format!("invalid {what} {field:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observable_count_from_points() {
        assert_eq!(observables_for_points(1), 1);
        assert_eq!(observables_for_points(4), 7);
        assert_eq!(observables_for_points(5), 11);
    }

    #[test]
    fn parses_plain_lines() {
        let text = "300\n[0, 1] 100 50 2.0 1.0\n\n[1, 0] 20 0 0.0 0.0\n";
        let store = RunStore::read_from(text.as_bytes(), Path::new("mem"), 1).unwrap();
        assert_eq!(store.total_steps(), 300);
        assert_eq!(store.len(), 2);
        let bin = store.get(&BinKey::from([0, 1])).unwrap();
        assert_eq!(bin.unscreened_count(), 100);
        assert_eq!(bin.sample_count(), 50);
        assert_eq!(bin.avg(0), Some(2.0));
        assert!(store.get(&BinKey::from([1, 0])).unwrap().avg(0).is_none());
    }

    #[test]
    fn reports_line_of_bad_field() {
        let text = "10\n[0] 5 5 1.0 0.5 0.2 0.1\n[1] 5 5 1.0 zzz 0.2 0.1\n";
        let err = RunStore::read_from(text.as_bytes(), Path::new("run.dat"), 2).unwrap_err();
        match err {
            AnalysisError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {other}"),
        }
    }
}
