// error.rs - Error type shared by loading, merging, reweighting and reporting

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Everything that can stop an analysis pass.
///
/// None of these are retried: the inputs are finite, already-collected
/// files, so a failure means the whole pass is aborted.
#[derive(Debug)]
pub enum AnalysisError {
    /// A run, weight or output file could not be opened, read or written.
    Io { path: PathBuf, source: io::Error },
    /// A line of a run or weight file is malformed. `line` is 1-based.
    Parse { path: PathBuf, line: usize, message: String },
    /// Required configuration is missing or out of range.
    Config(String),
    /// Two stores (or a store and a bin) disagree on the observable count.
    Layout { expected: usize, found: usize },
    /// A derived top-level quantity is degenerate (zero steps, NaN, Inf).
    Sampling(String),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

impl AnalysisError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        AnalysisError::Io { path: path.into(), source }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        AnalysisError::Parse { path: path.into(), line, message: message.into() }
    }
}

impl fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisError::Io { path, source } => {
                write!(f, "I/O error on {}: {source}", path.display())
            }
            AnalysisError::Parse { path, line, message } => {
                write!(f, "{}:{line}: {message}", path.display())
            }
            AnalysisError::Config(msg) => write!(f, "configuration error: {msg}"),
            AnalysisError::Layout { expected, found } => write!(
                f,
                "observable count mismatch: expected {expected}, found {found}"
            ),
            AnalysisError::Sampling(msg) => write!(f, "degenerate sampling result: {msg}"),
        }
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AnalysisError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
