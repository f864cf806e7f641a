pub mod error;
pub mod bin_key;
pub mod bin_stats;
pub mod run_store;
pub mod aggregate;
pub mod weights;
pub mod report;
pub mod config;

pub use aggregate::{merge_all, Aggregator};
pub use bin_key::{BinKey, BinKeyError};
pub use bin_stats::{BinStatistics, InvalidBin, SampleAccumulator};
pub use config::AnalysisConfig;
pub use error::{AnalysisError, Result};
pub use report::{dump_bins, ObservableEstimate, Report, ResultReporter};
pub use run_store::{observables_for_points, RunStore};
pub use weights::{ReweightSummary, WeightRecomputer, WeightTable};
