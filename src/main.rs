//! Merge binned virial run files, recompute sampling weights and report
//! pooled averages (see `Cli` below for the run parameters).

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use virial_bins::{dump_bins, Aggregator, AnalysisConfig, ResultReporter, WeightRecomputer};

#[derive(Parser, Debug)]
#[command(name = "bin_merge", version)]
#[command(about = "Merge binned virial runs, reweight bins and report averages")]
struct Cli {
    /// TOML file with the run configuration; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of points in the cluster
    #[arg(short = 'n', long)]
    points: Option<usize>,

    /// Run file base name
    #[arg(long)]
    run_name: Option<String>,

    /// Number of run files to merge
    #[arg(long)]
    runs: Option<usize>,

    /// Measurement time relative to generating and screening one configuration
    #[arg(long)]
    t_ratio: Option<f64>,

    /// Directory holding the run files
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Print every bin after the report
    #[arg(long)]
    dump: bool,

    /// Skip covariance and correlation output
    #[arg(long)]
    no_covariance: bool,

    /// Merge run files one after another instead of on the thread pool
    #[arg(long)]
    sequential: bool,

    /// Truncate bin keys to this many components before reweighting
    #[arg(long)]
    rebin: Option<usize>,

    /// Number of components every bin key must have
    #[arg(long)]
    key_arity: Option<usize>,

    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

impl Cli {
    fn into_config(self) -> Result<AnalysisConfig> {
        let mut cfg = match &self.config {
            Some(path) => AnalysisConfig::load(path)
                .with_context(|| format!("reading config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        if let Some(n) = self.points {
            cfg.n_points = n;
        }
        if let Some(name) = self.run_name {
            cfg.run_name = name;
        }
        if let Some(runs) = self.runs {
            cfg.n_runs = runs;
        }
        if self.t_ratio.is_some() {
            cfg.t_ratio = self.t_ratio;
        }
        if let Some(dir) = self.dir {
            cfg.directory = dir;
        }
        if self.rebin.is_some() {
            cfg.rebin = self.rebin;
        }
        if self.key_arity.is_some() {
            cfg.key_arity = self.key_arity;
        }
        cfg.dump_bins |= self.dump;
        cfg.covariance &= !self.no_covariance;
        cfg.parallel &= !self.sequential;
        Ok(cfg)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).with_target(false).init();

    let cfg = cli.into_config()?;
    cfg.validate()?;
    let t_ratio = cfg.t_ratio()?;
    info!(?cfg, "starting analysis pass");

    // ------------------------------------------------------------
    let paths = cfg.run_paths();
    let bar = ProgressBar::new(paths.len() as u64);
    bar.set_style(
        ProgressStyle::with_template(" {bar:40.cyan/blue} {pos}/{len} files [{elapsed_precise}]")
            .context("progress bar template")?,
    );

    let aggregator = Aggregator::new(cfg.observables())
        .parallel(cfg.parallel)
        .key_arity(cfg.key_arity)
        .with_progress(bar.clone());
    let merged_path = cfg.merged_path();
    let mut store = aggregator
        .consolidate(&paths, &merged_path)
        .with_context(|| format!("merging {} run files", paths.len()))?;
    bar.finish_and_clear();

    if let Some(arity) = cfg.rebin {
        store = store.rebin(arity)?;
    }
    let total_steps = store.total_steps();

    // ------------------------------------------------------------
    let (weights, summary) = WeightRecomputer::new(t_ratio)?.recompute(&store, total_steps)?;
    let weights_path = cfg.weights_path();
    weights.save(&weights_path)?;
    info!(path = %weights_path.display(), bins = weights.len(), "wrote weights");

    println!("var0 frac: {:.6}", summary.var0_fraction());
    println!("var0 frac opt: {:.6}", summary.var0_fraction_new());
    println!("t0 frac: {:.6}", summary.t0_fraction);
    println!("new t0 frac: {:.6}", summary.t0_fraction_new);
    println!("measure frac: {:.6}", summary.measure_fraction);
    println!("optimal difficulty: {:.6e}", summary.difficulty.optimal);
    println!("actual difficulty: {:.6e}", summary.difficulty.actual);
    println!("measure-all difficulty: {:.6e}", summary.difficulty.all_measured);
    println!("measure-none difficulty: {:.6e}", summary.difficulty.none_measured);
    println!();

    // ------------------------------------------------------------
    let report = ResultReporter::new(t_ratio)?.aggregate(&store, total_steps, cfg.covariance)?;
    println!("{report}");
    let csv_path = cfg.report_csv_path();
    report.write_csv(&csv_path)?;
    info!(path = %csv_path.display(), "wrote report table");

    if cfg.dump_bins {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out)?;
        dump_bins(&store, &mut out)?;
    }
    Ok(())
}
