//! Command line front-end for the Household Pulse cross-tab pipeline.
//!
//! Microdata files live in `--data-dir` as `pulse-{week:02}.csv` (plus an
//! optional `collection_dates.csv`), dictionary sheets in `--dictionary-dir`,
//! and published tables are kept as CSV files in `--store-dir`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, error, info, LevelFilter};

use pulse_xtab::cache::FrontendCache;
use pulse_xtab::notify::{BuildNotifier, BuildRequest};
use pulse_xtab::pipeline::{smooth_stored, Pipeline};
use pulse_xtab::sink::{CsvDirectorySink, TableSink};
use pulse_xtab::source::{DirectoryDictionary, DirectorySource, MicrodataSource};
use pulse_xtab::{PipelineOptions, PulseError, Result};

#[derive(Parser)]
#[command(name = "pulse-xtab")]
#[command(version)]
#[command(about = "Weighted cross-tabs and smoothed series from Household Pulse microdata", long_about = None)]
struct Cli {
    /// Directory holding weekly microdata files
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    /// Directory holding the label dictionary sheets
    #[arg(long, default_value = "dictionary")]
    dictionary_dir: PathBuf,

    /// Directory where published tables are stored
    #[arg(long, default_value = "store")]
    store_dir: PathBuf,

    /// JSON file overriding any subset of the pipeline options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of worker threads, defaults to the number of CPUs
    #[arg(long)]
    threads: Option<usize>,

    /// Verbose output
    ///
    /// When specified, sets the log level to `info` and ignores the `RUST_LOG`
    /// environment variable. When not specified, uses `RUST_LOG`
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process the listed weeks and upsert their rows
    Run {
        #[arg(long, required = true, num_args = 1..)]
        weeks: Vec<u32>,
    },
    /// Process every available week missing from the store
    Backfill,
    /// Smooth the stored cross-tab table
    Smooth,
    /// Write the front-end JSON cache
    BuildCache {
        #[arg(long)]
        out: PathBuf,
    },
    /// Print the most recent week of the source or the store
    LatestWeek {
        #[arg(long, value_enum, default_value_t = Target::Source)]
        target: Target,
    },
    /// Print every week of the source or the store
    Weeks {
        #[arg(long, value_enum, default_value_t = Target::Source)]
        target: Target,
    },
    /// Ask the downstream site to rebuild
    SendBuildRequest {
        #[arg(long)]
        url: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Target {
    Source,
    Sink,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.verbose {
        env_logger::builder().filter_level(LevelFilter::Info).init();
        info!("Verbose output enabled (ignoring RUST_LOG environment variable)");
    } else {
        env_logger::init();
        debug!("Logging configured from environment variables");
    }

    match cli.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

impl Cli {
    fn options(&self) -> Result<PipelineOptions> {
        let options = match &self.config {
            Some(path) => PipelineOptions::from_json_file(path)?,
            None => PipelineOptions::default(),
        };
        options.validate()?;
        Ok(options)
    }

    fn weeks_of(&self, target: Target) -> Result<Vec<u32>> {
        let weeks = match target {
            Target::Source => DirectorySource::new(&self.data_dir).available_weeks()?,
            Target::Sink => CsvDirectorySink::new(&self.store_dir)?.stored_weeks()?,
        };
        Ok(weeks.into_iter().collect())
    }

    fn run(&self) -> Result<()> {
        if let Some(threads) = self.threads {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build_global()
                .map_err(|err| PulseError::invalid_option("threads", err.to_string()))?;
        }

        match &self.command {
            Command::Run { weeks } => {
                let dictionary = DirectoryDictionary::new(&self.dictionary_dir).load()?;
                let source = DirectorySource::new(&self.data_dir);
                let mut sink = CsvDirectorySink::new(&self.store_dir)?;
                let pipeline = Pipeline::new(&source, &dictionary, self.options()?)?;
                pipeline.run(weeks, &mut sink)?;
            }
            Command::Backfill => {
                let dictionary = DirectoryDictionary::new(&self.dictionary_dir).load()?;
                let source = DirectorySource::new(&self.data_dir);
                let mut sink = CsvDirectorySink::new(&self.store_dir)?;
                let pipeline = Pipeline::new(&source, &dictionary, self.options()?)?;
                pipeline.backfill(&mut sink)?;
            }
            Command::Smooth => {
                let dictionary = DirectoryDictionary::new(&self.dictionary_dir).load()?;
                let mut sink = CsvDirectorySink::new(&self.store_dir)?;
                let report = smooth_stored(&mut sink, &dictionary, &self.options()?)?;
                info!(
                    "smoothed {} rows ({} short series, {} failed fits)",
                    report.cells,
                    report.short_series,
                    report.unsmoothed.len()
                );
            }
            Command::BuildCache { out } => {
                let dictionary = DirectoryDictionary::new(&self.dictionary_dir).load()?;
                let sink = CsvDirectorySink::new(&self.store_dir)?;
                let crosstab = sink.read_crosstab()?;
                if crosstab.is_empty() {
                    return Err(PulseError::NoUsableOutput);
                }
                let smoothed = sink.read_smoothed()?;
                let calendar = sink.read_collection_windows()?;
                let options = self.options()?;
                FrontendCache::new(&dictionary, &calendar)
                    .with_metro_var(options.crosstab.metro_var)
                    .write(out, &crosstab, Some(&smoothed).filter(|s| !s.is_empty()))?;
            }
            Command::LatestWeek { target } => match self.weeks_of(*target)?.last() {
                Some(week) => println!("{week}"),
                None => return Err(PulseError::NoUsableOutput),
            },
            Command::Weeks { target } => {
                for week in self.weeks_of(*target)? {
                    println!("{week}");
                }
            }
            Command::SendBuildRequest { url } => {
                let notifier = BuildNotifier::new(url.as_str(), self.options()?.retry)?;
                notifier.send(&BuildRequest::default())?;
            }
        }
        Ok(())
    }
}
