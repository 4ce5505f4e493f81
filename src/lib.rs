//! Weighted cross-tabulations and smoothed time series for the Census
//! Household Pulse Survey.
//!
//! The crate turns weekly public-use microdata into published estimates:
//!
//! - load the question/response label dictionary and the county to metro
//!   crosswalk (`dictionary` module),
//! - parse a week's microdata with its person and household replicate weights
//!   (`microdata` module) and prepare it for tabulation (`derive` module),
//! - estimate weighted totals and shares with replicate-weight confidence
//!   intervals (`estimation` module) for every question × cross-tab cell
//!   (`crosstab` module),
//! - smooth each share series over time with LOWESS, clamp it and renormalize
//!   within question groups (`lowess` and `smoothing` modules),
//! - persist the tables and build the front-end cache (`sink`, `cache`).
//!
//! # Quick start
//!
//! ```no_run
//! use pulse_xtab::pipeline::{smooth_stored, Pipeline};
//! use pulse_xtab::sink::CsvDirectorySink;
//! use pulse_xtab::source::{DirectoryDictionary, DirectorySource};
//! use pulse_xtab::PipelineOptions;
//!
//! # fn main() -> pulse_xtab::Result<()> {
//! let dictionary = DirectoryDictionary::new("dictionary").load()?;
//! let source = DirectorySource::new("data");
//! let mut sink = CsvDirectorySink::new("store")?;
//!
//! let options = PipelineOptions::default();
//! let pipeline = Pipeline::new(&source, &dictionary, options.clone())?;
//! let report = pipeline.run(&[40, 41, 42], &mut sink)?;
//! println!("processed weeks {:?}", report.processed_weeks);
//!
//! let smoothed = smooth_stored(&mut sink, &dictionary, &options)?;
//! println!("{} smoothed rows", smoothed.cells);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod collection;
pub mod crosstab;
pub mod derive;
pub mod dictionary;
pub mod error;
pub mod estimation;
pub mod lowess;
pub mod microdata;
pub mod notify;
pub mod options;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod smoothing;
pub mod source;

pub use crosstab::{CellKey, CrosstabBuilder, CrosstabCell, CrosstabTable};
pub use error::{PulseError, Result};
pub use estimation::{CellEstimate, Interval, WeightedEstimator};
pub use options::{
    CrosstabOptions, EstimationOptions, PipelineOptions, RetryOptions, SmoothingOptions, TimeAxis,
    VarianceMethod,
};
pub use smoothing::{SmoothedCell, SmoothedTable, Smoother};
