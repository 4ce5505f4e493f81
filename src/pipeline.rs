//! Batch runs: fetch weeks, build their cross-tabs, persist, smooth.
//!
//! Weeks are independent, so [`Pipeline::process_weeks`] builds them on the
//! rayon pool with every worker owning its week's table; the caller merges
//! the tables afterwards and is the only writer to the sink. A failing week
//! (missing file, missing weight column) is skipped and reported without
//! affecting the others.

use std::collections::BTreeSet;

use log::{info, warn};
use rayon::prelude::*;

use crate::collection::CollectionCalendar;
use crate::crosstab::{BuiltWeek, CrosstabBuilder, CrosstabTable};
use crate::derive::prepare;
use crate::dictionary::LabelDictionary;
use crate::error::{PulseError, Result};
use crate::microdata::MicrodataLoader;
use crate::options::PipelineOptions;
use crate::retry::{fetch_with_retry, write_with_retry};
use crate::sink::{TableSink, COLLECTION_TABLE, CROSSTAB_TABLE, SMOOTHED_TABLE};
use crate::smoothing::Smoother;
use crate::source::MicrodataSource;

/// What a run did and what it had to skip.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Weeks whose cross-tab rows were produced.
    pub processed_weeks: Vec<u32>,
    /// Weeks skipped entirely, with the reason.
    pub skipped_weeks: Vec<(u32, PulseError)>,
    /// Cells, variables and cross-tabs dropped inside processed weeks.
    pub isolated_failures: Vec<(u32, PulseError)>,
    /// Rows produced.
    pub cells: usize,
}

impl RunReport {
    /// Logs every skipped week and a count of isolated failures.
    pub fn log_summary(&self) {
        for (week, err) in &self.skipped_weeks {
            warn!("week {week} skipped: {err}");
        }
        if !self.isolated_failures.is_empty() {
            warn!(
                "{} cells or variables dropped across {} weeks",
                self.isolated_failures.len(),
                self.isolated_failures
                    .iter()
                    .map(|(week, _)| *week)
                    .collect::<BTreeSet<_>>()
                    .len()
            );
        }
        info!(
            "processed weeks {:?}: {} rows",
            self.processed_weeks, self.cells
        );
    }
}

/// Outcome of [`smooth_stored`].
#[derive(Debug, Default)]
pub struct SmoothReport {
    pub cells: usize,
    pub short_series: usize,
    pub unsmoothed: Vec<PulseError>,
}

/// Builds cross-tab tables for weeks offered by a [`MicrodataSource`].
pub struct Pipeline<'a, S: MicrodataSource> {
    source: &'a S,
    dictionary: &'a LabelDictionary,
    options: PipelineOptions,
}

impl<'a, S: MicrodataSource> Pipeline<'a, S> {
    /// Validates `options` before anything is fetched.
    pub fn new(
        source: &'a S,
        dictionary: &'a LabelDictionary,
        options: PipelineOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            source,
            dictionary,
            options,
        })
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Collection windows published by the source.
    pub fn calendar(&self) -> Result<CollectionCalendar> {
        fetch_with_retry(&self.options.retry, "collection dates", |_| {
            self.source.collection_calendar()
        })
    }

    /// Fetches, loads, prepares and cross-tabulates one week.
    pub fn process_week(&self, week: u32, calendar: &CollectionCalendar) -> Result<BuiltWeek> {
        let raw = fetch_with_retry(&self.options.retry, format!("week {week}"), |_| {
            self.source.fetch(week)
        })?;
        let data = MicrodataLoader::new(&self.options.estimation).load(week, raw.as_slice())?;
        info!("week {week}: loaded {} records", data.record_count());

        let prepared = prepare(data, self.dictionary, calendar.get(week));
        let builder = CrosstabBuilder::new(
            self.dictionary,
            self.options.estimation.clone(),
            self.options.crosstab.clone(),
        );
        let mut built = builder.build_week(&prepared.data, calendar);
        for failure in &prepared.failures {
            warn!("week {week}: {failure}");
        }
        let mut failures = prepared.failures;
        failures.append(&mut built.failures);
        built.failures = failures;
        info!("week {week}: {} cells", built.table.len());
        Ok(built)
    }

    /// Processes `weeks` in parallel and merges the results.
    pub fn process_weeks(
        &self,
        weeks: &[u32],
        calendar: &CollectionCalendar,
    ) -> (CrosstabTable, RunReport) {
        let results: Vec<(u32, Result<BuiltWeek>)> = weeks
            .par_iter()
            .map(|week| (*week, self.process_week(*week, calendar)))
            .collect();

        let mut table = CrosstabTable::new();
        let mut report = RunReport::default();
        for (week, result) in results {
            match result {
                Ok(built) => {
                    let failures = built.failures.into_iter().map(|err| (week, err));
                    report.isolated_failures.extend(failures);
                    if built.table.is_empty() {
                        let reason = "no cell could be estimated";
                        warn!("week {week}: {reason}");
                        report
                            .skipped_weeks
                            .push((week, PulseError::estimation(format!("week {week}"), reason)));
                    } else {
                        report.processed_weeks.push(week);
                        table.merge(built.table);
                    }
                }
                Err(err) => {
                    warn!("week {week}: {err}");
                    report.skipped_weeks.push((week, err));
                }
            }
        }
        report.cells = table.len();
        (table, report)
    }

    /// Processes `weeks` and upserts the result into `sink`.
    ///
    /// Fails with [`PulseError::NoUsableOutput`] when no week produced a row,
    /// and with [`PulseError::SinkWrite`] when persisting exhausts its retries.
    pub fn run(&self, weeks: &[u32], sink: &mut dyn TableSink) -> Result<RunReport> {
        let calendar = self.calendar()?;
        let (table, report) = self.process_weeks(weeks, &calendar);
        report.log_summary();
        if table.is_empty() {
            return Err(PulseError::NoUsableOutput);
        }
        let retry = &self.options.retry;
        write_with_retry(retry, CROSSTAB_TABLE, |_| sink.write_crosstab(&table))?;
        if !calendar.is_empty() {
            write_with_retry(retry, COLLECTION_TABLE, |_| {
                sink.write_collection_windows(&calendar)
            })?;
        }
        Ok(report)
    }

    /// Processes every week the source offers that the sink does not hold yet.
    pub fn backfill(&self, sink: &mut dyn TableSink) -> Result<RunReport> {
        let available = fetch_with_retry(&self.options.retry, "available weeks", |_| {
            self.source.available_weeks()
        })?;
        let stored = sink.stored_weeks()?;
        let missing: Vec<u32> = available.difference(&stored).copied().collect();
        if missing.is_empty() {
            info!("sink already holds every available week");
            return Ok(RunReport::default());
        }
        info!("backfilling weeks {missing:?}");
        self.run(&missing, sink)
    }
}

/// Smooths the stored cross-tab table and replaces the stored smoothed table.
pub fn smooth_stored(
    sink: &mut dyn TableSink,
    dictionary: &LabelDictionary,
    options: &PipelineOptions,
) -> Result<SmoothReport> {
    options.validate()?;
    let table = sink.read_crosstab()?;
    if table.is_empty() {
        return Err(PulseError::NoUsableOutput);
    }
    let calendar = sink.read_collection_windows()?;
    let smoothed = Smoother::new(options.smoothing.clone(), &calendar)
        .smooth(&table, |q_var| dictionary.is_select_all(q_var));
    write_with_retry(&options.retry, SMOOTHED_TABLE, |_| {
        sink.write_smoothed(&smoothed.table)
    })?;
    if !smoothed.unsmoothed.is_empty() {
        warn!(
            "{} series passed through unsmoothed after a failed fit",
            smoothed.unsmoothed.len()
        );
    }
    Ok(SmoothReport {
        cells: smoothed.table.len(),
        short_series: smoothed.short_series,
        unsmoothed: smoothed.unsmoothed,
    })
}
