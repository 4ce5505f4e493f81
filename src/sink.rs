//! Persistence of the cross-tab, smoothed and collection-window tables.
//!
//! Row types here fix the column layout of the published tables. Sinks upsert:
//! writing a cross-tab table replaces every stored row of the weeks it
//! contains, so re-running a week never duplicates rows.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::collection::CollectionCalendar;
use crate::crosstab::{CellKey, CrosstabCell, CrosstabTable};
use crate::error::{PulseError, Result};
use crate::estimation::{CellEstimate, Interval, SchemeEstimate};
use crate::smoothing::{SmoothedCell, SmoothedTable};

pub const CROSSTAB_TABLE: &str = "crosstab";
pub const SMOOTHED_TABLE: &str = "smoothed";
pub const COLLECTION_TABLE: &str = "collection_dates";

/// One row of the published cross-tab table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrosstabRow {
    pub week: u32,
    pub collection_dates: String,
    pub xtab_var: String,
    pub xtab_val: i64,
    pub cbsa_title: Option<String>,
    pub q_var: String,
    pub q_var_label: String,
    pub q_val: i64,
    pub q_val_label: Option<String>,
    pub pweight: f64,
    pub pweight_lower: f64,
    pub pweight_upper: f64,
    pub pweight_share: f64,
    pub pweight_lower_share: f64,
    pub pweight_upper_share: f64,
    pub hweight: f64,
    pub hweight_lower: f64,
    pub hweight_upper: f64,
    pub hweight_share: f64,
    pub hweight_lower_share: f64,
    pub hweight_upper_share: f64,
}

impl From<&CrosstabCell> for CrosstabRow {
    fn from(cell: &CrosstabCell) -> Self {
        let person = &cell.estimate.person;
        let household = &cell.estimate.household;
        Self {
            week: cell.key.week,
            collection_dates: cell.collection_dates.clone(),
            xtab_var: cell.key.xtab_var.clone(),
            xtab_val: cell.key.xtab_val,
            cbsa_title: cell.cbsa_title.clone(),
            q_var: cell.key.q_var.clone(),
            q_var_label: cell.q_var_label.clone(),
            q_val: cell.key.q_val,
            q_val_label: cell.q_val_label.clone(),
            pweight: person.total.point,
            pweight_lower: person.total.lower,
            pweight_upper: person.total.upper,
            pweight_share: person.share.point,
            pweight_lower_share: person.share.lower,
            pweight_upper_share: person.share.upper,
            hweight: household.total.point,
            hweight_lower: household.total.lower,
            hweight_upper: household.total.upper,
            hweight_share: household.share.point,
            hweight_lower_share: household.share.lower,
            hweight_upper_share: household.share.upper,
        }
    }
}

impl From<CrosstabRow> for CrosstabCell {
    fn from(row: CrosstabRow) -> Self {
        let person = SchemeEstimate {
            total: Interval::new(row.pweight, row.pweight_lower, row.pweight_upper),
            share: Interval::new(
                row.pweight_share,
                row.pweight_lower_share,
                row.pweight_upper_share,
            ),
        };
        let household = SchemeEstimate {
            total: Interval::new(row.hweight, row.hweight_lower, row.hweight_upper),
            share: Interval::new(
                row.hweight_share,
                row.hweight_lower_share,
                row.hweight_upper_share,
            ),
        };
        Self {
            key: CellKey::new(row.week, row.xtab_var, row.xtab_val, row.q_var, row.q_val),
            collection_dates: row.collection_dates,
            cbsa_title: row.cbsa_title,
            q_var_label: row.q_var_label,
            q_val_label: row.q_val_label,
            estimate: CellEstimate { person, household },
        }
    }
}

/// One row of the published smoothed table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmoothedRow {
    pub week: u32,
    pub xtab_var: String,
    pub xtab_val: i64,
    pub q_var: String,
    pub q_val: i64,
    pub pweight_share_smoothed: f64,
    pub pweight_lower_share_smoothed: f64,
    pub pweight_upper_share_smoothed: f64,
    pub hweight_share_smoothed: f64,
    pub hweight_lower_share_smoothed: f64,
    pub hweight_upper_share_smoothed: f64,
}

impl From<&SmoothedCell> for SmoothedRow {
    fn from(cell: &SmoothedCell) -> Self {
        Self {
            week: cell.key.week,
            xtab_var: cell.key.xtab_var.clone(),
            xtab_val: cell.key.xtab_val,
            q_var: cell.key.q_var.clone(),
            q_val: cell.key.q_val,
            pweight_share_smoothed: cell.person.point,
            pweight_lower_share_smoothed: cell.person.lower,
            pweight_upper_share_smoothed: cell.person.upper,
            hweight_share_smoothed: cell.household.point,
            hweight_lower_share_smoothed: cell.household.lower,
            hweight_upper_share_smoothed: cell.household.upper,
        }
    }
}

impl From<SmoothedRow> for SmoothedCell {
    fn from(row: SmoothedRow) -> Self {
        Self {
            key: CellKey::new(row.week, row.xtab_var, row.xtab_val, row.q_var, row.q_val),
            person: Interval::new(
                row.pweight_share_smoothed,
                row.pweight_lower_share_smoothed,
                row.pweight_upper_share_smoothed,
            ),
            household: Interval::new(
                row.hweight_share_smoothed,
                row.hweight_lower_share_smoothed,
                row.hweight_upper_share_smoothed,
            ),
        }
    }
}

/// Destination of the published tables.
pub trait TableSink {
    /// Upserts cross-tab rows; every stored row of a week present in `table`
    /// is replaced.
    fn write_crosstab(&mut self, table: &CrosstabTable) -> Result<()>;

    /// Replaces the smoothed table.
    fn write_smoothed(&mut self, table: &SmoothedTable) -> Result<()>;

    /// Upserts collection windows by week.
    fn write_collection_windows(&mut self, calendar: &CollectionCalendar) -> Result<()>;

    /// Weeks with at least one stored cross-tab row.
    fn stored_weeks(&self) -> Result<BTreeSet<u32>>;

    fn read_crosstab(&self) -> Result<CrosstabTable>;

    fn read_smoothed(&self) -> Result<SmoothedTable>;

    fn read_collection_windows(&self) -> Result<CollectionCalendar>;
}

/// One CSV file per table inside a directory.
///
/// Each write rewrites its file through a temporary sibling that is renamed
/// into place, so readers never observe a half-written table.
#[derive(Clone, Debug)]
pub struct CsvDirectorySink {
    root: PathBuf,
}

impl CsvDirectorySink {
    /// Opens (and creates if needed) the store directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, table: &str) -> PathBuf {
        self.root.join(format!("{table}.csv"))
    }

    fn open(&self, table: &str) -> Result<Option<BufReader<File>>> {
        match File::open(self.path(table)) {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_rows<T>(&self, table: &str) -> Result<Vec<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let Some(reader) = self.open(table)? else {
            return Ok(Vec::new());
        };
        let mut reader = csv::Reader::from_reader(reader);
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    fn write_rows<T, I>(&self, table: &str, rows: I) -> Result<usize>
    where
        T: Serialize,
        I: IntoIterator<Item = T>,
    {
        let target = self.path(table);
        let staging = self.root.join(format!(".{table}.csv.tmp"));
        let mut writer = csv::Writer::from_writer(BufWriter::new(File::create(&staging)?));
        let mut count = 0;
        for row in rows {
            writer.serialize(row)?;
            count += 1;
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&staging, &target)?;
        debug!("wrote {count} rows to {}", target.display());
        Ok(count)
    }
}

impl TableSink for CsvDirectorySink {
    fn write_crosstab(&mut self, table: &CrosstabTable) -> Result<()> {
        let mut stored = self.read_crosstab()?;
        stored.merge(table.clone());
        let count = self.write_rows(CROSSTAB_TABLE, stored.iter().map(CrosstabRow::from))?;
        info!(
            "upserted {} cross-tab rows for weeks {:?} ({count} stored)",
            table.len(),
            table.weeks()
        );
        Ok(())
    }

    fn write_smoothed(&mut self, table: &SmoothedTable) -> Result<()> {
        let count = self.write_rows(SMOOTHED_TABLE, table.iter().map(SmoothedRow::from))?;
        info!("wrote {count} smoothed rows");
        Ok(())
    }

    fn write_collection_windows(&mut self, calendar: &CollectionCalendar) -> Result<()> {
        let mut stored = self.read_collection_windows()?;
        for window in calendar.iter() {
            stored.insert(window.clone());
        }
        self.write_rows(COLLECTION_TABLE, stored.iter())?;
        Ok(())
    }

    fn stored_weeks(&self) -> Result<BTreeSet<u32>> {
        #[derive(Deserialize)]
        struct WeekOnly {
            week: u32,
        }
        Ok(self
            .read_rows::<WeekOnly>(CROSSTAB_TABLE)?
            .into_iter()
            .map(|row| row.week)
            .collect())
    }

    fn read_crosstab(&self) -> Result<CrosstabTable> {
        Ok(self
            .read_rows::<CrosstabRow>(CROSSTAB_TABLE)?
            .into_iter()
            .map(CrosstabCell::from)
            .collect())
    }

    fn read_smoothed(&self) -> Result<SmoothedTable> {
        Ok(self
            .read_rows::<SmoothedRow>(SMOOTHED_TABLE)?
            .into_iter()
            .map(SmoothedCell::from)
            .collect())
    }

    fn read_collection_windows(&self) -> Result<CollectionCalendar> {
        match self.open(COLLECTION_TABLE)? {
            Some(reader) => CollectionCalendar::from_reader(reader),
            None => Ok(CollectionCalendar::default()),
        }
    }
}

/// Sink that keeps everything in memory.
///
/// `failing_writes` makes that many upcoming writes fail, which is how retry
/// behaviour is exercised without a real store.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    crosstab: CrosstabTable,
    smoothed: SmoothedTable,
    calendar: CollectionCalendar,
    failing_writes: usize,
    writes: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_writes(mut self, count: usize) -> Self {
        self.failing_writes = count;
        self
    }

    /// Successful writes so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn crosstab(&self) -> &CrosstabTable {
        &self.crosstab
    }

    pub fn smoothed(&self) -> &SmoothedTable {
        &self.smoothed
    }

    fn attempt(&mut self, table: &'static str) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(PulseError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated failure writing {table}"),
            )));
        }
        self.writes += 1;
        Ok(())
    }
}

impl TableSink for MemorySink {
    fn write_crosstab(&mut self, table: &CrosstabTable) -> Result<()> {
        self.attempt(CROSSTAB_TABLE)?;
        self.crosstab.merge(table.clone());
        Ok(())
    }

    fn write_smoothed(&mut self, table: &SmoothedTable) -> Result<()> {
        self.attempt(SMOOTHED_TABLE)?;
        self.smoothed = table.clone();
        Ok(())
    }

    fn write_collection_windows(&mut self, calendar: &CollectionCalendar) -> Result<()> {
        self.attempt(COLLECTION_TABLE)?;
        for window in calendar.iter() {
            self.calendar.insert(window.clone());
        }
        Ok(())
    }

    fn stored_weeks(&self) -> Result<BTreeSet<u32>> {
        Ok(self.crosstab.weeks())
    }

    fn read_crosstab(&self) -> Result<CrosstabTable> {
        Ok(self.crosstab.clone())
    }

    fn read_smoothed(&self) -> Result<SmoothedTable> {
        Ok(self.smoothed.clone())
    }

    fn read_collection_windows(&self) -> Result<CollectionCalendar> {
        Ok(self.calendar.clone())
    }
}
