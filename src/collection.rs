//! Publication and fielding dates of each survey week.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::options::TimeAxis;

/// Dates attached to one survey week.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionWindow {
    pub week: u32,
    pub pub_date: NaiveDate,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl CollectionWindow {
    /// Text used in the `collection_dates` output column.
    pub fn label(&self) -> String {
        format!("{} to {}", self.start_date, self.end_date)
    }
}

/// All known collection windows, keyed by week.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CollectionCalendar {
    windows: BTreeMap<u32, CollectionWindow>,
}

impl CollectionCalendar {
    pub fn new(windows: impl IntoIterator<Item = CollectionWindow>) -> Self {
        Self {
            windows: windows.into_iter().map(|w| (w.week, w)).collect(),
        }
    }

    /// Reads `week,pub_date,start_date,end_date` rows with ISO dates.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut windows = Vec::new();
        for row in reader.deserialize() {
            let window: CollectionWindow = row?;
            windows.push(window);
        }
        Ok(Self::new(windows))
    }

    /// Writes the calendar in the same layout [`from_reader`](Self::from_reader) accepts.
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        for window in self.windows.values() {
            writer.serialize(window)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn get(&self, week: u32) -> Option<&CollectionWindow> {
        self.windows.get(&week)
    }

    /// Adds or replaces the window of a week.
    pub fn insert(&mut self, window: CollectionWindow) {
        self.windows.insert(window.week, window);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionWindow> {
        self.windows.values()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// `collection_dates` text for a week, empty when the week is unknown.
    pub fn label(&self, week: u32) -> String {
        self.get(week).map(CollectionWindow::label).unwrap_or_default()
    }

    /// Position of a week on the smoothing time axis.
    ///
    /// With [`TimeAxis::EndDate`] the coordinate is the day number of the end
    /// of fielding; weeks without a window fall back to their index.
    pub fn time_coordinate(&self, week: u32, axis: TimeAxis) -> f64 {
        match (axis, self.get(week)) {
            (TimeAxis::EndDate, Some(window)) => window.end_date.num_days_from_ce() as f64,
            _ => week as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "\
week,pub_date,start_date,end_date
1,2020-05-20,2020-04-23,2020-05-05
2,2020-05-27,2020-05-07,2020-05-12
";

    #[test]
    fn parses_iso_dates_and_formats_labels() {
        let calendar = CollectionCalendar::from_reader(CSV.as_bytes()).unwrap();
        assert_eq!(calendar.len(), 2);
        assert_eq!(calendar.label(1), "2020-04-23 to 2020-05-05");
        assert_eq!(calendar.label(9), "");
    }

    #[test]
    fn end_date_axis_counts_days() {
        let calendar = CollectionCalendar::from_reader(CSV.as_bytes()).unwrap();
        let first = calendar.time_coordinate(1, TimeAxis::EndDate);
        let second = calendar.time_coordinate(2, TimeAxis::EndDate);
        assert_eq!(second - first, 7.0);
        assert_eq!(calendar.time_coordinate(5, TimeAxis::EndDate), 5.0);
        assert_eq!(calendar.time_coordinate(2, TimeAxis::WeekIndex), 2.0);
    }

    #[test]
    fn writes_what_it_reads() {
        let calendar = CollectionCalendar::from_reader(CSV.as_bytes()).unwrap();
        let mut buffer = Vec::new();
        calendar.to_writer(&mut buffer).unwrap();
        assert_eq!(String::from_utf8(buffer).unwrap(), CSV);
    }
}
