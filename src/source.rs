//! Where raw weekly microdata and the label dictionary come from.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::collection::CollectionCalendar;
use crate::dictionary::LabelDictionary;
use crate::error::{PulseError, Result};

pub const QUESTION_LABELS_FILE: &str = "question_labels.csv";
pub const RESPONSE_LABELS_FILE: &str = "response_labels.csv";
pub const CROSSWALK_FILE: &str = "county_metro_state.csv";
pub const NUMERIC_MAPPING_FILE: &str = "numeric_mapping.csv";
pub const COLLECTION_DATES_FILE: &str = "collection_dates.csv";

/// Provider of raw weekly microdata files.
pub trait MicrodataSource: Sync {
    /// Raw CSV bytes of one week.
    fn fetch(&self, week: u32) -> Result<Vec<u8>>;

    /// Weeks this source can provide, ascending.
    fn available_weeks(&self) -> Result<BTreeSet<u32>>;

    /// Collection windows published alongside the microdata.
    fn collection_calendar(&self) -> Result<CollectionCalendar> {
        Ok(CollectionCalendar::default())
    }
}

/// Name of the file holding `week`'s microdata.
pub fn week_file_name(week: u32) -> String {
    format!("pulse-{week:02}.csv")
}

fn parse_week_file_name(name: &str) -> Option<u32> {
    name.strip_prefix("pulse-")?
        .strip_suffix(".csv")?
        .parse()
        .ok()
}

/// Reads `pulse-{week:02}.csv` files from a directory.
#[derive(Clone, Debug)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MicrodataSource for DirectorySource {
    fn fetch(&self, week: u32) -> Result<Vec<u8>> {
        let path = self.root.join(week_file_name(week));
        debug!("reading {}", path.display());
        Ok(fs::read(path)?)
    }

    fn available_weeks(&self) -> Result<BTreeSet<u32>> {
        let mut weeks = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(week) = entry.file_name().to_str().and_then(parse_week_file_name) {
                weeks.insert(week);
            }
        }
        Ok(weeks)
    }

    fn collection_calendar(&self) -> Result<CollectionCalendar> {
        let path = self.root.join(COLLECTION_DATES_FILE);
        match File::open(&path) {
            Ok(file) => CollectionCalendar::from_reader(BufReader::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("no {} in {}", COLLECTION_DATES_FILE, self.root.display());
                Ok(CollectionCalendar::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory source, mostly for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    weeks: BTreeMap<u32, Vec<u8>>,
    calendar: CollectionCalendar,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_week(mut self, week: u32, csv: impl Into<Vec<u8>>) -> Self {
        self.weeks.insert(week, csv.into());
        self
    }

    pub fn with_calendar(mut self, calendar: CollectionCalendar) -> Self {
        self.calendar = calendar;
        self
    }
}

impl MicrodataSource for MemorySource {
    fn fetch(&self, week: u32) -> Result<Vec<u8>> {
        self.weeks.get(&week).cloned().ok_or_else(|| {
            PulseError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("week {week} not in memory source"),
            ))
        })
    }

    fn available_weeks(&self) -> Result<BTreeSet<u32>> {
        Ok(self.weeks.keys().copied().collect())
    }

    fn collection_calendar(&self) -> Result<CollectionCalendar> {
        Ok(self.calendar.clone())
    }
}

/// Dictionary sheets stored as CSV files in one directory.
#[derive(Clone, Debug)]
pub struct DirectoryDictionary {
    root: PathBuf,
}

impl DirectoryDictionary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn open(&self, sheet: &str) -> Result<BufReader<File>> {
        let path = self.root.join(sheet);
        File::open(&path)
            .map(BufReader::new)
            .map_err(|err| PulseError::dictionary(sheet, format!("{}: {err}", path.display())))
    }

    /// Loads and validates every sheet. `numeric_mapping.csv` is optional.
    pub fn load(&self) -> Result<LabelDictionary> {
        let questions = self.open(QUESTION_LABELS_FILE)?;
        let responses = self.open(RESPONSE_LABELS_FILE)?;
        let crosswalk = self.open(CROSSWALK_FILE)?;
        let numeric = if self.root.join(NUMERIC_MAPPING_FILE).exists() {
            Some(self.open(NUMERIC_MAPPING_FILE)?)
        } else {
            None
        };
        let dictionary = LabelDictionary::from_readers(questions, responses, crosswalk, numeric)
            .map_err(|err| match err {
                PulseError::DictionaryLoad { .. } => err,
                other => PulseError::dictionary(self.root.display().to_string(), other.to_string()),
            })?;
        info!(
            "loaded {} question labels from {}",
            dictionary.question_count(),
            self.root.display()
        );
        Ok(dictionary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn week_file_names_round_trip() {
        assert_eq!(week_file_name(3), "pulse-03.csv");
        assert_eq!(week_file_name(42), "pulse-42.csv");
        assert_eq!(parse_week_file_name("pulse-07.csv"), Some(7));
        assert_eq!(parse_week_file_name("pulse-x.csv"), None);
        assert_eq!(parse_week_file_name("labels.csv"), None);
    }

    #[test]
    fn directory_source_lists_weeks() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pulse-02.csv"), "a\n1\n").unwrap();
        fs::write(dir.path().join("pulse-10.csv"), "a\n1\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        let source = DirectorySource::new(dir.path());
        assert_eq!(
            source.available_weeks().unwrap().into_iter().collect::<Vec<_>>(),
            vec![2, 10]
        );
        assert_eq!(source.fetch(2).unwrap(), b"a\n1\n");
        assert!(source.fetch(3).is_err());
        assert!(source.collection_calendar().unwrap().is_empty());
    }

    #[test]
    fn missing_dictionary_sheet_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DirectoryDictionary::new(dir.path()).load().unwrap_err();
        assert!(matches!(err, PulseError::DictionaryLoad { .. }));
        assert!(err.is_fatal_for_run());
    }
}
