//! Respondent-level microdata for one survey week, with person and household
//! replicate weights.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;

use log::{debug, warn};
use nalgebra::DVector;

use crate::dictionary::{parse_code, LabelDictionary, VariableType};
use crate::error::{PulseError, Result};
use crate::options::EstimationOptions;

/// Column holding the respondent identifier.
pub const RESPONDENT_ID: &str = "SCRAM";
/// Column holding the survey week.
pub const WEEK_COLUMN: &str = "WEEK";

/// The two weighting schemes published for every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WeightScheme {
    /// Person-level weight `PWEIGHT`.
    Person,
    /// Household-level weight `HWEIGHT`.
    Household,
}

impl WeightScheme {
    pub const ALL: [WeightScheme; 2] = [WeightScheme::Person, WeightScheme::Household];

    /// Name of the full-sample weight column.
    pub fn column(self) -> &'static str {
        match self {
            Self::Person => "PWEIGHT",
            Self::Household => "HWEIGHT",
        }
    }

    /// Name of the `index`-th (one-based) replicate weight column.
    pub fn replicate_column(self, index: usize) -> String {
        format!("{}{}", self.column(), index)
    }

    /// Lower-case prefix used in output column names.
    pub fn label(self) -> &'static str {
        match self {
            Self::Person => "pweight",
            Self::Household => "hweight",
        }
    }
}

/// Full-sample weight plus its replicate weights.
#[derive(Clone, Debug, PartialEq)]
pub struct SchemeWeights {
    pub full: f64,
    pub replicates: DVector<f64>,
}

impl SchemeWeights {
    pub fn new(full: f64, replicates: DVector<f64>) -> Self {
        Self { full, replicates }
    }
}

/// One respondent in one survey week.
#[derive(Clone, Debug, PartialEq)]
pub struct MicrodataRecord {
    respondent: Option<String>,
    person: SchemeWeights,
    household: SchemeWeights,
    values: Vec<Option<i64>>,
}

impl MicrodataRecord {
    /// Creates a record; `values` follow the column order of the owning [`WeekMicrodata`].
    pub fn new(
        respondent: Option<String>,
        person: SchemeWeights,
        household: SchemeWeights,
        values: Vec<Option<i64>>,
    ) -> Self {
        Self {
            respondent,
            person,
            household,
            values,
        }
    }

    pub fn respondent(&self) -> Option<&str> {
        self.respondent.as_deref()
    }

    /// Weights of the requested scheme.
    pub fn weights(&self, scheme: WeightScheme) -> &SchemeWeights {
        match scheme {
            WeightScheme::Person => &self.person,
            WeightScheme::Household => &self.household,
        }
    }

    /// Value stored in column `index`; `None` when missing or out of universe.
    pub fn value(&self, index: usize) -> Option<i64> {
        self.values.get(index).copied().flatten()
    }
}

/// A variable found in a week's columns, tagged with its role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredVariable {
    pub name: String,
    pub column: usize,
    pub kind: VariableType,
}

/// Every record of one week plus the schema they share.
#[derive(Clone, Debug)]
pub struct WeekMicrodata {
    week: u32,
    columns: Vec<String>,
    index: HashMap<String, usize>,
    records: Vec<MicrodataRecord>,
    replicate_columns: HashMap<WeightScheme, Vec<String>>,
    malformed: BTreeSet<String>,
}

impl WeekMicrodata {
    /// Assembles a week from already-parsed records after checking their shapes.
    pub fn new(
        week: u32,
        columns: Vec<String>,
        records: Vec<MicrodataRecord>,
        replicate_count: usize,
    ) -> Result<Self> {
        for record in &records {
            if record.values.len() != columns.len() {
                return Err(PulseError::schema(
                    week,
                    "<values>",
                    format!(
                        "record has {} values for {} columns",
                        record.values.len(),
                        columns.len()
                    ),
                ));
            }
            for scheme in WeightScheme::ALL {
                let found = record.weights(scheme).replicates.len();
                if found != replicate_count {
                    return Err(PulseError::schema(
                        week,
                        scheme.column(),
                        format!("expected {replicate_count} replicate weights, found {found}"),
                    ));
                }
            }
        }
        let replicate_columns = WeightScheme::ALL
            .iter()
            .map(|scheme| {
                let names = (1..=replicate_count)
                    .map(|r| scheme.replicate_column(r))
                    .collect();
                (*scheme, names)
            })
            .collect();
        Ok(Self {
            week,
            index: index_columns(&columns),
            columns,
            records,
            replicate_columns,
            malformed: BTreeSet::new(),
        })
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    pub fn records(&self) -> &[MicrodataRecord] {
        &self.records
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Value columns in storage order (weights excluded).
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Position of a value column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Names of the replicate weight columns for a scheme.
    pub fn replicate_columns(&self, scheme: WeightScheme) -> &[String] {
        self.replicate_columns
            .get(&scheme)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of replicate weights per scheme.
    pub fn replicate_count(&self) -> usize {
        self.replicate_columns(WeightScheme::Person).len()
    }

    /// Columns that held at least one value that is not an integer code.
    pub fn malformed_columns(&self) -> &BTreeSet<String> {
        &self.malformed
    }

    /// Tags every value column with its role, consulting the dictionary first.
    ///
    /// Columns absent from the dictionary are passed through as questions so that
    /// variables introduced in later waves are still tabulated.
    pub fn discover(&self, dictionary: &LabelDictionary) -> Vec<DiscoveredVariable> {
        self.columns
            .iter()
            .enumerate()
            .map(|(column, name)| DiscoveredVariable {
                name: name.clone(),
                column,
                kind: classify(name, dictionary),
            })
            .collect()
    }

    /// Renames a column, replacing any column already carrying the new name.
    pub(crate) fn rename_column(mut self, from: &str, to: &str) -> Self {
        let Some(source) = self.column_index(from) else {
            return self;
        };
        if let Some(existing) = self.column_index(to) {
            // Later waves may carry both spellings; keep the raw column's values
            // wherever the recoded one is empty.
            for record in &mut self.records {
                if record.values[existing].is_none() {
                    record.values[existing] = record.values[source];
                }
            }
            return self.drop_column(from);
        }
        self.columns[source] = to.to_string();
        if self.malformed.remove(from) {
            self.malformed.insert(to.to_string());
        }
        self.index = index_columns(&self.columns);
        self
    }

    /// Removes a value column.
    pub(crate) fn drop_column(mut self, name: &str) -> Self {
        let Some(position) = self.column_index(name) else {
            return self;
        };
        self.columns.remove(position);
        for record in &mut self.records {
            record.values.remove(position);
        }
        self.malformed.remove(name);
        self.index = index_columns(&self.columns);
        self
    }

    /// Appends (or replaces) a column computed from each record.
    pub(crate) fn with_column<F>(mut self, name: &str, mut compute: F) -> Self
    where
        F: FnMut(&MicrodataRecord) -> Option<i64>,
    {
        let computed: Vec<Option<i64>> = self.records.iter().map(&mut compute).collect();
        let position = match self.column_index(name) {
            Some(position) => position,
            None => {
                self.columns.push(name.to_string());
                self.index.insert(name.to_string(), self.columns.len() - 1);
                for record in &mut self.records {
                    record.values.push(None);
                }
                self.columns.len() - 1
            }
        };
        for (record, value) in self.records.iter_mut().zip(computed) {
            record.values[position] = value;
        }
        self
    }

    /// Rewrites every value of one column.
    pub(crate) fn map_column<F>(mut self, name: &str, mut map: F) -> Self
    where
        F: FnMut(Option<i64>) -> Option<i64>,
    {
        if let Some(position) = self.column_index(name) {
            for record in &mut self.records {
                record.values[position] = map(record.values[position]);
            }
        }
        self
    }
}

fn index_columns(columns: &[String]) -> HashMap<String, usize> {
    columns
        .iter()
        .enumerate()
        .map(|(index, name)| (name.clone(), index))
        .collect()
}

fn classify(name: &str, dictionary: &LabelDictionary) -> VariableType {
    if let Some(question) = dictionary.question(name) {
        return question.variable_type;
    }
    match name {
        RESPONDENT_ID => VariableType::Id,
        WEEK_COLUMN => VariableType::Time,
        _ if name.contains("WEIGHT") => VariableType::Weight,
        _ => VariableType::Question,
    }
}

/// Where each weight lives in a raw row.
struct WeightLayout {
    full: usize,
    replicates: Vec<usize>,
}

/// Parses raw weekly files into [`WeekMicrodata`].
#[derive(Clone, Debug)]
pub struct MicrodataLoader {
    replicate_count: usize,
}

impl MicrodataLoader {
    pub fn new(options: &EstimationOptions) -> Self {
        Self {
            replicate_count: options.replicate_count,
        }
    }

    /// Reads one week's CSV. Missing weight columns are a [`PulseError::Schema`];
    /// columns that are neither weights nor known to the dictionary are kept.
    pub fn load<R: Read>(&self, week: u32, reader: R) -> Result<WeekMicrodata> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let positions: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(index, name)| (name, index))
            .collect();

        let mut layouts = Vec::with_capacity(2);
        let mut weight_positions = BTreeSet::new();
        for scheme in WeightScheme::ALL {
            let full = *positions
                .get(scheme.column())
                .ok_or_else(|| PulseError::schema(week, scheme.column(), "column absent"))?;
            weight_positions.insert(full);
            let mut replicates = Vec::with_capacity(self.replicate_count);
            for r in 1..=self.replicate_count {
                let name = scheme.replicate_column(r);
                let position = *positions
                    .get(name.as_str())
                    .ok_or_else(|| PulseError::schema(week, name.clone(), "column absent"))?;
                weight_positions.insert(position);
                replicates.push(position);
            }
            layouts.push(WeightLayout { full, replicates });
        }

        let id_position = positions.get(RESPONDENT_ID).copied();
        let mut value_positions = Vec::new();
        let mut columns = Vec::new();
        for (position, name) in headers.iter().enumerate() {
            if weight_positions.contains(&position) || Some(position) == id_position {
                continue;
            }
            if is_replicate_name(name) {
                debug!("week {week}: ignoring extra replicate column {name}");
                continue;
            }
            value_positions.push(position);
            columns.push(name.to_string());
        }

        let mut malformed = BTreeSet::new();
        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let line = row.position().map(|p| p.line()).unwrap_or(0);
            let person = read_scheme(week, WeightScheme::Person, &layouts[0], &row, &headers, line)?;
            let household =
                read_scheme(week, WeightScheme::Household, &layouts[1], &row, &headers, line)?;

            let mut values = Vec::with_capacity(value_positions.len());
            for (column, position) in columns.iter().zip(&value_positions) {
                let raw = row.get(*position).unwrap_or("");
                if raw.is_empty() {
                    values.push(None);
                    continue;
                }
                match parse_code(raw) {
                    Some(code) => values.push(Some(code)),
                    None => {
                        if malformed.insert(column.clone()) {
                            warn!("week {week}: column {column} holds non-integer value `{raw}` at line {line}");
                        }
                        values.push(None);
                    }
                }
            }

            records.push(MicrodataRecord::new(
                id_position.and_then(|p| row.get(p)).map(str::to_string),
                person,
                household,
                values,
            ));
        }

        let mut data = WeekMicrodata::new(week, columns, records, self.replicate_count)?;
        data.malformed = malformed;
        debug!(
            "week {week}: loaded {} records with {} value columns",
            data.record_count(),
            data.columns.len()
        );
        Ok(data)
    }
}

fn read_scheme(
    week: u32,
    scheme: WeightScheme,
    layout: &WeightLayout,
    row: &csv::StringRecord,
    headers: &csv::StringRecord,
    line: u64,
) -> Result<SchemeWeights> {
    let full = parse_weight(week, scheme.column(), row.get(layout.full), line)?;
    let mut replicates = DVector::zeros(layout.replicates.len());
    for (r, position) in layout.replicates.iter().enumerate() {
        replicates[r] = parse_weight(week, &headers[*position], row.get(*position), line)?;
    }
    Ok(SchemeWeights::new(full, replicates))
}

fn is_replicate_name(name: &str) -> bool {
    WeightScheme::ALL.iter().any(|scheme| {
        name.strip_prefix(scheme.column())
            .map(|suffix| !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false)
    })
}

fn parse_weight(week: u32, column: &str, raw: Option<&str>, line: u64) -> Result<f64> {
    let raw = raw.unwrap_or("");
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(PulseError::schema(
            week,
            column,
            format!("unusable weight `{raw}` at line {line}"),
        )),
    }
}
