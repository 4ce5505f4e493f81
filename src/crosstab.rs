//! Weighted cross-tabulations of every question against every cross-tab
//! variable, one survey week at a time.
//!
//! For a week the builder discovers which tabulated variables are present,
//! accumulates person and household weight tallies for each
//! `(cross-tab value, question)` universe and each `(cross-tab value,
//! question, response)` cell in a single pass over the records, and asks the
//! [`WeightedEstimator`] for totals and shares. Cells whose estimate fails are
//! dropped and reported; the rest of the week is unaffected.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, warn};

use crate::collection::CollectionCalendar;
use crate::dictionary::LabelDictionary;
use crate::error::PulseError;
use crate::estimation::{CellEstimate, CellTally, WeightedEstimator};
use crate::microdata::WeekMicrodata;
use crate::options::{CrosstabOptions, EstimationOptions};

/// Primary key of a cross-tab row.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub week: u32,
    pub xtab_var: String,
    pub xtab_val: i64,
    pub q_var: String,
    pub q_val: i64,
}

impl CellKey {
    pub fn new(
        week: u32,
        xtab_var: impl Into<String>,
        xtab_val: i64,
        q_var: impl Into<String>,
        q_val: i64,
    ) -> Self {
        Self {
            week,
            xtab_var: xtab_var.into(),
            xtab_val,
            q_var: q_var.into(),
            q_val,
        }
    }
}

/// One estimated cell with its joined labels.
#[derive(Clone, Debug, PartialEq)]
pub struct CrosstabCell {
    pub key: CellKey,
    pub collection_dates: String,
    pub cbsa_title: Option<String>,
    pub q_var_label: String,
    /// `None` when the response has no label or is flagged `do_not_join`.
    pub q_val_label: Option<String>,
    pub estimate: CellEstimate,
}

/// Accumulated cross-tab rows keyed by [`CellKey`].
///
/// Writing a week replaces every row that week held before, so processing the
/// same week twice leaves the row count unchanged.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CrosstabTable {
    cells: BTreeMap<CellKey, CrosstabCell>,
}

impl CrosstabTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a cell, overwriting any cell with the same key.
    pub fn upsert(&mut self, cell: CrosstabCell) -> Option<CrosstabCell> {
        self.cells.insert(cell.key.clone(), cell)
    }

    /// Removes every row of `week` and inserts `cells` in its place.
    pub fn replace_week(&mut self, week: u32, cells: impl IntoIterator<Item = CrosstabCell>) {
        self.cells.retain(|key, _| key.week != week);
        for cell in cells {
            if cell.key.week != week {
                warn!(
                    "cell {:?} does not belong to week {week}, keeping it under its own week",
                    cell.key
                );
            }
            self.upsert(cell);
        }
    }

    /// Merges another table in; weeks present in `other` replace ours.
    pub fn merge(&mut self, other: CrosstabTable) {
        let weeks = other.weeks();
        self.cells.retain(|key, _| !weeks.contains(&key.week));
        self.cells.extend(other.cells);
    }

    pub fn get(&self, key: &CellKey) -> Option<&CrosstabCell> {
        self.cells.get(key)
    }

    /// Weeks holding at least one row, ascending.
    pub fn weeks(&self) -> BTreeSet<u32> {
        self.cells.keys().map(|key| key.week).collect()
    }

    /// Rows stored for `week`.
    pub fn week_len(&self, week: u32) -> usize {
        self.week_cells(week).count()
    }

    pub fn week_cells(&self, week: u32) -> impl Iterator<Item = &CrosstabCell> {
        self.cells.values().filter(move |cell| cell.key.week == week)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cells in key order.
    pub fn iter(&self) -> impl Iterator<Item = &CrosstabCell> {
        self.cells.values()
    }
}

impl FromIterator<CrosstabCell> for CrosstabTable {
    fn from_iter<I: IntoIterator<Item = CrosstabCell>>(iter: I) -> Self {
        let mut table = Self::new();
        for cell in iter {
            table.upsert(cell);
        }
        table
    }
}

impl IntoIterator for CrosstabTable {
    type Item = CrosstabCell;
    type IntoIter = std::collections::btree_map::IntoValues<CellKey, CrosstabCell>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.into_values()
    }
}

/// Output of one week: its rows plus the cells and variables that were skipped.
#[derive(Debug, Default)]
pub struct BuiltWeek {
    pub table: CrosstabTable,
    pub failures: Vec<PulseError>,
}

/// Builds a week's cross-tab table from prepared microdata.
#[derive(Clone, Debug)]
pub struct CrosstabBuilder<'a> {
    dictionary: &'a LabelDictionary,
    estimator: WeightedEstimator,
    options: CrosstabOptions,
}

impl<'a> CrosstabBuilder<'a> {
    pub fn new(
        dictionary: &'a LabelDictionary,
        estimation: EstimationOptions,
        options: CrosstabOptions,
    ) -> Self {
        Self {
            dictionary,
            estimator: WeightedEstimator::new(estimation),
            options,
        }
    }

    pub fn options(&self) -> &CrosstabOptions {
        &self.options
    }

    /// Question variables tabulated this week: tabulated kinds that are not
    /// themselves cross-tab variables.
    fn questions(&self, data: &WeekMicrodata) -> Vec<(String, usize)> {
        data.discover(self.dictionary)
            .into_iter()
            .filter(|variable| variable.kind.is_tabulated())
            .filter(|variable| !self.options.xtab_vars.contains(&variable.name))
            .map(|variable| (variable.name, variable.column))
            .collect()
    }

    /// Estimates every `(cross-tab, question, response)` cell of one week.
    pub fn build_week(&self, data: &WeekMicrodata, calendar: &CollectionCalendar) -> BuiltWeek {
        let week = data.week();
        let questions = self.questions(data);
        let collection_dates = calendar.label(week);
        let replicates = data.replicate_count();
        let mut built = BuiltWeek::default();

        for xtab_var in &self.options.xtab_vars {
            let Some(xtab_column) = data.column_index(xtab_var) else {
                warn!("week {week}: cross-tab variable {xtab_var} is absent, skipping it");
                built.failures.push(PulseError::estimation(
                    format!("week {week} cross-tab {xtab_var}"),
                    "variable absent from microdata",
                ));
                continue;
            };

            let mut universes: HashMap<(i64, usize), CellTally> = HashMap::new();
            let mut cells: HashMap<(i64, usize, i64), CellTally> = HashMap::new();
            for record in data.records() {
                let Some(xtab_val) = record.value(xtab_column) else {
                    continue;
                };
                for (q, (_, column)) in questions.iter().enumerate() {
                    let Some(q_val) = record.value(*column) else {
                        continue;
                    };
                    universes
                        .entry((xtab_val, q))
                        .or_insert_with(|| CellTally::zeros(replicates))
                        .add(record);
                    cells
                        .entry((xtab_val, q, q_val))
                        .or_insert_with(|| CellTally::zeros(replicates))
                        .add(record);
                }
            }

            let mut observed: HashMap<(i64, usize), BTreeSet<i64>> = HashMap::new();
            for (xtab_val, q, q_val) in cells.keys() {
                observed.entry((*xtab_val, *q)).or_default().insert(*q_val);
            }

            let empty = CellTally::zeros(replicates);
            let mut emitted = 0usize;
            for ((xtab_val, q), universe) in &universes {
                let (q_var, _) = &questions[*q];
                let mut values = self.dictionary.response_values(q_var);
                if let Some(seen) = observed.get(&(*xtab_val, *q)) {
                    values.extend(seen);
                }
                for q_val in values {
                    let key = CellKey::new(week, xtab_var.as_str(), *xtab_val, q_var.as_str(), q_val);
                    let numerator = cells.get(&(*xtab_val, *q, q_val)).unwrap_or(&empty);
                    match self.estimator.estimate(numerator, universe) {
                        Ok(estimate) => {
                            built.table.upsert(self.label(key, &collection_dates, estimate));
                            emitted += 1;
                        }
                        Err(err) => {
                            warn!("dropping cell {key:?}: {err}");
                            built.failures.push(err);
                        }
                    }
                }
            }
            debug!("week {week}: {emitted} cells for cross-tab {xtab_var}");
        }
        built
    }

    fn label(&self, key: CellKey, collection_dates: &str, estimate: CellEstimate) -> CrosstabCell {
        let q_var_label = self
            .dictionary
            .question(&key.q_var)
            .map(|q| q.description.clone())
            .unwrap_or_else(|| key.q_var.clone());
        let q_val_label = self
            .dictionary
            .recoded_label(&key.q_var, key.q_val)
            .map(str::to_string);
        let cbsa_title = if key.xtab_var == self.options.metro_var {
            self.dictionary
                .metro_title(key.xtab_val)
                .map(str::to_string)
        } else {
            None
        };
        CrosstabCell {
            key,
            collection_dates: collection_dates.to_string(),
            cbsa_title,
            q_var_label,
            q_val_label,
            estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    use super::*;
    use crate::dictionary::{MetroArea, QuestionLabel, QuestionType, ResponseLabel, VariableType};
    use crate::microdata::{MicrodataRecord, SchemeWeights};

    fn question(variable: &str, kind: QuestionType) -> QuestionLabel {
        QuestionLabel {
            variable: variable.to_string(),
            variable_recode: None,
            description: format!("About {variable}"),
            universe: "All adults".to_string(),
            variable_type: VariableType::Question,
            question_type: Some(kind),
        }
    }

    fn response(variable: &str, value: i64, label: &str, do_not_join: bool) -> ResponseLabel {
        ResponseLabel {
            variable: variable.to_string(),
            value,
            value_recode: value,
            label: label.to_string(),
            group: String::new(),
            do_not_join,
        }
    }

    fn dictionary() -> LabelDictionary {
        LabelDictionary::builder()
            .questions(vec![
                question("ANXIOUS", QuestionType::YesNo),
                QuestionLabel {
                    variable_type: VariableType::Geocode,
                    ..question("EST_ST", QuestionType::SelectOne)
                },
            ])
            .responses(vec![
                response("ANXIOUS", 1, "Yes", false),
                response("ANXIOUS", 2, "No", false),
                response("ANXIOUS", 3, "Unsure", true),
            ])
            .crosswalk(vec![(
                17031,
                MetroArea {
                    cbsa_code: 16980,
                    title: "Chicago-Naperville-Elgin".to_string(),
                    state: "IL".to_string(),
                },
            )])
            .numeric_buckets(Vec::new())
            .build()
            .unwrap()
    }

    fn record(weight: f64, values: &[Option<i64>]) -> MicrodataRecord {
        let weights = SchemeWeights::new(weight, DVector::from_element(4, weight));
        MicrodataRecord::new(None, weights.clone(), weights, values.to_vec())
    }

    fn week(rows: Vec<MicrodataRecord>) -> WeekMicrodata {
        let columns = ["TOPLINE", "EST_MSA", "EST_ST", "ANXIOUS"]
            .iter()
            .map(|c| c.to_string())
            .collect();
        WeekMicrodata::new(7, columns, rows, 4).unwrap()
    }

    fn builder(dictionary: &LabelDictionary) -> CrosstabBuilder<'_> {
        CrosstabBuilder::new(
            dictionary,
            EstimationOptions::default().with_replicate_count(4),
            CrosstabOptions::default().with_xtab_vars(["TOPLINE", "EST_MSA"]),
        )
    }

    #[test]
    fn shares_are_ratios_of_weight_sums_within_the_universe() {
        let dictionary = dictionary();
        let data = week(vec![
            record(3.0, &[Some(1), Some(16980), Some(17), Some(1)]),
            record(1.0, &[Some(1), Some(16980), Some(17), Some(2)]),
            record(5.0, &[Some(1), None, Some(17), None]),
        ]);
        let built = builder(&dictionary).build_week(&data, &CollectionCalendar::default());

        let yes = built
            .table
            .get(&CellKey::new(7, "TOPLINE", 1, "ANXIOUS", 1))
            .unwrap();
        assert_relative_eq!(yes.estimate.person.share.point, 0.75);
        assert_relative_eq!(yes.estimate.household.total.point, 3.0);
        assert_eq!(yes.q_var_label, "About ANXIOUS");
        assert_eq!(yes.q_val_label.as_deref(), Some("Yes"));
        assert_eq!(yes.cbsa_title, None);

        // The unobserved dictionary value is emitted with a zero share and no label.
        let unsure = built
            .table
            .get(&CellKey::new(7, "TOPLINE", 1, "ANXIOUS", 3))
            .unwrap();
        assert_eq!(unsure.estimate.person.share.point, 0.0);
        assert_eq!(unsure.q_val_label, None);

        let metro = built
            .table
            .get(&CellKey::new(7, "EST_MSA", 16980, "ANXIOUS", 2))
            .unwrap();
        assert_eq!(metro.cbsa_title.as_deref(), Some("Chicago-Naperville-Elgin"));

        // Geocodes and cross-tab variables are never tabulated as questions.
        assert!(built.table.iter().all(|cell| cell.key.q_var == "ANXIOUS"));
    }

    #[test]
    fn zero_weight_universe_emits_no_cell() {
        let dictionary = dictionary();
        let data = week(vec![
            record(0.0, &[Some(1), Some(16980), Some(17), Some(1)]),
        ]);
        let built = builder(&dictionary).build_week(&data, &CollectionCalendar::default());
        assert!(built.table.is_empty());
        assert!(!built.failures.is_empty());
        assert!(built
            .failures
            .iter()
            .all(|err| matches!(err, PulseError::Estimation { .. })));
    }

    #[test]
    fn rebuilding_a_week_replaces_its_rows() {
        let dictionary = dictionary();
        let data = week(vec![
            record(2.0, &[Some(1), Some(16980), Some(17), Some(1)]),
            record(2.0, &[Some(1), Some(16980), Some(17), Some(2)]),
        ]);
        let builder = builder(&dictionary);
        let mut table = CrosstabTable::new();
        table.merge(builder.build_week(&data, &CollectionCalendar::default()).table);
        let first = table.week_len(7);
        table.merge(builder.build_week(&data, &CollectionCalendar::default()).table);
        assert_eq!(table.week_len(7), first);
        assert_eq!(table.len(), first);
    }

    #[test]
    fn absent_cross_tab_variable_is_reported() {
        let dictionary = dictionary();
        let data = week(vec![record(1.0, &[Some(1), Some(16980), Some(17), Some(1)])]);
        let builder = CrosstabBuilder::new(
            &dictionary,
            EstimationOptions::default().with_replicate_count(4),
            CrosstabOptions::default().with_xtab_vars(["TOPLINE", "EEDUC"]),
        );
        let built = builder.build_week(&data, &CollectionCalendar::default());
        assert_eq!(built.failures.len(), 1);
        assert!(built.table.iter().all(|cell| cell.key.xtab_var == "TOPLINE"));
    }
}
