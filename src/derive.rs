//! Turns a freshly loaded week into the shape the cross-tab builder expects.
//!
//! Steps, in order: drop columns with malformed values, coalesce variables that
//! were renamed between waves, add the `TOPLINE` partition, convert birth year
//! to age, bucketize numeric variables, fold Hispanic origin into race, take
//! respondents who selected nothing out of select-all families, and finally
//! recode every value through the response dictionary. Missing codes
//! become `None`, which is how "outside the question's universe" is expressed
//! downstream.

use log::{debug, info, warn};

use crate::collection::CollectionWindow;
use crate::dictionary::{LabelDictionary, NOT_REPORTED};
use crate::error::PulseError;
use crate::microdata::WeekMicrodata;

pub const TOPLINE: &str = "TOPLINE";
pub const BIRTH_YEAR: &str = "TBIRTH_YEAR";
pub const RACE: &str = "RRACE";
pub const HISPANIC: &str = "RHISPANIC";

const MIN_AGE: i64 = 18;
const HISPANIC_ORIGIN: i64 = 2;
const HISPANIC_RACE_CODE: i64 = 5;

/// A prepared week plus the per-variable failures that were isolated on the way.
#[derive(Debug)]
pub struct Prepared {
    pub data: WeekMicrodata,
    pub failures: Vec<PulseError>,
}

/// Runs every preparation step on one week.
pub fn prepare(
    data: WeekMicrodata,
    dictionary: &LabelDictionary,
    window: Option<&CollectionWindow>,
) -> Prepared {
    let mut failures = Vec::new();
    let data = drop_malformed(data, &mut failures);
    let data = coalesce_variables(data, dictionary);
    let data = data.with_column(TOPLINE, |_| Some(1));
    let data = birth_year_to_age(data, window);
    let data = bucketize(data, dictionary, &mut failures);
    let data = coalesce_race(data);
    let data = mask_unanswered_select_all(data, dictionary);
    let data = recode_values(data, dictionary);
    Prepared { data, failures }
}

fn drop_malformed(mut data: WeekMicrodata, failures: &mut Vec<PulseError>) -> WeekMicrodata {
    let malformed: Vec<String> = data.malformed_columns().iter().cloned().collect();
    for column in malformed {
        failures.push(PulseError::estimation(
            format!("week {} variable {column}", data.week()),
            "column holds non-integer values",
        ));
        data = data.drop_column(&column);
    }
    data
}

/// Renames raw columns to their final names so series line up across waves.
pub fn coalesce_variables(mut data: WeekMicrodata, dictionary: &LabelDictionary) -> WeekMicrodata {
    let mut renames: Vec<(&str, &str)> = dictionary.variable_renames().collect();
    renames.sort_unstable();
    for (from, to) in renames {
        if data.column_index(from).is_some() {
            info!("week {}: coalescing {from} into {to}", data.week());
            data = data.rename_column(from, to);
        }
    }
    data
}

/// Replaces birth year with age at the end of fielding, clipped below at 18.
pub fn birth_year_to_age(data: WeekMicrodata, window: Option<&CollectionWindow>) -> WeekMicrodata {
    if data.column_index(BIRTH_YEAR).is_none() {
        return data;
    }
    let Some(window) = window else {
        warn!(
            "week {}: no collection window, {BIRTH_YEAR} left as birth year",
            data.week()
        );
        return data;
    };
    let year = i64::from(chrono::Datelike::year(&window.end_date));
    data.map_column(BIRTH_YEAR, |value| {
        value.map(|born| if born < 0 { born } else { (year - born).max(MIN_AGE) })
    })
}

/// Maps numeric variables onto their bucket codes.
///
/// Missing codes pass through untouched. A variable with a value outside every
/// bucket is dropped for the week and reported.
pub fn bucketize(
    mut data: WeekMicrodata,
    dictionary: &LabelDictionary,
    failures: &mut Vec<PulseError>,
) -> WeekMicrodata {
    let mut variables: Vec<&str> = dictionary.bucketed_variables().collect();
    variables.sort_unstable();
    for variable in variables {
        let Some(column) = data.column_index(variable) else {
            continue;
        };
        let Some(buckets) = dictionary.buckets(variable) else {
            continue;
        };
        let find = |value: i64| buckets.iter().find(|b| b.contains(value)).map(|b| b.bin);

        let mut unmapped: Vec<i64> = data
            .records()
            .iter()
            .filter_map(|record| record.value(column))
            .filter(|value| !dictionary.is_missing(variable, *value) && find(*value).is_none())
            .collect();
        if !unmapped.is_empty() {
            unmapped.sort_unstable();
            unmapped.dedup();
            failures.push(PulseError::estimation(
                format!("week {} variable {variable}", data.week()),
                format!("values {unmapped:?} fall outside every bucket"),
            ));
            data = data.drop_column(variable);
            continue;
        }

        info!("week {}: bucketizing {variable}", data.week());
        data = data.map_column(variable, |value| {
            value.map(|v| {
                if dictionary.is_missing(variable, v) {
                    v
                } else {
                    find(v).unwrap_or(v)
                }
            })
        });
    }
    data
}

/// Folds Hispanic origin into race as its own category.
///
/// Only an explicit Hispanic answer moves a respondent; missing origin codes
/// keep the reported race.
pub fn coalesce_race(data: WeekMicrodata) -> WeekMicrodata {
    let (Some(race), Some(hispanic)) = (data.column_index(RACE), data.column_index(HISPANIC))
    else {
        return data;
    };
    data.with_column(RACE, |record| match record.value(hispanic) {
        Some(HISPANIC_ORIGIN) => Some(HISPANIC_RACE_CODE),
        _ => record.value(race),
    })
}

/// Removes respondents who left every item of a "select all that apply"
/// family unselected from the universe of each item in that family.
///
/// Must run before recoding, while "not selected" is still the raw `-99`.
pub fn mask_unanswered_select_all(
    mut data: WeekMicrodata,
    dictionary: &LabelDictionary,
) -> WeekMicrodata {
    let columns = data.columns().to_vec();
    let masks: Vec<(&String, Vec<bool>)> = columns
        .iter()
        .filter(|item| dictionary.is_select_all(item))
        .map(|item| {
            let family: Vec<usize> = dictionary
                .select_all_family(item, &columns)
                .into_iter()
                .filter_map(|name| data.column_index(name))
                .collect();
            let mask = data
                .records()
                .iter()
                .map(|record| {
                    family
                        .iter()
                        .all(|column| record.value(*column) == Some(NOT_REPORTED))
                })
                .collect();
            (item, mask)
        })
        .collect();

    for (item, mask) in masks {
        let excluded = mask.iter().filter(|masked| **masked).count();
        if excluded > 0 {
            debug!(
                "week {}: {excluded} respondents selected nothing in the family of {item}",
                data.week()
            );
        }
        let mut masked = mask.into_iter();
        data = data.map_column(item, |value| {
            if masked.next().unwrap_or(false) {
                None
            } else {
                value
            }
        });
    }
    data
}

/// Drops missing codes and applies dictionary recodes to every column.
pub fn recode_values(mut data: WeekMicrodata, dictionary: &LabelDictionary) -> WeekMicrodata {
    let columns: Vec<String> = data.columns().to_vec();
    for column in &columns {
        data = data.map_column(column, |value| {
            value.and_then(|v| {
                if dictionary.is_missing(column, v) {
                    None
                } else {
                    Some(dictionary.recode(column, v))
                }
            })
        });
    }
    data
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use chrono::NaiveDate;
    use nalgebra::DVector;

    use super::*;
    use crate::collection::CollectionCalendar;
    use crate::crosstab::{CellKey, CrosstabBuilder};
    use crate::options::{CrosstabOptions, EstimationOptions};
    use crate::dictionary::{NumericBucket, QuestionLabel, QuestionType, ResponseLabel, VariableType};
    use crate::microdata::{MicrodataRecord, SchemeWeights};

    fn question(variable: &str, recode: Option<&str>, kind: QuestionType) -> QuestionLabel {
        QuestionLabel {
            variable: variable.to_string(),
            variable_recode: recode.map(str::to_string),
            description: variable.to_string(),
            universe: "All adults".to_string(),
            variable_type: VariableType::Question,
            question_type: Some(kind),
        }
    }

    fn response(variable: &str, value: i64, recode: i64) -> ResponseLabel {
        ResponseLabel {
            variable: variable.to_string(),
            value,
            value_recode: recode,
            label: format!("{variable}={recode}"),
            group: String::new(),
            do_not_join: false,
        }
    }

    fn bucket(min_value: i64, max_value: i64, bin: i64) -> NumericBucket {
        NumericBucket {
            variable: BIRTH_YEAR.to_string(),
            min_value,
            max_value,
            bin,
            label: String::new(),
        }
    }

    fn dictionary() -> LabelDictionary {
        LabelDictionary::builder()
            .questions(vec![
                question("WRKLOSS", Some("WRKLOSSRV"), QuestionType::YesNo),
                question("SEEING1", None, QuestionType::SelectAll),
                question("SEEING2", None, QuestionType::SelectAll),
            ])
            .responses(vec![
                response("WRKLOSSRV", 2, 0),
                response("SEEING1", -99, 0),
                response("SEEING2", -99, 0),
            ])
            .crosswalk(Vec::new())
            .numeric_buckets(vec![bucket(18, 39, 1), bucket(40, 120, 2)])
            .build()
            .unwrap()
    }

    fn week(columns: &[&str], rows: &[&[Option<i64>]]) -> WeekMicrodata {
        let records = rows
            .iter()
            .map(|values| {
                let weights = SchemeWeights::new(1.0, DVector::from_element(2, 1.0));
                MicrodataRecord::new(None, weights.clone(), weights, values.to_vec())
            })
            .collect();
        WeekMicrodata::new(
            30,
            columns.iter().map(|c| c.to_string()).collect(),
            records,
            2,
        )
        .unwrap()
    }

    fn window() -> CollectionWindow {
        let date = |d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap();
        CollectionWindow {
            week: 30,
            pub_date: date("2021-05-26"),
            start_date: date("2021-04-28"),
            end_date: date("2021-05-10"),
        }
    }

    fn column(data: &WeekMicrodata, name: &str) -> Vec<Option<i64>> {
        let index = data.column_index(name).unwrap();
        data.records().iter().map(|r| r.value(index)).collect()
    }

    #[test]
    fn prepare_runs_every_step() {
        let data = week(
            &["WRKLOSS", "SEEING1", "TBIRTH_YEAR", "RRACE", "RHISPANIC"],
            &[
                &[Some(2), Some(-99), Some(1990), Some(1), Some(1)],
                &[Some(-99), Some(-88), Some(1950), Some(2), Some(2)],
                &[Some(1), Some(1), Some(2010), Some(3), None],
            ],
        );
        let prepared = prepare(data, &dictionary(), Some(&window()));
        assert!(prepared.failures.is_empty());
        let data = prepared.data;

        assert_eq!(column(&data, "WRKLOSSRV"), vec![Some(0), None, Some(1)]);
        // SEEING1 is its own family here, so "not selected" alone leaves the universe.
        assert_eq!(column(&data, "SEEING1"), vec![None, None, Some(1)]);
        // 2021 - 1990 = 31, 2021 - 1950 = 71, 2021 - 2010 = 11 clipped to 18.
        assert_eq!(column(&data, "TBIRTH_YEAR"), vec![Some(1), Some(2), Some(1)]);
        assert_eq!(column(&data, "RRACE"), vec![Some(1), Some(5), Some(3)]);
        assert_eq!(column(&data, "TOPLINE"), vec![Some(1); 3]);
    }

    #[test]
    fn unmapped_bucket_values_drop_only_that_variable() {
        let data = week(
            &["TBIRTH_YEAR", "SEEING1"],
            &[&[Some(150), Some(1)], &[Some(30), Some(1)]],
        );
        let mut failures = Vec::new();
        let data = bucketize(data, &dictionary(), &mut failures);
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], PulseError::Estimation { .. }));
        assert!(data.column_index("TBIRTH_YEAR").is_none());
        assert!(data.column_index("SEEING1").is_some());
    }

    #[test]
    fn missing_hispanic_origin_keeps_the_reported_race() {
        let data = week(
            &["RRACE", "RHISPANIC"],
            &[
                &[Some(1), Some(-99)],
                &[Some(2), Some(-88)],
                &[Some(3), Some(1)],
                &[Some(4), Some(2)],
                &[Some(1), None],
            ],
        );
        let data = coalesce_race(data);
        assert_eq!(
            column(&data, "RRACE"),
            vec![Some(1), Some(2), Some(3), Some(5), Some(1)]
        );
    }

    #[test]
    fn select_all_universe_excludes_respondents_who_selected_nothing() {
        let dictionary = dictionary();
        let data = week(
            &["SEEING1", "SEEING2"],
            &[
                &[Some(1), Some(-99)],
                &[Some(-99), Some(1)],
                &[Some(-99), Some(-99)],
                &[Some(-99), Some(-99)],
                &[Some(-88), Some(-88)],
            ],
        );
        let prepared = prepare(data, &dictionary, None);
        let data = prepared.data;
        assert_eq!(
            column(&data, "SEEING1"),
            vec![Some(1), Some(0), None, None, None]
        );
        assert_eq!(
            column(&data, "SEEING2"),
            vec![Some(0), Some(1), None, None, None]
        );

        // One of the two respondents who selected anything picked SEEING1.
        let builder = CrosstabBuilder::new(
            &dictionary,
            EstimationOptions::default().with_replicate_count(2),
            CrosstabOptions::default().with_xtab_vars([TOPLINE]),
        );
        let built = builder.build_week(&data, &CollectionCalendar::default());
        let selected = built
            .table
            .get(&CellKey::new(30, TOPLINE, 1, "SEEING1", 1))
            .unwrap();
        assert_relative_eq!(selected.estimate.person.share.point, 0.5);
    }

    #[test]
    fn age_is_left_alone_without_a_window() {
        let data = week(&["TBIRTH_YEAR"], &[&[Some(1980)]]);
        let data = birth_year_to_age(data, None);
        assert_eq!(column(&data, "TBIRTH_YEAR"), vec![Some(1980)]);
    }
}
