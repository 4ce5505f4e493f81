//! Static JSON documents consumed by the front-end.
//!
//! One document per `(question, cross-tab variable, raw|smoothed)` plus a
//! `meta.json` describing weeks, cross-tab values and questions. Every
//! document lists, for each cross-tab value, one object per week whose keys
//! are response labels and whose values are person-weighted shares (`null`
//! when the response was not estimated that week). Shares are collected by
//! response code; labels are attached last.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde_json::{json, Map, Value};

use crate::collection::CollectionCalendar;
use crate::crosstab::CrosstabTable;
use crate::derive::TOPLINE;
use crate::dictionary::LabelDictionary;
use crate::error::Result;
use crate::options::CrosstabOptions;
use crate::smoothing::SmoothedTable;

pub const META_FILE: &str = "meta.json";

/// Which table a document was built from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CacheVariant {
    Raw,
    Smoothed,
}

impl CacheVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheVariant::Raw => "raw",
            CacheVariant::Smoothed => "smoothed",
        }
    }
}

/// A person-weighted share flattened out of either table.
#[derive(Clone, Debug, PartialEq)]
pub struct ShareRow {
    pub week: u32,
    pub xtab_var: String,
    pub xtab_val: i64,
    pub q_var: String,
    pub q_val: i64,
    pub share: f64,
}

impl ShareRow {
    pub fn from_crosstab(table: &CrosstabTable) -> Vec<Self> {
        table
            .iter()
            .map(|cell| Self {
                week: cell.key.week,
                xtab_var: cell.key.xtab_var.clone(),
                xtab_val: cell.key.xtab_val,
                q_var: cell.key.q_var.clone(),
                q_val: cell.key.q_val,
                share: cell.estimate.person.share.point,
            })
            .collect()
    }

    pub fn from_smoothed(table: &SmoothedTable) -> Vec<Self> {
        table
            .iter()
            .map(|cell| Self {
                week: cell.key.week,
                xtab_var: cell.key.xtab_var.clone(),
                xtab_val: cell.key.xtab_val,
                q_var: cell.key.q_var.clone(),
                q_val: cell.key.q_val,
                share: cell.person.point,
            })
            .collect()
    }
}

/// Counts of what [`FrontendCache::write`] produced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheSummary {
    pub documents: usize,
    pub questions: usize,
}

/// Builds the front-end documents.
#[derive(Clone, Debug)]
pub struct FrontendCache<'a> {
    dictionary: &'a LabelDictionary,
    calendar: &'a CollectionCalendar,
    metro_var: String,
}

impl<'a> FrontendCache<'a> {
    pub fn new(dictionary: &'a LabelDictionary, calendar: &'a CollectionCalendar) -> Self {
        Self {
            dictionary,
            calendar,
            metro_var: CrosstabOptions::default().metro_var,
        }
    }

    /// Cross-tab variable whose values are labelled with CBSA titles.
    pub fn with_metro_var(mut self, metro_var: impl Into<String>) -> Self {
        self.metro_var = metro_var.into();
        self
    }

    pub fn document_name(q_var: &str, xtab_var: &str, variant: CacheVariant) -> String {
        format!("{q_var}_{xtab_var}_{}.json", variant.as_str())
    }

    fn response_label(&self, q_var: &str, q_val: i64) -> String {
        self.dictionary
            .recoded_label(q_var, q_val)
            .map(str::to_string)
            .unwrap_or_else(|| q_val.to_string())
    }

    /// Display label of a cross-tab value.
    pub fn xtab_label(&self, xtab_var: &str, xtab_val: i64) -> String {
        if xtab_var == TOPLINE {
            return "Summary".to_string();
        }
        if xtab_var == self.metro_var {
            if let Some(title) = self.dictionary.metro_title(xtab_val) {
                return title.to_string();
            }
        }
        if let Some(bucket) = self
            .dictionary
            .buckets(xtab_var)
            .and_then(|buckets| buckets.iter().find(|b| b.bin == xtab_val))
            .filter(|bucket| !bucket.label.is_empty())
        {
            return bucket.label.clone();
        }
        self.dictionary
            .recoded_label(xtab_var, xtab_val)
            .map(str::to_string)
            .unwrap_or_else(|| xtab_val.to_string())
    }

    /// Display labels for every response code of one question.
    ///
    /// Codes whose labels coincide get the code appended so no share
    /// overwrites another in the document.
    fn response_labels(&self, q_var: &str, q_vals: &BTreeSet<i64>) -> BTreeMap<i64, String> {
        let mut by_label: BTreeMap<String, Vec<i64>> = BTreeMap::new();
        for &q_val in q_vals {
            by_label
                .entry(self.response_label(q_var, q_val))
                .or_default()
                .push(q_val);
        }
        let mut labels = BTreeMap::new();
        for (label, codes) in by_label {
            if codes.len() > 1 {
                warn!("{q_var}: responses {codes:?} share the label {label:?}, appending codes");
                labels.extend(codes.into_iter().map(|code| (code, format!("{label} ({code})"))));
            } else {
                labels.extend(codes.into_iter().map(|code| (code, label.clone())));
            }
        }
        labels
    }

    /// Documents keyed by file name.
    pub fn documents(&self, rows: &[ShareRow], variant: CacheVariant) -> BTreeMap<String, Value> {
        // (q_var, xtab_var) -> xtab_val -> week -> q_val -> share
        type Series = BTreeMap<i64, BTreeMap<u32, BTreeMap<i64, f64>>>;
        let mut grouped: BTreeMap<(&str, &str), Series> = BTreeMap::new();
        let mut q_vals: BTreeMap<&str, BTreeSet<i64>> = BTreeMap::new();
        for row in rows {
            q_vals.entry(&row.q_var).or_default().insert(row.q_val);
            grouped
                .entry((row.q_var.as_str(), row.xtab_var.as_str()))
                .or_default()
                .entry(row.xtab_val)
                .or_default()
                .entry(row.week)
                .or_default()
                .insert(row.q_val, row.share);
        }
        let labels: BTreeMap<&str, BTreeMap<i64, String>> = q_vals
            .iter()
            .map(|(q_var, values)| (*q_var, self.response_labels(q_var, values)))
            .collect();

        let mut documents = BTreeMap::new();
        for ((q_var, xtab_var), by_value) in grouped {
            let Some(all_labels) = labels.get(q_var) else {
                continue;
            };
            let mut weeks = BTreeSet::new();
            let mut responses = Vec::with_capacity(by_value.len());
            for (xtab_val, by_week) in by_value {
                let mut values = Vec::with_capacity(by_week.len());
                for (week, shares) in by_week {
                    weeks.insert(week);
                    let mut object = Map::new();
                    object.insert("week".to_string(), json!(week));
                    object.insert("dateRange".to_string(), json!(self.calendar.label(week)));
                    for (q_val, label) in all_labels {
                        object.insert(label.clone(), json!(shares.get(q_val)));
                    }
                    values.push(Value::Object(object));
                }
                responses.push(json!({
                    "ct": self.xtab_label(xtab_var, xtab_val),
                    "xtab_val": xtab_val,
                    "values": values,
                }));
            }
            documents.insert(
                Self::document_name(q_var, xtab_var, variant),
                json!({
                    "question": q_var,
                    "ct": xtab_var,
                    "variant": variant.as_str(),
                    "available_weeks": weeks,
                    "response": responses,
                }),
            );
        }
        documents
    }

    /// Weeks, cross-tab values and question groupings present in `table`.
    pub fn meta(&self, table: &CrosstabTable) -> Value {
        let mut dates = Map::new();
        for week in table.weeks() {
            dates.insert(week.to_string(), json!(self.calendar.label(week)));
        }

        let mut xtab_values: BTreeMap<&str, BTreeSet<i64>> = BTreeMap::new();
        let mut questions: BTreeMap<&str, &str> = BTreeMap::new();
        for cell in table.iter() {
            xtab_values
                .entry(&cell.key.xtab_var)
                .or_default()
                .insert(cell.key.xtab_val);
            questions.insert(&cell.key.q_var, &cell.q_var_label);
        }

        let xtabs: Map<String, Value> = xtab_values
            .into_iter()
            .map(|(xtab_var, values)| {
                let labelled: Vec<Value> = values
                    .into_iter()
                    .map(|value| {
                        json!({ "value": value, "label": self.xtab_label(xtab_var, value) })
                    })
                    .collect();
                (xtab_var.to_string(), Value::Array(labelled))
            })
            .collect();

        let questions: Vec<Value> = questions
            .into_iter()
            .map(|(q_var, label)| {
                let grouping = if self.dictionary.is_select_all(q_var) {
                    "single"
                } else {
                    "multi"
                };
                json!({ "q_var": q_var, "label": label, "grouping": grouping })
            })
            .collect();

        json!({
            "collection_dates": dates,
            "xtabs": xtabs,
            "questions": questions,
        })
    }

    /// Writes every document and `meta.json` into `out`.
    pub fn write(
        &self,
        out: &Path,
        crosstab: &CrosstabTable,
        smoothed: Option<&SmoothedTable>,
    ) -> Result<CacheSummary> {
        fs::create_dir_all(out)?;
        let mut documents = self.documents(&ShareRow::from_crosstab(crosstab), CacheVariant::Raw);
        if let Some(smoothed) = smoothed {
            let rows = ShareRow::from_smoothed(smoothed);
            documents.extend(self.documents(&rows, CacheVariant::Smoothed));
        }
        for (name, document) in &documents {
            fs::write(out.join(name), serde_json::to_vec(document)?)?;
        }
        fs::write(out.join(META_FILE), serde_json::to_vec_pretty(&self.meta(crosstab))?)?;

        let summary = CacheSummary {
            documents: documents.len(),
            questions: crosstab
                .iter()
                .map(|cell| cell.key.q_var.as_str())
                .collect::<BTreeSet<_>>()
                .len(),
        };
        info!(
            "wrote {} cache documents for {} questions to {}",
            summary.documents,
            summary.questions,
            out.display()
        );
        Ok(summary)
    }
}
