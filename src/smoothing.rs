//! Smoothed share series derived from an accumulated [`CrosstabTable`].
//!
//! Every `(xtab_var, xtab_val, q_var, q_val)` series is fitted with
//! [`lowess`] over its observed weeks, separately for person and household
//! shares. Fitted points are clamped to `[0, 1]` and the raw interval margins
//! are re-applied around them. Shares of each `(week, xtab_var, xtab_val,
//! q_var)` group are then rescaled to sum to one, except for "select all that
//! apply" questions whose options are independent indicators.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::collection::CollectionCalendar;
use crate::crosstab::{CellKey, CrosstabCell, CrosstabTable};
use crate::error::PulseError;
use crate::estimation::Interval;
use crate::lowess::{lowess, LowessOptions};
use crate::microdata::WeightScheme;
use crate::options::SmoothingOptions;

/// Identity of one time series: a cell key without its week.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub xtab_var: String,
    pub xtab_val: i64,
    pub q_var: String,
    pub q_val: i64,
}

impl SeriesKey {
    fn of(key: &CellKey) -> Self {
        Self {
            xtab_var: key.xtab_var.clone(),
            xtab_val: key.xtab_val,
            q_var: key.q_var.clone(),
            q_val: key.q_val,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}={} / {}={}",
            self.xtab_var, self.xtab_val, self.q_var, self.q_val
        )
    }
}

/// Smoothed person and household shares of one cell.
#[derive(Clone, Debug, PartialEq)]
pub struct SmoothedCell {
    pub key: CellKey,
    pub person: Interval,
    pub household: Interval,
}

impl SmoothedCell {
    pub fn scheme(&self, scheme: WeightScheme) -> &Interval {
        match scheme {
            WeightScheme::Person => &self.person,
            WeightScheme::Household => &self.household,
        }
    }

    fn scheme_mut(&mut self, scheme: WeightScheme) -> &mut Interval {
        match scheme {
            WeightScheme::Person => &mut self.person,
            WeightScheme::Household => &mut self.household,
        }
    }

    fn raw(cell: &CrosstabCell) -> Self {
        Self {
            key: cell.key.clone(),
            person: cell.estimate.person.share,
            household: cell.estimate.household.share,
        }
    }
}

/// Smoothed rows keyed like the cross-tab table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SmoothedTable {
    cells: BTreeMap<CellKey, SmoothedCell>,
}

impl SmoothedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, cell: SmoothedCell) -> Option<SmoothedCell> {
        self.cells.insert(cell.key.clone(), cell)
    }

    pub fn get(&self, key: &CellKey) -> Option<&SmoothedCell> {
        self.cells.get(key)
    }

    pub fn weeks(&self) -> BTreeSet<u32> {
        self.cells.keys().map(|key| key.week).collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SmoothedCell> {
        self.cells.values()
    }
}

impl FromIterator<SmoothedCell> for SmoothedTable {
    fn from_iter<I: IntoIterator<Item = SmoothedCell>>(iter: I) -> Self {
        let mut table = Self::new();
        for cell in iter {
            table.upsert(cell);
        }
        table
    }
}

/// Result of a smoothing pass.
#[derive(Debug, Default)]
pub struct Smoothed {
    pub table: SmoothedTable,
    /// Series whose fit failed and were passed through raw.
    pub unsmoothed: Vec<PulseError>,
    /// Series with too few weeks to fit, passed through raw.
    pub short_series: usize,
}

/// Fits and renormalizes share series.
#[derive(Clone, Debug)]
pub struct Smoother<'a> {
    options: SmoothingOptions,
    calendar: &'a CollectionCalendar,
}

impl<'a> Smoother<'a> {
    pub fn new(options: SmoothingOptions, calendar: &'a CollectionCalendar) -> Self {
        Self { options, calendar }
    }

    pub fn options(&self) -> &SmoothingOptions {
        &self.options
    }

    /// Smooths every series of `table`.
    ///
    /// `is_select_all` tells which question variables are exempt from
    /// renormalization. Series passed through raw (too short, or a failed
    /// fit) keep their values unchanged; the fitted cells of their group are
    /// rescaled to fill whatever share the raw cells leave.
    pub fn smooth<F>(&self, table: &CrosstabTable, is_select_all: F) -> Smoothed
    where
        F: Fn(&str) -> bool,
    {
        let mut series: BTreeMap<SeriesKey, Vec<&CrosstabCell>> = BTreeMap::new();
        for cell in table.iter() {
            series.entry(SeriesKey::of(&cell.key)).or_default().push(cell);
        }
        info!("smoothing {} series", series.len());

        let fitted: Vec<SeriesFit> = series
            .par_iter()
            .map(|(key, cells)| self.smooth_series(key, cells))
            .collect();

        let mut smoothed = Smoothed::default();
        let mut cells = Vec::with_capacity(table.len());
        let mut passthrough = HashSet::new();
        for fit in fitted {
            let raw = match fit.outcome {
                FitOutcome::Fitted => false,
                FitOutcome::TooShort => {
                    smoothed.short_series += 1;
                    true
                }
                FitOutcome::Failed(err) => {
                    smoothed.unsmoothed.push(err);
                    true
                }
            };
            if raw {
                passthrough.extend(fit.cells.iter().map(|cell| cell.key.clone()));
            }
            cells.extend(fit.cells);
        }

        renormalize(&mut cells, &passthrough, is_select_all);
        smoothed.table = cells.into_iter().collect();
        smoothed
    }

    fn smooth_series(&self, key: &SeriesKey, cells: &[&CrosstabCell]) -> SeriesFit {
        let raw = || -> Vec<SmoothedCell> {
            cells.iter().map(|cell| SmoothedCell::raw(cell)).collect()
        };
        if cells.len() < self.options.min_weeks.max(1) {
            debug!("series {key}: {} weeks, passing through raw", cells.len());
            return SeriesFit {
                cells: raw(),
                outcome: FitOutcome::TooShort,
            };
        }

        let x: Vec<f64> = cells
            .iter()
            .map(|cell| {
                self.calendar
                    .time_coordinate(cell.key.week, self.options.time_axis)
            })
            .collect();
        let lowess_options = LowessOptions::from(&self.options);

        let mut out = raw();
        for scheme in WeightScheme::ALL {
            let y: Vec<f64> = cells
                .iter()
                .map(|cell| cell.estimate.scheme(scheme).share.point)
                .collect();
            let fit = match lowess(&x, &y, &lowess_options) {
                Ok(fit) => fit,
                Err(err) => {
                    let err = PulseError::smoothing(
                        format!("{key} ({})", scheme.label()),
                        err.to_string(),
                    );
                    warn!("{err}; passing the series through raw");
                    return SeriesFit {
                        cells: raw(),
                        outcome: FitOutcome::Failed(err),
                    };
                }
            };
            for ((cell, smoothed), fitted) in cells.iter().zip(out.iter_mut()).zip(fit) {
                *smoothed.scheme_mut(scheme) =
                    around(&cell.estimate.scheme(scheme).share, fitted);
            }
        }
        SeriesFit {
            cells: out,
            outcome: FitOutcome::Fitted,
        }
    }
}

enum FitOutcome {
    Fitted,
    TooShort,
    Failed(PulseError),
}

struct SeriesFit {
    cells: Vec<SmoothedCell>,
    outcome: FitOutcome,
}

/// Re-applies the raw margins around a fitted point, everything clamped to `[0, 1]`.
fn around(raw: &Interval, fitted: f64) -> Interval {
    let (below, above) = raw.margins();
    let point = fitted.clamp(0.0, 1.0);
    Interval::new(
        point,
        (point - below.max(0.0)).clamp(0.0, point),
        (point + above.max(0.0)).clamp(point, 1.0),
    )
}

/// Scales each non select-all `(week, xtab_var, xtab_val, q_var)` group so
/// its points sum to one. Cells in `passthrough` are held fixed and the
/// others share the remainder. Bounds are scaled by the same factor.
fn renormalize<F>(cells: &mut [SmoothedCell], passthrough: &HashSet<CellKey>, is_select_all: F)
where
    F: Fn(&str) -> bool,
{
    let group = |key: &CellKey| (key.week, key.xtab_var.clone(), key.xtab_val, key.q_var.clone());
    // Per scheme: (fitted total, fixed total).
    let mut totals: HashMap<(u32, String, i64, String), [(f64, f64); 2]> = HashMap::new();
    for cell in cells.iter().filter(|cell| !is_select_all(&cell.key.q_var)) {
        let fixed = passthrough.contains(&cell.key);
        let total = totals.entry(group(&cell.key)).or_insert([(0.0, 0.0); 2]);
        for (slot, scheme) in WeightScheme::ALL.into_iter().enumerate() {
            let point = cell.scheme(scheme).point;
            if fixed {
                total[slot].1 += point;
            } else {
                total[slot].0 += point;
            }
        }
    }

    for cell in cells.iter_mut() {
        if passthrough.contains(&cell.key) {
            continue;
        }
        let Some(total) = totals.get(&group(&cell.key)) else {
            continue;
        };
        for (slot, scheme) in WeightScheme::ALL.into_iter().enumerate() {
            let (fitted, fixed) = total[slot];
            let room = 1.0 - fixed;
            if fitted <= 0.0 || room <= 0.0 {
                continue;
            }
            let factor = room / fitted;
            let interval = cell.scheme_mut(scheme);
            let point = (interval.point * factor).min(1.0);
            *interval = Interval::new(
                point,
                (interval.lower * factor).min(point),
                (interval.upper * factor).clamp(point, 1.0),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::estimation::{CellEstimate, SchemeEstimate};

    fn cell(week: u32, q_var: &str, q_val: i64, share: f64, margin: f64) -> CrosstabCell {
        let scheme = SchemeEstimate {
            total: Interval::new(share * 100.0, share * 90.0, share * 110.0),
            share: Interval::new(share, share - margin, share + margin),
        };
        CrosstabCell {
            key: CellKey::new(week, "TOPLINE", 1, q_var, q_val),
            collection_dates: String::new(),
            cbsa_title: None,
            q_var_label: q_var.to_string(),
            q_val_label: None,
            estimate: CellEstimate {
                person: scheme,
                household: scheme,
            },
        }
    }

    fn smooth(table: &CrosstabTable, options: SmoothingOptions, select_all: &[&str]) -> Smoothed {
        let calendar = CollectionCalendar::default();
        Smoother::new(options, &calendar).smooth(table, |q| select_all.contains(&q))
    }

    fn point(smoothed: &Smoothed, week: u32, q_var: &str, q_val: i64) -> f64 {
        smoothed
            .table
            .get(&CellKey::new(week, "TOPLINE", 1, q_var, q_val))
            .unwrap()
            .person
            .point
    }

    #[test]
    fn constant_series_stay_constant() {
        let table: CrosstabTable = (1..=10)
            .flat_map(|w| [cell(w, "ANXIOUS", 1, 0.3, 0.02), cell(w, "ANXIOUS", 2, 0.7, 0.02)])
            .collect();
        let smoothed = smooth(&table, SmoothingOptions::default().with_span(0.5), &[]);
        assert!(smoothed.unsmoothed.is_empty());
        for w in 1..=10 {
            assert_abs_diff_eq!(point(&smoothed, w, "ANXIOUS", 1), 0.3, epsilon = 1e-9);
            assert_abs_diff_eq!(point(&smoothed, w, "ANXIOUS", 2), 0.7, epsilon = 1e-9);
        }
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        let table: CrosstabTable = (1..=6)
            .map(|w| cell(w, "SEEING1", 1, if w % 2 == 0 { 1.4 } else { -0.3 }, 0.1))
            .collect();
        let smoothed = smooth(&table, SmoothingOptions::default().with_span(0.5), &["SEEING1"]);
        for cell in smoothed.table.iter() {
            for scheme in WeightScheme::ALL {
                let interval = cell.scheme(scheme);
                assert!(interval.is_ordered(), "{interval:?}");
                assert!(interval.lower >= 0.0 && interval.upper <= 1.0);
            }
        }
    }

    #[test]
    fn short_series_pass_through_raw() {
        let table: CrosstabTable = [
            cell(4, "ANXIOUS", 1, 0.25, 0.05),
            cell(4, "ANXIOUS", 2, 0.75, 0.05),
        ]
        .into_iter()
        .collect();
        let smoothed = smooth(&table, SmoothingOptions::default(), &[]);
        assert_eq!(smoothed.short_series, 2);
        let yes = smoothed
            .table
            .get(&CellKey::new(4, "TOPLINE", 1, "ANXIOUS", 1))
            .unwrap();
        assert_abs_diff_eq!(yes.person.point, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(yes.person.lower, 0.20, epsilon = 1e-12);
        assert_abs_diff_eq!(yes.person.upper, 0.30, epsilon = 1e-12);
    }

    #[test]
    fn raw_passthrough_cells_are_not_rescaled() {
        // "Unsure" only shows up in week 1, so its series is too short to fit.
        let mut table: CrosstabTable = (1..=3)
            .map(|w| cell(w, "ANXIOUS", 1, 0.7, 0.05))
            .collect();
        table.upsert(cell(1, "ANXIOUS", 3, 0.2, 0.05));
        let smoothed = smooth(&table, SmoothingOptions::default(), &[]);

        assert_eq!(smoothed.short_series, 1);
        let unsure = smoothed
            .table
            .get(&CellKey::new(1, "TOPLINE", 1, "ANXIOUS", 3))
            .unwrap();
        assert_abs_diff_eq!(unsure.person.point, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(unsure.person.lower, 0.15, epsilon = 1e-12);
        assert_abs_diff_eq!(unsure.person.upper, 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(point(&smoothed, 1, "ANXIOUS", 1), 0.8, epsilon = 1e-9);
        assert_abs_diff_eq!(point(&smoothed, 2, "ANXIOUS", 1), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn renormalization_skips_select_all_groups() {
        let table: CrosstabTable = (1..=3)
            .flat_map(|w| {
                [
                    cell(w, "SEEING1", 1, 0.6, 0.05),
                    cell(w, "SEEING2", 1, 0.5, 0.05),
                    cell(w, "WORRY", 1, 0.6, 0.05),
                    cell(w, "WORRY", 2, 0.6, 0.05),
                ]
            })
            .collect();
        let smoothed = smooth(&table, SmoothingOptions::default(), &["SEEING1", "SEEING2"]);
        for w in 1..=3 {
            assert_abs_diff_eq!(point(&smoothed, w, "SEEING1", 1), 0.6, epsilon = 1e-9);
            assert_abs_diff_eq!(point(&smoothed, w, "SEEING2", 1), 0.5, epsilon = 1e-9);
            assert_abs_diff_eq!(point(&smoothed, w, "WORRY", 1), 0.5, epsilon = 1e-9);
            assert_abs_diff_eq!(point(&smoothed, w, "WORRY", 2), 0.5, epsilon = 1e-9);
        }
    }
}
