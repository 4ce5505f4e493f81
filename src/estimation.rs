//! Weighted totals and shares with replicate-weight confidence intervals.
//!
//! Point estimates are ratios of summed full-sample weights. The interval is
//! obtained by recomputing the same ratio under every replicate weight,
//! turning the spread of those replicate estimates into a standard error and
//! scaling it by a fixed critical value. No analytic variance is computed.

use nalgebra::DVector;

use crate::error::{PulseError, Result};
use crate::microdata::{MicrodataRecord, SchemeWeights, WeightScheme};
use crate::options::{EstimationOptions, VarianceMethod};

/// Running sum of one scheme's full-sample and replicate weights.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightTally {
    pub full: f64,
    pub replicates: DVector<f64>,
}

impl WeightTally {
    pub fn zeros(replicates: usize) -> Self {
        Self {
            full: 0.0,
            replicates: DVector::zeros(replicates),
        }
    }

    pub fn add(&mut self, weights: &SchemeWeights) {
        self.full += weights.full;
        self.replicates += &weights.replicates;
    }
}

/// Person and household tallies for the same set of respondents.
#[derive(Clone, Debug, PartialEq)]
pub struct CellTally {
    pub person: WeightTally,
    pub household: WeightTally,
}

impl CellTally {
    pub fn zeros(replicates: usize) -> Self {
        Self {
            person: WeightTally::zeros(replicates),
            household: WeightTally::zeros(replicates),
        }
    }

    /// Adds both weighting schemes of one respondent.
    pub fn add(&mut self, record: &MicrodataRecord) {
        self.person.add(record.weights(WeightScheme::Person));
        self.household.add(record.weights(WeightScheme::Household));
    }

    pub fn scheme(&self, scheme: WeightScheme) -> &WeightTally {
        match scheme {
            WeightScheme::Person => &self.person,
            WeightScheme::Household => &self.household,
        }
    }
}

/// A point estimate with lower and upper confidence bounds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Interval {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    pub fn new(point: f64, lower: f64, upper: f64) -> Self {
        Self {
            point,
            lower,
            upper,
        }
    }

    /// `lower <= point <= upper`, with no NaN anywhere.
    pub fn is_ordered(&self) -> bool {
        self.lower <= self.point && self.point <= self.upper
    }

    /// Distances `(point - lower, upper - point)`.
    pub fn margins(&self) -> (f64, f64) {
        (self.point - self.lower, self.upper - self.point)
    }
}

/// Total and share for one weighting scheme.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SchemeEstimate {
    pub total: Interval,
    pub share: Interval,
}

/// Estimates for both weighting schemes of one cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CellEstimate {
    pub person: SchemeEstimate,
    pub household: SchemeEstimate,
}

impl CellEstimate {
    pub fn scheme(&self, scheme: WeightScheme) -> &SchemeEstimate {
        match scheme {
            WeightScheme::Person => &self.person,
            WeightScheme::Household => &self.household,
        }
    }
}

/// Computes totals and shares from weight tallies.
#[derive(Clone, Debug, Default)]
pub struct WeightedEstimator {
    options: EstimationOptions,
}

impl WeightedEstimator {
    pub fn new(options: EstimationOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EstimationOptions {
        &self.options
    }

    /// Standard error of `full` given its replicate estimates.
    pub fn standard_error(&self, full: f64, replicates: &DVector<f64>) -> f64 {
        let count = replicates.len();
        if count == 0 {
            return 0.0;
        }
        let variance = match self.options.variance_method {
            VarianceMethod::SuccessiveDifference => {
                let squares: f64 = replicates.iter().map(|r| (r - full).powi(2)).sum();
                4.0 / count as f64 * squares
            }
            VarianceMethod::ReplicateStdDev => {
                if count < 2 {
                    return 0.0;
                }
                let mean = replicates.mean();
                let squares: f64 = replicates.iter().map(|r| (r - mean).powi(2)).sum();
                squares / (count - 1) as f64
            }
        };
        variance.sqrt()
    }

    fn margin(&self, full: f64, replicates: &DVector<f64>) -> f64 {
        self.options.confidence_multiplier * self.standard_error(full, replicates)
    }

    /// Weighted total with its interval; the lower bound never goes below zero.
    pub fn total(&self, tally: &WeightTally) -> Interval {
        let margin = self.margin(tally.full, &tally.replicates);
        Interval::new(tally.full, (tally.full - margin).max(0.0), tally.full + margin)
    }

    /// Share of the universe falling in the numerator, bounded to `[0, 1]`.
    ///
    /// Fails with [`PulseError::Estimation`] when the weighted universe is zero.
    pub fn share(&self, numerator: &WeightTally, universe: &WeightTally) -> Result<Interval> {
        if !(universe.full.is_finite() && universe.full > 0.0) {
            return Err(PulseError::estimation(
                "share",
                format!("weighted universe is {}", universe.full),
            ));
        }
        if numerator.replicates.len() != universe.replicates.len() {
            return Err(PulseError::estimation(
                "share",
                format!(
                    "{} numerator replicates against {} universe replicates",
                    numerator.replicates.len(),
                    universe.replicates.len()
                ),
            ));
        }
        let point = numerator.full / universe.full;
        let replicates = numerator
            .replicates
            .zip_map(&universe.replicates, |num, den| {
                if den > 0.0 {
                    num / den
                } else {
                    point
                }
            });
        let margin = self.margin(point, &replicates);
        let point = point.clamp(0.0, 1.0);
        Ok(Interval::new(
            point,
            (point - margin).max(0.0),
            (point + margin).min(1.0),
        ))
    }

    /// Estimates both schemes for one cell against its universe.
    pub fn estimate(&self, numerator: &CellTally, universe: &CellTally) -> Result<CellEstimate> {
        Ok(CellEstimate {
            person: self.scheme_estimate(numerator, universe, WeightScheme::Person)?,
            household: self.scheme_estimate(numerator, universe, WeightScheme::Household)?,
        })
    }

    fn scheme_estimate(
        &self,
        numerator: &CellTally,
        universe: &CellTally,
        scheme: WeightScheme,
    ) -> Result<SchemeEstimate> {
        let numerator = numerator.scheme(scheme);
        Ok(SchemeEstimate {
            total: self.total(numerator),
            share: self.share(numerator, universe.scheme(scheme))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn tally(full: f64, replicates: &[f64]) -> WeightTally {
        WeightTally {
            full,
            replicates: DVector::from_row_slice(replicates),
        }
    }

    #[test]
    fn successive_difference_share_interval() {
        let estimator = WeightedEstimator::default();
        let numerator = tally(30.0, &[28.0, 32.0, 30.0, 30.0]);
        let universe = tally(100.0, &[100.0; 4]);

        let share = estimator.share(&numerator, &universe).unwrap();
        let se = (4.0 / 4.0 * 0.0008_f64).sqrt();
        assert_relative_eq!(share.point, 0.3, epsilon = 1e-12);
        assert_relative_eq!(share.lower, 0.3 - 1.645 * se, epsilon = 1e-12);
        assert_relative_eq!(share.upper, 0.3 + 1.645 * se, epsilon = 1e-12);
    }

    #[test]
    fn replicate_std_dev_is_available() {
        let options = EstimationOptions::default()
            .with_variance_method(VarianceMethod::ReplicateStdDev)
            .with_confidence_multiplier(1.0);
        let estimator = WeightedEstimator::new(options);
        let se = estimator.standard_error(0.3, &DVector::from_row_slice(&[0.28, 0.32, 0.3, 0.3]));
        assert_relative_eq!(se, (0.0008_f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn zero_universe_is_an_estimation_error() {
        let estimator = WeightedEstimator::default();
        let result = estimator.share(&tally(0.0, &[0.0; 2]), &tally(0.0, &[0.0; 2]));
        assert!(matches!(result, Err(PulseError::Estimation { .. })));
    }

    #[test]
    fn bounds_stay_ordered_and_inside_unit_interval() {
        let estimator = WeightedEstimator::default();
        // Replicates disagree wildly so the raw margin exceeds the point.
        let numerator = tally(2.0, &[0.0, 10.0, 0.0, 10.0]);
        let universe = tally(10.0, &[10.0; 4]);
        let share = estimator.share(&numerator, &universe).unwrap();
        assert!(share.is_ordered());
        assert_eq!(share.lower, 0.0);
        assert_eq!(share.upper, 1.0);

        let total = estimator.total(&numerator);
        assert!(total.is_ordered());
        assert_eq!(total.lower, 0.0);
    }

    #[test]
    fn replicates_with_empty_universe_fall_back_to_point() {
        let estimator = WeightedEstimator::default();
        let share = estimator
            .share(&tally(5.0, &[5.0, 0.0]), &tally(10.0, &[10.0, 0.0]))
            .unwrap();
        assert_eq!(share.lower, share.point);
        assert_eq!(share.upper, share.point);
    }
}
