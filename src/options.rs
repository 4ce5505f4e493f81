//! Configuration structures for estimation, smoothing, cross-tabulation and I/O retries.
//!
//! Every struct carries the defaults used by the production pipeline and can be
//! partially overridden from a JSON document through `serde`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{PulseError, Result};

/// How the replicate estimates are turned into a standard error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceMethod {
    /// Successive difference replication: `se = sqrt(4/R * sum((theta_r - theta)^2))`.
    SuccessiveDifference,
    /// Sample standard deviation of the replicate estimates around their mean.
    ReplicateStdDev,
}

/// Independent variable used when fitting the smoother.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxis {
    /// Ordinal week index.
    WeekIndex,
    /// Days since the epoch of each week's collection end date.
    EndDate,
}

/// Options for the weighted estimator.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    /// Critical value applied to the replicate standard error (1.645 for 90%).
    pub confidence_multiplier: f64,
    /// Replicate variance formula.
    pub variance_method: VarianceMethod,
    /// Number of replicate weight columns expected per weighting scheme.
    pub replicate_count: usize,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            confidence_multiplier: 1.645,
            variance_method: VarianceMethod::SuccessiveDifference,
            replicate_count: 80,
        }
    }
}

impl EstimationOptions {
    /// Overrides the confidence multiplier.
    pub fn with_confidence_multiplier(mut self, multiplier: f64) -> Self {
        self.confidence_multiplier = multiplier;
        self
    }

    /// Overrides the replicate variance formula.
    pub fn with_variance_method(mut self, method: VarianceMethod) -> Self {
        self.variance_method = method;
        self
    }

    /// Overrides the expected number of replicate columns.
    pub fn with_replicate_count(mut self, count: usize) -> Self {
        self.replicate_count = count;
        self
    }
}

/// Options for the LOWESS post-pass.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SmoothingOptions {
    /// Fraction of a series used as the local neighbourhood.
    pub span: f64,
    /// Number of robustifying reweighting passes after the initial fit.
    pub robustness_iterations: usize,
    /// Series with fewer observed weeks are passed through unsmoothed.
    pub min_weeks: usize,
    /// Independent variable of the fit.
    pub time_axis: TimeAxis,
}

impl Default for SmoothingOptions {
    fn default() -> Self {
        Self {
            span: 0.2,
            robustness_iterations: 3,
            min_weeks: 2,
            time_axis: TimeAxis::WeekIndex,
        }
    }
}

impl SmoothingOptions {
    /// Overrides the smoothing span.
    pub fn with_span(mut self, span: f64) -> Self {
        self.span = span;
        self
    }

    /// Overrides the number of robustness iterations.
    pub fn with_robustness_iterations(mut self, iterations: usize) -> Self {
        self.robustness_iterations = iterations;
        self
    }

    /// Overrides the minimum number of observed weeks.
    pub fn with_min_weeks(mut self, min_weeks: usize) -> Self {
        self.min_weeks = min_weeks;
        self
    }

    /// Overrides the time axis.
    pub fn with_time_axis(mut self, axis: TimeAxis) -> Self {
        self.time_axis = axis;
        self
    }
}

/// Options for the cross-tab builder.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CrosstabOptions {
    /// Partitioning variables, in output order.
    pub xtab_vars: Vec<String>,
    /// Cross-tab variable whose values are CBSA codes.
    pub metro_var: String,
}

impl Default for CrosstabOptions {
    fn default() -> Self {
        Self {
            xtab_vars: [
                "TOPLINE",
                "RRACE",
                "EEDUC",
                "EST_MSA",
                "INCOME",
                "EGENDER",
                "TBIRTH_YEAR",
            ]
            .iter()
            .map(|name| name.to_string())
            .collect(),
            metro_var: "EST_MSA".to_string(),
        }
    }
}

impl CrosstabOptions {
    /// Replaces the list of cross-tab variables.
    pub fn with_xtab_vars<I, S>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.xtab_vars = vars.into_iter().map(Into::into).collect();
        self
    }
}

/// Bounded retry with exponential backoff for fetches and sink writes.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total number of attempts, including the first.
    pub max_attempts: usize,
    /// Delay before the second attempt, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Factor applied to the delay after every failed attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryOptions {
    /// Overrides the attempt budget.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Overrides the initial backoff.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Delay to wait after the given (zero-based) failed attempt.
    pub fn backoff_after(&self, attempt: usize) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        Duration::from_millis((self.initial_backoff_ms as f64 * factor) as u64)
    }
}

/// Aggregated configuration for a pipeline run.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub estimation: EstimationOptions,
    pub smoothing: SmoothingOptions,
    pub crosstab: CrosstabOptions,
    pub retry: RetryOptions,
}

impl PipelineOptions {
    /// Reads options from a JSON file; absent keys keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&text)?;
        options.validate()?;
        Ok(options)
    }

    /// Override the estimation settings while preserving other defaults.
    pub fn with_estimation(mut self, estimation: EstimationOptions) -> Self {
        self.estimation = estimation;
        self
    }

    /// Override the smoothing settings while preserving other defaults.
    pub fn with_smoothing(mut self, smoothing: SmoothingOptions) -> Self {
        self.smoothing = smoothing;
        self
    }

    /// Override the cross-tab settings while preserving other defaults.
    pub fn with_crosstab(mut self, crosstab: CrosstabOptions) -> Self {
        self.crosstab = crosstab;
        self
    }

    /// Override the retry settings while preserving other defaults.
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Rejects values that would make estimation or smoothing meaningless.
    pub fn validate(&self) -> Result<()> {
        let span = self.smoothing.span;
        if !(span > 0.0 && span <= 1.0) {
            return Err(PulseError::invalid_option(
                "smoothing.span",
                format!("must lie in (0, 1], found {span}"),
            ));
        }
        let multiplier = self.estimation.confidence_multiplier;
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(PulseError::invalid_option(
                "estimation.confidence_multiplier",
                format!("must be positive, found {multiplier}"),
            ));
        }
        if self.estimation.replicate_count == 0 {
            return Err(PulseError::invalid_option(
                "estimation.replicate_count",
                "at least one replicate column is required",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(PulseError::invalid_option(
                "retry.max_attempts",
                "at least one attempt is required",
            ));
        }
        if self.crosstab.xtab_vars.is_empty() {
            return Err(PulseError::invalid_option(
                "crosstab.xtab_vars",
                "at least one cross-tab variable is required",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_constants() {
        let options = PipelineOptions::default();
        assert_eq!(options.estimation.confidence_multiplier, 1.645);
        assert_eq!(options.estimation.replicate_count, 80);
        assert_eq!(options.smoothing.span, 0.2);
        assert_eq!(options.crosstab.xtab_vars[0], "TOPLINE");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let json = r#"{ "smoothing": { "span": 0.5, "time_axis": "end_date" } }"#;
        let options: PipelineOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.smoothing.span, 0.5);
        assert_eq!(options.smoothing.time_axis, TimeAxis::EndDate);
        assert_eq!(options.smoothing.min_weeks, 2);
        assert_eq!(
            options.estimation.variance_method,
            VarianceMethod::SuccessiveDifference
        );
    }

    #[test]
    fn validation_rejects_out_of_range_span() {
        let options =
            PipelineOptions::default().with_smoothing(SmoothingOptions::default().with_span(1.5));
        assert!(matches!(
            options.validate(),
            Err(PulseError::InvalidOption {
                option: "smoothing.span",
                ..
            })
        ));
    }

    #[test]
    fn backoff_grows_geometrically() {
        let retry = RetryOptions::default();
        assert_eq!(retry.backoff_after(0), Duration::from_millis(200));
        assert_eq!(retry.backoff_after(2), Duration::from_millis(800));
    }
}
