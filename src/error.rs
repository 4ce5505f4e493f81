use thiserror::Error;

/// Unified error type for `pulse_xtab` operations.
#[derive(Debug, Error)]
pub enum PulseError {
    /// Raised when a label dictionary sheet is missing, malformed, or lacks required columns.
    #[error("failed to load label dictionary sheet `{sheet}`: {reason}")]
    DictionaryLoad {
        /// Name of the sheet being loaded (`question_labels`, `response_labels`, ...).
        sheet: String,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Raised when a week's microdata lacks a required column or carries unusable weights.
    #[error("week {week}: schema error on column `{column}`: {reason}")]
    Schema {
        week: u32,
        column: String,
        reason: String,
    },

    /// Raised when a single cell or question cannot be estimated.
    #[error("estimation failed for {context}: {reason}")]
    Estimation { context: String, reason: String },

    /// Raised when a series cannot be smoothed.
    #[error("smoothing failed for {group}: {reason}")]
    Smoothing { group: String, reason: String },

    /// Raised when persisting a table fails after every retry.
    #[error("writing table `{table}` failed after {attempts} attempts: {reason}")]
    SinkWrite {
        table: &'static str,
        attempts: usize,
        reason: String,
    },

    /// Raised when fetching raw input fails after every retry.
    #[error("fetching {what} failed after {attempts} attempts: {reason}")]
    Fetch {
        what: String,
        attempts: usize,
        reason: String,
    },

    /// Raised when numerical routines encounter non-finite or inconsistent input.
    #[error("numerical error during {context}")]
    NumericalError { context: &'static str },

    /// Raised when a configuration value is out of range.
    #[error("invalid option `{option}`: {reason}")]
    InvalidOption { option: &'static str, reason: String },

    /// Raised when a downstream HTTP hook rejects or cannot be reached.
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    /// Raised when a run finishes without a single usable cell.
    #[error("run produced no usable output")]
    NoUsableOutput,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PulseError {
    /// Helper to build a [`DictionaryLoad`](PulseError::DictionaryLoad) error.
    pub fn dictionary(sheet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DictionaryLoad {
            sheet: sheet.into(),
            reason: reason.into(),
        }
    }

    /// Helper to build a [`Schema`](PulseError::Schema) error for one week.
    pub fn schema(week: u32, column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Schema {
            week,
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Helper to build an [`Estimation`](PulseError::Estimation) error.
    pub fn estimation(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Estimation {
            context: context.into(),
            reason: reason.into(),
        }
    }

    /// Helper to build a [`Smoothing`](PulseError::Smoothing) error.
    pub fn smoothing(group: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Smoothing {
            group: group.into(),
            reason: reason.into(),
        }
    }

    /// Helper to flag a configuration value as invalid.
    pub fn invalid_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }

    /// Whether this error must abort the whole run rather than a single week or group.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            Self::DictionaryLoad { .. }
                | Self::SinkWrite { .. }
                | Self::InvalidOption { .. }
                | Self::NoUsableOutput
        )
    }

    /// Whether another attempt at the same operation could succeed.
    ///
    /// A file that does not exist will not appear between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, PulseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_separates_fatal_from_isolated_failures() {
        assert!(PulseError::dictionary("question_labels", "missing").is_fatal_for_run());
        assert!(PulseError::SinkWrite {
            table: "pulse",
            attempts: 3,
            reason: "disk full".into(),
        }
        .is_fatal_for_run());
        assert!(!PulseError::schema(12, "PWEIGHT", "missing").is_fatal_for_run());
        assert!(!PulseError::estimation("week 3", "zero universe").is_fatal_for_run());
        assert!(!PulseError::smoothing("TOPLINE/1/ANXIOUS/1", "singular").is_fatal_for_run());
    }

    #[test]
    fn missing_files_are_not_retryable() {
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "week 9");
        assert!(!PulseError::Io(missing).is_retryable());
        let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "signal");
        assert!(PulseError::Io(interrupted).is_retryable());
        assert!(PulseError::estimation("week 3", "zero universe").is_retryable());
    }

    #[test]
    fn schema_error_names_week_and_column() {
        let message = PulseError::schema(27, "HWEIGHT12", "column absent").to_string();
        assert!(message.contains("week 27"));
        assert!(message.contains("HWEIGHT12"));
    }
}
