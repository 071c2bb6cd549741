//! AutoTune errors

use crate::table::CellRef;
use thiserror::Error;

/// Errors that can occur while configuring or driving an AutoTune session
///
/// Per-sample rejections and per-cell suppressions are not errors; they are
/// reported through [`crate::session::SampleOutcome`] and
/// [`crate::authority::LimitOutcome`].
#[derive(Error, Debug)]
pub enum AutoTuneError {
    /// A settings field failed validation
    #[error("Invalid configuration for '{field}': {message}")]
    ConfigInvalid {
        /// Settings field name
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Axis bins are empty or not strictly increasing
    #[error("Invalid table geometry: {0}")]
    GeometryInvalid(String),

    /// Value grid does not match the table axes
    #[error("Table shape mismatch: expected {expected_x}x{expected_y}, got {actual_x}x{actual_y}")]
    ShapeMismatch {
        /// Expected RPM bins
        expected_x: usize,
        /// Expected load bins
        expected_y: usize,
        /// Columns supplied
        actual_x: usize,
        /// Rows supplied
        actual_y: usize,
    },

    /// Cell index outside the table axes
    #[error("Cell {0} is outside the table")]
    CellOutOfRange(CellRef),

    /// Live table holds NaN or infinity
    #[error("Table value at {0} is not a finite number")]
    NonFiniteValue(CellRef),

    /// A tick holds the store; only returned by the non-blocking apply
    #[error("Recommendation store is busy with an update tick, retry in {retry_after_ms} ms")]
    ApplyConflict {
        /// Suggested wait before retrying
        retry_after_ms: u64,
    },

    /// Operation needs a running session
    #[error("AutoTune session is not running")]
    SessionNotRunning,

    /// Settings file could not be read or written
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Settings file is not valid JSON
    #[error("Settings serialization error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AutoTuneError {
    pub(crate) fn config(field: &str, message: impl Into<String>) -> Self {
        AutoTuneError::ConfigInvalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type used throughout the AutoTune engine
pub type Result<T> = std::result::Result<T, AutoTuneError>;
