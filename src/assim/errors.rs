//! Error types for the assimilation engine.
//!
//! Configuration errors are fatal for the whole run. Data-quality faults and
//! numerical failures are per-cell conditions the engine converts into a
//! skipped cell. Persistence
//! errors keep "not found" apart from corruption so a missing checkpoint can
//! fall back to a fresh ensemble.

use thiserror::Error;

/// Result alias for assimilation operations.
pub type DaResult<T> = Result<T, DaError>;

/// Errors that can occur while assimilating a cell.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DaError {
    /// Misconfigured experiment; aborts the run before any computation.
    #[error("Configuration error: {description}")]
    Configuration {
        /// Description of the configuration issue
        description: String,
    },

    /// Forcing or model input contains unusable values.
    #[error("Data quality fault: {description}")]
    DataQuality {
        /// What was found and where
        description: String,
    },

    /// Dimension mismatch between expected and actual
    #[error("Dimension mismatch for {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was expected
        expected: usize,
        /// What was received
        actual: usize,
        /// Context (e.g., "ensemble members", "forcing steps")
        context: String,
    },

    /// Numerical failure inside a filter.
    #[error("Numerical instability: {description}")]
    NumericalInstability {
        /// Description of the issue
        description: String,
    },

    /// A result series was written out of window order.
    #[error("Window [{start}, ..) of series '{series}' precedes already written step {filled}")]
    WindowOrder {
        /// Series name
        series: String,
        /// Start index of the rejected write
        start: usize,
        /// First step not yet written
        filled: usize,
    },

    /// The model adapter failed for a reason other than bad input data.
    #[error("Model error: {description}")]
    Model {
        /// Description of the failure
        description: String,
    },

    /// Reading or writing a persisted object failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl DaError {
    /// Shorthand for [`DaError::Configuration`].
    pub fn configuration(description: impl Into<String>) -> Self {
        DaError::Configuration {
            description: description.into(),
        }
    }

    /// Shorthand for [`DaError::DataQuality`].
    pub fn data_quality(description: impl Into<String>) -> Self {
        DaError::DataQuality {
            description: description.into(),
        }
    }

    /// Shorthand for [`DaError::NumericalInstability`].
    pub fn numerical(description: impl Into<String>) -> Self {
        DaError::NumericalInstability {
            description: description.into(),
        }
    }

    /// True for errors that must stop the whole run rather than one cell.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DaError::DataQuality { .. } | DaError::NumericalInstability { .. }
        )
    }
}

/// Errors from a persistence provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PersistenceError {
    /// Nothing stored under this key.
    #[error("No object stored under '{key}'")]
    NotFound {
        /// Storage key
        key: String,
    },

    /// An object exists but could not be decoded.
    #[error("Object '{key}' is corrupt: {reason}")]
    Corrupt {
        /// Storage key
        key: String,
        /// Decoder message
        reason: String,
    },

    /// Underlying I/O failure.
    #[error("I/O failure on '{key}': {reason}")]
    Io {
        /// Storage key
        key: String,
        /// OS error message
        reason: String,
    },
}

impl PersistenceError {
    /// True when the key simply does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, PersistenceError::NotFound { .. })
    }
}
