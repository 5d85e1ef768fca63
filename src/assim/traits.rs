//! Collaborator seams of the assimilation core.
//!
//! The core never integrates physics, reads observation files or touches disk
//! directly. It talks to these traits instead:
//! - [`ModelAdapter`] - forcing tables and forward model runs
//! - [`ObservationProvider`] - per-cell observation series
//! - [`PersistenceProvider`] - byte storage for results and checkpoints
//! - [`CoefficientSource`] - externally supplied perturbation coefficients

use super::errors::{DaResult, PersistenceError};
use super::types::{CellIndex, ForcingTable, ModelState, ObservationSeries, OutputTable};

/// Narrow interface to a physical snow model.
///
/// Implementations must be pure with respect to their inputs: advancing the
/// same state over the same forcing yields the same output. This is what makes
/// member runs independent and safe to execute in parallel.
pub trait ModelAdapter: Send + Sync {
    /// Model name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Full-horizon forcing for a cell.
    fn forcing_table(&self, cell: CellIndex) -> DaResult<ForcingTable>;

    /// Names of the output columns produced by [`advance`](Self::advance).
    fn output_variables(&self) -> Vec<String>;

    /// State at the start of the simulation.
    fn initial_state(&self, cell: CellIndex) -> ModelState;

    /// Integrate `state` across every row of `forcing`, returning one output
    /// row per step. `state` holds the end-of-window state afterwards.
    ///
    /// Non-finite inputs must be reported as [`DaError::DataQuality`](super::DaError::DataQuality).
    fn advance(&self, state: &mut ModelState, forcing: &ForcingTable) -> DaResult<OutputTable>;
}

/// Result of looking up a cell's observations.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationLookup {
    /// The cell is outside the analysis mask.
    Masked,
    /// Observations on the run's time axis (possibly all missing).
    Available(ObservationSeries),
}

/// Source of observations.
pub trait ObservationProvider: Send + Sync {
    /// Time-step indices at which observations exist anywhere in the domain.
    fn observation_dates(&self) -> Vec<usize>;

    /// Observation values and errors for one cell.
    fn observations(&self, dates: &[usize], cell: CellIndex) -> DaResult<ObservationLookup>;
}

/// Byte-level storage for results and checkpoints.
pub trait PersistenceProvider: Send + Sync {
    /// True when an object is stored under `key`.
    fn exists(&self, key: &str) -> bool;

    /// Read an object. Missing keys yield [`PersistenceError::NotFound`].
    fn read(&self, key: &str) -> Result<Vec<u8>, PersistenceError>;

    /// Store an object, replacing any previous one.
    fn write(&self, key: &str, bytes: &[u8]) -> Result<(), PersistenceError>;
}

/// Externally supplied perturbation coefficients (spatial propagation runs).
pub trait CoefficientSource: Send + Sync {
    /// Physical-space coefficient of `variable` for one member of one cell.
    fn coefficient(&self, cell: CellIndex, variable: &str, member: usize) -> DaResult<f64>;
}
