/*!
Per-cell ensemble data assimilation.

One grid cell is processed independently of all others:

- [`NoiseGenerator`] draws perturbation coefficients for the forcing
- [`TimeWindowPlanner`] splits the horizon into assimilation windows
- [`Ensemble`] forecasts every member across a window
- an [`AssimilationFilter`] combines the forecast with observations
- [`ResultAccumulator`] collects open-loop, prior, posterior and parameter series
- [`RestartManager`] saves and restores ensemble checkpoints

[`CellAssimilation`] drives these steps for a cell. The snow model, the
observation source and the storage backend are reached through the traits in
[`traits`].
*/

pub mod accumulator;
pub mod config;
pub mod engine;
pub mod ensemble;
pub mod errors;
pub mod factory;
pub mod filters;
pub mod noise;
pub mod reporter;
pub mod restart;
pub mod traits;
pub mod types;
pub mod window;

// ============================================================================
// Re-exports
// ============================================================================

pub use accumulator::{
    reconstruction_key, results_key, CellResults, MomentSeries, ReconstructionResults,
    ResultAccumulator, Series,
};
pub use config::{Algorithm, PerturbationStrategy, PerturbedVariable, RunConfig, RunSetup};
pub use engine::{CellAssimilation, CellOutcome, SkipReason};
pub use ensemble::{Ensemble, EnsembleSnapshot, ForecastContext, Member, SnapshotKind};
pub use errors::{DaError, DaResult, PersistenceError};
pub use factory::build_filter;
pub use filters::{
    AdaptiveParticleBatchSmoother, AssimilationFilter, EnsembleSmoother, FilterUpdate,
    McmcSummary, OpenLoopFilter, ParticleBatchSmoother, ParticleFilter, Predictions,
    ProposalParticleBatchSmoother, SmootherMcmc, WindowRun,
};
pub use noise::{NoiseGenerator, NoiseSegment, NoiseSource, PosteriorNoise, PosteriorShape};
pub use reporter::{DebugReporter, LoggingReporter, NoOpReporter, UpdateEvent, WindowReporter};
pub use restart::{ensemble_key, restart_key, RestartManager};
pub use traits::{
    CoefficientSource, ModelAdapter, ObservationLookup, ObservationProvider, PersistenceProvider,
};
pub use types::{
    AssimilationWindow, CellIndex, DataTable, ForcingTable, ModelState, ObservationSeries,
    OutputTable,
};
pub use window::TimeWindowPlanner;
