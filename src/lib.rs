/*!
# snowda - Ensemble data assimilation for snow models

Per-cell ensemble data assimilation: perturb the meteorological forcing of a
snow model, run an ensemble across assimilation windows and combine it with
observations through particle filters or ensemble smoothers.

## Features

- Particle filter and particle batch smoothers (PF, PBS, ProPBS, AdaPBS)
- Ensemble smoothers (ES, IES, PIES) and smoother-initialised MCMC
  (IES-MCMC, IES-MCMC_AI)
- Seeded, replayable perturbation draws
- Restart checkpoints and reconstruction from a previous run's posterior

## Modules

- [`assim`] - The assimilation engine, filters and result handling
- [`models`] - Built-in degree-day snow model
- [`storage`] - Filesystem and in-memory persistence
- [`common`] - Low-level utilities: RNG, transforms, statistics

## Example

```rust,no_run
use snowda::{CellAssimilation, CellIndex, DegreeDayModel, LoggingReporter, MemoryStore, RunConfig, RunSetup};
# use snowda::{DaResult, ObservationLookup, ObservationProvider};
# struct Snotel;
# impl ObservationProvider for Snotel {
#     fn observation_dates(&self) -> Vec<usize> { vec![] }
#     fn observations(&self, _: &[usize], _: CellIndex) -> DaResult<ObservationLookup> {
#         Ok(ObservationLookup::Masked)
#     }
# }

let mut config = RunConfig {
    algorithm: "PBS".into(),
    ensemble_members: 50,
    seed: Some(42),
    vars_to_perturbate: vec!["Prec".into()],
    perturbation_strategy: vec!["lognormal".into()],
    assimilated_variables: vec!["SWE".into()],
    ..RunConfig::default()
};
config.mean_errors.insert("Prec".into(), 0.0);
config.sd_errors.insert("Prec".into(), 0.5);
let setup = RunSetup::new(config).unwrap();

let model = DegreeDayModel::default();
let store = MemoryStore::new();
let engine = CellAssimilation::new(&setup, &model, &Snotel, &store);
let outcome = engine
    .run_cell_with(CellIndex::new(0, 0), &mut LoggingReporter::new())
    .unwrap();
println!("{}", outcome);
```
*/

// ============================================================================
// Core modules
// ============================================================================

/// Assimilation engine: configuration, ensemble, filters, results, restarts
pub mod assim;

/// Built-in snow model and precipitation phase helpers
pub mod models;

/// Persistence providers
pub mod storage;

/// Low-level utilities (RNG, transforms, statistics)
pub mod common;

/// Numerical constants
pub mod utils;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// Configuration
pub use assim::{Algorithm, PerturbationStrategy, PerturbedVariable, RunConfig, RunSetup};

// Errors
pub use assim::{DaError, DaResult, PersistenceError};

// Core types
pub use assim::{
    AssimilationWindow, CellIndex, DataTable, ForcingTable, ModelState, ObservationSeries,
    OutputTable,
};

// Collaborator traits
pub use assim::{
    CoefficientSource, ModelAdapter, ObservationLookup, ObservationProvider, PersistenceProvider,
};

// Engine
pub use assim::{CellAssimilation, CellOutcome, SkipReason};

// Components
pub use assim::{
    AssimilationFilter, CellResults, Ensemble, FilterUpdate, NoiseGenerator, RestartManager,
    ResultAccumulator, TimeWindowPlanner,
};

// Reporters
pub use assim::{DebugReporter, LoggingReporter, NoOpReporter, WindowReporter};

// Built-in collaborators
pub use models::{DegreeDayModel, DegreeDayParams};
pub use storage::{FsStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
