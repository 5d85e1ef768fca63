//! Per-cell assimilation driver.
//!
//! [`CellAssimilation::run_cell`] takes one grid cell from observations and
//! forcing to a written result bundle:
//!
//! 1. Skip the cell when its output exists on a restart run, when it is
//!    masked, or when its forcing is not finite.
//! 2. Run the unperturbed model alone when there is nothing to assimilate or
//!    the algorithm is `deterministic_OL`.
//! 3. Otherwise plan the windows and, for each window in order: forecast the
//!    prior ensemble, store its statistics, apply the filter, store the
//!    posterior (and the chain summary for MCMC variants), then resample and
//!    rejuvenate for the next window.
//! 4. Write the results and the requested snapshots.
//!
//! Reconstruction runs replay a previous run's posterior noise over a single
//! window, write the ensemble statistics and stop before filtering.
//!
//! Windows are processed strictly in sequence; each depends on the posterior
//! of the previous one.

use std::fmt;

use super::accumulator::{
    reconstruction_key, results_key, CellResults, MomentSeries, ReconstructionResults,
    ResultAccumulator,
};
use super::config::{Algorithm, RunSetup};
use super::ensemble::{Ensemble, ForecastContext, SnapshotKind};
use super::errors::{DaError, DaResult};
use super::factory::build_filter;
use super::filters::{AssimilationFilter, WindowRun};
use super::noise::{NoiseGenerator, PosteriorNoise};
use super::reporter::{NoOpReporter, WindowReporter};
use super::restart::RestartManager;
use super::traits::{
    CoefficientSource, ModelAdapter, ObservationLookup, ObservationProvider, PersistenceProvider,
};
use super::types::{AssimilationWindow, CellIndex, ForcingTable, ObservationSeries};
use super::window::TimeWindowPlanner;
use crate::common::rng::{stream_key, DrawRng};

// ============================================================================
// Outcome
// ============================================================================

/// Why a cell produced no output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Output already exists on a restart run
    AlreadyComplete,
    /// Cell is outside the analysis mask
    Masked,
    /// Forcing or model input is unusable
    DataQuality(String),
    /// A filter or summary broke down numerically
    Numerical(String),
    /// Reconstruction found no previous results for the cell
    NoPreviousRun,
}

/// Result of running one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellOutcome {
    /// Data assimilation completed over the given number of windows
    Assimilated {
        /// Number of assimilation windows
        windows: usize,
    },
    /// Only the unperturbed model was run
    OpenLoop,
    /// A previous posterior was replayed
    Reconstructed,
    /// Nothing was written
    Skipped(SkipReason),
}

impl CellOutcome {
    /// True when the cell wrote an output bundle.
    pub fn wrote_output(&self) -> bool {
        !matches!(self, CellOutcome::Skipped(_))
    }
}

impl fmt::Display for CellOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellOutcome::Assimilated { windows } => write!(f, "assimilated over {} windows", windows),
            CellOutcome::OpenLoop => f.write_str("open loop only"),
            CellOutcome::Reconstructed => f.write_str("reconstructed"),
            CellOutcome::Skipped(SkipReason::AlreadyComplete) => f.write_str("skipped, already complete"),
            CellOutcome::Skipped(SkipReason::Masked) => f.write_str("skipped, masked"),
            CellOutcome::Skipped(SkipReason::DataQuality(d)) => write!(f, "skipped, {}", d),
            CellOutcome::Skipped(SkipReason::Numerical(d)) => {
                write!(f, "skipped, numerical failure: {}", d)
            }
            CellOutcome::Skipped(SkipReason::NoPreviousRun) => {
                f.write_str("skipped, no previous run to reconstruct")
            }
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Assimilation engine shared by every cell of a run.
///
/// Holds only read-only configuration and collaborators, so independent cells
/// may be driven from separate threads.
pub struct CellAssimilation<'a> {
    setup: &'a RunSetup,
    model: &'a dyn ModelAdapter,
    observations: &'a dyn ObservationProvider,
    store: &'a dyn PersistenceProvider,
    coefficients: Option<&'a dyn CoefficientSource>,
    filter: Box<dyn AssimilationFilter>,
}

impl<'a> CellAssimilation<'a> {
    /// Create a new engine. The filter is resolved here, once.
    pub fn new(
        setup: &'a RunSetup,
        model: &'a dyn ModelAdapter,
        observations: &'a dyn ObservationProvider,
        store: &'a dyn PersistenceProvider,
    ) -> Self {
        Self {
            setup,
            model,
            observations,
            store,
            coefficients: None,
            filter: build_filter(setup),
        }
    }

    /// Attach the coefficient source of spatial-propagation runs.
    pub fn with_coefficient_source(mut self, source: &'a dyn CoefficientSource) -> Self {
        self.coefficients = Some(source);
        self
    }

    /// Run configuration.
    pub fn setup(&self) -> &RunSetup {
        self.setup
    }

    /// Run one cell without reporting.
    pub fn run_cell(&self, cell: CellIndex) -> DaResult<CellOutcome> {
        self.run_cell_with(cell, &mut NoOpReporter)
    }

    /// Run one cell.
    ///
    /// Data-quality faults and numerical failures become a skipped cell;
    /// every other error is returned. Nothing is written for a skipped cell.
    pub fn run_cell_with<R: WindowReporter + ?Sized>(
        &self,
        cell: CellIndex,
        reporter: &mut R,
    ) -> DaResult<CellOutcome> {
        let outcome = match self.assimilate(cell, reporter) {
            Ok(outcome) => outcome,
            Err(DaError::DataQuality { description }) => {
                log::warn!("Cell {}: {}; skipped", cell.tag(), description);
                CellOutcome::Skipped(SkipReason::DataQuality(description))
            }
            Err(DaError::NumericalInstability { description }) => {
                log::warn!("Cell {}: {}; skipped", cell.tag(), description);
                CellOutcome::Skipped(SkipReason::Numerical(description))
            }
            Err(e) => return Err(e),
        };
        reporter.on_cell_complete(cell, &outcome);
        Ok(outcome)
    }

    /// Run several cells in order, stopping at the first fatal error. Skipped
    /// cells never stop their siblings.
    pub fn run_cells<R: WindowReporter + ?Sized>(
        &self,
        cells: &[CellIndex],
        reporter: &mut R,
    ) -> DaResult<Vec<(CellIndex, CellOutcome)>> {
        cells
            .iter()
            .map(|&cell| Ok((cell, self.run_cell_with(cell, reporter)?)))
            .collect()
    }

    fn assimilate<R: WindowReporter + ?Sized>(
        &self,
        cell: CellIndex,
        reporter: &mut R,
    ) -> DaResult<CellOutcome> {
        let setup = self.setup;
        let config = setup.config();
        let reconstruct = config.load_prev_run;
        let key = if reconstruct {
            reconstruction_key(cell)
        } else {
            results_key(cell)
        };

        if config.restart_run && self.store.exists(&key) {
            log::info!("Cell {}: '{}' exists, skipping", cell.tag(), key);
            return Ok(CellOutcome::Skipped(SkipReason::AlreadyComplete));
        }

        let dates = self.observations.observation_dates();
        let observations = match self.observations.observations(&dates, cell)? {
            ObservationLookup::Masked => {
                log::info!("Cell {}: masked, skipping", cell.tag());
                return Ok(CellOutcome::Skipped(SkipReason::Masked));
            }
            ObservationLookup::Available(series) => series,
        };

        let forcing = self.model.forcing_table(cell)?;
        if let Some((step, variable)) = forcing.first_non_finite() {
            return Err(DaError::data_quality(format!(
                "forcing '{}' is not finite at step {}",
                variable, step
            )));
        }
        let horizon = forcing.steps();
        if horizon == 0 {
            return Err(DaError::data_quality("forcing covers no time steps"));
        }
        if observations.steps() != horizon {
            return Err(DaError::configuration(format!(
                "observations cover {} steps but forcing covers {}",
                observations.steps(),
                horizon
            )));
        }

        if !reconstruct
            && (observations.is_all_missing()
                || setup.algorithm() == Algorithm::DeterministicOpenLoop)
        {
            return self.open_loop(cell, &forcing, &key);
        }

        let posterior = if reconstruct {
            match self.previous_posterior(cell)? {
                Some(p) => Some(p),
                None => return Ok(CellOutcome::Skipped(SkipReason::NoPreviousRun)),
            }
        } else {
            None
        };
        let ctx = ForecastContext {
            setup,
            model: self.model,
            coefficients: self.coefficients,
        };
        let mut base = DrawRng::new(config.seed);
        let root = NoiseGenerator::new(
            setup,
            base.fork(stream_key(&[cell.lat as u64, cell.lon as u64])),
        );

        if let Some(posterior) = posterior {
            return self.reconstruct(&ctx, &root, cell, &forcing, &posterior, &key);
        }

        let windows = TimeWindowPlanner::new(setup).plan(&observations.observed_mask(), horizon)?;

        let restart = RestartManager::new(self.store);
        let mut ensemble = if config.real_time_restart {
            restart.load_or_else(cell, SnapshotKind::Reduced, setup, || {
                Ensemble::fresh(&ctx, cell)
            })?
        } else {
            Ensemble::fresh(&ctx, cell)
        };

        let outputs = self.model.output_variables();
        let mut acc = ResultAccumulator::new(setup, cell, &outputs, horizon, true);
        for window in &windows {
            self.assimilate_window(
                &ctx,
                &root,
                &mut ensemble,
                &mut acc,
                &forcing,
                &observations,
                window,
                reporter,
            )?;
        }

        let results = acc.finish(config.compact_output);
        self.store.write(&key, &results.to_bytes()?)?;
        if config.save_ensemble {
            restart.save(&ensemble, SnapshotKind::Full)?;
        }
        if config.real_time_restart {
            restart.save(&ensemble, SnapshotKind::Reduced)?;
        }
        Ok(CellOutcome::Assimilated {
            windows: windows.len(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn assimilate_window<R: WindowReporter + ?Sized>(
        &self,
        ctx: &ForecastContext<'a>,
        root: &NoiseGenerator<'a>,
        ensemble: &mut Ensemble,
        acc: &mut ResultAccumulator,
        forcing: &ForcingTable,
        observations: &ObservationSeries,
        window: &AssimilationWindow,
        reporter: &mut R,
    ) -> DaResult<()> {
        let setup = self.setup;
        let algorithm = setup.algorithm();
        let window_obs = observations.window(window);

        let mut noise = root.clone();
        ensemble.create(ctx, &mut noise, &forcing.window(window), *window, None)?;
        reporter.on_prior(window, ensemble);
        let (prior_mean, prior_sd) = ensemble.summary()?;
        acc.store_prior(window, &prior_mean, &prior_sd)?;

        let update = {
            let mut run = WindowRun::new(ensemble, ctx, &noise);
            self.filter.update(&mut run, &window_obs)?
        };
        reporter.on_filter_update(window, &update);
        if let Some(weights) = &update.weights {
            ensemble.set_weights(weights.clone())?;
        }

        let (noise_mean, noise_sd) = ensemble.parameter_summary(setup)?;
        acc.store_parameters(window, &noise_mean, &noise_sd, &window_obs)?;
        let (post_mean, post_sd) = ensemble.summary()?;
        acc.store_posterior(window, &post_mean, &post_sd)?;
        if let Some(summary) = &update.mcmc {
            acc.store_mcmc(window, summary)?;
        }
        if let Some(open_loop) = ensemble.open_loop_output() {
            acc.store_open_loop(window, open_loop)?;
        }

        if setup.config().redraw_prior || algorithm.rejuvenates() {
            ensemble.update_posterior_shape(setup)?;
        }
        if let Some(indices) = &update.resample_indices {
            ensemble.resample(indices)?;
            reporter.on_resample(window, indices);
        }
        if algorithm.rejuvenates() {
            let mut draws = root.clone();
            ensemble.season_rejuvenation(setup, &mut draws)?;
            if let Some(shape) = ensemble.posterior_shape() {
                reporter.on_rejuvenation(window, shape);
            }
        }
        Ok(())
    }

    fn open_loop(&self, cell: CellIndex, forcing: &ForcingTable, key: &str) -> DaResult<CellOutcome> {
        let horizon = forcing.steps();
        let mut state = self.model.initial_state(cell);
        let output = self.model.advance(&mut state, forcing)?;

        let outputs = self.model.output_variables();
        let mut acc = ResultAccumulator::new(self.setup, cell, &outputs, horizon, false);
        acc.store_open_loop(&AssimilationWindow::new(0, 0, horizon), &output)?;
        let results = acc.finish(self.setup.config().compact_output);
        self.store.write(key, &results.to_bytes()?)?;
        log::info!("Cell {}: open loop only", cell.tag());
        Ok(CellOutcome::OpenLoop)
    }

    fn previous_posterior(&self, cell: CellIndex) -> DaResult<Option<Vec<PosteriorNoise>>> {
        let key = results_key(cell);
        let bytes = match self.store.read(&key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                log::warn!("Cell {}: no previous results to reconstruct", cell.tag());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let previous = CellResults::from_bytes(&key, &bytes)?;
        if previous.parameters.is_none() {
            log::warn!("Cell {}: previous run was open loop only", cell.tag());
            return Ok(None);
        }
        previous.posterior_noise(self.setup).map(Some)
    }

    fn reconstruct(
        &self,
        ctx: &ForecastContext<'a>,
        root: &NoiseGenerator<'a>,
        cell: CellIndex,
        forcing: &ForcingTable,
        posterior: &[PosteriorNoise],
        key: &str,
    ) -> DaResult<CellOutcome> {
        let window = AssimilationWindow::new(0, 0, forcing.steps());
        let mut ensemble = Ensemble::fresh(ctx, cell);
        let mut noise = root.clone();
        ensemble.create(ctx, &mut noise, &forcing.window(&window), window, Some(posterior))?;
        let (mean, sd) = ensemble.summary()?;
        let mut series = MomentSeries { mean, sd };
        if self.setup.config().compact_output {
            series.mean.compact();
            series.sd.compact();
        }
        let results = ReconstructionResults {
            cell,
            ensemble: series,
        };
        self.store.write(key, &results.to_bytes()?)?;
        log::info!("Cell {}: reconstructed from previous posterior", cell.tag());
        Ok(CellOutcome::Reconstructed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assim::config::RunConfig;
    use crate::assim::reporter::DebugReporter;
    use crate::assim::types::{DataTable, ModelState, OutputTable};
    use crate::models::DegreeDayModel;
    use crate::storage::MemoryStore;

    struct Fixed(ObservationSeries);

    impl ObservationProvider for Fixed {
        fn observation_dates(&self) -> Vec<usize> {
            Vec::new()
        }

        fn observations(&self, _: &[usize], _: CellIndex) -> DaResult<ObservationLookup> {
            Ok(ObservationLookup::Available(self.0.clone()))
        }
    }

    /// Degree-day model whose SWE turns NaN when the air is implausibly warm.
    struct Unstable(DegreeDayModel);

    impl ModelAdapter for Unstable {
        fn name(&self) -> &'static str {
            "unstable"
        }

        fn forcing_table(&self, cell: CellIndex) -> DaResult<ForcingTable> {
            self.0.forcing_table(cell)
        }

        fn output_variables(&self) -> Vec<String> {
            self.0.output_variables()
        }

        fn initial_state(&self, cell: CellIndex) -> ModelState {
            self.0.initial_state(cell)
        }

        fn advance(&self, state: &mut ModelState, forcing: &ForcingTable) -> DaResult<OutputTable> {
            let mut output = self.0.advance(state, forcing)?;
            let hot = forcing.column("Tair").map_or(false, |t| t.iter().any(|&v| v > 300.0));
            if let (true, Some(j)) = (hot, output.column_index("SWE")) {
                output.values_mut().column_mut(j).fill(f64::NAN);
            }
            Ok(output)
        }
    }

    fn forcing(steps: usize) -> ForcingTable {
        ForcingTable::from_columns(vec![
            ("Tair".into(), vec![266.0; steps]),
            ("Prec".into(), vec![4.0; steps]),
        ])
        .unwrap()
    }

    fn observations(values: Vec<f64>) -> ObservationSeries {
        let errors = values.iter().map(|v| if v.is_nan() { f64::NAN } else { 2.0 }).collect();
        ObservationSeries::new(
            DataTable::from_columns(vec![("SWE".into(), values)]).unwrap(),
            DataTable::from_columns(vec![("SWE".into(), errors)]).unwrap(),
        )
        .unwrap()
    }

    fn setup(algorithm: &str) -> RunSetup {
        let mut cfg = RunConfig {
            algorithm: algorithm.into(),
            ensemble_members: 8,
            seed: Some(7),
            vars_to_perturbate: vec!["Prec".into()],
            perturbation_strategy: vec!["lognormal".into()],
            assimilated_variables: vec!["SWE".into()],
            ..RunConfig::default()
        };
        cfg.mean_errors.insert("Prec".into(), 0.0);
        cfg.sd_errors.insert("Prec".into(), 0.3);
        RunSetup::new(cfg).unwrap()
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            CellOutcome::Assimilated { windows: 3 }.to_string(),
            "assimilated over 3 windows"
        );
        assert_eq!(
            CellOutcome::Skipped(SkipReason::Masked).to_string(),
            "skipped, masked"
        );
        assert!(CellOutcome::Reconstructed.wrote_output());
        assert!(!CellOutcome::Skipped(SkipReason::AlreadyComplete).wrote_output());
    }

    #[test]
    fn test_run_cell_writes_results() {
        let setup = setup("PBS");
        let model = DegreeDayModel::default().with_fallback_forcing(forcing(6));
        let obs = Fixed(observations(vec![f64::NAN, 5.0, f64::NAN, 14.0, f64::NAN, 26.0]));
        let store = MemoryStore::new();
        let engine = CellAssimilation::new(&setup, &model, &obs, &store);

        let cell = CellIndex::new(2, 3);
        assert_eq!(engine.run_cell(cell).unwrap(), CellOutcome::Assimilated { windows: 1 });
        let key = results_key(cell);
        let results = CellResults::from_bytes(&key, &store.read(&key).unwrap()).unwrap();
        assert_eq!(results.cell, cell);
        assert_eq!(results.posterior.unwrap().mean.steps(), 6);
    }

    #[test]
    fn test_data_quality_becomes_skip() {
        let setup = setup("ES");
        let mut bad = forcing(4);
        bad.values_mut()[(2, 1)] = f64::INFINITY;
        let model = DegreeDayModel::default().with_fallback_forcing(bad);
        let obs = Fixed(observations(vec![1.0, 2.0, 3.0, 4.0]));
        let store = MemoryStore::new();
        let engine = CellAssimilation::new(&setup, &model, &obs, &store);

        let outcome = engine.run_cell(CellIndex::new(0, 0)).unwrap();
        assert!(matches!(outcome, CellOutcome::Skipped(SkipReason::DataQuality(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_numerical_failure_skips_only_its_cell() {
        let setup = setup("ES");
        let mut hot = forcing(6);
        hot.set_column("Tair", &[310.0; 6]).unwrap();
        let (bad, good) = (CellIndex::new(0, 0), CellIndex::new(0, 1));
        let model = Unstable(
            DegreeDayModel::default()
                .with_forcing(bad, hot)
                .with_forcing(good, forcing(6)),
        );
        let obs = Fixed(observations(vec![f64::NAN, 5.0, f64::NAN, 14.0, f64::NAN, 26.0]));
        let store = MemoryStore::new();
        let engine = CellAssimilation::new(&setup, &model, &obs, &store);

        let outcomes = engine.run_cells(&[bad, good], &mut NoOpReporter).unwrap();
        assert!(matches!(
            outcomes[0].1,
            CellOutcome::Skipped(SkipReason::Numerical(_))
        ));
        assert_eq!(outcomes[1].1, CellOutcome::Assimilated { windows: 1 });
        assert!(!store.exists(&results_key(bad)));
        assert!(store.exists(&results_key(good)));
    }

    #[test]
    fn test_resampling_algorithms() {
        let obs = Fixed(observations(vec![f64::NAN, 5.0, f64::NAN, 14.0, f64::NAN, 26.0]));
        for (algorithm, resamples) in [
            ("PF", true),
            ("PBS", true),
            ("ProPBS", true),
            ("AdaPBS", true),
            ("ES", false),
            ("IES", false),
            ("PIES", false),
            ("IES-MCMC", false),
            ("IES-MCMC_AI", false),
        ] {
            let setup = setup(algorithm);
            let model = DegreeDayModel::default().with_fallback_forcing(forcing(6));
            let store = MemoryStore::new();
            let engine = CellAssimilation::new(&setup, &model, &obs, &store);
            let mut reporter = DebugReporter::new();
            let outcome = engine.run_cell_with(CellIndex::new(1, 1), &mut reporter).unwrap();
            assert!(matches!(outcome, CellOutcome::Assimilated { .. }), "{}", algorithm);
            assert_eq!(
                !reporter.resample_events().is_empty(),
                resamples,
                "{} resampling",
                algorithm
            );
        }
    }
}
