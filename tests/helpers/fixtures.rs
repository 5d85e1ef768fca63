//! Synthetic snow season and counting collaborators.
//!
//! The season is 30 daily steps: 20 cold days with snowfall followed by 10
//! melt days. Observations come from the built-in model driven by 1.3 times
//! the nominal precipitation, so the open loop underestimates SWE.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use snowda::{
    CellIndex, DaResult, DataTable, DegreeDayModel, ForcingTable, ModelAdapter, ModelState,
    ObservationLookup, ObservationProvider, ObservationSeries, OutputTable, RunConfig, RunSetup,
};

/// Number of steps of the synthetic season.
pub const HORIZON: usize = 30;

/// Precipitation multiplier of the synthetic truth.
pub const TRUE_PREC_FACTOR: f64 = 1.3;

/// Observation error standard deviation (kg m-2).
pub const OBS_ERROR: f64 = 3.0;

/// Nominal forcing of the season.
pub fn season_forcing() -> ForcingTable {
    let tair = (0..HORIZON)
        .map(|t| {
            if t < 20 {
                266.0 + 2.0 * ((t as f64) * 0.7).sin()
            } else {
                276.0 + 0.2 * (t - 20) as f64
            }
        })
        .collect();
    let prec = (0..HORIZON)
        .map(|t| match t {
            t if t >= 20 => 0.0,
            t if t % 2 == 0 => 5.0,
            _ => 0.5,
        })
        .collect();
    ForcingTable::from_columns(vec![("Tair".into(), tair), ("Prec".into(), prec)]).unwrap()
}

/// SWE of the synthetic truth at every step.
pub fn true_swe() -> Vec<f64> {
    let mut forcing = season_forcing();
    let prec: Vec<f64> = forcing
        .column("Prec")
        .unwrap()
        .iter()
        .map(|p| p * TRUE_PREC_FACTOR)
        .collect();
    forcing.set_column("Prec", &prec).unwrap();

    let model = DegreeDayModel::default();
    let mut state = model.initial_state(CellIndex::new(0, 0));
    model.advance(&mut state, &forcing).unwrap().column("SWE").unwrap()
}

/// SWE observations at the given steps, missing elsewhere.
pub fn observations_at(steps: &[usize]) -> ObservationSeries {
    let truth = true_swe();
    let values = (0..HORIZON)
        .map(|t| if steps.contains(&t) { truth[t] } else { f64::NAN })
        .collect();
    let errors = (0..HORIZON)
        .map(|t| if steps.contains(&t) { OBS_ERROR } else { f64::NAN })
        .collect();
    ObservationSeries::new(
        DataTable::from_columns(vec![("SWE".into(), values)]).unwrap(),
        DataTable::from_columns(vec![("SWE".into(), errors)]).unwrap(),
    )
    .unwrap()
}

/// Observations every third step of the accumulation and melt seasons.
pub fn season_observations() -> ObservationSeries {
    observations_at(&[2, 5, 8, 11, 14, 17, 20, 23, 26])
}

/// Run configuration perturbing precipitation (lognormal) and air temperature
/// (normal), assimilating SWE.
pub fn config(algorithm: &str, members: usize) -> RunConfig {
    let mut cfg = RunConfig {
        algorithm: algorithm.into(),
        ensemble_members: members,
        seed: Some(42),
        vars_to_perturbate: vec!["Prec".into(), "Tair".into()],
        perturbation_strategy: vec!["lognormal".into(), "normal".into()],
        assimilated_variables: vec!["SWE".into()],
        mcmc_samples: 60,
        ..RunConfig::default()
    };
    cfg.mean_errors.insert("Prec".into(), 0.0);
    cfg.mean_errors.insert("Tair".into(), 0.0);
    cfg.sd_errors.insert("Prec".into(), 0.4);
    cfg.sd_errors.insert("Tair".into(), 0.5);
    cfg
}

/// Validated [`config`].
pub fn setup(algorithm: &str, members: usize) -> RunSetup {
    RunSetup::new(config(algorithm, members)).unwrap()
}

/// Root mean squared difference over the finite observation steps.
pub fn rmse_to_observations(simulated: &[f64], observations: &ObservationSeries) -> f64 {
    let observed = observations.values().column("SWE").unwrap();
    let diffs: Vec<f64> = simulated
        .iter()
        .zip(&observed)
        .filter(|(_, o)| o.is_finite())
        .map(|(s, o)| (s - o).powi(2))
        .collect();
    (diffs.iter().sum::<f64>() / diffs.len() as f64).sqrt()
}

// ============================================================================
// Collaborators
// ============================================================================

/// Observation provider with a fixed series, a mask and a call counter.
pub struct StaticObservations {
    series: ObservationSeries,
    masked: HashSet<CellIndex>,
    calls: AtomicUsize,
}

impl StaticObservations {
    pub fn new(series: ObservationSeries) -> Self {
        Self {
            series,
            masked: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_masked(mut self, cell: CellIndex) -> Self {
        self.masked.insert(cell);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ObservationProvider for StaticObservations {
    fn observation_dates(&self) -> Vec<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.series
            .observed_mask()
            .iter()
            .enumerate()
            .filter_map(|(t, &o)| o.then_some(t))
            .collect()
    }

    fn observations(&self, _dates: &[usize], cell: CellIndex) -> DaResult<ObservationLookup> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.masked.contains(&cell) {
            return Ok(ObservationLookup::Masked);
        }
        Ok(ObservationLookup::Available(self.series.clone()))
    }
}

/// Degree-day model that counts every call.
pub struct CountingModel {
    inner: DegreeDayModel,
    calls: AtomicUsize,
}

impl CountingModel {
    pub fn new(inner: DegreeDayModel) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    /// Model whose every cell uses the season forcing.
    pub fn season() -> Self {
        Self::new(DegreeDayModel::default().with_fallback_forcing(season_forcing()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ModelAdapter for CountingModel {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn forcing_table(&self, cell: CellIndex) -> DaResult<ForcingTable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.forcing_table(cell)
    }

    fn output_variables(&self) -> Vec<String> {
        self.inner.output_variables()
    }

    fn initial_state(&self, cell: CellIndex) -> ModelState {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.initial_state(cell)
    }

    fn advance(&self, state: &mut ModelState, forcing: &ForcingTable) -> DaResult<OutputTable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.advance(state, forcing)
    }
}
