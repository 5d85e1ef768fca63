//! Per-cell result series.
//!
//! All series are allocated for the full horizon up front and filled window by
//! window. Writes are append-only: a window starting before the first unwritten
//! step of a series is rejected with [`DaError::WindowOrder`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::config::RunSetup;
use super::errors::{DaError, DaResult, PersistenceError};
use super::filters::McmcSummary;
use super::noise::PosteriorNoise;
use super::types::{AssimilationWindow, CellIndex, DataTable, ObservationSeries, OutputTable};

/// Storage key of a cell's result bundle.
pub fn results_key(cell: CellIndex) -> String {
    format!("cell_{}.json", cell.tag())
}

/// Storage key of a cell's reconstruction bundle.
pub fn reconstruction_key(cell: CellIndex) -> String {
    format!("Reconstructed_cell_{}.json", cell.tag())
}

/// Column holding the posterior noise mean of a variable.
pub fn noise_mean_column(variable: &str) -> String {
    format!("{}_noise_mean", variable)
}

/// Column holding the posterior noise standard deviation of a variable.
pub fn noise_sd_column(variable: &str) -> String {
    format!("{}_noise_sd", variable)
}

/// Result series of the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Series {
    /// Prior ensemble mean and spread
    Prior,
    /// Posterior ensemble mean and spread
    Posterior,
    /// Unperturbed open-loop run
    OpenLoop,
    /// Posterior noise parameters and assimilated observations
    Parameters,
    /// Metropolis chain summary
    Mcmc,
}

impl Series {
    fn name(&self) -> &'static str {
        match self {
            Series::Prior => "prior",
            Series::Posterior => "posterior",
            Series::OpenLoop => "open_loop",
            Series::Parameters => "parameters",
            Series::Mcmc => "mcmc",
        }
    }
}

/// Mean and standard deviation tables of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentSeries {
    /// Per-step mean
    pub mean: OutputTable,
    /// Per-step standard deviation
    pub sd: OutputTable,
}

impl MomentSeries {
    fn missing(variables: &[String], steps: usize) -> Self {
        Self {
            mean: OutputTable::filled(variables.to_vec(), steps, f64::NAN),
            sd: OutputTable::filled(variables.to_vec(), steps, f64::NAN),
        }
    }

    fn compact(&mut self) {
        self.mean.compact();
        self.sd.compact();
    }
}

/// Result bundle written for one cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellResults {
    /// Cell the results belong to
    pub cell: CellIndex,
    /// Algorithm that produced them
    pub algorithm: String,
    /// Unperturbed run
    pub open_loop: OutputTable,
    /// Prior ensemble statistics
    pub prior: Option<MomentSeries>,
    /// Posterior ensemble statistics
    pub posterior: Option<MomentSeries>,
    /// Posterior noise parameters (transformed space) and observations
    pub parameters: Option<DataTable>,
    /// Metropolis chain statistics
    pub mcmc: Option<MomentSeries>,
}

impl CellResults {
    /// Round every series through single precision.
    pub fn compact(&mut self) {
        self.open_loop.compact();
        for series in [&mut self.prior, &mut self.posterior, &mut self.mcmc]
            .into_iter()
            .flatten()
        {
            series.compact();
        }
        if let Some(p) = &mut self.parameters {
            p.compact();
        }
    }

    /// Posterior noise series of every perturbed variable, as consumed by a
    /// reconstruction run.
    pub fn posterior_noise(&self, setup: &RunSetup) -> DaResult<Vec<PosteriorNoise>> {
        let parameters = self.parameters.as_ref().ok_or_else(|| {
            DaError::configuration(format!(
                "stored results of cell {} hold no noise parameters",
                self.cell.tag()
            ))
        })?;
        setup
            .variables()
            .iter()
            .map(|v| {
                let column = |name: String| {
                    parameters.column(&name).ok_or_else(|| {
                        DaError::configuration(format!("stored results have no '{}' series", name))
                    })
                };
                Ok(PosteriorNoise {
                    mean: column(noise_mean_column(&v.name))?,
                    sd: column(noise_sd_column(&v.name))?,
                })
            })
            .collect()
    }

    /// JSON encoding.
    pub fn to_bytes(&self) -> DaResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DaError::numerical(format!("cannot encode results: {}", e)))
    }

    /// Decode a bundle read from `key`.
    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self, PersistenceError> {
        serde_json::from_slice(bytes).map_err(|e| PersistenceError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Reconstruction bundle: the replayed prior ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionResults {
    /// Cell the results belong to
    pub cell: CellIndex,
    /// Ensemble statistics of the replayed posterior
    pub ensemble: MomentSeries,
}

impl ReconstructionResults {
    /// JSON encoding.
    pub fn to_bytes(&self) -> DaResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DaError::numerical(format!("cannot encode reconstruction: {}", e)))
    }
}

/// Pre-allocated, append-only result series of one cell.
#[derive(Debug, Clone)]
pub struct ResultAccumulator {
    cell: CellIndex,
    algorithm: String,
    horizon: usize,
    open_loop: OutputTable,
    prior: Option<MomentSeries>,
    posterior: Option<MomentSeries>,
    parameters: Option<DataTable>,
    mcmc: Option<MomentSeries>,
    cursors: BTreeMap<Series, usize>,
}

impl ResultAccumulator {
    /// Create a new accumulator.
    ///
    /// DA series are allocated only when `assimilating`; the MCMC pair only
    /// for algorithms with a Metropolis stage.
    pub fn new(
        setup: &RunSetup,
        cell: CellIndex,
        output_variables: &[String],
        horizon: usize,
        assimilating: bool,
    ) -> Self {
        let parameters = assimilating.then(|| {
            let mut columns: Vec<String> = Vec::new();
            for v in setup.variables() {
                columns.push(noise_mean_column(&v.name));
                columns.push(noise_sd_column(&v.name));
            }
            for name in &setup.config().assimilated_variables {
                columns.push(format!("{}_obs", name));
                columns.push(format!("{}_obs_sd", name));
            }
            DataTable::filled(columns, horizon, f64::NAN)
        });
        Self {
            cell,
            algorithm: setup.algorithm().name().to_string(),
            horizon,
            open_loop: OutputTable::filled(output_variables.to_vec(), horizon, f64::NAN),
            prior: assimilating.then(|| MomentSeries::missing(output_variables, horizon)),
            posterior: assimilating.then(|| MomentSeries::missing(output_variables, horizon)),
            parameters,
            mcmc: (assimilating && setup.algorithm().has_mcmc())
                .then(|| MomentSeries::missing(output_variables, horizon)),
            cursors: BTreeMap::new(),
        }
    }

    /// Number of steps of every series.
    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// First step of `series` not yet written.
    pub fn filled(&self, series: Series) -> usize {
        self.cursors.get(&series).copied().unwrap_or(0)
    }

    fn claim(&mut self, series: Series, window: &AssimilationWindow, steps: usize) -> DaResult<()> {
        let filled = self.filled(series);
        if window.start < filled {
            return Err(DaError::WindowOrder {
                series: series.name().to_string(),
                start: window.start,
                filled,
            });
        }
        if steps != window.len() || window.end > self.horizon {
            return Err(DaError::DimensionMismatch {
                expected: window.len(),
                actual: steps,
                context: format!("{} rows of window {}", series.name(), window.index),
            });
        }
        self.cursors.insert(series, window.end);
        Ok(())
    }

    fn not_allocated(series: Series) -> DaError {
        DaError::configuration(format!("{} series is not allocated in this run", series.name()))
    }

    fn store_moments(
        &mut self,
        series: Series,
        window: &AssimilationWindow,
        mean: &OutputTable,
        sd: &OutputTable,
    ) -> DaResult<()> {
        if mean.steps() != sd.steps() {
            return Err(DaError::DimensionMismatch {
                expected: mean.steps(),
                actual: sd.steps(),
                context: format!("{} spread rows", series.name()),
            });
        }
        let allocated = match series {
            Series::Prior => self.prior.is_some(),
            Series::Posterior => self.posterior.is_some(),
            Series::Mcmc => self.mcmc.is_some(),
            _ => false,
        };
        if !allocated {
            return Err(Self::not_allocated(series));
        }
        self.claim(series, window, mean.steps())?;
        let target = match series {
            Series::Prior => self.prior.as_mut(),
            Series::Posterior => self.posterior.as_mut(),
            _ => self.mcmc.as_mut(),
        }
        .ok_or_else(|| Self::not_allocated(series))?;
        target.mean.write_rows(window.start, mean)?;
        target.sd.write_rows(window.start, sd)
    }

    /// Store the prior ensemble mean and spread of one window.
    pub fn store_prior(
        &mut self,
        window: &AssimilationWindow,
        mean: &OutputTable,
        sd: &OutputTable,
    ) -> DaResult<()> {
        self.store_moments(Series::Prior, window, mean, sd)
    }

    /// Store the posterior ensemble mean and spread of one window.
    pub fn store_posterior(
        &mut self,
        window: &AssimilationWindow,
        mean: &OutputTable,
        sd: &OutputTable,
    ) -> DaResult<()> {
        self.store_moments(Series::Posterior, window, mean, sd)
    }

    /// Store the Metropolis chain summary of one window.
    pub fn store_mcmc(&mut self, window: &AssimilationWindow, summary: &McmcSummary) -> DaResult<()> {
        self.store_moments(Series::Mcmc, window, &summary.mean, &summary.sd)
    }

    /// Store the open-loop trajectory of one window.
    pub fn store_open_loop(&mut self, window: &AssimilationWindow, output: &OutputTable) -> DaResult<()> {
        self.claim(Series::OpenLoop, window, output.steps())?;
        self.open_loop.write_rows(window.start, output)
    }

    /// Store the posterior noise parameters of one window together with the
    /// assimilated observations and their errors.
    pub fn store_parameters(
        &mut self,
        window: &AssimilationWindow,
        mean: &DataTable,
        sd: &DataTable,
        observations: &ObservationSeries,
    ) -> DaResult<()> {
        if self.parameters.is_none() {
            return Err(Self::not_allocated(Series::Parameters));
        }
        self.claim(Series::Parameters, window, mean.steps())?;

        let mut columns = Vec::new();
        for name in mean.variables() {
            let (m, s) = match (mean.column(name), sd.column(name)) {
                (Some(m), Some(s)) => (m, s),
                _ => return Err(DaError::configuration(format!("no parameter series for '{}'", name))),
            };
            columns.push((noise_mean_column(name), m));
            columns.push((noise_sd_column(name), s));
        }
        for name in observations.variables() {
            if let (Some(v), Some(e)) = (
                observations.values().column(name),
                observations.errors().column(name),
            ) {
                columns.push((format!("{}_obs", name), v));
                columns.push((format!("{}_obs_sd", name), e));
            }
        }
        let block = DataTable::from_columns(columns)?;
        match self.parameters.as_mut() {
            Some(p) => p.write_rows(window.start, &block),
            None => Err(Self::not_allocated(Series::Parameters)),
        }
    }

    /// Close the accumulator into a result bundle.
    pub fn finish(self, compact: bool) -> CellResults {
        let mut results = CellResults {
            cell: self.cell,
            algorithm: self.algorithm,
            open_loop: self.open_loop,
            prior: self.prior,
            posterior: self.posterior,
            parameters: self.parameters,
            mcmc: self.mcmc,
        };
        if compact {
            results.compact();
        }
        results
    }
}
