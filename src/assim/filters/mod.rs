//! Assimilation filters.
//!
//! Every algorithm implements [`AssimilationFilter`]. A filter sees the
//! ensemble through a [`WindowRun`], which exposes the members' simulated
//! observations and transformed-space parameters and lets iterative methods
//! re-run the window with new parameters.
//!
//! All filters share the Gaussian observation likelihood over the non-missing
//! entries of the window. A window without any valid observation yields
//! [`FilterUpdate::pass_through`]: weights, members and parameters stay as they
//! are.
//!
//! | Algorithm | Type |
//! |-----------|------|
//! | PF | [`ParticleFilter`] |
//! | PBS | [`ParticleBatchSmoother`] |
//! | ProPBS | [`ProposalParticleBatchSmoother`] |
//! | AdaPBS | [`AdaptiveParticleBatchSmoother`] |
//! | ES, IES, PIES | [`EnsembleSmoother`] |
//! | IES-MCMC, IES-MCMC_AI | [`SmootherMcmc`] |
//! | deterministic_OL | [`OpenLoopFilter`] |

mod mcmc;
mod particle;
mod smoother;

pub use mcmc::{LinearEmulator, SmootherMcmc};
pub use particle::{
    AdaptiveParticleBatchSmoother, ParticleBatchSmoother, ParticleFilter,
    ProposalParticleBatchSmoother,
};
pub use smoother::{ensemble_smoother_step, EnsembleSmoother};

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use super::config::{Algorithm, RunSetup};
use super::ensemble::{Ensemble, ForecastContext};
use super::errors::{DaError, DaResult};
use super::noise::NoiseGenerator;
use super::types::{ObservationSeries, OutputTable};
use crate::common::rng::DrawRng;

/// Stream tag of filter-internal randomness.
const FILTER_STREAM: u64 = 0x4649_4c54;

// ============================================================================
// Filter update
// ============================================================================

/// Chain summary produced by the Metropolis refinement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct McmcSummary {
    /// Per-step mean of the simulated output over the retained chain
    pub mean: OutputTable,
    /// Per-step standard deviation over the retained chain
    pub sd: OutputTable,
    /// Fraction of accepted proposals
    pub acceptance_rate: f64,
    /// Number of full model runs performed by the chain
    pub model_runs: usize,
}

/// Outcome of one filter update.
///
/// Parameter updates have already been applied to the ensemble (and the window
/// re-run) when the filter returns; weights and resampling indices are applied
/// by the caller.
#[derive(Debug, Clone, Default)]
pub struct FilterUpdate {
    /// New normalized importance weights
    pub weights: Option<DVector<f64>>,
    /// Source member of every slot after resampling
    pub resample_indices: Option<Vec<usize>>,
    /// Updated transformed-space parameters (`members x variables`)
    pub noise_update: Option<DMatrix<f64>>,
    /// Effective sample size of the returned weights
    pub effective_size: Option<f64>,
    /// Metropolis chain summary
    pub mcmc: Option<McmcSummary>,
    /// Internal iterations or tempering stages
    pub iterations: usize,
}

impl FilterUpdate {
    /// Update that leaves the ensemble untouched.
    pub fn pass_through() -> Self {
        Self::default()
    }

    /// True when nothing was changed.
    pub fn is_pass_through(&self) -> bool {
        self.weights.is_none()
            && self.resample_indices.is_none()
            && self.noise_update.is_none()
            && self.mcmc.is_none()
    }
}

/// Algorithm-specific posterior update.
pub trait AssimilationFilter: Send + Sync {
    /// Algorithm implemented by this filter.
    fn algorithm(&self) -> Algorithm;

    /// Assimilate one window of observations.
    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate>;
}

/// Filter of the deterministic open-loop mode: never changes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenLoopFilter;

impl AssimilationFilter for OpenLoopFilter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::DeterministicOpenLoop
    }

    fn update(
        &self,
        _run: &mut WindowRun<'_, '_>,
        _observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        Ok(FilterUpdate::pass_through())
    }
}

// ============================================================================
// Predictions
// ============================================================================

/// Valid observations of a window paired with every member's simulation.
#[derive(Debug, Clone)]
pub struct Predictions {
    /// `(step, output column)` of every valid observation entry
    pub entries: Vec<(usize, usize)>,
    /// Observed values
    pub observed: DVector<f64>,
    /// Observation error standard deviations
    pub errors: DVector<f64>,
    /// Simulated values, `members x entries`
    pub simulated: DMatrix<f64>,
}

impl Predictions {
    /// Number of valid observation entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the window holds no valid observation.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Simulated observation vector of one output trajectory.
    pub fn predict(&self, output: &OutputTable) -> DVector<f64> {
        DVector::from_iterator(
            self.entries.len(),
            self.entries.iter().map(|&(t, c)| output.values()[(t, c)]),
        )
    }

    /// Gaussian log-likelihood of a simulated observation vector.
    ///
    /// Non-finite simulations have zero likelihood.
    pub fn log_likelihood<'v>(&self, simulated: impl IntoIterator<Item = &'v f64>) -> f64 {
        let mut sum = 0.0;
        for ((h, y), s) in simulated.into_iter().zip(self.observed.iter()).zip(self.errors.iter()) {
            if !h.is_finite() {
                return f64::NEG_INFINITY;
            }
            let r = (y - h) / s;
            sum += r * r;
        }
        -0.5 * sum
    }

    /// Log-likelihood of every member.
    pub fn log_likelihoods(&self) -> Vec<f64> {
        self.simulated
            .row_iter()
            .map(|row| self.log_likelihood(row.iter()))
            .collect()
    }
}

// ============================================================================
// Window run
// ============================================================================

/// The ensemble of the current window, as seen by a filter.
pub struct WindowRun<'r, 'a> {
    ensemble: &'r mut Ensemble,
    ctx: &'r ForecastContext<'a>,
    noise: NoiseGenerator<'a>,
    rng: DrawRng,
}

impl<'r, 'a> WindowRun<'r, 'a> {
    /// Create a new window run.
    ///
    /// `noise` must be the generator the window was created with, so re-runs
    /// reuse each member's stream.
    pub fn new(
        ensemble: &'r mut Ensemble,
        ctx: &'r ForecastContext<'a>,
        noise: &NoiseGenerator<'a>,
    ) -> Self {
        let mut noise = noise.clone();
        let window = ensemble.window().map_or(0, |w| w.index) as u64;
        let rng = noise.substream(&[FILTER_STREAM, window]).rng().clone();
        Self {
            ensemble,
            ctx,
            noise,
            rng,
        }
    }

    /// Run configuration.
    pub fn setup(&self) -> &'a RunSetup {
        self.ctx.setup
    }

    /// Current ensemble.
    pub fn ensemble(&self) -> &Ensemble {
        self.ensemble
    }

    /// Number of members.
    pub fn members(&self) -> usize {
        self.ensemble.len()
    }

    /// Generator for filter-internal randomness.
    pub fn rng(&mut self) -> &mut DrawRng {
        &mut self.rng
    }

    /// Transformed-space parameters (`members x variables`).
    pub fn parameters(&self) -> DMatrix<f64> {
        self.ensemble.parameters(self.ctx.setup)
    }

    /// Simulated observations of every member, or `None` when the window has
    /// no valid observation.
    pub fn predictions(&self, observations: &ObservationSeries) -> DaResult<Option<Predictions>> {
        let setup = self.ctx.setup;
        let members = self.ensemble.members();
        let first = members
            .first()
            .ok_or_else(|| DaError::configuration("ensemble has no members"))?;
        if observations.steps() != first.output.steps() {
            return Err(DaError::DimensionMismatch {
                expected: first.output.steps(),
                actual: observations.steps(),
                context: "window observation steps".to_string(),
            });
        }

        let mut entries = Vec::new();
        let mut observed = Vec::new();
        let mut errors = Vec::new();
        for name in &setup.config().assimilated_variables {
            let obs_col = observations.values().column_index(name).ok_or_else(|| {
                DaError::configuration(format!("no observations of '{}'", name))
            })?;
            let out_col = first.output.column_index(name).ok_or_else(|| {
                DaError::configuration(format!("model does not simulate '{}'", name))
            })?;
            for t in 0..observations.steps() {
                let y = observations.values().values()[(t, obs_col)];
                if y.is_finite() {
                    entries.push((t, out_col));
                    observed.push(y);
                    errors.push(observations.errors().values()[(t, obs_col)]);
                }
            }
        }
        if entries.is_empty() {
            return Ok(None);
        }

        let simulated = DMatrix::from_fn(members.len(), entries.len(), |m, k| {
            let (t, c) = entries[k];
            members[m].output.values()[(t, c)]
        });
        Ok(Some(Predictions {
            entries,
            observed: DVector::from_vec(observed),
            errors: DVector::from_vec(errors),
            simulated,
        }))
    }

    /// Re-run the window with new transformed-space parameters.
    pub fn rerun(&mut self, parameters: &DMatrix<f64>) -> DaResult<()> {
        self.ensemble.rerun(self.ctx, &mut self.noise, parameters)
    }

    /// Resample the members in place.
    pub fn resample(&mut self, indices: &[usize]) -> DaResult<()> {
        self.ensemble.resample(indices)
    }

    /// Simulate one parameter vector from the window-start state of `anchor`.
    pub fn simulate(&mut self, anchor: usize, parameters: &[f64]) -> DaResult<OutputTable> {
        self.ensemble
            .simulate(self.ctx, &mut self.noise, anchor, parameters)
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Transformed-space prior moments of every variable: the last posterior shape
/// when the ensemble carries one, the configured error model otherwise.
pub(crate) fn prior_moments(run: &WindowRun<'_, '_>) -> Vec<(f64, f64)> {
    match run.ensemble().posterior_shape() {
        Some(shapes) => shapes.iter().map(|s| (s.mu, s.sigma)).collect(),
        None => run
            .setup()
            .variables()
            .iter()
            .map(|v| (v.mean_error, v.sd_error))
            .collect(),
    }
}

/// Independent Gaussian log-density; zero-spread dimensions are skipped.
pub(crate) fn log_density(x: &[f64], moments: &[(f64, f64)]) -> f64 {
    x.iter()
        .zip(moments)
        .filter(|(_, (_, sd))| *sd > 0.0)
        .map(|(v, (mu, sd))| {
            let z = (v - mu) / sd;
            -0.5 * z * z - sd.ln()
        })
        .sum()
}

/// Per-column weighted mean and standard deviation.
pub(crate) fn column_moments(values: &DMatrix<f64>, weights: Option<&[f64]>) -> Vec<(f64, f64)> {
    (0..values.ncols())
        .map(|j| {
            let column: Vec<f64> = values.column(j).iter().copied().collect();
            crate::common::stats::weighted_mean_sd(&column, weights)
        })
        .collect()
}

/// Spread used for jitter and proposals: the given spread, or the collapse
/// floor of the variable when it has none.
pub(crate) fn floored_spread(setup: &RunSetup, moments: &[(f64, f64)]) -> Vec<f64> {
    setup
        .variables()
        .iter()
        .zip(moments)
        .map(|(v, &(_, sd))| {
            if sd > 0.0 && sd.is_finite() {
                sd
            } else {
                v.sd_error * setup.config().sd_frac
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictions() -> Predictions {
        Predictions {
            entries: vec![(0, 0), (2, 0)],
            observed: DVector::from_vec(vec![10.0, 20.0]),
            errors: DVector::from_vec(vec![1.0, 2.0]),
            simulated: DMatrix::from_row_slice(3, 2, &[10.0, 20.0, 11.0, 18.0, f64::NAN, 20.0]),
        }
    }

    #[test]
    fn test_log_likelihoods() {
        let ll = predictions().log_likelihoods();
        assert_eq!(ll[0], 0.0);
        assert!((ll[1] - (-0.5 * (1.0 + 1.0))).abs() < 1e-12);
        assert_eq!(ll[2], f64::NEG_INFINITY);
    }

    #[test]
    fn test_predict_reads_entries() {
        let out = OutputTable::from_columns(vec![("SWE".into(), vec![1.0, 2.0, 3.0])]).unwrap();
        let p = predictions().predict(&out);
        assert_eq!(p.as_slice(), &[1.0, 3.0]);
    }

    #[test]
    fn test_log_density_skips_fixed_dimensions() {
        let d = log_density(&[1.0, 5.0], &[(0.0, 1.0), (0.0, 0.0)]);
        assert!((d + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_pass_through_detection() {
        assert!(FilterUpdate::pass_through().is_pass_through());
        let update = FilterUpdate {
            resample_indices: Some(vec![0]),
            ..FilterUpdate::default()
        };
        assert!(!update.is_pass_through());
    }
}
