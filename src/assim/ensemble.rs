//! Ensemble state for one cell.
//!
//! Each [`Member`] carries the perturbation coefficients it was driven with in
//! the current window, its model state at the start and end of the window and
//! its simulated output. The [`Ensemble`] adds importance weights, an
//! unperturbed open-loop track, the most recent [`PosteriorShape`] and any
//! coefficients already drawn for the next window by rejuvenation.
//!
//! # Forecasting
//!
//! Members are independent within a window: each gets its own noise stream and
//! its own copy of the starting state, so perturbation and model integration
//! run in parallel with the `rayon` feature. Seeded results are identical with
//! and without it.
//!
//! # Snapshots
//!
//! [`Ensemble::snapshot`] is a read-only projection. The reduced form drops the
//! window forcing, the member output trajectories and the window-start states,
//! keeping only what the next window needs.

use nalgebra::{DMatrix, DVector};
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::config::RunSetup;
use super::errors::{DaError, DaResult};
use super::noise::{NoiseGenerator, NoiseSource, PosteriorNoise, PosteriorShape};
use super::traits::{CoefficientSource, ModelAdapter};
use super::types::{
    AssimilationWindow, CellIndex, DataTable, ForcingTable, ModelState, OutputTable,
};
use crate::common::stats::{effective_sample_size, uniform_weights, weighted_mean_sd};

/// Stream tag of rejuvenation draws.
const REJUVENATION_STREAM: u64 = 0x524a_5556;

// ============================================================================
// Forecast context
// ============================================================================

/// Collaborators needed to run members forward.
#[derive(Clone, Copy)]
pub struct ForecastContext<'a> {
    /// Validated run configuration
    pub setup: &'a RunSetup,
    /// Physical model
    pub model: &'a dyn ModelAdapter,
    /// External coefficients for spatial-propagation runs
    pub coefficients: Option<&'a dyn CoefficientSource>,
}

impl<'a> ForecastContext<'a> {
    /// Create a new context without an external coefficient source.
    pub fn new(setup: &'a RunSetup, model: &'a dyn ModelAdapter) -> Self {
        Self {
            setup,
            model,
            coefficients: None,
        }
    }

    /// Attach an external coefficient source.
    pub fn with_coefficients(mut self, source: &'a dyn CoefficientSource) -> Self {
        self.coefficients = Some(source);
        self
    }
}

// ============================================================================
// Member
// ============================================================================

/// One stochastic realisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Coefficient series per perturbed variable (physical space)
    pub noise: Vec<Vec<f64>>,
    /// Model state at the start of the current window
    pub origin_state: ModelState,
    /// Model state at the end of the current window
    pub state: ModelState,
    /// Simulated output over the current window
    pub output: OutputTable,
    /// Perturbed forcing of the current window
    pub forcing: Option<ForcingTable>,
}

impl Member {
    fn initial(state: ModelState) -> Self {
        Self {
            noise: Vec::new(),
            origin_state: state.clone(),
            state,
            output: OutputTable::empty(Vec::new()),
            forcing: None,
        }
    }
}

fn run_member(
    ctx: &ForecastContext<'_>,
    noise: &mut NoiseGenerator<'_>,
    forcing: &ForcingTable,
    source: NoiseSource<'_>,
    origin: &ModelState,
) -> DaResult<Member> {
    let (perturbed, coefficients) = noise.perturb(forcing, source)?;
    let mut state = origin.clone();
    let output = ctx.model.advance(&mut state, &perturbed)?;
    Ok(Member {
        noise: coefficients,
        origin_state: origin.clone(),
        state,
        output,
        forcing: Some(perturbed),
    })
}

/// Run every member over `forcing` from its origin state.
fn forecast<'s>(
    ctx: &ForecastContext<'_>,
    generators: Vec<NoiseGenerator<'_>>,
    forcing: &ForcingTable,
    origins: &[ModelState],
    source_of: impl Fn(usize) -> NoiseSource<'s> + Sync,
) -> DaResult<Vec<Member>> {
    #[cfg(feature = "rayon")]
    {
        generators
            .into_par_iter()
            .enumerate()
            .map(|(m, mut gen)| run_member(ctx, &mut gen, forcing, source_of(m), &origins[m]))
            .collect()
    }

    #[cfg(not(feature = "rayon"))]
    {
        generators
            .into_iter()
            .enumerate()
            .map(|(m, mut gen)| run_member(ctx, &mut gen, forcing, source_of(m), &origins[m]))
            .collect()
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Which parts of the ensemble a snapshot keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotKind {
    /// Everything, for ensemble output
    Full,
    /// Only what resuming the next window needs
    Reduced,
}

/// Serializable view of an [`Ensemble`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSnapshot {
    /// Projection used to build the snapshot
    pub kind: SnapshotKind,
    /// Cell the ensemble belongs to
    pub cell: CellIndex,
    /// Member records
    pub members: Vec<Member>,
    /// Importance weights
    pub weights: Vec<f64>,
    /// End-of-window state of the open-loop track
    pub open_loop_state: ModelState,
    /// Last computed posterior shape
    pub posterior_shape: Option<Vec<PosteriorShape>>,
    /// Coefficients already drawn for the next window
    pub pending: Option<Vec<Vec<f64>>>,
    /// Last processed window
    pub window: Option<AssimilationWindow>,
    /// Unperturbed forcing of the last window (full snapshots only)
    pub window_forcing: Option<ForcingTable>,
}

// ============================================================================
// Ensemble
// ============================================================================

/// Ensemble of perturbed model runs for one cell.
#[derive(Debug, Clone)]
pub struct Ensemble {
    cell: CellIndex,
    members: Vec<Member>,
    weights: DVector<f64>,
    window: Option<AssimilationWindow>,
    window_forcing: Option<ForcingTable>,
    open_loop_state: ModelState,
    open_loop_output: Option<OutputTable>,
    posterior_shape: Option<Vec<PosteriorShape>>,
    pending: Option<Vec<Vec<f64>>>,
    restarted: bool,
}

impl Ensemble {
    /// Create a new ensemble of `members` copies of `initial_state`.
    pub fn new(cell: CellIndex, members: usize, initial_state: ModelState) -> Self {
        Self {
            cell,
            members: (0..members)
                .map(|_| Member::initial(initial_state.clone()))
                .collect(),
            weights: uniform_weights(members),
            window: None,
            window_forcing: None,
            open_loop_state: initial_state,
            open_loop_output: None,
            posterior_shape: None,
            pending: None,
            restarted: false,
        }
    }

    /// Fresh ensemble from the model's initial state.
    pub fn fresh(ctx: &ForecastContext<'_>, cell: CellIndex) -> Self {
        Self::new(cell, ctx.setup.members(), ctx.model.initial_state(cell))
    }

    /// Cell the ensemble belongs to.
    pub fn cell(&self) -> CellIndex {
        self.cell
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// True when the ensemble has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Member records.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Normalized importance weights.
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// Replace the importance weights.
    pub fn set_weights(&mut self, weights: DVector<f64>) -> DaResult<()> {
        if weights.len() != self.members.len() {
            return Err(DaError::DimensionMismatch {
                expected: self.members.len(),
                actual: weights.len(),
                context: "ensemble weights".to_string(),
            });
        }
        self.weights = weights;
        Ok(())
    }

    /// Effective sample size of the current weights.
    pub fn effective_size(&self) -> f64 {
        effective_sample_size(&self.weights)
    }

    /// Window of the most recent forecast.
    pub fn window(&self) -> Option<AssimilationWindow> {
        self.window
    }

    /// Open-loop output of the most recent window.
    pub fn open_loop_output(&self) -> Option<&OutputTable> {
        self.open_loop_output.as_ref()
    }

    /// Most recent posterior shape, one entry per perturbed variable.
    pub fn posterior_shape(&self) -> Option<&[PosteriorShape]> {
        self.posterior_shape.as_deref()
    }

    /// Coefficients already drawn for the next window.
    pub fn pending_coefficients(&self) -> Option<&[Vec<f64>]> {
        self.pending.as_deref()
    }

    /// True when the ensemble was restored from a checkpoint.
    pub fn is_restarted(&self) -> bool {
        self.restarted
    }

    // ------------------------------------------------------------------------
    // Forecast
    // ------------------------------------------------------------------------

    /// Perturb the window forcing per member and advance every member across
    /// the window.
    ///
    /// Coefficients come from, in order of precedence: those drawn by
    /// [`season_rejuvenation`](Self::season_rejuvenation); the external
    /// coefficient source in spatial-propagation runs; a replayed posterior
    /// (`posterior`); the last posterior shape when `redraw_prior` is set;
    /// otherwise the configured prior. Weights are reset to uniform.
    pub fn create(
        &mut self,
        ctx: &ForecastContext<'_>,
        noise: &mut NoiseGenerator<'_>,
        forcing: &ForcingTable,
        window: AssimilationWindow,
        posterior: Option<&[PosteriorNoise]>,
    ) -> DaResult<()> {
        if forcing.steps() != window.len() {
            return Err(DaError::DimensionMismatch {
                expected: window.len(),
                actual: forcing.steps(),
                context: "window forcing steps".to_string(),
            });
        }

        let setup = ctx.setup;
        let n = self.members.len();
        let supplied = match self.pending.take() {
            Some(pending) => Some(pending),
            None if setup.config().spatial_propagation && posterior.is_none() => {
                Some(self.external_coefficients(ctx)?)
            }
            None => None,
        };
        let shape = if setup.config().redraw_prior {
            self.posterior_shape.clone()
        } else {
            None
        };

        let shared = match (posterior, shape.as_deref()) {
            (Some(p), _) => NoiseSource::Posterior(p),
            (None, Some(s)) => NoiseSource::Shape(s),
            (None, None) => NoiseSource::Fresh,
        };
        let supplied_ref = supplied.as_deref();
        let generators = (0..n).map(|m| noise.for_member(window.index, m)).collect();
        let origins: Vec<ModelState> = self.members.iter().map(|m| m.state.clone()).collect();

        let members = forecast(ctx, generators, forcing, &origins, move |m| {
            match supplied_ref {
                Some(s) => NoiseSource::Supplied(s[m].as_slice()),
                None => shared,
            }
        })?;

        let mut open_loop_state = self.open_loop_state.clone();
        let open_loop_output = ctx.model.advance(&mut open_loop_state, forcing)?;

        self.members = members;
        self.weights = uniform_weights(n);
        self.window = Some(window);
        self.window_forcing = Some(forcing.clone());
        self.open_loop_state = open_loop_state;
        self.open_loop_output = Some(open_loop_output);
        Ok(())
    }

    fn external_coefficients(&self, ctx: &ForecastContext<'_>) -> DaResult<Vec<Vec<f64>>> {
        let source = ctx.coefficients.ok_or_else(|| {
            DaError::configuration("spatial propagation requires a coefficient source")
        })?;
        (0..self.members.len())
            .map(|m| {
                ctx.setup
                    .variables()
                    .iter()
                    .map(|v| source.coefficient(self.cell, &v.name, m))
                    .collect()
            })
            .collect()
    }

    /// Re-run the current window from each member's window-start state with
    /// new transformed-space parameters (`members x variables`).
    pub fn rerun(
        &mut self,
        ctx: &ForecastContext<'_>,
        noise: &mut NoiseGenerator<'_>,
        parameters: &DMatrix<f64>,
    ) -> DaResult<()> {
        let (window, forcing) = self.current_window()?;
        let supplied = self.physical_coefficients(ctx.setup, parameters)?;
        let generators = (0..self.members.len())
            .map(|m| noise.for_member(window.index, m))
            .collect();
        let origins: Vec<ModelState> = self
            .members
            .iter()
            .map(|m| m.origin_state.clone())
            .collect();
        let supplied_ref = supplied.as_slice();

        self.members = forecast(ctx, generators, &forcing, &origins, move |m| {
            NoiseSource::Supplied(supplied_ref[m].as_slice())
        })?;
        Ok(())
    }

    /// Simulate one candidate parameter vector from the window-start state of
    /// member `anchor`, without changing the ensemble.
    pub fn simulate(
        &self,
        ctx: &ForecastContext<'_>,
        noise: &mut NoiseGenerator<'_>,
        anchor: usize,
        parameters: &[f64],
    ) -> DaResult<OutputTable> {
        let (window, forcing) = self.current_window()?;
        let member = self.members.get(anchor).ok_or_else(|| DaError::DimensionMismatch {
            expected: self.members.len(),
            actual: anchor + 1,
            context: "simulation anchor member".to_string(),
        })?;
        let coefficients: Vec<f64> = ctx
            .setup
            .variables()
            .iter()
            .zip(parameters)
            .map(|(v, &p)| v.from_gaussian(p))
            .collect();
        let mut gen = noise.for_member(window.index, anchor);
        Ok(run_member(
            ctx,
            &mut gen,
            &forcing,
            NoiseSource::Supplied(&coefficients),
            &member.origin_state,
        )?
        .output)
    }

    fn current_window(&self) -> DaResult<(AssimilationWindow, ForcingTable)> {
        match (self.window, &self.window_forcing) {
            (Some(w), Some(f)) => Ok((w, f.clone())),
            _ => Err(DaError::configuration(
                "ensemble has no forecast window to re-run",
            )),
        }
    }

    fn physical_coefficients(
        &self,
        setup: &RunSetup,
        parameters: &DMatrix<f64>,
    ) -> DaResult<Vec<Vec<f64>>> {
        let vars = setup.variables();
        if parameters.nrows() != self.members.len() || parameters.ncols() != vars.len() {
            return Err(DaError::DimensionMismatch {
                expected: self.members.len() * vars.len(),
                actual: parameters.nrows() * parameters.ncols(),
                context: "ensemble parameters".to_string(),
            });
        }
        Ok((0..parameters.nrows())
            .map(|m| {
                vars.iter()
                    .map(|v| v.from_gaussian(parameters[(m, v.index)]))
                    .collect()
            })
            .collect())
    }

    // ------------------------------------------------------------------------
    // Resampling and rejuvenation
    // ------------------------------------------------------------------------

    /// Replace every member with a copy of the member at the corresponding
    /// source index. Weights become uniform.
    pub fn resample(&mut self, indices: &[usize]) -> DaResult<()> {
        let n = self.members.len();
        if indices.len() != n {
            return Err(DaError::DimensionMismatch {
                expected: n,
                actual: indices.len(),
                context: "resampling indices".to_string(),
            });
        }
        if let Some(&bad) = indices.iter().find(|&&i| i >= n) {
            return Err(DaError::DimensionMismatch {
                expected: n,
                actual: bad + 1,
                context: "resampling source member".to_string(),
            });
        }
        self.members = indices.iter().map(|&i| self.members[i].clone()).collect();
        self.weights = uniform_weights(n);
        Ok(())
    }

    /// Window-mean transformed-space parameter of every member
    /// (`members x variables`).
    pub fn parameters(&self, setup: &RunSetup) -> DMatrix<f64> {
        let vars = setup.variables();
        DMatrix::from_fn(self.members.len(), vars.len(), |m, j| {
            let series = self.members[m].noise.get(j).map_or(&[][..], |s| s.as_slice());
            if series.is_empty() {
                return vars[j].mean_error;
            }
            series.iter().map(|&c| vars[j].to_gaussian(c)).sum::<f64>() / series.len() as f64
        })
    }

    fn gaussian_column(&self, setup: &RunSetup, variable: usize, step: usize) -> Vec<f64> {
        let var = &setup.variables()[variable];
        self.members
            .iter()
            .map(|m| {
                m.noise
                    .get(variable)
                    .and_then(|s| s.get(step))
                    .map_or(f64::NAN, |&c| var.to_gaussian(c))
            })
            .collect()
    }

    /// Weighted per-step mean and standard deviation of every variable's
    /// coefficients in the transformed space.
    pub fn parameter_summary(&self, setup: &RunSetup) -> DaResult<(DataTable, DataTable)> {
        let names: Vec<String> = setup.variables().iter().map(|v| v.name.clone()).collect();
        let steps = self.window.map_or(0, |w| w.len());
        let weights: Vec<f64> = self.weights.iter().copied().collect();
        let mut mean = DMatrix::zeros(steps, names.len());
        let mut sd = DMatrix::zeros(steps, names.len());
        for j in 0..names.len() {
            for t in 0..steps {
                let (mu, s) = weighted_mean_sd(&self.gaussian_column(setup, j, t), Some(weights.as_slice()));
                mean[(t, j)] = mu;
                sd[(t, j)] = s;
            }
        }
        Ok((DataTable::new(names.clone(), mean)?, DataTable::new(names, sd)?))
    }

    /// Summarise the weighted coefficient distribution of every variable.
    ///
    /// Per step, the weighted mean and standard deviation are taken across
    /// members in the transformed space and then averaged over the window.
    /// When the effective sample size is below the collapse threshold the
    /// spread is replaced by `sd_frac` times the nominal error.
    pub fn update_posterior_shape(&mut self, setup: &RunSetup) -> DaResult<&[PosteriorShape]> {
        let (mean, sd) = self.parameter_summary(setup)?;
        let steps = mean.steps();
        if steps == 0 {
            return Err(DaError::configuration(
                "posterior shape requested before any forecast",
            ));
        }
        let collapsed = self.effective_size() < setup.low_neff_threshold();

        let mut shapes = Vec::with_capacity(setup.variables().len());
        for var in setup.variables() {
            let mu = mean.values().column(var.index).sum() / steps as f64;
            let sigma = if collapsed {
                var.sd_error * setup.config().sd_frac
            } else {
                sd.values().column(var.index).sum() / steps as f64
            };
            if !(mu.is_finite() && sigma.is_finite()) {
                return Err(DaError::numerical(format!(
                    "posterior shape of '{}' is not finite",
                    var.name
                )));
            }
            shapes.push(PosteriorShape { mu, sigma });
        }
        Ok(self.posterior_shape.insert(shapes).as_slice())
    }

    /// Draw one coefficient per member and variable from the posterior shape
    /// for the next window.
    pub fn season_rejuvenation(
        &mut self,
        setup: &RunSetup,
        noise: &mut NoiseGenerator<'_>,
    ) -> DaResult<()> {
        let shapes = match self.posterior_shape.clone() {
            Some(s) => s,
            None => self.update_posterior_shape(setup)?.to_vec(),
        };
        let window = self.window.map_or(0, |w| w.index) as u64;

        let mut pending = Vec::with_capacity(self.members.len());
        for m in 0..self.members.len() {
            let mut gen = noise.substream(&[REJUVENATION_STREAM, window, m as u64]);
            let mut coefficients = Vec::with_capacity(shapes.len());
            for (var, shape) in setup.variables().iter().zip(&shapes) {
                let draw = gen.generate(var.strategy, 1, shape.mu, shape.sigma, var)?;
                coefficients.push(draw[0]);
            }
            pending.push(coefficients);
        }
        self.pending = Some(pending);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Summaries
    // ------------------------------------------------------------------------

    /// Weighted per-step mean and standard deviation of the member output.
    pub fn summary(&self) -> DaResult<(OutputTable, OutputTable)> {
        let first = self
            .members
            .first()
            .ok_or_else(|| DaError::configuration("ensemble has no members"))?;
        let variables = first.output.variables().to_vec();
        let steps = first.output.steps();
        let weights: Vec<f64> = self.weights.iter().copied().collect();

        let mut mean = DMatrix::zeros(steps, variables.len());
        let mut sd = DMatrix::zeros(steps, variables.len());
        let mut column = vec![0.0; self.members.len()];
        for j in 0..variables.len() {
            for t in 0..steps {
                for (k, member) in self.members.iter().enumerate() {
                    column[k] = member.output.values()[(t, j)];
                }
                let (mu, s) = weighted_mean_sd(&column, Some(weights.as_slice()));
                mean[(t, j)] = mu;
                sd[(t, j)] = s;
            }
        }
        Ok((
            OutputTable::new(variables.clone(), mean)?,
            OutputTable::new(variables, sd)?,
        ))
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    /// Serializable projection of the ensemble. The live ensemble is untouched.
    pub fn snapshot(&self, kind: SnapshotKind) -> EnsembleSnapshot {
        let (members, window_forcing) = match kind {
            SnapshotKind::Full => (self.members.clone(), self.window_forcing.clone()),
            SnapshotKind::Reduced => (
                self.members
                    .iter()
                    .map(|m| Member {
                        noise: m.noise.clone(),
                        origin_state: ModelState::zeros(0),
                        state: m.state.clone(),
                        output: OutputTable::empty(m.output.variables().to_vec()),
                        forcing: None,
                    })
                    .collect(),
                None,
            ),
        };
        EnsembleSnapshot {
            kind,
            cell: self.cell,
            members,
            weights: self.weights.iter().copied().collect(),
            open_loop_state: self.open_loop_state.clone(),
            posterior_shape: self.posterior_shape.clone(),
            pending: self.pending.clone(),
            window: self.window,
            window_forcing,
        }
    }

    /// Rebuild a runnable ensemble from a snapshot.
    pub fn from_snapshot(snapshot: EnsembleSnapshot, setup: &RunSetup) -> DaResult<Self> {
        let n = snapshot.members.len();
        if n != setup.members() {
            return Err(DaError::configuration(format!(
                "checkpoint holds {} members but the run is configured for {}",
                n,
                setup.members()
            )));
        }
        let nvars = setup.variables().len();
        let shape_ok = snapshot.posterior_shape.as_ref().map_or(true, |s| s.len() == nvars);
        let pending_ok = snapshot
            .pending
            .as_ref()
            .map_or(true, |p| p.len() == n && p.iter().all(|c| c.len() == nvars));
        if !(shape_ok && pending_ok) {
            return Err(DaError::configuration(
                "checkpoint perturbs a different set of variables",
            ));
        }

        let weights = if snapshot.weights.len() == n {
            DVector::from_vec(snapshot.weights)
        } else {
            uniform_weights(n)
        };
        Ok(Self {
            cell: snapshot.cell,
            members: snapshot.members,
            weights,
            window: snapshot.window,
            window_forcing: snapshot.window_forcing,
            open_loop_state: snapshot.open_loop_state,
            open_loop_output: None,
            posterior_shape: snapshot.posterior_shape,
            pending: snapshot.pending,
            restarted: true,
        })
    }
}
