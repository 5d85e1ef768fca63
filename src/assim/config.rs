//! Run configuration.
//!
//! [`RunConfig`] is the raw, deserializable experiment description. It is
//! validated exactly once into a [`RunSetup`], which resolves the algorithm and
//! the perturbed-variable list into typed values. Every component borrows the
//! `RunSetup`; nothing reads configuration from global state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{DaError, DaResult};
use crate::utils::constants::{
    DEFAULT_ADA_NEFF_TARGET, DEFAULT_LOW_NEFF_FRACTION, DEFAULT_MAX_ITERATIONS,
    DEFAULT_MCMC_BURN_IN, DEFAULT_MCMC_PROPOSAL_SCALE, DEFAULT_MCMC_SAMPLES, DEFAULT_SD_FRAC,
};

// ============================================================================
// Algorithm
// ============================================================================

/// Assimilation algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Unperturbed forward run, no assimilation
    DeterministicOpenLoop,
    /// Particle filter
    Pf,
    /// Particle batch smoother
    Pbs,
    /// Particle batch smoother with an ensemble-smoother proposal
    ProPbs,
    /// Adaptive (tempered) particle batch smoother
    AdaPbs,
    /// Ensemble smoother
    Es,
    /// Iterative ensemble smoother (ES-MDA)
    Ies,
    /// Iterative ensemble smoother with parameter jitter
    Pies,
    /// IES followed by Metropolis refinement
    IesMcmc,
    /// IES-MCMC with emulator-screened proposals
    IesMcmcAi,
}

impl Algorithm {
    /// Name used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::DeterministicOpenLoop => "deterministic_OL",
            Algorithm::Pf => "PF",
            Algorithm::Pbs => "PBS",
            Algorithm::ProPbs => "ProPBS",
            Algorithm::AdaPbs => "AdaPBS",
            Algorithm::Es => "ES",
            Algorithm::Ies => "IES",
            Algorithm::Pies => "PIES",
            Algorithm::IesMcmc => "IES-MCMC",
            Algorithm::IesMcmcAi => "IES-MCMC_AI",
        }
    }

    /// Windows end one step after each observation (sequential filtering).
    pub fn is_sequential(&self) -> bool {
        matches!(self, Algorithm::Pf)
    }

    /// Produces a Metropolis chain summary alongside the posterior.
    pub fn has_mcmc(&self) -> bool {
        matches!(self, Algorithm::IesMcmc | Algorithm::IesMcmcAi)
    }

    /// Parameters are redrawn from the posterior shape after each window.
    pub fn rejuvenates(&self) -> bool {
        matches!(
            self,
            Algorithm::Pbs
                | Algorithm::ProPbs
                | Algorithm::AdaPbs
                | Algorithm::Es
                | Algorithm::Ies
                | Algorithm::Pies
                | Algorithm::IesMcmc
        )
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = DaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "deterministic_OL" => Algorithm::DeterministicOpenLoop,
            "PF" => Algorithm::Pf,
            "PBS" => Algorithm::Pbs,
            "ProPBS" => Algorithm::ProPbs,
            "AdaPBS" => Algorithm::AdaPbs,
            "ES" => Algorithm::Es,
            "IES" => Algorithm::Ies,
            "PIES" => Algorithm::Pies,
            "IES-MCMC" => Algorithm::IesMcmc,
            "IES-MCMC_AI" => Algorithm::IesMcmcAi,
            other => {
                return Err(DaError::configuration(format!(
                    "unsupported assimilation algorithm '{}'",
                    other
                )))
            }
        })
    }
}

// ============================================================================
// Perturbation strategy
// ============================================================================

/// Distribution family of a forcing perturbation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PerturbationStrategy {
    /// Additive normal perturbation
    Normal,
    /// Multiplicative log-normal perturbation
    Lognormal,
    /// Multiplicative bounded logit-normal perturbation
    LogitNormalMult,
    /// Additive bounded logit-normal perturbation
    LogitNormalAdd,
}

impl PerturbationStrategy {
    /// Name used in configuration files.
    pub fn name(&self) -> &'static str {
        match self {
            PerturbationStrategy::Normal => "normal",
            PerturbationStrategy::Lognormal => "lognormal",
            PerturbationStrategy::LogitNormalMult => "logitnormal_mult",
            PerturbationStrategy::LogitNormalAdd => "logitnormal_adi",
        }
    }

    /// Coefficients multiply the forcing instead of being added to it.
    pub fn is_multiplicative(&self) -> bool {
        matches!(
            self,
            PerturbationStrategy::Lognormal | PerturbationStrategy::LogitNormalMult
        )
    }

    /// Coefficients live inside physical bounds.
    pub fn is_bounded(&self) -> bool {
        matches!(
            self,
            PerturbationStrategy::LogitNormalMult | PerturbationStrategy::LogitNormalAdd
        )
    }
}

impl FromStr for PerturbationStrategy {
    type Err = DaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "normal" => PerturbationStrategy::Normal,
            "lognormal" => PerturbationStrategy::Lognormal,
            "logitnormal_mult" => PerturbationStrategy::LogitNormalMult,
            "logitnormal_adi" => PerturbationStrategy::LogitNormalAdd,
            other => {
                return Err(DaError::configuration(format!(
                    "unsupported perturbation strategy '{}'",
                    other
                )))
            }
        })
    }
}

/// One perturbed forcing variable with its resolved error model.
#[derive(Debug, Clone, PartialEq)]
pub struct PerturbedVariable {
    /// Position in the perturbed-variable list
    pub index: usize,
    /// Forcing column name
    pub name: String,
    /// Distribution family
    pub strategy: PerturbationStrategy,
    /// Prior mean in the transformed (Gaussian) space
    pub mean_error: f64,
    /// Prior standard deviation in the transformed space
    pub sd_error: f64,
    /// Physical bounds, required for logit-normal families
    pub bounds: Option<(f64, f64)>,
    /// Standard deviation of the per-step process-noise increment
    pub process_noise: f64,
}

impl PerturbedVariable {
    /// Map a physical coefficient to the transformed (Gaussian) space.
    pub fn to_gaussian(&self, coefficient: f64) -> f64 {
        use crate::common::transforms::glogit;
        match (self.strategy, self.bounds) {
            (PerturbationStrategy::Lognormal, _) => coefficient.ln(),
            (s, Some((lo, hi))) if s.is_bounded() => glogit(coefficient, lo, hi),
            _ => coefficient,
        }
    }

    /// Map a transformed value back to a physical coefficient.
    pub fn from_gaussian(&self, value: f64) -> f64 {
        use crate::common::transforms::gexpit;
        match (self.strategy, self.bounds) {
            (PerturbationStrategy::Lognormal, _) => value.exp(),
            (s, Some((lo, hi))) if s.is_bounded() => gexpit(value, lo, hi),
            _ => value,
        }
    }
}

// ============================================================================
// RunConfig
// ============================================================================

/// Raw experiment configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Algorithm name (see [`Algorithm`])
    pub algorithm: String,
    /// Number of ensemble members
    pub ensemble_members: usize,
    /// Seed for reproducible draws
    pub seed: Option<u64>,
    /// Forcing variables to perturb
    pub vars_to_perturbate: Vec<String>,
    /// Strategy name for each perturbed variable (same order and length)
    pub perturbation_strategy: Vec<String>,
    /// Prior mean of each perturbation (transformed space)
    pub mean_errors: BTreeMap<String, f64>,
    /// Prior standard deviation of each perturbation (transformed space)
    pub sd_errors: BTreeMap<String, f64>,
    /// Lower physical bounds for logit-normal variables
    pub lower_bounds: BTreeMap<String, f64>,
    /// Upper physical bounds for logit-normal variables
    pub upper_bounds: BTreeMap<String, f64>,
    /// Process-noise magnitude per variable
    pub dyn_noise: BTreeMap<String, f64>,
    /// Overlay temporally correlated process noise on the coefficients
    pub add_dynamic_noise: bool,
    /// Fraction of `sd_errors` used as rejuvenation spread after collapse
    pub sd_frac: f64,
    /// Neff / members below which the ensemble counts as collapsed
    pub low_neff_fraction: f64,
    /// Model outputs compared with the observation columns
    pub assimilated_variables: Vec<String>,
    /// ES-MDA iterations for the iterative smoothers
    pub max_iterations: usize,
    /// Metropolis samples per window
    pub mcmc_samples: usize,
    /// Fraction of the chain discarded as burn-in
    pub mcmc_burn_in: f64,
    /// Proposal scale relative to the IES posterior spread
    pub mcmc_proposal_scale: f64,
    /// AdaPBS per-stage effective-size target (fraction of members)
    pub ada_neff_target: f64,
    /// Fixed window length for batch algorithms; `None` spans the horizon
    pub batch_window_steps: Option<usize>,
    /// Skip cells whose output already exists
    pub restart_run: bool,
    /// Reconstruct the prior from a previous run's posterior parameters
    pub load_prev_run: bool,
    /// Coefficients come from an external spatial source
    pub spatial_propagation: bool,
    /// Persist the full final ensemble
    pub save_ensemble: bool,
    /// Resume from, and write, reduced restart checkpoints
    pub real_time_restart: bool,
    /// Recompute the posterior shape after every update
    pub redraw_prior: bool,
    /// Round result series to single precision before writing
    pub compact_output: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            algorithm: "PBS".to_string(),
            ensemble_members: 100,
            seed: None,
            vars_to_perturbate: Vec::new(),
            perturbation_strategy: Vec::new(),
            mean_errors: BTreeMap::new(),
            sd_errors: BTreeMap::new(),
            lower_bounds: BTreeMap::new(),
            upper_bounds: BTreeMap::new(),
            dyn_noise: BTreeMap::new(),
            add_dynamic_noise: false,
            sd_frac: DEFAULT_SD_FRAC,
            low_neff_fraction: DEFAULT_LOW_NEFF_FRACTION,
            assimilated_variables: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            mcmc_samples: DEFAULT_MCMC_SAMPLES,
            mcmc_burn_in: DEFAULT_MCMC_BURN_IN,
            mcmc_proposal_scale: DEFAULT_MCMC_PROPOSAL_SCALE,
            ada_neff_target: DEFAULT_ADA_NEFF_TARGET,
            batch_window_steps: None,
            restart_run: false,
            load_prev_run: false,
            spatial_propagation: false,
            save_ensemble: false,
            real_time_restart: false,
            redraw_prior: false,
            compact_output: false,
        }
    }
}

impl RunConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> DaResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| DaError::configuration(format!("invalid configuration: {}", e)))
    }

    /// Resolve the algorithm name.
    pub fn algorithm(&self) -> DaResult<Algorithm> {
        self.algorithm.parse()
    }

    /// Validate and resolve the perturbed-variable list.
    pub fn perturbed_variables(&self) -> DaResult<Vec<PerturbedVariable>> {
        if self.vars_to_perturbate.len() != self.perturbation_strategy.len() {
            return Err(DaError::configuration(format!(
                "vars_to_perturbate has {} entries but perturbation_strategy has {}",
                self.vars_to_perturbate.len(),
                self.perturbation_strategy.len()
            )));
        }

        self.vars_to_perturbate
            .iter()
            .zip(&self.perturbation_strategy)
            .enumerate()
            .map(|(index, (name, strategy))| {
                let strategy: PerturbationStrategy = strategy.parse()?;
                let mean_error = *self.mean_errors.get(name).ok_or_else(|| {
                    DaError::configuration(format!("no mean error for '{}'", name))
                })?;
                let sd_error = *self.sd_errors.get(name).ok_or_else(|| {
                    DaError::configuration(format!("no sd error for '{}'", name))
                })?;
                if !(sd_error.is_finite() && sd_error >= 0.0) {
                    return Err(DaError::configuration(format!(
                        "sd error of '{}' must be finite and non-negative",
                        name
                    )));
                }

                let bounds = match (self.lower_bounds.get(name), self.upper_bounds.get(name)) {
                    (Some(&lo), Some(&hi)) => Some((lo, hi)),
                    _ => None,
                };
                if strategy.is_bounded() {
                    match bounds {
                        Some((lo, hi)) if lo < hi => {}
                        Some((lo, hi)) => {
                            return Err(DaError::configuration(format!(
                                "bounds of '{}' are inverted: [{}, {}]",
                                name, lo, hi
                            )))
                        }
                        None => {
                            return Err(DaError::configuration(format!(
                                "'{}' uses {} but has no bounds",
                                name,
                                strategy.name()
                            )))
                        }
                    }
                }

                Ok(PerturbedVariable {
                    index,
                    name: name.clone(),
                    strategy,
                    mean_error,
                    sd_error,
                    bounds,
                    process_noise: self.dyn_noise.get(name).copied().unwrap_or(0.0),
                })
            })
            .collect()
    }
}

// ============================================================================
// RunSetup
// ============================================================================

/// Validated, read-only configuration shared by every component of a run.
#[derive(Debug, Clone)]
pub struct RunSetup {
    config: RunConfig,
    algorithm: Algorithm,
    variables: Vec<PerturbedVariable>,
}

impl RunSetup {
    /// Validate a configuration.
    pub fn new(config: RunConfig) -> DaResult<Self> {
        let algorithm = config.algorithm()?;
        let variables = config.perturbed_variables()?;

        if config.ensemble_members == 0 && algorithm != Algorithm::DeterministicOpenLoop {
            return Err(DaError::configuration("ensemble_members must be positive"));
        }
        if config.assimilated_variables.is_empty()
            && algorithm != Algorithm::DeterministicOpenLoop
        {
            return Err(DaError::configuration(
                "assimilated_variables must name at least one model output",
            ));
        }
        if algorithm.has_mcmc() && config.mcmc_samples == 0 {
            return Err(DaError::configuration("mcmc_samples must be positive"));
        }
        if !(0.0..1.0).contains(&config.mcmc_burn_in) {
            return Err(DaError::configuration("mcmc_burn_in must be in [0, 1)"));
        }
        if matches!(config.batch_window_steps, Some(0)) {
            return Err(DaError::configuration("batch_window_steps must be positive"));
        }

        Ok(Self {
            config,
            algorithm,
            variables,
        })
    }

    /// Raw configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Resolved algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Resolved perturbed variables, in configuration order.
    pub fn variables(&self) -> &[PerturbedVariable] {
        &self.variables
    }

    /// Number of ensemble members.
    pub fn members(&self) -> usize {
        self.config.ensemble_members
    }

    /// Effective size below which the ensemble counts as collapsed.
    pub fn low_neff_threshold(&self) -> f64 {
        self.config.low_neff_fraction * self.config.ensemble_members as f64
    }

    /// Process noise is applied in this run.
    pub fn process_noise_enabled(&self) -> bool {
        self.config.add_dynamic_noise && !self.config.spatial_propagation
    }
}
