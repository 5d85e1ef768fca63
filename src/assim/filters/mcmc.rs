//! IES followed by a random-walk Metropolis refinement.
//!
//! The chain starts at the IES posterior mean and proposes
//! `θ' = θ + s · σ_IES · z`. Every accepted or rejected state contributes its
//! simulated output to the chain summary after burn-in. The emulator-assisted
//! variant fits a linear map from parameters to simulated observations on the
//! IES ensemble and uses it for delayed acceptance: proposals the emulator
//! already rejects never reach the model.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use super::{
    column_moments, floored_spread, log_density, prior_moments, AssimilationFilter,
    EnsembleSmoother, FilterUpdate, McmcSummary, WindowRun,
};
use crate::assim::config::Algorithm;
use crate::assim::errors::{DaError, DaResult};
use crate::assim::types::{ObservationSeries, OutputTable};

/// Least-squares linear map from parameters to simulated observations.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearEmulator {
    /// `(1 + variables) x entries` coefficients, intercept first
    coefficients: DMatrix<f64>,
}

impl LinearEmulator {
    /// Fit `simulated ≈ [1, params] · B` over the ensemble.
    pub fn fit(params: &DMatrix<f64>, simulated: &DMatrix<f64>) -> DaResult<Self> {
        if params.nrows() != simulated.nrows() {
            return Err(DaError::DimensionMismatch {
                expected: params.nrows(),
                actual: simulated.nrows(),
                context: "emulator training rows".to_string(),
            });
        }
        let design = DMatrix::from_fn(params.nrows(), params.ncols() + 1, |i, j| {
            if j == 0 {
                1.0
            } else {
                params[(i, j - 1)]
            }
        });
        let coefficients = design
            .svd(true, true)
            .solve(simulated, 1e-12)
            .map_err(|e| DaError::numerical(format!("emulator fit failed: {}", e)))?;
        Ok(Self { coefficients })
    }

    /// Emulated observation vector for one parameter vector.
    pub fn predict(&self, params: &[f64]) -> DVector<f64> {
        let mut out: DVector<f64> = self.coefficients.row(0).transpose();
        for (j, p) in params.iter().enumerate() {
            out += self.coefficients.row(j + 1).transpose() * *p;
        }
        out
    }
}

/// Running per-entry sums of the chain output.
struct ChainMoments {
    sum: DMatrix<f64>,
    sum_sq: DMatrix<f64>,
    count: usize,
}

impl ChainMoments {
    fn new(shape: &OutputTable) -> Self {
        let (r, c) = shape.values().shape();
        Self {
            sum: DMatrix::zeros(r, c),
            sum_sq: DMatrix::zeros(r, c),
            count: 0,
        }
    }

    fn push(&mut self, output: &OutputTable) {
        self.sum += output.values();
        self.sum_sq += output.values().component_mul(output.values());
        self.count += 1;
    }

    fn finish(self, variables: Vec<String>) -> DaResult<(OutputTable, OutputTable)> {
        let k = self.count.max(1) as f64;
        let mean = self.sum / k;
        let var = self.sum_sq / k - mean.component_mul(&mean);
        let sd = var.map(|v| v.max(0.0).sqrt());
        Ok((
            OutputTable::new(variables.clone(), mean)?,
            OutputTable::new(variables, sd)?,
        ))
    }
}

/// IES-MCMC and IES-MCMC_AI.
#[derive(Debug, Clone, Copy)]
pub struct SmootherMcmc {
    smoother: EnsembleSmoother,
    samples: usize,
    burn_in: f64,
    proposal_scale: f64,
    emulated: bool,
}

impl SmootherMcmc {
    /// Create a new refinement stage after an IES with `iterations` steps.
    pub fn new(
        iterations: usize,
        samples: usize,
        burn_in: f64,
        proposal_scale: f64,
        emulated: bool,
    ) -> Self {
        Self {
            smoother: EnsembleSmoother::ies(iterations),
            samples,
            burn_in,
            proposal_scale,
            emulated,
        }
    }
}

impl AssimilationFilter for SmootherMcmc {
    fn algorithm(&self) -> Algorithm {
        if self.emulated {
            Algorithm::IesMcmcAi
        } else {
            Algorithm::IesMcmc
        }
    }

    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        let prior = prior_moments(run);
        let mut update = self.smoother.update(run, observations)?;
        if update.is_pass_through() {
            return Ok(update);
        }
        let Some(pred) = run.predictions(observations)? else {
            return Ok(update);
        };

        let params = run.parameters();
        let moments = column_moments(&params, None);
        let spread = floored_spread(run.setup(), &moments);
        let anchor = pred
            .log_likelihoods()
            .iter()
            .enumerate()
            .filter(|(_, ll)| ll.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map_or(0, |(i, _)| i);
        let emulator = if self.emulated {
            Some(LinearEmulator::fit(&params, &pred.simulated)?)
        } else {
            None
        };
        let emulated_ll =
            |theta: &[f64]| emulator.as_ref().map_or(0.0, |e| pred.log_likelihood(e.predict(theta).iter()));

        let mut current: Vec<f64> = moments.iter().map(|&(mu, _)| mu).collect();
        let mut current_out = run.simulate(anchor, &current)?;
        let mut current_ll = pred.log_likelihood(pred.predict(&current_out).iter());
        let mut current_lp = log_density(&current, &prior);
        let mut current_em = emulated_ll(&current);
        let mut model_runs = 1;
        let mut accepted = 0;

        let burn = (self.samples as f64 * self.burn_in).floor() as usize;
        let mut chain = ChainMoments::new(&current_out);

        for k in 0..self.samples {
            let proposal: Vec<f64> = current
                .iter()
                .zip(&spread)
                .map(|(&c, &s)| {
                    let z: f64 = StandardNormal.sample(run.rng());
                    c + self.proposal_scale * s * z
                })
                .collect();
            let lp = log_density(&proposal, &prior);
            let em = emulated_ll(&proposal);

            let screened = if self.emulated {
                let u: f64 = run.rng().gen();
                u.ln() < (em + lp) - (current_em + current_lp)
            } else {
                true
            };

            if screened {
                let out = run.simulate(anchor, &proposal)?;
                model_runs += 1;
                let ll = pred.log_likelihood(pred.predict(&out).iter());
                let log_alpha = if self.emulated {
                    (ll - current_ll) - (em - current_em)
                } else {
                    (ll + lp) - (current_ll + current_lp)
                };
                let u: f64 = run.rng().gen();
                if ll.is_finite() && u.ln() < log_alpha {
                    current = proposal;
                    current_out = out;
                    current_ll = ll;
                    current_lp = lp;
                    current_em = em;
                    accepted += 1;
                }
            }

            if k >= burn {
                chain.push(&current_out);
            }
        }

        let (mean, sd) = chain.finish(current_out.variables().to_vec())?;
        let acceptance_rate = accepted as f64 / self.samples.max(1) as f64;
        log::debug!(
            "{} chain: {} samples, acceptance {:.3}, {} model runs",
            self.algorithm(),
            self.samples,
            acceptance_rate,
            model_runs
        );
        update.mcmc = Some(McmcSummary {
            mean,
            sd,
            acceptance_rate,
            model_runs,
        });
        Ok(update)
    }
}
