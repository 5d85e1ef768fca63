//! Importance-sampling filters: PF, PBS, ProPBS and AdaPBS.

use nalgebra::{DMatrix, DVector};
use rand_distr::{Distribution, StandardNormal};

use super::{
    column_moments, floored_spread, log_density, prior_moments, AssimilationFilter,
    FilterUpdate, WindowRun,
};
use crate::assim::config::Algorithm;
use crate::assim::errors::{DaError, DaResult};
use crate::assim::types::ObservationSeries;
use crate::common::stats::{effective_sample_size, normalize_log_weights, systematic_resample};
use crate::utils::constants::{MAX_TEMPERING_STAGES, TEMPERING_BISECTION_STEPS};

fn weighted_update(run: &mut WindowRun<'_, '_>, log_weights: &[f64]) -> FilterUpdate {
    let weights = normalize_log_weights(log_weights);
    let effective_size = effective_sample_size(&weights);
    let indices = systematic_resample(&weights, run.rng());
    FilterUpdate {
        weights: Some(weights),
        resample_indices: Some(indices),
        effective_size: Some(effective_size),
        iterations: 1,
        ..FilterUpdate::default()
    }
}

// ============================================================================
// PF
// ============================================================================

/// Sequential importance resampling filter.
///
/// Prior weights are multiplied by the window likelihood; the ensemble is
/// resampled after every window.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParticleFilter;

impl AssimilationFilter for ParticleFilter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Pf
    }

    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        let Some(pred) = run.predictions(observations)? else {
            return Ok(FilterUpdate::pass_through());
        };
        let log_weights: Vec<f64> = run
            .ensemble()
            .weights()
            .iter()
            .zip(pred.log_likelihoods())
            .map(|(w, ll)| w.ln() + ll)
            .collect();
        Ok(weighted_update(run, &log_weights))
    }
}

// ============================================================================
// PBS
// ============================================================================

/// Particle batch smoother: one likelihood over every observation in the
/// window.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParticleBatchSmoother;

impl AssimilationFilter for ParticleBatchSmoother {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Pbs
    }

    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        let Some(pred) = run.predictions(observations)? else {
            return Ok(FilterUpdate::pass_through());
        };
        Ok(weighted_update(run, &pred.log_likelihoods()))
    }
}

// ============================================================================
// ProPBS
// ============================================================================

/// PBS with an ensemble-smoother proposal.
///
/// Members are first moved by one smoother step, re-run, and then weighted by
/// likelihood times the prior-to-proposal density ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProposalParticleBatchSmoother;

impl AssimilationFilter for ProposalParticleBatchSmoother {
    fn algorithm(&self) -> Algorithm {
        Algorithm::ProPbs
    }

    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        let Some(pred) = run.predictions(observations)? else {
            return Ok(FilterUpdate::pass_through());
        };
        let prior = prior_moments(run);
        let params = run.parameters();
        let proposal =
            super::ensemble_smoother_step(&params, &pred.simulated, &pred, 1.0, run.rng())?;
        run.rerun(&proposal)?;

        let Some(pred) = run.predictions(observations)? else {
            return Ok(FilterUpdate::pass_through());
        };
        let q = column_moments(&proposal, None);
        let log_weights: Vec<f64> = pred
            .log_likelihoods()
            .into_iter()
            .enumerate()
            .map(|(m, ll)| {
                let theta: Vec<f64> = proposal.row(m).iter().copied().collect();
                ll + log_density(&theta, &prior) - log_density(&theta, &q)
            })
            .collect();

        let mut update = weighted_update(run, &log_weights);
        update.noise_update = Some(proposal);
        Ok(update)
    }
}

// ============================================================================
// AdaPBS
// ============================================================================

/// Adaptive particle batch smoother.
///
/// The likelihood is introduced in tempered stages. Each stage picks the
/// largest exponent increment keeping the effective sample size above
/// `ada_neff_target * members`; intermediate stages resample, jitter the
/// parameters by their weighted spread and re-run the window.
#[derive(Debug, Clone, Copy)]
pub struct AdaptiveParticleBatchSmoother {
    neff_target: f64,
}

impl AdaptiveParticleBatchSmoother {
    /// Create a new smoother targeting `neff_target` effective members per
    /// stage (as a fraction of the ensemble size).
    pub fn new(neff_target: f64) -> Self {
        Self { neff_target }
    }
}

/// Tempered log-weights, keeping zero-likelihood members at zero weight.
fn tempered(log_likelihoods: &[f64], exponent: f64) -> Vec<f64> {
    log_likelihoods
        .iter()
        .map(|&ll| {
            if ll == f64::NEG_INFINITY {
                f64::NEG_INFINITY
            } else {
                exponent * ll
            }
        })
        .collect()
}

/// Largest exponent increment in `(0, remaining]` whose weights keep an
/// effective sample size of at least `target`.
pub(crate) fn tempering_increment(log_likelihoods: &[f64], remaining: f64, target: f64) -> f64 {
    let ess = |delta: f64| effective_sample_size(&normalize_log_weights(&tempered(log_likelihoods, delta)));
    if ess(remaining) >= target {
        return remaining;
    }
    let (mut lo, mut hi) = (0.0, remaining);
    for _ in 0..TEMPERING_BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if ess(mid) >= target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    lo.max(remaining * 1e-6)
}

impl AssimilationFilter for AdaptiveParticleBatchSmoother {
    fn algorithm(&self) -> Algorithm {
        Algorithm::AdaPbs
    }

    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        let Some(mut pred) = run.predictions(observations)? else {
            return Ok(FilterUpdate::pass_through());
        };
        let n = run.members();
        let target = self.neff_target * n as f64;
        let mut exponent = 0.0;

        for stage in 1..=MAX_TEMPERING_STAGES {
            let log_likelihoods = pred.log_likelihoods();
            let remaining = 1.0 - exponent;
            let delta = if stage == MAX_TEMPERING_STAGES {
                remaining
            } else {
                tempering_increment(&log_likelihoods, remaining, target)
            };
            exponent += delta;
            let log_weights = tempered(&log_likelihoods, delta);

            if exponent >= 1.0 - 1e-12 {
                let mut update = weighted_update(run, &log_weights);
                update.iterations = stage;
                update.noise_update = Some(run.parameters());
                log::debug!("AdaPBS reached full likelihood after {} stages", stage);
                return Ok(update);
            }

            let weights = normalize_log_weights(&log_weights);
            let w: Vec<f64> = weights.iter().copied().collect();
            let spread = floored_spread(run.setup(), &column_moments(&run.parameters(), Some(w.as_slice())));
            let indices = systematic_resample(&weights, run.rng());
            run.resample(&indices)?;

            let mut params: DMatrix<f64> = run.parameters();
            for j in 0..params.ncols() {
                for m in 0..n {
                    let z: f64 = StandardNormal.sample(run.rng());
                    params[(m, j)] += spread[j] * z;
                }
            }
            run.rerun(&params)?;
            pred = run.predictions(observations)?.ok_or_else(|| {
                DaError::numerical("observations vanished between tempering stages")
            })?;
        }

        // The last stage always consumes the remaining exponent.
        Ok(FilterUpdate {
            weights: Some(DVector::from_element(n, 1.0 / n as f64)),
            iterations: MAX_TEMPERING_STAGES,
            ..FilterUpdate::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tempering_uses_full_step_when_possible() {
        let ll = vec![-0.1, -0.2, -0.15, -0.12];
        assert_eq!(tempering_increment(&ll, 1.0, 2.0), 1.0);
    }

    #[test]
    fn test_tempering_limits_degeneracy() {
        let ll: Vec<f64> = (0..20).map(|i| -50.0 * i as f64).collect();
        let delta = tempering_increment(&ll, 1.0, 10.0);
        assert!(delta > 0.0 && delta < 1.0);
        let w = normalize_log_weights(&tempered(&ll, delta));
        assert!(effective_sample_size(&w) >= 10.0 - 1e-6);
    }

    #[test]
    fn test_tempered_keeps_zero_likelihood() {
        let t = tempered(&[f64::NEG_INFINITY, -2.0], 0.0);
        assert_eq!(t[0], f64::NEG_INFINITY);
        assert_eq!(t[1], 0.0);
    }
}
