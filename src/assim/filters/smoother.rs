//! Ensemble smoothers: ES, IES (ES-MDA) and PIES.
//!
//! Parameters are updated in the transformed (Gaussian) space with a
//! Kalman-type gain estimated from the ensemble:
//!
//! ```text
//! K = C_θd (C_dd + α R)^-1
//! θ_i ← θ_i + K (y + √α ε_i - d_i),   ε_i ~ N(0, R)
//! ```
//!
//! ES applies one step with `α = 1`. IES repeats the step `N` times with
//! `α = N`, re-running the window after each step. PIES additionally jitters
//! the parameters before each re-run, with a spread that decays per iteration.

use nalgebra::DMatrix;
use rand_distr::{Distribution, StandardNormal};

use super::{column_moments, floored_spread, AssimilationFilter, FilterUpdate, Predictions, WindowRun};
use crate::assim::config::Algorithm;
use crate::assim::errors::{DaError, DaResult};
use crate::assim::types::ObservationSeries;
use crate::common::rng::DrawRng;
use crate::utils::constants::{GAIN_REGULARIZATION, PIES_JITTER};

/// Column-centred copy of a matrix.
fn anomalies(values: &DMatrix<f64>) -> DMatrix<f64> {
    let mut centred = values.clone();
    for j in 0..values.ncols() {
        let mean = values.column(j).mean();
        centred.column_mut(j).add_scalar_mut(-mean);
    }
    centred
}

/// One stochastic ensemble-smoother update of `params` (`members x variables`)
/// given the members' simulated observations (`members x entries`).
///
/// `inflation` scales the observation error covariance (ES-MDA).
pub fn ensemble_smoother_step(
    params: &DMatrix<f64>,
    simulated: &DMatrix<f64>,
    pred: &Predictions,
    inflation: f64,
    rng: &mut DrawRng,
) -> DaResult<DMatrix<f64>> {
    let n = params.nrows();
    let m = pred.len();
    if simulated.nrows() != n || simulated.ncols() != m {
        return Err(DaError::DimensionMismatch {
            expected: n * m,
            actual: simulated.nrows() * simulated.ncols(),
            context: "simulated observations".to_string(),
        });
    }
    if n < 2 {
        return Ok(params.clone());
    }
    if simulated.iter().any(|v| !v.is_finite()) {
        return Err(DaError::numerical("non-finite simulated observation in smoother update"));
    }

    let scale = 1.0 / (n as f64 - 1.0);
    let a = anomalies(params);
    let b = anomalies(simulated);
    let c_td = a.transpose() * &b * scale;
    let mut s = b.transpose() * &b * scale;
    for k in 0..m {
        let e = pred.errors[k];
        s[(k, k)] += inflation * e * e;
    }
    let ridge = GAIN_REGULARIZATION * (s.trace() / m as f64).max(f64::MIN_POSITIVE);
    for k in 0..m {
        s[(k, k)] += ridge;
    }

    // gain^T = S^-1 C_dθ
    let gain_t = match s.clone().cholesky() {
        Some(chol) => chol.solve(&c_td.transpose()),
        None => {
            let inv = s.try_inverse().ok_or_else(|| {
                DaError::numerical("innovation covariance is singular")
            })?;
            inv * c_td.transpose()
        }
    };

    let sqrt_inflation = inflation.sqrt();
    let mut updated = params.clone();
    for i in 0..n {
        let innovation = DMatrix::from_fn(1, m, |_, k| {
            let z: f64 = StandardNormal.sample(rng);
            pred.observed[k] + sqrt_inflation * pred.errors[k] * z - simulated[(i, k)]
        });
        let delta = innovation * &gain_t;
        for j in 0..params.ncols() {
            updated[(i, j)] += delta[(0, j)];
        }
    }
    if updated.iter().any(|v| !v.is_finite()) {
        return Err(DaError::numerical("smoother update produced non-finite parameters"));
    }
    Ok(updated)
}

/// ES, IES or PIES.
#[derive(Debug, Clone, Copy)]
pub struct EnsembleSmoother {
    algorithm: Algorithm,
    iterations: usize,
    jitter: Option<f64>,
}

impl EnsembleSmoother {
    /// Single-step ensemble smoother.
    pub fn es() -> Self {
        Self {
            algorithm: Algorithm::Es,
            iterations: 1,
            jitter: None,
        }
    }

    /// ES-MDA with `iterations` steps.
    pub fn ies(iterations: usize) -> Self {
        Self {
            algorithm: Algorithm::Ies,
            iterations: iterations.max(1),
            jitter: None,
        }
    }

    /// ES-MDA with decaying parameter jitter.
    pub fn pies(iterations: usize) -> Self {
        Self {
            algorithm: Algorithm::Pies,
            iterations: iterations.max(1),
            jitter: Some(PIES_JITTER),
        }
    }

    /// Number of smoother steps.
    pub fn iterations(&self) -> usize {
        self.iterations
    }
}

impl AssimilationFilter for EnsembleSmoother {
    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    fn update(
        &self,
        run: &mut WindowRun<'_, '_>,
        observations: &ObservationSeries,
    ) -> DaResult<FilterUpdate> {
        let Some(mut pred) = run.predictions(observations)? else {
            return Ok(FilterUpdate::pass_through());
        };
        let inflation = self.iterations as f64;
        let mut params = run.parameters();
        let prior_spread = floored_spread(run.setup(), &column_moments(&params, None));

        for i in 0..self.iterations {
            params = ensemble_smoother_step(&params, &pred.simulated, &pred, inflation, run.rng())?;
            if let Some(jitter) = self.jitter {
                let decay = jitter / (i + 1) as f64;
                for j in 0..params.ncols() {
                    for m in 0..params.nrows() {
                        let z: f64 = StandardNormal.sample(run.rng());
                        params[(m, j)] += decay * prior_spread[j] * z;
                    }
                }
            }
            run.rerun(&params)?;
            if i + 1 < self.iterations {
                pred = run.predictions(observations)?.ok_or_else(|| {
                    DaError::numerical("observations vanished between smoother iterations")
                })?;
            }
        }

        Ok(FilterUpdate {
            noise_update: Some(params),
            effective_size: Some(run.members() as f64),
            iterations: self.iterations,
            ..FilterUpdate::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DVector;

    /// Linear toy problem: d = 2 θ, y = 4, small observation error.
    fn linear_case(n: usize) -> (DMatrix<f64>, DMatrix<f64>, Predictions) {
        let params = DMatrix::from_fn(n, 1, |i, _| -1.0 + 2.0 * i as f64 / (n - 1) as f64);
        let simulated = params.map(|t| 2.0 * t);
        let pred = Predictions {
            entries: vec![(0, 0)],
            observed: DVector::from_vec(vec![4.0]),
            errors: DVector::from_vec(vec![0.1]),
            simulated: simulated.clone(),
        };
        (params, simulated, pred)
    }

    #[test]
    fn test_smoother_step_moves_towards_observation() {
        let (params, simulated, pred) = linear_case(50);
        let mut rng = DrawRng::new(Some(1));
        let updated = ensemble_smoother_step(&params, &simulated, &pred, 1.0, &mut rng).unwrap();
        let mean = updated.column(0).mean();
        assert!((mean - 2.0).abs() < 0.2, "posterior mean {}", mean);
        assert!(updated.column(0).variance() < params.column(0).variance());
    }

    #[test]
    fn test_single_member_is_unchanged() {
        let params = DMatrix::from_element(1, 2, 0.3);
        let pred = Predictions {
            entries: vec![(0, 0)],
            observed: DVector::from_vec(vec![1.0]),
            errors: DVector::from_vec(vec![1.0]),
            simulated: DMatrix::from_element(1, 1, 0.0),
        };
        let mut rng = DrawRng::new(Some(1));
        let out = ensemble_smoother_step(&params, &pred.simulated, &pred, 1.0, &mut rng).unwrap();
        assert_eq!(out, params);
    }

    #[test]
    fn test_non_finite_simulation_rejected() {
        let (params, mut simulated, pred) = linear_case(5);
        simulated[(2, 0)] = f64::NAN;
        let mut rng = DrawRng::new(Some(1));
        let err = ensemble_smoother_step(&params, &simulated, &pred, 1.0, &mut rng).unwrap_err();
        assert!(matches!(err, DaError::NumericalInstability { .. }));
    }

    #[test]
    fn test_constructors() {
        assert_eq!(EnsembleSmoother::es().iterations(), 1);
        assert_eq!(EnsembleSmoother::ies(0).iterations(), 1);
        assert_eq!(EnsembleSmoother::pies(3).algorithm(), Algorithm::Pies);
    }
}
