//! Assimilation window planning.
//!
//! Window boundaries always start at 0, increase strictly and end at the
//! horizon. The sequential particle filter closes a window one step after every
//! observed step; batch algorithms use fixed-length windows, or a single window
//! spanning the whole horizon.

use super::config::{Algorithm, RunSetup};
use super::errors::{DaError, DaResult};
use super::types::AssimilationWindow;

/// Splits a simulation horizon into assimilation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindowPlanner {
    algorithm: Algorithm,
    batch_window_steps: Option<usize>,
}

impl TimeWindowPlanner {
    /// Create a new planner for the configured algorithm.
    pub fn new(setup: &RunSetup) -> Self {
        Self {
            algorithm: setup.algorithm(),
            batch_window_steps: setup.config().batch_window_steps,
        }
    }

    /// Window boundaries for a horizon of `horizon` steps.
    ///
    /// `observed[t]` is true when any observation exists at step `t`. Its length
    /// must equal the horizon.
    pub fn boundaries(&self, observed: &[bool], horizon: usize) -> DaResult<Vec<usize>> {
        if observed.len() != horizon {
            return Err(DaError::configuration(format!(
                "observations cover {} steps but forcing covers {}",
                observed.len(),
                horizon
            )));
        }
        if horizon == 0 {
            return Err(DaError::configuration("empty simulation horizon"));
        }

        let mut bounds = vec![0];
        if self.algorithm.is_sequential() {
            bounds.extend(
                observed
                    .iter()
                    .enumerate()
                    .filter(|(_, obs)| **obs)
                    .map(|(t, _)| t + 1),
            );
        } else if let Some(step) = self.batch_window_steps {
            bounds.extend((1..).map(|k| k * step).take_while(|&b| b < horizon));
        }
        if bounds.last() != Some(&horizon) {
            bounds.push(horizon);
        }
        Ok(bounds)
    }

    /// Windows for a horizon, in order.
    pub fn plan(&self, observed: &[bool], horizon: usize) -> DaResult<Vec<AssimilationWindow>> {
        Ok(windows_from_boundaries(&self.boundaries(observed, horizon)?))
    }

    /// One window covering the whole horizon (reconstruction runs).
    pub fn single(horizon: usize) -> Vec<AssimilationWindow> {
        vec![AssimilationWindow::new(0, 0, horizon)]
    }
}

/// Pair consecutive boundaries into windows.
pub fn windows_from_boundaries(bounds: &[usize]) -> Vec<AssimilationWindow> {
    bounds
        .windows(2)
        .enumerate()
        .map(|(i, b)| AssimilationWindow::new(i, b[0], b[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner(algorithm: Algorithm, batch: Option<usize>) -> TimeWindowPlanner {
        TimeWindowPlanner {
            algorithm,
            batch_window_steps: batch,
        }
    }

    fn is_valid(bounds: &[usize], horizon: usize) -> bool {
        bounds.first() == Some(&0)
            && bounds.last() == Some(&horizon)
            && bounds.windows(2).all(|w| w[0] < w[1])
    }

    #[test]
    fn test_sequential_windows_close_after_observations() {
        let mut observed = vec![false; 10];
        observed[2] = true;
        observed[6] = true;
        let b = planner(Algorithm::Pf, None).boundaries(&observed, 10).unwrap();
        assert_eq!(b, vec![0, 3, 7, 10]);
    }

    #[test]
    fn test_observation_on_last_step() {
        let mut observed = vec![false; 5];
        observed[4] = true;
        let b = planner(Algorithm::Pf, None).boundaries(&observed, 5).unwrap();
        assert_eq!(b, vec![0, 5]);
    }

    #[test]
    fn test_no_observations_single_window() {
        let b = planner(Algorithm::Pf, None).boundaries(&[false; 8], 8).unwrap();
        assert_eq!(b, vec![0, 8]);
        let b = planner(Algorithm::Pbs, None).boundaries(&[true; 8], 8).unwrap();
        assert_eq!(b, vec![0, 8]);
    }

    #[test]
    fn test_fixed_batch_windows() {
        let b = planner(Algorithm::Es, Some(3)).boundaries(&[false; 10], 10).unwrap();
        assert_eq!(b, vec![0, 3, 6, 9, 10]);
        let b = planner(Algorithm::Es, Some(5)).boundaries(&[false; 10], 10).unwrap();
        assert_eq!(b, vec![0, 5, 10]);
    }

    #[test]
    fn test_boundaries_always_valid() {
        for horizon in 1..30 {
            let observed: Vec<bool> = (0..horizon).map(|t| t % 3 == 1 || t % 7 == 0).collect();
            for p in [
                planner(Algorithm::Pf, None),
                planner(Algorithm::Pbs, Some(4)),
                planner(Algorithm::Ies, None),
            ] {
                let b = p.boundaries(&observed, horizon).unwrap();
                assert!(is_valid(&b, horizon), "{:?} for horizon {}", b, horizon);
            }
        }
    }

    #[test]
    fn test_length_mismatch_is_configuration_error() {
        let err = planner(Algorithm::Pbs, None)
            .boundaries(&[false; 4], 5)
            .unwrap_err();
        assert!(matches!(err, DaError::Configuration { .. }));
    }

    #[test]
    fn test_plan_indexes_windows() {
        let windows = planner(Algorithm::Es, Some(4)).plan(&[false; 9], 9).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[2], AssimilationWindow::new(2, 8, 9));
        assert_eq!(TimeWindowPlanner::single(9)[0].len(), 9);
    }
}
