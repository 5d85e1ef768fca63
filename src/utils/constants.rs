//! Numerical constants used throughout the assimilation algorithms
//!
//! These are separate from [`RunConfig`](crate::assim::RunConfig), which holds
//! the user-tunable experiment parameters.

/// Number of floating-point spacings a value sitting exactly on a bound is
/// moved inside the bounded interval before the logit is taken.
///
/// A single spacing is not always enough: after min-max scaling the offset can
/// round back to exactly 0 or 1.
pub const BOUND_NUDGE_SPACINGS: f64 = 100.0;

/// Lower limit on the boundary nudge, relative to the width of the interval.
///
/// Guards intervals whose bound is zero, where the spacing is subnormal and the
/// scaled offset would underflow.
pub const BOUND_NUDGE_RELATIVE: f64 = f64::EPSILON;

/// Added to the sum of squared weights when computing the effective sample size
/// so a degenerate weight vector never divides by zero.
pub const NEFF_EPSILON: f64 = 1e-12;

/// Weights below this total are treated as a collapsed ensemble and reset to
/// uniform.
pub const WEIGHT_SUM_FLOOR: f64 = 1e-300;

/// Default fraction of the nominal error standard deviation used as the
/// rejuvenation spread after ensemble collapse.
pub const DEFAULT_SD_FRAC: f64 = 0.1;

/// Default effective-size fraction below which the ensemble counts as collapsed.
pub const DEFAULT_LOW_NEFF_FRACTION: f64 = 0.1;

/// Default number of ES-MDA iterations for the iterative smoothers.
pub const DEFAULT_MAX_ITERATIONS: usize = 4;

/// Default number of Metropolis samples drawn per window.
pub const DEFAULT_MCMC_SAMPLES: usize = 200;

/// Default burn-in fraction of the Metropolis chain.
pub const DEFAULT_MCMC_BURN_IN: f64 = 0.25;

/// Default scale applied to the IES posterior spread for Metropolis proposals.
pub const DEFAULT_MCMC_PROPOSAL_SCALE: f64 = 0.5;

/// Default effective-size target (fraction of members) for each AdaPBS stage.
pub const DEFAULT_ADA_NEFF_TARGET: f64 = 0.5;

/// Maximum number of tempering stages AdaPBS may take in one window.
pub const MAX_TEMPERING_STAGES: usize = 32;

/// Bisection iterations used to locate each tempering exponent.
pub const TEMPERING_BISECTION_STEPS: usize = 50;

/// Relative ridge added to the innovation covariance before inversion.
pub const GAIN_REGULARIZATION: f64 = 1e-9;

/// Initial jitter scale (relative to prior spread) used by PIES.
pub const PIES_JITTER: f64 = 0.1;
