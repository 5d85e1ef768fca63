//! Bounded logit-normal transform pair.
//!
//! [`glogit`] maps a value bounded in `(lo, hi)` to the real line by min-max
//! scaling to `(0, 1)` and applying the logit; [`gexpit`] is its inverse. A
//! normally distributed variable pushed through `gexpit` is logit-normal and
//! can never leave its physical bounds.
//!
//! A value sitting exactly on a bound would give an infinite logit. Such
//! entries (and only those) are moved inside the interval by a small multiple of
//! the floating-point spacing at that magnitude before transforming.

use crate::utils::constants::{BOUND_NUDGE_RELATIVE, BOUND_NUDGE_SPACINGS};

/// Distance from `x` to the next representable value away from zero.
#[inline]
pub fn spacing(x: f64) -> f64 {
    let a = x.abs();
    if !a.is_finite() {
        return f64::NAN;
    }
    f64::from_bits(a.to_bits() + 1) - a
}

/// Offset applied to a value sitting exactly on a bound of `(lo, hi)`.
#[inline]
fn nudge(bound: f64, lo: f64, hi: f64) -> f64 {
    (spacing(bound) * BOUND_NUDGE_SPACINGS).max((hi - lo) * BOUND_NUDGE_RELATIVE)
}

/// Move `x` strictly inside `(lo, hi)` if it equals one of the bounds.
#[inline]
pub fn nudge_inside(x: f64, lo: f64, hi: f64) -> f64 {
    if x == lo {
        lo + nudge(lo, lo, hi)
    } else if x == hi {
        hi - nudge(hi, lo, hi)
    } else {
        x
    }
}

/// Numerically stable logistic function.
#[inline]
pub fn expit(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Logit of a probability in `(0, 1)`.
#[inline]
pub fn logit(p: f64) -> f64 {
    p.ln() - (-p).ln_1p()
}

/// Generalized logit: bounded `(lo, hi)` value to the real line.
pub fn glogit(x: f64, lo: f64, hi: f64) -> f64 {
    let x = nudge_inside(x, lo, hi);
    logit((x - lo) / (hi - lo))
}

/// Generalized expit: real line to `(lo, hi)`.
///
/// Saturated results that round onto a bound are pulled back inside so the
/// output can always be fed to [`glogit`] again.
pub fn gexpit(xt: f64, lo: f64, hi: f64) -> f64 {
    let x = (hi - lo) * expit(xt) + lo;
    nudge_inside(x.clamp(lo, hi), lo, hi)
}

/// [`glogit`] applied element-wise.
pub fn glogit_slice(values: &[f64], lo: f64, hi: f64) -> Vec<f64> {
    values.iter().map(|&x| glogit(x, lo, hi)).collect()
}

/// [`gexpit`] applied element-wise.
pub fn gexpit_slice(values: &[f64], lo: f64, hi: f64) -> Vec<f64> {
    values.iter().map(|&x| gexpit(x, lo, hi)).collect()
}
