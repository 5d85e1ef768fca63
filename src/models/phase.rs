//! Precipitation phase partitioning.
//!
//! Each helper splits a precipitation amount into `(liquid, solid)` parts from
//! the air temperature (K). Amounts keep whatever unit the caller uses.

use serde::{Deserialize, Serialize};

/// Melting point of ice (K).
pub const TM: f64 = 273.15;

/// Molecular weight of water (kg/mol).
const MW: f64 = 0.018_015_3;

/// Universal gas constant (J/mol/K).
const R: f64 = 8.314_41;

/// Sea-level pressure of the standard atmosphere (Pa).
const ONE_ATMOSPHERE: f64 = 101_300.0;

/// Pressure scale height (m).
const SCALE_HEIGHT: f64 = 8000.0;

/// Partitioning method used by the built-in model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseMethod {
    /// Linear snowfall fraction centred on 1.1 °C
    #[default]
    LinearListon,
    /// Logistic transition around 273.689 K
    LogisticThreshold,
    /// Hydrometeor temperature from the psychrometric energy balance.
    /// Needs relative humidity.
    Psychrometric,
}

/// Linear transition: all snow below -0.57 °C, all rain above 2.77 °C.
pub fn linear_liston(tair: f64, prec: f64) -> (f64, f64) {
    const CENTER_C: f64 = 1.1;
    const SLOPE: f64 = -0.3;

    let intercept = 0.5 - SLOPE * CENTER_C;
    let snow_frac = (SLOPE * (tair - TM) + intercept).clamp(0.0, 1.0);
    (prec * (1.0 - snow_frac), prec * snow_frac)
}

/// Logistic transition with a 50 % threshold at 273.689 K.
pub fn temp_threshold_logistic(tair: f64, prec: f64) -> (f64, f64) {
    const M: f64 = 0.3051;
    const THRESHOLD: f64 = 273.689;

    let tp = (tair - THRESHOLD) / M;
    // exp(tp) / (1 + exp(tp)) without overflow
    let rain_frac = 1.0 / (1.0 + (-tp).exp());
    let liquid = rain_frac * prec;
    (liquid, (prec - liquid).max(0.0))
}

/// Surface pressure (Pa) at elevation `z` (m).
pub fn pressure_from_elevation(z: f64) -> f64 {
    ONE_ATMOSPHERE * (-z / SCALE_HEIGHT).exp()
}

/// Partition from the hydrometeor temperature.
///
/// `rh` is relative humidity in percent. The hydrometeor temperature solves the
/// psychrometric balance by secant iteration; when that fails the air
/// temperature is used.
pub fn psychrometric(tair: f64, rh: f64, prec: f64) -> (f64, f64) {
    let ti = hydrometeor_temperature(tair, rh);
    let rain_frac = 1.0 / (1.0 + 2.502_86 * 0.125_006_f64.powf(ti - TM));
    (prec * rain_frac, prec * (1.0 - rain_frac))
}

/// Surface temperature (K) of a falling hydrometeor.
pub fn hydrometeor_temperature(tair: f64, rh: f64) -> f64 {
    let tc = tair - TM;
    // Latent heat of vaporisation or sublimation (J/kg)
    let latent = if tc >= 0.0 {
        1000.0 * (2501.0 - 2.361 * tc)
    } else {
        1000.0 * (2834.1 - 0.29 * tc - 0.004 * tc * tc)
    };
    let conductivity = 0.000_063 * tair + 0.006_73;
    let diffusivity = 2.06e-5 * (tair / 273.15).powf(1.75);
    let vapour_pressure = (rh / 100.0) * 611.0 * ((17.3 * tc) / (tc + 237.3)).exp();
    let vapour_density = MW * vapour_pressure / (R * tair);

    let saturation_density = |ti: f64| {
        let e = 611.0 * (17.3 * (ti - 273.0) / ((ti - 273.0) + 237.3)).exp();
        MW * e / (R * ti)
    };
    let balance = |ti: f64| {
        tair + (diffusivity / conductivity) * latent * (vapour_density - saturation_density(ti))
            - ti
    };

    match secant(balance, tair) {
        Some(ti) if ti.is_finite() => ti,
        _ => tair,
    }
}

fn secant(f: impl Fn(f64) -> f64, x0: f64) -> Option<f64> {
    const MAX_ITER: usize = 50;
    const TOL: f64 = 1.48e-8;

    let mut p0 = x0;
    let mut p1 = x0 * (1.0 + 1e-4) + 1e-4;
    let mut q0 = f(p0);
    let mut q1 = f(p1);
    for _ in 0..MAX_ITER {
        if q1 == q0 {
            return (p1 == p0).then_some(p1);
        }
        let p = p1 - q1 * (p1 - p0) / (q1 - q0);
        if (p - p1).abs() < TOL {
            return Some(p);
        }
        p0 = p1;
        q0 = q1;
        p1 = p;
        q1 = f(p1);
    }
    None
}
