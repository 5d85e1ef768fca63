//! Degree-day snow model.
//!
//! A single-layer snowpack driven by air temperature and precipitation:
//! snowfall from the configured phase partitioning, temperature-index melt and
//! exponential densification towards a cold or melting maximum density.
//!
//! Forcing columns: `Tair` (K), `Prec` (kg m-2 per step) and, for the
//! psychrometric phase method, `RH` (%). Outputs: `SWE` (kg m-2) and `HS` (m).
//! The state vector is `[swe, depth]`.

use std::collections::HashMap;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use super::phase::{linear_liston, psychrometric, temp_threshold_logistic, PhaseMethod, TM};
use crate::assim::errors::{DaError, DaResult};
use crate::assim::traits::ModelAdapter;
use crate::assim::types::{CellIndex, ForcingTable, ModelState, OutputTable};

/// SWE below which the pack is removed (kg m-2).
const MIN_SWE: f64 = 1e-9;

/// Tunable parameters of [`DegreeDayModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegreeDayParams {
    /// Length of one forcing step (h)
    pub step_hours: f64,
    /// Melt per degree above the threshold (kg m-2 K-1 day-1)
    pub melt_factor: f64,
    /// Air temperature above which melt starts (K)
    pub melt_threshold: f64,
    /// Fresh snow density (kg m-3)
    pub fresh_density: f64,
    /// Maximum density of cold snow (kg m-3)
    pub max_cold_density: f64,
    /// Maximum density of melting snow (kg m-3)
    pub max_melt_density: f64,
    /// Densification time scale (h)
    pub compaction_hours: f64,
    /// Rain/snow partitioning
    pub phase: PhaseMethod,
}

impl Default for DegreeDayParams {
    fn default() -> Self {
        Self {
            step_hours: 24.0,
            melt_factor: 3.0,
            melt_threshold: TM,
            fresh_density: 100.0,
            max_cold_density: 300.0,
            max_melt_density: 500.0,
            compaction_hours: 200.0,
            phase: PhaseMethod::LinearListon,
        }
    }
}

/// Built-in [`ModelAdapter`].
///
/// Forcing is registered per cell; cells without their own table use the
/// fallback table when one is set.
#[derive(Debug, Clone, Default)]
pub struct DegreeDayModel {
    params: DegreeDayParams,
    forcing: HashMap<CellIndex, ForcingTable>,
    fallback: Option<ForcingTable>,
}

impl DegreeDayModel {
    /// Create a new model with the given parameters and no forcing.
    pub fn new(params: DegreeDayParams) -> Self {
        Self {
            params,
            ..Self::default()
        }
    }

    /// Register the forcing of one cell.
    pub fn with_forcing(mut self, cell: CellIndex, forcing: ForcingTable) -> Self {
        self.forcing.insert(cell, forcing);
        self
    }

    /// Forcing used for every cell without its own table.
    pub fn with_fallback_forcing(mut self, forcing: ForcingTable) -> Self {
        self.fallback = Some(forcing);
        self
    }

    /// Model parameters.
    pub fn params(&self) -> &DegreeDayParams {
        &self.params
    }

    fn partition(&self, tair: f64, prec: f64, rh: Option<f64>) -> (f64, f64) {
        match (self.params.phase, rh) {
            (PhaseMethod::LinearListon, _) => linear_liston(tair, prec),
            (PhaseMethod::LogisticThreshold, _) => temp_threshold_logistic(tair, prec),
            (PhaseMethod::Psychrometric, Some(rh)) => psychrometric(tair, rh, prec),
            (PhaseMethod::Psychrometric, None) => linear_liston(tair, prec),
        }
    }

    /// Advance `[swe, depth]` by one step and return it.
    fn step(&self, swe: f64, depth: f64, tair: f64, prec: f64, rh: Option<f64>) -> (f64, f64) {
        let p = &self.params;
        let (mut swe, mut depth) = (swe, depth);

        if swe > 0.0 && depth > 0.0 {
            let target = if tair >= TM {
                p.max_melt_density
            } else {
                p.max_cold_density
            };
            let mut rho = swe / depth;
            if rho < target {
                rho = target + (rho - target) * (-p.step_hours / p.compaction_hours).exp();
                depth = swe / rho;
            }
        }

        let (_, snowfall) = self.partition(tair, prec.max(0.0), rh);
        swe += snowfall;
        depth += snowfall / p.fresh_density;

        let potential = p.melt_factor * (tair - p.melt_threshold) * p.step_hours / 24.0;
        let melt = potential.max(0.0).min(swe);
        if melt > 0.0 {
            depth *= 1.0 - melt / swe;
            swe -= melt;
        }

        if swe < MIN_SWE {
            (0.0, 0.0)
        } else {
            (swe, depth)
        }
    }
}

impl ModelAdapter for DegreeDayModel {
    fn name(&self) -> &'static str {
        "degree_day"
    }

    fn forcing_table(&self, cell: CellIndex) -> DaResult<ForcingTable> {
        self.forcing
            .get(&cell)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| DaError::data_quality(format!("no forcing for cell {}", cell.tag())))
    }

    fn output_variables(&self) -> Vec<String> {
        vec!["SWE".to_string(), "HS".to_string()]
    }

    fn initial_state(&self, _cell: CellIndex) -> ModelState {
        ModelState::zeros(2)
    }

    fn advance(&self, state: &mut ModelState, forcing: &ForcingTable) -> DaResult<OutputTable> {
        if state.len() != 2 {
            return Err(DaError::DimensionMismatch {
                expected: 2,
                actual: state.len(),
                context: "degree-day state".to_string(),
            });
        }
        let column = |name: &str| {
            forcing
                .column_index(name)
                .ok_or_else(|| DaError::configuration(format!("forcing has no '{}' column", name)))
        };
        let tair_col = column("Tair")?;
        let prec_col = column("Prec")?;
        let rh_col = match self.params.phase {
            PhaseMethod::Psychrometric => Some(column("RH")?),
            _ => None,
        };

        let values = forcing.values();
        let steps = forcing.steps();
        let mut out = DMatrix::zeros(steps, 2);
        let (mut swe, mut depth) = (state[0], state[1]);
        for t in 0..steps {
            let tair = values[(t, tair_col)];
            let prec = values[(t, prec_col)];
            let rh = rh_col.map(|j| values[(t, j)]);
            if !tair.is_finite() || !prec.is_finite() || rh.is_some_and(|v| !v.is_finite()) {
                return Err(DaError::data_quality(format!(
                    "non-finite model input at step {}",
                    t
                )));
            }
            (swe, depth) = self.step(swe, depth, tair, prec, rh);
            out[(t, 0)] = swe;
            out[(t, 1)] = depth;
        }
        state[0] = swe;
        state[1] = depth;
        OutputTable::new(self.output_variables(), out)
    }
}
