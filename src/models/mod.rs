//! Built-in snow model.
//!
//! [`DegreeDayModel`] implements [`ModelAdapter`](crate::assim::ModelAdapter)
//! so a cell can be assimilated end to end without an external model.
//! [`phase`] holds the precipitation partitioning helpers it uses.

pub mod degree_day;
pub mod phase;

pub use degree_day::{DegreeDayModel, DegreeDayParams};
pub use phase::{
    hydrometeor_temperature, linear_liston, pressure_from_elevation, psychrometric,
    temp_threshold_logistic, PhaseMethod,
};
