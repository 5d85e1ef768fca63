//! Common utilities shared by the assimilation components.
//!
//! This module contains the seeded random number generator, the bounded
//! logit/expit transform pair, and the weighted ensemble statistics used by the
//! filters and the result accumulator.

pub mod rng;
pub mod stats;
pub mod transforms;
