//! Crate-wide utilities.

pub mod constants;
