//! Shared scenario and collaborator fixtures for the integration tests.

pub mod fixtures;
