//! Cost optimization operator
//!
//! Runs the reconciliation controller behind a leader lease and serves the
//! health, metrics and policy API.

pub mod api;
pub mod bootstrap;
pub mod config;
