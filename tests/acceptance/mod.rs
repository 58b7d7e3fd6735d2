//! Acceptance test modules.

pub mod common;
mod exclusivity;
mod fairness;
mod fluid_scenario;
mod health_scenario;
mod write_verification;
