//! The `utils` module provides a collection of utility functions and common
//! definitions used across the `railsub` application.
//!
//! It centralizes the error taxonomy shared by every layer, the sink that
//! failures are reported to, and logging initialization.

pub mod error;
pub mod logging;
pub mod report;

#[cfg(test)]
mod tests;
