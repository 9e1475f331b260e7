//! Command line front end of the load driver.
//!
//! Loads a benchmark track from YAML, runs it with [`loaddriver_core::run_local`] against a
//! simulated target, and prints a latency summary of the measurement phase.

pub mod cli;
pub mod config;
pub mod driver;
pub mod observability;
pub mod report;
pub mod target;
pub mod track;
