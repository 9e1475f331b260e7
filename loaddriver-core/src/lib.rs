//! The scheduling and execution engine of the load driver.
//!
//! This crate decides when each simulated client issues its next operation, walks the task tree
//! of a benchmark, and captures the timing of every operation without coordinated omission:
//! latency is always measured from the time an operation *should* have been issued, so that
//! queueing delay shows up in the results instead of being absorbed.
//!
//! The main building blocks are, from the bottom up:
//!
//!  - [`Pacer`](pacer::Pacer): ideal issue times for a target throughput.
//!  - [`Schedule`](schedule::Schedule): the bounded, lazy sequence of operations of one client.
//!  - [`ClientExecutor`](executor::ClientExecutor): realizes a schedule against a
//!    [`WireClient`](client::WireClient) and emits samples.
//!  - [`TaskRunner`](runner::TaskRunner): interprets sequential and parallel task groups.
//!  - [`PhaseCoordinator`](coordinator::PhaseCoordinator): synchronizes workers through warmup,
//!    measurement and completion, and propagates aborts.
//!  - [`SampleSink`](sink::SampleSink): buffers samples for a [`MetricsStore`](sink::MetricsStore)
//!    with backpressure.
//!
//! [`run_local`] ties everything together for workers running in the same process.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod abort;
pub mod barrier;
pub mod client;
pub mod clock;
mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod gate;
pub mod pacer;
pub mod params;
pub mod runner;
pub mod schedule;
pub mod sink;
pub mod transport;
pub mod worker;

pub use cluster::{Collaborators, RunReport, run_local};
