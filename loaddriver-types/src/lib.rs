//! Shared data model of the load driver.
//!
//! This crate contains the types exchanged between the scheduler, its workers and the consumers
//! of measurement data:
//!
//!  - [`task`] defines the immutable task hierarchy a benchmark run executes.
//!  - [`sample`] defines the per-operation timing records produced by clients.
//!  - [`phase`] defines the run-level state machine and the messages workers and the coordinator
//!    exchange to advance it.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod phase;
pub mod sample;
pub mod task;

pub use phase::{AbortReason, PhaseMessage, RunState};
pub use sample::{Outcome, Phase, RunId, Sample, SampleBatch, WorkerId};
pub use task::{LeafTask, OnError, PacingMode, Params, TaskNode, TaskTreeError, Throughput};
