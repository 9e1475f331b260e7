//! The run-level state machine and its wire messages.
//!
//! A run advances through [`RunState::NotStarted`], [`RunState::Warmup`],
//! [`RunState::Measurement`] and [`RunState::Complete`]. Every transition is guarded by a barrier:
//! the coordinator only advances once every worker has reported [`PhaseMessage::Ready`] for the
//! next state. [`RunState::Aborted`] is terminal and reachable from every non-terminal state.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sample::WorkerId;

/// State of a benchmark run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Workers are being set up.
    NotStarted,
    /// Tasks are running and clients are still warming up.
    Warmup,
    /// All workers have entered the measurement window.
    Measurement,
    /// All workers have finished their task trees.
    Complete,
    /// The run was aborted.
    Aborted,
}

impl RunState {
    /// Returns the state following this one in a regular run.
    pub fn next(self) -> Option<RunState> {
        match self {
            RunState::NotStarted => Some(RunState::Warmup),
            RunState::Warmup => Some(RunState::Measurement),
            RunState::Measurement => Some(RunState::Complete),
            RunState::Complete | RunState::Aborted => None,
        }
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Aborted)
    }

    /// Returns `true` if a regular run has advanced to or past `target`.
    ///
    /// An aborted run has not reached any state.
    pub fn has_reached(self, target: RunState) -> bool {
        self != RunState::Aborted && target != RunState::Aborted && self >= target
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::NotStarted => "not_started",
            RunState::Warmup => "warmup",
            RunState::Measurement => "measurement",
            RunState::Complete => "complete",
            RunState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Why a run was aborted.
#[derive(Clone, Debug, PartialEq, Eq, Error, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A task hit a fatal error.
    #[error("task `{task}` failed: {message}")]
    TaskFailed {
        /// The failed task.
        task: String,
        /// Description of the fatal error.
        message: String,
    },

    /// The task tree or its parameter sources are invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the problem.
        message: String,
    },

    /// The run was cancelled by the user.
    #[error("cancelled by user")]
    Cancelled,

    /// Not all workers reached a barrier in time.
    #[error("timed out waiting for {} worker(s) to reach {state}", .missing.len())]
    BarrierTimeout {
        /// The state the barrier guards.
        state: RunState,
        /// Workers that did not report readiness.
        missing: Vec<WorkerId>,
    },

    /// The phase transport to a worker or the coordinator failed.
    #[error("phase transport failed: {message}")]
    Unreachable {
        /// Description of the transport failure.
        message: String,
    },

    /// Samples could not be handed to the metrics store.
    #[error("sample sink failed: {message}")]
    SinkFailed {
        /// Description of the sink failure.
        message: String,
    },

    /// A participant violated the phase protocol.
    #[error("protocol violation: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },
}

/// Messages exchanged between workers and the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseMessage {
    /// Sent by a worker: it is ready to enter `state`.
    Ready {
        /// The reporting worker.
        worker: WorkerId,
        /// The state the worker is ready for.
        state: RunState,
    },
    /// Sent periodically by a worker while it is alive, whatever state it is in.
    Heartbeat {
        /// The reporting worker.
        worker: WorkerId,
    },
    /// Sent by the coordinator: all workers are ready and the run has entered `state`.
    Advance {
        /// The new state of the run.
        state: RunState,
    },
    /// Sent by either side: the run is aborted.
    Abort {
        /// Why the run is aborted.
        reason: AbortReason,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_advance_in_order() {
        let mut state = RunState::NotStarted;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }

        assert_eq!(
            visited,
            [
                RunState::NotStarted,
                RunState::Warmup,
                RunState::Measurement,
                RunState::Complete,
            ]
        );
        assert_eq!(RunState::Aborted.next(), None);
    }

    #[test]
    fn aborted_reaches_nothing() {
        assert!(RunState::Complete.has_reached(RunState::Measurement));
        assert!(RunState::Measurement.has_reached(RunState::Measurement));
        assert!(!RunState::Warmup.has_reached(RunState::Measurement));
        assert!(!RunState::Aborted.has_reached(RunState::Warmup));
        assert!(!RunState::Complete.has_reached(RunState::Aborted));
    }

    #[test]
    fn messages_serialize_tagged() {
        let message = PhaseMessage::Abort {
            reason: AbortReason::BarrierTimeout {
                state: RunState::Measurement,
                missing: vec![WorkerId(1)],
            },
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "abort");
        assert_eq!(json["reason"]["kind"], "barrier_timeout");
        assert_eq!(json["reason"]["state"], "measurement");

        let parsed: PhaseMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);

        let heartbeat = PhaseMessage::Heartbeat {
            worker: WorkerId(3),
        };
        let json = serde_json::to_value(&heartbeat).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(serde_json::from_value::<PhaseMessage>(json).unwrap(), heartbeat);
    }
}
