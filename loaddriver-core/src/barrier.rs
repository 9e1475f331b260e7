//! Readiness bookkeeping for a single phase transition.

use std::collections::BTreeSet;

use loaddriver_types::{AbortReason, RunState, WorkerId};

/// Tracks which workers are ready for a state.
///
/// The barrier is complete once every expected worker has arrived. Repeated arrivals of the same
/// worker are ignored.
#[derive(Clone, Debug)]
pub struct PhaseBarrier {
    state: RunState,
    expected: BTreeSet<WorkerId>,
    arrived: BTreeSet<WorkerId>,
}

impl PhaseBarrier {
    /// Creates a barrier guarding the transition into `state`.
    pub fn new(state: RunState, workers: impl IntoIterator<Item = WorkerId>) -> Self {
        Self {
            state,
            expected: workers.into_iter().collect(),
            arrived: BTreeSet::new(),
        }
    }

    /// Returns the state this barrier guards.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Records that `worker` is ready.
    ///
    /// Returns whether the barrier is complete. Arrivals of unknown workers violate the protocol.
    pub fn arrive(&mut self, worker: WorkerId) -> Result<bool, AbortReason> {
        if !self.expected.contains(&worker) {
            return Err(AbortReason::Protocol {
                message: format!("{worker} is not registered for this run"),
            });
        }

        self.arrived.insert(worker);
        Ok(self.is_complete())
    }

    /// Returns `true` once all expected workers have arrived.
    pub fn is_complete(&self) -> bool {
        self.arrived.len() == self.expected.len()
    }

    /// Returns the workers that have not arrived yet.
    pub fn missing(&self) -> Vec<WorkerId> {
        self.expected.difference(&self.arrived).copied().collect()
    }
}
