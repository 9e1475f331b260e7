//! The run-level state machine.
//!
//! The [`PhaseCoordinator`] advances a run through warmup, measurement and completion. Each
//! transition waits for all workers to report readiness through a [`PhaseBarrier`]. Workers send
//! heartbeats in every phase, so past the initial barrier a wait only times out on workers that
//! went silent.
//!
//! The coordinator is the single place that decides to abort a run: fatal errors reported by
//! workers, barrier timeouts, transport failures and user cancellation all end in an abort
//! broadcast to every worker.

use std::collections::BTreeMap;
use std::time::SystemTime;

use loaddriver_types::{AbortReason, PhaseMessage, RunState, WorkerId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::barrier::PhaseBarrier;
use crate::clock::RunClock;
use crate::config::CoordinatorConfig;
use crate::transport::CoordinatorTransport;

/// Final result of a coordinated run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConclusion {
    /// Final state, either [`RunState::Complete`] or [`RunState::Aborted`].
    pub state: RunState,
    /// Why the run was aborted.
    pub reason: Option<AbortReason>,
    /// Every state the run entered with the time it was entered.
    pub transitions: Vec<(RunState, SystemTime)>,
}

impl RunConclusion {
    /// Returns `true` if the run went through all phases.
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }

    /// Returns the time at which the run entered `state`.
    pub fn entered_at(&self, state: RunState) -> Option<SystemTime> {
        self.transitions
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, at)| *at)
    }
}

/// Synchronizes the workers of a run.
#[derive(Debug)]
pub struct PhaseCoordinator<T> {
    transport: T,
    workers: Vec<WorkerId>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
    clock: RunClock,
    transitions: Vec<(RunState, SystemTime)>,
    last_seen: BTreeMap<WorkerId, Instant>,
}

impl<T: CoordinatorTransport> PhaseCoordinator<T> {
    /// Creates a coordinator for workers `0..workers`.
    pub fn new(transport: T, workers: usize, config: CoordinatorConfig) -> Self {
        Self {
            transport,
            workers: (0..workers).map(WorkerId).collect(),
            config,
            cancel: CancellationToken::new(),
            clock: RunClock::now(),
            transitions: Vec::new(),
            last_seen: BTreeMap::new(),
        }
    }

    /// Aborts the run with [`AbortReason::Cancelled`] once `cancel` is cancelled.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drives the run to completion or abort.
    pub async fn run(mut self) -> RunConclusion {
        self.enter(RunState::NotStarted);
        let now = Instant::now();
        self.last_seen = self.workers.iter().map(|w| (*w, now)).collect();
        let mut state = RunState::NotStarted;

        while let Some(next) = state.next() {
            tracing::debug!(state = %next, "waiting for workers");
            if let Err(reason) = self.await_barrier(next).await {
                return self.abort(reason).await;
            }

            let advance = PhaseMessage::Advance { state: next };
            if let Err(err) = self.transport.broadcast(advance).await {
                let reason = AbortReason::Unreachable {
                    message: err.to_string(),
                };
                return self.abort(reason).await;
            }

            tracing::info!(state = %next, "run advanced");
            self.enter(next);
            state = next;
        }

        RunConclusion {
            state,
            reason: None,
            transitions: self.transitions,
        }
    }

    async fn await_barrier(&mut self, target: RunState) -> Result<(), AbortReason> {
        let mut barrier = PhaseBarrier::new(target, self.workers.iter().copied());
        let started = Instant::now();

        while !barrier.is_complete() {
            // Worker setup is bounded as a whole. Later phases may take arbitrarily long, so
            // they only time out on workers that stopped sending heartbeats.
            let missing = barrier.missing();
            let timer_start = match target {
                RunState::Warmup => started,
                _ => self.last_heard(&missing),
            };
            let deadline = timer_start.checked_add(self.config.barrier_timeout);
            let timeout = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let (worker, message) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(AbortReason::Cancelled),
                _ = timeout => {
                    let missing = match target {
                        RunState::Warmup => missing,
                        _ => self.silent(&missing),
                    };
                    return Err(AbortReason::BarrierTimeout {
                        state: target,
                        missing,
                    });
                }
                received = self.transport.recv() => received.map_err(|err| {
                    AbortReason::Unreachable {
                        message: err.to_string(),
                    }
                })?,
            };

            if let Some(seen) = self.last_seen.get_mut(&worker) {
                *seen = Instant::now();
            }

            match message {
                PhaseMessage::Ready {
                    worker: reported,
                    state,
                } if reported == worker && state == target => {
                    barrier.arrive(worker)?;
                }
                PhaseMessage::Ready { state, .. } => {
                    return Err(AbortReason::Protocol {
                        message: format!("{worker} reported ready for {state} during {target}"),
                    });
                }
                PhaseMessage::Heartbeat { .. } => {}
                PhaseMessage::Abort { reason } => {
                    tracing::error!(%worker, %reason, "worker requested abort");
                    return Err(reason);
                }
                PhaseMessage::Advance { .. } => {
                    return Err(AbortReason::Protocol {
                        message: format!("{worker} sent an advance message"),
                    });
                }
            }
        }

        Ok(())
    }

    /// Returns the earliest time any of `workers` was last heard from.
    fn last_heard(&self, workers: &[WorkerId]) -> Instant {
        workers
            .iter()
            .filter_map(|worker| self.last_seen.get(worker))
            .min()
            .copied()
            .unwrap_or_else(Instant::now)
    }

    /// Returns the workers that have been silent for at least the barrier timeout.
    fn silent(&self, workers: &[WorkerId]) -> Vec<WorkerId> {
        let now = Instant::now();
        workers
            .iter()
            .copied()
            .filter(|worker| {
                self.last_seen
                    .get(worker)
                    .is_none_or(|seen| now.duration_since(*seen) >= self.config.barrier_timeout)
            })
            .collect()
    }

    async fn abort(mut self, reason: AbortReason) -> RunConclusion {
        tracing::error!(%reason, "aborting run");
        self.enter(RunState::Aborted);

        let message = PhaseMessage::Abort {
            reason: reason.clone(),
        };
        if let Err(err) = self.transport.broadcast(message).await {
            tracing::warn!(
                error = &err as &dyn std::error::Error,
                "abort not delivered to all workers"
            );
        }

        RunConclusion {
            state: RunState::Aborted,
            reason: Some(reason),
            transitions: self.transitions,
        }
    }

    fn enter(&mut self, state: RunState) {
        let at = self.clock.wall_time(Instant::now());
        self.transitions.push((state, at));
    }
}
