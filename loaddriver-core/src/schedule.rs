//! Bounded sequences of operations for a single client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use loaddriver_types::{LeafTask, Params, Phase};

use crate::error::ScheduleError;
use crate::pacer::{Pacer, ramp_up_offset};
use crate::params::ParamSource;

/// One operation to be issued by a client.
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleEntry {
    /// Index of the operation within the schedule, counting warmup and measurement.
    pub iteration: u64,
    /// Time relative to the start of the task at which the operation should be issued.
    pub ideal_offset: Duration,
    /// Request parameters of the operation.
    pub params: Params,
    /// Phase the operation belongs to.
    pub phase: Phase,
}

/// Lazy sequence of operations for one client of one task.
///
/// The schedule combines a [`Pacer`] with a [`ParamSource`] and bounds the sequence by the task's
/// iteration count, its measurement time period, or both, whichever triggers first. Warmup
/// operations come first and are tagged [`Phase::Warmup`]. A schedule is never rewound: to restart
/// a client, create a new schedule.
pub struct Schedule {
    task: Arc<LeafTask>,
    client: usize,
    pacer: Pacer,
    params: Box<dyn ParamSource>,
    start_offset: Duration,
    iteration_bound: Option<u64>,

    index: u64,
    measured: u64,
    /// Effective start of the first measurement operation.
    measurement_start: Option<Duration>,
    last_ideal: Duration,
    done: bool,
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("task", &self.task.name)
            .field("client", &self.client)
            .field("pacer", &self.pacer)
            .field("index", &self.index)
            .field("measured", &self.measured)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Schedule {
    /// Creates the schedule of `client` for `task`.
    ///
    /// The client's start offset is derived from the task's ramp-up period. Randomized pacing is
    /// seeded from `seed` and the client index.
    pub fn new(
        task: Arc<LeafTask>,
        client: usize,
        params: Box<dyn ParamSource>,
        seed: u64,
    ) -> Self {
        let start_offset = task
            .ramp_up_time_period
            .map(|ramp_up| ramp_up_offset(ramp_up, client, task.clients))
            .unwrap_or_default();

        let pacer = Pacer::new(
            task.throughput(),
            task.pacing,
            seed.wrapping_add(client as u64),
        )
        .with_start_offset(start_offset);

        Self {
            iteration_bound: task.iteration_bound(),
            task,
            client,
            pacer,
            params,
            start_offset,
            index: 0,
            measured: 0,
            measurement_start: None,
            last_ideal: Duration::ZERO,
            done: false,
        }
    }

    /// Returns the task this schedule belongs to.
    pub fn task(&self) -> &Arc<LeafTask> {
        &self.task
    }

    /// Returns the index of the client this schedule belongs to.
    pub fn client(&self) -> usize {
        self.client
    }

    /// Returns `true` if ideal issue times follow a target rate.
    pub fn is_throttled(&self) -> bool {
        self.pacer.is_throttled()
    }

    /// Returns the offset at which this client starts issuing operations.
    pub fn start_offset(&self) -> Duration {
        self.start_offset
    }

    /// Produces the next operation.
    ///
    /// `elapsed` is the time since the start of the task. It determines the phase of time-bounded
    /// warmups and ends time-bounded schedules. Returns `Ok(None)` once the schedule is exhausted;
    /// every later call returns `Ok(None)` as well. Errors of the parameter source are fatal and
    /// end the schedule.
    pub fn next(&mut self, elapsed: Duration) -> Result<Option<ScheduleEntry>, ScheduleError> {
        if self.done {
            return Ok(None);
        }

        let ideal = self.pacer.next_ideal_issue_time().max(self.last_ideal);
        // Operations are never issued before their ideal time, but late clients issue immediately.
        let effective = elapsed.max(ideal);
        let phase = self.phase_at(effective);

        if phase == Phase::Measurement {
            let measurement_start = *self.measurement_start.get_or_insert(effective);

            if self.iteration_bound.is_some_and(|bound| self.measured >= bound) {
                return Ok(self.finish());
            }
            if let Some(period) = self.task.time_period
                && measurement_start
                    .checked_add(period)
                    .is_some_and(|end| effective >= end)
            {
                return Ok(self.finish());
            }
        }

        let params = match self.params.next_params() {
            Ok(Some(params)) => params,
            Ok(None) => return Ok(self.finish()),
            Err(source) => {
                self.done = true;
                return Err(ScheduleError::Params {
                    task: self.task.name.clone(),
                    client: self.client,
                    source,
                });
            }
        };

        let iteration = self.index;
        self.index += 1;
        if phase == Phase::Measurement {
            self.measured += 1;
        }
        self.last_ideal = ideal;

        Ok(Some(ScheduleEntry {
            iteration,
            ideal_offset: ideal,
            params,
            phase,
        }))
    }

    fn phase_at(&self, effective: Duration) -> Phase {
        if self.measurement_start.is_some() {
            return Phase::Measurement;
        }
        if self.index < self.task.warmup_iterations {
            return Phase::Warmup;
        }
        match self.task.warmup_time_period {
            Some(warmup) if effective.saturating_sub(self.start_offset) < warmup => Phase::Warmup,
            _ => Phase::Measurement,
        }
    }

    fn finish(&mut self) -> Option<ScheduleEntry> {
        self.done = true;
        None
    }
}
