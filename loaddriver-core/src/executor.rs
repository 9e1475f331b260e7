//! Execution of a single client.

use std::sync::Arc;
use std::time::Duration;

use loaddriver_types::{LeafTask, Outcome, Phase, RunState, Sample};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::abort::AbortFlag;
use crate::client::{ErrorPolicy, ResponseMeta, Severity, WireClient};
use crate::error::{ExecutorError, OperationError, SinkError};
use crate::gate::{WarmupGate, WarmupTicket};
use crate::schedule::{Schedule, ScheduleEntry};
use crate::sink::SampleSender;

/// State of one running client.
#[derive(Debug)]
pub struct ClientExecutionContext {
    /// Index of the client within its task.
    pub client: usize,
    /// The task the client executes.
    pub task: Arc<LeafTask>,
    /// Phase of the most recent operation.
    pub phase: Phase,
    /// Number of operations issued.
    pub iterations: u64,
    /// Number of non-fatal errors.
    pub errors: u64,
    /// Number of timed-out operations.
    pub timeouts: u64,
    /// The run's abort flag.
    pub abort: AbortFlag,
}

/// How a client stopped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientStatus {
    /// The schedule was exhausted.
    Exhausted,
    /// The client was stopped gracefully before its schedule was exhausted.
    Stopped,
    /// The run was aborted.
    Aborted,
}

/// Summary of a finished client.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientReport {
    /// Index of the client within its task.
    pub client: usize,
    /// Number of samples emitted.
    pub iterations: u64,
    /// Number of non-fatal errors.
    pub errors: u64,
    /// Number of timed-out operations.
    pub timeouts: u64,
    /// How the client stopped.
    pub status: ClientStatus,
}

/// Realizes one client's schedule against the wire client.
///
/// The executor sleeps until each operation's ideal issue time, issues it with the task's
/// timeout and pushes one [`Sample`] per attempt. Latency is measured from the ideal issue time
/// for throttled tasks and from the actual start for unthrottled tasks. Operations that could
/// not be issued on time are issued immediately and never skipped.
#[derive(Debug)]
pub struct ClientExecutor {
    context: ClientExecutionContext,
    schedule: Schedule,
    client: Arc<dyn WireClient>,
    policy: Arc<dyn ErrorPolicy>,
    sink: SampleSender,
    stop: CancellationToken,
    start: Instant,
    gate: Option<WarmupGate>,
    ticket: Option<WarmupTicket>,
}

impl ClientExecutor {
    /// Creates an executor for `schedule`.
    ///
    /// Offsets of the schedule are relative to `start`, which is shared by all clients of a task.
    pub fn new(
        client_index: usize,
        schedule: Schedule,
        client: Arc<dyn WireClient>,
        policy: Arc<dyn ErrorPolicy>,
        sink: SampleSender,
        abort: AbortFlag,
        start: Instant,
    ) -> Self {
        let context = ClientExecutionContext {
            client: client_index,
            task: Arc::clone(schedule.task()),
            phase: Phase::Warmup,
            iterations: 0,
            errors: 0,
            timeouts: 0,
            abort,
        };

        Self {
            context,
            schedule,
            client,
            policy,
            sink,
            stop: CancellationToken::new(),
            start,
            gate: None,
            ticket: None,
        }
    }

    /// Stops the client gracefully when `stop` is cancelled.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Aligns the start of measurement with the rest of the run.
    ///
    /// A ticket is held while this client warms up if it belongs to the first wave of the task
    /// tree.
    pub fn with_gate(mut self, gate: WarmupGate, ticket: Option<WarmupTicket>) -> Self {
        self.gate = Some(gate);
        self.ticket = ticket;
        self
    }

    /// Runs the client until its schedule is exhausted, it is stopped, or the run is aborted.
    ///
    /// Returns an error if an operation fails fatally. No sample is recorded for that operation.
    pub async fn run(mut self) -> Result<ClientReport, ExecutorError> {
        let mut base = self.start;
        let mut crossed = false;

        let status = loop {
            if self.context.abort.is_aborted() {
                break ClientStatus::Aborted;
            }
            if self.stop.is_cancelled() {
                break ClientStatus::Stopped;
            }

            let elapsed = Instant::now().saturating_duration_since(base);
            let Some(entry) = self.schedule.next(elapsed)? else {
                break ClientStatus::Exhausted;
            };

            if entry.phase == Phase::Measurement && !crossed {
                crossed = true;
                match self.enter_measurement().await {
                    Ok(waited) => base += waited,
                    Err(status) => break status,
                }
            }
            self.context.phase = entry.phase;

            // An ideal time beyond the clock's range is never reached.
            let Some(intended) = base.checked_add(entry.ideal_offset) else {
                break ClientStatus::Exhausted;
            };
            tokio::select! {
                biased;
                _ = self.context.abort.aborted() => break ClientStatus::Aborted,
                _ = self.stop.cancelled() => break ClientStatus::Stopped,
                _ = tokio::time::sleep_until(intended) => {}
            }

            match self.issue(entry, intended).await? {
                Ok(()) => {}
                Err(SinkError::Aborted) => break ClientStatus::Aborted,
                Err(err) => return Err(err.into()),
            }
        };

        tracing::debug!(
            client = self.context.client,
            iterations = self.context.iterations,
            ?status,
            "client finished"
        );

        Ok(ClientReport {
            client: self.context.client,
            iterations: self.context.iterations,
            errors: self.context.errors,
            timeouts: self.context.timeouts,
            status,
        })
    }

    /// Releases the warmup ticket and waits for the run to enter measurement.
    ///
    /// Returns the time spent waiting, which shifts all later ideal issue times.
    async fn enter_measurement(&mut self) -> Result<Duration, ClientStatus> {
        drop(self.ticket.take());
        let Some(ref gate) = self.gate else {
            return Ok(Duration::ZERO);
        };

        let waiting_since = Instant::now();
        let state = tokio::select! {
            biased;
            _ = self.context.abort.aborted() => return Err(ClientStatus::Aborted),
            _ = self.stop.cancelled() => return Err(ClientStatus::Stopped),
            state = gate.wait_for_measurement() => state,
        };

        if !state.has_reached(RunState::Measurement) {
            return Err(ClientStatus::Aborted);
        }
        Ok(waiting_since.elapsed())
    }

    /// Issues one operation and pushes its sample.
    ///
    /// The outer result carries fatal errors. The inner result is the outcome of the push.
    async fn issue(
        &mut self,
        entry: ScheduleEntry,
        intended: Instant,
    ) -> Result<Result<(), SinkError>, ExecutorError> {
        let task = &self.context.task;
        let bound = task.timeout;

        let actual = Instant::now();
        let result = tokio::time::timeout(
            bound,
            self.client.execute(&task.operation, &entry.params, bound),
        )
        .await;
        let done = Instant::now();

        let measured = done.saturating_duration_since(actual);
        let (outcome, service_time, meta, error) = match result {
            Ok(Ok(meta)) => (Outcome::Success, measured, meta, None),
            Ok(Err(OperationError::Timeout)) | Err(_) => (
                Outcome::Timeout,
                bound,
                ResponseMeta::default(),
                Some(OperationError::Timeout),
            ),
            Ok(Err(err)) => (Outcome::Error, measured, ResponseMeta::default(), Some(err)),
        };

        if let Some(ref err) = error {
            if self.policy.classify(task, err) == Severity::Fatal {
                tracing::error!(
                    client = self.context.client,
                    iteration = entry.iteration,
                    error = err as &dyn std::error::Error,
                    "operation failed fatally"
                );
                return Err(ExecutorError::Fatal {
                    task: task.name.clone(),
                    client: self.context.client,
                    iteration: entry.iteration,
                    source: err.clone(),
                });
            }

            self.context.errors += 1;
            if outcome == Outcome::Timeout {
                self.context.timeouts += 1;
            }
            if self.context.errors == 1 || self.context.errors % 1000 == 0 {
                tracing::warn!(
                    client = self.context.client,
                    errors = self.context.errors,
                    error = err as &dyn std::error::Error,
                    "operation failed"
                );
            }
        }

        let ideal = if self.schedule.is_throttled() {
            intended
        } else {
            actual
        };
        let latency = done.saturating_duration_since(ideal).max(service_time);

        let clock = self.sink.clock();
        let sample = Sample {
            task: task.name.as_str().into(),
            operation: task.operation.as_str().into(),
            client: self.context.client,
            iteration: entry.iteration,
            start: clock.wall_time(actual),
            ideal_start: clock.wall_time(ideal),
            service_time,
            latency,
            outcome,
            error: error.map(|err| err.to_string()),
            weight: meta.weight,
            unit: meta.unit,
            phase: entry.phase,
        };

        let pushed = self.sink.push(sample).await;
        if pushed.is_ok() {
            self.context.iterations += 1;
        }
        Ok(pushed)
    }
}
