//! The worker side of a coordinated run.

use std::sync::Arc;
use std::time::Duration;

use loaddriver_types::{AbortReason, PhaseMessage, RunId, RunState, TaskNode, WorkerId};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::abort::{AbortFlag, AbortHandle, Escalate};
use crate::client::{ErrorPolicy, OnErrorPolicy, WireClient};
use crate::clock::RunClock;
use crate::config::DriverConfig;
use crate::gate::WarmupGate;
use crate::params::{ParamSourceFactory, StaticParams};
use crate::runner::{ClientAllocation, TaskReport, TaskRunner, first_wave_clients};
use crate::sink::{MetricsStore, SampleSink, SinkReport};
use crate::transport::WorkerTransport;

/// Lower bound of the heartbeat interval.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// A worker's connection to the phase coordinator.
///
/// A background task pumps messages between the transport and the worker and sends a heartbeat
/// every `heartbeat` interval. It owns the worker's [`AbortHandle`] and publishes the run state,
/// so that the flag is only ever written on behalf of the coordinator.
#[derive(Debug)]
pub struct PhaseClient {
    id: WorkerId,
    outgoing: mpsc::UnboundedSender<PhaseMessage>,
    state: watch::Receiver<RunState>,
    abort: AbortFlag,
}

impl PhaseClient {
    /// Connects worker `id` through `transport`.
    ///
    /// Must be called within a tokio runtime.
    pub fn connect<T: WorkerTransport>(id: WorkerId, transport: T, heartbeat: Duration) -> Self {
        let (outgoing, requests) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(RunState::NotStarted);
        let handle = AbortHandle::new();
        let abort = handle.flag();

        tokio::spawn(pump(id, transport, heartbeat, requests, handle, state_tx));

        Self {
            id,
            outgoing,
            state,
            abort,
        }
    }

    /// Returns the worker this client belongs to.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Reports that this worker is ready to enter `state`.
    pub fn report_ready(&self, state: RunState) {
        tracing::debug!(worker = %self.id, %state, "ready");
        let message = PhaseMessage::Ready {
            worker: self.id,
            state,
        };
        // A closed pump has already moved the run into a terminal state.
        let _ = self.outgoing.send(message);
    }

    /// Waits until the run has entered `target`.
    ///
    /// Returns the reason if the run was aborted instead.
    pub async fn wait_for(&self, target: RunState) -> Result<RunState, AbortReason> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| s.has_reached(target) || s.is_terminal())
            .await
            .map(|s| *s)
            .unwrap_or(RunState::Aborted);

        if reached.has_reached(target) {
            Ok(reached)
        } else {
            Err(self.abort_reason())
        }
    }

    /// Returns the current run state as seen by this worker.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Returns a receiver observing the run state.
    pub fn state_receiver(&self) -> watch::Receiver<RunState> {
        self.state.clone()
    }

    /// Returns the abort flag of this worker.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Returns an escalator that requests an abort from the coordinator.
    ///
    /// The abort takes effect locally right away, without waiting for the coordinator's
    /// broadcast.
    pub fn escalator(&self) -> PhaseEscalator {
        PhaseEscalator {
            outgoing: self.outgoing.clone(),
        }
    }

    fn abort_reason(&self) -> AbortReason {
        self.abort
            .reason()
            .cloned()
            .unwrap_or_else(|| AbortReason::Unreachable {
                message: "lost connection to the coordinator".to_owned(),
            })
    }
}

/// Escalates fatal conditions of a worker to the coordinator.
#[derive(Clone, Debug)]
pub struct PhaseEscalator {
    outgoing: mpsc::UnboundedSender<PhaseMessage>,
}

impl Escalate for PhaseEscalator {
    fn escalate(&self, reason: AbortReason) {
        let _ = self.outgoing.send(PhaseMessage::Abort { reason });
    }
}

async fn pump<T: WorkerTransport>(
    id: WorkerId,
    mut transport: T,
    heartbeat: Duration,
    mut requests: mpsc::UnboundedReceiver<PhaseMessage>,
    handle: AbortHandle,
    state: watch::Sender<RunState>,
) {
    let is_terminal = || state.borrow().is_terminal();
    let abort = |reason: AbortReason| {
        if handle.abort(reason.clone()) {
            tracing::error!(worker = %id, %reason, "run aborted");
        }
        state.send_replace(RunState::Aborted);
    };

    let mut heartbeat = tokio::time::interval(heartbeat.max(MIN_HEARTBEAT));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                // A lost coordinator surfaces through `recv`, after any advance still queued.
                let _ = transport.send(PhaseMessage::Heartbeat { worker: id }).await;
            }
            request = requests.recv() => {
                let Some(message) = request else {
                    break;
                };
                if let PhaseMessage::Abort { ref reason } = message {
                    abort(reason.clone());
                }
                if let Err(err) = transport.send(message).await
                    && !is_terminal()
                {
                    abort(AbortReason::Unreachable {
                        message: err.to_string(),
                    });
                }
            }
            received = transport.recv() => match received {
                Ok(PhaseMessage::Advance { state: next }) => {
                    if !is_terminal() {
                        state.send_replace(next);
                    }
                }
                Ok(PhaseMessage::Abort { reason }) => abort(reason),
                Ok(PhaseMessage::Ready { .. } | PhaseMessage::Heartbeat { .. }) => {
                    abort(AbortReason::Protocol {
                        message: "coordinator sent a worker message".to_owned(),
                    })
                }
                Err(err) => {
                    if !is_terminal() {
                        abort(AbortReason::Unreachable {
                            message: err.to_string(),
                        });
                    }
                    break;
                }
            },
        }
    }
}

/// Summary of one worker's part in a run.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerReport {
    /// The worker.
    pub worker: WorkerId,
    /// The state the run was in when the worker finished.
    pub state: RunState,
    /// Why the run was aborted, if it was.
    pub reason: Option<AbortReason>,
    /// Reports of all tasks the worker started.
    pub tasks: Vec<TaskReport>,
    /// Statistics of the worker's sample sink, if it drained successfully.
    pub sink: Option<SinkReport>,
}

/// Builder for a [`Worker`].
#[derive(Debug)]
pub struct WorkerBuilder {
    id: WorkerId,
    run: RunId,
    config: DriverConfig,
    seed: u64,
    client: Arc<dyn WireClient>,
    store: Arc<dyn MetricsStore>,
    params: Arc<dyn ParamSourceFactory>,
    policy: Arc<dyn ErrorPolicy>,
}

impl WorkerBuilder {
    /// Sets the run this worker participates in.
    pub fn run_id(mut self, run: RunId) -> Self {
        self.run = run;
        self
    }

    /// Sets the driver configuration.
    pub fn config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the pacing seed shared by all workers of the run.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the factory for parameter sources.
    pub fn params(mut self, params: Arc<dyn ParamSourceFactory>) -> Self {
        self.params = params;
        self
    }

    /// Sets the error policy.
    pub fn policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Creates the worker.
    pub fn build(self) -> Worker {
        Worker {
            id: self.id,
            run: self.run,
            config: self.config,
            seed: self.seed,
            client: self.client,
            store: self.store,
            params: self.params,
            policy: self.policy,
        }
    }
}

/// Executes its share of a task tree in lockstep with the other workers of a run.
///
/// A worker reports readiness for warmup once it is set up, for measurement once all its
/// first-wave clients have finished their warmup, and for completion once its task tree has
/// finished and all samples have been stored.
#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    run: RunId,
    config: DriverConfig,
    seed: u64,
    client: Arc<dyn WireClient>,
    store: Arc<dyn MetricsStore>,
    params: Arc<dyn ParamSourceFactory>,
    policy: Arc<dyn ErrorPolicy>,
}

impl Worker {
    /// Creates a builder for worker `id`.
    pub fn builder(
        id: WorkerId,
        client: Arc<dyn WireClient>,
        store: Arc<dyn MetricsStore>,
    ) -> WorkerBuilder {
        WorkerBuilder {
            id,
            run: RunId::new(),
            config: DriverConfig::default(),
            seed: 0,
            client,
            store,
            params: Arc::new(StaticParams),
            policy: Arc::new(OnErrorPolicy),
        }
    }

    /// Runs this worker's share of `root`.
    pub async fn run<T: WorkerTransport>(self, root: &TaskNode, transport: T) -> WorkerReport {
        let span = tracing::info_span!("worker", worker = %self.id, run = %self.run);
        self.execute(root, transport).instrument(span).await
    }

    async fn execute<T: WorkerTransport>(self, root: &TaskNode, transport: T) -> WorkerReport {
        let heartbeat = self.config.coordinator.heartbeat_interval;
        let phase = PhaseClient::connect(self.id, transport, heartbeat);
        let mut report = WorkerReport {
            worker: self.id,
            state: RunState::NotStarted,
            reason: None,
            tasks: Vec::new(),
            sink: None,
        };

        if let Err(err) = root.validate() {
            phase.escalator().escalate(AbortReason::InvalidConfiguration {
                message: err.to_string(),
            });
            let _ = phase.wait_for(RunState::Complete).await;
            return self.finish(report, &phase);
        }

        let escalate: Arc<dyn Escalate> = Arc::new(phase.escalator());
        let (sender, drain) = SampleSink::new(self.config.sink.clone(), self.store.clone())
            .run_id(self.run)
            .worker(self.id)
            .abort(phase.abort_flag())
            .escalate(escalate.clone())
            .clock(RunClock::now())
            .open();
        let drain = tokio::spawn(drain.run());

        let allocation = ClientAllocation::new(self.id, self.config.workers);
        let gate = WarmupGate::new(
            first_wave_clients(root, allocation),
            phase.state_receiver(),
        );
        let runner = TaskRunner::builder(self.client.clone(), sender)
            .params(self.params.clone())
            .policy(self.policy.clone())
            .abort(phase.abort_flag(), escalate)
            .allocation(allocation)
            .gate(gate.clone())
            .seed(self.seed)
            .build();

        phase.report_ready(RunState::Warmup);
        if phase.wait_for(RunState::Warmup).await.is_ok() {
            let abort = phase.abort_flag();
            let warm = async {
                tokio::select! {
                    _ = gate.all_warm() => phase.report_ready(RunState::Measurement),
                    _ = abort.aborted() => {}
                }
            };

            let (outcome, ()) = tokio::join!(runner.run(root), warm);
            if let Ok(outcome) = outcome {
                report.tasks = outcome.tasks;
            }
        }

        // Dropping the runner closes the sink once all clients are done.
        drop(runner);
        match drain.await {
            Ok(Ok(sink)) => report.sink = Some(sink),
            Ok(Err(err)) => {
                tracing::error!(error = &err as &dyn std::error::Error, "sample sink failed");
            }
            Err(err) => phase.escalator().escalate(AbortReason::SinkFailed {
                message: err.to_string(),
            }),
        }

        if phase.wait_for(RunState::Measurement).await.is_ok() {
            phase.report_ready(RunState::Complete);
            let _ = phase.wait_for(RunState::Complete).await;
        }

        self.finish(report, &phase)
    }

    fn finish(&self, mut report: WorkerReport, phase: &PhaseClient) -> WorkerReport {
        report.state = phase.state();
        report.reason = phase.abort_flag().reason().cloned();

        tracing::info!(
            worker = %self.id,
            state = %report.state,
            tasks = report.tasks.len(),
            "worker finished"
        );
        report
    }
}
