use std::sync::Arc;

use futures_util::future::join_all;
use loaddriver_types::{RunId, RunState, TaskNode};
use tokio_util::sync::CancellationToken;

use crate::client::{ErrorPolicy, OnErrorPolicy, WireClient};
use crate::config::DriverConfig;
use crate::coordinator::{PhaseCoordinator, RunConclusion};
use crate::params::{ParamSourceFactory, StaticParams};
use crate::sink::MetricsStore;
use crate::transport::local_transport;
use crate::worker::{Worker, WorkerReport};

/// The external collaborators of a run.
#[derive(Clone, Debug)]
pub struct Collaborators {
    /// Issues operations against the system under test.
    pub client: Arc<dyn WireClient>,
    /// Receives the samples.
    pub store: Arc<dyn MetricsStore>,
    /// Creates parameter sources for the clients.
    pub params: Arc<dyn ParamSourceFactory>,
    /// Classifies failed operations.
    pub policy: Arc<dyn ErrorPolicy>,
}

impl Collaborators {
    /// Creates collaborators with static parameters and the default error policy.
    pub fn new(client: Arc<dyn WireClient>, store: Arc<dyn MetricsStore>) -> Self {
        Self {
            client,
            store,
            params: Arc::new(StaticParams),
            policy: Arc::new(OnErrorPolicy),
        }
    }

    /// Sets the factory for parameter sources.
    pub fn with_params(mut self, params: Arc<dyn ParamSourceFactory>) -> Self {
        self.params = params;
        self
    }

    /// Sets the error policy.
    pub fn with_policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of a complete run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// Identifier of the run, attached to all stored samples.
    pub run_id: RunId,
    /// What the coordinator concluded.
    pub conclusion: RunConclusion,
    /// Reports of all workers, ordered by worker id.
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    /// Returns `true` if the run covered its full measurement window.
    ///
    /// Results of runs that are not complete must not be presented as a full measurement.
    pub fn is_complete(&self) -> bool {
        self.conclusion.is_complete()
            && self
                .workers
                .iter()
                .all(|w| w.state == RunState::Complete && w.sink.is_some())
    }
}

/// Runs `root` on `config.workers` workers within this process.
///
/// Each worker runs its round-robin share of every task's clients and has its own sample sink.
/// Cancelling `cancel` aborts the run.
pub async fn run_local(
    root: &TaskNode,
    config: &DriverConfig,
    collaborators: Collaborators,
    cancel: CancellationToken,
) -> RunReport {
    let run_id = RunId::new();
    let workers = config.workers.max(1);
    let seed = config.seed.unwrap_or_else(rand::random);

    tracing::info!(%run_id, workers, seed, "starting run");

    let (coordinator, transports) = local_transport(workers);
    let coordinator = PhaseCoordinator::new(coordinator, workers, config.coordinator.clone())
        .with_cancellation(cancel);

    let mut worker_config = config.clone();
    worker_config.workers = workers;

    let worker_runs = transports.into_iter().map(|transport| {
        let worker = Worker::builder(
            transport.id(),
            collaborators.client.clone(),
            collaborators.store.clone(),
        )
        .run_id(run_id)
        .config(worker_config.clone())
        .seed(seed)
        .params(collaborators.params.clone())
        .policy(collaborators.policy.clone())
        .build();

        worker.run(root, transport)
    });

    let (conclusion, workers) = tokio::join!(coordinator.run(), join_all(worker_runs));

    tracing::info!(%run_id, state = %conclusion.state, "run finished");

    RunReport {
        run_id,
        conclusion,
        workers,
    }
}
