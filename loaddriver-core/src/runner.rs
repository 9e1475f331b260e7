//! Interpretation of the task tree.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use loaddriver_types::task::{Parallel, Sequential};
use loaddriver_types::{AbortReason, LeafTask, TaskNode, WorkerId};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::abort::{AbortFlag, AbortHandle, Escalate};
use crate::client::{ErrorPolicy, OnErrorPolicy, WireClient};
use crate::error::RunnerError;
use crate::executor::{ClientExecutor, ClientStatus};
use crate::gate::WarmupGate;
use crate::params::{ParamSourceFactory, StaticParams};
use crate::schedule::Schedule;
use crate::sink::SampleSender;

/// Assignment of task clients to the workers of a run.
///
/// Clients are distributed round-robin, so that client `c` runs on worker `c % workers`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientAllocation {
    worker: usize,
    workers: usize,
}

impl ClientAllocation {
    /// Creates the allocation of `worker` among `workers`.
    pub fn new(worker: WorkerId, workers: usize) -> Self {
        Self {
            worker: worker.0,
            workers: workers.max(1),
        }
    }

    /// Runs every client locally.
    pub fn single() -> Self {
        Self::new(WorkerId(0), 1)
    }

    /// Returns the indexes of the clients this worker runs, out of `clients`.
    pub fn clients_for(&self, clients: usize) -> impl Iterator<Item = usize> + use<> {
        (self.worker..clients).step_by(self.workers)
    }
}

/// How a node of the task tree ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum NodeStatus {
    /// Every client exhausted its schedule.
    Completed,
    /// The node was stopped because a sibling named in `completed_by` completed.
    Stopped,
    /// The run was aborted.
    Aborted,
}

/// Summary of one leaf task on this worker.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskReport {
    /// Name of the task.
    pub name: String,
    /// Number of clients that ran on this worker.
    pub clients: usize,
    /// Number of samples emitted.
    pub samples: u64,
    /// Number of non-fatal errors.
    pub errors: u64,
    /// Number of timed-out operations.
    pub timeouts: u64,
    /// How the task ended.
    pub status: NodeStatus,
    /// Wall time from the start of the task until its last client finished.
    pub duration: Duration,
}

/// Result of executing a task tree.
#[derive(Clone, Debug, PartialEq)]
pub struct RunnerOutcome {
    /// How the root of the tree ended.
    pub status: NodeStatus,
    /// Reports of all leaf tasks that were started, in completion order.
    pub tasks: Vec<TaskReport>,
}

/// Returns the number of first-wave clients of `root` that run under `allocation`.
///
/// First-wave clients start together with the tree: the clients of the first child of every
/// sequential group and of all children of every parallel group, applied recursively.
pub fn first_wave_clients(root: &TaskNode, allocation: ClientAllocation) -> usize {
    match root {
        TaskNode::Task(task) => allocation.clients_for(task.clients).count(),
        TaskNode::Sequential(group) => group
            .tasks
            .first()
            .map_or(0, |first| first_wave_clients(first, allocation)),
        TaskNode::Parallel(group) => group
            .tasks
            .iter()
            .map(|child| first_wave_clients(child, allocation))
            .sum(),
    }
}

/// Builder for a [`TaskRunner`].
#[derive(Debug)]
pub struct TaskRunnerBuilder {
    client: Arc<dyn WireClient>,
    sink: SampleSender,
    params: Arc<dyn ParamSourceFactory>,
    policy: Arc<dyn ErrorPolicy>,
    abort: Option<(AbortFlag, Arc<dyn Escalate>)>,
    allocation: ClientAllocation,
    gate: Option<WarmupGate>,
    seed: u64,
}

impl TaskRunnerBuilder {
    /// Sets the factory for parameter sources. Defaults to [`StaticParams`].
    pub fn params(mut self, params: Arc<dyn ParamSourceFactory>) -> Self {
        self.params = params;
        self
    }

    /// Sets the error policy. Defaults to [`OnErrorPolicy`].
    pub fn policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Observes an external abort flag and escalates fatal errors to `escalate`.
    ///
    /// By default, the runner owns its abort flag and aborts on the first fatal error.
    pub fn abort(mut self, abort: AbortFlag, escalate: Arc<dyn Escalate>) -> Self {
        self.abort = Some((abort, escalate));
        self
    }

    /// Runs only the clients assigned to this worker.
    pub fn allocation(mut self, allocation: ClientAllocation) -> Self {
        self.allocation = allocation;
        self
    }

    /// Aligns the start of measurement through the given gate.
    pub fn gate(mut self, gate: WarmupGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Sets the seed for tasks without their own pacing seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Creates the runner.
    pub fn build(self) -> TaskRunner {
        let (abort, escalate) = self.abort.unwrap_or_else(|| {
            let handle = AbortHandle::new();
            (handle.flag(), Arc::new(handle) as Arc<dyn Escalate>)
        });

        TaskRunner(Arc::new(RunnerInner {
            client: self.client,
            sink: self.sink,
            params: self.params,
            policy: self.policy,
            abort,
            escalate,
            allocation: self.allocation,
            gate: self.gate,
            seed: self.seed,
            reports: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug)]
struct RunnerInner {
    client: Arc<dyn WireClient>,
    sink: SampleSender,
    params: Arc<dyn ParamSourceFactory>,
    policy: Arc<dyn ErrorPolicy>,
    abort: AbortFlag,
    escalate: Arc<dyn Escalate>,
    allocation: ClientAllocation,
    gate: Option<WarmupGate>,
    seed: u64,
    reports: Mutex<Vec<TaskReport>>,
}

/// Walks a task tree and runs the client executors of its leaves.
///
/// Sequential groups run their children one at a time. Parallel groups run all children at once
/// and fail fast: a fatal error anywhere aborts the run, which stops all clients. Samples are
/// forwarded unfiltered, tagged with the phase of their schedule.
#[derive(Clone, Debug)]
pub struct TaskRunner(Arc<RunnerInner>);

impl TaskRunner {
    /// Creates a builder for a runner issuing operations through `client`.
    pub fn builder(client: Arc<dyn WireClient>, sink: SampleSender) -> TaskRunnerBuilder {
        TaskRunnerBuilder {
            client,
            sink,
            params: Arc::new(StaticParams),
            policy: Arc::new(OnErrorPolicy),
            abort: None,
            allocation: ClientAllocation::single(),
            gate: None,
            seed: 0,
        }
    }

    /// Returns the abort flag observed by this runner.
    pub fn abort_flag(&self) -> &AbortFlag {
        &self.0.abort
    }

    /// Validates and executes `root`.
    ///
    /// Validation errors are returned before any client starts. All other failures abort the
    /// run and are reflected in the returned status.
    pub async fn run(&self, root: &TaskNode) -> Result<RunnerOutcome, RunnerError> {
        root.validate()?;

        tracing::info!(
            tasks = root.leaves().len(),
            allocation = ?self.0.allocation,
            "running task tree"
        );

        let stop = self.0.abort.child_token();
        let mut status = self.run_node(root, stop, true).await;
        if self.0.abort.is_aborted() {
            status = NodeStatus::Aborted;
        }

        if let Some(ref gate) = self.0.gate {
            gate.release_all();
        }

        let tasks = std::mem::take(
            &mut *self
                .0
                .reports
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::info!(?status, "task tree finished");

        Ok(RunnerOutcome { status, tasks })
    }

    fn run_node<'a>(
        &'a self,
        node: &'a TaskNode,
        stop: CancellationToken,
        first_wave: bool,
    ) -> BoxFuture<'a, NodeStatus> {
        async move {
            match node {
                TaskNode::Task(task) => {
                    let span = tracing::info_span!("task", task = %task.name);
                    self.run_leaf(task, stop, first_wave).instrument(span).await
                }
                TaskNode::Sequential(group) => self.run_sequential(group, stop, first_wave).await,
                TaskNode::Parallel(group) => self.run_parallel(group, stop, first_wave).await,
            }
        }
        .boxed()
    }

    async fn run_sequential(
        &self,
        group: &Sequential,
        stop: CancellationToken,
        first_wave: bool,
    ) -> NodeStatus {
        for (index, child) in group.tasks.iter().enumerate() {
            if self.0.abort.is_aborted() {
                return NodeStatus::Aborted;
            }
            if stop.is_cancelled() {
                return NodeStatus::Stopped;
            }

            let status = self
                .run_node(child, stop.clone(), first_wave && index == 0)
                .await;
            if status != NodeStatus::Completed {
                return status;
            }
        }

        NodeStatus::Completed
    }

    async fn run_parallel(
        &self,
        group: &Parallel,
        stop: CancellationToken,
        first_wave: bool,
    ) -> NodeStatus {
        let group_stop = stop.child_token();
        let completed_by = group.completed_by.as_deref();

        let children = group.tasks.iter().map(|child| {
            let group_stop = group_stop.clone();
            async move {
                let status = self.run_node(child, group_stop.clone(), first_wave).await;
                let decisive = completed_by.is_some() && child.name() == completed_by;
                if decisive && status == NodeStatus::Completed {
                    tracing::info!(task = completed_by, "stopping remaining parallel tasks");
                    group_stop.cancel();
                }
                (decisive, status)
            }
        });
        let statuses = join_all(children).await;

        if statuses.iter().any(|(_, s)| *s == NodeStatus::Aborted) {
            NodeStatus::Aborted
        } else if statuses
            .iter()
            .any(|(decisive, s)| *decisive && *s == NodeStatus::Completed)
        {
            NodeStatus::Completed
        } else if statuses.iter().any(|(_, s)| *s == NodeStatus::Stopped) {
            NodeStatus::Stopped
        } else {
            NodeStatus::Completed
        }
    }

    async fn run_leaf(
        &self,
        task: &LeafTask,
        stop: CancellationToken,
        first_wave: bool,
    ) -> NodeStatus {
        let inner = &self.0;
        let task = Arc::new(task.clone());
        let clients: Vec<usize> = inner.allocation.clients_for(task.clients).collect();
        let seed = task.seed.unwrap_or(inner.seed);

        // All schedules are created before the first client starts, so that parameter sources
        // that fail to initialize abort the run without issuing any operation.
        let mut schedules = Vec::with_capacity(clients.len());
        for &client in &clients {
            match inner.params.create(&task, client) {
                Ok(source) => schedules.push(Schedule::new(task.clone(), client, source, seed)),
                Err(err) => {
                    inner.escalate.escalate(AbortReason::InvalidConfiguration {
                        message: format!(
                            "failed to create parameter source for task `{}`: {err}",
                            task.name
                        ),
                    });
                    self.record(TaskReport {
                        name: task.name.clone(),
                        clients: clients.len(),
                        samples: 0,
                        errors: 0,
                        timeouts: 0,
                        status: NodeStatus::Aborted,
                        duration: Duration::ZERO,
                    });
                    return NodeStatus::Aborted;
                }
            }
        }

        tracing::info!(clients = clients.len(), "starting task");

        let start = Instant::now();
        let mut executors = JoinSet::new();
        for schedule in schedules {
            let client = schedule.client();
            let mut executor = ClientExecutor::new(
                client,
                schedule,
                inner.client.clone(),
                inner.policy.clone(),
                inner.sink.clone(),
                inner.abort.clone(),
                start,
            )
            .with_stop(stop.clone());

            if let Some(ref gate) = inner.gate {
                let ticket = first_wave.then(|| gate.ticket());
                executor = executor.with_gate(gate.clone(), ticket);
            }

            let span = tracing::debug_span!("client", client);
            executors.spawn(executor.run().instrument(span));
        }

        let mut report = TaskReport {
            name: task.name.clone(),
            clients: clients.len(),
            samples: 0,
            errors: 0,
            timeouts: 0,
            status: NodeStatus::Completed,
            duration: Duration::ZERO,
        };

        while let Some(joined) = executors.join_next().await {
            let message = match joined {
                Ok(Ok(client)) => {
                    report.samples += client.iterations;
                    report.errors += client.errors;
                    report.timeouts += client.timeouts;
                    match client.status {
                        ClientStatus::Exhausted => {}
                        ClientStatus::Stopped if report.status == NodeStatus::Completed => {
                            report.status = NodeStatus::Stopped;
                        }
                        ClientStatus::Stopped => {}
                        ClientStatus::Aborted => report.status = NodeStatus::Aborted,
                    }
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(err) => format!("client panicked: {err}"),
            };

            report.status = NodeStatus::Aborted;
            inner.escalate.escalate(AbortReason::TaskFailed {
                task: task.name.clone(),
                message,
            });
        }

        if inner.abort.is_aborted() {
            report.status = NodeStatus::Aborted;
        }
        report.duration = start.elapsed();

        tracing::info!(
            samples = report.samples,
            errors = report.errors,
            status = ?report.status,
            "task finished"
        );

        let status = report.status;
        self.record(report);
        status
    }

    fn record(&self, report: TaskReport) {
        self.0
            .reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, clients: usize) -> TaskNode {
        LeafTask::new(name, "op").with_clients(clients).into()
    }

    #[test]
    fn round_robin_allocation() {
        let allocation = ClientAllocation::new(WorkerId(1), 3);
        assert_eq!(allocation.clients_for(8).collect::<Vec<_>>(), [1, 4, 7]);
        assert_eq!(allocation.clients_for(1).count(), 0);

        let total: usize = (0..3)
            .map(|w| ClientAllocation::new(WorkerId(w), 3).clients_for(8).count())
            .sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn first_wave_of_nested_groups() {
        let tree = TaskNode::Sequential(Sequential {
            name: None,
            tasks: vec![
                TaskNode::Parallel(Parallel {
                    name: None,
                    tasks: vec![leaf("a", 2), leaf("b", 3)],
                    completed_by: None,
                }),
                leaf("c", 10),
            ],
        });

        assert_eq!(first_wave_clients(&tree, ClientAllocation::single()), 5);
        assert_eq!(
            first_wave_clients(&tree, ClientAllocation::new(WorkerId(0), 2)),
            3
        );
    }
}
