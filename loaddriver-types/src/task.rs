//! Definitions of the task hierarchy.
//!
//! A benchmark executes a tree of [`TaskNode`]s:
//!
//!  - [`TaskNode::Task`] is a leaf that runs one operation with a fixed number of clients.
//!  - [`TaskNode::Sequential`] runs its children one after another.
//!  - [`TaskNode::Parallel`] runs its children concurrently.
//!
//! The tree is validated once with [`TaskNode::validate`] before anything is scheduled and is
//! read-only afterwards.
//!
//! # YAML Example
//!
//! ```yaml
//! type: sequential
//! tasks:
//!   - type: task
//!     name: index-append
//!     operation: bulk
//!     clients: 8
//!     warmup_iterations: 100
//!     iterations: 1000
//!   - type: parallel
//!     completed_by: search
//!     tasks:
//!       - type: task
//!         name: search
//!         operation: query
//!         target_throughput: 50
//!         pacing: poisson
//!         time_period: 2m
//!       - type: task
//!         name: background-updates
//!         operation: update
//!         time_period: 10m
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operation-specific request parameters produced by a parameter source.
pub type Params = serde_json::Value;

/// Default timeout for a single operation invocation.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

fn default_clients() -> usize {
    1
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// A node in the task hierarchy.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskNode {
    /// A single operation type executed by a fixed number of clients.
    Task(LeafTask),
    /// Children run to completion one at a time, in list order.
    Sequential(Sequential),
    /// Children run concurrently; the group completes when all of them complete.
    Parallel(Parallel),
}

/// A group of tasks executed one after another.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Sequential {
    /// Optional name of the group, used in logs and by [`Parallel::completed_by`].
    #[serde(default)]
    pub name: Option<String>,
    /// The child tasks in execution order.
    pub tasks: Vec<TaskNode>,
}

/// A group of tasks executed concurrently.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Parallel {
    /// Optional name of the group, used in logs and by an enclosing [`Parallel::completed_by`].
    #[serde(default)]
    pub name: Option<String>,
    /// The child tasks, all started at the same time.
    pub tasks: Vec<TaskNode>,
    /// Name of a direct child whose completion ends the group.
    ///
    /// When set, the remaining children are stopped gracefully as soon as the named child has
    /// completed. When `None`, the group waits for all children.
    #[serde(default)]
    pub completed_by: Option<String>,
}

/// How inter-arrival gaps of a throttled client are distributed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PacingMode {
    /// Every gap is exactly `1 / r`.
    #[default]
    Fixed,
    /// Gaps are drawn uniformly from `0..2 / r`.
    Uniform,
    /// Gaps are drawn from an exponential distribution with mean `1 / r`, which models an
    /// open-loop arrival process.
    Poisson,
}

/// What happens when an operation fails.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Record the failure as an error sample and keep going.
    #[default]
    Continue,
    /// Treat every failure as fatal and abort the run.
    Abort,
}

/// The target throughput of a single client.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Throughput {
    /// Operations are issued back-to-back as fast as completions allow.
    Unthrottled,
    /// A fixed number of operations per second, per client.
    PerClient(f64),
}

impl Throughput {
    /// Returns `true` if a target rate is configured.
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::PerClient(_))
    }
}

/// A leaf of the task hierarchy, running one operation type.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LeafTask {
    /// Unique name of the task within the tree.
    pub name: String,

    /// Name of the operation passed to the wire client.
    pub operation: String,

    /// Number of simulated clients executing this task.
    ///
    /// Fixed for the entire execution of the task. Defaults to `1`.
    #[serde(default = "default_clients")]
    pub clients: usize,

    /// Target operations per second, per client.
    ///
    /// Mutually exclusive with [`target_interval`](Self::target_interval). If neither is set, the
    /// task runs unthrottled.
    #[serde(default)]
    pub target_throughput: Option<f64>,

    /// Target time between two operations of a client.
    #[serde(default, with = "humantime_serde")]
    pub target_interval: Option<Duration>,

    /// Distribution of inter-arrival gaps for throttled tasks.
    #[serde(default)]
    pub pacing: PacingMode,

    /// Seed for randomized pacing.
    ///
    /// When unset, the seed configured for the run is used.
    #[serde(default)]
    pub seed: Option<u64>,

    /// Number of operations per client tagged as warmup before measurement starts.
    #[serde(default)]
    pub warmup_iterations: u64,

    /// Time per client during which operations are tagged as warmup.
    ///
    /// Mutually exclusive with a non-zero [`warmup_iterations`](Self::warmup_iterations).
    #[serde(default, with = "humantime_serde")]
    pub warmup_time_period: Option<Duration>,

    /// Number of measurement operations per client.
    ///
    /// If neither this nor [`time_period`](Self::time_period) is set, every client runs a single
    /// measurement iteration.
    #[serde(default)]
    pub iterations: Option<u64>,

    /// Duration of the measurement phase per client.
    ///
    /// Starts with the first measurement operation of the client. When combined with
    /// [`iterations`](Self::iterations), whichever bound triggers first ends the task.
    #[serde(default, with = "humantime_serde")]
    pub time_period: Option<Duration>,

    /// Time across which client start times are staggered.
    #[serde(default, with = "humantime_serde")]
    pub ramp_up_time_period: Option<Duration>,

    /// Timeout of a single operation invocation. Defaults to `60s`.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Error handling of this task.
    #[serde(default)]
    pub on_error: OnError,

    /// Static operation parameters, used by the default parameter source.
    #[serde(default)]
    pub params: Params,
}

impl LeafTask {
    /// Creates a task running `operation` with one client for a single iteration.
    pub fn new(name: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operation: operation.into(),
            clients: default_clients(),
            target_throughput: None,
            target_interval: None,
            pacing: PacingMode::default(),
            seed: None,
            warmup_iterations: 0,
            warmup_time_period: None,
            iterations: None,
            time_period: None,
            ramp_up_time_period: None,
            timeout: DEFAULT_TIMEOUT,
            on_error: OnError::default(),
            params: Params::Null,
        }
    }

    /// Sets the number of clients.
    pub fn with_clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    /// Sets the target throughput per client in operations per second.
    pub fn with_target_throughput(mut self, ops_per_second: f64) -> Self {
        self.target_throughput = Some(ops_per_second);
        self
    }

    /// Sets the pacing distribution.
    pub fn with_pacing(mut self, pacing: PacingMode) -> Self {
        self.pacing = pacing;
        self
    }

    /// Sets the pacing seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the number of warmup iterations per client.
    pub fn with_warmup_iterations(mut self, iterations: u64) -> Self {
        self.warmup_iterations = iterations;
        self
    }

    /// Sets the warmup time period per client.
    pub fn with_warmup_time_period(mut self, period: Duration) -> Self {
        self.warmup_time_period = Some(period);
        self
    }

    /// Sets the number of measurement iterations per client.
    pub fn with_iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Sets the measurement time period per client.
    pub fn with_time_period(mut self, period: Duration) -> Self {
        self.time_period = Some(period);
        self
    }

    /// Sets the ramp-up time period.
    pub fn with_ramp_up(mut self, period: Duration) -> Self {
        self.ramp_up_time_period = Some(period);
        self
    }

    /// Sets the operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the error handling.
    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    /// Sets the static operation parameters.
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Returns the target throughput of every client of this task.
    pub fn throughput(&self) -> Throughput {
        match (self.target_throughput, self.target_interval) {
            (Some(rate), _) => Throughput::PerClient(rate),
            (None, Some(interval)) => Throughput::PerClient(1.0 / interval.as_secs_f64()),
            (None, None) => Throughput::Unthrottled,
        }
    }

    /// Returns the number of measurement iterations each client runs, if bounded by count.
    pub fn iteration_bound(&self) -> Option<u64> {
        match (self.iterations, self.time_period) {
            (Some(iterations), _) => Some(iterations),
            (None, Some(_)) => None,
            (None, None) => Some(1),
        }
    }

    fn validate(&self) -> Result<(), TaskTreeError> {
        let task = || self.name.clone();

        if self.name.is_empty() {
            return Err(TaskTreeError::EmptyName);
        }
        if self.operation.is_empty() {
            return Err(TaskTreeError::MissingOperation { task: task() });
        }
        if self.clients == 0 {
            return Err(TaskTreeError::NoClients { task: task() });
        }
        if self.target_throughput.is_some() && self.target_interval.is_some() {
            return Err(TaskTreeError::ConflictingThroughput { task: task() });
        }
        if let Some(rate) = self.target_throughput
            && !(rate.is_finite() && rate > 0.0)
        {
            return Err(TaskTreeError::InvalidThroughput { task: task(), rate });
        }
        if self.target_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(TaskTreeError::InvalidThroughput {
                task: task(),
                rate: f64::INFINITY,
            });
        }
        if self.warmup_iterations > 0 && self.warmup_time_period.is_some() {
            return Err(TaskTreeError::ConflictingWarmup { task: task() });
        }
        if self.timeout.is_zero() {
            return Err(TaskTreeError::ZeroTimeout { task: task() });
        }

        Ok(())
    }
}

impl TaskNode {
    /// Returns the name of this node, if it has one.
    ///
    /// Leaf tasks always have a name, groups only if configured.
    pub fn name(&self) -> Option<&str> {
        match self {
            TaskNode::Task(task) => Some(&task.name),
            TaskNode::Sequential(group) => group.name.as_deref(),
            TaskNode::Parallel(group) => group.name.as_deref(),
        }
    }

    /// Returns all leaf tasks of this subtree in depth-first order.
    pub fn leaves(&self) -> Vec<&LeafTask> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a LeafTask>) {
        match self {
            TaskNode::Task(task) => leaves.push(task),
            TaskNode::Sequential(Sequential { tasks, .. })
            | TaskNode::Parallel(Parallel { tasks, .. }) => {
                for child in tasks {
                    child.collect_leaves(leaves);
                }
            }
        }
    }

    /// Validates the entire tree.
    ///
    /// This checks every leaf for consistent options, that names are unique across the tree,
    /// that groups are not empty, and that `completed_by` refers to a direct child.
    pub fn validate(&self) -> Result<(), TaskTreeError> {
        let mut names = HashSet::new();
        self.validate_node(&mut names)
    }

    fn validate_node<'a>(&'a self, names: &mut HashSet<&'a str>) -> Result<(), TaskTreeError> {
        if let Some(name) = self.name()
            && !names.insert(name)
        {
            return Err(TaskTreeError::DuplicateName(name.to_owned()));
        }

        match self {
            TaskNode::Task(task) => task.validate(),
            TaskNode::Sequential(Sequential { tasks, .. }) => {
                if tasks.is_empty() {
                    return Err(TaskTreeError::EmptyGroup);
                }
                tasks.iter().try_for_each(|child| child.validate_node(names))
            }
            TaskNode::Parallel(Parallel {
                tasks,
                completed_by,
                ..
            }) => {
                if tasks.is_empty() {
                    return Err(TaskTreeError::EmptyGroup);
                }
                if let Some(completed_by) = completed_by
                    && !tasks.iter().any(|c| c.name() == Some(completed_by))
                {
                    return Err(TaskTreeError::UnknownCompletedBy(completed_by.clone()));
                }
                tasks.iter().try_for_each(|child| child.validate_node(names))
            }
        }
    }
}

impl From<LeafTask> for TaskNode {
    fn from(task: LeafTask) -> Self {
        TaskNode::Task(task)
    }
}

/// An error in the configuration of a task tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskTreeError {
    /// A leaf task has an empty name.
    #[error("task name must not be empty")]
    EmptyName,

    /// Two nodes in the tree share the same name.
    #[error("duplicate task name `{0}`")]
    DuplicateName(String),

    /// A leaf task does not name its operation.
    #[error("task `{task}` has no operation")]
    MissingOperation {
        /// The offending task.
        task: String,
    },

    /// A leaf task is configured with zero clients.
    #[error("task `{task}` must have at least one client")]
    NoClients {
        /// The offending task.
        task: String,
    },

    /// Both a target throughput and a target interval are configured.
    #[error("task `{task}` sets both target_throughput and target_interval")]
    ConflictingThroughput {
        /// The offending task.
        task: String,
    },

    /// The target throughput is not a positive, finite number.
    #[error("task `{task}` has invalid target throughput {rate}")]
    InvalidThroughput {
        /// The offending task.
        task: String,
        /// The configured rate in operations per second.
        rate: f64,
    },

    /// Both warmup iterations and a warmup time period are configured.
    #[error("task `{task}` sets both warmup_iterations and warmup_time_period")]
    ConflictingWarmup {
        /// The offending task.
        task: String,
    },

    /// The operation timeout is zero.
    #[error("task `{task}` has a zero timeout")]
    ZeroTimeout {
        /// The offending task.
        task: String,
    },

    /// A sequential or parallel group has no children.
    #[error("task groups must contain at least one task")]
    EmptyGroup,

    /// `completed_by` does not name a direct child of the parallel group.
    #[error("completed_by refers to `{0}`, which is not a child of the parallel group")]
    UnknownCompletedBy(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str) -> TaskNode {
        LeafTask::new(name, "op").into()
    }

    #[test]
    fn parses_yaml_tree() {
        let yaml = r#"
            type: sequential
            tasks:
              - type: task
                name: index
                operation: bulk
                clients: 8
                warmup_iterations: 10
                iterations: 100
                target_interval: 250ms
              - type: parallel
                completed_by: search
                tasks:
                  - type: task
                    name: search
                    operation: query
                    target_throughput: 50
                    pacing: poisson
                    time_period: 2m
                    on_error: abort
                  - type: task
                    name: updates
                    operation: update
                    warmup_time_period: 10s
                    ramp_up_time_period: 5s
                    timeout: 500ms
        "#;

        let tree: TaskNode = serde_yaml::from_str(yaml).unwrap();
        tree.validate().unwrap();

        let leaves = tree.leaves();
        assert_eq!(leaves.len(), 3);

        let index = leaves[0];
        assert_eq!(index.clients, 8);
        assert_eq!(index.throughput(), Throughput::PerClient(4.0));
        assert_eq!(index.iteration_bound(), Some(100));

        let search = leaves[1];
        assert_eq!(search.pacing, PacingMode::Poisson);
        assert_eq!(search.time_period, Some(Duration::from_secs(120)));
        assert_eq!(search.iteration_bound(), None);
        assert_eq!(search.on_error, OnError::Abort);

        let updates = leaves[2];
        assert_eq!(updates.throughput(), Throughput::Unthrottled);
        assert_eq!(updates.warmup_time_period, Some(Duration::from_secs(10)));
        assert_eq!(updates.ramp_up_time_period, Some(Duration::from_secs(5)));
        assert_eq!(updates.timeout, Duration::from_millis(500));
        assert_eq!(updates.iteration_bound(), Some(1));
    }

    #[test]
    fn rejects_duplicate_names() {
        let tree = TaskNode::Sequential(Sequential {
            name: None,
            tasks: vec![leaf("a"), leaf("a")],
        });
        assert_eq!(
            tree.validate(),
            Err(TaskTreeError::DuplicateName("a".into()))
        );
    }

    #[test]
    fn rejects_unknown_completed_by() {
        let tree = TaskNode::Parallel(Parallel {
            name: None,
            tasks: vec![leaf("a"), leaf("b")],
            completed_by: Some("c".into()),
        });
        assert_eq!(
            tree.validate(),
            Err(TaskTreeError::UnknownCompletedBy("c".into()))
        );
    }

    #[test]
    fn rejects_empty_groups() {
        let tree = TaskNode::Parallel(Parallel::default());
        assert_eq!(tree.validate(), Err(TaskTreeError::EmptyGroup));
    }

    #[test]
    fn rejects_inconsistent_leaf_options() {
        let zero_clients = TaskNode::from(LeafTask::new("a", "op").with_clients(0));
        assert!(matches!(
            zero_clients.validate(),
            Err(TaskTreeError::NoClients { .. })
        ));

        let mut both = LeafTask::new("a", "op").with_target_throughput(10.0);
        both.target_interval = Some(Duration::from_millis(100));
        assert!(matches!(
            TaskNode::from(both).validate(),
            Err(TaskTreeError::ConflictingThroughput { .. })
        ));

        let negative = TaskNode::from(LeafTask::new("a", "op").with_target_throughput(-1.0));
        assert!(matches!(
            negative.validate(),
            Err(TaskTreeError::InvalidThroughput { .. })
        ));

        let warmup = LeafTask::new("a", "op")
            .with_warmup_iterations(5)
            .with_warmup_time_period(Duration::from_secs(1));
        assert!(matches!(
            TaskNode::from(warmup).validate(),
            Err(TaskTreeError::ConflictingWarmup { .. })
        ));
    }
}
