//! Runs task trees without a phase coordinator.
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use loaddriver_test::client::ScriptedClient;
//! use loaddriver_test::harness::Standalone;
//! use loaddriver_types::LeafTask;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = Arc::new(ScriptedClient::new(Duration::from_millis(1)));
//! let run = Standalone::new(client)
//!     .run(&LeafTask::new("index", "bulk").into())
//!     .await;
//! assert_eq!(run.samples.len(), 1);
//! # }
//! ```

use std::sync::Arc;

use loaddriver_core::abort::{AbortHandle, Escalate};
use loaddriver_core::client::{ErrorPolicy, WireClient};
use loaddriver_core::config::SinkConfig;
use loaddriver_core::error::{RunnerError, SinkError};
use loaddriver_core::params::ParamSourceFactory;
use loaddriver_core::runner::{RunnerOutcome, TaskRunner};
use loaddriver_core::sink::{SampleSink, SinkReport};
use loaddriver_types::{AbortReason, Sample, TaskNode};

use crate::store::MemoryStore;

/// Result of a [`Standalone`] run.
#[derive(Debug)]
pub struct StandaloneRun {
    /// What the runner returned.
    pub outcome: Result<RunnerOutcome, RunnerError>,
    /// What the sample drain returned.
    pub sink: Result<SinkReport, SinkError>,
    /// Why the run was aborted, if it was.
    pub reason: Option<AbortReason>,
    /// All samples that reached the store.
    pub samples: Vec<Sample>,
}

impl StandaloneRun {
    /// Returns the runner outcome, panicking if the tree was rejected.
    pub fn outcome(&self) -> &RunnerOutcome {
        self.outcome.as_ref().expect("task tree was rejected")
    }

    /// Returns the sink report, panicking if the sink failed.
    pub fn sink(&self) -> &SinkReport {
        self.sink.as_ref().expect("sample sink failed")
    }

    /// Returns the samples of `task`.
    pub fn samples_of(&self, task: &str) -> Vec<&Sample> {
        self.samples.iter().filter(|s| &*s.task == task).collect()
    }
}

/// Runs a task tree on a single worker against a [`MemoryStore`].
///
/// The runner and the sink share one abort handle, so samples of operations started after an
/// abort are rejected just like in a coordinated run.
#[derive(Debug)]
pub struct Standalone {
    client: Arc<dyn WireClient>,
    store: Arc<MemoryStore>,
    sink: SinkConfig,
    params: Option<Arc<dyn ParamSourceFactory>>,
    policy: Option<Arc<dyn ErrorPolicy>>,
    seed: u64,
}

impl Standalone {
    /// Creates a harness issuing operations through `client`.
    pub fn new(client: Arc<dyn WireClient>) -> Self {
        Self {
            client,
            store: Arc::new(MemoryStore::new()),
            sink: SinkConfig::default(),
            params: None,
            policy: None,
            seed: 0,
        }
    }

    /// Stores samples in `store` instead of a fresh one.
    pub fn store(mut self, store: Arc<MemoryStore>) -> Self {
        self.store = store;
        self
    }

    /// Configures the sample sink.
    pub fn sink_config(mut self, config: SinkConfig) -> Self {
        self.sink = config;
        self
    }

    /// Sets the factory for parameter sources.
    pub fn params(mut self, params: Arc<dyn ParamSourceFactory>) -> Self {
        self.params = Some(params);
        self
    }

    /// Sets the error policy.
    pub fn policy(mut self, policy: Arc<dyn ErrorPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Sets the base seed for randomized pacing.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Runs `root` to completion and waits until all samples are stored.
    pub async fn run(self, root: &TaskNode) -> StandaloneRun {
        let handle = Arc::new(AbortHandle::new());
        let flag = handle.flag();
        let escalate: Arc<dyn Escalate> = handle;

        let (sender, drain) = SampleSink::new(self.sink, self.store.clone())
            .abort(flag.clone())
            .escalate(escalate.clone())
            .open();
        let drain = tokio::spawn(drain.run());

        let mut builder = TaskRunner::builder(self.client, sender)
            .abort(flag.clone(), escalate)
            .seed(self.seed);
        if let Some(params) = self.params {
            builder = builder.params(params);
        }
        if let Some(policy) = self.policy {
            builder = builder.policy(policy);
        }

        let runner = builder.build();
        let outcome = runner.run(root).await;
        drop(runner);

        let sink = drain.await.expect("sample drain panicked");

        StandaloneRun {
            outcome,
            sink,
            reason: flag.reason().cloned(),
            samples: self.store.samples(),
        }
    }
}
