use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use loaddriver_core::config::DriverConfig;
use loaddriver_core::error::OperationError;
use loaddriver_core::runner::NodeStatus;
use loaddriver_core::{Collaborators, run_local};
use loaddriver_test::client::ScriptedClient;
use loaddriver_test::store::MemoryStore;
use loaddriver_types::task::Sequential;
use loaddriver_types::{AbortReason, LeafTask, Phase, RunState, TaskNode, WorkerId};
use tokio_util::sync::CancellationToken;

const MS: Duration = Duration::from_millis(1);

fn config(workers: usize) -> DriverConfig {
    DriverConfig {
        workers,
        seed: Some(42),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn completes_on_two_workers() {
    loaddriver_test::tracing::init();

    let client = Arc::new(ScriptedClient::new(MS));
    let store = Arc::new(MemoryStore::new());
    let root: TaskNode = LeafTask::new("query", "search")
        .with_clients(4)
        .with_target_throughput(10.0)
        .with_warmup_iterations(2)
        .with_iterations(3)
        .into();

    let collaborators = Collaborators::new(client.clone(), store.clone());
    let report = run_local(&root, &config(2), collaborators, CancellationToken::new()).await;

    assert!(report.is_complete(), "{report:#?}");
    assert_eq!(report.conclusion.reason, None);
    assert!(report.conclusion.entered_at(RunState::Measurement).is_some());

    assert_eq!(report.workers.len(), 2);
    for worker in &report.workers {
        assert_eq!(worker.state, RunState::Complete);
        assert_eq!(worker.tasks.len(), 1);
        assert_eq!(worker.tasks[0].clients, 2);
        assert_eq!(worker.tasks[0].status, NodeStatus::Completed);
        assert_eq!(worker.sink.as_ref().unwrap().stored, 10);
    }

    let samples = store.samples();
    assert_eq!(samples.len(), 20);
    assert_eq!(samples.iter().filter(|s| s.phase == Phase::Warmup).count(), 8);
    let clients: BTreeSet<_> = samples.iter().map(|s| s.client).collect();
    assert_eq!(clients, (0..4).collect::<BTreeSet<_>>());

    let batches = store.batches();
    assert!(batches.iter().all(|b| b.run == report.run_id));
    let workers: BTreeSet<_> = batches.iter().map(|b| b.worker).collect();
    assert_eq!(workers, BTreeSet::from([WorkerId(0), WorkerId(1)]));
}

#[tokio::test(start_paused = true)]
async fn fatal_error_aborts_all_workers() {
    let client = Arc::new(ScriptedClient::new(MS).fail_at(
        "search",
        3,
        OperationError::ConnectionRefused("node unreachable".into()),
    ));
    let store = Arc::new(MemoryStore::new());
    let root: TaskNode = LeafTask::new("query", "search")
        .with_clients(2)
        .with_target_throughput(10.0)
        .with_iterations(10)
        .into();

    let collaborators = Collaborators::new(client.clone(), store.clone());
    let report = run_local(&root, &config(2), collaborators, CancellationToken::new()).await;

    assert!(!report.is_complete());
    assert_eq!(report.conclusion.state, RunState::Aborted);
    assert!(matches!(
        report.conclusion.reason,
        Some(AbortReason::TaskFailed { ref task, .. }) if task == "query"
    ));

    for worker in &report.workers {
        assert_eq!(worker.state, RunState::Aborted);
        assert_eq!(worker.reason, report.conclusion.reason);
        assert!(worker.sink.is_some(), "samples are flushed after an abort");
    }

    let samples = store.samples().len();
    assert!((3..20).contains(&samples), "stored {samples} samples");
    assert!(client.call_count("search") < 20);
}

#[tokio::test(start_paused = true)]
async fn cancellation_flushes_samples() {
    let client = Arc::new(ScriptedClient::new(MS));
    let store = Arc::new(MemoryStore::new());
    let root: TaskNode = LeafTask::new("query", "search")
        .with_clients(2)
        .with_target_throughput(10.0)
        .with_time_period(Duration::from_secs(3600))
        .into();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    });

    let collaborators = Collaborators::new(client, store.clone());
    let report = run_local(&root, &config(2), collaborators, cancel).await;

    assert_eq!(report.conclusion.reason, Some(AbortReason::Cancelled));
    assert!(!report.is_complete());

    let stored: u64 = report
        .workers
        .iter()
        .map(|w| w.sink.as_ref().unwrap().stored)
        .sum();
    assert!(stored >= 10, "stored {stored} samples");
    assert_eq!(store.samples().len() as u64, stored);
}

#[tokio::test(start_paused = true)]
async fn invalid_tree_aborts_before_warmup() {
    let client = Arc::new(ScriptedClient::new(MS));
    let store = Arc::new(MemoryStore::new());
    let root: TaskNode = LeafTask::new("query", "search").with_clients(0).into();

    let collaborators = Collaborators::new(client.clone(), store.clone());
    let report = run_local(&root, &config(2), collaborators, CancellationToken::new()).await;

    assert!(matches!(
        report.conclusion.reason,
        Some(AbortReason::InvalidConfiguration { .. })
    ));
    assert!(report.conclusion.entered_at(RunState::Warmup).is_none());
    assert_eq!(client.call_count("search"), 0);
    assert!(report.workers.iter().all(|w| w.sink.is_none()));
}

#[tokio::test(start_paused = true)]
async fn idle_worker_waits_out_a_long_measurement() {
    let client = Arc::new(ScriptedClient::new(MS));
    let store = Arc::new(MemoryStore::new());
    // Worker 1 has no client and is ready for completion right away.
    let root: TaskNode = LeafTask::new("query", "search")
        .with_target_throughput(1.0)
        .with_time_period(Duration::from_secs(300))
        .into();

    let config = config(2);
    assert!(config.coordinator.barrier_timeout < Duration::from_secs(300));

    let collaborators = Collaborators::new(client, store.clone());
    let report = run_local(&root, &config, collaborators, CancellationToken::new()).await;

    assert!(report.is_complete(), "{:?}", report.conclusion);
    assert_eq!(report.workers[1].tasks[0].clients, 0);
    let samples = store.samples().len();
    assert!((299..=301).contains(&samples), "stored {samples} samples");
}

#[tokio::test(start_paused = true)]
async fn later_task_with_fewer_clients_than_workers() {
    let client = Arc::new(ScriptedClient::new(MS));
    let store = Arc::new(MemoryStore::new());
    let root = TaskNode::Sequential(Sequential {
        name: None,
        tasks: vec![
            LeafTask::new("index", "bulk").with_clients(2).into(),
            LeafTask::new("query", "search")
                .with_target_throughput(1.0)
                .with_time_period(Duration::from_secs(200))
                .into(),
        ],
    });

    let collaborators = Collaborators::new(client.clone(), store.clone());
    let report = run_local(&root, &config(2), collaborators, CancellationToken::new()).await;

    assert!(report.is_complete(), "{:?}", report.conclusion);
    assert_eq!(client.call_count("bulk"), 2);
    assert!(client.call_count("search") >= 199);
}

#[tokio::test(start_paused = true)]
async fn measurement_starts_after_the_slowest_warmup() {
    let client = Arc::new(ScriptedClient::new(MS));
    let store = Arc::new(MemoryStore::new());
    // Client 1 runs on worker 1 and starts 500ms after client 0 on worker 0.
    let root: TaskNode = LeafTask::new("query", "search")
        .with_clients(2)
        .with_ramp_up(Duration::from_secs(1))
        .with_target_throughput(10.0)
        .with_warmup_iterations(2)
        .with_iterations(3)
        .into();

    let collaborators = Collaborators::new(client, store.clone());
    let report = run_local(&root, &config(2), collaborators, CancellationToken::new()).await;
    assert!(report.is_complete(), "{:?}", report.conclusion);

    let measurement = report.conclusion.entered_at(RunState::Measurement).unwrap();
    let warmup = report.conclusion.entered_at(RunState::Warmup).unwrap();
    assert!(measurement.duration_since(warmup).unwrap() >= Duration::from_millis(500));

    let samples = store.samples();
    let measured: Vec<_> = samples
        .iter()
        .filter(|s| s.phase == Phase::Measurement)
        .collect();
    assert_eq!(measured.len(), 6);
    for sample in &measured {
        assert!(sample.start >= measurement, "{sample:?}");
        assert!(sample.ideal_start >= measurement, "{sample:?}");
    }

    // The fast client waited at the gate, but its first measured operation is not late.
    let first = measured
        .iter()
        .filter(|s| s.client == 0)
        .min_by_key(|s| s.iteration)
        .unwrap();
    assert_eq!(first.iteration, 2);
    assert!(first.queueing_delay() <= MS, "{first:?}");
}
