use std::time::Duration;

use loaddriver_cli::config::Config;
use loaddriver_cli::driver;
use loaddriver_cli::target::TargetConfig;
use loaddriver_cli::track::Track;
use loaddriver_types::AbortReason;
use tokio_util::sync::CancellationToken;

const TRACK: &str = r#"
name: smoke
schedule:
  type: sequential
  tasks:
    - type: task
      name: index
      operation: bulk
      clients: 2
      warmup_iterations: 2
      iterations: 5
    - type: task
      name: search
      operation: query
      clients: 2
      target_throughput: 20
      iterations: 10
"#;

fn config(workers: usize, target: TargetConfig) -> Config {
    let mut config = Config::default();
    config.driver.workers = workers;
    config.driver.seed = Some(3);
    config.driver.sink.flush_interval = Duration::from_millis(50);
    config.target = target;
    config
}

fn constant_target(service_time: Duration) -> TargetConfig {
    TargetConfig {
        p50: service_time,
        p99: service_time,
        error_rate: 0.0,
        seed: Some(11),
    }
}

#[tokio::test(start_paused = true)]
async fn runs_track_to_completion() {
    loaddriver_test::tracing::init();

    let track = Track::from_yaml(TRACK).unwrap();
    let config = config(2, constant_target(Duration::from_millis(10)));

    let summary = driver::run(&track, &config, CancellationToken::new())
        .await
        .unwrap();

    assert!(summary.complete, "{summary:?}");
    assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
    assert!(summary.measurement.is_some());

    let index = summary.task("index").unwrap();
    assert_eq!(index.count, 10);
    assert_eq!(index.errors, 0);

    let search = summary.task("search").unwrap();
    assert_eq!(search.count, 20);
    let service_ms = search.latency.p50.as_secs_f64() * 1000.0;
    assert!((9.5..11.5).contains(&service_ms), "p50 was {service_ms}ms");
}

#[tokio::test(start_paused = true)]
async fn records_simulated_errors() {
    let track = Track::from_yaml(TRACK).unwrap();
    let mut target = constant_target(Duration::from_millis(5));
    target.error_rate = 1.0;

    let summary = driver::run(&track, &config(1, target), CancellationToken::new())
        .await
        .unwrap();

    // Error responses are tolerated unless a task aborts on errors.
    assert!(summary.complete);
    let search = summary.task("search").unwrap();
    assert_eq!(search.errors, 20);
    assert_eq!(search.error_rate(), 1.0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_marks_summary_incomplete() {
    let track = Track::from_yaml(
        r#"
        name: endless
        schedule:
          type: task
          name: search
          operation: query
          target_throughput: 10
          time_period: 1h
        "#,
    )
    .unwrap();
    let config = config(1, constant_target(Duration::from_millis(5)));

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { driver::run(&track, &config, cancel).await }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    cancel.cancel();

    let summary = run.await.unwrap().unwrap();
    assert!(!summary.complete);
    assert_eq!(summary.reason, Some(AbortReason::Cancelled));
    // Samples recorded before the cancellation are kept.
    assert!(summary.task("search").is_some());
}

#[tokio::test(start_paused = true)]
async fn rejects_invalid_target() {
    let track = Track::from_yaml(TRACK).unwrap();
    let target = TargetConfig {
        p50: Duration::from_millis(10),
        p99: Duration::from_millis(1),
        ..Default::default()
    };

    let result = driver::run(&track, &config(1, target), CancellationToken::new()).await;
    assert!(result.is_err());
}
