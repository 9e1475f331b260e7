//! In-memory aggregation and printing of benchmark results.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use loaddriver_core::RunReport;
use loaddriver_core::error::StoreError;
use loaddriver_core::sink::MetricsStore;
use loaddriver_types::{AbortReason, Outcome, Phase, RunId, RunState, Sample, SampleBatch};
use sketches_ddsketch::DDSketch;
use yansi::Paint;

#[derive(Default)]
struct TaskMetrics {
    operation: Arc<str>,
    service_time: DDSketch,
    latency: DDSketch,
    errors: u64,
    timeouts: u64,
    weight: f64,
    unit: Cow<'static, str>,
    first_start: Option<SystemTime>,
    last_end: Option<SystemTime>,
}

impl TaskMetrics {
    fn record(&mut self, sample: &Sample) {
        self.operation = sample.operation.clone();
        self.service_time.add(sample.service_time.as_secs_f64());
        self.latency.add(sample.latency.as_secs_f64());

        match sample.outcome {
            Outcome::Success => {
                self.weight += sample.weight;
                self.unit = sample.unit.clone();
            }
            Outcome::Error => self.errors += 1,
            Outcome::Timeout => self.timeouts += 1,
        }

        let end = sample.start + sample.service_time;
        self.first_start = Some(match self.first_start {
            Some(first) => first.min(sample.start),
            None => sample.start,
        });
        self.last_end = Some(match self.last_end {
            Some(last) => last.max(end),
            None => end,
        });
    }

    fn window(&self) -> Option<Duration> {
        let window = self.last_end?.duration_since(self.first_start?).ok()?;
        (!window.is_zero()).then_some(window)
    }
}

/// A [`MetricsStore`] that aggregates samples per task and phase in memory.
#[derive(Default)]
pub struct Recorder {
    tasks: Mutex<BTreeMap<(Arc<str>, Phase), TaskMetrics>>,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Summarizes all recorded samples together with the outcome of the run.
    pub fn summarize(&self, report: &RunReport) -> Summary {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        let tasks = tasks
            .iter()
            .map(|((task, phase), metrics)| TaskSummary::new(task.clone(), *phase, metrics))
            .collect();

        let mut warnings = Vec::new();
        for worker in &report.workers {
            match worker.sink {
                Some(ref sink) => {
                    if let Some(warning) = sink.validity_warning() {
                        warnings.push(format!("{}: {warning}", worker.worker));
                    }
                }
                None => warnings.push(format!(
                    "{}: samples were not fully stored; results are incomplete",
                    worker.worker
                )),
            }
        }

        let measurement = match (
            report.conclusion.entered_at(RunState::Measurement),
            report.conclusion.entered_at(RunState::Complete),
        ) {
            (Some(start), Some(end)) => end.duration_since(start).ok(),
            _ => None,
        };

        Summary {
            run: report.run_id,
            complete: report.is_complete(),
            reason: report.conclusion.reason.clone(),
            measurement,
            tasks,
            warnings,
        }
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Recorder")
            .field("tasks", &tasks.len())
            .finish()
    }
}

#[async_trait]
impl MetricsStore for Recorder {
    async fn store(&self, batch: SampleBatch) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for sample in &batch.samples {
            tasks
                .entry((sample.task.clone(), sample.phase))
                .or_default()
                .record(sample);
        }
        Ok(())
    }
}

/// Distribution of a duration.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Percentiles {
    pub mean: Duration,
    pub p50: Duration,
    pub p90: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl Percentiles {
    fn from_sketch(sketch: &DDSketch) -> Self {
        if sketch.count() == 0 {
            return Self::default();
        }

        let quantile = |q| seconds(sketch.quantile(q).ok().flatten());
        Self {
            mean: seconds(sketch.sum().map(|sum| sum / sketch.count() as f64)),
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
            max: seconds(sketch.max()),
        }
    }

    fn print(&self, label: &str) {
        println!(
            "  {label:<13} avg: {:.2?}; p50: {:.2?}; p90: {:.2?}; p99: {:.2?}; max: {:.2?}",
            self.mean.bold(),
            self.p50,
            self.p90,
            self.p99,
            self.max
        );
    }
}

fn seconds(value: Option<f64>) -> Duration {
    value
        .and_then(|v| Duration::try_from_secs_f64(v).ok())
        .unwrap_or_default()
}

/// Results of one task in one phase.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskSummary {
    pub task: Arc<str>,
    pub operation: Arc<str>,
    pub phase: Phase,
    /// Number of samples, including errors and timeouts.
    pub count: usize,
    pub errors: u64,
    pub timeouts: u64,
    /// Operations per second between the first issued and the last completed operation.
    pub throughput: Option<f64>,
    /// Weight of successful operations per second, in `unit`.
    pub weight_throughput: Option<f64>,
    pub unit: Cow<'static, str>,
    pub service_time: Percentiles,
    pub latency: Percentiles,
}

impl TaskSummary {
    fn new(task: Arc<str>, phase: Phase, metrics: &TaskMetrics) -> Self {
        let count = metrics.latency.count();
        let window = metrics.window();

        Self {
            task,
            operation: metrics.operation.clone(),
            phase,
            count,
            errors: metrics.errors,
            timeouts: metrics.timeouts,
            throughput: window.map(|w| count as f64 / w.as_secs_f64()),
            weight_throughput: window.map(|w| metrics.weight / w.as_secs_f64()),
            unit: metrics.unit.clone(),
            service_time: Percentiles::from_sketch(&metrics.service_time),
            latency: Percentiles::from_sketch(&metrics.latency),
        }
    }

    /// Share of samples that did not succeed.
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.errors + self.timeouts) as f64 / self.count as f64
    }

    fn print(&self) {
        print!(
            "{} {} ({}, {} ops",
            "## Task".bold(),
            self.task.bold().blue(),
            self.operation,
            self.count.bold()
        );
        if self.errors > 0 {
            print!(", {}", format!("{} ERRORS", self.errors).bold().red());
        }
        if self.timeouts > 0 {
            print!(", {}", format!("{} TIMEOUTS", self.timeouts).bold().red());
        }
        println!(")");

        if let Some(throughput) = self.throughput {
            print!("  {:.2} operations/s", throughput.bold());
            match self.weight_throughput {
                Some(weight) if !self.unit.is_empty() => {
                    println!(", {:.2} {}/s", weight.bold(), self.unit)
                }
                _ => println!(),
            }
        }

        self.service_time.print("service time:");
        self.latency.print("latency:");
    }
}

/// The outcome of a run as presented to the user.
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    pub run: RunId,
    /// Whether the run covered its full measurement window.
    pub complete: bool,
    pub reason: Option<AbortReason>,
    /// Length of the measurement phase, if the run entered and left it.
    pub measurement: Option<Duration>,
    pub tasks: Vec<TaskSummary>,
    pub warnings: Vec<String>,
}

impl Summary {
    /// Returns the measurement results of `task`.
    pub fn task(&self, task: &str) -> Option<&TaskSummary> {
        self.tasks
            .iter()
            .find(|t| &*t.task == task && t.phase == Phase::Measurement)
    }

    /// Prints the summary to stdout.
    ///
    /// Warmup samples are only counted, never included in the statistics.
    pub fn print(&self, track: &str) {
        println!();
        println!(
            "{} {} (run {})",
            "# Track".bold(),
            track.bold().blue(),
            self.run
        );

        if !self.complete {
            let reason = match self.reason {
                Some(ref reason) => reason.to_string(),
                None => "unknown reason".to_owned(),
            };
            println!(
                "{}",
                format!("RUN ABORTED ({reason}): results do not cover the full measurement")
                    .bold()
                    .red()
            );
        }
        if let Some(measurement) = self.measurement {
            println!("  measurement phase: {:.2?}", measurement.bold());
        }

        for task in &self.tasks {
            println!();
            match task.phase {
                Phase::Measurement => task.print(),
                Phase::Warmup => println!(
                    "{} {} ({} warmup ops, excluded)",
                    "## Task".bold(),
                    task.task.bold().blue(),
                    task.count
                ),
            }
        }

        if !self.warnings.is_empty() {
            println!();
            for warning in &self.warnings {
                println!("{} {warning}", "WARNING:".bold().yellow());
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use loaddriver_core::coordinator::RunConclusion;
    use loaddriver_core::sink::SinkReport;
    use loaddriver_core::worker::WorkerReport;
    use loaddriver_types::WorkerId;

    use super::*;

    fn sample(
        task: &str,
        phase: Phase,
        iteration: u64,
        latency_ms: u64,
        outcome: Outcome,
    ) -> Sample {
        let start = SystemTime::UNIX_EPOCH
            + Duration::from_secs(1_000)
            + Duration::from_millis(iteration * 100);
        Sample {
            task: task.into(),
            operation: "query".into(),
            client: 0,
            iteration,
            start,
            ideal_start: start,
            service_time: Duration::from_millis(latency_ms),
            latency: Duration::from_millis(latency_ms),
            outcome,
            error: None,
            weight: 2.0,
            unit: "docs".into(),
            phase,
        }
    }

    fn report(state: RunState, sink: Option<SinkReport>) -> RunReport {
        let started = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let reason = (state == RunState::Aborted).then_some(AbortReason::Cancelled);
        RunReport {
            run_id: RunId::new(),
            conclusion: RunConclusion {
                state,
                reason: reason.clone(),
                transitions: vec![
                    (RunState::Measurement, started),
                    (RunState::Complete, started + Duration::from_secs(1)),
                ],
            },
            workers: vec![WorkerReport {
                worker: WorkerId(0),
                state,
                reason,
                tasks: Vec::new(),
                sink,
            }],
        }
    }

    async fn record(recorder: &Recorder, samples: Vec<Sample>) {
        let batch = SampleBatch {
            run: RunId::new(),
            worker: WorkerId(0),
            samples,
        };
        recorder.store(batch).await.unwrap();
    }

    #[tokio::test]
    async fn aggregates_measurement_samples() {
        let recorder = Recorder::new();
        let mut samples: Vec<_> = (0..10)
            .map(|i| {
                let latency = (i + 1) * 10;
                sample("search", Phase::Measurement, i, latency, Outcome::Success)
            })
            .collect();
        samples[9].outcome = Outcome::Timeout;
        samples.push(sample("search", Phase::Warmup, 0, 500, Outcome::Success));
        record(&recorder, samples).await;

        let report = report(RunState::Complete, Some(SinkReport::default()));
        let summary = recorder.summarize(&report);
        assert!(summary.complete);
        assert!(summary.warnings.is_empty());
        assert_eq!(summary.measurement, Some(Duration::from_secs(1)));
        assert_eq!(summary.tasks.len(), 2);

        let search = summary.task("search").unwrap();
        assert_eq!(search.count, 10);
        assert_eq!(search.timeouts, 1);
        assert_eq!(search.error_rate(), 0.1);
        assert_eq!(search.unit, "docs");

        // Ten operations between 1000.0s and 1000.9s + 100ms.
        assert_eq!(search.throughput, Some(10.0));
        assert_eq!(search.weight_throughput, Some(18.0));

        // The warmup outlier does not leak into the measurement statistics.
        let p50 = search.latency.p50.as_secs_f64();
        assert!((0.049..0.052).contains(&p50), "p50 was {p50}");
        let max = search.latency.max.as_secs_f64();
        assert!((0.099..0.102).contains(&max), "max was {max}");
    }

    #[tokio::test]
    async fn separates_tasks() {
        let recorder = Recorder::new();
        record(
            &recorder,
            vec![
                sample("index", Phase::Measurement, 0, 10, Outcome::Success),
                sample("search", Phase::Measurement, 0, 10, Outcome::Error),
            ],
        )
        .await;

        let report = report(RunState::Complete, Some(SinkReport::default()));
        let summary = recorder.summarize(&report);
        assert_eq!(summary.task("index").unwrap().errors, 0);
        assert_eq!(summary.task("search").unwrap().errors, 1);
        // A single operation has no throughput window.
        assert_eq!(summary.task("index").unwrap().throughput, None);
    }

    #[tokio::test]
    async fn flags_incomplete_runs() {
        let recorder = Recorder::new();
        let summary = recorder.summarize(&report(RunState::Aborted, None));

        assert!(!summary.complete);
        assert_eq!(summary.reason, Some(AbortReason::Cancelled));
        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].contains("not fully stored"));
    }

    #[tokio::test]
    async fn reports_sink_backpressure() {
        let recorder = Recorder::new();
        let sink = SinkReport {
            backpressure_events: 3,
            blocked: Duration::from_millis(40),
            ..Default::default()
        };
        let summary = recorder.summarize(&report(RunState::Complete, Some(sink)));

        assert_eq!(summary.warnings.len(), 1);
        assert!(summary.warnings[0].starts_with("worker-0: "));
    }
}
