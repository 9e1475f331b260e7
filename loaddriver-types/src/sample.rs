//! Timing records produced by clients.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifies a single benchmark run.
///
/// Every batch handed to the metrics store carries the run identifier, so samples from
/// concurrent or subsequent runs never mix.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a new, time-ordered run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies a worker participating in a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// The measurement phase a sample belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Produced like any other sample, but meant to be excluded from results.
    Warmup,
    /// Part of the measurement window.
    Measurement,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Warmup => f.write_str("warmup"),
            Phase::Measurement => f.write_str("measurement"),
        }
    }
}

/// The result of a single operation attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The operation succeeded.
    Success,
    /// The operation failed with an error the task tolerates.
    Error,
    /// The operation did not complete within its timeout.
    Timeout,
}

/// Timing of one completed or failed operation attempt.
///
/// Samples are immutable once created. The latency of a sample is measured from the time the
/// operation *should* have been issued, so it includes any queueing delay a client incurred
/// because it could not start on time. It is therefore never less than the service time.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Sample {
    /// Name of the task that issued the operation.
    pub task: Arc<str>,
    /// Name of the operation.
    pub operation: Arc<str>,
    /// Index of the client within its task.
    pub client: usize,
    /// Index of the operation within the client's schedule.
    pub iteration: u64,
    /// Wall-clock time at which the operation was actually issued.
    #[serde(with = "humantime_serde")]
    pub start: SystemTime,
    /// Wall-clock time at which the operation was scheduled to be issued.
    ///
    /// Equal to [`start`](Self::start) for unthrottled tasks.
    #[serde(with = "humantime_serde")]
    pub ideal_start: SystemTime,
    /// Duration of the call itself.
    #[serde(with = "humantime_serde")]
    pub service_time: Duration,
    /// Time from the ideal issue time to completion.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Result of the attempt.
    pub outcome: Outcome,
    /// Description of the error for failed attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Weight of the operation for throughput reporting, such as the number of documents.
    pub weight: f64,
    /// Unit of [`weight`](Self::weight).
    pub unit: Cow<'static, str>,
    /// Phase the sample was produced in.
    pub phase: Phase,
}

impl Sample {
    /// Returns the time the operation waited beyond its ideal issue time.
    pub fn queueing_delay(&self) -> Duration {
        self.latency.saturating_sub(self.service_time)
    }
}

/// A batch of samples handed to the metrics store.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SampleBatch {
    /// The run that produced the samples.
    pub run: RunId,
    /// The worker that produced the samples.
    pub worker: WorkerId,
    /// The samples in the order they were received by the sink.
    pub samples: Vec<Sample>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_durations_human_readable() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let sample = Sample {
            task: "search".into(),
            operation: "query".into(),
            client: 3,
            iteration: 7,
            start,
            ideal_start: start - Duration::from_millis(5),
            service_time: Duration::from_millis(20),
            latency: Duration::from_millis(25),
            outcome: Outcome::Success,
            error: None,
            weight: 1.0,
            unit: "ops".into(),
            phase: Phase::Measurement,
        };

        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["service_time"], "20ms");
        assert_eq!(json["latency"], "25ms");
        assert_eq!(json["outcome"], "success");
        assert_eq!(json["phase"], "measurement");
        assert!(json.get("error").is_none());

        let parsed: Sample = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.queueing_delay(), Duration::from_millis(5));
    }

    #[test]
    fn worker_display() {
        assert_eq!(WorkerId(2).to_string(), "worker-2");
    }
}
