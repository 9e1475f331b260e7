//! Configuration of the load driver.
//!
//! All types deserialize with defaults for every field, so an empty document yields a working
//! configuration. Durations are expressed in human-readable form, such as `"500ms"` or `"2m"`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration of a benchmark run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Number of workers the clients of every task are distributed over.
    ///
    /// Defaults to `1`.
    pub workers: usize,

    /// Base seed for randomized pacing.
    ///
    /// Tasks that do not configure their own seed derive a per-client seed from this value. When
    /// unset, a random seed is chosen for every run.
    pub seed: Option<u64>,

    /// Buffering of samples between clients and the metrics store.
    pub sink: SinkConfig,

    /// Synchronization of workers.
    pub coordinator: CoordinatorConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            seed: None,
            sink: SinkConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Configuration of the per-worker sample sink.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Maximum number of samples buffered before producers are blocked.
    ///
    /// Defaults to `10000`.
    pub capacity: usize,

    /// Maximum number of samples handed to the metrics store at once.
    ///
    /// Defaults to `1000`.
    pub batch_size: usize,

    /// Maximum time a sample stays buffered before a partial batch is flushed.
    ///
    /// Values below `1ms` are raised to `1ms`. Defaults to `1s`.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 1_000,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Configuration of the phase coordinator.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Time a worker may stay silent while a barrier waits for it.
    ///
    /// Workers send heartbeats while they run, so a barrier only times out on workers that are
    /// unreachable or dead. The initial barrier instead bounds worker setup and times out this
    /// long after the coordinator starts. Defaults to `120s`.
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,

    /// Interval at which workers send heartbeats to the coordinator.
    ///
    /// Must be well below `barrier_timeout`. Defaults to `5s`.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            barrier_timeout: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_document() {
        let config: DriverConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.seed, None);
        assert_eq!(config.sink.capacity, 10_000);
        assert_eq!(config.sink.batch_size, 1_000);
        assert_eq!(config.sink.flush_interval, Duration::from_secs(1));
        assert_eq!(
            config.coordinator.barrier_timeout,
            Duration::from_secs(120)
        );
        assert_eq!(
            config.coordinator.heartbeat_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn parses_human_durations() {
        let json = r#"{
            "workers": 4,
            "seed": 7,
            "sink": { "capacity": 16, "flush_interval": "250ms" },
            "coordinator": { "barrier_timeout": "2m" }
        }"#;
        let config: DriverConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.sink.capacity, 16);
        assert_eq!(config.sink.batch_size, 1_000);
        assert_eq!(config.sink.flush_interval, Duration::from_millis(250));
        assert_eq!(
            config.coordinator.barrier_timeout,
            Duration::from_secs(120)
        );
    }
}
