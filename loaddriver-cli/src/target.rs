//! A simulated system under test.
//!
//! [`SimulatedTarget`] answers every operation after a service time drawn from a log-normal
//! distribution, and fails a configurable share of operations with an error response. It lets a
//! track be exercised end to end without a real cluster.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use loaddriver_core::client::{ResponseMeta, WireClient};
use loaddriver_core::error::OperationError;
use loaddriver_types::Params;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use serde::{Deserialize, Serialize};

/// Standard normal quantile of the 99th percentile.
const Z_P99: f64 = 2.3263;

/// HTTP status reported for simulated failures.
const ERROR_STATUS: u16 = 503;

/// Behavior of the simulated target.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Median service time.
    ///
    /// Defaults to `5ms`.
    #[serde(with = "humantime_serde")]
    pub p50: Duration,

    /// 99th percentile service time. Must not be lower than `p50`.
    ///
    /// Defaults to `50ms`.
    #[serde(with = "humantime_serde")]
    pub p99: Duration,

    /// Share of operations that fail with an error response, between `0.0` and `1.0`.
    ///
    /// Defaults to `0.0`.
    pub error_rate: f64,

    /// Seed for service times and failures. Random if unset.
    pub seed: Option<u64>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            p50: Duration::from_millis(5),
            p99: Duration::from_millis(50),
            error_rate: 0.0,
            seed: None,
        }
    }
}

/// A [`WireClient`] that sleeps instead of talking to a cluster.
#[derive(Debug)]
pub struct SimulatedTarget {
    service_time: LogNormal<f64>,
    error_rate: f64,
    rng: Mutex<SmallRng>,
}

impl SimulatedTarget {
    /// Creates a target from its configuration.
    pub fn new(config: &TargetConfig) -> Result<Self> {
        if config.p50.is_zero() {
            bail!("target p50 must be greater than zero");
        }
        if config.p99 < config.p50 {
            bail!(
                "target p99 ({:?}) must not be lower than p50 ({:?})",
                config.p99,
                config.p50
            );
        }
        if !(0.0..=1.0).contains(&config.error_rate) {
            bail!(
                "target error rate {} is not between 0 and 1",
                config.error_rate
            );
        }

        let mu = config.p50.as_secs_f64().ln();
        let sigma = (config.p99.as_secs_f64().ln() - mu) / Z_P99;
        let service_time = LogNormal::new(mu, sigma)?;

        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        Ok(Self {
            service_time,
            error_rate: config.error_rate,
            rng: Mutex::new(rng),
        })
    }

    fn draw(&self) -> (Duration, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let seconds = self.service_time.sample(&mut *rng);
        let delay = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX);
        let failed = rng.random_bool(self.error_rate);
        (delay, failed)
    }
}

#[async_trait]
impl WireClient for SimulatedTarget {
    async fn execute(
        &self,
        operation: &str,
        _params: &Params,
        _timeout: Duration,
    ) -> Result<ResponseMeta, OperationError> {
        let (delay, failed) = self.draw();
        tokio::time::sleep(delay).await;

        if failed {
            tracing::trace!(operation, ?delay, "simulated failure");
            return Err(OperationError::Response {
                status: ERROR_STATUS,
                message: "simulated error".to_owned(),
            });
        }

        Ok(ResponseMeta::default())
    }
}

#[cfg(test)]
mod tests {
    use sketches_ddsketch::DDSketch;

    use super::*;

    fn config(p50: u64, p99: u64) -> TargetConfig {
        TargetConfig {
            p50: Duration::from_millis(p50),
            p99: Duration::from_millis(p99),
            error_rate: 0.0,
            seed: Some(1),
        }
    }

    #[test]
    fn rejects_invalid_profiles() {
        assert!(SimulatedTarget::new(&config(0, 10)).is_err());
        assert!(SimulatedTarget::new(&config(10, 5)).is_err());

        let mut errors = config(5, 10);
        errors.error_rate = 1.5;
        assert!(SimulatedTarget::new(&errors).is_err());
    }

    #[test]
    fn constant_service_time() {
        let target = SimulatedTarget::new(&config(10, 10)).unwrap();
        for _ in 0..10 {
            let (delay, failed) = target.draw();
            assert!(delay.abs_diff(Duration::from_millis(10)) < Duration::from_micros(1));
            assert!(!failed);
        }
    }

    #[test]
    fn service_times_follow_percentiles() {
        let target = SimulatedTarget::new(&config(5, 50)).unwrap();
        let mut sketch = DDSketch::default();
        for _ in 0..20_000 {
            sketch.add(target.draw().0.as_secs_f64());
        }

        let p50 = sketch.quantile(0.5).unwrap().unwrap();
        let p99 = sketch.quantile(0.99).unwrap().unwrap();
        assert!((0.004..0.006).contains(&p50), "p50 was {p50}");
        assert!((0.035..0.065).contains(&p99), "p99 was {p99}");
    }

    #[tokio::test(start_paused = true)]
    async fn fails_every_operation_at_full_error_rate() {
        let mut profile = config(1, 1);
        profile.error_rate = 1.0;
        let target = SimulatedTarget::new(&profile).unwrap();

        let result = target
            .execute("query", &Params::Null, Duration::from_secs(1))
            .await;
        assert!(matches!(
            result,
            Err(OperationError::Response { status: 503, .. })
        ));
    }
}
