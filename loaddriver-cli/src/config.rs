//! Configuration of the load driver binary.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//!
//! 1. Environment variables (prefixed with `LD__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! Benchmark tracks are separate files and passed to the `run` command directly. The
//! configuration only covers how a run is executed and observed.
//!
//! # Environment Variables
//!
//! Environment variables use `LD__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `LD__DRIVER__WORKERS=4` distributes the clients of every task over four workers
//! - `LD__DRIVER__SINK__CAPACITY=50000` sets the number of buffered samples per worker
//! - `LD__TARGET__P99=250ms` sets the simulated 99th percentile service time
//!
//! # YAML Configuration File
//!
//! The above configuration in YAML format would look like this:
//!
//! ```yaml
//! driver:
//!   workers: 4
//!   sink:
//!     capacity: 50000
//!
//! target:
//!   p99: 250ms
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use loaddriver_core::config::DriverConfig;
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::target::TargetConfig;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "LD__";

/// Newtype around `String` that may protect against accidental logging of secrets in the
/// configuration. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl std::ops::Deref for ConfigSecret {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Configuration of the Tokio runtime the benchmark runs on.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads of the runtime.
    ///
    /// All simulated clients of all workers share this thread pool. If the pool is saturated,
    /// operations start late, which shows up as queueing delay in the reported latencies.
    ///
    /// # Default
    ///
    /// Defaults to the number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `LD__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting.
///
/// Sentry is disabled by default and only enabled when a DSN is provided. Aborted runs are
/// reported as errors.
#[derive(Debug, Deserialize, Serialize)]
pub struct Sentry {
    /// Sentry DSN (Data Source Name).
    ///
    /// # Default
    ///
    /// `None` (Sentry disabled)
    ///
    /// # Environment Variable
    ///
    /// `LD__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name of this benchmark setup, such as `"nightly"`.
    ///
    /// # Environment Variable
    ///
    /// `LD__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Name of the machine running the load driver.
    ///
    /// # Environment Variable
    ///
    /// `LD__SENTRY__SERVER_NAME`
    pub server_name: Option<Cow<'static, str>>,

    /// Error event sampling rate between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `1.0` (send all errors)
    ///
    /// # Environment Variable
    ///
    /// `LD__SENTRY__SAMPLE_RATE`
    pub sample_rate: f32,

    /// Performance trace sampling rate between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `0.01` (send 1% of traces)
    ///
    /// # Environment Variable
    ///
    /// `LD__SENTRY__TRACES_SAMPLE_RATE`
    pub traces_sample_rate: f32,

    /// Enable Sentry SDK debug mode.
    ///
    /// # Environment Variable
    ///
    /// `LD__SENTRY__DEBUG`
    pub debug: bool,

    /// Additional tags attached to all Sentry events.
    ///
    /// # Environment Variables
    ///
    /// `LD__SENTRY__TAGS__<KEY>=<VALUE>`
    pub tags: BTreeMap<String, String>,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            server_name: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
            debug: false,
            tags: BTreeMap::new(),
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output without colors.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

impl std::error::Error for FormatParseError {}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs go to stderr, so that the summary printed to stdout can be redirected on its own.
#[derive(Debug, Deserialize, Serialize)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// Overridden by `RUST_LOG` if it is set.
    ///
    /// # Default
    ///
    /// `info`
    ///
    /// # Environment Variable
    ///
    /// `LD__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format.
    ///
    /// # Default
    ///
    /// `auto`
    ///
    /// # Environment Variable
    ///
    /// `LD__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Main configuration struct of the load driver.
///
/// Every field has a default, so the binary runs without any configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    /// Execution of a benchmark run: workers, pacing seed, sample buffering and barriers.
    ///
    /// See [`DriverConfig`] for all options.
    pub driver: DriverConfig,

    /// Service time and error behavior of the simulated target.
    pub target: TargetConfig,

    /// Tokio runtime configuration.
    pub runtime: Runtime,

    /// Logging configuration.
    pub logging: Logging,

    /// Sentry error reporting.
    pub sentry: Sentry,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided in `args`)
    /// 3. Environment variables (prefixed with `LD__`)
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML configuration file cannot be read or parsed, or if
    /// environment variables contain invalid values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults_without_sources() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert_eq!(config.driver.workers, 1);
            assert_eq!(config.driver.seed, None);
            assert_eq!(config.driver.sink.capacity, 10_000);
            assert_eq!(config.logging.level, LevelFilter::INFO);
            assert_eq!(config.logging.format, LogFormat::Auto);
            assert!(!config.sentry.is_enabled());
            assert_eq!(config.target.error_rate, 0.0);

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LD__DRIVER__WORKERS", "4");
            jail.set_env("LD__DRIVER__SEED", "42");
            jail.set_env("LD__DRIVER__SINK__FLUSH_INTERVAL", "250ms");
            jail.set_env("LD__DRIVER__COORDINATOR__BARRIER_TIMEOUT", "2m");
            jail.set_env("LD__TARGET__P99", "80ms");
            jail.set_env("LD__TARGET__ERROR_RATE", "0.1");
            jail.set_env("LD__LOGGING__LEVEL", "debug");
            jail.set_env("LD__LOGGING__FORMAT", "json");
            jail.set_env("LD__SENTRY__DSN", "abcde");
            jail.set_env("LD__SENTRY__ENVIRONMENT", "nightly");
            jail.set_env("LD__SENTRY__TAGS__TRACK", "geonames");

            let config = Config::load(None).unwrap();

            assert_eq!(config.driver.workers, 4);
            assert_eq!(config.driver.seed, Some(42));
            assert_eq!(
                config.driver.sink.flush_interval,
                Duration::from_millis(250)
            );
            assert_eq!(
                config.driver.coordinator.barrier_timeout,
                Duration::from_secs(120)
            );
            assert_eq!(config.target.p99, Duration::from_millis(80));
            assert_eq!(config.target.error_rate, 0.1);
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.sentry.dsn.unwrap().expose_secret().as_str(), "abcde");
            assert_eq!(config.sentry.environment.as_deref(), Some("nightly"));
            assert_eq!(
                config.sentry.tags,
                [("track".into(), "geonames".into())].into()
            );

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            driver:
                workers: 2
                sink:
                    capacity: 500
                    batch_size: 50
            target:
                p50: 2ms
                p99: 20ms
            sentry:
                dsn: abcde
                sample_rate: 0.5
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.driver.workers, 2);
            assert_eq!(config.driver.sink.capacity, 500);
            assert_eq!(config.driver.sink.batch_size, 50);
            // Unset fields of a nested section keep their defaults.
            assert_eq!(config.driver.sink.flush_interval, Duration::from_secs(1));
            assert_eq!(config.target.p50, Duration::from_millis(2));
            assert_eq!(config.target.p99, Duration::from_millis(20));
            assert_eq!(config.sentry.dsn.unwrap().expose_secret().as_str(), "abcde");
            assert_eq!(config.sentry.sample_rate, 0.5);

            Ok(())
        });
    }

    #[test]
    fn configured_with_env_and_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            driver:
                workers: 2
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("LD__DRIVER__WORKERS", "8");
            let config = Config::load(Some(tempfile.path())).unwrap();

            // Env should overwrite the yaml config
            assert_eq!(config.driver.workers, 8);

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_log_format() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("LD__LOGGING__FORMAT", "xml");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn redacts_secrets() {
        let secret = ConfigSecret::from("hunter2");
        assert_eq!(format!("{secret:?}"), "[redacted]");
        assert_eq!(&*secret, "hunter2");
    }
}
