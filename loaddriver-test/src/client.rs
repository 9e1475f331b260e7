//! A scripted stand-in for the system under test.
//!
//! ```
//! use std::time::Duration;
//!
//! use loaddriver_core::error::OperationError;
//! use loaddriver_test::client::ScriptedClient;
//!
//! let client = ScriptedClient::new(Duration::from_millis(50))
//!     .fail_at("search", 2, OperationError::ConnectionRefused("no route".into()));
//! assert_eq!(client.call_count("search"), 0);
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use loaddriver_core::client::{ResponseMeta, WireClient};
use loaddriver_core::error::OperationError;
use loaddriver_types::Params;
use tokio::time::Instant;

/// A call received by a [`ScriptedClient`].
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    /// Name of the operation.
    pub operation: String,
    /// Index of the call among all calls of the same operation.
    pub index: u64,
    /// Parameters passed to the call.
    pub params: Params,
    /// When the call was received.
    pub started: Instant,
}

#[derive(Debug, Default)]
struct Calls {
    counters: HashMap<String, u64>,
    log: Vec<Call>,
}

/// A [`WireClient`] with scripted service times and failures.
///
/// Every call sleeps for the configured service time on the tokio clock, so tests with a paused
/// clock observe exact timings. Calls are numbered per operation across all clients, starting at
/// `0`.
#[derive(Debug)]
pub struct ScriptedClient {
    service_time: Duration,
    operation_times: HashMap<String, Duration>,
    slow_calls: HashMap<(String, u64), Duration>,
    failures: HashMap<(String, u64), OperationError>,
    meta: ResponseMeta,
    calls: Mutex<Calls>,
}

impl ScriptedClient {
    /// Creates a client answering every call successfully after `service_time`.
    pub fn new(service_time: Duration) -> Self {
        Self {
            service_time,
            operation_times: HashMap::new(),
            slow_calls: HashMap::new(),
            failures: HashMap::new(),
            meta: ResponseMeta::default(),
            calls: Mutex::new(Calls::default()),
        }
    }

    /// Uses a different service time for all calls of `operation`.
    pub fn with_operation_time(mut self, operation: &str, service_time: Duration) -> Self {
        self.operation_times.insert(operation.to_owned(), service_time);
        self
    }

    /// Uses a different service time for call `index` of `operation`.
    pub fn slow_at(mut self, operation: &str, index: u64, service_time: Duration) -> Self {
        self.slow_calls
            .insert((operation.to_owned(), index), service_time);
        self
    }

    /// Fails call `index` of `operation` with `error` after the service time elapsed.
    pub fn fail_at(mut self, operation: &str, index: u64, error: OperationError) -> Self {
        self.failures.insert((operation.to_owned(), index), error);
        self
    }

    /// Returns `meta` for all successful calls.
    pub fn with_meta(mut self, meta: ResponseMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Returns all calls received so far, in the order they were received.
    pub fn calls(&self) -> Vec<Call> {
        self.lock().log.clone()
    }

    /// Returns the number of calls received for `operation`.
    pub fn call_count(&self, operation: &str) -> u64 {
        self.lock().counters.get(operation).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Calls> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl WireClient for ScriptedClient {
    async fn execute(
        &self,
        operation: &str,
        params: &Params,
        _timeout: Duration,
    ) -> Result<ResponseMeta, OperationError> {
        let index = {
            let mut calls = self.lock();
            let counter = calls.counters.entry(operation.to_owned()).or_default();
            let index = *counter;
            *counter += 1;
            calls.log.push(Call {
                operation: operation.to_owned(),
                index,
                params: params.clone(),
                started: Instant::now(),
            });
            index
        };

        let key = (operation.to_owned(), index);
        let service_time = self
            .slow_calls
            .get(&key)
            .or_else(|| self.operation_times.get(operation))
            .copied()
            .unwrap_or(self.service_time);
        tokio::time::sleep(service_time).await;

        match self.failures.get(&key) {
            Some(error) => Err(error.clone()),
            None => Ok(self.meta.clone()),
        }
    }
}
