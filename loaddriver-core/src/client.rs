//! Seams to the system under test.
//!
//! The engine never constructs protocol messages itself. It calls a [`WireClient`] once per
//! operation and asks an [`ErrorPolicy`] whether a failed call may be recorded as an error sample
//! or must stop the run.

use std::borrow::Cow;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use loaddriver_types::{LeafTask, OnError, Params};

use crate::error::OperationError;

/// Metadata of a successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseMeta {
    /// Weight of the operation for throughput reporting, such as the number of documents indexed.
    pub weight: f64,
    /// Unit of the weight.
    pub unit: Cow<'static, str>,
}

impl ResponseMeta {
    /// Creates response metadata with a custom weight and unit.
    pub fn weighted(weight: f64, unit: impl Into<Cow<'static, str>>) -> Self {
        Self {
            weight,
            unit: unit.into(),
        }
    }
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self::weighted(1.0, "ops")
    }
}

/// Issues operations against the system under test.
///
/// Implementations are shared by all clients of a worker and called concurrently. A call is
/// expected to surface a single outcome, including after internal retries.
#[async_trait]
pub trait WireClient: fmt::Debug + Send + Sync + 'static {
    /// Executes `operation` with the given parameters.
    ///
    /// The engine enforces `timeout` itself and drops the returned future when it elapses.
    /// Implementations may use it to configure their own timeouts.
    async fn execute(
        &self,
        operation: &str,
        params: &Params,
        timeout: Duration,
    ) -> Result<ResponseMeta, OperationError>;
}

/// Whether a failed operation stops the run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    /// The failure is recorded as an error sample and the client continues.
    NonFatal,
    /// The client stops and the run is aborted.
    Fatal,
}

/// Classifies failed operations.
pub trait ErrorPolicy: fmt::Debug + Send + Sync + 'static {
    /// Returns the severity of `error` raised by an operation of `task`.
    fn classify(&self, task: &LeafTask, error: &OperationError) -> Severity;
}

/// The default [`ErrorPolicy`], driven by [`LeafTask::on_error`].
///
/// With [`OnError::Abort`], every failure is fatal. Otherwise refused connections and errors the
/// wire client could not classify are fatal, while error responses, transport errors and timeouts
/// are recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct OnErrorPolicy;

impl ErrorPolicy for OnErrorPolicy {
    fn classify(&self, task: &LeafTask, error: &OperationError) -> Severity {
        if task.on_error == OnError::Abort {
            return Severity::Fatal;
        }

        match error {
            OperationError::ConnectionRefused(_) | OperationError::Other(_) => Severity::Fatal,
            OperationError::Timeout
            | OperationError::Response { .. }
            | OperationError::Transport(_) => Severity::NonFatal,
        }
    }
}

/// An [`ErrorPolicy`] backed by a closure.
pub struct PolicyFn<F>(pub F);

impl<F> fmt::Debug for PolicyFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PolicyFn").finish_non_exhaustive()
    }
}

impl<F> ErrorPolicy for PolicyFn<F>
where
    F: Fn(&LeafTask, &OperationError) -> Severity + Send + Sync + 'static,
{
    fn classify(&self, task: &LeafTask, error: &OperationError) -> Severity {
        (self.0)(task, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_error_policy_classification() {
        let task = LeafTask::new("t", "op");
        let policy = OnErrorPolicy;

        let response = OperationError::Response {
            status: 429,
            message: "too many requests".into(),
        };
        assert_eq!(policy.classify(&task, &response), Severity::NonFatal);
        assert_eq!(
            policy.classify(&task, &OperationError::Timeout),
            Severity::NonFatal
        );
        assert_eq!(
            policy.classify(&task, &OperationError::ConnectionRefused("down".into())),
            Severity::Fatal
        );
        assert_eq!(
            policy.classify(&task, &OperationError::Other("boom".into())),
            Severity::Fatal
        );

        let strict = task.with_on_error(OnError::Abort);
        assert_eq!(policy.classify(&strict, &response), Severity::Fatal);
    }

    #[test]
    fn closure_policy() {
        let policy = PolicyFn(|_: &LeafTask, error: &OperationError| match error {
            OperationError::Response { status, .. } if *status >= 500 => Severity::Fatal,
            _ => Severity::NonFatal,
        });
        let task = LeafTask::new("t", "op");
        let unavailable = OperationError::Response {
            status: 503,
            message: String::new(),
        };
        assert_eq!(policy.classify(&task, &unavailable), Severity::Fatal);
        assert_eq!(
            policy.classify(&task, &OperationError::Other("x".into())),
            Severity::NonFatal
        );
    }
}
