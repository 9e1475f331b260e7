//! Error types of the scheduling and execution engine.

use loaddriver_types::{TaskTreeError, WorkerId};
use thiserror::Error;

/// A parameter source failed to produce request parameters.
///
/// This indicates malformed workload data and is always fatal.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ParamError {
    message: String,
}

impl ParamError {
    /// Creates a new error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An error returned by the wire client for a single operation.
///
/// Whether an error is fatal for the run is decided by an
/// [`ErrorPolicy`](crate::client::ErrorPolicy).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OperationError {
    /// The target refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The call did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The target responded with an error status.
    #[error("request failed with status {status}: {message}")]
    Response {
        /// Protocol-specific status code.
        status: u16,
        /// Error description returned by the target.
        message: String,
    },

    /// The request could not be transmitted or the response could not be read.
    #[error("transport error: {0}")]
    Transport(String),

    /// Any other failure that the wire client could not classify.
    #[error("{0}")]
    Other(String),
}

/// An error raised while producing the next schedule entry.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The parameter source failed.
    #[error("parameter source of task `{task}` failed for client {client}: {source}")]
    Params {
        /// The affected task.
        task: String,
        /// The affected client.
        client: usize,
        /// The underlying error.
        #[source]
        source: ParamError,
    },
}

/// A fatal error that stopped a client executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// An operation failed with an error classified as fatal.
    #[error("client {client} of task `{task}` failed fatally in iteration {iteration}: {source}")]
    Fatal {
        /// The affected task.
        task: String,
        /// The affected client.
        client: usize,
        /// The iteration that failed.
        iteration: u64,
        /// The underlying error.
        #[source]
        source: OperationError,
    },

    /// The schedule could not produce the next operation.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The sample sink stopped accepting samples.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// An error of the metrics store.
#[derive(Debug, Error)]
#[error("failed to store samples: {message}")]
pub struct StoreError {
    message: String,
}

impl StoreError {
    /// Creates a new error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An error of the sample sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The run was aborted before the sampled operation started.
    #[error("sample rejected, the run was aborted before the operation started")]
    Aborted,

    /// The drain loop has stopped.
    #[error("sample sink is closed")]
    Closed,

    /// The metrics store failed to ingest a batch.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An error of the phase transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The other side of the transport is gone.
    #[error("phase transport disconnected")]
    Disconnected,

    /// A specific worker cannot be reached.
    #[error("{0} is unreachable")]
    WorkerUnreachable(WorkerId),
}

/// An error that prevents a task tree from running at all.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The task tree failed validation.
    #[error("invalid task tree: {0}")]
    InvalidTree(#[from] TaskTreeError),
}
