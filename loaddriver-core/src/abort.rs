//! The shared abort flag of a run.
//!
//! Each worker has exactly one [`AbortHandle`], owned by the component acting on behalf of the
//! coordinator. Everybody else holds read-only [`AbortFlag`]s: client executors check the flag
//! before issuing each operation and wait on it while sleeping.

use std::sync::{Arc, OnceLock};

use loaddriver_types::AbortReason;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Escalates fatal conditions to whoever decides about aborting the run.
pub trait Escalate: std::fmt::Debug + Send + Sync + 'static {
    /// Requests the run to be aborted for the given reason.
    fn escalate(&self, reason: AbortReason);
}

#[derive(Debug)]
struct AbortInner {
    token: CancellationToken,
    aborted: OnceLock<(AbortReason, Instant)>,
}

/// Read-only view of the abort state of a run.
#[derive(Clone, Debug)]
pub struct AbortFlag {
    inner: Arc<AbortInner>,
}

impl AbortFlag {
    /// Returns `true` once the run has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Waits until the run is aborted.
    ///
    /// This is cancel-safe and resolves immediately if the run is already aborted.
    pub async fn aborted(&self) {
        self.inner.token.cancelled().await
    }

    /// Returns the reason of the abort, if aborted.
    pub fn reason(&self) -> Option<&AbortReason> {
        self.inner.aborted.get().map(|(reason, _)| reason)
    }

    /// Returns the instant at which the run was aborted, if aborted.
    pub fn aborted_at(&self) -> Option<Instant> {
        self.inner.aborted.get().map(|(_, at)| *at)
    }

    /// Creates a token that is cancelled on abort, but can also be cancelled on its own.
    ///
    /// Used to stop parts of the task tree without aborting the whole run.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }
}

/// The single writer of an [`AbortFlag`].
#[derive(Debug)]
pub struct AbortHandle {
    flag: AbortFlag,
}

impl AbortHandle {
    /// Creates a new handle for a run that has not been aborted.
    pub fn new() -> Self {
        let inner = AbortInner {
            token: CancellationToken::new(),
            aborted: OnceLock::new(),
        };

        Self {
            flag: AbortFlag {
                inner: Arc::new(inner),
            },
        }
    }

    /// Returns a read-only flag observing this handle.
    pub fn flag(&self) -> AbortFlag {
        self.flag.clone()
    }

    /// Aborts the run.
    ///
    /// Only the first reason is kept. Returns `true` if this call aborted the run.
    pub fn abort(&self, reason: AbortReason) -> bool {
        let inner = &self.flag.inner;
        let first = inner.aborted.set((reason, Instant::now())).is_ok();
        inner.token.cancel();
        first
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Escalate for AbortHandle {
    fn escalate(&self, reason: AbortReason) {
        if self.abort(reason.clone()) {
            tracing::error!(%reason, "aborting run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_reason_wins() {
        let handle = AbortHandle::new();
        let flag = handle.flag();
        assert!(!flag.is_aborted());
        assert!(flag.reason().is_none());

        assert!(handle.abort(AbortReason::Cancelled));
        assert!(!handle.abort(AbortReason::SinkFailed {
            message: "late".into()
        }));

        assert!(flag.is_aborted());
        assert_eq!(flag.reason(), Some(&AbortReason::Cancelled));
        assert!(flag.aborted_at().is_some());
        flag.aborted().await;
    }

    #[test]
    fn child_tokens_follow_abort() {
        let handle = AbortHandle::new();
        let flag = handle.flag();

        let stopped = flag.child_token();
        stopped.cancel();
        assert!(!flag.is_aborted());

        let child = flag.child_token();
        handle.abort(AbortReason::Cancelled);
        assert!(child.is_cancelled());
    }
}
