//! Alignment of the measurement window across clients.
//!
//! The clients that start with the task tree hold a [`WarmupTicket`] each. A client releases its
//! ticket when it crosses from warmup into measurement or when it stops. Once all tickets of a
//! worker are released, [`WarmupGate::all_warm`] resolves and the worker reports readiness for
//! [`RunState::Measurement`]. Clients crossing into measurement then wait in
//! [`WarmupGate::wait_for_measurement`] until the whole run has entered that state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use loaddriver_types::RunState;
use tokio::sync::{Notify, watch};

#[derive(Debug)]
struct GateInner {
    pending: AtomicUsize,
    released: Notify,
    state: watch::Receiver<RunState>,
}

/// Tracks warmup progress of a worker's clients.
#[derive(Clone, Debug)]
pub struct WarmupGate {
    inner: Arc<GateInner>,
}

impl WarmupGate {
    /// Creates a gate awaiting `clients` tickets and observing the run state.
    pub fn new(clients: usize, state: watch::Receiver<RunState>) -> Self {
        let inner = GateInner {
            pending: AtomicUsize::new(clients),
            released: Notify::new(),
            state,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Hands out a ticket that counts towards [`all_warm`](Self::all_warm).
    pub fn ticket(&self) -> WarmupTicket {
        WarmupTicket {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns the number of tickets that have not been released yet.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Waits until all tickets have been released.
    pub async fn all_warm(&self) {
        loop {
            let notified = self.inner.released.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Releases all outstanding tickets at once.
    ///
    /// Used when the task tree ends before every expected client could start.
    pub fn release_all(&self) {
        self.inner.pending.store(0, Ordering::Release);
        self.inner.released.notify_waiters();
    }

    /// Waits until the run has entered the measurement window.
    ///
    /// Returns the run state at that point, which is [`RunState::Aborted`] if the run was aborted
    /// instead.
    pub async fn wait_for_measurement(&self) -> RunState {
        let mut state = self.inner.state.clone();
        let result = state
            .wait_for(|s| s.has_reached(RunState::Measurement) || s.is_terminal())
            .await
            .map(|state| *state);

        // The sender only goes away once the run is over.
        result.unwrap_or(RunState::Aborted)
    }
}

/// A client's pending warmup, released on drop.
#[derive(Debug)]
pub struct WarmupTicket {
    inner: Arc<GateInner>,
}

impl Drop for WarmupTicket {
    fn drop(&mut self) {
        let _ = self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.inner.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn all_warm_after_tickets_released() {
        let (_tx, rx) = watch::channel(RunState::Warmup);
        let gate = WarmupGate::new(2, rx);
        let first = gate.ticket();
        let second = gate.ticket();

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.all_warm().await }
        });

        drop(first);
        tokio::task::yield_now().await;
        assert_eq!(gate.pending(), 1);
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gate.pending(), 0);
    }

    #[tokio::test]
    async fn no_clients_is_warm() {
        let (_tx, rx) = watch::channel(RunState::Warmup);
        let gate = WarmupGate::new(0, rx);
        gate.all_warm().await;

        // Extra tickets do not underflow.
        drop(gate.ticket());
        assert_eq!(gate.pending(), 0);
    }

    #[tokio::test]
    async fn release_all_unblocks() {
        let (_tx, rx) = watch::channel(RunState::Warmup);
        let gate = WarmupGate::new(5, rx);
        gate.release_all();
        gate.all_warm().await;
    }

    #[tokio::test]
    async fn measurement_wait_follows_run_state() {
        let (tx, rx) = watch::channel(RunState::Warmup);
        let gate = WarmupGate::new(0, rx);

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.wait_for_measurement().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tx.send_replace(RunState::Measurement);
        assert_eq!(waiter.await.unwrap(), RunState::Measurement);

        tx.send_replace(RunState::Aborted);
        assert_eq!(gate.wait_for_measurement().await, RunState::Aborted);
    }
}
