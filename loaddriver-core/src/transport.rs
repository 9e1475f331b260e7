//! Message channels between workers and the phase coordinator.
//!
//! The engine only depends on the [`CoordinatorTransport`] and [`WorkerTransport`] traits.
//! [`local_transport`] implements both over in-process channels, which is used when all workers
//! run in the same process.

use async_trait::async_trait;
use loaddriver_types::{PhaseMessage, WorkerId};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// The coordinator's end of the phase transport.
#[async_trait]
pub trait CoordinatorTransport: Send + 'static {
    /// Receives the next message from any worker.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not lose a message.
    async fn recv(&mut self) -> Result<(WorkerId, PhaseMessage), TransportError>;

    /// Sends a message to every worker.
    ///
    /// Delivery is attempted to all workers even if some are unreachable. Returns the first
    /// failure in that case.
    async fn broadcast(&mut self, message: PhaseMessage) -> Result<(), TransportError>;
}

/// A worker's end of the phase transport.
#[async_trait]
pub trait WorkerTransport: Send + 'static {
    /// Sends a message to the coordinator.
    async fn send(&mut self, message: PhaseMessage) -> Result<(), TransportError>;

    /// Receives the next message from the coordinator.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not lose a message.
    async fn recv(&mut self) -> Result<PhaseMessage, TransportError>;
}

/// Coordinator side of an in-process transport.
#[derive(Debug)]
pub struct LocalCoordinatorTransport {
    incoming: mpsc::UnboundedReceiver<(WorkerId, PhaseMessage)>,
    workers: Vec<(WorkerId, mpsc::UnboundedSender<PhaseMessage>)>,
}

/// Worker side of an in-process transport.
#[derive(Debug)]
pub struct LocalWorkerTransport {
    id: WorkerId,
    outgoing: mpsc::UnboundedSender<(WorkerId, PhaseMessage)>,
    incoming: mpsc::UnboundedReceiver<PhaseMessage>,
}

impl LocalWorkerTransport {
    /// Returns the worker this end belongs to.
    pub fn id(&self) -> WorkerId {
        self.id
    }
}

/// Creates an in-process transport connecting a coordinator with `workers` workers.
///
/// Workers are numbered from `0` and returned in order.
pub fn local_transport(workers: usize) -> (LocalCoordinatorTransport, Vec<LocalWorkerTransport>) {
    let (outgoing, incoming) = mpsc::unbounded_channel();

    let mut senders = Vec::with_capacity(workers);
    let mut ends = Vec::with_capacity(workers);
    for index in 0..workers {
        let id = WorkerId(index);
        let (tx, rx) = mpsc::unbounded_channel();
        senders.push((id, tx));
        ends.push(LocalWorkerTransport {
            id,
            outgoing: outgoing.clone(),
            incoming: rx,
        });
    }

    let coordinator = LocalCoordinatorTransport {
        incoming,
        workers: senders,
    };

    (coordinator, ends)
}

#[async_trait]
impl CoordinatorTransport for LocalCoordinatorTransport {
    async fn recv(&mut self) -> Result<(WorkerId, PhaseMessage), TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn broadcast(&mut self, message: PhaseMessage) -> Result<(), TransportError> {
        let mut result = Ok(());
        for (id, worker) in &self.workers {
            if worker.send(message.clone()).is_err() && result.is_ok() {
                result = Err(TransportError::WorkerUnreachable(*id));
            }
        }
        result
    }
}

#[async_trait]
impl WorkerTransport for LocalWorkerTransport {
    async fn send(&mut self, message: PhaseMessage) -> Result<(), TransportError> {
        self.outgoing
            .send((self.id, message))
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&mut self) -> Result<PhaseMessage, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Disconnected)
    }
}
