//! Buffering of samples between clients and the metrics store.
//!
//! Every worker has one bounded queue. Clients push samples through cloned [`SampleSender`]s, and
//! a single [`SampleDrain`] hands them to the [`MetricsStore`] in batches. When the queue is full,
//! producers wait for space instead of dropping samples. Any such wait is counted and reported as
//! a benchmark validity warning, since it delays the clients that produced the samples.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loaddriver_types::{AbortReason, RunId, Sample, SampleBatch, WorkerId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};

use crate::abort::{AbortFlag, Escalate};
use crate::clock::RunClock;
use crate::config::SinkConfig;
use crate::error::{SinkError, StoreError};

/// Lower bound of the flush interval.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Receives batches of samples.
#[async_trait]
pub trait MetricsStore: fmt::Debug + Send + Sync + 'static {
    /// Ingests a batch of samples.
    ///
    /// An error stops the sink and aborts the run.
    async fn store(&self, batch: SampleBatch) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct SinkStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    backpressure_events: AtomicU64,
    blocked_nanos: AtomicU64,
}

/// Builder for the sample sink of a worker.
#[derive(Debug)]
pub struct SampleSink {
    config: SinkConfig,
    store: Arc<dyn MetricsStore>,
    run: RunId,
    worker: WorkerId,
    abort: Option<AbortFlag>,
    escalate: Option<Arc<dyn Escalate>>,
    clock: RunClock,
}

impl SampleSink {
    /// Creates a sink forwarding to `store`.
    pub fn new(config: SinkConfig, store: Arc<dyn MetricsStore>) -> Self {
        Self {
            config,
            store,
            run: RunId::new(),
            worker: WorkerId(0),
            abort: None,
            escalate: None,
            clock: RunClock::now(),
        }
    }

    /// Sets the run identifier attached to every batch.
    pub fn run_id(mut self, run: RunId) -> Self {
        self.run = run;
        self
    }

    /// Sets the worker identifier attached to every batch.
    pub fn worker(mut self, worker: WorkerId) -> Self {
        self.worker = worker;
        self
    }

    /// Rejects samples of operations started after the run was aborted.
    pub fn abort(mut self, abort: AbortFlag) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Escalates failures of the metrics store.
    pub fn escalate(mut self, escalate: Arc<dyn Escalate>) -> Self {
        self.escalate = Some(escalate);
        self
    }

    /// Sets the clock that sample timestamps are derived from.
    pub fn clock(mut self, clock: RunClock) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the sink.
    ///
    /// The drain must be run for samples to make progress. It completes once all senders are
    /// dropped and every buffered sample has been stored.
    pub fn open(self) -> (SampleSender, SampleDrain) {
        let (tx, rx) = mpsc::channel(self.config.capacity.max(1));
        let stats = Arc::new(SinkStats::default());

        let sender = SampleSender {
            tx,
            stats: Arc::clone(&stats),
            abort: self.abort,
            clock: self.clock,
        };

        let drain = SampleDrain {
            rx,
            stats,
            store: self.store,
            escalate: self.escalate,
            run: self.run,
            worker: self.worker,
            batch_size: self.config.batch_size.max(1),
            flush_interval: self.config.flush_interval.max(MIN_FLUSH_INTERVAL),
        };

        (sender, drain)
    }
}

/// Producer side of the sample sink.
#[derive(Clone, Debug)]
pub struct SampleSender {
    tx: mpsc::Sender<Sample>,
    stats: Arc<SinkStats>,
    abort: Option<AbortFlag>,
    clock: RunClock,
}

impl SampleSender {
    /// Returns the clock that sample timestamps must be derived from.
    pub fn clock(&self) -> RunClock {
        self.clock
    }

    /// Hands a sample to the sink, waiting for space if the queue is full.
    ///
    /// Samples of operations that started after the run was aborted are rejected with
    /// [`SinkError::Aborted`]. Operations in flight at the time of the abort are still accepted.
    pub async fn push(&self, sample: Sample) -> Result<(), SinkError> {
        if let Some(aborted_at) = self.abort.as_ref().and_then(AbortFlag::aborted_at)
            && sample.start > self.clock.wall_time(aborted_at)
        {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SinkError::Aborted);
        }

        match self.tx.try_send(sample) {
            Ok(()) => {}
            Err(TrySendError::Full(sample)) => {
                let events = self.stats.backpressure_events.fetch_add(1, Ordering::Relaxed);
                if events == 0 {
                    tracing::warn!("sample sink is full, clients are blocked by the metrics store");
                }

                let blocked_since = Instant::now();
                let result = self.tx.send(sample).await;
                let blocked = blocked_since.elapsed().as_nanos() as u64;
                self.stats.blocked_nanos.fetch_add(blocked, Ordering::Relaxed);
                result.map_err(|_| SinkError::Closed)?;
            }
            Err(TrySendError::Closed(_)) => return Err(SinkError::Closed),
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Consumer side of the sample sink.
#[derive(Debug)]
pub struct SampleDrain {
    rx: mpsc::Receiver<Sample>,
    stats: Arc<SinkStats>,
    store: Arc<dyn MetricsStore>,
    escalate: Option<Arc<dyn Escalate>>,
    run: RunId,
    worker: WorkerId,
    batch_size: usize,
    flush_interval: Duration,
}

impl SampleDrain {
    /// Forwards samples to the metrics store until all senders are dropped.
    ///
    /// Batches are flushed when they are full or when the flush interval elapses. If the store
    /// fails, the run is aborted and the error is returned.
    pub async fn run(mut self) -> Result<SinkReport, SinkError> {
        let mut report = SinkReport::default();
        let mut buffer = Vec::with_capacity(self.batch_size);

        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            let limit = self.batch_size - buffer.len();
            tokio::select! {
                received = self.rx.recv_many(&mut buffer, limit) => {
                    if received == 0 {
                        break;
                    }
                    if buffer.len() >= self.batch_size {
                        self.flush(&mut buffer, &mut report).await?;
                        ticker.reset();
                    }
                }
                _ = ticker.tick() => {
                    self.flush(&mut buffer, &mut report).await?;
                }
            }
        }

        self.flush(&mut buffer, &mut report).await?;

        report.accepted = self.stats.accepted.load(Ordering::Relaxed);
        report.rejected = self.stats.rejected.load(Ordering::Relaxed);
        report.backpressure_events = self.stats.backpressure_events.load(Ordering::Relaxed);
        report.blocked = Duration::from_nanos(self.stats.blocked_nanos.load(Ordering::Relaxed));

        if let Some(warning) = report.validity_warning() {
            tracing::warn!(worker = %self.worker, "{warning}");
        }
        tracing::debug!(worker = %self.worker, stored = report.stored, "sample sink drained");

        Ok(report)
    }

    async fn flush(
        &self,
        buffer: &mut Vec<Sample>,
        report: &mut SinkReport,
    ) -> Result<(), SinkError> {
        if buffer.is_empty() {
            return Ok(());
        }

        let samples = std::mem::replace(buffer, Vec::with_capacity(self.batch_size));
        let count = samples.len() as u64;
        let batch = SampleBatch {
            run: self.run,
            worker: self.worker,
            samples,
        };

        if let Err(err) = self.store.store(batch).await {
            tracing::error!(error = &err as &dyn std::error::Error, "failed to store samples");
            if let Some(ref escalate) = self.escalate {
                escalate.escalate(AbortReason::SinkFailed {
                    message: err.to_string(),
                });
            }
            return Err(err.into());
        }

        report.stored += count;
        report.batches += 1;
        Ok(())
    }
}

/// Statistics of a drained sample sink.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinkReport {
    /// Samples accepted from clients.
    pub accepted: u64,
    /// Samples handed to the metrics store.
    pub stored: u64,
    /// Batches handed to the metrics store.
    pub batches: u64,
    /// Samples rejected because their operation started after the run was aborted.
    pub rejected: u64,
    /// Number of pushes that had to wait for space in the queue.
    pub backpressure_events: u64,
    /// Total time clients were blocked waiting for space.
    pub blocked: Duration,
}

impl SinkReport {
    /// Returns a warning if clients were slowed down by the sink.
    ///
    /// In that case, the observed throughput was limited by the metrics store rather than by the
    /// system under test.
    pub fn validity_warning(&self) -> Option<String> {
        if self.backpressure_events == 0 {
            return None;
        }

        Some(format!(
            "sample sink applied backpressure {} time(s), blocking clients for {:?}; \
             results may underestimate the throughput of the target",
            self.backpressure_events, self.blocked
        ))
    }
}
