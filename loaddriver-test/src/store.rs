//! An in-memory metrics store.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use loaddriver_core::error::StoreError;
use loaddriver_core::sink::MetricsStore;
use loaddriver_types::{Sample, SampleBatch};

/// A [`MetricsStore`] that keeps all batches in memory.
///
/// Ingestion can be slowed down with [`with_delay`](Self::with_delay) to provoke backpressure,
/// and made to fail with [`failing_after`](Self::failing_after).
#[derive(Debug, Default)]
pub struct MemoryStore {
    delay: Duration,
    fail_after: Option<usize>,
    batches: Mutex<Vec<SampleBatch>>,
}

impl MemoryStore {
    /// Creates an empty store that ingests instantly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` before ingesting each batch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Rejects every batch after the first `batches` were stored.
    pub fn failing_after(mut self, batches: usize) -> Self {
        self.fail_after = Some(batches);
        self
    }

    /// Returns all stored batches.
    pub fn batches(&self) -> Vec<SampleBatch> {
        self.lock().clone()
    }

    /// Returns all stored samples in the order they were stored.
    pub fn samples(&self) -> Vec<Sample> {
        self.lock()
            .iter()
            .flat_map(|batch| batch.samples.iter().cloned())
            .collect()
    }

    /// Returns the stored samples of `task`.
    pub fn samples_of(&self, task: &str) -> Vec<Sample> {
        self.samples()
            .into_iter()
            .filter(|sample| &*sample.task == task)
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SampleBatch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn store(&self, batch: SampleBatch) -> Result<(), StoreError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut batches = self.lock();
        if self.fail_after.is_some_and(|limit| batches.len() >= limit) {
            return Err(StoreError::new("metrics store unavailable"));
        }

        batches.push(batch);
        Ok(())
    }
}
