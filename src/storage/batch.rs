//! The batch contract shared by storage and the batch publisher.

use super::ledger::{Batch, PendingLedger};
use crate::data::ProcessedSample;
use crate::error::AppResult;
use async_trait::async_trait;
use tokio::sync::Mutex;

/// At-least-once source of records awaiting transmission.
///
/// `extract_batch` never removes records; only `acknowledge` does.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Make samples available for extraction.
    ///
    /// Sources fed elsewhere (the storage actor records every stored sample)
    /// ignore this.
    async fn offer(&self, samples: &[ProcessedSample]) -> AppResult<()>;

    async fn extract_batch(&self, max: usize) -> AppResult<Batch>;

    /// Retire a delivered batch; returns the number of records retired.
    async fn acknowledge(&self, batch: &Batch) -> AppResult<usize>;

    async fn pending(&self) -> AppResult<usize>;
}

/// In-memory batch source, used when persistent storage is disabled.
pub struct MemoryBatchSource {
    ledger: Mutex<PendingLedger>,
}

impl MemoryBatchSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            ledger: Mutex::new(PendingLedger::new(capacity)),
        }
    }
}

#[async_trait]
impl BatchSource for MemoryBatchSource {
    async fn offer(&self, samples: &[ProcessedSample]) -> AppResult<()> {
        let mut ledger = self.ledger.lock().await;
        for sample in samples {
            ledger.push(sample.clone());
        }
        Ok(())
    }

    async fn extract_batch(&self, max: usize) -> AppResult<Batch> {
        Ok(self.ledger.lock().await.extract(max))
    }

    async fn acknowledge(&self, batch: &Batch) -> AppResult<usize> {
        Ok(self
            .ledger
            .lock()
            .await
            .acknowledge(batch.first_seq, batch.last_seq))
    }

    async fn pending(&self) -> AppResult<usize> {
        Ok(self.ledger.lock().await.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Vector3;
    use chrono::Utc;

    fn sample(x: f64) -> ProcessedSample {
        ProcessedSample {
            timestamp: Utc::now(),
            acc_raw: Vector3::new(x, 0.0, 0.0),
            acc_filtered: Vector3::ZERO,
            velocity: Vector3::ZERO,
            displacement: Vector3::ZERO,
            displacement_magnitude: 0.0,
            dominant_freq: Vector3::ZERO,
            overall_dominant_freq: 0.0,
            rls_warmed_up: false,
        }
    }

    #[tokio::test]
    async fn unacknowledged_batch_is_returned_again() {
        let source = MemoryBatchSource::new(100);
        let samples: Vec<_> = (0..5).map(|i| sample(i as f64)).collect();
        source.offer(&samples).await.unwrap();

        let first = source.extract_batch(3).await.unwrap();
        let again = source.extract_batch(3).await.unwrap();
        assert_eq!(first, again);

        assert_eq!(source.acknowledge(&first).await.unwrap(), 3);
        let rest = source.extract_batch(10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest.samples[0].acc_raw.x, 3.0);
        assert_eq!(source.pending().await.unwrap(), 2);
    }
}
