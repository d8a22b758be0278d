//! Storage actor.
//!
//! [`StorageService`] owns the [`StorageCoordinator`] inside one task and
//! processes [`StorageCommand`]s in arrival order. Every other component talks
//! to it through a cloned [`StorageHandle`]. Request/response commands carry a
//! `oneshot` sender; `Store` is fire-and-forget.
//!
//! Because commands are handled strictly in order, a `Store` sent before an
//! `Extract` is always visible to that extraction.

use super::batch::BatchSource;
use super::coordinator::{StorageCoordinator, StorageStats, SweepReport};
use super::ledger::Batch;
use crate::data::ProcessedSample;
use crate::error::{AppResult, DaqError};
use crate::throttle::LogThrottle;
use async_trait::async_trait;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{error, info, warn};

/// Command channel depth; `store` applies backpressure beyond this.
pub const STORAGE_CHANNEL_CAPACITY: usize = 1024;

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum StorageCommand {
    Store(Box<ProcessedSample>),
    Extract {
        max: usize,
        response: oneshot::Sender<Batch>,
    },
    Acknowledge {
        first: u64,
        last: u64,
        response: oneshot::Sender<usize>,
    },
    Pending {
        response: oneshot::Sender<usize>,
    },
    Rotate {
        reason: String,
        response: oneshot::Sender<AppResult<Option<PathBuf>>>,
    },
    Sweep {
        response: oneshot::Sender<AppResult<SweepReport>>,
    },
    Flush {
        response: oneshot::Sender<AppResult<()>>,
    },
    Stats {
        response: oneshot::Sender<StorageStats>,
    },
    Close {
        response: oneshot::Sender<AppResult<StorageStats>>,
    },
}

pub struct StorageService {
    coordinator: StorageCoordinator,
    sweep_interval: Option<Duration>,
    error_log: LogThrottle,
}

impl StorageService {
    pub fn new(coordinator: StorageCoordinator, sweep_interval: Option<Duration>) -> Self {
        Self {
            coordinator,
            sweep_interval,
            error_log: LogThrottle::new(Duration::from_secs(5)),
        }
    }

    /// Start the actor task.
    ///
    /// The task ends on [`StorageHandle::close`] or when every handle is dropped,
    /// closing the active file either way, and yields the final statistics.
    pub fn spawn(self) -> (StorageHandle, JoinHandle<StorageStats>) {
        let (tx, rx) = mpsc::channel(STORAGE_CHANNEL_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (StorageHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<StorageCommand>) -> StorageStats {
        info!(session = %self.coordinator.session(), "Storage actor started");
        let mut flush_tick = ticker(FLUSH_INTERVAL);
        let mut sweep_tick = self.sweep_interval.map(ticker);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle(command).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = flush_tick.tick() => {
                    if let Err(e) = self.coordinator.flush() {
                        self.report("flush", &e);
                    }
                }
                _ = tick_optional(&mut sweep_tick) => {
                    if let Err(e) = self.coordinator.sweep() {
                        self.report("sweep", &e);
                    }
                }
            }
        }

        if let Err(e) = self.coordinator.close() {
            error!(error = %e, "Failed to close data file");
        }
        let stats = self.coordinator.stats();
        info!(
            records = stats.records_stored,
            files_closed = stats.files_closed,
            pending = stats.pending,
            "Storage actor stopped"
        );
        stats
    }

    fn handle(&mut self, command: StorageCommand) -> ControlFlow<()> {
        match command {
            StorageCommand::Store(sample) => {
                if let Err(e) = self.coordinator.store(*sample) {
                    self.report("store", &e);
                }
            }
            StorageCommand::Extract { max, response } => {
                let _ = response.send(self.coordinator.extract_batch(max));
            }
            StorageCommand::Acknowledge {
                first,
                last,
                response,
            } => {
                let _ = response.send(self.coordinator.acknowledge_range(first, last));
            }
            StorageCommand::Pending { response } => {
                let _ = response.send(self.coordinator.stats().pending);
            }
            StorageCommand::Rotate { reason, response } => {
                let _ = response.send(self.coordinator.rotate(&reason));
            }
            StorageCommand::Sweep { response } => {
                let _ = response.send(self.coordinator.sweep());
            }
            StorageCommand::Flush { response } => {
                let _ = response.send(self.coordinator.flush());
            }
            StorageCommand::Stats { response } => {
                let _ = response.send(self.coordinator.stats());
            }
            StorageCommand::Close { response } => {
                let result = self.coordinator.close().map(|()| self.coordinator.stats());
                let _ = response.send(result);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn report(&mut self, operation: &'static str, e: &DaqError) {
        if let Some(suppressed) = self.error_log.hit() {
            let stats = self.coordinator.stats();
            error!(
                operation,
                error = %e,
                suppressed,
                write_errors = stats.write_errors,
                "Storage failure; processing and publishing continue"
            );
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut tick = interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

async fn tick_optional(tick: &mut Option<Interval>) {
    match tick {
        Some(tick) => {
            tick.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Clonable command interface to the storage actor.
#[derive(Debug, Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StorageCommand>,
}

impl StorageHandle {
    /// Queue one sample for persistence. Waits only when the actor is behind.
    pub async fn store(&self, sample: ProcessedSample) -> AppResult<()> {
        self.tx
            .send(StorageCommand::Store(Box::new(sample)))
            .await
            .map_err(|_| DaqError::ChannelClosed("storage"))
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> StorageCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| DaqError::ChannelClosed("storage"))?;
        rx.await.map_err(|_| DaqError::ChannelClosed("storage"))
    }

    pub async fn rotate(&self, reason: impl Into<String>) -> AppResult<Option<PathBuf>> {
        let reason = reason.into();
        self.request(|response| StorageCommand::Rotate { reason, response })
            .await?
    }

    pub async fn sweep(&self) -> AppResult<SweepReport> {
        self.request(|response| StorageCommand::Sweep { response })
            .await?
    }

    pub async fn flush(&self) -> AppResult<()> {
        self.request(|response| StorageCommand::Flush { response })
            .await?
    }

    pub async fn stats(&self) -> AppResult<StorageStats> {
        self.request(|response| StorageCommand::Stats { response })
            .await
    }

    /// Close the active file and stop the actor.
    pub async fn close(&self) -> AppResult<StorageStats> {
        let result = self
            .request(|response| StorageCommand::Close { response })
            .await;
        if let Err(DaqError::ChannelClosed(_)) = &result {
            warn!("Storage actor already stopped");
        }
        result?
    }
}

#[async_trait]
impl BatchSource for StorageHandle {
    async fn offer(&self, _samples: &[ProcessedSample]) -> AppResult<()> {
        Ok(())
    }

    async fn extract_batch(&self, max: usize) -> AppResult<Batch> {
        self.request(|response| StorageCommand::Extract { max, response })
            .await
    }

    async fn acknowledge(&self, batch: &Batch) -> AppResult<usize> {
        let (first, last) = (batch.first_seq, batch.last_seq);
        self.request(|response| StorageCommand::Acknowledge {
            first,
            last,
            response,
        })
        .await
    }

    async fn pending(&self) -> AppResult<usize> {
        self.request(|response| StorageCommand::Pending { response })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageConfig, StorageFormat};
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

    fn spawn(dir: &std::path::Path) -> (StorageHandle, JoinHandle<StorageStats>) {
        let config = StorageConfig {
            base_dir: dir.to_path_buf(),
            format: StorageFormat::Json,
            ..StorageConfig::default()
        };
        StorageService::new(StorageCoordinator::new(config).unwrap(), None).spawn()
    }

    #[tokio::test]
    async fn stored_samples_are_extractable_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = spawn(dir.path());
        for i in 0..5 {
            handle.store(sample(i as f64)).await.unwrap();
        }
        let batch = handle.extract_batch(10).await.unwrap();
        let xs: Vec<f64> = batch.samples.iter().map(|s| s.acc_raw.x).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        assert_eq!(handle.acknowledge(&batch).await.unwrap(), 5);
        assert_eq!(handle.pending().await.unwrap(), 0);

        let stats = handle.close().await.unwrap();
        assert_eq!(stats.records_stored, 5);
        assert_eq!(task.await.unwrap().records_stored, 5);
    }

    #[tokio::test]
    async fn handle_reports_closed_actor() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = spawn(dir.path());
        handle.close().await.unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.store(sample(0.0)).await,
            Err(DaqError::ChannelClosed("storage"))
        ));
    }

    #[tokio::test]
    async fn dropping_every_handle_closes_file() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, task) = spawn(dir.path());
        handle.store(sample(1.0)).await.unwrap();
        drop(handle);
        let stats = task.await.unwrap();
        assert_eq!(stats.files_closed, 1);
        assert!(stats.active_file.is_none());
    }
}
