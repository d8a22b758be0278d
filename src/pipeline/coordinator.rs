//! Pipeline coordinator: epochs, reconnection and shutdown.
//!
//! The coordinator owns one instance of every component. For each connection
//! epoch it moves the reader, decoder and processor into their stage tasks
//! and takes them back when the epoch ends:
//!
//! ```text
//! Idle ──> Recovering ──(reopen + probe)──> Running{1} ──(loss)──> Recovering
//!              ^                                                        │
//!              └──────────────(reopen + probe)── Running{n} <──────────┘
//! any ──(stop / bounded retries exhausted)──> Stopped
//! ```
//!
//! The processor is reset before every epoch, so no integration state crosses
//! a gap. The publisher and the storage actor live for the whole run.

use super::stages::{decoder_stage, processor_stage, publisher_stage, reader_stage, ReaderEnd};
use super::state::{PipelineState, PipelineStatus, SensorLink, StatusBoard};
use super::stop::{stop_pair, StopHandle, StopSignal};
use crate::config::AppConfig;
use crate::data::{ProcessedSample, SignalProcessor};
use crate::error::{AppResult, DaqError, DeviceErrorKind};
use crate::error_recovery::{handle_recoverable_error, ReconnectPolicy, Recoverable, RecoveryOutcome};
use crate::protocol::{DecoderStats, FrameDecoder};
use crate::publisher::{create_publisher, BrokerTransport, PublisherStats};
use crate::storage::{
    BatchSource, MemoryBatchSource, StorageCoordinator, StorageHandle, StorageService, StorageStats,
};
use crate::transport::{DynSerial, LossReason, PortOpener, TransportReader};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Final counters of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub epochs: u32,
    pub reconnects: u32,
    pub samples_processed: u64,
    pub decoder: DecoderStats,
    pub storage: Option<StorageStats>,
    pub publisher: PublisherStats,
}

/// Reopens the sensor port and waits for one valid frame.
struct SensorReopen<'a> {
    opener: &'a dyn PortOpener,
    probe_timeout: Duration,
    opened: Option<(DynSerial, Vec<u8>)>,
}

#[async_trait]
impl Recoverable<DaqError> for SensorReopen<'_> {
    async fn recover(&mut self) -> Result<(), DaqError> {
        let mut port = self.opener.open().await?;
        let probed = probe(&mut port, self.probe_timeout).await?;
        self.opened = Some((port, probed));
        Ok(())
    }

    fn describe(&self) -> String {
        self.opener.describe()
    }
}

/// Read until the bytes contain one checksum-valid frame.
///
/// Returns everything read so the frames are not lost.
async fn probe(port: &mut DynSerial, timeout: Duration) -> AppResult<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut scratch = FrameDecoder::new();
    let mut seen = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(DaqError::device(
                DeviceErrorKind::SilenceTimeout,
                format!("no valid frame within {timeout:?} of opening"),
            ));
        }
        match tokio::time::timeout(remaining, port.read(&mut buf)).await {
            Ok(Ok(0)) => return Err(LossReason::EndOfStream.into()),
            Ok(Ok(n)) => {
                seen.extend_from_slice(&buf[..n]);
                scratch.push(&buf[..n]);
                if scratch.decode_next().is_some() {
                    return Ok(seen);
                }
            }
            Ok(Err(e)) => return Err(LossReason::classify(&e).into()),
            Err(_) => {}
        }
    }
}

struct Epoch {
    reader: TransportReader,
    decoder: FrameDecoder,
    processor: SignalProcessor,
    end: ReaderEnd,
}

/// Wait for a stage, aborting it after `timeout`.
async fn join_stage<T>(
    stage: &'static str,
    mut task: JoinHandle<T>,
    timeout: Duration,
    discard: &StopHandle,
) -> AppResult<T> {
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DaqError::StageFailed {
            stage: stage.to_string(),
            message: e.to_string(),
        }),
        Err(_) => {
            discard.stop();
            task.abort();
            error!(stage, ?timeout, "Stage did not stop in time");
            Err(DaqError::StageTimeout {
                stage: stage.to_string(),
                timeout,
            })
        }
    }
}

/// Owns the components and drives the pipeline state machine.
pub struct PipelineCoordinator {
    config: AppConfig,
    opener: Arc<dyn PortOpener>,
    transport: Box<dyn BrokerTransport>,
    status: StatusBoard,
    stop: StopHandle,
}

impl PipelineCoordinator {
    pub fn new(
        config: AppConfig,
        opener: Arc<dyn PortOpener>,
        transport: Box<dyn BrokerTransport>,
    ) -> AppResult<Self> {
        config.validate()?;
        let (stop, _) = stop_pair();
        Ok(Self {
            config,
            opener,
            transport,
            status: StatusBoard::new(),
            stop,
        })
    }

    /// Handle that stops [`run`](Self::run) from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.status.subscribe()
    }

    /// Run until stopped, or until a bounded reconnect policy gives up.
    ///
    /// Shutdown always completes: the publisher is flushed and the storage
    /// session closed even when acquisition failed.
    pub async fn run(self) -> AppResult<PipelineReport> {
        let PipelineCoordinator {
            config,
            opener,
            transport,
            status,
            stop,
        } = self;
        let stop_signal = stop.signal();
        let shutdown_timeout = config.pipeline.shutdown_timeout();

        let (storage, storage_task, batch_source): (
            Option<StorageHandle>,
            Option<JoinHandle<StorageStats>>,
            Arc<dyn BatchSource>,
        ) = if config.storage.enabled {
            let coordinator = if config.publisher.strategy == "batch" {
                StorageCoordinator::new(config.storage.clone())?
            } else {
                StorageCoordinator::without_backlog(config.storage.clone())?
            };
            let sweep = (config.storage.sweep_interval_s > 0)
                .then(|| Duration::from_secs(config.storage.sweep_interval_s));
            let (handle, task) = StorageService::new(coordinator, sweep).spawn();
            (
                Some(handle.clone()),
                Some(task),
                Arc::new(handle) as Arc<dyn BatchSource>,
            )
        } else {
            info!("Storage disabled, batches are kept in memory");
            (
                None,
                None,
                Arc::new(MemoryBatchSource::new(config.storage.pending_capacity)) as Arc<dyn BatchSource>,
            )
        };

        let publisher = create_publisher(&config.publisher, transport, batch_source)?;
        let policy = ReconnectPolicy::from_config(&config.recovery);
        let (output_tx, output_rx) = mpsc::channel(config.pipeline.output_queue_capacity);
        let mut publisher_task = tokio::spawn(publisher_stage(
            publisher,
            output_rx,
            status.clone(),
            policy.clone(),
        ));

        info!(
            port = %opener.describe(),
            strategy = %config.publisher.strategy,
            storage = config.storage.enabled,
            "Pipeline starting"
        );
        let mut report = PipelineReport::default();
        let acquisition = acquire(
            &config,
            opener.as_ref(),
            &status,
            &stop_signal,
            storage.as_ref(),
            &output_tx,
            &policy,
            &mut report,
        )
        .await;

        // Shutdown: publisher first so a batch flush can still read storage.
        let mut errors = Vec::new();
        drop(output_tx);
        match tokio::time::timeout(shutdown_timeout, &mut publisher_task).await {
            Ok(Ok(stats)) => report.publisher = stats,
            Ok(Err(e)) => errors.push(DaqError::StageFailed {
                stage: "publisher".into(),
                message: e.to_string(),
            }),
            Err(_) => {
                publisher_task.abort();
                errors.push(DaqError::StageTimeout {
                    stage: "publisher".into(),
                    timeout: shutdown_timeout,
                });
            }
        }
        if let Some(handle) = storage {
            match handle.close().await {
                Ok(stats) => report.storage = Some(stats),
                Err(e) => errors.push(e),
            }
        }
        if let Some(task) = storage_task {
            let (discard, _) = stop_pair();
            if let Err(e) = join_stage("storage", task, shutdown_timeout, &discard).await {
                errors.push(e);
            }
        }
        if let Err(e) = status.transition(PipelineState::Stopped) {
            warn!(error = %e, "Unexpected state at shutdown");
        }
        report.reconnects = status.snapshot().reconnects;

        match acquisition {
            Err(e) if errors.is_empty() => Err(e),
            Err(e) => {
                errors.insert(0, e);
                Err(DaqError::ShutdownFailed(errors))
            }
            Ok(()) if !errors.is_empty() => Err(DaqError::ShutdownFailed(errors)),
            Ok(()) => {
                info!(
                    epochs = report.epochs,
                    reconnects = report.reconnects,
                    samples = report.samples_processed,
                    "Pipeline stopped"
                );
                Ok(report)
            }
        }
    }
}

/// The Recovering/Running loop. Returns when stopped or on a fatal error.
#[allow(clippy::too_many_arguments)]
async fn acquire(
    config: &AppConfig,
    opener: &dyn PortOpener,
    status: &StatusBoard,
    stop: &StopSignal,
    storage: Option<&StorageHandle>,
    output_tx: &mpsc::Sender<ProcessedSample>,
    policy: &ReconnectPolicy,
    report: &mut PipelineReport,
) -> AppResult<()> {
    let mut processor = SignalProcessor::new(&config.processing);
    let mut decoder = FrameDecoder::new();
    let mut reader: Option<TransportReader> = None;
    let mut epoch = 0u32;

    let result = loop {
        if let Err(e) = status.transition(PipelineState::Recovering) {
            break Err(e);
        }
        status.set_sensor(SensorLink::Reconnecting);

        let mut reopen = SensorReopen {
            opener,
            probe_timeout: policy.probe_timeout,
            opened: None,
        };
        let (port, probed) = match handle_recoverable_error(&mut reopen, policy, stop).await {
            Ok(RecoveryOutcome::Recovered { .. }) => match reopen.opened.take() {
                Some(opened) => opened,
                None => break Ok(()),
            },
            Ok(RecoveryOutcome::Stopped) => break Ok(()),
            Err(e) => {
                error!(error = %e, "Sensor link could not be restored");
                break Err(e);
            }
        };

        if epoch > 0 {
            status.count_reconnect();
            if config.storage.rotate_on_reconnect {
                if let Some(storage) = storage {
                    if let Err(e) = storage.rotate("reconnect").await {
                        warn!(error = %e, "Could not rotate data file after reconnect");
                    }
                }
            }
        }

        report.samples_processed += processor.samples_processed();
        processor.reset();
        decoder.reset();
        decoder.push(&probed);
        let transport_reader = match reader.take() {
            Some(mut existing) => {
                existing.reset(port);
                existing
            }
            None => TransportReader::new(port, &config.serial),
        };

        epoch += 1;
        report.epochs = epoch;
        status.set_sensor(SensorLink::Connected);
        if let Err(e) = status.transition(PipelineState::Running { epoch }) {
            break Err(e);
        }
        info!(epoch, port = %opener.describe(), "Sensor link up");

        let finished = run_epoch(
            config,
            transport_reader,
            decoder,
            processor,
            storage,
            output_tx,
            stop,
        )
        .await;
        let finished = match finished {
            Ok(finished) => finished,
            Err(e) => {
                // Components are lost with the failed stage; nothing more can run.
                return Err(e);
            }
        };
        reader = Some(finished.reader);
        decoder = finished.decoder;
        processor = finished.processor;

        match finished.end {
            ReaderEnd::Lost(reason) => {
                status.set_sensor(SensorLink::Lost);
                warn!(epoch, reason = ?reason, "Sensor link lost, recovering");
            }
            ReaderEnd::Stopped | ReaderEnd::DownstreamClosed => break Ok(()),
        }
    };

    report.samples_processed += processor.samples_processed();
    report.decoder = decoder.stats().clone();
    result
}

async fn run_epoch(
    config: &AppConfig,
    reader: TransportReader,
    decoder: FrameDecoder,
    processor: SignalProcessor,
    storage: Option<&StorageHandle>,
    output_tx: &mpsc::Sender<ProcessedSample>,
    stop: &StopSignal,
) -> AppResult<Epoch> {
    let shutdown_timeout = config.pipeline.shutdown_timeout();
    let (raw_tx, raw_rx) = mpsc::channel(config.pipeline.raw_queue_capacity);
    let (sample_tx, sample_rx) = mpsc::channel(config.pipeline.sample_queue_capacity);
    let (discard_handle, discard) = stop_pair();

    let mut reader_task = tokio::spawn(reader_stage(
        reader,
        raw_tx,
        stop.clone(),
        discard_handle.clone(),
    ));
    let decoder_task = tokio::spawn(decoder_stage(decoder, raw_rx, sample_tx, discard.clone()));
    let processor_task = tokio::spawn(processor_stage(
        processor,
        sample_rx,
        output_tx.clone(),
        storage.cloned(),
        discard,
    ));

    let joined = tokio::select! {
        joined = &mut reader_task => joined,
        _ = stop.stopped() => {
            match tokio::time::timeout(shutdown_timeout, &mut reader_task).await {
                Ok(joined) => joined,
                Err(_) => {
                    discard_handle.stop();
                    reader_task.abort();
                    decoder_task.abort();
                    processor_task.abort();
                    return Err(DaqError::StageTimeout {
                        stage: "reader".into(),
                        timeout: shutdown_timeout,
                    });
                }
            }
        }
    };
    let (reader, end) = match joined {
        Ok(value) => value,
        Err(e) => {
            discard_handle.stop();
            return Err(DaqError::StageFailed {
                stage: "reader".into(),
                message: e.to_string(),
            });
        }
    };

    let decoder = join_stage("decoder", decoder_task, shutdown_timeout, &discard_handle).await?;
    let processor =
        join_stage("processor", processor_task, shutdown_timeout, &discard_handle).await?;

    Ok(Epoch {
        reader,
        decoder,
        processor,
        end,
    })
}
