//! Stage tasks.
//!
//! Reader, decoder and processor run once per connection epoch and hand their
//! component back when they exit, so the coordinator can reset and reuse it.
//! The publisher stage lives for the whole run.
//!
//! Two signals stop an epoch:
//!
//! - `stop` ends reading; downstream stages then drain what is queued.
//! - `discard` ends every stage at once and drops queued work. The reader raises
//!   it itself on connection loss, since bytes from before a gap are stale.

use super::state::{BrokerLink, StatusBoard};
use super::stop::{StopHandle, StopSignal};
use crate::data::{AccelSample, ProcessedSample, SignalProcessor, Vector3};
use crate::error_recovery::ReconnectPolicy;
use crate::protocol::{DecodedPacket, FrameDecoder};
use crate::publisher::{PublishOutcome, Publisher, PublisherStats};
use crate::storage::StorageHandle;
use crate::throttle::{KeyedThrottle, LogThrottle};
use crate::transport::{LossReason, ReadOutcome, TransportReader};
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Publisher housekeeping cadence.
pub const PUBLISHER_TICK: Duration = Duration::from_secs(1);

/// How the reader stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEnd {
    Lost(LossReason),
    Stopped,
    /// The decoder stage is gone.
    DownstreamClosed,
}

pub async fn reader_stage(
    mut reader: TransportReader,
    raw_tx: mpsc::Sender<Bytes>,
    stop: StopSignal,
    discard: StopHandle,
) -> (TransportReader, ReaderEnd) {
    let mut backpressure_log = LogThrottle::new(Duration::from_secs(5));
    let end = loop {
        match reader.read(&stop).await {
            ReadOutcome::Data(bytes) => match raw_tx.try_send(bytes) {
                Ok(()) => {}
                Err(TrySendError::Full(bytes)) => {
                    if let Some(suppressed) = backpressure_log.hit() {
                        warn!(
                            capacity = raw_tx.max_capacity(),
                            suppressed,
                            "Raw byte queue full, reader waiting on decoder"
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = stop.stopped() => break ReaderEnd::Stopped,
                        sent = raw_tx.send(bytes) => {
                            if sent.is_err() {
                                break ReaderEnd::DownstreamClosed;
                            }
                        }
                    }
                }
                Err(TrySendError::Closed(_)) => break ReaderEnd::DownstreamClosed,
            },
            ReadOutcome::ConnectionLost(reason) => {
                discard.stop();
                break ReaderEnd::Lost(reason);
            }
            // Reported once already; nothing more to read until reset.
            ReadOutcome::Halted => break ReaderEnd::Lost(LossReason::EndOfStream),
            ReadOutcome::Stopped => break ReaderEnd::Stopped,
        }
    };
    reader.release();
    debug!(end = ?end, bytes = reader.bytes_read(), "Reader stage exited");
    (reader, end)
}

/// Strictly increasing host timestamps for samples decoded in bursts.
#[derive(Debug, Default)]
pub struct SampleClock {
    last: Option<DateTime<Utc>>,
}

impl SampleClock {
    pub fn next(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = match self.last {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

pub async fn decoder_stage(
    mut decoder: FrameDecoder,
    mut raw_rx: mpsc::Receiver<Bytes>,
    sample_tx: mpsc::Sender<AccelSample>,
    discard: StopSignal,
) -> FrameDecoder {
    let mut clock = SampleClock::default();
    loop {
        let bytes = tokio::select! {
            biased;
            _ = discard.stopped() => break,
            bytes = raw_rx.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        decoder.push(&bytes);
        while let Some(packet) = decoder.decode_next() {
            let DecodedPacket::Acceleration(acc) = packet else {
                continue;
            };
            let sample = AccelSample {
                timestamp: clock.next(Utc::now()),
                acc_g: Vector3::from_array(acc.g()),
                temperature_c: acc.temperature_c(),
            };
            tokio::select! {
                biased;
                _ = discard.stopped() => return decoder,
                sent = sample_tx.send(sample) => {
                    if sent.is_err() {
                        return decoder;
                    }
                }
            }
        }
    }
    debug!(stats = ?decoder.stats(), "Decoder stage exited");
    decoder
}

pub async fn processor_stage(
    mut processor: SignalProcessor,
    mut sample_rx: mpsc::Receiver<AccelSample>,
    output_tx: mpsc::Sender<ProcessedSample>,
    storage: Option<StorageHandle>,
    discard: StopSignal,
) -> SignalProcessor {
    let mut storage_log = LogThrottle::new(Duration::from_secs(10));
    loop {
        let sample = tokio::select! {
            biased;
            _ = discard.stopped() => break,
            sample = sample_rx.recv() => match sample {
                Some(sample) => sample,
                None => break,
            },
        };
        let processed = processor.process(&sample);

        if let Some(storage) = &storage {
            if let Err(e) = storage.store(processed.clone()).await {
                if let Some(suppressed) = storage_log.hit() {
                    error!(error = %e, suppressed, "Storage unavailable, sample not persisted");
                }
            }
        }

        tokio::select! {
            biased;
            _ = discard.stopped() => break,
            sent = output_tx.send(processed) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!(samples = processor.samples_processed(), "Processor stage exited");
    processor
}

/// Publish every sample from `rx` until the channel closes, then flush and
/// disconnect.
///
/// The broker is reconnected with `policy` backoff while samples keep flowing;
/// failed publishes are logged at most once per window per outcome class.
pub async fn publisher_stage(
    mut publisher: Box<dyn Publisher>,
    mut rx: mpsc::Receiver<ProcessedSample>,
    status: StatusBoard,
    policy: ReconnectPolicy,
) -> PublisherStats {
    let mut failures: KeyedThrottle<&'static str> = KeyedThrottle::new(Duration::from_secs(5));
    let mut reconnect_attempt = 0u32;
    let mut next_reconnect = Instant::now();

    match publisher.connect().await {
        Ok(()) => status.set_broker(BrokerLink::Connected),
        Err(e) => {
            warn!(publisher = publisher.name(), error = %e, "Broker not reachable at startup");
            status.set_broker(BrokerLink::Disconnected);
            reconnect_attempt = 1;
            next_reconnect = Instant::now() + policy.delay_for(reconnect_attempt);
        }
    }

    let mut tick = tokio::time::interval(PUBLISHER_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            sample = rx.recv() => match sample {
                Some(sample) => {
                    let outcome = publisher.publish(std::slice::from_ref(&sample)).await;
                    report(&mut failures, outcome);
                }
                None => break,
            },
            _ = tick.tick() => {
                if publisher.is_connected() {
                    status.set_broker(BrokerLink::Connected);
                } else {
                    status.set_broker(BrokerLink::Disconnected);
                    if Instant::now() >= next_reconnect {
                        reconnect_attempt += 1;
                        match publisher.connect().await {
                            Ok(()) => {
                                info!(attempts = reconnect_attempt, "Broker reconnected");
                                reconnect_attempt = 0;
                                status.set_broker(BrokerLink::Connected);
                            }
                            Err(e) => {
                                let delay = policy.delay_for(reconnect_attempt);
                                next_reconnect = Instant::now() + delay;
                                if let Some(suppressed) = failures.hit("connect") {
                                    warn!(error = %e, attempt = reconnect_attempt, retry_in = ?delay, suppressed, "Broker reconnect failed");
                                }
                            }
                        }
                    }
                }
                let outcome = publisher.tick().await;
                report(&mut failures, outcome);
            }
        }
    }

    if let Err(e) = publisher.close().await {
        warn!(error = %e, "Publisher close failed");
    }
    status.set_broker(BrokerLink::Disconnected);
    let stats = publisher.stats();
    info!(
        publisher = publisher.name(),
        messages = stats.messages_sent,
        samples = stats.samples_sent,
        dropped = stats.samples_dropped,
        "Publisher stage exited"
    );
    stats
}

fn report(failures: &mut KeyedThrottle<&'static str>, outcome: PublishOutcome) {
    match outcome {
        PublishOutcome::Delivered(_) => {}
        PublishOutcome::Transient(reason) => {
            if let Some(suppressed) = failures.hit("transient") {
                warn!(reason = %reason, suppressed, "Publish failed (transient)");
            }
        }
        PublishOutcome::Permanent(reason) => {
            if let Some(suppressed) = failures.hit("permanent") {
                error!(reason = %reason, suppressed, "Publish failed permanently, records dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessingConfig;
    use crate::pipeline::stop::stop_pair;
    use crate::protocol::packet::Acceleration;

    #[test]
    fn clock_is_strictly_increasing() {
        let mut clock = SampleClock::default();
        let now = Utc::now();
        let a = clock.next(now);
        let b = clock.next(now);
        let c = clock.next(now - ChronoDuration::seconds(1));
        assert!(a < b && b < c);
        let later = now + ChronoDuration::seconds(1);
        assert_eq!(clock.next(later), later);
    }

    #[tokio::test]
    async fn decoder_emits_acceleration_samples() {
        let (raw_tx, raw_rx) = mpsc::channel(4);
        let (sample_tx, mut sample_rx) = mpsc::channel(16);
        let (_discard_handle, discard) = stop_pair();
        let task = tokio::spawn(decoder_stage(FrameDecoder::new(), raw_rx, sample_tx, discard));

        let mut bytes = vec![0xAA, 0x01];
        bytes.extend_from_slice(&Acceleration::from_g(1.0, 0.0, -1.0, 25.0).to_frame());
        bytes.extend_from_slice(&Acceleration::from_g(0.5, 0.0, 0.0, 25.0).to_frame());
        raw_tx.send(Bytes::from(bytes)).await.unwrap();
        drop(raw_tx);

        let first = sample_rx.recv().await.unwrap();
        assert!((first.acc_g.x - 1.0).abs() < 1e-3);
        assert!((first.acc_g.z + 1.0).abs() < 1e-3);
        let second = sample_rx.recv().await.unwrap();
        assert!(second.timestamp > first.timestamp);

        let decoder = task.await.unwrap();
        assert_eq!(decoder.stats().frames_decoded, 2);
    }

    #[tokio::test]
    async fn discard_stops_processor_without_draining() {
        let (sample_tx, sample_rx) = mpsc::channel(16);
        let (output_tx, mut output_rx) = mpsc::channel(16);
        let (discard_handle, discard) = stop_pair();
        discard_handle.stop();
        for _ in 0..5 {
            sample_tx
                .send(AccelSample {
                    timestamp: Utc::now(),
                    acc_g: Vector3::new(0.0, 0.0, 1.0),
                    temperature_c: 20.0,
                })
                .await
                .unwrap();
        }
        let processor = SignalProcessor::new(&ProcessingConfig::default());
        let processor = processor_stage(processor, sample_rx, output_tx, None, discard).await;
        assert_eq!(processor.samples_processed(), 0);
        assert!(output_rx.recv().await.is_none());
    }
}
