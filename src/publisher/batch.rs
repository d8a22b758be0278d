//! Size- or time-triggered batch publishing over the batch contract.
//!
//! At QoS 0 a batch is retired once the transport accepts it. At QoS 1 and 2
//! one batch at a time is in flight and its records stay pending until the
//! broker acknowledges it; an overdue batch is sent again.

use super::codec::PayloadCodec;
use super::message::Envelope;
use super::transport::BrokerTransport;
use super::unacked::UnackedTracker;
use super::{PublishOutcome, Publisher, PublisherStats};
use crate::config::PublisherConfig;
use crate::data::ProcessedSample;
use crate::error::{AppResult, DaqError};
use crate::storage::{Batch, BatchSource};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Full batches sent per call while catching up on a backlog.
const MAX_BATCHES_PER_CALL: usize = 4;
/// Poll spacing while waiting for an acknowledgement during flush.
const SETTLE_POLL: Duration = Duration::from_millis(20);

/// A batch handed to the broker and awaiting its acknowledgement.
#[derive(Debug)]
struct InFlight {
    id: u64,
    batch: Batch,
    sent_at: Instant,
}

pub struct BatchPublisher {
    transport: Box<dyn BrokerTransport>,
    source: Arc<dyn BatchSource>,
    codec: PayloadCodec,
    topic: String,
    qos: u8,
    origin: String,
    batch_size: usize,
    max_interval: Duration,
    average: bool,
    ack_timeout: Duration,
    last_send: Instant,
    in_flight: Option<InFlight>,
    unacked: UnackedTracker,
    stats: PublisherStats,
}

impl BatchPublisher {
    pub fn new(
        config: &PublisherConfig,
        transport: Box<dyn BrokerTransport>,
        source: Arc<dyn BatchSource>,
    ) -> Self {
        Self {
            transport,
            source,
            codec: PayloadCodec::from_config(config),
            topic: config.topic.clone(),
            qos: config.qos,
            origin: config.source.clone(),
            batch_size: config.batch_size.max(1),
            max_interval: Duration::from_secs(config.batch_max_interval_s),
            average: config.batch_average,
            ack_timeout: Duration::from_millis(config.publish_timeout_ms),
            last_send: Instant::now(),
            in_flight: None,
            unacked: UnackedTracker::default(),
            stats: PublisherStats::default(),
        }
    }

    fn encode(&self, samples: &[ProcessedSample]) -> AppResult<Vec<u8>> {
        let envelope = if self.average {
            Envelope::batch_average(&self.origin, samples)
        } else {
            Envelope::batch(&self.origin, samples)
        };
        match envelope {
            Some(envelope) => self.codec.encode(&envelope),
            None => Err(DaqError::Serialization("empty batch".into())),
        }
    }

    /// Extract and send one batch. At QoS 0 it is retired right away,
    /// otherwise it becomes the in-flight batch.
    async fn send_batch(&mut self) -> PublishOutcome {
        if self.in_flight.is_some() {
            return PublishOutcome::Delivered(0);
        }
        if !self.transport.is_connected() {
            self.stats.transient_failures += 1;
            return PublishOutcome::Transient("broker not connected".into());
        }
        let batch = match self.source.extract_batch(self.batch_size).await {
            Ok(batch) => batch,
            Err(e) => return PublishOutcome::Transient(e.to_string()),
        };
        if batch.is_empty() {
            return PublishOutcome::Delivered(0);
        }

        let (batch, payload, mut outcome) = match self.encode(&batch.samples) {
            Ok(payload) => (batch, payload, PublishOutcome::Delivered(0)),
            Err(e) => {
                let (rest, unencodable) = isolate_unencodable(batch, |samples| self.encode(samples));
                self.drop_records(&unencodable, &e).await;
                let outcome = PublishOutcome::Permanent(e.to_string());
                if rest.is_empty() {
                    return outcome;
                }
                match self.encode(&rest.samples) {
                    Ok(payload) => (rest, payload, outcome),
                    Err(e) => {
                        self.drop_records(&rest, &e).await;
                        return outcome;
                    }
                }
            }
        };

        match self.transport.publish(&self.topic, payload, self.qos).await {
            Ok(id) => {
                self.last_send = Instant::now();
                self.stats.messages_sent += 1;
                debug!(id, samples = batch.len(), first_seq = batch.first_seq, "Batch published");
                if self.qos == 0 {
                    outcome = outcome.merge(self.retire(&batch).await);
                } else {
                    self.in_flight = Some(InFlight {
                        id,
                        batch,
                        sent_at: self.last_send,
                    });
                }
                outcome
            }
            Err(e) => {
                self.stats.transient_failures += 1;
                outcome.merge(PublishOutcome::Transient(e.to_string()))
            }
        }
    }

    /// Records that can never be encoded are retired so they stop blocking
    /// the backlog.
    async fn drop_records(&mut self, batch: &Batch, cause: &DaqError) {
        if batch.is_empty() {
            return;
        }
        self.stats.permanent_failures += 1;
        self.stats.samples_dropped += batch.len() as u64;
        error!(
            error = %cause,
            records = batch.len(),
            first_seq = batch.first_seq,
            last_seq = batch.last_seq,
            "Records could not be encoded, dropped"
        );
        for &seq in &batch.seqs {
            if let Err(e) = self.source.acknowledge(&Batch::single(seq)).await {
                error!(error = %e, seq, "Failed to retire undeliverable record");
            }
        }
    }

    async fn retire(&mut self, batch: &Batch) -> PublishOutcome {
        self.stats.samples_sent += batch.len() as u64;
        match self.source.acknowledge(batch).await {
            Ok(_) => PublishOutcome::Delivered(batch.len()),
            Err(e) => PublishOutcome::Transient(format!("batch sent but not retired: {e}")),
        }
    }

    /// Apply broker acknowledgements and report overdue ones. An overdue
    /// in-flight batch is released so its records are sent again.
    async fn resolve_acks(&mut self) -> PublishOutcome {
        let acked = self.transport.poll_acked().await;
        let overdue = self.transport.poll_unacked(self.ack_timeout).await;
        self.stats.unacked_total += overdue.len() as u64;
        self.unacked.record(&overdue);

        let Some(flight) = self.in_flight.take() else {
            return PublishOutcome::Delivered(0);
        };
        if acked.contains(&flight.id) {
            debug!(
                id = flight.id,
                samples = flight.batch.len(),
                waited_ms = flight.sent_at.elapsed().as_millis() as u64,
                "Batch acknowledged"
            );
            return self.retire(&flight.batch).await;
        }
        if overdue.contains(&flight.id) {
            self.stats.transient_failures += 1;
            warn!(
                id = flight.id,
                first_seq = flight.batch.first_seq,
                last_seq = flight.batch.last_seq,
                "Batch not acknowledged in time, will be sent again"
            );
            return PublishOutcome::Transient(format!("batch {} not acknowledged", flight.id));
        }
        self.in_flight = Some(flight);
        PublishOutcome::Delivered(0)
    }

    /// Wait until the in-flight batch is acknowledged or overdue.
    async fn settle(&mut self) -> PublishOutcome {
        loop {
            let outcome = self.resolve_acks().await;
            if self.in_flight.is_none() || !outcome.is_delivered() {
                return outcome;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    async fn pending(&self) -> usize {
        self.source.pending().await.unwrap_or(0)
    }
}

/// Split `batch` into the records that encode on their own and those that
/// do not, keeping order within each.
fn isolate_unencodable<F>(batch: Batch, encode: F) -> (Batch, Batch)
where
    F: Fn(&[ProcessedSample]) -> AppResult<Vec<u8>>,
{
    let (mut kept_seqs, mut kept) = (Vec::new(), Vec::new());
    let (mut bad_seqs, mut bad) = (Vec::new(), Vec::new());
    for (seq, sample) in batch.seqs.into_iter().zip(batch.samples) {
        if encode(std::slice::from_ref(&sample)).is_ok() {
            kept_seqs.push(seq);
            kept.push(sample);
        } else {
            bad_seqs.push(seq);
            bad.push(sample);
        }
    }
    (Batch::new(kept_seqs, kept), Batch::new(bad_seqs, bad))
}

#[async_trait]
impl Publisher for BatchPublisher {
    async fn connect(&mut self) -> AppResult<()> {
        self.transport.connect().await
    }

    async fn publish(&mut self, samples: &[ProcessedSample]) -> PublishOutcome {
        if let Err(e) = self.source.offer(samples).await {
            return PublishOutcome::Transient(e.to_string());
        }
        let mut outcome = self.resolve_acks().await;
        for _ in 0..MAX_BATCHES_PER_CALL {
            if self.in_flight.is_some() || self.pending().await < self.batch_size {
                break;
            }
            let sent = self.send_batch().await;
            let resolved = if sent.is_delivered() {
                self.resolve_acks().await
            } else {
                PublishOutcome::Delivered(0)
            };
            let stop = !sent.is_delivered() || !resolved.is_delivered();
            outcome = outcome.merge(sent).merge(resolved);
            if stop {
                break;
            }
        }
        outcome
    }

    async fn tick(&mut self) -> PublishOutcome {
        let resolved = self.resolve_acks().await;
        if self.in_flight.is_some()
            || self.last_send.elapsed() < self.max_interval
            || self.pending().await == 0
        {
            return resolved;
        }
        let mut outcome = self.send_batch().await;
        if !outcome.is_delivered() {
            // Wait a full interval before the next time-triggered attempt.
            self.last_send = Instant::now();
        } else {
            outcome = outcome.merge(self.resolve_acks().await);
        }
        resolved.merge(outcome)
    }

    async fn flush(&mut self) -> PublishOutcome {
        let mut outcome = PublishOutcome::Delivered(0);
        loop {
            outcome = outcome.merge(self.settle().await);
            if !outcome.is_delivered() || self.pending().await == 0 {
                break;
            }
            let sent = self.send_batch().await;
            let progressed =
                self.in_flight.is_some() || matches!(sent, PublishOutcome::Delivered(n) if n > 0);
            outcome = outcome.merge(sent);
            if !progressed {
                break;
            }
        }
        outcome
    }

    async fn close(&mut self) -> AppResult<()> {
        if let PublishOutcome::Delivered(n) = self.flush().await {
            if n > 0 {
                info!(samples = n, "Flushed pending batches");
            }
        }
        self.resolve_acks().await;
        self.transport.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn stats(&self) -> PublisherStats {
        self.stats.clone()
    }

    fn name(&self) -> &'static str {
        "batch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Vector3;
    use crate::publisher::transport::ChannelTransport;
    use crate::storage::MemoryBatchSource;
    use chrono::Utc;

    fn sample(x: f64) -> ProcessedSample {
        ProcessedSample {
            timestamp: Utc::now(),
            acc_raw: Vector3::ZERO,
            acc_filtered: Vector3::new(x, 0.0, 0.0),
            velocity: Vector3::ZERO,
            displacement: Vector3::ZERO,
            displacement_magnitude: 0.0,
            dominant_freq: Vector3::ZERO,
            overall_dominant_freq: 0.0,
            rls_warmed_up: true,
        }
    }

    fn config(batch_size: usize, average: bool) -> PublisherConfig {
        PublisherConfig {
            strategy: "batch".into(),
            batch_size,
            batch_max_interval_s: 30,
            batch_average: average,
            ..PublisherConfig::default()
        }
    }

    fn decode(message: &crate::publisher::PublishedMessage) -> Envelope {
        serde_json::from_slice(&message.payload).unwrap()
    }

    #[tokio::test]
    async fn sends_when_batch_is_full() {
        let (transport, mut rx, _control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher = BatchPublisher::new(&config(3, false), Box::new(transport), source.clone());
        publisher.connect().await.unwrap();

        assert_eq!(publisher.publish(&[sample(1.0), sample(2.0)]).await, PublishOutcome::Delivered(0));
        assert!(rx.try_recv().is_err());
        assert_eq!(publisher.publish(&[sample(3.0)]).await, PublishOutcome::Delivered(3));

        let envelope = decode(&rx.recv().await.unwrap());
        assert_eq!(envelope.metadata.strategy, "batch");
        let xs: Vec<f64> = envelope.data_points.unwrap().iter().map(|p| p.acc_x_filtered).collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
        assert_eq!(source.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_send_keeps_records_for_next_attempt() {
        let (transport, mut rx, control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher = BatchPublisher::new(&config(2, false), Box::new(transport), source.clone());
        publisher.connect().await.unwrap();
        control.fail_next(1);

        assert!(matches!(
            publisher.publish(&[sample(1.0), sample(2.0)]).await,
            PublishOutcome::Transient(_)
        ));
        assert_eq!(source.pending().await.unwrap(), 2);

        assert_eq!(publisher.publish(&[sample(3.0)]).await, PublishOutcome::Delivered(2));
        let envelope = decode(&rx.recv().await.unwrap());
        assert_eq!(envelope.data_points.unwrap()[0].acc_x_filtered, 1.0);
        assert_eq!(source.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn average_mode_sends_one_point() {
        let (transport, mut rx, _control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher = BatchPublisher::new(&config(2, true), Box::new(transport), source);
        publisher.connect().await.unwrap();
        publisher.publish(&[sample(1.0), sample(3.0)]).await;

        let envelope = decode(&rx.recv().await.unwrap());
        assert_eq!(envelope.metadata.strategy, "batch_average");
        assert_eq!(envelope.metadata.original_sample_count, Some(2));
        assert_eq!(envelope.data_averaged.unwrap().acc_x_filtered, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_sent_after_interval() {
        let (transport, mut rx, _control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher = BatchPublisher::new(&config(100, false), Box::new(transport), source);
        publisher.connect().await.unwrap();
        publisher.publish(&[sample(1.0)]).await;

        assert_eq!(publisher.tick().await, PublishOutcome::Delivered(0));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(publisher.tick().await, PublishOutcome::Delivered(1));
        assert_eq!(decode(&rx.recv().await.unwrap()).metadata.sample_count, Some(1));
    }

    #[tokio::test]
    async fn flush_drains_backlog() {
        let (transport, mut rx, _control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher = BatchPublisher::new(&config(4, false), Box::new(transport), source.clone());
        source.offer(&(0..10).map(|i| sample(i as f64)).collect::<Vec<_>>()).await.unwrap();
        publisher.connect().await.unwrap();

        assert_eq!(publisher.flush().await, PublishOutcome::Delivered(10));
        let sizes: Vec<usize> = (0..3)
            .map(|_| decode(&rx.try_recv().unwrap()).represented_samples())
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    fn acked_config(batch_size: usize, ack_timeout_ms: u64) -> PublisherConfig {
        PublisherConfig {
            qos: 1,
            publish_timeout_ms: ack_timeout_ms,
            ..config(batch_size, false)
        }
    }

    #[tokio::test]
    async fn batch_retired_only_after_broker_ack() {
        let (transport, mut rx, control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher =
            BatchPublisher::new(&acked_config(2, 60_000), Box::new(transport), source.clone());
        publisher.connect().await.unwrap();
        control.withhold_acks(true);

        assert_eq!(publisher.publish(&[sample(1.0), sample(2.0)]).await, PublishOutcome::Delivered(0));
        assert!(rx.try_recv().is_ok());
        assert_eq!(publisher.tick().await, PublishOutcome::Delivered(0));
        assert_eq!(source.pending().await.unwrap(), 2);

        // a second full batch waits behind the unacknowledged one
        publisher.publish(&[sample(3.0), sample(4.0)]).await;
        assert!(rx.try_recv().is_err());

        control.withhold_acks(false);
        assert_eq!(publisher.tick().await, PublishOutcome::Delivered(2));
        assert_eq!(source.pending().await.unwrap(), 2);
        assert_eq!(publisher.flush().await, PublishOutcome::Delivered(2));
        assert_eq!(source.pending().await.unwrap(), 0);
        assert_eq!(publisher.stats().samples_sent, 4);
    }

    #[tokio::test]
    async fn overdue_batch_is_sent_again() {
        let (transport, mut rx, control) = ChannelTransport::new(16);
        let source = Arc::new(MemoryBatchSource::new(100));
        let mut publisher =
            BatchPublisher::new(&acked_config(2, 0), Box::new(transport), source.clone());
        publisher.connect().await.unwrap();
        control.withhold_acks(true);

        assert!(matches!(
            publisher.publish(&[sample(1.0), sample(2.0)]).await,
            PublishOutcome::Transient(_)
        ));
        assert_eq!(source.pending().await.unwrap(), 2);
        assert_eq!(publisher.stats().unacked_total, 1);

        control.withhold_acks(false);
        assert_eq!(publisher.publish(&[]).await, PublishOutcome::Delivered(2));
        let first = decode(&rx.try_recv().unwrap());
        let resent = decode(&rx.try_recv().unwrap());
        assert_eq!(first.data_points, resent.data_points);
        assert_eq!(source.pending().await.unwrap(), 0);
    }

    #[test]
    fn send_futures_can_cross_threads() {
        fn assert_send<T: Send>(_: T) {}
        let (transport, _rx, _control) = ChannelTransport::new(1);
        let source = Arc::new(MemoryBatchSource::new(1));
        let mut publisher = BatchPublisher::new(&config(1, false), Box::new(transport), source);
        assert_send(publisher.send_batch());
        assert_send(publisher.settle());
    }

    #[test]
    fn unencodable_records_are_isolated() {
        let samples: Vec<ProcessedSample> = (0..4).map(|i| sample(i as f64)).collect();
        let batch = Batch::new(vec![10, 11, 12, 13], samples);
        let (rest, bad) = isolate_unencodable(batch, |s| {
            if s.iter().any(|p| p.acc_filtered.x == 2.0) {
                Err(DaqError::Serialization("unrepresentable".into()))
            } else {
                Ok(Vec::new())
            }
        });
        assert_eq!(rest.seqs, vec![10, 11, 13]);
        assert_eq!(bad.seqs, vec![12]);
        assert_eq!(bad.samples[0].acc_filtered.x, 2.0);
    }
}
