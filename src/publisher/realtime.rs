//! One broker message per sample.

use super::codec::PayloadCodec;
use super::message::Envelope;
use super::transport::BrokerTransport;
use super::unacked::UnackedTracker;
use super::{PublishOutcome, Publisher, PublisherStats};
use crate::config::PublisherConfig;
use crate::data::ProcessedSample;
use crate::error::AppResult;
use crate::error_recovery::RetryPolicy;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, error};

const RETRY_DELAY: Duration = Duration::from_millis(20);

pub struct RealtimePublisher {
    transport: Box<dyn BrokerTransport>,
    codec: PayloadCodec,
    topic: String,
    qos: u8,
    source: String,
    retry: RetryPolicy,
    ack_timeout: Duration,
    unacked: UnackedTracker,
    stats: PublisherStats,
}

impl RealtimePublisher {
    pub fn new(config: &PublisherConfig, transport: Box<dyn BrokerTransport>) -> Self {
        Self {
            transport,
            codec: PayloadCodec::from_config(config),
            topic: config.topic.clone(),
            qos: config.qos,
            source: config.source.clone(),
            retry: RetryPolicy {
                max_attempts: config.retry_limit.max(1),
                backoff_delay: RETRY_DELAY,
            },
            ack_timeout: Duration::from_millis(config.publish_timeout_ms),
            unacked: UnackedTracker::default(),
            stats: PublisherStats::default(),
        }
    }

    async fn send_one(&mut self, sample: &ProcessedSample) -> PublishOutcome {
        let payload = match self.codec.encode(&Envelope::continuous(&self.source, sample)) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.permanent_failures += 1;
                self.stats.samples_dropped += 1;
                error!(error = %e, timestamp = %sample.timestamp, "Sample could not be encoded, dropped");
                return PublishOutcome::Permanent(e.to_string());
            }
        };

        if !self.transport.is_connected() {
            self.stats.transient_failures += 1;
            self.stats.samples_dropped += 1;
            return PublishOutcome::Transient("broker not connected".into());
        }

        let mut last_error = String::new();
        for attempt in 1..=self.retry.max_attempts {
            match self.transport.publish(&self.topic, payload.clone(), self.qos).await {
                Ok(id) => {
                    self.stats.messages_sent += 1;
                    self.stats.samples_sent += 1;
                    if attempt > 1 {
                        debug!(id, attempt, "Publish succeeded after retry");
                    }
                    return PublishOutcome::Delivered(1);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !self.transport.is_connected() {
                        break;
                    }
                    if attempt < self.retry.max_attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }
        self.stats.transient_failures += 1;
        self.stats.samples_dropped += 1;
        PublishOutcome::Transient(last_error)
    }

    async fn collect_unacked(&mut self) {
        let acked = self.transport.poll_acked().await;
        if !acked.is_empty() {
            debug!(count = acked.len(), "Broker acknowledged messages");
        }
        let ids = self.transport.poll_unacked(self.ack_timeout).await;
        self.stats.unacked_total += ids.len() as u64;
        self.unacked.record(&ids);
    }
}

#[async_trait]
impl Publisher for RealtimePublisher {
    async fn connect(&mut self) -> AppResult<()> {
        self.transport.connect().await
    }

    async fn publish(&mut self, samples: &[ProcessedSample]) -> PublishOutcome {
        let mut outcome = PublishOutcome::Delivered(0);
        for sample in samples {
            outcome = outcome.merge(self.send_one(sample).await);
        }
        outcome
    }

    async fn tick(&mut self) -> PublishOutcome {
        self.collect_unacked().await;
        PublishOutcome::Delivered(0)
    }

    async fn flush(&mut self) -> PublishOutcome {
        PublishOutcome::Delivered(0)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.collect_unacked().await;
        self.transport.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn stats(&self) -> PublisherStats {
        self.stats.clone()
    }

    fn name(&self) -> &'static str {
        "realtime"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PayloadEncoding;
    use crate::data::Vector3;
    use crate::publisher::transport::ChannelTransport;
    use chrono::Utc;

    fn sample() -> ProcessedSample {
        ProcessedSample {
            timestamp: Utc::now(),
            acc_raw: Vector3::ZERO,
            acc_filtered: Vector3::new(0.5, 0.0, 0.0),
            velocity: Vector3::ZERO,
            displacement: Vector3::ZERO,
            displacement_magnitude: 0.0,
            dominant_freq: Vector3::ZERO,
            overall_dominant_freq: 0.0,
            rls_warmed_up: false,
        }
    }

    fn config() -> PublisherConfig {
        PublisherConfig {
            qos: 1,
            encoding: PayloadEncoding::Json,
            retry_limit: 3,
            ..PublisherConfig::default()
        }
    }

    #[tokio::test]
    async fn each_sample_is_one_message() {
        let (transport, mut rx, _control) = ChannelTransport::new(16);
        let mut publisher = RealtimePublisher::new(&config(), Box::new(transport));
        publisher.connect().await.unwrap();

        let outcome = publisher.publish(&[sample(), sample()]).await;
        assert_eq!(outcome, PublishOutcome::Delivered(2));

        let message = rx.recv().await.unwrap();
        let envelope: Envelope = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(envelope.metadata.strategy, "continuous");
        assert_eq!(envelope.data_points.unwrap()[0].acc_x_filtered, 0.5);
        assert_eq!(message.qos, 1);
        assert_eq!(publisher.stats().messages_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let (transport, mut rx, control) = ChannelTransport::new(16);
        let mut publisher = RealtimePublisher::new(&config(), Box::new(transport));
        publisher.connect().await.unwrap();
        control.fail_next(2);

        assert_eq!(publisher.publish(&[sample()]).await, PublishOutcome::Delivered(1));
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_report_transient() {
        let (transport, _rx, control) = ChannelTransport::new(16);
        let mut publisher = RealtimePublisher::new(&config(), Box::new(transport));
        publisher.connect().await.unwrap();
        control.fail_next(10);

        assert!(matches!(
            publisher.publish(&[sample()]).await,
            PublishOutcome::Transient(_)
        ));
        let stats = publisher.stats();
        assert_eq!(stats.transient_failures, 1);
        assert_eq!(stats.samples_dropped, 1);
    }

    #[tokio::test]
    async fn disconnected_broker_fails_fast() {
        let (transport, _rx, _control) = ChannelTransport::new(16);
        let mut publisher = RealtimePublisher::new(&config(), Box::new(transport));
        assert!(!publisher.is_connected());
        assert!(matches!(
            publisher.publish(&[sample()]).await,
            PublishOutcome::Transient(_)
        ));
    }

    #[tokio::test]
    async fn unacked_messages_are_counted_on_tick() {
        let (transport, _rx, control) = ChannelTransport::new(16);
        let mut cfg = config();
        cfg.publish_timeout_ms = 0;
        let mut publisher = RealtimePublisher::new(&cfg, Box::new(transport));
        publisher.connect().await.unwrap();
        control.withhold_acks(true);
        publisher.publish(&[sample(), sample(), sample()]).await;
        publisher.tick().await;
        assert_eq!(publisher.stats().unacked_total, 3);
    }
}
