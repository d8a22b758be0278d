//! Publishing processed samples to the broker.
//!
//! A [`Publisher`] turns samples into broker messages. Two strategies exist:
//!
//! - [`RealtimePublisher`]: one message per sample, sent immediately
//! - [`BatchPublisher`]: accumulates through a [`BatchSource`] and sends on a
//!   size or time trigger
//!
//! [`create_publisher`] resolves the configured strategy name. Both strategies
//! own their [`BrokerTransport`] exclusively and fold repeated
//! unacknowledged-message conditions through an [`UnackedTracker`].

pub mod batch;
pub mod codec;
pub mod message;
pub mod realtime;
pub mod transport;
pub mod unacked;

pub use batch::BatchPublisher;
pub use codec::PayloadCodec;
pub use message::{DataPoint, Envelope};
pub use realtime::RealtimePublisher;
pub use transport::{BrokerTransport, ChannelControl, ChannelTransport, PublishedMessage};
pub use unacked::UnackedTracker;

#[cfg(feature = "mqtt")]
pub use transport::MqttTransport;

use crate::config::PublisherConfig;
use crate::data::ProcessedSample;
use crate::error::{AppResult, DaqError};
use crate::storage::BatchSource;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Strategy names accepted by [`create_publisher`].
pub const STRATEGY_NAMES: &[&str] = &["realtime", "batch"];

/// Result of one publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Samples handed to the broker by this call (0 when a batch is still filling)
    Delivered(usize),
    /// Retryable: broker unreachable, queue full, no acknowledgement
    Transient(String),
    /// Not retryable; the offending records were dropped
    Permanent(String),
}

impl PublishOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, PublishOutcome::Delivered(_))
    }

    /// Combine the outcomes of several sends; the most severe wins.
    pub fn merge(self, other: PublishOutcome) -> PublishOutcome {
        use PublishOutcome::*;
        match (self, other) {
            (Permanent(a), _) | (_, Permanent(a)) => Permanent(a),
            (Transient(a), _) | (_, Transient(a)) => Transient(a),
            (Delivered(a), Delivered(b)) => Delivered(a + b),
        }
    }
}

/// Counters kept by every publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub messages_sent: u64,
    pub samples_sent: u64,
    pub transient_failures: u64,
    pub permanent_failures: u64,
    /// Records dropped after a permanent failure or exhausted retries
    pub samples_dropped: u64,
    pub unacked_total: u64,
}

#[async_trait]
pub trait Publisher: Send {
    /// Connect the broker transport.
    async fn connect(&mut self) -> AppResult<()>;

    async fn publish(&mut self, samples: &[ProcessedSample]) -> PublishOutcome;

    /// Periodic housekeeping: time-triggered sends and unacknowledged reports.
    async fn tick(&mut self) -> PublishOutcome;

    /// Send whatever is buffered.
    async fn flush(&mut self) -> PublishOutcome;

    /// Flush and disconnect.
    async fn close(&mut self) -> AppResult<()>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> PublisherStats;

    fn name(&self) -> &'static str;
}

/// Build the publisher named by `config.strategy`.
pub fn create_publisher(
    config: &PublisherConfig,
    transport: Box<dyn BrokerTransport>,
    batch_source: Arc<dyn BatchSource>,
) -> AppResult<Box<dyn Publisher>> {
    match config.strategy.as_str() {
        "realtime" => Ok(Box::new(RealtimePublisher::new(config, transport))),
        "batch" => Ok(Box::new(BatchPublisher::new(config, transport, batch_source))),
        other => Err(DaqError::Configuration(format!(
            "Unknown publisher strategy '{other}'. Must be one of: {}",
            STRATEGY_NAMES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBatchSource;

    #[test]
    fn factory_resolves_strategies() {
        let source: Arc<dyn BatchSource> = Arc::new(MemoryBatchSource::new(10));
        for name in STRATEGY_NAMES {
            let config = PublisherConfig {
                strategy: name.to_string(),
                ..PublisherConfig::default()
            };
            let (transport, _rx, _control) = ChannelTransport::new(4);
            let publisher = create_publisher(&config, Box::new(transport), Arc::clone(&source)).unwrap();
            assert_eq!(publisher.name(), *name);
        }
    }

    #[test]
    fn factory_rejects_unknown_strategy() {
        let config = PublisherConfig {
            strategy: "carrier_pigeon".into(),
            ..PublisherConfig::default()
        };
        let (transport, _rx, _control) = ChannelTransport::new(4);
        let result = create_publisher(
            &config,
            Box::new(transport),
            Arc::new(MemoryBatchSource::new(10)),
        );
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn merge_keeps_most_severe() {
        use PublishOutcome::*;
        assert_eq!(Delivered(2).merge(Delivered(3)), Delivered(5));
        assert_eq!(Delivered(2).merge(Transient("x".into())), Transient("x".into()));
        assert_eq!(
            Transient("x".into()).merge(Permanent("y".into())),
            Permanent("y".into())
        );
    }
}
