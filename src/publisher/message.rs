//! Broker message shapes.
//!
//! Every message is an [`Envelope`]: source metadata plus either a list of
//! flat [`DataPoint`]s or one averaged point.

use crate::data::ProcessedSample;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STRATEGY_CONTINUOUS: &str = "continuous";
pub const STRATEGY_BATCH: &str = "batch";
pub const STRATEGY_BATCH_AVERAGE: &str = "batch_average";

fn unix_seconds(timestamp: DateTime<Utc>) -> f64 {
    timestamp.timestamp_micros() as f64 / 1e6
}

/// One sample in the flat shape broker consumers expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unix time in seconds
    pub ts: f64,
    pub acc_x_filtered: f64,
    pub acc_y_filtered: f64,
    pub acc_z_filtered: f64,
    pub vel_x: f64,
    pub vel_y: f64,
    pub vel_z: f64,
    pub disp_x: f64,
    pub disp_y: f64,
    pub disp_z: f64,
    pub disp_magnitude: f64,
    pub dominant_freq_x: f64,
    pub dominant_freq_y: f64,
    pub dominant_freq_z: f64,
    pub overall_dominant_freq: f64,
    pub rls_warmed_up: bool,
}

impl From<&ProcessedSample> for DataPoint {
    fn from(s: &ProcessedSample) -> Self {
        Self {
            ts: unix_seconds(s.timestamp),
            acc_x_filtered: s.acc_filtered.x,
            acc_y_filtered: s.acc_filtered.y,
            acc_z_filtered: s.acc_filtered.z,
            vel_x: s.velocity.x,
            vel_y: s.velocity.y,
            vel_z: s.velocity.z,
            disp_x: s.displacement.x,
            disp_y: s.displacement.y,
            disp_z: s.displacement.z,
            disp_magnitude: s.displacement_magnitude,
            dominant_freq_x: s.dominant_freq.x,
            dominant_freq_y: s.dominant_freq.y,
            dominant_freq_z: s.dominant_freq.z,
            overall_dominant_freq: s.overall_dominant_freq,
            rls_warmed_up: s.rls_warmed_up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub source: String,
    pub strategy: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_sample_count: Option<usize>,
    /// Unix seconds of the first sample
    pub start_time: f64,
    /// Unix seconds of the last sample
    pub end_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub metadata: EnvelopeMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_points: Option<Vec<DataPoint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_averaged: Option<DataPoint>,
}

impl Envelope {
    /// A single sample, sent as soon as it is produced.
    pub fn continuous(source: &str, sample: &ProcessedSample) -> Self {
        let ts = unix_seconds(sample.timestamp);
        Self {
            metadata: EnvelopeMetadata {
                source: source.to_string(),
                strategy: STRATEGY_CONTINUOUS.to_string(),
                sample_count: Some(1),
                original_sample_count: None,
                start_time: ts,
                end_time: ts,
            },
            data_points: Some(vec![DataPoint::from(sample)]),
            data_averaged: None,
        }
    }

    /// Every sample of a batch. `None` for an empty batch.
    pub fn batch(source: &str, samples: &[ProcessedSample]) -> Option<Self> {
        let (first, last) = (samples.first()?, samples.last()?);
        Some(Self {
            metadata: EnvelopeMetadata {
                source: source.to_string(),
                strategy: STRATEGY_BATCH.to_string(),
                sample_count: Some(samples.len()),
                original_sample_count: None,
                start_time: unix_seconds(first.timestamp),
                end_time: unix_seconds(last.timestamp),
            },
            data_points: Some(samples.iter().map(DataPoint::from).collect()),
            data_averaged: None,
        })
    }

    /// One averaged point standing for the whole batch. `None` for an empty batch.
    pub fn batch_average(source: &str, samples: &[ProcessedSample]) -> Option<Self> {
        let (first, last) = (samples.first()?, samples.last()?);
        let averaged = ProcessedSample::average(samples)?;
        Some(Self {
            metadata: EnvelopeMetadata {
                source: source.to_string(),
                strategy: STRATEGY_BATCH_AVERAGE.to_string(),
                sample_count: None,
                original_sample_count: Some(samples.len()),
                start_time: unix_seconds(first.timestamp),
                end_time: unix_seconds(last.timestamp),
            },
            data_points: None,
            data_averaged: Some(DataPoint::from(&averaged)),
        })
    }

    /// Number of samples this message stands for.
    pub fn represented_samples(&self) -> usize {
        self.metadata
            .sample_count
            .or(self.metadata.original_sample_count)
            .unwrap_or(0)
    }
}
