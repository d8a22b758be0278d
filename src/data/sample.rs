//! Sample types flowing between the processor, storage and publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul};

/// Three-axis quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn from_array([x, y, z]: [f64; 3]) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }

    /// Euclidean norm.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Largest component.
    pub fn max_component(&self) -> f64 {
        self.x.max(self.y).max(self.z)
    }
}

impl Add for Vector3 {
    type Output = Vector3;

    fn add(self, rhs: Vector3) -> Vector3 {
        Vector3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Vector3;

    fn mul(self, rhs: f64) -> Vector3 {
        Vector3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// One decoded acceleration reading, in g, as handed to the processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelSample {
    pub timestamp: DateTime<Utc>,
    pub acc_g: Vector3,
    pub temperature_c: f64,
}

/// Enriched record produced once per input sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedSample {
    pub timestamp: DateTime<Utc>,
    /// Acceleration in m/s² with gravity removed from z
    pub acc_raw: Vector3,
    /// `acc_raw` after the optional pre-filter
    pub acc_filtered: Vector3,
    /// m/s
    pub velocity: Vector3,
    /// m
    pub displacement: Vector3,
    pub displacement_magnitude: f64,
    /// Hz per axis, 0.0 until the spectral window is full
    pub dominant_freq: Vector3,
    pub overall_dominant_freq: f64,
    /// Velocity and displacement are not meaningful while false
    pub rls_warmed_up: bool,
}

impl ProcessedSample {
    /// Component-wise mean of `samples`, stamped with the last timestamp.
    ///
    /// `rls_warmed_up` is true only if every input was warmed up.
    pub fn average(samples: &[ProcessedSample]) -> Option<ProcessedSample> {
        let last = samples.last()?;
        let n = samples.len() as f64;
        let mean = |f: fn(&ProcessedSample) -> Vector3| {
            samples.iter().map(f).fold(Vector3::ZERO, |acc, v| acc + v) * (1.0 / n)
        };
        let mean_scalar =
            |f: fn(&ProcessedSample) -> f64| samples.iter().map(f).sum::<f64>() / n;

        Some(ProcessedSample {
            timestamp: last.timestamp,
            acc_raw: mean(|s| s.acc_raw),
            acc_filtered: mean(|s| s.acc_filtered),
            velocity: mean(|s| s.velocity),
            displacement: mean(|s| s.displacement),
            displacement_magnitude: mean_scalar(|s| s.displacement_magnitude),
            dominant_freq: mean(|s| s.dominant_freq),
            overall_dominant_freq: mean_scalar(|s| s.overall_dominant_freq),
            rls_warmed_up: samples.iter().all(|s| s.rls_warmed_up),
        })
    }
}
