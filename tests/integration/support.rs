//! Shared fixtures: scripted serial ports, frame streams and configurations.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use imu_daq::config::{AppConfig, PayloadEncoding, StorageFormat};
use imu_daq::data::{ProcessedSample, Vector3};
use imu_daq::error::DeviceErrorKind;
use imu_daq::protocol::{encode_acceleration, Acceleration};
use imu_daq::publisher::{DataPoint, Envelope, PayloadCodec, PublishedMessage};
use imu_daq::transport::{DynSerial, PortOpener};
use imu_daq::{AppResult, DaqError};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Hands out pre-built ports in order, then fails like an unplugged device.
pub struct ScriptedOpener {
    ports: Mutex<VecDeque<DynSerial>>,
    attempts: AtomicUsize,
}

impl ScriptedOpener {
    pub fn new(ports: Vec<DynSerial>) -> Self {
        Self {
            ports: Mutex::new(ports.into()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of `open` calls so far, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortOpener for ScriptedOpener {
    async fn open(&self) -> AppResult<DynSerial> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.ports.lock().unwrap().pop_front();
        next.ok_or_else(|| DaqError::device(DeviceErrorKind::OpenFailed, "no such device"))
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// `count` identical acceleration frames.
pub fn acceleration_frames(count: usize, g: [f64; 3]) -> Vec<u8> {
    let frame = encode_acceleration(&Acceleration::from_g(g[0], g[1], g[2], 25.0));
    frame.repeat(count)
}

/// Configuration with fast recovery and no silence timeout in practice.
///
/// Storage writes CSV under `data_dir`, or is disabled when `None`.
pub fn test_config(data_dir: Option<&Path>) -> AppConfig {
    let mut config = AppConfig::default();
    config.serial.silence_timeout_ms = 60_000;
    config.recovery.initial_delay_ms = 10;
    config.recovery.max_delay_ms = 50;
    config.recovery.probe_timeout_ms = 2_000;
    config.pipeline.shutdown_timeout_ms = 5_000;
    config.publisher.strategy = "realtime".to_string();
    config.publisher.qos = 0;
    match data_dir {
        Some(dir) => {
            config.storage.enabled = true;
            config.storage.base_dir = dir.to_path_buf();
            config.storage.format = StorageFormat::Csv;
            config.storage.sweep_interval_s = 0;
        }
        None => config.storage.enabled = false,
    }
    config
}

/// Receive `count` realtime messages and unpack their data points.
///
/// Panics if they do not arrive within `within`.
pub async fn collect_points(
    rx: &mut mpsc::Receiver<PublishedMessage>,
    count: usize,
    within: Duration,
) -> Vec<DataPoint> {
    let codec = PayloadCodec::new(PayloadEncoding::Json, false);
    let mut points = Vec::with_capacity(count);
    let deadline = tokio::time::Instant::now() + within;
    while points.len() < count {
        let message = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("only {} of {count} messages arrived", points.len()))
            .expect("transport dropped");
        let envelope: Envelope = codec.decode(&message.payload).unwrap();
        points.extend(envelope.data_points.unwrap_or_default());
    }
    points
}

/// Processed sample with `x` in the raw x channel, spaced 5 ms apart.
pub fn processed(i: usize) -> ProcessedSample {
    ProcessedSample {
        timestamp: Utc::now() + ChronoDuration::milliseconds(5 * i as i64),
        acc_raw: Vector3::new(i as f64, -(i as f64) / 3.0, 0.25),
        acc_filtered: Vector3::new(i as f64, 0.0, 0.0),
        velocity: Vector3::ZERO,
        displacement: Vector3::ZERO,
        displacement_magnitude: 0.0,
        dominant_freq: Vector3::ZERO,
        overall_dominant_freq: 0.0,
        rls_warmed_up: false,
    }
}
