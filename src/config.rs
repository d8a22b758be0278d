//! Configuration loading using Figment.
//!
//! Configuration is layered:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file (default `config/imu_daq.toml`)
//! 3. Environment variables prefixed with `IMU_DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use imu_daq::config::AppConfig;
//!
//! let config = AppConfig::load_from("config/imu_daq.toml")?;
//! config.validate()?;
//! println!("Reading {}", config.serial.port);
//! # Ok::<(), imu_daq::error::DaqError>(())
//! ```
//!
//! Environment override example: `IMU_DAQ_SERIAL__PORT=/dev/ttyAMA0`.

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/imu_daq.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link to the sensor
    pub serial: SerialConfig,
    /// Signal processing parameters
    pub processing: ProcessingConfig,
    /// Local storage of processed samples
    pub storage: StorageConfig,
    /// Publishing strategy and payload format
    pub publisher: PublisherConfig,
    /// Broker connection
    pub mqtt: MqttConfig,
    /// Queue sizes and shutdown budget
    pub pipeline: PipelineConfig,
    /// Sensor reconnection policy
    pub recovery: RecoveryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Serial port settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device path (e.g. `/dev/ttyUSB0`)
    #[serde(default = "default_serial_port")]
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Declare the link lost after this long without a byte
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_ms: u64,
    /// Size of each read from the port
    #[serde(default = "default_read_buffer")]
    pub read_buffer_size: usize,
    /// Write a single 0x00 byte after opening to wake a sleeping sensor
    #[serde(default = "default_true")]
    pub wake_on_open: bool,
}

/// Pre-filter applied to acceleration before integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccFilterKind {
    /// Pass samples through unchanged
    None,
    /// Mean of the last `acc_filter_param` samples
    MovingAverage,
    /// Exponential smoothing with `alpha = acc_filter_param`
    LowPass,
}

/// Signal processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Sensor sample interval in seconds (0.005 = 200 Hz)
    #[serde(default = "default_sample_interval")]
    pub sample_interval_s: f64,
    /// Gravity constant used to convert g to m/s²
    #[serde(default = "default_gravity")]
    pub gravity: f64,
    /// Acceleration pre-filter
    #[serde(default = "default_acc_filter")]
    pub acc_filter: AccFilterKind,
    /// Window size (moving average) or alpha (low pass)
    #[serde(default = "default_acc_filter_param")]
    pub acc_filter_param: f64,
    /// Samples per RLS frame
    #[serde(default = "default_rls_frame")]
    pub rls_sample_frame_size: usize,
    /// Calculation window length in frames
    #[serde(default = "default_rls_multiplier")]
    pub rls_calc_frame_multiplier: usize,
    /// RLS forgetting factor in (0, 1]
    #[serde(default = "default_forgetting_factor")]
    pub rls_forgetting_factor: f64,
    /// Frames processed before outputs are considered reliable
    #[serde(default = "default_warmup_frames")]
    pub rls_warmup_frames: usize,
    /// FFT resolution (window length)
    #[serde(default = "default_fft_points")]
    pub fft_points: usize,
    /// Recompute the spectrum every this many samples
    #[serde(default = "default_fft_interval")]
    pub fft_interval: usize,
    /// Lowest frequency considered for the dominant peak
    #[serde(default = "default_fft_min_freq")]
    pub fft_min_freq_hz: f64,
    /// Highest frequency considered (Nyquist when absent)
    #[serde(default)]
    pub fft_max_freq_hz: Option<f64>,
}

/// Record layout on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    /// Delimited text with a fixed column order
    Csv,
    /// One nested JSON record per line
    Json,
}

impl StorageFormat {
    /// File extension for this format.
    pub fn extension(self) -> &'static str {
        match self {
            StorageFormat::Csv => "csv",
            StorageFormat::Json => "jsonl",
        }
    }

    /// Format of a data file, judged by its extension.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str())? {
            "csv" => Some(StorageFormat::Csv),
            "jsonl" => Some(StorageFormat::Json),
            _ => None,
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persist processed samples
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Output directory for data files
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// Row/record format
    #[serde(default = "default_storage_format")]
    pub format: StorageFormat,
    /// Rotate when the active file exceeds this size
    #[serde(default = "default_max_file_size")]
    pub max_file_size_mb: f64,
    /// Rotate when the active file is older than this
    #[serde(default = "default_max_file_age")]
    pub max_file_age_hours: f64,
    /// Retention sweep deletes closed files older than this
    #[serde(default = "default_cleanup_days")]
    pub cleanup_after_days: u64,
    /// Prefix for session identifiers
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Start a new file after a sensor reconnect
    #[serde(default)]
    pub rotate_on_reconnect: bool,
    /// Unacknowledged records kept in memory for batch extraction; older
    /// ones are read back from their data files
    #[serde(default = "default_pending_capacity")]
    pub pending_capacity: usize,
    /// Interval between retention sweeps while running
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_s: u64,
}

impl StorageConfig {
    /// Size threshold in bytes.
    pub fn max_file_size_bytes(&self) -> u64 {
        (self.max_file_size_mb * 1024.0 * 1024.0) as u64
    }

    /// Age threshold for rotation.
    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs_f64(self.max_file_age_hours * 3600.0)
    }

    /// Age threshold for retention.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.cleanup_after_days * 24 * 3600)
    }
}

/// Payload serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Structured JSON
    Json,
    /// Compact binary (bincode)
    Bincode,
}

/// Publisher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// Strategy name resolved by the publisher factory (realtime, batch)
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Data topic
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Broker quality-of-service level (0, 1, 2)
    #[serde(default)]
    pub qos: u8,
    /// Maximum samples per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Send a partial batch after this long
    #[serde(default = "default_batch_interval")]
    pub batch_max_interval_s: u64,
    /// Send one averaged sample instead of every sample
    #[serde(default)]
    pub batch_average: bool,
    /// Payload encoding
    #[serde(default = "default_encoding")]
    pub encoding: PayloadEncoding,
    /// LZ4-compress payloads
    #[serde(default)]
    pub compress: bool,
    /// Source label in message metadata
    #[serde(default = "default_source")]
    pub source: String,
    /// Messages not acknowledged within this window are reported
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,
    /// Attempts per realtime sample before the failure is reported
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host
    #[serde(default = "default_broker_address")]
    pub broker_address: String,
    /// Broker port
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Client identifier
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive_s: u64,
    /// Optional username
    #[serde(default)]
    pub username: Option<String>,
    /// Optional password
    #[serde(default)]
    pub password: Option<String>,
}

/// Stage queue sizes and shutdown budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Reader → decoder queue (chunks of raw bytes)
    #[serde(default = "default_raw_queue")]
    pub raw_queue_capacity: usize,
    /// Decoder → processor queue (acceleration samples)
    #[serde(default = "default_sample_queue")]
    pub sample_queue_capacity: usize,
    /// Processor → publisher queue (processed samples)
    #[serde(default = "default_sample_queue")]
    pub output_queue_capacity: usize,
    /// Time allowed for each stage to stop
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

impl PipelineConfig {
    /// Shutdown budget per stage.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Sensor reconnection policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Attempts before giving up (0 = retry forever)
    #[serde(default)]
    pub max_attempts: u32,
    /// Delay before the first reopen attempt
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Growth factor applied after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Time allowed for the first valid frame after a reopen
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

// Default value functions
fn default_app_name() -> String {
    "imu_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_silence_timeout() -> u64 {
    2000
}

fn default_read_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_sample_interval() -> f64 {
    0.005
}

fn default_gravity() -> f64 {
    9.80665
}

fn default_acc_filter() -> AccFilterKind {
    AccFilterKind::None
}

fn default_acc_filter_param() -> f64 {
    5.0
}

fn default_rls_frame() -> usize {
    20
}

fn default_rls_multiplier() -> usize {
    100
}

fn default_forgetting_factor() -> f64 {
    0.9825
}

fn default_warmup_frames() -> usize {
    5
}

fn default_fft_points() -> usize {
    512
}

fn default_fft_interval() -> usize {
    20
}

fn default_fft_min_freq() -> f64 {
    0.1
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_storage_format() -> StorageFormat {
    StorageFormat::Csv
}

fn default_max_file_size() -> f64 {
    10.0
}

fn default_max_file_age() -> f64 {
    24.0
}

fn default_cleanup_days() -> u64 {
    7
}

fn default_session_prefix() -> String {
    "session".to_string()
}

fn default_pending_capacity() -> usize {
    20_000
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_strategy() -> String {
    "realtime".to_string()
}

fn default_topic() -> String {
    "sensor/hwt905/processed_data".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_interval() -> u64 {
    30
}

fn default_encoding() -> PayloadEncoding {
    PayloadEncoding::Json
}

fn default_source() -> String {
    "HWT905_RasPi".to_string()
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_retry_limit() -> u32 {
    3
}

fn default_broker_address() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "hwt905-raspi-sensor-1".to_string()
}

fn default_keepalive() -> u64 {
    60
}

fn default_raw_queue() -> usize {
    1024
}

fn default_sample_queue() -> usize {
    8192
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_probe_timeout() -> u64 {
    2000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            silence_timeout_ms: default_silence_timeout(),
            read_buffer_size: default_read_buffer(),
            wake_on_open: true,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sample_interval_s: default_sample_interval(),
            gravity: default_gravity(),
            acc_filter: default_acc_filter(),
            acc_filter_param: default_acc_filter_param(),
            rls_sample_frame_size: default_rls_frame(),
            rls_calc_frame_multiplier: default_rls_multiplier(),
            rls_forgetting_factor: default_forgetting_factor(),
            rls_warmup_frames: default_warmup_frames(),
            fft_points: default_fft_points(),
            fft_interval: default_fft_interval(),
            fft_min_freq_hz: default_fft_min_freq(),
            fft_max_freq_hz: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: default_base_dir(),
            format: default_storage_format(),
            max_file_size_mb: default_max_file_size(),
            max_file_age_hours: default_max_file_age(),
            cleanup_after_days: default_cleanup_days(),
            session_prefix: default_session_prefix(),
            rotate_on_reconnect: false,
            pending_capacity: default_pending_capacity(),
            sweep_interval_s: default_sweep_interval(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            topic: default_topic(),
            qos: 0,
            batch_size: default_batch_size(),
            batch_max_interval_s: default_batch_interval(),
            batch_average: false,
            encoding: default_encoding(),
            compress: false,
            source: default_source(),
            publish_timeout_ms: default_publish_timeout(),
            retry_limit: default_retry_limit(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_address: default_broker_address(),
            broker_port: default_broker_port(),
            client_id: default_client_id(),
            keepalive_s: default_keepalive(),
            username: None,
            password: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_queue_capacity: default_raw_queue(),
            sample_queue_capacity: default_sample_queue(),
            output_queue_capacity: default_sample_queue(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("IMU_DAQ_").split("__"))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 || self.serial.read_buffer_size == 0 {
            return Err(DaqError::Configuration(
                "serial.baud_rate and serial.read_buffer_size must be positive".into(),
            ));
        }

        let p = &self.processing;
        if p.sample_interval_s <= 0.0 {
            return Err(DaqError::Configuration(
                "processing.sample_interval_s must be positive".into(),
            ));
        }
        if !(p.rls_forgetting_factor > 0.0 && p.rls_forgetting_factor <= 1.0) {
            return Err(DaqError::Configuration(format!(
                "processing.rls_forgetting_factor {} must be in (0, 1]",
                p.rls_forgetting_factor
            )));
        }
        if p.rls_sample_frame_size == 0 || p.rls_calc_frame_multiplier == 0 {
            return Err(DaqError::Configuration(
                "RLS frame size and multiplier must be positive".into(),
            ));
        }
        if p.fft_points < 2 || p.fft_interval == 0 {
            return Err(DaqError::Configuration(
                "processing.fft_points must be >= 2 and fft_interval positive".into(),
            ));
        }
        match p.acc_filter {
            AccFilterKind::MovingAverage if p.acc_filter_param < 1.0 => {
                return Err(DaqError::Configuration(
                    "moving_average window (acc_filter_param) must be >= 1".into(),
                ));
            }
            AccFilterKind::LowPass if !(0.0..=1.0).contains(&p.acc_filter_param) => {
                return Err(DaqError::Configuration(
                    "low_pass alpha (acc_filter_param) must be in [0, 1]".into(),
                ));
            }
            _ => {}
        }

        if self.storage.max_file_size_mb <= 0.0 || self.storage.max_file_age_hours <= 0.0 {
            return Err(DaqError::Configuration(
                "storage rotation thresholds must be positive".into(),
            ));
        }
        if self.storage.pending_capacity == 0 {
            return Err(DaqError::Configuration(
                "storage.pending_capacity must be positive".into(),
            ));
        }

        let valid_strategies = crate::publisher::STRATEGY_NAMES;
        if !valid_strategies.contains(&self.publisher.strategy.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid publisher strategy '{}'. Must be one of: {}",
                self.publisher.strategy,
                valid_strategies.join(", ")
            )));
        }
        if self.publisher.qos > 2 {
            return Err(DaqError::Configuration(format!(
                "Invalid qos {}. Must be 0-2",
                self.publisher.qos
            )));
        }
        if self.publisher.batch_size == 0 {
            return Err(DaqError::Configuration(
                "publisher.batch_size must be positive".into(),
            ));
        }

        let q = &self.pipeline;
        if q.raw_queue_capacity == 0 || q.sample_queue_capacity == 0 || q.output_queue_capacity == 0
        {
            return Err(DaqError::Configuration(
                "pipeline queue capacities must be positive".into(),
            ));
        }

        if self.recovery.backoff_multiplier < 1.0 {
            return Err(DaqError::Configuration(
                "recovery.backoff_multiplier must be >= 1.0".into(),
            ));
        }

        Ok(())
    }
}
