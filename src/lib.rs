//! # IMU DAQ Core Library
//!
//! Unattended acquisition pipeline for a 9-axis IMU on a serial link: frame
//! decoding, RLS integration and spectral features, rotating storage, and
//! publishing to an MQTT broker over an unreliable network.
//!
//! ## Crate Structure
//!
//! - **`config`**: layered configuration (defaults, TOML file, `IMU_DAQ_*` environment).
//! - **`error`**: the crate-wide `DaqError` and the failure classes it distinguishes.
//! - **`error_recovery`**: retry and exponential reconnect policies.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`throttle`**: one log line per window for repeated conditions.
//! - **`protocol`**: frame layout, table-driven packet decoding, write commands.
//! - **`transport`**: serial port abstraction and the reader that owns the port.
//! - **`data`**: per-sample signal processing (pre-filter, RLS, FFT).
//! - **`storage`**: rotating session files, the pending ledger and the storage actor.
//! - **`publisher`**: realtime and batch publishing strategies and broker transports.
//! - **`pipeline`**: stage tasks and the coordinator state machine.

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod logging;
pub mod pipeline;
pub mod protocol;
pub mod publisher;
pub mod storage;
pub mod throttle;
pub mod transport;

pub use error::{AppResult, DaqError};
