//! Custom error types for the pipeline.
//!
//! `DaqError` is the single error type used across the crate. The variants
//! follow the failure classes the pipeline distinguishes at runtime:
//!
//! - **`Framing`**: a byte sequence that is not a valid frame (bad header, bad
//!   checksum, unknown type). Recovered locally by the decoder, counted, never fatal.
//! - **`Device`**: the serial link failed (I/O error, device removal, silence
//!   timeout). Moves the coordinator into `Recovering`, never ends the process.
//! - **`Serialization`**: a record could not be encoded. Permanent for that record;
//!   it is dropped with a diagnostic and never retried.
//! - **`DeliveryTransient`**: the broker was unreachable or did not acknowledge.
//!   Retried by the publishing strategy.
//! - **`Storage`**: disk full, permission denied, and similar. Fatal for the storage
//!   path only; processing and publishing continue.
//! - **`Configuration`** / **`Figment`**: invalid or unreadable configuration.
//! - **`StageTimeout`** / **`StageFailed`** / **`ShutdownFailed`**: a stage did
//!   not terminate within the shutdown budget or died. Together with configuration
//!   errors and a configured reconnect bound running out, these are the only
//!   conditions that end the process.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types
//! with the `?` operator.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Why a byte sequence was rejected by the frame decoder.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingError {
    /// First byte of the candidate frame is not the header byte.
    #[error("bad frame header 0x{0:02X}")]
    BadHeader(u8),

    /// Trailing checksum does not match the byte sum.
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    BadChecksum {
        /// Checksum computed over the frame bytes.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// Frame is well formed but its type byte has no decode routine.
    #[error("unknown packet type 0x{0:02X}")]
    UnknownType(u8),

    /// Not enough bytes buffered to hold a whole frame yet.
    #[error("incomplete frame")]
    Incomplete,
}

/// Classification of serial link failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    /// The port reported end of stream.
    EndOfStream,
    /// The device was unplugged or re-enumerated.
    Removed,
    /// The port is open but stayed silent past the configured timeout.
    SilenceTimeout,
    /// Any other I/O failure on an open port.
    Io,
    /// The port could not be opened.
    OpenFailed,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceErrorKind::EndOfStream => "end of stream",
            DeviceErrorKind::Removed => "device removed",
            DeviceErrorKind::SilenceTimeout => "silence timeout",
            DeviceErrorKind::Io => "I/O failure",
            DeviceErrorKind::OpenFailed => "open failed",
        };
        f.write_str(label)
    }
}

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Device error ({kind}): {message}")]
    Device {
        kind: DeviceErrorKind,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transient delivery error: {0}")]
    DeliveryTransient(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Configuration error: {0}")]
    Figment(#[from] Box<figment::Error>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Channel '{0}' closed")]
    ChannelClosed(&'static str),

    #[error("Stage '{stage}' did not stop within {timeout:?}")]
    StageTimeout { stage: String, timeout: Duration },

    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    #[error("Reconnection gave up after {0} attempts")]
    ReconnectExhausted(u32),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl DaqError {
    /// Build a device error of the given kind.
    pub fn device(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        DaqError::Device {
            kind,
            message: message.into(),
        }
    }

    /// Conditions that must end the process.
    pub fn is_fatal(&self) -> bool {
        match self {
            DaqError::StageTimeout { .. }
            | DaqError::StageFailed { .. }
            | DaqError::Configuration(_)
            | DaqError::Figment(_)
            | DaqError::FeatureNotEnabled(_)
            | DaqError::ReconnectExhausted(_) => true,
            DaqError::ShutdownFailed(errors) => !errors.is_empty(),
            _ => false,
        }
    }

    /// Conditions a caller may retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DaqError::DeliveryTransient(_) | DaqError::Device { .. }
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Figment(Box::new(err))
    }
}

impl From<serde_json::Error> for DaqError {
    fn from(err: serde_json::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DaqError {
    fn from(err: bincode::Error) -> Self {
        DaqError::Serialization(err.to_string())
    }
}
