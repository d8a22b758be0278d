//! Transport reader: owns the port and declares connection loss.

use super::serial::DynSerial;
use crate::config::SerialConfig;
use crate::error::{DaqError, DeviceErrorKind};
use crate::pipeline::stop::StopSignal;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

/// ENXIO: no such device or address.
const ENXIO: i32 = 6;
/// EIO: I/O error, reported by USB serial adapters on unplug.
const EIO: i32 = 5;
/// ENODEV: no such device.
const ENODEV: i32 = 19;

/// Why the link was declared lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    EndOfStream,
    Removed(String),
    SilenceTimeout(Duration),
    Io(String),
}

impl LossReason {
    pub fn kind(&self) -> DeviceErrorKind {
        match self {
            LossReason::EndOfStream => DeviceErrorKind::EndOfStream,
            LossReason::Removed(_) => DeviceErrorKind::Removed,
            LossReason::SilenceTimeout(_) => DeviceErrorKind::SilenceTimeout,
            LossReason::Io(_) => DeviceErrorKind::Io,
        }
    }

    /// Classify a read error.
    pub fn classify(err: &io::Error) -> Self {
        use io::ErrorKind::*;
        let removed = matches!(
            err.kind(),
            UnexpectedEof
                | BrokenPipe
                | NotConnected
                | PermissionDenied
                | ConnectionReset
                | ConnectionAborted
        ) || matches!(err.raw_os_error(), Some(ENODEV | ENXIO | EIO));
        if removed {
            LossReason::Removed(err.to_string())
        } else {
            LossReason::Io(err.to_string())
        }
    }
}

impl From<LossReason> for DaqError {
    fn from(reason: LossReason) -> Self {
        let message = match &reason {
            LossReason::EndOfStream => "port reported end of stream".to_string(),
            LossReason::Removed(msg) | LossReason::Io(msg) => msg.clone(),
            LossReason::SilenceTimeout(after) => format!("no bytes for {after:?}"),
        };
        DaqError::device(reason.kind(), message)
    }
}

/// Result of one [`TransportReader::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes from the port, in arrival order.
    Data(Bytes),
    /// The link just failed. Reported once per loss.
    ConnectionLost(LossReason),
    /// The link failed earlier and the reader has not been reset.
    Halted,
    /// A stop was requested.
    Stopped,
}

/// Exclusive owner of the serial handle.
pub struct TransportReader {
    port: Option<DynSerial>,
    buf: Vec<u8>,
    silence_timeout: Duration,
    bytes_read: u64,
    losses: u64,
}

impl TransportReader {
    pub fn new(port: DynSerial, config: &SerialConfig) -> Self {
        Self::with_settings(
            port,
            Duration::from_millis(config.silence_timeout_ms),
            config.read_buffer_size,
        )
    }

    pub fn with_settings(port: DynSerial, silence_timeout: Duration, read_buffer_size: usize) -> Self {
        Self {
            port: Some(port),
            buf: vec![0u8; read_buffer_size.max(1)],
            silence_timeout,
            bytes_read: 0,
            losses: 0,
        }
    }

    /// Wait for bytes, a failure, the silence timeout, or a stop request.
    pub async fn read(&mut self, stop: &StopSignal) -> ReadOutcome {
        if stop.is_stopped() {
            return ReadOutcome::Stopped;
        }
        let reason = loop {
            let Some(port) = self.port.as_mut() else {
                return ReadOutcome::Halted;
            };

            let result = tokio::select! {
                biased;
                _ = stop.stopped() => return ReadOutcome::Stopped,
                res = tokio::time::timeout(self.silence_timeout, port.read(&mut self.buf)) => res,
            };

            match result {
                Ok(Ok(0)) => break LossReason::EndOfStream,
                Ok(Ok(n)) => {
                    self.bytes_read += n as u64;
                    return ReadOutcome::Data(Bytes::copy_from_slice(&self.buf[..n]));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("Serial read interrupted, retrying");
                }
                Ok(Err(e)) => break LossReason::classify(&e),
                Err(_) => break LossReason::SilenceTimeout(self.silence_timeout),
            }
        };
        self.lose(reason)
    }

    fn lose(&mut self, reason: LossReason) -> ReadOutcome {
        // Dropping the handle closes the port on every loss path.
        self.port = None;
        self.losses += 1;
        warn!(
            kind = %reason.kind(),
            reason = ?reason,
            bytes_read = self.bytes_read,
            "Sensor connection lost"
        );
        ReadOutcome::ConnectionLost(reason)
    }

    /// Re-arm with a freshly opened port.
    pub fn reset(&mut self, port: DynSerial) {
        self.port = Some(port);
    }

    /// Close the port without declaring a loss.
    pub fn release(&mut self) {
        self.port = None;
    }

    pub fn is_halted(&self) -> bool {
        self.port.is_none()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn losses(&self) -> u64 {
        self.losses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stop::stop_pair;
    use tokio::io::AsyncWriteExt;

    fn reader(device: tokio::io::DuplexStream, silence_ms: u64) -> TransportReader {
        TransportReader::with_settings(Box::new(device), Duration::from_millis(silence_ms), 64)
    }

    #[tokio::test]
    async fn yields_bytes_in_order() {
        let (mut host, device) = tokio::io::duplex(64);
        let (_handle, stop) = stop_pair();
        let mut reader = reader(device, 500);
        host.write_all(&[1, 2, 3]).await.unwrap();
        assert_eq!(
            reader.read(&stop).await,
            ReadOutcome::Data(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(reader.bytes_read(), 3);
    }

    #[tokio::test]
    async fn eof_is_reported_once_then_halted() {
        let (host, device) = tokio::io::duplex(64);
        let (_handle, stop) = stop_pair();
        let mut reader = reader(device, 500);
        drop(host);
        assert_eq!(
            reader.read(&stop).await,
            ReadOutcome::ConnectionLost(LossReason::EndOfStream)
        );
        assert_eq!(reader.read(&stop).await, ReadOutcome::Halted);
        assert_eq!(reader.read(&stop).await, ReadOutcome::Halted);
        assert_eq!(reader.losses(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_timeout_declares_loss() {
        let (_host, device) = tokio::io::duplex(64);
        let (_handle, stop) = stop_pair();
        let mut reader = reader(device, 200);
        assert!(matches!(
            reader.read(&stop).await,
            ReadOutcome::ConnectionLost(LossReason::SilenceTimeout(_))
        ));
        assert!(reader.is_halted());
    }

    #[tokio::test]
    async fn reset_rearms_reader() {
        let (host, device) = tokio::io::duplex(64);
        let (_handle, stop) = stop_pair();
        let mut reader = reader(device, 500);
        drop(host);
        reader.read(&stop).await;

        let (mut host, device) = tokio::io::duplex(64);
        reader.reset(Box::new(device));
        host.write_all(&[9]).await.unwrap();
        assert_eq!(
            reader.read(&stop).await,
            ReadOutcome::Data(Bytes::from_static(&[9]))
        );
    }

    #[tokio::test]
    async fn stop_interrupts_blocked_read() {
        let (_host, device) = tokio::io::duplex(64);
        let (handle, stop) = stop_pair();
        let mut reader = reader(device, 60_000);
        let task = tokio::spawn(async move { reader.read(&stop).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.stop();
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Stopped);
    }

    #[test]
    fn removal_errors_classified() {
        let err = io::Error::from_raw_os_error(ENODEV);
        assert!(matches!(LossReason::classify(&err), LossReason::Removed(_)));
        let err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(LossReason::classify(&err), LossReason::Removed(_)));
        let err = io::Error::new(io::ErrorKind::InvalidData, "framing");
        assert!(matches!(LossReason::classify(&err), LossReason::Io(_)));
    }

    #[test]
    fn loss_converts_to_device_error() {
        let err: DaqError = LossReason::SilenceTimeout(Duration::from_secs(2)).into();
        assert!(matches!(
            err,
            DaqError::Device {
                kind: DeviceErrorKind::SilenceTimeout,
                ..
            }
        ));
    }
}
