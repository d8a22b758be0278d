//! Serial port abstractions.
//!
//! - [`SerialPortIO`]: anything that reads and writes asynchronously
//! - [`DynSerial`]: boxed, type-erased port
//! - [`PortOpener`]: how the pipeline (re)opens its port
//!
//! Tests substitute `tokio::io::DuplexStream` halves for real hardware.

use crate::error::{AppResult, DaqError, DeviceErrorKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Async serial I/O: real ports, duplex streams, or mocks.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens the sensor port. Called at startup and on every reconnect attempt.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self) -> AppResult<DynSerial>;

    /// Label used in diagnostics.
    fn describe(&self) -> String;
}

/// Opens a physical port with 8N1 framing and no flow control.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    pub path: String,
    pub baud_rate: u32,
    pub wake_on_open: bool,
}

impl SerialOpener {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            wake_on_open: true,
        }
    }

    pub fn from_config(config: &crate::config::SerialConfig) -> Self {
        Self {
            path: config.port.clone(),
            baud_rate: config.baud_rate,
            wake_on_open: config.wake_on_open,
        }
    }
}

#[async_trait]
impl PortOpener for SerialOpener {
    #[cfg(feature = "tokio_serial")]
    async fn open(&self) -> AppResult<DynSerial> {
        use tokio::io::AsyncWriteExt;

        let mut port = open_serial_async(&self.path, self.baud_rate, "IMU").await?;
        let stale = drain_serial_buffer(&mut port, 50).await;
        if stale > 0 {
            tracing::debug!(port = %self.path, bytes = stale, "Discarded stale bytes after open");
        }
        if self.wake_on_open {
            port.write_all(&[0x00]).await.map_err(|e| {
                DaqError::device(DeviceErrorKind::OpenFailed, format!("wake byte: {e}"))
            })?;
        }
        Ok(Box::new(port))
    }

    #[cfg(not(feature = "tokio_serial"))]
    async fn open(&self) -> AppResult<DynSerial> {
        Err(DaqError::FeatureNotEnabled("tokio_serial".into()))
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud_rate)
    }
}

/// Open a serial port on the blocking pool.
#[cfg(feature = "tokio_serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let path = port_path.to_string();
    let name = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                DaqError::device(
                    DeviceErrorKind::OpenFailed,
                    format!("Failed to open {name} serial port {path}: {e}"),
                )
            })
    })
    .await
    .map_err(|e| {
        DaqError::device(
            DeviceErrorKind::OpenFailed,
            format!("spawn_blocking for serial port opening failed: {e}"),
        )
    })?
}

/// Read and discard whatever is immediately available, for at most `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}
