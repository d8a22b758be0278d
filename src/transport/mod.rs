//! Serial transport: port abstraction and the reader that owns it.

pub mod reader;
pub mod serial;

pub use reader::{LossReason, ReadOutcome, TransportReader};
pub use serial::{drain_serial_buffer, DynSerial, PortOpener, SerialOpener, SerialPortIO};

#[cfg(feature = "tokio_serial")]
pub use serial::open_serial_async;
