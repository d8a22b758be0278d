//! Persistence and the batch contract.
//!
//! - [`record`]: CSV and JSON-lines record shapes
//! - [`session`]: one rotating data file
//! - [`ledger`]: sequence-numbered pending records held in memory
//! - [`backlog`]: pending records backed by the data files, with `.ack` cursors
//! - [`coordinator`]: rotation, retention and the backlog behind one owner
//! - [`service`]: the coordinator as an actor task
//! - [`batch`]: the [`BatchSource`] trait used by the batch publisher

pub mod backlog;
pub mod batch;
pub mod coordinator;
pub mod ledger;
pub mod record;
pub mod service;
pub mod session;

pub use backlog::Backlog;
pub use batch::{BatchSource, MemoryBatchSource};
pub use coordinator::{sweep_directory, StorageCoordinator, StorageStats, SweepReport};
pub use ledger::{Batch, PendingLedger};
pub use record::{read_records, CSV_HEADER};
pub use service::{StorageHandle, StorageService};
