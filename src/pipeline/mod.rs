//! The concurrent sensor pipeline.
//!
//! Reader → Decoder → Processor → Publisher, joined by bounded queues and
//! driven by the [`PipelineCoordinator`].

pub mod coordinator;
pub mod stages;
pub mod state;
pub mod stop;

pub use coordinator::{PipelineCoordinator, PipelineReport};
pub use state::{BrokerLink, PipelineState, PipelineStatus, SensorLink, StatusBoard};
pub use stop::{stop_pair, StopHandle, StopSignal};
