//! Pipeline state machine and link status.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of the pipeline coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    /// Stages are running for connection epoch `epoch` (1-based).
    Running { epoch: u32 },
    /// The sensor link is down and being reopened.
    Recovering,
    Stopped,
}

impl PipelineState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        matches!(
            (self, target),
            // Initial open goes through the same path as a reconnect
            (Idle, Recovering) |
            (Idle, Running { .. }) |
            (Idle, Stopped) |

            (Running { .. }, Recovering) |
            (Running { .. }, Stopped) |

            (Recovering, Running { .. }) |
            (Recovering, Stopped)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running { .. } => "Running",
            Self::Recovering => "Recovering",
            Self::Stopped => "Stopped",
        }
    }
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Idle
    }
}

/// Physical sensor link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorLink {
    Connected,
    #[default]
    Lost,
    Reconnecting,
}

/// Broker link, tracked independently of the sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrokerLink {
    Connected,
    #[default]
    Disconnected,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub sensor: SensorLink,
    pub broker: BrokerLink,
    pub epochs: u32,
    pub reconnects: u32,
}

/// Shared status cell. The coordinator and the publisher stage write; anyone may watch.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    tx: watch::Sender<PipelineStatus>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PipelineStatus::default());
        Self { tx }
    }

    pub fn snapshot(&self) -> PipelineStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStatus> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&self, next: PipelineState) -> AppResult<()> {
        let current = self.tx.borrow().state;
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(&next) {
            return Err(DaqError::Configuration(format!(
                "invalid pipeline transition {} -> {}",
                current.name(),
                next.name()
            )));
        }
        self.tx.send_modify(|status| {
            status.state = next;
            if let PipelineState::Running { epoch } = next {
                status.epochs = epoch;
            }
        });
        info!(from = current.name(), to = next.name(), "Pipeline state changed");
        Ok(())
    }

    pub fn set_sensor(&self, link: SensorLink) {
        self.tx.send_if_modified(|status| {
            let changed = status.sensor != link;
            status.sensor = link;
            changed
        });
    }

    pub fn set_broker(&self, link: BrokerLink) {
        let changed = self.tx.send_if_modified(|status| {
            let changed = status.broker != link;
            status.broker = link;
            changed
        });
        if changed {
            info!(broker = ?link, "Broker link changed");
        }
    }

    pub fn count_reconnect(&self) {
        self.tx.send_modify(|status| status.reconnects += 1);
    }
}
