//! Status channel
//!
//! Push-based broadcast of instance state transitions and scaling events for
//! external dashboards and telemetry collectors. Delivery is at-least-once:
//! a lagging subscriber can observe drops and, after reconnecting, replays
//! from the registry, so consumers must tolerate duplicates.

use gantry_core::domain::event::ScalingEvent;
use gantry_core::domain::runner::RunnerState;
use gantry_core::dto::runner::InstanceSummary;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Default buffer size per subscriber before lag kicks in
const CHANNEL_CAPACITY: usize = 256;

/// An event pushed on the status channel
#[derive(Debug, Clone, Serialize)]
pub enum StatusEvent {
    /// A runner instance moved between lifecycle states
    Transition {
        instance: InstanceSummary,
        from: RunnerState,
        to: RunnerState,
    },

    /// A scaling action was recorded
    Scaling(ScalingEvent),
}

/// Broadcast bus for status events
///
/// Cloning shares the underlying channel; `emit` never blocks and never
/// fails (a bus with no subscribers simply drops the event).
#[derive(Debug, Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to status events from this point onward
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Push an event to all current subscribers
    pub fn emit(&self, event: StatusEvent) {
        if self.tx.send(event).is_err() {
            debug!("no status subscribers, event dropped");
        }
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
