//! Fleet control services
//!
//! Services contain the control-loop logic of the fleet: provisioning and
//! teardown, scaling decisions, credential refresh, health supervision, and
//! job routing. They orchestrate between the pool registry, the platform
//! client, and the container runtime, and never hold authoritative state of
//! their own.

pub mod health;
pub mod lifecycle;
pub mod poller;
pub mod router;
pub mod scaling;
pub mod token;

// Re-export the service types main wires together
pub use health::{HealthConfig, HealthSupervisor};
pub use lifecycle::Provisioner;
pub use poller::QueuePoller;
pub use router::{JobRouter, RouteOutcome};
pub use scaling::ScalingEngine;
pub use token::{RefreshTimers, TokenConfig, TokenManager};
