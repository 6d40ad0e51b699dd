//! Process-local health tracking and the `/healthy` endpoint that exposes it.

pub mod endpoint;
pub mod registry;

pub use endpoint::{HealthServer, HealthWire};
pub use registry::{AggregateStatus, HealthRecord, HealthRegistry, HealthSnapshot};
