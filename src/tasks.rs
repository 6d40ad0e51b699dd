//! Background probes feeding the health registry.

pub mod database_probe;
pub mod device_sweep;
pub mod probe;
pub mod recording_probe;

pub use database_probe::DatabaseProbe;
pub use device_sweep::DeviceSweepProbe;
pub use probe::{Probe, ProbeSet, run_probe};
pub use recording_probe::RecordingProbe;
