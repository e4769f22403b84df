//! Control loop - the per-node MAPE-K runtime
//!
//! - `telemetry`: the monitor phase's input contract plus synthetic and static sources
//! - `runtime`: `NodeRuntime`, owner of every component and driver of the cycle
//! - `status`: the serialisable status surface

mod runtime;
mod status;
mod telemetry;

pub use runtime::{CycleOutcome, NodeRuntime, NodeRuntimeBuilder, Service};
pub use status::StatusSnapshot;
pub use telemetry::{StaticTelemetry, SyntheticTelemetry, TelemetrySnapshot, TelemetrySource};
