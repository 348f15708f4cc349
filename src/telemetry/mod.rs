//! Vehicle telemetry on top of the connection manager

mod client;
mod poller;

pub use client::{TelemetryClient, TelemetryError};
pub use poller::{Telemetry, TelemetryPoller};
