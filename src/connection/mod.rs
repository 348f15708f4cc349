//! Connection management for the telemetry link
//!
//! This module handles:
//! - Adapter state observation
//! - Device discovery with a bounded scan window
//! - The single-device connection lifecycle
//! - Request serialization

mod manager;
mod scan;

pub use manager::{
    ConnectedDevice, ConnectionManager, DisconnectReason, LinkConfig, LinkEvent, ScanConfig,
};
