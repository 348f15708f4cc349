//! SpeedLink dashboard
//!
//! Bluetooth link to a vehicle controller reporting speed and gear ratio over
//! BLE or Bluetooth Classic.

pub mod config;
pub mod connection;
pub mod error;
pub mod telemetry;
pub mod transport;

pub use config::{BluetoothConfig, BluetoothMode, ConfigError, DashConfig};
pub use connection::{
    ConnectedDevice, ConnectionManager, DisconnectReason, LinkConfig, LinkEvent, ScanConfig,
};
pub use error::{LinkError, LinkResult};
pub use telemetry::{Telemetry, TelemetryClient, TelemetryError, TelemetryPoller};
