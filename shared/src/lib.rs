//! SpeedLink Shared Types
//!
//! This crate provides the domain types, the ASCII telemetry wire protocol and
//! the link state machine shared by the dashboard and the firmware simulator.

pub mod firmware;
pub mod protocol;
pub mod state_machine;

use std::fmt;
pub use uuid::Uuid;

pub use firmware::FirmwareModel;
pub use protocol::{Command, ProtocolError, Snapshot};
pub use state_machine::{ConnectionState, LinkPhase, LinkStateMachine, LinkTrigger, TransitionResult};

/// Dashboard parameters for the telemetry link
pub mod dashboard {
    use super::Uuid;

    /// UART-over-GATT service exposed by the controller's BLE module
    pub const SERIAL_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

    /// Read/write/notify characteristic carrying the ASCII protocol
    pub const SERIAL_CHARACTERISTIC_UUID: Uuid =
        Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

    /// RFCOMM channel of the controller's serial port profile
    pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

    /// Default scan window in milliseconds
    pub const SCAN_TIMEOUT_MS: u64 = 10_000;

    /// Interval between snapshot polls in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 1_000;

    /// Speed slider range in km/h
    pub const SPEED_MIN_KMH: f32 = 0.0;
    pub const SPEED_MAX_KMH: f32 = 100.0;

    /// Gear ratio slider range
    pub const GEAR_RATIO_MIN: u16 = 100;
    pub const GEAR_RATIO_MAX: u16 = 500;
    pub const GEAR_RATIO_DEFAULT: u16 = 100;
}

/// Bluetooth adapter power/authorization state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdapterState {
    #[default]
    Unknown,
    PoweredOff,
    PoweredOn,
    Unauthorized,
    Unsupported,
    Resetting,
}

impl AdapterState {
    /// Whether the adapter can scan and hold connections
    pub fn is_ready(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterState::Unknown => "Unknown",
            AdapterState::PoweredOff => "PoweredOff",
            AdapterState::PoweredOn => "PoweredOn",
            AdapterState::Unauthorized => "Unauthorized",
            AdapterState::Unsupported => "Unsupported",
            AdapterState::Resetting => "Resetting",
        };
        f.write_str(s)
    }
}

/// Opaque, stable device identifier (MAC address on real hardware)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A device seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub display_name: Option<String>,
    /// Signal strength in dBm (if available)
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Name to show for the device, falling back to its id
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Addresses a readable/writable endpoint on the connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// BLE GATT characteristic inside a service
    Characteristic { service: Uuid, characteristic: Uuid },
    /// Bluetooth Classic RFCOMM channel
    Channel(u8),
}

impl Selector {
    pub fn characteristic(service: Uuid, characteristic: Uuid) -> Self {
        Selector::Characteristic {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Characteristic {
                service,
                characteristic,
            } => write!(f, "{}/{}", service, characteristic),
            Selector::Channel(ch) => write!(f, "rfcomm:{}", ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_ready_only_when_powered_on() {
        assert!(AdapterState::PoweredOn.is_ready());
        assert!(!AdapterState::PoweredOff.is_ready());
        assert!(!AdapterState::Resetting.is_ready());
        assert!(!AdapterState::default().is_ready());
    }

    #[test]
    fn test_device_label_falls_back_to_id() {
        let mut dev = DiscoveredDevice {
            id: DeviceId::new("AA:BB:CC:DD:EE:FF"),
            display_name: None,
            rssi: Some(-60),
        };
        assert_eq!(dev.label(), "AA:BB:CC:DD:EE:FF");

        dev.display_name = Some("Dash-ECU".into());
        assert_eq!(dev.label(), "Dash-ECU");
    }

    #[test]
    fn test_selector_display() {
        assert_eq!(Selector::Channel(1).to_string(), "rfcomm:1");
        let sel = Selector::characteristic(Uuid::nil(), Uuid::nil());
        assert!(sel.to_string().contains('/'));
    }
}
