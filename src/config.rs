//! Dashboard configuration
//!
//! Defaults describe a stock controller; a handful of environment variables
//! override them at startup.

use crate::connection::LinkConfig;
use crate::error::LinkResult;
use crate::transport::{
    BleBackend, BleConfig, BluetoothBackend, RfcommBackend, RfcommConfig, ScanFilter, SimDevice,
    SimulatedBackend, TcpSimBackend,
};
use speedlink_shared::dashboard::{
    DEFAULT_RFCOMM_CHANNEL, GEAR_RATIO_MAX, GEAR_RATIO_MIN, POLL_INTERVAL_MS,
    SERIAL_CHARACTERISTIC_UUID, SERIAL_SERVICE_UUID, SPEED_MAX_KMH, SPEED_MIN_KMH,
};
use speedlink_shared::{DeviceId, Selector, Uuid};
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be within {range}, got {value}")]
    OutOfRange {
        key: &'static str,
        value: String,
        range: String,
    },
}

/// Bluetooth transport mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BluetoothMode {
    /// BLE GATT via BlueZ
    #[default]
    Ble,
    /// Bluetooth Classic RFCOMM via BlueZ
    Rfcomm,
    /// Classic protocol over TCP to `firmware-sim`
    TcpSimulation,
    /// In-process adapter and firmware
    Simulated,
}

impl FromStr for BluetoothMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ble" => Ok(BluetoothMode::Ble),
            "rfcomm" | "classic" => Ok(BluetoothMode::Rfcomm),
            "tcp" => Ok(BluetoothMode::TcpSimulation),
            "sim" | "simulated" => Ok(BluetoothMode::Simulated),
            _ => Err(()),
        }
    }
}

/// Bluetooth configuration
#[derive(Debug, Clone)]
pub struct BluetoothConfig {
    pub mode: BluetoothMode,
    /// RFCOMM channel of the controller's serial port
    pub channel: u8,
    /// TCP simulation address (when mode is TcpSimulation)
    pub tcp_address: String,
    /// How long a Classic read waits for the device's reply line
    pub read_timeout: Duration,
    /// Only report devices whose name starts with this
    pub name_prefix: Option<String>,
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub connect_timeout: Duration,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            mode: BluetoothMode::default(),
            channel: DEFAULT_RFCOMM_CHANNEL,
            tcp_address: "127.0.0.1:9000".into(),
            read_timeout: Duration::from_secs(2),
            name_prefix: None,
            service_uuid: SERIAL_SERVICE_UUID,
            characteristic_uuid: SERIAL_CHARACTERISTIC_UUID,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BluetoothConfig {
    /// Where the telemetry protocol is spoken for this mode
    pub fn telemetry_selector(&self) -> Selector {
        match self.mode {
            BluetoothMode::Ble | BluetoothMode::Simulated => {
                Selector::characteristic(self.service_uuid, self.characteristic_uuid)
            }
            BluetoothMode::Rfcomm => Selector::Channel(self.channel),
            BluetoothMode::TcpSimulation => Selector::Channel(DEFAULT_RFCOMM_CHANNEL),
        }
    }

    fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            name_prefix: self.name_prefix.clone(),
            ..Default::default()
        }
    }

    /// Open the backend selected by `mode`
    pub async fn build_backend(&self) -> LinkResult<Arc<dyn BluetoothBackend>> {
        let backend: Arc<dyn BluetoothBackend> = match self.mode {
            BluetoothMode::Ble => Arc::new(
                BleBackend::new(BleConfig {
                    connect_timeout: self.connect_timeout,
                    filter: self.scan_filter(),
                    ..Default::default()
                })
                .await?,
            ),
            BluetoothMode::Rfcomm => Arc::new(
                RfcommBackend::new(RfcommConfig {
                    channel: self.channel,
                    connect_timeout: self.connect_timeout,
                    read_timeout: self.read_timeout,
                    filter: ScanFilter {
                        include_paired: true,
                        ..self.scan_filter()
                    },
                })
                .await?,
            ),
            BluetoothMode::TcpSimulation => Arc::new(
                TcpSimBackend::new(self.tcp_address.clone())
                    .with_timeouts(self.connect_timeout, self.read_timeout),
            ),
            BluetoothMode::Simulated => {
                let backend = SimulatedBackend::new();
                backend
                    .add_device(SimDevice::new("sim-0001", "SpeedLink-Sim"))
                    .await;
                Arc::new(backend)
            }
        };
        Ok(backend)
    }
}

/// Top-level dashboard configuration
#[derive(Debug, Clone)]
pub struct DashConfig {
    pub bluetooth: BluetoothConfig,
    pub link: LinkConfig,
    pub poll_interval: Duration,
    /// Connect to this device instead of the first match
    pub target_device: Option<DeviceId>,
    /// Set-points applied right after connecting
    pub initial_speed_kmh: Option<f32>,
    pub initial_gear_ratio: Option<u16>,
}

impl Default for DashConfig {
    fn default() -> Self {
        Self {
            bluetooth: BluetoothConfig::default(),
            link: LinkConfig::default(),
            poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
            target_device: None,
            initial_speed_kmh: None,
            initial_gear_ratio: None,
        }
    }
}

impl DashConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SPEEDLINK_*` key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mode) = lookup("SPEEDLINK_MODE") {
            config.bluetooth.mode = mode.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SPEEDLINK_MODE",
                value: mode,
            })?;
        }
        if let Some(channel) = parse(&lookup, "SPEEDLINK_CHANNEL")? {
            config.bluetooth.channel = channel;
        }
        if let Some(address) = lookup("SPEEDLINK_TCP_ADDR") {
            config.bluetooth.tcp_address = address;
        }
        config.bluetooth.name_prefix = lookup("SPEEDLINK_NAME_PREFIX").filter(|p| !p.is_empty());
        config.target_device = lookup("SPEEDLINK_DEVICE").map(DeviceId::new);

        if let Some(ms) = parse::<u64>(&lookup, "SPEEDLINK_SCAN_MS")? {
            config.link.scan.timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "SPEEDLINK_POLL_MS")? {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        config.initial_speed_kmh = parse_within(
            &lookup,
            "SPEEDLINK_SPEED",
            SPEED_MIN_KMH..=SPEED_MAX_KMH,
        )?;
        config.initial_gear_ratio = parse_within(
            &lookup,
            "SPEEDLINK_GEAR_RATIO",
            GEAR_RATIO_MIN..=GEAR_RATIO_MAX,
        )?;

        Ok(config)
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

/// Parse `key` and require it to sit on the dashboard slider
fn parse_within<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    range: RangeInclusive<T>,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display,
{
    match parse::<T>(lookup, key)? {
        Some(value) if !range.contains(&value) => Err(ConfigError::OutOfRange {
            key,
            value: value.to_string(),
            range: format!("{}..={}", range.start(), range.end()),
        }),
        value => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DashConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config.bluetooth.mode, BluetoothMode::Ble);
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.link.scan.timeout, Duration::from_millis(10_000));
        assert_eq!(
            config.bluetooth.telemetry_selector(),
            Selector::characteristic(SERIAL_SERVICE_UUID, SERIAL_CHARACTERISTIC_UUID)
        );
    }

    #[test]
    fn test_overrides() {
        let config = DashConfig::from_lookup(env(&[
            ("SPEEDLINK_MODE", "rfcomm"),
            ("SPEEDLINK_CHANNEL", "3"),
            ("SPEEDLINK_DEVICE", "00:11:22:33:44:55"),
            ("SPEEDLINK_NAME_PREFIX", "HC-05"),
            ("SPEEDLINK_SPEED", "42.5"),
        ]))
        .unwrap();

        assert_eq!(config.bluetooth.mode, BluetoothMode::Rfcomm);
        assert_eq!(config.bluetooth.telemetry_selector(), Selector::Channel(3));
        assert_eq!(
            config.target_device,
            Some(DeviceId::new("00:11:22:33:44:55"))
        );
        assert_eq!(config.bluetooth.name_prefix.as_deref(), Some("HC-05"));
        assert_eq!(config.initial_speed_kmh, Some(42.5));
        assert_eq!(config.initial_gear_ratio, None);
    }

    #[test]
    fn test_tcp_mode_uses_default_channel() {
        let config = DashConfig::from_lookup(env(&[
            ("SPEEDLINK_MODE", "tcp"),
            ("SPEEDLINK_CHANNEL", "5"),
        ]))
        .unwrap();
        assert_eq!(
            config.bluetooth.telemetry_selector(),
            Selector::Channel(DEFAULT_RFCOMM_CHANNEL)
        );
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            DashConfig::from_lookup(env(&[("SPEEDLINK_MODE", "wifi")])).unwrap_err(),
            ConfigError::InvalidValue {
                key: "SPEEDLINK_MODE",
                value: "wifi".into()
            }
        );
        assert!(DashConfig::from_lookup(env(&[("SPEEDLINK_POLL_MS", "fast")])).is_err());
    }

    #[test]
    fn test_set_points_limited_to_slider_range() {
        assert!(matches!(
            DashConfig::from_lookup(env(&[("SPEEDLINK_SPEED", "120")])),
            Err(ConfigError::OutOfRange {
                key: "SPEEDLINK_SPEED",
                ..
            })
        ));
        assert!(matches!(
            DashConfig::from_lookup(env(&[("SPEEDLINK_GEAR_RATIO", "50")])),
            Err(ConfigError::OutOfRange {
                key: "SPEEDLINK_GEAR_RATIO",
                ..
            })
        ));

        let config = DashConfig::from_lookup(env(&[
            ("SPEEDLINK_SPEED", "100"),
            ("SPEEDLINK_GEAR_RATIO", "500"),
        ]))
        .unwrap();
        assert_eq!(config.initial_speed_kmh, Some(100.0));
        assert_eq!(config.initial_gear_ratio, Some(500));
    }

    #[tokio::test]
    async fn test_simulated_backend_has_a_device() {
        let config = BluetoothConfig {
            mode: BluetoothMode::Simulated,
            ..Default::default()
        };
        let backend = config.build_backend().await.unwrap();
        assert!(backend.adapter_state().await.is_ready());
        assert!(backend
            .connect(&DeviceId::new("sim-0001"))
            .await
            .is_ok());
    }
}
