//! BlueZ adapter access and device discovery shared by the BLE and RFCOMM backends

use crate::error::{LinkError, LinkResult};
use bluer::{Adapter, AdapterEvent, AdapterProperty, Address};
use futures::stream::{self, BoxStream, StreamExt};
use speedlink_shared::{AdapterState, DeviceId, DiscoveredDevice};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Which discovered devices are surfaced to the caller
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Device name prefix to match (None accepts every device)
    pub name_prefix: Option<String>,
    /// Device ids that always match regardless of name
    pub known_devices: Vec<DeviceId>,
    /// Report already-paired devices before live discovery results
    pub include_paired: bool,
}

impl ScanFilter {
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        if self.known_devices.contains(&device.id) {
            return true;
        }

        match (&self.name_prefix, &device.display_name) {
            (None, _) => true,
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            (Some(_), None) => false,
        }
    }
}

/// Get the default Bluetooth adapter without changing its power state
pub async fn default_adapter() -> LinkResult<Adapter> {
    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    info!("[BT] Using adapter {}", adapter.name());
    Ok(adapter)
}

/// Map the adapter's powered property onto [`AdapterState`]
pub async fn adapter_state(adapter: &Adapter) -> AdapterState {
    match adapter.is_powered().await {
        Ok(true) => AdapterState::PoweredOn,
        Ok(false) => AdapterState::PoweredOff,
        Err(e) => match LinkError::from(e) {
            LinkError::PermissionDenied => AdapterState::Unauthorized,
            other => {
                warn!("[BT] Failed to query adapter power: {}", other);
                AdapterState::Unknown
            }
        },
    }
}

/// Adapter power changes, starting with the current state
pub async fn adapter_state_stream(adapter: Adapter) -> LinkResult<BoxStream<'static, AdapterState>> {
    let current = adapter_state(&adapter).await;
    let events = adapter.events().await?;

    let changes = events.filter_map(|event| async move {
        match event {
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(true)) => {
                Some(AdapterState::PoweredOn)
            }
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
                Some(AdapterState::PoweredOff)
            }
            _ => None,
        }
    });

    Ok(stream::once(async move { current }).chain(changes).boxed())
}

pub fn parse_address(id: &DeviceId) -> LinkResult<Address> {
    Address::from_str(id.as_str())
        .map_err(|_| LinkError::connection(id, "not a Bluetooth address"))
}

/// Read name and signal strength of a known device
pub async fn describe(adapter: &Adapter, address: Address) -> Option<DiscoveredDevice> {
    let device = adapter.device(address).ok()?;
    Some(DiscoveredDevice {
        id: DeviceId::new(address.to_string()),
        display_name: device.name().await.ok().flatten(),
        rssi: device.rssi().await.ok().flatten(),
    })
}

async fn paired_devices(adapter: &Adapter, filter: &ScanFilter) -> Vec<DiscoveredDevice> {
    let Ok(addresses) = adapter.device_addresses().await else {
        return Vec::new();
    };

    let mut paired = Vec::new();
    for address in addresses {
        let Ok(device) = adapter.device(address) else {
            continue;
        };
        if !matches!(device.is_paired().await, Ok(true)) {
            continue;
        }
        if let Some(found) = describe(adapter, address).await {
            if filter.matches(&found) {
                paired.push(found);
            }
        }
    }
    debug!("[BT] {} paired device(s) match the filter", paired.len());
    paired
}

/// Start discovery; dropping the stream ends discovery on the adapter
pub async fn scan_stream(
    adapter: Adapter,
    filter: ScanFilter,
) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
    let paired = if filter.include_paired {
        paired_devices(&adapter, &filter).await
    } else {
        Vec::new()
    };

    let discover = adapter.discover_devices().await?;
    let discovered = discover.filter_map(move |event| {
        let adapter = adapter.clone();
        let filter = filter.clone();
        async move {
            match event {
                AdapterEvent::DeviceAdded(address) => {
                    let found = describe(&adapter, address).await?;
                    filter.matches(&found).then_some(found)
                }
                _ => None,
            }
        }
    });

    Ok(stream::iter(paired).chain(discovered).boxed())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, name: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            id: DeviceId::new(id),
            display_name: name.map(String::from),
            rssi: None,
        }
    }

    #[test]
    fn test_default_filter_accepts_everything() {
        let filter = ScanFilter::default();
        assert!(filter.matches(&device("AA:BB:CC:DD:EE:01", None)));
        assert!(!filter.include_paired);
    }

    #[test]
    fn test_name_prefix_filter() {
        let filter = ScanFilter {
            name_prefix: Some("SpeedLink".into()),
            ..Default::default()
        };
        assert!(filter.matches(&device("AA:BB:CC:DD:EE:01", Some("SpeedLink-01"))));
        assert!(!filter.matches(&device("AA:BB:CC:DD:EE:02", Some("Headphones"))));
        assert!(!filter.matches(&device("AA:BB:CC:DD:EE:03", None)));
    }

    #[test]
    fn test_known_device_bypasses_prefix() {
        let filter = ScanFilter {
            name_prefix: Some("SpeedLink".into()),
            known_devices: vec![DeviceId::new("AA:BB:CC:DD:EE:03")],
            include_paired: false,
        };
        assert!(filter.matches(&device("AA:BB:CC:DD:EE:03", None)));
    }

    #[test]
    fn test_parse_address() {
        assert!(parse_address(&DeviceId::new("00:11:22:33:44:55")).is_ok());
        assert!(matches!(
            parse_address(&DeviceId::new("sim-001")),
            Err(LinkError::Connection { .. })
        ));
    }
}
