//! BLE GATT transport on BlueZ
//!
//! `connect` waits for BlueZ to finish service discovery and indexes every
//! characteristic, so reads and writes never need another discovery round-trip.

use crate::error::{LinkError, LinkResult};
use crate::transport::discovery::{self, ScanFilter};
use crate::transport::traits::{BluetoothBackend, TransportKind, TransportSession};
use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Device, DeviceEvent, DeviceProperty};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use speedlink_shared::{AdapterState, DeviceId, DiscoveredDevice, Selector};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BleConfig {
    pub connect_timeout: Duration,
    /// How long to wait for BlueZ to resolve GATT services after connecting
    pub resolve_timeout: Duration,
    pub filter: ScanFilter,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            resolve_timeout: Duration::from_secs(10),
            filter: ScanFilter::default(),
        }
    }
}

/// BLE central backend on the default BlueZ adapter
pub struct BleBackend {
    adapter: Adapter,
    config: BleConfig,
}

impl BleBackend {
    pub async fn new(config: BleConfig) -> LinkResult<Self> {
        let adapter = discovery::default_adapter().await?;
        Ok(Self::with_adapter(adapter, config))
    }

    pub fn with_adapter(adapter: Adapter, config: BleConfig) -> Self {
        Self { adapter, config }
    }

    async fn wait_services_resolved(&self, device: &Device) -> LinkResult<()> {
        let poll = async {
            loop {
                if device.is_services_resolved().await? {
                    return Ok::<_, LinkError>(());
                }
                sleep(Duration::from_millis(100)).await;
            }
        };
        match timeout(self.config.resolve_timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::transport("GATT service discovery timed out")),
        }
    }

    async fn index_characteristics(
        &self,
        device: &Device,
    ) -> LinkResult<HashMap<Selector, Characteristic>> {
        let mut index = HashMap::new();
        for service in device.services().await? {
            let service_uuid = service.uuid().await?;
            for characteristic in service.characteristics().await? {
                let selector =
                    Selector::characteristic(service_uuid, characteristic.uuid().await?);
                index.insert(selector, characteristic);
            }
        }
        Ok(index)
    }

    async fn open(&self, id: &DeviceId) -> LinkResult<BleSession> {
        let address = discovery::parse_address(id)?;
        let device = self.adapter.device(address)?;

        match timeout(self.config.connect_timeout, device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LinkError::connection(id, e)),
            Err(_) => return Err(LinkError::connection(id, "connect timed out")),
        }

        let resolved = async {
            self.wait_services_resolved(&device).await?;
            self.index_characteristics(&device).await
        }
        .await;

        let characteristics = match resolved {
            Ok(index) => index,
            Err(e) => {
                let _ = device.disconnect().await;
                return Err(LinkError::connection(id, e));
            }
        };

        info!(
            "[BLE] Connected to {}, {} characteristic(s) resolved",
            address,
            characteristics.len()
        );

        Ok(BleSession {
            id: id.clone(),
            display_name: device.name().await.ok().flatten(),
            device,
            characteristics,
        })
    }
}

#[async_trait]
impl BluetoothBackend for BleBackend {
    async fn adapter_state(&self) -> AdapterState {
        discovery::adapter_state(&self.adapter).await
    }

    async fn adapter_events(&self) -> LinkResult<BoxStream<'static, AdapterState>> {
        discovery::adapter_state_stream(self.adapter.clone()).await
    }

    async fn request_permission(&self) -> bool {
        !matches!(
            self.adapter.is_powered().await.map_err(LinkError::from),
            Err(LinkError::PermissionDenied)
        )
    }

    async fn start_scan(&self) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
        discovery::scan_stream(self.adapter.clone(), self.config.filter.clone()).await
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        debug!("[BLE] Discovery ends with its scan stream");
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> LinkResult<Box<dyn TransportSession>> {
        Ok(Box::new(self.open(device).await?))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }
}

pub struct BleSession {
    id: DeviceId,
    display_name: Option<String>,
    device: Device,
    characteristics: HashMap<Selector, Characteristic>,
}

impl BleSession {
    fn characteristic(&self, selector: &Selector) -> LinkResult<&Characteristic> {
        self.characteristics
            .get(selector)
            .ok_or(LinkError::SelectorNotFound(*selector))
    }
}

#[async_trait]
impl TransportSession for BleSession {
    fn device(&self) -> &DeviceId {
        &self.id
    }

    fn display_name(&self) -> Option<String> {
        self.display_name.clone()
    }

    fn has_selector(&self, selector: &Selector) -> bool {
        self.characteristics.contains_key(selector)
    }

    async fn read(&self, selector: &Selector) -> LinkResult<Bytes> {
        let value = self.characteristic(selector)?.read().await?;
        Ok(Bytes::from(value))
    }

    async fn write(&self, selector: &Selector, data: &[u8]) -> LinkResult<()> {
        // Default write request: the call returns once the peripheral acknowledges
        self.characteristic(selector)?.write(data).await?;
        Ok(())
    }

    async fn subscribe(&self, selector: &Selector) -> LinkResult<BoxStream<'static, Bytes>> {
        let notifications = self.characteristic(selector)?.notify().await?;
        Ok(notifications.map(Bytes::from).boxed())
    }

    async fn closed(&self) {
        let events = match self.device.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("[BLE] Cannot watch {} for disconnects: {}", self.id, e);
                return std::future::pending().await;
            }
        };
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                return;
            }
        }
    }

    async fn disconnect(&self) -> LinkResult<()> {
        self.device.disconnect().await?;
        info!("[BLE] Disconnected from {}", self.id);
        Ok(())
    }
}
