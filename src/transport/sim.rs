//! In-memory Bluetooth stack with emulated controllers
//!
//! Drives the dashboard without hardware and backs the connection manager's
//! tests. The adapter state, advertising devices, reachability and link drops
//! are all controllable from the outside.

use crate::error::{LinkError, LinkResult};
use crate::transport::{broadcast_stream, watch_stream};
use crate::transport::traits::{BluetoothBackend, TransportKind, TransportSession};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use speedlink_shared::dashboard::{SERIAL_CHARACTERISTIC_UUID, SERIAL_SERVICE_UUID};
use speedlink_shared::protocol::CommandDecoder;
use speedlink_shared::{AdapterState, DeviceId, DiscoveredDevice, FirmwareModel, Selector};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How many times each device advertises during one scan
const ADVERTISEMENTS_PER_SCAN: usize = 3;

/// Selector of the emulated controller's serial characteristic
pub const SIM_SELECTOR: Selector = Selector::Characteristic {
    service: SERIAL_SERVICE_UUID,
    characteristic: SERIAL_CHARACTERISTIC_UUID,
};

/// An emulated controller
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub info: DiscoveredDevice,
    pub reachable: bool,
    pub firmware: FirmwareModel,
}

impl SimDevice {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            info: DiscoveredDevice {
                id: DeviceId::new(id),
                display_name: Some(name.to_string()),
                rssi: Some(-55),
            },
            reachable: true,
            firmware: FirmwareModel::new(),
        }
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.info.rssi = Some(rssi);
        self
    }

    /// Advertises but refuses connections
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }
}

struct SimLink {
    device: DeviceId,
    dropped: watch::Sender<bool>,
}

struct SimInner {
    adapter: watch::Sender<AdapterState>,
    permission: AtomicBool,
    devices: Mutex<Vec<SimDevice>>,
    advert_interval: Duration,
    io_latency: Mutex<Duration>,
    sessions_opened: AtomicUsize,
    links: Mutex<Vec<SimLink>>,
    write_log: Arc<Mutex<Vec<Bytes>>>,
}

/// Simulated backend; clones share the same emulated world
#[derive(Clone)]
pub struct SimulatedBackend {
    inner: Arc<SimInner>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    /// Powered-on adapter with no devices
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::PoweredOn);
        Self {
            inner: Arc::new(SimInner {
                adapter,
                permission: AtomicBool::new(true),
                devices: Mutex::new(Vec::new()),
                advert_interval: Duration::from_millis(200),
                io_latency: Mutex::new(Duration::from_millis(5)),
                sessions_opened: AtomicUsize::new(0),
                links: Mutex::new(Vec::new()),
                write_log: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    pub async fn add_device(&self, device: SimDevice) {
        self.inner.devices.lock().await.push(device);
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        info!("[SIM] Adapter -> {}", state);
        self.inner.adapter.send_replace(state);
    }

    pub fn set_permission(&self, granted: bool) {
        self.inner.permission.store(granted, Ordering::SeqCst);
    }

    /// Delay applied to every read and write
    pub async fn set_io_latency(&self, latency: Duration) {
        *self.inner.io_latency.lock().await = latency;
    }

    /// Number of transport sessions ever opened
    pub fn sessions_opened(&self) -> usize {
        self.inner.sessions_opened.load(Ordering::SeqCst)
    }

    /// Every payload written to any device, in completion order
    pub async fn write_log(&self) -> Vec<Bytes> {
        self.inner.write_log.lock().await.clone()
    }

    /// Drop the link to `device` as if it went out of range
    pub async fn drop_link(&self, device: &DeviceId) {
        let links = self.inner.links.lock().await;
        for link in links.iter().filter(|l| &l.device == device) {
            link.dropped.send_replace(true);
        }
    }
}

#[async_trait]
impl BluetoothBackend for SimulatedBackend {
    async fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.borrow()
    }

    async fn adapter_events(&self) -> LinkResult<BoxStream<'static, AdapterState>> {
        Ok(watch_stream(self.inner.adapter.subscribe()))
    }

    async fn request_permission(&self) -> bool {
        self.inner.permission.load(Ordering::SeqCst)
    }

    async fn start_scan(&self) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
        let state = *self.inner.adapter.borrow();
        if !state.is_ready() {
            return Err(LinkError::AdapterNotReady(state));
        }

        let advertising: Vec<DiscoveredDevice> = self
            .inner
            .devices
            .lock()
            .await
            .iter()
            .map(|d| d.info.clone())
            .collect();
        let interval = self.inner.advert_interval;
        debug!("[SIM] Scan started, {} device(s) advertising", advertising.len());

        Ok(stream::iter(0..ADVERTISEMENTS_PER_SCAN)
            .flat_map(move |_| stream::iter(advertising.clone()))
            .then(move |device| async move {
                sleep(interval).await;
                device
            })
            .chain(stream::pending())
            .boxed())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        debug!("[SIM] Scan stopped");
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> LinkResult<Box<dyn TransportSession>> {
        let state = *self.inner.adapter.borrow();
        if !state.is_ready() {
            return Err(LinkError::AdapterNotReady(state));
        }

        let device = self
            .inner
            .devices
            .lock()
            .await
            .iter()
            .find(|d| &d.info.id == id)
            .cloned()
            .ok_or_else(|| LinkError::connection(id, "device not in range"))?;

        let latency = *self.inner.io_latency.lock().await;
        sleep(latency).await;
        if !device.reachable {
            return Err(LinkError::connection(id, "device did not respond"));
        }

        let (dropped, dropped_rx) = watch::channel(false);
        self.inner.links.lock().await.push(SimLink {
            device: id.clone(),
            dropped,
        });
        self.inner.sessions_opened.fetch_add(1, Ordering::SeqCst);

        let (notify_tx, _) = broadcast::channel(16);
        Ok(Box::new(SimSession {
            id: id.clone(),
            display_name: device.info.display_name.clone(),
            firmware: Mutex::new(device.firmware),
            decoder: Mutex::new(CommandDecoder::new()),
            notifications: notify_tx,
            dropped: dropped_rx,
            backend: self.clone(),
        }))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }
}

struct SimSession {
    id: DeviceId,
    display_name: Option<String>,
    firmware: Mutex<FirmwareModel>,
    decoder: Mutex<CommandDecoder>,
    notifications: broadcast::Sender<Bytes>,
    dropped: watch::Receiver<bool>,
    backend: SimulatedBackend,
}

impl SimSession {
    fn check(&self, selector: &Selector) -> LinkResult<()> {
        if *self.dropped.borrow() {
            return Err(LinkError::transport("link lost"));
        }
        if !self.has_selector(selector) {
            return Err(LinkError::SelectorNotFound(*selector));
        }
        Ok(())
    }

    async fn latency(&self) {
        let latency = *self.backend.inner.io_latency.lock().await;
        sleep(latency).await;
    }
}

#[async_trait]
impl TransportSession for SimSession {
    fn device(&self) -> &DeviceId {
        &self.id
    }

    fn display_name(&self) -> Option<String> {
        self.display_name.clone()
    }

    fn has_selector(&self, selector: &Selector) -> bool {
        *selector == SIM_SELECTOR
    }

    async fn read(&self, selector: &Selector) -> LinkResult<Bytes> {
        self.check(selector)?;
        self.latency().await;
        Ok(self.firmware.lock().await.snapshot().encode())
    }

    async fn write(&self, selector: &Selector, data: &[u8]) -> LinkResult<()> {
        self.check(selector)?;
        self.latency().await;

        let mut decoder = self.decoder.lock().await;
        let mut firmware = self.firmware.lock().await;
        decoder.extend(data);
        loop {
            match decoder.decode_next() {
                Ok(Some(command)) => {
                    if let Some(snapshot) = firmware.handle(command) {
                        let _ = self.notifications.send(snapshot.encode());
                    }
                }
                Ok(None) => break,
                Err(e) => warn!("[SIM] {} ignored input: {}", self.id, e),
            }
        }

        self.backend
            .inner
            .write_log
            .lock()
            .await
            .push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn subscribe(&self, selector: &Selector) -> LinkResult<BoxStream<'static, Bytes>> {
        self.check(selector)?;
        Ok(broadcast_stream(self.notifications.subscribe()))
    }

    async fn closed(&self) {
        let mut dropped = self.dropped.clone();
        loop {
            if *dropped.borrow_and_update() {
                return;
            }
            if dropped.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    async fn disconnect(&self) -> LinkResult<()> {
        let mut links = self.backend.inner.links.lock().await;
        links.retain(|l| l.device != self.id);
        debug!("[SIM] {} disconnected", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test(start_paused = true)]
    async fn test_scan_repeats_advertisements() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimDevice::new("sim-1", "SpeedLink-1")).await;

        let scan = backend.start_scan().await.unwrap();
        let seen: Vec<_> = scan.take(ADVERTISEMENTS_PER_SCAN).collect().await;
        assert!(seen.iter().all(|d| d.id.as_str() == "sim-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_commands_reach_firmware() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimDevice::new("sim-1", "SpeedLink-1")).await;
        let session = backend.connect(&DeviceId::new("sim-1")).await.unwrap();

        session.write(&SIM_SELECTOR, b"SP0650GR0300").await.unwrap();
        let snapshot = session.read(&SIM_SELECTOR).await.unwrap();
        assert_eq!(&snapshot[..], b"06500300");
        assert_eq!(backend.sessions_opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_snapshot_command_notifies() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimDevice::new("sim-1", "SpeedLink-1")).await;
        let session = backend.connect(&DeviceId::new("sim-1")).await.unwrap();

        let mut notifications = session.subscribe(&SIM_SELECTOR).await.unwrap();
        session.write(&SIM_SELECTOR, b"R").await.unwrap();
        assert_eq!(&notifications.next().await.unwrap()[..], b"00000100");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_and_unknown_devices() {
        let backend = SimulatedBackend::new();
        backend
            .add_device(SimDevice::new("sim-2", "SpeedLink-2").unreachable())
            .await;

        assert!(matches!(
            backend.connect(&DeviceId::new("sim-2")).await,
            Err(LinkError::Connection { .. })
        ));
        assert!(matches!(
            backend.connect(&DeviceId::new("missing")).await,
            Err(LinkError::Connection { .. })
        ));
        assert_eq!(backend.sessions_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_link_resolves_closed() {
        let backend = SimulatedBackend::new();
        backend.add_device(SimDevice::new("sim-1", "SpeedLink-1")).await;
        let session = backend.connect(&DeviceId::new("sim-1")).await.unwrap();

        backend.drop_link(&DeviceId::new("sim-1")).await;
        timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("drop not observed");
        assert!(session.read(&SIM_SELECTOR).await.is_err());
    }

    #[tokio::test]
    async fn test_adapter_events_start_with_current_state() {
        let backend = SimulatedBackend::new();
        let mut events = backend.adapter_events().await.unwrap();
        assert_eq!(events.next().await, Some(AdapterState::PoweredOn));

        backend.set_adapter_state(AdapterState::PoweredOff);
        assert_eq!(events.next().await, Some(AdapterState::PoweredOff));
    }
}
