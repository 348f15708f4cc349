//! Transport trait abstraction for pluggable Bluetooth backends

use crate::error::LinkResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use speedlink_shared::{AdapterState, DeviceId, DiscoveredDevice, Selector};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Which transport family a backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// BLE GATT characteristics
    Ble,
    /// Bluetooth Classic RFCOMM socket
    Classic,
    /// In-process simulation
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Ble => write!(f, "BLE"),
            TransportKind::Classic => write!(f, "Classic"),
            TransportKind::Simulated => write!(f, "Simulated"),
        }
    }
}

/// A byte stream that a Classic session runs over
#[async_trait]
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Close the transport gracefully
    async fn shutdown(&mut self) -> LinkResult<()>;
}

/// Platform Bluetooth stack: adapter state, discovery and connection setup
#[async_trait]
pub trait BluetoothBackend: Send + Sync {
    /// Current adapter state
    async fn adapter_state(&self) -> AdapterState;

    /// Adapter state changes; the first item is the state at subscription time
    async fn adapter_events(&self) -> LinkResult<BoxStream<'static, AdapterState>>;

    /// Ask the platform for runtime Bluetooth permission; true if granted
    async fn request_permission(&self) -> bool;

    /// Begin discovery; the stream may repeat devices and never ends on its own
    async fn start_scan(&self) -> LinkResult<BoxStream<'static, DiscoveredDevice>>;

    /// Stop discovery started by `start_scan`
    async fn stop_scan(&self) -> LinkResult<()>;

    /// Connect and fully resolve the device topology
    async fn connect(&self, device: &DeviceId) -> LinkResult<Box<dyn TransportSession>>;

    /// Human-readable name for this backend
    fn kind(&self) -> TransportKind;
}

/// An established connection to one device
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn device(&self) -> &DeviceId;

    fn display_name(&self) -> Option<String>;

    /// Whether the selector was found during topology resolution
    fn has_selector(&self, selector: &Selector) -> bool;

    async fn read(&self, selector: &Selector) -> LinkResult<Bytes>;

    /// Write with transport-level acknowledgement
    async fn write(&self, selector: &Selector, data: &[u8]) -> LinkResult<()>;

    /// Notification payloads from the selector
    async fn subscribe(&self, selector: &Selector) -> LinkResult<BoxStream<'static, Bytes>>;

    /// Resolves when the transport drops without a local disconnect
    async fn closed(&self);

    async fn disconnect(&self) -> LinkResult<()>;
}
