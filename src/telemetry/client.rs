//! Telemetry commands over the connection manager
//!
//! Encodes dashboard actions into the ASCII protocol and decodes snapshot
//! replies.

use crate::connection::ConnectionManager;
use crate::error::LinkError;
use speedlink_shared::{Command, ProtocolError, Selector, Snapshot};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TelemetryError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error("Malformed telemetry: {0}")]
    Protocol(#[from] ProtocolError),
}

pub struct TelemetryClient {
    manager: Arc<ConnectionManager>,
    selector: Selector,
    /// Keeps a request/reply pair from interleaving with other client calls
    exchange: Mutex<()>,
}

impl TelemetryClient {
    pub fn new(manager: Arc<ConnectionManager>, selector: Selector) -> Self {
        Self {
            manager,
            selector,
            exchange: Mutex::new(()),
        }
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Send `R` and parse the reply
    pub async fn request_snapshot(&self) -> Result<Snapshot, TelemetryError> {
        let _exchange = self.exchange.lock().await;
        self.manager
            .write(&self.selector, &Command::ReadSnapshot.encode())
            .await?;
        let reply = self.manager.read(&self.selector).await?;
        let snapshot = Snapshot::parse(&reply)?;
        debug!(
            "[POLL] Snapshot {} km/h, gear ratio {}",
            snapshot.speed_kmh(),
            snapshot.gear_ratio
        );
        Ok(snapshot)
    }

    /// Set the target speed in km/h (one decimal place)
    pub async fn set_speed(&self, kmh: f32) -> Result<(), TelemetryError> {
        self.send(Command::set_speed_kmh(kmh)?).await
    }

    pub async fn set_gear_ratio(&self, ratio: u16) -> Result<(), TelemetryError> {
        self.send(Command::set_gear_ratio(ratio)?).await
    }

    pub async fn send(&self, command: Command) -> Result<(), TelemetryError> {
        let _exchange = self.exchange.lock().await;
        self.manager.write(&self.selector, &command.encode()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LinkConfig;
    use crate::transport::sim::{SimDevice, SimulatedBackend, SIM_SELECTOR};
    use speedlink_shared::DeviceId;

    async fn connected_client() -> (SimulatedBackend, TelemetryClient) {
        let backend = SimulatedBackend::new();
        backend.add_device(SimDevice::new("sim-1", "SpeedLink-1")).await;
        let manager = ConnectionManager::new(Arc::new(backend.clone()), LinkConfig::default())
            .await
            .unwrap();
        manager.connect(&DeviceId::new("sim-1")).await.unwrap();
        (backend, TelemetryClient::new(Arc::new(manager), SIM_SELECTOR))
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_snapshot() {
        let (_backend, client) = connected_client().await;
        let snapshot = client.request_snapshot().await.unwrap();
        assert_eq!(snapshot.speed_tenths, 0);
        assert_eq!(snapshot.gear_ratio, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_points_round_trip_through_firmware() {
        let (backend, client) = connected_client().await;
        client.set_speed(65.0).await.unwrap();
        client.set_gear_ratio(300).await.unwrap();

        let snapshot = client.request_snapshot().await.unwrap();
        assert_eq!(snapshot.speed_kmh(), 65.0);
        assert_eq!(snapshot.gear_ratio, 300);

        let log = backend.write_log().await;
        assert_eq!(&log[0][..], b"SP0650");
        assert_eq!(&log[1][..], b"GR0300");
        assert_eq!(&log[2][..], b"R");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_is_not_sent() {
        let (backend, client) = connected_client().await;
        assert!(matches!(
            client.set_speed(1000.0).await,
            Err(TelemetryError::Protocol(ProtocolError::OutOfRange(_)))
        ));
        assert!(backend.write_log().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_exchanges_stay_paired() {
        let (_backend, client) = connected_client().await;
        let (a, b, c) = tokio::join!(
            client.request_snapshot(),
            client.set_speed(40.0),
            client.request_snapshot()
        );
        assert_eq!(a.unwrap().speed_tenths, 0);
        assert!(b.is_ok());
        assert_eq!(c.unwrap().speed_tenths, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_without_connection() {
        let backend = SimulatedBackend::new();
        let manager = ConnectionManager::new(Arc::new(backend), LinkConfig::default())
            .await
            .unwrap();
        let client = TelemetryClient::new(Arc::new(manager), SIM_SELECTOR);
        assert_eq!(
            client.request_snapshot().await,
            Err(TelemetryError::Link(LinkError::NotConnected))
        );
    }
}
