//! Periodic snapshot polling
//!
//! Runs a background task owned by the caller. The latest reading is published
//! through a watch channel; dropping the poller stops the task.

use crate::error::LinkError;
use crate::telemetry::client::{TelemetryClient, TelemetryError};
use speedlink_shared::Snapshot;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// A snapshot and when it arrived
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub snapshot: Snapshot,
    pub received_at: Instant,
}

pub struct TelemetryPoller {
    latest: watch::Receiver<Option<Telemetry>>,
    task: JoinHandle<()>,
}

impl TelemetryPoller {
    /// Start polling every `period`; the first request goes out immediately
    pub fn spawn(client: Arc<TelemetryClient>, period: Duration) -> Self {
        let (tx, latest) = watch::channel(None);
        info!("[POLL] Polling telemetry every {:?}", period);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                match client.request_snapshot().await {
                    Ok(snapshot) => {
                        tx.send_replace(Some(Telemetry {
                            snapshot,
                            received_at: Instant::now(),
                        }));
                    }
                    Err(TelemetryError::Link(LinkError::NotConnected)) => {
                        debug!("[POLL] Skipped, no device connected");
                    }
                    Err(e) => warn!("[POLL] Snapshot request failed: {}", e),
                }
            }
        });

        Self { latest, task }
    }

    /// Most recent reading, if any
    pub fn latest(&self) -> Option<Telemetry> {
        *self.latest.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Telemetry>> {
        self.latest.clone()
    }
}

impl Drop for TelemetryPoller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionManager, LinkConfig};
    use crate::transport::sim::{SimDevice, SimulatedBackend, SIM_SELECTOR};
    use speedlink_shared::DeviceId;
    use tokio::time::{sleep, timeout};

    async fn client() -> (SimulatedBackend, Arc<TelemetryClient>) {
        let backend = SimulatedBackend::new();
        backend.add_device(SimDevice::new("sim-1", "SpeedLink-1")).await;
        let manager = ConnectionManager::new(Arc::new(backend.clone()), LinkConfig::default())
            .await
            .unwrap();
        let client = TelemetryClient::new(Arc::new(manager), SIM_SELECTOR);
        (backend, Arc::new(client))
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_latest_snapshot() {
        let (_backend, client) = client().await;
        client
            .manager()
            .connect(&DeviceId::new("sim-1"))
            .await
            .unwrap();

        let poller = TelemetryPoller::spawn(client.clone(), Duration::from_secs(1));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(poller.latest().unwrap().snapshot.gear_ratio, 100);

        client.set_gear_ratio(250).await.unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(poller.latest().unwrap().snapshot.gear_ratio, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_polling_through_disconnects() {
        let (_backend, client) = client().await;
        let poller = TelemetryPoller::spawn(client.clone(), Duration::from_secs(1));

        sleep(Duration::from_millis(2500)).await;
        assert!(poller.latest().is_none());

        client
            .manager()
            .connect(&DeviceId::new("sim-1"))
            .await
            .unwrap();
        sleep(Duration::from_secs(1)).await;
        assert!(poller.latest().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_task() {
        let (_backend, client) = client().await;
        let poller = TelemetryPoller::spawn(client, Duration::from_secs(1));
        let mut updates = poller.subscribe();

        drop(poller);
        let closed = timeout(Duration::from_secs(5), updates.changed()).await;
        assert!(matches!(closed, Ok(Err(_))));
    }
}
