pub mod ble;
pub mod classic;
pub mod discovery;
pub mod rfcomm;
pub mod sim;
pub mod tcp;
pub mod traits;

pub use ble::{BleBackend, BleConfig, BleSession};
pub use classic::ClassicSession;
pub use discovery::ScanFilter;
pub use rfcomm::{RfcommBackend, RfcommConfig, RfcommTransportStream};
pub use sim::{SimDevice, SimulatedBackend, SIM_SELECTOR};
pub use tcp::{TcpSimBackend, TcpTransportStream};
pub use traits::{BluetoothBackend, TransportKind, TransportSession, TransportStream};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{broadcast, watch};
use tracing::warn;

/// Adapt a broadcast receiver into a stream that ends when all senders drop
pub(crate) fn broadcast_stream<T>(rx: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(item) => return Some((item, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("[LINK] Slow subscriber skipped {} item(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Current value of a watch channel followed by every change
pub(crate) fn watch_stream<T>(rx: watch::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + Sync + 'static,
{
    stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first && rx.changed().await.is_err() {
            return None;
        }
        let value = rx.borrow_and_update().clone();
        Some((value, (rx, false)))
    })
    .boxed()
}
