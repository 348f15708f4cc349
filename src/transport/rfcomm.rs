//! RFCOMM transport implementation for Bluetooth Classic connections

use crate::error::{LinkError, LinkResult};
use crate::transport::classic::ClassicSession;
use crate::transport::discovery::{self, ScanFilter};
use crate::transport::traits::{BluetoothBackend, TransportKind, TransportSession, TransportStream};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::Adapter;
use futures::stream::BoxStream;
use speedlink_shared::dashboard::DEFAULT_RFCOMM_CHANNEL;
use speedlink_shared::{AdapterState, DeviceId, DiscoveredDevice};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::{debug, info};

/// RFCOMM stream wrapper implementing TransportStream
pub struct RfcommTransportStream {
    inner: RfcommStream,
}

impl RfcommTransportStream {
    pub fn new(stream: RfcommStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for RfcommTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RfcommTransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl TransportStream for RfcommTransportStream {
    async fn shutdown(&mut self) -> LinkResult<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Configuration for the RFCOMM backend
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// RFCOMM channel number of the serial port profile
    pub channel: u8,
    pub connect_timeout: Duration,
    /// How long `read` waits for the next line
    pub read_timeout: Duration,
    pub filter: ScanFilter,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_RFCOMM_CHANNEL,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(2),
            filter: ScanFilter {
                include_paired: true,
                ..Default::default()
            },
        }
    }
}

/// Bluetooth Classic backend on BlueZ
pub struct RfcommBackend {
    adapter: Adapter,
    config: RfcommConfig,
}

impl RfcommBackend {
    /// Open the default adapter
    pub async fn new(config: RfcommConfig) -> LinkResult<Self> {
        let adapter = discovery::default_adapter().await?;
        Ok(Self::with_adapter(adapter, config))
    }

    pub fn with_adapter(adapter: Adapter, config: RfcommConfig) -> Self {
        Self { adapter, config }
    }
}

#[async_trait]
impl BluetoothBackend for RfcommBackend {
    async fn adapter_state(&self) -> AdapterState {
        discovery::adapter_state(&self.adapter).await
    }

    async fn adapter_events(&self) -> LinkResult<BoxStream<'static, AdapterState>> {
        discovery::adapter_state_stream(self.adapter.clone()).await
    }

    async fn request_permission(&self) -> bool {
        // BlueZ enforces access through D-Bus policy; a denied property read is the signal
        !matches!(
            self.adapter.is_powered().await.map_err(LinkError::from),
            Err(LinkError::PermissionDenied)
        )
    }

    async fn start_scan(&self) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
        discovery::scan_stream(self.adapter.clone(), self.config.filter.clone()).await
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        debug!("[RFCOMM] Discovery ends with its scan stream");
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> LinkResult<Box<dyn TransportSession>> {
        let address = discovery::parse_address(device)?;
        let display_name = match self.adapter.device(address) {
            Ok(d) => d.name().await.ok().flatten(),
            Err(_) => None,
        };

        let socket_addr = RfcommAddr::new(address, self.config.channel);
        info!(
            "[RFCOMM] Connecting to {} channel {}",
            address, self.config.channel
        );

        let stream = match timeout(self.config.connect_timeout, RfcommStream::connect(socket_addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(LinkError::connection(device, e)),
            Err(_) => return Err(LinkError::connection(device, "connect timed out")),
        };

        info!("[RFCOMM] Connected to {}", address);
        Ok(Box::new(ClassicSession::spawn(
            RfcommTransportStream::new(stream),
            device.clone(),
            display_name,
            self.config.channel,
            self.config.read_timeout,
        )))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Classic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RfcommConfig::default();
        assert_eq!(config.channel, DEFAULT_RFCOMM_CHANNEL);
        assert!(config.filter.include_paired);
        assert!(config.filter.name_prefix.is_none());
    }
}
