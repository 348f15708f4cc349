//! TCP transport standing in for RFCOMM during development
//!
//! Speaks the same line protocol as a Classic session, against `firmware-sim`.

use crate::error::{LinkError, LinkResult};
use crate::transport::classic::ClassicSession;
use crate::transport::traits::{BluetoothBackend, TransportKind, TransportSession, TransportStream};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use speedlink_shared::dashboard::DEFAULT_RFCOMM_CHANNEL;
use speedlink_shared::{AdapterState, DeviceId, DiscoveredDevice};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

/// TCP stream wrapper implementing TransportStream
pub struct TcpTransportStream {
    inner: TcpStream,
}

impl TcpTransportStream {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl AsyncRead for TcpTransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransportStream {
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
impl TransportStream for TcpTransportStream {
    async fn shutdown(&mut self) -> LinkResult<()> {
        tokio::io::AsyncWriteExt::shutdown(&mut self.inner).await?;
        Ok(())
    }
}

/// Backend with an always-on "adapter" whose only device is a TCP endpoint
pub struct TcpSimBackend {
    address: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl TcpSimBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, read_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.read_timeout = read_timeout;
        self
    }

    fn device(&self) -> DiscoveredDevice {
        DiscoveredDevice {
            id: DeviceId::new(self.address.clone()),
            display_name: Some("SpeedLink-Sim".into()),
            rssi: None,
        }
    }
}

#[async_trait]
impl BluetoothBackend for TcpSimBackend {
    async fn adapter_state(&self) -> AdapterState {
        AdapterState::PoweredOn
    }

    async fn adapter_events(&self) -> LinkResult<BoxStream<'static, AdapterState>> {
        Ok(stream::once(async { AdapterState::PoweredOn })
            .chain(stream::pending())
            .boxed())
    }

    async fn request_permission(&self) -> bool {
        true
    }

    async fn start_scan(&self) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
        Ok(stream::iter([self.device()]).chain(stream::pending()).boxed())
    }

    async fn stop_scan(&self) -> LinkResult<()> {
        Ok(())
    }

    async fn connect(&self, device: &DeviceId) -> LinkResult<Box<dyn TransportSession>> {
        if device.as_str() != self.address {
            return Err(LinkError::connection(device, "unknown simulated device"));
        }

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(LinkError::connection(device, e)),
            Err(_) => return Err(LinkError::connection(device, "connect timed out")),
        };

        info!("[TCP] Connected to firmware simulator at {}", self.address);
        Ok(Box::new(ClassicSession::spawn(
            TcpTransportStream::new(stream),
            device.clone(),
            Some("SpeedLink-Sim".into()),
            DEFAULT_RFCOMM_CHANNEL,
            self.read_timeout,
        )))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Classic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use speedlink_shared::Selector;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_scan_reports_endpoint() {
        let backend = TcpSimBackend::new("127.0.0.1:9000");
        let mut scan = backend.start_scan().await.unwrap();
        let found = scan.next().await.unwrap();
        assert_eq!(found.id.as_str(), "127.0.0.1:9000");
        assert_eq!(backend.kind(), TransportKind::Classic);
    }

    #[tokio::test]
    async fn test_connect_unknown_device_fails() {
        let backend = TcpSimBackend::new("127.0.0.1:9000");
        let result = backend.connect(&DeviceId::new("127.0.0.1:1")).await;
        assert!(matches!(result, Err(LinkError::Connection { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_exchange_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut cmd = [0u8; 1];
            socket.read_exact(&mut cmd).await.unwrap();
            assert_eq!(&cmd, b"R");
            socket.write_all(b"01200150\n").await.unwrap();
            // Keep the socket open until the client hangs up
            let _ = socket.read(&mut cmd).await;
        });

        let backend = TcpSimBackend::new(addr.clone());
        let session = backend.connect(&DeviceId::new(addr)).await.unwrap();
        let selector = Selector::Channel(DEFAULT_RFCOMM_CHANNEL);

        session.write(&selector, b"R").await.unwrap();
        let reply = session.read(&selector).await.unwrap();
        assert_eq!(&reply[..], b"01200150");
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_reply_is_not_returned_later() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut cmd = [0u8; 1];
            socket.read_exact(&mut cmd).await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            socket.write_all(b"00010001\n").await.unwrap();
            socket.read_exact(&mut cmd).await.unwrap();
            socket.write_all(b"00020002\n").await.unwrap();
            let _ = socket.read(&mut cmd).await;
        });

        let backend = TcpSimBackend::new(addr.clone())
            .with_timeouts(Duration::from_secs(1), Duration::from_millis(100));
        let session = backend.connect(&DeviceId::new(addr)).await.unwrap();
        let selector = Selector::Channel(DEFAULT_RFCOMM_CHANNEL);

        session.write(&selector, b"R").await.unwrap();
        assert!(matches!(
            session.read(&selector).await,
            Err(LinkError::Transport(_))
        ));
        tokio::time::sleep(Duration::from_millis(400)).await;

        session.write(&selector, b"R").await.unwrap();
        let reply = session.read(&selector).await.unwrap();
        assert_eq!(&reply[..], b"00020002");
    }
}
