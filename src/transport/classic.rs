//! Bluetooth Classic session over a byte stream (RFCOMM or TCP simulation)
//!
//! A single I/O task owns the stream. Writes are handed to it over a channel and
//! acknowledged once flushed; inbound bytes are split into lines, queued for
//! `read` and fanned out to subscribers. Every write discards the lines still
//! queued, so a `read` after a write only sees what arrived after it.

use crate::error::{LinkError, LinkResult};
use crate::transport::broadcast_stream;
use crate::transport::traits::{TransportSession, TransportStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use speedlink_shared::protocol::LineDecoder;
use speedlink_shared::{DeviceId, Selector};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Lines buffered for `read`; further lines are dropped until drained
const READ_QUEUE_DEPTH: usize = 32;

/// Why the I/O task stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    Local,
    Dropped,
}

enum StreamRequest {
    Write {
        data: Bytes,
        ack: oneshot::Sender<LinkResult<()>>,
    },
    Shutdown {
        ack: oneshot::Sender<LinkResult<()>>,
    },
}

pub struct ClassicSession {
    device: DeviceId,
    display_name: Option<String>,
    channel: u8,
    read_timeout: Duration,
    requests: mpsc::Sender<StreamRequest>,
    lines: Mutex<mpsc::Receiver<Bytes>>,
    notifications: broadcast::Sender<Bytes>,
    closed: watch::Receiver<Option<CloseCause>>,
}

impl ClassicSession {
    /// Take ownership of a connected stream and start its I/O task
    pub fn spawn<S: TransportStream>(
        stream: S,
        device: DeviceId,
        display_name: Option<String>,
        channel: u8,
        read_timeout: Duration,
    ) -> Self {
        let (request_tx, request_rx) = mpsc::channel(16);
        let (line_tx, line_rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let (notify_tx, _) = broadcast::channel(64);
        let (closed_tx, closed_rx) = watch::channel(None);

        tokio::spawn(io_loop(
            stream,
            device.clone(),
            request_rx,
            line_tx,
            notify_tx.clone(),
            closed_tx,
        ));

        Self {
            device,
            display_name,
            channel,
            read_timeout,
            requests: request_tx,
            lines: Mutex::new(line_rx),
            notifications: notify_tx,
            closed: closed_rx,
        }
    }

    fn check_selector(&self, selector: &Selector) -> LinkResult<()> {
        if self.has_selector(selector) {
            Ok(())
        } else {
            Err(LinkError::SelectorNotFound(*selector))
        }
    }

    /// Drop replies nobody read, such as one that arrived after its read timed out
    async fn discard_queued_lines(&self) {
        let mut lines = self.lines.lock().await;
        let mut stale = 0usize;
        while lines.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("[RFCOMM] Discarded {} stale line(s) from {}", stale, self.device);
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<LinkResult<()>>) -> StreamRequest,
    ) -> LinkResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.requests
            .send(make(ack_tx))
            .await
            .map_err(|_| LinkError::transport("connection closed"))?;
        ack_rx
            .await
            .map_err(|_| LinkError::transport("connection closed"))?
    }
}

#[async_trait]
impl TransportSession for ClassicSession {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    fn display_name(&self) -> Option<String> {
        self.display_name.clone()
    }

    fn has_selector(&self, selector: &Selector) -> bool {
        *selector == Selector::Channel(self.channel)
    }

    async fn read(&self, selector: &Selector) -> LinkResult<Bytes> {
        self.check_selector(selector)?;
        let mut lines = self.lines.lock().await;
        match timeout(self.read_timeout, lines.recv()).await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(LinkError::transport("connection closed")),
            Err(_) => Err(LinkError::transport(format!(
                "no data within {:?}",
                self.read_timeout
            ))),
        }
    }

    async fn write(&self, selector: &Selector, data: &[u8]) -> LinkResult<()> {
        self.check_selector(selector)?;
        self.discard_queued_lines().await;
        let data = Bytes::copy_from_slice(data);
        self.request(|ack| StreamRequest::Write { data, ack }).await
    }

    async fn subscribe(&self, selector: &Selector) -> LinkResult<BoxStream<'static, Bytes>> {
        self.check_selector(selector)?;
        Ok(broadcast_stream(self.notifications.subscribe()))
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        loop {
            let cause = *closed.borrow_and_update();
            match cause {
                Some(CloseCause::Dropped) => return,
                Some(CloseCause::Local) => break,
                None => {}
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
        std::future::pending::<()>().await
    }

    async fn disconnect(&self) -> LinkResult<()> {
        if self.closed.borrow().is_some() {
            return Ok(());
        }
        self.request(|ack| StreamRequest::Shutdown { ack }).await
    }
}

async fn io_loop<S: TransportStream>(
    mut stream: S,
    device: DeviceId,
    mut requests: mpsc::Receiver<StreamRequest>,
    lines: mpsc::Sender<Bytes>,
    notifications: broadcast::Sender<Bytes>,
    closed: watch::Sender<Option<CloseCause>>,
) {
    let mut decoder = LineDecoder::new();
    let mut read_buf = vec![0u8; 1024];

    let cause = loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(StreamRequest::Write { data, ack }) => {
                    let result = async {
                        stream.write_all(&data).await?;
                        stream.flush().await
                    }
                    .await
                    .map_err(LinkError::from);
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break CloseCause::Dropped;
                    }
                }
                Some(StreamRequest::Shutdown { ack }) => {
                    let _ = ack.send(TransportStream::shutdown(&mut stream).await);
                    break CloseCause::Local;
                }
                None => {
                    let _ = TransportStream::shutdown(&mut stream).await;
                    break CloseCause::Local;
                }
            },

            result = stream.read(&mut read_buf) => match result {
                Ok(0) => {
                    warn!("[RFCOMM] {} closed the connection", device);
                    break CloseCause::Dropped;
                }
                Ok(n) => {
                    decoder.extend(&read_buf[..n]);
                    loop {
                        match decoder.next_line() {
                            Ok(Some(line)) => {
                                debug!("[RFCOMM] {} <- {:?}", device, String::from_utf8_lossy(&line));
                                let _ = notifications.send(line.clone());
                                if lines.try_send(line).is_err() {
                                    debug!("[RFCOMM] Read queue full; dropping line from {}", device);
                                }
                            }
                            Ok(None) => break,
                            Err(e) => warn!("[RFCOMM] Discarding input from {}: {}", device, e),
                        }
                    }
                }
                Err(e) => {
                    warn!("[RFCOMM] Read error from {}: {}", device, e);
                    break CloseCause::Dropped;
                }
            },
        }
    };

    debug!("[RFCOMM] I/O task for {} stopped ({:?})", device, cause);
    let _ = closed.send(Some(cause));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpTransportStream;
    use futures::StreamExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (ClassicSession, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let session = ClassicSession::spawn(
            TcpTransportStream::new(client),
            DeviceId::new(addr.to_string()),
            None,
            1,
            Duration::from_millis(500),
        );
        (session, server)
    }

    #[tokio::test]
    async fn test_write_then_read_line() {
        let (session, server) = pair().await;
        let (read_half, mut write_half) = server.into_split();
        let mut peer = tokio::io::BufReader::new(read_half);

        session.write(&Selector::Channel(1), b"R").await.unwrap();
        let mut cmd = [0u8; 1];
        peer.read_exact(&mut cmd).await.unwrap();
        assert_eq!(&cmd, b"R");

        write_half.write_all(b"06500250\n").await.unwrap();
        let line = session.read(&Selector::Channel(1)).await.unwrap();
        assert_eq!(&line[..], b"06500250");
    }

    #[tokio::test]
    async fn test_unknown_channel_rejected() {
        let (session, _server) = pair().await;
        assert_eq!(
            session.read(&Selector::Channel(2)).await,
            Err(LinkError::SelectorNotFound(Selector::Channel(2)))
        );
    }

    #[tokio::test]
    async fn test_read_times_out_without_data() {
        let (session, _server) = pair().await;
        assert!(matches!(
            session.read(&Selector::Channel(1)).await,
            Err(LinkError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_late_reply_does_not_answer_next_read() {
        let (session, server) = pair().await;
        let (read_half, mut write_half) = server.into_split();
        let mut peer = tokio::io::BufReader::new(read_half);
        let selector = Selector::Channel(1);

        session.write(&selector, b"R").await.unwrap();
        let mut cmd = [0u8; 1];
        peer.read_exact(&mut cmd).await.unwrap();
        assert!(matches!(
            session.read(&selector).await,
            Err(LinkError::Transport(_))
        ));

        // Reply to the first request shows up after its read gave up
        write_half.write_all(b"00010001\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.write(&selector, b"R").await.unwrap();
        peer.read_exact(&mut cmd).await.unwrap();
        write_half.write_all(b"00020002\n").await.unwrap();
        let line = session.read(&selector).await.unwrap();
        assert_eq!(&line[..], b"00020002");
    }

    #[tokio::test]
    async fn test_unsolicited_lines_are_not_read_as_replies() {
        let (session, server) = pair().await;
        let (read_half, mut write_half) = server.into_split();
        let mut peer = tokio::io::BufReader::new(read_half);
        let selector = Selector::Channel(1);

        write_half.write_all(b"00110011\n00220022\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.write(&selector, b"R").await.unwrap();
        let mut cmd = [0u8; 1];
        peer.read_exact(&mut cmd).await.unwrap();
        write_half.write_all(b"00330033\n").await.unwrap();
        let line = session.read(&selector).await.unwrap();
        assert_eq!(&line[..], b"00330033");
    }

    #[tokio::test]
    async fn test_subscribe_and_remote_close() {
        let (session, mut server) = pair().await;
        let mut notifications = session.subscribe(&Selector::Channel(1)).await.unwrap();

        server.write_all(b"00100100\n").await.unwrap();
        assert_eq!(&notifications.next().await.unwrap()[..], b"00100100");

        drop(server);
        timeout(Duration::from_secs(1), session.closed())
            .await
            .expect("remote close not detected");
        assert!(session.write(&Selector::Channel(1), b"R").await.is_err());
    }

    #[tokio::test]
    async fn test_local_disconnect_is_not_a_drop() {
        let (session, _server) = pair().await;
        session.disconnect().await.unwrap();
        assert!(timeout(Duration::from_millis(50), session.closed())
            .await
            .is_err());
    }
}
