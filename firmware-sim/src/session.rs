//! One host connection to the emulated controller

use anyhow::Result;
use speedlink_shared::protocol::{CommandDecoder, LINE_DELIMITER};
use speedlink_shared::FirmwareModel;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Answer commands from `peer` until it hangs up
pub async fn serve<S>(mut stream: S, peer: String, firmware: Arc<Mutex<FirmwareModel>>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decoder = CommandDecoder::new();
    let mut buf = vec![0u8; 1024];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            info!("[SIM] {} disconnected", peer);
            return Ok(());
        }
        decoder.extend(&buf[..n]);

        loop {
            match decoder.decode_next() {
                Ok(Some(command)) => {
                    debug!("[SIM] {} -> {:?}", peer, command);
                    let reply = firmware.lock().await.handle(command);
                    if let Some(snapshot) = reply {
                        let mut line = snapshot.encode().to_vec();
                        line.push(LINE_DELIMITER);
                        stream.write_all(&line).await?;
                        stream.flush().await?;
                    }
                }
                Ok(None) => break,
                Err(e) => warn!("[SIM] Ignoring input from {}: {}", peer, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_replies_to_read_with_line() {
        let firmware = Arc::new(Mutex::new(FirmwareModel::new()));
        let (mut host, device) = duplex(256);
        let task = tokio::spawn(serve(device, "test".into(), firmware.clone()));

        host.write_all(b"SP0650GR0250R").await.unwrap();
        let mut reply = [0u8; 9];
        host.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"06500250\n");

        drop(host);
        task.await.unwrap().unwrap();
        assert_eq!(firmware.lock().await.snapshot().speed_tenths, 650);
    }

    #[tokio::test]
    async fn test_garbage_is_skipped() {
        let firmware = Arc::new(Mutex::new(FirmwareModel::new()));
        let (mut host, device) = duplex(256);
        tokio::spawn(serve(device, "test".into(), firmware));

        host.write_all(b"xyz\r\nR").await.unwrap();
        let mut reply = [0u8; 9];
        host.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"00000100\n");
    }
}
