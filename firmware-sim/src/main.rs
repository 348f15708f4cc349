//! Stand-alone vehicle controller emulator
//!
//! Serves the telemetry protocol over TCP (and optionally RFCOMM) so the
//! dashboard can be developed without hardware. All connections share one
//! firmware state.

mod session;

use anyhow::Result;
use bluer::rfcomm::{Listener, SocketAddr as RfcommAddr};
use bluer::Address;
use speedlink_shared::FirmwareModel;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:9000";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let firmware = Arc::new(Mutex::new(FirmwareModel::new()));

    if let Ok(channel) = std::env::var("FIRMWARE_SIM_RFCOMM_CHANNEL") {
        let channel: u8 = channel.trim().parse()?;
        let firmware = firmware.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_rfcomm(channel, firmware).await {
                error!("[SIM] RFCOMM listener failed: {}", e);
            }
        });
    }

    let addr = std::env::var("FIRMWARE_SIM_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.into());
    let listener = TcpListener::bind(&addr).await?;
    info!("[SIM] Firmware simulator listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("[SIM] Connection from {}", peer);
        let firmware = firmware.clone();
        tokio::spawn(async move {
            if let Err(e) = session::serve(socket, peer.to_string(), firmware).await {
                warn!("[SIM] Session {} ended: {}", peer, e);
            }
        });
    }
}

async fn serve_rfcomm(channel: u8, firmware: Arc<Mutex<FirmwareModel>>) -> Result<()> {
    let listener = Listener::bind(RfcommAddr::new(Address::any(), channel)).await?;
    info!("[SIM] RFCOMM listening on channel {}", channel);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("[SIM] RFCOMM connection from {}", peer.addr);
        let firmware = firmware.clone();
        tokio::spawn(async move {
            if let Err(e) = session::serve(stream, peer.addr.to_string(), firmware).await {
                warn!("[SIM] RFCOMM session {} ended: {}", peer.addr, e);
            }
        });
    }
}
