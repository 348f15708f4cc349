use anyhow::{bail, Result};
use futures::StreamExt;
use speedlink_dash::{
    ConnectionManager, DashConfig, LinkEvent, TelemetryClient, TelemetryPoller,
};
use speedlink_shared::{AdapterState, DiscoveredDevice};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = DashConfig::from_env()?;
    info!("SpeedLink dashboard starting");
    info!("  Mode: {:?}", config.bluetooth.mode);
    info!("  Poll interval: {:?}", config.poll_interval);

    let backend = config.bluetooth.build_backend().await?;
    let manager = Arc::new(ConnectionManager::new(backend, config.link.clone()).await?);
    info!("  Transport: {}", manager.transport_kind());

    let events = manager.subscribe_events();
    tokio::spawn(async move {
        log_events(events).await;
    });

    if !manager.enable_adapter().await {
        info!("[BT] Waiting for the Bluetooth adapter (Ctrl+C to quit)");
        tokio::select! {
            _ = wait_for_adapter(&manager) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
        manager.ensure_adapter_ready().await?;
    }

    let device = tokio::select! {
        device = find_device(&manager, &config) => device?,
        _ = tokio::signal::ctrl_c() => return Ok(()),
    };
    manager.connect(&device.id).await?;

    let client = Arc::new(TelemetryClient::new(
        manager.clone(),
        config.bluetooth.telemetry_selector(),
    ));
    if let Some(kmh) = config.initial_speed_kmh {
        client.set_speed(kmh).await?;
        info!("[BT] Speed set to {:.1} km/h", kmh);
    }
    if let Some(ratio) = config.initial_gear_ratio {
        client.set_gear_ratio(ratio).await?;
        info!("[BT] Gear ratio set to {}", ratio);
    }

    let poller = TelemetryPoller::spawn(client, config.poll_interval);
    let mut updates = poller.subscribe();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(reading) = *updates.borrow_and_update() {
                    let [speed_raw, gear_raw] = reading.snapshot.raw_fields();
                    info!(
                        "[POLL] Speed {:.1} km/h | Gear ratio {} | Raw {} {}",
                        reading.snapshot.speed_kmh(),
                        reading.snapshot.gear_ratio,
                        speed_raw,
                        gear_raw
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    drop(poller);
    manager.disconnect().await;
    Ok(())
}

async fn wait_for_adapter(manager: &ConnectionManager) {
    let mut states = manager.observe_adapter_state();
    while let Some(state) = states.next().await {
        if state == AdapterState::PoweredOn {
            return;
        }
    }
}

/// Scan until the configured device (or the first match) shows up
async fn find_device(manager: &ConnectionManager, config: &DashConfig) -> Result<DiscoveredDevice> {
    let mut scan = manager.start_scan().await?;
    let mut found = None;

    while let Some(device) = scan.next().await {
        info!(
            "[SCAN] {} [{}] rssi {:?}",
            device.label(),
            device.id,
            device.rssi
        );
        let wanted = match &config.target_device {
            Some(target) => &device.id == target,
            None => true,
        };
        if wanted {
            found = Some(device);
            break;
        }
    }
    manager.stop_scan().await;

    match found {
        Some(device) => Ok(device),
        None => bail!("No matching device found within {:?}", config.link.scan.timeout),
    }
}

async fn log_events(mut events: broadcast::Receiver<LinkEvent>) {
    loop {
        match events.recv().await {
            Ok(LinkEvent::AdapterChanged(state)) => info!("[BT] Adapter {}", state),
            Ok(LinkEvent::Connected(device)) => info!(
                "[BT] Connected: {} over {}",
                device.display_name.as_deref().unwrap_or(device.id.as_str()),
                device.transport
            ),
            Ok(LinkEvent::ConnectionFailed { device, reason }) => {
                error!("[BT] Connection to {} failed: {}", device, reason)
            }
            Ok(LinkEvent::Disconnected { device, reason }) => {
                warn!("[BT] Disconnected from {} ({})", device, reason)
            }
            Ok(event) => debug!("[BT] {:?}", event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("[BT] Event log skipped {} event(s)", n)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
