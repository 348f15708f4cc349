//! Connection manager: adapter observation, discovery and the single device link

use crate::connection::scan::{run_scan, ScanControl};
use crate::error::{LinkError, LinkResult};
use crate::transport::traits::{BluetoothBackend, TransportKind, TransportSession};
use crate::transport::watch_stream;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use futures::Future;
use speedlink_shared::dashboard::SCAN_TIMEOUT_MS;
use speedlink_shared::{
    AdapterState, ConnectionState, DeviceId, DiscoveredDevice, LinkStateMachine, LinkTrigger,
    Selector, TransitionResult,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Events emitted by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Platform adapter changed state
    AdapterChanged(AdapterState),
    /// Discovery began (not re-emitted on restart)
    ScanStarted,
    /// First sighting of a device during the current scan
    DeviceDiscovered(DiscoveredDevice),
    /// Discovery ended by timeout, `stop_scan` or adapter loss
    ScanStopped,
    Connected(ConnectedDevice),
    ConnectionFailed { device: DeviceId, reason: String },
    /// Emitted exactly once per established connection
    Disconnected {
        device: DeviceId,
        reason: DisconnectReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called
    Requested,
    /// Adapter left PoweredOn
    AdapterUnavailable,
    /// Device went away without a local disconnect
    TransportDropped,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "requested"),
            DisconnectReason::AdapterUnavailable => write!(f, "adapter unavailable"),
            DisconnectReason::TransportDropped => write!(f, "transport dropped"),
        }
    }
}

/// The device the manager is connected to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub id: DeviceId,
    pub display_name: Option<String>,
    pub transport: TransportKind,
}

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Window after which a scan stops on its own
    pub timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(SCAN_TIMEOUT_MS),
        }
    }
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub scan: ScanConfig,
    /// Capacity of the `LinkEvent` broadcast channel
    pub event_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            event_capacity: 128,
        }
    }
}

pub(crate) struct ActiveLink {
    generation: u64,
    device: ConnectedDevice,
    session: Arc<dyn TransportSession>,
    cancel: Arc<watch::Sender<bool>>,
}

pub(crate) struct Inner {
    pub(crate) backend: Arc<dyn BluetoothBackend>,
    config: LinkConfig,
    fsm: Mutex<LinkStateMachine>,
    adapter: watch::Sender<AdapterState>,
    link: Mutex<Option<ActiveLink>>,
    scan: Mutex<Option<ScanControl>>,
    /// FIFO turn for read/write/subscribe setup
    request_lock: Mutex<()>,
    connect_lock: Mutex<()>,
    events: broadcast::Sender<LinkEvent>,
    generation: AtomicU64,
}

/// Owns the Bluetooth link to the vehicle controller
///
/// Construct one per application and share it by `Arc`. Every request runs
/// under a fair lock, so reads and writes reach the device in call order.
pub struct ConnectionManager {
    inner: Arc<Inner>,
    adapter_task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a manager on top of `backend` and start observing the adapter
    pub async fn new(backend: Arc<dyn BluetoothBackend>, config: LinkConfig) -> LinkResult<Self> {
        let initial = backend.adapter_state().await;
        let adapter_events = backend.adapter_events().await?;
        let (adapter, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(config.event_capacity);

        info!(
            "[LINK] Connection manager on {} backend, adapter {}",
            backend.kind(),
            initial
        );

        let inner = Arc::new(Inner {
            backend,
            config,
            fsm: Mutex::new(LinkStateMachine::with_adapter(initial)),
            adapter,
            link: Mutex::new(None),
            scan: Mutex::new(None),
            request_lock: Mutex::new(()),
            connect_lock: Mutex::new(()),
            events,
            generation: AtomicU64::new(0),
        });

        let watcher = inner.clone();
        let adapter_task = tokio::spawn(async move {
            watch_adapter(watcher, adapter_events).await;
        });

        Ok(Self {
            inner,
            adapter_task,
        })
    }

    /// Adapter state now, then every change
    pub fn observe_adapter_state(&self) -> BoxStream<'static, AdapterState> {
        watch_stream(self.inner.adapter.subscribe())
    }

    /// Request Bluetooth permission and check the adapter is usable
    ///
    /// Never powers the adapter on; when it is off the user is told how to
    /// turn it on and `false` is returned.
    pub async fn enable_adapter(&self) -> bool {
        match self.ensure_adapter_ready().await {
            Ok(()) => true,
            Err(LinkError::AdapterNotReady(state)) => {
                warn!(
                    "[LINK] Bluetooth adapter is {}; turn it on in system settings or with `bluetoothctl power on`",
                    state
                );
                false
            }
            Err(e) => {
                warn!("[LINK] {}", e);
                false
            }
        }
    }

    pub async fn ensure_adapter_ready(&self) -> LinkResult<()> {
        if !self.inner.backend.request_permission().await {
            return Err(LinkError::PermissionDenied);
        }
        match self.adapter_state() {
            AdapterState::Unauthorized => Err(LinkError::PermissionDenied),
            state if !state.is_ready() => Err(LinkError::AdapterNotReady(state)),
            _ => Ok(()),
        }
    }

    /// Scan with the configured window
    pub async fn start_scan(&self) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
        self.start_scan_for(self.inner.config.scan.timeout).await
    }

    /// Scan for `window`, or restart the window of the running scan
    ///
    /// Each returned stream yields a device id at most once. A stream opened
    /// on restart first replays what the running scan has already found.
    pub async fn start_scan_for(
        &self,
        window: Duration,
    ) -> LinkResult<BoxStream<'static, DiscoveredDevice>> {
        self.inner.ensure_powered()?;
        let deadline = Instant::now() + window;

        let mut scan = self.inner.scan.lock().await;
        if let Some(control) = scan.as_ref() {
            if control.restart(deadline) {
                info!("[SCAN] Restarted, window reset to {:?}", window);
                return Ok(control.stream());
            }
        }
        // A scan whose window already closed is finished here, not restarted
        if scan.take().is_some() {
            self.inner.fsm.lock().await.process(LinkTrigger::ScanStopped);
            info!("[SCAN] Finished");
            self.inner.emit(LinkEvent::ScanStopped);
        }

        let devices = self.inner.backend.start_scan().await?;
        let generation = self.inner.next_generation();
        let (control, task) = ScanControl::new(generation, deadline);
        let stream = control.stream();
        *scan = Some(control);
        self.inner.fsm.lock().await.process(LinkTrigger::ScanStarted);
        drop(scan);

        info!("[SCAN] Started, window {:?}", window);
        self.inner.emit(LinkEvent::ScanStarted);
        tokio::spawn(run_scan(self.inner.clone(), devices, task));
        Ok(stream)
    }

    /// End the active scan; no-op when idle
    pub async fn stop_scan(&self) {
        self.inner.stop_scan().await;
    }

    /// Connect to `id` and resolve its topology
    ///
    /// Connecting to the device that is already connected returns the existing
    /// connection without opening a new session.
    pub async fn connect(&self, id: &DeviceId) -> LinkResult<ConnectedDevice> {
        let _turn = self.inner.connect_lock.lock().await;
        self.inner.ensure_powered()?;

        if let Some(link) = self.inner.link.lock().await.as_ref() {
            if &link.device.id == id {
                debug!("[LINK] Already connected to {}", id);
                return Ok(link.device.clone());
            }
            return Err(LinkError::AlreadyConnected {
                connected: link.device.id.clone(),
                requested: id.clone(),
            });
        }

        let result = self.inner.fsm.lock().await.process(LinkTrigger::ConnectRequested);
        if !matches!(result, TransitionResult::Success(_)) {
            return Err(LinkError::AdapterNotReady(self.adapter_state()));
        }

        info!("[LINK] Connecting to {}", id);
        let session: Arc<dyn TransportSession> = match self.inner.backend.connect(id).await {
            Ok(session) => Arc::from(session),
            Err(e) => {
                self.inner.fsm.lock().await.process(LinkTrigger::ConnectFailed);
                warn!("[LINK] Connection to {} failed: {}", id, e);
                self.inner.emit(LinkEvent::ConnectionFailed {
                    device: id.clone(),
                    reason: e.to_string(),
                });
                return Err(match e {
                    LinkError::Connection { .. }
                    | LinkError::AdapterNotReady(_)
                    | LinkError::PermissionDenied => e,
                    other => LinkError::connection(id, other),
                });
            }
        };

        let mut link = self.inner.link.lock().await;
        let mut fsm = self.inner.fsm.lock().await;
        if !matches!(fsm.process(LinkTrigger::ConnectSucceeded), TransitionResult::Success(_)) {
            // Adapter went away while the session was being set up
            let adapter = fsm.adapter();
            drop(fsm);
            drop(link);
            if let Err(e) = session.disconnect().await {
                debug!("[LINK] Discarding session to {}: {}", id, e);
            }
            let error = if adapter.is_ready() {
                LinkError::connection(id, "adapter reset while connecting")
            } else {
                LinkError::AdapterNotReady(adapter)
            };
            self.inner.emit(LinkEvent::ConnectionFailed {
                device: id.clone(),
                reason: error.to_string(),
            });
            return Err(error);
        }
        drop(fsm);

        let device = ConnectedDevice {
            id: id.clone(),
            display_name: session.display_name(),
            transport: self.inner.backend.kind(),
        };
        let generation = self.inner.next_generation();
        let (cancel, cancelled_rx) = watch::channel(false);
        *link = Some(ActiveLink {
            generation,
            device: device.clone(),
            session: session.clone(),
            cancel: Arc::new(cancel),
        });
        drop(link);

        tokio::spawn(watch_link(self.inner.clone(), generation, session, cancelled_rx));

        info!(
            "[LINK] Connected to {} ({})",
            device.display_name.as_deref().unwrap_or(id.as_str()),
            device.transport
        );
        self.inner.emit(LinkEvent::Connected(device.clone()));
        Ok(device)
    }

    /// Tear down the connection; errors are logged, never returned
    pub async fn disconnect(&self) {
        match self.inner.detach_link(None).await {
            Some(link) => {
                self.inner
                    .teardown(link, DisconnectReason::Requested)
                    .await
            }
            None => debug!("[LINK] Disconnect requested with no connection"),
        }
    }

    pub async fn read(&self, selector: &Selector) -> LinkResult<Bytes> {
        let selector = *selector;
        self.inner
            .request(&selector, move |session, _| async move {
                session.read(&selector).await
            })
            .await
    }

    /// Write and wait for the transport acknowledgement
    pub async fn write(&self, selector: &Selector, data: &[u8]) -> LinkResult<()> {
        let selector = *selector;
        let data = Bytes::copy_from_slice(data);
        self.inner
            .request(&selector, move |session, _| async move {
                session.write(&selector, &data).await
            })
            .await
    }

    /// Notification payloads until the device disconnects or the stream is dropped
    pub async fn subscribe(&self, selector: &Selector) -> LinkResult<BoxStream<'static, Bytes>> {
        let selector = *selector;
        self.inner
            .request(&selector, move |session, cancel| async move {
                let notifications = session.subscribe(&selector).await?;
                Ok(notifications.take_until(cancelled(cancel)).boxed())
            })
            .await
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.fsm.lock().await.state()
    }

    pub fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.borrow()
    }

    pub async fn connected_device(&self) -> Option<ConnectedDevice> {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.device.clone())
    }

    pub async fn is_scanning(&self) -> bool {
        self.inner.scan.lock().await.is_some()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.backend.kind()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.adapter_task.abort();
        if let Ok(link) = self.inner.link.try_lock() {
            if let Some(link) = link.as_ref() {
                link.cancel.send_replace(true);
            }
        }
    }
}

impl Inner {
    pub(crate) fn emit(&self, event: LinkEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_powered(&self) -> LinkResult<()> {
        let state = *self.adapter.borrow();
        if state.is_ready() {
            Ok(())
        } else {
            Err(LinkError::AdapterNotReady(state))
        }
    }

    async fn request<T, F, Fut>(&self, selector: &Selector, op: F) -> LinkResult<T>
    where
        F: FnOnce(Arc<dyn TransportSession>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = LinkResult<T>>,
    {
        if self.link.lock().await.is_none() {
            return Err(LinkError::NotConnected);
        }

        let _turn = self.request_lock.lock().await;
        let (session, cancel) = match self.link.lock().await.as_ref() {
            Some(link) => (link.session.clone(), link.cancel.subscribe()),
            None => return Err(LinkError::NotConnected),
        };
        if !session.has_selector(selector) {
            return Err(LinkError::SelectorNotFound(*selector));
        }

        tokio::select! {
            biased;
            _ = cancelled(cancel.clone()) => Err(LinkError::NotConnected),
            result = op(session, cancel) => result,
        }
    }

    /// Take the link and move the state machine back to idle
    ///
    /// With a generation, only that connection is taken.
    async fn detach_link(&self, generation: Option<u64>) -> Option<ActiveLink> {
        let mut link = self.link.lock().await;
        if let Some(generation) = generation {
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                return None;
            }
        }
        let taken = link.take()?;
        self.fsm.lock().await.process(LinkTrigger::Disconnected);
        Some(taken)
    }

    async fn teardown(&self, link: ActiveLink, reason: DisconnectReason) {
        link.cancel.send_replace(true);
        info!("[LINK] Disconnected from {} ({})", link.device.id, reason);
        self.emit(LinkEvent::Disconnected {
            device: link.device.id.clone(),
            reason,
        });

        if reason != DisconnectReason::TransportDropped {
            if let Err(e) = link.session.disconnect().await {
                warn!("[LINK] Error closing session to {}: {}", link.device.id, e);
            }
        }
    }

    pub(crate) async fn stop_scan(&self) {
        let Some(control) = self.scan.lock().await.take() else {
            debug!("[SCAN] Stop requested with no active scan");
            return;
        };
        control.stop();
        self.fsm.lock().await.process(LinkTrigger::ScanStopped);
        info!("[SCAN] Stopped");
        self.emit(LinkEvent::ScanStopped);
    }

    /// Clear the scan started as `generation` once its task has ended
    pub(crate) async fn finish_scan(&self, generation: u64) {
        let mut scan = self.scan.lock().await;
        if scan.as_ref().map(|c| c.generation()) != Some(generation) {
            return;
        }
        *scan = None;
        self.fsm.lock().await.process(LinkTrigger::ScanStopped);
        drop(scan);
        info!("[SCAN] Finished");
        self.emit(LinkEvent::ScanStopped);
    }

    async fn apply_adapter_state(&self, state: AdapterState) {
        let previous = self.adapter.send_replace(state);
        if previous == state {
            return;
        }
        info!("[LINK] Adapter {} -> {}", previous, state);
        self.emit(LinkEvent::AdapterChanged(state));

        let mut link = self.link.lock().await;
        let result = self.fsm.lock().await.process(LinkTrigger::AdapterChanged(state));
        match result {
            TransitionResult::AdapterLost { .. } => {
                let dropped = link.take();
                drop(link);
                self.stop_scan().await;
                if let Some(active) = dropped {
                    self.teardown(active, DisconnectReason::AdapterUnavailable)
                        .await;
                }
            }
            TransitionResult::AdapterRestored => {
                info!("[LINK] Adapter available again; reconnect is up to the caller");
            }
            _ => {}
        }
    }
}

async fn watch_adapter(inner: Arc<Inner>, mut states: BoxStream<'static, AdapterState>) {
    while let Some(state) = states.next().await {
        inner.apply_adapter_state(state).await;
    }
    debug!("[LINK] Adapter event stream ended");
}

/// Watch one connection for an unexpected transport drop
async fn watch_link(
    inner: Arc<Inner>,
    generation: u64,
    session: Arc<dyn TransportSession>,
    cancel: watch::Receiver<bool>,
) {
    tokio::select! {
        _ = cancelled(cancel) => return,
        _ = session.closed() => {}
    }

    warn!("[LINK] Lost connection to {}", session.device());
    if let Some(link) = inner.detach_link(Some(generation)).await {
        inner
            .teardown(link, DisconnectReason::TransportDropped)
            .await;
    }
}

/// Resolves once the link is cancelled or its sender is gone
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
