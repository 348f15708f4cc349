//! Scan task: deduplicates discovery results and enforces the scan window

use crate::connection::manager::{Inner, LinkEvent};
use futures::stream::{self, BoxStream, StreamExt};
use speedlink_shared::{DeviceId, DiscoveredDevice};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Manager-side handle on a running scan
pub(crate) struct ScanControl {
    generation: u64,
    /// Deadline of the open window; `None` once the task has closed it
    window: Arc<watch::Sender<Option<Instant>>>,
    stop: watch::Sender<bool>,
    found: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
}

/// State moved into the scan task
pub(crate) struct ScanTask {
    generation: u64,
    window: Arc<watch::Sender<Option<Instant>>>,
    stop: watch::Receiver<bool>,
    found: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
}

impl ScanControl {
    pub(crate) fn new(generation: u64, deadline: Instant) -> (Self, ScanTask) {
        let (window, _) = watch::channel(Some(deadline));
        let window = Arc::new(window);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (found, _) = watch::channel(Vec::new());
        let found = Arc::new(found);

        let task = ScanTask {
            generation,
            window: window.clone(),
            stop: stop_rx,
            found: found.clone(),
        };
        let control = Self {
            generation,
            window,
            stop: stop_tx,
            found,
        };
        (control, task)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Move the deadline of a scan whose window is still open
    ///
    /// Returns `false` when the task has already closed the window.
    pub(crate) fn restart(&self, deadline: Instant) -> bool {
        self.window.send_if_modified(|window| match window {
            Some(current) => {
                *current = deadline;
                true
            }
            None => false,
        })
    }

    pub(crate) fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Devices found so far, then every new one until the scan ends
    pub(crate) fn stream(&self) -> BoxStream<'static, DiscoveredDevice> {
        found_stream(self.found.subscribe())
    }
}

impl ScanTask {
    /// Close the window if its deadline has passed by `now`
    fn close_if_expired(&self, now: Instant) -> bool {
        self.window.send_if_modified(|window| {
            if matches!(*window, Some(deadline) if deadline <= now) {
                *window = None;
                true
            } else {
                false
            }
        })
    }

    fn close(&self) {
        self.window.send_replace(None);
    }
}

/// Walk the found list by index so a slow reader never misses a device
fn found_stream(
    rx: watch::Receiver<Vec<DiscoveredDevice>>,
) -> BoxStream<'static, DiscoveredDevice> {
    stream::unfold((rx, 0usize), |(mut rx, next)| async move {
        loop {
            let device = rx.borrow_and_update().get(next).cloned();
            if let Some(device) = device {
                return Some((device, (rx, next + 1)));
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .boxed()
}

pub(crate) async fn run_scan(
    inner: Arc<Inner>,
    mut discovery: BoxStream<'static, DiscoveredDevice>,
    mut task: ScanTask,
) {
    let mut seen: HashSet<DeviceId> = HashSet::new();
    let mut window = task.window.subscribe();
    let started = Instant::now();

    loop {
        let Some(deadline) = *window.borrow_and_update() else {
            break;
        };
        tokio::select! {
            _ = sleep_until(deadline) => {
                if task.close_if_expired(Instant::now()) {
                    debug!("[SCAN] Window closed after {:?}", started.elapsed());
                    break;
                }
            }
            _ = window.changed() => {}
            _ = task.stop.changed() => break,
            next = discovery.next() => match next {
                Some(device) => {
                    if !seen.insert(device.id.clone()) {
                        continue;
                    }
                    debug!("[SCAN] Found {} ({:?} dBm)", device.label(), device.rssi);
                    task.found.send_modify(|found| found.push(device.clone()));
                    inner.emit(LinkEvent::DeviceDiscovered(device));
                }
                None => {
                    debug!("[SCAN] Backend discovery ended");
                    break;
                }
            },
        }
    }
    task.close();

    drop(discovery);
    if let Err(e) = inner.backend.stop_scan().await {
        warn!("[SCAN] Failed to stop discovery: {}", e);
    }
    inner.finish_scan(task.generation).await;
    debug!("[SCAN] {} device(s) found", seen.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn device(id: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            id: DeviceId::new(id),
            display_name: None,
            rssi: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_refused_once_window_closed() {
        let now = Instant::now();
        let (control, task) = ScanControl::new(1, now + Duration::from_secs(10));

        assert!(control.restart(now + Duration::from_secs(20)));
        assert!(!task.close_if_expired(now + Duration::from_secs(15)));
        assert!(task.close_if_expired(now + Duration::from_secs(25)));
        assert!(!control.restart(now + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_keeps_up_with_late_reader() {
        let (control, task) = ScanControl::new(1, Instant::now());
        let early = control.stream();
        for i in 0..200 {
            task.found
                .send_modify(|found| found.push(device(&format!("dev-{i}"))));
        }
        let late = control.stream();
        drop(control);
        drop(task);

        let early: Vec<_> = early.collect().await;
        let late: Vec<_> = late.collect().await;
        assert_eq!(early.len(), 200);
        assert_eq!(early, late);
        assert_eq!(early[199].id, DeviceId::new("dev-199"));
    }
}
