use crate::device::DeviceChannel;
use crate::messages::{
    Messages, REMOTE_STATUS_IDLE, REMOTE_STATUS_SUCCESS, REMOTE_STATUS_WORKING,
};
use common::StatusPayload;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// One reconciled view of the device's OTA status. Rebuilt wholesale from
/// every poll; nothing carries over between snapshots except `poll_error`
/// bookkeeping when a fetch fails. Progress may legitimately regress
/// between polls (a cancelled-then-restarted transfer starts over).
#[derive(Clone, Debug, Default)]
pub struct OtaStatusSnapshot {
    pub busy: bool,
    pub needs_reboot: bool,
    /// Ready-to-display summary line derived below.
    pub status_line: String,
    pub bytes_written: u64,
    pub bytes_total: u64,
    pub current_version: Option<String>,
    pub latest_version: Option<String>,
    pub latest_error: Option<String>,
    /// Set when the status fetch itself failed; cleared on the next
    /// successful poll.
    pub poll_error: Option<String>,
}

impl OtaStatusSnapshot {
    /// The device's own message wins; an empty one falls back to a
    /// busy/idle summary. A pending reboot always reads as success, and a
    /// recorded error is only surfaced once the device is no longer busy.
    pub fn from_payload(payload: &StatusPayload, messages: &Messages) -> Self {
        let ota = &payload.ota;
        let busy = ota.busy || ota.task_active;

        let mut status_line = ota.message.clone();
        if status_line.is_empty() {
            let key = if busy {
                REMOTE_STATUS_WORKING
            } else {
                REMOTE_STATUS_IDLE
            };
            status_line = messages.translate(key, &[]);
        }
        if ota.needs_reboot {
            status_line = messages.translate(REMOTE_STATUS_SUCCESS, &[]);
        } else if !ota.last_error.is_empty() && !busy {
            status_line = ota.last_error.clone();
        }

        OtaStatusSnapshot {
            busy,
            needs_reboot: ota.needs_reboot,
            status_line,
            bytes_written: ota.bytes_written,
            bytes_total: ota.bytes_total,
            current_version: payload.current_version.clone(),
            latest_version: payload.latest_version.clone(),
            latest_error: payload.latest_error.clone(),
            poll_error: None,
        }
    }

    pub fn progress_ratio(&self) -> Option<f64> {
        if self.bytes_total == 0 {
            return None;
        }
        Some(self.bytes_written as f64 / self.bytes_total as f64)
    }

    pub fn progress_percent(&self) -> Option<u8> {
        self.progress_ratio()
            .map(|ratio| ((ratio * 100.0).round() as u64).min(100) as u8)
    }
}

/// Human-readable byte count for progress displays.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }
    let units = ["B", "KB", "MB", "GB"];
    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < units.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value >= 10.0 || unit == 0 {
        format!("{:.0} {}", value, units[unit])
    } else {
        format!("{:.1} {}", value, units[unit])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Updated,
    /// A fetch was already outstanding, so this trigger did nothing.
    Skipped,
}

/// Perpetual status loop: fetch, reconcile, publish, wait, repeat. The
/// loop pauses entirely while the `active` flag is false and polls again
/// immediately on resume instead of waiting out the interval. Fetch
/// failures never stop the loop; they are recorded on the snapshot and
/// the next cycle runs at the normal interval.
pub struct StatusPoller<C> {
    channel: C,
    messages: Messages,
    interval: Duration,
    active_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<OtaStatusSnapshot>,
    in_flight: AtomicBool,
}

impl<C: DeviceChannel> StatusPoller<C> {
    pub fn new(
        channel: C,
        messages: Messages,
        interval: Duration,
        active_rx: watch::Receiver<bool>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(OtaStatusSnapshot::default());
        StatusPoller {
            channel,
            messages,
            interval,
            active_rx,
            snapshot_tx,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<OtaStatusSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Runs a single poll cycle. If a fetch is already outstanding this
    /// is a no-op; the guard keeps at most one status request in flight
    /// no matter how timers fire.
    pub async fn poll_once(&self) -> PollOutcome {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return PollOutcome::Skipped;
        }

        let snapshot = match self.channel.get_status().await {
            Ok(payload) => OtaStatusSnapshot::from_payload(&payload, &self.messages),
            Err(err) => {
                debug!("status fetch failed: {}", err);
                // Keep the last good view on screen, only mark the error
                let mut snapshot = self.snapshot_tx.borrow().clone();
                snapshot.poll_error = Some(err.to_string());
                snapshot
            }
        };
        self.snapshot_tx.send_replace(snapshot);

        self.in_flight.store(false, Ordering::SeqCst);
        PollOutcome::Updated
    }

    pub async fn run(mut self) {
        loop {
            if !*self.active_rx.borrow() {
                // Paused; wake only on an activity change, then poll
                // right away rather than finishing the old interval
                if self.active_rx.changed().await.is_err() {
                    return;
                }
                continue;
            }

            self.poll_once().await;

            let sleep = tokio::time::sleep(self.interval);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    changed = self.active_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if !*self.active_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
