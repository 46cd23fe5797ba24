//! Activity tracking and idle auto-shutdown.
//!
//! For each kernel with a non-zero inactivity timeout the supervisor keeps a
//! single-shot timer set to fire at `last_activity + timeout`. Any of the
//! following re-arm it to the full window: a successful submit, an explicit
//! ping, or a kernel-originated event on the bus, so long-running
//! legitimate computations are not killed mid-flight. A timeout of `0`
//! exempts the kernel entirely; changes take effect
//! immediately and re-arm from the *current* `last_activity`.
//!
//! A busy kernel counts as active even when its computation emits nothing:
//! when the window elapses, the watcher consults a [`BusyProbe`] (backed by
//! the execution tracker) and, if any execution is still open, defers the
//! fire by a further full window instead of reaping. This holds for any
//! timeout value, including windows shorter than the stall-sweep tick.
//!
//! On expiry the supervisor does not destroy anything itself: it reports the
//! kernel to the manager's reaper channel and the manager runs the ordinary
//! destroy path.
//!
//! Each kernel gets a small watcher task driven by a `watch` channel; a
//! touch is one `send_modify`, which wakes the watcher to re-arm. Timer
//! state lives in [`tokio::time::Instant`]s so tests run under virtual time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::types::epoch_ms;

/// Why the reaper is being asked to destroy a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReapCause {
    /// Idle timeout elapsed with no activity.
    Idle,
    /// The worker transport closed unexpectedly after READY.
    TransportClosed,
}

/// Request sent to the manager's reaper task.
#[derive(Debug)]
pub(crate) struct ReapRequest {
    pub kernel_id: String,
    pub cause: ReapCause,
}

/// Asks whether a kernel has at least one open execution. Consulted at
/// expiry time so a busy kernel is never idle-reaped mid-execution.
pub(crate) type BusyProbe = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct IdleState {
    last_activity: Instant,
    /// Wall-clock mirror of `last_activity` for descriptors.
    last_activity_wall_ms: u64,
    /// Zero means exempt from idle shutdown.
    timeout: Duration,
}

struct IdleEntry {
    state_tx: watch::Sender<IdleState>,
    watcher: JoinHandle<()>,
}

/// Tracks last-activity per kernel and schedules idle shutdown.
pub(crate) struct ActivitySupervisor {
    inner: Mutex<HashMap<String, IdleEntry>>,
    reap_tx: mpsc::UnboundedSender<ReapRequest>,
    busy: BusyProbe,
}

impl ActivitySupervisor {
    pub fn new(reap_tx: mpsc::UnboundedSender<ReapRequest>, busy: BusyProbe) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            reap_tx,
            busy,
        }
    }

    /// Starts supervision for a kernel. Replaces (and disarms) any previous
    /// registration under the same id.
    pub fn register(&self, kernel_id: &str, timeout_ms: u64) {
        let state = IdleState {
            last_activity: Instant::now(),
            last_activity_wall_ms: epoch_ms(),
            timeout: Duration::from_millis(timeout_ms),
        };
        let (state_tx, state_rx) = watch::channel(state);
        let watcher = tokio::spawn(watch_idle(
            kernel_id.to_string(),
            state_rx,
            self.reap_tx.clone(),
            Arc::clone(&self.busy),
        ));
        let mut inner = self.inner.lock().expect("activity mutex poisoned");
        if let Some(previous) = inner.insert(kernel_id.to_string(), IdleEntry { state_tx, watcher })
        {
            previous.watcher.abort();
        }
    }

    /// Refreshes `last_activity` to now, re-arming the idle timer to the
    /// full window. Returns `false` for unknown kernels.
    pub fn touch(&self, kernel_id: &str) -> bool {
        let inner = self.inner.lock().expect("activity mutex poisoned");
        let Some(entry) = inner.get(kernel_id) else {
            return false;
        };
        entry.state_tx.send_modify(|state| {
            state.last_activity = Instant::now();
            state.last_activity_wall_ms = epoch_ms();
        });
        true
    }

    /// Changes the idle timeout. `0` cancels the timer and exempts the
    /// kernel; a non-zero value re-arms from the current `last_activity`.
    pub fn set_timeout(&self, kernel_id: &str, timeout_ms: u64) -> bool {
        let inner = self.inner.lock().expect("activity mutex poisoned");
        let Some(entry) = inner.get(kernel_id) else {
            return false;
        };
        entry.state_tx.send_modify(|state| {
            state.timeout = Duration::from_millis(timeout_ms);
        });
        true
    }

    /// Wall-clock `last_activity` for descriptors.
    pub fn last_activity_ms(&self, kernel_id: &str) -> Option<u64> {
        let inner = self.inner.lock().expect("activity mutex poisoned");
        inner
            .get(kernel_id)
            .map(|entry| entry.state_tx.borrow().last_activity_wall_ms)
    }

    /// Time remaining until idle shutdown; `None` when the kernel is
    /// unknown or exempt.
    pub fn time_until_shutdown(&self, kernel_id: &str) -> Option<Duration> {
        let inner = self.inner.lock().expect("activity mutex poisoned");
        let entry = inner.get(kernel_id)?;
        let state = *entry.state_tx.borrow();
        if state.timeout.is_zero() {
            return None;
        }
        let deadline = state.last_activity + state.timeout;
        Some(deadline.saturating_duration_since(Instant::now()))
    }

    /// Stops supervision and disarms the timer.
    pub fn remove(&self, kernel_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("activity mutex poisoned");
        match inner.remove(kernel_id) {
            Some(entry) => {
                entry.watcher.abort();
                true
            }
            None => false,
        }
    }
}

async fn watch_idle(
    kernel_id: String,
    mut state_rx: watch::Receiver<IdleState>,
    reap_tx: mpsc::UnboundedSender<ReapRequest>,
    busy: BusyProbe,
) {
    // Set when the window elapsed mid-execution; holds the fire off for a
    // full window from that moment.
    let mut busy_hold: Option<Instant> = None;
    loop {
        let state = *state_rx.borrow_and_update();
        if state.timeout.is_zero() {
            busy_hold = None;
            // Exempt until the timeout changes.
            if state_rx.changed().await.is_err() {
                return;
            }
            continue;
        }
        let mut deadline = state.last_activity + state.timeout;
        if let Some(hold) = busy_hold {
            deadline = deadline.max(hold);
        }
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                let current = *state_rx.borrow();
                if current.timeout.is_zero()
                    || Instant::now() < current.last_activity + current.timeout
                {
                    // Re-armed concurrently; take another lap.
                    continue;
                }
                if (*busy)(&kernel_id) {
                    busy_hold = Some(Instant::now() + current.timeout);
                    continue;
                }
                tracing::info!(
                    kernel_id = %kernel_id,
                    timeout_ms = current.timeout.as_millis() as u64,
                    "idle timeout elapsed; requesting shutdown"
                );
                let _ = reap_tx.send(ReapRequest {
                    kernel_id,
                    cause: ReapCause::Idle,
                });
                return;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}
