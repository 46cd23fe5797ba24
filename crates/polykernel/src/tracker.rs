//! Execution tracking and stall detection.
//!
//! The tracker records every in-flight execution per kernel, keyed by
//! execution id (an arena; records hold no back-pointer to their kernel).
//! On submit a record is inserted with its deadline (`submission +
//! max_execution_time`, when enabled); on terminal event the record is
//! removed. A single background sweep runs every [`SWEEP_INTERVAL`] and
//! marks records whose deadline has passed as stalled, emitting
//! `execution_stalled` on the event bus exactly once per record.
//!
//! Stalling does **not** terminate the kernel; the manager's
//! `force_terminate` policy decides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, KernelEvent};
use crate::types::ExecutionInfo;

/// Fixed tick of the background stall sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    Running,
    /// Deadline exceeded and `execution_stalled` already emitted.
    /// Completed and cancelled executions are represented by record removal.
    Stalled,
}

#[derive(Debug, Clone, Copy)]
struct ExecutionRecord {
    started: Instant,
    deadline: Option<Instant>,
    status: RecordStatus,
}

/// Map of kernel id → open execution records, plus the sweep.
#[derive(Default)]
pub struct ExecutionTracker {
    inner: Mutex<HashMap<String, HashMap<u64, ExecutionRecord>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a record for a freshly submitted execution.
    /// `max_execution_time_ms == 0` disables the deadline.
    pub fn submit(&self, kernel_id: &str, execution_id: u64, max_execution_time_ms: u64) {
        let now = Instant::now();
        let deadline = (max_execution_time_ms > 0)
            .then(|| now + Duration::from_millis(max_execution_time_ms));
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        inner.entry(kernel_id.to_string()).or_default().insert(
            execution_id,
            ExecutionRecord {
                started: now,
                deadline,
                status: RecordStatus::Running,
            },
        );
    }

    /// Closes a record on its terminal event. Returns `false` when the
    /// record was already gone (e.g. closed by force-termination).
    pub fn close(&self, kernel_id: &str, execution_id: u64) -> bool {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        let Some(records) = inner.get_mut(kernel_id) else {
            return false;
        };
        let removed = records.remove(&execution_id).is_some();
        if records.is_empty() {
            inner.remove(kernel_id);
        }
        removed
    }

    /// Ids of all open executions on `kernel_id`, ascending.
    pub fn open_executions(&self, kernel_id: &str) -> Vec<u64> {
        let inner = self.inner.lock().expect("tracker mutex poisoned");
        let mut ids: Vec<u64> = inner
            .get(kernel_id)
            .map(|records| records.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Drops every record for `kernel_id` (kernel destruction). Returns the
    /// number of records dropped.
    pub fn remove_kernel(&self, kernel_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        inner.remove(kernel_id).map(|records| records.len()).unwrap_or(0)
    }

    /// Query surface: open-record count, stuck flag, and the age of the
    /// oldest open record.
    pub fn info(&self, kernel_id: &str) -> ExecutionInfo {
        let now = Instant::now();
        let inner = self.inner.lock().expect("tracker mutex poisoned");
        let Some(records) = inner.get(kernel_id) else {
            return ExecutionInfo {
                count: 0,
                is_stuck: false,
                longest_running_ms: 0,
            };
        };
        let mut is_stuck = false;
        let mut longest = Duration::ZERO;
        for record in records.values() {
            if record.status == RecordStatus::Stalled
                || record.deadline.is_some_and(|deadline| now >= deadline)
            {
                is_stuck = true;
            }
            longest = longest.max(now.saturating_duration_since(record.started));
        }
        ExecutionInfo {
            count: records.len(),
            is_stuck,
            longest_running_ms: longest.as_millis() as u64,
        }
    }

    /// Marks every running record past its deadline as stalled. Returns the
    /// newly stalled `(kernel_id, execution_id, elapsed_ms)` triples.
    fn collect_newly_stalled(&self) -> Vec<(String, u64, u64)> {
        let now = Instant::now();
        let mut stalled = Vec::new();
        let mut inner = self.inner.lock().expect("tracker mutex poisoned");
        for (kernel_id, records) in inner.iter_mut() {
            for (execution_id, record) in records.iter_mut() {
                if record.status == RecordStatus::Running
                    && record.deadline.is_some_and(|deadline| now >= deadline)
                {
                    record.status = RecordStatus::Stalled;
                    let elapsed_ms =
                        now.saturating_duration_since(record.started).as_millis() as u64;
                    stalled.push((kernel_id.clone(), *execution_id, elapsed_ms));
                }
            }
        }
        stalled
    }

    /// Spawns the background sweep. Emission happens outside the tracker
    /// lock so listeners may query the tracker freely.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        for (kernel_id, execution_id, elapsed_ms) in
                            tracker.collect_newly_stalled()
                        {
                            tracing::warn!(
                                kernel_id = %kernel_id,
                                execution_id,
                                elapsed_ms,
                                "execution exceeded its deadline"
                            );
                            bus.emit(
                                &kernel_id,
                                &KernelEvent::ExecutionStalled {
                                    kernel_id: kernel_id.clone(),
                                    execution_id,
                                    elapsed_ms,
                                },
                            );
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_submit_and_close_round_trip() {
        let tracker = ExecutionTracker::new();
        tracker.submit("k1", 1, 0);
        tracker.submit("k1", 2, 0);
        assert_eq!(tracker.info("k1").count, 2);
        assert_eq!(tracker.open_executions("k1"), vec![1, 2]);
        assert!(tracker.close("k1", 1));
        assert!(!tracker.close("k1", 1), "double close is a no-op");
        assert_eq!(tracker.info("k1").count, 1);
    }

    #[tokio::test]
    async fn test_info_on_unknown_kernel_is_empty() {
        let tracker = ExecutionTracker::new();
        let info = tracker.info("ghost");
        assert_eq!(info.count, 0);
        assert!(!info.is_stuck);
        assert_eq!(info.longest_running_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_stuck_after_deadline_passes() {
        let tracker = ExecutionTracker::new();
        tracker.submit("k1", 1, 100);
        assert!(!tracker.info("k1").is_stuck);
        time::sleep(Duration::from_millis(150)).await;
        let info = tracker.info("k1");
        assert!(info.is_stuck);
        assert!(info.longest_running_ms >= 150);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_without_deadline_never_stalls() {
        let tracker = ExecutionTracker::new();
        tracker.submit("k1", 1, 0);
        time::sleep(Duration::from_secs(60)).await;
        assert!(!tracker.info("k1").is_stuck);
        assert!(tracker.collect_newly_stalled().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_emits_execution_stalled_exactly_once() {
        let tracker = Arc::new(ExecutionTracker::new());
        let bus = Arc::new(EventBus::new());
        let cancel = CancellationToken::new();
        let sweeper = tracker.spawn_sweeper(Arc::clone(&bus), cancel.clone());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        bus.on("k1", EventKind::ExecutionStalled, move |event| {
            if let KernelEvent::ExecutionStalled {
                execution_id,
                elapsed_ms,
                ..
            } = event
            {
                assert_eq!(*execution_id, 1);
                assert!(*elapsed_ms >= 200);
                hits_in.fetch_add(1, Ordering::SeqCst);
            }
        });

        tracker.submit("k1", 1, 200);
        // Deadline passes inside the first sweep tick; several further ticks
        // must not re-emit.
        time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cancel.cancel();
        let _ = sweeper.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_kernel_drops_all_records() {
        let tracker = ExecutionTracker::new();
        tracker.submit("k1", 1, 100);
        tracker.submit("k1", 2, 100);
        assert_eq!(tracker.remove_kernel("k1"), 2);
        assert_eq!(tracker.info("k1").count, 0);
        assert_eq!(tracker.remove_kernel("k1"), 0);
    }
}
