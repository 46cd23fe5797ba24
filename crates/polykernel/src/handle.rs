//! Uniform control surface over one launched kernel.
//!
//! ## Design
//!
//! Each kernel gets two small tasks:
//!
//! 1. The **actor** owns the execute queue. It processes one submission at a
//!    time (allocate the execution id, open the tracker record, send
//!    `EXECUTE`, await the terminal resolution), so submissions from any
//!    number of callers complete in submission order.
//! 2. The **pump** owns the reply stream. Every inbound event is published
//!    on the bus and refreshes the activity clock; terminal events close the
//!    tracker record and resolve the pending execution.
//!
//! Interrupt and dispose bypass the execute queue entirely: they go through
//! the [`InterruptController`] and a direct request-sender clone, so a
//! queued backlog can never delay them.
//!
//! A reply stream that ends without a `DISPOSE` means the worker died.
//! The pump then synthesises an `execute_error` for every in-flight
//! execution (so waiting `execute` calls resolve rather than hang) and
//! reports the kernel to the manager's reaper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivitySupervisor, ReapCause, ReapRequest};
use crate::error::ManagerError;
use crate::events::{ErrorInfo, EventBus, ExecuteOutcome, KernelEvent};
use crate::interrupt::InterruptController;
use crate::launcher::LaunchedKernel;
use crate::tracker::ExecutionTracker;
use crate::transport::{WorkerReply, WorkerRequest};
use crate::types::IdGen;

/// Bounded capacity of the per-kernel execute queue.
const EXEC_QUEUE_BUFFER: usize = 64;

/// Shared collaborators a handle needs from the manager.
#[derive(Clone)]
pub(crate) struct HandleDeps {
    pub bus: Arc<EventBus>,
    pub tracker: Arc<ExecutionTracker>,
    pub activity: Arc<ActivitySupervisor>,
    pub reap_tx: mpsc::UnboundedSender<ReapRequest>,
}

struct ExecItem {
    code: String,
    outcome_tx: oneshot::Sender<Result<ExecuteOutcome, ManagerError>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ExecuteOutcome>>>>;

pub(crate) struct KernelHandle {
    kernel_id: String,
    exec_tx: mpsc::Sender<ExecItem>,
    requests: mpsc::Sender<WorkerRequest>,
    interrupt: InterruptController,
    pending: PendingMap,
    cancel: CancellationToken,
}

impl KernelHandle {
    /// Wires up actor and pump for an already-`READY` kernel.
    pub fn start(
        kernel_id: String,
        launched: LaunchedKernel,
        max_execution_time_ms: u64,
        deps: HandleDeps,
    ) -> Arc<Self> {
        let LaunchedKernel {
            transport,
            interrupt_region,
        } = launched;
        let (request_tx, reply_rx) = transport.split();
        let (exec_tx, exec_rx) = mpsc::channel(EXEC_QUEUE_BUFFER);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(actor_loop(
            kernel_id.clone(),
            exec_rx,
            request_tx.clone(),
            Arc::clone(&pending),
            Arc::clone(&deps.tracker),
            max_execution_time_ms,
            cancel.clone(),
        ));
        tokio::spawn(pump_loop(
            kernel_id.clone(),
            reply_rx,
            Arc::clone(&pending),
            deps.clone(),
            cancel.clone(),
        ));

        Arc::new(Self {
            kernel_id: kernel_id.clone(),
            exec_tx,
            requests: request_tx.clone(),
            interrupt: InterruptController::new(interrupt_region, request_tx),
            pending,
            cancel,
        })
    }

    /// Submits `code` and awaits its terminal event.
    pub async fn execute(&self, code: String) -> Result<ExecuteOutcome, ManagerError> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let item = ExecItem { code, outcome_tx };
        if self.exec_tx.send(item).await.is_err() {
            return Err(ManagerError::KernelDead {
                id: self.kernel_id.clone(),
            });
        }
        match outcome_rx.await {
            Ok(result) => result,
            Err(_) => Err(ManagerError::KernelDead {
                id: self.kernel_id.clone(),
            }),
        }
    }

    /// Best-effort cooperative interrupt; `true` once delivered.
    pub async fn interrupt(&self) -> bool {
        self.interrupt.signal().await
    }

    /// Resolves one pending execution from outside the pump (used by
    /// force-termination to unblock waiting `execute` calls).
    pub fn resolve_execution(&self, execution_id: u64, outcome: ExecuteOutcome) -> bool {
        resolve(&self.pending, execution_id, outcome)
    }

    /// Tears the handle down: stops actor and pump, posts `DISPOSE` to the
    /// worker, and drops every pending resolution so waiting `execute`
    /// calls resolve with `KernelDead`.
    pub fn dispose(&self) {
        self.cancel.cancel();
        let _ = self.requests.try_send(WorkerRequest::Dispose);
        self.pending
            .lock()
            .expect("pending-execution mutex poisoned")
            .clear();
    }
}

fn resolve(pending: &PendingMap, execution_id: u64, outcome: ExecuteOutcome) -> bool {
    let entry = pending
        .lock()
        .expect("pending-execution mutex poisoned")
        .remove(&execution_id);
    match entry {
        Some(tx) => tx.send(outcome).is_ok(),
        None => false,
    }
}

async fn actor_loop(
    kernel_id: String,
    mut exec_rx: mpsc::Receiver<ExecItem>,
    request_tx: mpsc::Sender<WorkerRequest>,
    pending: PendingMap,
    tracker: Arc<ExecutionTracker>,
    max_execution_time_ms: u64,
    cancel: CancellationToken,
) {
    let execution_ids = IdGen::new();
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = exec_rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
        };
        let execution_id = execution_ids.next();
        let (terminal_tx, terminal_rx) = oneshot::channel();
        pending
            .lock()
            .expect("pending-execution mutex poisoned")
            .insert(execution_id, terminal_tx);
        tracker.submit(&kernel_id, execution_id, max_execution_time_ms);

        let sent = request_tx
            .send(WorkerRequest::Execute {
                code: item.code,
                execution_id,
            })
            .await
            .is_ok();
        if !sent {
            pending
                .lock()
                .expect("pending-execution mutex poisoned")
                .remove(&execution_id);
            tracker.close(&kernel_id, execution_id);
            let _ = item.outcome_tx.send(Err(ManagerError::KernelDead {
                id: kernel_id.clone(),
            }));
            continue;
        }

        // Serialise: the next submission is not dispatched until this one
        // reaches a terminal resolution.
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = terminal_rx => result,
        };
        let outcome = match result {
            Ok(outcome) => Ok(outcome),
            Err(_) => Err(ManagerError::KernelDead {
                id: kernel_id.clone(),
            }),
        };
        let _ = item.outcome_tx.send(outcome);
    }
}

async fn pump_loop(
    kernel_id: String,
    mut reply_rx: mpsc::Receiver<WorkerReply>,
    pending: PendingMap,
    deps: HandleDeps,
    cancel: CancellationToken,
) {
    loop {
        let reply = tokio::select! {
            _ = cancel.cancelled() => return,
            reply = reply_rx.recv() => reply,
        };
        match reply {
            // Handshake repeats are tolerated and ignored.
            Some(WorkerReply::Ready) => {}
            Some(WorkerReply::Event {
                execution_id,
                event,
            }) => {
                deps.bus.emit(&kernel_id, &event);
                deps.activity.touch(&kernel_id);
                match &event {
                    KernelEvent::ExecuteResult { .. } => {
                        deps.tracker.close(&kernel_id, execution_id);
                        resolve(&pending, execution_id, ExecuteOutcome::ok());
                    }
                    KernelEvent::ExecuteError {
                        ename,
                        evalue,
                        traceback,
                    } => {
                        deps.tracker.close(&kernel_id, execution_id);
                        resolve(
                            &pending,
                            execution_id,
                            ExecuteOutcome::failed(ErrorInfo {
                                ename: ename.clone(),
                                evalue: evalue.clone(),
                                traceback: traceback.clone(),
                            }),
                        );
                    }
                    _ => {}
                }
            }
            None => {
                // Worker died without a DISPOSE from our side.
                tracing::warn!(
                    kernel_id = %kernel_id,
                    "worker transport closed; failing in-flight executions"
                );
                let stranded: Vec<(u64, oneshot::Sender<ExecuteOutcome>)> = pending
                    .lock()
                    .expect("pending-execution mutex poisoned")
                    .drain()
                    .collect();
                for (execution_id, terminal_tx) in stranded {
                    let info = ErrorInfo {
                        ename: "KernelDead".to_string(),
                        evalue: "worker transport closed".to_string(),
                        traceback: Vec::new(),
                    };
                    deps.bus.emit(
                        &kernel_id,
                        &KernelEvent::ExecuteError {
                            ename: info.ename.clone(),
                            evalue: info.evalue.clone(),
                            traceback: info.traceback.clone(),
                        },
                    );
                    deps.tracker.close(&kernel_id, execution_id);
                    let _ = terminal_tx.send(ExecuteOutcome::failed(info));
                }
                let _ = deps.reap_tx.send(ReapRequest {
                    kernel_id: kernel_id.clone(),
                    cause: ReapCause::TransportClosed,
                });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, StreamName};
    use crate::launcher::{wait_ready, KernelLauncher, LaunchSpec, LoopbackLauncher, READY_TIMEOUT};
    use crate::transport::duplex;
    use crate::types::{KernelLanguage, KernelMode};
    use std::time::Duration;
    use tokio::time;

    struct TestHarness {
        handle: Arc<KernelHandle>,
        bus: Arc<EventBus>,
        tracker: Arc<ExecutionTracker>,
        #[allow(dead_code)]
        activity: Arc<ActivitySupervisor>,
        #[allow(dead_code)]
        reap_rx: mpsc::UnboundedReceiver<ReapRequest>,
    }

    async fn start_loopback_handle(max_execution_time_ms: u64) -> TestHarness {
        let launcher = LoopbackLauncher::new();
        let spec = LaunchSpec {
            mode: KernelMode::Worker,
            language: KernelLanguage::Python,
            mount: None,
        };
        let mut launched = launcher.launch(&spec).await.expect("loopback launch");
        wait_ready(&mut launched.transport, READY_TIMEOUT)
            .await
            .expect("loopback READY");

        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(ExecutionTracker::new());
        let busy: crate::activity::BusyProbe = {
            let tracker = Arc::clone(&tracker);
            Arc::new(move |kernel_id: &str| tracker.info(kernel_id).count > 0)
        };
        let activity = Arc::new(ActivitySupervisor::new(reap_tx.clone(), busy));
        activity.register("k1", 0);
        let handle = KernelHandle::start(
            "k1".to_string(),
            launched,
            max_execution_time_ms,
            HandleDeps {
                bus: Arc::clone(&bus),
                tracker: Arc::clone(&tracker),
                activity: Arc::clone(&activity),
                reap_tx,
            },
        );
        TestHarness {
            handle,
            bus,
            tracker,
            activity,
            reap_rx,
        }
    }

    #[tokio::test]
    async fn test_execute_resolves_with_success_outcome() {
        let harness = start_loopback_handle(0).await;
        let outcome = harness
            .handle
            .execute("print:hi\nresult:2".to_string())
            .await
            .expect("execute resolves");
        assert!(outcome.success);
        assert!(outcome.error.is_none());
        assert_eq!(harness.tracker.info("k1").count, 0, "record closed on terminal");
    }

    #[tokio::test]
    async fn test_execute_resolves_with_error_outcome() {
        let harness = start_loopback_handle(0).await;
        let outcome = harness
            .handle
            .execute("error:ValueError:bad input".to_string())
            .await
            .expect("execute resolves");
        assert!(!outcome.success);
        let error = outcome.error.expect("failed outcome carries an error");
        assert_eq!(error.ename, "ValueError");
        assert_eq!(error.evalue, "bad input");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_submits_complete_in_submission_order() {
        let harness = start_loopback_handle(0).await;
        let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let order_in = Arc::clone(&order);
        harness.bus.on("k1", EventKind::ExecuteResult, move |event| {
            if let KernelEvent::ExecuteResult { data, .. } = event {
                if let Some(serde_json::Value::String(text)) = data.get("text/plain") {
                    order_in.lock().expect("order mutex").push(text.clone());
                }
            }
        });

        let first = harness.handle.execute("sleep:50\nresult:first".to_string());
        let second = harness.handle.execute("result:second".to_string());
        let (first, second) = tokio::join!(first, second);
        assert!(first.expect("first resolves").success);
        assert!(second.expect("second resolves").success);
        assert_eq!(
            *order.lock().expect("order mutex"),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn test_events_are_published_on_the_bus() {
        let harness = start_loopback_handle(0).await;
        let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let chunks_in = Arc::clone(&chunks);
        harness.bus.on("k1", EventKind::Stream, move |event| {
            if let KernelEvent::Stream {
                name: StreamName::Stdout,
                text,
            } = event
            {
                chunks_in.lock().expect("chunks mutex").push(text.clone());
            }
        });
        harness
            .handle
            .execute("print:a\nprint:b".to_string())
            .await
            .expect("execute resolves");
        assert_eq!(
            *chunks.lock().expect("chunks mutex"),
            vec!["a\n".to_string(), "b\n".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_fails_inflight_execute_with_kernel_dead() {
        let harness = start_loopback_handle(0).await;
        let handle = Arc::clone(&harness.handle);
        let inflight = tokio::spawn(async move { handle.execute("sleep:60000".to_string()).await });
        time::sleep(Duration::from_millis(30)).await;
        harness.handle.dispose();
        let result = inflight.await.expect("task joins");
        assert!(
            matches!(result, Err(ManagerError::KernelDead { .. })),
            "got: {result:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_unblocks_long_execution() {
        let harness = start_loopback_handle(0).await;
        let handle = Arc::clone(&harness.handle);
        let inflight = tokio::spawn(async move { handle.execute("spin".to_string()).await });
        time::sleep(Duration::from_millis(30)).await;
        assert!(harness.handle.interrupt().await);
        let outcome = inflight
            .await
            .expect("task joins")
            .expect("execute resolves");
        assert!(!outcome.success);
        assert_eq!(
            outcome.error.expect("interrupt outcome").ename,
            "Interrupted"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_resolution_unblocks_execute() {
        let harness = start_loopback_handle(0).await;
        let handle = Arc::clone(&harness.handle);
        let inflight = tokio::spawn(async move { handle.execute("sleep:60000".to_string()).await });
        time::sleep(Duration::from_millis(30)).await;
        let resolved = harness.handle.resolve_execution(
            1,
            ExecuteOutcome::failed(ErrorInfo {
                ename: "ForcedTermination".to_string(),
                evalue: "operator request".to_string(),
                traceback: Vec::new(),
            }),
        );
        assert!(resolved);
        let outcome = inflight
            .await
            .expect("task joins")
            .expect("execute resolves");
        assert_eq!(
            outcome.error.expect("forced outcome").ename,
            "ForcedTermination"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_death_synthesises_error_and_requests_reap() {
        struct DyingLauncher;

        #[async_trait::async_trait]
        impl KernelLauncher for DyingLauncher {
            async fn launch(
                &self,
                _spec: &LaunchSpec,
            ) -> Result<crate::launcher::LaunchedKernel, crate::launcher::LaunchError> {
                let (transport, mut endpoint) = duplex();
                tokio::spawn(async move {
                    endpoint.ready().await;
                    // Die as soon as the first execute arrives.
                    let _ = endpoint.next_request().await;
                });
                Ok(crate::launcher::LaunchedKernel {
                    transport,
                    interrupt_region: None,
                })
            }
        }

        let spec = LaunchSpec {
            mode: KernelMode::Worker,
            language: KernelLanguage::Python,
            mount: None,
        };
        let mut launched = DyingLauncher.launch(&spec).await.expect("launch");
        wait_ready(&mut launched.transport, READY_TIMEOUT)
            .await
            .expect("READY");

        let (reap_tx, mut reap_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(ExecutionTracker::new());
        let busy: crate::activity::BusyProbe = {
            let tracker = Arc::clone(&tracker);
            Arc::new(move |kernel_id: &str| tracker.info(kernel_id).count > 0)
        };
        let activity = Arc::new(ActivitySupervisor::new(reap_tx.clone(), busy));
        activity.register("k1", 0);
        let handle = KernelHandle::start(
            "k1".to_string(),
            launched,
            0,
            HandleDeps {
                bus: Arc::clone(&bus),
                tracker: Arc::clone(&tracker),
                activity,
                reap_tx,
            },
        );

        let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let errors_in = Arc::clone(&errors);
        bus.on("k1", EventKind::ExecuteError, move |event| {
            if let KernelEvent::ExecuteError { ename, .. } = event {
                errors_in.lock().expect("errors mutex").push(ename.clone());
            }
        });

        let outcome = handle
            .execute("spin".to_string())
            .await
            .expect("execute resolves via synthesised error");
        assert!(!outcome.success);
        assert_eq!(outcome.error.expect("synthesised error").ename, "KernelDead");
        assert_eq!(*errors.lock().expect("errors mutex"), vec!["KernelDead"]);

        let reap = reap_rx.recv().await.expect("reap request");
        assert_eq!(reap.kernel_id, "k1");
        assert_eq!(reap.cause, ReapCause::TransportClosed);
        assert_eq!(tracker.info("k1").count, 0);
    }
}
