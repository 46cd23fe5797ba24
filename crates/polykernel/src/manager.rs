//! The kernel manager: lifecycle orchestration over every other component.
//!
//! This module is the public surface of the library. A [`KernelManager`]
//! owns the admission policy, the optional hot pool, the event bus, the
//! execution tracker, the activity supervisor, and the table of live
//! kernels; every kernel and its subsidiary resources (worker, timers,
//! subscriptions, interrupt region) are owned exclusively by the manager
//! and released on the destroy path in a fixed order: stop timers →
//! release listeners → dispose transport → drop the handle.
//!
//! ## Create flow
//!
//! `create` filters the request through admission first: a forbidden
//! (mode, language) pair fails before any resource is acquired or id
//! reserved. Canonical-shape requests are served from the pool when a
//! warmed kernel is available; everything else is built on demand and
//! `READY`-awaited before the id becomes visible.
//!
//! ## Suspension discipline
//!
//! Every public operation is async, but the internal maps are only locked
//! while not yielded: ids are *reserved* in the table before a build
//! suspends, so concurrent creates under the same id fail fast with
//! `DuplicateId` and an execute racing a restart observes `KernelDead`
//! rather than binding to the old instance.
//!
//! ## Reaper
//!
//! Idle expiry (activity supervisor) and unexpected worker death (event
//! pump) both funnel into one reaper task, which runs the ordinary destroy
//! path so the teardown order is identical no matter who initiated it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::activity::{ActivitySupervisor, BusyProbe, ReapRequest};
use crate::error::ManagerError;
use crate::events::{
    ErrorInfo, EventBus, EventKind, ExecuteOutcome, KernelEvent, ListenerId,
};
use crate::handle::{HandleDeps, KernelHandle};
use crate::launcher::{wait_ready, KernelLauncher, LaunchSpec, LaunchedKernel, READY_TIMEOUT};
use crate::policy::AdmissionPolicy;
use crate::pool::{KernelPool, PoolTupleStats};
use crate::tracker::ExecutionTracker;
use crate::types::{
    epoch_ms, ExecutionInfo, KernelDescriptor, KernelOptions, KernelSource, KernelTypeSpec,
    ManagerConfig,
};

/// Poll cadence while `interrupt_and_wait` watches for quiescence.
const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

struct KernelEntry {
    handle: Arc<KernelHandle>,
    /// Configuration snapshot, kept for restart.
    options: KernelOptions,
    namespace: Option<String>,
    created_ms: u64,
    source: KernelSource,
}

#[derive(Default)]
struct KernelTable {
    entries: HashMap<String, KernelEntry>,
    /// Ids claimed by an in-flight create or restart. A reserved id fails
    /// duplicate creates and marks the restart window for racing executes.
    reserved: HashSet<String>,
}

struct ManagerInner {
    policy: AdmissionPolicy,
    launcher: Arc<dyn KernelLauncher>,
    bus: Arc<EventBus>,
    tracker: Arc<ExecutionTracker>,
    activity: Arc<ActivitySupervisor>,
    pool: Option<Arc<KernelPool>>,
    kernels: Mutex<KernelTable>,
    reap_tx: mpsc::UnboundedSender<ReapRequest>,
    cancel: CancellationToken,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Multi-tenant code-execution kernel manager.
pub struct KernelManager {
    inner: Arc<ManagerInner>,
}

impl KernelManager {
    /// Builds a manager and starts its background services (stall sweep,
    /// reaper, pool warming). Must be called within a tokio runtime.
    pub fn new(config: ManagerConfig, launcher: Arc<dyn KernelLauncher>) -> Self {
        let policy = AdmissionPolicy::new(config.allowed_kernel_types.clone());
        let bus = Arc::new(EventBus::new());
        let tracker = Arc::new(ExecutionTracker::new());
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();
        // A kernel with an open execution record counts as active: the idle
        // watcher consults this probe at expiry instead of reaping.
        let busy_probe: BusyProbe = {
            let tracker = Arc::clone(&tracker);
            Arc::new(move |kernel_id: &str| tracker.info(kernel_id).count > 0)
        };
        let activity = Arc::new(ActivitySupervisor::new(reap_tx.clone(), busy_probe));
        let cancel = CancellationToken::new();
        let pool = config
            .pool
            .enabled
            .then(|| KernelPool::new(Arc::clone(&launcher), &config.pool, &policy));

        let inner = Arc::new(ManagerInner {
            policy,
            launcher,
            bus: Arc::clone(&bus),
            tracker: Arc::clone(&tracker),
            activity,
            pool,
            kernels: Mutex::new(KernelTable::default()),
            reap_tx,
            cancel: cancel.clone(),
        });

        tracker.spawn_sweeper(bus, cancel.child_token());
        tokio::spawn(reap_loop(
            Arc::downgrade(&inner),
            reap_rx,
            cancel.child_token(),
        ));

        Self { inner }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Creates a kernel and returns its final (namespace-prefixed) id once
    /// the kernel is `READY`.
    pub async fn create(&self, opts: KernelOptions) -> Result<String, ManagerError> {
        if !self.inner.policy.is_allowed(opts.mode, opts.language) {
            return Err(ManagerError::PolicyViolation {
                mode: opts.mode,
                language: opts.language,
            });
        }

        let local_id = opts
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let final_id = match &opts.namespace {
            Some(namespace) => format!("{namespace}:{local_id}"),
            None => local_id,
        };

        self.inner.reserve_id(&final_id)?;
        match self.inner.build_kernel(&opts, true).await {
            Ok((launched, source)) => {
                self.inner.install(&final_id, opts, launched, source);
                tracing::info!(kernel_id = %final_id, source = ?source, "kernel created");
                Ok(final_id)
            }
            Err(error) => {
                self.inner.release_reservation(&final_id);
                Err(error)
            }
        }
    }

    /// Destroys a kernel: timers cancelled, listeners released, transport
    /// disposed, in-flight executes resolved with `KernelDead`.
    pub async fn destroy(&self, id: &str) -> Result<(), ManagerError> {
        let entry = self
            .inner
            .remove_entry(id)
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })?;
        tracing::info!(kernel_id = %id, "destroying kernel");
        self.inner.teardown(id, entry);
        Ok(())
    }

    /// Destroys every kernel, or every kernel in `namespace`. Returns the
    /// number destroyed.
    pub async fn destroy_all(&self, namespace: Option<&str>) -> usize {
        let ids: Vec<String> = {
            let table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
            table
                .entries
                .iter()
                .filter(|(_, entry)| match namespace {
                    Some(namespace) => entry.namespace.as_deref() == Some(namespace),
                    None => true,
                })
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut destroyed = 0;
        for id in ids {
            if self.destroy(&id).await.is_ok() {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Rebuilds a kernel under the same id with an identical configuration
    /// snapshot. On build failure the old instance is already gone and no
    /// kernel remains under the id (the one non-idempotent failure mode).
    pub async fn restart(&self, id: &str) -> Result<(), ManagerError> {
        // Reserve the id in the same critical section that removes the old
        // entry: a racing execute must observe the restart window
        // (`KernelDead`), never an id absent from both sets.
        let (options, entry) = {
            let mut table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
            let Some(entry) = table.entries.remove(id) else {
                return Err(ManagerError::NotFound { id: id.to_string() });
            };
            table.reserved.insert(id.to_string());
            (entry.options.clone(), entry)
        };
        tracing::info!(kernel_id = %id, "destroying kernel for restart");
        self.inner.teardown(id, entry);

        // Always a fresh build: restart must preserve the snapshot exactly,
        // so it never consults the pool.
        match self.inner.build_kernel(&options, false).await {
            Ok((launched, _)) => {
                self.inner
                    .install(id, options, launched, KernelSource::OnDemand);
                tracing::info!(kernel_id = %id, "kernel restarted");
                Ok(())
            }
            Err(error) => {
                self.inner.release_reservation(id);
                tracing::error!(kernel_id = %id, error = %error, "restart failed; kernel is gone");
                Err(error)
            }
        }
    }

    // ── Execution ────────────────────────────────────────────────────────────

    /// Submits `code` and resolves once the terminal event for this
    /// submission has been observed. Submissions to one kernel complete in
    /// submission order.
    pub async fn execute(&self, id: &str, code: &str) -> Result<ExecuteOutcome, ManagerError> {
        let handle = {
            let table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
            match table.entries.get(id) {
                Some(entry) => Arc::clone(&entry.handle),
                None if table.reserved.contains(id) => {
                    // Racing a restart; never bind to the old instance.
                    return Err(ManagerError::KernelDead { id: id.to_string() });
                }
                None => return Err(ManagerError::NotFound { id: id.to_string() }),
            }
        };
        self.inner.activity.touch(id);
        handle.execute(code.to_string()).await
    }

    /// Best-effort cooperative interrupt: resolves once delivered, not once
    /// honoured. Interrupting an idle kernel is a success no-op; interrupt
    /// never destroys the kernel.
    pub async fn interrupt(&self, id: &str) -> Result<(), ManagerError> {
        let handle = self.inner.handle_of(id)?;
        handle.interrupt().await;
        Ok(())
    }

    /// Delivers an interrupt, then waits up to `grace` for every open
    /// execution on the kernel to drain. Returns `true` if the kernel
    /// quiesced; `false` leaves escalation (`force_terminate`) to the
    /// caller.
    pub async fn interrupt_and_wait(
        &self,
        id: &str,
        grace: Duration,
    ) -> Result<bool, ManagerError> {
        let handle = self.inner.handle_of(id)?;
        handle.interrupt().await;
        let deadline = Instant::now() + grace;
        loop {
            if self.inner.tracker.info(id).count == 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            time::sleep(INTERRUPT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Unconditional teardown. Synthesises a `ForcedTermination`
    /// `execute_error` for each in-flight execution before the transport is
    /// disposed, guaranteeing that waiting `execute` calls resolve.
    pub async fn force_terminate(&self, id: &str, reason: &str) -> Result<(), ManagerError> {
        let entry = self
            .inner
            .remove_entry(id)
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })?;
        tracing::warn!(kernel_id = %id, reason, "force-terminating kernel");
        for execution_id in self.inner.tracker.open_executions(id) {
            let info = ErrorInfo {
                ename: "ForcedTermination".to_string(),
                evalue: reason.to_string(),
                traceback: Vec::new(),
            };
            self.inner.bus.emit(
                id,
                &KernelEvent::ExecuteError {
                    ename: info.ename.clone(),
                    evalue: info.evalue.clone(),
                    traceback: info.traceback.clone(),
                },
            );
            entry
                .handle
                .resolve_execution(execution_id, ExecuteOutcome::failed(info));
        }
        self.inner.teardown(id, entry);
        Ok(())
    }

    // ── Activity ─────────────────────────────────────────────────────────────

    /// Asserts the kernel is still needed: refreshes `last_activity` and
    /// re-arms the idle timer. Returns `false` (not an error) for unknown
    /// kernels.
    pub async fn ping(&self, id: &str) -> bool {
        self.inner.activity.touch(id)
    }

    /// Changes the inactivity timeout; `0` cancels the timer and exempts
    /// the kernel. Takes effect immediately, re-arming from the current
    /// `last_activity`. Returns `false` for unknown kernels.
    pub async fn set_inactivity_timeout(&self, id: &str, timeout_ms: u64) -> bool {
        let known = {
            let mut table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
            match table.entries.get_mut(id) {
                Some(entry) => {
                    entry.options.inactivity_timeout_ms = timeout_ms;
                    true
                }
                None => false,
            }
        };
        known && self.inner.activity.set_timeout(id, timeout_ms)
    }

    /// Time left before idle shutdown; `None` when unknown or exempt.
    pub fn time_until_shutdown(&self, id: &str) -> Option<Duration> {
        self.inner.activity.time_until_shutdown(id)
    }

    // ── Introspection ────────────────────────────────────────────────────────

    /// Snapshot of kernel descriptors, optionally filtered to one
    /// namespace, sorted by id.
    pub fn list(&self, namespace: Option<&str>) -> Vec<KernelDescriptor> {
        let table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
        let mut descriptors: Vec<KernelDescriptor> = table
            .entries
            .iter()
            .filter(|(_, entry)| match namespace {
                Some(namespace) => entry.namespace.as_deref() == Some(namespace),
                None => true,
            })
            .map(|(id, entry)| KernelDescriptor {
                id: id.clone(),
                namespace: entry.namespace.clone(),
                mode: entry.options.mode,
                language: entry.options.language,
                created: entry.created_ms,
                is_from_pool: entry.source == KernelSource::Pool,
                last_activity: self
                    .inner
                    .activity
                    .last_activity_ms(id)
                    .unwrap_or(entry.created_ms),
            })
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// Execution-tracker query for one kernel; `None` for unknown ids.
    pub fn execution_info(&self, id: &str) -> Option<ExecutionInfo> {
        let known = {
            let table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
            table.entries.contains_key(id)
        };
        known.then(|| self.inner.tracker.info(id))
    }

    /// Per-tuple pool stats; empty when the pool is disabled.
    pub fn pool_stats(&self) -> HashMap<String, PoolTupleStats> {
        self.inner
            .pool
            .as_ref()
            .map(|pool| pool.stats())
            .unwrap_or_default()
    }

    /// Defensive copy of the admission set.
    pub fn allowed_kernel_types(&self) -> Vec<KernelTypeSpec> {
        self.inner.policy.list()
    }

    // ── Subscriptions ────────────────────────────────────────────────────────

    /// Subscribes to `kind` events of kernel `id`. `None` for unknown ids.
    pub fn on<F>(&self, id: &str, kind: EventKind, listener: F) -> Option<ListenerId>
    where
        F: Fn(&KernelEvent) + Send + Sync + 'static,
    {
        let known = {
            let table = self.inner.kernels.lock().expect("kernel table mutex poisoned");
            table.entries.contains_key(id)
        };
        known.then(|| self.inner.bus.on(id, kind, listener))
    }

    /// Removes a subscription by token. Returns `false` when no such
    /// registration exists.
    pub fn off(&self, id: &str, kind: EventKind, listener: ListenerId) -> bool {
        self.inner.bus.off(id, kind, listener)
    }

    // ── Shutdown ─────────────────────────────────────────────────────────────

    /// Destroys every kernel, drains the pool, and stops background
    /// services.
    pub async fn shutdown(&self) {
        self.destroy_all(None).await;
        if let Some(pool) = &self.inner.pool {
            pool.shutdown();
        }
        self.inner.cancel.cancel();
    }
}

impl ManagerInner {
    fn reserve_id(&self, id: &str) -> Result<(), ManagerError> {
        let mut table = self.kernels.lock().expect("kernel table mutex poisoned");
        if table.entries.contains_key(id) || !table.reserved.insert(id.to_string()) {
            return Err(ManagerError::DuplicateId { id: id.to_string() });
        }
        Ok(())
    }

    fn release_reservation(&self, id: &str) {
        let mut table = self.kernels.lock().expect("kernel table mutex poisoned");
        table.reserved.remove(id);
    }

    fn remove_entry(&self, id: &str) -> Option<KernelEntry> {
        let mut table = self.kernels.lock().expect("kernel table mutex poisoned");
        table.entries.remove(id)
    }

    fn handle_of(&self, id: &str) -> Result<Arc<KernelHandle>, ManagerError> {
        let table = self.kernels.lock().expect("kernel table mutex poisoned");
        table
            .entries
            .get(id)
            .map(|entry| Arc::clone(&entry.handle))
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })
    }

    /// Pool-or-fresh construction. The returned kernel is `READY`.
    async fn build_kernel(
        &self,
        opts: &KernelOptions,
        allow_pool: bool,
    ) -> Result<(LaunchedKernel, KernelSource), ManagerError> {
        if allow_pool && opts.is_pool_canonical() {
            if let Some(pool) = &self.pool {
                if let Some(launched) = pool.acquire(opts.mode, opts.language) {
                    return Ok((launched, KernelSource::Pool));
                }
            }
        }
        let spec = LaunchSpec {
            mode: opts.mode,
            language: opts.language,
            mount: opts.mount.clone(),
        };
        let mut launched = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|error| ManagerError::BuildFailed {
                reason: error.to_string(),
            })?;
        wait_ready(&mut launched.transport, READY_TIMEOUT)
            .await
            .map_err(|error| ManagerError::BuildFailed {
                reason: error.to_string(),
            })?;
        Ok((launched, KernelSource::OnDemand))
    }

    /// Registers a built kernel under `id` and clears the reservation.
    fn install(
        &self,
        id: &str,
        options: KernelOptions,
        launched: LaunchedKernel,
        source: KernelSource,
    ) {
        self.activity.register(id, options.inactivity_timeout_ms);
        let handle = KernelHandle::start(
            id.to_string(),
            launched,
            options.max_execution_time_ms,
            HandleDeps {
                bus: Arc::clone(&self.bus),
                tracker: Arc::clone(&self.tracker),
                activity: Arc::clone(&self.activity),
                reap_tx: self.reap_tx.clone(),
            },
        );
        let namespace = options.namespace.clone();
        let entry = KernelEntry {
            handle,
            options,
            namespace,
            created_ms: epoch_ms(),
            source,
        };
        let mut table = self.kernels.lock().expect("kernel table mutex poisoned");
        table.reserved.remove(id);
        table.entries.insert(id.to_string(), entry);
    }

    /// Resource release in the fixed order: timers → listeners → records →
    /// transport → handle.
    fn teardown(&self, id: &str, entry: KernelEntry) {
        self.activity.remove(id);
        self.bus.drop_kernel(id);
        self.tracker.remove_kernel(id);
        entry.handle.dispose();
        drop(entry);
    }
}

async fn reap_loop(
    inner: Weak<ManagerInner>,
    mut reap_rx: mpsc::UnboundedReceiver<ReapRequest>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return,
            request = reap_rx.recv() => match request {
                Some(request) => request,
                None => return,
            },
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Some(entry) = inner.remove_entry(&request.kernel_id) {
            tracing::info!(
                kernel_id = %request.kernel_id,
                cause = ?request.cause,
                "reaping kernel"
            );
            inner.teardown(&request.kernel_id, entry);
        }
    }
}
