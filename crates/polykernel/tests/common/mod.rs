//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use polykernel::{
    EventKind, KernelEvent, KernelLauncher, KernelManager, KernelOptions, LaunchError, LaunchSpec,
    LaunchedKernel, LoopbackLauncher, ManagerConfig,
};

pub fn loopback_manager(config: ManagerConfig) -> KernelManager {
    KernelManager::new(config, Arc::new(LoopbackLauncher::new()))
}

pub fn default_manager() -> KernelManager {
    loopback_manager(ManagerConfig::default())
}

pub fn worker_python_opts() -> KernelOptions {
    KernelOptions::default()
}

/// Registers a collecting listener and returns the shared event vector.
pub fn collect_events(
    manager: &KernelManager,
    kernel_id: &str,
    kind: EventKind,
) -> Arc<Mutex<Vec<KernelEvent>>> {
    let events: Arc<Mutex<Vec<KernelEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_in = Arc::clone(&events);
    manager
        .on(kernel_id, kind, move |event| {
            events_in.lock().expect("event vec mutex").push(event.clone());
        })
        .expect("kernel exists for subscription");
    events
}

/// Delegates to the loopback launcher, failing one specific call
/// (1-based) to exercise `BuildFailed` paths.
pub struct FlakyLauncher {
    inner: LoopbackLauncher,
    fail_call: usize,
    calls: AtomicUsize,
}

impl FlakyLauncher {
    pub fn failing_call(fail_call: usize) -> Self {
        Self {
            inner: LoopbackLauncher::new(),
            fail_call,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KernelLauncher for FlakyLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedKernel, LaunchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_call {
            return Err(LaunchError::new("injected launch failure"));
        }
        self.inner.launch(spec).await
    }
}

/// Delegates to the loopback launcher after a fixed delay on every call
/// past the first. Used to hold a restart window open.
pub struct SlowRelaunchLauncher {
    inner: LoopbackLauncher,
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowRelaunchLauncher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: LoopbackLauncher::new(),
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl KernelLauncher for SlowRelaunchLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedKernel, LaunchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call > 1 {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.launch(spec).await
    }
}

/// Delays every launch. Used to observe pool misses while preload is in
/// flight.
pub struct SlowLauncher {
    inner: LoopbackLauncher,
    delay: Duration,
}

impl SlowLauncher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: LoopbackLauncher::new(),
            delay,
        }
    }
}

#[async_trait]
impl KernelLauncher for SlowLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<LaunchedKernel, LaunchError> {
        tokio::time::sleep(self.delay).await;
        self.inner.launch(spec).await
    }
}
