//! Foundational public types for the polykernel library.
//!
//! This module defines the core data structures used throughout the library:
//! - [`KernelMode`] / [`KernelLanguage`] — the two axes of a kernel type
//! - [`KernelOptions`] — per-kernel creation options (the config snapshot
//!   captured for restart)
//! - [`ManagerConfig`] / [`PoolConfig`] — manager-level configuration
//! - [`KernelDescriptor`] — the listing snapshot returned by `list()`
//! - [`ExecutionInfo`] — the execution-tracker query result
//! - [`IdGen`] — an injectable monotonic id source

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Where a kernel's interpreter executes.
///
/// `InProcess` kernels share the manager's event loop and are treated as
/// elevated privilege; `Worker` kernels run behind a message channel on a
/// worker provided by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelMode {
    InProcess,
    Worker,
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelMode::InProcess => write!(f, "in-process"),
            KernelMode::Worker => write!(f, "worker"),
        }
    }
}

/// The guest language an interpreter engine speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelLanguage {
    Python,
    Ts,
    Js,
}

impl fmt::Display for KernelLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelLanguage::Python => write!(f, "python"),
            KernelLanguage::Ts => write!(f, "ts"),
            KernelLanguage::Js => write!(f, "js"),
        }
    }
}

/// Whether a kernel was served from the hot pool or built on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelSource {
    Pool,
    OnDemand,
}

/// A (mode, language) pair: the unit the admission policy and the pool are
/// keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelTypeSpec {
    pub mode: KernelMode,
    pub language: KernelLanguage,
}

impl KernelTypeSpec {
    pub const fn new(mode: KernelMode, language: KernelLanguage) -> Self {
        Self { mode, language }
    }

    /// Stable string key, e.g. `"worker-python"`. Used for pool stats maps.
    pub fn key(&self) -> String {
        format!("{}-{}", self.mode, self.language)
    }
}

/// Filesystem mount descriptor, passed opaquely to the interpreter runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    pub enabled: bool,
    /// Host-side root directory exposed to the guest.
    pub root: String,
    /// Guest-side mount point.
    pub mount_point: String,
}

/// Options governing the creation of a single kernel.
///
/// The full struct is captured as the kernel's configuration snapshot so that
/// `restart` can rebuild an instance with bit-identical mode, language, and
/// timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelOptions {
    /// Caller-supplied local id. When absent a 128-bit random identifier in
    /// canonical hyphenated form is generated.
    pub id: Option<String>,

    /// Tenant namespace. When present the final id is `<namespace>:<local-id>`.
    pub namespace: Option<String>,

    pub mode: KernelMode,
    pub language: KernelLanguage,

    /// Optional filesystem mount. Requests carrying a mount are never served
    /// from the pool.
    pub mount: Option<MountConfig>,

    /// Idle window in milliseconds before auto-shutdown. `0` disables.
    pub inactivity_timeout_ms: u64,

    /// Per-execution deadline in milliseconds. `0` disables stall detection.
    pub max_execution_time_ms: u64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            id: None,
            namespace: None,
            mode: KernelMode::Worker,
            language: KernelLanguage::Python,
            mount: None,
            inactivity_timeout_ms: 0,
            max_execution_time_ms: 0,
        }
    }
}

impl KernelOptions {
    /// `true` when the request matches the pool's canonical build shape and
    /// may therefore be satisfied by a pre-warmed kernel. Per-request build
    /// configuration (currently: a mount) forces on-demand construction.
    pub fn is_pool_canonical(&self) -> bool {
        self.mount.is_none()
    }
}

/// Hot-kernel pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub enabled: bool,

    /// Target number of warmed kernels per permitted (mode, language) tuple.
    pub pool_size: usize,

    /// Rebuild a fresh kernel whenever a slot is taken. Handed-out kernels
    /// are never returned to the pool.
    pub auto_refill: bool,

    /// Tuples to pre-warm. Entries forbidden by the admission policy are
    /// silently dropped before warming begins.
    pub preload_configs: Vec<KernelTypeSpec>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pool_size: 2,
            auto_refill: true,
            preload_configs: Vec::new(),
        }
    }
}

/// Manager-level configuration, supplied at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// The admission set. Defaults to worker mode for every language;
    /// in-process kernels share the host thread and are excluded by default.
    pub allowed_kernel_types: Vec<KernelTypeSpec>,

    pub pool: PoolConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            allowed_kernel_types: vec![
                KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Python),
                KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Ts),
                KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Js),
            ],
            pool: PoolConfig::default(),
        }
    }
}

/// Snapshot of one kernel as returned by `KernelManager::list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    /// Final (namespace-prefixed) identifier.
    pub id: String,
    pub namespace: Option<String>,
    pub mode: KernelMode,
    pub language: KernelLanguage,
    /// Creation time, milliseconds since the Unix epoch.
    pub created: u64,
    pub is_from_pool: bool,
    /// Last activity, milliseconds since the Unix epoch.
    pub last_activity: u64,
}

/// Execution-tracker query result for one kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Number of currently open execution records.
    pub count: usize,
    /// `true` iff at least one record has exceeded its deadline.
    pub is_stuck: bool,
    /// Age of the oldest open record, in milliseconds.
    pub longest_running_ms: u64,
}

/// Injectable monotonic id source.
///
/// Used for listener ids (event bus) and per-kernel execution ids. Kept as an
/// owned service rather than an ambient singleton so tests can construct and
/// [`reset`](IdGen::reset) their own instances.
#[derive(Debug, Default)]
pub struct IdGen(AtomicU64);

impl IdGen {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Returns the next id, starting at 1.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Resets the counter to zero; the next call to [`next`](IdGen::next)
    /// returns 1 again.
    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }
}

/// Milliseconds since the Unix epoch, for descriptor timestamps.
pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
