//! Hot-kernel pool for sub-second provisioning.
//!
//! ## Design
//!
//! For each permitted (mode, language) tuple named in the preload
//! configuration the pool asynchronously builds kernels up to the target
//! size, each fully `READY`-awaited before it is shelved. `acquire` pops a
//! warmed kernel in O(1); a miss (empty shelf, unknown tuple, or preload
//! still in flight) falls through to on-demand construction by the caller;
//! acquisition never blocks on warming.
//!
//! Refill is triggered whenever a slot is taken. Handed-out kernels are
//! never returned; refill is always fresh construction, with at most
//! `target` concurrent build tasks per tuple (`ready + building <= target`
//! at steady state). Build tasks are individually cancellable on shutdown.
//!
//! Only requests matching the pool's canonical build shape (no mount, no
//! per-request engine configuration) may be served from a shelf; the
//! manager checks that before calling `acquire`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::launcher::{wait_ready, KernelLauncher, LaunchSpec, LaunchedKernel, READY_TIMEOUT};
use crate::policy::AdmissionPolicy;
use crate::types::{KernelLanguage, KernelMode, KernelTypeSpec, PoolConfig};

/// Per-tuple snapshot returned by [`KernelPool::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolTupleStats {
    /// Warmed kernels ready to hand out.
    pub available: usize,
    /// Build tasks currently in flight.
    pub building: usize,
    pub target: usize,
}

struct Shelf {
    ready: VecDeque<LaunchedKernel>,
    building: usize,
}

/// Pre-warmed kernels keyed by (mode, language).
pub struct KernelPool {
    launcher: Arc<dyn KernelLauncher>,
    shelves: Mutex<HashMap<KernelTypeSpec, Shelf>>,
    target: usize,
    auto_refill: bool,
    cancel: CancellationToken,
}

impl KernelPool {
    /// Builds a pool and starts warming every permitted preload tuple.
    ///
    /// Preload entries forbidden by `policy` are silently dropped; the pool
    /// never holds a kernel the admission policy would reject. The minimum
    /// effective target is 1.
    pub fn new(
        launcher: Arc<dyn KernelLauncher>,
        config: &PoolConfig,
        policy: &AdmissionPolicy,
    ) -> Arc<Self> {
        let target = config.pool_size.max(1);
        let mut shelves = HashMap::new();
        for spec in &config.preload_configs {
            if !policy.is_allowed(spec.mode, spec.language) {
                tracing::debug!(tuple = %spec.key(), "dropping forbidden pool preload entry");
                continue;
            }
            shelves.entry(*spec).or_insert_with(|| Shelf {
                ready: VecDeque::new(),
                building: 0,
            });
        }

        let pool = Arc::new(Self {
            launcher,
            shelves: Mutex::new(shelves),
            target,
            auto_refill: config.auto_refill,
            cancel: CancellationToken::new(),
        });
        let tuples: Vec<KernelTypeSpec> = {
            let shelves = pool.shelves.lock().expect("pool shelves mutex poisoned");
            shelves.keys().copied().collect()
        };
        for spec in tuples {
            pool.top_up(spec);
        }
        pool
    }

    /// Takes a warmed kernel for the tuple, or reports a miss.
    ///
    /// O(1); never waits for warming. A hit triggers refill when auto-refill
    /// is enabled.
    pub fn acquire(
        self: &Arc<Self>,
        mode: KernelMode,
        language: KernelLanguage,
    ) -> Option<LaunchedKernel> {
        let spec = KernelTypeSpec::new(mode, language);
        let taken = {
            let mut shelves = self.shelves.lock().expect("pool shelves mutex poisoned");
            shelves.get_mut(&spec)?.ready.pop_front()
        };
        if taken.is_some() {
            tracing::debug!(tuple = %spec.key(), "served kernel from pool");
            if self.auto_refill && !self.cancel.is_cancelled() {
                self.top_up(spec);
            }
        }
        taken
    }

    /// Per-tuple availability snapshot, keyed by `"<mode>-<language>"`.
    pub fn stats(&self) -> HashMap<String, PoolTupleStats> {
        let shelves = self.shelves.lock().expect("pool shelves mutex poisoned");
        shelves
            .iter()
            .map(|(spec, shelf)| {
                (
                    spec.key(),
                    PoolTupleStats {
                        available: shelf.ready.len(),
                        building: shelf.building,
                        target: self.target,
                    },
                )
            })
            .collect()
    }

    /// Cancels in-flight builds and drops every shelved kernel.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let mut shelves = self.shelves.lock().expect("pool shelves mutex poisoned");
        for shelf in shelves.values_mut() {
            // Dropping the transports disposes the warmed engines.
            shelf.ready.clear();
        }
    }

    /// Spawns build tasks until `ready + building` reaches the target.
    fn top_up(self: &Arc<Self>, spec: KernelTypeSpec) {
        let mut shelves = self.shelves.lock().expect("pool shelves mutex poisoned");
        let Some(shelf) = shelves.get_mut(&spec) else {
            return;
        };
        while shelf.ready.len() + shelf.building < self.target {
            shelf.building += 1;
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.build_one(spec).await;
            });
        }
    }

    async fn build_one(self: Arc<Self>, spec: KernelTypeSpec) {
        let launch_spec = LaunchSpec {
            mode: spec.mode,
            language: spec.language,
            mount: None,
        };
        let built = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = async {
                match self.launcher.launch(&launch_spec).await {
                    Ok(mut launched) => {
                        match wait_ready(&mut launched.transport, READY_TIMEOUT).await {
                            Ok(()) => Some(launched),
                            Err(error) => {
                                tracing::warn!(
                                    tuple = %spec.key(),
                                    error = %error,
                                    "pool kernel failed to reach READY"
                                );
                                None
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            tuple = %spec.key(),
                            error = %error,
                            "pool kernel build failed"
                        );
                        None
                    }
                }
            } => result,
        };

        let mut shelves = self.shelves.lock().expect("pool shelves mutex poisoned");
        if let Some(shelf) = shelves.get_mut(&spec) {
            shelf.building = shelf.building.saturating_sub(1);
            if let Some(launched) = built {
                if self.cancel.is_cancelled() {
                    // Shutdown raced the build; drop the kernel.
                    return;
                }
                shelf.ready.push_back(launched);
            }
        }
    }
}
