//! Pool integration: warming, admission filtering, canonical-shape serving.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{loopback_manager, worker_python_opts, SlowLauncher};
use polykernel::{
    KernelLanguage, KernelManager, KernelMode, KernelOptions, KernelTypeSpec, ManagerConfig,
    MountConfig, PoolConfig,
};
use tokio::time;

fn worker_python() -> KernelTypeSpec {
    KernelTypeSpec::new(KernelMode::Worker, KernelLanguage::Python)
}

fn pooled_config(preload: Vec<KernelTypeSpec>, pool_size: usize, auto_refill: bool) -> ManagerConfig {
    ManagerConfig {
        pool: PoolConfig {
            enabled: true,
            pool_size,
            auto_refill,
            preload_configs: preload,
        },
        ..ManagerConfig::default()
    }
}

/// Polls until the tuple shows the expected number of warmed kernels.
async fn wait_for_available(manager: &KernelManager, key: &str, available: usize) {
    for _ in 0..200 {
        if manager
            .pool_stats()
            .get(key)
            .is_some_and(|stats| stats.available == available)
        {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "pool never reached {available} available for {key}: {:?}",
        manager.pool_stats()
    );
}

#[tokio::test(start_paused = true)]
async fn test_pool_serves_canonical_requests_and_marks_source() {
    let manager = loopback_manager(pooled_config(vec![worker_python()], 2, true));
    wait_for_available(&manager, "worker-python", 2).await;

    let id = manager
        .create(worker_python_opts())
        .await
        .expect("create succeeds");
    let descriptor = manager.list(None).remove(0);
    assert_eq!(descriptor.id, id);
    assert!(descriptor.is_from_pool, "canonical request served from pool");

    // The taken slot is rebuilt by fresh construction.
    wait_for_available(&manager, "worker-python", 2).await;
}

// Scenario 2: forbidden preload tuples are dropped; stats expose no entry.
#[tokio::test(start_paused = true)]
async fn test_admission_filters_pool_preload() {
    let manager = loopback_manager(pooled_config(
        vec![
            worker_python(),
            KernelTypeSpec::new(KernelMode::InProcess, KernelLanguage::Python),
        ],
        1,
        true,
    ));
    wait_for_available(&manager, "worker-python", 1).await;

    let stats = manager.pool_stats();
    assert!(stats.contains_key("worker-python"));
    assert!(
        !stats.contains_key("in-process-python"),
        "no pool entry for the forbidden tuple: {stats:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_mount_request_bypasses_the_pool() {
    let manager = loopback_manager(pooled_config(vec![worker_python()], 1, true));
    wait_for_available(&manager, "worker-python", 1).await;

    let id = manager
        .create(KernelOptions {
            mount: Some(MountConfig {
                enabled: true,
                root: "/srv/data".to_string(),
                mount_point: "/mnt".to_string(),
            }),
            ..worker_python_opts()
        })
        .await
        .expect("create succeeds");
    let descriptor = manager
        .list(None)
        .into_iter()
        .find(|descriptor| descriptor.id == id)
        .expect("kernel listed");
    assert!(
        !descriptor.is_from_pool,
        "per-request configuration forces on-demand construction"
    );
    assert_eq!(
        manager.pool_stats()["worker-python"].available,
        1,
        "pool slot untouched"
    );
}

// Acquisition before preload completes falls through to on-demand.
#[tokio::test(start_paused = true)]
async fn test_acquire_before_preload_completes_builds_on_demand() {
    let manager = KernelManager::new(
        pooled_config(vec![worker_python()], 1, true),
        Arc::new(SlowLauncher::with_delay(Duration::from_millis(500))),
    );
    // Do not wait for warming: create immediately.
    let id = manager
        .create(worker_python_opts())
        .await
        .expect("create succeeds without blocking on preload");
    let descriptor = manager
        .list(None)
        .into_iter()
        .find(|descriptor| descriptor.id == id)
        .expect("kernel listed");
    assert!(!descriptor.is_from_pool);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_without_refill_serves_on_demand() {
    let manager = loopback_manager(pooled_config(vec![worker_python()], 1, false));
    wait_for_available(&manager, "worker-python", 1).await;

    let first = manager
        .create(worker_python_opts())
        .await
        .expect("first create");
    let second = manager
        .create(worker_python_opts())
        .await
        .expect("second create");

    let listed = manager.list(None);
    let from_pool = |id: &str| {
        listed
            .iter()
            .find(|descriptor| descriptor.id == id)
            .expect("listed")
            .is_from_pool
    };
    assert!(from_pool(&first), "first request drains the single slot");
    assert!(!from_pool(&second), "exhausted pool misses to on-demand");
    assert_eq!(manager.pool_stats()["worker-python"].available, 0);
}

#[tokio::test(start_paused = true)]
async fn test_restart_never_consults_the_pool() {
    let manager = loopback_manager(pooled_config(vec![worker_python()], 2, true));
    wait_for_available(&manager, "worker-python", 2).await;

    let id = manager
        .create(worker_python_opts())
        .await
        .expect("create succeeds");
    assert!(manager.list(None).remove(0).is_from_pool);

    manager.restart(&id).await.expect("restart succeeds");
    let descriptor = manager.list(None).remove(0);
    assert!(
        !descriptor.is_from_pool,
        "restart rebuilds from the configuration snapshot"
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_the_pool() {
    let manager = loopback_manager(pooled_config(vec![worker_python()], 2, true));
    wait_for_available(&manager, "worker-python", 2).await;
    manager.shutdown().await;
    let stats = manager.pool_stats();
    assert_eq!(stats["worker-python"].available, 0);
    assert!(manager.list(None).is_empty());
}
