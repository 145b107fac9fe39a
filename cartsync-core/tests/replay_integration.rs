//! Replay engine integration tests.
//!
//! Covers ordering, drain idempotence, buffer convergence, the offline
//! cart scenario end to end, and processes sharing one data directory.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cartsync_core::invalidation::{CART, CART_ITEMS};
use cartsync_core::{
    CartSync, ConnectivityMonitor, ConnectivityState, DrainStatus, DurableBuffer, FileStore,
    InvalidationBus, KeyValueStore, MemoryStore, PendingMutation, ReplayEngine, RetryPolicy,
    StoreDrainLock, DEFAULT_LOCK_TTL,
};
use common::{buffer_with, cart, network_down, MockStorefront};

#[tokio::test]
async fn test_failed_head_blocks_later_records() {
    let remote = MockStorefront::new();
    remote.script_cart(vec![network_down(), Ok(())]);
    let engine = ReplayEngine::new(remote.clone(), RetryPolicy::cart());
    let (_, buffer) = buffer_with(&[
        PendingMutation::cart_add(1, 1),
        PendingMutation::cart_add(2, 1),
        PendingMutation::cart_add(3, 1),
    ])
    .await;

    let report = engine.drain(&buffer).await;

    assert_eq!(report.status, DrainStatus::Halted);
    assert!(report.synced.is_empty());
    assert_eq!(buffer.len().await, 3);
    assert_eq!(remote.cart_calls(), vec![cart(1, 1)]);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_drains_issue_one_call_per_record() {
    let remote = MockStorefront::with_latency(Duration::from_millis(100));
    let engine = ReplayEngine::new(remote.clone(), RetryPolicy::cart());
    let (_, buffer) = buffer_with(&[
        PendingMutation::cart_add(1, 1),
        PendingMutation::cart_add(2, 1),
    ])
    .await;

    let (first, second) = tokio::join!(engine.drain(&buffer), engine.drain(&buffer));

    let statuses = [first.status, second.status];
    assert!(statuses.contains(&DrainStatus::Completed));
    assert!(statuses.contains(&DrainStatus::Skipped));
    assert_eq!(remote.cart_calls(), vec![cart(1, 1), cart(2, 1)]);
    assert!(buffer.is_empty().await);
}

#[tokio::test]
async fn test_full_drain_empties_buffer_and_invalidates_once() {
    let remote = MockStorefront::new();
    let bus = Arc::new(InvalidationBus::new());
    let engine = ReplayEngine::new(remote.clone(), RetryPolicy::cart()).with_invalidator(bus.clone());
    let records: Vec<_> = (0..5).map(|v| PendingMutation::cart_add(v, 1)).collect();
    let (_, buffer) = buffer_with(&records).await;

    let report = engine.drain(&buffer).await;

    assert_eq!(report.status, DrainStatus::Completed);
    assert_eq!(report.synced.len(), 5);
    assert!(buffer.read_all().await.is_empty());
    assert_eq!(bus.count(CART), 1);
    assert_eq!(bus.count(CART_ITEMS), 1);
}

#[tokio::test]
async fn test_offline_cart_scenario() {
    let remote = MockStorefront::new();
    let bus = Arc::new(InvalidationBus::new());
    let mut invalidations = bus.subscribe();
    let engine = Arc::new(
        ReplayEngine::new(remote.clone(), RetryPolicy::cart()).with_invalidator(bus.clone()),
    );
    let buffer = Arc::new(DurableBuffer::open(Arc::new(MemoryStore::new())).await);
    let monitor = ConnectivityMonitor::new(ConnectivityState::Offline);
    let cart_sync = CartSync::new(buffer, engine, monitor.clone());

    cart_sync.add_to_cart(42, 1).await;
    cart_sync.add_to_cart(43, 2).await;

    let pending = cart_sync.pending().await;
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].as_cart_add(), Some(&cart(42, 1)));
    assert_eq!(pending[1].as_cart_add(), Some(&cart(43, 2)));
    assert!(remote.calls().is_empty());

    monitor.set_online(true);
    let report = cart_sync.drain().await;

    assert_eq!(report.status, DrainStatus::Completed);
    assert_eq!(remote.cart_calls(), vec![cart(42, 1), cart(43, 2)]);
    assert!(cart_sync.pending().await.is_empty());

    let mut tags = Vec::new();
    while let Ok(tag) = invalidations.try_recv() {
        tags.push(tag);
    }
    assert!(tags.contains(&CART.to_string()));
    assert!(tags.contains(&CART_ITEMS.to_string()));
}

#[tokio::test]
async fn test_two_processes_sharing_storage_do_not_double_submit() {
    let store = MemoryStore::new();
    let remote = MockStorefront::new();

    let seed = DurableBuffer::open(Arc::new(store.clone())).await;
    seed.append(PendingMutation::cart_add(42, 1)).await;

    let tab_a = DurableBuffer::open(Arc::new(store.clone())).await;
    let tab_b = DurableBuffer::open(Arc::new(store.clone())).await;
    let engine_a = ReplayEngine::new(remote.clone(), RetryPolicy::cart())
        .with_lock(Arc::new(StoreDrainLock::new(Arc::new(store.clone()))), DEFAULT_LOCK_TTL);
    let engine_b = ReplayEngine::new(remote.clone(), RetryPolicy::cart())
        .with_lock(Arc::new(StoreDrainLock::new(Arc::new(store.clone()))), DEFAULT_LOCK_TTL);

    let first = engine_a.drain(&tab_a).await;
    let second = engine_b.drain(&tab_b).await;

    assert_eq!(first.status, DrainStatus::Completed);
    assert_eq!(second.status, DrainStatus::Empty);
    assert_eq!(remote.cart_calls(), vec![cart(42, 1)]);
}

fn file_store(dir: &std::path::Path) -> Arc<dyn KeyValueStore> {
    Arc::new(FileStore::new(dir).expect("file store"))
}

fn locked_engine(remote: Arc<common::MockStorefront>, dir: &std::path::Path) -> ReplayEngine {
    ReplayEngine::new(remote, RetryPolicy::cart())
        .with_lock(Arc::new(StoreDrainLock::new(file_store(dir))), DEFAULT_LOCK_TTL)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_through_separate_file_handles_are_all_kept() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tab_a = Arc::new(DurableBuffer::open(file_store(dir.path())).await);
    let tab_b = Arc::new(DurableBuffer::open(file_store(dir.path())).await);

    let mut tasks = Vec::new();
    for variant in 0..50u64 {
        let tab = if variant % 2 == 0 {
            Arc::clone(&tab_a)
        } else {
            Arc::clone(&tab_b)
        };
        tasks.push(tokio::spawn(async move {
            tab.append(PendingMutation::cart_add(variant, 1)).await
        }));
    }
    for task in tasks {
        assert!(task.await.expect("join").is_persisted());
    }

    let reopened = DurableBuffer::open(file_store(dir.path())).await;
    assert!(!reopened.is_degraded().await);
    let mut variants: Vec<u64> = reopened
        .read_all()
        .await
        .iter()
        .filter_map(|r| r.as_cart_add().map(|p| p.variant_id))
        .collect();
    variants.sort_unstable();
    assert_eq!(variants, (0..50).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_drains_over_shared_files_submit_each_record_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let seed = DurableBuffer::open(file_store(dir.path())).await;
    for variant in 1..=5 {
        seed.append(PendingMutation::cart_add(variant, 1)).await;
    }

    let remote = MockStorefront::with_latency(Duration::from_millis(20));
    let tab_a = DurableBuffer::open(file_store(dir.path())).await;
    let tab_b = DurableBuffer::open(file_store(dir.path())).await;
    let engine_a = locked_engine(remote.clone(), dir.path());
    let engine_b = locked_engine(remote.clone(), dir.path());

    let (first, second) = tokio::join!(engine_a.drain(&tab_a), engine_b.drain(&tab_b));

    let statuses = [first.status, second.status];
    assert!(statuses.contains(&DrainStatus::Completed));
    assert_eq!(first.synced.len() + second.synced.len(), 5);
    let mut variants: Vec<u64> = remote.cart_calls().iter().map(|c| c.variant_id).collect();
    variants.sort_unstable();
    assert_eq!(variants, vec![1, 2, 3, 4, 5]);
    assert!(seed.read_all().await.is_empty());
}
