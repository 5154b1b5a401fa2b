mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use ragsync::partition_cache::PartitionCache;
use ragsync_core::models::PartitionKey;
use ragsync_core::vector::VectorStore;

async fn add_partitions(env: &TestEnv, names: &[&str]) {
    for name in names {
        env.vectors.create_partition(COLLECTION, name).await.unwrap();
    }
}

fn cache(env: &TestEnv) -> Arc<PartitionCache> {
    env.service.cache().clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ensure_loaded_makes_one_load_call() {
    let env = TestEnv::new().await;
    env.vectors.set_load_delay(Duration::from_millis(200));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let cache = cache(&env);
        handles.push(tokio::spawn(async move {
            cache.ensure_loaded(COLLECTION, PARTITION, false).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    assert_eq!(env.vectors.load_calls(), 1);
    assert!(env.vectors.inner().is_loaded(COLLECTION, PARTITION));
    assert!(cache(&env).is_tracked(COLLECTION, PARTITION).await.unwrap());
}

#[tokio::test]
async fn test_different_partitions_load_independently() {
    let env = TestEnv::new().await;
    add_partitions(&env, &["bot_b", "bot_c"]).await;
    let cache = cache(&env);

    let (a, b, c) = tokio::join!(
        cache.ensure_loaded(COLLECTION, PARTITION, false),
        cache.ensure_loaded(COLLECTION, "bot_b", false),
        cache.ensure_loaded(COLLECTION, "bot_c", false),
    );
    assert!(a && b && c);
    assert_eq!(env.vectors.load_calls(), 3);
    assert_eq!(env.vectors.inner().loaded_partition_count(), 3);
}

#[tokio::test]
async fn test_failed_load_returns_false_and_is_not_tracked() {
    let env = TestEnv::new().await;
    env.vectors.fail_loads(true);
    let cache = cache(&env);

    assert!(!cache.ensure_loaded(COLLECTION, PARTITION, false).await);
    assert!(!cache.is_tracked(COLLECTION, PARTITION).await.unwrap());
    // No internal retry
    assert_eq!(env.vectors.load_calls(), 1);

    env.vectors.fail_loads(false);
    assert!(cache.ensure_loaded(COLLECTION, PARTITION, false).await);
}

#[tokio::test]
async fn test_missing_collection_is_not_loaded() {
    let env = TestEnv::new().await;
    assert!(!cache(&env).ensure_loaded("collection_ghost", PARTITION, false).await);
    assert_eq!(env.vectors.load_calls(), 0);
}

#[tokio::test]
async fn test_ttl_pass_evicts_only_idle_partitions() {
    let env = TestEnv::new().await;
    add_partitions(&env, &["bot_busy"]).await;
    let cache = cache(&env);

    assert!(cache.ensure_loaded(COLLECTION, PARTITION, false).await);
    assert!(cache.ensure_loaded(COLLECTION, "bot_busy", false).await);

    env.clock.advance(chrono::Duration::minutes(20));
    assert!(cache.ensure_loaded(COLLECTION, "bot_busy", false).await);
    env.clock.advance(chrono::Duration::minutes(15));

    let evicted = cache.evict_expired().await.unwrap();
    assert_eq!(evicted, vec![PartitionKey::new(COLLECTION, PARTITION)]);
    assert!(!env.vectors.inner().is_loaded(COLLECTION, PARTITION));
    assert!(env.vectors.inner().is_loaded(COLLECTION, "bot_busy"));
    assert!(!cache.is_tracked(COLLECTION, PARTITION).await.unwrap());
    assert!(cache.is_tracked(COLLECTION, "bot_busy").await.unwrap());
    // Fast path touches do not reload.
    assert_eq!(env.vectors.load_calls(), 2);
}

async fn load_in_order(env: &TestEnv, names: &[&str]) {
    let cache = cache(env);
    for name in names {
        assert!(cache.ensure_loaded(COLLECTION, name, false).await);
        env.clock.advance(chrono::Duration::minutes(1));
    }
}

const EIGHT: [&str; 8] = [
    "bot_p0", "bot_p1", "bot_p2", "bot_p3", "bot_p4", "bot_p5", "bot_p6", "bot_p7",
];

#[tokio::test]
async fn test_memory_pass_evicts_oldest_and_stops_below_threshold() {
    // 42% base + 5% per loaded partition: 8 loaded is 82%, 7 is 77%.
    let env = TestEnv::build(
        |_| {},
        |vectors| Arc::new(LoadDrivenMemoryProbe::new(vectors, 42.0, 5.0)),
    )
    .await;
    add_partitions(&env, &EIGHT).await;
    load_in_order(&env, &EIGHT).await;
    // p0 becomes the most recent; p1 is now the oldest.
    assert!(cache(&env).ensure_loaded(COLLECTION, "bot_p0", false).await);

    let evicted = cache(&env).relieve_memory_pressure().await.unwrap();
    assert_eq!(evicted, vec![PartitionKey::new(COLLECTION, "bot_p1")]);
    assert_eq!(env.vectors.releases(), vec!["bot_p1"]);
    assert_eq!(env.vectors.inner().loaded_partition_count(), 7);
}

#[tokio::test]
async fn test_memory_pass_is_capped_at_a_quartile() {
    // Never drops below threshold: 70% + 5% * 8 = 110%.
    let env = TestEnv::build(
        |_| {},
        |vectors| Arc::new(LoadDrivenMemoryProbe::new(vectors, 70.0, 5.0)),
    )
    .await;
    add_partitions(&env, &EIGHT).await;
    load_in_order(&env, &EIGHT).await;

    let evicted = cache(&env).relieve_memory_pressure().await.unwrap();
    assert_eq!(
        evicted,
        vec![
            PartitionKey::new(COLLECTION, "bot_p0"),
            PartitionKey::new(COLLECTION, "bot_p1"),
        ]
    );
}

#[tokio::test]
async fn test_memory_pass_evicts_at_least_one() {
    let env = TestEnv::build(
        |_| {},
        |vectors| Arc::new(LoadDrivenMemoryProbe::new(vectors, 95.0, 0.0)),
    )
    .await;
    assert!(cache(&env).ensure_loaded(COLLECTION, PARTITION, false).await);
    let evicted = cache(&env).relieve_memory_pressure().await.unwrap();
    assert_eq!(evicted.len(), 1);
}

#[tokio::test]
async fn test_memory_pass_idle_below_threshold() {
    let env = TestEnv::new().await;
    assert!(cache(&env).ensure_loaded(COLLECTION, PARTITION, false).await);
    assert!(cache(&env).relieve_memory_pressure().await.unwrap().is_empty());
    assert!(env.vectors.releases().is_empty());
}

#[tokio::test]
async fn test_resync_trusts_the_vector_store() {
    let env = TestEnv::new().await;
    add_partitions(&env, &["bot_stale"]).await;
    let cache = cache(&env);

    // Loaded behind the cache's back.
    env.vectors.inner().load_partition(COLLECTION, PARTITION).await.unwrap();
    // Tracked but not loaded.
    cache.state().mark_loaded(COLLECTION, "bot_stale", true).await.unwrap();
    // Tracked for a collection that no longer exists.
    cache.state().mark_loaded("collection_gone", "bot_x", true).await.unwrap();

    let report = cache.resync().await.unwrap();
    assert_eq!(report.collections_checked, 1);
    assert_eq!(report.partitions_checked, 2);
    assert_eq!(report.partitions_synced, 1);
    assert_eq!(report.stale_records_removed, 2);

    assert!(cache.is_tracked(COLLECTION, PARTITION).await.unwrap());
    assert!(!cache.is_tracked(COLLECTION, "bot_stale").await.unwrap());
    assert!(!cache.is_tracked("collection_gone", "bot_x").await.unwrap());
}

#[tokio::test]
async fn test_reload_tracked_after_vector_store_restart() {
    let env = TestEnv::new().await;
    let cache = cache(&env);
    assert!(cache.ensure_loaded(COLLECTION, PARTITION, false).await);
    cache.state().mark_loaded("collection_gone", "bot_x", true).await.unwrap();

    // The vector store forgets everything it had loaded.
    env.vectors.inner().release_partition(COLLECTION, PARTITION).await.unwrap();

    let report = cache.reload_tracked().await.unwrap();
    assert_eq!(report.reloaded, vec![PartitionKey::new(COLLECTION, PARTITION)]);
    assert_eq!(report.dropped, vec![PartitionKey::new("collection_gone", "bot_x")]);
    assert!(report.failed.is_empty());
    assert!(env.vectors.inner().is_loaded(COLLECTION, PARTITION));
}

#[tokio::test]
async fn test_eviction_loop_runs_until_stopped() {
    let env = TestEnv::with_config(|c| c.partitions.cleanup_interval_seconds = 1).await;
    let cache = cache(&env);
    assert!(cache.ensure_loaded(COLLECTION, PARTITION, false).await);

    env.service.start().await.unwrap();
    env.clock.advance(chrono::Duration::minutes(31));
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(!env.vectors.inner().is_loaded(COLLECTION, PARTITION));
    assert!(!cache.is_tracked(COLLECTION, PARTITION).await.unwrap());

    env.service.stop().await;
    assert!(!env.service.is_running());
}

#[tokio::test]
async fn test_status_lists_tracked_partitions() {
    let env = TestEnv::new().await;
    add_partitions(&env, &["bot_b"]).await;
    load_in_order(&env, &[PARTITION, "bot_b"]).await;

    let status = cache(&env).status().await.unwrap();
    assert_eq!(status.total_loaded, 2);
    assert_eq!(status.collections, vec![COLLECTION]);
    let oldest = status.oldest.unwrap();
    assert_eq!(oldest.key, PartitionKey::new(COLLECTION, PARTITION));
    assert_eq!(oldest.minutes_idle, 2);
}

#[tokio::test]
async fn test_partition_ttl_longer_than_default_record_ttl_still_evicts() {
    let env = TestEnv::with_config(|c| c.partitions.ttl_minutes = 90).await;
    let cache = cache(&env);
    assert!(cache.ensure_loaded(COLLECTION, PARTITION, false).await);

    env.clock.advance(chrono::Duration::minutes(89));
    assert!(cache.run_cleanup_pass().await.ttl_evicted.is_empty());
    assert!(cache.is_tracked(COLLECTION, PARTITION).await.unwrap());

    env.clock.advance(chrono::Duration::minutes(2));
    let report = cache.run_cleanup_pass().await;
    assert_eq!(report.ttl_evicted, vec![PartitionKey::new(COLLECTION, PARTITION)]);
    assert!(!env.vectors.inner().is_loaded(COLLECTION, PARTITION));
    assert!(!cache.is_tracked(COLLECTION, PARTITION).await.unwrap());
}

#[tokio::test]
async fn test_startup_reload_survives_resync() {
    let env = TestEnv::with_config(|c| {
        c.partitions.resync_on_start = true;
        c.partitions.reload_on_start = true;
    })
    .await;
    let cache = cache(&env);
    assert!(cache.ensure_loaded(COLLECTION, PARTITION, false).await);
    // The vector store restarted and lost its loaded set.
    env.vectors.inner().release_partition(COLLECTION, PARTITION).await.unwrap();

    let report = env.service.start().await.unwrap();
    let reload = report.reload.unwrap();
    assert_eq!(reload.reloaded, vec![PartitionKey::new(COLLECTION, PARTITION)]);
    let resync = report.resync.unwrap();
    assert_eq!(resync.partitions_synced, 1);
    assert_eq!(resync.stale_records_removed, 0);
    assert!(env.vectors.inner().is_loaded(COLLECTION, PARTITION));
    assert!(cache.is_tracked(COLLECTION, PARTITION).await.unwrap());

    env.service.stop().await;
}
