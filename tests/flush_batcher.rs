mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{InstrumentedVectorStore, OpLog, TestEnv, COLLECTION, DIMS};
use ragsync::flush::{FlushBatcher, FlushSettings};
use ragsync::shutdown;
use ragsync_core::vector::VectorStore;
use tokio::time::Instant;

async fn setup() -> (Arc<InstrumentedVectorStore>, Arc<FlushBatcher>) {
    let vectors = Arc::new(InstrumentedVectorStore::new(OpLog::default()));
    vectors.create_collection(COLLECTION, DIMS).await.unwrap();
    vectors.create_collection("collection_other", DIMS).await.unwrap();
    let batcher = Arc::new(FlushBatcher::new(
        vectors.clone(),
        FlushSettings {
            delay: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        },
    ));
    (vectors, batcher)
}

#[tokio::test(start_paused = true)]
async fn test_burst_of_marks_produces_one_flush() {
    let (vectors, batcher) = setup().await;
    let (trigger, signal) = shutdown::channel();
    let task = tokio::spawn(batcher.clone().run(signal));

    for _ in 0..10 {
        batcher.mark_dirty(COLLECTION);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(vectors.flushes(COLLECTION).len(), 1);
    assert!(!batcher.is_dirty(COLLECTION));
    assert!(batcher.status().running);

    trigger.trigger();
    task.await.unwrap();
    assert!(!batcher.status().running);
}

#[tokio::test(start_paused = true)]
async fn test_flush_waits_for_quiet_period() {
    let (vectors, batcher) = setup().await;
    let (trigger, signal) = shutdown::channel();
    let task = tokio::spawn(batcher.clone().run(signal));

    let marked_at = Instant::now();
    batcher.mark_dirty(COLLECTION);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(vectors.flushes(COLLECTION).is_empty());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let flushes = vectors.flushes(COLLECTION);
    assert_eq!(flushes.len(), 1);
    let waited = flushes[0] - marked_at;
    assert!(waited >= Duration::from_millis(500), "flushed after {:?}", waited);
    assert!(waited <= Duration::from_millis(600), "flushed after {:?}", waited);

    trigger.trigger();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_continuous_marks_flush_within_max_wait() {
    let (vectors, batcher) = setup().await;
    let (trigger, signal) = shutdown::channel();
    let task = tokio::spawn(batcher.clone().run(signal));

    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(12) {
        batcher.mark_dirty(COLLECTION);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let flushes = vectors.flushes(COLLECTION);
    assert!(flushes.len() >= 2, "only {} flushes", flushes.len());
    let ceiling = Duration::from_secs(5) + Duration::from_millis(200);
    assert!(flushes[0] - started <= ceiling);
    for pair in flushes.windows(2) {
        assert!(pair[1] - pair[0] <= ceiling, "gap {:?}", pair[1] - pair[0]);
    }

    trigger.trigger();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_collections_are_debounced_independently() {
    let (vectors, batcher) = setup().await;
    let (trigger, signal) = shutdown::channel();
    let task = tokio::spawn(batcher.clone().run(signal));

    batcher.mark_dirty(COLLECTION);
    tokio::time::sleep(Duration::from_millis(400)).await;
    batcher.mark_dirty("collection_other");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(vectors.flushes(COLLECTION).len(), 1);
    assert!(vectors.flushes("collection_other").is_empty());
    assert_eq!(batcher.pending(), vec!["collection_other"]);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(vectors.flushes("collection_other").len(), 1);

    trigger.trigger();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_is_retried_on_next_poll() {
    let (vectors, batcher) = setup().await;
    let (trigger, signal) = shutdown::channel();
    let task = tokio::spawn(batcher.clone().run(signal));

    vectors.fail_flushes(true);
    batcher.mark_dirty(COLLECTION);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(batcher.is_dirty(COLLECTION));
    assert!(batcher.last_flush_time(COLLECTION).is_none());

    vectors.fail_flushes(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!batcher.is_dirty(COLLECTION));
    assert_eq!(vectors.flushes(COLLECTION).len(), 1);

    trigger.trigger();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_drain_flushes_everything_pending() {
    let (vectors, batcher) = setup().await;
    batcher.mark_dirty(COLLECTION);
    batcher.mark_dirty("collection_other");
    batcher.mark_dirty("collection_missing");

    let report = batcher.drain().await;
    assert_eq!(report.flushed, vec!["collection_acme", "collection_other"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "collection_missing");
    assert_eq!(vectors.flushes(COLLECTION).len(), 1);
    assert_eq!(batcher.pending(), vec!["collection_missing"]);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_flush_clears_mark_or_propagates() {
    let (vectors, batcher) = setup().await;
    batcher.mark_dirty(COLLECTION);
    batcher.immediate_flush(COLLECTION).await.unwrap();
    assert!(!batcher.is_dirty(COLLECTION));
    assert!(batcher.last_flush_time(COLLECTION).is_some());

    vectors.fail_flushes(true);
    batcher.mark_dirty(COLLECTION);
    assert!(batcher.immediate_flush(COLLECTION).await.is_err());
    assert!(batcher.is_dirty(COLLECTION));
}

#[tokio::test]
async fn test_service_stop_gives_up_on_a_hung_flush() {
    let env = TestEnv::with_config(|c| c.service.shutdown_timeout_seconds = 1).await;
    env.service.start().await.unwrap();
    env.vectors.hang_flushes(true);
    env.service.flusher().mark_dirty(COLLECTION);

    let report = tokio::time::timeout(Duration::from_secs(5), env.service.stop())
        .await
        .expect("stop should return within the shutdown timeout");
    assert!(report.flushed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, COLLECTION);
    assert!(env.service.flusher().is_dirty(COLLECTION));
    assert!(!env.service.is_running());
}
