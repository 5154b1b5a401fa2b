//! Operator reports over the local SQLite stores.
//!
//! Used by `ragsync stats`, `ragsync partitions`, and `ragsync purge`.
//! These read the database directly and need no vector store.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use ragsync_core::clock::{Clock, SystemClock};

use crate::config::Config;
use crate::db;
use crate::partition_cache::{CacheSettings, PartitionStatus};
use crate::partition_state::PartitionStateStore;
use crate::sqlite_kv::SqliteKvStore;

/// Row counts across the relational tables and the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    pub bots: i64,
    pub documents: i64,
    pub chunks: i64,
    pub kv_live: i64,
    pub kv_expired: i64,
}

pub async fn collect_counts(pool: &SqlitePool) -> Result<StoreCounts> {
    let bots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bots")
        .fetch_one(pool)
        .await?;
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let kv = SqliteKvStore::new(pool.clone()).counts().await?;
    Ok(StoreCounts {
        bots,
        documents,
        chunks,
        kv_live: kv.live,
        kv_expired: kv.expired,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let counts = collect_counts(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("ragsync database stats");
    println!("======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Bots:        {}", counts.bots);
    println!("  Documents:   {}", counts.documents);
    println!("  Chunks:      {}", counts.chunks);
    println!(
        "  KV entries:  {} live, {} expired",
        counts.kv_live, counts.kv_expired
    );
    println!();

    pool.close().await;
    Ok(())
}

/// Print the tracked-partition status report.
pub async fn run_partitions(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = PartitionStateStore::new(
        Arc::new(SqliteKvStore::new(pool.clone())),
        clock.clone(),
        config.partitions.key_prefix.clone(),
        config.partitions.record_ttl(),
    );
    let now = clock.now();
    let status = PartitionStatus::from_records(
        state.list().await?,
        now,
        &CacheSettings::from_config(&config.partitions),
    );

    println!("Tracked partitions: {}", status.total_loaded);
    println!(
        "  TTL {} min, cleanup every {}s, memory threshold {:.0}%",
        status.ttl_minutes, status.cleanup_interval_seconds, status.memory_threshold_percent
    );

    if status.partitions.is_empty() {
        println!();
        pool.close().await;
        return Ok(());
    }

    println!();
    println!(
        "  {:<32} {:<24} {:>14}   {}",
        "COLLECTION", "PARTITION", "LOADED", "LAST ACCESS"
    );
    println!("  {}", "-".repeat(88));
    for record in &status.partitions {
        println!(
            "  {:<32} {:<24} {:>14}   {}",
            record.collection,
            record.partition,
            format_relative(record.loaded_at, now),
            format_relative(record.last_access_at, now)
        );
    }
    if let Some(oldest) = &status.oldest {
        println!();
        println!(
            "  Oldest: {} (idle {} min)",
            oldest.key, oldest.minutes_idle
        );
    }
    println!();

    pool.close().await;
    Ok(())
}

/// Delete expired key-value entries.
pub async fn run_purge(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let removed = SqliteKvStore::new(pool.clone()).purge_expired().await?;
    println!("Purged {} expired entr{}.", removed, if removed == 1 { "y" } else { "ies" });
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to `now` (e.g. "3 hours ago").
fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();

    if delta < 0 {
        at.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    }
}
