//! Schema migrations for the relational store and the key-value table.
//!
//! All statements are idempotent (`IF NOT EXISTS`), so running them on
//! every start is safe.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an existing pool.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Bot registry: one row per (account, bot)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bots (
            bot_id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            bot_name TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Documents: content_name is the natural key within a bot
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            bot_id TEXT NOT NULL,
            content_name TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            chunk_count INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(bot_id, content_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Durable key-value entries (partition tracking)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_bot ON documents(bot_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_expires ON kv_entries(expires_at)")
        .execute(pool)
        .await?;

    Ok(())
}
