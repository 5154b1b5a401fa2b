//! SQLite-backed [`DocumentStore`] implementation.
//!
//! Documents and their chunks are written in one transaction, and chunk
//! rows cascade with their document. Driver errors are mapped onto the
//! [`SyncError`] taxonomy in [`map_db_err`]: a unique-constraint violation
//! becomes [`SyncError::Duplicate`], recognised from the database error
//! code rather than its message.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use ragsync_core::metadata::Metadata;
use ragsync_core::models::{BotStats, DeletedRows, NewDocument, StoredChunk, StoredDocument};
use ragsync_core::store::DocumentStore;
use ragsync_core::{Result, SyncError};

/// SQLITE_BUSY / SQLITE_LOCKED: another writer holds the lock.
const SQLITE_BUSY_CODES: &[&str] = &["5", "6"];

/// Classify a driver error.
pub fn map_db_err(err: sqlx::Error) -> SyncError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            SyncError::Duplicate(db.message().to_string())
        }
        sqlx::Error::Database(db)
            if db
                .code()
                .map(|c| SQLITE_BUSY_CODES.iter().any(|busy| c == *busy))
                .unwrap_or(false) =>
        {
            SyncError::transient("relational", err.to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_) => {
            SyncError::transient("relational", err.to_string())
        }
        _ => SyncError::terminal("relational", err.to_string()),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// SQLite implementation of the [`DocumentStore`] trait.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn chunks_for(&self, ids: &[i64]) -> Result<HashMap<i64, Vec<StoredChunk>>> {
        let mut by_doc: HashMap<i64, Vec<StoredChunk>> = HashMap::new();
        if ids.is_empty() {
            return Ok(by_doc);
        }
        let sql = format!(
            "SELECT document_id, chunk_index, text FROM chunks WHERE document_id IN ({}) ORDER BY document_id, chunk_index",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_db_err)?;
        for row in rows {
            by_doc
                .entry(row.get("document_id"))
                .or_default()
                .push(StoredChunk {
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                });
        }
        Ok(by_doc)
    }
}

fn document_from_row(row: &SqliteRow, chunks: Vec<StoredChunk>) -> Result<StoredDocument> {
    let id: i64 = row.get("id");
    let metadata_json: String = row.get("metadata_json");
    let metadata: Metadata = serde_json::from_str(&metadata_json).map_err(|e| {
        SyncError::terminal(
            "relational",
            format!("document {} has unreadable metadata: {}", id, e),
        )
    })?;
    Ok(StoredDocument {
        id,
        account_id: row.get("account_id"),
        bot_id: row.get("bot_id"),
        content_name: row.get("content_name"),
        metadata,
        chunk_count: row.get("chunk_count"),
        created_at: row.get("created_at"),
        chunks,
    })
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn existing_content_names(
        &self,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<HashSet<String>> {
        if content_names.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT content_name FROM documents WHERE bot_id = ? AND content_name IN ({})",
            placeholders(content_names.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(bot_id);
        for name in content_names {
            query = query.bind(name);
        }
        let found = query.fetch_all(&self.pool).await.map_err(map_db_err)?;
        Ok(found.into_iter().collect())
    }

    async fn insert_document(&self, doc: &NewDocument) -> Result<i64> {
        let mut seen = HashSet::new();
        if let Some(dup) = doc.chunks.iter().find(|c| !seen.insert(c.index)) {
            return Err(SyncError::InvalidInput(format!(
                "chunk index {} appears more than once in '{}'",
                dup.index, doc.content_name
            )));
        }

        let metadata_json = serde_json::to_string(&doc.metadata)
            .map_err(|e| SyncError::InvalidInput(format!("metadata is not serializable: {}", e)))?;
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents (account_id, bot_id, content_name, metadata_json, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.account_id)
        .bind(&doc.bot_id)
        .bind(&doc.content_name)
        .bind(&metadata_json)
        .bind(doc.chunks.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;
        let document_id = inserted.last_insert_rowid();

        for chunk in &doc.chunks {
            sqlx::query("INSERT INTO chunks (document_id, chunk_index, text) VALUES (?, ?, ?)")
                .bind(document_id)
                .bind(chunk.index)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?;
        }

        tx.commit().await.map_err(map_db_err)?;
        Ok(document_id)
    }

    async fn delete_document(&self, document_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_document(
        &self,
        bot_id: &str,
        content_name: &str,
    ) -> Result<Option<StoredDocument>> {
        let row = sqlx::query(
            "SELECT id, account_id, bot_id, content_name, metadata_json, chunk_count, created_at FROM documents WHERE bot_id = ? AND content_name = ?",
        )
        .bind(bot_id)
        .bind(content_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.get("id");
        let mut chunks = self.chunks_for(&[id]).await?;
        document_from_row(&row, chunks.remove(&id).unwrap_or_default()).map(Some)
    }

    async fn documents_by_ids(&self, ids: &[i64]) -> Result<Vec<StoredDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, account_id, bot_id, content_name, metadata_json, chunk_count, created_at FROM documents WHERE id IN ({}) ORDER BY id",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_db_err)?;
        let mut chunks = self.chunks_for(ids).await?;

        rows.iter()
            .map(|row| {
                let id: i64 = row.get("id");
                document_from_row(row, chunks.remove(&id).unwrap_or_default())
            })
            .collect()
    }

    async fn delete_by_content_names(
        &self,
        bot_id: &str,
        content_names: &[String],
    ) -> Result<DeletedRows> {
        if content_names.is_empty() {
            return Ok(DeletedRows::default());
        }
        let in_list = placeholders(content_names.len());
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let chunk_sql = format!(
            "SELECT COUNT(*) FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE bot_id = ? AND content_name IN ({}))",
            in_list
        );
        let mut count_query = sqlx::query_scalar::<_, i64>(&chunk_sql).bind(bot_id);
        for name in content_names {
            count_query = count_query.bind(name);
        }
        let chunks = count_query.fetch_one(&mut *tx).await.map_err(map_db_err)?;

        let delete_sql = format!(
            "DELETE FROM documents WHERE bot_id = ? AND content_name IN ({})",
            in_list
        );
        let mut delete_query = sqlx::query(&delete_sql).bind(bot_id);
        for name in content_names {
            delete_query = delete_query.bind(name);
        }
        let deleted = delete_query.execute(&mut *tx).await.map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(DeletedRows {
            documents: deleted.rows_affected(),
            chunks: chunks as u64,
        })
    }

    async fn delete_bot_data(&self, bot_id: &str) -> Result<DeletedRows> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE bot_id = ?)",
        )
        .bind(bot_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let deleted = sqlx::query("DELETE FROM documents WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        sqlx::query("DELETE FROM bots WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

        tx.commit().await.map_err(map_db_err)?;
        Ok(DeletedRows {
            documents: deleted.rows_affected(),
            chunks: chunks as u64,
        })
    }

    async fn register_bot(&self, account_id: &str, bot_id: &str, bot_name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO bots (bot_id, account_id, bot_name, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(bot_id) DO NOTHING
            "#,
        )
        .bind(bot_id)
        .bind(account_id)
        .bind(bot_name)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn bot_stats(&self, bot_id: &str) -> Result<BotStats> {
        let registered: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM bots WHERE bot_id = ?")
                .bind(bot_id)
                .fetch_one(&self.pool)
                .await
                .map_err(map_db_err)?;
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)?;
        let chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE bot_id = ?)",
        )
        .bind(bot_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(BotStats {
            bot_id: bot_id.to_string(),
            registered,
            documents: documents as u64,
            chunks: chunks as u64,
        })
    }
}
