//! Versioned document storage using SQLite
//!
//! This module owns the documents table: content identity (blake3 hash),
//! the version counter, lifecycle status, and the sync-facing fields the
//! worker pool maintains (`external_document_id`, `sync_status`).
//!
//! The version counter and the content hash change together and only
//! together. Content writes are guarded by an optimistic version check,
//! so two concurrent writers can never silently overwrite each other:
//! the loser gets `Error::Conflict` and must retry against the fresh
//! version.

mod schema;

pub use schema::*;

use crate::config::Config;
use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

/// Compute the content hash for a document body
pub fn compute_content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Application-level document lifecycle, distinct from sync status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Active,
    Archived,
    Deleted,
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentStatus::Active => write!(f, "active"),
            DocumentStatus::Archived => write!(f, "archived"),
            DocumentStatus::Deleted => write!(f, "deleted"),
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(DocumentStatus::Active),
            "archived" => Ok(DocumentStatus::Archived),
            "deleted" => Ok(DocumentStatus::Deleted),
            _ => Err(Error::Validation(format!("Unknown document status: {}", s))),
        }
    }
}

/// Document-side view of sync health, maintained by the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocSyncStatus {
    NeverSynced,
    Queued,
    Syncing,
    Synced,
    SyncFailed,
}

impl std::fmt::Display for DocSyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocSyncStatus::NeverSynced => write!(f, "never_synced"),
            DocSyncStatus::Queued => write!(f, "queued"),
            DocSyncStatus::Syncing => write!(f, "syncing"),
            DocSyncStatus::Synced => write!(f, "synced"),
            DocSyncStatus::SyncFailed => write!(f, "sync_failed"),
        }
    }
}

impl FromStr for DocSyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "never_synced" => Ok(DocSyncStatus::NeverSynced),
            "queued" => Ok(DocSyncStatus::Queued),
            "syncing" => Ok(DocSyncStatus::Syncing),
            "synced" => Ok(DocSyncStatus::Synced),
            "sync_failed" => Ok(DocSyncStatus::SyncFailed),
            _ => Err(Error::Validation(format!("Unknown sync status: {}", s))),
        }
    }
}

/// A knowledge document row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub knowledge_base_id: String,
    pub file_name: String,
    pub file_path: String,
    pub mime_type: Option<String>,
    pub content: String,
    pub content_hash: String,
    pub version: i64,
    pub status: String,
    pub sync_status: String,
    pub external_document_id: Option<String>,
    pub read_count: i64,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Document {
    pub fn get_status(&self) -> Result<DocumentStatus> {
        self.status.parse()
    }

    pub fn get_sync_status(&self) -> Result<DocSyncStatus> {
        self.sync_status.parse()
    }

    pub fn is_deleted(&self) -> bool {
        self.status == DocumentStatus::Deleted.to_string()
    }
}

/// Parameters for creating a document
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub knowledge_base_id: String,
    pub file_name: String,
    pub file_path: String,
    pub mime_type: Option<String>,
    pub content: String,
    pub created_by: Option<String>,
}

/// Outcome of a content write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentUpdate {
    /// Version after the write (unchanged when the hash matched)
    pub version: i64,
    /// Whether the content hash actually changed. Callers must not
    /// enqueue a sync job when this is false.
    pub hash_changed: bool,
}

/// Document store handle
#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    /// Connect to the archive database
    pub async fn connect(config: &Config) -> Result<Self> {
        let db_path = &config.paths.db_file;

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        debug!("Connecting to SQLite database at {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (shared with the tag index and job ledger)
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for constructing sibling components
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn init_schema(&self) -> Result<()> {
        info!("Initializing database schema");
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Check if the database is initialized
    pub async fn is_initialized(&self) -> Result<bool> {
        let result: Option<(i32,)> =
            sqlx::query_as("SELECT 1 FROM sqlite_master WHERE type='table' AND name='documents'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(result.is_some())
    }

    /// Create a new document at version 1
    pub async fn create_document(&self, new: NewDocument) -> Result<Document> {
        if new.content.is_empty() {
            return Err(Error::Validation("Document content is empty".to_string()));
        }

        let now = Utc::now().to_rfc3339();
        let doc = Document {
            id: Uuid::new_v4().to_string(),
            knowledge_base_id: new.knowledge_base_id,
            file_name: new.file_name,
            file_path: new.file_path,
            mime_type: new.mime_type,
            content_hash: compute_content_hash(&new.content),
            content: new.content,
            version: 1,
            status: DocumentStatus::Active.to_string(),
            sync_status: DocSyncStatus::NeverSynced.to_string(),
            external_document_id: None,
            read_count: 0,
            created_by: new.created_by.clone(),
            updated_by: new.created_by,
            created_at: now.clone(),
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO documents
                (id, knowledge_base_id, file_name, file_path, mime_type, content,
                 content_hash, version, status, sync_status, external_document_id,
                 read_count, created_by, updated_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.knowledge_base_id)
        .bind(&doc.file_name)
        .bind(&doc.file_path)
        .bind(&doc.mime_type)
        .bind(&doc.content)
        .bind(&doc.content_hash)
        .bind(doc.version)
        .bind(&doc.status)
        .bind(&doc.sync_status)
        .bind(&doc.external_document_id)
        .bind(doc.read_count)
        .bind(&doc.created_by)
        .bind(&doc.updated_by)
        .bind(&doc.created_at)
        .bind(&doc.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Created document {} at version 1", doc.id);
        Ok(doc)
    }

    /// Replace document content, guarded by an optimistic version check.
    ///
    /// Returns the new version. Fails with `Error::Conflict` when the
    /// stored version no longer matches `expected_version`.
    pub async fn replace_content(
        &self,
        document_id: &str,
        expected_version: i64,
        content: &str,
        updated_by: Option<&str>,
    ) -> Result<i64> {
        let hash = compute_content_hash(content);
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET content = ?, content_hash = ?, version = version + 1,
                updated_by = COALESCE(?, updated_by), updated_at = ?
            WHERE id = ? AND version = ? AND status != 'deleted'
            "#,
        )
        .bind(content)
        .bind(&hash)
        .bind(updated_by)
        .bind(Utc::now().to_rfc3339())
        .bind(document_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict {
                document_id: document_id.to_string(),
                expected_version,
            });
        }

        Ok(expected_version + 1)
    }

    /// Write new content for a document.
    ///
    /// An unchanged content hash is an idempotent no-op: no version
    /// bump, `hash_changed = false`, and callers must not enqueue a
    /// sync job. A changed hash bumps the version exactly once.
    pub async fn upsert_content(
        &self,
        document_id: &str,
        content: &str,
        updated_by: Option<&str>,
    ) -> Result<ContentUpdate> {
        if content.is_empty() {
            return Err(Error::Validation("Document content is empty".to_string()));
        }

        let doc = self
            .get_document(document_id)
            .await?
            .ok_or_else(|| Error::DocumentNotFound(document_id.to_string()))?;

        if doc.is_deleted() {
            return Err(Error::Validation(format!(
                "Document {} is deleted",
                document_id
            )));
        }

        let hash = compute_content_hash(content);
        if hash == doc.content_hash {
            debug!("Content unchanged for document {}, skipping", document_id);
            return Ok(ContentUpdate {
                version: doc.version,
                hash_changed: false,
            });
        }

        let version = self
            .replace_content(document_id, doc.version, content, updated_by)
            .await?;

        debug!("Document {} updated to version {}", document_id, version);
        Ok(ContentUpdate {
            version,
            hash_changed: true,
        })
    }

    /// Soft-delete a document. The row is kept so historical jobs and
    /// tag edges stay referentially valid.
    pub async fn mark_deleted(&self, document_id: &str, updated_by: Option<&str>) -> Result<()> {
        self.set_status(document_id, DocumentStatus::Deleted, updated_by)
            .await
    }

    /// Archive a document
    pub async fn archive(&self, document_id: &str, updated_by: Option<&str>) -> Result<()> {
        self.set_status(document_id, DocumentStatus::Archived, updated_by)
            .await
    }

    /// Restore an archived document to active
    pub async fn restore(&self, document_id: &str, updated_by: Option<&str>) -> Result<()> {
        self.set_status(document_id, DocumentStatus::Active, updated_by)
            .await
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
        updated_by: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = ?, updated_by = COALESCE(?, updated_by), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(updated_by)
        .bind(Utc::now().to_rfc3339())
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::DocumentNotFound(document_id.to_string()));
        }

        debug!("Document {} status set to {}", document_id, status);
        Ok(())
    }

    /// Record the external id issued by the indexing backend.
    ///
    /// Written at most once per external lifetime: a second call while
    /// an id is present is ignored, so a crash-and-retry around a
    /// successful create never re-assigns the correlation.
    pub async fn record_external_id(&self, document_id: &str, external_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET external_document_id = ?, updated_at = ?
            WHERE id = ? AND external_document_id IS NULL
            "#,
        )
        .bind(external_id)
        .bind(Utc::now().to_rfc3339())
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Clear the external id after a successful delete sync, allowing a
    /// recreated document to be issued a fresh one.
    pub async fn clear_external_id(&self, document_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET external_document_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Update the document-side sync status mirror
    pub async fn set_sync_status(&self, document_id: &str, status: DocSyncStatus) -> Result<()> {
        sqlx::query("UPDATE documents SET sync_status = ?, updated_at = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Bump the read counter. Telemetry only; nothing in the sync
    /// pipeline consults it.
    pub async fn increment_read_count(&self, document_id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET read_count = read_count + 1 WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Get a document by id
    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>("SELECT * FROM documents WHERE id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(doc)
    }

    /// List documents in a knowledge base, newest first
    pub async fn list_documents(&self, knowledge_base_id: &str) -> Result<Vec<Document>> {
        let docs = sqlx::query_as::<_, Document>(
            "SELECT * FROM documents WHERE knowledge_base_id = ? ORDER BY created_at DESC",
        )
        .bind(knowledge_base_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_store() -> (DocumentStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));

        let store = DocumentStore::connect(&config).await.unwrap();
        store.init_schema().await.unwrap();
        (store, tmp)
    }

    fn sample_doc(content: &str) -> NewDocument {
        NewDocument {
            knowledge_base_id: "kb-1".to_string(),
            file_name: "guide.md".to_string(),
            file_path: "/kb/guide.md".to_string(),
            mime_type: Some("text/markdown".to_string()),
            content: content.to_string(),
            created_by: Some("user-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_document() {
        let (store, _tmp) = setup_test_store().await;

        let doc = store.create_document(sample_doc("hello")).await.unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.content_hash, compute_content_hash("hello"));
        assert_eq!(doc.get_status().unwrap(), DocumentStatus::Active);
        assert_eq!(doc.get_sync_status().unwrap(), DocSyncStatus::NeverSynced);
        assert!(doc.external_document_id.is_none());

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "hello");
    }

    #[tokio::test]
    async fn test_unchanged_content_is_noop() {
        let (store, _tmp) = setup_test_store().await;
        let doc = store.create_document(sample_doc("same")).await.unwrap();

        let update = store.upsert_content(&doc.id, "same", None).await.unwrap();
        assert!(!update.hash_changed);
        assert_eq!(update.version, 1);

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.content_hash, doc.content_hash);
    }

    #[tokio::test]
    async fn test_changed_content_bumps_version_once() {
        let (store, _tmp) = setup_test_store().await;
        let doc = store.create_document(sample_doc("v1")).await.unwrap();

        let update = store.upsert_content(&doc.id, "v2", None).await.unwrap();
        assert!(update.hash_changed);
        assert_eq!(update.version, 2);

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.content_hash, compute_content_hash("v2"));
        // Version and hash moved together
        assert_ne!(loaded.content_hash, doc.content_hash);
    }

    #[tokio::test]
    async fn test_stale_version_write_conflicts() {
        let (store, _tmp) = setup_test_store().await;
        let doc = store.create_document(sample_doc("base")).await.unwrap();

        // Winner moves the document to version 2
        store
            .replace_content(&doc.id, 1, "winner", None)
            .await
            .unwrap();

        // Loser still believes version 1
        let err = store
            .replace_content(&doc.id, 1, "loser", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.content, "winner");
        assert_eq!(loaded.version, 2);
    }

    #[tokio::test]
    async fn test_deleted_document_rejects_content() {
        let (store, _tmp) = setup_test_store().await;
        let doc = store.create_document(sample_doc("body")).await.unwrap();

        store.mark_deleted(&doc.id, None).await.unwrap();
        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert!(loaded.is_deleted());

        let err = store.upsert_content(&doc.id, "new", None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_external_id_written_once() {
        let (store, _tmp) = setup_test_store().await;
        let doc = store.create_document(sample_doc("body")).await.unwrap();

        store.record_external_id(&doc.id, "ext-1").await.unwrap();
        // A retry after a crash between adapter success and ledger
        // update must not reassign the correlation
        store.record_external_id(&doc.id, "ext-2").await.unwrap();

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_document_id.as_deref(), Some("ext-1"));

        // After a delete sync the id is cleared and may be reissued
        store.clear_external_id(&doc.id).await.unwrap();
        store.record_external_id(&doc.id, "ext-3").await.unwrap();
        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_document_id.as_deref(), Some("ext-3"));
    }

    #[tokio::test]
    async fn test_read_count_is_inert() {
        let (store, _tmp) = setup_test_store().await;
        let doc = store.create_document(sample_doc("body")).await.unwrap();

        store.increment_read_count(&doc.id).await.unwrap();
        store.increment_read_count(&doc.id).await.unwrap();

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.read_count, 2);
        // No version or hash movement from telemetry
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.content_hash, doc.content_hash);
    }
}
