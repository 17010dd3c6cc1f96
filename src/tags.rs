//! Tag association index
//!
//! Many-to-many links between documents and tags, keyed by
//! `(document_id, tag_id)`. Attach and detach are idempotent; no
//! ordering is guaranteed across a document's tags.
//!
//! Tag changes never notify the sync scheduler. The indexing backend
//! indexes document content only; if that changes, this component is
//! the place to add the notification.

use crate::error::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::debug;
use uuid::Uuid;

/// A tag row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub knowledge_base_id: String,
    pub name: String,
    pub created_at: String,
}

/// Tag index handle
#[derive(Clone)]
pub struct TagIndex {
    pool: SqlitePool,
}

impl TagIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a tag in a knowledge base. Names are unique per base.
    pub async fn create_tag(&self, knowledge_base_id: &str, name: &str) -> Result<Tag> {
        if name.trim().is_empty() {
            return Err(Error::Validation("Tag name is empty".to_string()));
        }

        let tag = Tag {
            id: Uuid::new_v4().to_string(),
            knowledge_base_id: knowledge_base_id.to_string(),
            name: name.to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        sqlx::query(
            "INSERT INTO tags (id, knowledge_base_id, name, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&tag.id)
        .bind(&tag.knowledge_base_id)
        .bind(&tag.name)
        .bind(&tag.created_at)
        .execute(&self.pool)
        .await?;

        Ok(tag)
    }

    /// Get a tag by id
    pub async fn get_tag(&self, tag_id: &str) -> Result<Option<Tag>> {
        let tag = sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE id = ?")
            .bind(tag_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(tag)
    }

    /// Find a tag by name within a knowledge base
    pub async fn get_tag_by_name(&self, knowledge_base_id: &str, name: &str) -> Result<Option<Tag>> {
        let tag =
            sqlx::query_as::<_, Tag>("SELECT * FROM tags WHERE knowledge_base_id = ? AND name = ?")
                .bind(knowledge_base_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(tag)
    }

    /// List all tags in a knowledge base
    pub async fn list_tags(&self, knowledge_base_id: &str) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            "SELECT * FROM tags WHERE knowledge_base_id = ? ORDER BY name",
        )
        .bind(knowledge_base_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    /// Delete a tag and all its document edges
    pub async fn delete_tag(&self, tag_id: &str) -> Result<()> {
        // Edges first, then the tag row
        sqlx::query("DELETE FROM document_tags WHERE tag_id = ?")
            .bind(tag_id)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query("DELETE FROM tags WHERE id = ?")
            .bind(tag_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TagNotFound(tag_id.to_string()));
        }

        debug!("Deleted tag {}", tag_id);
        Ok(())
    }

    /// Remove all tag edges for a document (used when a document row is
    /// purged by external retention tooling; the pipeline itself only
    /// soft-deletes)
    pub async fn detach_all(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Attach a tag to a document. Succeeds silently if the pair
    /// already exists.
    pub async fn attach(&self, document_id: &str, tag_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO document_tags (document_id, tag_id, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(document_id)
        .bind(tag_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Detach a tag from a document. No-op if the pair is absent.
    pub async fn detach(&self, document_id: &str, tag_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM document_tags WHERE document_id = ? AND tag_id = ?")
            .bind(document_id)
            .bind(tag_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Tags attached to a document
    pub async fn tags_of(&self, document_id: &str) -> Result<Vec<Tag>> {
        let tags = sqlx::query_as::<_, Tag>(
            r#"
            SELECT t.* FROM tags t
            JOIN document_tags dt ON dt.tag_id = t.id
            WHERE dt.document_id = ?
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    /// Document ids carrying a tag
    pub async fn documents_with_tag(&self, tag_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT document_id FROM document_tags WHERE tag_id = ?")
                .bind(tag_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
