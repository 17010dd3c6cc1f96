//! External indexing adapter
//!
//! The sync pipeline talks to the indexing backend exclusively through
//! the [`Indexer`] trait: create, update, delete. Implementations
//! report failures through [`SyncError`] so the worker pool can branch
//! on the transient/permanent kind without inspecting messages.
//!
//! Implementations must not retry internally; retry policy lives in
//! the worker pool.

mod http;

pub use http::HttpIndexer;

use crate::error::SyncResult;
use crate::store::Document;
use async_trait::async_trait;
use serde::Serialize;

/// Document payload sent to the indexing backend
#[derive(Debug, Clone, Serialize)]
pub struct IndexDocument {
    pub document_id: String,
    pub knowledge_base_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub content: String,
}

impl From<&Document> for IndexDocument {
    fn from(doc: &Document) -> Self {
        Self {
            document_id: doc.id.clone(),
            knowledge_base_id: doc.knowledge_base_id.clone(),
            file_name: doc.file_name.clone(),
            mime_type: doc.mime_type.clone(),
            content: doc.content.clone(),
        }
    }
}

/// Contract with the external indexing backend
#[async_trait]
pub trait Indexer: Send + Sync {
    /// Index a new document; returns the backend's correlation id
    async fn create_document(&self, doc: &IndexDocument) -> SyncResult<String>;

    /// Re-index an existing document under its correlation id
    async fn update_document(&self, external_id: &str, doc: &IndexDocument) -> SyncResult<()>;

    /// Remove a document from the index
    async fn delete_document(&self, external_id: &str) -> SyncResult<()>;
}
