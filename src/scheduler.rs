//! Sync scheduler
//!
//! Invoked after every confirmed content change or lifecycle
//! transition. Maintains the at-most-one-open-job-per-document
//! invariant: rapid successive edits collapse into the single open job
//! so the indexing backend only ever sees the final state.

use crate::error::Result;
use crate::ledger::{JobKind, JobLedger, JobState};
use crate::store::{DocSyncStatus, DocumentStore};
use tracing::debug;

/// Sync scheduler handle
#[derive(Clone)]
pub struct SyncScheduler {
    store: DocumentStore,
    ledger: JobLedger,
}

impl SyncScheduler {
    pub fn new(store: DocumentStore, ledger: JobLedger) -> Self {
        Self { store, ledger }
    }

    /// React to a document change by enqueueing, collapsing, or
    /// deferring to the running job's completion re-check.
    ///
    /// Callers invoke this only after `upsert_content` reported
    /// `hash_changed = true` or after a lifecycle transition; an
    /// unchanged write never reaches the ledger.
    pub async fn on_document_changed(&self, document_id: &str) -> Result<()> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| crate::error::Error::DocumentNotFound(document_id.to_string()))?;

        let kind = if doc.is_deleted() {
            JobKind::Delete
        } else if doc.external_document_id.is_none() {
            JobKind::Create
        } else {
            JobKind::Update
        };

        // A document deleted before its first successful create has
        // nothing external to remove
        let nothing_to_sync = kind == JobKind::Delete && doc.external_document_id.is_none();

        match self.ledger.find_open(document_id).await? {
            Some(job) if job.get_state()? == JobState::Running => {
                // The running worker re-checks the document hash on
                // completion and re-invokes us if it moved
                debug!(
                    "Document {} changed while job {} is running, deferring",
                    document_id, job.id
                );
            }
            Some(job) => {
                if nothing_to_sync {
                    self.ledger.mark_stale(&job.id).await?;
                    debug!(
                        "Open job {} for never-synced deleted document {} marked stale",
                        job.id, document_id
                    );
                    return Ok(());
                }

                let collapsed = self
                    .ledger
                    .collapse(&job.id, kind, &doc.content_hash)
                    .await?;
                if collapsed {
                    debug!(
                        "Collapsed job {} for document {} into {} at {}",
                        job.id, document_id, kind, doc.content_hash
                    );
                    self.store
                        .set_sync_status(document_id, DocSyncStatus::Queued)
                        .await?;
                }
                // Lost the race against a claim: the staleness gate at
                // execution time picks the change up instead
            }
            None => {
                if nothing_to_sync {
                    return Ok(());
                }

                self.ledger
                    .enqueue(document_id, kind, &doc.content_hash)
                    .await?;
                self.store
                    .set_sync_status(document_id, DocSyncStatus::Queued)
                    .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger::SyncJob;
    use crate::store::{compute_content_hash, NewDocument};
    use tempfile::TempDir;

    async fn setup() -> (DocumentStore, JobLedger, SyncScheduler, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));

        let store = DocumentStore::connect(&config).await.unwrap();
        store.init_schema().await.unwrap();
        let ledger = JobLedger::new(store.pool().clone());
        let scheduler = SyncScheduler::new(store.clone(), ledger.clone());
        (store, ledger, scheduler, tmp)
    }

    async fn make_doc(store: &DocumentStore, content: &str) -> crate::store::Document {
        store
            .create_document(NewDocument {
                knowledge_base_id: "kb-1".to_string(),
                file_name: "a.md".to_string(),
                file_path: "/kb/a.md".to_string(),
                mime_type: None,
                content: content.to_string(),
                created_by: None,
            })
            .await
            .unwrap()
    }

    async fn open_jobs(ledger: &JobLedger, document_id: &str) -> Vec<SyncJob> {
        ledger
            .history(document_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| !j.get_state().unwrap().is_terminal())
            .collect()
    }

    #[tokio::test]
    async fn test_first_change_enqueues_create() {
        let (store, ledger, scheduler, _tmp) = setup().await;
        let doc = make_doc(&store, "v1").await;

        scheduler.on_document_changed(&doc.id).await.unwrap();

        let open = open_jobs(&ledger, &doc.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].get_kind().unwrap(), JobKind::Create);
        assert_eq!(open[0].content_hash_at_enqueue, doc.content_hash);

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.get_sync_status().unwrap(), DocSyncStatus::Queued);
    }

    #[tokio::test]
    async fn test_rapid_edits_collapse_to_one_job() {
        let (store, ledger, scheduler, _tmp) = setup().await;
        let doc = make_doc(&store, "v1").await;
        scheduler.on_document_changed(&doc.id).await.unwrap();

        // Five rapid edits while no worker is free
        for i in 2..=6 {
            store
                .upsert_content(&doc.id, &format!("v{}", i), None)
                .await
                .unwrap();
            scheduler.on_document_changed(&doc.id).await.unwrap();
        }

        let open = open_jobs(&ledger, &doc.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(
            open[0].content_hash_at_enqueue,
            compute_content_hash("v6")
        );
        // Never synced, so the collapsed job is still a create
        assert_eq!(open[0].get_kind().unwrap(), JobKind::Create);
    }

    #[tokio::test]
    async fn test_synced_document_gets_update_job() {
        let (store, ledger, scheduler, _tmp) = setup().await;
        let doc = make_doc(&store, "v1").await;
        store.record_external_id(&doc.id, "ext-1").await.unwrap();

        store.upsert_content(&doc.id, "v2", None).await.unwrap();
        scheduler.on_document_changed(&doc.id).await.unwrap();

        let open = open_jobs(&ledger, &doc.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].get_kind().unwrap(), JobKind::Update);
    }

    #[tokio::test]
    async fn test_delete_collapses_pending_update_into_delete() {
        let (store, ledger, scheduler, _tmp) = setup().await;
        let doc = make_doc(&store, "v1").await;
        store.record_external_id(&doc.id, "ext-1").await.unwrap();

        store.upsert_content(&doc.id, "v2", None).await.unwrap();
        scheduler.on_document_changed(&doc.id).await.unwrap();

        store.mark_deleted(&doc.id, None).await.unwrap();
        scheduler.on_document_changed(&doc.id).await.unwrap();

        let open = open_jobs(&ledger, &doc.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].get_kind().unwrap(), JobKind::Delete);
    }

    #[tokio::test]
    async fn test_delete_before_first_sync_goes_stale() {
        let (store, ledger, scheduler, _tmp) = setup().await;
        let doc = make_doc(&store, "v1").await;
        scheduler.on_document_changed(&doc.id).await.unwrap();

        store.mark_deleted(&doc.id, None).await.unwrap();
        scheduler.on_document_changed(&doc.id).await.unwrap();

        // No external document exists, so nothing is left to sync
        assert!(open_jobs(&ledger, &doc.id).await.is_empty());
        assert_eq!(
            ledger.sync_status(&doc.id).await.unwrap(),
            Some(JobState::Stale)
        );
    }

    #[tokio::test]
    async fn test_running_job_is_left_alone() {
        let (store, ledger, scheduler, _tmp) = setup().await;
        let doc = make_doc(&store, "v1").await;
        scheduler.on_document_changed(&doc.id).await.unwrap();

        let claimed = ledger.claim_next().await.unwrap().unwrap();

        store.upsert_content(&doc.id, "v2", None).await.unwrap();
        scheduler.on_document_changed(&doc.id).await.unwrap();

        // Still exactly one open job, untouched by the change
        let open = open_jobs(&ledger, &doc.id).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, claimed.id);
        assert_eq!(open[0].get_state().unwrap(), JobState::Running);
        assert_eq!(
            open[0].content_hash_at_enqueue,
            compute_content_hash("v1")
        );
    }
}
