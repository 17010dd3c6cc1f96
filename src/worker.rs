//! Sync worker pool
//!
//! A fixed-size set of tokio tasks drains the job ledger: claim the
//! FIFO head, gate on staleness, call the indexing adapter, and apply
//! the state-machine transitions. Adapter failures are recorded in the
//! ledger and never propagate to document writers.
//!
//! Retry backoff is exponential with jitter so a degraded backend is
//! not hammered in lockstep. An optional global throttle caps adapter
//! calls per second across all workers, independent of pool size.

use crate::config::SyncConfig;
use crate::error::Result;
use crate::indexer::{IndexDocument, Indexer};
use crate::ledger::{JobKind, JobLedger, JobState, SyncJob};
use crate::scheduler::SyncScheduler;
use crate::store::{DocSyncStatus, Document, DocumentStore};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Seam for capping adapter call volume. The pool acquires a permit
/// before every adapter call; implementations decide what that means.
#[async_trait]
pub trait Throttle: Send + Sync {
    async fn acquire(&self);
}

/// Global requests-per-second limiter over all workers
pub struct RateLimit {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl RateLimit {
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_second(rps);
        Self {
            limiter: RateLimiter::direct(quota),
        }
    }
}

#[async_trait]
impl Throttle for RateLimit {
    async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

/// Delay before the next attempt after `attempts_so_far` failures:
/// exponential growth from the configured base, capped, with uniform
/// jitter of up to half the delay
pub fn retry_backoff(config: &SyncConfig, attempts_so_far: i64) -> Duration {
    let exp = attempts_so_far.clamp(0, 20) as u32;
    let base = config
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.backoff_cap_ms);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis((base + jitter).min(config.backoff_cap_ms))
}

/// Worker pool handle
#[derive(Clone)]
pub struct WorkerPool {
    store: DocumentStore,
    ledger: JobLedger,
    scheduler: SyncScheduler,
    indexer: Arc<dyn Indexer>,
    config: SyncConfig,
    throttle: Option<Arc<dyn Throttle>>,
}

impl WorkerPool {
    pub fn new(
        store: DocumentStore,
        ledger: JobLedger,
        scheduler: SyncScheduler,
        indexer: Arc<dyn Indexer>,
        config: SyncConfig,
    ) -> Self {
        let throttle: Option<Arc<dyn Throttle>> = config
            .max_requests_per_sec
            .map(|rps| Arc::new(RateLimit::new(rps)) as Arc<dyn Throttle>);
        Self {
            store,
            ledger,
            scheduler,
            indexer,
            config,
            throttle,
        }
    }

    /// Replace the throttle (e.g. a limiter shared with other clients
    /// of the same backend)
    pub fn with_throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Run the pool until shutdown is signalled
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.ledger.recover_interrupted().await?;

        info!("Starting {} sync workers", self.config.workers);
        let mut handles = Vec::new();
        for worker_id in 0..self.config.workers {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("Worker pool stopped");
        Ok(())
    }

    /// Process jobs on the current task until the ledger is empty.
    /// Waits out retry backoffs, so exhaustion or success is always
    /// reached.
    pub async fn drain(&self) -> Result<()> {
        self.ledger.recover_interrupted().await?;

        loop {
            self.ledger
                .release_retries(self.config.max_attempts)
                .await?;

            if let Some(job) = self.ledger.claim_next().await? {
                self.execute(job).await?;
                continue;
            }

            if self.ledger.open_job_count().await? == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
        Ok(())
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!("Worker {} started", worker_id);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let claimed = match self.claim().await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!("Worker {}: claim failed: {}", worker_id, e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            match claimed {
                Some(job) => {
                    if let Err(e) = self.execute(job).await {
                        warn!("Worker {}: job execution failed: {}", worker_id, e);
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
            }
        }
        debug!("Worker {} stopped", worker_id);
    }

    async fn claim(&self) -> Result<Option<SyncJob>> {
        self.ledger
            .release_retries(self.config.max_attempts)
            .await?;
        self.ledger.claim_next().await
    }

    /// Execute one claimed job. Adapter failures are absorbed into the
    /// ledger; only storage errors surface.
    async fn execute(&self, job: SyncJob) -> Result<()> {
        let kind = job.get_kind()?;

        let doc = match self.store.get_document(&job.document_id).await? {
            Some(doc) => doc,
            None => {
                // Row purged by external retention tooling
                warn!(
                    "Document {} gone, abandoning job {}",
                    job.document_id, job.id
                );
                self.ledger.mark_stale(&job.id).await?;
                return Ok(());
            }
        };

        // Supersession gates: the snapshot this job carries may no
        // longer describe the document. Abandon without an adapter
        // call and let the scheduler derive a fresh job.
        let superseded = match kind {
            JobKind::Delete => false,
            _ if doc.is_deleted() => true,
            _ if job.content_hash_at_enqueue != doc.content_hash => true,
            JobKind::Create => doc.external_document_id.is_some(),
            JobKind::Update => doc.external_document_id.is_none(),
        };
        if superseded {
            debug!("Job {} superseded, marking stale", job.id);
            self.ledger.mark_stale(&job.id).await?;
            self.scheduler.on_document_changed(&job.document_id).await?;
            return Ok(());
        }

        // A delete for a document that never reached the backend is
        // already in the desired external state
        if kind == JobKind::Delete && doc.external_document_id.is_none() {
            self.ledger.mark_succeeded(&job.id).await?;
            self.store
                .set_sync_status(&doc.id, DocSyncStatus::Synced)
                .await?;
            return Ok(());
        }

        self.store
            .set_sync_status(&doc.id, DocSyncStatus::Syncing)
            .await?;

        if let Some(throttle) = &self.throttle {
            throttle.acquire().await;
        }

        let outcome = self.call_adapter(kind, &doc).await;

        match outcome {
            Ok(external_id) => {
                // Persist the correlation id before the succeeded
                // transition; recover_interrupted plus the staleness
                // gates make a crash between the two safe
                match kind {
                    JobKind::Create => {
                        if let Some(external_id) = &external_id {
                            self.store.record_external_id(&doc.id, external_id).await?;
                        }
                    }
                    JobKind::Delete => {
                        self.store.clear_external_id(&doc.id).await?;
                    }
                    JobKind::Update => {}
                }
                self.ledger.mark_succeeded(&job.id).await?;
                self.store
                    .set_sync_status(&doc.id, DocSyncStatus::Synced)
                    .await?;
                debug!("Job {} succeeded for document {}", job.id, doc.id);

                self.recheck_after_completion(&job, kind).await?;
            }
            Err(e) if e.is_transient() => {
                let backoff = retry_backoff(&self.config, job.attempt);
                let state = self
                    .ledger
                    .mark_failed(&job.id, &e.to_string(), self.config.max_attempts, backoff)
                    .await?;
                if state == JobState::Exhausted {
                    warn!(
                        "Job {} exhausted after {} attempts: {}",
                        job.id,
                        job.attempt + 1,
                        e
                    );
                    self.store
                        .set_sync_status(&doc.id, DocSyncStatus::SyncFailed)
                        .await?;
                }
            }
            Err(e) => {
                warn!("Job {} permanently failed: {}", job.id, e);
                self.ledger.mark_exhausted(&job.id, &e.to_string()).await?;
                self.store
                    .set_sync_status(&doc.id, DocSyncStatus::SyncFailed)
                    .await?;
            }
        }

        Ok(())
    }

    async fn call_adapter(
        &self,
        kind: JobKind,
        doc: &Document,
    ) -> crate::error::SyncResult<Option<String>> {
        let payload = IndexDocument::from(doc);
        match kind {
            JobKind::Create => {
                let external_id = self.indexer.create_document(&payload).await?;
                Ok(Some(external_id))
            }
            JobKind::Update => {
                // Presence checked by the supersession gate
                let external_id = doc.external_document_id.as_deref().unwrap_or_default();
                self.indexer.update_document(external_id, &payload).await?;
                Ok(None)
            }
            JobKind::Delete => {
                let external_id = doc.external_document_id.as_deref().unwrap_or_default();
                self.indexer.delete_document(external_id).await?;
                Ok(None)
            }
        }
    }

    /// The document may have moved on while the adapter call was in
    /// flight; if what was just synced no longer matches, hand the
    /// document back to the scheduler.
    async fn recheck_after_completion(&self, job: &SyncJob, kind: JobKind) -> Result<()> {
        let current = match self.store.get_document(&job.document_id).await? {
            Some(doc) => doc,
            None => return Ok(()),
        };

        let needs_follow_up = match kind {
            JobKind::Delete => !current.is_deleted(),
            _ => current.is_deleted() || current.content_hash != job.content_hash_at_enqueue,
        };

        if needs_follow_up {
            debug!(
                "Document {} changed while job {} ran, rescheduling",
                job.document_id, job.id
            );
            self.scheduler.on_document_changed(&job.document_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{SyncError, SyncResult};
    use crate::store::{compute_content_hash, NewDocument};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted outcome for one adapter call
    enum MockOutcome {
        Ok,
        Transient(&'static str),
        Permanent(&'static str),
    }

    /// Adapter double: scripted failures, call log, and per-document
    /// concurrency tracking
    struct MockIndexer {
        script: Mutex<VecDeque<MockOutcome>>,
        calls: Mutex<Vec<(String, String)>>,
        next_id: Mutex<u64>,
        active: Mutex<HashMap<String, usize>>,
        max_active_per_doc: Mutex<usize>,
        call_delay: Duration,
    }

    impl MockIndexer {
        fn new() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                next_id: Mutex::new(0),
                active: Mutex::new(HashMap::new()),
                max_active_per_doc: Mutex::new(0),
                call_delay: Duration::from_millis(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.call_delay = delay;
            self
        }

        fn script(self, outcomes: Vec<MockOutcome>) -> Self {
            *self.script.lock().unwrap() = outcomes.into();
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn calls_of(&self, op: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(o, _)| o == op)
                .count()
        }

        fn max_concurrency_per_doc(&self) -> usize {
            *self.max_active_per_doc.lock().unwrap()
        }

        fn enter(&self, key: &str) {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(key.to_string()).or_insert(0);
            *count += 1;
            let mut max = self.max_active_per_doc.lock().unwrap();
            if *count > *max {
                *max = *count;
            }
        }

        fn leave(&self, key: &str) {
            let mut active = self.active.lock().unwrap();
            if let Some(count) = active.get_mut(key) {
                *count -= 1;
            }
        }

        async fn record(&self, op: &str, key: &str) -> SyncResult<()> {
            self.enter(key);
            if self.call_delay > Duration::ZERO {
                tokio::time::sleep(self.call_delay).await;
            }
            self.calls
                .lock()
                .unwrap()
                .push((op.to_string(), key.to_string()));
            let outcome = self.script.lock().unwrap().pop_front();
            self.leave(key);
            match outcome {
                None | Some(MockOutcome::Ok) => Ok(()),
                Some(MockOutcome::Transient(msg)) => Err(SyncError::transient(msg)),
                Some(MockOutcome::Permanent(msg)) => Err(SyncError::permanent(msg)),
            }
        }
    }

    #[async_trait]
    impl Indexer for MockIndexer {
        async fn create_document(&self, doc: &IndexDocument) -> SyncResult<String> {
            self.record("create", &doc.document_id).await?;
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(format!("ext-{}", *next))
        }

        async fn update_document(&self, _external_id: &str, doc: &IndexDocument) -> SyncResult<()> {
            self.record("update", &doc.document_id).await
        }

        async fn delete_document(&self, external_id: &str) -> SyncResult<()> {
            self.record("delete", external_id).await
        }
    }

    struct Harness {
        store: DocumentStore,
        ledger: JobLedger,
        scheduler: SyncScheduler,
        indexer: Arc<MockIndexer>,
        pool: WorkerPool,
        _tmp: TempDir,
    }

    async fn setup(indexer: MockIndexer, max_attempts: u32) -> Harness {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.init_paths(Some(tmp.path().to_path_buf()));
        config.sync.max_attempts = max_attempts;
        config.sync.backoff_base_ms = 1;
        config.sync.backoff_cap_ms = 2;
        config.sync.poll_interval_ms = 5;

        let store = DocumentStore::connect(&config).await.unwrap();
        store.init_schema().await.unwrap();
        let ledger = JobLedger::new(store.pool().clone());
        let scheduler = SyncScheduler::new(store.clone(), ledger.clone());
        let indexer = Arc::new(indexer);
        let pool = WorkerPool::new(
            store.clone(),
            ledger.clone(),
            scheduler.clone(),
            indexer.clone(),
            config.sync.clone(),
        );

        Harness {
            store,
            ledger,
            scheduler,
            indexer,
            pool,
            _tmp: tmp,
        }
    }

    async fn make_doc(h: &Harness, content: &str) -> Document {
        h.store
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

    #[tokio::test]
    async fn test_create_then_update_lifecycle() {
        let h = setup(MockIndexer::new(), 3).await;
        let doc = make_doc(&h, "A").await;
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        let synced = h.store.get_document(&doc.id).await.unwrap().unwrap();
        assert!(synced.external_document_id.is_some());
        assert_eq!(synced.get_sync_status().unwrap(), DocSyncStatus::Synced);
        assert_eq!(synced.version, 1);
        assert_eq!(
            h.ledger.sync_status(&doc.id).await.unwrap(),
            Some(JobState::Succeeded)
        );
        assert_eq!(h.indexer.calls_of("create"), 1);

        // Update "A" -> "B" while no worker slot is free: exactly one
        // open job, kind update, carrying the hash of "B"
        h.store.upsert_content(&doc.id, "B", None).await.unwrap();
        h.scheduler.on_document_changed(&doc.id).await.unwrap();

        // Writing "B" again is a no-op: no version bump, no new job
        let update = h.store.upsert_content(&doc.id, "B", None).await.unwrap();
        assert!(!update.hash_changed);

        let open: Vec<_> = h
            .ledger
            .history(&doc.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| !j.get_state().unwrap().is_terminal())
            .collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].get_kind().unwrap(), JobKind::Update);
        assert_eq!(open[0].content_hash_at_enqueue, compute_content_hash("B"));

        h.pool.drain().await.unwrap();
        assert_eq!(h.indexer.calls_of("update"), 1);
        let synced = h.store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(synced.version, 2);
        assert_eq!(synced.get_sync_status().unwrap(), DocSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let indexer = MockIndexer::new().script(vec![
            MockOutcome::Transient("connection reset"),
            MockOutcome::Transient("connection reset"),
            MockOutcome::Ok,
        ]);
        let h = setup(indexer, 3).await;
        let doc = make_doc(&h, "A").await;
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        let jobs = h.ledger.history(&doc.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].get_state().unwrap(), JobState::Succeeded);
        // Two failed attempts counted before the succeeding one
        assert_eq!(jobs[0].attempt, 2);
        assert!(jobs[0].last_error.is_none());
        assert_eq!(h.indexer.call_count(), 3);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust() {
        let indexer = MockIndexer::new().script(vec![
            MockOutcome::Transient("boom"),
            MockOutcome::Transient("boom"),
            MockOutcome::Transient("boom"),
        ]);
        let h = setup(indexer, 3).await;
        let doc = make_doc(&h, "A").await;
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        let jobs = h.ledger.history(&doc.id).await.unwrap();
        assert_eq!(jobs[0].get_state().unwrap(), JobState::Exhausted);
        assert_eq!(jobs[0].attempt, 3);
        assert_eq!(h.indexer.call_count(), 3);

        let synced = h.store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(synced.get_sync_status().unwrap(), DocSyncStatus::SyncFailed);
        let failed = h.ledger.list_failed("kb-1").await.unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retry() {
        let indexer = MockIndexer::new().script(vec![MockOutcome::Permanent("rejected")]);
        let h = setup(indexer, 3).await;
        let doc = make_doc(&h, "A").await;
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        let jobs = h.ledger.history(&doc.id).await.unwrap();
        assert_eq!(jobs[0].get_state().unwrap(), JobState::Exhausted);
        assert_eq!(jobs[0].attempt, 1);
        assert_eq!(jobs[0].last_error.as_deref(), Some("permanent indexing failure: rejected"));
        assert_eq!(h.indexer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_job_skips_adapter_and_reschedules() {
        let h = setup(MockIndexer::new(), 3).await;
        let doc = make_doc(&h, "v2-will-supersede").await;

        // A job carrying an outdated snapshot hash
        let stale = h
            .ledger
            .enqueue(&doc.id, JobKind::Create, "outdated-hash")
            .await
            .unwrap();

        h.pool.drain().await.unwrap();

        let jobs = h.ledger.history(&doc.id).await.unwrap();
        let stale_job = jobs.iter().find(|j| j.id == stale.id).unwrap();
        assert_eq!(stale_job.get_state().unwrap(), JobState::Stale);

        // The follow-up job carried the current hash and was the only
        // adapter call made
        let follow_up = jobs.iter().find(|j| j.id != stale.id).unwrap();
        assert_eq!(follow_up.get_state().unwrap(), JobState::Succeeded);
        assert_eq!(follow_up.content_hash_at_enqueue, doc.content_hash);
        assert_eq!(h.indexer.call_count(), 1);
    }

    #[tokio::test]
    async fn test_deleted_while_queued_becomes_compensating_delete() {
        let h = setup(MockIndexer::new(), 3).await;
        let doc = make_doc(&h, "A").await;
        h.store.record_external_id(&doc.id, "ext-9").await.unwrap();

        // An update intent is queued, then the document is deleted
        // without the scheduler hearing about it
        h.store.upsert_content(&doc.id, "B", None).await.unwrap();
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.store.mark_deleted(&doc.id, None).await.unwrap();

        h.pool.drain().await.unwrap();

        assert_eq!(h.indexer.calls_of("update"), 0);
        assert_eq!(h.indexer.calls_of("delete"), 1);

        let synced = h.store.get_document(&doc.id).await.unwrap().unwrap();
        assert!(synced.external_document_id.is_none());
        assert_eq!(synced.get_sync_status().unwrap(), DocSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_delete_then_recreate_gets_fresh_external_id() {
        let h = setup(MockIndexer::new(), 3).await;
        let doc = make_doc(&h, "A").await;
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        let first_id = h
            .store
            .get_document(&doc.id)
            .await
            .unwrap()
            .unwrap()
            .external_document_id
            .unwrap();

        h.store.mark_deleted(&doc.id, None).await.unwrap();
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        h.store.restore(&doc.id, None).await.unwrap();
        h.store.upsert_content(&doc.id, "A2", None).await.unwrap();
        h.scheduler.on_document_changed(&doc.id).await.unwrap();
        h.pool.drain().await.unwrap();

        let second_id = h
            .store
            .get_document(&doc.id)
            .await
            .unwrap()
            .unwrap()
            .external_document_id
            .unwrap();
        assert_ne!(first_id, second_id);
        assert_eq!(h.indexer.calls_of("create"), 2);
        assert_eq!(h.indexer.calls_of("delete"), 1);
    }

    #[tokio::test]
    async fn test_pool_never_runs_one_document_twice_at_once() {
        let h = setup(
            MockIndexer::new().with_delay(Duration::from_millis(10)),
            3,
        )
        .await;

        let mut doc_ids = Vec::new();
        for i in 0..6 {
            let doc = h
                .store
                .create_document(NewDocument {
                    knowledge_base_id: "kb-1".to_string(),
                    file_name: format!("doc-{}.md", i),
                    file_path: format!("/kb/doc-{}.md", i),
                    mime_type: None,
                    content: format!("content {}", i),
                    created_by: None,
                })
                .await
                .unwrap();
            h.scheduler.on_document_changed(&doc.id).await.unwrap();
            doc_ids.push(doc.id);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = h.pool.clone();
        let runner = tokio::spawn(async move { pool.run(shutdown_rx).await });

        // Wait for the ledger to drain, then stop the pool
        loop {
            if h.ledger.open_job_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        assert_eq!(h.indexer.calls_of("create"), 6);
        assert_eq!(h.indexer.max_concurrency_per_doc(), 1);
        for doc_id in &doc_ids {
            assert_eq!(
                h.ledger.sync_status(doc_id).await.unwrap(),
                Some(JobState::Succeeded)
            );
        }
    }

    #[tokio::test]
    async fn test_throttle_seam_sees_every_adapter_call() {
        struct CountingThrottle {
            permits: Mutex<usize>,
        }

        #[async_trait]
        impl Throttle for CountingThrottle {
            async fn acquire(&self) {
                *self.permits.lock().unwrap() += 1;
            }
        }

        let throttle = Arc::new(CountingThrottle {
            permits: Mutex::new(0),
        });
        let h = setup(MockIndexer::new(), 3).await;
        let pool = h.pool.clone().with_throttle(throttle.clone());

        for i in 0..3 {
            let doc = h
                .store
                .create_document(NewDocument {
                    knowledge_base_id: "kb-1".to_string(),
                    file_name: format!("t-{}.md", i),
                    file_path: format!("/kb/t-{}.md", i),
                    mime_type: None,
                    content: format!("content {}", i),
                    created_by: None,
                })
                .await
                .unwrap();
            h.scheduler.on_document_changed(&doc.id).await.unwrap();
        }

        pool.drain().await.unwrap();
        assert_eq!(*throttle.permits.lock().unwrap(), h.indexer.call_count());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = SyncConfig {
            workers: 1,
            max_attempts: 5,
            backoff_base_ms: 100,
            backoff_cap_ms: 1000,
            poll_interval_ms: 10,
            max_requests_per_sec: None,
        };

        let first = retry_backoff(&config, 0);
        assert!(first >= Duration::from_millis(100));
        assert!(first <= Duration::from_millis(150));

        let second = retry_backoff(&config, 1);
        assert!(second >= Duration::from_millis(200));
        assert!(second <= Duration::from_millis(300));

        // Far past the cap, including jitter
        let late = retry_backoff(&config, 12);
        assert_eq!(late, Duration::from_millis(1000));
    }
}
