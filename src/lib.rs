//! archivist - versioned knowledge-document store with asynchronous
//! sync to an external indexing backend
//!
//! Documents are stored locally with a content hash and a version
//! counter; every accepted change is reconciled against the indexing
//! backend through a durable job ledger drained by a worker pool.
//! Rapid edits collapse into one job per document, retries back off
//! exponentially, and document writes never block on sync health.

pub mod config;
pub mod error;
pub mod indexer;
pub mod ledger;
pub mod scheduler;
pub mod store;
pub mod tags;
pub mod worker;
