//! Default values for configuration

/// Default indexing backend URL for local development
pub fn default_indexer_url() -> String {
    std::env::var("ARCHIVIST_INDEXER_URL").unwrap_or_else(|_| "http://127.0.0.1:8108".to_string())
}

/// Default environment variable name for the indexer API key
pub fn default_indexer_api_key_env() -> String {
    "".to_string()
}

/// Default indexer request timeout in seconds
pub fn default_indexer_timeout() -> u64 {
    30
}

/// Default number of sync workers
pub fn default_sync_workers() -> usize {
    4
}

/// Default attempt ceiling before a job is exhausted
pub fn default_sync_max_attempts() -> u32 {
    5
}

/// Default base delay for retry backoff in milliseconds
pub fn default_sync_backoff_base_ms() -> u64 {
    500
}

/// Default cap for retry backoff in milliseconds
pub fn default_sync_backoff_cap_ms() -> u64 {
    60_000
}

/// Default idle poll interval for workers in milliseconds
pub fn default_sync_poll_interval_ms() -> u64 {
    250
}
