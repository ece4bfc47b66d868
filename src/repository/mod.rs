//! Application repository
//!
//! Fetches catalogs of installable applications from the configured sources,
//! merges them by source priority, publishes the result and keeps it cached
//! on disk for offline starts.

mod archive;
mod cache;
mod catalog;
mod http;
mod manager;
mod source;
mod sqlite_cache;

pub use archive::{extract_catalog, ArchiveSource};
pub use cache::{open_cache, CacheBackend, JsonCatalogCache, RepositoryCache};
pub use catalog::{Catalog, CatalogEntry, ScriptLocation};
pub use http::{build_client, fetch_url, with_retry, HttpSource};
pub use manager::RepositoryManager;
pub use source::{
    build_source, is_url, LocalSource, RepositorySource, SourceConfig, SourceKind,
    CATALOG_FILE_NAME,
};
pub use sqlite_cache::SqliteCatalogCache;

use serde::Serialize;

use crate::pool::PoolError;

/// Repository errors surfaced to callers
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Repository source '{source_name}' is unreachable: {reason}")]
    SourceUnreachable { source_name: String, reason: String },

    #[error("No repository source succeeded and no cached catalog exists ({} sources failed)", .failures.len())]
    CatalogUnavailable { failures: Vec<SourceFailure> },

    #[error("Repository source '{0}' is configured more than once")]
    DuplicateSource(String),

    #[error("Invalid repository source '{source_name}': {reason}")]
    InvalidSource { source_name: String, reason: String },

    #[error("Catalog synchronization was cancelled")]
    Cancelled,

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// How `synchronize` runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Complete the synchronization before returning
    Synchronous,
    /// Submit to the worker pool and return immediately
    Background,
}

/// One source that could not contribute to a synchronization
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

impl SourceFailure {
    pub fn to_error(&self) -> RepositoryError {
        RepositoryError::SourceUnreachable {
            source_name: self.source.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Result of a completed synchronization
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Sources fetched and parsed successfully, in priority order
    pub fetched: Vec<String>,
    /// Sources that failed; their previous contribution was kept
    pub failures: Vec<SourceFailure>,
    /// Entries in the published catalog
    pub entries: usize,
    /// False when nothing new was fetched and the published catalog was left as is
    pub published: bool,
    /// Whether the published catalog reached the cache
    pub cached: bool,
}

impl SyncReport {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// What `synchronize` did
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Scheduled,
}

/// Catalog notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEvent {
    /// A new catalog was published
    Updated {
        was_available: bool,
        available: bool,
        entries: usize,
        failed_sources: Vec<String>,
    },
    /// Every source failed and there was nothing to fall back on
    SyncFailed { failures: Vec<SourceFailure> },
}
