//! On-disk catalog cache
//!
//! The last published catalog is persisted so the application starts with a
//! usable catalog even when every source is unreachable. Loading never fails
//! hard: a missing, truncated or corrupt cache simply reads as "no cache".

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::xxh64;

use super::catalog::{Catalog, CatalogEntry};
use super::sqlite_cache::SqliteCatalogCache;

/// Persistence backend for the published catalog
pub trait RepositoryCache: Send + Sync {
    /// Load the cached catalog. `None` when absent or unreadable.
    fn load(&self) -> Option<Catalog>;

    /// Replace the cached catalog.
    fn store(&self, catalog: &Catalog) -> Result<()>;
}

/// Storage format of the catalog cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    #[default]
    Json,
    Sqlite,
}

/// Open the cache at `path` with the chosen backend
pub fn open_cache(backend: CacheBackend, path: &Path) -> Result<Arc<dyn RepositoryCache>> {
    let cache: Arc<dyn RepositoryCache> = match backend {
        CacheBackend::Json => Arc::new(JsonCatalogCache::new(path)),
        CacheBackend::Sqlite => Arc::new(SqliteCatalogCache::open(path)?),
    };
    Ok(cache)
}

/// Bumped whenever the envelope layout changes; older files are ignored.
const FORMAT_VERSION: u32 = 1;

/// Seed for the entries checksum
const CHECKSUM_SEED: u64 = 0;

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    format_version: u32,
    written_at: DateTime<Utc>,
    /// xxh64 of the serialized `entries` array, hex encoded
    checksum: String,
    entries: serde_json::Value,
}

fn checksum(entries_json: &[u8]) -> String {
    format!("{:016x}", xxh64(entries_json, CHECKSUM_SEED))
}

/// JSON file cache with an integrity checksum
pub struct JsonCatalogCache {
    path: PathBuf,
}

impl JsonCatalogCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn try_load(&self) -> Result<Option<Catalog>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let envelope: CacheEnvelope = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        if envelope.format_version != FORMAT_VERSION {
            warn!(
                "Ignoring catalog cache with format version {} (expected {})",
                envelope.format_version, FORMAT_VERSION
            );
            return Ok(None);
        }

        let entries_json = serde_json::to_vec(&envelope.entries)?;
        if checksum(&entries_json) != envelope.checksum {
            warn!("Catalog cache checksum mismatch, ignoring {}", self.path.display());
            return Ok(None);
        }

        let entries: Vec<CatalogEntry> = serde_json::from_value(envelope.entries)
            .context("Failed to decode cached catalog entries")?;

        debug!(
            "Loaded {} cached entries written at {}",
            entries.len(),
            envelope.written_at
        );
        Ok(Some(entries.into()))
    }
}

impl RepositoryCache for JsonCatalogCache {
    fn load(&self) -> Option<Catalog> {
        match self.try_load() {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("Could not load catalog cache: {:#}. Treating as empty.", e);
                None
            }
        }
    }

    fn store(&self, catalog: &Catalog) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let entries = serde_json::to_value(catalog).context("Failed to serialize catalog")?;
        let entries_json = serde_json::to_vec(&entries)?;
        let envelope = CacheEnvelope {
            format_version: FORMAT_VERSION,
            written_at: Utc::now(),
            checksum: checksum(&entries_json),
            entries,
        };

        // Write to a sibling temp file and rename so readers never see a partial cache
        let mut temp = NamedTempFile::new_in(&parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        serde_json::to_writer(&mut temp, &envelope).context("Failed to write catalog cache")?;
        temp.flush()?;
        temp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        info!("Stored {} catalog entries to {}", catalog.len(), self.path.display());
        Ok(())
    }
}
