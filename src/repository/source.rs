//! Repository sources
//!
//! A source fetches the raw catalog document from one origin. Sources are
//! stateless fetchers: all they own is their configuration, so the manager
//! can call `fetch` on all of them concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::archive::ArchiveSource;
use super::http::HttpSource;

/// File name looked up inside directory and archive sources.
pub const CATALOG_FILE_NAME: &str = "catalog.json";

/// Fetch capability for one catalog origin
#[async_trait]
pub trait RepositorySource: Send + Sync {
    /// Unique name of the source; recorded as provenance on its entries.
    fn name(&self) -> &str;

    /// Fetch the raw catalog document.
    async fn fetch(&self) -> Result<Vec<u8>>;
}

/// Kind of origin a source reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Catalog file, or a directory holding `catalog.json`
    Local,
    /// Catalog document served over HTTP(S)
    Http,
    /// ZIP archive (path or URL) holding `catalog.json`
    Archive,
}

/// Configuration of one source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Display name; derived from the location when empty
    #[serde(default)]
    pub name: String,
    pub kind: SourceKind,
    pub location: String,
}

impl SourceConfig {
    pub fn new(kind: SourceKind, location: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            kind,
            location: location.into(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The configured name, or the location when no name was given
    pub fn effective_name(&self) -> &str {
        if self.name.is_empty() {
            &self.location
        } else {
            &self.name
        }
    }
}

/// Build the fetcher for a source configuration
pub fn build_source(config: &SourceConfig) -> Result<Arc<dyn RepositorySource>> {
    if config.location.trim().is_empty() {
        bail!("Source '{}' has an empty location", config.effective_name());
    }

    let name = config.effective_name().to_string();
    debug!("Configuring {:?} source '{}' at {}", config.kind, name, config.location);

    let source: Arc<dyn RepositorySource> = match config.kind {
        SourceKind::Local => Arc::new(LocalSource::new(name, PathBuf::from(&config.location))),
        SourceKind::Http => Arc::new(HttpSource::new(name, config.location.clone())?),
        SourceKind::Archive => Arc::new(ArchiveSource::new(name, config.location.clone())?),
    };
    Ok(source)
}

/// Check whether a location is an HTTP(S) URL
pub fn is_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Source reading from the local filesystem
pub struct LocalSource {
    name: String,
    path: PathBuf,
}

impl LocalSource {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }

    fn catalog_path(&self) -> PathBuf {
        resolve_catalog_path(&self.path)
    }
}

fn resolve_catalog_path(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(CATALOG_FILE_NAME)
    } else {
        path.to_path_buf()
    }
}

#[async_trait]
impl RepositorySource for LocalSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let path = self.catalog_path();
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read catalog: {}", path.display()))
    }
}
