//! ZIP archive repository source
//!
//! Repository snapshots are often published as a single archive (a release
//! asset, a mirror tarball converted to zip). The catalog document may sit at
//! any depth inside it, e.g. `apps-main/catalog.json`.

use std::io::{Cursor, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;
use zip::ZipArchive;

use super::http::{build_client, fetch_url};
use super::source::{is_url, RepositorySource, CATALOG_FILE_NAME};

/// Source reading `catalog.json` out of a ZIP archive
pub struct ArchiveSource {
    name: String,
    location: String,
    client: Option<Client>,
}

impl ArchiveSource {
    pub fn new(name: impl Into<String>, location: impl Into<String>) -> Result<Self> {
        let location = location.into();
        let client = if is_url(&location) {
            Some(build_client()?)
        } else {
            None
        };

        Ok(Self {
            name: name.into(),
            location,
            client,
        })
    }

    async fn read_archive(&self) -> Result<Vec<u8>> {
        match &self.client {
            Some(client) => fetch_url(client, &self.location).await,
            None => {
                let path = PathBuf::from(&self.location);
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read archive: {}", path.display()))
            }
        }
    }
}

#[async_trait]
impl RepositorySource for ArchiveSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<u8>> {
        let archive = self.read_archive().await?;
        extract_catalog(&archive)
            .with_context(|| format!("Invalid repository archive: {}", self.location))
    }
}

/// Pull the catalog document out of an in-memory ZIP archive.
///
/// The shallowest `catalog.json` wins when the archive contains several.
pub fn extract_catalog(archive_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut archive =
        ZipArchive::new(Cursor::new(archive_bytes)).context("Failed to read as ZIP archive")?;

    let mut best: Option<(usize, usize)> = None;
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().replace('\\', "/");
        let file_name = name.rsplit('/').next().unwrap_or(&name);
        if !file_name.eq_ignore_ascii_case(CATALOG_FILE_NAME) {
            continue;
        }
        let depth = name.matches('/').count();
        if best.map_or(true, |(_, best_depth)| depth < best_depth) {
            best = Some((i, depth));
        }
    }

    let (index, _) = best.with_context(|| format!("No '{}' found in archive", CATALOG_FILE_NAME))?;

    let mut file = archive.by_index(index)?;
    debug!("Reading catalog from archive entry {}", file.name());
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .context("Failed to read catalog from archive")?;
    Ok(contents)
}
