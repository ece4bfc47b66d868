//! Applications installed into a drive
//!
//! Kept as a small JSON list at the root of the drive, next to the Wine
//! registry files, so it travels with the prefix.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

pub const INSTALLED_FILE_NAME: &str = ".vinery-installed.json";

/// A catalog application that was successfully installed into a drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledApplication {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Repository source the entry came from
    pub source: String,
    pub installed_at: DateTime<Utc>,
}

/// Read the record of a drive. A drive nothing was installed into has none.
pub(super) fn load(drive_path: &Path) -> Result<Vec<InstalledApplication>> {
    let path = drive_path.join(INSTALLED_FILE_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content =
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

/// Add `application` to the record, replacing an earlier install of the same id.
pub(super) fn record(drive_path: &Path, application: InstalledApplication) -> Result<()> {
    let mut installed = load(drive_path)?;
    installed.retain(|app| app.id != application.id);
    installed.push(application);
    installed.sort_by(|a, b| a.id.cmp(&b.id));

    let path = drive_path.join(INSTALLED_FILE_NAME);
    let mut temp = NamedTempFile::new_in(drive_path)
        .with_context(|| format!("Failed to create temp file in {:?}", drive_path))?;
    serde_json::to_writer_pretty(&mut temp, &installed)
        .with_context(|| format!("Failed to write {:?}", path))?;
    temp.flush()?;
    temp.persist(&path)
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}
