//! Catalog data model
//!
//! A catalog maps application ids to their descriptors. Each repository
//! source contributes one catalog; the manager merges them by source priority.

use std::collections::BTreeMap;
use std::collections::btree_map;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where the installer script for an application lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptLocation {
    /// Script text embedded in the catalog
    Inline { code: String },
    /// Script file on the local filesystem
    Path { path: String },
    /// Script downloaded at install time
    Url { url: String },
}

/// Descriptor of one installable application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    pub script: ScriptLocation,
    /// Name of the repository source this entry came from.
    /// Filled in on fetch; whatever the source document says is ignored.
    #[serde(default)]
    pub source: String,
}

impl CatalogEntry {
    pub fn matches_query(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        let q = query.to_lowercase();
        self.id.to_lowercase().contains(&q)
            || self.name.to_lowercase().contains(&q)
            || self.description.to_lowercase().contains(&q)
            || self.category.to_lowercase().contains(&q)
    }
}

/// Ordered mapping from application id to entry. Ids are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<CatalogEntry>", into = "Vec<CatalogEntry>")]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the raw document fetched from a source.
    ///
    /// The document is a JSON array of entries. Every entry is stamped with
    /// `source` as its provenance. If an id appears more than once, the first
    /// occurrence is kept.
    pub fn from_source_bytes(source: &str, bytes: &[u8]) -> Result<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_slice(bytes)
            .with_context(|| format!("Failed to parse catalog from {}", source))?;

        let mut catalog = Self::new();
        for mut entry in entries {
            entry.source = source.to_string();
            if catalog.entries.contains_key(&entry.id) {
                warn!("Duplicate id '{}' in source {}, keeping first", entry.id, source);
                continue;
            }
            catalog.entries.insert(entry.id.clone(), entry);
        }
        Ok(catalog)
    }

    /// Merge contributions given in priority order (highest first).
    ///
    /// For every id the entry from the first contribution that has it wins;
    /// later contributions never override it.
    pub fn merge_by_priority<'a, I>(contributions: I) -> Self
    where
        I: IntoIterator<Item = &'a Catalog>,
    {
        let mut merged = Self::new();
        for contribution in contributions {
            for (id, entry) in &contribution.entries {
                merged
                    .entries
                    .entry(id.clone())
                    .or_insert_with(|| entry.clone());
            }
        }
        merged
    }

    /// Entries whose provenance is `source`.
    pub fn contribution_of(&self, source: &str) -> Self {
        self.entries
            .values()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&CatalogEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, CatalogEntry> {
        self.entries.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Search entries by free-text query and optional category
    pub fn search<'a>(
        &'a self,
        query: &str,
        category: Option<&str>,
    ) -> impl Iterator<Item = &'a CatalogEntry> {
        let query = query.to_lowercase();
        let category = category.unwrap_or("").to_string();

        self.entries.values().filter(move |e| {
            e.matches_query(&query)
                && (category.is_empty() || e.category.eq_ignore_ascii_case(&category))
        })
    }

    pub fn categories(&self) -> Vec<&str> {
        let mut categories: Vec<&str> = self
            .entries
            .values()
            .map(|e| e.category.as_str())
            .filter(|c| !c.is_empty())
            .collect();
        categories.sort_unstable();
        categories.dedup();
        categories
    }
}

impl FromIterator<CatalogEntry> for Catalog {
    fn from_iter<T: IntoIterator<Item = CatalogEntry>>(iter: T) -> Self {
        let mut entries = BTreeMap::new();
        for entry in iter {
            entries.entry(entry.id.clone()).or_insert(entry);
        }
        Self { entries }
    }
}

impl From<Vec<CatalogEntry>> for Catalog {
    fn from(entries: Vec<CatalogEntry>) -> Self {
        entries.into_iter().collect()
    }
}

impl From<Catalog> for Vec<CatalogEntry> {
    fn from(catalog: Catalog) -> Self {
        catalog.entries.into_values().collect()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a CatalogEntry;
    type IntoIter = btree_map::Values<'a, String, CatalogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}
