//! SQLite catalog cache
//!
//! Alternative to the JSON file cache for installs that already keep their
//! state in a database. Entries are stored one row per id, replaced wholesale
//! inside a transaction on every store.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::cache::RepositoryCache;
use super::catalog::{Catalog, CatalogEntry};

/// Schema revision recorded in the meta table
const SCHEMA_VERSION: i64 = 1;

/// Catalog cache backed by a SQLite database
pub struct SqliteCatalogCache {
    conn: Mutex<Connection>,
}

impl SqliteCatalogCache {
    /// Open or create the cache database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open catalog cache: {}", path.display()))?;

        Self::with_connection(conn)
    }

    /// In-memory database, used by tests
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init_schema()?;
        Ok(cache)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_entries (
                id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                source TEXT NOT NULL,
                entry_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_catalog_source
                ON catalog_entries(source);

            CREATE TABLE IF NOT EXISTS catalog_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM catalog_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        if version.is_none() {
            conn.execute(
                "INSERT INTO catalog_meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }

        Ok(())
    }

    fn try_load(&self) -> Result<Option<Catalog>> {
        let conn = self.lock();

        let written_at: Option<String> = conn
            .query_row(
                "SELECT value FROM catalog_meta WHERE key = 'written_at'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        // Nothing was ever stored
        let Some(written_at) = written_at else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT id, entry_json FROM catalog_entries ORDER BY position")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, json) = row?;
            let entry: CatalogEntry = serde_json::from_str(&json)
                .with_context(|| format!("Corrupt cached entry '{}'", id))?;
            entries.push(entry);
        }

        debug!("Loaded {} cached entries written at {}", entries.len(), written_at);
        Ok(Some(entries.into()))
    }

    /// Number of cached entries contributed by `source`
    pub fn count_from_source(&self, source: &str) -> Result<usize> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM catalog_entries WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl RepositoryCache for SqliteCatalogCache {
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
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM catalog_entries", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO catalog_entries (id, position, source, entry_json)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, entry) in catalog.iter().enumerate() {
                let json = serde_json::to_string(entry)?;
                insert.execute(params![entry.id, position as i64, entry.source, json])?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO catalog_meta (key, value) VALUES ('written_at', ?1)",
            params![Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        info!("Stored {} catalog entries to database", catalog.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::catalog::tests::entry;
    use tempfile::TempDir;

    #[test]
    fn test_empty_database_is_none() {
        let cache = SqliteCatalogCache::in_memory().unwrap();
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_store_and_load() {
        let cache = SqliteCatalogCache::in_memory().unwrap();
        let catalog: Catalog =
            vec![entry("a", "1", "official"), entry("b", "2", "community")].into();

        cache.store(&catalog).unwrap();
        assert_eq!(cache.load(), Some(catalog));
        assert_eq!(cache.count_from_source("community").unwrap(), 1);
    }

    #[test]
    fn test_store_replaces_rows() {
        let cache = SqliteCatalogCache::in_memory().unwrap();
        cache
            .store(&vec![entry("a", "1", "s"), entry("b", "1", "s")].into())
            .unwrap();
        cache.store(&vec![entry("c", "1", "s")].into()).unwrap();

        let loaded = cache.load().unwrap();
        assert_eq!(loaded.ids().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_stored_empty_catalog_loads_as_empty() {
        let cache = SqliteCatalogCache::in_memory().unwrap();
        cache.store(&Catalog::new()).unwrap();
        assert_eq!(cache.load(), Some(Catalog::new()));
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache/catalog.db");

        {
            let cache = SqliteCatalogCache::open(&path).unwrap();
            cache.store(&vec![entry("a", "1", "s")].into()).unwrap();
        }

        let reopened = SqliteCatalogCache::open(&path).unwrap();
        assert!(reopened.load().unwrap().contains("a"));
    }
}
