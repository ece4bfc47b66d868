//! Repository manager
//!
//! Owns the published catalog. Every synchronization fetches all sources
//! concurrently, but contributions are merged in configuration order, so the
//! result never depends on which fetch finished first.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::RepositoryCache;
use super::catalog::Catalog;
use super::source::{build_source, RepositorySource, SourceConfig};
use super::{CatalogEvent, RepositoryError, SourceFailure, SyncMode, SyncOutcome, SyncReport};
use crate::events::EventBus;
use crate::pool::WorkerPool;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct RepositoryManager {
    /// Sources in priority order, highest first
    sources: Vec<Arc<dyn RepositorySource>>,
    cache: Arc<dyn RepositoryCache>,
    published: RwLock<Arc<Catalog>>,
    /// Last good catalog of each source, keyed by source name
    contributions: Mutex<HashMap<String, Catalog>>,
    last_failures: Mutex<Vec<SourceFailure>>,
    events: EventBus<CatalogEvent>,
    pool: WorkerPool,
    sync_lock: tokio::sync::Mutex<()>,
}

impl RepositoryManager {
    /// Create the manager and publish the cached catalog, if any.
    ///
    /// Source names must be unique: they are the provenance recorded on every
    /// entry and the key under which contributions are retained.
    pub fn new(
        sources: Vec<Arc<dyn RepositorySource>>,
        cache: Arc<dyn RepositoryCache>,
        pool: WorkerPool,
    ) -> Result<Self, RepositoryError> {
        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.name().to_string()) {
                return Err(RepositoryError::DuplicateSource(source.name().to_string()));
            }
        }

        let cached = cache.load().unwrap_or_default();

        // Seed contributions from cache provenance so a source that is down on
        // the first sync of this run still keeps its entries.
        let mut contributions = HashMap::new();
        for source in &sources {
            let contribution = cached.contribution_of(source.name());
            if !contribution.is_empty() {
                contributions.insert(source.name().to_string(), contribution);
            }
        }

        if cached.is_empty() {
            debug!("No cached catalog, starting empty");
        } else {
            info!("Loaded {} catalog entries from cache", cached.len());
        }

        Ok(Self {
            sources,
            cache,
            published: RwLock::new(Arc::new(cached)),
            contributions: Mutex::new(contributions),
            last_failures: Mutex::new(Vec::new()),
            events: EventBus::default(),
            pool,
            sync_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Build sources from their configurations, in order
    pub fn from_configs(
        configs: &[SourceConfig],
        cache: Arc<dyn RepositoryCache>,
        pool: WorkerPool,
    ) -> Result<Self, RepositoryError> {
        let sources = configs
            .iter()
            .map(|config| {
                build_source(config).map_err(|e| RepositoryError::InvalidSource {
                    source_name: config.effective_name().to_string(),
                    reason: format!("{:#}", e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(sources, cache, pool)
    }

    /// The most recently published catalog
    pub fn catalog(&self) -> Arc<Catalog> {
        let published = self
            .published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&published)
    }

    /// Source failures recorded by the last synchronization
    pub fn last_failures(&self) -> Vec<SourceFailure> {
        lock(&self.last_failures).clone()
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.events.subscribe()
    }

    /// Fetch every source and publish the merged catalog.
    ///
    /// In background mode the work runs on the worker pool and completion is
    /// reported through [`subscribe`](Self::subscribe).
    pub async fn synchronize(
        self: &Arc<Self>,
        mode: SyncMode,
    ) -> Result<SyncOutcome, RepositoryError> {
        match mode {
            SyncMode::Synchronous => {
                let token = self.pool.token();
                self.run_sync(&token).await.map(SyncOutcome::Completed)
            }
            SyncMode::Background => {
                let manager = Arc::clone(self);
                self.pool.submit("catalog-sync", move |token| async move {
                    match manager.run_sync(&token).await {
                        Ok(report) => debug!(
                            "Background sync finished: {} entries, {} failed sources",
                            report.entries,
                            report.failures.len()
                        ),
                        Err(e) => warn!("Background sync failed: {}", e),
                    }
                })?;
                Ok(SyncOutcome::Scheduled)
            }
        }
    }

    async fn run_sync(&self, token: &CancellationToken) -> Result<SyncReport, RepositoryError> {
        let _guard = self.sync_lock.lock().await;
        info!("Synchronizing {} repository sources", self.sources.len());

        let fetches = self.sources.iter().map(|source| async move {
            debug!(source = source.name(), "Fetching catalog");
            (source.name(), source.fetch().await)
        });

        // join_all yields results in source order whatever the completion order
        let results = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RepositoryError::Cancelled),
            results = join_all(fetches) => results,
        };

        let mut report = SyncReport::default();
        let mut fresh = Vec::new();
        for (name, result) in results {
            let parsed = result.and_then(|bytes| Catalog::from_source_bytes(name, &bytes));
            match parsed {
                Ok(catalog) => {
                    info!(source = name, "Fetched {} entries", catalog.len());
                    report.fetched.push(name.to_string());
                    fresh.push((name.to_string(), catalog));
                }
                Err(e) => {
                    warn!(source = name, "Source unavailable, keeping previous entries: {:#}", e);
                    report.failures.push(SourceFailure {
                        source: name.to_string(),
                        reason: format!("{:#}", e),
                    });
                }
            }
        }
        *lock(&self.last_failures) = report.failures.clone();

        if token.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }

        let merged = {
            let mut contributions = lock(&self.contributions);
            for (name, catalog) in fresh {
                contributions.insert(name, catalog);
            }

            let retained: Vec<&Catalog> = self
                .sources
                .iter()
                .filter_map(|s| contributions.get(s.name()))
                .collect();

            if report.fetched.is_empty() && retained.is_empty() {
                None
            } else {
                Some(Catalog::merge_by_priority(retained))
            }
        };

        let Some(merged) = merged else {
            if self.catalog().is_empty() {
                warn!("Every repository source failed and no cached catalog exists");
                self.events.publish(CatalogEvent::SyncFailed {
                    failures: report.failures.clone(),
                });
                return Err(RepositoryError::CatalogUnavailable {
                    failures: report.failures,
                });
            }
            // Sources no longer configured may still back the published catalog
            report.entries = self.catalog().len();
            return Ok(report);
        };

        if token.is_cancelled() {
            return Err(RepositoryError::Cancelled);
        }

        let merged = Arc::new(merged);
        let previous = {
            let mut published = self
                .published
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *published, Arc::clone(&merged))
        };
        report.entries = merged.len();
        report.published = true;

        info!(
            "Published catalog with {} entries ({} sources failed)",
            merged.len(),
            report.failures.len()
        );
        self.events.publish(CatalogEvent::Updated {
            was_available: !previous.is_empty(),
            available: !merged.is_empty(),
            entries: merged.len(),
            failed_sources: report.failures.iter().map(|f| f.source.clone()).collect(),
        });

        let cache = Arc::clone(&self.cache);
        let snapshot = Arc::clone(&merged);
        match tokio::task::spawn_blocking(move || cache.store(&snapshot)).await {
            Ok(Ok(())) => report.cached = true,
            Ok(Err(e)) => warn!("Failed to persist catalog cache: {:#}", e),
            Err(e) => warn!("Catalog cache writer aborted: {}", e),
        }

        Ok(report)
    }
}

impl std::fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryManager")
            .field("sources", &self.source_names())
            .field("entries", &self.catalog().len())
            .finish()
    }
}
