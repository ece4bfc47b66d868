//! Wiring of the core services from settings

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::drives::{InstalledApplication, VirtualDriveRegistry};
use crate::pool::WorkerPool;
use crate::repository::{open_cache, RepositoryManager};
use crate::script::{ScriptFactory, ScriptId};
use crate::services::{BackgroundServicesManager, ServicesCloser};
use crate::settings::Settings;

/// The repository manager and execution engine sharing one worker pool
pub struct Vinery {
    settings: Settings,
    pool: WorkerPool,
    repository: Arc<RepositoryManager>,
    services: Arc<BackgroundServicesManager>,
    factory: ScriptFactory,
}

impl Vinery {
    /// Build everything from validated settings. Must run inside a tokio runtime.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let pool = WorkerPool::new(settings.worker_count())?;

        let drives = VirtualDriveRegistry::open(&settings.drives_dir()?, settings.auto_provision)?;
        let cache = open_cache(settings.cache_backend, &settings.cache_path()?)?;
        let repository = Arc::new(RepositoryManager::from_configs(
            &settings.sources,
            cache,
            pool.clone(),
        )?);
        let services = Arc::new(BackgroundServicesManager::new(pool.clone(), Arc::new(drives)));
        let factory = ScriptFactory::new(&settings.interpreter, settings.staging_dir()?)
            .with_grace_period(settings.cancel_grace());

        info!(
            "Initialized with {} sources and {} workers",
            settings.sources.len(),
            pool.workers()
        );

        Ok(Self {
            settings,
            pool,
            repository,
            services,
            factory,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn repository(&self) -> &Arc<RepositoryManager> {
        &self.repository
    }

    pub fn services(&self) -> &Arc<BackgroundServicesManager> {
        &self.services
    }

    pub fn drives(&self) -> &Arc<VirtualDriveRegistry> {
        self.services.drives()
    }

    pub fn closer(&self) -> ServicesCloser {
        ServicesCloser::new(Arc::clone(&self.services))
    }

    /// Register the installer of catalog entry `id` against `drive`
    pub fn install(&self, id: &str, drive: &str) -> Result<ScriptId> {
        let catalog = self.repository.catalog();
        let entry = catalog
            .get(id)
            .with_context(|| format!("No application '{}' in the catalog", id))?;

        let script = self.factory.from_catalog_entry(entry, drive)?;
        Ok(self.services.register(script)?)
    }

    /// Catalog applications installed into `drive`
    pub fn installed(&self, drive: &str) -> Result<Vec<InstalledApplication>> {
        Ok(self.services.installed_applications(drive)?)
    }

    /// Register a local script file against `drive`
    pub fn run_file(&self, path: &Path, drive: &str) -> Result<ScriptId> {
        let script = self.factory.from_local_file(path, drive)?;
        Ok(self.services.register(script)?)
    }
}
