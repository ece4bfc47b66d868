//! Application teardown hook

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use super::BackgroundServicesManager;

/// Shuts the background services down when the application closes.
///
/// The embedding application flips `close_immediately` (force close, second
/// Ctrl-C) before tearing down its execution context; `close` then picks the
/// matching shutdown mode.
pub struct ServicesCloser {
    services: Arc<BackgroundServicesManager>,
    close_immediately: AtomicBool,
}

impl ServicesCloser {
    pub fn new(services: Arc<BackgroundServicesManager>) -> Self {
        Self {
            services,
            close_immediately: AtomicBool::new(false),
        }
    }

    pub fn set_close_immediately(&self, immediate: bool) {
        self.close_immediately.store(immediate, Ordering::SeqCst);
    }

    pub fn close_immediately(&self) -> bool {
        self.close_immediately.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        let immediate = self.close_immediately();
        info!(
            "Closing background services ({})",
            if immediate { "immediate" } else { "graceful" }
        );
        self.services.shutdown(immediate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::VirtualDriveRegistry;
    use crate::pool::WorkerPool;
    use crate::script::{Script, ScriptState};
    use std::time::Duration;
    use tempfile::TempDir;

    fn services(temp: &TempDir) -> Arc<BackgroundServicesManager> {
        let drives = VirtualDriveRegistry::open(temp.path(), true).unwrap();
        Arc::new(BackgroundServicesManager::new(
            WorkerPool::new(1).unwrap(),
            Arc::new(drives),
        ))
    }

    #[tokio::test]
    async fn test_graceful_close_by_default() {
        let temp = TempDir::new().unwrap();
        let services = services(&temp);
        let id = services
            .register(Script::from_fn("quick", "default", |_| {
                std::thread::sleep(Duration::from_millis(50));
                Ok(())
            }))
            .unwrap();

        let closer = ServicesCloser::new(Arc::clone(&services));
        assert!(!closer.close_immediately());
        closer.close().await;

        assert_eq!(services.state(id), Some(ScriptState::Succeeded));
        assert!(!services.is_accepting());
    }

    #[tokio::test]
    async fn test_close_immediately_cancels() {
        let temp = TempDir::new().unwrap();
        let services = services(&temp);
        let id = services
            .register(Script::from_fn("endless", "default", |ctx| loop {
                ctx.check_cancelled()?;
                std::thread::sleep(Duration::from_millis(10));
            }))
            .unwrap();

        let closer = ServicesCloser::new(Arc::clone(&services));
        closer.set_close_immediately(true);
        closer.close().await;

        assert_eq!(services.state(id), Some(ScriptState::Cancelled));
    }
}
