//! Background services
//!
//! Runs registered scripts on the worker pool against leased virtual drives
//! and coordinates their cancellation and shutdown.
//!
//! Job lifecycle:
//! - `Pending` on registration
//! - drive lease acquired, then `Running`; a busy or unknown drive fails the
//!   job straight from `Pending` without touching its payload
//! - `Succeeded`, `Failed` or `Cancelled` once the payload returns; a
//!   successful catalog install is recorded on the drive before the lease
//!   goes back

mod closer;
mod registry;

pub use closer::ServicesCloser;
pub use registry::{JobEvent, JobInfo};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::drives::{DriveError, InstalledApplication, Lease, VirtualDriveRegistry};
use crate::pool::{PoolError, WorkerPool};
use crate::script::{
    ApplicationRef, Cancelled, ExecutionContext, FailureReason, Script, ScriptId, ScriptState,
};
use registry::JobRegistry;

/// Background services errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Background services are shutting down")]
    ShuttingDown,

    #[error("Unknown job {0}")]
    UnknownJob(ScriptId),

    #[error("Job {0} is already registered")]
    AlreadyRegistered(ScriptId),

    #[error("Job {id} has not finished (currently {state})")]
    NotFinished { id: ScriptId, state: ScriptState },

    #[error(transparent)]
    Drive(#[from] DriveError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Registers scripts, runs them on the worker pool and tracks them to completion
pub struct BackgroundServicesManager {
    pool: WorkerPool,
    drives: Arc<VirtualDriveRegistry>,
    jobs: Arc<JobRegistry>,
    accepting: AtomicBool,
    /// Cancelled on immediate shutdown; payloads stop without cleanup
    force: CancellationToken,
}

impl BackgroundServicesManager {
    pub fn new(pool: WorkerPool, drives: Arc<VirtualDriveRegistry>) -> Self {
        Self {
            pool,
            drives,
            jobs: Arc::new(JobRegistry::new()),
            accepting: AtomicBool::new(true),
            force: CancellationToken::new(),
        }
    }

    pub fn drives(&self) -> &Arc<VirtualDriveRegistry> {
        &self.drives
    }

    /// Track `script` as `Pending` and queue it on the pool. Returns immediately.
    pub fn register(&self, script: Script) -> Result<ScriptId, ServiceError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ServiceError::ShuttingDown);
        }

        let id = script.id();
        let cancel = self.pool.token();
        if !self.jobs.insert(&script, cancel.clone()) {
            return Err(ServiceError::AlreadyRegistered(id));
        }
        info!(job = %id, drive = %script.drive(), "Registered script '{}'", script.name());

        let jobs = Arc::clone(&self.jobs);
        let drives = Arc::clone(&self.drives);
        let force = self.force.clone();
        let task_name = format!("script {}", id);
        if let Err(e) = self
            .pool
            .submit(&task_name, move |_| run_job(jobs, drives, script, cancel, force))
        {
            self.jobs.transition(id, ScriptState::Cancelled);
            return Err(e.into());
        }

        Ok(id)
    }

    /// Request cancellation of a job.
    ///
    /// A pending job is cancelled on the spot. A running job is signalled and
    /// becomes `Cancelled` once its payload has wound down.
    pub fn cancel(&self, id: ScriptId) -> Result<(), ServiceError> {
        let handles = self
            .jobs
            .cancel_handles(id)
            .ok_or(ServiceError::UnknownJob(id))?;

        handles.cancel.cancel();
        if self.jobs.cancel_if_pending(id) {
            info!(job = %id, "Cancelled pending job");
        } else {
            handles.payload.request_cancel();
            debug!(job = %id, "Cancellation requested");
        }
        Ok(())
    }

    pub fn state(&self, id: ScriptId) -> Option<ScriptState> {
        self.jobs.get(id).map(|job| job.state)
    }

    pub fn job(&self, id: ScriptId) -> Option<JobInfo> {
        self.jobs.get(id)
    }

    /// Every tracked job, oldest first
    pub fn jobs(&self) -> Vec<JobInfo> {
        self.jobs.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.jobs.subscribe()
    }

    /// Wait until a job reaches a terminal state.
    pub async fn wait(&self, id: ScriptId) -> Result<ScriptState, ServiceError> {
        // Subscribe before reading the state so no transition slips between
        let mut events = self.jobs.subscribe();
        loop {
            let state = self.state(id).ok_or(ServiceError::UnknownJob(id))?;
            if state.is_terminal() {
                return Ok(state);
            }

            match events.recv().await {
                Ok(event) if event.id == id && event.state.is_terminal() => {
                    return Ok(event.state)
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(ServiceError::UnknownJob(id)),
            }
        }
    }

    /// Forget a finished job.
    pub fn acknowledge(&self, id: ScriptId) -> Result<JobInfo, ServiceError> {
        match self.jobs.remove_terminal(id) {
            Some(Ok(info)) => {
                debug!(job = %id, "Acknowledged {}", info.state);
                Ok(info)
            }
            Some(Err(state)) => Err(ServiceError::NotFinished { id, state }),
            None => Err(ServiceError::UnknownJob(id)),
        }
    }

    /// Catalog applications successfully installed into `drive`
    pub fn installed_applications(
        &self,
        drive: &str,
    ) -> Result<Vec<InstalledApplication>, ServiceError> {
        Ok(self.drives.installed_applications(drive)?)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Stop accepting registrations and wind down outstanding work.
    ///
    /// Graceful: wait for every queued and running job to finish.
    /// Immediate: stop every job without giving it time to clean up, mark it
    /// `Cancelled` and tear the pool down without waiting.
    pub async fn shutdown(&self, immediate: bool) {
        self.accepting.store(false, Ordering::SeqCst);

        if immediate {
            let active = self.jobs.active();
            warn!("Immediate shutdown, cancelling {} jobs", active.len());
            self.force.cancel();
            for job in active {
                job.cancel.cancel();
                job.payload.request_cancel();
                self.jobs.transition(job.id, ScriptState::Cancelled);
            }
            self.pool.shutdown_now();
        } else {
            info!("Graceful shutdown, waiting for {} jobs", self.jobs.active().len());
            self.pool.drain().await;
        }
    }
}

impl std::fmt::Debug for BackgroundServicesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundServicesManager")
            .field("pool", &self.pool)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

fn lease_failure(error: DriveError) -> FailureReason {
    match error {
        DriveError::Busy { drive, owner } => FailureReason::DriveBusy { drive, owner },
        DriveError::NotFound(drive) => FailureReason::DriveNotFound { drive },
        other => FailureReason::Execution {
            message: other.to_string(),
        },
    }
}

fn record_install(lease: &Lease, application: &ApplicationRef) {
    let record = InstalledApplication {
        id: application.id.clone(),
        name: application.name.clone(),
        version: application.version.clone(),
        source: application.source.clone(),
        installed_at: Utc::now(),
    };
    if let Err(e) = lease.record_installed(record) {
        warn!(drive = %lease.drive(), "Could not record install of '{}': {:#}", application.id, e);
    }
}

async fn run_job(
    jobs: Arc<JobRegistry>,
    drives: Arc<VirtualDriveRegistry>,
    script: Script,
    cancel: CancellationToken,
    force: CancellationToken,
) {
    let id = script.id();
    if cancel.is_cancelled() {
        jobs.transition(id, ScriptState::Cancelled);
        return;
    }

    let lease = match drives.acquire(script.drive(), &id.to_string()) {
        Ok(lease) => lease,
        Err(e) => {
            warn!(job = %id, "Could not lease drive: {}", e);
            jobs.transition(id, ScriptState::failed(lease_failure(e)));
            return;
        }
    };

    // Cancelled while waiting for the lease
    if !jobs.transition(id, ScriptState::Running) {
        return;
    }

    let ctx =
        ExecutionContext::new(id, lease.drive(), lease.path(), cancel.clone()).with_force(force);
    let payload = Arc::clone(script.payload());
    let application = script.application().cloned();

    // The lease travels with the payload so the drive stays busy until the
    // script and its install record are done, even if this task is dropped
    let mut handle = tokio::task::spawn_blocking(move || {
        let result = payload.run(&ctx);
        if let (Ok(()), Some(application)) = (&result, &application) {
            record_install(&lease, application);
        }
        lease.release();
        result
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = cancel.cancelled() => {
            info!(job = %id, "Waiting for script to observe cancellation");
            script.payload().request_cancel();
            handle.await
        }
    };

    let state = match joined {
        Ok(Ok(())) => ScriptState::Succeeded,
        Ok(Err(e)) if e.downcast_ref::<Cancelled>().is_some() || cancel.is_cancelled() => {
            ScriptState::Cancelled
        }
        Ok(Err(e)) => {
            warn!(job = %id, "Script failed: {:#}", e);
            ScriptState::failed(FailureReason::Execution {
                message: format!("{:#}", e),
            })
        }
        Err(e) => {
            warn!(job = %id, "Script task aborted: {}", e);
            ScriptState::failed(FailureReason::Execution {
                message: format!("Script panicked or was aborted: {}", e),
            })
        }
    };

    info!(job = %id, "Script '{}' {}", script.name(), state);
    jobs.transition(id, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::DriveState;
    use crate::script::{ApplicationRef, CommandPayload};
    use anyhow::bail;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        drives: Arc<VirtualDriveRegistry>,
        services: BackgroundServicesManager,
    }

    fn fixture(workers: usize, auto_provision: bool) -> Fixture {
        let temp = TempDir::new().unwrap();
        let drives =
            Arc::new(VirtualDriveRegistry::open(&temp.path().join("drives"), auto_provision).unwrap());
        let services =
            BackgroundServicesManager::new(WorkerPool::new(workers).unwrap(), Arc::clone(&drives));
        Fixture {
            temp,
            drives,
            services,
        }
    }

    /// Script that keeps running until cancelled
    fn until_cancelled(drive: &str) -> Script {
        Script::from_fn("spinner", drive, |ctx| loop {
            ctx.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(10));
        })
    }

    /// Interpreter script stored in the fixture directory
    fn shell_script(f: &Fixture, drive: &str, body: &str, grace: Duration) -> Script {
        let path = f.temp.path().join(format!("{}.sh", drive));
        std::fs::write(&path, body).unwrap();
        Script::new(
            "shell",
            drive,
            Arc::new(CommandPayload::new("sh", path).grace_period(grace)),
        )
    }

    fn application(id: &str) -> ApplicationRef {
        ApplicationRef {
            id: id.to_string(),
            name: format!("{} installer", id),
            version: "1.0".to_string(),
            source: "official".to_string(),
        }
    }

    async fn wait_for_idle(drives: &VirtualDriveRegistry, drive: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while drives.get(drive).map(|d| d.state.is_busy()).unwrap_or(true) {
            assert!(Instant::now() < deadline, "drive {drive} never became idle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_for_state(services: &BackgroundServicesManager, id: ScriptId, state: ScriptState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while services.state(id) != Some(state.clone()) {
            assert!(Instant::now() < deadline, "timed out waiting for {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_successful_job_emits_ordered_events() {
        let f = fixture(2, true);
        let mut events = f.services.subscribe();

        let id = f
            .services
            .register(Script::from_fn("ok", "games", |_| Ok(())))
            .unwrap();
        assert_eq!(f.services.wait(id).await.unwrap(), ScriptState::Succeeded);

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.id, id);
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![ScriptState::Pending, ScriptState::Running, ScriptState::Succeeded]
        );
        assert_eq!(f.drives.get("games").unwrap().state, DriveState::Idle);
    }

    #[tokio::test]
    async fn test_busy_drive_fails_without_running_payload() {
        let f = fixture(2, true);
        let _held = f.drives.acquire("games", "other-job").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut events = f.services.subscribe();

        let counter = Arc::clone(&calls);
        let id = f
            .services
            .register(Script::from_fn("blocked", "games", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        let state = f.services.wait(id).await.unwrap();
        assert_eq!(
            state,
            ScriptState::failed(FailureReason::DriveBusy {
                drive: "games".to_string(),
                owner: "other-job".to_string(),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(events.recv().await.unwrap().state, ScriptState::Pending);
        assert_eq!(events.recv().await.unwrap().state, state);
    }

    #[tokio::test]
    async fn test_unknown_drive_without_auto_provision() {
        let f = fixture(1, false);
        let id = f
            .services
            .register(Script::from_fn("lost", "nowhere", |_| Ok(())))
            .unwrap();

        assert_eq!(
            f.services.wait(id).await.unwrap(),
            ScriptState::failed(FailureReason::DriveNotFound {
                drive: "nowhere".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_payload_error_fails_job_and_releases_drive() {
        let f = fixture(1, true);
        let id = f
            .services
            .register(Script::from_fn("broken", "games", |_| bail!("installer crashed")))
            .unwrap();

        match f.services.wait(id).await.unwrap() {
            ScriptState::Failed {
                reason: FailureReason::Execution { message },
            } => assert!(message.contains("installer crashed")),
            other => panic!("unexpected state {other}"),
        }
        assert!(!f.drives.get("games").unwrap().state.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_running_job_is_cooperative() {
        let f = fixture(1, true);
        let id = f.services.register(until_cancelled("games")).unwrap();
        wait_for_state(&f.services, id, ScriptState::Running).await;

        f.services.cancel(id).unwrap();
        assert_eq!(f.services.wait(id).await.unwrap(), ScriptState::Cancelled);
        assert!(!f.drives.get("games").unwrap().state.is_busy());
    }

    #[tokio::test]
    async fn test_cancel_pending_job() {
        let f = fixture(1, true);
        let blocker = f.services.register(until_cancelled("first")).unwrap();
        wait_for_state(&f.services, blocker, ScriptState::Running).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let queued = f
            .services
            .register(Script::from_fn("queued", "second", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        assert_eq!(f.services.state(queued), Some(ScriptState::Pending));

        f.services.cancel(queued).unwrap();
        assert_eq!(f.services.state(queued), Some(ScriptState::Cancelled));

        f.services.cancel(blocker).unwrap();
        f.services.shutdown(false).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_running_jobs() {
        let f = fixture(2, true);
        let id = f
            .services
            .register(Script::from_fn("slow", "games", |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }))
            .unwrap();
        wait_for_state(&f.services, id, ScriptState::Running).await;

        f.services.shutdown(false).await;
        assert_eq!(f.services.state(id), Some(ScriptState::Succeeded));
        assert!(matches!(
            f.services.register(Script::from_fn("late", "games", |_| Ok(()))),
            Err(ServiceError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_immediate_shutdown_leaves_nothing_running() {
        let f = fixture(1, true);
        let running = f.services.register(until_cancelled("games")).unwrap();
        wait_for_state(&f.services, running, ScriptState::Running).await;
        let pending = f
            .services
            .register(Script::from_fn("queued", "other", |_| Ok(())))
            .unwrap();

        let started = Instant::now();
        f.services.shutdown(true).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        for job in f.services.jobs() {
            assert_ne!(job.state, ScriptState::Running);
        }
        assert_eq!(f.services.state(running), Some(ScriptState::Cancelled));
        assert_eq!(f.services.state(pending), Some(ScriptState::Cancelled));
    }

    #[tokio::test]
    async fn test_acknowledge_removes_terminal_jobs_only() {
        let f = fixture(1, true);
        let id = f.services.register(until_cancelled("games")).unwrap();
        wait_for_state(&f.services, id, ScriptState::Running).await;

        assert!(matches!(
            f.services.acknowledge(id),
            Err(ServiceError::NotFinished { .. })
        ));

        f.services.cancel(id).unwrap();
        f.services.wait(id).await.unwrap();
        let info = f.services.acknowledge(id).unwrap();
        assert_eq!(info.state, ScriptState::Cancelled);
        assert!(f.services.jobs().is_empty());
        assert!(matches!(
            f.services.acknowledge(id),
            Err(ServiceError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn test_register_same_script_twice_is_rejected() {
        let f = fixture(2, true);
        let script = Script::from_fn("once", "games", |_| Ok(()));

        let id = f.services.register(script.clone()).unwrap();
        assert!(matches!(
            f.services.register(script),
            Err(ServiceError::AlreadyRegistered(dup)) if dup == id
        ));

        f.services.shutdown(false).await;
        assert_eq!(f.services.jobs().len(), 1);
        assert_eq!(f.services.state(id), Some(ScriptState::Succeeded));
    }

    #[tokio::test]
    async fn test_cancel_running_command_lets_it_clean_up() {
        let f = fixture(1, true);
        let script = shell_script(
            &f,
            "games",
            "trap 'touch \"$WINEPREFIX/cleaned\"; exit 0' TERM\nwhile true; do sleep 0.1; done\n",
            Duration::from_secs(10),
        );
        let id = f.services.register(script).unwrap();
        wait_for_state(&f.services, id, ScriptState::Running).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        f.services.cancel(id).unwrap();
        assert_eq!(f.services.wait(id).await.unwrap(), ScriptState::Cancelled);

        let drive = f.drives.get("games").unwrap();
        assert_eq!(drive.state, DriveState::Idle);
        assert!(drive.path.join("cleaned").exists());
    }

    #[tokio::test]
    async fn test_immediate_shutdown_kills_command_script() {
        let f = fixture(1, true);
        let script = shell_script(
            &f,
            "games",
            "trap '' TERM\nwhile true; do sleep 0.1; done\n",
            Duration::from_secs(60),
        );
        let id = f.services.register(script).unwrap();
        wait_for_state(&f.services, id, ScriptState::Running).await;

        let started = Instant::now();
        f.services.shutdown(true).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.services.state(id), Some(ScriptState::Cancelled));

        // Well inside the 60s grace period, so the script was killed outright
        wait_for_idle(&f.drives, "games").await;
    }

    #[tokio::test]
    async fn test_successful_install_is_recorded_on_drive() {
        let f = fixture(2, true);
        let installed = f
            .services
            .register(
                Script::from_fn("word", "office", |_| Ok(())).with_application(application("word")),
            )
            .unwrap();
        let broken = f
            .services
            .register(
                Script::from_fn("excel", "spare", |_| bail!("setup.exe crashed"))
                    .with_application(application("excel")),
            )
            .unwrap();
        let plain = f
            .services
            .register(Script::from_fn("tweak", "office-tweaks", |_| Ok(())))
            .unwrap();

        assert_eq!(f.services.wait(installed).await.unwrap(), ScriptState::Succeeded);
        assert!(f.services.wait(broken).await.unwrap().is_terminal());
        assert_eq!(f.services.wait(plain).await.unwrap(), ScriptState::Succeeded);

        let office = f.services.installed_applications("office").unwrap();
        assert_eq!(office.len(), 1);
        assert_eq!(office[0].id, "word");
        assert_eq!(office[0].source, "official");
        assert!(f.services.installed_applications("spare").unwrap().is_empty());
        assert!(f.services.installed_applications("office-tweaks").unwrap().is_empty());
        assert!(matches!(
            f.services.installed_applications("nowhere"),
            Err(ServiceError::Drive(DriveError::NotFound(_)))
        ));
    }
}
