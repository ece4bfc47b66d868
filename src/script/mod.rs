//! Installer scripts
//!
//! A [`Script`] is an immutable unit of installation work bound to one virtual
//! drive. What it runs is opaque to the engine: anything implementing
//! [`ScriptPayload`] can be scheduled, from an interpreter invocation to a
//! plain closure supplied by an embedder.

mod command;
mod materialize;

pub use command::CommandPayload;
pub use materialize::{InlineScriptPayload, RemoteScriptPayload, ScriptFactory};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique id of a registered script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScriptId(Uuid);

impl ScriptId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ScriptId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker error for a payload that stopped because cancellation was requested
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Script execution was cancelled")]
pub struct Cancelled;

/// Everything a payload gets to see while it runs
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    script_id: ScriptId,
    drive_name: String,
    drive_path: PathBuf,
    cancel: CancellationToken,
    force: CancellationToken,
}

impl ExecutionContext {
    pub fn new(
        script_id: ScriptId,
        drive_name: impl Into<String>,
        drive_path: impl Into<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            script_id,
            drive_name: drive_name.into(),
            drive_path: drive_path.into(),
            cancel,
            force: CancellationToken::new(),
        }
    }

    /// Token that, once cancelled, means the payload must stop right away
    /// instead of winding down.
    pub fn with_force(mut self, force: CancellationToken) -> Self {
        self.force = force;
        self
    }

    pub fn script_id(&self) -> ScriptId {
        self.script_id
    }

    pub fn drive_name(&self) -> &str {
        &self.drive_name
    }

    /// Root of the leased drive
    pub fn drive_path(&self) -> &Path {
        &self.drive_path
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.force.is_cancelled()
    }

    /// Cancellation that leaves no room for cleanup (immediate shutdown)
    pub fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    /// Bail out with [`Cancelled`] if cancellation was requested.
    ///
    /// Payloads call this at safe points between drive-mutating steps.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }
}

/// Executable content of a script
///
/// `run` is called on a blocking thread while the drive lease is held.
/// Cancellation is cooperative: the engine cancels the context token and
/// calls `request_cancel`, then waits for `run` to return. Payloads may clean
/// up before returning unless [`ExecutionContext::is_forced`] says otherwise.
pub trait ScriptPayload: Send + Sync {
    fn run(&self, ctx: &ExecutionContext) -> Result<()>;

    fn request_cancel(&self) {}
}

/// Payload backed by a closure
pub struct FnPayload<F> {
    f: F,
}

impl<F> FnPayload<F>
where
    F: Fn(&ExecutionContext) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ScriptPayload for FnPayload<F>
where
    F: Fn(&ExecutionContext) -> Result<()> + Send + Sync,
{
    fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        (self.f)(ctx)
    }
}

/// Catalog application a script installs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationRef {
    pub id: String,
    pub name: String,
    pub version: String,
    pub source: String,
}

/// A named unit of installation logic bound to a target drive
#[derive(Clone)]
pub struct Script {
    id: ScriptId,
    name: String,
    drive: String,
    payload: Arc<dyn ScriptPayload>,
    application: Option<ApplicationRef>,
}

impl Script {
    pub fn new(
        name: impl Into<String>,
        drive: impl Into<String>,
        payload: Arc<dyn ScriptPayload>,
    ) -> Self {
        Self {
            id: ScriptId::new(),
            name: name.into(),
            drive: drive.into(),
            payload,
            application: None,
        }
    }

    /// Mark the script as the installer of a catalog application; a
    /// successful run is then recorded on the drive.
    pub fn with_application(mut self, application: ApplicationRef) -> Self {
        self.application = Some(application);
        self
    }

    /// Script running a closure
    pub fn from_fn<F>(name: impl Into<String>, drive: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, drive, Arc::new(FnPayload::new(f)))
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the drive this script installs into
    pub fn drive(&self) -> &str {
        &self.drive
    }

    pub fn payload(&self) -> &Arc<dyn ScriptPayload> {
        &self.payload
    }

    pub fn application(&self) -> Option<&ApplicationRef> {
        self.application.as_ref()
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("drive", &self.drive)
            .field("application", &self.application.as_ref().map(|a| &a.id))
            .finish_non_exhaustive()
    }
}

/// Why a script ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("drive '{drive}' is busy (held by {owner})")]
    DriveBusy { drive: String, owner: String },

    #[error("drive '{drive}' does not exist")]
    DriveNotFound { drive: String },

    #[error("{message}")]
    Execution { message: String },
}

/// Lifecycle of a registered script
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ScriptState {
    Pending,
    Running,
    Succeeded,
    Failed { reason: FailureReason },
    Cancelled,
}

impl ScriptState {
    pub fn failed(reason: FailureReason) -> Self {
        Self::Failed { reason }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed { .. } | Self::Cancelled)
    }
}

impl fmt::Display for ScriptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { reason } => write!(f, "failed: {}", reason),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
