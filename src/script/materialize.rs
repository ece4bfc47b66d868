//! Turning catalog entries into runnable scripts

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tempfile::TempPath;
use tracing::{debug, info};

use super::command::{CommandPayload, DEFAULT_GRACE_PERIOD};
use super::{ApplicationRef, ExecutionContext, Script, ScriptPayload};
use crate::repository::{CatalogEntry, ScriptLocation};

/// Timeout for downloading a remote script
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl From<&CatalogEntry> for ApplicationRef {
    fn from(entry: &CatalogEntry) -> Self {
        Self {
            id: entry.id.clone(),
            name: entry.name.clone(),
            version: entry.version.clone(),
            source: entry.source.clone(),
        }
    }
}

/// Builds [`Script`]s that run through the configured interpreter
#[derive(Debug, Clone)]
pub struct ScriptFactory {
    interpreter: PathBuf,
    staging_dir: PathBuf,
    grace_period: Duration,
}

impl ScriptFactory {
    pub fn new(interpreter: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            staging_dir: staging_dir.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// How long a cancelled script may take to stop before it is killed
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    fn command(&self, script: impl Into<PathBuf>) -> CommandPayload {
        CommandPayload::new(&self.interpreter, script).grace_period(self.grace_period)
    }

    /// Script installing a catalog entry into `drive`
    pub fn from_catalog_entry(&self, entry: &CatalogEntry, drive: &str) -> Result<Script> {
        let payload: Arc<dyn ScriptPayload> = match &entry.script {
            ScriptLocation::Inline { code } => {
                let staged = stage_script(&self.staging_dir, &entry.id, code.as_bytes())?;
                Arc::new(InlineScriptPayload::new(self.command(staged.to_path_buf()), staged))
            }
            ScriptLocation::Path { path } => {
                let path = PathBuf::from(path);
                if !path.is_file() {
                    bail!("Script for '{}' not found: {}", entry.id, path.display());
                }
                Arc::new(self.command(path))
            }
            ScriptLocation::Url { url } => Arc::new(
                RemoteScriptPayload::new(url.clone(), &self.interpreter, &self.staging_dir)
                    .grace_period(self.grace_period),
            ),
        };

        debug!("Materialized script for '{}' from {}", entry.id, entry.source);
        Ok(Script::new(entry.name.clone(), drive, payload).with_application(entry.into()))
    }

    /// Script running a local file
    pub fn from_local_file(&self, path: &Path, drive: &str) -> Result<Script> {
        if !path.is_file() {
            bail!("Script not found: {}", path.display());
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Script::new(name, drive, Arc::new(self.command(path))))
    }
}

/// Write script text to a fresh file under `staging_dir`.
///
/// The file is removed when the returned path is closed or dropped.
fn stage_script(staging_dir: &Path, id: &str, contents: &[u8]) -> Result<TempPath> {
    std::fs::create_dir_all(staging_dir)
        .with_context(|| format!("Failed to create {}", staging_dir.display()))?;

    let stem: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();

    let mut file = tempfile::Builder::new()
        .prefix(&format!("{}-", stem))
        .suffix(".sh")
        .tempfile_in(staging_dir)
        .with_context(|| format!("Failed to stage script in {}", staging_dir.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write {}", file.path().display()))?;

    Ok(file.into_temp_path())
}

fn remove_staged(staged: TempPath) {
    let path = staged.to_path_buf();
    if let Err(e) = staged.close() {
        debug!("Could not remove staged script {}: {}", path.display(), e);
    }
}

/// Runs script text shipped inside a catalog entry.
///
/// The text is staged when the script is built and removed after the run.
pub struct InlineScriptPayload {
    command: CommandPayload,
    staged: Mutex<Option<TempPath>>,
}

impl InlineScriptPayload {
    fn new(command: CommandPayload, staged: TempPath) -> Self {
        Self {
            command,
            staged: Mutex::new(Some(staged)),
        }
    }
}

impl ScriptPayload for InlineScriptPayload {
    fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        let result = self.command.run(ctx);
        let staged = lock(&self.staged).take();
        if let Some(staged) = staged {
            remove_staged(staged);
        }
        result
    }

    fn request_cancel(&self) {
        self.command.request_cancel();
    }
}

/// Downloads the script when the job starts, then runs it like a local file
pub struct RemoteScriptPayload {
    url: String,
    interpreter: PathBuf,
    staging_dir: PathBuf,
    grace_period: Duration,
    cancel_requested: AtomicBool,
    running: Mutex<Option<Arc<CommandPayload>>>,
}

impl RemoteScriptPayload {
    pub fn new(url: String, interpreter: &Path, staging_dir: &Path) -> Self {
        Self {
            url,
            interpreter: interpreter.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            grace_period: DEFAULT_GRACE_PERIOD,
            cancel_requested: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn download(&self) -> Result<Vec<u8>> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("vinery/", env!("CARGO_PKG_VERSION")))
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .get(&self.url)
            .send()
            .with_context(|| format!("Failed to download {}", self.url))?;
        if !response.status().is_success() {
            bail!("Failed to download {}: HTTP {}", self.url, response.status());
        }

        let bytes = response
            .bytes()
            .with_context(|| format!("Failed to read script from {}", self.url))?;
        Ok(bytes.to_vec())
    }
}

impl ScriptPayload for RemoteScriptPayload {
    fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        ctx.check_cancelled()?;

        info!("Downloading script {}", self.url);
        let contents = self.download()?;
        ctx.check_cancelled()?;

        let id = ctx.script_id().to_string();
        let staged = stage_script(&self.staging_dir, &id, &contents)?;
        let command = Arc::new(
            CommandPayload::new(&self.interpreter, staged.to_path_buf())
                .grace_period(self.grace_period),
        );
        *lock(&self.running) = Some(Arc::clone(&command));
        if self.cancel_requested.load(Ordering::SeqCst) {
            command.request_cancel();
        }

        let result = command.run(ctx);
        remove_staged(staged);
        result
    }

    fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if let Some(command) = lock(&self.running).as_ref() {
            command.request_cancel();
        }
    }
}
