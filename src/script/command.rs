//! Interpreter-backed payload
//!
//! Runs an installer script file through an external interpreter with the
//! drive as its Wine prefix. Output is streamed to the log line by line.
//!
//! Stopping a script:
//! - a cancel request sends SIGTERM to the script's process group and waits
//!   up to the grace period for it to wind down
//! - a forced cancel, or a script outliving its grace period, gets SIGKILL

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::{Cancelled, ExecutionContext, ScriptPayload};

/// How often a running child is checked for exit or cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Time a script gets between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// How long output readers may lag behind the script's exit
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Runs `<interpreter> <script> [args...]` inside the drive
pub struct CommandPayload {
    interpreter: PathBuf,
    script: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    grace_period: Duration,
    cancel_requested: AtomicBool,
}

impl CommandPayload {
    pub fn new(interpreter: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
            args: Vec::new(),
            env: Vec::new(),
            grace_period: DEFAULT_GRACE_PERIOD,
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    fn spawn(&self, ctx: &ExecutionContext) -> Result<Child> {
        let interpreter = which::which(&self.interpreter).with_context(|| {
            format!("Script interpreter not found: {}", self.interpreter.display())
        })?;

        info!(
            "Running {} {} on drive '{}'",
            interpreter.display(),
            self.script.display(),
            ctx.drive_name()
        );

        let mut command = Command::new(&interpreter);
        command
            .arg(&self.script)
            .args(&self.args)
            .current_dir(ctx.drive_path())
            .env("WINEPREFIX", ctx.drive_path())
            .env("VINERY_DRIVE", ctx.drive_name())
            .env("VINERY_SCRIPT_ID", ctx.script_id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.env {
            command.env(key, value);
        }

        // Own process group so signals also reach wineserver and friends
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
            .spawn()
            .with_context(|| format!("Failed to execute {}", interpreter.display()))
    }

    fn wait_for_exit(&self, child: &mut Child, ctx: &ExecutionContext) -> Result<ExitStatus> {
        let mut terminated_at: Option<Instant> = None;
        loop {
            if let Some(status) = child.try_wait().context("Failed to wait for script")? {
                if terminated_at.is_some() {
                    info!("Script {} stopped on request ({})", self.script.display(), status);
                    return Err(Cancelled.into());
                }
                return Ok(status);
            }

            if ctx.is_forced() {
                warn!("Killing script {}", self.script.display());
                kill(child);
                return Err(Cancelled.into());
            }

            match terminated_at {
                None if ctx.is_cancelled() || self.cancel_requested.load(Ordering::SeqCst) => {
                    info!("Asking script {} to stop", self.script.display());
                    signal_group(child, "TERM");
                    terminated_at = Some(Instant::now());
                }
                Some(sent) if sent.elapsed() >= self.grace_period => {
                    warn!(
                        "Script {} still running {:?} after SIGTERM, killing it",
                        self.script.display(),
                        self.grace_period
                    );
                    kill(child);
                    return Err(Cancelled.into());
                }
                _ => {}
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Send `signal` to the child's whole process group
fn signal_group(child: &Child, signal: &str) {
    #[cfg(unix)]
    {
        let status = Command::new("kill")
            .arg(format!("-{}", signal))
            .arg("--")
            .arg(format!("-{}", child.id()))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = status {
            debug!("Could not send SIG{} to script: {}", signal, e);
        }
    }
    #[cfg(not(unix))]
    let _ = (child, signal);
}

/// Kill the child and everything it spawned, then reap it
fn kill(child: &mut Child) {
    signal_group(child, "KILL");
    if let Err(e) = child.kill() {
        debug!("Kill failed, child probably exited: {}", e);
    }
    let _ = child.wait();
}

fn log_lines<R: Read>(stream: R, is_stderr: bool) {
    let reader = BufReader::new(stream);
    for line in reader.lines().map_while(|line| line.ok()) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_stderr {
            warn!("[script] {}", trimmed);
        } else {
            info!("[script] {}", trimmed);
        }
    }
}

/// Give the readers a moment to flush the tail of the output.
///
/// A background process left behind by the script keeps the pipes open; its
/// reader is detached and ends whenever that process does.
fn drain_readers(readers: Vec<JoinHandle<()>>) {
    let deadline = Instant::now() + OUTPUT_DRAIN;
    while readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    for reader in readers {
        if reader.is_finished() {
            let _ = reader.join();
        } else {
            debug!("Script output still held open by a background process, detaching reader");
        }
    }
}

impl ScriptPayload for CommandPayload {
    fn run(&self, ctx: &ExecutionContext) -> Result<()> {
        ctx.check_cancelled()?;

        let mut child = self.spawn(ctx)?;
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(std::thread::spawn(move || log_lines(stdout, false)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(std::thread::spawn(move || log_lines(stderr, true)));
        }

        let status = self.wait_for_exit(&mut child, ctx);
        drain_readers(readers);
        let status = status?;

        if !status.success() {
            match status.code() {
                Some(code) => bail!("{} exited with code {}", self.script.display(), code),
                None => bail!("{} was terminated by a signal", self.script.display()),
            }
        }

        debug!("Script {} finished", self.script.display());
        Ok(())
    }

    fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptId;
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("install.sh");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn context(drive: &Path, token: CancellationToken) -> ExecutionContext {
        ExecutionContext::new(ScriptId::new(), "test", drive, token)
    }

    #[test]
    fn test_runs_with_wineprefix() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "echo installed > \"$WINEPREFIX/marker\"\n");
        let drive = temp.path().join("drive");
        std::fs::create_dir(&drive).unwrap();

        let payload = CommandPayload::new("sh", &script);
        payload.run(&context(&drive, CancellationToken::new())).unwrap();

        let marker = std::fs::read_to_string(drive.join("marker")).unwrap();
        assert_eq!(marker.trim(), "installed");
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "exit 3\n");

        let payload = CommandPayload::new("sh", &script);
        let err = payload
            .run(&context(temp.path(), CancellationToken::new()))
            .unwrap_err();
        assert!(err.to_string().contains("code 3"));
    }

    #[test]
    fn test_cancel_kills_child() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "sleep 30\n");
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(200));
                token.cancel();
            })
        };

        let started = Instant::now();
        let payload = CommandPayload::new("sh", &script);
        let err = payload.run(&context(temp.path(), token)).unwrap_err();
        canceller.join().unwrap();

        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancel_lets_script_clean_up() {
        let temp = TempDir::new().unwrap();
        let script = write_script(
            temp.path(),
            "trap 'touch \"$WINEPREFIX/cleaned\"; exit 0' TERM\nwhile true; do sleep 0.1; done\n",
        );
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                token.cancel();
            })
        };

        let payload = CommandPayload::new("sh", &script);
        let err = payload.run(&context(temp.path(), token)).unwrap_err();
        canceller.join().unwrap();

        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert!(temp.path().join("cleaned").exists());
    }

    #[test]
    fn test_ignored_term_is_killed_after_grace_period() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "trap '' TERM\nwhile true; do sleep 0.1; done\n");
        let payload = CommandPayload::new("sh", &script).grace_period(Duration::from_millis(300));
        let ctx = context(temp.path(), CancellationToken::new());

        let started = Instant::now();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(200));
                payload.request_cancel();
            });
            let err = payload.run(&ctx).unwrap_err();
            assert!(err.downcast_ref::<Cancelled>().is_some());
        });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_forced_cancel_skips_grace_period() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "trap '' TERM\nwhile true; do sleep 0.1; done\n");
        let force = CancellationToken::new();
        let ctx = context(temp.path(), CancellationToken::new()).with_force(force.clone());

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            force.cancel();
        });

        let started = Instant::now();
        let payload = CommandPayload::new("sh", &script).grace_period(Duration::from_secs(60));
        let err = payload.run(&ctx).unwrap_err();
        canceller.join().unwrap();

        assert!(err.downcast_ref::<Cancelled>().is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_background_child_does_not_hold_run() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "sleep 4 &\necho done\nexit 0\n");

        let started = Instant::now();
        let payload = CommandPayload::new("sh", &script);
        payload
            .run(&context(temp.path(), CancellationToken::new()))
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_missing_interpreter() {
        let temp = TempDir::new().unwrap();
        let script = write_script(temp.path(), "true\n");

        let payload = CommandPayload::new("definitely-not-an-interpreter", &script);
        assert!(payload
            .run(&context(temp.path(), CancellationToken::new()))
            .is_err());
    }
}
