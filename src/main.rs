//! vinery - application catalog and installer engine for Wine prefixes

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;

use vinery::drives::DriveState;
use vinery::repository::{SyncMode, SyncOutcome};
use vinery::script::{ScriptId, ScriptState};
use vinery::settings::Settings;
use vinery::{logging, Vinery};

#[derive(Parser)]
#[command(name = "vinery")]
#[command(version)]
#[command(about = "Install Windows applications into Wine prefixes from a shared catalog")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to ~/.config/vinery/settings.json)
    #[arg(long, global = true, env = "VINERY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch all repository sources and refresh the catalog
    Sync,

    /// List catalog entries
    Catalog {
        /// Only show entries matching this text
        query: Option<String>,

        /// Only show entries in this category
        #[arg(short, long)]
        category: Option<String>,
    },

    /// Manage virtual drives
    Drives {
        #[command(subcommand)]
        action: DriveCommands,
    },

    /// Run a local installer script against a drive
    Run {
        /// Path to the script
        script: PathBuf,

        /// Target drive
        #[arg(short, long, default_value = "default")]
        drive: String,
    },

    /// Install an application from the catalog
    Install {
        /// Catalog id of the application
        id: String,

        /// Target drive
        #[arg(short, long, default_value = "default")]
        drive: String,

        /// Refresh the catalog before installing
        #[arg(long)]
        sync: bool,
    },

    /// List applications installed from the catalog
    Installed {
        /// Only show this drive
        #[arg(short, long)]
        drive: Option<String>,
    },
}

#[derive(Subcommand)]
enum DriveCommands {
    /// List known drives
    List,

    /// Create an empty drive
    Create { name: String },

    /// Delete a drive and everything in it
    Delete { name: String },
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

async fn sync(app: &Vinery) -> Result<()> {
    let pb = spinner("Synchronizing repositories...");
    let outcome = app.repository().synchronize(SyncMode::Synchronous).await;
    pb.finish_and_clear();

    match outcome? {
        SyncOutcome::Completed(report) => {
            println!(
                "Catalog: {} entries from {} sources",
                report.entries,
                report.fetched.len()
            );
            for failure in &report.failures {
                println!("  {} unavailable: {}", failure.source, failure.reason);
            }
        }
        SyncOutcome::Scheduled => println!("Synchronization scheduled"),
    }
    Ok(())
}

/// Follow a job until it finishes; Ctrl-C switches to immediate shutdown
async fn follow_job(app: &Vinery, id: ScriptId) -> Result<ScriptState> {
    let closer = app.closer();
    let mut events = app.services().subscribe();
    let pb = spinner("Pending");

    let state = loop {
        if let Some(state) = app.services().state(id) {
            if state.is_terminal() {
                break state;
            }
            pb.set_message(state.to_string());
        }

        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.id == id => pb.set_message(event.state.to_string()),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("Job event channel closed"),
            },
            _ = tokio::signal::ctrl_c() => {
                pb.println("Interrupted, cancelling all jobs");
                closer.set_close_immediately(true);
                closer.close().await;
            }
        }
    };
    pb.finish_and_clear();

    closer.close().await;
    Ok(state)
}

fn report_state(state: &ScriptState) -> Result<()> {
    match state {
        ScriptState::Succeeded => {
            println!("Done.");
            Ok(())
        }
        ScriptState::Cancelled => {
            println!("Cancelled.");
            Ok(())
        }
        other => bail!("Script {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    };
    let _log_guard = logging::init(cli.verbose, settings.log_dir().as_deref())?;

    let app = Vinery::from_settings(settings)?;

    match cli.command {
        Commands::Sync => sync(&app).await?,

        Commands::Catalog { query, category } => {
            let catalog = app.repository().catalog();
            if catalog.is_empty() {
                println!("Catalog is empty. Run `vinery sync` first.");
                return Ok(());
            }
            let query = query.unwrap_or_default();
            let mut shown = 0;
            for entry in catalog.search(&query, category.as_deref()) {
                println!(
                    "{:<24} {:<12} {:<12} {}",
                    entry.id, entry.version, entry.category, entry.name
                );
                shown += 1;
            }
            eprintln!("\n{} of {} entries", shown, catalog.len());
        }

        Commands::Drives { action } => match action {
            DriveCommands::List => {
                for drive in app.drives().list() {
                    let state = match &drive.state {
                        DriveState::Idle => "idle".to_string(),
                        DriveState::Busy { owner } => format!("busy ({})", owner),
                    };
                    println!("{:<24} {:<16} {}", drive.name, state, drive.path.display());
                }
            }
            DriveCommands::Create { name } => {
                let drive = app.drives().provision(&name)?;
                println!("Created drive {} at {}", drive.name, drive.path.display());
            }
            DriveCommands::Delete { name } => {
                app.drives().delete(&name)?;
                println!("Deleted drive {}", name);
            }
        },

        Commands::Run { script, drive } => {
            let id = app.run_file(&script, &drive)?;
            let state = follow_job(&app, id).await?;
            report_state(&state)?;
        }

        Commands::Install { id, drive, sync: refresh } => {
            if refresh {
                sync(&app).await?;
            }
            let job = app.install(&id, &drive)?;
            let state = follow_job(&app, job).await?;
            report_state(&state)?;
        }

        Commands::Installed { drive } => {
            let drives = match drive {
                Some(name) => vec![name],
                None => app.drives().list().into_iter().map(|d| d.name).collect(),
            };
            for name in drives {
                let installed = app.installed(&name)?;
                if installed.is_empty() {
                    continue;
                }
                println!("{}:", name);
                for application in installed {
                    println!(
                        "  {:<24} {:<12} {:<12} {}",
                        application.id,
                        application.version,
                        application.source,
                        application.installed_at.format("%Y-%m-%d %H:%M")
                    );
                }
            }
        }
    }

    Ok(())
}
