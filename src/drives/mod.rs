//! Virtual drive registry
//!
//! A virtual drive is a named Wine prefix living under the drives root
//! (`<root>/<name>`). The registry knows every drive and whether a job is
//! currently writing to it. Write access is granted through a [`Lease`]:
//! - `acquire` flips a drive from Idle to Busy atomically
//! - the lease returns the drive to Idle when released or dropped
//! - drives are only removed by an explicit `delete`

mod installed;
mod lease;

pub use installed::{InstalledApplication, INSTALLED_FILE_NAME};
pub use lease::Lease;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Maximum length of a drive name.
const MAX_NAME_LEN: usize = 128;

/// Drive registry errors
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("Virtual drive '{drive}' is busy (held by job {owner})")]
    Busy { drive: String, owner: String },

    #[error("Virtual drive not found: {0}")]
    NotFound(String),

    #[error("Invalid virtual drive name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("Virtual drive already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Current state of a drive
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriveState {
    Idle,
    Busy { owner: String },
}

impl DriveState {
    pub fn is_busy(&self) -> bool {
        matches!(self, DriveState::Busy { .. })
    }
}

/// Snapshot of one drive, for enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveDescriptor {
    pub name: String,
    pub path: PathBuf,
    pub state: DriveState,
}

#[derive(Debug)]
struct DriveSlot {
    path: PathBuf,
    owner: Option<String>,
}

type DriveTable = Mutex<HashMap<String, DriveSlot>>;

fn lock_table(table: &DriveTable) -> MutexGuard<'_, HashMap<String, DriveSlot>> {
    table.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of virtual drives and their busy/idle state
pub struct VirtualDriveRegistry {
    root: PathBuf,
    auto_provision: bool,
    drives: Arc<DriveTable>,
}

impl VirtualDriveRegistry {
    /// Open the registry rooted at `root`, discovering existing drive directories.
    pub fn open(root: &Path, auto_provision: bool) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create drives directory: {}", root.display()))?;

        let mut drives = HashMap::new();
        for entry in fs::read_dir(root)
            .with_context(|| format!("Failed to read drives directory: {}", root.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_drive_name(&name).is_err() {
                warn!("Ignoring directory with invalid drive name: {}", name);
                continue;
            }
            drives.insert(
                name,
                DriveSlot {
                    path: entry.path(),
                    owner: None,
                },
            );
        }

        info!(
            "Opened drive registry at {} ({} drives)",
            root.display(),
            drives.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            auto_provision,
            drives: Arc::new(Mutex::new(drives)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn auto_provision(&self) -> bool {
        self.auto_provision
    }

    /// Take exclusive write access to a drive.
    ///
    /// Exactly one of several concurrent callers for the same drive succeeds;
    /// the others get [`DriveError::Busy`] naming the winner.
    pub fn acquire(&self, name: &str, owner: &str) -> Result<Lease, DriveError> {
        validate_drive_name(name)?;

        let mut drives = lock_table(&self.drives);

        if !drives.contains_key(name) {
            if !self.auto_provision {
                return Err(DriveError::NotFound(name.to_string()));
            }
            let path = self.create_drive_dir(name)?;
            info!(drive = %name, "Auto-provisioned virtual drive");
            drives.insert(name.to_string(), DriveSlot { path, owner: None });
        }

        let slot = drives
            .get_mut(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;

        if let Some(current) = &slot.owner {
            return Err(DriveError::Busy {
                drive: name.to_string(),
                owner: current.clone(),
            });
        }

        slot.owner = Some(owner.to_string());
        debug!(drive = %name, owner = %owner, "Drive lease acquired");

        Ok(Lease::new(
            name.to_string(),
            slot.path.clone(),
            owner.to_string(),
            Arc::clone(&self.drives),
        ))
    }

    /// Return a drive to Idle. Equivalent to dropping the lease.
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    /// All known drives, sorted by name.
    pub fn list(&self) -> Vec<DriveDescriptor> {
        let drives = lock_table(&self.drives);
        let mut list: Vec<DriveDescriptor> = drives
            .iter()
            .map(|(name, slot)| describe(name, slot))
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get(&self, name: &str) -> Option<DriveDescriptor> {
        let drives = lock_table(&self.drives);
        drives.get(name).map(|slot| describe(name, slot))
    }

    /// Applications installed into a drive, by id.
    ///
    /// Readable while the drive is busy; the record is replaced atomically.
    pub fn installed_applications(
        &self,
        name: &str,
    ) -> Result<Vec<InstalledApplication>, DriveError> {
        let path = {
            let drives = lock_table(&self.drives);
            drives
                .get(name)
                .map(|slot| slot.path.clone())
                .ok_or_else(|| DriveError::NotFound(name.to_string()))?
        };
        Ok(installed::load(&path)?)
    }

    /// Explicitly create a new, idle drive.
    pub fn provision(&self, name: &str) -> Result<DriveDescriptor, DriveError> {
        validate_drive_name(name)?;

        let mut drives = lock_table(&self.drives);
        if drives.contains_key(name) {
            return Err(DriveError::AlreadyExists(name.to_string()));
        }

        let path = self.create_drive_dir(name)?;
        let slot = DriveSlot { path, owner: None };
        let descriptor = describe(name, &slot);
        drives.insert(name.to_string(), slot);

        info!(drive = %name, "Provisioned virtual drive");
        Ok(descriptor)
    }

    /// Delete a drive and its directory. Refused while the drive is busy.
    pub fn delete(&self, name: &str) -> Result<(), DriveError> {
        let mut drives = lock_table(&self.drives);

        let slot = drives
            .get(name)
            .ok_or_else(|| DriveError::NotFound(name.to_string()))?;

        if let Some(owner) = &slot.owner {
            return Err(DriveError::Busy {
                drive: name.to_string(),
                owner: owner.clone(),
            });
        }

        if slot.path.exists() {
            fs::remove_dir_all(&slot.path)
                .with_context(|| format!("Failed to remove drive: {}", slot.path.display()))?;
        }
        drives.remove(name);

        info!(drive = %name, "Deleted virtual drive");
        Ok(())
    }

    fn create_drive_dir(&self, name: &str) -> Result<PathBuf, DriveError> {
        let path = self.root.join(name);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create drive: {}", path.display()))?;
        Ok(path)
    }
}

fn describe(name: &str, slot: &DriveSlot) -> DriveDescriptor {
    DriveDescriptor {
        name: name.to_string(),
        path: slot.path.clone(),
        state: match &slot.owner {
            Some(owner) => DriveState::Busy {
                owner: owner.clone(),
            },
            None => DriveState::Idle,
        },
    }
}

/// Validate a drive name.
///
/// Rules:
/// - Must not be empty or exceed `MAX_NAME_LEN` characters.
/// - Must not be `.` or `..` and must not contain path separators.
pub fn validate_drive_name(name: &str) -> Result<(), DriveError> {
    let invalid = |reason| {
        Err(DriveError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("name is too long");
    }
    if name == "." || name == ".." {
        return invalid("name must not be a relative path component");
    }
    if name.contains(['/', '\\', '\0']) {
        return invalid("name must not contain path separators");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn registry(auto_provision: bool) -> (TempDir, VirtualDriveRegistry) {
        let temp = TempDir::new().unwrap();
        let registry = VirtualDriveRegistry::open(temp.path(), auto_provision).unwrap();
        (temp, registry)
    }

    #[test]
    fn test_acquire_and_release() {
        let (_temp, registry) = registry(true);

        let lease = registry.acquire("office", "job-1").unwrap();
        assert_eq!(lease.drive(), "office");
        assert!(lease.path().is_dir());
        assert!(registry.get("office").unwrap().state.is_busy());

        registry.release(lease);
        assert_eq!(registry.get("office").unwrap().state, DriveState::Idle);
    }

    #[test]
    fn test_busy_names_owner() {
        let (_temp, registry) = registry(true);

        let _lease = registry.acquire("office", "job-1").unwrap();
        match registry.acquire("office", "job-2") {
            Err(DriveError::Busy { drive, owner }) => {
                assert_eq!(drive, "office");
                assert_eq!(owner, "job-1");
            }
            other => panic!("expected Busy, got {:?}", other.map(|l| l.owner().to_string())),
        }
    }

    #[test]
    fn test_drop_releases_lease() {
        let (_temp, registry) = registry(true);

        {
            let _lease = registry.acquire("games", "job-1").unwrap();
        }
        assert!(registry.acquire("games", "job-2").is_ok());
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let (_temp, registry) = registry(true);
        registry.provision("shared").unwrap();
        let registry = Arc::new(registry);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.acquire("shared", &format!("job-{}", i))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let busy = results
            .iter()
            .filter(|r| matches!(r, Err(DriveError::Busy { .. })))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(busy, 1);

        drop(results);
        assert!(registry.acquire("shared", "job-3").is_ok());
    }

    #[test]
    fn test_unknown_drive_without_auto_provision() {
        let (_temp, registry) = registry(false);
        assert!(matches!(
            registry.acquire("missing", "job-1"),
            Err(DriveError::NotFound(_))
        ));
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_open_discovers_existing_drives() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("alpha")).unwrap();
        fs::create_dir_all(temp.path().join("beta")).unwrap();
        fs::write(temp.path().join("not-a-drive.txt"), b"x").unwrap();

        let registry = VirtualDriveRegistry::open(temp.path(), false).unwrap();
        let names: Vec<_> = registry.list().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert!(registry.acquire("alpha", "job-1").is_ok());
    }

    #[test]
    fn test_delete_refused_while_busy() {
        let (_temp, registry) = registry(true);
        let lease = registry.acquire("temp", "job-1").unwrap();
        let path = lease.path().to_path_buf();

        assert!(matches!(registry.delete("temp"), Err(DriveError::Busy { .. })));
        drop(lease);

        registry.delete("temp").unwrap();
        assert!(!path.exists());
        assert!(registry.get("temp").is_none());
    }

    #[test]
    fn test_provision_twice_fails() {
        let (_temp, registry) = registry(false);
        registry.provision("dup").unwrap();
        assert!(matches!(
            registry.provision("dup"),
            Err(DriveError::AlreadyExists(_))
        ));
    }

    fn application(id: &str, version: &str) -> InstalledApplication {
        InstalledApplication {
            id: id.to_string(),
            name: format!("{} installer", id),
            version: version.to_string(),
            source: "official".to_string(),
            installed_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_installed_applications_recorded_through_lease() {
        let (_temp, registry) = registry(true);
        let lease = registry.acquire("office", "job-1").unwrap();
        assert!(registry.installed_applications("office").unwrap().is_empty());

        lease.record_installed(application("word", "1.0")).unwrap();
        lease.record_installed(application("excel", "1.0")).unwrap();
        lease.record_installed(application("word", "2.0")).unwrap();
        drop(lease);

        let installed = registry.installed_applications("office").unwrap();
        let ids: Vec<_> = installed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["excel", "word"]);
        assert_eq!(installed[1].version, "2.0");
    }

    #[test]
    fn test_installed_record_survives_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let registry = VirtualDriveRegistry::open(temp.path(), true).unwrap();
            let lease = registry.acquire("games", "job-1").unwrap();
            lease.record_installed(application("steam", "1.0")).unwrap();
        }

        let registry = VirtualDriveRegistry::open(temp.path(), false).unwrap();
        assert_eq!(registry.installed_applications("games").unwrap().len(), 1);
        assert!(matches!(
            registry.installed_applications("missing"),
            Err(DriveError::NotFound(_))
        ));
    }

    #[test]
    fn test_drive_name_validation() {
        assert!(validate_drive_name("Steam_32").is_ok());
        assert!(validate_drive_name("").is_err());
        assert!(validate_drive_name("..").is_err());
        assert!(validate_drive_name("a/b").is_err());
        assert!(validate_drive_name("a\\b").is_err());
        assert!(validate_drive_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
