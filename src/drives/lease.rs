//! Exclusive write access to a virtual drive

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::installed::{self, InstalledApplication};
use super::{lock_table, DriveSlot};

/// Proof that the holder is the only writer of a drive.
///
/// The drive goes back to Idle exactly once: on [`Lease::release`] or when
/// the lease is dropped, whichever comes first. Holding the lease across an
/// early return or a panic therefore cannot leak the Busy state.
pub struct Lease {
    drive: String,
    path: PathBuf,
    owner: String,
    table: Arc<Mutex<HashMap<String, DriveSlot>>>,
    released: bool,
}

impl Lease {
    pub(super) fn new(
        drive: String,
        path: PathBuf,
        owner: String,
        table: Arc<Mutex<HashMap<String, DriveSlot>>>,
    ) -> Self {
        Self {
            drive,
            path,
            owner,
            table,
            released: false,
        }
    }

    /// Name of the leased drive
    pub fn drive(&self) -> &str {
        &self.drive
    }

    /// Filesystem root of the leased drive
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Job id holding the lease
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Record a completed application install on the leased drive.
    pub fn record_installed(&self, application: InstalledApplication) -> anyhow::Result<()> {
        debug!(drive = %self.drive, app = %application.id, "Recording installed application");
        installed::record(&self.path, application)
    }

    /// Return the drive to Idle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut drives = lock_table(&self.table);
        match drives.get_mut(&self.drive) {
            Some(slot) if slot.owner.as_deref() == Some(self.owner.as_str()) => {
                slot.owner = None;
                debug!(drive = %self.drive, owner = %self.owner, "Drive lease released");
            }
            Some(slot) => {
                warn!(
                    drive = %self.drive,
                    owner = %self.owner,
                    current = ?slot.owner,
                    "Lease released for a drive held by someone else"
                );
            }
            None => {
                warn!(drive = %self.drive, "Lease released for a drive that no longer exists");
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("drive", &self.drive)
            .field("owner", &self.owner)
            .field("released", &self.released)
            .finish()
    }
}
