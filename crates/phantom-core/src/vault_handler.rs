//! Filesystem-level hide/restore of protected folders.
//!
//! Hiding runs after the encrypted copy is committed to the vault: the
//! original tree is restricted first, then every file is overwritten and
//! unlinked, then the root is removed and the post-condition verified.
//! Restoring moves a fully decrypted staging tree into place with one rename.

use crate::error::{VaultError, VaultResult};
use crate::model::{FileTimestamps, FolderAttributes};
use crate::paths::ProfileLayout;
use crate::platform::PlatformAdapter;
use crate::profile::{create_private_dir, sync_dir};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Restore staging directories start with this so orphans can be found after a crash.
pub const RESTORE_STAGING_PREFIX: &str = ".phantom_restore_";

const SCRUB_BLOCK: usize = 64 * 1024;

#[derive(Debug)]
pub enum HideOutcome {
    Hidden,
    /// Nothing was removed; the original folder is exactly as before.
    Untouched(VaultError),
    /// Some plaintext was already removed when hiding stopped.
    Incomplete(VaultError),
}

pub struct VaultHandler<P: PlatformAdapter> {
    platform: Arc<P>,
}

impl<P: PlatformAdapter> VaultHandler<P> {
    pub fn new(platform: Arc<P>) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Idempotent.
    pub fn create_vault_structure(&self, layout: &ProfileLayout) -> VaultResult<()> {
        create_private_dir(layout.dir())?;
        create_private_dir(&layout.folders())?;
        create_private_dir(&layout.temp_unlock())?;
        Ok(())
    }

    pub fn hide_folder(&self, path: &Path) -> HideOutcome {
        match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return HideOutcome::Untouched(VaultError::InvalidInput(
                    "target is not a directory".into(),
                ))
            }
            Err(e) => return HideOutcome::Untouched(e.into()),
        }
        if let Err(e) = self.platform.restrict(path) {
            return HideOutcome::Untouched(VaultError::PrivilegeInsufficient(format!(
                "restrict folder: {e}"
            )));
        }
        if let Err(e) = self.scrub_tree(path) {
            return HideOutcome::Incomplete(e);
        }
        if self.platform.is_visible(path) {
            return HideOutcome::Incomplete(VaultError::PrivilegeInsufficient(
                "folder still visible after hiding".into(),
            ));
        }
        if let Some(parent) = path.parent() {
            sync_dir(parent);
        }
        HideOutcome::Hidden
    }

    fn scrub_tree(&self, root: &Path) -> VaultResult<()> {
        // Read-only subdirectories would block unlinking their contents.
        for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_dir() {
                self.platform.restrict(entry.path())?;
            }
        }
        for entry in WalkDir::new(root).follow_links(false).contents_first(true) {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type();
            if file_type.is_dir() {
                fs::remove_dir(path)?;
            } else if file_type.is_file() {
                self.platform.restrict(path)?;
                scrub_file(path)?;
                fs::remove_file(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    /// Moves a fully materialized `staging` tree to `original` and applies
    /// the folder's recorded attributes.
    pub fn restore_folder(
        &self,
        staging: &Path,
        original: &Path,
        attributes: &FolderAttributes,
    ) -> VaultResult<()> {
        if fs::symlink_metadata(original).is_ok() {
            return Err(VaultError::InvalidState(
                "original location is occupied".into(),
            ));
        }
        if let Some(parent) = original.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(staging, original)?;
        self.platform.release(original, attributes.permissions)?;
        set_dir_times(original, &attributes.timestamps);
        if !self.platform.is_visible(original) {
            return Err(VaultError::InvalidState("restored folder is not visible".into()));
        }
        if let Some(parent) = original.parent() {
            sync_dir(parent);
        }
        debug!("folder restored");
        Ok(())
    }
}

/// Fresh staging directory next to `original`, so the final move is a
/// same-filesystem rename.
pub fn restore_staging_dir(original: &Path) -> VaultResult<PathBuf> {
    let parent = original
        .parent()
        .ok_or_else(|| VaultError::InvalidInput("folder has no parent".into()))?;
    fs::create_dir_all(parent)?;
    let staging = parent.join(format!(
        "{}{:08x}",
        RESTORE_STAGING_PREFIX,
        rand::random::<u32>()
    ));
    create_private_dir(&staging)?;
    Ok(staging)
}

/// Removes restore staging directories left in `dir` by an interrupted unlock.
pub fn cleanup_restore_staging(dir: &Path) -> usize {
    let mut removed = 0;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(RESTORE_STAGING_PREFIX) {
                warn!(path = %entry.path().display(), "removing orphaned restore staging");
                if fs::remove_dir_all(entry.path()).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    removed
}

fn scrub_file(path: &Path) -> VaultResult<()> {
    let meta = fs::metadata(path)?;
    if has_other_links(&meta) {
        return Ok(());
    }
    let mut file = OpenOptions::new().write(true).open(path)?;
    let zeros = vec![0u8; SCRUB_BLOCK];
    let mut remaining = meta.len();
    while remaining > 0 {
        let n = remaining.min(SCRUB_BLOCK as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;
    Ok(())
}

#[cfg(unix)]
fn has_other_links(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.nlink() > 1
}

#[cfg(not(unix))]
fn has_other_links(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
pub(crate) fn set_dir_times(dir: &Path, timestamps: &FileTimestamps) {
    let mut times = fs::FileTimes::new();
    if let Some(modified) = timestamps.modified {
        times = times.set_modified(modified.into());
    }
    if let Some(accessed) = timestamps.accessed {
        times = times.set_accessed(accessed.into());
    }
    if let Err(e) = fs::File::open(dir).and_then(|f| f.set_times(times)) {
        debug!(error = %e, "could not restore directory timestamps");
    }
}

#[cfg(not(unix))]
pub(crate) fn set_dir_times(_dir: &Path, _timestamps: &FileTimestamps) {}
