//! Persistence for profile records, folder records and temporary-unlock
//! entries under the private vault root. Every write goes through
//! [`write_atomic`], so a crash never leaves a torn record behind.

use crate::crypto::sha256_hex;
use crate::error::{VaultError, VaultResult};
use crate::model::{FolderRecord, ProfileId, ProfileRecord, TempUnlockEntry};
use crate::paths::{ProfileLayout, PROFILE_METADATA};
use std::fs;
#[cfg(unix)]
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Folder registry key: hash of the folder id, never of its path.
pub fn folder_hash(folder_id: &str) -> String {
    sha256_hex(format!("folder:{folder_id}").as_bytes())[..32].to_string()
}

/// Ciphertext blob name for a file inside a locked folder.
pub fn blob_name(relative_path: &str) -> String {
    format!("{}.enc", &sha256_hex(relative_path.as_bytes())[..32])
}

pub fn write_atomic(path: &Path, data: &[u8]) -> VaultResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| VaultError::InvalidInput(format!("no parent for {}", path.display())))?;
    let mut staging = tempfile::NamedTempFile::new_in(parent)?;
    staging.write_all(data)?;
    staging.as_file().sync_all()?;
    staging.persist(path).map_err(|e| VaultError::Io(e.error))?;
    sync_dir(parent);
    Ok(())
}

pub(crate) fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = OpenOptions::new().read(true).open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

/// Creates `dir` readable by the service account only.
pub(crate) fn create_private_dir(dir: &Path) -> VaultResult<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    root: PathBuf,
}

impl ProfileStore {
    pub fn open(root: impl Into<PathBuf>) -> VaultResult<Self> {
        let root = root.into();
        create_private_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self, profile_id: &str) -> ProfileLayout {
        ProfileLayout::new(&self.root, profile_id)
    }

    pub fn list_ids(&self) -> VaultResult<Vec<ProfileId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if entry.path().join(PROFILE_METADATA).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, profile_id: &str) -> VaultResult<ProfileRecord> {
        if !is_safe_component(profile_id) {
            return Err(VaultError::NotFound("profile".into()));
        }
        let path = self.layout(profile_id).metadata();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotFound("profile".into()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| VaultError::VaultCorrupted(format!("profile record: {e}")))
    }

    /// Unreadable records are skipped with a warning so one damaged profile
    /// does not take the others down with it.
    pub fn load_all(&self) -> VaultResult<Vec<ProfileRecord>> {
        let mut records = Vec::new();
        for id in self.list_ids()? {
            match self.load(&id) {
                Ok(record) => records.push(record),
                Err(e) => warn!(profile = %id, error = %e, "skipping unreadable profile"),
            }
        }
        Ok(records)
    }

    pub fn save(&self, record: &ProfileRecord) -> VaultResult<()> {
        let layout = self.layout(&record.id);
        create_private_dir(layout.dir())?;
        write_atomic(&layout.metadata(), &serde_json::to_vec_pretty(record)?)
    }

    pub fn name_taken(&self, name: &str) -> VaultResult<bool> {
        Ok(self
            .load_all()?
            .iter()
            .any(|p| p.name.eq_ignore_ascii_case(name)))
    }

    /// Removes the whole profile tree: records, ciphertext and temp entries.
    pub fn purge(&self, profile_id: &str) -> VaultResult<()> {
        if !is_safe_component(profile_id) {
            return Err(VaultError::NotFound("profile".into()));
        }
        let dir = self.layout(profile_id).dir().to_path_buf();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            sync_dir(&self.root);
        }
        Ok(())
    }

    pub fn load_folder_record(&self, folder_dir: &Path) -> VaultResult<FolderRecord> {
        let path = folder_dir.join(crate::paths::FOLDER_METADATA);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::VaultCorrupted("folder record missing".into()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data)
            .map_err(|e| VaultError::VaultCorrupted(format!("folder record: {e}")))
    }

    pub fn save_folder_record(&self, folder_dir: &Path, record: &FolderRecord) -> VaultResult<()> {
        write_atomic(
            &folder_dir.join(crate::paths::FOLDER_METADATA),
            &serde_json::to_vec_pretty(record)?,
        )
    }

    pub fn save_temp_unlock(&self, profile_id: &str, entry: &TempUnlockEntry) -> VaultResult<()> {
        let layout = self.layout(profile_id);
        create_private_dir(&layout.temp_unlock())?;
        write_atomic(
            &layout.temp_unlock_entry(&folder_hash(&entry.folder_id)),
            &serde_json::to_vec_pretty(entry)?,
        )
    }

    pub fn remove_temp_unlock(&self, profile_id: &str, folder_id: &str) -> VaultResult<()> {
        let path = self.layout(profile_id).temp_unlock_entry(&folder_hash(folder_id));
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_temp_unlock(&self, profile_id: &str) -> VaultResult<Vec<TempUnlockEntry>> {
        let dir = self.layout(profile_id).temp_unlock();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(VaultError::from).and_then(|d| {
                serde_json::from_slice::<TempUnlockEntry>(&d).map_err(VaultError::from)
            }) {
                Ok(e) => entries.push(e),
                Err(e) => warn!(path = %path.display(), error = %e, "ignoring unreadable temp-unlock entry"),
            }
        }
        Ok(entries)
    }
}

fn is_safe_component(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
