use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "phantomvault";
pub const APP_NAME: &str = "phantom";

pub const PROFILE_METADATA: &str = "metadata.json";
pub const FOLDERS_DIR: &str = "folders";
pub const FOLDER_METADATA: &str = "metadata.json";
pub const ENCRYPTED_FILES_DIR: &str = "encrypted_files";
pub const TEMP_UNLOCK_DIR: &str = "temp_unlock";
pub const STAGING_SUFFIX: &str = ".staging";
pub const LOCK_JOURNAL: &str = "lock.pending";
pub const UNLOCK_JOURNAL: &str = "unlock.pending";
pub const RETIRED_SUFFIX: &str = ".retired";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("PHANTOM_DATA_DIR") {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn vault_root(data_dir: &Path) -> PathBuf {
    data_dir.join("vaults")
}

pub fn settings_path(data_dir: &Path) -> PathBuf {
    data_dir.join("settings.json")
}

pub fn ipc_secret_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc.secret")
}

pub fn sequence_secret_path(data_dir: &Path) -> PathBuf {
    data_dir.join("sequence.secret")
}

pub fn ipc_socket_path() -> anyhow::Result<PathBuf> {
    if let Ok(override_path) = std::env::var("PHANTOM_IPC_SOCKET") {
        return Ok(PathBuf::from(override_path));
    }
    #[cfg(unix)]
    {
        Ok(data_dir()?.join("phantom.ipc"))
    }
    #[cfg(windows)]
    {
        Ok(PathBuf::from(r"\\.\pipe\PhantomVaultIpc"))
    }
}

/// On-disk layout of one profile under the private vault root.
///
/// ```text
/// <root>/<profileId>/metadata.json
/// <root>/<profileId>/folders/<folderHash>/metadata.json
/// <root>/<profileId>/folders/<folderHash>/encrypted_files/*.enc
/// <root>/<profileId>/temp_unlock/
/// ```
#[derive(Debug, Clone)]
pub struct ProfileLayout {
    dir: PathBuf,
}

impl ProfileLayout {
    pub fn new(root: &Path, profile_id: &str) -> Self {
        Self {
            dir: root.join(profile_id),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(PROFILE_METADATA)
    }

    pub fn folders(&self) -> PathBuf {
        self.dir.join(FOLDERS_DIR)
    }

    pub fn folder(&self, folder_hash: &str) -> PathBuf {
        self.folders().join(folder_hash)
    }

    pub fn folder_staging(&self, folder_hash: &str) -> PathBuf {
        self.folders().join(format!("{folder_hash}{STAGING_SUFFIX}"))
    }

    pub fn folder_metadata(&self, folder_hash: &str) -> PathBuf {
        self.folder(folder_hash).join(FOLDER_METADATA)
    }

    pub fn encrypted_files(&self, folder_hash: &str) -> PathBuf {
        self.folder(folder_hash).join(ENCRYPTED_FILES_DIR)
    }

    pub fn lock_journal(&self, folder_hash: &str) -> PathBuf {
        self.folder(folder_hash).join(LOCK_JOURNAL)
    }

    pub fn unlock_journal(&self, folder_hash: &str) -> PathBuf {
        self.folder(folder_hash).join(UNLOCK_JOURNAL)
    }

    pub fn folder_retired(&self, folder_hash: &str) -> PathBuf {
        self.folders().join(format!("{folder_hash}{RETIRED_SUFFIX}"))
    }

    pub fn temp_unlock(&self) -> PathBuf {
        self.dir.join(TEMP_UNLOCK_DIR)
    }

    pub fn temp_unlock_entry(&self, folder_hash: &str) -> PathBuf {
        self.temp_unlock().join(format!("{folder_hash}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_documented_tree() {
        let layout = ProfileLayout::new(Path::new("/vault"), "p1");
        assert_eq!(layout.metadata(), PathBuf::from("/vault/p1/metadata.json"));
        assert_eq!(
            layout.folder_metadata("abc"),
            PathBuf::from("/vault/p1/folders/abc/metadata.json")
        );
        assert_eq!(
            layout.encrypted_files("abc"),
            PathBuf::from("/vault/p1/folders/abc/encrypted_files")
        );
        assert_eq!(layout.temp_unlock(), PathBuf::from("/vault/p1/temp_unlock"));
    }
}
