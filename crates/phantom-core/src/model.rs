use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ProfileId = String;
pub type FolderId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnlockMode {
    Temporary,
    Permanent,
}

/// Persisted lifecycle state of a tracked folder. `PermanentlyUnlocked` is
/// terminal and never written to disk: the folder leaves tracking instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FolderState {
    Locked,
    TemporarilyUnlocked,
    PermanentlyUnlocked,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileTimestamps {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

/// Per-file sidecar written next to every ciphertext blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptionMetadata {
    pub algorithm: String,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub original_path: String,
    pub original_permissions: u32,
    pub original_timestamps: FileTimestamps,
    pub file_size: u64,
    pub checksum: String,
}

/// Ciphertext produced by [`crate::crypto::seal`]; encrypt-then-MAC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SealedBlob {
    pub algorithm: String,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub mac: Vec<u8>,
}

/// Detector verifier for a sequence password: `HMAC(install secret, salt || password)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceVerifier {
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

/// Extra sequence password bound to one folder. The folder key is sealed
/// under `PBKDF2(binding password, key_salt)` so the binding alone can open it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceBinding {
    pub verifier: SequenceVerifier,
    #[serde(with = "b64")]
    pub key_salt: Vec<u8>,
    pub sealed_key: SealedBlob,
}

/// Entry in a profile's locked-folder registry. Original paths are kept out
/// of the clear-text registry; they live in the sealed folder manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderEntry {
    pub id: FolderId,
    pub folder_hash: String,
    pub locked_at: DateTime<Utc>,
    pub state: FolderState,
    #[serde(default)]
    pub sequence_binding: Option<SequenceBinding>,
}

/// `<root>/<profileId>/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: ProfileId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub master_key_hash: String,
    pub recovery_key_hash: String,
    #[serde(with = "b64")]
    pub recovery_salt: Vec<u8>,
    pub recovery_sealed_master: SealedBlob,
    pub sequence: SequenceVerifier,
    pub key_generation: u32,
    #[serde(default)]
    pub folders: Vec<FolderEntry>,
}

impl ProfileRecord {
    pub fn folder(&self, folder_id: &str) -> Option<&FolderEntry> {
        self.folders.iter().find(|f| f.id == folder_id)
    }

    pub fn folder_mut(&mut self, folder_id: &str) -> Option<&mut FolderEntry> {
        self.folders.iter_mut().find(|f| f.id == folder_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderAttributes {
    pub permissions: u32,
    pub timestamps: FileTimestamps,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultFile {
    pub relative_path: String,
    pub blob: String,
    pub metadata: EncryptionMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VaultDirectory {
    pub relative_path: String,
    pub permissions: u32,
}

/// Sealed part of a folder record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FolderManifest {
    pub original_path: String,
    pub attributes: FolderAttributes,
    pub directories: Vec<VaultDirectory>,
    pub files: Vec<VaultFile>,
}

impl FolderManifest {
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.metadata.file_size).sum()
    }
}

/// `<root>/<profileId>/folders/<folderHash>/metadata.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub folder_id: FolderId,
    pub profile_id: ProfileId,
    pub locked_at: DateTime<Utc>,
    pub key_generation: u32,
    pub manifest: SealedBlob,
}

/// Public view of a locked folder, only ever produced for its owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedFolder {
    pub id: FolderId,
    pub profile_id: ProfileId,
    pub original_path: String,
    pub vault_location: String,
    pub locked_at: DateTime<Utc>,
    pub state: FolderState,
    pub has_sequence_binding: bool,
    pub file_count: usize,
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileSummary {
    pub id: ProfileId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LockPhase {
    /// Vault copy complete; the original has not been touched.
    Encrypted,
    /// Hiding started; the vault copy is authoritative.
    Hiding,
}

/// `folders/<folderHash>/lock.pending`, present only while a lock is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockJournal {
    pub folder_id: FolderId,
    pub original_path: String,
    pub phase: LockPhase,
}

/// `folders/<folderHash>/unlock.pending`, present only while plaintext is
/// being materialized into `staging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockJournal {
    pub folder_id: FolderId,
    pub staging: String,
}

/// Pushed to the client that started an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum VaultEvent {
    Progress {
        operation_id: String,
        done: u64,
        total: u64,
    },
    FolderLocked {
        profile_id: ProfileId,
        folder_id: FolderId,
    },
    FolderUnlocked {
        profile_id: ProfileId,
        folder_id: FolderId,
        mode: UnlockMode,
    },
    FolderRelocked {
        profile_id: ProfileId,
        folder_id: FolderId,
    },
}

/// `<root>/<profileId>/temp_unlock/<folderHash>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempUnlockEntry {
    pub folder_id: FolderId,
    pub original_path: String,
    pub unlocked_at: DateTime<Utc>,
    /// relative path -> checksum at the moment of exposure
    pub checksums: std::collections::BTreeMap<String, String>,
}

pub(crate) mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
