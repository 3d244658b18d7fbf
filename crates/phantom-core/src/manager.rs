//! Profile vault manager.
//!
//! Owns every profile and its locked-folder registry. All mutations of one
//! profile run under that profile's lock; different profiles proceed in
//! parallel. Folder keys are `HMAC(master key, "folder:" || folder id)` where
//! the master key is `PBKDF2(password, profile salt)`; neither is stored.

use crate::crypto::{
    self, burn_hash_time, capture_attributes, decrypt_file, derive_key, derive_subkey,
    encrypt_file, generate_salt, hash_secret, permission_bits, reencrypt_file, sha256_file,
    set_permission_bits, verify_secret, FileCipher, Key, BLOCK_SIZE, KEY_LEN,
};
use crate::detector::{Candidate, Detection, SharedCandidates};
use crate::error::{VaultError, VaultResult};
use crate::lifecycle::{self, Action, SystemEvent, Trigger};
use crate::model::{
    FolderAttributes, FolderEntry, FolderId, FolderManifest, FolderRecord, FolderState,
    LockJournal, LockPhase, LockedFolder, ProfileId, ProfileRecord, ProfileSummary,
    SequenceBinding, TempUnlockEntry, UnlockJournal, UnlockMode, VaultDirectory, VaultEvent,
    VaultFile,
};
use crate::paths::{ProfileLayout, ENCRYPTED_FILES_DIR, RETIRED_SUFFIX, STAGING_SUFFIX};
use crate::platform::PlatformAdapter;
use crate::profile::{blob_name, create_private_dir, folder_hash, sync_dir, write_atomic, ProfileStore};
use crate::settings::ServiceSettings;
use crate::throttle::AuthThrottle;
use crate::vault_handler::{cleanup_restore_staging, restore_staging_dir, HideOutcome, VaultHandler};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;
use zeroize::Zeroizing;

const RECOVERY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const RECOVERY_GROUPS: usize = 6;
const RECOVERY_GROUP_LEN: usize = 4;
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub iterations: u32,
    pub chunk_size: usize,
    pub min_password_len: usize,
}

impl From<&ServiceSettings> for ManagerConfig {
    fn from(s: &ServiceSettings) -> Self {
        Self {
            iterations: s.crypto.pbkdf2_iterations,
            chunk_size: s.crypto.chunk_size,
            min_password_len: s.detector.min_password_len,
        }
    }
}

pub enum Credential {
    Password(Zeroizing<String>),
    RecoveryKey(Zeroizing<String>),
}

impl Credential {
    pub fn password(secret: impl Into<String>) -> Self {
        Credential::Password(Zeroizing::new(secret.into()))
    }

    pub fn recovery_key(secret: impl Into<String>) -> Self {
        Credential::RecoveryKey(Zeroizing::new(secret.into()))
    }

    fn secret(&self) -> &str {
        match self {
            Credential::Password(s) | Credential::RecoveryKey(s) => s.as_str(),
        }
    }
}

/// Identity, cancellation flag and event channel of one running operation.
#[derive(Clone)]
pub struct OperationControl {
    operation_id: String,
    source: String,
    cancelled: Arc<AtomicBool>,
    events: Option<UnboundedSender<VaultEvent>>,
}

impl OperationControl {
    pub fn new(operation_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            source: source.into(),
            cancelled: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    /// Internal operations (startup recovery, lifecycle signals).
    pub fn system(operation_id: impl Into<String>) -> Self {
        Self::new(operation_id, "system")
    }

    pub fn with_events(mut self, events: UnboundedSender<VaultEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn checkpoint(&self) -> VaultResult<()> {
        if self.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        Ok(())
    }

    fn progress(&self, done: u64, total: u64) {
        self.emit(VaultEvent::Progress {
            operation_id: self.operation_id.clone(),
            done,
            total,
        });
    }

    fn emit(&self, event: VaultEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

pub struct CreatedProfile {
    pub profile_id: ProfileId,
    pub recovery_key: Zeroizing<String>,
}

pub struct RecoveredMaster {
    pub profile_id: ProfileId,
    pub master_password: Zeroizing<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOutcome {
    pub folder: LockedFolder,
    /// False when the vault copy is committed but the original could not be
    /// fully hidden.
    pub original_hidden: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelockSummary {
    pub relocked: usize,
    pub left_exposed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectionOutcome {
    pub profile_id: ProfileId,
    pub unlocked: Vec<FolderId>,
    pub relocked: Vec<FolderId>,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityIssue {
    pub folder_id: FolderId,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub folders_checked: usize,
    pub files_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub staging_removed: usize,
    pub locks_rolled_back: usize,
    pub locks_committed: usize,
    pub orphans_removed: usize,
    pub rehidden: usize,
    pub left_exposed: usize,
}

pub struct ProfileVaultManager<P: PlatformAdapter> {
    store: ProfileStore,
    handler: VaultHandler<P>,
    config: ManagerConfig,
    candidates: SharedCandidates,
    throttle: AuthThrottle,
    profile_locks: Mutex<HashMap<ProfileId, Arc<Mutex<()>>>>,
    /// Keys of temporarily unlocked folders, needed to re-encrypt edits on re-lock.
    exposed_keys: Mutex<HashMap<FolderId, Key>>,
}

impl<P: PlatformAdapter> ProfileVaultManager<P> {
    pub fn new(
        store: ProfileStore,
        platform: Arc<P>,
        config: ManagerConfig,
        candidates: SharedCandidates,
        throttle: AuthThrottle,
    ) -> VaultResult<Self> {
        let manager = Self {
            store,
            handler: VaultHandler::new(platform),
            config,
            candidates,
            throttle,
            profile_locks: Mutex::new(HashMap::new()),
            exposed_keys: Mutex::new(HashMap::new()),
        };
        for record in manager.store.load_all()? {
            manager.refresh_candidates(&record);
        }
        Ok(manager)
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn platform(&self) -> &P {
        self.handler.platform()
    }

    pub fn candidates(&self) -> &SharedCandidates {
        &self.candidates
    }

    fn profile_lock(&self, profile_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.profile_locks.lock();
        locks
            .entry(profile_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Profiles ────────────────────────────────────────────────────────────

    pub fn create_profile(&self, name: &str, password: &str) -> VaultResult<CreatedProfile> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(VaultError::InvalidInput("profile name must be 1-64 characters".into()));
        }
        self.check_password_strength(password)?;
        if self.store.name_taken(name)? {
            return Err(VaultError::InvalidInput("profile name already in use".into()));
        }

        let profile_id = Uuid::new_v4().to_string();
        let salt = self.unique_salt(None)?;
        let recovery_key = generate_recovery_key();
        let creds = self.seal_credentials(password, &recovery_key, self.config.iterations)?;
        let record = ProfileRecord {
            id: profile_id.clone(),
            name: name.to_string(),
            created_at: Utc::now(),
            salt,
            iterations: self.config.iterations,
            master_key_hash: creds.master_key_hash,
            recovery_key_hash: creds.recovery_key_hash,
            recovery_salt: creds.recovery_salt,
            recovery_sealed_master: creds.recovery_sealed_master,
            sequence: creds.sequence,
            key_generation: 1,
            folders: Vec::new(),
        };

        let lock = self.profile_lock(&profile_id);
        let _guard = lock.lock();
        self.handler.create_vault_structure(&self.store.layout(&profile_id))?;
        self.store.save(&record)?;
        self.refresh_candidates(&record);
        info!(profile_id = %profile_id, "profile created");
        Ok(CreatedProfile {
            profile_id,
            recovery_key,
        })
    }

    pub fn list_profiles(&self) -> VaultResult<Vec<ProfileSummary>> {
        Ok(self
            .store
            .load_all()?
            .into_iter()
            .map(|p| ProfileSummary {
                id: p.id,
                name: p.name,
                created_at: p.created_at,
            })
            .collect())
    }

    /// Destroys the profile and every vault copy it owns. Plaintext of
    /// temporarily unlocked folders stays where it is.
    pub fn delete_profile(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        credential: &Credential,
    ) -> VaultResult<()> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        let (record, _master) = self.authenticate(ctl, profile_id, credential)?;
        self.store.purge(&record.id)?;
        {
            let mut keys = self.exposed_keys.lock();
            for folder in &record.folders {
                keys.remove(&folder.id);
            }
        }
        self.candidates.write().remove_profile(&record.id);
        info!(profile_id = %record.id, folders = record.folders.len(), "profile deleted");
        Ok(())
    }

    /// Re-keys every folder under the new password and returns the new
    /// recovery key. The previous recovery key stops working.
    pub fn change_password(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        current: &Credential,
        new_password: &str,
    ) -> VaultResult<Zeroizing<String>> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        let (record, old_master) = self.authenticate(ctl, profile_id, current)?;
        self.check_password_strength(new_password)?;

        let exposed: Vec<FolderEntry> = record
            .folders
            .iter()
            .filter(|f| f.state == FolderState::TemporarilyUnlocked)
            .cloned()
            .collect();
        for entry in &exposed {
            let key = folder_key(&old_master, &entry.id)?;
            let current = self.store.load(&record.id)?;
            self.conceal(ctl, current, entry, Some(key))?;
        }

        let mut record = self.store.load(&record.id)?;
        let layout = self.store.layout(&record.id);
        let new_salt = self.unique_salt(Some(&record.id))?;
        let new_generation = record.key_generation + 1;
        let new_master = derive_key(new_password.as_bytes(), &new_salt, record.iterations)?;

        let total = record.folders.len() as u64;
        let staged = (|| -> VaultResult<()> {
            for (i, entry) in record.folders.iter().enumerate() {
                ctl.checkpoint()?;
                let old_key = folder_key(&old_master, &entry.id)?;
                let new_key = folder_key(&new_master, &entry.id)?;
                self.rotate_folder(ctl, &layout, entry, &old_key, &new_key, &new_salt, record.iterations, new_generation)?;
                ctl.progress(i as u64 + 1, total);
            }
            Ok(())
        })();
        if let Err(e) = staged {
            for entry in &record.folders {
                remove_dir_quietly(&layout.folder_staging(&entry.folder_hash));
            }
            return Err(e);
        }

        let mut swapped = Vec::new();
        for entry in &record.folders {
            if let Err(e) = self.swap_folder_dir(&layout, &entry.folder_hash, true) {
                self.rollback_swaps(&layout, &swapped);
                for entry in &record.folders {
                    remove_dir_quietly(&layout.folder_staging(&entry.folder_hash));
                }
                return Err(e);
            }
            swapped.push(entry.folder_hash.clone());
        }

        let recovery_key = generate_recovery_key();
        let creds = self.seal_credentials(new_password, &recovery_key, record.iterations)?;
        record.salt = new_salt;
        record.master_key_hash = creds.master_key_hash;
        record.recovery_key_hash = creds.recovery_key_hash;
        record.recovery_salt = creds.recovery_salt;
        record.recovery_sealed_master = creds.recovery_sealed_master;
        record.sequence = creds.sequence;
        record.key_generation = new_generation;
        for folder in record.folders.iter_mut() {
            // Bindings seal the old folder key.
            folder.sequence_binding = None;
        }
        if let Err(e) = self.store.save(&record) {
            self.rollback_swaps(&layout, &swapped);
            return Err(e);
        }
        for hash in &swapped {
            remove_dir_quietly(&layout.folder_retired(hash));
        }
        self.refresh_candidates(&record);
        info!(profile_id = %record.id, folders = record.folders.len(), "profile password changed");
        Ok(recovery_key)
    }

    /// Exchanges a recovery key for the master password of the profile it
    /// belongs to. Every profile is checked so the cost does not depend on
    /// which one matches.
    pub fn recover_master_key(
        &self,
        ctl: &OperationControl,
        recovery_key: &str,
    ) -> VaultResult<RecoveredMaster> {
        if self.throttle.is_locked_out(ctl.source()) {
            burn_hash_time(recovery_key);
            return Err(VaultError::RateLimited);
        }
        let canonical = Zeroizing::new(normalize_recovery_key(recovery_key).unwrap_or_default());
        let records = self.store.load_all()?;
        if records.is_empty() {
            burn_hash_time(&canonical);
        }
        let mut found = None;
        for record in records {
            let matched = verify_secret(&canonical, &record.recovery_key_hash);
            if matched && found.is_none() {
                found = Some(record);
            }
        }
        let Some(record) = found else {
            self.throttle.record_failure(ctl.source());
            return Err(VaultError::AuthenticationFailed);
        };
        let master_password = open_recovery(&record, &canonical)?;
        self.throttle.record_success(ctl.source());
        info!(profile_id = %record.id, "master password recovered");
        Ok(RecoveredMaster {
            profile_id: record.id,
            master_password,
        })
    }

    // ── Folders ─────────────────────────────────────────────────────────────

    pub fn lock_folder(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        folder_path: &Path,
        credential: &Credential,
    ) -> VaultResult<LockOutcome> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        let (mut record, master) = self.authenticate(ctl, profile_id, credential)?;
        let original = self.validate_lock_target(&record, &master, folder_path)?;

        let folder_id = Uuid::new_v4().to_string();
        let hash = folder_hash(&folder_id);
        let layout = self.store.layout(&record.id);
        self.handler.create_vault_structure(&layout)?;
        let key = folder_key(&master, &folder_id)?;

        let staging = layout.folder_staging(&hash);
        let locked_at = Utc::now();
        let manifest = match self.stage_vault_copy(ctl, &record, &folder_id, &original, &staging, &key, locked_at) {
            Ok(manifest) => manifest,
            Err(e) => {
                remove_dir_quietly(&staging);
                return Err(lock_failure(e));
            }
        };

        let live = layout.folder(&hash);
        let journal = LockJournal {
            folder_id: folder_id.clone(),
            original_path: manifest.original_path.clone(),
            phase: LockPhase::Encrypted,
        };
        let committed = fs::rename(&staging, &live)
            .map_err(VaultError::from)
            .and_then(|_| write_journal(&layout.lock_journal(&hash), &journal))
            .and_then(|_| ctl.checkpoint());
        if let Err(e) = committed {
            remove_dir_quietly(&staging);
            remove_dir_quietly(&live);
            return Err(lock_failure(e));
        }

        // Past this point the operation always completes.
        let journal = LockJournal {
            phase: LockPhase::Hiding,
            ..journal
        };
        if let Err(e) = write_journal(&layout.lock_journal(&hash), &journal) {
            remove_dir_quietly(&live);
            return Err(lock_failure(e));
        }
        let original_hidden = match self.handler.hide_folder(&original) {
            HideOutcome::Hidden => true,
            HideOutcome::Untouched(e) => {
                remove_dir_quietly(&live);
                warn!(profile_id = %record.id, error = %e, "folder could not be hidden; lock rolled back");
                return Err(e);
            }
            HideOutcome::Incomplete(e) => {
                error!(profile_id = %record.id, folder_id = %folder_id, error = %e,
                    "vault copy committed but original not fully hidden");
                false
            }
        };

        let entry = FolderEntry {
            id: folder_id.clone(),
            folder_hash: hash.clone(),
            locked_at,
            state: FolderState::Locked,
            sequence_binding: None,
        };
        record.folders.push(entry.clone());
        self.store.save(&record)?;
        remove_journal(&layout.lock_journal(&hash));

        info!(profile_id = %record.id, folder_id = %folder_id, files = manifest.files.len(), "folder locked");
        ctl.emit(VaultEvent::FolderLocked {
            profile_id: record.id.clone(),
            folder_id,
        });
        Ok(LockOutcome {
            folder: self.locked_view(&record, &entry, &manifest),
            original_hidden,
        })
    }

    pub fn unlock_folder(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        folder_id: &str,
        mode: UnlockMode,
        credential: &Credential,
    ) -> VaultResult<PathBuf> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        self.check_ownership(profile_id, folder_id)?;
        let (record, master) = self.authenticate(ctl, profile_id, credential)?;
        let entry = owned_entry(&record, folder_id)?.clone();
        lifecycle::transition(entry.state, Trigger::Unlock(mode))?;
        let key = folder_key(&master, folder_id)?;
        self.expose(ctl, record, &entry, key, mode)
    }

    /// Re-locks one temporarily unlocked folder.
    pub fn relock_folder(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        folder_id: &str,
        credential: &Credential,
    ) -> VaultResult<bool> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        self.check_ownership(profile_id, folder_id)?;
        let (record, master) = self.authenticate(ctl, profile_id, credential)?;
        let entry = owned_entry(&record, folder_id)?.clone();
        lifecycle::transition(entry.state, Trigger::Relock)?;
        let key = folder_key(&master, folder_id)?;
        self.conceal(ctl, record, &entry, Some(key))
    }

    /// Re-locks every temporarily unlocked folder of every profile. Folders
    /// edited while exposed are re-encrypted with the key kept from their
    /// unlock; without it they stay exposed until their owner re-authenticates.
    pub fn lock_all(&self, ctl: &OperationControl, trigger: Trigger) -> VaultResult<RelockSummary> {
        let mut summary = RelockSummary::default();
        for profile_id in self.store.list_ids()? {
            let lock = self.profile_lock(&profile_id);
            let _guard = lock.lock();
            let record = match self.store.load(&profile_id) {
                Ok(record) => record,
                Err(e) => {
                    warn!(profile_id = %profile_id, error = %e, "skipping profile during lock-all");
                    continue;
                }
            };
            for entry in record.folders.iter().filter(|f| f.state == FolderState::TemporarilyUnlocked) {
                let action = match lifecycle::transition(entry.state, trigger) {
                    Ok((_, action)) => action,
                    Err(e) => {
                        warn!(profile_id = %profile_id, folder_id = %entry.id, error = %e, "re-lock rejected");
                        summary.failed += 1;
                        continue;
                    }
                };
                if action != Action::Conceal {
                    continue;
                }
                let current = match self.store.load(&profile_id) {
                    Ok(current) => current,
                    Err(e) => {
                        warn!(profile_id = %profile_id, folder_id = %entry.id, error = %e, "re-lock failed");
                        summary.failed += 1;
                        continue;
                    }
                };
                match self.conceal(ctl, current, entry, None) {
                    Ok(_) => summary.relocked += 1,
                    Err(VaultError::InvalidState(_)) => summary.left_exposed += 1,
                    Err(e) => {
                        warn!(profile_id = %profile_id, folder_id = %entry.id, error = %e, "re-lock failed");
                        summary.failed += 1;
                    }
                }
            }
        }
        info!(relocked = summary.relocked, left_exposed = summary.left_exposed,
            failed = summary.failed, "lock-all finished");
        Ok(summary)
    }

    pub fn on_system_event(&self, ctl: &OperationControl, event: SystemEvent) -> VaultResult<RelockSummary> {
        if !event.requires_relock() {
            return Ok(RelockSummary::default());
        }
        info!(event = ?event, "system lifecycle signal");
        self.lock_all(ctl, Trigger::System(event))
    }

    pub fn list_folders(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        credential: &Credential,
    ) -> VaultResult<Vec<LockedFolder>> {
        let (record, master) = self.authenticate(ctl, profile_id, credential)?;
        let layout = self.store.layout(&record.id);
        let mut folders = Vec::with_capacity(record.folders.len());
        for entry in &record.folders {
            let key = folder_key(&master, &entry.id)?;
            match self.open_manifest(&layout.folder(&entry.folder_hash), &key) {
                Ok(manifest) => folders.push(self.locked_view(&record, entry, &manifest)),
                Err(e) => warn!(folder_id = %entry.id, error = %e, "folder manifest unreadable"),
            }
        }
        Ok(folders)
    }

    /// Binds (or with `None`, clears) an extra sequence password to one folder.
    pub fn bind_sequence(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        folder_id: &str,
        credential: &Credential,
        sequence: Option<&str>,
    ) -> VaultResult<()> {
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        self.check_ownership(profile_id, folder_id)?;
        let (mut record, master) = self.authenticate(ctl, profile_id, credential)?;
        owned_entry(&record, folder_id)?;

        let binding = match sequence {
            None => None,
            Some(sequence) => {
                if sequence.chars().count() < self.config.min_password_len {
                    return Err(VaultError::InvalidInput("sequence password too short".into()));
                }
                if verify_secret(sequence, &record.master_key_hash) {
                    return Err(VaultError::InvalidInput(
                        "sequence password must differ from the master password".into(),
                    ));
                }
                let key = folder_key(&master, folder_id)?;
                let key_salt = generate_salt().to_vec();
                let kek = derive_key(sequence.as_bytes(), &key_salt, record.iterations)?;
                Some(SequenceBinding {
                    verifier: self.candidates.read().make_verifier(sequence)?,
                    key_salt,
                    sealed_key: crypto::seal(&kek[..], &key[..])?,
                })
            }
        };
        let bound = binding.is_some();
        if let Some(entry) = record.folder_mut(folder_id) {
            entry.sequence_binding = binding;
        }
        self.store.save(&record)?;
        self.refresh_candidates(&record);
        info!(profile_id = %record.id, folder_id, bound, "folder sequence binding updated");
        Ok(())
    }

    /// Acts on a keyboard detection: the matched profile's (or bound
    /// folder's) exposed folders are re-locked if there are any, otherwise
    /// its locked folders are unlocked in the detected mode.
    pub fn handle_detection(
        &self,
        ctl: &OperationControl,
        detection: &Detection,
    ) -> VaultResult<DetectionOutcome> {
        match &detection.folder_id {
            Some(folder_id) => self.toggle_bound_folder(ctl, detection, folder_id),
            None => self.toggle_profile(ctl, detection),
        }
    }

    fn toggle_profile(&self, ctl: &OperationControl, detection: &Detection) -> VaultResult<DetectionOutcome> {
        let profile_id = detection.profile_id.as_str();
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        let credential = Credential::password(detection.password.as_str());
        let (record, master) = self.authenticate(ctl, profile_id, &credential)?;
        let mut outcome = DetectionOutcome {
            profile_id: record.id.clone(),
            ..Default::default()
        };

        let exposed: Vec<FolderEntry> = record
            .folders
            .iter()
            .filter(|f| f.state == FolderState::TemporarilyUnlocked)
            .cloned()
            .collect();
        if !exposed.is_empty() {
            for entry in exposed {
                let key = folder_key(&master, &entry.id)?;
                let current = self.store.load(profile_id)?;
                match self.conceal(ctl, current, &entry, Some(key)) {
                    Ok(_) => outcome.relocked.push(entry.id),
                    Err(e) => {
                        warn!(folder_id = %entry.id, error = %e, "toggle re-lock failed");
                        outcome.failed += 1;
                    }
                }
            }
            return Ok(outcome);
        }

        let locked: Vec<FolderEntry> = record
            .folders
            .iter()
            .filter(|f| f.state == FolderState::Locked)
            .cloned()
            .collect();
        for entry in locked {
            lifecycle::transition(entry.state, Trigger::SequenceMatch(detection.mode))?;
            let key = folder_key(&master, &entry.id)?;
            let current = self.store.load(profile_id)?;
            match self.expose(ctl, current, &entry, key, detection.mode) {
                Ok(_) => outcome.unlocked.push(entry.id),
                Err(e) => {
                    warn!(folder_id = %entry.id, error = %e, "sequence unlock failed");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    fn toggle_bound_folder(
        &self,
        ctl: &OperationControl,
        detection: &Detection,
        folder_id: &str,
    ) -> VaultResult<DetectionOutcome> {
        let profile_id = detection.profile_id.as_str();
        let lock = self.profile_lock(profile_id);
        let _guard = lock.lock();
        if self.throttle.is_locked_out(ctl.source()) {
            return Err(VaultError::RateLimited);
        }
        let record = match self.store.load(profile_id) {
            Ok(record) => record,
            Err(VaultError::NotFound(_)) => return Err(VaultError::AuthenticationFailed),
            Err(e) => return Err(e),
        };
        let entry = record
            .folder(folder_id)
            .cloned()
            .ok_or(VaultError::AuthenticationFailed)?;
        let key = match entry
            .sequence_binding
            .as_ref()
            .ok_or(VaultError::AuthenticationFailed)
            .and_then(|b| open_binding(b, &detection.password, record.iterations))
        {
            Ok(key) => key,
            Err(_) => {
                self.throttle.record_failure(ctl.source());
                return Err(VaultError::AuthenticationFailed);
            }
        };
        self.throttle.record_success(ctl.source());

        let mut outcome = DetectionOutcome {
            profile_id: record.id.clone(),
            ..Default::default()
        };
        let (_, action) = lifecycle::transition(entry.state, Trigger::SequenceMatch(detection.mode))?;
        match action {
            Action::Conceal => {
                self.conceal(ctl, record, &entry, Some(key))?;
                outcome.relocked.push(entry.id);
            }
            Action::Expose(mode) => {
                self.expose(ctl, record, &entry, key, mode)?;
                outcome.unlocked.push(entry.id);
            }
            Action::None => {}
        }
        Ok(outcome)
    }

    pub fn validate_integrity(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        credential: &Credential,
    ) -> VaultResult<IntegrityReport> {
        let (record, master) = self.authenticate(ctl, profile_id, credential)?;
        let layout = self.store.layout(&record.id);
        let mut report = IntegrityReport::default();
        for entry in &record.folders {
            report.folders_checked += 1;
            let mut issue = |detail: String| {
                report.issues.push(IntegrityIssue {
                    folder_id: entry.id.clone(),
                    detail,
                })
            };
            let live = layout.folder(&entry.folder_hash);
            let folder_record = match self.store.load_folder_record(&live) {
                Ok(r) => r,
                Err(e) => {
                    issue(e.to_string());
                    continue;
                }
            };
            if folder_record.folder_id != entry.id || folder_record.profile_id != record.id {
                issue("folder record does not belong to this registry entry".into());
                continue;
            }
            if folder_record.key_generation != record.key_generation {
                issue("folder key generation is stale".into());
            }
            let key = folder_key(&master, &entry.id)?;
            let manifest = match open_manifest_blob(&folder_record, &key) {
                Ok(m) => m,
                Err(e) => {
                    issue(e.to_string());
                    continue;
                }
            };
            let files_dir = layout.encrypted_files(&entry.folder_hash);
            let mut problems = Vec::new();
            for file in &manifest.files {
                let expected = ciphertext_len(file.metadata.file_size);
                match fs::metadata(files_dir.join(&file.blob)) {
                    Ok(meta) if meta.len() == expected => {}
                    Ok(_) => problems.push(format!("{}: ciphertext length mismatch", file.relative_path)),
                    Err(_) => problems.push(format!("{}: ciphertext missing", file.relative_path)),
                }
            }
            for problem in problems {
                issue(problem);
            }
            report.files_checked += manifest.files.len();
        }
        info!(profile_id = %record.id, folders = report.folders_checked,
            issues = report.issues.len(), "integrity check finished");
        Ok(report)
    }

    pub fn exposed_folder_count(&self) -> VaultResult<usize> {
        Ok(self
            .store
            .load_all()?
            .iter()
            .flat_map(|p| p.folders.iter())
            .filter(|f| f.state == FolderState::TemporarilyUnlocked)
            .count())
    }

    // ── Startup recovery ────────────────────────────────────────────────────

    /// Resolves whatever a previous run left half done. Runs before the IPC
    /// server and the detector start.
    pub fn recover_on_startup(&self) -> VaultResult<RecoveryReport> {
        let ctl = OperationControl::system("startup-recovery");
        let mut report = RecoveryReport::default();
        for profile_id in self.store.list_ids()? {
            let lock = self.profile_lock(&profile_id);
            let _guard = lock.lock();
            if let Err(e) = self.recover_profile(&ctl, &profile_id, &mut report) {
                error!(profile_id = %profile_id, error = %e, "startup recovery failed for profile");
            }
        }
        info!(
            staging_removed = report.staging_removed,
            locks_rolled_back = report.locks_rolled_back,
            locks_committed = report.locks_committed,
            orphans_removed = report.orphans_removed,
            rehidden = report.rehidden,
            left_exposed = report.left_exposed,
            "startup recovery finished"
        );
        Ok(report)
    }

    fn recover_profile(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        report: &mut RecoveryReport,
    ) -> VaultResult<()> {
        let mut record = self.store.load(profile_id)?;
        let layout = self.store.layout(profile_id);
        let folders_dir = layout.folders();
        if folders_dir.is_dir() {
            let mut names: Vec<String> = fs::read_dir(&folders_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();

            for name in names.iter().filter(|n| n.ends_with(STAGING_SUFFIX)) {
                remove_dir_quietly(&folders_dir.join(name));
                report.staging_removed += 1;
            }
            for name in names.iter().filter(|n| n.ends_with(RETIRED_SUFFIX)) {
                let hash = name.trim_end_matches(RETIRED_SUFFIX);
                self.resolve_retired(&layout, &record, hash)?;
            }

            let live: Vec<&String> = names
                .iter()
                .filter(|n| !n.ends_with(STAGING_SUFFIX) && !n.ends_with(RETIRED_SUFFIX))
                .collect();
            for hash in live {
                let dir = layout.folder(hash);
                if !dir.is_dir() {
                    continue;
                }
                report.staging_removed += self.recover_unlock_journal(&layout, hash);
                let tracked = record.folders.iter().any(|f| &f.folder_hash == hash);
                let journal_path = layout.lock_journal(hash);
                if journal_path.exists() {
                    let journal: Option<LockJournal> = fs::read(&journal_path)
                        .ok()
                        .and_then(|d| serde_json::from_slice(&d).ok());
                    match (tracked, journal) {
                        (true, _) => {
                            remove_journal(&journal_path);
                        }
                        (false, Some(journal)) if journal.phase == LockPhase::Hiding => {
                            let locked_at = self
                                .store
                                .load_folder_record(&dir)
                                .map(|r| r.locked_at)
                                .unwrap_or_else(|_| Utc::now());
                            record.folders.push(FolderEntry {
                                id: journal.folder_id.clone(),
                                folder_hash: hash.clone(),
                                locked_at,
                                state: FolderState::Locked,
                                sequence_binding: None,
                            });
                            self.store.save(&record)?;
                            let original = PathBuf::from(&journal.original_path);
                            if self.handler.platform().is_visible(&original) {
                                if let HideOutcome::Untouched(e) | HideOutcome::Incomplete(e) =
                                    self.handler.hide_folder(&original)
                                {
                                    warn!(folder_id = %journal.folder_id, error = %e,
                                        "interrupted lock committed but original not hidden");
                                }
                            }
                            remove_journal(&journal_path);
                            report.locks_committed += 1;
                        }
                        (false, _) => {
                            // Hiding never started: the original is intact.
                            remove_dir_quietly(&dir);
                            report.locks_rolled_back += 1;
                        }
                    }
                } else if !tracked {
                    remove_dir_quietly(&dir);
                    report.orphans_removed += 1;
                }
            }
        }

        for temp in self.store.list_temp_unlock(profile_id)? {
            let state = record.folder(&temp.folder_id).map(|f| f.state);
            match state {
                Some(FolderState::TemporarilyUnlocked) => {
                    let entry = record
                        .folder(&temp.folder_id)
                        .cloned()
                        .ok_or_else(|| VaultError::NotFound("folder".into()))?;
                    match self.conceal(ctl, record.clone(), &entry, None) {
                        Ok(_) => report.rehidden += 1,
                        Err(e) => {
                            warn!(folder_id = %entry.id, error = %e,
                                "temporarily unlocked folder left exposed until its owner re-authenticates");
                            report.left_exposed += 1;
                        }
                    }
                    record = self.store.load(profile_id)?;
                }
                _ => self.store.remove_temp_unlock(profile_id, &temp.folder_id)?,
            }
        }
        Ok(())
    }

    fn recover_unlock_journal(&self, layout: &ProfileLayout, hash: &str) -> usize {
        let path = layout.unlock_journal(hash);
        let Ok(data) = fs::read(&path) else {
            return 0;
        };
        let removed = serde_json::from_slice::<UnlockJournal>(&data)
            .ok()
            .and_then(|journal| PathBuf::from(journal.staging).parent().map(Path::to_path_buf))
            .map(|parent| cleanup_restore_staging(&parent))
            .unwrap_or(0);
        remove_journal(&path);
        removed
    }

    fn resolve_retired(&self, layout: &ProfileLayout, record: &ProfileRecord, hash: &str) -> VaultResult<()> {
        let live = layout.folder(hash);
        let retired = layout.folder_retired(hash);
        if !live.exists() {
            fs::rename(&retired, &live)?;
            return Ok(());
        }
        let live_generation = self.store.load_folder_record(&live).map(|r| r.key_generation).ok();
        if live_generation.map_or(true, |g| g > record.key_generation) {
            // Password change never committed.
            remove_dir_quietly(&live);
            fs::rename(&retired, &live)?;
        } else {
            remove_dir_quietly(&retired);
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn authenticate(
        &self,
        ctl: &OperationControl,
        profile_id: &str,
        credential: &Credential,
    ) -> VaultResult<(ProfileRecord, Key)> {
        if self.throttle.is_locked_out(ctl.source()) {
            burn_hash_time(credential.secret());
            return Err(VaultError::RateLimited);
        }
        let record = match self.store.load(profile_id) {
            Ok(record) => record,
            Err(VaultError::NotFound(_)) => {
                burn_hash_time(credential.secret());
                self.throttle.record_failure(ctl.source());
                return Err(VaultError::AuthenticationFailed);
            }
            Err(e) => return Err(e),
        };
        match verify_credential(&record, credential) {
            Some(master) => {
                self.throttle.record_success(ctl.source());
                self.candidates.write().set_active_profile(Some(record.id.clone()));
                Ok((record, master))
            }
            None => {
                self.throttle.record_failure(ctl.source());
                Err(VaultError::AuthenticationFailed)
            }
        }
    }

    /// Rejects folder ids owned by a different profile. Unknown ids pass
    /// here and surface as not-found only after authentication.
    fn check_ownership(&self, profile_id: &str, folder_id: &str) -> VaultResult<()> {
        let record = match self.store.load(profile_id) {
            Ok(record) => record,
            Err(VaultError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if record.folder(folder_id).is_some() {
            return Ok(());
        }
        for other in self.store.load_all()? {
            if other.id != record.id && other.folder(folder_id).is_some() {
                warn!(profile_id = %record.id, "cross-profile folder access rejected");
                return Err(VaultError::IsolationViolation(
                    "folder is not owned by the requesting profile".into(),
                ));
            }
        }
        Ok(())
    }

    fn check_password_strength(&self, password: &str) -> VaultResult<()> {
        if password.chars().count() < self.config.min_password_len {
            return Err(VaultError::InvalidInput(format!(
                "password must be at least {} characters",
                self.config.min_password_len
            )));
        }
        Ok(())
    }

    fn unique_salt(&self, replacing: Option<&str>) -> VaultResult<Vec<u8>> {
        let existing = self.store.load_all()?;
        loop {
            let salt = generate_salt().to_vec();
            let clash = existing
                .iter()
                .any(|p| Some(p.id.as_str()) != replacing && p.salt == salt);
            if !clash {
                return Ok(salt);
            }
        }
    }

    fn seal_credentials(
        &self,
        password: &str,
        recovery_key: &str,
        iterations: u32,
    ) -> VaultResult<CredentialMaterial> {
        let recovery_salt = generate_salt().to_vec();
        let kek = derive_key(recovery_key.as_bytes(), &recovery_salt, iterations)?;
        Ok(CredentialMaterial {
            master_key_hash: hash_secret(password)?,
            recovery_key_hash: hash_secret(recovery_key)?,
            recovery_sealed_master: crypto::seal(&kek[..], password.as_bytes())?,
            recovery_salt,
            sequence: self.candidates.read().make_verifier(password)?,
        })
    }

    fn refresh_candidates(&self, record: &ProfileRecord) {
        let mut candidates = vec![Candidate {
            profile_id: record.id.clone(),
            folder_id: None,
            verifier: record.sequence.clone(),
        }];
        for folder in &record.folders {
            if let Some(binding) = &folder.sequence_binding {
                candidates.push(Candidate {
                    profile_id: record.id.clone(),
                    folder_id: Some(folder.id.clone()),
                    verifier: binding.verifier.clone(),
                });
            }
        }
        self.candidates.write().replace_profile(&record.id, candidates);
    }

    fn validate_lock_target(
        &self,
        record: &ProfileRecord,
        master: &Key,
        folder_path: &Path,
    ) -> VaultResult<PathBuf> {
        let meta = fs::symlink_metadata(folder_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VaultError::NotFound("folder".into()),
            _ => VaultError::Io(e),
        })?;
        if meta.file_type().is_symlink() || !meta.is_dir() {
            return Err(VaultError::InvalidInput("target must be a directory".into()));
        }
        let original = fs::canonicalize(folder_path)?;
        if original.parent().is_none() {
            return Err(VaultError::InvalidInput("refusing to lock a filesystem root".into()));
        }
        let root = fs::canonicalize(self.store.root())?;
        if original.starts_with(&root) || root.starts_with(&original) {
            return Err(VaultError::InvalidInput("folder overlaps the vault storage".into()));
        }
        path_to_string(&original)?;
        let layout = self.store.layout(&record.id);
        for entry in &record.folders {
            let key = folder_key(master, &entry.id)?;
            if let Ok(manifest) = self.open_manifest(&layout.folder(&entry.folder_hash), &key) {
                let tracked = Path::new(&manifest.original_path);
                if tracked == original || tracked.starts_with(&original) || original.starts_with(tracked) {
                    return Err(VaultError::InvalidState("folder is already protected".into()));
                }
            }
        }
        Ok(original)
    }

    /// Encrypts `original` into `staging` and writes the sealed folder record there.
    #[allow(clippy::too_many_arguments)]
    fn stage_vault_copy(
        &self,
        ctl: &OperationControl,
        record: &ProfileRecord,
        folder_id: &str,
        original: &Path,
        staging: &Path,
        key: &Key,
        locked_at: chrono::DateTime<Utc>,
    ) -> VaultResult<FolderManifest> {
        if staging.exists() {
            fs::remove_dir_all(staging)?;
        }
        create_private_dir(staging)?;
        let files_dir = staging.join(ENCRYPTED_FILES_DIR);
        create_private_dir(&files_dir)?;

        let (permissions, timestamps) = capture_attributes(original)?;
        let (directories, sources) = scan_tree(original)?;
        let cipher = FileCipher {
            key: &**key,
            salt: &record.salt,
            iterations: record.iterations,
            chunk_size: self.config.chunk_size,
        };
        let total = sources.len() as u64;
        let mut files = Vec::with_capacity(sources.len());
        for (i, (relative_path, path)) in sources.into_iter().enumerate() {
            ctl.checkpoint()?;
            let blob = blob_name(&relative_path);
            let metadata = encrypt_file(&path, &files_dir.join(&blob), &cipher)?;
            files.push(VaultFile {
                relative_path,
                blob,
                metadata,
            });
            ctl.progress(i as u64 + 1, total);
        }
        let manifest = FolderManifest {
            original_path: path_to_string(original)?,
            attributes: FolderAttributes {
                permissions,
                timestamps,
            },
            directories,
            files,
        };
        let folder_record = FolderRecord {
            folder_id: folder_id.to_string(),
            profile_id: record.id.clone(),
            locked_at,
            key_generation: record.key_generation,
            manifest: crypto::seal(&key[..], &serde_json::to_vec(&manifest)?)?,
        };
        self.store.save_folder_record(staging, &folder_record)?;
        sync_dir(staging);
        Ok(manifest)
    }

    fn open_manifest(&self, folder_dir: &Path, key: &Key) -> VaultResult<FolderManifest> {
        let record = self.store.load_folder_record(folder_dir)?;
        open_manifest_blob(&record, key)
    }

    fn expose(
        &self,
        ctl: &OperationControl,
        mut record: ProfileRecord,
        entry: &FolderEntry,
        key: Key,
        mode: UnlockMode,
    ) -> VaultResult<PathBuf> {
        let layout = self.store.layout(&record.id);
        let live = layout.folder(&entry.folder_hash);
        let manifest = self.open_manifest(&live, &key)?;
        let original = PathBuf::from(&manifest.original_path);
        let temporary = mode == UnlockMode::Temporary;

        // Tracked before any plaintext lands.
        if temporary {
            self.track_exposure(&mut record, entry, &manifest)?;
        }
        if let Err(e) = self.materialize(ctl, &layout, entry, &manifest, &key, &original) {
            if temporary {
                self.untrack_exposure(&mut record, &entry.id);
            }
            return Err(e);
        }

        match mode {
            UnlockMode::Temporary => {
                self.exposed_keys.lock().insert(entry.id.clone(), key);
            }
            UnlockMode::Permanent => {
                record.folders.retain(|f| f.id != entry.id);
                self.store.save(&record)?;
                remove_dir_quietly(&live);
                self.store.remove_temp_unlock(&record.id, &entry.id)?;
                self.refresh_candidates(&record);
            }
        }
        info!(profile_id = %record.id, folder_id = %entry.id, mode = ?mode,
            files = manifest.files.len(), "folder unlocked");
        ctl.emit(VaultEvent::FolderUnlocked {
            profile_id: record.id.clone(),
            folder_id: entry.id.clone(),
            mode,
        });
        Ok(original)
    }

    fn track_exposure(
        &self,
        record: &mut ProfileRecord,
        entry: &FolderEntry,
        manifest: &FolderManifest,
    ) -> VaultResult<()> {
        let temp = TempUnlockEntry {
            folder_id: entry.id.clone(),
            original_path: manifest.original_path.clone(),
            unlocked_at: Utc::now(),
            checksums: manifest_checksums(manifest),
        };
        self.store.save_temp_unlock(&record.id, &temp)?;
        if let Some(tracked) = record.folder_mut(&entry.id) {
            tracked.state = FolderState::TemporarilyUnlocked;
        }
        if let Err(e) = self.store.save(record) {
            self.untrack_exposure(record, &entry.id);
            return Err(e);
        }
        Ok(())
    }

    /// Reverts `track_exposure` after nothing was written to the original path.
    fn untrack_exposure(&self, record: &mut ProfileRecord, folder_id: &str) {
        if let Some(tracked) = record.folder_mut(folder_id) {
            tracked.state = FolderState::Locked;
        }
        if let Err(e) = self.store.save(record) {
            warn!(folder_id = %folder_id, error = %e, "could not reset folder state after failed unlock");
        }
        if let Err(e) = self.store.remove_temp_unlock(&record.id, folder_id) {
            warn!(folder_id = %folder_id, error = %e, "could not remove temp-unlock entry after failed unlock");
        }
    }

    fn materialize(
        &self,
        ctl: &OperationControl,
        layout: &ProfileLayout,
        entry: &FolderEntry,
        manifest: &FolderManifest,
        key: &Key,
        original: &Path,
    ) -> VaultResult<()> {
        if fs::symlink_metadata(original).is_ok() {
            return Err(VaultError::InvalidState("original location is occupied".into()));
        }
        let staging = restore_staging_dir(original)?;
        let journal_path = layout.unlock_journal(&entry.folder_hash);
        let journal = UnlockJournal {
            folder_id: entry.id.clone(),
            staging: path_to_string(&staging)?,
        };
        let result = write_atomic(&journal_path, &serde_json::to_vec(&journal)?)
            .and_then(|_| self.decrypt_into(ctl, layout, entry, manifest, key, &staging))
            .and_then(|_| self.handler.restore_folder(&staging, original, &manifest.attributes));
        if result.is_err() {
            remove_dir_quietly(&staging);
        }
        remove_journal(&journal_path);
        result
    }

    fn decrypt_into(
        &self,
        ctl: &OperationControl,
        layout: &ProfileLayout,
        entry: &FolderEntry,
        manifest: &FolderManifest,
        key: &Key,
        staging: &Path,
    ) -> VaultResult<()> {
        let files_dir = layout.encrypted_files(&entry.folder_hash);
        for dir in &manifest.directories {
            fs::create_dir_all(safe_join(staging, &dir.relative_path)?)?;
        }
        let total = manifest.files.len() as u64;
        for (i, file) in manifest.files.iter().enumerate() {
            ctl.checkpoint()?;
            let target = safe_join(staging, &file.relative_path)?;
            decrypt_file(
                &files_dir.join(&file.blob),
                &target,
                key,
                &file.metadata,
                self.config.chunk_size,
            )?;
            ctl.progress(i as u64 + 1, total);
        }
        // Deepest first, so read-only parents do not block their children.
        let mut dirs: Vec<&VaultDirectory> = manifest.directories.iter().collect();
        dirs.sort_by_key(|d| std::cmp::Reverse(d.relative_path.matches('/').count()));
        for dir in dirs {
            set_permission_bits(&safe_join(staging, &dir.relative_path)?, dir.permissions)?;
        }
        Ok(())
    }

    /// Moves a temporarily unlocked folder back into hiding. Edited content
    /// is re-encrypted first, which needs the folder key.
    fn conceal(
        &self,
        ctl: &OperationControl,
        mut record: ProfileRecord,
        entry: &FolderEntry,
        key: Option<Key>,
    ) -> VaultResult<bool> {
        let key = key.or_else(|| self.exposed_keys.lock().get(&entry.id).cloned());
        let temp = self
            .store
            .list_temp_unlock(&record.id)?
            .into_iter()
            .find(|t| t.folder_id == entry.id);

        let mut hidden = true;
        if let Some(mut temp) = temp {
            let original = PathBuf::from(&temp.original_path);
            if self.handler.platform().is_visible(&original) {
                let changed = tree_changed(&original, &temp.checksums)?;
                if changed {
                    let key = key.as_ref().ok_or_else(|| {
                        VaultError::InvalidState("re-authentication required to re-lock edited folder".into())
                    })?;
                    let manifest = self.reencrypt_exposed(ctl, &record, entry, &original, key)?;
                    temp.checksums = manifest_checksums(&manifest);
                    self.store.save_temp_unlock(&record.id, &temp)?;
                }
                match self.handler.hide_folder(&original) {
                    HideOutcome::Hidden => {}
                    HideOutcome::Untouched(e) => return Err(e),
                    HideOutcome::Incomplete(e) => {
                        error!(folder_id = %entry.id, error = %e, "re-locked folder not fully hidden");
                        hidden = false;
                    }
                }
            }
        }

        if let Some(tracked) = record.folder_mut(&entry.id) {
            tracked.state = FolderState::Locked;
        }
        self.store.save(&record)?;
        self.store.remove_temp_unlock(&record.id, &entry.id)?;
        self.exposed_keys.lock().remove(&entry.id);
        info!(profile_id = %record.id, folder_id = %entry.id, "folder re-locked");
        ctl.emit(VaultEvent::FolderRelocked {
            profile_id: record.id.clone(),
            folder_id: entry.id.clone(),
        });
        Ok(hidden)
    }

    fn reencrypt_exposed(
        &self,
        ctl: &OperationControl,
        record: &ProfileRecord,
        entry: &FolderEntry,
        original: &Path,
        key: &Key,
    ) -> VaultResult<FolderManifest> {
        let layout = self.store.layout(&record.id);
        let staging = layout.folder_staging(&entry.folder_hash);
        let manifest = match self.stage_vault_copy(ctl, record, &entry.id, original, &staging, key, Utc::now()) {
            Ok(manifest) => manifest,
            Err(e) => {
                remove_dir_quietly(&staging);
                return Err(lock_failure(e));
            }
        };
        self.swap_folder_dir(&layout, &entry.folder_hash, false)?;
        Ok(manifest)
    }

    #[allow(clippy::too_many_arguments)]
    fn rotate_folder(
        &self,
        ctl: &OperationControl,
        layout: &ProfileLayout,
        entry: &FolderEntry,
        old_key: &Key,
        new_key: &Key,
        new_salt: &[u8],
        iterations: u32,
        generation: u32,
    ) -> VaultResult<()> {
        let live = layout.folder(&entry.folder_hash);
        let staging = layout.folder_staging(&entry.folder_hash);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        create_private_dir(&staging)?;
        let staged_files = staging.join(ENCRYPTED_FILES_DIR);
        create_private_dir(&staged_files)?;

        let folder_record = self.store.load_folder_record(&live)?;
        let mut manifest = open_manifest_blob(&folder_record, old_key)?;
        let cipher = FileCipher {
            key: &**new_key,
            salt: new_salt,
            iterations,
            chunk_size: self.config.chunk_size,
        };
        let live_files = live.join(ENCRYPTED_FILES_DIR);
        for file in manifest.files.iter_mut() {
            ctl.checkpoint()?;
            file.metadata = reencrypt_file(
                &live_files.join(&file.blob),
                &staged_files.join(&file.blob),
                &file.metadata,
                old_key,
                &cipher,
            )?;
        }
        let rotated = FolderRecord {
            key_generation: generation,
            manifest: crypto::seal(&new_key[..], &serde_json::to_vec(&manifest)?)?,
            ..folder_record
        };
        self.store.save_folder_record(&staging, &rotated)
    }

    /// Replaces the live folder directory with its staged successor.
    fn swap_folder_dir(&self, layout: &ProfileLayout, hash: &str, keep_retired: bool) -> VaultResult<()> {
        let live = layout.folder(hash);
        let retired = layout.folder_retired(hash);
        let staging = layout.folder_staging(hash);
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        fs::rename(&live, &retired)?;
        if let Err(e) = fs::rename(&staging, &live) {
            let _ = fs::rename(&retired, &live);
            return Err(e.into());
        }
        sync_dir(&layout.folders());
        if !keep_retired {
            remove_dir_quietly(&retired);
        }
        Ok(())
    }

    fn rollback_swaps(&self, layout: &ProfileLayout, swapped: &[String]) {
        for hash in swapped {
            let live = layout.folder(hash);
            remove_dir_quietly(&live);
            if let Err(e) = fs::rename(layout.folder_retired(hash), &live) {
                error!(error = %e, "could not restore folder during password change rollback");
            }
        }
    }

    fn locked_view(&self, record: &ProfileRecord, entry: &FolderEntry, manifest: &FolderManifest) -> LockedFolder {
        LockedFolder {
            id: entry.id.clone(),
            profile_id: record.id.clone(),
            original_path: manifest.original_path.clone(),
            vault_location: self
                .store
                .layout(&record.id)
                .folder(&entry.folder_hash)
                .display()
                .to_string(),
            locked_at: entry.locked_at,
            state: entry.state,
            has_sequence_binding: entry.sequence_binding.is_some(),
            file_count: manifest.files.len(),
            total_size: manifest.total_size(),
        }
    }
}

struct CredentialMaterial {
    master_key_hash: String,
    recovery_key_hash: String,
    recovery_salt: Vec<u8>,
    recovery_sealed_master: crate::model::SealedBlob,
    sequence: crate::model::SequenceVerifier,
}

/// `XXXX-XXXX-XXXX-XXXX-XXXX-XXXX` over `A-Z0-9`.
pub fn generate_recovery_key() -> Zeroizing<String> {
    let mut rng = rand::rngs::OsRng;
    let mut key = Zeroizing::new(String::with_capacity(RECOVERY_GROUPS * (RECOVERY_GROUP_LEN + 1)));
    for group in 0..RECOVERY_GROUPS {
        if group > 0 {
            key.push('-');
        }
        for _ in 0..RECOVERY_GROUP_LEN {
            let idx = rng.gen_range(0..RECOVERY_ALPHABET.len());
            key.push(RECOVERY_ALPHABET[idx] as char);
        }
    }
    key
}

/// Accepts lowercase input and missing or extra separators.
pub fn normalize_recovery_key(input: &str) -> Option<String> {
    let chars: Vec<char> = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if chars.len() != RECOVERY_GROUPS * RECOVERY_GROUP_LEN
        || !chars.iter().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return None;
    }
    Some(
        chars
            .chunks(RECOVERY_GROUP_LEN)
            .map(|g| g.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join("-"),
    )
}

fn verify_credential(record: &ProfileRecord, credential: &Credential) -> Option<Key> {
    match credential {
        Credential::Password(password) => {
            if !verify_secret(password, &record.master_key_hash) {
                return None;
            }
            derive_key(password.as_bytes(), &record.salt, record.iterations).ok()
        }
        Credential::RecoveryKey(recovery_key) => {
            let canonical = Zeroizing::new(normalize_recovery_key(recovery_key).unwrap_or_default());
            if !verify_secret(&canonical, &record.recovery_key_hash) {
                return None;
            }
            let password = open_recovery(record, &canonical).ok()?;
            derive_key(password.as_bytes(), &record.salt, record.iterations).ok()
        }
    }
}

fn open_recovery(record: &ProfileRecord, canonical_key: &str) -> VaultResult<Zeroizing<String>> {
    let kek = derive_key(canonical_key.as_bytes(), &record.recovery_salt, record.iterations)?;
    let plain = crypto::open(&kek[..], &record.recovery_sealed_master)?;
    let password = String::from_utf8(plain.to_vec())
        .map_err(|_| VaultError::VaultCorrupted("recovery data is not valid text".into()))?;
    Ok(Zeroizing::new(password))
}

fn open_binding(binding: &SequenceBinding, password: &str, iterations: u32) -> VaultResult<Key> {
    let kek = derive_key(password.as_bytes(), &binding.key_salt, iterations)?;
    let plain = crypto::open(&kek[..], &binding.sealed_key)?;
    if plain.len() != KEY_LEN {
        return Err(VaultError::VaultCorrupted("bound key has wrong length".into()));
    }
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&plain);
    Ok(key)
}

fn folder_key(master: &Key, folder_id: &str) -> VaultResult<Key> {
    derive_subkey(&master[..], &format!("folder:{folder_id}"))
}

fn open_manifest_blob(record: &FolderRecord, key: &Key) -> VaultResult<FolderManifest> {
    let plain = crypto::open(&key[..], &record.manifest)?;
    serde_json::from_slice(&plain).map_err(|e| VaultError::VaultCorrupted(format!("folder manifest: {e}")))
}

fn owned_entry<'r>(record: &'r ProfileRecord, folder_id: &str) -> VaultResult<&'r FolderEntry> {
    record
        .folder(folder_id)
        .ok_or_else(|| VaultError::NotFound("folder".into()))
}

fn manifest_checksums(manifest: &FolderManifest) -> BTreeMap<String, String> {
    manifest
        .files
        .iter()
        .map(|f| (f.relative_path.clone(), f.metadata.checksum.clone()))
        .collect()
}

/// Regular files and directories under `root`, relative paths `/`-joined.
/// Links and special files are rejected: they cannot be restored faithfully.
fn scan_tree(root: &Path) -> VaultResult<(Vec<VaultDirectory>, Vec<(String, PathBuf)>)> {
    let mut directories = Vec::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let relative = relative_path(root, entry.path())?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            directories.push(VaultDirectory {
                relative_path: relative,
                permissions: permission_bits(&entry.metadata()?),
            });
        } else if file_type.is_file() {
            files.push((relative, entry.path().to_path_buf()));
        } else {
            return Err(VaultError::InvalidInput(
                "folder contains links or special files".into(),
            ));
        }
    }
    Ok((directories, files))
}

fn tree_changed(root: &Path, checksums: &BTreeMap<String, String>) -> VaultResult<bool> {
    let (_, files) = scan_tree(root)?;
    if files.len() != checksums.len() {
        return Ok(true);
    }
    for (relative, path) in files {
        match checksums.get(&relative) {
            Some(expected) if *expected == sha256_file(&path)? => {}
            _ => return Ok(true),
        }
    }
    Ok(false)
}

fn relative_path(root: &Path, path: &Path) -> VaultResult<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| VaultError::InvalidInput("path escapes folder".into()))?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(
                part.to_str()
                    .ok_or_else(|| VaultError::InvalidInput("file name is not valid UTF-8".into()))?,
            ),
            _ => return Err(VaultError::InvalidInput("unexpected path component".into())),
        }
    }
    Ok(parts.join("/"))
}

fn safe_join(base: &Path, relative: &str) -> VaultResult<PathBuf> {
    let mut out = base.to_path_buf();
    for part in relative.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(VaultError::VaultCorrupted("manifest path escapes folder".into()));
        }
        out.push(part);
    }
    Ok(out)
}

fn path_to_string(path: &Path) -> VaultResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| VaultError::InvalidInput("path is not valid UTF-8".into()))
}

fn ciphertext_len(plaintext_len: u64) -> u64 {
    (plaintext_len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

fn write_journal(path: &Path, journal: &LockJournal) -> VaultResult<()> {
    write_atomic(path, &serde_json::to_vec(journal)?)
}

fn remove_dir_quietly(path: &Path) {
    if let Err(e) = fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(error = %e, "could not remove directory");
        }
    }
}

/// Returns false, after logging, when the journal is still on disk. A
/// leftover journal is re-read by startup recovery.
fn remove_journal(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!(journal = %path.display(), error = %e, "could not remove operation journal");
            false
        }
    }
}

fn lock_failure(e: VaultError) -> VaultError {
    match e {
        VaultError::Io(_) | VaultError::Serialization(_) => VaultError::EncryptionFailed(e.to_string()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_removal_reports_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let journal = dir.path().join("lock.journal");
        fs::write(&journal, b"{}").unwrap();
        assert!(remove_journal(&journal));
        assert!(!journal.exists());
        assert!(remove_journal(&journal));

        let stuck = dir.path().join("stuck.journal");
        fs::create_dir(&stuck).unwrap();
        assert!(!remove_journal(&stuck));
        assert!(stuck.exists());
    }

    #[test]
    fn recovery_key_format() {
        let key = generate_recovery_key();
        assert_eq!(key.len(), 29);
        let groups: Vec<&str> = key.split('-').collect();
        assert_eq!(groups.len(), 6);
        for group in groups {
            assert_eq!(group.len(), 4);
            assert!(group.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
        assert_ne!(*key, *generate_recovery_key());
    }

    #[test]
    fn recovery_key_normalization() {
        assert_eq!(
            normalize_recovery_key("abcd efgh-ijkl-mnop-qrst-uvwx12").as_deref(),
            None
        );
        assert_eq!(
            normalize_recovery_key(" abcd-efgh ijkl-mnop-qrst-uv12 ").as_deref(),
            Some("ABCD-EFGH-IJKL-MNOP-QRST-UV12")
        );
        assert!(normalize_recovery_key("ABCD-EFGH-IJKL-MNOP-QRST-UV1!").is_none());
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let base = Path::new("/tmp/x");
        assert!(safe_join(base, "a/b.txt").is_ok());
        assert!(safe_join(base, "../etc/passwd").is_err());
        assert!(safe_join(base, "a//b").is_err());
    }

    #[test]
    fn ciphertext_length_includes_padding_block() {
        assert_eq!(ciphertext_len(0), 16);
        assert_eq!(ciphertext_len(15), 16);
        assert_eq!(ciphertext_len(16), 32);
    }
}
