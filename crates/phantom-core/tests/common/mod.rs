#![allow(dead_code)]

use parking_lot::Mutex;
use phantom_core::crypto::set_permission_bits;
use phantom_core::detector::{CandidateSet, KeystrokeSink};
use phantom_core::error::{VaultError, VaultResult};
use phantom_core::manager::{Credential, ManagerConfig, OperationControl, ProfileVaultManager};
use phantom_core::platform::{Capabilities, PlatformAdapter, PlatformKind};
use phantom_core::profile::ProfileStore;
use phantom_core::settings::{DetectionScope, ServiceSettings};
use phantom_core::throttle::AuthThrottle;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Owner-only permissions like the unix adapter, with switchable failures.
#[derive(Default)]
pub struct TestPlatform {
    pub fail_restrict: AtomicBool,
    pub restrict_calls: AtomicUsize,
    pub sink: Mutex<Option<KeystrokeSink>>,
}

impl PlatformAdapter for TestPlatform {
    fn detect_capabilities(&self) -> Capabilities {
        Capabilities {
            platform: PlatformKind::current(),
            elevated: true,
            folder_hiding: true,
            keyboard_capture: true,
        }
    }

    fn is_elevated(&self) -> bool {
        true
    }

    fn restrict(&self, path: &Path) -> VaultResult<()> {
        self.restrict_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_restrict.load(Ordering::SeqCst) {
            return Err(VaultError::PrivilegeInsufficient("injected".into()));
        }
        let meta = fs::symlink_metadata(path)?;
        set_permission_bits(path, if meta.is_dir() { 0o700 } else { 0o600 })
    }

    fn release(&self, path: &Path, permissions: u32) -> VaultResult<()> {
        set_permission_bits(path, permissions)
    }

    fn register_keystroke_sink(&self, sink: KeystrokeSink) -> VaultResult<()> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }
}

pub const SEQUENCE_SECRET: [u8; 32] = [9u8; 32];

pub fn settings() -> ServiceSettings {
    ServiceSettings::default()
}

pub struct Harness {
    pub vault: TempDir,
    pub home: TempDir,
    pub platform: Arc<TestPlatform>,
    pub manager: ProfileVaultManager<TestPlatform>,
}

impl Harness {
    pub fn new() -> Self {
        let vault = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let platform = Arc::new(TestPlatform::default());
        let manager = build_manager(vault.path(), platform.clone(), DetectionScope::Global);
        Self {
            vault,
            home,
            platform,
            manager,
        }
    }

    /// Fresh manager over the same storage, as after a service restart.
    pub fn restart(self) -> Self {
        let manager = build_manager(self.vault.path(), self.platform.clone(), DetectionScope::Global);
        Self { manager, ..self }
    }

    /// Creates `<home>/<name>` holding `files` (relative path, contents).
    pub fn folder(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.home.path().join(name);
        fs::create_dir_all(&root).unwrap();
        for (rel, contents) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, contents).unwrap();
        }
        root
    }

    pub fn profile(&self, name: &str, password: &str) -> (String, Zeroizing<String>) {
        let created = self.manager.create_profile(name, password).unwrap();
        (created.profile_id, created.recovery_key)
    }
}

pub fn build_manager(
    root: &Path,
    platform: Arc<TestPlatform>,
    scope: DetectionScope,
) -> ProfileVaultManager<TestPlatform> {
    let settings = settings();
    let candidates = CandidateSet::new(Zeroizing::new(SEQUENCE_SECRET.to_vec()), scope).shared();
    ProfileVaultManager::new(
        ProfileStore::open(root).unwrap(),
        platform,
        ManagerConfig::from(&settings),
        candidates,
        AuthThrottle::new(&settings.auth),
    )
    .unwrap()
}

pub fn ctl() -> OperationControl {
    OperationControl::new(uuid::Uuid::new_v4().to_string(), "test")
}

pub fn pw(password: &str) -> Credential {
    Credential::password(password)
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}
