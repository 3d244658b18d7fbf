use crate::error::{VaultError, VaultResult};
use crate::crypto::{BLOCK_SIZE, DEFAULT_CHUNK_SIZE, MIN_ITERATIONS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectionScope {
    /// Match against every profile's sequence.
    Global,
    /// Match only against the profile that last authenticated.
    ActiveProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorSettings {
    pub timeout_secs: u64,
    pub max_buffer_chars: usize,
    pub min_password_len: usize,
    pub temporary_prefix: char,
    pub permanent_prefix: char,
    #[serde(default)]
    pub prefix_case_sensitive: bool,
    pub scope: DetectionScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoSettings {
    pub pbkdf2_iterations: u32,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub max_concurrent_operations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub lockout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub detector: DetectorSettings,
    pub crypto: CryptoSettings,
    pub workers: WorkerSettings,
    pub auth: AuthSettings,
    #[serde(default)]
    pub vault_root: Option<PathBuf>,
    #[serde(default)]
    pub ipc_socket: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            detector: DetectorSettings {
                timeout_secs: 10,
                max_buffer_chars: 128,
                min_password_len: 4,
                temporary_prefix: 'T',
                permanent_prefix: 'P',
                prefix_case_sensitive: false,
                scope: DetectionScope::Global,
            },
            crypto: CryptoSettings {
                pbkdf2_iterations: MIN_ITERATIONS,
                chunk_size: DEFAULT_CHUNK_SIZE,
            },
            workers: WorkerSettings {
                max_concurrent_operations: 4,
            },
            auth: AuthSettings {
                failure_threshold: 5,
                failure_window_secs: 60,
                lockout_secs: 30,
            },
            vault_root: None,
            ipc_socket: None,
        }
    }
}

impl ServiceSettings {
    pub fn validate(&self) -> VaultResult<()> {
        let d = &self.detector;
        if d.timeout_secs == 0 {
            return Err(VaultError::InvalidInput("detector.timeout_secs must be positive".into()));
        }
        if d.min_password_len == 0 || d.min_password_len > d.max_buffer_chars {
            return Err(VaultError::InvalidInput(
                "detector.min_password_len must be between 1 and max_buffer_chars".into(),
            ));
        }
        if d.temporary_prefix.to_lowercase().eq(d.permanent_prefix.to_lowercase()) {
            return Err(VaultError::InvalidInput("detector prefixes must differ".into()));
        }
        if self.crypto.pbkdf2_iterations < MIN_ITERATIONS {
            return Err(VaultError::InvalidInput(format!(
                "crypto.pbkdf2_iterations must be at least {MIN_ITERATIONS}"
            )));
        }
        if self.crypto.chunk_size == 0 || self.crypto.chunk_size % BLOCK_SIZE != 0 {
            return Err(VaultError::InvalidInput(format!(
                "crypto.chunk_size must be a non-zero multiple of {BLOCK_SIZE}"
            )));
        }
        if self.workers.max_concurrent_operations == 0 {
            return Err(VaultError::InvalidInput(
                "workers.max_concurrent_operations must be positive".into(),
            ));
        }
        if self.auth.failure_threshold == 0 {
            return Err(VaultError::InvalidInput("auth.failure_threshold must be positive".into()));
        }
        Ok(())
    }

    /// Missing file yields defaults; an invalid file is an error, never silently replaced.
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)?;
        let settings: Self = serde_json::from_slice(&data)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> VaultResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        crate::profile::write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}
