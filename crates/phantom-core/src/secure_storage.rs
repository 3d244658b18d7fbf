use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use rand::RngCore;
use std::path::Path;
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "PhantomVault";
const IPC_SECRET_KEY: &str = "ipc_secret";
const SECRET_LEN: usize = 32;

pub fn store_ipc_secret(secret: &[u8]) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, IPC_SECRET_KEY).map_err(|e| anyhow!("keyring init: {e}"))?;
    let encoded = general_purpose::STANDARD.encode(secret);
    entry
        .set_password(&encoded)
        .map_err(|e| anyhow!("store ipc secret: {e}"))?;
    Ok(())
}

pub fn get_ipc_secret() -> Result<Vec<u8>> {
    let entry = Entry::new(SERVICE_NAME, IPC_SECRET_KEY).map_err(|e| anyhow!("keyring init: {e}"))?;
    let encoded = entry
        .get_password()
        .map_err(|e| anyhow!("load ipc secret: {e}"))?;
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| anyhow!("decode ipc secret: {e}"))?;
    Ok(decoded)
}

/// Loads a 32-byte secret from `path`, creating it (mode 0600) on first use.
pub fn load_or_create_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    if path.exists() {
        let encoded = std::fs::read_to_string(path)
            .with_context(|| format!("read secret {}", path.display()))?;
        let decoded = general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| anyhow!("decode secret {}: {e}", path.display()))?;
        if decoded.len() != SECRET_LEN {
            return Err(anyhow!("secret {} has unexpected length", path.display()));
        }
        return Ok(Zeroizing::new(decoded));
    }
    let mut secret = Zeroizing::new(vec![0u8; SECRET_LEN]);
    rand::rngs::OsRng.fill_bytes(&mut secret);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let encoded = Zeroizing::new(general_purpose::STANDARD.encode(&secret[..]));
    crate::profile::write_atomic(path, encoded.as_bytes())?;
    restrict_to_owner(path)?;
    Ok(secret)
}

/// Service side: file secret is authoritative, keyring copy is best effort.
pub fn provision_ipc_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let secret = load_or_create_secret(path)?;
    if let Err(e) = store_ipc_secret(&secret) {
        tracing::debug!(error = %e, "keyring unavailable; ipc secret kept in file only");
    }
    Ok(secret)
}

/// Client side: keyring first, then the secret file.
pub fn read_ipc_secret(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    match get_ipc_secret() {
        Ok(secret) if secret.len() == SECRET_LEN => Ok(Zeroizing::new(secret)),
        _ => {
            let encoded = std::fs::read_to_string(path)
                .with_context(|| format!("read ipc secret {}", path.display()))?;
            let decoded = general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| anyhow!("decode ipc secret: {e}"))?;
            Ok(Zeroizing::new(decoded))
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn secret_file_is_stable_across_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc.secret");
        let first = load_or_create_secret(&path).unwrap();
        let second = load_or_create_secret(&path).unwrap();
        assert_eq!(first.len(), SECRET_LEN);
        assert_eq!(*first, *second);
    }

    #[cfg(unix)]
    #[test]
    fn secret_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("ipc.secret");
        load_or_create_secret(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
