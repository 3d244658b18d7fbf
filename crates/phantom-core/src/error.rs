use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("insufficient privileges: {0}")]
    PrivilegeInsufficient(String),

    #[error("platform unsupported: {0}")]
    PlatformUnsupported(String),

    #[error("vault corrupted: {0}")]
    VaultCorrupted(String),

    #[error("isolation violation: {0}")]
    IsolationViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("too many failed attempts")]
    RateLimited,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Stable error codes sent to IPC clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    EncryptionFailed,
    AuthenticationFailed,
    PrivilegeInsufficient,
    PlatformUnsupported,
    VaultCorrupted,
    IsolationViolation,
    NotFound,
    InvalidState,
    InvalidInput,
    Cancelled,
    Internal,
}

impl VaultError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VaultError::EncryptionFailed(_) => ErrorCode::EncryptionFailed,
            // Throttled attempts must be indistinguishable from wrong credentials.
            VaultError::AuthenticationFailed | VaultError::RateLimited => {
                ErrorCode::AuthenticationFailed
            }
            VaultError::PrivilegeInsufficient(_) => ErrorCode::PrivilegeInsufficient,
            VaultError::PlatformUnsupported(_) => ErrorCode::PlatformUnsupported,
            VaultError::VaultCorrupted(_) => ErrorCode::VaultCorrupted,
            VaultError::IsolationViolation(_) => ErrorCode::IsolationViolation,
            VaultError::NotFound(_) => ErrorCode::NotFound,
            VaultError::InvalidState(_) => ErrorCode::InvalidState,
            VaultError::InvalidInput(_) => ErrorCode::InvalidInput,
            VaultError::Cancelled => ErrorCode::Cancelled,
            VaultError::Io(_) | VaultError::Serialization(_) => ErrorCode::Internal,
        }
    }

    /// Message safe to show in the GUI. Never carries paths, profile names or
    /// anything that reveals another profile's existence.
    pub fn public_message(&self) -> &'static str {
        match self.code() {
            ErrorCode::EncryptionFailed => "The folder could not be encrypted; nothing was changed.",
            ErrorCode::AuthenticationFailed => "Invalid credentials.",
            ErrorCode::PrivilegeInsufficient => "The service lacks the privileges for this operation.",
            ErrorCode::PlatformUnsupported => "This operation is not supported on this platform.",
            ErrorCode::VaultCorrupted => {
                "Vault data failed verification. The encrypted copy was preserved; use the recovery key."
            }
            ErrorCode::IsolationViolation => "Request rejected.",
            ErrorCode::NotFound => "Folder not found.",
            ErrorCode::InvalidState => "The folder is not in a state that allows this operation.",
            ErrorCode::InvalidInput => "Invalid request.",
            ErrorCode::Cancelled => "Operation cancelled.",
            ErrorCode::Internal => "Internal service error.",
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, VaultError::AuthenticationFailed | VaultError::RateLimited)
    }
}

impl From<walkdir::Error> for VaultError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => VaultError::Io(io),
            None => VaultError::InvalidInput("filesystem loop detected".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_looks_like_wrong_password() {
        let a = VaultError::AuthenticationFailed;
        let b = VaultError::RateLimited;
        assert_eq!(a.code(), b.code());
        assert_eq!(a.public_message(), b.public_message());
    }

    #[test]
    fn public_messages_do_not_echo_details() {
        let err = VaultError::NotFound("/home/someone/secret-project".into());
        assert!(!err.public_message().contains("secret-project"));
    }
}
