//! Per-folder unlock/lock state machine.
//!
//! ```text
//! Locked ──unlock(T)──▶ TemporarilyUnlocked ──relock/toggle/system/lock-all──▶ Locked
//! Locked ──unlock(P)──▶ PermanentlyUnlocked (terminal, leaves tracking)
//! ```
//!
//! The table is pure; the manager performs the filesystem work named by the
//! returned [`Action`].

use crate::error::{VaultError, VaultResult};
use crate::model::{FolderState, UnlockMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemEvent {
    ScreenLock,
    Suspend,
    Logout,
    Reboot,
    Shutdown,
    Resume,
}

impl SystemEvent {
    pub fn requires_relock(self) -> bool {
        !matches!(self, SystemEvent::Resume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// GUI or fallback-channel unlock request.
    Unlock(UnlockMode),
    /// The owning profile's sequence was typed again.
    SequenceMatch(UnlockMode),
    /// Explicit re-lock of one folder.
    Relock,
    LockAll,
    System(SystemEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Expose(UnlockMode),
    Conceal,
}

pub fn transition(state: FolderState, trigger: Trigger) -> VaultResult<(FolderState, Action)> {
    use FolderState::*;
    match (state, trigger) {
        (PermanentlyUnlocked, _) => Err(VaultError::NotFound("folder".into())),

        (Locked, Trigger::Unlock(mode)) | (Locked, Trigger::SequenceMatch(mode)) => {
            Ok((target_state(mode), Action::Expose(mode)))
        }
        (Locked, Trigger::Relock) => Err(VaultError::InvalidState("folder is already locked".into())),
        (Locked, Trigger::LockAll) | (Locked, Trigger::System(_)) => Ok((Locked, Action::None)),

        (TemporarilyUnlocked, Trigger::Unlock(_)) => Err(VaultError::InvalidState(
            "folder is already unlocked".into(),
        )),
        (TemporarilyUnlocked, Trigger::SequenceMatch(_))
        | (TemporarilyUnlocked, Trigger::Relock)
        | (TemporarilyUnlocked, Trigger::LockAll) => Ok((Locked, Action::Conceal)),
        (TemporarilyUnlocked, Trigger::System(event)) if event.requires_relock() => {
            Ok((Locked, Action::Conceal))
        }
        (TemporarilyUnlocked, Trigger::System(_)) => Ok((TemporarilyUnlocked, Action::None)),
    }
}

fn target_state(mode: UnlockMode) -> FolderState {
    match mode {
        UnlockMode::Temporary => FolderState::TemporarilyUnlocked,
        UnlockMode::Permanent => FolderState::PermanentlyUnlocked,
    }
}
