#![cfg(unix)]

mod common;

use common::{ctl, pw, read, Harness};
use phantom_core::detector::{Detection, DetectorConfig, SequenceSession};
use phantom_core::error::VaultError;
use phantom_core::lifecycle::{SystemEvent, Trigger};
use phantom_core::manager::Credential;
use phantom_core::model::{FolderState, UnlockMode, VaultEvent};
use phantom_core::profile::folder_hash;
use std::fs;
use std::sync::atomic::Ordering;
use std::time::Instant;
use zeroize::Zeroizing;

const WORK_PW: &str = "work-master-1";
const HOME_PW: &str = "home-master-2";

fn detection(profile_id: &str, password: &str, mode: UnlockMode) -> Detection {
    Detection {
        profile_id: profile_id.to_string(),
        folder_id: None,
        password: Zeroizing::new(password.to_string()),
        mode,
    }
}

#[test]
fn lock_hides_and_temporary_unlock_restores_contents() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha"), ("nested/b.txt", "bravo")]);

    let outcome = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();
    assert!(outcome.original_hidden);
    assert!(!docs.exists());
    assert_eq!(outcome.folder.file_count, 2);
    assert_eq!(outcome.folder.state, FolderState::Locked);

    let restored = h
        .manager
        .unlock_folder(&ctl(), &work, &outcome.folder.id, UnlockMode::Temporary, &pw(WORK_PW))
        .unwrap();
    assert_eq!(read(&restored.join("a.txt")), "alpha");
    assert_eq!(read(&restored.join("nested/b.txt")), "bravo");
    assert_eq!(h.manager.exposed_folder_count().unwrap(), 1);

    let folders = h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap();
    assert_eq!(folders[0].state, FolderState::TemporarilyUnlocked);

    assert!(h.manager.relock_folder(&ctl(), &work, &outcome.folder.id, &pw(WORK_PW)).unwrap());
    assert!(!docs.exists());
    assert_eq!(h.manager.exposed_folder_count().unwrap(), 0);
}

#[test]
fn permanent_unlock_stops_tracking() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();

    h.manager
        .unlock_folder(&ctl(), &work, &locked.folder.id, UnlockMode::Permanent, &pw(WORK_PW))
        .unwrap();
    assert_eq!(read(&docs.join("a.txt")), "alpha");
    assert!(h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap().is_empty());

    let again = h
        .manager
        .unlock_folder(&ctl(), &work, &locked.folder.id, UnlockMode::Temporary, &pw(WORK_PW));
    assert!(matches!(again, Err(VaultError::NotFound(_))));
}

#[test]
fn wrong_password_changes_nothing() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);

    let err = h.manager.lock_folder(&ctl(), &work, &docs, &pw("not-the-password")).unwrap_err();
    assert!(matches!(err, VaultError::AuthenticationFailed));
    assert_eq!(read(&docs.join("a.txt")), "alpha");
    assert!(h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap().is_empty());
}

#[test]
fn folder_of_another_profile_is_an_isolation_violation() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let (home, _) = h.profile("Home", HOME_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();

    let err = h
        .manager
        .unlock_folder(&ctl(), &home, &locked.folder.id, UnlockMode::Temporary, &pw(HOME_PW))
        .unwrap_err();
    assert!(matches!(err, VaultError::IsolationViolation(_)));
    assert!(!docs.exists());
    assert!(h.manager.list_folders(&ctl(), &home, &pw(HOME_PW)).unwrap().is_empty());
}

#[test]
fn typed_sequence_unlocks_only_the_matching_profile() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let (home, _) = h.profile("Home", HOME_PW);
    let work_docs = h.folder("work-docs", &[("w.txt", "work")]);
    let home_docs = h.folder("home-docs", &[("h.txt", "home")]);
    h.manager.lock_folder(&ctl(), &work, &work_docs, &pw(WORK_PW)).unwrap();
    h.manager.lock_folder(&ctl(), &home, &home_docs, &pw(HOME_PW)).unwrap();

    let settings = common::settings();
    let mut session = SequenceSession::new(
        DetectorConfig::from(&settings.detector),
        h.manager.candidates().clone(),
    );
    let now = Instant::now();
    session.on_hotkey(now);
    let mut found = None;
    for c in format!("xyT{HOME_PW}").chars() {
        if let Some(d) = session.on_char(c, now) {
            found = Some(d);
        }
    }
    let found = found.expect("home sequence detected");
    assert_eq!(found.profile_id, home);
    assert_eq!(found.mode, UnlockMode::Temporary);

    let outcome = h.manager.handle_detection(&ctl(), &found).unwrap();
    assert_eq!(outcome.unlocked.len(), 1);
    assert_eq!(read(&home_docs.join("h.txt")), "home");
    assert!(!work_docs.exists());

    // Same sequence again toggles back.
    let outcome = h.manager.handle_detection(&ctl(), &found).unwrap();
    assert_eq!(outcome.relocked.len(), 1);
    assert!(!home_docs.exists());
}

#[test]
fn detection_with_another_profiles_password_is_rejected() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    h.profile("Home", HOME_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();

    let err = h
        .manager
        .handle_detection(&ctl(), &detection(&work, HOME_PW, UnlockMode::Temporary))
        .unwrap_err();
    assert!(err.is_auth_failure());
    assert!(!docs.exists());
}

#[test]
fn edited_folder_is_reencrypted_on_relock() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();
    let id = locked.folder.id;

    h.manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(WORK_PW))
        .unwrap();
    fs::write(docs.join("a.txt"), "alpha v2").unwrap();
    fs::write(docs.join("new.txt"), "charlie").unwrap();

    // Lock-all uses the key kept from the unlock.
    let summary = h.manager.on_system_event(&ctl(), SystemEvent::ScreenLock).unwrap();
    assert_eq!(summary.relocked, 1);
    assert!(!docs.exists());

    h.manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(WORK_PW))
        .unwrap();
    assert_eq!(read(&docs.join("a.txt")), "alpha v2");
    assert_eq!(read(&docs.join("new.txt")), "charlie");
}

#[test]
fn unlock_exposes_nothing_when_bookkeeping_cannot_be_saved() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let id = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap().folder.id;

    // A directory where the temp-unlock entry belongs makes its write fail.
    let blocker = h.manager.store().layout(&work).temp_unlock_entry(&folder_hash(&id));
    fs::create_dir_all(blocker.join("occupied")).unwrap();

    let result = h
        .manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(WORK_PW));
    assert!(result.is_err());
    assert!(!docs.exists());
    assert_eq!(h.manager.exposed_folder_count().unwrap(), 0);
    let folders = h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap();
    assert_eq!(folders[0].state, FolderState::Locked);

    fs::remove_dir_all(&blocker).unwrap();
    let restored = h
        .manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(WORK_PW))
        .unwrap();
    assert_eq!(read(&restored.join("a.txt")), "alpha");
}

#[test]
fn failed_restore_leaves_folder_locked_and_untracked() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let id = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap().folder.id;
    h.folder("docs", &[("other.txt", "unrelated")]);

    let result = h
        .manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(WORK_PW));
    assert!(matches!(result, Err(VaultError::InvalidState(_))));
    assert!(h.manager.store().list_temp_unlock(&work).unwrap().is_empty());
    let folders = h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap();
    assert_eq!(folders[0].state, FolderState::Locked);

    let summary = h.manager.lock_all(&ctl(), Trigger::LockAll).unwrap();
    assert_eq!(summary.relocked, 0);
    assert_eq!(read(&docs.join("other.txt")), "unrelated");
}

#[test]
fn lock_all_counts_rejected_folders_and_keeps_going() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let (home, _) = h.profile("Home", HOME_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let photos = h.folder("photos", &[("b.txt", "bravo")]);
    let docs_id = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap().folder.id;
    let photos_id = h.manager.lock_folder(&ctl(), &home, &photos, &pw(HOME_PW)).unwrap().folder.id;
    h.manager
        .unlock_folder(&ctl(), &work, &docs_id, UnlockMode::Temporary, &pw(WORK_PW))
        .unwrap();
    h.manager
        .unlock_folder(&ctl(), &home, &photos_id, UnlockMode::Temporary, &pw(HOME_PW))
        .unwrap();

    // An unlock trigger is rejected for already exposed folders.
    let summary = h
        .manager
        .lock_all(&ctl(), Trigger::Unlock(UnlockMode::Temporary))
        .unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.relocked, 0);
    assert!(docs.exists() && photos.exists());

    let summary = h.manager.lock_all(&ctl(), Trigger::LockAll).unwrap();
    assert_eq!(summary.relocked, 2);
    assert!(!docs.exists() && !photos.exists());
}

#[test]
fn resume_does_not_relock() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();
    h.manager
        .unlock_folder(&ctl(), &work, &locked.folder.id, UnlockMode::Temporary, &pw(WORK_PW))
        .unwrap();

    let summary = h.manager.on_system_event(&ctl(), SystemEvent::Resume).unwrap();
    assert_eq!(summary.relocked, 0);
    assert!(docs.exists());
}

#[test]
fn password_change_rotates_credentials() {
    let h = Harness::new();
    let (work, old_recovery) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();

    let new_recovery = h
        .manager
        .change_password(&ctl(), &work, &pw(WORK_PW), "work-master-new")
        .unwrap();
    assert_ne!(*new_recovery, *old_recovery);

    assert!(h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).is_err());
    let old = Credential::recovery_key(old_recovery.as_str());
    assert!(h.manager.list_folders(&ctl(), &work, &old).is_err());

    let recovered = h.manager.recover_master_key(&ctl(), &new_recovery).unwrap();
    assert_eq!(recovered.profile_id, work);
    assert_eq!(recovered.master_password.as_str(), "work-master-new");

    let restored = h
        .manager
        .unlock_folder(&ctl(), &work, &locked.folder.id, UnlockMode::Temporary, &pw("work-master-new"))
        .unwrap();
    assert_eq!(read(&restored.join("a.txt")), "alpha");
}

#[test]
fn recovery_key_works_as_a_credential() {
    let h = Harness::new();
    let (work, recovery) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap();

    let lowercase = recovery.to_lowercase().replace('-', "");
    let restored = h
        .manager
        .unlock_folder(
            &ctl(),
            &work,
            &locked.folder.id,
            UnlockMode::Temporary,
            &Credential::recovery_key(lowercase),
        )
        .unwrap();
    assert_eq!(read(&restored.join("a.txt")), "alpha");
}

#[test]
fn failed_hide_rolls_the_lock_back() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);

    h.platform.fail_restrict.store(true, Ordering::SeqCst);
    let err = h.manager.lock_folder(&ctl(), &work, &docs, &pw(WORK_PW)).unwrap_err();
    assert!(matches!(err, VaultError::PrivilegeInsufficient(_)));
    assert_eq!(read(&docs.join("a.txt")), "alpha");

    h.platform.fail_restrict.store(false, Ordering::SeqCst);
    assert!(h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap().is_empty());
    let folders_dir = h.manager.store().layout(&work).folders();
    assert_eq!(fs::read_dir(folders_dir).unwrap().count(), 0);
}

#[test]
fn cancelled_lock_leaves_original_untouched() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha"), ("b.txt", "bravo")]);

    let op = ctl();
    op.cancel();
    let err = h.manager.lock_folder(&op, &work, &docs, &pw(WORK_PW)).unwrap_err();
    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(read(&docs.join("b.txt")), "bravo");
    assert!(h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap().is_empty());
}

#[test]
fn lock_reports_progress_events() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let docs = h.folder("docs", &[("a.txt", "alpha"), ("b.txt", "bravo")]);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let op = ctl().with_events(tx);
    h.manager.lock_folder(&op, &work, &docs, &pw(WORK_PW)).unwrap();
    drop(op);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.iter().any(|e| matches!(e, VaultEvent::Progress { done: 2, total: 2, .. })));
    assert!(matches!(events.last(), Some(VaultEvent::FolderLocked { .. })));
}

#[test]
fn nested_or_duplicate_targets_are_refused() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let outer = h.folder("outer", &[("inner/a.txt", "alpha")]);
    let inner = outer.join("inner");
    h.manager.lock_folder(&ctl(), &work, &inner, &pw(WORK_PW)).unwrap();

    let err = h.manager.lock_folder(&ctl(), &work, &outer, &pw(WORK_PW)).unwrap_err();
    assert!(matches!(err, VaultError::InvalidState(_)));
}

#[test]
fn bound_folder_sequence_toggles_only_that_folder() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let a = h.folder("a", &[("a.txt", "alpha")]);
    let b = h.folder("b", &[("b.txt", "bravo")]);
    let locked_a = h.manager.lock_folder(&ctl(), &work, &a, &pw(WORK_PW)).unwrap();
    h.manager.lock_folder(&ctl(), &work, &b, &pw(WORK_PW)).unwrap();

    h.manager
        .bind_sequence(&ctl(), &work, &locked_a.folder.id, &pw(WORK_PW), Some("only-folder-a"))
        .unwrap();
    let d = Detection {
        profile_id: work.clone(),
        folder_id: Some(locked_a.folder.id.clone()),
        password: Zeroizing::new("only-folder-a".to_string()),
        mode: UnlockMode::Temporary,
    };
    let outcome = h.manager.handle_detection(&ctl(), &d).unwrap();
    assert_eq!(outcome.unlocked, vec![locked_a.folder.id.clone()]);
    assert!(a.exists());
    assert!(!b.exists());
}

#[test]
fn repeated_failures_are_throttled() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    let threshold = common::settings().auth.failure_threshold;
    for _ in 0..threshold {
        let _ = h.manager.list_folders(&ctl(), &work, &pw("wrong-password"));
    }
    let err = h.manager.list_folders(&ctl(), &work, &pw(WORK_PW)).unwrap_err();
    assert!(matches!(err, VaultError::RateLimited));
    assert!(err.is_auth_failure());
}

#[test]
fn deleting_a_profile_forgets_its_sequence() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", WORK_PW);
    assert_eq!(h.manager.candidates().read().len(), 1);
    h.manager.delete_profile(&ctl(), &work, &pw(WORK_PW)).unwrap();
    assert!(h.manager.candidates().read().is_empty());
    assert!(h.manager.list_profiles().unwrap().is_empty());
}
