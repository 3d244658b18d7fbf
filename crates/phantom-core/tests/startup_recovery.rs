#![cfg(unix)]

mod common;

use common::{ctl, pw, read, Harness};
use phantom_core::model::{FolderState, LockJournal, LockPhase, UnlockJournal, UnlockMode};
use phantom_core::vault_handler::RESTORE_STAGING_PREFIX;
use std::fs;

const PW: &str = "work-master-1";

#[test]
fn lock_interrupted_before_hiding_is_rolled_back() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);

    let layout = h.manager.store().layout(&work);
    let dir = layout.folder("deadbeef");
    fs::create_dir_all(dir.join("encrypted_files")).unwrap();
    let journal = LockJournal {
        folder_id: "f-1".into(),
        original_path: docs.display().to_string(),
        phase: LockPhase::Encrypted,
    };
    fs::write(layout.lock_journal("deadbeef"), serde_json::to_vec(&journal).unwrap()).unwrap();

    let h = h.restart();
    let report = h.manager.recover_on_startup().unwrap();
    assert_eq!(report.locks_rolled_back, 1);
    assert!(!dir.exists());
    assert_eq!(read(&docs.join("a.txt")), "alpha");
}

#[test]
fn lock_interrupted_while_hiding_is_committed() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(PW)).unwrap();

    // Crash after the vault copy committed but before the registry was saved,
    // with part of the original still on disk.
    let mut record = h.manager.store().load(&work).unwrap();
    let entry = record.folders.pop().unwrap();
    h.manager.store().save(&record).unwrap();
    let layout = h.manager.store().layout(&work);
    let journal = LockJournal {
        folder_id: entry.id.clone(),
        original_path: locked.folder.original_path.clone(),
        phase: LockPhase::Hiding,
    };
    fs::write(layout.lock_journal(&entry.folder_hash), serde_json::to_vec(&journal).unwrap()).unwrap();
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("a.txt"), "alpha").unwrap();

    let h = h.restart();
    let report = h.manager.recover_on_startup().unwrap();
    assert_eq!(report.locks_committed, 1);
    assert!(!docs.exists());
    assert!(!layout.lock_journal(&entry.folder_hash).exists());

    let restored = h
        .manager
        .unlock_folder(&ctl(), &work, &entry.id, UnlockMode::Temporary, &pw(PW))
        .unwrap();
    assert_eq!(read(&restored.join("a.txt")), "alpha");
}

#[test]
fn staging_and_orphan_directories_are_removed() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", PW);
    let layout = h.manager.store().layout(&work);
    fs::create_dir_all(layout.folder_staging("cafe")).unwrap();
    fs::create_dir_all(layout.folder("orphan")).unwrap();

    let h = h.restart();
    let report = h.manager.recover_on_startup().unwrap();
    assert_eq!(report.staging_removed, 1);
    assert_eq!(report.orphans_removed, 1);
    assert!(!layout.folder_staging("cafe").exists());
    assert!(!layout.folder("orphan").exists());
}

#[test]
fn interrupted_unlock_staging_is_removed() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(PW)).unwrap();
    let hash = h.manager.store().load(&work).unwrap().folders[0].folder_hash.clone();

    let staging = h.home.path().join(format!("{RESTORE_STAGING_PREFIX}0000abcd"));
    fs::create_dir_all(&staging).unwrap();
    fs::write(staging.join("a.txt"), "alpha").unwrap();
    let layout = h.manager.store().layout(&work);
    let journal = UnlockJournal {
        folder_id: locked.folder.id.clone(),
        staging: staging.display().to_string(),
    };
    fs::write(layout.unlock_journal(&hash), serde_json::to_vec(&journal).unwrap()).unwrap();

    let h = h.restart();
    let report = h.manager.recover_on_startup().unwrap();
    assert_eq!(report.staging_removed, 1);
    assert!(!staging.exists());
    assert!(!docs.exists());
}

#[test]
fn unchanged_temporary_unlock_is_hidden_again_after_restart() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(PW)).unwrap();
    h.manager
        .unlock_folder(&ctl(), &work, &locked.folder.id, UnlockMode::Temporary, &pw(PW))
        .unwrap();

    let h = h.restart();
    let report = h.manager.recover_on_startup().unwrap();
    assert_eq!(report.rehidden, 1);
    assert!(!docs.exists());
    assert_eq!(h.manager.exposed_folder_count().unwrap(), 0);
}

#[test]
fn edited_temporary_unlock_waits_for_its_owner_after_restart() {
    let h = Harness::new();
    let (work, _) = h.profile("Work", PW);
    let docs = h.folder("docs", &[("a.txt", "alpha")]);
    let locked = h.manager.lock_folder(&ctl(), &work, &docs, &pw(PW)).unwrap();
    let id = locked.folder.id;
    h.manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(PW))
        .unwrap();
    fs::write(docs.join("a.txt"), "edited").unwrap();

    let h = h.restart();
    let report = h.manager.recover_on_startup().unwrap();
    assert_eq!(report.left_exposed, 1);
    assert_eq!(read(&docs.join("a.txt")), "edited");
    let folders = h.manager.list_folders(&ctl(), &work, &pw(PW)).unwrap();
    assert_eq!(folders[0].state, FolderState::TemporarilyUnlocked);

    assert!(h.manager.relock_folder(&ctl(), &work, &id, &pw(PW)).unwrap());
    assert!(!docs.exists());
    let restored = h
        .manager
        .unlock_folder(&ctl(), &work, &id, UnlockMode::Temporary, &pw(PW))
        .unwrap();
    assert_eq!(read(&restored.join("a.txt")), "edited");
}
