//! Exercises the `Service` facade directly: mode auto-selection, restore,
//! removal, the outdate-rotation `clean`, the save-trigger wait path, and
//! job-busy rejection under concurrent access.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use chainpak::backup::BackupMode;
use chainpak::config::Config;
use chainpak::error::Error;
use chainpak::service::Service;
use chainpak::trigger::TriggerPattern;
use tempfile::tempdir;

fn utf8(p: std::path::PathBuf) -> Utf8PathBuf {
    p.try_into().unwrap()
}

fn test_config() -> Config {
    Config {
        backup_needs: vec!["world".to_string()],
        backup_ignores: vec!["session.lock".to_string()],
        // No countdown by default: most of these tests care about the
        // restore outcome, not the abort window. Tests that exercise the
        // countdown itself override this.
        restore_timeout: 0,
        ..Config::default()
    }
}

#[test]
fn make_backup_synchronous_round_trip() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(live.join("world")).unwrap();
    fs::write(live.join("world").join("a.txt"), "hi").unwrap();

    let store = utf8(tmp.path().join("store"));
    let service = Service::new(store, test_config()).unwrap();

    let backup = service
        .make_backup("first".into(), None, &live, false, None, || Ok(()), || Ok(()))
        .unwrap();
    assert_eq!(backup.mode, BackupMode::Full);

    let status = service.query_backup(&backup.id).unwrap();
    assert_eq!(status.mode, BackupMode::Full);
    assert_eq!(status.file_count, 1);

    // The second call with no explicit mode auto-selects Incremental, since
    // a backup already exists and the incremental counter hasn't hit its
    // limit yet.
    let second = service
        .make_backup("second".into(), None, &live, false, None, || Ok(()), || Ok(()))
        .unwrap();
    assert_eq!(second.mode, BackupMode::Incremental);
}

#[test]
fn restore_backup_materializes_prior_contents() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(live.join("world")).unwrap();
    fs::write(live.join("world").join("a.txt"), "v1").unwrap();

    let store = utf8(tmp.path().join("store"));
    let service = Service::new(store, test_config()).unwrap();

    let full = service
        .make_backup("full".into(), Some(BackupMode::Full), &live, false, None, || Ok(()), || Ok(()))
        .unwrap();

    fs::write(live.join("world").join("a.txt"), "v2").unwrap();
    service
        .make_backup(
            "incr".into(),
            Some(BackupMode::Incremental),
            &live,
            false,
            None,
            || Ok(()),
            || Ok(()),
        )
        .unwrap();

    let restore_target = utf8(tmp.path().join("restored"));
    let restored_flag = service
        .restore_backup("alice", &full.id, &restore_target, |_| {})
        .unwrap();
    assert!(restored_flag);

    let restored = fs::read_to_string(restore_target.join("world").join("a.txt")).unwrap();
    assert_eq!(restored, "v1");
}

#[test]
fn remove_backup_cascades_to_descendants() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(live.join("world")).unwrap();
    fs::write(live.join("world").join("a.txt"), "hi").unwrap();

    let store = utf8(tmp.path().join("store"));
    let service = Service::new(store, test_config()).unwrap();

    let full = service
        .make_backup("full".into(), Some(BackupMode::Full), &live, false, None, || Ok(()), || Ok(()))
        .unwrap();
    fs::write(live.join("world").join("a.txt"), "ho").unwrap();
    service
        .make_backup(
            "incr".into(),
            Some(BackupMode::Incremental),
            &live,
            false,
            None,
            || Ok(()),
            || Ok(()),
        )
        .unwrap();

    let removed = service.remove_backup(&full.id).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(service.list_backups(None).unwrap().is_empty());
}

#[test]
fn clean_evicts_unprotected_full_before_protected_one_down_to_limit() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(&live).unwrap();
    let store = utf8(tmp.path().join("store"));

    let config = Config {
        full_backup_limit: 1,
        ..test_config()
    };
    let service = Service::new(store, config).unwrap();

    let protected = service
        .manager()
        .create(
            BackupMode::Full,
            "protected".into(),
            chainpak::manager::now_minutes() + 60 * 24,
            &live,
            &[],
            &[],
        )
        .unwrap();
    let unprotected = service
        .manager()
        .create(
            BackupMode::Full,
            "unprotected".into(),
            chainpak::backup::OUTDATE_UNPROTECTED,
            &live,
            &[],
            &[],
        )
        .unwrap();

    let removed = service.clean().unwrap();
    assert_eq!(removed, vec![unprotected.id.clone()]);

    let remaining = service.list_backups(None).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, protected.id);
}

#[test]
fn clean_refuses_when_limit_is_zero() {
    let tmp = tempdir().unwrap();
    let store = utf8(tmp.path().join("store"));
    let config = Config {
        full_backup_limit: 0,
        ..test_config()
    };
    let service = Service::new(store, config).unwrap();
    assert!(service.clean().is_err());
}

#[test]
fn make_backup_waits_for_save_trigger_before_snapshotting() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(live.join("world")).unwrap();
    fs::write(live.join("world").join("a.txt"), "hi").unwrap();

    let store = utf8(tmp.path().join("store"));
    let service = Arc::new(Service::new(store, test_config()).unwrap());
    let pattern = TriggerPattern::compile(&service.config().start_backup_trigger_info).unwrap();

    let worker = {
        let service = service.clone();
        let live = live.clone();
        thread::spawn(move || {
            service
                .make_backup(
                    "triggered".into(),
                    Some(BackupMode::Full),
                    &live,
                    false,
                    Some(pattern),
                    || Ok(()),
                    || Ok(()),
                )
                .unwrap()
        })
    };

    // Give the worker a chance to register and start blocking on the
    // trigger before we feed it the matching line.
    thread::sleep(Duration::from_millis(50));
    service.on_log_line("some unrelated chatter");
    service.on_log_line("Saved the game");

    let backup = worker.join().unwrap();
    assert_eq!(backup.comment, "triggered");
}

#[test]
fn restore_abort_cancels_before_the_countdown_completes() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(live.join("world")).unwrap();
    fs::write(live.join("world").join("a.txt"), "v1").unwrap();

    let store = utf8(tmp.path().join("store"));
    let config = Config {
        restore_timeout: 5,
        ..test_config()
    };
    let service = Arc::new(Service::new(store, config).unwrap());

    let full = service
        .make_backup("full".into(), Some(BackupMode::Full), &live, false, None, || Ok(()), || Ok(()))
        .unwrap();

    let restore_target = utf8(tmp.path().join("restored"));
    let worker = {
        let service = service.clone();
        let restore_target = restore_target.clone();
        thread::spawn(move || {
            service
                .restore_backup("alice", &full.id, &restore_target, |_| {})
                .unwrap()
        })
    };

    // Give the countdown a chance to register before we cancel it.
    thread::sleep(Duration::from_millis(100));
    assert!(service.abort_restore("alice"));

    let completed = worker.join().unwrap();
    assert!(!completed);
    assert!(!restore_target.join("world").join("a.txt").exists());
}

#[test]
fn restore_aborting_an_unknown_actor_is_a_no_op() {
    let tmp = tempdir().unwrap();
    let store = utf8(tmp.path().join("store"));
    let service = Service::new(store, test_config()).unwrap();
    assert!(!service.abort_restore("nobody"));
}

#[test]
fn concurrent_job_is_rejected_with_job_busy() {
    let tmp = tempdir().unwrap();
    let live = utf8(tmp.path().join("live"));
    fs::create_dir_all(live.join("world")).unwrap();
    fs::write(live.join("world").join("a.txt"), "hi").unwrap();

    let store = utf8(tmp.path().join("store"));
    let service = Arc::new(Service::new(store, test_config()).unwrap());
    let pattern = TriggerPattern::compile(&service.config().start_backup_trigger_info).unwrap();

    let worker = {
        let service = service.clone();
        let live = live.clone();
        thread::spawn(move || {
            service.make_backup(
                "blocked".into(),
                Some(BackupMode::Full),
                &live,
                false,
                Some(pattern),
                || Ok(()),
                || Ok(()),
            )
        })
    };

    thread::sleep(Duration::from_millis(50));
    let err = service.remove_backup("0xdeadbeef").unwrap_err();
    assert!(matches!(err, Error::JobBusy { .. }));

    service.on_log_line("Saved the game");
    worker.join().unwrap().unwrap();
}
