//! Crash images: copy the store mid-life, remount the copy, verify the
//! journal replays everything the commit callbacks promised.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{copy_tree, counting_cb, crash_test_config, fresh_store};
use oxistore::types::{CollectionId, ObjectId};
use oxistore::{Store, Transaction};
use tempfile::tempdir;

/// Copy `root` (store + journal) into a sibling directory, producing the
/// on-disk state a crash at this instant would leave behind.
fn crash_image(root: &std::path::Path) -> tempfile::TempDir {
    let image = tempdir().unwrap();
    copy_tree(root, image.path());
    image
}

#[test]
fn test_committed_ops_survive_crash_replay() {
    let root = tempdir().unwrap();
    let store = fresh_store(root.path(), crash_test_config());
    let cid = CollectionId::new("pool");

    let mut tx = Transaction::new();
    tx.create_collection(&cid);
    store.apply_transactions(vec![tx]).unwrap();

    const N: u64 = 50;
    let commits = Arc::new(AtomicU64::new(0));
    let seq = store.create_sequencer("writer");
    for i in 0..N {
        let mut tx = Transaction::new();
        tx.write(
            &cid,
            &ObjectId::from_name(format!("obj-{i}")),
            0,
            format!("value-{i}").into_bytes(),
        );
        store
            .queue_transactions(&seq, vec![tx], None, Some(counting_cb(&commits)), None)
            .unwrap();
    }
    seq.flush();
    let deadline = Instant::now() + Duration::from_secs(10);
    while commits.load(Ordering::SeqCst) < N && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(commits.load(Ordering::SeqCst), N);

    // The sync thread is held off, so the applied watermark on disk is
    // still zero and every op lives only in the journal plus unsynced
    // file data. Take the crash image with the store still mounted.
    let image = crash_image(root.path());
    store.umount().unwrap();

    let replayed = Store::mount(
        image.path().join("store"),
        image.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    for i in 0..N {
        let oid = ObjectId::from_name(format!("obj-{i}"));
        assert_eq!(
            replayed.read(&cid, &oid, 0, 0).unwrap(),
            format!("value-{i}").into_bytes(),
            "op {i} lost after crash replay"
        );
    }
    replayed.umount().unwrap();
}

#[test]
fn test_replay_is_idempotent_across_double_crash() {
    let root = tempdir().unwrap();
    let store = fresh_store(root.path(), crash_test_config());
    let cid = CollectionId::new("pool");
    let oid = ObjectId::from_name("obj");

    let mut tx = Transaction::new();
    tx.create_collection(&cid)
        .write(&cid, &oid, 0, b"first".to_vec());
    store.apply_transactions(vec![tx]).unwrap();
    let mut tx = Transaction::new();
    tx.write(&cid, &oid, 0, b"SECON".to_vec());
    store.apply_transactions(vec![tx]).unwrap();

    let image = crash_image(root.path());
    store.umount().unwrap();

    // First recovery applies the journal; crash again immediately (copy
    // before any commit cycle) and recover once more.
    let first = Store::mount(
        image.path().join("store"),
        image.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    assert_eq!(first.read(&cid, &oid, 0, 0).unwrap(), b"SECON");
    let second_image = crash_image(image.path());
    first.umount().unwrap();

    let second = Store::mount(
        second_image.path().join("store"),
        second_image.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    assert_eq!(second.read(&cid, &oid, 0, 0).unwrap(), b"SECON");
    second.umount().unwrap();
}

#[test]
fn test_clean_shutdown_trims_and_remounts_quietly() {
    let root = tempdir().unwrap();
    let store = fresh_store(root.path(), crash_test_config());
    let cid = CollectionId::new("pool");
    let oid = ObjectId::from_name("obj");

    let mut tx = Transaction::new();
    tx.create_collection(&cid)
        .write(&cid, &oid, 0, b"durable".to_vec());
    store.apply_transactions(vec![tx]).unwrap();
    store.umount().unwrap();

    // A clean unmount persisted the watermark; nothing needs replaying.
    let remounted = Store::mount(
        root.path().join("store"),
        root.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    assert!(remounted.object_store().applied_seq() >= 1);
    assert_eq!(remounted.read(&cid, &oid, 0, 0).unwrap(), b"durable");
    remounted.umount().unwrap();
}

#[test]
fn test_crash_after_rename_resumes_on_replay() {
    let root = tempdir().unwrap();
    let store = fresh_store(root.path(), crash_test_config());
    let old = CollectionId::new("before");
    let new = CollectionId::new("after");
    let oid = ObjectId::from_name("obj");

    let mut map = std::collections::BTreeMap::new();
    map.insert("mk".to_string(), b"mv".to_vec());
    let mut tx = Transaction::new();
    tx.create_collection(&old)
        .write(&old, &oid, 0, b"data".to_vec())
        .setattr(&old, &oid, "a", b"1".to_vec())
        .omap_setkeys(&old, &oid, map);
    store.apply_transactions(vec![tx]).unwrap();

    let mut tx = Transaction::new();
    tx.collection_rename(&old, &new);
    store.apply_transactions(vec![tx]).unwrap();

    // The directory move is already on disk, but the KV rebind rode a
    // non-durable batch that the crash image loses. Replay must resume
    // the half-done rename instead of tripping over the moved directory.
    let image = crash_image(root.path());
    store.umount().unwrap();

    let replayed = Store::mount(
        image.path().join("store"),
        image.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    assert!(!replayed.collection_exists(&old));
    assert!(replayed.collection_exists(&new));
    assert_eq!(replayed.read(&new, &oid, 0, 0).unwrap(), b"data");
    assert_eq!(replayed.getattr(&new, &oid, "a").unwrap(), b"1");
    assert_eq!(
        replayed.omap_get_values(&new, &oid, &["mk".to_string()]).unwrap()["mk"],
        b"mv"
    );

    // Crash again mid-recovery; the second replay resumes just the same.
    let second_image = crash_image(image.path());
    replayed.umount().unwrap();

    let again = Store::mount(
        second_image.path().join("store"),
        second_image.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    assert!(again.collection_exists(&new));
    assert_eq!(again.read(&new, &oid, 0, 0).unwrap(), b"data");
    again.umount().unwrap();
}

#[test]
fn test_crash_after_remove_replays_remove() {
    let root = tempdir().unwrap();
    let store = fresh_store(root.path(), crash_test_config());
    let cid = CollectionId::new("pool");
    let oid = ObjectId::from_name("doomed");

    let mut tx = Transaction::new();
    tx.create_collection(&cid)
        .write(&cid, &oid, 0, b"bytes".to_vec());
    store.apply_transactions(vec![tx]).unwrap();
    let mut tx = Transaction::new();
    tx.remove(&cid, &oid);
    store.apply_transactions(vec![tx]).unwrap();

    let image = crash_image(root.path());
    store.umount().unwrap();

    let replayed = Store::mount(
        image.path().join("store"),
        image.path().join("journal"),
        crash_test_config(),
    )
    .unwrap();
    assert!(!replayed.exists(&cid, &oid).unwrap());
    replayed.umount().unwrap();
}
