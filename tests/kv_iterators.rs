//! Iterator contract tests run against both KV backends.

use oxistore::kvstore::{KvStore, KvTransaction, MemKvStore, RedbKvStore};
use tempfile::tempdir;

fn seed(store: &dyn KvStore, entries: &[(&str, &str, &[u8])]) {
    let mut tx = KvTransaction::new();
    for (prefix, key, value) in entries {
        tx.set(prefix, key, value.to_vec());
    }
    store.submit_sync(tx).unwrap();
}

fn each_backend(test: impl Fn(&dyn KvStore)) {
    let mem = MemKvStore::new();
    test(&mem);

    let dir = tempdir().unwrap();
    let redb = RedbKvStore::open(dir.path().join("kv.redb")).unwrap();
    test(&redb);
}

#[test]
fn test_live_iterator_positioned_before_rmkeys() {
    each_backend(|store| {
        seed(
            store,
            &[("P", "01", b"v1"), ("P", "02", b"v2"), ("P", "03", b"v3")],
        );

        let mut iter = store.whole_space_iterator().unwrap();
        iter.seek_to_first_in_prefix("P").unwrap();

        let mut tx = KvTransaction::new();
        tx.rmkey("P", "01");
        tx.rmkey("P", "02");
        store.submit_sync(tx).unwrap();

        // The cursor still reports the entry it sat on before the delete.
        assert!(iter.valid());
        assert_eq!(iter.key(), "01");
        assert_eq!(iter.value(), b"v1");

        // Movement walks the post-mutation state.
        iter.next().unwrap();
        assert!(iter.valid());
        assert_eq!(iter.key(), "03");
        assert_eq!(iter.value(), b"v3");
        iter.next().unwrap();
        assert!(!iter.valid());
    });
}

#[test]
fn test_snapshot_iterator_unaffected_by_rmkeys() {
    each_backend(|store| {
        seed(
            store,
            &[("P", "01", b"v1"), ("P", "02", b"v2"), ("P", "03", b"v3")],
        );

        let mut iter = store.snapshot_iterator().unwrap();
        iter.seek_to_first_in_prefix("P").unwrap();

        let mut tx = KvTransaction::new();
        tx.rmkey("P", "01");
        tx.rmkey("P", "02");
        store.submit_sync(tx).unwrap();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push((iter.key(), iter.value()));
            iter.next().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                ("01".to_string(), b"v1".to_vec()),
                ("02".to_string(), b"v2".to_vec()),
                ("03".to_string(), b"v3".to_vec()),
            ]
        );
    });
}

#[test]
fn test_two_prefix_bounds() {
    each_backend(|store| {
        seed(
            store,
            &[
                ("P1", "01", b"a"),
                ("P1", "02", b"b"),
                ("P2", "03", b"c"),
                ("P2", "04", b"d"),
            ],
        );

        let mut iter = store.whole_space_iterator().unwrap();

        // lower_bound at the start of P1 walks all four entries in order.
        iter.lower_bound("P1", "").unwrap();
        let mut walked = Vec::new();
        while iter.valid() {
            walked.push(iter.raw_key());
            iter.next().unwrap();
        }
        assert_eq!(
            walked,
            vec![
                ("P1".to_string(), "01".to_string()),
                ("P1".to_string(), "02".to_string()),
                ("P2".to_string(), "03".to_string()),
                ("P2".to_string(), "04".to_string()),
            ]
        );

        // upper_bound past the last key of P1 lands on P2's first.
        iter.upper_bound("P1", "02").unwrap();
        assert!(iter.valid());
        assert_eq!(iter.raw_key(), ("P2".to_string(), "03".to_string()));

        // upper_bound past everything is invalid.
        iter.upper_bound("P2", "99").unwrap();
        assert!(!iter.valid());
    });
}

#[test]
fn test_empty_prefix_not_valid() {
    each_backend(|store| {
        seed(store, &[("Q", "01", b"x")]);
        let mut iter = store.prefix_iterator("P").unwrap();
        iter.seek_to_first().unwrap();
        assert!(!iter.valid());
    });
}

#[test]
fn test_prefix_iterator_confined() {
    each_backend(|store| {
        seed(
            store,
            &[("A", "1", b"a"), ("B", "1", b"b1"), ("B", "2", b"b2"), ("C", "1", b"c")],
        );
        let mut iter = store.prefix_iterator("B").unwrap();
        iter.seek_to_first().unwrap();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key());
            iter.next().unwrap();
        }
        assert_eq!(seen, ["1", "2"]);

        iter.seek_to_last().unwrap();
        assert!(iter.valid());
        assert_eq!(iter.key(), "2");
    });
}

#[test]
fn test_reverse_iteration() {
    each_backend(|store| {
        seed(
            store,
            &[("P", "01", b"a"), ("P", "02", b"b"), ("Q", "01", b"c")],
        );
        let mut iter = store.whole_space_iterator().unwrap();
        iter.seek_to_last().unwrap();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.raw_key());
            iter.prev().unwrap();
        }
        assert_eq!(
            seen,
            vec![
                ("Q".to_string(), "01".to_string()),
                ("P".to_string(), "02".to_string()),
                ("P".to_string(), "01".to_string()),
            ]
        );
    });
}
