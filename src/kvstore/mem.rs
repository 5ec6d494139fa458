//! In-memory reference backend.
//!
//! Keys are bucketed by prefix: `BTreeMap<prefix, BTreeMap<key, value>>`.
//! Empty buckets are dropped eagerly so iteration never sees one.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};

use parking_lot::RwLock;

use crate::error::Result;
use crate::kvstore::{check_prefix, KvOp, KvStore, KvTransaction, WholeSpaceIter};

type Buckets = BTreeMap<String, BTreeMap<String, Vec<u8>>>;
type Entry = (String, String, Vec<u8>);

/// Non-durable key-value store used as the reference backend in tests and
/// as the `memory` KV option in configuration.
#[derive(Debug, Default)]
pub struct MemKvStore {
    inner: RwLock<Buckets>,
}

impl MemKvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(buckets: &mut Buckets, op: &KvOp) {
        match op {
            KvOp::Set { prefix, key, value } => {
                buckets
                    .entry(prefix.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            KvOp::RmKey { prefix, key } => {
                if let Some(bucket) = buckets.get_mut(prefix) {
                    bucket.remove(key);
                    if bucket.is_empty() {
                        buckets.remove(prefix);
                    }
                }
            }
            KvOp::RmKeysByPrefix { prefix } => {
                buckets.remove(prefix);
            }
        }
    }
}

impl KvStore for MemKvStore {
    fn get(&self, prefix: &str, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>> {
        let buckets = self.inner.read();
        let mut out = BTreeMap::new();
        if let Some(bucket) = buckets.get(prefix) {
            for key in keys {
                if let Some(value) = bucket.get(key) {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }

    fn submit(&self, tx: KvTransaction) -> Result<()> {
        for op in tx.ops() {
            match op {
                KvOp::Set { prefix, .. } | KvOp::RmKeysByPrefix { prefix } => {
                    check_prefix(prefix)?;
                }
                KvOp::RmKey { .. } => {}
            }
        }
        let mut buckets = self.inner.write();
        for op in tx.ops() {
            Self::apply(&mut buckets, op);
        }
        Ok(())
    }

    fn submit_sync(&self, tx: KvTransaction) -> Result<()> {
        self.submit(tx)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn whole_space_iterator(&self) -> Result<Box<dyn WholeSpaceIter + Send + '_>> {
        Ok(Box::new(MemIter {
            view: MapView::Live(&self.inner),
            pos: None,
        }))
    }

    fn snapshot_iterator(&self) -> Result<Box<dyn WholeSpaceIter + Send + '_>> {
        let snapshot = self.inner.read().clone();
        Ok(Box::new(MemIter {
            view: MapView::Snapshot(snapshot),
            pos: None,
        }))
    }
}

enum MapView<'a> {
    Live(&'a RwLock<Buckets>),
    Snapshot(Buckets),
}

impl MapView<'_> {
    fn with<R>(&self, f: impl FnOnce(&Buckets) -> R) -> R {
        match self {
            MapView::Live(lock) => f(&lock.read()),
            MapView::Snapshot(map) => f(map),
        }
    }
}

struct MemIter<'a> {
    view: MapView<'a>,
    pos: Option<Entry>,
}

impl MemIter<'_> {
    fn set_pos(&mut self, entry: Option<Entry>) {
        self.pos = entry;
    }
}

fn clone_entry(prefix: &str, key: &str, value: &[u8]) -> Entry {
    (prefix.to_string(), key.to_string(), value.to_vec())
}

fn first(buckets: &Buckets) -> Option<Entry> {
    buckets
        .iter()
        .next()
        .and_then(|(p, b)| b.iter().next().map(|(k, v)| clone_entry(p, k, v)))
}

fn last(buckets: &Buckets) -> Option<Entry> {
    buckets
        .iter()
        .next_back()
        .and_then(|(p, b)| b.iter().next_back().map(|(k, v)| clone_entry(p, k, v)))
}

fn lower_bound(buckets: &Buckets, prefix: &str, key: &str) -> Option<Entry> {
    for (p, bucket) in buckets.range::<String, _>((Included(prefix.to_string()), Unbounded)) {
        let found = if p == prefix {
            bucket
                .range::<String, _>((Included(key.to_string()), Unbounded))
                .next()
        } else {
            bucket.iter().next()
        };
        if let Some((k, v)) = found {
            return Some(clone_entry(p, k, v));
        }
    }
    None
}

fn upper_bound(buckets: &Buckets, prefix: &str, key: &str) -> Option<Entry> {
    for (p, bucket) in buckets.range::<String, _>((Included(prefix.to_string()), Unbounded)) {
        let found = if p == prefix {
            bucket
                .range::<String, _>((Excluded(key.to_string()), Unbounded))
                .next()
        } else {
            bucket.iter().next()
        };
        if let Some((k, v)) = found {
            return Some(clone_entry(p, k, v));
        }
    }
    None
}

fn step_forward(buckets: &Buckets, prefix: &str, key: &str) -> Option<Entry> {
    upper_bound(buckets, prefix, key)
}

fn step_back(buckets: &Buckets, prefix: &str, key: &str) -> Option<Entry> {
    if let Some(bucket) = buckets.get(prefix) {
        if let Some((k, v)) = bucket.range::<String, _>(..key.to_string()).next_back() {
            return Some(clone_entry(prefix, k, v));
        }
    }
    buckets
        .range::<String, _>(..prefix.to_string())
        .next_back()
        .and_then(|(p, b)| b.iter().next_back().map(|(k, v)| clone_entry(p, k, v)))
}

fn last_at_or_before_prefix(buckets: &Buckets, prefix: &str) -> Option<Entry> {
    buckets
        .range::<String, _>(..=prefix.to_string())
        .next_back()
        .and_then(|(p, b)| b.iter().next_back().map(|(k, v)| clone_entry(p, k, v)))
}

impl WholeSpaceIter for MemIter<'_> {
    fn seek_to_first(&mut self) -> Result<()> {
        let entry = self.view.with(first);
        self.set_pos(entry);
        Ok(())
    }

    fn seek_to_first_in_prefix(&mut self, prefix: &str) -> Result<()> {
        let entry = self.view.with(|b| lower_bound(b, prefix, ""));
        self.set_pos(entry);
        Ok(())
    }

    fn seek_to_last(&mut self) -> Result<()> {
        let entry = self.view.with(last);
        self.set_pos(entry);
        Ok(())
    }

    fn seek_to_last_in_prefix(&mut self, prefix: &str) -> Result<()> {
        let entry = self.view.with(|b| last_at_or_before_prefix(b, prefix));
        self.set_pos(entry);
        Ok(())
    }

    fn lower_bound(&mut self, prefix: &str, key: &str) -> Result<()> {
        let entry = self.view.with(|b| lower_bound(b, prefix, key));
        self.set_pos(entry);
        Ok(())
    }

    fn upper_bound(&mut self, prefix: &str, key: &str) -> Result<()> {
        let entry = self.view.with(|b| upper_bound(b, prefix, key));
        self.set_pos(entry);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        if let Some((p, k, _)) = self.pos.take() {
            let entry = self.view.with(|b| step_forward(b, &p, &k));
            self.set_pos(entry);
        }
        Ok(())
    }

    fn prev(&mut self) -> Result<()> {
        if let Some((p, k, _)) = self.pos.take() {
            let entry = self.view.with(|b| step_back(b, &p, &k));
            self.set_pos(entry);
        }
        Ok(())
    }

    fn valid(&self) -> bool {
        self.pos.is_some()
    }

    fn raw_key(&self) -> (String, String) {
        match &self.pos {
            Some((p, k, _)) => (p.clone(), k.clone()),
            None => (String::new(), String::new()),
        }
    }

    fn value(&self) -> Vec<u8> {
        match &self.pos {
            Some((_, _, v)) => v.clone(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemKvStore {
        let store = MemKvStore::new();
        let mut tx = KvTransaction::new();
        tx.set("P", "01", b"v1".to_vec());
        tx.set("P", "02", b"v2".to_vec());
        tx.set("P", "03", b"v3".to_vec());
        store.submit(tx).unwrap();
        store
    }

    #[test]
    fn test_get_subset() {
        let store = seeded();
        let out = store
            .get("P", &["01".to_string(), "04".to_string()])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out["01"], b"v1");
    }

    #[test]
    fn test_live_iter_survives_delete_under_cursor() {
        let store = seeded();
        let mut iter = store.whole_space_iterator().unwrap();
        iter.seek_to_first().unwrap();

        let mut tx = KvTransaction::new();
        tx.rmkey("P", "01");
        tx.rmkey("P", "02");
        store.submit(tx).unwrap();

        assert!(iter.valid());
        assert_eq!(iter.key(), "01");
        assert_eq!(iter.value(), b"v1");
        iter.next().unwrap();
        assert!(iter.valid());
        assert_eq!(iter.key(), "03");
        assert_eq!(iter.value(), b"v3");
    }

    #[test]
    fn test_snapshot_iter_ignores_later_writes() {
        let store = seeded();
        let mut iter = store.snapshot_iterator().unwrap();
        iter.seek_to_first().unwrap();

        let mut tx = KvTransaction::new();
        tx.rmkeys_by_prefix("P");
        tx.set("Q", "09", b"new".to_vec());
        store.submit(tx).unwrap();

        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.key());
            iter.next().unwrap();
        }
        assert_eq!(seen, ["01", "02", "03"]);
    }

    #[test]
    fn test_bounds_cross_prefixes() {
        let store = MemKvStore::new();
        let mut tx = KvTransaction::new();
        tx.set("P1", "01", b"a".to_vec());
        tx.set("P1", "02", b"b".to_vec());
        tx.set("P2", "03", b"c".to_vec());
        tx.set("P2", "04", b"d".to_vec());
        store.submit(tx).unwrap();

        let mut iter = store.whole_space_iterator().unwrap();
        iter.lower_bound("P1", "").unwrap();
        let mut walked = Vec::new();
        while iter.valid() {
            walked.push(iter.raw_key());
            iter.next().unwrap();
        }
        assert_eq!(walked.len(), 4);
        assert_eq!(walked[3], ("P2".to_string(), "04".to_string()));

        iter.upper_bound("P1", "02").unwrap();
        assert_eq!(iter.raw_key(), ("P2".to_string(), "03".to_string()));

        iter.upper_bound("P2", "99").unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_walks_backwards() {
        let store = seeded();
        let mut iter = store.whole_space_iterator().unwrap();
        iter.seek_to_last().unwrap();
        assert_eq!(iter.key(), "03");
        iter.prev().unwrap();
        assert_eq!(iter.key(), "02");
        iter.prev().unwrap();
        assert_eq!(iter.key(), "01");
        iter.prev().unwrap();
        assert!(!iter.valid());
    }

    #[test]
    fn test_empty_bucket_dropped() {
        let store = seeded();
        let mut tx = KvTransaction::new();
        tx.rmkey("P", "01");
        tx.rmkey("P", "02");
        tx.rmkey("P", "03");
        store.submit(tx).unwrap();
        let mut iter = store.whole_space_iterator().unwrap();
        iter.seek_to_first().unwrap();
        assert!(!iter.valid());
    }
}
