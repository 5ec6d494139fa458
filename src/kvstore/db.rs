//! Durable backend over an embedded ordered key-value store (redb).
//!
//! One table holds the whole space in the flat `(prefix, key)` encoding.
//! Batches map to a single write transaction, so they are all-or-nothing;
//! snapshot cursors pin an MVCC read transaction for their lifetime.

use std::io;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::Path;

use redb::{
    Database, Durability, ReadTransaction, ReadableTable, ReadOnlyTable, TableDefinition,
};

use crate::error::{Error, Result};
use crate::kvstore::{
    check_prefix, combine_key, past_prefix, split_key, KvOp, KvStore, KvTransaction,
    WholeSpaceIter,
};

const TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("kv");

fn store_err(err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Io {
        source: io::Error::other(err),
    }
}

/// Key-value store backed by a redb database file.
pub struct RedbKvStore {
    db: Database,
}

impl RedbKvStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let txn = db.begin_write().map_err(store_err)?;
        {
            txn.open_table(TABLE).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    fn submit_inner(&self, tx: KvTransaction, durable: bool) -> Result<()> {
        let mut txn = self.db.begin_write().map_err(store_err)?;
        if !durable {
            txn.set_durability(Durability::None);
        }
        {
            let mut table = txn.open_table(TABLE).map_err(store_err)?;
            for op in tx.ops() {
                match op {
                    KvOp::Set { prefix, key, value } => {
                        check_prefix(prefix)?;
                        table
                            .insert(combine_key(prefix, key).as_slice(), value.as_slice())
                            .map_err(store_err)?;
                    }
                    KvOp::RmKey { prefix, key } => {
                        table
                            .remove(combine_key(prefix, key).as_slice())
                            .map_err(store_err)?;
                    }
                    KvOp::RmKeysByPrefix { prefix } => {
                        check_prefix(prefix)?;
                        let start = combine_key(prefix, "");
                        let end = past_prefix(prefix);
                        let mut doomed = Vec::new();
                        for item in table
                            .range::<&[u8]>(start.as_slice()..end.as_slice())
                            .map_err(store_err)?
                        {
                            let (raw, _) = item.map_err(store_err)?;
                            doomed.push(raw.value().to_vec());
                        }
                        for raw in doomed {
                            table.remove(raw.as_slice()).map_err(store_err)?;
                        }
                    }
                }
            }
        }
        txn.commit().map_err(store_err)?;
        Ok(())
    }

    fn read_table(&self) -> Result<ReadOnlyTable<&'static [u8], &'static [u8]>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        txn.open_table(TABLE).map_err(store_err)
    }
}

impl KvStore for RedbKvStore {
    fn get(&self, prefix: &str, keys: &[String]) -> Result<std::collections::BTreeMap<String, Vec<u8>>> {
        let table = self.read_table()?;
        let mut out = std::collections::BTreeMap::new();
        for key in keys {
            let raw = combine_key(prefix, key);
            if let Some(guard) = table.get(raw.as_slice()).map_err(store_err)? {
                out.insert(key.clone(), guard.value().to_vec());
            }
        }
        Ok(out)
    }

    fn submit(&self, tx: KvTransaction) -> Result<()> {
        self.submit_inner(tx, false)
    }

    fn submit_sync(&self, tx: KvTransaction) -> Result<()> {
        self.submit_inner(tx, true)
    }

    fn sync(&self) -> Result<()> {
        // A durable empty commit persists every earlier non-durable commit.
        let txn = self.db.begin_write().map_err(store_err)?;
        txn.commit().map_err(store_err)?;
        Ok(())
    }

    fn whole_space_iterator(&self) -> Result<Box<dyn WholeSpaceIter + Send + '_>> {
        Ok(Box::new(RedbLiveIter {
            store: self,
            pos: None,
        }))
    }

    fn snapshot_iterator(&self) -> Result<Box<dyn WholeSpaceIter + Send + '_>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(TABLE).map_err(store_err)?;
        Ok(Box::new(RedbSnapshotIter {
            _txn: txn,
            table,
            pos: None,
        }))
    }
}

type RawEntry = (Vec<u8>, Vec<u8>);

fn first_at_or_after(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    start: &[u8],
) -> Result<Option<RawEntry>> {
    let mut range = table.range::<&[u8]>(start..).map_err(store_err)?;
    match range.next() {
        Some(item) => {
            let (k, v) = item.map_err(store_err)?;
            Ok(Some((k.value().to_vec(), v.value().to_vec())))
        }
        None => Ok(None),
    }
}

fn first_after(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    cur: &[u8],
) -> Result<Option<RawEntry>> {
    let mut range = table
        .range::<&[u8]>((Excluded(cur), Unbounded))
        .map_err(store_err)?;
    match range.next() {
        Some(item) => {
            let (k, v) = item.map_err(store_err)?;
            Ok(Some((k.value().to_vec(), v.value().to_vec())))
        }
        None => Ok(None),
    }
}

fn last_before(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    end: &[u8],
) -> Result<Option<RawEntry>> {
    let mut range = table.range::<&[u8]>(..end).map_err(store_err)?;
    match range.next_back() {
        Some(item) => {
            let (k, v) = item.map_err(store_err)?;
            Ok(Some((k.value().to_vec(), v.value().to_vec())))
        }
        None => Ok(None),
    }
}

fn first_entry(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<Option<RawEntry>> {
    first_at_or_after(table, &[])
}

fn last_entry(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
) -> Result<Option<RawEntry>> {
    let mut range = table.range::<&[u8]>(..).map_err(store_err)?;
    match range.next_back() {
        Some(item) => {
            let (k, v) = item.map_err(store_err)?;
            Ok(Some((k.value().to_vec(), v.value().to_vec())))
        }
        None => Ok(None),
    }
}

/// Cursor over the live database; each movement reads current state.
struct RedbLiveIter<'a> {
    store: &'a RedbKvStore,
    pos: Option<RawEntry>,
}

impl RedbLiveIter<'_> {
    fn query(
        &self,
        f: impl FnOnce(&ReadOnlyTable<&'static [u8], &'static [u8]>) -> Result<Option<RawEntry>>,
    ) -> Result<Option<RawEntry>> {
        let table = self.store.read_table()?;
        f(&table)
    }
}

/// Cursor pinned to the database state at creation time.
struct RedbSnapshotIter {
    _txn: ReadTransaction,
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    pos: Option<RawEntry>,
}

macro_rules! impl_redb_iter {
    ($ty:ty) => {
        impl WholeSpaceIter for $ty {
            fn seek_to_first(&mut self) -> Result<()> {
                self.pos = self.query(|t| first_entry(t))?;
                Ok(())
            }

            fn seek_to_first_in_prefix(&mut self, prefix: &str) -> Result<()> {
                let start = combine_key(prefix, "");
                self.pos = self.query(|t| first_at_or_after(t, &start))?;
                Ok(())
            }

            fn seek_to_last(&mut self) -> Result<()> {
                self.pos = self.query(|t| last_entry(t))?;
                Ok(())
            }

            fn seek_to_last_in_prefix(&mut self, prefix: &str) -> Result<()> {
                let end = past_prefix(prefix);
                self.pos = self.query(|t| last_before(t, &end))?;
                Ok(())
            }

            fn lower_bound(&mut self, prefix: &str, key: &str) -> Result<()> {
                let start = combine_key(prefix, key);
                self.pos = self.query(|t| first_at_or_after(t, &start))?;
                Ok(())
            }

            fn upper_bound(&mut self, prefix: &str, key: &str) -> Result<()> {
                self.lower_bound(prefix, key)?;
                let skip = match &self.pos {
                    Some((raw, _)) => split_key(raw).map(|(_, k)| k).as_deref() == Some(key),
                    None => false,
                };
                if skip {
                    self.next()?;
                }
                Ok(())
            }

            fn next(&mut self) -> Result<()> {
                if let Some((raw, _)) = self.pos.take() {
                    self.pos = self.query(|t| first_after(t, &raw))?;
                }
                Ok(())
            }

            fn prev(&mut self) -> Result<()> {
                if let Some((raw, _)) = self.pos.take() {
                    self.pos = self.query(|t| last_before(t, &raw))?;
                }
                Ok(())
            }

            fn valid(&self) -> bool {
                self.pos.is_some()
            }

            fn raw_key(&self) -> (String, String) {
                self.pos
                    .as_ref()
                    .and_then(|(raw, _)| split_key(raw))
                    .unwrap_or_default()
            }

            fn value(&self) -> Vec<u8> {
                self.pos.as_ref().map(|(_, v)| v.clone()).unwrap_or_default()
            }
        }
    };
}

impl RedbSnapshotIter {
    fn query(
        &self,
        f: impl FnOnce(&ReadOnlyTable<&'static [u8], &'static [u8]>) -> Result<Option<RawEntry>>,
    ) -> Result<Option<RawEntry>> {
        f(&self.table)
    }
}

impl_redb_iter!(RedbLiveIter<'_>);
impl_redb_iter!(RedbSnapshotIter);
