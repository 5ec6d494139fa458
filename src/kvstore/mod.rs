//! Ordered key-value store abstraction.
//!
//! The key space is `(prefix, key)` in lexicographic order of the pair.
//! Flat backends encode the pair as `prefix ++ 0x00 ++ key`; the byte
//! `0x00` therefore must not appear in prefixes. Mutations are batched
//! into a [`KvTransaction`] and applied all-or-nothing.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

mod db;
mod mem;

pub use db::RedbKvStore;
pub use mem::MemKvStore;

/// Separator byte between prefix and key in flat encodings.
pub const PREFIX_SEP: u8 = 0x00;

/// Byte appended to a prefix to form the smallest raw key past it.
pub const PAST_PREFIX: u8 = 0x01;

/// Encode `(prefix, key)` into a single flat key.
pub fn combine_key(prefix: &str, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1 + key.len());
    out.extend_from_slice(prefix.as_bytes());
    out.push(PREFIX_SEP);
    out.extend_from_slice(key.as_bytes());
    out
}

/// Split a flat key back into `(prefix, key)` at the first separator.
pub fn split_key(raw: &[u8]) -> Option<(String, String)> {
    let sep = raw.iter().position(|b| *b == PREFIX_SEP)?;
    let prefix = String::from_utf8(raw[..sep].to_vec()).ok()?;
    let key = String::from_utf8(raw[sep + 1..].to_vec()).ok()?;
    Some((prefix, key))
}

/// The smallest flat key strictly greater than every key in `prefix`.
pub fn past_prefix(prefix: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + 1);
    out.extend_from_slice(prefix.as_bytes());
    out.push(PAST_PREFIX);
    out
}

/// Reject prefixes that would collide with the flat encoding.
pub fn check_prefix(prefix: &str) -> Result<()> {
    if prefix.as_bytes().contains(&PREFIX_SEP) {
        return Err(Error::InvalidArgument(format!(
            "prefix {prefix:?} contains the separator byte"
        )));
    }
    Ok(())
}

/// A single staged mutation.
#[derive(Debug, Clone)]
pub enum KvOp {
    /// Insert or overwrite one key.
    Set {
        /// Key prefix.
        prefix: String,
        /// Key within the prefix.
        key: String,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove one key (absent keys are ignored).
    RmKey {
        /// Key prefix.
        prefix: String,
        /// Key within the prefix.
        key: String,
    },
    /// Remove every key under a prefix.
    RmKeysByPrefix {
        /// Key prefix to clear.
        prefix: String,
    },
}

/// An all-or-nothing batch of mutations.
#[derive(Debug, Default)]
pub struct KvTransaction {
    ops: Vec<KvOp>,
}

impl KvTransaction {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a set.
    pub fn set(&mut self, prefix: &str, key: &str, value: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::Set {
            prefix: prefix.to_string(),
            key: key.to_string(),
            value: value.into(),
        });
    }

    /// Stage removal of one key.
    pub fn rmkey(&mut self, prefix: &str, key: &str) {
        self.ops.push(KvOp::RmKey {
            prefix: prefix.to_string(),
            key: key.to_string(),
        });
    }

    /// Stage removal of every key under `prefix`.
    pub fn rmkeys_by_prefix(&mut self, prefix: &str) {
        self.ops.push(KvOp::RmKeysByPrefix {
            prefix: prefix.to_string(),
        });
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// The staged mutations, in order.
    pub fn ops(&self) -> &[KvOp] {
        &self.ops
    }
}

/// Cursor over the whole `(prefix, key)` space.
///
/// Seeks position the cursor in flat order and may land in a different
/// prefix than the one asked for; [`PrefixIter`] confines a cursor to one
/// prefix. A live cursor caches the entry it is positioned on, so after a
/// concurrent mutation it still reports the pre-mutation entry; `next` and
/// `prev` then walk the post-mutation state. Snapshot cursors are immune to
/// concurrent mutation entirely.
pub trait WholeSpaceIter: Send {
    /// Position on the first entry of the space.
    fn seek_to_first(&mut self) -> Result<()>;
    /// Position on the first entry at or past `(prefix, "")`.
    fn seek_to_first_in_prefix(&mut self, prefix: &str) -> Result<()>;
    /// Position on the last entry of the space.
    fn seek_to_last(&mut self) -> Result<()>;
    /// Position on the last entry of `prefix` (or the last entry before it
    /// when the prefix is empty).
    fn seek_to_last_in_prefix(&mut self, prefix: &str) -> Result<()>;
    /// Position on the first entry `>= (prefix, key)`.
    fn lower_bound(&mut self, prefix: &str, key: &str) -> Result<()>;
    /// Position on the first entry `> (prefix, key)`.
    fn upper_bound(&mut self, prefix: &str, key: &str) -> Result<()>;
    /// Advance to the next entry.
    fn next(&mut self) -> Result<()>;
    /// Step back to the previous entry.
    fn prev(&mut self) -> Result<()>;
    /// Whether the cursor is positioned on an entry.
    fn valid(&self) -> bool;
    /// `(prefix, key)` of the current entry; empty strings when invalid.
    fn raw_key(&self) -> (String, String);
    /// Key part of the current entry.
    fn key(&self) -> String {
        self.raw_key().1
    }
    /// Value of the current entry; empty when invalid.
    fn value(&self) -> Vec<u8>;
}

/// A [`WholeSpaceIter`] confined to a single prefix.
pub struct PrefixIter<'a> {
    prefix: String,
    inner: Box<dyn WholeSpaceIter + Send + 'a>,
}

impl<'a> PrefixIter<'a> {
    /// Wrap a whole-space cursor.
    pub fn new(prefix: impl Into<String>, inner: Box<dyn WholeSpaceIter + Send + 'a>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// Position on the first key of the prefix.
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.inner.seek_to_first_in_prefix(&self.prefix)
    }

    /// Position on the last key of the prefix.
    pub fn seek_to_last(&mut self) -> Result<()> {
        self.inner.seek_to_last_in_prefix(&self.prefix)
    }

    /// Position on the first key `>= key`.
    pub fn lower_bound(&mut self, key: &str) -> Result<()> {
        self.inner.lower_bound(&self.prefix, key)
    }

    /// Position on the first key `> key`.
    pub fn upper_bound(&mut self, key: &str) -> Result<()> {
        self.inner.upper_bound(&self.prefix, key)
    }

    /// Valid only while the underlying cursor sits inside the prefix.
    pub fn valid(&self) -> bool {
        self.inner.valid() && self.inner.raw_key().0 == self.prefix
    }

    /// Advance; a cursor that has left the prefix stays put.
    pub fn next(&mut self) -> Result<()> {
        if self.valid() {
            self.inner.next()?;
        }
        Ok(())
    }

    /// Step back; a cursor that has left the prefix stays put.
    pub fn prev(&mut self) -> Result<()> {
        if self.valid() {
            self.inner.prev()?;
        }
        Ok(())
    }

    /// Key within the prefix.
    pub fn key(&self) -> String {
        self.inner.key()
    }

    /// Current value.
    pub fn value(&self) -> Vec<u8> {
        self.inner.value()
    }
}

/// Ordered key-value store with atomic batches and snapshot cursors.
pub trait KvStore: Send + Sync {
    /// Fetch the subset of `keys` present under `prefix`.
    fn get(&self, prefix: &str, keys: &[String]) -> Result<BTreeMap<String, Vec<u8>>>;

    /// Apply a batch; durability may lag until [`KvStore::sync`].
    fn submit(&self, tx: KvTransaction) -> Result<()>;

    /// Apply a batch and return only once it is durable.
    fn submit_sync(&self, tx: KvTransaction) -> Result<()>;

    /// Make every previously applied batch durable.
    fn sync(&self) -> Result<()>;

    /// Live cursor over the whole space.
    fn whole_space_iterator(&self) -> Result<Box<dyn WholeSpaceIter + Send + '_>>;

    /// Snapshot cursor fixed to the state at the moment of creation.
    fn snapshot_iterator(&self) -> Result<Box<dyn WholeSpaceIter + Send + '_>>;

    /// Live cursor confined to `prefix`.
    fn prefix_iterator(&self, prefix: &str) -> Result<PrefixIter<'_>> {
        Ok(PrefixIter::new(prefix, self.whole_space_iterator()?))
    }

    /// Snapshot cursor confined to `prefix`.
    fn snapshot_prefix_iterator(&self, prefix: &str) -> Result<PrefixIter<'_>> {
        Ok(PrefixIter::new(prefix, self.snapshot_iterator()?))
    }

    /// Convenience: a single durable `set`.
    fn set_one(&self, prefix: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut tx = KvTransaction::new();
        tx.set(prefix, key, value.to_vec());
        self.submit_sync(tx)
    }

    /// Convenience: fetch a single key.
    fn get_one(&self, prefix: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let mut out = self.get(prefix, &[key.to_string()])?;
        Ok(out.remove(key))
    }

    /// Collect every `(key, value)` under `prefix`, in order.
    fn get_by_prefix(&self, prefix: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut iter = self.snapshot_prefix_iterator(prefix)?;
        iter.seek_to_first()?;
        let mut out = BTreeMap::new();
        while iter.valid() {
            out.insert(iter.key(), iter.value());
            iter.next()?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_split_roundtrip() {
        let raw = combine_key("omap.7", "key-01");
        assert_eq!(
            split_key(&raw),
            Some(("omap.7".to_string(), "key-01".to_string()))
        );
    }

    #[test]
    fn test_split_at_first_separator_only() {
        let mut raw = combine_key("p", "a");
        raw.push(PREFIX_SEP);
        raw.push(b'b');
        let (prefix, key) = split_key(&raw).unwrap();
        assert_eq!(prefix, "p");
        assert_eq!(key.as_bytes(), b"a\x00b");
    }

    #[test]
    fn test_past_prefix_ordering() {
        let prefix = "attr";
        assert!(combine_key(prefix, "zzzz") < past_prefix(prefix));
        assert!(past_prefix(prefix).as_slice() < combine_key("attr0", "").as_slice());
    }

    #[test]
    fn test_check_prefix_rejects_separator() {
        assert!(check_prefix("ok").is_ok());
        assert!(check_prefix("bad\0prefix").is_err());
    }
}
