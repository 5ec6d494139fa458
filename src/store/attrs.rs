//! Attribute storage for objects and collections.
//!
//! Attributes live in the shared KV store under one prefix per owner:
//! `attr.<coll>.<object>` for objects and `cattr.<coll>` for collections.
//! The encoded id fields never contain `.`, so prefix boundaries are
//! unambiguous when a collection rename rebinds them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::kvstore::{KvStore, KvTransaction};
use crate::types::{CollectionId, ObjectId};

fn object_prefix(cid: &CollectionId, oid: &ObjectId) -> String {
    format!("attr.{}.{}", cid.encoded(), oid.file_name())
}

fn coll_prefix(cid: &CollectionId) -> String {
    format!("cattr.{}", cid.encoded())
}

/// Attribute component shared by the object store.
pub struct AttrStore {
    kv: Arc<dyn KvStore>,
}

impl AttrStore {
    /// Wrap the shared KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// One attribute value; [`Error::NoData`] when the attribute is absent.
    pub fn getattr(&self, cid: &CollectionId, oid: &ObjectId, name: &str) -> Result<Vec<u8>> {
        self.kv
            .get_one(&object_prefix(cid, oid), name)?
            .ok_or_else(|| Error::NoData(format!("{oid} has no attribute {name:?}")))
    }

    /// Every attribute of an object.
    pub fn getattrs(&self, cid: &CollectionId, oid: &ObjectId) -> Result<BTreeMap<String, Vec<u8>>> {
        self.kv.get_by_prefix(&object_prefix(cid, oid))
    }

    /// Stage one attribute write.
    pub fn setattr(
        &self,
        batch: &mut KvTransaction,
        cid: &CollectionId,
        oid: &ObjectId,
        name: &str,
        value: &[u8],
    ) {
        batch.set(&object_prefix(cid, oid), name, value.to_vec());
    }

    /// Stage removal of one attribute.
    pub fn rmattr(&self, batch: &mut KvTransaction, cid: &CollectionId, oid: &ObjectId, name: &str) {
        batch.rmkey(&object_prefix(cid, oid), name);
    }

    /// Stage removal of every attribute of an object.
    pub fn rmattrs(&self, batch: &mut KvTransaction, cid: &CollectionId, oid: &ObjectId) {
        batch.rmkeys_by_prefix(&object_prefix(cid, oid));
    }

    /// Stage a copy of all of `src`'s attributes onto `dst`, replacing
    /// whatever `dst` had.
    pub fn clone_object(
        &self,
        batch: &mut KvTransaction,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
    ) -> Result<()> {
        self.rmattrs(batch, cid, dst);
        let dst_prefix = object_prefix(cid, dst);
        for (name, value) in self.getattrs(cid, src)? {
            batch.set(&dst_prefix, &name, value);
        }
        Ok(())
    }

    /// Stage a copy of attributes across collections.
    pub fn copy_object(
        &self,
        batch: &mut KvTransaction,
        src_cid: &CollectionId,
        dst_cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<()> {
        let dst_prefix = object_prefix(dst_cid, oid);
        batch.rmkeys_by_prefix(&dst_prefix);
        for (name, value) in self.getattrs(src_cid, oid)? {
            batch.set(&dst_prefix, &name, value);
        }
        Ok(())
    }

    /// One collection attribute; [`Error::NoData`] when absent.
    pub fn coll_getattr(&self, cid: &CollectionId, name: &str) -> Result<Vec<u8>> {
        self.kv
            .get_one(&coll_prefix(cid), name)?
            .ok_or_else(|| Error::NoData(format!("collection {cid} has no attribute {name:?}")))
    }

    /// Every attribute of a collection.
    pub fn coll_getattrs(&self, cid: &CollectionId) -> Result<BTreeMap<String, Vec<u8>>> {
        self.kv.get_by_prefix(&coll_prefix(cid))
    }

    /// Stage a collection attribute write.
    pub fn coll_setattr(&self, batch: &mut KvTransaction, cid: &CollectionId, name: &str, value: &[u8]) {
        batch.set(&coll_prefix(cid), name, value.to_vec());
    }

    /// Stage removal of a collection attribute.
    pub fn coll_rmattr(&self, batch: &mut KvTransaction, cid: &CollectionId, name: &str) {
        batch.rmkey(&coll_prefix(cid), name);
    }

    /// Stage removal of every collection attribute.
    pub fn coll_rmattrs(&self, batch: &mut KvTransaction, cid: &CollectionId) {
        batch.rmkeys_by_prefix(&coll_prefix(cid));
    }

    /// Stage the rebinding of every attribute prefix of `old` onto `new`
    /// (collection rename).
    pub fn rename_collection(
        &self,
        batch: &mut KvTransaction,
        old: &CollectionId,
        new: &CollectionId,
    ) -> Result<()> {
        let old_base = format!("attr.{}.", old.encoded());
        let new_base = format!("attr.{}.", new.encoded());

        let mut iter = self.kv.snapshot_iterator()?;
        iter.seek_to_first_in_prefix(&old_base)?;
        while iter.valid() {
            let (prefix, key) = iter.raw_key();
            if !prefix.starts_with(&old_base) {
                break;
            }
            let moved = format!("{new_base}{}", &prefix[old_base.len()..]);
            batch.rmkey(&prefix, &key);
            batch.set(&moved, &key, iter.value());
            iter.next()?;
        }

        let old_coll = coll_prefix(old);
        let new_coll = coll_prefix(new);
        for (name, value) in self.kv.get_by_prefix(&old_coll)? {
            batch.rmkey(&old_coll, &name);
            batch.set(&new_coll, &name, value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::kvstore::MemKvStore;

    fn fixture() -> (AttrStore, Arc<dyn KvStore>, CollectionId, ObjectId) {
        let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let attrs = AttrStore::new(Arc::clone(&kv));
        (attrs, kv, CollectionId::new("pool"), ObjectId::from_name("obj"))
    }

    #[test]
    fn test_setattr_getattr_roundtrip() {
        let (attrs, kv, cid, oid) = fixture();
        let mut batch = KvTransaction::new();
        attrs.setattr(&mut batch, &cid, &oid, "owner", b"osd.3");
        kv.submit(batch).unwrap();
        assert_eq!(attrs.getattr(&cid, &oid, "owner").unwrap(), b"osd.3");
    }

    #[test]
    fn test_absent_attr_is_no_data() {
        let (attrs, _kv, cid, oid) = fixture();
        let err = attrs.getattr(&cid, &oid, "missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoData);
    }

    #[test]
    fn test_rmattrs_clears_everything() {
        let (attrs, kv, cid, oid) = fixture();
        let mut batch = KvTransaction::new();
        attrs.setattr(&mut batch, &cid, &oid, "a", b"1");
        attrs.setattr(&mut batch, &cid, &oid, "b", b"2");
        kv.submit(batch).unwrap();

        let mut batch = KvTransaction::new();
        attrs.rmattrs(&mut batch, &cid, &oid);
        kv.submit(batch).unwrap();
        assert!(attrs.getattrs(&cid, &oid).unwrap().is_empty());
    }

    #[test]
    fn test_rename_rebinds_object_and_collection_attrs() {
        let (attrs, kv, cid, oid) = fixture();
        let mut batch = KvTransaction::new();
        attrs.setattr(&mut batch, &cid, &oid, "a", b"1");
        attrs.coll_setattr(&mut batch, &cid, "tier", b"ssd");
        kv.submit(batch).unwrap();

        let new_cid = CollectionId::new("pool-renamed");
        let mut batch = KvTransaction::new();
        attrs.rename_collection(&mut batch, &cid, &new_cid).unwrap();
        kv.submit(batch).unwrap();

        assert_eq!(attrs.getattr(&new_cid, &oid, "a").unwrap(), b"1");
        assert_eq!(attrs.coll_getattr(&new_cid, "tier").unwrap(), b"ssd");
        assert!(attrs.getattrs(&cid, &oid).unwrap().is_empty());
        assert!(attrs.coll_getattrs(&cid).unwrap().is_empty());
    }

    #[test]
    fn test_rename_does_not_bleed_into_longer_cid() {
        let (attrs, kv, _cid, oid) = fixture();
        let short = CollectionId::new("a");
        let long = CollectionId::new("ab");
        let mut batch = KvTransaction::new();
        attrs.setattr(&mut batch, &short, &oid, "k", b"short");
        attrs.setattr(&mut batch, &long, &oid, "k", b"long");
        kv.submit(batch).unwrap();

        let renamed = CollectionId::new("z");
        let mut batch = KvTransaction::new();
        attrs.rename_collection(&mut batch, &short, &renamed).unwrap();
        kv.submit(batch).unwrap();

        assert_eq!(attrs.getattr(&renamed, &oid, "k").unwrap(), b"short");
        assert_eq!(attrs.getattr(&long, &oid, "k").unwrap(), b"long");
    }
}
