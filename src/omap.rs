//! Per-object sorted key-value maps layered on the shared KV store.
//!
//! Every object with omap data owns a header id. User keys live under the
//! per-id prefix `omap.<id>`, the optional header blob under `omap_hdr`,
//! and the object-to-id mapping under `omap_obj`. Allocated ids are marked
//! under `omap_sys` so the allocator can recover its counter on mount
//! without ordering assumptions between concurrent batches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::kvstore::{KvStore, KvTransaction, PrefixIter};
use crate::types::{CollectionId, ObjectId};

const OBJ_PREFIX: &str = "omap_obj";
const HDR_PREFIX: &str = "omap_hdr";
const SYS_PREFIX: &str = "omap_sys";

/// Prefix that never holds keys; used to hand out empty iterators.
const EMPTY_PREFIX: &str = "omap_empty";

fn user_prefix(id: u64) -> String {
    format!("omap.{id:016x}")
}

fn id_key(id: u64) -> String {
    format!("{id:016x}")
}

/// Key identifying an object across the omap, attr and guard namespaces.
pub fn object_key(cid: &CollectionId, oid: &ObjectId) -> String {
    format!("{}/{}", cid.encoded(), oid.file_name())
}

/// Per-transaction scratch state: header ids allocated by earlier opcodes
/// of the same batch, visible before the batch commits.
pub type OmapTxnCache = HashMap<String, u64>;

/// Omap component shared by the object store.
pub struct OmapStore {
    kv: Arc<dyn KvStore>,
    next_id: Mutex<u64>,
}

impl OmapStore {
    /// Open the component, recovering the id allocator from disk.
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        let next = {
            let mut iter = kv.prefix_iterator(SYS_PREFIX)?;
            iter.seek_to_last()?;
            if iter.valid() {
                u64::from_str_radix(&iter.key(), 16).map(|id| id + 1).unwrap_or(1)
            } else {
                1
            }
        };
        Ok(Self {
            kv,
            next_id: Mutex::new(next),
        })
    }

    /// Header id of an object, if it has omap data.
    pub fn header_id(&self, objkey: &str) -> Result<Option<u64>> {
        match self.kv.get_one(OBJ_PREFIX, objkey)? {
            Some(raw) if raw.len() == 8 => {
                Ok(Some(u64::from_le_bytes(raw.as_slice().try_into().unwrap())))
            }
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    fn resolve(&self, cache: &OmapTxnCache, objkey: &str) -> Result<Option<u64>> {
        if let Some(id) = cache.get(objkey) {
            return Ok(Some(*id));
        }
        self.header_id(objkey)
    }

    fn ensure(
        &self,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
        objkey: &str,
    ) -> Result<u64> {
        if let Some(id) = self.resolve(cache, objkey)? {
            cache.insert(objkey.to_string(), id);
            return Ok(id);
        }
        let id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        batch.set(SYS_PREFIX, &id_key(id), vec![1u8]);
        batch.set(OBJ_PREFIX, objkey, id.to_le_bytes().to_vec());
        cache.insert(objkey.to_string(), id);
        Ok(id)
    }

    /// Stage inserts of `map` into the object's omap.
    pub fn set_keys(
        &self,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
        objkey: &str,
        map: &BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        let id = self.ensure(batch, cache, objkey)?;
        let prefix = user_prefix(id);
        for (key, value) in map {
            batch.set(&prefix, key, value.clone());
        }
        Ok(())
    }

    /// Stage removal of `keys`.
    pub fn rm_keys(
        &self,
        batch: &mut KvTransaction,
        cache: &OmapTxnCache,
        objkey: &str,
        keys: &BTreeSet<String>,
    ) -> Result<()> {
        if let Some(id) = self.resolve(cache, objkey)? {
            let prefix = user_prefix(id);
            for key in keys {
                batch.rmkey(&prefix, key);
            }
        }
        Ok(())
    }

    /// Stage replacement of the header blob.
    pub fn set_header(
        &self,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
        objkey: &str,
        data: &[u8],
    ) -> Result<()> {
        let id = self.ensure(batch, cache, objkey)?;
        batch.set(HDR_PREFIX, &id_key(id), data.to_vec());
        Ok(())
    }

    /// Stage full teardown of the object's omap: keys, header blob, id
    /// mapping and allocator marker. Used by both `omap_clear` and object
    /// removal, so destroying an object never leaves orphan keys.
    pub fn destroy(
        &self,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
        objkey: &str,
    ) -> Result<()> {
        if let Some(id) = self.resolve(cache, objkey)? {
            batch.rmkeys_by_prefix(&user_prefix(id));
            batch.rmkey(HDR_PREFIX, &id_key(id));
            batch.rmkey(SYS_PREFIX, &id_key(id));
            batch.rmkey(OBJ_PREFIX, objkey);
            cache.remove(objkey);
        }
        Ok(())
    }

    /// Stage a copy of `src`'s omap onto `dst`, replacing whatever `dst`
    /// had. Each object keeps its own header id, so destroying one can
    /// never destroy the other's keys.
    pub fn clone_object(
        &self,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
        src: &str,
        dst: &str,
    ) -> Result<()> {
        self.destroy(batch, cache, dst)?;
        let Some(src_id) = self.resolve(cache, src)? else {
            return Ok(());
        };
        let dst_id = self.ensure(batch, cache, dst)?;
        let dst_prefix = user_prefix(dst_id);

        let mut iter = self.kv.snapshot_prefix_iterator(&user_prefix(src_id))?;
        iter.seek_to_first()?;
        while iter.valid() {
            batch.set(&dst_prefix, &iter.key(), iter.value());
            iter.next()?;
        }
        if let Some(header) = self.kv.get_one(HDR_PREFIX, &id_key(src_id))? {
            batch.set(HDR_PREFIX, &id_key(dst_id), header);
        }
        Ok(())
    }

    /// Stage a move of the id mapping from `old` to `new` (collection
    /// rename; the id-keyed data does not move).
    pub fn rename_object(
        &self,
        batch: &mut KvTransaction,
        old: &str,
        new: &str,
    ) -> Result<()> {
        if let Some(id) = self.header_id(old)? {
            batch.rmkey(OBJ_PREFIX, old);
            batch.set(OBJ_PREFIX, new, id.to_le_bytes().to_vec());
        }
        Ok(())
    }

    /// Object keys (collection-scoped) of every object with omap data.
    pub fn mapped_objects(&self, cid_encoded_slash: &str) -> Result<Vec<String>> {
        let mut iter = self.kv.prefix_iterator(OBJ_PREFIX)?;
        iter.lower_bound(cid_encoded_slash)?;
        let mut out = Vec::new();
        while iter.valid() && iter.key().starts_with(cid_encoded_slash) {
            out.push(iter.key());
            iter.next()?;
        }
        Ok(out)
    }

    /// Header blob and full key set.
    pub fn get(&self, objkey: &str) -> Result<(Option<Vec<u8>>, BTreeMap<String, Vec<u8>>)> {
        match self.header_id(objkey)? {
            Some(id) => {
                let header = self.kv.get_one(HDR_PREFIX, &id_key(id))?;
                let keys = self.kv.get_by_prefix(&user_prefix(id))?;
                Ok((header, keys))
            }
            None => Ok((None, BTreeMap::new())),
        }
    }

    /// Header blob only.
    pub fn get_header(&self, objkey: &str) -> Result<Option<Vec<u8>>> {
        match self.header_id(objkey)? {
            Some(id) => self.kv.get_one(HDR_PREFIX, &id_key(id)),
            None => Ok(None),
        }
    }

    /// All keys, without values.
    pub fn get_keys(&self, objkey: &str) -> Result<BTreeSet<String>> {
        match self.header_id(objkey)? {
            Some(id) => {
                let mut iter = self.kv.snapshot_prefix_iterator(&user_prefix(id))?;
                iter.seek_to_first()?;
                let mut out = BTreeSet::new();
                while iter.valid() {
                    out.insert(iter.key());
                    iter.next()?;
                }
                Ok(out)
            }
            None => Ok(BTreeSet::new()),
        }
    }

    /// Values for the requested keys (absent keys are omitted).
    pub fn get_values(
        &self,
        objkey: &str,
        keys: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        match self.header_id(objkey)? {
            Some(id) => self.kv.get(&user_prefix(id), keys),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Subset of `keys` that exist.
    pub fn check_keys(&self, objkey: &str, keys: &[String]) -> Result<BTreeSet<String>> {
        Ok(self.get_values(objkey, keys)?.into_keys().collect())
    }

    /// Live cursor over the object's omap.
    pub fn iterator(&self, objkey: &str) -> Result<PrefixIter<'_>> {
        match self.header_id(objkey)? {
            Some(id) => self.kv.prefix_iterator(&user_prefix(id)),
            None => self.kv.prefix_iterator(EMPTY_PREFIX),
        }
    }

    /// Snapshot cursor over the object's omap; stable under concurrent
    /// mutation.
    pub fn snapshot_iterator(&self, objkey: &str) -> Result<PrefixIter<'_>> {
        match self.header_id(objkey)? {
            Some(id) => self.kv.snapshot_prefix_iterator(&user_prefix(id)),
            None => self.kv.snapshot_prefix_iterator(EMPTY_PREFIX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::MemKvStore;

    fn fixture() -> (OmapStore, String) {
        let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let omap = OmapStore::open(kv).unwrap();
        let objkey = object_key(
            &CollectionId::new("meta"),
            &ObjectId::from_name("object-a"),
        );
        (omap, objkey)
    }

    fn commit(omap: &OmapStore, batch: KvTransaction) {
        omap.kv.submit(batch).unwrap();
    }

    #[test]
    fn test_set_and_get_keys() {
        let (omap, objkey) = fixture();
        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        let mut map = BTreeMap::new();
        map.insert("alpha".to_string(), b"1".to_vec());
        map.insert("beta".to_string(), b"2".to_vec());
        omap.set_keys(&mut batch, &mut cache, &objkey, &map).unwrap();
        commit(&omap, batch);

        let (header, keys) = omap.get(&objkey).unwrap();
        assert!(header.is_none());
        assert_eq!(keys, map);
        assert_eq!(
            omap.get_values(&objkey, &["alpha".to_string()]).unwrap()["alpha"],
            b"1"
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let (omap, objkey) = fixture();
        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        omap.set_header(&mut batch, &mut cache, &objkey, b"hdr").unwrap();
        commit(&omap, batch);
        assert_eq!(omap.get_header(&objkey).unwrap().unwrap(), b"hdr");
    }

    #[test]
    fn test_same_batch_reuses_id() {
        let (omap, objkey) = fixture();
        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        let mut m1 = BTreeMap::new();
        m1.insert("k1".to_string(), b"a".to_vec());
        omap.set_keys(&mut batch, &mut cache, &objkey, &m1).unwrap();
        let mut m2 = BTreeMap::new();
        m2.insert("k2".to_string(), b"b".to_vec());
        omap.set_keys(&mut batch, &mut cache, &objkey, &m2).unwrap();
        commit(&omap, batch);

        let keys = omap.get_keys(&objkey).unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_destroy_leaves_no_orphans() {
        let (omap, objkey) = fixture();
        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), b"v".to_vec());
        omap.set_keys(&mut batch, &mut cache, &objkey, &map).unwrap();
        omap.set_header(&mut batch, &mut cache, &objkey, b"hdr").unwrap();
        commit(&omap, batch);
        let id = omap.header_id(&objkey).unwrap().unwrap();

        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        omap.destroy(&mut batch, &mut cache, &objkey).unwrap();
        commit(&omap, batch);

        assert!(omap.header_id(&objkey).unwrap().is_none());
        assert!(omap.kv.get_by_prefix(&user_prefix(id)).unwrap().is_empty());
        assert!(omap.kv.get_one(HDR_PREFIX, &id_key(id)).unwrap().is_none());
        assert!(omap.kv.get_one(SYS_PREFIX, &id_key(id)).unwrap().is_none());
    }

    #[test]
    fn test_clone_is_independent() {
        let (omap, src) = fixture();
        let dst = object_key(&CollectionId::new("meta"), &ObjectId::from_name("object-b"));

        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        let mut map = BTreeMap::new();
        map.insert("shared".to_string(), b"orig".to_vec());
        omap.set_keys(&mut batch, &mut cache, &src, &map).unwrap();
        omap.set_header(&mut batch, &mut cache, &src, b"H").unwrap();
        commit(&omap, batch);

        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        omap.clone_object(&mut batch, &mut cache, &src, &dst).unwrap();
        commit(&omap, batch);

        assert_eq!(omap.get_header(&dst).unwrap().unwrap(), b"H");
        assert_eq!(omap.get_values(&dst, &["shared".to_string()]).unwrap()["shared"], b"orig");

        // Mutating the clone leaves the source untouched, and vice versa.
        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        let mut map = BTreeMap::new();
        map.insert("shared".to_string(), b"changed".to_vec());
        omap.set_keys(&mut batch, &mut cache, &dst, &map).unwrap();
        commit(&omap, batch);
        assert_eq!(omap.get_values(&src, &["shared".to_string()]).unwrap()["shared"], b"orig");

        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        omap.destroy(&mut batch, &mut cache, &dst).unwrap();
        commit(&omap, batch);
        assert_eq!(omap.get_values(&src, &["shared".to_string()]).unwrap()["shared"], b"orig");
    }

    #[test]
    fn test_allocator_recovers_after_reopen() {
        let kv: Arc<dyn KvStore> = Arc::new(MemKvStore::new());
        let objkey = object_key(&CollectionId::new("c"), &ObjectId::from_name("o"));
        {
            let omap = OmapStore::open(Arc::clone(&kv)).unwrap();
            let mut batch = KvTransaction::new();
            let mut cache = OmapTxnCache::new();
            let mut map = BTreeMap::new();
            map.insert("k".to_string(), b"v".to_vec());
            omap.set_keys(&mut batch, &mut cache, &objkey, &map).unwrap();
            kv.submit(batch).unwrap();
        }
        let omap = OmapStore::open(Arc::clone(&kv)).unwrap();
        let used = omap.header_id(&objkey).unwrap().unwrap();
        assert!(*omap.next_id.lock() > used);
    }

    #[test]
    fn test_iterator_empty_without_omap() {
        let (omap, objkey) = fixture();
        let mut iter = omap.iterator(&objkey).unwrap();
        iter.seek_to_first().unwrap();
        assert!(!iter.valid());
    }
}
