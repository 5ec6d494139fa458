//! The local object store: mkfs/mount, transaction application with
//! replay guards, the read side, and the commit cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::kvstore::{KvStore, KvTransaction, MemKvStore, PrefixIter, RedbKvStore};
use crate::omap::{object_key, OmapStore, OmapTxnCache};
use crate::store::replay_guard::{collection_guard_key, object_guard_key};
use crate::store::{AttrStore, FdCache, GuardCheck, HashIndex, ReplayGuards};
use crate::transaction::{Op, Transaction};
use crate::types::{CollectionId, ObjectId, SequencerPosition};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Current on-disk layout version.
const STORE_VERSION: u32 = 1;

const FSID_FILE: &str = "fsid";
const VERSION_FILE: &str = "store_version";
const CURRENT_DIR: &str = "current";
const OP_SEQ_FILE: &str = "commit_op_seq";
const OMAP_DIR: &str = "omap";
const OMAP_DB_FILE: &str = "store.redb";

const COPY_CHUNK: usize = 128 << 10;

/// Metadata returned by [`ObjectStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    /// Byte length of the object.
    pub size: u64,
}

/// The object store over one base directory.
pub struct ObjectStore {
    basedir: PathBuf,
    current: PathBuf,
    fsid: Uuid,
    _fsid_file: File,
    kv: Arc<dyn KvStore>,
    omap: OmapStore,
    attrs: AttrStore,
    guards: ReplayGuards,
    index: HashIndex,
    fds: FdCache,
    config: StoreConfig,
    applied_seq: AtomicU64,
    replaying: AtomicBool,
}

impl ObjectStore {
    /// Initialize an empty store at `dir`.
    pub fn mkfs(dir: impl AsRef<Path>, fsid: Uuid) -> Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let fsid_path = dir.join(FSID_FILE);
        if fsid_path.exists() {
            return Err(Error::AlreadyExists(format!(
                "store at {}",
                dir.display()
            )));
        }

        let mut fsid_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&fsid_path)?;
        io::Write::write_all(&mut fsid_file, fsid.as_bytes())?;
        fsid_file.sync_all()?;

        fs::write(dir.join(VERSION_FILE), format!("{STORE_VERSION}\n"))?;
        let current = dir.join(CURRENT_DIR);
        fs::create_dir_all(current.join(OMAP_DIR))?;
        fs::write(current.join(OP_SEQ_FILE), "0\n")?;
        sync_dir(dir)?;
        sync_dir(&current)?;
        info!(dir = %dir.display(), %fsid, "store initialized");
        Ok(())
    }

    /// Open the store at `dir`, taking the fsid lock.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let basedir = dir.as_ref().to_path_buf();
        let fsid_file = OpenOptions::new()
            .read(true)
            .open(basedir.join(FSID_FILE))
            .map_err(|_| Error::NotFound(format!("no store at {}", basedir.display())))?;
        lock_exclusive(&fsid_file)?;

        let mut fsid_bytes = [0u8; 16];
        fsid_file.read_exact_at(&mut fsid_bytes, 0)?;
        let fsid = Uuid::from_bytes(fsid_bytes);

        let version: u32 = fs::read_to_string(basedir.join(VERSION_FILE))?
            .trim()
            .parse()
            .map_err(|_| Error::Corruption("unreadable store version".to_string()))?;
        if version > STORE_VERSION {
            return Err(Error::InvalidArgument(format!(
                "store version {version} is newer than supported {STORE_VERSION}"
            )));
        }

        let current = basedir.join(CURRENT_DIR);
        let kv: Arc<dyn KvStore> = if config.ephemeral_kv {
            Arc::new(MemKvStore::new())
        } else {
            Arc::new(RedbKvStore::open(
                current.join(OMAP_DIR).join(OMAP_DB_FILE),
            )?)
        };

        let applied_seq = read_op_seq(&current)?;
        let store = Self {
            index: HashIndex::new(
                &current,
                config.index_split_threshold,
                config.index_merge_threshold,
            ),
            omap: OmapStore::open(Arc::clone(&kv))?,
            attrs: AttrStore::new(Arc::clone(&kv)),
            guards: ReplayGuards::new(Arc::clone(&kv)),
            fds: FdCache::new(config.fd_cache_size),
            kv,
            basedir,
            current,
            fsid,
            _fsid_file: fsid_file,
            config,
            applied_seq: AtomicU64::new(applied_seq),
            replaying: AtomicBool::new(false),
        };
        info!(dir = %store.basedir.display(), applied_seq, "store opened");
        Ok(store)
    }

    /// Store identity.
    pub fn fsid(&self) -> Uuid {
        self.fsid
    }

    /// Last op sequence persisted by a commit cycle.
    pub fn applied_seq(&self) -> u64 {
        self.applied_seq.load(Ordering::Acquire)
    }

    /// Toggle replay mode; guard checks only gate application during
    /// replay.
    pub fn set_replaying(&self, replaying: bool) {
        self.replaying.store(replaying, Ordering::Release);
    }

    fn guard_check(&self, key: &str, spos: SequencerPosition) -> Result<GuardCheck> {
        if !self.replaying.load(Ordering::Acquire) {
            return Ok(GuardCheck::Apply);
        }
        self.guards.check(key, spos)
    }

    // ------------------------------------------------------------------
    // apply side

    /// Apply a batch of transactions under one op sequence number.
    ///
    /// All KV effects of the batch (omap, attrs, guards) commit as one
    /// all-or-nothing KV transaction.
    pub fn do_transactions(&self, txs: &[Transaction], op_seq: u64) -> Result<()> {
        let mut batch = KvTransaction::new();
        let mut cache = OmapTxnCache::new();
        let mut index = 0u32;
        for tx in txs {
            for op in tx.ops() {
                let spos = SequencerPosition::new(op_seq, index);
                index += 1;
                match self.apply_op(op, spos, &mut batch, &mut cache) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::ReplaySkip => {
                        debug!(%spos, "opcode skipped by replay guard");
                    }
                    Err(err)
                        if self.replaying.load(Ordering::Acquire)
                            && err.kind() == ErrorKind::NotFound =>
                    {
                        debug!(%spos, error = %err, "replayed opcode hit missing target");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        if !batch.is_empty() {
            self.kv.submit(batch)?;
        }
        Ok(())
    }

    fn apply_op(
        &self,
        op: &Op,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
    ) -> Result<()> {
        match op {
            Op::Touch { cid, oid } => self.obj_guarded(cid, oid, spos, batch, cache, |this, _, _| {
                this.open_for_write(cid, oid, true).map(|_| ())
            }),
            Op::Write {
                cid,
                oid,
                offset,
                data,
            } => self.obj_guarded(cid, oid, spos, batch, cache, |this, _, _| {
                let file = this.open_for_write(cid, oid, true)?;
                file.write_all_at(data, *offset).map_err(Error::from_io)
            }),
            Op::Zero {
                cid,
                oid,
                offset,
                len,
            } => self.obj_guarded(cid, oid, spos, batch, cache, |this, _, _| {
                let file = this.open_for_write(cid, oid, true)?;
                write_zeros(&file, *offset, *len)
            }),
            Op::Truncate { cid, oid, size } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, _, _| {
                    let file = this.open_for_write(cid, oid, true)?;
                    file.set_len(*size).map_err(Error::from_io)
                })
            }
            Op::Remove { cid, oid } => self.do_remove(cid, oid, spos, batch, cache),
            Op::Clone { cid, src, dst } => self.do_clone(cid, src, dst, spos, batch, cache),
            Op::CloneRange {
                cid,
                src,
                dst,
                src_off,
                len,
                dst_off,
            } => self.do_clone_range(cid, src, dst, *src_off, *len, *dst_off, spos, batch),
            Op::SetAttr {
                cid,
                oid,
                name,
                value,
            } => self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, _| {
                this.open_for_write(cid, oid, true)?;
                this.attrs.setattr(batch, cid, oid, name, value);
                Ok(())
            }),
            Op::SetAttrs { cid, oid, attrs } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, _| {
                    this.open_for_write(cid, oid, true)?;
                    for (name, value) in attrs {
                        this.attrs.setattr(batch, cid, oid, name, value);
                    }
                    Ok(())
                })
            }
            Op::RmAttr { cid, oid, name } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, _| {
                    this.require_object(cid, oid)?;
                    this.attrs.rmattr(batch, cid, oid, name);
                    Ok(())
                })
            }
            Op::RmAttrs { cid, oid } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, _| {
                    this.require_object(cid, oid)?;
                    this.attrs.rmattrs(batch, cid, oid);
                    Ok(())
                })
            }
            Op::CreateCollection { cid } => self.do_create_collection(cid, spos, batch),
            Op::DestroyCollection { cid } => self.do_destroy_collection(cid, spos, batch),
            Op::CollectionAdd { cid, src_cid, oid } => {
                self.do_collection_add(cid, src_cid, oid, spos, batch, cache)
            }
            Op::CollectionRename { cid, new_cid } => {
                self.do_collection_rename(cid, new_cid, spos, batch)
            }
            Op::CollSetAttr { cid, name, value } => {
                self.coll_guarded(cid, spos, batch, |this, batch| {
                    this.require_collection(cid)?;
                    this.attrs.coll_setattr(batch, cid, name, value);
                    Ok(())
                })
            }
            Op::CollRmAttr { cid, name } => self.coll_guarded(cid, spos, batch, |this, batch| {
                this.require_collection(cid)?;
                this.attrs.coll_rmattr(batch, cid, name);
                Ok(())
            }),
            Op::OmapSetKeys { cid, oid, map } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, cache| {
                    this.open_for_write(cid, oid, true)?;
                    this.omap.set_keys(batch, cache, &object_key(cid, oid), map)
                })
            }
            Op::OmapRmKeys { cid, oid, keys } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, cache| {
                    this.require_object(cid, oid)?;
                    this.omap.rm_keys(batch, cache, &object_key(cid, oid), keys)
                })
            }
            Op::OmapClear { cid, oid } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, cache| {
                    this.require_object(cid, oid)?;
                    this.omap.destroy(batch, cache, &object_key(cid, oid))
                })
            }
            Op::OmapSetHeader { cid, oid, data } => {
                self.obj_guarded(cid, oid, spos, batch, cache, |this, batch, cache| {
                    this.open_for_write(cid, oid, true)?;
                    this.omap.set_header(batch, cache, &object_key(cid, oid), data)
                })
            }
        }
    }

    /// Run an object-touching opcode under its replay guard, staging the
    /// guard update after the effect.
    fn obj_guarded(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
        effect: impl FnOnce(&Self, &mut KvTransaction, &mut OmapTxnCache) -> Result<()>,
    ) -> Result<()> {
        let key = object_guard_key(cid, oid);
        match self.guard_check(&key, spos)? {
            GuardCheck::Skip => return Err(Error::ReplaySkip),
            GuardCheck::Apply | GuardCheck::InProgress => {}
        }
        effect(self, batch, cache)?;
        self.guards.set(batch, &key, spos, false);
        Ok(())
    }

    fn coll_guarded(
        &self,
        cid: &CollectionId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
        effect: impl FnOnce(&Self, &mut KvTransaction) -> Result<()>,
    ) -> Result<()> {
        let key = collection_guard_key(cid);
        match self.guard_check(&key, spos)? {
            GuardCheck::Skip => return Err(Error::ReplaySkip),
            GuardCheck::Apply | GuardCheck::InProgress => {}
        }
        effect(self, batch)?;
        self.guards.set(batch, &key, spos, false);
        Ok(())
    }

    fn do_remove(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
    ) -> Result<()> {
        let key = object_guard_key(cid, oid);
        if self.guard_check(&key, spos)? == GuardCheck::Skip {
            return Err(Error::ReplaySkip);
        }
        let place = self.index.locate(cid, oid)?;
        let path = place
            .found
            .ok_or_else(|| Error::NotFound(format!("object {oid}")))?;
        fs::remove_file(&path)?;
        self.fds.invalidate(&path);
        if let Some(parent) = path.parent() {
            if self.index.note_removed(parent, place.depth)? {
                self.fds.invalidate_dir(parent);
            }
        }
        self.attrs.rmattrs(batch, cid, oid);
        self.omap.destroy(batch, cache, &object_key(cid, oid))?;
        self.guards.clear(batch, &key);
        Ok(())
    }

    fn do_clone(
        &self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
    ) -> Result<()> {
        let key = object_guard_key(cid, dst);
        match self.guard_check(&key, spos)? {
            GuardCheck::Skip => return Err(Error::ReplaySkip),
            GuardCheck::Apply | GuardCheck::InProgress => {}
        }
        let src_file = self.open_for_read(cid, src)?;

        // Multi-step: mark the destination in progress so a crash between
        // the byte copy and the metadata copy reruns the whole clone.
        self.guards.set_in_progress_now(&key, spos)?;

        let dst_file = self.open_for_write(cid, dst, true)?;
        dst_file.set_len(0)?;
        clone_file_contents(&src_file, &dst_file)?;

        self.attrs.clone_object(batch, cid, src, dst)?;
        self.omap
            .clone_object(batch, cache, &object_key(cid, src), &object_key(cid, dst))?;
        self.guards.close(batch, &key, spos);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn do_clone_range(
        &self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        src_off: u64,
        len: u64,
        dst_off: u64,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
    ) -> Result<()> {
        let key = object_guard_key(cid, dst);
        match self.guard_check(&key, spos)? {
            GuardCheck::Skip => return Err(Error::ReplaySkip),
            GuardCheck::Apply | GuardCheck::InProgress => {}
        }
        let src_file = self.open_for_read(cid, src)?;
        self.guards.set_in_progress_now(&key, spos)?;
        let dst_file = self.open_for_write(cid, dst, true)?;
        copy_range(&src_file, &dst_file, src_off, len, dst_off)?;
        self.guards.close(batch, &key, spos);
        Ok(())
    }

    fn do_create_collection(
        &self,
        cid: &CollectionId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
    ) -> Result<()> {
        let key = collection_guard_key(cid);
        if self.guard_check(&key, spos)? == GuardCheck::Skip {
            return Err(Error::ReplaySkip);
        }
        match self.index.create_collection(cid) {
            Ok(()) => {}
            Err(err)
                if err.kind() == ErrorKind::AlreadyExists
                    && (self.config.tolerate_collection_exists
                        || self.replaying.load(Ordering::Acquire)) =>
            {
                debug!(%cid, "create of existing collection tolerated");
            }
            Err(err) => return Err(err),
        }
        self.guards.set(batch, &key, spos, false);
        Ok(())
    }

    fn do_destroy_collection(
        &self,
        cid: &CollectionId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
    ) -> Result<()> {
        let key = collection_guard_key(cid);
        if self.guard_check(&key, spos)? == GuardCheck::Skip {
            return Err(Error::ReplaySkip);
        }
        self.index.destroy_collection(cid)?;
        self.fds.invalidate_dir(&self.index.collection_dir(cid));
        self.attrs.coll_rmattrs(batch, cid);
        self.guards.clear(batch, &key);
        Ok(())
    }

    fn do_collection_add(
        &self,
        cid: &CollectionId,
        src_cid: &CollectionId,
        oid: &ObjectId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
        cache: &mut OmapTxnCache,
    ) -> Result<()> {
        let key = object_guard_key(cid, oid);
        match self.guard_check(&key, spos)? {
            GuardCheck::Skip => return Err(Error::ReplaySkip),
            GuardCheck::Apply | GuardCheck::InProgress => {}
        }
        let src_file = self.open_for_read(src_cid, oid)?;
        self.guards.set_in_progress_now(&key, spos)?;
        let dst_file = self.open_for_write(cid, oid, true)?;
        dst_file.set_len(0)?;
        clone_file_contents(&src_file, &dst_file)?;
        self.attrs.copy_object(batch, src_cid, cid, oid)?;
        self.omap
            .clone_object(batch, cache, &object_key(src_cid, oid), &object_key(cid, oid))?;
        self.guards.close(batch, &key, spos);
        Ok(())
    }

    fn do_collection_rename(
        &self,
        cid: &CollectionId,
        new_cid: &CollectionId,
        spos: SequencerPosition,
        batch: &mut KvTransaction,
    ) -> Result<()> {
        let key = collection_guard_key(new_cid);
        let check = self.guard_check(&key, spos)?;
        if check == GuardCheck::Skip {
            return Err(Error::ReplaySkip);
        }

        // Multi-step: record the attempt before the irreversible directory
        // move so a crash replays as in-progress and resumes. The marker
        // itself may be lost with the rest of the batch, so any replayed
        // rename resumes as well.
        self.guards.set_in_progress_now(&key, spos)?;
        let resume =
            check == GuardCheck::InProgress || self.replaying.load(Ordering::Acquire);

        self.fds.invalidate_dir(&self.index.collection_dir(cid));
        self.fds.invalidate_dir(&self.index.collection_dir(new_cid));
        self.index.rename_collection(cid, new_cid, resume)?;
        self.attrs.rename_collection(batch, cid, new_cid)?;
        self.guards.rename_collection(batch, cid, new_cid)?;
        let old_base = format!("{}/", cid.encoded());
        let new_base = format!("{}/", new_cid.encoded());
        for old_key in self.omap.mapped_objects(&old_base)? {
            let new_key = format!("{new_base}{}", &old_key[old_base.len()..]);
            self.omap.rename_object(batch, &old_key, &new_key)?;
        }
        self.guards.close(batch, &key, spos);
        Ok(())
    }

    // ------------------------------------------------------------------
    // file helpers

    fn require_collection(&self, cid: &CollectionId) -> Result<()> {
        if self.index.collection_exists(cid) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("collection {cid}")))
        }
    }

    fn require_object(&self, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        if self.exists(cid, oid)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("object {oid}")))
        }
    }

    fn open_for_read(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Arc<File>> {
        let place = self.index.locate(cid, oid)?;
        let path = place
            .found
            .ok_or_else(|| Error::NotFound(format!("object {oid}")))?;
        self.open_cached(&path)
    }

    fn open_for_write(&self, cid: &CollectionId, oid: &ObjectId, create: bool) -> Result<Arc<File>> {
        let place = self.index.locate(cid, oid)?;
        match place.found {
            Some(path) => self.open_cached(&path),
            None if create => {
                let path = place.create_in.join(oid.file_name());
                let file = Arc::new(
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&path)?,
                );
                self.fds.insert(&path, Arc::clone(&file));
                if self.index.note_created(&place.create_in, place.depth)? {
                    self.fds.invalidate_dir(&place.create_in);
                }
                Ok(file)
            }
            None => Err(Error::NotFound(format!("object {oid}"))),
        }
    }

    fn open_cached(&self, path: &Path) -> Result<Arc<File>> {
        if let Some(file) = self.fds.get(path) {
            return Ok(file);
        }
        let file = Arc::new(OpenOptions::new().read(true).write(true).open(path)?);
        self.fds.insert(path, Arc::clone(&file));
        Ok(file)
    }

    // ------------------------------------------------------------------
    // read side

    /// Whether the object exists.
    pub fn exists(&self, cid: &CollectionId, oid: &ObjectId) -> Result<bool> {
        match self.index.locate(cid, oid) {
            Ok(place) => Ok(place.found.is_some()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Object metadata.
    pub fn stat(&self, cid: &CollectionId, oid: &ObjectId) -> Result<ObjectStat> {
        let file = self.open_for_read(cid, oid)?;
        let meta = file.metadata()?;
        Ok(ObjectStat { size: meta.len() })
    }

    /// Read `len` bytes at `offset`; `len == 0` reads to the end. Reads
    /// past the end are clipped.
    pub fn read(&self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let file = self.open_for_read(cid, oid)?;
        let size = file.metadata()?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let end = if len == 0 { size } else { size.min(offset + len) };
        let mut buf = vec![0u8; (end - offset) as usize];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// One attribute; `NoData` when absent.
    pub fn getattr(&self, cid: &CollectionId, oid: &ObjectId, name: &str) -> Result<Vec<u8>> {
        self.require_object(cid, oid)?;
        self.attrs.getattr(cid, oid, name)
    }

    /// Every attribute of the object.
    pub fn getattrs(&self, cid: &CollectionId, oid: &ObjectId) -> Result<BTreeMap<String, Vec<u8>>> {
        self.require_object(cid, oid)?;
        self.attrs.getattrs(cid, oid)
    }

    /// One collection attribute; `NoData` when absent.
    pub fn collection_getattr(&self, cid: &CollectionId, name: &str) -> Result<Vec<u8>> {
        self.require_collection(cid)?;
        self.attrs.coll_getattr(cid, name)
    }

    /// Every attribute of the collection.
    pub fn collection_getattrs(&self, cid: &CollectionId) -> Result<BTreeMap<String, Vec<u8>>> {
        self.require_collection(cid)?;
        self.attrs.coll_getattrs(cid)
    }

    /// Omap header and all keys.
    pub fn omap_get(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<(Option<Vec<u8>>, BTreeMap<String, Vec<u8>>)> {
        self.require_object(cid, oid)?;
        self.omap.get(&object_key(cid, oid))
    }

    /// Omap header blob.
    pub fn omap_get_header(&self, cid: &CollectionId, oid: &ObjectId) -> Result<Option<Vec<u8>>> {
        self.require_object(cid, oid)?;
        self.omap.get_header(&object_key(cid, oid))
    }

    /// All omap keys.
    pub fn omap_get_keys(&self, cid: &CollectionId, oid: &ObjectId) -> Result<BTreeSet<String>> {
        self.require_object(cid, oid)?;
        self.omap.get_keys(&object_key(cid, oid))
    }

    /// Values of the requested omap keys.
    pub fn omap_get_values(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        self.require_object(cid, oid)?;
        self.omap.get_values(&object_key(cid, oid), keys)
    }

    /// Which of the requested omap keys exist.
    pub fn omap_check_keys(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: &[String],
    ) -> Result<BTreeSet<String>> {
        self.require_object(cid, oid)?;
        self.omap.check_keys(&object_key(cid, oid), keys)
    }

    /// Live cursor over the object's omap.
    pub fn get_omap_iterator(&self, cid: &CollectionId, oid: &ObjectId) -> Result<PrefixIter<'_>> {
        self.require_object(cid, oid)?;
        self.omap.iterator(&object_key(cid, oid))
    }

    /// Snapshot cursor over the object's omap.
    pub fn get_omap_snapshot_iterator(
        &self,
        cid: &CollectionId,
        oid: &ObjectId,
    ) -> Result<PrefixIter<'_>> {
        self.require_object(cid, oid)?;
        self.omap.snapshot_iterator(&object_key(cid, oid))
    }

    /// All collections.
    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        self.index.list_collections()
    }

    /// Whether the collection exists.
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        self.index.collection_exists(cid)
    }

    /// Whether the collection holds no objects.
    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        self.index.collection_empty(cid)
    }

    /// Every object of a collection in hash order.
    pub fn collection_list(&self, cid: &CollectionId) -> Result<Vec<ObjectId>> {
        self.index.list(cid)
    }

    /// Page through a collection; see [`HashIndex::list_partial`].
    pub fn collection_list_partial(
        &self,
        cid: &CollectionId,
        start: Option<&ObjectId>,
        min: usize,
        max: usize,
        snap: u64,
    ) -> Result<(Vec<ObjectId>, Option<ObjectId>)> {
        self.index.list_partial(cid, start, min, max, snap)
    }

    // ------------------------------------------------------------------
    // durability

    /// Make every apply up to `up_to` durable and advance the applied
    /// watermark: durable KV sync, filesystem sync, then the op-seq file.
    pub fn commit_cycle(&self, up_to: u64) -> Result<u64> {
        let current = self.applied_seq();
        if up_to <= current {
            return Ok(current);
        }
        self.kv.sync()?;
        sync_filesystem(&self.current)?;
        write_op_seq(&self.current, up_to)?;
        self.applied_seq.store(up_to, Ordering::Release);
        debug!(up_to, "commit cycle advanced applied watermark");
        Ok(up_to)
    }
}

fn read_op_seq(current: &Path) -> Result<u64> {
    match fs::read_to_string(current.join(OP_SEQ_FILE)) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|_| Error::Corruption("unreadable commit_op_seq".to_string())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(Error::from_io(err)),
    }
}

fn write_op_seq(current: &Path, seq: u64) -> Result<()> {
    let tmp = current.join("commit_op_seq.tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    io::Write::write_all(&mut file, format!("{seq}\n").as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, current.join(OP_SEQ_FILE))?;
    sync_dir(current)?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all().map_err(Error::from_io)
}

/// Flush dirty data for the whole store.
fn sync_filesystem(current: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let dir = File::open(current)?;
        let rc = unsafe { libc::syncfs(dir.as_raw_fd()) };
        if rc != 0 {
            return Err(Error::from_io(io::Error::last_os_error()));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    {
        sync_dir(current)
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(Error::Busy(
            "store is locked by another process".to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> Result<()> {
    Ok(())
}

fn write_zeros(file: &File, offset: u64, len: u64) -> Result<()> {
    let zeros = vec![0u8; COPY_CHUNK.min(len as usize).max(1)];
    let mut written = 0u64;
    while written < len {
        let chunk = (len - written).min(zeros.len() as u64) as usize;
        file.write_all_at(&zeros[..chunk], offset + written)?;
        written += chunk as u64;
    }
    Ok(())
}

/// Copy the whole of `src` into `dst`, preferring the filesystem's
/// copy-on-write clone when it is available.
fn clone_file_contents(src: &File, dst: &File) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        const FICLONE: libc::c_ulong = 0x4004_9409;
        let rc = unsafe { libc::ioctl(dst.as_raw_fd(), FICLONE as _, src.as_raw_fd()) };
        if rc == 0 {
            return Ok(());
        }
        // Cross-device, unsupported filesystem: fall through to copying.
    }
    let len = src.metadata()?.len();
    copy_range(src, dst, 0, len, 0)
}

/// Copy `len` bytes from `src_off` in `src` to `dst_off` in `dst`.
fn copy_range(src: &File, dst: &File, src_off: u64, len: u64, dst_off: u64) -> Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK.min(len.max(1) as usize)];
    let src_size = src.metadata()?.len();
    let mut copied = 0u64;
    while copied < len {
        let at = src_off + copied;
        if at >= src_size {
            // Reading past the source end clones the hole as zeros.
            write_zeros(dst, dst_off + copied, len - copied)?;
            break;
        }
        let chunk = (len - copied).min(buf.len() as u64).min(src_size - at) as usize;
        src.read_exact_at(&mut buf[..chunk], at)?;
        dst.write_all_at(&buf[..chunk], dst_off + copied)?;
        copied += chunk as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> ObjectStore {
        let config = StoreConfig {
            ephemeral_kv: true,
            ..StoreConfig::default()
        };
        ObjectStore::mkfs(dir, Uuid::new_v4()).unwrap();
        ObjectStore::open(dir, config).unwrap()
    }

    fn apply(store: &ObjectStore, seq: u64, tx: Transaction) {
        store.do_transactions(&[tx], seq).unwrap();
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");

        let mut tx = Transaction::new();
        tx.create_collection(&cid).write(&cid, &oid, 4, b"data".to_vec());
        apply(&store, 1, tx);

        assert_eq!(store.read(&cid, &oid, 4, 4).unwrap(), b"data");
        assert_eq!(store.read(&cid, &oid, 0, 0).unwrap(), b"\0\0\0\0data");
        assert_eq!(store.stat(&cid, &oid).unwrap().size, 8);
    }

    #[test]
    fn test_zero_and_truncate() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");

        let mut tx = Transaction::new();
        tx.create_collection(&cid)
            .write(&cid, &oid, 0, b"XXXXXXXX".to_vec())
            .zero(&cid, &oid, 2, 4)
            .truncate(&cid, &oid, 6);
        apply(&store, 1, tx);

        assert_eq!(store.read(&cid, &oid, 0, 0).unwrap(), b"XX\0\0\0\0");
    }

    #[test]
    fn test_attr_roundtrip_and_nodata() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");

        let mut tx = Transaction::new();
        tx.create_collection(&cid)
            .touch(&cid, &oid)
            .setattr(&cid, &oid, "k", b"v".to_vec());
        apply(&store, 1, tx);

        assert_eq!(store.getattr(&cid, &oid, "k").unwrap(), b"v");
        assert_eq!(
            store.getattr(&cid, &oid, "missing").unwrap_err().kind(),
            ErrorKind::NoData
        );
    }

    #[test]
    fn test_remove_destroys_omap_and_attrs() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");

        let mut map = BTreeMap::new();
        map.insert("k1".to_string(), b"v1".to_vec());
        let mut tx = Transaction::new();
        tx.create_collection(&cid)
            .touch(&cid, &oid)
            .setattr(&cid, &oid, "a", b"1".to_vec())
            .omap_setkeys(&cid, &oid, map);
        apply(&store, 1, tx);

        let mut tx = Transaction::new();
        tx.remove(&cid, &oid);
        apply(&store, 2, tx);

        assert!(!store.exists(&cid, &oid).unwrap());
        let objkey = object_key(&cid, &oid);
        assert!(store.omap.header_id(&objkey).unwrap().is_none());
        assert!(store.attrs.getattrs(&cid, &oid).unwrap().is_empty());
    }

    #[test]
    fn test_clone_independent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let a = ObjectId::from_name("a");
        let b = ObjectId::from_name("b");

        let mut map = BTreeMap::new();
        map.insert("mk".to_string(), b"mv".to_vec());
        let mut tx = Transaction::new();
        tx.create_collection(&cid)
            .write(&cid, &a, 0, b"ABCD".to_vec())
            .setattr(&cid, &a, "x", b"1".to_vec())
            .omap_setkeys(&cid, &a, map);
        apply(&store, 1, tx);

        let mut tx = Transaction::new();
        tx.clone_object(&cid, &a, &b);
        apply(&store, 2, tx);

        assert_eq!(store.read(&cid, &b, 0, 0).unwrap(), b"ABCD");
        assert_eq!(store.getattr(&cid, &b, "x").unwrap(), b"1");
        assert_eq!(
            store.omap_get_values(&cid, &b, &["mk".to_string()]).unwrap()["mk"],
            b"mv"
        );

        let mut tx = Transaction::new();
        tx.write(&cid, &b, 0, b"ZZ".to_vec());
        apply(&store, 3, tx);
        assert_eq!(store.read(&cid, &a, 0, 2).unwrap(), b"AB");
        assert_eq!(store.read(&cid, &b, 0, 2).unwrap(), b"ZZ");
    }

    #[test]
    fn test_clone_range() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let a = ObjectId::from_name("a");
        let b = ObjectId::from_name("b");

        let mut tx = Transaction::new();
        tx.create_collection(&cid)
            .write(&cid, &a, 0, b"0123456789".to_vec())
            .clone_range(&cid, &a, &b, 2, 4, 1);
        apply(&store, 1, tx);

        assert_eq!(store.read(&cid, &b, 0, 0).unwrap(), b"\x002345");
    }

    #[test]
    fn test_collection_rename_rebinds_metadata() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("old");
        let new_cid = CollectionId::new("new");
        let oid = ObjectId::from_name("o");

        let mut map = BTreeMap::new();
        map.insert("k".to_string(), b"v".to_vec());
        let mut tx = Transaction::new();
        tx.create_collection(&cid)
            .touch(&cid, &oid)
            .setattr(&cid, &oid, "a", b"1".to_vec())
            .collection_setattr(&cid, "tier", b"hdd".to_vec())
            .omap_setkeys(&cid, &oid, map);
        apply(&store, 1, tx);

        let mut tx = Transaction::new();
        tx.collection_rename(&cid, &new_cid);
        apply(&store, 2, tx);

        assert!(!store.collection_exists(&cid));
        assert!(store.collection_exists(&new_cid));
        assert_eq!(store.getattr(&new_cid, &oid, "a").unwrap(), b"1");
        assert_eq!(store.collection_getattr(&new_cid, "tier").unwrap(), b"hdd");
        assert_eq!(
            store.omap_get_values(&new_cid, &oid, &["k".to_string()]).unwrap()["k"],
            b"v"
        );
    }

    #[test]
    fn test_collection_add_copies() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let c1 = CollectionId::new("c1");
        let c2 = CollectionId::new("c2");
        let oid = ObjectId::from_name("o");

        let mut tx = Transaction::new();
        tx.create_collection(&c1)
            .create_collection(&c2)
            .write(&c1, &oid, 0, b"hello".to_vec())
            .collection_add(&c2, &c1, &oid);
        apply(&store, 1, tx);

        assert_eq!(store.read(&c2, &oid, 0, 0).unwrap(), b"hello");
        assert_eq!(store.read(&c1, &oid, 0, 0).unwrap(), b"hello");
    }

    #[test]
    fn test_replay_guard_skips_reapplication() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");

        let mut tx = Transaction::new();
        tx.create_collection(&cid).write(&cid, &oid, 0, b"v1".to_vec());
        apply(&store, 1, tx.clone());

        let mut tx2 = Transaction::new();
        tx2.write(&cid, &oid, 0, b"v2".to_vec());
        apply(&store, 2, tx2);

        // Replaying seq 1 must not clobber the later write.
        store.set_replaying(true);
        apply(&store, 1, tx);
        store.set_replaying(false);
        assert_eq!(store.read(&cid, &oid, 0, 2).unwrap(), b"v2");
    }

    #[test]
    fn test_commit_cycle_persists_watermark() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path());
            let cid = CollectionId::new("c");
            let mut tx = Transaction::new();
            tx.create_collection(&cid);
            apply(&store, 1, tx);
            assert_eq!(store.commit_cycle(1).unwrap(), 1);
        }
        // applied_seq survives a close/open cycle.
        let config = StoreConfig {
            ephemeral_kv: true,
            ..StoreConfig::default()
        };
        let store = ObjectStore::open(dir.path(), config).unwrap();
        assert_eq!(store.applied_seq(), 1);
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let config = StoreConfig {
            ephemeral_kv: true,
            ..StoreConfig::default()
        };
        let second = ObjectStore::open(dir.path(), config);
        match second {
            Err(err) => assert_eq!(err.kind(), ErrorKind::Busy),
            Ok(_) => panic!("second open should be locked out"),
        }
        drop(store);
    }

    #[test]
    fn test_destroy_collection_requires_empty() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");

        let mut tx = Transaction::new();
        tx.create_collection(&cid).touch(&cid, &oid);
        apply(&store, 1, tx);

        let mut tx = Transaction::new();
        tx.destroy_collection(&cid);
        assert!(store.do_transactions(&[tx], 2).is_err());

        let mut tx = Transaction::new();
        tx.remove(&cid, &oid).destroy_collection(&cid);
        apply(&store, 3, tx);
        assert!(!store.collection_exists(&cid));
    }
}
