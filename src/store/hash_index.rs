//! Hashed directory tree mapping objects to files.
//!
//! Each collection is a directory under `current/`. Object files start at
//! the collection root; when a directory's file count crosses the split
//! threshold, its files migrate one hash nibble deeper. Lookup probes the
//! file at every level while descending, so a crash in the middle of a
//! split or merge never hides an object.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{CollectionId, ObjectId, SNAP_ANY};

/// Names under `current/` that can never be collections.
const RESERVED: &[&str] = &["omap", "commit_op_seq"];

/// Maximum nibble depth (eight hex digits of the 32-bit hash).
const MAX_DEPTH: usize = 8;

/// Where an object lives (or would live) in the tree.
pub struct ObjectPlace {
    /// Existing file, when the object is present.
    pub found: Option<PathBuf>,
    /// Directory where a new file for this object belongs.
    pub create_in: PathBuf,
    /// Nibble depth of `create_in`.
    pub depth: usize,
}

/// Directory layout component of the object store.
pub struct HashIndex {
    root: PathBuf,
    split_threshold: usize,
    merge_threshold: usize,
}

impl HashIndex {
    /// Operate on the collection tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, split_threshold: usize, merge_threshold: usize) -> Self {
        Self {
            root: root.into(),
            split_threshold: split_threshold.max(2),
            merge_threshold,
        }
    }

    /// Directory of a collection.
    pub fn collection_dir(&self, cid: &CollectionId) -> PathBuf {
        self.root.join(cid.encoded())
    }

    fn nibble(hash: u32, depth: usize) -> String {
        format!("{:x}", (hash >> (28 - depth * 4)) & 0xf)
    }

    /// Whether the collection directory exists.
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        self.collection_dir(cid).is_dir()
    }

    /// Create a collection directory.
    pub fn create_collection(&self, cid: &CollectionId) -> Result<()> {
        if RESERVED.contains(&cid.encoded().as_str()) {
            return Err(Error::InvalidArgument(format!(
                "{cid} is a reserved name"
            )));
        }
        let dir = self.collection_dir(cid);
        if dir.is_dir() {
            return Err(Error::AlreadyExists(format!("collection {cid}")));
        }
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    /// Remove an empty collection directory.
    pub fn destroy_collection(&self, cid: &CollectionId) -> Result<()> {
        let dir = self.collection_dir(cid);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("collection {cid}")));
        }
        if !self.list(cid)?.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "collection {cid} is not empty"
            )));
        }
        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    /// Rename a collection directory in one step.
    ///
    /// With `resume`, the retry of an interrupted rename is tolerated:
    /// a source that is already gone means the directory move happened
    /// before the crash, and a source that replay has re-created alongside
    /// the moved destination is folded into it, object by object, with the
    /// re-applied copy winning.
    pub fn rename_collection(
        &self,
        old: &CollectionId,
        new: &CollectionId,
        resume: bool,
    ) -> Result<()> {
        if RESERVED.contains(&new.encoded().as_str()) {
            return Err(Error::InvalidArgument(format!("{new} is a reserved name")));
        }
        let from = self.collection_dir(old);
        let to = self.collection_dir(new);
        if resume && to.is_dir() {
            if !from.is_dir() {
                return Ok(());
            }
            return self.merge_collection(old, new);
        }
        if to.exists() {
            return Err(Error::AlreadyExists(format!("collection {new}")));
        }
        fs::rename(from, to)?;
        Ok(())
    }

    /// Move every object of `old` into `new`, replacing copies already
    /// there, then drop the `old` directory.
    fn merge_collection(&self, old: &CollectionId, new: &CollectionId) -> Result<()> {
        debug!(%old, %new, "merging re-created collection into renamed one");
        for oid in self.list(old)? {
            let src = self.locate(old, &oid)?;
            let Some(from) = src.found else {
                continue;
            };
            if let Some(existing) = self.locate(new, &oid)?.found {
                fs::remove_file(existing)?;
            }
            let place = self.locate(new, &oid)?;
            fs::rename(from, place.create_in.join(oid.file_name()))?;
            self.note_created(&place.create_in, place.depth)?;
        }
        fs::remove_dir_all(self.collection_dir(old))?;
        Ok(())
    }

    /// All collections, sorted by id.
    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if RESERVED.contains(&name.as_ref()) {
                continue;
            }
            if let Some(cid) = CollectionId::from_encoded(&name) {
                out.push(cid);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Find the file for an object, probing every split level.
    pub fn locate(&self, cid: &CollectionId, oid: &ObjectId) -> Result<ObjectPlace> {
        let mut dir = self.collection_dir(cid);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("collection {cid}")));
        }
        let fname = oid.file_name();
        for depth in 0..=MAX_DEPTH {
            let candidate = dir.join(&fname);
            if candidate.is_file() {
                return Ok(ObjectPlace {
                    found: Some(candidate),
                    create_in: dir,
                    depth,
                });
            }
            if depth == MAX_DEPTH {
                break;
            }
            let sub = dir.join(Self::nibble(oid.hash, depth));
            if sub.is_dir() {
                dir = sub;
            } else {
                return Ok(ObjectPlace {
                    found: None,
                    create_in: dir,
                    depth,
                });
            }
        }
        Ok(ObjectPlace {
            found: None,
            create_in: dir,
            depth: MAX_DEPTH,
        })
    }

    fn count_files(dir: &Path) -> Result<usize> {
        let mut count = 0;
        for entry in fs::read_dir(dir)? {
            if entry?.file_type()?.is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Split `dir` one nibble deeper when it grew past the threshold.
    /// Returns whether a split ran (cached paths under `dir` went stale).
    pub fn note_created(&self, dir: &Path, depth: usize) -> Result<bool> {
        if depth >= MAX_DEPTH || Self::count_files(dir)? <= self.split_threshold {
            return Ok(false);
        }
        debug!(dir = %dir.display(), depth, "splitting index directory");
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(oid) = ObjectId::from_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let sub = dir.join(Self::nibble(oid.hash, depth));
            fs::create_dir_all(&sub)?;
            fs::rename(entry.path(), sub.join(&name))?;
        }
        Ok(true)
    }

    /// Fold a sparse nibble directory back into its parent after removals.
    /// Returns whether a merge ran (cached paths under `dir` went stale).
    pub fn note_removed(&self, dir: &Path, depth: usize) -> Result<bool> {
        if depth == 0 {
            return Ok(false);
        }
        let mut has_subdir = false;
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                has_subdir = true;
            } else {
                files.push(entry.path());
            }
        }
        if has_subdir || files.len() > self.merge_threshold {
            return Ok(false);
        }
        let parent = dir.parent().map(Path::to_path_buf);
        let Some(parent) = parent else {
            return Ok(false);
        };
        debug!(dir = %dir.display(), depth, "merging index directory");
        for file in files {
            let name = file.file_name().map(|n| n.to_os_string());
            if let Some(name) = name {
                fs::rename(&file, parent.join(name))?;
            }
        }
        fs::remove_dir(dir)?;
        Ok(true)
    }

    fn walk(dir: &Path, out: &mut Vec<ObjectId>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let kind = entry.file_type()?;
            if kind.is_dir() {
                Self::walk(&entry.path(), out)?;
            } else if kind.is_file() {
                if let Some(oid) = ObjectId::from_file_name(&entry.file_name().to_string_lossy()) {
                    out.push(oid);
                }
            }
        }
        Ok(())
    }

    /// Every object of a collection, in hash order.
    pub fn list(&self, cid: &CollectionId) -> Result<Vec<ObjectId>> {
        let dir = self.collection_dir(cid);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("collection {cid}")));
        }
        let mut out = Vec::new();
        Self::walk(&dir, &mut out)?;
        out.sort();
        Ok(out)
    }

    /// Page through a collection in hash order.
    ///
    /// Returns at most `max` objects at or after `start`, filtered to the
    /// requested snapshot token ([`SNAP_ANY`] lists everything), plus the
    /// object a subsequent call should start from.
    pub fn list_partial(
        &self,
        cid: &CollectionId,
        start: Option<&ObjectId>,
        min: usize,
        max: usize,
        snap: u64,
    ) -> Result<(Vec<ObjectId>, Option<ObjectId>)> {
        let cap = max.max(min).max(1);
        let all = self.list(cid)?;
        let mut out = Vec::new();
        let mut next = None;
        for oid in all {
            if snap != SNAP_ANY && oid.snap != snap {
                continue;
            }
            if let Some(start) = start {
                if oid < *start {
                    continue;
                }
            }
            if out.len() == cap {
                next = Some(oid);
                break;
            }
            out.push(oid);
        }
        Ok((out, next))
    }

    /// True when the collection holds no objects.
    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        Ok(self.list(cid)?.is_empty())
    }
}
