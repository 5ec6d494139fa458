//! Replay guards: per-object and per-collection records of the last
//! applied opcode position, making journal replay idempotent.
//!
//! A guard value is the encoded position plus an in-progress flag. Guards
//! are staged into the same KV batch as the opcode they protect, after its
//! on-disk effect, and become durable in the commit cycle that advances
//! the applied watermark. During replay an opcode is skipped when the
//! guard already covers it; multi-step operations open the guard with
//! `in_progress` first and close it when done.

use std::sync::Arc;

use crate::error::Result;
use crate::kvstore::{KvStore, KvTransaction};
use crate::types::{CollectionId, ObjectId, SequencerPosition};

const GUARD_PREFIX: &str = "guard";

/// Verdict of a guard check during replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    /// Not yet applied; run the opcode.
    Apply,
    /// Already applied; skip the opcode.
    Skip,
    /// Applied partially before a crash; the caller must finish the
    /// operation idempotently.
    InProgress,
}

fn encode(spos: SequencerPosition, in_progress: bool) -> Vec<u8> {
    let mut out = spos.encode().to_vec();
    out.push(u8::from(in_progress));
    out
}

fn decode(raw: &[u8]) -> Option<(SequencerPosition, bool)> {
    let spos = SequencerPosition::decode(raw)?;
    let flag = *raw.get(SequencerPosition::ENCODED_SIZE)?;
    Some((spos, flag != 0))
}

/// Guard key for an object.
pub fn object_guard_key(cid: &CollectionId, oid: &ObjectId) -> String {
    format!("{}/{}", cid.encoded(), oid.file_name())
}

/// Guard key for a collection.
pub fn collection_guard_key(cid: &CollectionId) -> String {
    cid.encoded()
}

/// Replay-guard component shared by the object store.
pub struct ReplayGuards {
    kv: Arc<dyn KvStore>,
}

impl ReplayGuards {
    /// Wrap the shared KV store.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Compare `spos` against the recorded guard.
    pub fn check(&self, key: &str, spos: SequencerPosition) -> Result<GuardCheck> {
        let Some(raw) = self.kv.get_one(GUARD_PREFIX, key)? else {
            return Ok(GuardCheck::Apply);
        };
        let Some((last, in_progress)) = decode(&raw) else {
            return Ok(GuardCheck::Apply);
        };
        if spos > last {
            Ok(GuardCheck::Apply)
        } else if in_progress && spos == last {
            Ok(GuardCheck::InProgress)
        } else {
            Ok(GuardCheck::Skip)
        }
    }

    /// Stage a guard at `spos`.
    pub fn set(&self, batch: &mut KvTransaction, key: &str, spos: SequencerPosition, in_progress: bool) {
        batch.set(GUARD_PREFIX, key, encode(spos, in_progress));
    }

    /// Record an in-progress guard immediately, ahead of a multi-step
    /// operation.
    pub fn set_in_progress_now(&self, key: &str, spos: SequencerPosition) -> Result<()> {
        let mut batch = KvTransaction::new();
        self.set(&mut batch, key, spos, true);
        self.kv.submit(batch)
    }

    /// Stage closing of an in-progress guard.
    pub fn close(&self, batch: &mut KvTransaction, key: &str, spos: SequencerPosition) {
        self.set(batch, key, spos, false);
    }

    /// Stage removal of a guard (object or collection teardown).
    pub fn clear(&self, batch: &mut KvTransaction, key: &str) {
        batch.rmkey(GUARD_PREFIX, key);
    }

    /// Stage the rebinding of every guard of collection `old` onto `new`.
    pub fn rename_collection(
        &self,
        batch: &mut KvTransaction,
        old: &CollectionId,
        new: &CollectionId,
    ) -> Result<()> {
        let old_base = format!("{}/", old.encoded());
        let new_base = format!("{}/", new.encoded());
        let mut iter = self.kv.snapshot_prefix_iterator(GUARD_PREFIX)?;
        iter.lower_bound(&old_base)?;
        while iter.valid() && iter.key().starts_with(&old_base) {
            let key = iter.key();
            let moved = format!("{new_base}{}", &key[old_base.len()..]);
            batch.rmkey(GUARD_PREFIX, &key);
            batch.set(GUARD_PREFIX, &moved, iter.value());
            iter.next()?;
        }
        if let Some(value) = self.kv.get_one(GUARD_PREFIX, &collection_guard_key(old))? {
            batch.rmkey(GUARD_PREFIX, &collection_guard_key(old));
            batch.set(GUARD_PREFIX, &collection_guard_key(new), value);
        }
        Ok(())
    }
}
