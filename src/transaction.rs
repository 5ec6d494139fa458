//! Transactions: ordered opcode lists applied atomically across crashes.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::types::{CollectionId, ObjectId};

/// A single mutating opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Create the object if it does not exist.
    Touch {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
    },
    /// Write bytes at an offset, extending the object as needed.
    Write {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Byte offset of the write.
        offset: u64,
        /// Data to write.
        data: Vec<u8>,
    },
    /// Overwrite a range with zeros, extending the object as needed.
    Zero {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Byte offset of the range.
        offset: u64,
        /// Length of the range.
        len: u64,
    },
    /// Set the object length.
    Truncate {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// New length.
        size: u64,
    },
    /// Remove the object, its attributes and its omap.
    Remove {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
    },
    /// Copy bytes, attributes and omap from `src` to `dst`.
    Clone {
        /// Collection holding both objects.
        cid: CollectionId,
        /// Source object.
        src: ObjectId,
        /// Destination object.
        dst: ObjectId,
    },
    /// Copy a byte range from `src` into `dst`.
    CloneRange {
        /// Collection holding both objects.
        cid: CollectionId,
        /// Source object.
        src: ObjectId,
        /// Destination object.
        dst: ObjectId,
        /// Offset in the source.
        src_off: u64,
        /// Bytes to copy.
        len: u64,
        /// Offset in the destination.
        dst_off: u64,
    },
    /// Set one attribute.
    SetAttr {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// Set several attributes at once.
    SetAttrs {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Attributes to set.
        attrs: BTreeMap<String, Vec<u8>>,
    },
    /// Remove one attribute.
    RmAttr {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Attribute name.
        name: String,
    },
    /// Remove every attribute of the object.
    RmAttrs {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
    },
    /// Create a collection.
    CreateCollection {
        /// Collection to create.
        cid: CollectionId,
    },
    /// Destroy an empty collection.
    DestroyCollection {
        /// Collection to destroy.
        cid: CollectionId,
    },
    /// Copy an object from another collection into this one.
    CollectionAdd {
        /// Destination collection.
        cid: CollectionId,
        /// Collection currently holding the object.
        src_cid: CollectionId,
        /// Object to add.
        oid: ObjectId,
    },
    /// Rename a collection atomically.
    CollectionRename {
        /// Current id.
        cid: CollectionId,
        /// New id.
        new_cid: CollectionId,
    },
    /// Set a collection attribute.
    CollSetAttr {
        /// Target collection.
        cid: CollectionId,
        /// Attribute name.
        name: String,
        /// Attribute value.
        value: Vec<u8>,
    },
    /// Remove a collection attribute.
    CollRmAttr {
        /// Target collection.
        cid: CollectionId,
        /// Attribute name.
        name: String,
    },
    /// Insert or overwrite omap keys.
    OmapSetKeys {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Keys and values to set.
        map: BTreeMap<String, Vec<u8>>,
    },
    /// Remove omap keys.
    OmapRmKeys {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// Keys to remove.
        keys: BTreeSet<String>,
    },
    /// Remove every omap key and the header.
    OmapClear {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
    },
    /// Replace the omap header blob.
    OmapSetHeader {
        /// Target collection.
        cid: CollectionId,
        /// Target object.
        oid: ObjectId,
        /// New header bytes.
        data: Vec<u8>,
    },
}

/// An ordered list of opcodes journaled and applied as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl Transaction {
    /// Create an empty transaction.
    pub fn new() -> Self {
        Self::default()
    }

    /// The opcodes in application order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Number of opcodes.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True when no opcodes are staged.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Rough payload footprint, used for throttle accounting.
    pub fn byte_size(&self) -> u64 {
        let mut total = 0u64;
        for op in &self.ops {
            total += 64;
            match op {
                Op::Write { data, .. } | Op::OmapSetHeader { data, .. } => {
                    total += data.len() as u64;
                }
                Op::SetAttr { value, .. } | Op::CollSetAttr { value, .. } => {
                    total += value.len() as u64;
                }
                Op::SetAttrs { attrs, .. } => {
                    total += attrs.values().map(|v| v.len() as u64).sum::<u64>();
                }
                Op::OmapSetKeys { map, .. } => {
                    total += map
                        .iter()
                        .map(|(k, v)| (k.len() + v.len()) as u64)
                        .sum::<u64>();
                }
                _ => {}
            }
        }
        total
    }

    /// Stage a raw opcode.
    pub fn push(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Create the object if absent.
    pub fn touch(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(Op::Touch {
            cid: cid.clone(),
            oid: oid.clone(),
        })
    }

    /// Write `data` at `offset`.
    pub fn write(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        data: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.push(Op::Write {
            cid: cid.clone(),
            oid: oid.clone(),
            offset,
            data: data.into(),
        })
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero(&mut self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64) -> &mut Self {
        self.push(Op::Zero {
            cid: cid.clone(),
            oid: oid.clone(),
            offset,
            len,
        })
    }

    /// Truncate the object to `size`.
    pub fn truncate(&mut self, cid: &CollectionId, oid: &ObjectId, size: u64) -> &mut Self {
        self.push(Op::Truncate {
            cid: cid.clone(),
            oid: oid.clone(),
            size,
        })
    }

    /// Remove the object.
    pub fn remove(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(Op::Remove {
            cid: cid.clone(),
            oid: oid.clone(),
        })
    }

    /// Clone `src` to `dst` (bytes, attributes and omap).
    pub fn clone_object(
        &mut self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
    ) -> &mut Self {
        self.push(Op::Clone {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
        })
    }

    /// Clone a byte range of `src` into `dst`.
    pub fn clone_range(
        &mut self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        src_off: u64,
        len: u64,
        dst_off: u64,
    ) -> &mut Self {
        self.push(Op::CloneRange {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
            src_off,
            len,
            dst_off,
        })
    }

    /// Set one attribute.
    pub fn setattr(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        name: &str,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.push(Op::SetAttr {
            cid: cid.clone(),
            oid: oid.clone(),
            name: name.to_string(),
            value: value.into(),
        })
    }

    /// Set several attributes.
    pub fn setattrs(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        attrs: BTreeMap<String, Vec<u8>>,
    ) -> &mut Self {
        self.push(Op::SetAttrs {
            cid: cid.clone(),
            oid: oid.clone(),
            attrs,
        })
    }

    /// Remove one attribute.
    pub fn rmattr(&mut self, cid: &CollectionId, oid: &ObjectId, name: &str) -> &mut Self {
        self.push(Op::RmAttr {
            cid: cid.clone(),
            oid: oid.clone(),
            name: name.to_string(),
        })
    }

    /// Remove every attribute.
    pub fn rmattrs(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(Op::RmAttrs {
            cid: cid.clone(),
            oid: oid.clone(),
        })
    }

    /// Create a collection.
    pub fn create_collection(&mut self, cid: &CollectionId) -> &mut Self {
        self.push(Op::CreateCollection { cid: cid.clone() })
    }

    /// Destroy an empty collection.
    pub fn destroy_collection(&mut self, cid: &CollectionId) -> &mut Self {
        self.push(Op::DestroyCollection { cid: cid.clone() })
    }

    /// Copy an object into this collection from another.
    pub fn collection_add(
        &mut self,
        cid: &CollectionId,
        src_cid: &CollectionId,
        oid: &ObjectId,
    ) -> &mut Self {
        self.push(Op::CollectionAdd {
            cid: cid.clone(),
            src_cid: src_cid.clone(),
            oid: oid.clone(),
        })
    }

    /// Rename a collection.
    pub fn collection_rename(&mut self, cid: &CollectionId, new_cid: &CollectionId) -> &mut Self {
        self.push(Op::CollectionRename {
            cid: cid.clone(),
            new_cid: new_cid.clone(),
        })
    }

    /// Set a collection attribute.
    pub fn collection_setattr(
        &mut self,
        cid: &CollectionId,
        name: &str,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.push(Op::CollSetAttr {
            cid: cid.clone(),
            name: name.to_string(),
            value: value.into(),
        })
    }

    /// Remove a collection attribute.
    pub fn collection_rmattr(&mut self, cid: &CollectionId, name: &str) -> &mut Self {
        self.push(Op::CollRmAttr {
            cid: cid.clone(),
            name: name.to_string(),
        })
    }

    /// Insert or overwrite omap keys.
    pub fn omap_setkeys(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        map: BTreeMap<String, Vec<u8>>,
    ) -> &mut Self {
        self.push(Op::OmapSetKeys {
            cid: cid.clone(),
            oid: oid.clone(),
            map,
        })
    }

    /// Remove omap keys.
    pub fn omap_rmkeys(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: BTreeSet<String>,
    ) -> &mut Self {
        self.push(Op::OmapRmKeys {
            cid: cid.clone(),
            oid: oid.clone(),
            keys,
        })
    }

    /// Clear the omap.
    pub fn omap_clear(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(Op::OmapClear {
            cid: cid.clone(),
            oid: oid.clone(),
        })
    }

    /// Replace the omap header blob.
    pub fn omap_setheader(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        data: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.push(Op::OmapSetHeader {
            cid: cid.clone(),
            oid: oid.clone(),
            data: data.into(),
        })
    }

    /// Serialize this transaction.
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.ops.len() as u32);
        for op in &self.ops {
            encode_op(out, op);
        }
    }

    /// Deserialize a transaction, advancing `cursor`.
    pub fn decode(cursor: &mut Cursor<'_>) -> Result<Self> {
        let count = cursor.take_u32()?;
        let mut ops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ops.push(decode_op(cursor)?);
        }
        Ok(Self { ops })
    }
}

/// Serialize a batch of transactions into one journal payload.
pub fn encode_batch(txs: &[Transaction]) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, txs.len() as u32);
    for tx in txs {
        tx.encode(&mut out);
    }
    out
}

/// Inverse of [`encode_batch`].
pub fn decode_batch(buf: &[u8]) -> Result<Vec<Transaction>> {
    let mut cursor = Cursor::new(buf);
    let count = cursor.take_u32()?;
    let mut txs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        txs.push(Transaction::decode(&mut cursor)?);
    }
    if !cursor.is_empty() {
        return Err(Error::Corruption(
            "trailing bytes after transaction batch".to_string(),
        ));
    }
    Ok(txs)
}

const TAG_TOUCH: u8 = 1;
const TAG_WRITE: u8 = 2;
const TAG_ZERO: u8 = 3;
const TAG_TRUNCATE: u8 = 4;
const TAG_REMOVE: u8 = 5;
const TAG_CLONE: u8 = 6;
const TAG_CLONE_RANGE: u8 = 7;
const TAG_SETATTR: u8 = 8;
const TAG_SETATTRS: u8 = 9;
const TAG_RMATTR: u8 = 10;
const TAG_RMATTRS: u8 = 11;
const TAG_MKCOLL: u8 = 12;
const TAG_RMCOLL: u8 = 13;
const TAG_COLL_ADD: u8 = 14;
const TAG_COLL_RENAME: u8 = 15;
const TAG_COLL_SETATTR: u8 = 16;
const TAG_COLL_RMATTR: u8 = 17;
const TAG_OMAP_SETKEYS: u8 = 18;
const TAG_OMAP_RMKEYS: u8 = 19;
const TAG_OMAP_CLEAR: u8 = 20;
const TAG_OMAP_SETHEADER: u8 = 21;

fn encode_op(out: &mut Vec<u8>, op: &Op) {
    match op {
        Op::Touch { cid, oid } => {
            out.push(TAG_TOUCH);
            put_cid(out, cid);
            put_oid(out, oid);
        }
        Op::Write {
            cid,
            oid,
            offset,
            data,
        } => {
            out.push(TAG_WRITE);
            put_cid(out, cid);
            put_oid(out, oid);
            put_u64(out, *offset);
            put_bytes(out, data);
        }
        Op::Zero {
            cid,
            oid,
            offset,
            len,
        } => {
            out.push(TAG_ZERO);
            put_cid(out, cid);
            put_oid(out, oid);
            put_u64(out, *offset);
            put_u64(out, *len);
        }
        Op::Truncate { cid, oid, size } => {
            out.push(TAG_TRUNCATE);
            put_cid(out, cid);
            put_oid(out, oid);
            put_u64(out, *size);
        }
        Op::Remove { cid, oid } => {
            out.push(TAG_REMOVE);
            put_cid(out, cid);
            put_oid(out, oid);
        }
        Op::Clone { cid, src, dst } => {
            out.push(TAG_CLONE);
            put_cid(out, cid);
            put_oid(out, src);
            put_oid(out, dst);
        }
        Op::CloneRange {
            cid,
            src,
            dst,
            src_off,
            len,
            dst_off,
        } => {
            out.push(TAG_CLONE_RANGE);
            put_cid(out, cid);
            put_oid(out, src);
            put_oid(out, dst);
            put_u64(out, *src_off);
            put_u64(out, *len);
            put_u64(out, *dst_off);
        }
        Op::SetAttr {
            cid,
            oid,
            name,
            value,
        } => {
            out.push(TAG_SETATTR);
            put_cid(out, cid);
            put_oid(out, oid);
            put_str(out, name);
            put_bytes(out, value);
        }
        Op::SetAttrs { cid, oid, attrs } => {
            out.push(TAG_SETATTRS);
            put_cid(out, cid);
            put_oid(out, oid);
            put_u32(out, attrs.len() as u32);
            for (name, value) in attrs {
                put_str(out, name);
                put_bytes(out, value);
            }
        }
        Op::RmAttr { cid, oid, name } => {
            out.push(TAG_RMATTR);
            put_cid(out, cid);
            put_oid(out, oid);
            put_str(out, name);
        }
        Op::RmAttrs { cid, oid } => {
            out.push(TAG_RMATTRS);
            put_cid(out, cid);
            put_oid(out, oid);
        }
        Op::CreateCollection { cid } => {
            out.push(TAG_MKCOLL);
            put_cid(out, cid);
        }
        Op::DestroyCollection { cid } => {
            out.push(TAG_RMCOLL);
            put_cid(out, cid);
        }
        Op::CollectionAdd { cid, src_cid, oid } => {
            out.push(TAG_COLL_ADD);
            put_cid(out, cid);
            put_cid(out, src_cid);
            put_oid(out, oid);
        }
        Op::CollectionRename { cid, new_cid } => {
            out.push(TAG_COLL_RENAME);
            put_cid(out, cid);
            put_cid(out, new_cid);
        }
        Op::CollSetAttr { cid, name, value } => {
            out.push(TAG_COLL_SETATTR);
            put_cid(out, cid);
            put_str(out, name);
            put_bytes(out, value);
        }
        Op::CollRmAttr { cid, name } => {
            out.push(TAG_COLL_RMATTR);
            put_cid(out, cid);
            put_str(out, name);
        }
        Op::OmapSetKeys { cid, oid, map } => {
            out.push(TAG_OMAP_SETKEYS);
            put_cid(out, cid);
            put_oid(out, oid);
            put_u32(out, map.len() as u32);
            for (key, value) in map {
                put_str(out, key);
                put_bytes(out, value);
            }
        }
        Op::OmapRmKeys { cid, oid, keys } => {
            out.push(TAG_OMAP_RMKEYS);
            put_cid(out, cid);
            put_oid(out, oid);
            put_u32(out, keys.len() as u32);
            for key in keys {
                put_str(out, key);
            }
        }
        Op::OmapClear { cid, oid } => {
            out.push(TAG_OMAP_CLEAR);
            put_cid(out, cid);
            put_oid(out, oid);
        }
        Op::OmapSetHeader { cid, oid, data } => {
            out.push(TAG_OMAP_SETHEADER);
            put_cid(out, cid);
            put_oid(out, oid);
            put_bytes(out, data);
        }
    }
}

fn decode_op(cursor: &mut Cursor<'_>) -> Result<Op> {
    let tag = cursor.take_u8()?;
    Ok(match tag {
        TAG_TOUCH => Op::Touch {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
        },
        TAG_WRITE => Op::Write {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
            offset: cursor.take_u64()?,
            data: cursor.take_bytes()?,
        },
        TAG_ZERO => Op::Zero {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
            offset: cursor.take_u64()?,
            len: cursor.take_u64()?,
        },
        TAG_TRUNCATE => Op::Truncate {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
            size: cursor.take_u64()?,
        },
        TAG_REMOVE => Op::Remove {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
        },
        TAG_CLONE => Op::Clone {
            cid: take_cid(cursor)?,
            src: take_oid(cursor)?,
            dst: take_oid(cursor)?,
        },
        TAG_CLONE_RANGE => Op::CloneRange {
            cid: take_cid(cursor)?,
            src: take_oid(cursor)?,
            dst: take_oid(cursor)?,
            src_off: cursor.take_u64()?,
            len: cursor.take_u64()?,
            dst_off: cursor.take_u64()?,
        },
        TAG_SETATTR => Op::SetAttr {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
            name: cursor.take_str()?,
            value: cursor.take_bytes()?,
        },
        TAG_SETATTRS => {
            let cid = take_cid(cursor)?;
            let oid = take_oid(cursor)?;
            let count = cursor.take_u32()?;
            let mut attrs = BTreeMap::new();
            for _ in 0..count {
                let name = cursor.take_str()?;
                let value = cursor.take_bytes()?;
                attrs.insert(name, value);
            }
            Op::SetAttrs { cid, oid, attrs }
        }
        TAG_RMATTR => Op::RmAttr {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
            name: cursor.take_str()?,
        },
        TAG_RMATTRS => Op::RmAttrs {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
        },
        TAG_MKCOLL => Op::CreateCollection {
            cid: take_cid(cursor)?,
        },
        TAG_RMCOLL => Op::DestroyCollection {
            cid: take_cid(cursor)?,
        },
        TAG_COLL_ADD => Op::CollectionAdd {
            cid: take_cid(cursor)?,
            src_cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
        },
        TAG_COLL_RENAME => Op::CollectionRename {
            cid: take_cid(cursor)?,
            new_cid: take_cid(cursor)?,
        },
        TAG_COLL_SETATTR => Op::CollSetAttr {
            cid: take_cid(cursor)?,
            name: cursor.take_str()?,
            value: cursor.take_bytes()?,
        },
        TAG_COLL_RMATTR => Op::CollRmAttr {
            cid: take_cid(cursor)?,
            name: cursor.take_str()?,
        },
        TAG_OMAP_SETKEYS => {
            let cid = take_cid(cursor)?;
            let oid = take_oid(cursor)?;
            let count = cursor.take_u32()?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = cursor.take_str()?;
                let value = cursor.take_bytes()?;
                map.insert(key, value);
            }
            Op::OmapSetKeys { cid, oid, map }
        }
        TAG_OMAP_RMKEYS => {
            let cid = take_cid(cursor)?;
            let oid = take_oid(cursor)?;
            let count = cursor.take_u32()?;
            let mut keys = BTreeSet::new();
            for _ in 0..count {
                keys.insert(cursor.take_str()?);
            }
            Op::OmapRmKeys { cid, oid, keys }
        }
        TAG_OMAP_CLEAR => Op::OmapClear {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
        },
        TAG_OMAP_SETHEADER => Op::OmapSetHeader {
            cid: take_cid(cursor)?,
            oid: take_oid(cursor)?,
            data: cursor.take_bytes()?,
        },
        other => {
            return Err(Error::Corruption(format!(
                "unknown transaction opcode tag {other}"
            )))
        }
    })
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    put_u32(out, data.len() as u32);
    out.extend_from_slice(data);
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_cid(out: &mut Vec<u8>, cid: &CollectionId) {
    put_str(out, cid.as_str());
}

fn put_oid(out: &mut Vec<u8>, oid: &ObjectId) {
    put_u32(out, oid.hash);
    put_u64(out, oid.snap);
    put_str(out, &oid.name);
}

fn take_cid(cursor: &mut Cursor<'_>) -> Result<CollectionId> {
    Ok(CollectionId::new(cursor.take_str()?))
}

fn take_oid(cursor: &mut Cursor<'_>) -> Result<ObjectId> {
    let hash = cursor.take_u32()?;
    let snap = cursor.take_u64()?;
    let name = cursor.take_str()?;
    Ok(ObjectId { hash, name, snap })
}

/// Bounds-checked reader over an encoded buffer.
pub struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    /// Start reading at the front of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// True once the buffer is fully consumed.
    pub fn is_empty(&self) -> bool {
        self.off >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .off
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Corruption("truncated transaction encoding".to_string()))?;
        let slice = &self.buf[self.off..end];
        self.off = end;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn take_str(&mut self) -> Result<String> {
        let bytes = self.take_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| Error::Corruption("non-utf8 string in transaction".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sample_batch() -> Vec<Transaction> {
        let cid = CollectionId::new("pool.1");
        let oid = ObjectId::from_name("object one");
        let dst = ObjectId::from_name("object two");

        let mut t1 = Transaction::new();
        t1.create_collection(&cid)
            .touch(&cid, &oid)
            .write(&cid, &oid, 128, b"payload".to_vec())
            .setattr(&cid, &oid, "version", b"3".to_vec());

        let mut t2 = Transaction::new();
        let mut map = BTreeMap::new();
        map.insert("k1".to_string(), b"v1".to_vec());
        map.insert("k2".to_string(), b"v2".to_vec());
        t2.omap_setkeys(&cid, &oid, map)
            .clone_range(&cid, &oid, &dst, 0, 7, 64)
            .collection_rename(&cid, &CollectionId::new("pool.2"));

        vec![t1, t2]
    }

    #[test]
    fn test_batch_roundtrip() {
        let batch = sample_batch();
        let encoded = encode_batch(&batch);
        let decoded = decode_batch(&encoded).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut encoded = encode_batch(&sample_batch());
        // Op count of tx 1 lives right after the batch count; stomp the
        // first tag byte instead.
        let tag_offset = 4 + 4;
        encoded[tag_offset] = 0xEE;
        let err = decode_batch(&encoded).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let encoded = encode_batch(&sample_batch());
        let err = decode_batch(&encoded[..encoded.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_byte_size_tracks_payload() {
        let cid = CollectionId::new("c");
        let oid = ObjectId::from_name("o");
        let mut small = Transaction::new();
        small.touch(&cid, &oid);
        let mut big = Transaction::new();
        big.write(&cid, &oid, 0, vec![0u8; 4096]);
        assert!(big.byte_size() > small.byte_size() + 4000);
    }

    #[test]
    fn test_empty_batch() {
        let decoded = decode_batch(&encode_batch(&[])).unwrap();
        assert!(decoded.is_empty());
    }
}
