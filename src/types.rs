//! Core identifiers: collections, objects, sequencer positions.

use std::fmt;

/// Snapshot token meaning "the live head of the object".
pub const SNAP_HEAD: u64 = u64::MAX;

/// Snapshot filter meaning "all snapshots" in listing calls.
pub const SNAP_ANY: u64 = u64::MAX - 1;

/// Stable byte-string identifier of a collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionId(String);

impl CollectionId {
    /// Build a collection id from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem- and prefix-safe rendering of the id.
    pub fn encoded(&self) -> String {
        escape(&self.0)
    }

    /// Inverse of [`CollectionId::encoded`].
    pub fn from_encoded(enc: &str) -> Option<Self> {
        unescape(enc).map(Self)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an object: hash bucket, name and snapshot token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    /// Hash bucket the object sorts under.
    pub hash: u32,
    /// Object name.
    pub name: String,
    /// Snapshot token; [`SNAP_HEAD`] for the live object.
    pub snap: u64,
}

impl ObjectId {
    /// A head object with an explicit hash.
    pub fn new(name: impl Into<String>, hash: u32) -> Self {
        Self {
            hash,
            name: name.into(),
            snap: SNAP_HEAD,
        }
    }

    /// A head object whose hash is derived from its name.
    pub fn from_name(name: impl Into<String>) -> Self {
        let name = name.into();
        let hash = name_hash(&name);
        Self {
            hash,
            name,
            snap: SNAP_HEAD,
        }
    }

    /// The same object at a specific snapshot.
    pub fn with_snap(mut self, snap: u64) -> Self {
        self.snap = snap;
        self
    }

    /// File name used on disk and inside key-value keys.
    ///
    /// The escaped name never contains `_`, so the three fields split
    /// unambiguously on decode.
    pub fn file_name(&self) -> String {
        format!("{}_{:016x}_{:08x}", escape(&self.name), self.snap, self.hash)
    }

    /// Inverse of [`ObjectId::file_name`].
    pub fn from_file_name(fname: &str) -> Option<Self> {
        let mut parts = fname.rsplitn(3, '_');
        let hash = u32::from_str_radix(parts.next()?, 16).ok()?;
        let snap = u64::from_str_radix(parts.next()?, 16).ok()?;
        let name = unescape(parts.next()?)?;
        Some(Self { hash, name, snap })
    }

    /// Ordering key used by collection listings: hash first, then name,
    /// then snapshot.
    pub fn sort_key(&self) -> (u32, &str, u64) {
        (self.hash, &self.name, self.snap)
    }
}

impl PartialOrd for ObjectId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.snap == SNAP_HEAD {
            write!(f, "{}:{:08x}:head", self.name, self.hash)
        } else {
            write!(f, "{}:{:08x}:{:x}", self.name, self.hash, self.snap)
        }
    }
}

/// Position of a single opcode in the journal: batch sequence number plus
/// the opcode's index inside the batch. Totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequencerPosition {
    /// Batch sequence number.
    pub seq: u64,
    /// Opcode index within the batch.
    pub index: u32,
}

impl SequencerPosition {
    /// Encoded byte length of a position.
    pub const ENCODED_SIZE: usize = 12;

    /// Build a position.
    pub fn new(seq: u64, index: u32) -> Self {
        Self { seq, index }
    }

    /// Serialize to little-endian bytes.
    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[..8].copy_from_slice(&self.seq.to_le_bytes());
        out[8..].copy_from_slice(&self.index.to_le_bytes());
        out
    }

    /// Deserialize from the encoding produced by [`SequencerPosition::encode`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return None;
        }
        Some(Self {
            seq: u64::from_le_bytes(buf[..8].try_into().ok()?),
            index: u32::from_le_bytes(buf[8..12].try_into().ok()?),
        })
    }
}

impl fmt::Display for SequencerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.seq, self.index)
    }
}

/// Stable hash for object names (FNV-1a, 32-bit).
pub fn name_hash(name: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Escape a string to `[A-Za-z0-9-]` plus `%XX` sequences.
///
/// The output never contains `_`, `.`, `/` or NUL, so callers can use those
/// as separators around escaped fields.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => out.push(byte as char),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Inverse of [`escape`]. Returns `None` on malformed input.
pub fn unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_roundtrip() {
        for name in ["plain", "with space", "slash/dot.us_%", "ünïcode"] {
            let enc = escape(name);
            assert!(!enc.contains('_'), "separator leaked: {enc}");
            assert!(!enc.contains('/'));
            assert_eq!(unescape(&enc).as_deref(), Some(name));
        }
    }

    #[test]
    fn test_object_file_name_roundtrip() {
        let oid = ObjectId::from_name("rbd_data.1234_chunk").with_snap(7);
        let decoded = ObjectId::from_file_name(&oid.file_name()).unwrap();
        assert_eq!(decoded, oid);
    }

    #[test]
    fn test_object_ordering_by_hash_first() {
        let a = ObjectId::new("zzz", 1);
        let b = ObjectId::new("aaa", 2);
        assert!(a < b);
    }

    #[test]
    fn test_spos_roundtrip_and_order() {
        let a = SequencerPosition::new(10, 2);
        let b = SequencerPosition::new(10, 3);
        let c = SequencerPosition::new(11, 0);
        assert!(a < b && b < c);
        assert_eq!(SequencerPosition::decode(&a.encode()), Some(a));
    }

    #[test]
    fn test_name_hash_stable() {
        assert_eq!(name_hash("obj"), name_hash("obj"));
        assert_ne!(name_hash("obj"), name_hash("obk"));
    }

    #[test]
    fn test_collection_encoding() {
        let cid = CollectionId::new("meta/1.b_2");
        let enc = cid.encoded();
        assert!(!enc.contains('/') && !enc.contains('.'));
        assert_eq!(CollectionId::from_encoded(&enc), Some(cid));
    }
}
