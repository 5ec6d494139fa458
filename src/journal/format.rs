//! Journal on-disk format helpers.
//!
//! The file starts with one 4 KiB header block followed by a ring of
//! block-aligned entries. All integers are little-endian. Positions stored
//! in the header are logical (monotonically increasing); the physical
//! offset is `header_block + logical % ring_capacity`.

use std::fmt;

use uuid::Uuid;

/// Size of the header block at offset 0.
pub const HEADER_BLOCK: usize = 4096;

/// Magic number of the journal header.
pub const HEADER_MAGIC: u64 = 0x4f58_4a52_4e4c_3130; // "OXJRNL10"

/// Magic number leading every entry.
pub const ENTRY_MAGIC: u64 = 0x4f58_454e_5452_5931; // "OXENTRY1"

/// Magic number closing every entry, xor-ed with the entry seq.
pub const TRAILER_MAGIC: u64 = 0x4f58_5441_494c_3031; // "OXTAIL01"

/// Current on-disk version.
pub const FORMAT_VERSION: u32 = 1;

/// Errors from header or entry validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Buffer shorter than the fixed encoding.
    BufferTooSmall,
    /// Header or entry magic did not match.
    MagicMismatch,
    /// Stored checksum did not match the computed one.
    ChecksumMismatch,
    /// Header version is newer than this build understands.
    UnsupportedVersion(u32),
    /// Entry length field is impossible for this ring.
    BadLength(u32),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::BufferTooSmall => write!(f, "buffer too small"),
            FrameError::MagicMismatch => write!(f, "magic mismatch"),
            FrameError::ChecksumMismatch => write!(f, "checksum mismatch"),
            FrameError::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            FrameError::BadLength(len) => write!(f, "impossible entry length {len}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Fixed header stored in the first block of the journal file.
#[derive(Debug, Clone)]
pub struct JournalHeader {
    /// Format version.
    pub version: u32,
    /// Store identity this journal belongs to.
    pub uuid: Uuid,
    /// Entry alignment in bytes.
    pub block_size: u32,
    /// Ring capacity in bytes (excluding the header block).
    pub capacity: u64,
    /// Logical offset of the first retained entry.
    pub start_pos: u64,
    /// Sequence number expected at `start_pos`.
    pub start_seq: u64,
}

impl JournalHeader {
    /// Bytes covered by the fixed encoding (crc included).
    pub const ENCODED_SIZE: usize = 60;
    const CRC_OFFSET: usize = Self::ENCODED_SIZE - 4;

    /// Header for a freshly formatted journal.
    pub fn new(uuid: Uuid, block_size: u32, capacity: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            uuid,
            block_size,
            capacity,
            start_pos: 0,
            start_seq: 1,
        }
    }

    /// Encode into `buf`, which must hold at least one header block.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), FrameError> {
        if buf.len() < HEADER_BLOCK {
            return Err(FrameError::BufferTooSmall);
        }
        buf[..HEADER_BLOCK].fill(0);
        buf[..8].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        buf[28..32].copy_from_slice(&self.block_size.to_le_bytes());
        buf[32..40].copy_from_slice(&self.capacity.to_le_bytes());
        buf[40..48].copy_from_slice(&self.start_pos.to_le_bytes());
        buf[48..56].copy_from_slice(&self.start_seq.to_le_bytes());
        let crc = crc32fast::hash(&buf[..Self::CRC_OFFSET]);
        buf[Self::CRC_OFFSET..Self::ENCODED_SIZE].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }

    /// Decode and validate a header block.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < Self::ENCODED_SIZE {
            return Err(FrameError::BufferTooSmall);
        }
        if u64::from_le_bytes(buf[..8].try_into().unwrap()) != HEADER_MAGIC {
            return Err(FrameError::MagicMismatch);
        }
        let stored = u32::from_le_bytes(buf[Self::CRC_OFFSET..Self::ENCODED_SIZE].try_into().unwrap());
        if stored != crc32fast::hash(&buf[..Self::CRC_OFFSET]) {
            return Err(FrameError::ChecksumMismatch);
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let uuid = Uuid::from_slice(&buf[12..28]).map_err(|_| FrameError::BufferTooSmall)?;
        Ok(Self {
            version,
            uuid,
            block_size: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
            capacity: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
            start_pos: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
            start_seq: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
        })
    }
}

/// Low 64 bits of a uuid, mixed into per-entry magics so blocks from a
/// previous ring lap or another store never validate.
pub fn uuid_lo(uuid: &Uuid) -> u64 {
    u64::from_le_bytes(uuid.as_bytes()[..8].try_into().unwrap())
}

/// Per-entry header written immediately before the payload.
#[derive(Debug, Clone, Copy)]
pub struct EntryHeader {
    /// Offset-and-identity magic (`phys_offset ^ uuid_lo`).
    pub magic2: u64,
    /// Entry sequence number.
    pub seq: u64,
    /// Payload length in bytes.
    pub len: u32,
    /// crc32 of the payload.
    pub crc: u32,
}

impl EntryHeader {
    /// Encoded size of the entry header.
    pub const SIZE: usize = 32;

    /// Encoded size of the entry trailer.
    pub const TRAILER_SIZE: usize = 8;

    /// Build a header for `payload` written at physical offset `phys`.
    pub fn new(seq: u64, payload: &[u8], phys: u64, uuid: &Uuid) -> Self {
        Self {
            magic2: phys ^ uuid_lo(uuid),
            seq,
            len: payload.len() as u32,
            crc: crc32fast::hash(payload),
        }
    }

    /// Encode into `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<(), FrameError> {
        if buf.len() < Self::SIZE {
            return Err(FrameError::BufferTooSmall);
        }
        buf[..8].copy_from_slice(&ENTRY_MAGIC.to_le_bytes());
        buf[8..16].copy_from_slice(&self.magic2.to_le_bytes());
        buf[16..24].copy_from_slice(&self.seq.to_le_bytes());
        buf[24..28].copy_from_slice(&self.len.to_le_bytes());
        buf[28..32].copy_from_slice(&self.crc.to_le_bytes());
        Ok(())
    }

    /// Decode a header, validating both magics against the physical offset
    /// and uuid the entry claims to live at.
    pub fn decode(buf: &[u8], phys: u64, uuid: &Uuid) -> Result<Self, FrameError> {
        if buf.len() < Self::SIZE {
            return Err(FrameError::BufferTooSmall);
        }
        if u64::from_le_bytes(buf[..8].try_into().unwrap()) != ENTRY_MAGIC {
            return Err(FrameError::MagicMismatch);
        }
        let magic2 = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        if magic2 != phys ^ uuid_lo(uuid) {
            return Err(FrameError::MagicMismatch);
        }
        Ok(Self {
            magic2,
            seq: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            len: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            crc: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        })
    }

    /// Trailer bytes for this entry.
    pub fn trailer(&self) -> [u8; Self::TRAILER_SIZE] {
        (TRAILER_MAGIC ^ self.seq).to_le_bytes()
    }

    /// Validate a trailer read back from disk.
    pub fn check_trailer(&self, buf: &[u8]) -> Result<(), FrameError> {
        if buf.len() < Self::TRAILER_SIZE {
            return Err(FrameError::BufferTooSmall);
        }
        if u64::from_le_bytes(buf[..8].try_into().unwrap()) != TRAILER_MAGIC ^ self.seq {
            return Err(FrameError::MagicMismatch);
        }
        Ok(())
    }

    /// Validate the payload checksum.
    pub fn check_payload(&self, payload: &[u8]) -> Result<(), FrameError> {
        if crc32fast::hash(payload) != self.crc {
            return Err(FrameError::ChecksumMismatch);
        }
        Ok(())
    }
}

/// Round `n` up to a multiple of `align`.
pub const fn align_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

/// On-disk footprint of an entry with a `len`-byte payload.
pub fn entry_span(len: usize, block_size: u32) -> u64 {
    align_up(
        (EntryHeader::SIZE + len + EntryHeader::TRAILER_SIZE) as u64,
        u64::from(block_size),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let uuid = Uuid::new_v4();
        let mut header = JournalHeader::new(uuid, 4096, 1 << 20);
        header.start_pos = 8192;
        header.start_seq = 17;

        let mut buf = vec![0u8; HEADER_BLOCK];
        header.encode(&mut buf).unwrap();
        let decoded = JournalHeader::decode(&buf).unwrap();
        assert_eq!(decoded.uuid, uuid);
        assert_eq!(decoded.capacity, 1 << 20);
        assert_eq!(decoded.start_pos, 8192);
        assert_eq!(decoded.start_seq, 17);
    }

    #[test]
    fn test_header_detects_corruption() {
        let mut buf = vec![0u8; HEADER_BLOCK];
        JournalHeader::new(Uuid::new_v4(), 4096, 1 << 20)
            .encode(&mut buf)
            .unwrap();
        buf[33] ^= 0x40;
        assert_eq!(
            JournalHeader::decode(&buf).unwrap_err(),
            FrameError::ChecksumMismatch
        );
    }

    #[test]
    fn test_entry_roundtrip() {
        let uuid = Uuid::new_v4();
        let payload = b"batch bytes";
        let header = EntryHeader::new(9, payload, 8192, &uuid);

        let mut buf = [0u8; EntryHeader::SIZE];
        header.encode(&mut buf).unwrap();
        let decoded = EntryHeader::decode(&buf, 8192, &uuid).unwrap();
        assert_eq!(decoded.seq, 9);
        assert_eq!(decoded.len as usize, payload.len());
        decoded.check_payload(payload).unwrap();
        decoded.check_trailer(&header.trailer()).unwrap();
    }

    #[test]
    fn test_entry_rejects_wrong_offset() {
        let uuid = Uuid::new_v4();
        let header = EntryHeader::new(9, b"x", 8192, &uuid);
        let mut buf = [0u8; EntryHeader::SIZE];
        header.encode(&mut buf).unwrap();
        assert_eq!(
            EntryHeader::decode(&buf, 4096, &uuid).unwrap_err(),
            FrameError::MagicMismatch
        );
    }

    #[test]
    fn test_entry_rejects_payload_flip() {
        let uuid = Uuid::new_v4();
        let mut payload = b"batch bytes".to_vec();
        let header = EntryHeader::new(3, &payload, 4096, &uuid);
        payload[4] ^= 1;
        assert_eq!(
            header.check_payload(&payload).unwrap_err(),
            FrameError::ChecksumMismatch
        );
    }

    #[test]
    fn test_entry_span_alignment() {
        assert_eq!(entry_span(0, 4096), 4096);
        assert_eq!(entry_span(4000, 4096), 4096);
        assert_eq!(entry_span(4096, 4096), 8192);
    }
}
