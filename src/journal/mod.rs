//! Write-ahead journal of serialized transaction batches.

use crate::error::{Error, Result};
use crate::utility::is_power_of_two;

pub mod format;

mod file_journal;

pub use file_journal::{CommitCallback, FileJournal, TrimHold};

/// When applies run relative to journal durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Entries are durable before the apply begins; commit callbacks fire
    /// on journal durability alone.
    #[default]
    Writeahead,
    /// Apply and journal write proceed concurrently; commit callbacks wait
    /// for both.
    Parallel,
    /// Apply runs first and the journal write follows.
    Trailing,
}

/// How journal I/O is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalIoMode {
    /// Page-cache writes plus fdatasync.
    #[default]
    Buffered,
    /// `O_DIRECT` writes from aligned buffers.
    Direct,
    /// `O_DIRECT` writes completed out of order by a worker pool.
    DirectAio,
}

impl JournalIoMode {
    /// Whether this mode bypasses the page cache.
    pub fn is_direct(self) -> bool {
        matches!(self, JournalIoMode::Direct | JournalIoMode::DirectAio)
    }
}

/// Geometry and I/O settings for a journal file.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Ring capacity in bytes, excluding the header block.
    pub capacity: u64,
    /// Entry alignment; must be a power of two.
    pub block_size: u32,
    /// I/O submission mode.
    pub io_mode: JournalIoMode,
    /// Worker count for [`JournalIoMode::DirectAio`].
    pub aio_workers: usize,
    /// Most entries the writer folds into one write-and-sync event.
    pub max_entries_per_event: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            capacity: 64 << 20,
            block_size: 4096,
            io_mode: JournalIoMode::Buffered,
            aio_workers: 4,
            max_entries_per_event: 64,
        }
    }
}

impl JournalConfig {
    /// Reject geometries the ring cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if !is_power_of_two(u64::from(self.block_size)) || self.block_size < 512 {
            return Err(Error::InvalidArgument(format!(
                "journal block size {} is not a power of two >= 512",
                self.block_size
            )));
        }
        if self.capacity == 0 || self.capacity % u64::from(self.block_size) != 0 {
            return Err(Error::InvalidArgument(format!(
                "journal capacity {} is not a multiple of the block size",
                self.capacity
            )));
        }
        Ok(())
    }
}

/// One item of a journal subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    /// The subscriber asked for entries older than the journal retains.
    Skipped {
        /// First sequence number the subscriber asked for.
        from: u64,
        /// First sequence number actually available.
        to: u64,
    },
    /// A retained entry.
    Entry {
        /// Entry sequence number.
        seq: u64,
        /// Entry payload.
        payload: Vec<u8>,
    },
}

/// Counters describing ring occupancy.
#[derive(Debug, Clone)]
pub struct JournalStats {
    /// Sequence expected at the ring start.
    pub start_seq: u64,
    /// Next sequence to be assigned.
    pub next_seq: u64,
    /// Durable frontier.
    pub committed_seq: u64,
    /// Bytes between ring start and write position.
    pub used_bytes: u64,
    /// Ring capacity in bytes.
    pub capacity: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(JournalConfig::default().validate().is_ok());
        let bad_block = JournalConfig {
            block_size: 1000,
            ..JournalConfig::default()
        };
        assert!(bad_block.validate().is_err());
        let bad_capacity = JournalConfig {
            capacity: 4096 * 3 + 1,
            ..JournalConfig::default()
        };
        assert!(bad_capacity.validate().is_err());
    }

    #[test]
    fn test_io_mode_direct() {
        assert!(!JournalIoMode::Buffered.is_direct());
        assert!(JournalIoMode::Direct.is_direct());
        assert!(JournalIoMode::DirectAio.is_direct());
    }
}
