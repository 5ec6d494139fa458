//! oxistore - A local object-storage engine
//!
//! The durable core of a storage node: opaque objects with attributes and
//! per-object key-value maps, mutated through journaled transaction
//! batches. The pieces:
//! - **Journal**: an append-only ring file of serialized batches with
//!   commit notification, trimming and crash replay
//! - **OpPipeline**: per-sequencer ordered application with readable and
//!   on-disk callbacks and bounded in-flight backpressure
//! - **ObjectStore**: collections and objects over a hashed directory
//!   tree, with replay guards making re-application idempotent
//! - **KvStore**: an ordered `(prefix, key)` space with atomic batches
//!   and snapshot iterators, backing attributes, guards and omaps
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use oxistore::{Store, StoreConfig, Transaction};
//! use oxistore::types::{CollectionId, ObjectId};
//!
//! let config = StoreConfig::default();
//! Store::mkfs(&dir, &journal, uuid::Uuid::new_v4(), &config)?;
//! let store = Store::mount(&dir, &journal, config)?;
//!
//! let cid = CollectionId::new("pool.1");
//! let oid = ObjectId::from_name("object");
//! let mut tx = Transaction::new();
//! tx.create_collection(&cid).write(&cid, &oid, 0, b"bytes".to_vec());
//! store.apply_transactions(vec![tx])?;
//!
//! assert_eq!(store.read(&cid, &oid, 0, 0)?, b"bytes");
//! store.umount()?;
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod config;
pub mod error;
pub mod journal;
pub mod kvstore;
pub mod omap;
pub mod pipeline;
pub mod store;
pub mod transaction;
pub mod types;
mod utility;

// Re-exports for convenience
pub use config::{OxistoreConfig, StoreConfig, Tunables};
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{Callback, Sequencer, Store};
pub use transaction::{Op, Transaction};

/// Constants used throughout the library
pub mod constants {
    /// Journal and store block size in bytes
    pub const BLOCK_SIZE: usize = 4096;

    /// Default chunk size for file copies
    pub const COPY_CHUNK_BYTES: usize = 128 << 10;
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::StoreConfig;
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::pipeline::{Sequencer, Store};
    pub use crate::transaction::Transaction;
    pub use crate::types::{CollectionId, ObjectId, SequencerPosition};
}
