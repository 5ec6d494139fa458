//! Shared test utilities: engine fixtures and callback counters.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oxistore::pipeline::Callback;
use oxistore::{Store, StoreConfig};
use uuid::Uuid;

/// Configuration tuned for tests: small journal, quick sync cadence,
/// in-memory KV unless a test needs durability across a remount.
pub fn test_config() -> StoreConfig {
    StoreConfig {
        journal_capacity: 4 << 20,
        min_sync_interval: Duration::from_millis(1),
        max_sync_interval: Duration::from_millis(50),
        apply_workers: 2,
        ephemeral_kv: true,
        ..StoreConfig::default()
    }
}

/// Like [`test_config`], but everything durable and the sync thread held
/// off so a copied store directory behaves like a crash image.
pub fn crash_test_config() -> StoreConfig {
    StoreConfig {
        journal_capacity: 8 << 20,
        min_sync_interval: Duration::from_secs(3600),
        max_sync_interval: Duration::from_secs(3600),
        apply_workers: 2,
        ephemeral_kv: false,
        ..StoreConfig::default()
    }
}

/// mkfs + mount a fresh engine under `root`.
pub fn fresh_store(root: &Path, config: StoreConfig) -> Store {
    let dir = root.join("store");
    let journal = root.join("journal");
    Store::mkfs(&dir, &journal, Uuid::new_v4(), &config).unwrap();
    Store::mount(&dir, &journal, config).unwrap()
}

/// Remount an engine previously created with [`fresh_store`].
pub fn remount(root: &Path, config: StoreConfig) -> Store {
    Store::mount(root.join("store"), root.join("journal"), config).unwrap()
}

/// A callback that bumps a counter when invoked with `Ok`.
pub fn counting_cb(counter: &Arc<AtomicU64>) -> Callback {
    let counter = Arc::clone(counter);
    Box::new(move |result| {
        result.unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
    })
}

/// Copy a store directory tree, producing a crash image.
pub fn copy_tree(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).unwrap();
        }
    }
}
