//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::journal::{JournalConfig, JournalIoMode, JournalMode};

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum ops in flight before submitters block.
    pub queue_max_ops: u64,
    /// Maximum bytes in flight before submitters block.
    pub queue_max_bytes: u64,
    /// Journal ring capacity in bytes.
    pub journal_capacity: u64,
    /// Journal block size in bytes.
    pub journal_block_size: u32,
    /// Use `O_DIRECT` journal writes.
    pub journal_dio: bool,
    /// Complete journal writes asynchronously.
    pub journal_aio: bool,
    /// Worker count for async journal completion.
    pub journal_aio_workers: usize,
    /// Most journal entries folded into one write-and-sync event.
    pub journal_max_entries_per_event: usize,
    /// Apply-versus-durability ordering.
    pub journal_mode: JournalMode,
    /// Shortest pause between commit cycles.
    pub min_sync_interval: Duration,
    /// Longest pause between commit cycles.
    pub max_sync_interval: Duration,
    /// Apply worker threads.
    pub apply_workers: usize,
    /// Log applies slower than this.
    pub apply_warn_threshold: Duration,
    /// Files per directory before an index split.
    pub index_split_threshold: usize,
    /// Files per nibble directory before a merge.
    pub index_merge_threshold: usize,
    /// Open-file cache capacity.
    pub fd_cache_size: usize,
    /// Use the in-memory KV backend instead of the durable one.
    pub ephemeral_kv: bool,
    /// Treat create-collection of an existing collection as success.
    pub tolerate_collection_exists: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_max_ops: 512,
            queue_max_bytes: 128 << 20,
            journal_capacity: 64 << 20,
            journal_block_size: 4096,
            journal_dio: false,
            journal_aio: false,
            journal_aio_workers: 4,
            journal_max_entries_per_event: 64,
            journal_mode: JournalMode::Writeahead,
            min_sync_interval: Duration::from_millis(10),
            max_sync_interval: Duration::from_secs(5),
            apply_workers: 2,
            apply_warn_threshold: Duration::from_secs(30),
            index_split_threshold: 320,
            index_merge_threshold: 10,
            fd_cache_size: 128,
            ephemeral_kv: false,
            tolerate_collection_exists: true,
        }
    }
}

impl StoreConfig {
    /// Journal geometry derived from this configuration.
    pub fn journal_config(&self) -> JournalConfig {
        let io_mode = match (self.journal_dio, self.journal_aio) {
            (true, true) => JournalIoMode::DirectAio,
            (true, false) => JournalIoMode::Direct,
            _ => JournalIoMode::Buffered,
        };
        JournalConfig {
            capacity: self.journal_capacity,
            block_size: self.journal_block_size,
            io_mode,
            aio_workers: self.journal_aio_workers,
            max_entries_per_event: self.journal_max_entries_per_event,
        }
    }

    /// Snapshot of the runtime-tunable values.
    pub fn tunables(&self) -> Tunables {
        Tunables {
            min_sync_interval: self.min_sync_interval,
            max_sync_interval: self.max_sync_interval,
            apply_warn_threshold: self.apply_warn_threshold,
        }
    }
}

/// Values workers re-read at runtime.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Shortest pause between commit cycles.
    pub min_sync_interval: Duration,
    /// Longest pause between commit cycles.
    pub max_sync_interval: Duration,
    /// Log applies slower than this.
    pub apply_warn_threshold: Duration,
}

/// Atomic snapshot cell holding the current [`Tunables`].
pub struct TunableCell {
    inner: RwLock<Arc<Tunables>>,
}

impl TunableCell {
    /// Seed the cell.
    pub fn new(tunables: Tunables) -> Self {
        Self {
            inner: RwLock::new(Arc::new(tunables)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<Tunables> {
        Arc::clone(&self.inner.read())
    }

    /// Replace the snapshot.
    pub fn store(&self, tunables: Tunables) {
        *self.inner.write() = Arc::new(tunables);
    }
}

/// Top-level configuration schema (TOML file plus env overrides).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OxistoreConfig {
    /// Throttle settings.
    pub queue: Option<QueueSpec>,
    /// Journal settings.
    pub journal: Option<JournalSpec>,
    /// Commit-cycle cadence.
    pub sync: Option<SyncSpec>,
    /// Apply worker settings.
    pub apply: Option<ApplySpec>,
    /// Directory index settings.
    pub index: Option<IndexSpec>,
    /// Store-wide settings.
    pub store: Option<StoreSpec>,
}

impl OxistoreConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `OXISTORE_CONFIG` env var (if set),
    /// then apply `OXISTORE__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let config_path = env::var("OXISTORE_CONFIG").ok();
        let mut config = match config_path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            if !key.starts_with("OXISTORE__") {
                continue;
            }
            let path = key["OXISTORE__".len()..].to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim().to_string();

            match parts.as_slice() {
                ["queue", "max_ops"] => {
                    self.queue_mut().max_ops = Some(parse_value(&key, &value)?);
                }
                ["queue", "max_bytes"] => {
                    self.queue_mut().max_bytes = Some(parse_value(&key, &value)?);
                }
                ["journal", "capacity"] => {
                    self.journal_mut().capacity = Some(parse_value(&key, &value)?);
                }
                ["journal", "block_size"] => {
                    self.journal_mut().block_size = Some(parse_value(&key, &value)?);
                }
                ["journal", "dio"] => {
                    self.journal_mut().dio = Some(parse_value(&key, &value)?);
                }
                ["journal", "aio"] => {
                    self.journal_mut().aio = Some(parse_value(&key, &value)?);
                }
                ["journal", "max_entries_per_event"] => {
                    self.journal_mut().max_entries_per_event = Some(parse_value(&key, &value)?);
                }
                ["journal", "mode"] => {
                    self.journal_mut().mode = Some(value.to_string());
                }
                ["sync", "min_interval_ms"] => {
                    self.sync_mut().min_interval_ms = Some(parse_value(&key, &value)?);
                }
                ["sync", "max_interval_ms"] => {
                    self.sync_mut().max_interval_ms = Some(parse_value(&key, &value)?);
                }
                ["apply", "workers"] => {
                    self.apply_mut().workers = Some(parse_value(&key, &value)?);
                }
                ["apply", "warn_threshold_ms"] => {
                    self.apply_mut().warn_threshold_ms = Some(parse_value(&key, &value)?);
                }
                ["index", "split_threshold"] => {
                    self.index_mut().split_threshold = Some(parse_value(&key, &value)?);
                }
                ["index", "merge_threshold"] => {
                    self.index_mut().merge_threshold = Some(parse_value(&key, &value)?);
                }
                ["store", "fd_cache_size"] => {
                    self.store_mut().fd_cache_size = Some(parse_value(&key, &value)?);
                }
                ["store", "ephemeral_kv"] => {
                    self.store_mut().ephemeral_kv = Some(parse_value(&key, &value)?);
                }
                ["store", "tolerate_collection_exists"] => {
                    self.store_mut().tolerate_collection_exists =
                        Some(parse_value(&key, &value)?);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Build a [`StoreConfig`] using defaults plus overrides.
    pub fn to_store_config(&self) -> Result<StoreConfig, ConfigError> {
        let mut config = StoreConfig::default();
        if let Some(queue) = &self.queue {
            queue.apply_to(&mut config);
        }
        if let Some(journal) = &self.journal {
            journal.apply_to(&mut config)?;
        }
        if let Some(sync) = &self.sync {
            sync.apply_to(&mut config);
        }
        if let Some(apply) = &self.apply {
            apply.apply_to(&mut config);
        }
        if let Some(index) = &self.index {
            index.apply_to(&mut config);
        }
        if let Some(store) = &self.store {
            store.apply_to(&mut config);
        }
        Ok(config)
    }

    fn queue_mut(&mut self) -> &mut QueueSpec {
        self.queue.get_or_insert_with(QueueSpec::default)
    }

    fn journal_mut(&mut self) -> &mut JournalSpec {
        self.journal.get_or_insert_with(JournalSpec::default)
    }

    fn sync_mut(&mut self) -> &mut SyncSpec {
        self.sync.get_or_insert_with(SyncSpec::default)
    }

    fn apply_mut(&mut self) -> &mut ApplySpec {
        self.apply.get_or_insert_with(ApplySpec::default)
    }

    fn index_mut(&mut self) -> &mut IndexSpec {
        self.index.get_or_insert_with(IndexSpec::default)
    }

    fn store_mut(&mut self) -> &mut StoreSpec {
        self.store.get_or_insert_with(StoreSpec::default)
    }
}

/// Throttle overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueSpec {
    /// Maximum in-flight ops.
    pub max_ops: Option<u64>,
    /// Maximum in-flight bytes.
    pub max_bytes: Option<u64>,
}

impl QueueSpec {
    fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.max_ops {
            config.queue_max_ops = value.max(1);
        }
        if let Some(value) = self.max_bytes {
            config.queue_max_bytes = value.max(1);
        }
    }
}

/// Journal overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalSpec {
    /// Ring capacity in bytes.
    pub capacity: Option<u64>,
    /// Block size in bytes.
    pub block_size: Option<u32>,
    /// `O_DIRECT` writes.
    pub dio: Option<bool>,
    /// Asynchronous completion.
    pub aio: Option<bool>,
    /// Most entries per write-and-sync event.
    pub max_entries_per_event: Option<usize>,
    /// Mode: "writeahead", "parallel" or "trailing".
    pub mode: Option<String>,
}

impl JournalSpec {
    fn apply_to(&self, config: &mut StoreConfig) -> Result<(), ConfigError> {
        if let Some(value) = self.capacity {
            config.journal_capacity = value;
        }
        if let Some(value) = self.block_size {
            config.journal_block_size = value;
        }
        if let Some(value) = self.dio {
            config.journal_dio = value;
        }
        if let Some(value) = self.aio {
            config.journal_aio = value;
        }
        if let Some(value) = self.max_entries_per_event {
            config.journal_max_entries_per_event = value.max(1);
        }
        if let Some(mode) = &self.mode {
            config.journal_mode = match mode.to_ascii_lowercase().as_str() {
                "writeahead" => JournalMode::Writeahead,
                "parallel" => JournalMode::Parallel,
                "trailing" => JournalMode::Trailing,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "journal.mode".into(),
                        value: other.into(),
                    })
                }
            };
        }
        Ok(())
    }
}

/// Commit-cycle cadence overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncSpec {
    /// Shortest pause in milliseconds.
    pub min_interval_ms: Option<u64>,
    /// Longest pause in milliseconds.
    pub max_interval_ms: Option<u64>,
}

impl SyncSpec {
    fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.min_interval_ms {
            config.min_sync_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.max_interval_ms {
            config.max_sync_interval = Duration::from_millis(value.max(1));
        }
    }
}

/// Apply worker overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplySpec {
    /// Worker thread count.
    pub workers: Option<usize>,
    /// Slow-op threshold in milliseconds.
    pub warn_threshold_ms: Option<u64>,
}

impl ApplySpec {
    fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.workers {
            config.apply_workers = value.max(1);
        }
        if let Some(value) = self.warn_threshold_ms {
            config.apply_warn_threshold = Duration::from_millis(value.max(1));
        }
    }
}

/// Directory index overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IndexSpec {
    /// Files per directory before splitting.
    pub split_threshold: Option<usize>,
    /// Files per nibble directory before merging.
    pub merge_threshold: Option<usize>,
}

impl IndexSpec {
    fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.split_threshold {
            config.index_split_threshold = value.max(2);
        }
        if let Some(value) = self.merge_threshold {
            config.index_merge_threshold = value;
        }
    }
}

/// Store-wide overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSpec {
    /// Open-file cache capacity.
    pub fd_cache_size: Option<usize>,
    /// Use the in-memory KV backend.
    pub ephemeral_kv: Option<bool>,
    /// Tolerate create-collection races.
    pub tolerate_collection_exists: Option<bool>,
}

impl StoreSpec {
    fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.fd_cache_size {
            config.fd_cache_size = value.max(1);
        }
        if let Some(value) = self.ephemeral_kv {
            config.ephemeral_kv = value;
        }
        if let Some(value) = self.tolerate_collection_exists {
            config.tolerate_collection_exists = value;
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.journal_mode, JournalMode::Writeahead);
        assert!(config.queue_max_ops > 0);
        assert!(config.min_sync_interval < config.max_sync_interval);
    }

    #[test]
    fn test_toml_sections() {
        let parsed: OxistoreConfig = toml::from_str(
            r#"
            [queue]
            max_ops = 64

            [journal]
            capacity = 8388608
            mode = "parallel"

            [apply]
            workers = 4
            "#,
        )
        .unwrap();
        let config = parsed.to_store_config().unwrap();
        assert_eq!(config.queue_max_ops, 64);
        assert_eq!(config.journal_capacity, 8 << 20);
        assert_eq!(config.journal_mode, JournalMode::Parallel);
        assert_eq!(config.apply_workers, 4);
    }

    #[test]
    fn test_bad_mode_rejected() {
        let parsed: OxistoreConfig = toml::from_str(
            r#"
            [journal]
            mode = "sideways"
            "#,
        )
        .unwrap();
        assert!(parsed.to_store_config().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("OXISTORE__queue__max_ops", "7");
        env::set_var("OXISTORE__journal__dio", "true");

        let mut config = OxistoreConfig::default();
        config.apply_env_overrides().unwrap();

        env::remove_var("OXISTORE__queue__max_ops");
        env::remove_var("OXISTORE__journal__dio");

        assert_eq!(config.queue.unwrap().max_ops, Some(7));
        assert_eq!(config.journal.unwrap().dio, Some(true));
    }

    #[test]
    fn test_unknown_env_key_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("OXISTORE__journal__wheels", "4");
        let mut config = OxistoreConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("OXISTORE__journal__wheels");
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn test_journal_config_io_mode() {
        let mut config = StoreConfig::default();
        assert_eq!(config.journal_config().io_mode, JournalIoMode::Buffered);
        config.journal_dio = true;
        assert_eq!(config.journal_config().io_mode, JournalIoMode::Direct);
        config.journal_aio = true;
        assert_eq!(config.journal_config().io_mode, JournalIoMode::DirectAio);
    }

    #[test]
    fn test_tunable_cell_swap() {
        let cell = TunableCell::new(StoreConfig::default().tunables());
        let before = cell.load().apply_warn_threshold;
        cell.store(Tunables {
            min_sync_interval: Duration::from_millis(1),
            max_sync_interval: Duration::from_millis(2),
            apply_warn_threshold: Duration::from_millis(3),
        });
        assert_ne!(cell.load().apply_warn_threshold, before);
        assert_eq!(cell.load().apply_warn_threshold, Duration::from_millis(3));
    }
}
