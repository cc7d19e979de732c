use std::path::PathBuf;
use std::time::Duration;

/// Default per-origin quota: 5 MiB.
pub const DEFAULT_QUOTA: usize = 5 * 1024 * 1024;
/// Delay between the first buffered change and the write to disk.
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_secs(1);
/// Maximum number of buffered changes written by one flush task.
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 100;

const DEFAULT_QUEUE_NAME: &str = "org.gosub.storage";

/// Configuration of a [`StorageCoordinator`](crate::storage::StorageCoordinator).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding one database per origin plus the tracker. `None` keeps
    /// local storage in memory until a directory is set.
    pub local_storage_directory: Option<PathBuf>,
    /// Quota in bytes for every local storage area
    pub local_storage_quota: usize,
    /// Default quota in bytes for session namespaces created without one
    pub session_storage_quota: usize,
    /// Debounce interval for durable writes
    pub flush_delay: Duration,
    /// How many buffered changes a single flush writes before yielding
    pub flush_batch_size: usize,
    /// Name of the worker thread
    pub queue_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_storage_directory: None,
            local_storage_quota: DEFAULT_QUOTA,
            session_storage_quota: DEFAULT_QUOTA,
            flush_delay: DEFAULT_FLUSH_DELAY,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
        }
    }
}

impl StorageConfig {
    /// Default configuration persisting local storage under `dir`.
    pub fn with_directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            local_storage_directory: Some(dir.into()),
            ..Self::default()
        }
    }
}
