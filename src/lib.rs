pub mod config;
pub mod errors;
pub mod queue;
pub mod storage;

pub use config::StorageConfig;
pub use errors::StorageError;
pub use storage::StorageCoordinator;
