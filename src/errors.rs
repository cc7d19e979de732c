use crate::storage::OriginId;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Quota of {quota} bytes exceeded for origin {origin}")]
    QuotaExceeded { origin: OriginId, quota: usize },

    #[error("Origin cannot have storage: {0}")]
    InvalidOrigin(String),

    #[error("Cannot start storage worker: {0}")]
    QueueSpawn(#[source] std::io::Error),
}
