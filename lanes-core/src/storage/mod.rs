pub mod local;
pub mod memory;

use async_trait::async_trait;

use crate::types::{Bucket, Item, PositionUpdate};

/// Persistent task store backing the engine.
/// Implementations: JsonFileStore (filesystem), MemoryStore (tests, demos).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Buckets of a board in display order.
    async fn list_buckets(&self, board_id: &str) -> Result<Vec<Bucket>, StoreError>;

    /// Every task of a board with its persisted bucket and order.
    async fn list_tasks(&self, board_id: &str) -> Result<Vec<Item>, StoreError>;

    /// Write new positions for a set of tasks.
    /// All-or-nothing: on `Err` no row has been written.
    async fn bulk_update(
        &self,
        board_id: &str,
        updates: &[PositionUpdate],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Board not found: {0}")]
    BoardNotFound(String),

    #[error("Unknown item: {item_id}")]
    UnknownItem { item_id: String },

    #[error("Unknown bucket: {bucket_id}")]
    UnknownBucket { bucket_id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store did not answer in time")]
    Timeout,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt board data: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Transient failures may succeed when the same call is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout | StoreError::Io(_)
        )
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
