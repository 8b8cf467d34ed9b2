use serde::Serialize;

use crate::storage::StoreError;

/// A proposed snapshot that cannot be reconciled. Raised before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Bucket {bucket_id} appears more than once")]
    DuplicateBucket { bucket_id: String },

    #[error("Item {item_id} appears more than once")]
    DuplicateItem { item_id: String },

    #[error("Bucket {bucket_id} holds order {order} more than once")]
    DuplicateOrder { bucket_id: String, order: u32 },

    #[error("Unknown bucket: {bucket_id}")]
    UnknownBucket { bucket_id: String },

    #[error("Unknown item: {item_id}")]
    UnknownItem { item_id: String },

    #[error("Item {item_id} is on the board but missing from the proposal")]
    OmittedItem { item_id: String },

    #[error("Snapshot belongs to board {actual}, expected {expected}")]
    BoardMismatch { expected: String, actual: String },

    #[error("Invariant violated: {0}")]
    InvariantViolated(String),
}

/// Why a batch no longer matches the authoritative snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StaleReason {
    /// The session has no installed snapshot to check against.
    NotLoaded,
    /// An item referenced by the batch no longer exists.
    #[serde(rename_all = "camelCase")]
    ItemMissing { item_id: String },
    /// The proposal leaves out an item the cached snapshot still lists.
    #[serde(rename_all = "camelCase")]
    ItemOmitted { item_id: String },
    /// An item is no longer where the batch expects it.
    #[serde(rename_all = "camelCase")]
    ItemMoved {
        item_id: String,
        expected_bucket_id: String,
        expected_order: u32,
        actual_bucket_id: String,
        actual_order: u32,
    },
    /// The board changed since the caller's base snapshot.
    #[serde(rename_all = "camelCase")]
    BoardChanged {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::NotLoaded => write!(f, "no snapshot loaded"),
            StaleReason::ItemMissing { item_id } => write!(f, "item {} no longer exists", item_id),
            StaleReason::ItemOmitted { item_id } => {
                write!(f, "proposal leaves out item {}", item_id)
            }
            StaleReason::ItemMoved {
                item_id,
                expected_bucket_id,
                expected_order,
                actual_bucket_id,
                actual_order,
            } => write!(
                f,
                "item {} expected at {}#{} but found at {}#{}",
                item_id, expected_bucket_id, expected_order, actual_bucket_id, actual_order
            ),
            StaleReason::BoardChanged { .. } => write!(f, "board changed since base snapshot"),
        }
    }
}

/// Typed outcome of a failed reorder. Nothing else crosses the engine boundary.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Board {board_id} is busy with another write")]
    Busy { board_id: String },

    #[error("Board {board_id} is stale: {reason}")]
    Stale { board_id: String, reason: StaleReason },

    #[error("Transient storage failure on board {board_id}: {source}")]
    TransientStorage {
        board_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Permanent storage failure on board {board_id}: {source}")]
    PermanentStorage {
        board_id: String,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Classify a store failure by its transient/permanent nature.
    pub fn from_store(board_id: &str, source: StoreError) -> Self {
        if source.is_transient() {
            ReconcileError::TransientStorage {
                board_id: board_id.to_string(),
                source,
            }
        } else {
            ReconcileError::PermanentStorage {
                board_id: board_id.to_string(),
                source,
            }
        }
    }

    /// Whether resubmitting the same request unchanged can succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ReconcileError::Busy { .. } | ReconcileError::TransientStorage { .. }
        )
    }

    /// Short machine-readable name, used in API payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::Validation(_) => "validation",
            ReconcileError::Busy { .. } => "busy",
            ReconcileError::Stale { .. } => "stale",
            ReconcileError::TransientStorage { .. } => "transientStorage",
            ReconcileError::PermanentStorage { .. } => "permanentStorage",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_classified() {
        let transient = ReconcileError::from_store("b1", StoreError::Timeout);
        assert!(matches!(transient, ReconcileError::TransientStorage { .. }));
        assert!(transient.is_retriable());

        let permanent = ReconcileError::from_store(
            "b1",
            StoreError::UnknownItem {
                item_id: "x".to_string(),
            },
        );
        assert!(matches!(permanent, ReconcileError::PermanentStorage { .. }));
        assert!(!permanent.is_retriable());
    }

    #[test]
    fn test_stale_is_not_retriable_as_is() {
        let err = ReconcileError::Stale {
            board_id: "b1".to_string(),
            reason: StaleReason::NotLoaded,
        };
        assert!(!err.is_retriable());
        assert_eq!(err.kind(), "stale");
        assert_eq!(err.to_string(), "Board b1 is stale: no snapshot loaded");
    }
}
