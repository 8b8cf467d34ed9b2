/// Local filesystem task store.
///
/// One JSON document per board (`<board_id>.json`) in a data directory, with:
/// - Validate-then-write bulk updates (all rows or none)
/// - Atomic writes (write to .tmp, fsync, rename)
/// - Mutex-guarded writes per board to prevent concurrent modification

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{StoreError, TaskStore};
use crate::types::{Bucket, Item, PositionUpdate};

const BOARD_EXTENSION: &str = "json";

/// On-disk shape of a board file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardDocument {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub buckets: Vec<Bucket>,
    #[serde(default)]
    pub tasks: Vec<Item>,
}

pub struct JsonFileStore {
    root: PathBuf,
    /// Per-board write mutex
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JsonFileStore {
    /// Open (and create if needed) a data directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Board ids are file stems; only `[A-Za-z0-9_-]` is accepted so an id
    /// can never escape the data directory.
    pub fn is_valid_board_id(board_id: &str) -> bool {
        !board_id.is_empty()
            && board_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    fn board_path(&self, board_id: &str) -> Result<PathBuf, StoreError> {
        if !Self::is_valid_board_id(board_id) {
            return Err(StoreError::BoardNotFound(board_id.to_string()));
        }
        Ok(self.root.join(format!("{}.{}", board_id, BOARD_EXTENSION)))
    }

    /// Ids of every board document in the data directory, sorted.
    pub async fn list_boards(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BOARD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if Self::is_valid_board_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Create or overwrite a board document.
    pub async fn save_board(&self, board_id: &str, doc: &BoardDocument) -> Result<(), StoreError> {
        let path = self.board_path(board_id)?;
        let lock = self.get_write_lock(board_id);
        let _guard = lock.lock().await;
        Self::write_document(path, doc).await
    }

    pub async fn read_board(&self, board_id: &str) -> Result<BoardDocument, StoreError> {
        let path = self.board_path(board_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::BoardNotFound(board_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
    }

    /// Get a write lock for a specific board.
    fn get_write_lock(&self, board_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(board_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn write_document(path: PathBuf, doc: &BoardDocument) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        tokio::task::spawn_blocking(move || Self::atomic_write(&path, &content))
            .await
            .map_err(|e| StoreError::Unavailable(format!("write task failed: {}", e)))??;
        Ok(())
    }

    /// Atomic write with fsync: write to .tmp, fsync, rename, fsync directory.
    fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
        let tmp_path = path.with_extension("lanes.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        // fsync directory for rename durability
        if let Some(dir) = path.parent() {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonFileStore {
    async fn list_buckets(&self, board_id: &str) -> Result<Vec<Bucket>, StoreError> {
        Ok(self.read_board(board_id).await?.buckets)
    }

    async fn list_tasks(&self, board_id: &str) -> Result<Vec<Item>, StoreError> {
        Ok(self.read_board(board_id).await?.tasks)
    }

    async fn bulk_update(
        &self,
        board_id: &str,
        updates: &[PositionUpdate],
    ) -> Result<(), StoreError> {
        let path = self.board_path(board_id)?;
        let lock = self.get_write_lock(board_id);
        let _guard = lock.lock().await;

        // Read fresh from disk
        let mut doc = self.read_board(board_id).await?;

        let known_buckets: HashSet<&str> = doc.buckets.iter().map(|b| b.id.as_str()).collect();
        let index: HashMap<&str, usize> = doc
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.as_str(), i))
            .collect();

        // Validate every row before changing anything.
        let mut targets = Vec::with_capacity(updates.len());
        for update in updates {
            if !known_buckets.contains(update.bucket_id.as_str()) {
                return Err(StoreError::UnknownBucket {
                    bucket_id: update.bucket_id.clone(),
                });
            }
            let i = *index
                .get(update.id.as_str())
                .ok_or_else(|| StoreError::UnknownItem {
                    item_id: update.id.clone(),
                })?;
            targets.push(i);
        }

        for (i, update) in targets.into_iter().zip(updates) {
            doc.tasks[i].bucket_id = update.bucket_id.clone();
            doc.tasks[i].order = update.order;
        }

        Self::write_document(path, &doc).await?;
        log::debug!(
            target: "lanes.storage",
            "Board {}: wrote {} position updates",
            board_id,
            updates.len()
        );
        Ok(())
    }
}
