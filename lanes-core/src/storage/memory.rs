/// In-memory task store.
///
/// Used by tests and demos. Besides the plain store contract it can:
/// - inject failures into the next fetch or bulk update
/// - fail a bulk update part-way through (the partial work is discarded)
/// - hold calls at a gate so concurrent scenarios can be staged
/// - count calls
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use super::{StoreError, TaskStore};
use crate::types::{Bucket, Item, PositionUpdate};

#[derive(Debug, Clone, Default)]
struct MemoryBoard {
    buckets: Vec<Bucket>,
    tasks: Vec<Item>,
}

enum UpdateFailure {
    /// Fail before touching any row.
    Immediate(StoreError),
    /// Apply `after` rows to a scratch copy, then fail.
    MidBatch { after: usize, error: StoreError },
}

/// Holds calls until released. A closed semaphore lets every waiter through.
struct Gate {
    release: Mutex<Option<Arc<Semaphore>>>,
    entered: Notify,
}

impl Gate {
    fn new() -> Self {
        Self {
            release: Mutex::new(None),
            entered: Notify::new(),
        }
    }

    fn close(&self) {
        let mut release = self.release.lock().unwrap_or_else(|e| e.into_inner());
        *release = Some(Arc::new(Semaphore::new(0)));
    }

    fn open(&self) {
        let released = self
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(semaphore) = released {
            semaphore.close();
        }
    }

    async fn pass(&self) {
        self.entered.notify_one();
        let semaphore = self
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(semaphore) = semaphore {
            // Closed means released.
            let _ = semaphore.acquire().await;
        }
    }
}

pub struct MemoryStore {
    boards: RwLock<HashMap<String, MemoryBoard>>,
    update_failures: Mutex<VecDeque<UpdateFailure>>,
    fetch_failures: Mutex<VecDeque<StoreError>>,
    update_gate: Gate,
    fetch_gate: Gate,
    fetch_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            update_failures: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            update_gate: Gate::new(),
            fetch_gate: Gate::new(),
            fetch_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Add or replace a board. Tasks keep the bucket and order they carry.
    pub fn insert_board(&self, board_id: &str, buckets: Vec<Bucket>, tasks: Vec<Item>) {
        self.boards
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(board_id.to_string(), MemoryBoard { buckets, tasks });
    }

    /// Persisted rows of a board, for assertions.
    pub fn tasks(&self, board_id: &str) -> Vec<Item> {
        self.boards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(board_id)
            .map(|b| b.tasks.clone())
            .unwrap_or_default()
    }

    /// Persisted `(bucket, order)` of one task.
    pub fn position_of(&self, board_id: &str, item_id: &str) -> Option<(String, u32)> {
        self.tasks(board_id)
            .into_iter()
            .find(|t| t.id == item_id)
            .map(|t| (t.bucket_id, t.order))
    }

    /// Change a task behind the engine's back, as another process would.
    pub fn move_out_of_band(&self, board_id: &str, item_id: &str, bucket_id: &str, order: u32) {
        let mut boards = self.boards.write().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = boards
            .get_mut(board_id)
            .and_then(|b| b.tasks.iter_mut().find(|t| t.id == item_id))
        {
            task.bucket_id = bucket_id.to_string();
            task.order = order;
        }
    }

    pub fn remove_out_of_band(&self, board_id: &str, item_id: &str) {
        let mut boards = self.boards.write().unwrap_or_else(|e| e.into_inner());
        if let Some(board) = boards.get_mut(board_id) {
            board.tasks.retain(|t| t.id != item_id);
        }
    }

    pub fn fail_next_update(&self, error: StoreError) {
        self.update_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(UpdateFailure::Immediate(error));
    }

    /// Fail the next bulk update after `after` rows were applied to scratch state.
    pub fn fail_next_update_after(&self, after: usize, error: StoreError) {
        self.update_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(UpdateFailure::MidBatch { after, error });
    }

    pub fn fail_next_fetch(&self, error: StoreError) {
        self.fetch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Hold every bulk update until `resume_updates`.
    pub fn pause_updates(&self) {
        self.update_gate.close();
    }

    pub fn resume_updates(&self) {
        self.update_gate.open();
    }

    /// Resolves once a bulk update has reached the gate.
    pub async fn update_started(&self) {
        self.update_gate.entered.notified().await;
    }

    /// Hold every task listing until `resume_fetches`.
    pub fn pause_fetches(&self) {
        self.fetch_gate.close();
    }

    pub fn resume_fetches(&self) {
        self.fetch_gate.open();
    }

    /// Resolves once a task listing has reached the gate.
    pub async fn fetch_started(&self) {
        self.fetch_gate.entered.notified().await;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn board(&self, board_id: &str) -> Result<MemoryBoard, StoreError> {
        self.boards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(board_id)
            .cloned()
            .ok_or_else(|| StoreError::BoardNotFound(board_id.to_string()))
    }
}

/// Apply updates to `tasks`, stopping with `stop_with` after `stop_after` rows.
fn apply_rows(
    tasks: &mut [Item],
    buckets: &[Bucket],
    updates: &[PositionUpdate],
    stop_after: Option<(usize, StoreError)>,
) -> Result<(), StoreError> {
    let known_buckets: HashSet<&str> = buckets.iter().map(|b| b.id.as_str()).collect();
    let index: HashMap<String, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.clone(), i))
        .collect();

    for (applied, update) in updates.iter().enumerate() {
        if let Some((after, error)) = &stop_after {
            if applied == *after {
                return Err(error.clone());
            }
        }
        if !known_buckets.contains(update.bucket_id.as_str()) {
            return Err(StoreError::UnknownBucket {
                bucket_id: update.bucket_id.clone(),
            });
        }
        let i = *index.get(&update.id).ok_or_else(|| StoreError::UnknownItem {
            item_id: update.id.clone(),
        })?;
        tasks[i].bucket_id = update.bucket_id.clone();
        tasks[i].order = update.order;
    }
    match stop_after {
        Some((_, error)) => Err(error),
        None => Ok(()),
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn list_buckets(&self, board_id: &str) -> Result<Vec<Bucket>, StoreError> {
        Ok(self.board(board_id)?.buckets)
    }

    async fn list_tasks(&self, board_id: &str) -> Result<Vec<Item>, StoreError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_gate.pass().await;
        let injected = self
            .fetch_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = injected {
            return Err(error);
        }
        Ok(self.board(board_id)?.tasks)
    }

    async fn bulk_update(
        &self,
        board_id: &str,
        updates: &[PositionUpdate],
    ) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.update_gate.pass().await;

        let failure = self
            .update_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let stop_after = match failure {
            Some(UpdateFailure::Immediate(error)) => return Err(error),
            Some(UpdateFailure::MidBatch { after, error }) => Some((after, error)),
            None => None,
        };

        let mut boards = self.boards.write().unwrap_or_else(|e| e.into_inner());
        let board = boards
            .get_mut(board_id)
            .ok_or_else(|| StoreError::BoardNotFound(board_id.to_string()))?;

        // Work on a scratch copy so a failure leaves no partial rows behind.
        let mut scratch = board.tasks.clone();
        apply_rows(&mut scratch, &board.buckets, updates, stop_after)?;
        board.tasks = scratch;
        Ok(())
    }
}
