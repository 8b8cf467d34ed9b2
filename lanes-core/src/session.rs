/// Per-board cache of the last known-good snapshot.
///
/// State machine:
///   Empty --fetch--> Ready(s)
///   Ready(s) --commit--> Ready(s')
///   Ready(s) --failed write / external refresh--> Stale
///   Stale --fetch--> Ready(s)
///
/// Reads in `Ready` never touch the store. Reads in `Empty` or `Stale` fetch,
/// with at most one fetch in flight per board; callers that queued behind a
/// fetch share its outcome unless a write or an invalidation came after that
/// fetch started. Snapshots are swapped whole behind an `Arc`, so a
/// reader always sees either the old or the new snapshot.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::storage::{StoreError, TaskStore};
use crate::types::BoardSnapshot;

#[derive(Debug, Clone)]
pub enum SessionState {
    Empty,
    Ready(Arc<BoardSnapshot>),
    /// Keeps the last snapshot for diagnostics; it is never served.
    Stale(Option<Arc<BoardSnapshot>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Empty,
    Ready,
    Stale,
}

/// Outcome of the most recent fetch, shared with callers that waited on it.
#[derive(Default)]
struct FetchRecord {
    epoch: u64,
    /// Session generation when the fetch started.
    generation: u64,
    outcome: Option<Result<Arc<BoardSnapshot>, StoreError>>,
}

pub struct BoardSession {
    board_id: String,
    store: Arc<dyn TaskStore>,
    fetch_timeout: Duration,
    state: RwLock<SessionState>,
    fetch_gate: tokio::sync::Mutex<FetchRecord>,
    fetch_epoch: AtomicU64,
    next_version: AtomicU64,
    /// Bumped whenever a write finishes, successful or not.
    write_epoch: AtomicU64,
    writes_in_flight: AtomicUsize,
    /// Bumped by every finished write and every invalidation.
    generation: AtomicU64,
}

/// Marks a write in flight for as long as it lives.
pub struct WriteTicket<'a> {
    session: &'a BoardSession,
}

impl Drop for WriteTicket<'_> {
    fn drop(&mut self) {
        self.session.write_epoch.fetch_add(1, Ordering::SeqCst);
        self.session.generation.fetch_add(1, Ordering::SeqCst);
        self.session.writes_in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BoardSession {
    pub fn new(board_id: impl Into<String>, store: Arc<dyn TaskStore>, fetch_timeout: Duration) -> Self {
        Self {
            board_id: board_id.into(),
            store,
            fetch_timeout,
            state: RwLock::new(SessionState::Empty),
            fetch_gate: tokio::sync::Mutex::new(FetchRecord::default()),
            fetch_epoch: AtomicU64::new(0),
            next_version: AtomicU64::new(1),
            write_epoch: AtomicU64::new(0),
            writes_in_flight: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn state(&self) -> SessionState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn status(&self) -> SessionStatus {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            SessionState::Empty => SessionStatus::Empty,
            SessionState::Ready(_) => SessionStatus::Ready,
            SessionState::Stale(_) => SessionStatus::Stale,
        }
    }

    /// The installed snapshot, if the session is `Ready`. Never does I/O.
    pub fn current(&self) -> Option<Arc<BoardSnapshot>> {
        match &*self.state.read().unwrap_or_else(|e| e.into_inner()) {
            SessionState::Ready(snapshot) => Some(snapshot.clone()),
            _ => None,
        }
    }

    /// Serve the cached snapshot, or fetch one if the session is `Empty` or `Stale`.
    pub async fn snapshot(&self) -> Result<Arc<BoardSnapshot>, StoreError> {
        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }

        let seen = self.fetch_epoch.load(Ordering::SeqCst);
        let mut record = self.fetch_gate.lock().await;

        if let Some(snapshot) = self.current() {
            return Ok(snapshot);
        }
        if let Some(outcome) = self.shared_outcome(&record, seen) {
            return outcome;
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let outcome = self.fetch().await;
        record.epoch += 1;
        record.generation = generation;
        record.outcome = Some(outcome.clone());
        self.fetch_epoch.store(record.epoch, Ordering::SeqCst);
        outcome
    }

    /// Outcome of a fetch that finished while the caller queued for the gate,
    /// unless a write or an invalidation happened since that fetch started.
    fn shared_outcome(
        &self,
        record: &FetchRecord,
        seen: u64,
    ) -> Option<Result<Arc<BoardSnapshot>, StoreError>> {
        if record.epoch == seen
            || record.generation != self.generation.load(Ordering::SeqCst)
            || self.writes_in_flight.load(Ordering::SeqCst) > 0
        {
            return None;
        }
        record.outcome.clone()
    }

    async fn fetch(&self) -> Result<Arc<BoardSnapshot>, StoreError> {
        let epoch_before = self.write_epoch.load(Ordering::SeqCst);
        let idle_before = self.writes_in_flight.load(Ordering::SeqCst) == 0;

        let load = async {
            let buckets = self.store.list_buckets(&self.board_id).await?;
            let tasks = self.store.list_tasks(&self.board_id).await?;
            Ok::<_, StoreError>((buckets, tasks))
        };
        let (buckets, tasks) = match tokio::time::timeout(self.fetch_timeout, load).await {
            Ok(rows) => rows?,
            Err(_) => {
                log::warn!(
                    target: "lanes.session",
                    "Board {}: fetch exceeded {:?}",
                    self.board_id,
                    self.fetch_timeout
                );
                return Err(StoreError::Timeout);
            }
        };

        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot =
            Arc::new(BoardSnapshot::from_store(&self.board_id, buckets, tasks).with_version(version));

        // A write that overlapped this fetch may have committed after the
        // store was read; installing would roll the cache back.
        let undisturbed = idle_before
            && self.writes_in_flight.load(Ordering::SeqCst) == 0
            && self.write_epoch.load(Ordering::SeqCst) == epoch_before;
        if undisturbed {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if !matches!(*state, SessionState::Ready(_)) {
                *state = SessionState::Ready(snapshot.clone());
            }
            log::info!(
                target: "lanes.session",
                "Board {}: loaded version {} ({} items)",
                self.board_id,
                version,
                snapshot.item_count()
            );
        } else {
            log::debug!(
                target: "lanes.session",
                "Board {}: fetch overlapped a write, not installing version {}",
                self.board_id,
                version
            );
        }
        Ok(snapshot)
    }

    /// Mark the cache stale; the next read refetches.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let SessionState::Ready(snapshot) = &*state {
            log::info!(
                target: "lanes.session",
                "Board {}: invalidated version {}",
                self.board_id,
                snapshot.version
            );
            *state = SessionState::Stale(Some(snapshot.clone()));
        }
    }

    /// Register a write in flight. Fetches that overlap it will not install.
    pub fn begin_write(&self) -> WriteTicket<'_> {
        self.writes_in_flight.fetch_add(1, Ordering::SeqCst);
        WriteTicket { session: self }
    }

    /// Install a snapshot the store just confirmed, replacing the snapshot
    /// with `expected_version`. If the session moved on meanwhile (for example
    /// an external refresh), the cache is left alone and will refetch.
    pub fn install_committed(&self, expected_version: u64, result: BoardSnapshot) -> Arc<BoardSnapshot> {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(result.with_version(version));
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match &*state {
            SessionState::Ready(current) if current.version == expected_version => {
                *state = SessionState::Ready(snapshot.clone());
            }
            _ => {
                log::debug!(
                    target: "lanes.session",
                    "Board {}: session changed during commit, leaving cache for refetch",
                    self.board_id
                );
                if let SessionState::Ready(current) = &*state {
                    *state = SessionState::Stale(Some(current.clone()));
                }
            }
        }
        snapshot
    }
}

/// Sessions keyed by board id, created on first use.
pub struct SessionRegistry {
    store: Arc<dyn TaskStore>,
    fetch_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<BoardSession>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn TaskStore>, fetch_timeout: Duration) -> Self {
        Self {
            store,
            fetch_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, board_id: &str) -> Arc<BoardSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(board_id.to_string())
            .or_insert_with(|| {
                Arc::new(BoardSession::new(board_id, self.store.clone(), self.fetch_timeout))
            })
            .clone()
    }

    pub fn peek(&self, board_id: &str) -> Option<Arc<BoardSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(board_id)
            .cloned()
    }

    /// Drop a session, e.g. for a board the store does not know.
    pub fn forget(&self, board_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(board_id);
    }
}
