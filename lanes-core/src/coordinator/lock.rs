/// Per-board exclusive write locks.
///
/// One async mutex per board id, created on first use. Holding the guard is
/// what makes a caller the single writer of that board; boards never contend
/// with each other.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

/// What a writer does when the board is already locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Return `Busy` immediately.
    FailFast,
    /// Wait at most this long, then return `Busy`.
    WaitUpTo(Duration),
}

impl LockPolicy {
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            LockPolicy::FailFast
        } else {
            LockPolicy::WaitUpTo(Duration::from_millis(ms))
        }
    }
}

/// Guard proving exclusive write access to one board.
pub type BoardWriteGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct BoardLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BoardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the write lock for a specific board.
    fn get_write_lock(&self, board_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(board_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Acquire a board's lock under `policy`. `None` means the board stayed busy.
    pub async fn acquire(&self, board_id: &str, policy: LockPolicy) -> Option<BoardWriteGuard> {
        let lock = self.get_write_lock(board_id);
        match policy {
            LockPolicy::FailFast => lock.try_lock_owned().ok(),
            LockPolicy::WaitUpTo(wait) => tokio::time::timeout(wait, lock.lock_owned()).await.ok(),
        }
    }

    pub fn is_locked(&self, board_id: &str) -> bool {
        self.get_write_lock(board_id).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_fast_when_held() {
        let locks = BoardLocks::new();
        let guard = locks.acquire("b1", LockPolicy::FailFast).await;
        assert!(guard.is_some());
        assert!(locks.is_locked("b1"));
        assert!(locks.acquire("b1", LockPolicy::FailFast).await.is_none());
        drop(guard);
        assert!(locks.acquire("b1", LockPolicy::FailFast).await.is_some());
    }

    #[tokio::test]
    async fn test_boards_are_independent() {
        let locks = BoardLocks::new();
        let _a = locks.acquire("a", LockPolicy::FailFast).await.unwrap();
        assert!(locks.acquire("b", LockPolicy::FailFast).await.is_some());
    }

    #[tokio::test]
    async fn test_bounded_wait_gives_up() {
        let locks = BoardLocks::new();
        let _held = locks.acquire("b1", LockPolicy::FailFast).await.unwrap();
        let waited = locks
            .acquire("b1", LockPolicy::WaitUpTo(Duration::from_millis(20)))
            .await;
        assert!(waited.is_none());
    }

    #[tokio::test]
    async fn test_bounded_wait_gets_released_lock() {
        let locks = Arc::new(BoardLocks::new());
        let held = locks.acquire("b1", LockPolicy::FailFast).await.unwrap();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire("b1", LockPolicy::WaitUpTo(Duration::from_secs(5)))
                    .await
                    .is_some()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }
}
