use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::lock::{BoardLocks, LockPolicy};
use crate::audit::{AuditEvent, AuditSink};
use crate::error::{ReconcileError, StaleReason, ValidationError};
use crate::order::{CapacityWarning, MutationBatch};
use crate::session::BoardSession;
use crate::storage::{StoreError, TaskStore};
use crate::types::{BoardSnapshot, MutationRecord};

/// Outcome of a committed (or no-op) batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedBatch {
    pub board_id: String,
    pub snapshot: Arc<BoardSnapshot>,
    pub mutations: Vec<MutationRecord>,
    pub warnings: Vec<CapacityWarning>,
    pub audit_events: usize,
}

impl AppliedBatch {
    /// Nothing to persist; the current snapshot already matches.
    pub fn unchanged(board_id: impl Into<String>, snapshot: Arc<BoardSnapshot>) -> Self {
        Self {
            board_id: board_id.into(),
            snapshot,
            mutations: Vec::new(),
            warnings: Vec::new(),
            audit_events: 0,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Serializes writes per board and persists batches all-or-nothing.
pub struct WriteCoordinator {
    store: Arc<dyn TaskStore>,
    audit: Arc<dyn AuditSink>,
    locks: BoardLocks,
    persist_timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(store: Arc<dyn TaskStore>, audit: Arc<dyn AuditSink>, persist_timeout: Duration) -> Self {
        Self {
            store,
            audit,
            locks: BoardLocks::new(),
            persist_timeout,
        }
    }

    pub fn is_busy(&self, board_id: &str) -> bool {
        self.locks.is_locked(board_id)
    }

    /// Persist `batch` against `session`.
    ///
    /// Under the board's write lock the batch is checked against the session's
    /// current snapshot, sent to the store as one bulk update and, once the
    /// store confirms, installed and audited. On a store failure the session is
    /// invalidated so the next read refetches.
    pub async fn apply(
        &self,
        session: &BoardSession,
        batch: MutationBatch,
        actor: &str,
        policy: LockPolicy,
    ) -> Result<AppliedBatch, ReconcileError> {
        let board_id = session.board_id().to_string();
        if batch.board_id != board_id {
            return Err(ValidationError::BoardMismatch {
                expected: board_id,
                actual: batch.board_id,
            }
            .into());
        }

        let _guard = match self.locks.acquire(&board_id, policy).await {
            Some(guard) => guard,
            None => {
                log::info!(
                    target: "lanes.coordinator",
                    "Board {}: write rejected, another batch holds the lock",
                    board_id
                );
                return Err(ReconcileError::Busy { board_id });
            }
        };

        let current = session.current().ok_or_else(|| ReconcileError::Stale {
            board_id: board_id.clone(),
            reason: StaleReason::NotLoaded,
        })?;
        check_preconditions(&current, &batch).map_err(|reason| {
            log::info!(
                target: "lanes.coordinator",
                "Board {}: batch from version {} is stale ({})",
                board_id,
                batch.base_version,
                reason
            );
            ReconcileError::Stale {
                board_id: board_id.clone(),
                reason,
            }
        })?;

        if batch.is_empty() {
            return Ok(AppliedBatch::unchanged(board_id, current));
        }

        let updates = batch.updates();
        let outcome = {
            let _ticket = session.begin_write();
            match tokio::time::timeout(
                self.persist_timeout,
                self.store.bulk_update(&board_id, &updates),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout),
            }
        };

        if let Err(e) = outcome {
            session.invalidate();
            log::warn!(
                target: "lanes.coordinator",
                "Board {}: bulk update of {} rows failed: {}",
                board_id,
                updates.len(),
                e
            );
            return Err(ReconcileError::from_store(&board_id, e));
        }

        let MutationBatch {
            mutations,
            warnings,
            result,
            ..
        } = batch;
        let snapshot = session.install_committed(current.version, result);
        log::info!(
            target: "lanes.coordinator",
            "Board {}: committed {} mutations, now version {}",
            board_id,
            mutations.len(),
            snapshot.version
        );

        // Still under the lock, so a board's events never interleave.
        let committed_at = Utc::now();
        let mut audit_events = 0;
        for event in mutations
            .iter()
            .filter_map(|record| AuditEvent::for_mutation(&snapshot, record, actor, committed_at))
        {
            self.audit.append(event);
            audit_events += 1;
        }

        Ok(AppliedBatch {
            board_id,
            snapshot,
            mutations,
            warnings,
            audit_events,
        })
    }
}

/// Every record must start where the current snapshot has the item, and the
/// batch must be planned against the current layout.
fn check_preconditions(current: &BoardSnapshot, batch: &MutationBatch) -> Result<(), StaleReason> {
    let placements = current.placements();
    for record in &batch.mutations {
        let placement = placements
            .get(record.item_id.as_str())
            .ok_or_else(|| StaleReason::ItemMissing {
                item_id: record.item_id.clone(),
            })?;
        if placement.bucket_id != record.from_bucket_id || placement.order != record.from_order {
            return Err(StaleReason::ItemMoved {
                item_id: record.item_id.clone(),
                expected_bucket_id: record.from_bucket_id.clone(),
                expected_order: record.from_order,
                actual_bucket_id: placement.bucket_id.to_string(),
                actual_order: placement.order,
            });
        }
    }
    if batch.base_fingerprint != current.fingerprint {
        return Err(StaleReason::BoardChanged {
            expected_fingerprint: batch.base_fingerprint.clone(),
            actual_fingerprint: current.fingerprint.clone(),
        });
    }
    Ok(())
}
