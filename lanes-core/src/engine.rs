/// Entry point tying sessions, planning and the write coordinator together.
use std::sync::Arc;

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::coordinator::{AppliedBatch, LockPolicy, WriteCoordinator};
use crate::error::{ReconcileError, StaleReason, ValidationError};
use crate::order::{self, MutationBatch};
use crate::session::{SessionRegistry, SessionStatus};
use crate::storage::{StoreError, TaskStore};
use crate::types::BoardSnapshot;

pub struct ReorderEngine {
    config: EngineConfig,
    sessions: SessionRegistry,
    coordinator: WriteCoordinator,
}

impl ReorderEngine {
    pub fn new(store: Arc<dyn TaskStore>, audit: Arc<dyn AuditSink>, config: EngineConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(store.clone(), config.fetch_timeout()),
            coordinator: WriteCoordinator::new(store, audit, config.persist_timeout()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current snapshot of a board, loading it on first use.
    pub async fn get_snapshot(&self, board_id: &str) -> Result<Arc<BoardSnapshot>, ReconcileError> {
        let session = self.sessions.get(board_id);
        session.snapshot().await.map_err(|e| {
            if matches!(e, StoreError::BoardNotFound(_)) {
                self.sessions.forget(board_id);
            }
            ReconcileError::from_store(board_id, e)
        })
    }

    /// Plan a batch against the current snapshot without persisting it.
    pub async fn plan_reorder(
        &self,
        board_id: &str,
        proposed: &BoardSnapshot,
    ) -> Result<MutationBatch, ReconcileError> {
        check_board(board_id, proposed)?;
        let current = self.get_snapshot(board_id).await?;
        Ok(order::plan(&current, proposed)?)
    }

    /// Persist a precomputed batch under the configured lock policy.
    pub async fn apply(
        &self,
        board_id: &str,
        batch: MutationBatch,
        actor: &str,
    ) -> Result<AppliedBatch, ReconcileError> {
        self.apply_with(board_id, batch, actor, self.config.lock_policy())
            .await
    }

    pub async fn apply_with(
        &self,
        board_id: &str,
        batch: MutationBatch,
        actor: &str,
        policy: LockPolicy,
    ) -> Result<AppliedBatch, ReconcileError> {
        let session = self.sessions.get(board_id);
        self.coordinator.apply(&session, batch, actor, policy).await
    }

    /// Reconcile a user's proposed layout with the board and persist it.
    pub async fn submit_reorder(
        &self,
        board_id: &str,
        proposed: &BoardSnapshot,
        actor: &str,
    ) -> Result<AppliedBatch, ReconcileError> {
        self.submit_reorder_with(board_id, proposed, actor, self.config.lock_policy())
            .await
    }

    /// `proposed.fingerprint` must be the fingerprint of the snapshot the
    /// caller started from. Resubmitting a proposal that is already in place
    /// returns an empty batch. A proposal that leaves out an item the cache
    /// still lists is `Stale` and drops the cached snapshot.
    pub async fn submit_reorder_with(
        &self,
        board_id: &str,
        proposed: &BoardSnapshot,
        actor: &str,
        policy: LockPolicy,
    ) -> Result<AppliedBatch, ReconcileError> {
        check_board(board_id, proposed)?;
        let current = self.get_snapshot(board_id).await?;

        let normalized = order::normalize(proposed)?;
        if normalized.same_layout(&current) {
            log::debug!(
                target: "lanes.reconcile",
                "Board {}: proposal from {} already in place at version {}",
                board_id,
                actor,
                current.version
            );
            return Ok(AppliedBatch::unchanged(board_id, current));
        }

        if proposed.fingerprint != current.fingerprint {
            log::info!(
                target: "lanes.reconcile",
                "Board {}: proposal from {} is based on an outdated layout",
                board_id,
                actor
            );
            return Err(ReconcileError::Stale {
                board_id: board_id.to_string(),
                reason: StaleReason::BoardChanged {
                    expected_fingerprint: proposed.fingerprint.clone(),
                    actual_fingerprint: current.fingerprint.clone(),
                },
            });
        }

        let batch = match order::plan(&current, proposed) {
            Ok(batch) => batch,
            Err(ValidationError::OmittedItem { item_id }) => {
                // Usually a row deleted behind the cache's back.
                log::info!(
                    target: "lanes.reconcile",
                    "Board {}: proposal from {} leaves out item {}, refetching",
                    board_id,
                    actor,
                    item_id
                );
                self.invalidate(board_id);
                return Err(ReconcileError::Stale {
                    board_id: board_id.to_string(),
                    reason: StaleReason::ItemOmitted { item_id },
                });
            }
            Err(e) => return Err(e.into()),
        };
        let session = self.sessions.get(board_id);
        self.coordinator.apply(&session, batch, actor, policy).await
    }

    /// External refresh signal: the next read refetches from the store.
    pub fn invalidate(&self, board_id: &str) {
        if let Some(session) = self.sessions.peek(board_id) {
            session.invalidate();
        }
    }

    pub fn session_state(&self, board_id: &str) -> SessionStatus {
        self.sessions
            .peek(board_id)
            .map(|s| s.status())
            .unwrap_or(SessionStatus::Empty)
    }

    pub fn is_busy(&self, board_id: &str) -> bool {
        self.coordinator.is_busy(board_id)
    }
}

fn check_board(board_id: &str, proposed: &BoardSnapshot) -> Result<(), ValidationError> {
    if proposed.board_id != board_id {
        return Err(ValidationError::BoardMismatch {
            expected: board_id.to_string(),
            actual: proposed.board_id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::storage::local::{BoardDocument, JsonFileStore};
    use crate::storage::memory::MemoryStore;
    use crate::types::{Bucket, Item, MutationKind, MutationRecord, PositionUpdate};

    fn item(id: &str, bucket: &str, order: u32) -> Item {
        Item {
            id: id.to_string(),
            title: format!("Task {}", id.to_uppercase()),
            bucket_id: bucket.to_string(),
            order,
        }
    }

    fn buckets() -> Vec<Bucket> {
        vec![Bucket::new("todo", "To Do"), Bucket::new("done", "Done")]
    }

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryAuditSink>, Arc<ReorderEngine>) {
        let store = Arc::new(MemoryStore::new());
        store.insert_board(
            "b1",
            buckets(),
            vec![item("a", "todo", 0), item("b", "todo", 1), item("c", "todo", 2)],
        );
        let audit = Arc::new(MemoryAuditSink::new());
        let engine = Arc::new(ReorderEngine::new(
            store.clone(),
            audit.clone(),
            EngineConfig::default(),
        ));
        (store, audit, engine)
    }

    /// Drag `id` into `to_bucket` at `position`, the way a board UI would.
    fn drag(base: &BoardSnapshot, id: &str, to_bucket: &str, position: usize) -> BoardSnapshot {
        let mut proposed = base.clone();
        let mut moving = None;
        for lane in &mut proposed.buckets {
            if let Some(i) = lane.items.iter().position(|item| item.id == id) {
                moving = Some(lane.items.remove(i));
            }
        }
        let mut item = moving.expect("item exists");
        item.bucket_id = to_bucket.to_string();
        let lane = proposed
            .buckets
            .iter_mut()
            .find(|lane| lane.bucket.id == to_bucket)
            .expect("bucket exists");
        lane.items.insert(position, item);
        proposed
    }

    #[tokio::test]
    async fn test_move_to_other_bucket() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();

        let applied = engine
            .submit_reorder("b1", &drag(&base, "b", "done", 0), "ada")
            .await
            .unwrap();

        assert_eq!(
            applied.mutations,
            vec![
                MutationRecord {
                    item_id: "c".to_string(),
                    from_bucket_id: "todo".to_string(),
                    to_bucket_id: "todo".to_string(),
                    from_order: 2,
                    to_order: 1,
                    kind: MutationKind::Compacted,
                },
                MutationRecord {
                    item_id: "b".to_string(),
                    from_bucket_id: "todo".to_string(),
                    to_bucket_id: "done".to_string(),
                    from_order: 1,
                    to_order: 0,
                    kind: MutationKind::Moved,
                },
            ]
        );
        assert_eq!(store.position_of("b1", "a"), Some(("todo".to_string(), 0)));
        assert_eq!(store.position_of("b1", "c"), Some(("todo".to_string(), 1)));
        assert_eq!(store.position_of("b1", "b"), Some(("done".to_string(), 0)));

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item_id, "b");
        assert_eq!(events[0].actor, "ada");

        let current = engine.get_snapshot("b1").await.unwrap();
        assert!(Arc::ptr_eq(&current, &applied.snapshot));
        assert_eq!(store.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_proposal_touches_nothing() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();

        let applied = engine.submit_reorder("b1", &base, "ada").await.unwrap();
        assert!(applied.is_noop());
        assert_eq!(applied.snapshot.version, base.version);
        assert_eq!(store.update_calls(), 0);
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submit_is_busy_then_precomputed_batch_is_stale() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        let first_proposal = drag(&base, "b", "done", 0);
        let second_proposal = drag(&base, "a", "done", 0);
        let precomputed = engine.plan_reorder("b1", &second_proposal).await.unwrap();

        store.pause_updates();
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit_reorder("b1", &first_proposal, "ada").await })
        };
        store.update_started().await;

        let err = engine
            .submit_reorder("b1", &second_proposal, "bob")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Busy { .. }));

        store.resume_updates();
        first.await.unwrap().unwrap();

        let err = engine.apply("b1", precomputed, "bob").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Stale { .. }));
        assert!(!err.is_retriable());

        assert_eq!(store.update_calls(), 1);
        assert_eq!(audit.len(), 1);
        assert_eq!(store.position_of("b1", "a"), Some(("todo".to_string(), 0)));
    }

    #[tokio::test]
    async fn test_waiting_submit_sees_the_committed_board() {
        let (store, _audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        let first_proposal = drag(&base, "b", "done", 0);
        let second_proposal = drag(&base, "a", "done", 0);

        store.pause_updates();
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit_reorder("b1", &first_proposal, "ada").await })
        };
        store.update_started().await;

        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .submit_reorder_with(
                        "b1",
                        &second_proposal,
                        "bob",
                        LockPolicy::WaitUpTo(Duration::from_secs(5)),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.resume_updates();

        first.await.unwrap().unwrap();
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, ReconcileError::Stale { .. }));
        assert_eq!(store.update_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_store_and_refetches() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        store.fail_next_update_after(1, StoreError::Unavailable("connection reset".to_string()));

        let err = engine
            .submit_reorder("b1", &drag(&base, "b", "done", 0), "ada")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::TransientStorage { .. }));
        assert!(err.is_retriable());
        assert_eq!(engine.session_state("b1"), SessionStatus::Stale);
        assert!(audit.is_empty());
        assert_eq!(store.position_of("b1", "b"), Some(("todo".to_string(), 1)));
        assert_eq!(store.position_of("b1", "c"), Some(("todo".to_string(), 2)));

        let refetched = engine.get_snapshot("b1").await.unwrap();
        assert!(refetched.same_layout(&base));
        assert_eq!(refetched.fingerprint, base.fingerprint);
        assert_eq!(store.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_retry_after_transient_failure_commits_once() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        let proposal = drag(&base, "b", "done", 0);
        store.fail_next_update(StoreError::Timeout);

        assert!(engine.submit_reorder("b1", &proposal, "ada").await.is_err());
        let applied = engine.submit_reorder("b1", &proposal, "ada").await.unwrap();
        assert_eq!(applied.audit_events, 1);

        let again = engine.submit_reorder("b1", &proposal, "ada").await.unwrap();
        assert!(again.is_noop());
        assert_eq!(store.update_calls(), 2);
        assert_eq!(audit.len(), 1);
    }

    #[tokio::test]
    async fn test_lost_acknowledgement_is_recognized() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        let proposal = drag(&base, "b", "done", 0);

        // The rows landed but the caller never heard back.
        store
            .bulk_update(
                "b1",
                &[
                    PositionUpdate {
                        id: "b".to_string(),
                        bucket_id: "done".to_string(),
                        order: 0,
                    },
                    PositionUpdate {
                        id: "c".to_string(),
                        bucket_id: "todo".to_string(),
                        order: 1,
                    },
                ],
            )
            .await
            .unwrap();
        engine.invalidate("b1");

        let applied = engine.submit_reorder("b1", &proposal, "ada").await.unwrap();
        assert!(applied.is_noop());
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_band_change_makes_proposal_stale() {
        let (store, _audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        store.move_out_of_band("b1", "a", "done", 0);
        engine.invalidate("b1");

        let err = engine
            .submit_reorder("b1", &drag(&base, "c", "todo", 0), "ada")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Stale {
                reason: StaleReason::BoardChanged { .. },
                ..
            }
        ));
        assert_eq!(store.update_calls(), 0);
    }

    fn without(base: &BoardSnapshot, id: &str) -> BoardSnapshot {
        let mut proposed = base.clone();
        for lane in &mut proposed.buckets {
            lane.items.retain(|item| item.id != id);
        }
        proposed
    }

    fn assert_dense_store(store: &MemoryStore, board_id: &str) {
        for bucket in buckets() {
            let mut orders: Vec<u32> = store
                .tasks(board_id)
                .iter()
                .filter(|t| t.bucket_id == bucket.id)
                .map(|t| t.order)
                .collect();
            let count = orders.len();
            orders.sort_unstable();
            orders.dedup();
            assert_eq!(orders.len(), count, "duplicate stored orders in {}", bucket.id);
        }
    }

    #[tokio::test]
    async fn test_proposal_leaving_out_a_live_item_is_refused() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();

        let err = engine
            .submit_reorder("b1", &without(&base, "a"), "ada")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Stale {
                reason: StaleReason::ItemOmitted { ref item_id },
                ..
            } if item_id == "a"
        ));
        assert_eq!(store.update_calls(), 0);
        assert!(audit.is_empty());
        assert_eq!(store.position_of("b1", "a"), Some(("todo".to_string(), 0)));
        assert_eq!(store.position_of("b1", "b"), Some(("todo".to_string(), 1)));
        assert_eq!(engine.session_state("b1"), SessionStatus::Stale);

        let refetched = engine.get_snapshot("b1").await.unwrap();
        assert!(refetched.same_layout(&base));
        engine
            .submit_reorder("b1", &drag(&refetched, "a", "done", 0), "ada")
            .await
            .unwrap();
        assert_dense_store(&store, "b1");
    }

    #[tokio::test]
    async fn test_item_deleted_out_of_band_drops_out_after_refetch() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        store.remove_out_of_band("b1", "a");

        let proposal = drag(&without(&base, "a"), "c", "todo", 0);
        let err = engine.submit_reorder("b1", &proposal, "ada").await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Stale {
                reason: StaleReason::ItemOmitted { .. },
                ..
            }
        ));
        assert_eq!(store.update_calls(), 0);

        let refetched = engine.get_snapshot("b1").await.unwrap();
        assert!(refetched.locate("a").is_none());
        assert_eq!(refetched.item_count(), 2);
        assert_eq!(store.fetch_calls(), 2);

        let applied = engine
            .submit_reorder("b1", &drag(&refetched, "c", "todo", 0), "ada")
            .await
            .unwrap();
        assert_eq!(applied.audit_events, 1);
        assert_eq!(audit.len(), 1);
        assert_eq!(store.position_of("b1", "c"), Some(("todo".to_string(), 0)));
        assert_eq!(store.position_of("b1", "b"), Some(("todo".to_string(), 1)));
        assert_dense_store(&store, "b1");
    }

    #[tokio::test]
    async fn test_moving_an_item_deleted_out_of_band_fails_permanently() {
        let (store, audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        store.remove_out_of_band("b1", "a");

        let err = engine
            .submit_reorder("b1", &drag(&base, "a", "done", 0), "ada")
            .await
            .unwrap_err();
        match &err {
            ReconcileError::PermanentStorage { source, .. } => assert_eq!(
                *source,
                StoreError::UnknownItem {
                    item_id: "a".to_string()
                }
            ),
            other => panic!("expected permanent failure, got {other:?}"),
        }
        assert!(!err.is_retriable());
        assert_eq!(engine.session_state("b1"), SessionStatus::Stale);
        assert!(audit.is_empty());
        assert_eq!(store.position_of("b1", "b"), Some(("todo".to_string(), 1)));
        assert_eq!(store.position_of("b1", "c"), Some(("todo".to_string(), 2)));

        let refetched = engine.get_snapshot("b1").await.unwrap();
        assert!(refetched.locate("a").is_none());
    }

    #[tokio::test]
    async fn test_invalid_proposal_is_rejected_before_io() {
        let (store, _audit, engine) = setup();
        let base = engine.get_snapshot("b1").await.unwrap();
        let mut proposal = base.as_ref().clone();
        let dup = proposal.buckets[0].items[0].clone();
        proposal.buckets[1].items.push(dup);

        let err = engine.submit_reorder("b1", &proposal, "ada").await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Validation(ValidationError::DuplicateItem { .. })
        ));

        let err = engine.submit_reorder("b2", &base, "ada").await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Validation(ValidationError::BoardMismatch { .. })
        ));
        assert_eq!(store.update_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_board_is_permanent() {
        let (_store, _audit, engine) = setup();
        let err = engine.get_snapshot("nope").await.unwrap_err();
        match err {
            ReconcileError::PermanentStorage { source, .. } => {
                assert_eq!(source, StoreError::BoardNotFound("nope".to_string()))
            }
            other => panic!("expected permanent failure, got {other:?}"),
        }
        assert_eq!(engine.session_state("nope"), SessionStatus::Empty);
    }

    #[tokio::test]
    async fn test_json_file_store_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());
        store
            .save_board(
                "roadmap",
                &BoardDocument {
                    title: "Roadmap".to_string(),
                    buckets: buckets(),
                    tasks: vec![item("a", "todo", 0), item("b", "todo", 1), item("c", "done", 0)],
                },
            )
            .await
            .unwrap();

        let audit = Arc::new(MemoryAuditSink::new());
        let engine = ReorderEngine::new(store.clone(), audit.clone(), EngineConfig::default());
        let base = engine.get_snapshot("roadmap").await.unwrap();
        engine
            .submit_reorder("roadmap", &drag(&base, "b", "todo", 0), "ada")
            .await
            .unwrap();

        let doc = JsonFileStore::open(dir.path())
            .unwrap()
            .read_board("roadmap")
            .await
            .unwrap();
        let order_of = |id: &str| doc.tasks.iter().find(|t| t.id == id).map(|t| t.order);
        assert_eq!(order_of("b"), Some(0));
        assert_eq!(order_of("a"), Some(1));
        assert_eq!(doc.title, "Roadmap");
        assert_eq!(audit.events()[0].message, "ada moved \"Task B\" to position 1 in To Do");
    }
}
