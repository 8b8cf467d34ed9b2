/// Audit trail for committed placement changes.
///
/// Sinks are fire-and-forget. The coordinator appends the events of one batch
/// in batch order while it still holds the board's write lock, so events of a
/// board never interleave.
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{BoardSnapshot, MutationKind, MutationRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub board_id: String,
    pub actor: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub item_id: String,
    pub from_bucket_id: String,
    pub to_bucket_id: String,
}

impl AuditEvent {
    /// Describe a committed record using titles and bucket names from the
    /// snapshot the batch produced. `Compacted` records are not audited and
    /// yield `None`.
    pub fn for_mutation(
        snapshot: &BoardSnapshot,
        record: &MutationRecord,
        actor: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<Self> {
        let title = snapshot
            .locate(&record.item_id)
            .map(|p| p.item.label().to_string())
            .unwrap_or_else(|| record.item_id.clone());
        let bucket_name = |bucket_id: &str| {
            snapshot
                .lane(bucket_id)
                .map(|lane| lane.bucket.label().to_string())
                .unwrap_or_else(|| bucket_id.to_string())
        };

        let message = match record.kind {
            MutationKind::Moved => format!(
                "{} moved \"{}\" from {} to {}",
                actor,
                title,
                bucket_name(&record.from_bucket_id),
                bucket_name(&record.to_bucket_id)
            ),
            MutationKind::Reordered => format!(
                "{} moved \"{}\" to position {} in {}",
                actor,
                title,
                record.to_order + 1,
                bucket_name(&record.to_bucket_id)
            ),
            MutationKind::Compacted => return None,
        };

        Some(Self {
            board_id: snapshot.board_id.clone(),
            actor: actor.to_string(),
            message,
            timestamp,
            item_id: record.item_id.clone(),
            from_bucket_id: record.from_bucket_id.clone(),
            to_bucket_id: record.to_bucket_id.clone(),
        })
    }
}

/// Append-only receiver of audit events.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: AuditEvent);
}

/// Writes events to the `lanes.audit` log target.
#[derive(Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn append(&self, event: AuditEvent) {
        log::info!(
            target: "lanes.audit",
            "[{}] {} ({})",
            event.board_id,
            event.message,
            event.timestamp.to_rfc3339()
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Publishes events to live subscribers (SSE clients). Events sent while
/// nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastAuditSink {
    tx: broadcast::Sender<AuditEvent>,
}

impl BroadcastAuditSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.tx.subscribe()
    }
}

impl AuditSink for BroadcastAuditSink {
    fn append(&self, event: AuditEvent) {
        let _ = self.tx.send(event);
    }
}

/// Forwards every event to each inner sink in turn.
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn append(&self, event: AuditEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.append(event.clone());
            }
            last.append(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bucket, BucketLane, Item};

    fn snapshot() -> BoardSnapshot {
        BoardSnapshot::new(
            "b1",
            vec![
                BucketLane {
                    bucket: Bucket::new("todo", "To Do"),
                    items: vec![Item {
                        id: "a".to_string(),
                        title: "Write docs".to_string(),
                        bucket_id: "todo".to_string(),
                        order: 0,
                    }],
                },
                BucketLane {
                    bucket: Bucket::new("done", "Done"),
                    items: vec![Item {
                        id: "b".to_string(),
                        title: "Fix login".to_string(),
                        bucket_id: "done".to_string(),
                        order: 0,
                    }],
                },
            ],
        )
    }

    fn record(kind: MutationKind) -> MutationRecord {
        MutationRecord {
            item_id: "b".to_string(),
            from_bucket_id: "todo".to_string(),
            to_bucket_id: "done".to_string(),
            from_order: 1,
            to_order: 0,
            kind,
        }
    }

    #[test]
    fn test_moved_message_names_item_and_buckets() {
        let event =
            AuditEvent::for_mutation(&snapshot(), &record(MutationKind::Moved), "ada", Utc::now())
                .unwrap();
        assert_eq!(event.message, "ada moved \"Fix login\" from To Do to Done");
        assert_eq!(event.board_id, "b1");
        assert_eq!(event.actor, "ada");
    }

    #[test]
    fn test_reordered_message_uses_one_based_position() {
        let mut rec = record(MutationKind::Reordered);
        rec.from_bucket_id = "done".to_string();
        let event = AuditEvent::for_mutation(&snapshot(), &rec, "ada", Utc::now()).unwrap();
        assert_eq!(event.message, "ada moved \"Fix login\" to position 1 in Done");
    }

    #[test]
    fn test_compacted_record_is_not_audited() {
        let mut rec = record(MutationKind::Compacted);
        rec.from_bucket_id = "done".to_string();
        assert!(AuditEvent::for_mutation(&snapshot(), &rec, "ada", Utc::now()).is_none());
        assert!(!rec.kind.is_intentional());
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(MemoryAuditSink::new());
        let second = Arc::new(MemoryAuditSink::new());
        let sinks: Vec<Arc<dyn AuditSink>> = vec![first.clone(), second.clone()];
        let fanout = FanoutAuditSink::new(sinks);
        fanout.append(
            AuditEvent::for_mutation(&snapshot(), &record(MutationKind::Moved), "ada", Utc::now())
                .unwrap(),
        );
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastAuditSink::new(8);
        let mut rx = sink.subscribe();
        sink.append(
            AuditEvent::for_mutation(&snapshot(), &record(MutationKind::Moved), "ada", Utc::now())
                .unwrap(),
        );
        let event = rx.recv().await.unwrap();
        assert_eq!(event.item_id, "b");
    }
}
