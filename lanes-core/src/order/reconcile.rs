/// Turns a proposed snapshot into a persistence-ready batch.
///
/// Pure: no storage, no clocks. Given the same `(previous, proposed)` pair the
/// batch is identical, which is what makes retrying a failed submit safe.
use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::diff::{diff_normalized, prepare};
use crate::error::ValidationError;
use crate::types::{BoardSnapshot, BucketLane, Item, MutationRecord, PositionUpdate};

/// Non-fatal notice that a bucket grew past its advisory capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityWarning {
    pub bucket_id: String,
    pub bucket_name: String,
    pub limit: usize,
    pub count: usize,
}

/// Validated set of mutations plus the snapshot they produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationBatch {
    pub board_id: String,
    pub base_version: u64,
    pub base_fingerprint: String,
    pub mutations: Vec<MutationRecord>,
    pub warnings: Vec<CapacityWarning>,
    /// Snapshot to install once the store confirmed the batch.
    pub result: BoardSnapshot,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Rows for the store's bulk update, in batch order.
    pub fn updates(&self) -> Vec<PositionUpdate> {
        self.mutations.iter().map(MutationRecord::to_update).collect()
    }

    /// Records that reflect a user intent (moves and reorders).
    pub fn intentional(&self) -> impl Iterator<Item = &MutationRecord> {
        self.mutations.iter().filter(|m| m.kind.is_intentional())
    }
}

/// Plan the batch that turns `previous` into `proposed`.
///
/// Every bucket and item of `previous` must appear in `proposed`; no unknown
/// bucket or item may appear. A proposal that leaves out a live item is
/// rejected with `OmittedItem`, since the store would keep that item at its old
/// order. Records come out grouped exactly as [`diff`](super::diff) groups
/// them, by destination bucket in proposed bucket order. The result snapshot
/// is laid out in the board's own bucket order.
pub fn plan(
    previous: &BoardSnapshot,
    proposed: &BoardSnapshot,
) -> Result<MutationBatch, ValidationError> {
    if proposed.board_id != previous.board_id {
        return Err(ValidationError::BoardMismatch {
            expected: previous.board_id.clone(),
            actual: proposed.board_id.clone(),
        });
    }
    let normalized = prepare(previous, proposed)?;
    let result = build_result(previous, &normalized)?;
    let mutations = diff_normalized(previous, &normalized);
    plan_mutations(previous, result, mutations)
}

/// Wrap precomputed mutations into a batch after checking that applying them
/// to `previous` yields exactly `result` and that `result` is well formed.
///
/// `result` must hold every item of `previous`.
pub fn plan_mutations(
    previous: &BoardSnapshot,
    result: BoardSnapshot,
    mutations: Vec<MutationRecord>,
) -> Result<MutationBatch, ValidationError> {
    result.check_invariants()?;
    if let Some(item_id) = first_omitted(previous, &result) {
        log::debug!(
            target: "lanes.reconcile",
            "Board {}: proposal leaves out item {}",
            previous.board_id,
            item_id
        );
        return Err(ValidationError::OmittedItem { item_id });
    }

    let applied = apply_mutations(previous, &mutations)?;
    applied.check_invariants()?;
    if !applied.same_layout(&result) {
        return Err(ValidationError::InvariantViolated(
            "mutations do not reproduce the proposed layout".to_string(),
        ));
    }

    let warnings = capacity_warnings(previous, &result);
    for warning in &warnings {
        log::warn!(
            target: "lanes.reconcile",
            "Board {}: bucket {} holds {} items, over its limit of {}",
            previous.board_id,
            warning.bucket_id,
            warning.count,
            warning.limit
        );
    }

    Ok(MutationBatch {
        board_id: previous.board_id.clone(),
        base_version: previous.version,
        base_fingerprint: previous.fingerprint.clone(),
        mutations,
        warnings,
        result,
    })
}

/// First item of `previous`, in board order, that `result` does not hold.
fn first_omitted(previous: &BoardSnapshot, result: &BoardSnapshot) -> Option<String> {
    let kept: HashSet<&str> = result
        .buckets
        .iter()
        .flat_map(|lane| lane.items.iter().map(|i| i.id.as_str()))
        .collect();
    previous
        .buckets
        .iter()
        .flat_map(|lane| lane.items.iter())
        .find(|item| !kept.contains(item.id.as_str()))
        .map(|item| item.id.clone())
}

/// Proposed layout in the board's bucket order, with authoritative bucket
/// metadata and titles.
fn build_result(
    previous: &BoardSnapshot,
    normalized: &BoardSnapshot,
) -> Result<BoardSnapshot, ValidationError> {
    let before = previous.placements();

    for lane in &normalized.buckets {
        if previous.lane(&lane.bucket.id).is_none() {
            return Err(ValidationError::UnknownBucket {
                bucket_id: lane.bucket.id.clone(),
            });
        }
        if let Some(unknown) = lane.items.iter().find(|i| !before.contains_key(i.id.as_str())) {
            return Err(ValidationError::UnknownItem {
                item_id: unknown.id.clone(),
            });
        }
    }

    let mut lanes = Vec::with_capacity(previous.buckets.len());
    for prev_lane in &previous.buckets {
        let proposed_lane = normalized.lane(&prev_lane.bucket.id).ok_or_else(|| {
            ValidationError::InvariantViolated(format!(
                "bucket {} is missing from the proposed snapshot",
                prev_lane.bucket.id
            ))
        })?;
        let items: Vec<Item> = proposed_lane
            .items
            .iter()
            .map(|item| Item {
                id: item.id.clone(),
                title: before[item.id.as_str()].item.title.clone(),
                bucket_id: item.bucket_id.clone(),
                order: item.order,
            })
            .collect();
        lanes.push(BucketLane {
            bucket: prev_lane.bucket.clone(),
            items,
        });
    }

    Ok(BoardSnapshot::new(previous.board_id.clone(), lanes))
}

/// Replay mutations on every row of `previous`, as the store would.
fn apply_mutations(
    previous: &BoardSnapshot,
    mutations: &[MutationRecord],
) -> Result<BoardSnapshot, ValidationError> {
    let mut positions: HashMap<&str, (&str, u32)> = previous
        .buckets
        .iter()
        .flat_map(|lane| {
            lane.items
                .iter()
                .map(move |item| (item.id.as_str(), (lane.bucket.id.as_str(), item.order)))
        })
        .collect();

    for mutation in mutations {
        let slot = positions
            .get_mut(mutation.item_id.as_str())
            .ok_or_else(|| ValidationError::UnknownItem {
                item_id: mutation.item_id.clone(),
            })?;
        if *slot != (mutation.from_bucket_id.as_str(), mutation.from_order) {
            return Err(ValidationError::InvariantViolated(format!(
                "mutation for {} starts from {}#{} but the item is at {}#{}",
                mutation.item_id, mutation.from_bucket_id, mutation.from_order, slot.0, slot.1
            )));
        }
        *slot = (mutation.to_bucket_id.as_str(), mutation.to_order);
    }

    let titles: HashMap<&str, &str> = previous
        .buckets
        .iter()
        .flat_map(|lane| lane.items.iter().map(|i| (i.id.as_str(), i.title.as_str())))
        .collect();

    let lanes = previous
        .buckets
        .iter()
        .map(|lane| {
            let mut items: Vec<Item> = positions
                .iter()
                .filter(|(_, (bucket, _))| *bucket == lane.bucket.id)
                .map(|(id, (bucket, order))| Item {
                    id: id.to_string(),
                    title: titles.get(id).map(|t| t.to_string()).unwrap_or_default(),
                    bucket_id: bucket.to_string(),
                    order: *order,
                })
                .collect();
            items.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
            BucketLane {
                bucket: lane.bucket.clone(),
                items,
            }
        })
        .collect();

    Ok(BoardSnapshot::new(previous.board_id.clone(), lanes))
}

/// Buckets that gained items and now exceed their advisory limit.
fn capacity_warnings(previous: &BoardSnapshot, result: &BoardSnapshot) -> Vec<CapacityWarning> {
    result
        .buckets
        .iter()
        .filter_map(|lane| {
            let limit = lane.bucket.capacity_limit?;
            let count = lane.items.len();
            let before = previous
                .lane(&lane.bucket.id)
                .map(|l| l.items.len())
                .unwrap_or(0);
            (count > limit && count > before).then(|| CapacityWarning {
                bucket_id: lane.bucket.id.clone(),
                bucket_name: lane.bucket.label().to_string(),
                limit,
                count,
            })
        })
        .collect()
}
