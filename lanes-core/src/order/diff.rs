/// Placement diff between two board snapshots.
///
/// Compares snapshots at the item level by id. Orders in the proposed
/// snapshot are always derived from sequence position, never taken from the
/// caller, so the diff only reports `(bucket, order)` pairs that the store
/// must actually change.
use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;
use crate::types::{BoardSnapshot, BucketLane, Item, MutationKind, MutationRecord, Placement};

/// Validate a proposed snapshot structurally and derive every item's
/// `bucket_id` from its lane and its `order` from its position (`0..N-1`).
///
/// Rejects duplicate bucket ids and duplicate item ids. Caller-supplied
/// orders are discarded.
pub fn normalize(proposed: &BoardSnapshot) -> Result<BoardSnapshot, ValidationError> {
    let mut bucket_ids = HashSet::new();
    let mut item_ids = HashSet::new();
    for lane in &proposed.buckets {
        if !bucket_ids.insert(lane.bucket.id.as_str()) {
            return Err(ValidationError::DuplicateBucket {
                bucket_id: lane.bucket.id.clone(),
            });
        }
        for item in &lane.items {
            if !item_ids.insert(item.id.as_str()) {
                return Err(ValidationError::DuplicateItem {
                    item_id: item.id.clone(),
                });
            }
        }
    }

    let lanes = proposed
        .buckets
        .iter()
        .map(|lane| BucketLane {
            bucket: lane.bucket.clone(),
            items: lane
                .items
                .iter()
                .enumerate()
                .map(|(position, item)| Item {
                    id: item.id.clone(),
                    title: item.title.clone(),
                    bucket_id: lane.bucket.id.clone(),
                    order: position as u32,
                })
                .collect(),
        })
        .collect();

    let mut normalized = BoardSnapshot::new(proposed.board_id.clone(), lanes);
    normalized.version = proposed.version;
    Ok(normalized)
}

/// Reject order values that collide inside a proposed bucket.
///
/// Two items that came from the same source bucket and now claim the same
/// order in one destination bucket mean the caller corrupted the snapshot.
/// Items arriving from different buckets naturally carry overlapping values;
/// those collisions are resolved by position-derived renumbering.
pub(crate) fn check_order_collisions(
    previous: &BoardSnapshot,
    proposed: &BoardSnapshot,
) -> Result<(), ValidationError> {
    let before = previous.placements();
    for lane in &proposed.buckets {
        let mut claimed: HashSet<(&str, u32)> = HashSet::with_capacity(lane.items.len());
        for item in &lane.items {
            let source = before
                .get(item.id.as_str())
                .map(|p| p.bucket_id)
                .unwrap_or("");
            if !claimed.insert((source, item.order)) {
                return Err(ValidationError::DuplicateOrder {
                    bucket_id: lane.bucket.id.clone(),
                    order: item.order,
                });
            }
        }
    }
    Ok(())
}

/// Validate and normalize a proposed snapshot against its base.
pub(crate) fn prepare(
    previous: &BoardSnapshot,
    proposed: &BoardSnapshot,
) -> Result<BoardSnapshot, ValidationError> {
    let normalized = normalize(proposed)?;
    check_order_collisions(previous, proposed)?;
    Ok(normalized)
}

/// Compute the placement changes from `previous` to `proposed`.
///
/// Only items present in both snapshots are compared. A record is emitted iff
/// the bucket or the order differs. Records are grouped by destination bucket
/// (in proposed bucket order) and ascend by `to_order` inside each group.
pub fn diff(
    previous: &BoardSnapshot,
    proposed: &BoardSnapshot,
) -> Result<Vec<MutationRecord>, ValidationError> {
    let normalized = prepare(previous, proposed)?;
    Ok(diff_normalized(previous, &normalized))
}

/// Diff against a snapshot whose orders are already position-derived.
pub(crate) fn diff_normalized(
    previous: &BoardSnapshot,
    normalized: &BoardSnapshot,
) -> Vec<MutationRecord> {
    let before = previous.placements();
    let mut records = Vec::new();

    for lane in &normalized.buckets {
        let retained = retained_in_place(lane, &before);
        for item in &lane.items {
            let Some(prev) = before.get(item.id.as_str()) else {
                continue;
            };
            if prev.bucket_id == lane.bucket.id && prev.order == item.order {
                continue;
            }
            let kind = if prev.bucket_id != lane.bucket.id {
                MutationKind::Moved
            } else if retained.contains(item.id.as_str()) {
                MutationKind::Compacted
            } else {
                MutationKind::Reordered
            };
            records.push(MutationRecord {
                item_id: item.id.clone(),
                from_bucket_id: prev.bucket_id.to_string(),
                to_bucket_id: lane.bucket.id.clone(),
                from_order: prev.order,
                to_order: item.order,
                kind,
            });
        }
    }

    records
}

/// Ids of the items that stayed in this bucket and kept their relative order:
/// the longest subsequence of stayers whose previous positions still ascend.
/// Every other stayer is the one that was dragged.
fn retained_in_place<'a>(
    lane: &'a BucketLane,
    before: &HashMap<&str, Placement<'_>>,
) -> HashSet<&'a str> {
    let stayers: Vec<(&str, usize)> = lane
        .items
        .iter()
        .filter_map(|item| {
            before
                .get(item.id.as_str())
                .filter(|p| p.bucket_id == lane.bucket.id)
                .map(|p| (item.id.as_str(), p.position))
        })
        .collect();
    let positions: Vec<usize> = stayers.iter().map(|(_, position)| *position).collect();
    longest_increasing_run(&positions)
        .into_iter()
        .map(|i| stayers[i].0)
        .collect()
}

/// Indices of a longest strictly increasing subsequence. Deterministic: ties
/// resolve to the run ending at the earliest-discovered smallest tail.
fn longest_increasing_run(values: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut prev: Vec<Option<usize>> = vec![None; values.len()];

    for (i, &value) in values.iter().enumerate() {
        let slot = tails.partition_point(|&t| values[t] < value);
        if slot > 0 {
            prev[i] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(i);
        } else {
            tails[slot] = i;
        }
    }

    let mut run = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        run.push(i);
        cursor = prev[i];
    }
    run.reverse();
    run
}
