use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

use crate::error::ValidationError;

/// A unit of work placed on a board.
///
/// `bucket_id` and `order` are authoritative only inside snapshots the engine
/// produced. In caller-proposed snapshots both are derived from the lane that
/// holds the item and its position in that lane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub bucket_id: String,
    #[serde(default)]
    pub order: u32,
}

impl Item {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            bucket_id: String::new(),
            order: 0,
        }
    }

    /// Display label for audit messages; falls back to the id for untitled items.
    pub fn label(&self) -> &str {
        if self.title.trim().is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// A named, ordered container of items (a board column).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Advisory cap. Exceeding it produces a warning, never an error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity_limit: Option<usize>,
}

impl Bucket {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capacity_limit: None,
        }
    }

    pub fn with_capacity(mut self, limit: usize) -> Self {
        self.capacity_limit = Some(limit);
        self
    }

    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A bucket together with its items in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketLane {
    pub bucket: Bucket,
    #[serde(default)]
    pub items: Vec<Item>,
}

/// Complete assignment of every item of a board to a bucket and position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSnapshot {
    pub board_id: String,
    /// Monotonic per board session, assigned when the snapshot is installed.
    #[serde(default)]
    pub version: u64,
    /// SHA-256 of the layout. Proposed snapshots carry the fingerprint of the
    /// snapshot they were derived from.
    #[serde(default)]
    pub fingerprint: String,
    pub buckets: Vec<BucketLane>,
}

/// Where an item sits inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement<'a> {
    pub bucket_id: &'a str,
    pub order: u32,
    pub position: usize,
    pub item: &'a Item,
}

impl BoardSnapshot {
    /// Build a snapshot from lanes; the fingerprint is computed, the version is 0.
    pub fn new(board_id: impl Into<String>, buckets: Vec<BucketLane>) -> Self {
        let mut snapshot = Self {
            board_id: board_id.into(),
            version: 0,
            fingerprint: String::new(),
            buckets,
        };
        snapshot.fingerprint = snapshot.layout_fingerprint();
        snapshot
    }

    /// Assemble a snapshot from store rows.
    ///
    /// Tasks are grouped by bucket and sorted by `(order, id)`. Stored order
    /// values are kept when they strictly increase; a bucket holding duplicate
    /// values is renumbered densely. Tasks pointing at an unknown bucket are
    /// dropped.
    pub fn from_store(board_id: &str, buckets: Vec<Bucket>, tasks: Vec<Item>) -> Self {
        let mut lanes: Vec<BucketLane> = buckets
            .into_iter()
            .map(|bucket| BucketLane {
                bucket,
                items: Vec::new(),
            })
            .collect();
        let index: HashMap<String, usize> = lanes
            .iter()
            .enumerate()
            .map(|(i, lane)| (lane.bucket.id.clone(), i))
            .collect();

        for task in tasks {
            match index.get(&task.bucket_id) {
                Some(&i) => lanes[i].items.push(task),
                None => log::warn!(
                    target: "lanes.session.load",
                    "Board {}: task {} references unknown bucket {:?}, skipped",
                    board_id,
                    task.id,
                    task.bucket_id
                ),
            }
        }

        for lane in &mut lanes {
            lane.items
                .sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
            let has_ties = lane.items.windows(2).any(|w| w[0].order == w[1].order);
            if has_ties {
                log::warn!(
                    target: "lanes.session.load",
                    "Board {}: bucket {} has duplicate stored orders, renumbering",
                    board_id,
                    lane.bucket.id
                );
                for (position, item) in lane.items.iter_mut().enumerate() {
                    item.order = position as u32;
                }
            }
        }

        Self::new(board_id, lanes)
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// SHA-256 over bucket ids in order and item ids with their orders.
    /// Titles and names are not part of the layout.
    pub fn layout_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for lane in &self.buckets {
            hasher.update(b"b:");
            hasher.update(lane.bucket.id.as_bytes());
            hasher.update(b"\n");
            for item in &lane.items {
                hasher.update(b"i:");
                hasher.update(item.id.as_bytes());
                hasher.update(b":");
                hasher.update(item.order.to_string().as_bytes());
                hasher.update(b"\n");
            }
        }
        hex::encode(hasher.finalize())
    }

    pub fn lane(&self, bucket_id: &str) -> Option<&BucketLane> {
        self.buckets.iter().find(|lane| lane.bucket.id == bucket_id)
    }

    pub fn item_count(&self) -> usize {
        self.buckets.iter().map(|lane| lane.items.len()).sum()
    }

    /// Index of every item by id. Later duplicates overwrite earlier ones, so
    /// only call this on snapshots that passed `check_invariants`.
    pub fn placements(&self) -> HashMap<&str, Placement<'_>> {
        let mut map = HashMap::with_capacity(self.item_count());
        for lane in &self.buckets {
            for (position, item) in lane.items.iter().enumerate() {
                map.insert(
                    item.id.as_str(),
                    Placement {
                        bucket_id: lane.bucket.id.as_str(),
                        order: item.order,
                        position,
                        item,
                    },
                );
            }
        }
        map
    }

    pub fn locate(&self, item_id: &str) -> Option<Placement<'_>> {
        self.buckets.iter().find_map(|lane| {
            lane.items
                .iter()
                .position(|item| item.id == item_id)
                .map(|position| {
                    let item = &lane.items[position];
                    Placement {
                        bucket_id: lane.bucket.id.as_str(),
                        order: item.order,
                        position,
                        item,
                    }
                })
        })
    }

    /// True when both snapshots assign the same items to the same buckets at
    /// the same orders.
    pub fn same_layout(&self, other: &BoardSnapshot) -> bool {
        self.buckets.len() == other.buckets.len()
            && self.buckets.iter().zip(&other.buckets).all(|(a, b)| {
                a.bucket.id == b.bucket.id
                    && a.items.len() == b.items.len()
                    && a.items
                        .iter()
                        .zip(&b.items)
                        .all(|(x, y)| x.id == y.id && x.order == y.order)
            })
    }

    /// Each item id sits in exactly one bucket, and orders within a bucket
    /// are unique and strictly increasing with position. Item `bucket_id`
    /// fields must match their lane.
    pub fn check_invariants(&self) -> Result<(), ValidationError> {
        let mut bucket_ids = HashSet::new();
        let mut item_ids = HashSet::new();
        for lane in &self.buckets {
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
                if item.bucket_id != lane.bucket.id {
                    return Err(ValidationError::InvariantViolated(format!(
                        "item {} is listed under bucket {} but claims bucket {}",
                        item.id, lane.bucket.id, item.bucket_id
                    )));
                }
            }
            if let Some(pair) = lane.items.windows(2).find(|w| w[0].order >= w[1].order) {
                return Err(ValidationError::InvariantViolated(format!(
                    "bucket {}: order {} of {} is not below order {} of {}",
                    lane.bucket.id, pair[0].order, pair[0].id, pair[1].order, pair[1].id
                )));
            }
        }
        Ok(())
    }
}

/// How an item's placement changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    /// The item changed bucket.
    Moved,
    /// The item changed position relative to the other items of its bucket.
    Reordered,
    /// Only the numeric order shifted because neighbours left or arrived.
    Compacted,
}

impl MutationKind {
    /// Whether the change reflects a user intent worth an audit entry.
    pub fn is_intentional(self) -> bool {
        !matches!(self, MutationKind::Compacted)
    }
}

/// Atomic unit of persistence and audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub item_id: String,
    pub from_bucket_id: String,
    pub to_bucket_id: String,
    pub from_order: u32,
    pub to_order: u32,
    pub kind: MutationKind,
}

impl MutationRecord {
    pub fn to_update(&self) -> PositionUpdate {
        PositionUpdate {
            id: self.item_id.clone(),
            bucket_id: self.to_bucket_id.clone(),
            order: self.to_order,
        }
    }
}

/// Row handed to the store's bulk update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub id: String,
    pub bucket_id: String,
    pub order: u32,
}
