//! In-memory per-column value indexes.
//!
//! Each indexed column maps a value to the live rids currently holding it,
//! giving O(1) equality lookups. Range lookups scan the bucket keys. The
//! key column's index always exists; other columns are indexed on demand
//! (the table backfills current values when one is created).


use common::Rid;
use hashbrown::HashMap;

/// Per-column hash indexes over a table's live records.
///
/// Invariant: for every live record and every existing index, the record's
/// latest value maps to its rid. The table maintains this on insert,
/// update, and delete.
#[derive(Debug)]
pub struct ColumnIndex {
    buckets: Vec<Option<HashMap<i64, Vec<Rid>>>>,
}

impl ColumnIndex {
    /// An index set for `num_columns` user columns with the key column
    /// already indexed.
    pub fn new(num_columns: usize, key: usize) -> Self {
        let mut buckets: Vec<Option<HashMap<i64, Vec<Rid>>>> =
            (0..num_columns).map(|_| None).collect();
        if key < num_columns {
            buckets[key] = Some(HashMap::new());
        }
        Self { buckets }
    }

    pub fn is_indexed(&self, column: usize) -> bool {
        matches!(self.buckets.get(column), Some(Some(_)))
    }

    /// Rids of all live records holding `value` in `column`. Empty when the
    /// column is out of range or not indexed.
    pub fn locate(&self, column: usize, value: i64) -> Vec<Rid> {
        match self.buckets.get(column) {
            Some(Some(bucket)) => bucket.get(&value).cloned().unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Rids of all live records whose `column` value lies in `begin..=end`.
    /// Order is unspecified.
    pub fn locate_range(&self, begin: i64, end: i64, column: usize) -> Vec<Rid> {
        let Some(Some(bucket)) = self.buckets.get(column) else {
            return Vec::new();
        };
        let mut rids = Vec::new();
        for (value, value_rids) in bucket {
            if (begin..=end).contains(value) {
                rids.extend_from_slice(value_rids);
            }
        }
        rids
    }

    /// Create an empty index for `column`. Existing indexes and invalid
    /// columns are left untouched; the caller backfills current values.
    pub fn create_index(&mut self, column: usize) {
        if let Some(bucket) = self.buckets.get_mut(column)
            && bucket.is_none()
        {
            *bucket = Some(HashMap::new());
        }
    }

    /// Drop the index for `column`, if any.
    pub fn drop_index(&mut self, column: usize) {
        if let Some(bucket) = self.buckets.get_mut(column) {
            *bucket = None;
        }
    }

    /// Register `rid` under `value`. No-op for unindexed columns; a rid is
    /// never registered twice under the same value.
    pub fn add(&mut self, column: usize, value: i64, rid: Rid) {
        if let Some(Some(bucket)) = self.buckets.get_mut(column) {
            let rids = bucket.entry(value).or_default();
            if !rids.contains(&rid) {
                rids.push(rid);
            }
        }
    }

    /// Remove `rid` from under `value`, dropping the value bucket when it
    /// empties. No-op for unindexed columns or absent entries.
    pub fn remove(&mut self, column: usize, value: i64, rid: Rid) {
        if let Some(Some(bucket)) = self.buckets.get_mut(column)
            && let Some(rids) = bucket.get_mut(&value)
        {
            rids.retain(|&r| r != rid);
            if rids.is_empty() {
                bucket.remove(&value);
            }
        }
    }
}
