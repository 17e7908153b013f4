//! Table core: lineage-based versioned storage over columnar pages.
//!
//! A table stores fixed-schema records of 64-bit integers. Base records are
//! written once at insert; every update appends a tail record carrying the
//! changed cells, and the base record's indirection slot is re-pointed at
//! it, forming a per-record chain of versions resolved through the tail
//! directory. Reads of the latest version walk that chain; deletes
//! tombstone the base slot. A background worker periodically folds the
//! newest committed tail values into a fresh generation of base pages
//! without stopping reads (see [`merge`]).

mod merge;
mod range;
#[cfg(test)]
mod tests;

pub use range::PageRange;

use buffer::{PinnedPage, SharedPool};
use common::{
    Config, DbError, DbResult, INDIRECTION_COLUMN, MAX_USER_COLUMNS, METADATA_COLUMNS, PageKind,
    RID_COLUMN, RecordLocation, Rid, SCHEMA_ENCODING_COLUMN,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use hashbrown::{HashMap, HashSet};
use index::ColumnIndex;
use merge::{Dealloc, MergeContext, MergeJob};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Persisted table metadata (`meta.json`).
#[derive(Debug, Serialize, Deserialize)]
struct TableMeta {
    name: String,
    num_columns: usize,
    key: usize,
    rid_counter: Rid,
    num_page_ranges: usize,
    base_pages: Vec<Vec<Vec<usize>>>,
    tail_pages: Vec<Vec<Vec<usize>>>,
}

/// A single table: page ranges, record directories, column indexes, and the
/// background merge worker.
///
/// The foreground API is single-threaded per table; only the merge worker
/// runs concurrently, and the page-range table it flips is shared behind a
/// lock.
pub struct Table {
    name: String,
    num_columns: usize,
    key: usize,
    db_root: PathBuf,
    pool: SharedPool,
    ranges: Arc<RwLock<Vec<PageRange>>>,
    base_directory: HashMap<Rid, RecordLocation>,
    tail_directory: HashMap<Rid, RecordLocation>,
    index: ColumnIndex,
    rid_counter: Rid,
    merge_threshold_pages: usize,
    merge_scheduled: Arc<Mutex<HashSet<usize>>>,
    merge_tx: Sender<MergeJob>,
    merge_handle: Option<JoinHandle<()>>,
    dealloc_rx: Receiver<Dealloc>,
}

impl Table {
    /// Create an empty table. Nothing is persisted until [`Table::flush`].
    pub fn create(
        db_root: &Path,
        name: &str,
        num_columns: usize,
        key: usize,
        pool: SharedPool,
        config: &Config,
    ) -> DbResult<Table> {
        Self::validate(name, num_columns, key)?;
        Ok(Self::build(
            db_root,
            name,
            num_columns,
            key,
            1,
            Vec::new(),
            pool,
            config,
        ))
    }

    /// Load a persisted table: read `meta.json`, rebuild both record
    /// directories by scanning the rid columns, and rebuild the key
    /// column's index from the latest values.
    pub fn open(db_root: &Path, name: &str, pool: SharedPool, config: &Config) -> DbResult<Table> {
        let meta_path = storage::table_dir(db_root, name).join("meta.json");
        let raw = fs::read_to_string(&meta_path)?;
        let meta: TableMeta =
            serde_json::from_str(&raw).map_err(|e| DbError::Table(format!("decode metadata: {e}")))?;
        Self::validate(&meta.name, meta.num_columns, meta.key)?;

        let total_columns = METADATA_COLUMNS + meta.num_columns;
        let mut ranges = Vec::with_capacity(meta.base_pages.len());
        for (base, tail) in meta.base_pages.into_iter().zip(meta.tail_pages) {
            if base.len() != total_columns || tail.len() != total_columns {
                return Err(DbError::Table(format!(
                    "metadata for table {} has inconsistent column counts",
                    meta.name
                )));
            }
            ranges.push(PageRange::from_parts(base, tail));
        }

        let mut table = Self::build(
            db_root,
            &meta.name,
            meta.num_columns,
            meta.key,
            meta.rid_counter,
            ranges,
            pool,
            config,
        );
        table.rebuild_directories()?;
        table.rebuild_key_index()?;
        Ok(table)
    }

    fn validate(name: &str, num_columns: usize, key: usize) -> DbResult<()> {
        if name.is_empty() {
            return Err(DbError::Table("table name must not be empty".into()));
        }
        if num_columns == 0 || num_columns > MAX_USER_COLUMNS {
            return Err(DbError::Table(format!(
                "table width {num_columns} outside 1..={MAX_USER_COLUMNS}"
            )));
        }
        if key >= num_columns {
            return Err(DbError::Table(format!(
                "key column {key} out of range for {num_columns} columns"
            )));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        db_root: &Path,
        name: &str,
        num_columns: usize,
        key: usize,
        rid_counter: Rid,
        ranges: Vec<PageRange>,
        pool: SharedPool,
        config: &Config,
    ) -> Table {
        let ranges = Arc::new(RwLock::new(ranges));
        let merge_scheduled = Arc::new(Mutex::new(HashSet::new()));
        let (merge_tx, merge_rx) = unbounded();
        let (dealloc_tx, dealloc_rx) = unbounded();

        let ctx = MergeContext {
            db_root: db_root.to_path_buf(),
            table: name.to_string(),
            num_columns,
            pool: Arc::clone(&pool),
            ranges: Arc::clone(&ranges),
            scheduled: Arc::clone(&merge_scheduled),
            dealloc_tx,
        };
        let merge_handle = std::thread::spawn(move || merge::run(ctx, merge_rx));

        Table {
            name: name.to_string(),
            num_columns,
            key,
            db_root: db_root.to_path_buf(),
            pool,
            ranges,
            base_directory: HashMap::new(),
            tail_directory: HashMap::new(),
            index: ColumnIndex::new(num_columns, key),
            rid_counter,
            merge_threshold_pages: config.merge_threshold_pages,
            merge_scheduled,
            merge_tx,
            merge_handle: Some(merge_handle),
            dealloc_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn key(&self) -> usize {
        self.key
    }

    pub fn index(&self) -> &ColumnIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut ColumnIndex {
        &mut self.index
    }

    /// Rids of all live records, sorted.
    pub fn live_rids(&self) -> Vec<Rid> {
        let mut rids: Vec<Rid> = self.base_directory.keys().copied().collect();
        rids.sort_unstable();
        rids
    }

    /// Page ranges currently queued or running on the merge worker.
    pub fn pending_merges(&self) -> usize {
        self.merge_scheduled.lock().len()
    }

    fn total_columns(&self) -> usize {
        METADATA_COLUMNS + self.num_columns
    }

    fn page_path(&self, kind: PageKind, range: usize, column: usize, page: usize) -> PathBuf {
        storage::page_path(&self.db_root, &self.name, kind, range, column, page)
    }

    fn pin(&self, kind: PageKind, range: usize, column: usize, page: usize) -> DbResult<PinnedPage> {
        PinnedPage::acquire(&self.pool, self.page_path(kind, range, column, page))
    }

    fn next_rid(&mut self) -> Rid {
        let rid = self.rid_counter;
        self.rid_counter += 1;
        rid
    }

    /// Append a new base record and return its rid.
    ///
    /// Key uniqueness is the caller's concern; the query layer enforces it
    /// through the key-column index.
    pub fn insert(&mut self, values: &[i64]) -> DbResult<Rid> {
        if values.len() != self.num_columns {
            return Err(DbError::Table(format!(
                "expected {} columns, got {}",
                self.num_columns,
                values.len()
            )));
        }
        let rid = self.next_rid();
        let total_columns = self.total_columns();

        let mut row = Vec::with_capacity(total_columns);
        row.push(0); // indirection: no tail chain yet
        row.push(rid as i64);
        row.push(now_seconds());
        row.push(0); // schema encoding: base records carry no update bitmap
        row.push(rid as i64); // base rid
        row.extend_from_slice(values);

        let (range_idx, page_idx, slot) = {
            let mut ranges = self.ranges.write();
            if !ranges.last().is_some_and(|r| r.base_has_capacity()) {
                ranges.push(PageRange::new(total_columns));
            }
            let range_idx = ranges.len() - 1;
            let range = &mut ranges[range_idx];
            if range.base_page_count() == 0 {
                range.add_base_page()?;
            }

            // roll to a fresh base page when the current one is full
            {
                let last = range.base_page_count() - 1;
                let page0 = self.pin(PageKind::Base, range_idx, 0, range.base_pages[0][last])?;
                if !page0.has_capacity() {
                    drop(page0);
                    range.add_base_page()?;
                }
            }
            let page_idx = range.base_page_count() - 1;

            let mut slot = 0;
            for (column, value) in row.iter().enumerate() {
                let page = self.pin(
                    PageKind::Base,
                    range_idx,
                    column,
                    range.base_pages[column][page_idx],
                )?;
                if column == 0 {
                    slot = page.len();
                }
                page.write(*value)?;
                page.mark_dirty();
            }
            (range_idx, page_idx, slot)
        };

        self.base_directory.insert(
            rid,
            RecordLocation {
                range: range_idx,
                page: page_idx,
                slot,
            },
        );
        for (column, value) in values.iter().enumerate() {
            self.index.add(column, *value, rid);
        }
        Ok(rid)
    }

    /// Latest-version read of one user column.
    pub fn read(&self, rid: Rid, column: usize) -> DbResult<i64> {
        self.read_version(rid, column, 0)
    }

    /// Read one user column of a record.
    ///
    /// `relative_version == 0` resolves the latest version by walking the
    /// tail chain until a tail row carries the column; any other value
    /// returns the value as originally inserted.
    pub fn read_version(&self, rid: Rid, column: usize, relative_version: i64) -> DbResult<i64> {
        if column >= self.num_columns {
            return Err(DbError::Table(format!("column {column} out of range")));
        }
        let loc = *self
            .base_directory
            .get(&rid)
            .ok_or_else(|| DbError::Table(format!("unknown rid {rid}")))?;

        let ranges = self.ranges.read();
        let range = ranges
            .get(loc.range)
            .ok_or_else(|| DbError::Table(format!("page range {} missing", loc.range)))?;

        let head = {
            let indir = self.pin(
                PageKind::Base,
                loc.range,
                INDIRECTION_COLUMN,
                range.base_pages[INDIRECTION_COLUMN][loc.page],
            )?;
            indir.read(loc.slot)?
        };

        if relative_version == 0 && head != 0 {
            let mut tail_rid = head as Rid;
            while tail_rid != 0 {
                let tail_loc = *self
                    .tail_directory
                    .get(&tail_rid)
                    .ok_or_else(|| DbError::Table(format!("unknown tail rid {tail_rid}")))?;
                let tail_range = ranges
                    .get(tail_loc.range)
                    .ok_or_else(|| DbError::Table(format!("page range {} missing", tail_loc.range)))?;

                let schema = {
                    let page = self.pin(
                        PageKind::Tail,
                        tail_loc.range,
                        SCHEMA_ENCODING_COLUMN,
                        tail_range.tail_pages[SCHEMA_ENCODING_COLUMN][tail_loc.page],
                    )?;
                    page.read(tail_loc.slot)?
                };
                if (schema >> column) & 1 == 1 {
                    let page = self.pin(
                        PageKind::Tail,
                        tail_loc.range,
                        METADATA_COLUMNS + column,
                        tail_range.tail_pages[METADATA_COLUMNS + column][tail_loc.page],
                    )?;
                    return page.read(tail_loc.slot);
                }

                // this tail row does not carry the column; follow the chain
                tail_rid = {
                    let page = self.pin(
                        PageKind::Tail,
                        tail_loc.range,
                        INDIRECTION_COLUMN,
                        tail_range.tail_pages[INDIRECTION_COLUMN][tail_loc.page],
                    )?;
                    page.read(tail_loc.slot)? as Rid
                };
            }
        }

        let page = self.pin(
            PageKind::Base,
            loc.range,
            METADATA_COLUMNS + column,
            range.base_pages[METADATA_COLUMNS + column][loc.page],
        )?;
        page.read(loc.slot)
    }

    /// Record a tail row carrying the non-null cells of `values` and
    /// re-point the base record's lineage head at it.
    pub fn update(&mut self, rid: Rid, values: &[Option<i64>]) -> DbResult<()> {
        if values.len() != self.num_columns {
            return Err(DbError::Table(format!(
                "expected {} columns, got {}",
                self.num_columns,
                values.len()
            )));
        }
        let loc = *self
            .base_directory
            .get(&rid)
            .ok_or_else(|| DbError::Table(format!("unknown rid {rid}")))?;

        // index maintenance needs the pre-update latest value of every
        // indexed column this update touches
        let mut old_values: Vec<Option<i64>> = vec![None; self.num_columns];
        for (column, value) in values.iter().enumerate() {
            if value.is_some() && self.index.is_indexed(column) {
                old_values[column] = Some(self.read_version(rid, column, 0)?);
            }
        }

        let tail_rid = self.next_rid();
        let mut schema: i64 = 0;
        let mut user_cells = Vec::with_capacity(self.num_columns);
        for (column, value) in values.iter().enumerate() {
            match value {
                Some(v) => {
                    schema |= 1 << column;
                    user_cells.push(*v);
                }
                None => user_cells.push(0), // sentinel for "cell not carried"
            }
        }

        let (tail_page_idx, slot, tail_page_count) = {
            let mut ranges = self.ranges.write();
            let range = ranges
                .get_mut(loc.range)
                .ok_or_else(|| DbError::Table(format!("page range {} missing", loc.range)))?;

            let base_indir = self.pin(
                PageKind::Base,
                loc.range,
                INDIRECTION_COLUMN,
                range.base_pages[INDIRECTION_COLUMN][loc.page],
            )?;
            let prev_tail = base_indir.read(loc.slot)?;

            let mut row = Vec::with_capacity(self.total_columns());
            row.push(prev_tail);
            row.push(tail_rid as i64);
            row.push(now_seconds());
            row.push(schema);
            row.push(rid as i64);
            row.extend_from_slice(&user_cells);

            // roll to a fresh tail page when the current one is full
            {
                let last = range.tail_page_count() - 1;
                let page0 = self.pin(PageKind::Tail, loc.range, 0, range.tail_pages[0][last])?;
                if !page0.has_capacity() {
                    drop(page0);
                    range.add_tail_page();
                }
            }
            let tail_page_idx = range.tail_page_count() - 1;

            let mut slot = 0;
            for (column, value) in row.iter().enumerate() {
                let page = self.pin(
                    PageKind::Tail,
                    loc.range,
                    column,
                    range.tail_pages[column][tail_page_idx],
                )?;
                if column == 0 {
                    slot = page.len();
                }
                page.write(*value)?;
                page.mark_dirty();
            }

            // publish the new version to readers
            base_indir.update(loc.slot, tail_rid as i64)?;
            base_indir.mark_dirty();

            (tail_page_idx, slot, range.tail_page_count())
        };

        self.tail_directory.insert(
            tail_rid,
            RecordLocation {
                range: loc.range,
                page: tail_page_idx,
                slot,
            },
        );

        for (column, value) in values.iter().enumerate() {
            if let Some(new_value) = value
                && self.index.is_indexed(column)
            {
                if let Some(old_value) = old_values[column] {
                    self.index.remove(column, old_value, rid);
                }
                self.index.add(column, *new_value, rid);
            }
        }

        if tail_page_count >= self.merge_threshold_pages {
            self.schedule_merge(loc.range);
        }
        Ok(())
    }

    fn schedule_merge(&self, range_idx: usize) {
        let mut scheduled = self.merge_scheduled.lock();
        if scheduled.insert(range_idx) && self.merge_tx.send(MergeJob::Range(range_idx)).is_err() {
            warn!(table = %self.name, range = range_idx, "merge worker unavailable");
            scheduled.remove(&range_idx);
        }
    }

    /// Tombstone a base record: zero its rid and indirection slots so reads
    /// short-circuit, and drop the directory entry. Index maintenance is
    /// the caller's job (current values must be read out beforehand).
    pub fn delete(&mut self, rid: Rid) -> DbResult<()> {
        let loc = *self
            .base_directory
            .get(&rid)
            .ok_or_else(|| DbError::Table(format!("unknown rid {rid}")))?;
        {
            let ranges = self.ranges.read();
            let range = ranges
                .get(loc.range)
                .ok_or_else(|| DbError::Table(format!("page range {} missing", loc.range)))?;

            let rid_page = self.pin(
                PageKind::Base,
                loc.range,
                RID_COLUMN,
                range.base_pages[RID_COLUMN][loc.page],
            )?;
            rid_page.update(loc.slot, 0)?;
            rid_page.mark_dirty();
            drop(rid_page);

            let indir_page = self.pin(
                PageKind::Base,
                loc.range,
                INDIRECTION_COLUMN,
                range.base_pages[INDIRECTION_COLUMN][loc.page],
            )?;
            indir_page.update(loc.slot, 0)?;
            indir_page.mark_dirty();
        }
        self.base_directory.remove(&rid);
        Ok(())
    }

    /// Build an index for `column` and backfill it with the latest value of
    /// every live record. Existing indexes are left untouched.
    pub fn create_index(&mut self, column: usize) -> DbResult<()> {
        if column >= self.num_columns {
            return Err(DbError::Table(format!("column {column} out of range")));
        }
        if self.index.is_indexed(column) {
            return Ok(());
        }
        self.index.create_index(column);
        for rid in self.live_rids() {
            let value = self.read_version(rid, column, 0)?;
            self.index.add(column, value, rid);
        }
        Ok(())
    }

    pub fn drop_index(&mut self, column: usize) {
        self.index.drop_index(column);
    }

    /// Persist `meta.json`. Page contents are flushed separately through
    /// the buffer pool.
    pub fn flush(&self) -> DbResult<()> {
        let dir = storage::table_dir(&self.db_root, &self.name);
        fs::create_dir_all(&dir)?;

        let (num_page_ranges, base_pages, tail_pages) = {
            let ranges = self.ranges.read();
            (
                ranges.len(),
                ranges.iter().map(|r| r.base_pages.clone()).collect(),
                ranges.iter().map(|r| r.tail_pages.clone()).collect(),
            )
        };
        let meta = TableMeta {
            name: self.name.clone(),
            num_columns: self.num_columns,
            key: self.key,
            rid_counter: self.rid_counter,
            num_page_ranges,
            base_pages,
            tail_pages,
        };
        let json = serde_json::to_string_pretty(&meta)
            .map_err(|e| DbError::Table(format!("encode metadata: {e}")))?;
        fs::write(dir.join("meta.json"), json)?;
        Ok(())
    }

    fn rebuild_directories(&mut self) -> DbResult<()> {
        self.base_directory.clear();
        self.tail_directory.clear();

        let rid_pages: Vec<(Vec<usize>, Vec<usize>)> = {
            let ranges = self.ranges.read();
            ranges
                .iter()
                .map(|r| {
                    (
                        r.base_pages[RID_COLUMN].clone(),
                        r.tail_pages[RID_COLUMN].clone(),
                    )
                })
                .collect()
        };

        for (range_idx, (base_ids, tail_ids)) in rid_pages.iter().enumerate() {
            for (page_idx, &page_id) in tail_ids.iter().enumerate() {
                let page = self.pin(PageKind::Tail, range_idx, RID_COLUMN, page_id)?;
                for slot in 0..page.len() {
                    let tail_rid = page.read(slot)?;
                    if tail_rid == 0 {
                        continue;
                    }
                    self.tail_directory.insert(
                        tail_rid as Rid,
                        RecordLocation {
                            range: range_idx,
                            page: page_idx,
                            slot,
                        },
                    );
                }
            }
            for (page_idx, &page_id) in base_ids.iter().enumerate() {
                let page = self.pin(PageKind::Base, range_idx, RID_COLUMN, page_id)?;
                for slot in 0..page.len() {
                    let rid = page.read(slot)?;
                    if rid == 0 {
                        // tombstone
                        continue;
                    }
                    self.base_directory.insert(
                        rid as Rid,
                        RecordLocation {
                            range: range_idx,
                            page: page_idx,
                            slot,
                        },
                    );
                }
            }
        }
        Ok(())
    }

    fn rebuild_key_index(&mut self) -> DbResult<()> {
        self.index = ColumnIndex::new(self.num_columns, self.key);
        for rid in self.live_rids() {
            let value = self.read_version(rid, self.key, 0)?;
            self.index.add(self.key, value, rid);
        }
        Ok(())
    }

    /// Stop the merge worker and wait for it to drain. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.merge_handle.take() {
            let _ = self.merge_tx.send(MergeJob::Shutdown);
            if handle.join().is_err() {
                warn!(table = %self.name, "merge worker panicked");
            }
        }
    }

    /// Delete old-generation base page files surrendered by completed
    /// merges. Ids that are still referenced by the live generation are
    /// kept; failures are logged, never surfaced.
    pub fn collect_garbage(&self) {
        let ranges = self.ranges.read();
        while let Ok((range_idx, old_ids)) = self.dealloc_rx.try_recv() {
            let Some(range) = ranges.get(range_idx) else {
                continue;
            };
            for (column, page_ids) in old_ids.iter().enumerate() {
                for &page_id in page_ids {
                    let live = range
                        .base_pages
                        .get(column)
                        .is_some_and(|ids| ids.contains(&page_id));
                    if live {
                        continue;
                    }
                    let path = self.page_path(PageKind::Base, range_idx, column, page_id);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to remove stale page file")
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}
