//! Background consolidation of tail updates into a new base-page generation.
//!
//! The worker folds the latest committed tail value of every user column
//! into fresh copies of the range's base pages, written under new page ids,
//! then flips the range's base-page-id table to the new generation. Slot
//! coordinates are preserved, so record directories stay valid without a
//! rebuild and live reads are never stopped. Page contents are obtained
//! through pool-bypassing snapshots, so the scan neither pins frames nor
//! races in-place mutation of live pages.

use buffer::SharedPool;
use common::{
    BASE_RID_COLUMN, DbResult, INDIRECTION_COLUMN, METADATA_COLUMNS, PageKind, RID_COLUMN, Rid,
    SCHEMA_ENCODING_COLUMN,
};
use crossbeam_channel::{Receiver, Sender};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::Arc;
use storage::Page;
use tracing::{debug, warn};

use crate::range::PageRange;

/// Old-generation base page ids surrendered by a completed merge, queued
/// for deferred file deletion.
pub(crate) type Dealloc = (usize, Vec<Vec<usize>>);

pub(crate) enum MergeJob {
    Range(usize),
    Shutdown,
}

/// Everything the worker thread needs, detached from the owning table.
pub(crate) struct MergeContext {
    pub(crate) db_root: PathBuf,
    pub(crate) table: String,
    pub(crate) num_columns: usize,
    pub(crate) pool: SharedPool,
    pub(crate) ranges: Arc<RwLock<Vec<PageRange>>>,
    pub(crate) scheduled: Arc<Mutex<HashSet<usize>>>,
    pub(crate) dealloc_tx: Sender<Dealloc>,
}

impl MergeContext {
    fn page_path(&self, kind: PageKind, range: usize, column: usize, page: usize) -> PathBuf {
        storage::page_path(&self.db_root, &self.table, kind, range, column, page)
    }

    fn snapshot(&self, kind: PageKind, range: usize, column: usize, page: usize) -> DbResult<Page> {
        self.pool
            .lock()
            .snapshot(&self.page_path(kind, range, column, page))
    }

    fn total_columns(&self) -> usize {
        METADATA_COLUMNS + self.num_columns
    }
}

/// Worker loop: one job per queued page range, until the shutdown sentinel
/// (or a disconnected queue). A failed merge is logged and dropped; the
/// worker keeps draining.
pub(crate) fn run(ctx: MergeContext, jobs: Receiver<MergeJob>) {
    loop {
        match jobs.recv() {
            Ok(MergeJob::Range(range_idx)) => {
                debug!(table = %ctx.table, range = range_idx, "merge started");
                match merge_page_range(&ctx, range_idx) {
                    Ok(()) => debug!(table = %ctx.table, range = range_idx, "merge finished"),
                    Err(e) => {
                        warn!(table = %ctx.table, range = range_idx, error = %e, "merge failed")
                    }
                }
                ctx.scheduled.lock().remove(&range_idx);
            }
            Ok(MergeJob::Shutdown) | Err(_) => break,
        }
    }
}

fn merge_page_range(ctx: &MergeContext, range_idx: usize) -> DbResult<()> {
    // point-in-time copy of the page-id tables; the old base ids stay live
    // until the flip below
    let (base_ids, tail_ids) = {
        let ranges = ctx.ranges.read();
        let Some(range) = ranges.get(range_idx) else {
            return Ok(());
        };
        (range.base_pages.clone(), range.tail_pages.clone())
    };

    let base_page_count = base_ids.first().map_or(0, |column| column.len());
    if base_page_count == 0 {
        return Ok(());
    }
    let total_columns = ctx.total_columns();

    // drafts start as copies of the current generation; new ids are offset
    // past the live id table so the two generations never collide
    let mut drafts: Vec<Vec<Page>> = Vec::with_capacity(total_columns);
    let mut new_ids: Vec<Vec<usize>> = Vec::with_capacity(total_columns);
    for column in 0..total_columns {
        let mut column_drafts = Vec::with_capacity(base_page_count);
        let mut column_ids = Vec::with_capacity(base_page_count);
        for page_idx in 0..base_page_count {
            let old_id = base_ids[column][page_idx];
            column_drafts.push(ctx.snapshot(PageKind::Base, range_idx, column, old_id)?);
            column_ids.push(base_ids[column].len() + page_idx);
        }
        drafts.push(column_drafts);
        new_ids.push(column_ids);
    }

    // live base rids and their coordinates, from the rid drafts
    let mut base_lookup: HashMap<Rid, (usize, usize)> = HashMap::new();
    for (page_idx, rid_page) in drafts[RID_COLUMN].iter().enumerate() {
        for slot in 0..rid_page.len() {
            let rid = rid_page.read(slot)?;
            if rid == 0 {
                continue;
            }
            base_lookup.insert(rid as Rid, (page_idx, slot));
        }
    }

    // walk tail rows newest to oldest; a base rid is finished at its first
    // hit, so only the latest tail row's columns contribute
    let mut seen: HashSet<Rid> = HashSet::new();
    let tail_page_count = tail_ids.first().map_or(0, |column| column.len());
    if !base_lookup.is_empty() {
        'pages: for tail_page_idx in (0..tail_page_count).rev() {
            let rid_page = ctx.snapshot(
                PageKind::Tail,
                range_idx,
                RID_COLUMN,
                tail_ids[RID_COLUMN][tail_page_idx],
            )?;
            let base_rid_page = ctx.snapshot(
                PageKind::Tail,
                range_idx,
                BASE_RID_COLUMN,
                tail_ids[BASE_RID_COLUMN][tail_page_idx],
            )?;
            let schema_page = ctx.snapshot(
                PageKind::Tail,
                range_idx,
                SCHEMA_ENCODING_COLUMN,
                tail_ids[SCHEMA_ENCODING_COLUMN][tail_page_idx],
            )?;
            let mut value_pages: HashMap<usize, Page> = HashMap::new();

            for slot in (0..rid_page.len()).rev() {
                if slot >= base_rid_page.len() {
                    continue;
                }
                let base_rid = base_rid_page.read(slot)? as Rid;
                let Some(&(base_page_idx, base_slot)) = base_lookup.get(&base_rid) else {
                    continue;
                };
                if !seen.insert(base_rid) {
                    continue;
                }

                let schema = schema_page.read(slot)?;
                for user_column in 0..ctx.num_columns {
                    if (schema >> user_column) & 1 == 0 {
                        continue;
                    }
                    let column = METADATA_COLUMNS + user_column;
                    if !value_pages.contains_key(&column) {
                        let page = ctx.snapshot(
                            PageKind::Tail,
                            range_idx,
                            column,
                            tail_ids[column][tail_page_idx],
                        )?;
                        value_pages.insert(column, page);
                    }
                    let value_page = &value_pages[&column];
                    if slot >= value_page.len() {
                        continue;
                    }
                    let value = value_page.read(slot)?;
                    drafts[column][base_page_idx].update(base_slot, value)?;
                }

                if seen.len() == base_lookup.len() {
                    break 'pages;
                }
            }
        }
    }

    // persist the new generation; the indirection column is the one base
    // page the foreground mutates in place, so it is copied from the live
    // page after everything else, keeping updates that landed mid-merge
    for column in 0..total_columns {
        if column == INDIRECTION_COLUMN {
            continue;
        }
        for page_idx in 0..base_page_count {
            let path = ctx.page_path(PageKind::Base, range_idx, column, new_ids[column][page_idx]);
            storage::write_page(&path, &drafts[column][page_idx])?;
        }
    }
    for page_idx in 0..base_page_count {
        let live = ctx.snapshot(
            PageKind::Base,
            range_idx,
            INDIRECTION_COLUMN,
            base_ids[INDIRECTION_COLUMN][page_idx],
        )?;
        let path = ctx.page_path(
            PageKind::Base,
            range_idx,
            INDIRECTION_COLUMN,
            new_ids[INDIRECTION_COLUMN][page_idx],
        );
        storage::write_page(&path, &live)?;
    }

    // publish: readers see the whole old generation or the whole new one
    {
        let mut ranges = ctx.ranges.write();
        if let Some(range) = ranges.get_mut(range_idx) {
            for column in 0..total_columns {
                for page_idx in 0..base_page_count {
                    range.base_pages[column][page_idx] = new_ids[column][page_idx];
                }
            }
        }
    }

    let _ = ctx.dealloc_tx.send((range_idx, base_ids));
    Ok(())
}
