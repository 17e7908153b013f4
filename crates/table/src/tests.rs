use super::*;
use buffer::BufferPool;
use common::Config;
use std::time::Duration;
use tempfile::{TempDir, tempdir};

fn test_config(merge_threshold_pages: usize) -> Config {
    Config::builder()
        .merge_threshold_pages(merge_threshold_pages)
        .build()
}

fn make_table(num_columns: usize, key: usize, merge_threshold_pages: usize) -> (Table, TempDir) {
    let dir = tempdir().unwrap();
    let pool = BufferPool::shared(64);
    let table = Table::create(
        dir.path(),
        "grades",
        num_columns,
        key,
        pool,
        &test_config(merge_threshold_pages),
    )
    .unwrap();
    (table, dir)
}

fn wait_for_merges(table: &Table) {
    for _ in 0..500 {
        if table.pending_merges() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("merge worker did not drain");
}

#[test]
fn insert_then_read_returns_inserted_values() {
    let (mut table, _dir) = make_table(3, 0, 10);

    let rid1 = table.insert(&[1, 10, 100]).unwrap();
    let rid2 = table.insert(&[2, 20, 200]).unwrap();

    assert_eq!(table.read_version(rid1, 1, 0).unwrap(), 10);
    assert_eq!(table.read_version(rid2, 2, 0).unwrap(), 200);
    for column in 0..3 {
        assert_eq!(
            table.read(rid1, column).unwrap(),
            [1, 10, 100][column] as i64
        );
    }
}

#[test]
fn insert_rejects_wrong_arity() {
    let (mut table, _dir) = make_table(3, 0, 10);
    assert!(table.insert(&[1, 2]).is_err());
    assert!(table.insert(&[1, 2, 3, 4]).is_err());
}

#[test]
fn rids_are_strictly_increasing_and_never_zero() {
    let (mut table, _dir) = make_table(2, 0, 10);

    let rid1 = table.insert(&[1, 0]).unwrap();
    assert!(rid1 > 0);
    table.update(rid1, &[None, Some(5)]).unwrap();
    let rid2 = table.insert(&[2, 0]).unwrap();

    // the tail row consumed an id from the same sequence
    assert_eq!(rid2, rid1 + 2);
}

#[test]
fn inserts_roll_over_to_new_base_pages_and_stay_aligned() {
    let (mut table, dir) = make_table(2, 0, 10);

    let n = common::SLOTS_PER_PAGE + 40;
    let mut rids = Vec::new();
    for i in 0..n {
        rids.push(table.insert(&[i as i64, (i * 2) as i64]).unwrap());
    }

    {
        let ranges = table.ranges.read();
        assert_eq!(ranges.len(), 1);
        let counts: Vec<usize> = ranges[0].base_pages.iter().map(|ids| ids.len()).collect();
        assert!(counts.iter().all(|&c| c == 2), "misaligned columns: {counts:?}");
    }

    table.pool.lock().flush_all().unwrap();
    for column in 0..table.total_columns() {
        let page_id = table.ranges.read()[0].base_pages[column][1];
        let path = storage::page_path(dir.path(), "grades", PageKind::Base, 0, column, page_id);
        assert_eq!(storage::read_page(&path).unwrap().len(), 40);
    }

    for (i, &rid) in rids.iter().enumerate() {
        assert_eq!(table.read(rid, 0).unwrap(), i as i64);
        assert_eq!(table.read(rid, 1).unwrap(), (i * 2) as i64);
    }
}

#[test]
fn inserts_spill_into_a_second_page_range() {
    let (mut table, _dir) = make_table(1, 0, 10);

    let n = common::MAX_BASE_PAGES * common::SLOTS_PER_PAGE + 1;
    let mut last = 0;
    for i in 0..n {
        last = table.insert(&[i as i64]).unwrap();
    }

    assert_eq!(table.ranges.read().len(), 2);
    assert_eq!(table.read(last, 0).unwrap(), (n - 1) as i64);
    let loc = table.base_directory[&last];
    assert_eq!((loc.range, loc.page, loc.slot), (1, 0, 0));
}

#[test]
fn update_changes_only_the_carried_columns() {
    let (mut table, _dir) = make_table(3, 0, 10);

    let rid = table.insert(&[7, 70, 700]).unwrap();
    table.update(rid, &[None, Some(71), None]).unwrap();

    assert_eq!(table.read_version(rid, 0, 0).unwrap(), 7);
    assert_eq!(table.read_version(rid, 1, 0).unwrap(), 71);
    assert_eq!(table.read_version(rid, 2, 0).unwrap(), 700);
}

#[test]
fn nonzero_relative_version_reads_the_base_values() {
    let (mut table, _dir) = make_table(3, 0, 10);

    let rid = table.insert(&[7, 70, 700]).unwrap();
    table.update(rid, &[None, Some(71), None]).unwrap();
    table.update(rid, &[None, Some(72), Some(720)]).unwrap();

    assert_eq!(table.read_version(rid, 1, 0).unwrap(), 72);
    assert_eq!(table.read_version(rid, 1, -1).unwrap(), 70);
    assert_eq!(table.read_version(rid, 1, -2).unwrap(), 70);
    assert_eq!(table.read_version(rid, 2, -1).unwrap(), 700);
}

#[test]
fn latest_read_walks_past_tail_rows_missing_the_column() {
    let (mut table, _dir) = make_table(3, 0, 10);

    let rid = table.insert(&[1, 10, 100]).unwrap();
    table.update(rid, &[None, Some(11), None]).unwrap();
    table.update(rid, &[None, None, Some(101)]).unwrap();

    // newest tail row carries only column 2; column 1 resolves one hop back
    assert_eq!(table.read_version(rid, 1, 0).unwrap(), 11);
    assert_eq!(table.read_version(rid, 2, 0).unwrap(), 101);
    assert_eq!(table.read_version(rid, 0, 0).unwrap(), 1);
}

#[test]
fn updates_roll_over_to_new_tail_pages() {
    let (mut table, _dir) = make_table(2, 0, 100);

    let rid = table.insert(&[1, 0]).unwrap();
    let n = common::SLOTS_PER_PAGE + 25;
    for i in 0..n {
        table.update(rid, &[None, Some(i as i64)]).unwrap();
    }

    assert_eq!(table.ranges.read()[0].tail_page_count(), 2);
    assert_eq!(table.read_version(rid, 1, 0).unwrap(), (n - 1) as i64);
    assert_eq!(table.read_version(rid, 0, 0).unwrap(), 1);
}

#[test]
fn update_rejects_unknown_rid_and_wrong_arity() {
    let (mut table, _dir) = make_table(2, 0, 10);
    let rid = table.insert(&[1, 2]).unwrap();

    assert!(table.update(9999, &[None, Some(1)]).is_err());
    assert!(table.update(rid, &[None]).is_err());
}

#[test]
fn delete_tombstones_the_record() {
    let (mut table, _dir) = make_table(2, 0, 10);

    let rid = table.insert(&[5, 50]).unwrap();
    table.update(rid, &[None, Some(51)]).unwrap();
    table.delete(rid).unwrap();

    assert!(table.read_version(rid, 0, 0).is_err());
    assert!(table.live_rids().is_empty());
    assert!(table.delete(rid).is_err());
}

#[test]
fn index_tracks_inserts_updates_and_latest_values() {
    let (mut table, _dir) = make_table(2, 0, 10);

    let rid = table.insert(&[5, 50]).unwrap();
    assert_eq!(table.index().locate(0, 5), vec![rid]);

    table.create_index(1).unwrap();
    assert_eq!(table.index().locate(1, 50), vec![rid]);

    table.update(rid, &[None, Some(51)]).unwrap();
    assert!(table.index().locate(1, 50).is_empty());
    assert_eq!(table.index().locate(1, 51), vec![rid]);
}

#[test]
fn create_index_backfills_from_the_latest_versions() {
    let (mut table, _dir) = make_table(2, 0, 10);

    let rid1 = table.insert(&[1, 10]).unwrap();
    let rid2 = table.insert(&[2, 20]).unwrap();
    table.update(rid1, &[None, Some(15)]).unwrap();

    table.create_index(1).unwrap();
    assert_eq!(table.index().locate(1, 15), vec![rid1]);
    assert_eq!(table.index().locate(1, 20), vec![rid2]);
    assert!(table.index().locate(1, 10).is_empty());

    table.drop_index(1);
    assert!(table.index().locate(1, 15).is_empty());
}

#[test]
fn table_creation_validates_shape() {
    let dir = tempdir().unwrap();
    let pool = BufferPool::shared(8);
    let config = test_config(10);

    assert!(Table::create(dir.path(), "", 2, 0, Arc::clone(&pool), &config).is_err());
    assert!(Table::create(dir.path(), "t", 0, 0, Arc::clone(&pool), &config).is_err());
    assert!(Table::create(dir.path(), "t", 2, 2, Arc::clone(&pool), &config).is_err());
    assert!(Table::create(dir.path(), "t", 64, 0, Arc::clone(&pool), &config).is_err());
}

#[test]
fn merge_folds_the_latest_tail_value_into_the_base_generation() {
    let (mut table, dir) = make_table(3, 0, 1);

    let rid = table.insert(&[1, 10, 100]).unwrap();
    let mut last = 0;
    for i in 1..=11 {
        last = 1000 + i;
        table.update(rid, &[None, Some(last), None]).unwrap();
        wait_for_merges(&table);
    }

    // the base generation on disk now stores the folded value at the slot
    let loc = table.base_directory[&rid];
    let page_id = table.ranges.read()[0].base_pages[METADATA_COLUMNS + 1][loc.page];
    let path = storage::page_path(
        dir.path(),
        "grades",
        PageKind::Base,
        0,
        METADATA_COLUMNS + 1,
        page_id,
    );
    assert_eq!(storage::read_page(&path).unwrap().read(loc.slot).unwrap(), last);

    // and visibility through the table is unchanged
    assert_eq!(table.read_version(rid, 1, 0).unwrap(), last);
    assert_eq!(table.read_version(rid, 0, 0).unwrap(), 1);
    assert_eq!(table.read_version(rid, 2, 0).unwrap(), 100);
}

#[test]
fn merge_preserves_visibility_for_every_record() {
    let (mut table, _dir) = make_table(2, 0, 1);

    let mut rids = Vec::new();
    for i in 0..50 {
        rids.push(table.insert(&[i, i * 10]).unwrap());
    }
    for (i, &rid) in rids.iter().enumerate() {
        table.update(rid, &[None, Some(i as i64 * 10 + 1)]).unwrap();
        wait_for_merges(&table);
    }

    for (i, &rid) in rids.iter().enumerate() {
        assert_eq!(table.read_version(rid, 0, 0).unwrap(), i as i64);
        assert_eq!(table.read_version(rid, 1, 0).unwrap(), i as i64 * 10 + 1);
    }
}

#[test]
fn merge_skips_deleted_records() {
    let (mut table, _dir) = make_table(2, 0, 1);

    let keep = table.insert(&[1, 10]).unwrap();
    let gone = table.insert(&[2, 20]).unwrap();
    table.update(gone, &[None, Some(21)]).unwrap();
    table.update(keep, &[None, Some(11)]).unwrap();
    wait_for_merges(&table);

    table.delete(gone).unwrap();
    table.update(keep, &[None, Some(12)]).unwrap();
    wait_for_merges(&table);

    assert_eq!(table.read_version(keep, 1, 0).unwrap(), 12);
    assert!(table.read_version(gone, 1, 0).is_err());
}

#[test]
fn garbage_collection_removes_only_superseded_generations() {
    let (mut table, dir) = make_table(2, 0, 1);

    let rid = table.insert(&[1, 10]).unwrap();
    table.update(rid, &[None, Some(11)]).unwrap();
    wait_for_merges(&table);

    // the first generation used page id 0; the live one is id 1
    let old_path = storage::page_path(dir.path(), "grades", PageKind::Base, 0, RID_COLUMN, 0);
    let live_id = table.ranges.read()[0].base_pages[RID_COLUMN][0];
    assert_eq!(live_id, 1);

    table.pool.lock().flush_all().unwrap();
    assert!(old_path.exists());
    table.collect_garbage();
    assert!(!old_path.exists());

    let live_path =
        storage::page_path(dir.path(), "grades", PageKind::Base, 0, RID_COLUMN, live_id);
    assert!(live_path.exists());
    assert_eq!(table.read_version(rid, 1, 0).unwrap(), 11);
}

#[test]
fn flush_and_open_round_trip() {
    let dir = tempdir().unwrap();
    let config = test_config(10);
    let mut expected = Vec::new();

    {
        let pool = BufferPool::shared(64);
        let mut table =
            Table::create(dir.path(), "grades", 3, 0, Arc::clone(&pool), &config).unwrap();
        for i in 0..600i64 {
            let rid = table.insert(&[i, i * 2, i * 3]).unwrap();
            expected.push((rid, [i, i * 2, i * 3]));
        }
        for (rid, values) in expected.iter_mut().take(100) {
            values[1] += 1;
            table.update(*rid, &[None, Some(values[1]), None]).unwrap();
        }
        table.shutdown();
        pool.lock().flush_all().unwrap();
        table.flush().unwrap();
    }

    let pool = BufferPool::shared(64);
    let mut table = Table::open(dir.path(), "grades", pool, &config).unwrap();

    assert_eq!(table.live_rids().len(), 600);
    for (rid, values) in &expected {
        for column in 0..3 {
            assert_eq!(table.read_version(*rid, column, 0).unwrap(), values[column]);
        }
    }

    // the rid sequence continues past everything handed out before
    let max_rid = expected.iter().map(|(rid, _)| *rid).max().unwrap();
    let fresh = table.insert(&[9000, 0, 0]).unwrap();
    assert!(fresh > max_rid + 100);

    // the key index was rebuilt from the latest values
    assert_eq!(table.index().locate(0, 599), vec![expected[599].0]);
}

#[test]
fn reload_skips_tombstoned_slots() {
    let dir = tempdir().unwrap();
    let config = test_config(10);

    let (kept_rid, deleted_rid);
    {
        let pool = BufferPool::shared(16);
        let mut table =
            Table::create(dir.path(), "grades", 2, 0, Arc::clone(&pool), &config).unwrap();
        kept_rid = table.insert(&[1, 10]).unwrap();
        deleted_rid = table.insert(&[2, 20]).unwrap();
        table.delete(deleted_rid).unwrap();
        table.shutdown();
        pool.lock().flush_all().unwrap();
        table.flush().unwrap();
    }

    let pool = BufferPool::shared(16);
    let table = Table::open(dir.path(), "grades", pool, &config).unwrap();

    assert_eq!(table.live_rids(), vec![kept_rid]);
    assert!(table.read_version(deleted_rid, 0, 0).is_err());
    assert_eq!(table.read_version(kept_rid, 1, 0).unwrap(), 10);
}
