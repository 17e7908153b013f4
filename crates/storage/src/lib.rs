//! Fixed-size columnar pages and their on-disk files.
//!
//! A [`Page`] holds up to [`SLOTS_PER_PAGE`] 64-bit little-endian integers.
//! The wire format is exactly `HEADER ‖ PAYLOAD`: an 8-byte little-endian
//! slot count followed by the 4096-byte payload, 4104 bytes total. One page
//! is materialized as one file per (page kind, range, column, page id)
//! tuple; [`page_path`] computes the stable path for that tuple.


use common::{
    DbError, DbResult, HEADER_SIZE, INT_SIZE, PAGE_SIZE, PageKind, SLOTS_PER_PAGE,
};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;

/// Total byte length of one serialized page file.
pub const PAGE_FILE_SIZE: usize = HEADER_SIZE + PAGE_SIZE;

/// Fixed-capacity container of 64-bit integers.
///
/// Slots are append-only through [`Page::write`]; [`Page::update`] may
/// overwrite an already occupied slot in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    num_slots: usize,
    data: Vec<u8>,
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// An empty page with a zeroed payload.
    pub fn new() -> Self {
        Self {
            num_slots: 0,
            data: vec![0u8; PAGE_SIZE],
        }
    }

    /// Count of occupied slots.
    pub fn len(&self) -> usize {
        self.num_slots
    }

    pub fn is_empty(&self) -> bool {
        self.num_slots == 0
    }

    /// Whether another value can be appended.
    pub fn has_capacity(&self) -> bool {
        self.num_slots < SLOTS_PER_PAGE
    }

    /// Append `value` to the next free slot.
    pub fn write(&mut self, value: i64) -> DbResult<()> {
        if !self.has_capacity() {
            return Err(DbError::Storage("page is full".into()));
        }
        let start = self.num_slots * INT_SIZE;
        self.data[start..start + INT_SIZE].copy_from_slice(&value.to_le_bytes());
        self.num_slots += 1;
        Ok(())
    }

    /// Value of slot `slot`; bounded by the occupied count.
    pub fn read(&self, slot: usize) -> DbResult<i64> {
        if slot >= self.num_slots {
            return Err(DbError::Storage(format!(
                "slot {slot} out of bounds (page holds {})",
                self.num_slots
            )));
        }
        let start = slot * INT_SIZE;
        let mut buf = [0u8; INT_SIZE];
        buf.copy_from_slice(&self.data[start..start + INT_SIZE]);
        Ok(i64::from_le_bytes(buf))
    }

    /// Overwrite the already occupied slot `slot` in place.
    pub fn update(&mut self, slot: usize, value: i64) -> DbResult<()> {
        if slot >= self.num_slots {
            return Err(DbError::Storage(format!(
                "slot {slot} out of bounds (page holds {})",
                self.num_slots
            )));
        }
        let start = slot * INT_SIZE;
        self.data[start..start + INT_SIZE].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Serialize to the on-disk layout: slot count header, then payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(PAGE_FILE_SIZE);
        raw.extend_from_slice(&(self.num_slots as u64).to_le_bytes());
        raw.extend_from_slice(&self.data);
        raw
    }

    /// Rebuild a page from its on-disk layout. Rejects blobs whose length is
    /// not exactly [`PAGE_FILE_SIZE`] or whose header exceeds the slot
    /// capacity.
    pub fn from_bytes(raw: &[u8]) -> DbResult<Page> {
        if raw.len() != PAGE_FILE_SIZE {
            return Err(DbError::Storage(format!(
                "page blob must be {PAGE_FILE_SIZE} bytes, got {}",
                raw.len()
            )));
        }
        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&raw[..HEADER_SIZE]);
        let num_slots = u64::from_le_bytes(header) as usize;
        if num_slots > SLOTS_PER_PAGE {
            return Err(DbError::Storage(format!(
                "page header claims {num_slots} slots, capacity is {SLOTS_PER_PAGE}"
            )));
        }
        Ok(Page {
            num_slots,
            data: raw[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Directory holding one table's files under the database root.
pub fn table_dir(db_root: &Path, table: &str) -> PathBuf {
    db_root.join("tables").join(table)
}

/// Path of one columnar page file:
/// `<root>/tables/<table>/<kind>/range_<R>/col_<C>_page_<P>.bin`.
pub fn page_path(
    db_root: &Path,
    table: &str,
    kind: PageKind,
    range: usize,
    column: usize,
    page: usize,
) -> PathBuf {
    table_dir(db_root, table)
        .join(kind.as_str())
        .join(format!("range_{range}"))
        .join(format!("col_{column}_page_{page}.bin"))
}

/// Read a page file. A missing file is not an error: pages are allocated
/// lazily, so it yields a fresh empty page.
pub fn read_page(path: &Path) -> DbResult<Page> {
    match fs::read(path) {
        Ok(raw) => Page::from_bytes(&raw),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Page::new()),
        Err(e) => Err(e.into()),
    }
}

/// Durably replace the page file at `path`: the bytes go to a uniquely
/// named temporary file in the target directory, are flushed to disk, and
/// the temporary is atomically renamed over the destination. Parent
/// directories are created on demand.
pub fn write_page(path: &Path, page: &Page) -> DbResult<()> {
    let dir = path.parent().ok_or_else(|| {
        DbError::Storage(format!("page path has no parent: {}", path.display()))
    })?;
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DbError::Storage(format!("invalid page path: {}", path.display())))?;
    let tmp = dir.join(format!("{file_name}.{:?}.tmp", thread::current().id()));

    let mut file = File::create(&tmp)?;
    file.write_all(&page.to_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
