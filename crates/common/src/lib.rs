//! Shared identifiers, layout constants, errors, and configuration for the
//! columnar engine.
//!
//! Every record occupies one slot across `METADATA_COLUMNS + num_columns`
//! parallel columnar pages. The five metadata columns carry the lineage
//! bookkeeping (indirection pointer, rid, timestamp, schema bitmap, base
//! rid); user columns follow.

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Number of payload bytes in one page.
pub const PAGE_SIZE: usize = 4096;
/// Width of one stored integer in bytes.
pub const INT_SIZE: usize = 8;
/// Bytes of the on-disk slot-count header preceding the payload.
pub const HEADER_SIZE: usize = 8;
/// Occupied-slot capacity of a single page.
pub const SLOTS_PER_PAGE: usize = PAGE_SIZE / INT_SIZE;
/// Upper bound on base pages per column within one page range.
pub const MAX_BASE_PAGES: usize = 16;

/// Base records: id of the latest tail record, 0 when none.
/// Tail records: id of the previous tail record in the chain, 0 at the end.
pub const INDIRECTION_COLUMN: usize = 0;
/// Unique record id for the slot; 0 marks a tombstone or empty slot.
pub const RID_COLUMN: usize = 1;
/// Creation time of the base row / update time of the tail row, in seconds.
pub const TIMESTAMP_COLUMN: usize = 2;
/// 0 on base records; on tail records, a bitmap of the user columns the
/// update carries (bit `c` for user column `c`).
pub const SCHEMA_ENCODING_COLUMN: usize = 3;
/// Base record id shared by every tail row of one version chain.
pub const BASE_RID_COLUMN: usize = 4;
/// Count of metadata columns preceding the user columns.
pub const METADATA_COLUMNS: usize = 5;

/// Widest supported table: the schema bitmap must fit one signed 64-bit slot.
pub const MAX_USER_COLUMNS: usize = 63;

/// 64-bit record identifier, unique per table across base and tail records.
/// 0 is reserved as the tombstone / "no record" sentinel and is never handed
/// out.
pub type Rid = u64;

/// Which side of a page range a columnar page file belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PageKind {
    /// Primary storage, rewritten only by a merge.
    Base,
    /// Append-only delta storage, one physical row per update.
    Tail,
}

impl PageKind {
    /// Directory name under the table root.
    pub fn as_str(self) -> &'static str {
        match self {
            PageKind::Base => "base",
            PageKind::Tail => "tail",
        }
    }
}

/// Physical coordinates of one record slot.
///
/// For base records `page` indexes the per-column base-page list of the
/// range; for tail records it indexes the tail-page list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLocation {
    pub range: usize,
    pub page: usize,
    pub slot: usize,
}

/// Canonical error type shared across the engine's subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("buffer: {0}")]
    Buffer(String),
    #[error("table: {0}")]
    Table(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for the engine.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .buffer_pool_frames(64)
///     .merge_threshold_pages(10)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory where table data and metadata live.
    #[builder(default = PathBuf::from("./db_data"))]
    pub data_dir: PathBuf,
    /// Number of page frames the buffer pool keeps resident. Must comfortably
    /// exceed the number of pages a single operation pins at once.
    #[builder(default = 32)]
    pub buffer_pool_frames: usize,
    /// Tail-page count at which a page range is queued for merging.
    #[builder(default = 10)]
    pub merge_threshold_pages: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./db_data"),
            buffer_pool_frames: 32,
            merge_threshold_pages: 10,
        }
    }
}
