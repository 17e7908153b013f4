//! Buffer pool: a path-keyed page cache with pinning and LRU eviction.
//!
//! The pool sits between the table core and the page files, providing:
//! - lazy loading (a missing file materializes as a fresh empty page)
//! - LRU eviction that skips pinned frames and writes dirty ones through
//! - durable write-through via atomic file replacement on eviction/flush
//!
//! Callers must treat a returned page as valid only between `get_page` and
//! the matching `unpin`; [`PinnedPage`] ties that window to a scope so every
//! exit path releases exactly one pin. Pages touched by writes must be
//! marked dirty before the pin is released.


use common::{DbError, DbResult};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::Page;
use tracing::debug;

/// Shared handle to a cached page. Reads and writes go through the inner
/// lock; the handle stays usable while the caller holds its pin.
pub type PageRef = Arc<RwLock<Page>>;

/// Pool handle shared by all tables of a database and their merge workers.
pub type SharedPool = Arc<Mutex<BufferPool>>;

#[derive(Debug)]
struct Frame {
    page: PageRef,
    dirty: bool,
    pin_count: usize,
}

impl Frame {
    fn new(page: Page) -> Self {
        Self {
            page: Arc::new(RwLock::new(page)),
            dirty: false,
            pin_count: 0,
        }
    }

    fn can_evict(&self) -> bool {
        self.pin_count == 0
    }
}

/// Path-keyed cache of [`Page`]s with pin counts and LRU eviction.
#[derive(Debug)]
pub struct BufferPool {
    pool_size: usize,
    frames: HashMap<PathBuf, Frame>,
    /// Access order, least recently used first.
    lru: Vec<PathBuf>,
}

impl BufferPool {
    /// Create a pool holding at most `pool_size` frames.
    ///
    /// # Panics
    ///
    /// Panics if `pool_size` is 0.
    pub fn new(pool_size: usize) -> Self {
        assert!(pool_size > 0, "pool_size must be > 0");
        Self {
            pool_size,
            frames: HashMap::new(),
            lru: Vec::new(),
        }
    }

    /// Convenience constructor for the shared handle.
    pub fn shared(pool_size: usize) -> SharedPool {
        Arc::new(Mutex::new(Self::new(pool_size)))
    }

    /// Whether a frame for `path` is resident.
    pub fn contains(&self, path: &Path) -> bool {
        self.frames.contains_key(path)
    }

    /// Move `path` to the most-recently-used end.
    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.lru.iter().position(|p| p == path) {
            self.lru.remove(pos);
        }
        self.lru.push(path.to_path_buf());
    }

    /// Make room for one more frame: scan from least to most recently used
    /// and drop the first unpinned frame, writing it out first if dirty.
    fn evict(&mut self) -> DbResult<()> {
        if self.frames.len() < self.pool_size {
            return Ok(());
        }

        let mut idx = 0;
        while idx < self.lru.len() {
            let path = self.lru[idx].clone();
            let Some(frame) = self.frames.get(&path) else {
                self.lru.remove(idx);
                continue;
            };

            if frame.can_evict() {
                if frame.dirty {
                    storage::write_page(&path, &frame.page.read())?;
                }
                self.lru.remove(idx);
                self.frames.remove(&path);
                debug!(path = %path.display(), "evicted page");
                return Ok(());
            }

            idx += 1;
        }

        Err(DbError::Buffer("cannot evict: all pages are pinned".into()))
    }

    /// Pin and return the page cached for `path`, loading it from disk on a
    /// miss (evicting first if the pool is full).
    pub fn get_page(&mut self, path: &Path) -> DbResult<PageRef> {
        if let Some(frame) = self.frames.get_mut(path) {
            frame.pin_count += 1;
            let page = Arc::clone(&frame.page);
            self.touch(path);
            return Ok(page);
        }

        self.evict()?;

        let mut frame = Frame::new(storage::read_page(path)?);
        frame.pin_count = 1;
        let page = Arc::clone(&frame.page);
        self.frames.insert(path.to_path_buf(), frame);
        self.touch(path);
        Ok(page)
    }

    /// Release one pin on `path`, floored at zero. Unknown paths are a
    /// no-op.
    pub fn unpin(&mut self, path: &Path) {
        if let Some(frame) = self.frames.get_mut(path) {
            frame.pin_count = frame.pin_count.saturating_sub(1);
        }
    }

    /// Record that the frame for `path` diverges from its file.
    pub fn mark_dirty(&mut self, path: &Path) {
        if let Some(frame) = self.frames.get_mut(path) {
            frame.dirty = true;
        }
    }

    /// Write every dirty frame to disk and clear its flag. Frames stay
    /// resident.
    pub fn flush_all(&mut self) -> DbResult<()> {
        for (path, frame) in self.frames.iter_mut() {
            if frame.dirty {
                storage::write_page(path, &frame.page.read())?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Point-in-time copy of the page at `path`, bypassing pins and
    /// recency: a resident frame is cloned (so unflushed writes are seen),
    /// otherwise the file is read. Used by the merge worker so its scan
    /// neither pins frames nor races live page mutation.
    pub fn snapshot(&self, path: &Path) -> DbResult<Page> {
        if let Some(frame) = self.frames.get(path) {
            return Ok(frame.page.read().clone());
        }
        storage::read_page(path)
    }

    /// Drop every unreferenced frame whose path starts with `prefix`,
    /// discarding dirty state. Used when a table's files are deleted.
    pub fn discard_prefix(&mut self, prefix: &Path) {
        self.frames.retain(|path, _| !path.starts_with(prefix));
        self.lru.retain(|path| !path.starts_with(prefix));
    }
}

/// RAII pin on a pooled page.
///
/// Acquiring pins the page; dropping releases the pin, so early returns and
/// error paths cannot leak pins.
pub struct PinnedPage {
    pool: SharedPool,
    path: PathBuf,
    page: PageRef,
}

impl PinnedPage {
    /// Pin the page at `path` in `pool`.
    pub fn acquire(pool: &SharedPool, path: PathBuf) -> DbResult<PinnedPage> {
        let page = pool.lock().get_page(&path)?;
        Ok(Self {
            pool: Arc::clone(pool),
            path,
            page,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Occupied-slot count.
    pub fn len(&self) -> usize {
        self.page.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.page.read().is_empty()
    }

    pub fn has_capacity(&self) -> bool {
        self.page.read().has_capacity()
    }

    pub fn read(&self, slot: usize) -> DbResult<i64> {
        self.page.read().read(slot)
    }

    /// Append a value. The caller still marks the page dirty.
    pub fn write(&self, value: i64) -> DbResult<()> {
        self.page.write().write(value)
    }

    /// Overwrite an occupied slot. The caller still marks the page dirty.
    pub fn update(&self, slot: usize, value: i64) -> DbResult<()> {
        self.page.write().update(slot, value)
    }

    pub fn mark_dirty(&self) {
        self.pool.lock().mark_dirty(&self.path);
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.pool.lock().unpin(&self.path);
    }
}
