//! Top-level database object: owns the shared buffer pool and the set of
//! tables persisted under `<data_dir>/tables/`.
//!
//! Opening enumerates table directories and loads every one carrying a
//! `meta.json`. Closing stops background merge work, flushes the buffer
//! pool, persists metadata, and garbage-collects superseded page files, in
//! that order, so persisted metadata can never predate a concurrent base
//! generation flip.

use anyhow::{Context, Result, bail};
use buffer::{BufferPool, SharedPool};
use common::Config;
use std::fs;
use std::sync::Arc;
use table::Table;
use tracing::info;

pub struct Database {
    config: Config,
    pool: SharedPool,
    tables: Vec<Table>,
}

impl Database {
    /// Open the database at `config.data_dir`, creating it if absent and
    /// loading every persisted table.
    pub fn open(config: Config) -> Result<Database> {
        let tables_dir = config.data_dir.join("tables");
        fs::create_dir_all(&tables_dir)
            .with_context(|| format!("create tables directory {}", tables_dir.display()))?;

        let pool = BufferPool::shared(config.buffer_pool_frames);
        let mut tables = Vec::new();
        for entry in fs::read_dir(&tables_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() || !entry.path().join("meta.json").exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let table = Table::open(&config.data_dir, &name, Arc::clone(&pool), &config)
                .with_context(|| format!("load table {name}"))?;
            tables.push(table);
        }

        info!(path = %config.data_dir.display(), tables = tables.len(), "database opened");
        Ok(Self {
            config,
            pool,
            tables,
        })
    }

    /// Create a new table. Fails if the name is taken or the shape is
    /// invalid.
    pub fn create_table(&mut self, name: &str, num_columns: usize, key: usize) -> Result<&mut Table> {
        if self.tables.iter().any(|t| t.name() == name) {
            bail!("table {name} already exists");
        }
        let table = Table::create(
            &self.config.data_dir,
            name,
            num_columns,
            key,
            Arc::clone(&self.pool),
            &self.config,
        )
        .with_context(|| format!("create table {name}"))?;

        let idx = self.tables.len();
        self.tables.push(table);
        Ok(&mut self.tables[idx])
    }

    pub fn get_table(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name() == name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name()).collect()
    }

    /// Stop the table's background work, drop its cached pages, and remove
    /// its files.
    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let Some(pos) = self.tables.iter().position(|t| t.name() == name) else {
            bail!("table {name} not found");
        };
        let mut table = self.tables.remove(pos);
        table.shutdown();

        let dir = storage::table_dir(&self.config.data_dir, name);
        self.pool.lock().discard_prefix(&dir);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("remove table directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// Flush everything and stop background work. Safe to call more than
    /// once; the database stays usable afterwards.
    pub fn close(&mut self) -> Result<()> {
        for table in &mut self.tables {
            table.shutdown();
        }
        self.pool.lock().flush_all().context("flush buffer pool")?;
        for table in &self.tables {
            table
                .flush()
                .with_context(|| format!("persist metadata for table {}", table.name()))?;
        }
        for table in &self.tables {
            table.collect_garbage();
        }
        info!(path = %self.config.data_dir.display(), "database closed");
        Ok(())
    }
}
