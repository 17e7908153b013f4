//! Query facade over a [`Table`].
//!
//! Validates caller input, resolves primary keys through the key-column
//! index, and maps every engine failure to a neutral result: `false`, an
//! empty list, or `None`. Engine errors never escape this layer.


use common::Rid;
use table::Table;

/// A materialized row: the record id, its key value, and the projected
/// column values (`None` where the projection mask excluded the column).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
}

/// Facade borrowing a table for a batch of operations.
pub struct Query<'t> {
    table: &'t mut Table,
}

impl<'t> Query<'t> {
    pub fn new(table: &'t mut Table) -> Self {
        Self { table }
    }

    /// Insert a record. Fails on wrong arity or a duplicate primary key.
    pub fn insert(&mut self, values: &[i64]) -> bool {
        if values.len() != self.table.num_columns() {
            return false;
        }
        let key_column = self.table.key();
        if !self.table.index().locate(key_column, values[key_column]).is_empty() {
            return false;
        }
        self.table.insert(values).is_ok()
    }

    /// Records whose latest `search_column` value equals `search_key`,
    /// projected through `projection`.
    pub fn select(
        &mut self,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
    ) -> Vec<Record> {
        self.select_version(search_key, search_column, projection, 0)
    }

    /// Like [`Query::select`] but reading the requested relative version of
    /// every matched record.
    pub fn select_version(
        &mut self,
        search_key: i64,
        search_column: usize,
        projection: &[bool],
        relative_version: i64,
    ) -> Vec<Record> {
        let num_columns = self.table.num_columns();
        if search_column >= num_columns || projection.len() != num_columns {
            return Vec::new();
        }

        let rids = if self.table.index().is_indexed(search_column) {
            self.table.index().locate(search_column, search_key)
        } else {
            match self.scan_for(search_key, search_column, relative_version) {
                Some(rids) => rids,
                None => return Vec::new(),
            }
        };

        let mut records = Vec::with_capacity(rids.len());
        for rid in rids {
            match self.materialize(rid, projection, relative_version) {
                Some(record) => records.push(record),
                None => return Vec::new(),
            }
        }
        records
    }

    /// Full-directory fallback for an unindexed search column.
    fn scan_for(
        &self,
        search_key: i64,
        search_column: usize,
        relative_version: i64,
    ) -> Option<Vec<Rid>> {
        let mut rids = Vec::new();
        for rid in self.table.live_rids() {
            let value = self
                .table
                .read_version(rid, search_column, relative_version)
                .ok()?;
            if value == search_key {
                rids.push(rid);
            }
        }
        Some(rids)
    }

    fn materialize(
        &self,
        rid: Rid,
        projection: &[bool],
        relative_version: i64,
    ) -> Option<Record> {
        let mut columns = vec![None; projection.len()];
        for (column, include) in projection.iter().enumerate() {
            if *include {
                columns[column] = Some(
                    self.table
                        .read_version(rid, column, relative_version)
                        .ok()?,
                );
            }
        }
        let key = self
            .table
            .read_version(rid, self.table.key(), relative_version)
            .ok()?;
        Some(Record { rid, key, columns })
    }

    /// Update the record with primary key `key`. The key column's cell must
    /// be `None`; keys cannot be rewritten.
    pub fn update(&mut self, key: i64, values: &[Option<i64>]) -> bool {
        if values.len() != self.table.num_columns() {
            return false;
        }
        if values[self.table.key()].is_some() {
            return false;
        }
        let rids = self.table.index().locate(self.table.key(), key);
        let Some(&rid) = rids.first() else {
            return false;
        };
        self.table.update(rid, values).is_ok()
    }

    /// Delete the record with primary key `key`, unregistering it from
    /// every existing column index first.
    pub fn delete(&mut self, key: i64) -> bool {
        let rids = self.table.index().locate(self.table.key(), key);
        let Some(&rid) = rids.first() else {
            return false;
        };

        // the tombstone wipes the lineage head, so current values must be
        // read out before the delete
        let num_columns = self.table.num_columns();
        let mut current = Vec::with_capacity(num_columns);
        for column in 0..num_columns {
            match self.table.read_version(rid, column, 0) {
                Ok(value) => current.push(value),
                Err(_) => return false,
            }
        }

        if self.table.delete(rid).is_err() {
            return false;
        }
        for (column, &value) in current.iter().enumerate() {
            if self.table.index().is_indexed(column) {
                self.table.index_mut().remove(column, value, rid);
            }
        }
        true
    }

    /// Sum of the latest `column` values over records whose key lies in
    /// `start..=end`. `None` when no record falls in the range.
    pub fn sum(&mut self, start: i64, end: i64, column: usize) -> Option<i64> {
        self.sum_version(start, end, column, 0)
    }

    /// Like [`Query::sum`] for the requested relative version.
    pub fn sum_version(
        &mut self,
        start: i64,
        end: i64,
        column: usize,
        relative_version: i64,
    ) -> Option<i64> {
        if column >= self.table.num_columns() {
            return None;
        }
        let rids = self.table.index().locate_range(start, end, self.table.key());
        if rids.is_empty() {
            return None;
        }
        let mut total = 0i64;
        for rid in rids {
            total += self
                .table
                .read_version(rid, column, relative_version)
                .ok()?;
        }
        Some(total)
    }

    /// Add one to `column` of the record with primary key `key`.
    pub fn increment(&mut self, key: i64, column: usize) -> bool {
        let num_columns = self.table.num_columns();
        if column >= num_columns {
            return false;
        }
        let projection = vec![true; num_columns];
        let records = self.select(key, self.table.key(), &projection);
        let Some(record) = records.first() else {
            return false;
        };
        let Some(current) = record.columns[column] else {
            return false;
        };

        let mut values = vec![None; num_columns];
        values[column] = Some(current + 1);
        self.update(key, &values)
    }
}
