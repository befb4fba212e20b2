//! Purpose: Materialized output of one statement, stored in memory or spooled to disk.
//! Exports: `ResultSet`, `ResultSetSummary`, `StorageType`.
//! Role: Single contract over both storage backends; callers never branch on the backend.
//! Invariants: `read_result_to_end` is the only ingestion path and runs at most once.
//! Invariants: Reads and edits are refused until ingestion has completed.
//! Invariants: Edits take the write lock; subsets and exports take the read lock.
//! Invariants: Row order always equals cursor fetch order; nothing reorders rows.
//! Invariants: Both backends hold codec-normalized values, so they return equal raw values.
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::core::codec::normalize_cell;
use crate::core::column::ColumnInfo;
use crate::core::connection::Cursor;
use crate::core::error::{Error, ErrorKind};
use crate::core::export::{ExportHandle, ExporterFactory, SaveParams, start_export};
use crate::core::spool::{SpoolFile, SpoolWriter};
use crate::core::value::{CellValue, Value, cells_from_values};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Memory,
    #[default]
    Spooled,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultSetSummary {
    pub id: usize,
    pub batch_id: usize,
    pub row_count: usize,
    pub complete: bool,
    pub column_info: Vec<ColumnInfo>,
}

pub(crate) type RowVisitor<'a> = dyn FnMut(Vec<CellValue>) -> Result<(), Error> + 'a;

trait RowStore: Send + Sync {
    fn len(&self) -> usize;
    fn append(&mut self, row: Vec<Value>, columns: &[ColumnInfo]) -> Result<(), Error>;
    fn replace(&mut self, index: usize, row: Vec<Value>, columns: &[ColumnInfo])
    -> Result<(), Error>;
    fn remove(&mut self, index: usize);
    fn visit(
        &self,
        start: usize,
        end: usize,
        columns: &[ColumnInfo],
        visitor: &mut RowVisitor<'_>,
    ) -> Result<(), Error>;
}

#[derive(Default)]
struct MemoryRows {
    rows: Vec<Vec<Value>>,
}

impl RowStore for MemoryRows {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn append(&mut self, row: Vec<Value>, columns: &[ColumnInfo]) -> Result<(), Error> {
        let row = normalize_row(row, columns)?;
        self.rows.push(row);
        Ok(())
    }

    fn replace(
        &mut self,
        index: usize,
        row: Vec<Value>,
        columns: &[ColumnInfo],
    ) -> Result<(), Error> {
        self.rows[index] = normalize_row(row, columns)?;
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        self.rows.remove(index);
    }

    fn visit(
        &self,
        start: usize,
        end: usize,
        _columns: &[ColumnInfo],
        visitor: &mut RowVisitor<'_>,
    ) -> Result<(), Error> {
        for (idx, row) in self.rows[start..end].iter().enumerate() {
            visitor(cells_from_values(row.clone(), (start + idx) as u64))?;
        }
        Ok(())
    }
}

/// Rows live in a spool file; only the per-row offset index stays in memory.
struct SpooledRows {
    file: SpoolFile,
    writer: SpoolWriter,
    offsets: Vec<u64>,
    total_bytes: u64,
    broken: bool,
}

impl SpooledRows {
    fn create(dir: &Path) -> Result<Self, Error> {
        let file = SpoolFile::create(dir)?;
        let writer = file.writer()?;
        Ok(Self {
            file,
            writer,
            offsets: Vec::new(),
            total_bytes: 0,
            broken: false,
        })
    }

    /// Appends encoded row bytes at the end of the file and returns where they start.
    fn write(&mut self, row: &[Value], columns: &[ColumnInfo]) -> Result<u64, Error> {
        if self.broken {
            return Err(Error::new(ErrorKind::Codec)
                .with_message("spool file is unusable after an earlier write failure")
                .with_path(self.file.path()));
        }
        check_width(row, columns)?;
        let offset = self.total_bytes;
        match self.writer.write_row(row, columns) {
            Ok(written) => {
                self.total_bytes += written;
                Ok(offset)
            }
            Err(err) => {
                self.broken = true;
                Err(err)
            }
        }
    }
}

impl RowStore for SpooledRows {
    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn append(&mut self, row: Vec<Value>, columns: &[ColumnInfo]) -> Result<(), Error> {
        let offset = self.write(&row, columns)?;
        self.offsets.push(offset);
        Ok(())
    }

    fn replace(
        &mut self,
        index: usize,
        row: Vec<Value>,
        columns: &[ColumnInfo],
    ) -> Result<(), Error> {
        let offset = self.write(&row, columns)?;
        self.offsets[index] = offset;
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        self.offsets.remove(index);
    }

    fn visit(
        &self,
        start: usize,
        end: usize,
        columns: &[ColumnInfo],
        visitor: &mut RowVisitor<'_>,
    ) -> Result<(), Error> {
        let mut reader = self.file.reader()?;
        for (idx, offset) in self.offsets[start..end].iter().enumerate() {
            visitor(reader.read_row(*offset, (start + idx) as u64, columns)?)?;
        }
        Ok(())
    }
}

/// Stores values in the form the spool codec reads back, so both backends agree.
fn normalize_row(row: Vec<Value>, columns: &[ColumnInfo]) -> Result<Vec<Value>, Error> {
    check_width(&row, columns)?;
    row.into_iter()
        .zip(columns)
        .map(|(value, column)| normalize_cell(value, &column.data_type))
        .collect()
}

fn check_width(row: &[Value], columns: &[ColumnInfo]) -> Result<(), Error> {
    if row.len() != columns.len() {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "row has {} values but the result set has {} columns",
            row.len(),
            columns.len()
        )));
    }
    Ok(())
}

struct State {
    rows: Box<dyn RowStore>,
    has_been_read: bool,
}

pub struct ResultSet {
    id: usize,
    batch_id: usize,
    storage: StorageType,
    columns: Vec<ColumnInfo>,
    state: RwLock<State>,
}

impl std::fmt::Debug for ResultSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSet")
            .field("id", &self.id)
            .field("batch_id", &self.batch_id)
            .field("storage", &self.storage)
            .field("row_count", &self.row_count())
            .finish()
    }
}

impl ResultSet {
    /// `spool_dir` is only touched for `StorageType::Spooled`.
    pub fn new(
        id: usize,
        batch_id: usize,
        columns: Vec<ColumnInfo>,
        storage: StorageType,
        spool_dir: &Path,
    ) -> Result<Self, Error> {
        let rows: Box<dyn RowStore> = match storage {
            StorageType::Memory => Box::new(MemoryRows::default()),
            StorageType::Spooled => Box::new(SpooledRows::create(spool_dir)?),
        };
        Ok(Self {
            id,
            batch_id,
            storage,
            columns,
            state: RwLock::new(State {
                rows,
                has_been_read: false,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn batch_id(&self) -> usize {
        self.batch_id
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.read_state().rows.len()
    }

    pub fn has_been_read(&self) -> bool {
        self.read_state().has_been_read
    }

    pub fn summary(&self) -> ResultSetSummary {
        let state = self.read_state();
        ResultSetSummary {
            id: self.id,
            batch_id: self.batch_id,
            row_count: state.rows.len(),
            complete: state.has_been_read,
            column_info: self.columns.clone(),
        }
    }

    /// Drains `cursor` into storage. Returns the number of rows ingested.
    pub fn read_result_to_end(&self, cursor: &mut dyn Cursor) -> Result<usize, Error> {
        if self.read_state().has_been_read {
            return Err(Error::new(ErrorKind::Usage).with_message("result set was already read"));
        }
        let mut ingested = 0;
        while let Some(row) = cursor.fetch_next()? {
            let mut state = self.write_state();
            state
                .rows
                .append(row, &self.columns)
                .map_err(|err| err.with_row(ingested as u64))?;
            ingested += 1;
        }
        self.write_state().has_been_read = true;
        tracing::debug!(
            result_set = self.id,
            batch = self.batch_id,
            rows = ingested,
            "result set ingested"
        );
        Ok(ingested)
    }

    /// Rows `start..end` (end exclusive). Indices are never clamped.
    pub fn get_subset(&self, start: i64, end: i64) -> Result<Vec<Vec<CellValue>>, Error> {
        let state = self.readable_state()?;
        let (start, end) = check_window(start, end, state.rows.len())?;
        let mut rows = Vec::with_capacity(end - start);
        state
            .rows
            .visit(start, end, &self.columns, &mut |row| {
                rows.push(row);
                Ok(())
            })?;
        Ok(rows)
    }

    pub fn get_row(&self, row_id: usize) -> Result<Vec<CellValue>, Error> {
        let state = self.readable_state()?;
        check_row(row_id, state.rows.len())?;
        let mut found = None;
        state
            .rows
            .visit(row_id, row_id + 1, &self.columns, &mut |row| {
                found = Some(row);
                Ok(())
            })?;
        found.ok_or_else(|| Error::new(ErrorKind::Internal).with_message("row vanished"))
    }

    /// Appends the next row of `source`. Returns the new row's id.
    pub fn add_row(&self, source: &mut dyn Cursor) -> Result<usize, Error> {
        let row = next_source_row(source)?;
        let mut state = self.editable_state()?;
        state.rows.append(row, &self.columns)?;
        Ok(state.rows.len() - 1)
    }

    /// Replaces row `row_id` with the next row of `source`.
    pub fn update_row(&self, row_id: usize, source: &mut dyn Cursor) -> Result<(), Error> {
        let row = next_source_row(source)?;
        let mut state = self.editable_state()?;
        check_row(row_id, state.rows.len())?;
        state.rows.replace(row_id, row, &self.columns)
    }

    /// Removes row `row_id`; later rows shift down by one.
    pub fn remove_row(&self, row_id: usize) -> Result<(), Error> {
        let mut state = self.editable_state()?;
        check_row(row_id, state.rows.len())?;
        state.rows.remove(row_id);
        Ok(())
    }

    /// Starts a background export of this result set to `params.path`.
    pub fn save_as(
        self: &Arc<Self>,
        params: SaveParams,
        factory: Arc<dyn ExporterFactory>,
    ) -> Result<ExportHandle, Error> {
        start_export(Arc::clone(self), params, factory)
    }

    /// Streams rows `start..end` under one read lock.
    pub(crate) fn visit_rows(
        &self,
        start: usize,
        end: usize,
        visitor: &mut RowVisitor<'_>,
    ) -> Result<(), Error> {
        let state = self.readable_state()?;
        check_window(start as i64, end as i64, state.rows.len())?;
        state.rows.visit(start, end, &self.columns, visitor)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn readable_state(&self) -> Result<RwLockReadGuard<'_, State>, Error> {
        let state = self.read_state();
        if !state.has_been_read {
            return Err(not_read());
        }
        Ok(state)
    }

    fn editable_state(&self) -> Result<RwLockWriteGuard<'_, State>, Error> {
        let state = self.write_state();
        if !state.has_been_read {
            return Err(not_read());
        }
        Ok(state)
    }
}

fn not_read() -> Error {
    Error::new(ErrorKind::Usage)
        .with_message("result set has not been read yet")
        .with_hint("Rows become available once the batch finishes executing.")
}

fn next_source_row(source: &mut dyn Cursor) -> Result<Vec<Value>, Error> {
    source
        .fetch_next()?
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("source cursor has no rows"))
}

pub(crate) fn check_window(start: i64, end: i64, row_count: usize) -> Result<(usize, usize), Error> {
    if start < 0 || start >= end || end > row_count as i64 {
        return Err(Error::new(ErrorKind::Range).with_message(format!(
            "row window {start}..{end} is outside 0..{row_count}"
        )));
    }
    Ok((start as usize, end as usize))
}

fn check_row(row_id: usize, row_count: usize) -> Result<(), Error> {
    if row_id >= row_count {
        return Err(Error::new(ErrorKind::Range)
            .with_message(format!("row {row_id} is outside 0..{row_count}"))
            .with_row(row_id as u64));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{ResultSet, StorageType};
    use crate::core::column::{ColumnInfo, DataType};
    use crate::core::connection::RowsCursor;
    use crate::core::error::ErrorKind;
    use crate::core::value::Value;

    fn columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new(0, "id", DataType::BigInt),
            ColumnInfo::new(1, "label", DataType::Text),
            ColumnInfo::new(2, "ratio", DataType::Double),
        ]
    }

    fn rows(count: i64) -> Vec<Vec<Value>> {
        (0..count)
            .map(|i| {
                let label = if i % 3 == 0 {
                    Value::Null
                } else {
                    Value::Text(format!("row-{i}"))
                };
                vec![Value::BigInt(i), label, Value::Double(i as f64 / 4.0)]
            })
            .collect()
    }

    fn loaded(storage: StorageType, dir: &Path, count: i64) -> ResultSet {
        let rs = ResultSet::new(0, 0, columns(), storage, dir).expect("result set");
        let mut cursor = RowsCursor::new(columns(), rows(count));
        assert_eq!(rs.read_result_to_end(&mut cursor).expect("ingest"), count as usize);
        rs
    }

    #[test]
    fn backends_return_equal_windows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let memory = loaded(StorageType::Memory, dir.path(), 50);
        let spooled = loaded(StorageType::Spooled, dir.path(), 50);
        assert_eq!(memory.row_count(), 50);
        assert_eq!(spooled.row_count(), 50);

        for (start, end) in [(0, 1), (0, 50), (17, 33), (49, 50)] {
            let a = memory.get_subset(start, end).expect("memory subset");
            let b = spooled.get_subset(start, end).expect("spooled subset");
            assert_eq!(a.len(), (end - start) as usize);
            assert_eq!(a, b);
            for (offset, row) in b.iter().enumerate() {
                let id = start as usize + offset;
                assert_eq!(row, &spooled.get_row(id).expect("row"));
                assert_eq!(row[0].row_id, id as u64);
            }
        }
    }

    #[test]
    fn backends_agree_on_raw_values_after_coercion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let columns = vec![
            ColumnInfo::new(0, "price", DataType::Numeric),
            ColumnInfo::new(1, "v", DataType::Unknown),
        ];
        let rows = vec![
            vec![Value::BigInt(10), Value::Null],
            vec![Value::Double(2.5), Value::BigInt(5)],
            vec![Value::Text("7.25".into()), Value::Text("x".into())],
        ];
        let mut windows = Vec::new();
        for storage in [StorageType::Memory, StorageType::Spooled] {
            let rs = ResultSet::new(0, 0, columns.clone(), storage, dir.path()).expect("rs");
            rs.read_result_to_end(&mut RowsCursor::new(columns.clone(), rows.clone()))
                .expect("ingest");
            let raw: Vec<Vec<Value>> = rs
                .get_subset(0, 3)
                .expect("subset")
                .into_iter()
                .map(|row| row.into_iter().map(|cell| cell.raw).collect())
                .collect();
            windows.push(raw);
        }
        assert_eq!(windows[0], windows[1]);
        assert_eq!(windows[0][0][0], Value::Text("10".into()));
        assert_eq!(windows[0][1][1], Value::BigInt(5));
    }

    #[test]
    fn out_of_range_windows_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        for storage in [StorageType::Memory, StorageType::Spooled] {
            let rs = loaded(storage, dir.path(), 5);
            for (start, end) in [(-1, 5), (0, 6), (3, 3), (4, 2)] {
                let err = rs.get_subset(start, end).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::Range, "{start}..{end}");
            }
            assert_eq!(rs.get_row(5).unwrap_err().kind(), ErrorKind::Range);
        }
    }

    #[test]
    fn reads_and_edits_wait_for_ingestion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = ResultSet::new(0, 0, columns(), StorageType::Memory, dir.path()).expect("rs");
        assert_eq!(rs.get_subset(0, 1).unwrap_err().kind(), ErrorKind::Usage);
        assert_eq!(rs.remove_row(0).unwrap_err().kind(), ErrorKind::Usage);
        let mut source = RowsCursor::new(columns(), rows(1));
        assert_eq!(rs.add_row(&mut source).unwrap_err().kind(), ErrorKind::Usage);
    }

    #[test]
    fn ingestion_runs_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = loaded(StorageType::Memory, dir.path(), 2);
        let mut again = RowsCursor::new(columns(), rows(2));
        assert_eq!(
            rs.read_result_to_end(&mut again).unwrap_err().kind(),
            ErrorKind::Usage
        );
        assert_eq!(rs.row_count(), 2);
    }

    #[test]
    fn edits_apply_to_both_backends() {
        let dir = tempfile::tempdir().expect("tempdir");
        for storage in [StorageType::Memory, StorageType::Spooled] {
            let rs = loaded(storage, dir.path(), 4);

            let mut extra = RowsCursor::new(
                columns(),
                vec![vec![Value::BigInt(99), Value::Text("new".into()), Value::Null]],
            );
            assert_eq!(rs.add_row(&mut extra).expect("add"), 4);
            assert_eq!(rs.get_row(4).expect("row")[1].display_value, "new");

            let mut replacement = RowsCursor::new(
                columns(),
                vec![vec![Value::BigInt(-1), Value::Null, Value::Double(0.5)]],
            );
            rs.update_row(1, &mut replacement).expect("update");
            let updated = rs.get_row(1).expect("row");
            assert_eq!(updated[0].display_value, "-1");
            assert!(updated[1].is_null);

            rs.remove_row(0).expect("remove");
            assert_eq!(rs.row_count(), 4);
            assert_eq!(rs.get_row(0).expect("row")[0].display_value, "-1");
            assert_eq!(rs.remove_row(9).unwrap_err().kind(), ErrorKind::Range);

            let mut empty = RowsCursor::new(columns(), Vec::new());
            assert_eq!(rs.add_row(&mut empty).unwrap_err().kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn spool_file_is_removed_with_the_result_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = loaded(StorageType::Spooled, dir.path(), 3);
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 1);
        drop(rs);
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn summary_reports_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = loaded(StorageType::Spooled, dir.path(), 3);
        let summary = rs.summary();
        assert_eq!(summary.row_count, 3);
        assert!(summary.complete);
        assert_eq!(summary.column_info[1].name, "label");
    }
}
