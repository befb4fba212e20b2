//! Purpose: Save-As exporters (CSV, JSON, Excel) run on background workers.
//! Exports: `SaveFormat`, `SaveParams`, `SaveSelection`, `Exporter`, `ExporterFactory`, `ExportHandle`.
//! Role: Stream a materialized result set's rows into a destination file.
//! Invariants: At most one export per destination path is in flight process-wide.
//! Invariants: A path is registered before its worker starts and released when the worker ends.
//! Invariants: Row and column selections are inclusive and validated before any file is touched.
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::core::column::ColumnInfo;
use crate::core::error::{Error, ErrorKind};
use crate::core::result_set::ResultSet;
use crate::core::value::{CellValue, Value};

const EXCEL_MAX_COLUMNS: usize = 16_384;

pub trait Exporter {
    fn write_row(&mut self, row: &[CellValue]) -> Result<(), Error>;
    /// Finalizes the destination file. Called once after the last row.
    fn complete(self: Box<Self>) -> Result<(), Error>;
}

pub trait ExporterFactory: Send + Sync {
    fn create(&self, path: &Path, columns: &[ColumnInfo]) -> Result<Box<dyn Exporter>, Error>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub enum LineTerminator {
    Lf,
    #[default]
    CrLf,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CsvOptions {
    pub include_headers: bool,
    pub delimiter: char,
    pub quote: char,
    pub line_terminator: LineTerminator,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
            delimiter: ',',
            quote: '"',
            line_terminator: LineTerminator::CrLf,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ExcelOptions {
    pub include_headers: bool,
}

impl Default for ExcelOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveFormat {
    Csv(CsvOptions),
    Json,
    Excel(ExcelOptions),
}

/// Inclusive row and column bounds of a partial export.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct SaveSelection {
    pub row_start: usize,
    pub row_end: usize,
    pub column_start: usize,
    pub column_end: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SaveParams {
    pub path: PathBuf,
    pub selection: Option<SaveSelection>,
}

impl SaveParams {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            selection: None,
        }
    }

    pub fn with_selection(mut self, selection: SaveSelection) -> Self {
        self.selection = Some(selection);
        self
    }
}

impl ExporterFactory for SaveFormat {
    fn create(&self, path: &Path, columns: &[ColumnInfo]) -> Result<Box<dyn Exporter>, Error> {
        match self {
            SaveFormat::Csv(options) => Ok(Box::new(CsvExporter::create(path, columns, options)?)),
            SaveFormat::Json => Ok(Box::new(JsonExporter::create(path, columns)?)),
            SaveFormat::Excel(options) => {
                Ok(Box::new(ExcelExporter::create(path, columns, options)?))
            }
        }
    }
}

struct CsvExporter {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl CsvExporter {
    fn create(path: &Path, columns: &[ColumnInfo], options: &CsvOptions) -> Result<Self, Error> {
        let terminator = match options.line_terminator {
            LineTerminator::Lf => csv::Terminator::Any(b'\n'),
            LineTerminator::CrLf => csv::Terminator::CRLF,
        };
        let mut writer = csv::WriterBuilder::new()
            .delimiter(ascii_byte(options.delimiter, "delimiter")?)
            .quote(ascii_byte(options.quote, "quote")?)
            .terminator(terminator)
            .from_path(path)
            .map_err(|err| csv_error("failed to create csv file", path, err))?;
        if options.include_headers {
            writer
                .write_record(columns.iter().map(|column| column.name.as_str()))
                .map_err(|err| csv_error("failed to write csv header", path, err))?;
        }
        Ok(Self {
            writer,
            path: path.to_path_buf(),
        })
    }
}

impl Exporter for CsvExporter {
    fn write_row(&mut self, row: &[CellValue]) -> Result<(), Error> {
        self.writer
            .write_record(row.iter().map(|cell| cell.display_value.as_str()))
            .map_err(|err| csv_error("failed to write csv row", &self.path, err))
    }

    fn complete(mut self: Box<Self>) -> Result<(), Error> {
        self.writer
            .flush()
            .map_err(|err| Error::io("failed to flush csv file", err).with_path(&self.path))
    }
}

fn ascii_byte(value: char, what: &str) -> Result<u8, Error> {
    u8::try_from(value)
        .ok()
        .filter(u8::is_ascii)
        .ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!("csv {what} must be a single ASCII character"))
        })
}

fn csv_error(message: &str, path: &Path, err: csv::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

/// Buffers row objects and writes one pretty-printed array at completion.
struct JsonExporter {
    names: Vec<String>,
    rows: Vec<JsonValue>,
    out: BufWriter<File>,
    path: PathBuf,
}

impl JsonExporter {
    fn create(path: &Path, columns: &[ColumnInfo]) -> Result<Self, Error> {
        let file = File::create(path)
            .map_err(|err| Error::io("failed to create json file", err).with_path(path))?;
        Ok(Self {
            names: columns.iter().map(|column| column.name.clone()).collect(),
            rows: Vec::new(),
            out: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }
}

impl Exporter for JsonExporter {
    fn write_row(&mut self, row: &[CellValue]) -> Result<(), Error> {
        let mut object = Map::new();
        for (name, cell) in self.names.iter().zip(row) {
            object.insert(name.clone(), cell.raw.to_json());
        }
        self.rows.push(JsonValue::Object(object));
        Ok(())
    }

    fn complete(mut self: Box<Self>) -> Result<(), Error> {
        let rows = std::mem::take(&mut self.rows);
        serde_json::to_writer_pretty(&mut self.out, &rows).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write json file")
                .with_path(&self.path)
                .with_source(err)
        })?;
        self.out
            .flush()
            .map_err(|err| Error::io("failed to flush json file", err).with_path(&self.path))
    }
}

struct ExcelExporter {
    workbook: Workbook,
    sheet: Worksheet,
    next_row: u32,
    path: PathBuf,
}

impl ExcelExporter {
    fn create(path: &Path, columns: &[ColumnInfo], options: &ExcelOptions) -> Result<Self, Error> {
        if columns.len() > EXCEL_MAX_COLUMNS {
            return Err(Error::new(ErrorKind::Range).with_message(format!(
                "excel sheets hold at most {EXCEL_MAX_COLUMNS} columns"
            )));
        }
        let mut sheet = Worksheet::new();
        let mut next_row = 0;
        if options.include_headers {
            let bold = Format::new().set_bold();
            for (col, column) in columns.iter().enumerate() {
                sheet
                    .write_string_with_format(0, col as u16, &column.name, &bold)
                    .map_err(|err| xlsx_error("failed to write excel header", path, err))?;
            }
            next_row = 1;
        }
        Ok(Self {
            workbook: Workbook::new(),
            sheet,
            next_row,
            path: path.to_path_buf(),
        })
    }
}

impl Exporter for ExcelExporter {
    fn write_row(&mut self, row: &[CellValue]) -> Result<(), Error> {
        let row_num = self.next_row;
        for (col, cell) in row.iter().enumerate() {
            let col = col as u16;
            let written = match &cell.raw {
                Value::Null => continue,
                Value::Bool(flag) => self.sheet.write_boolean(row_num, col, *flag).map(|_| ()),
                Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) | Value::Double(_) => {
                    let number = cell.raw.as_f64().unwrap_or_default();
                    self.sheet.write_number(row_num, col, number).map(|_| ())
                }
                _ => self
                    .sheet
                    .write_string(row_num, col, &cell.display_value)
                    .map(|_| ()),
            };
            written.map_err(|err| {
                xlsx_error("failed to write excel cell", &self.path, err).with_row(cell.row_id)
            })?;
        }
        self.next_row += 1;
        Ok(())
    }

    fn complete(self: Box<Self>) -> Result<(), Error> {
        let ExcelExporter {
            mut workbook,
            sheet,
            path,
            ..
        } = *self;
        workbook.push_worksheet(sheet);
        workbook
            .save(&path)
            .map_err(|err| xlsx_error("failed to save excel workbook", &path, err))
    }
}

fn xlsx_error(message: &str, path: &Path, err: XlsxError) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(message)
        .with_path(path)
        .with_source(err)
}

fn active_exports() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Holds a destination path in the registry until dropped.
struct PathClaim {
    key: PathBuf,
}

impl PathClaim {
    fn acquire(path: &Path) -> Result<Self, Error> {
        let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let mut active = active_exports()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(key.clone()) {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("an export to this path is already in progress")
                .with_path(path)
                .with_hint("Wait for the running export to finish or choose another path."));
        }
        Ok(Self { key })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        active_exports()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

#[derive(Debug)]
pub struct ExportHandle {
    path: PathBuf,
    worker: JoinHandle<Result<usize, Error>>,
}

impl ExportHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Blocks until the export ends. Returns the number of rows written.
    pub fn wait(self) -> Result<usize, Error> {
        self.worker.join().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("export worker panicked")
                .with_path(&self.path)
        })?
    }
}

pub(crate) fn start_export(
    result: Arc<ResultSet>,
    params: SaveParams,
    factory: Arc<dyn ExporterFactory>,
) -> Result<ExportHandle, Error> {
    if !result.has_been_read() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("cannot export a result set before it has been read")
            .with_path(&params.path));
    }
    let (rows, columns) = export_bounds(&result, params.selection)?;
    let claim = PathClaim::acquire(&params.path)?;

    let path = params.path.clone();
    let worker = thread::Builder::new()
        .name("sqlspool-export".to_string())
        .spawn(move || {
            let _claim = claim;
            let outcome = run_export(&result, &params.path, rows, columns, factory.as_ref());
            match &outcome {
                Ok(written) => tracing::info!(
                    path = %params.path.display(),
                    rows = written,
                    "export finished"
                ),
                Err(err) => tracing::warn!(
                    path = %params.path.display(),
                    error = %err,
                    "export failed"
                ),
            }
            outcome
        })
        .map_err(|err| Error::io("failed to spawn export worker", err))?;
    tracing::info!(path = %path.display(), "export started");
    Ok(ExportHandle { path, worker })
}

type Bounds = (std::ops::Range<usize>, std::ops::RangeInclusive<usize>);

fn export_bounds(result: &ResultSet, selection: Option<SaveSelection>) -> Result<Bounds, Error> {
    let row_count = result.row_count();
    let column_count = result.columns().len();
    let Some(selection) = selection else {
        if column_count == 0 {
            return Err(Error::new(ErrorKind::Range).with_message("result set has no columns"));
        }
        return Ok((0..row_count, 0..=column_count - 1));
    };
    if selection.row_start > selection.row_end || selection.row_end >= row_count {
        return Err(Error::new(ErrorKind::Range).with_message(format!(
            "row selection {}..={} is outside 0..{row_count}",
            selection.row_start, selection.row_end
        )));
    }
    if selection.column_start > selection.column_end || selection.column_end >= column_count {
        return Err(Error::new(ErrorKind::Range).with_message(format!(
            "column selection {}..={} is outside 0..{column_count}",
            selection.column_start, selection.column_end
        )));
    }
    Ok((
        selection.row_start..selection.row_end + 1,
        selection.column_start..=selection.column_end,
    ))
}

fn run_export(
    result: &ResultSet,
    path: &Path,
    rows: std::ops::Range<usize>,
    columns: std::ops::RangeInclusive<usize>,
    factory: &dyn ExporterFactory,
) -> Result<usize, Error> {
    let mut exporter = factory.create(path, &result.columns()[columns.clone()])?;
    let mut written = 0;
    if !rows.is_empty() {
        result.visit_rows(rows.start, rows.end, &mut |row| {
            exporter.write_row(&row[columns.clone()])?;
            written += 1;
            Ok(())
        })?;
    }
    exporter.complete()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    use super::{
        CsvOptions, ExcelOptions, Exporter, ExporterFactory, LineTerminator, SaveFormat,
        SaveParams, SaveSelection,
    };
    use crate::core::column::{ColumnInfo, DataType};
    use crate::core::connection::RowsCursor;
    use crate::core::error::{Error, ErrorKind};
    use crate::core::result_set::{ResultSet, StorageType};
    use crate::core::value::{CellValue, Value};
    use serde_json::json;

    fn sample(dir: &Path) -> Arc<ResultSet> {
        let columns = vec![
            ColumnInfo::new(0, "id", DataType::Int),
            ColumnInfo::new(1, "name", DataType::Text),
            ColumnInfo::new(2, "active", DataType::Bool),
        ];
        let rows = vec![
            vec![Value::Int(1), Value::Text("ann".into()), Value::Bool(true)],
            vec![Value::Int(2), Value::Text("b,\"o\"b".into()), Value::Null],
            vec![Value::Int(3), Value::Null, Value::Bool(false)],
        ];
        let rs = ResultSet::new(0, 0, columns.clone(), StorageType::Spooled, dir).expect("rs");
        rs.read_result_to_end(&mut RowsCursor::new(columns, rows))
            .expect("ingest");
        Arc::new(rs)
    }

    fn csv(lf: bool, include_headers: bool) -> Arc<SaveFormat> {
        Arc::new(SaveFormat::Csv(CsvOptions {
            include_headers,
            line_terminator: if lf {
                LineTerminator::Lf
            } else {
                LineTerminator::CrLf
            },
            ..CsvOptions::default()
        }))
    }

    #[test]
    fn csv_quotes_and_writes_header_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let out = dir.path().join("out.csv");
        let written = rs
            .save_as(SaveParams::new(&out), csv(true, true))
            .expect("start")
            .wait()
            .expect("export");
        assert_eq!(written, 3);
        let text = std::fs::read_to_string(&out).expect("read");
        assert_eq!(
            text,
            "id,name,active\n1,ann,true\n2,\"b,\"\"o\"\"b\",\n3,,false\n"
        );
    }

    #[test]
    fn selection_bounds_are_inclusive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let out = dir.path().join("part.csv");
        let selection = SaveSelection {
            row_start: 1,
            row_end: 2,
            column_start: 1,
            column_end: 2,
        };
        rs.save_as(SaveParams::new(&out).with_selection(selection), csv(true, false))
            .expect("start")
            .wait()
            .expect("export");
        let text = std::fs::read_to_string(&out).expect("read");
        assert_eq!(text, "\"b,\"\"o\"\"b\",\n,false\n");
    }

    #[test]
    fn invalid_selection_is_a_range_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let selection = SaveSelection {
            row_start: 0,
            row_end: 3,
            column_start: 0,
            column_end: 0,
        };
        let err = rs
            .save_as(
                SaveParams::new(dir.path().join("x.csv")).with_selection(selection),
                csv(true, true),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Range);
        assert!(!dir.path().join("x.csv").exists());
    }

    #[test]
    fn json_keeps_raw_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let out = dir.path().join("out.json");
        rs.save_as(SaveParams::new(&out), Arc::new(SaveFormat::Json))
            .expect("start")
            .wait()
            .expect("export");
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).expect("read")).expect("json");
        assert_eq!(
            parsed,
            json!([
                {"id": 1, "name": "ann", "active": true},
                {"id": 2, "name": "b,\"o\"b", "active": null},
                {"id": 3, "name": null, "active": false}
            ])
        );
    }

    #[test]
    fn excel_workbook_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let out = dir.path().join("out.xlsx");
        let format = Arc::new(SaveFormat::Excel(ExcelOptions::default()));
        let written = rs
            .save_as(SaveParams::new(&out), format)
            .expect("start")
            .wait()
            .expect("export");
        assert_eq!(written, 3);
        let bytes = std::fs::read(&out).expect("read");
        assert_eq!(&bytes[..2], b"PK");
    }

    struct Gate {
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    struct NullExporter;

    impl Exporter for NullExporter {
        fn write_row(&mut self, _row: &[CellValue]) -> Result<(), Error> {
            Ok(())
        }

        fn complete(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
    }

    impl ExporterFactory for Gate {
        fn create(&self, _path: &Path, _columns: &[ColumnInfo]) -> Result<Box<dyn Exporter>, Error> {
            if let Some(release) = self.release.lock().expect("gate").take() {
                let _ = release.recv();
            }
            Ok(Box::new(NullExporter))
        }
    }

    #[test]
    fn one_export_per_path_at_a_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let out = dir.path().join("busy.csv");
        let (release_tx, release_rx) = mpsc::channel();
        let gate = Arc::new(Gate {
            release: Mutex::new(Some(release_rx)),
        });

        let first = rs
            .save_as(SaveParams::new(&out), gate.clone())
            .expect("first export starts");
        let err = rs
            .save_as(SaveParams::new(&out), csv(true, true))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);

        release_tx.send(()).expect("release");
        assert_eq!(first.wait().expect("first export"), 3);

        let second = rs
            .save_as(SaveParams::new(&out), csv(true, true))
            .expect("path is free again");
        second.wait().expect("second export");
    }

    #[test]
    fn failed_export_releases_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rs = sample(dir.path());
        let out = dir.path().join("missing-dir").join("out.csv");
        let err = rs
            .save_as(SaveParams::new(&out), csv(true, true))
            .expect("start")
            .wait()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        std::fs::create_dir_all(out.parent().expect("parent")).expect("mkdir");
        rs.save_as(SaveParams::new(&out), csv(true, true))
            .expect("start")
            .wait()
            .expect("export");
    }
}
