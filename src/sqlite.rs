//! Purpose: `Connection` implementation over a bundled SQLite database via rusqlite.
//! Exports: `SqliteConnection`.
//! Role: Default driver for the CLI and integration tests; the engine itself is driver-agnostic.
//! Invariants: Columns are typed from declared affinity; expression columns stay `Unknown`.
//! Invariants: Values are fitted to declared column types; `Unknown` columns pass each row's class through.
//! Invariants: Cancellation uses `sqlite3_interrupt` and surfaces as a `Database` error.
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{ErrorCode, InterruptHandle, Rows, Statement};

use crate::core::column::{ColumnInfo, DataType};
use crate::core::connection::{CancelHandle, Connection, Cursor, CursorKind, PlanTemplates};
use crate::core::error::{Error, ErrorKind};
use crate::core::splitter::first_keyword;
use crate::core::value::Value;

const MEMORY_PATH: &str = ":memory:";

pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    /// Opens (or creates) the database at `path`; `:memory:` opens a private in-memory database.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if path.as_os_str() == MEMORY_PATH {
            return Self::open_in_memory();
        }
        let conn = rusqlite::Connection::open(path).map_err(|err| {
            Error::new(ErrorKind::Database)
                .with_message("failed to open database")
                .with_path(path)
                .with_source(err)
        })?;
        tracing::debug!(path = %path.display(), "opened sqlite database");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|err| {
            Error::new(ErrorKind::Database)
                .with_message("failed to open in-memory database")
                .with_source(err)
        })?;
        Ok(Self { conn })
    }
}

impl Connection for SqliteConnection {
    fn execute(
        &mut self,
        sql: &str,
        cursor: &CursorKind,
        on_result: &mut dyn FnMut(&mut dyn Cursor) -> Result<(), Error>,
    ) -> Result<Option<u64>, Error> {
        if let CursorKind::Server(name) = cursor {
            tracing::trace!(cursor = %name, "sqlite steps the statement directly");
        }
        let mut stmt = self.conn.prepare(sql).map_err(database_error)?;
        if stmt.column_count() == 0 {
            let changed = stmt.execute([]).map_err(database_error)?;
            return Ok(reports_changes(sql)?.then_some(changed as u64));
        }

        let columns = declared_columns(&stmt);
        let mut cursor = SqliteCursor {
            columns,
            rows: stmt.raw_query(),
        };
        on_result(&mut cursor)?;
        Ok(None)
    }

    fn autocommit(&self) -> bool {
        self.conn.is_autocommit()
    }

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), Error> {
        let sql = match (enabled, self.conn.is_autocommit()) {
            (false, true) => "BEGIN",
            (true, false) => "ROLLBACK",
            _ => return Ok(()),
        };
        self.conn.execute_batch(sql).map_err(database_error)
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle> {
        Box::new(SqliteInterrupt(self.conn.get_interrupt_handle()))
    }

    fn plan_templates(&self) -> PlanTemplates {
        PlanTemplates {
            estimated: "EXPLAIN QUERY PLAN {}".to_string(),
            actual: "EXPLAIN QUERY PLAN {}".to_string(),
        }
    }
}

struct SqliteInterrupt(InterruptHandle);

impl CancelHandle for SqliteInterrupt {
    fn cancel(&self) -> Result<(), Error> {
        self.0.interrupt();
        Ok(())
    }
}

struct SqliteCursor<'stmt> {
    columns: Vec<ColumnInfo>,
    rows: Rows<'stmt>,
}

impl Cursor for SqliteCursor<'_> {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    fn fetch_next(&mut self) -> Result<Option<Vec<Value>>, Error> {
        let raw = match self.rows.next().map_err(database_error)? {
            Some(row) => read_row(row, self.columns.len())?,
            None => return Ok(None),
        };
        self.columns
            .iter()
            .zip(raw)
            .map(|(column, value)| fit(value, column))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }
}

fn declared_columns(stmt: &Statement<'_>) -> Vec<ColumnInfo> {
    stmt.columns()
        .iter()
        .enumerate()
        .map(|(ordinal, column)| {
            ColumnInfo::new(ordinal, column.name(), declared_type(column.decl_type()))
        })
        .collect()
}

/// Maps a declared column type to a data type following SQLite's affinity rules.
fn declared_type(decl: Option<&str>) -> DataType {
    let Some(decl) = decl.map(str::trim).filter(|decl| !decl.is_empty()) else {
        return DataType::Unknown;
    };
    let upper = decl.to_ascii_uppercase();
    if upper.starts_with("BOOL") {
        DataType::Bool
    } else if upper.contains("INT") {
        DataType::BigInt
    } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
        DataType::Text
    } else if upper.contains("BLOB") {
        DataType::Bytes
    } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
        DataType::Double
    } else if upper.starts_with("JSON") {
        DataType::Json
    } else if upper == "DATE" {
        DataType::Date
    } else if upper == "TIME" {
        DataType::Time
    } else if upper == "DATETIME" || upper.starts_with("TIMESTAMP") {
        DataType::Timestamp
    } else {
        DataType::Numeric
    }
}

fn read_row(row: &rusqlite::Row<'_>, width: usize) -> Result<Vec<Value>, Error> {
    (0..width)
        .map(|index| {
            let value = row.get_ref(index).map_err(database_error)?;
            Ok(match value {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(int) => Value::BigInt(int),
                ValueRef::Real(real) => Value::Double(real),
                ValueRef::Text(text) => Value::Text(String::from_utf8_lossy(text).into_owned()),
                ValueRef::Blob(blob) => Value::Bytes(blob.to_vec()),
            })
        })
        .collect()
}

/// Converts a dynamically typed SQLite value into the column's declared type where that is
/// lossless. Only declared columns can reject a value.
fn fit(value: Value, column: &ColumnInfo) -> Result<Value, Error> {
    let fitted = match (&column.data_type, value) {
        (_, Value::Null) => Value::Null,
        (DataType::Bool, Value::BigInt(int)) => Value::Bool(int != 0),
        (DataType::BigInt, Value::Double(real))
            if real.fract() == 0.0 && real >= i64::MIN as f64 && real < i64::MAX as f64 =>
        {
            Value::BigInt(real as i64)
        }
        (DataType::BigInt | DataType::Bool, Value::Text(text)) => match text.trim().parse() {
            Ok(int) => fit(Value::BigInt(int), column)?,
            Err(_) => return Err(mismatch(column, &text)),
        },
        (DataType::Double, Value::BigInt(int)) => Value::Double(int as f64),
        (DataType::Double, Value::Text(text)) => match text.trim().parse() {
            Ok(real) => Value::Double(real),
            Err(_) => return Err(mismatch(column, &text)),
        },
        (DataType::Bytes, Value::Text(text)) => Value::Bytes(text.into_bytes()),
        (DataType::Json, Value::Text(text)) => match serde_json::from_str(&text) {
            Ok(json) => Value::Json(json),
            Err(_) => Value::Text(text),
        },
        (DataType::BigInt | DataType::Bool | DataType::Double, Value::Bytes(_)) => {
            return Err(mismatch(column, "blob"));
        }
        (DataType::BigInt | DataType::Bool, Value::Double(real)) => {
            return Err(mismatch(column, &real.to_string()));
        }
        (_, other) => other,
    };
    Ok(fitted)
}

fn mismatch(column: &ColumnInfo, found: &str) -> Error {
    Error::new(ErrorKind::Database).with_message(format!(
        "value {found:?} in column {} does not fit declared type {}",
        column.name,
        column.data_type.name()
    ))
}

fn reports_changes(sql: &str) -> Result<bool, Error> {
    Ok(matches!(
        first_keyword(sql)?.as_deref(),
        Some("INSERT" | "UPDATE" | "DELETE" | "REPLACE")
    ))
}

fn database_error(err: rusqlite::Error) -> Error {
    let message = if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) {
        "statement interrupted by cancel request".to_string()
    } else {
        err.to_string()
    };
    Error::new(ErrorKind::Database)
        .with_message(message)
        .with_source(err)
}
