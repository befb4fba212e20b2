//! Purpose: Seams to the live database: statement execution, row cursors, and out-of-band cancel.
//! Exports: `Connection`, `Cursor`, `CursorKind`, `CancelHandle`, `PlanTemplates`, `RowsCursor`.
//! Role: Everything the engine needs from a driver; concrete drivers live outside `core`.
//! Invariants: `execute` calls `on_result` only for statements that yield column metadata.
//! Invariants: A `CancelHandle` must be usable from another thread while `execute` blocks.
use crate::core::column::ColumnInfo;
use crate::core::error::Error;
use crate::core::value::Value;

/// How the driver should open the cursor for a statement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CursorKind {
    /// Default driver cursor.
    Client,
    /// Uniquely named server-side cursor that streams rows on demand.
    Server(String),
}

pub trait Cursor {
    fn columns(&self) -> &[ColumnInfo];
    fn fetch_next(&mut self) -> Result<Option<Vec<Value>>, Error>;
}

pub trait CancelHandle: Send + Sync {
    /// Interrupts the statement currently running on the originating connection.
    fn cancel(&self) -> Result<(), Error>;
}

/// Statement templates used for execution-plan requests; `{}` is replaced by the statement.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlanTemplates {
    pub estimated: String,
    pub actual: String,
}

impl Default for PlanTemplates {
    fn default() -> Self {
        Self {
            estimated: "EXPLAIN {}".to_string(),
            actual: "EXPLAIN ANALYZE {}".to_string(),
        }
    }
}

pub trait Connection: Send {
    /// Runs one statement. Returns the affected-row count when the driver reports one.
    fn execute(
        &mut self,
        sql: &str,
        cursor: &CursorKind,
        on_result: &mut dyn FnMut(&mut dyn Cursor) -> Result<(), Error>,
    ) -> Result<Option<u64>, Error>;

    /// Drains server notices captured since the last call.
    fn take_notices(&mut self) -> Vec<String> {
        Vec::new()
    }

    fn autocommit(&self) -> bool;

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), Error>;

    fn is_open(&self) -> bool {
        true
    }

    fn in_failed_transaction(&self) -> bool {
        false
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle>;

    fn plan_templates(&self) -> PlanTemplates {
        PlanTemplates::default()
    }
}

/// Cursor over rows already in memory; used for row edits and by tests.
#[derive(Clone, Debug)]
pub struct RowsCursor {
    columns: Vec<ColumnInfo>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl RowsCursor {
    pub fn new(columns: Vec<ColumnInfo>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl Cursor for RowsCursor {
    fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    fn fetch_next(&mut self) -> Result<Option<Vec<Value>>, Error> {
        Ok(self.rows.next())
    }
}
