//! Purpose: Define the public Rust API boundary for sqlspool.
//! Exports: Engine types and operations needed by the CLI and embedders.
//! Role: Additive-only surface; hides storage and codec internals.
//! Invariants: Row codec and spool file types stay internal.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::batch::{Batch, BatchSummary, ResultMessage};
pub use crate::core::column::{ColumnInfo, DataType};
pub use crate::core::connection::{
    CancelHandle, Connection, Cursor, CursorKind, PlanTemplates, RowsCursor,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::events::{NoEvents, QueryEvents};
pub use crate::core::export::{
    CsvOptions, ExcelOptions, ExportHandle, Exporter, ExporterFactory, LineTerminator, SaveFormat,
    SaveParams, SaveSelection,
};
pub use crate::core::query::{ExecutionPlan, ExecutionState, Query, QuerySettings};
pub use crate::core::result_set::{ResultSet, ResultSetSummary, StorageType};
pub use crate::core::selection::{Selection, compute_selections};
pub use crate::core::service::{CancelOutcome, QueryService, SharedConnection};
pub use crate::core::splitter::{Statement, split_statements, statement_at};
pub use crate::core::subset::ResultSetSubset;
pub use crate::core::value::{CellValue, Value};
pub use crate::spool_paths::{SPOOL_DIR_ENV, default_spool_dir};
pub use crate::sqlite::SqliteConnection;
