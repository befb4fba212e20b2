//! Purpose: Library crate behind the `sqlspool` CLI and integration tests.
//! Exports: `api` (stable surface), `core` (engine modules), `sqlite` (bundled driver).
//! Role: Query execution engine that spools result sets to disk and exports them.
//! Invariants: Callers outside the crate go through `api`; `core` layout may change.
//! Invariants: Engine modules never touch process state (stdout, signals, exit codes).
pub mod api;
pub mod core;
pub mod spool_paths;
pub mod sqlite;
