//! Purpose: Turn a submitted SQL document into ordered batches and run them on one connection.
//! Exports: `Query`, `QuerySettings`, `ExecutionState`, `ExecutionPlan`.
//! Role: Execution state machine owned by one editor document (the owner URI).
//! Invariants: State moves NotStarted -> Executing -> Executed exactly once; re-execution is a usage error.
//! Invariants: Cancellation is checked between batches only; a running batch finishes or is interrupted out of band.
//! Invariants: Actual-plan runs disable autocommit and restore the saved value afterwards, even on failure.
//! Invariants: The query ends in `Executed` whether batches succeed, fail, or are cancelled.
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use serde::Serialize;

use crate::core::batch::{Batch, BatchSummary};
use crate::core::connection::Connection;
use crate::core::error::{Error, ErrorKind};
use crate::core::events::QueryEvents;
use crate::core::export::{ExportHandle, ExporterFactory, SaveParams};
use crate::core::result_set::{ResultSet, StorageType};
use crate::core::splitter::split_statements;
use crate::spool_paths::default_spool_dir;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    NotStarted = 0,
    Executing = 1,
    Executed = 2,
}

impl ExecutionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutionState::NotStarted,
            1 => ExecutionState::Executing,
            _ => ExecutionState::Executed,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPlan {
    #[default]
    None,
    Estimated,
    Actual,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QuerySettings {
    pub plan: ExecutionPlan,
    pub storage: StorageType,
    pub spool_dir: PathBuf,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            plan: ExecutionPlan::None,
            storage: StorageType::default(),
            spool_dir: default_spool_dir(),
        }
    }
}

pub struct Query {
    owner_uri: String,
    text: String,
    settings: QuerySettings,
    batches: Vec<Batch>,
    state: AtomicU8,
    current_batch: AtomicUsize,
    canceled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("owner_uri", &self.owner_uri)
            .field("state", &self.execution_state())
            .field("batches", &self.batches)
            .finish()
    }
}

impl Query {
    /// Splits `text` into batches. Split errors surface here and no batches are created.
    pub fn new(
        owner_uri: impl Into<String>,
        text: impl Into<String>,
        settings: QuerySettings,
    ) -> Result<Self, Error> {
        let text = text.into();
        let batches = split_statements(&text)?
            .into_iter()
            .enumerate()
            .map(|(id, statement)| Batch::new(id, statement.selection, statement.text))
            .collect();
        Ok(Self {
            owner_uri: owner_uri.into(),
            text,
            settings,
            batches,
            state: AtomicU8::new(ExecutionState::NotStarted as u8),
            current_batch: AtomicUsize::new(0),
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn owner_uri(&self) -> &str {
        &self.owner_uri
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch(&self, index: usize) -> Result<&Batch, Error> {
        self.batches.get(index).ok_or_else(|| {
            Error::new(ErrorKind::NotFound).with_message(format!(
                "batch {index} does not exist; query has {} batches",
                self.batches.len()
            ))
        })
    }

    /// Result set `result_set_index` of batch `batch_index`. Batches hold at most one, at index 0.
    pub fn result_set(
        &self,
        batch_index: usize,
        result_set_index: usize,
    ) -> Result<Arc<ResultSet>, Error> {
        let batch = self.batch(batch_index)?;
        match batch.result_set() {
            Some(result_set) if result_set_index == 0 => Ok(result_set),
            _ => Err(Error::new(ErrorKind::NotFound).with_message(format!(
                "batch {batch_index} has no result set {result_set_index}"
            ))),
        }
    }

    pub fn save_as(
        &self,
        batch_index: usize,
        result_set_index: usize,
        params: SaveParams,
        factory: Arc<dyn ExporterFactory>,
    ) -> Result<ExportHandle, Error> {
        self.result_set(batch_index, result_set_index)?
            .save_as(params, factory)
    }

    pub fn execution_state(&self) -> ExecutionState {
        ExecutionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn current_batch_index(&self) -> usize {
        self.current_batch.load(Ordering::Acquire)
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Stops remaining batches from starting. Does not interrupt the running one.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Shared flag for callers (signal handlers) that cancel without a `Query` reference.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.canceled)
    }

    pub fn summaries(&self) -> Vec<BatchSummary> {
        self.batches.iter().map(Batch::summary).collect()
    }

    /// Runs every batch in order on `conn`, stopping at the first failure or at cancellation.
    pub fn execute(&self, conn: &mut dyn Connection, events: &dyn QueryEvents) -> Result<(), Error> {
        self.state
            .compare_exchange(
                ExecutionState::NotStarted as u8,
                ExecutionState::Executing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| {
                Error::new(ErrorKind::Usage)
                    .with_message("query has already been executed")
                    .with_hint("Create a new query to run the text again.")
            })?;
        tracing::info!(owner = %self.owner_uri, batches = self.batches.len(), "query started");
        events.query_started(&self.owner_uri);

        let templates = conn.plan_templates();
        let template = match self.settings.plan {
            ExecutionPlan::None => None,
            ExecutionPlan::Estimated => Some(templates.estimated),
            ExecutionPlan::Actual => Some(templates.actual),
        };

        let mut saved_autocommit = None;
        let mut outcome = Ok(());
        if self.settings.plan == ExecutionPlan::Actual {
            let previous = conn.autocommit();
            outcome = conn.set_autocommit(false);
            if outcome.is_ok() {
                saved_autocommit = Some(previous);
            }
        }
        if outcome.is_ok() {
            outcome = self.run_batches(conn, template.as_deref(), events);
        }

        if let Some(previous) = saved_autocommit {
            if conn.is_open() {
                if let Err(err) = conn.set_autocommit(previous) {
                    tracing::warn!(owner = %self.owner_uri, error = %err, "failed to restore autocommit");
                    if outcome.is_ok() {
                        outcome = Err(err);
                    }
                }
            }
        }

        self.state
            .store(ExecutionState::Executed as u8, Ordering::Release);
        let summaries = self.summaries();
        match &outcome {
            Ok(()) => tracing::info!(owner = %self.owner_uri, canceled = self.is_canceled(), "query finished"),
            Err(err) => tracing::info!(owner = %self.owner_uri, error = %err, "query failed"),
        }
        events.query_completed(&self.owner_uri, &summaries);
        outcome
    }

    fn run_batches(
        &self,
        conn: &mut dyn Connection,
        template: Option<&str>,
        events: &dyn QueryEvents,
    ) -> Result<(), Error> {
        for (index, batch) in self.batches.iter().enumerate() {
            if self.is_canceled() {
                tracing::info!(owner = %self.owner_uri, skipped = self.batches.len() - index, "query canceled");
                break;
            }
            self.current_batch.store(index, Ordering::Release);
            batch.execute(
                conn,
                template,
                self.settings.storage,
                &self.settings.spool_dir,
                events,
            )?;
        }
        Ok(())
    }
}
