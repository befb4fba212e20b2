//! Purpose: Owner-keyed registry of queries, each executed on its own worker thread.
//! Exports: `QueryService`, `SharedConnection`, `CancelOutcome`.
//! Role: Request-facing layer: execute, wait, page, cancel, dispose, and export by owner URI.
//! Invariants: At most one unfinished query per owner; a finished one is replaced by the next.
//! Invariants: Cancel sets the query flag and, while executing, fires the out-of-band cancel handle.
//! Invariants: The registry lock is never held while waiting for a connection; workers publish
//! their cancel handle once they own the connection.
//! Invariants: After a database failure inside an open transaction the connection is rolled back.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::core::batch::ResultMessage;
use crate::core::connection::{CancelHandle, Connection};
use crate::core::error::{Error, ErrorKind};
use crate::core::events::QueryEvents;
use crate::core::export::{ExportHandle, ExporterFactory, SaveParams};
use crate::core::query::{ExecutionPlan, ExecutionState, Query, QuerySettings};
use crate::core::result_set::StorageType;
use crate::core::subset::ResultSetSubset;

pub type SharedConnection = Arc<Mutex<dyn Connection>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Canceled,
    AlreadyExecuted,
}

impl fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelOutcome::Canceled => write!(f, "Query canceled"),
            CancelOutcome::AlreadyExecuted => write!(f, "Query already executed"),
        }
    }
}

/// Filled by the worker after it locks the connection; empty while it waits.
type CancelSlot = Arc<Mutex<Option<Box<dyn CancelHandle>>>>;

struct ActiveQuery {
    query: Arc<Query>,
    cancel: CancelSlot,
    worker: Option<JoinHandle<Result<(), Error>>>,
}

#[derive(Default)]
pub struct QueryService {
    queries: Mutex<HashMap<String, ActiveQuery>>,
}

impl QueryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `text` for `owner_uri` on a worker thread and returns the query immediately.
    pub fn execute_query(
        &self,
        owner_uri: &str,
        text: &str,
        settings: QuerySettings,
        connection: SharedConnection,
        events: Arc<dyn QueryEvents>,
    ) -> Result<Arc<Query>, Error> {
        let mut queries = self.queries()?;
        if let Some(existing) = queries.get(owner_uri) {
            if existing.query.execution_state() != ExecutionState::Executed {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("a query is already running for {owner_uri}"))
                    .with_hint("Cancel the running query or wait for it to finish."));
            }
        }

        let query = Arc::new(Query::new(owner_uri, text, settings)?);
        let cancel = CancelSlot::default();
        let worker = {
            let query = Arc::clone(&query);
            let cancel = Arc::clone(&cancel);
            thread::Builder::new()
                .name("sqlspool-query".to_string())
                .spawn(move || run_query(&query, &connection, &cancel, events.as_ref()))
                .map_err(|err| Error::io("failed to spawn query worker", err))?
        };

        queries.insert(
            owner_uri.to_string(),
            ActiveQuery {
                query: Arc::clone(&query),
                cancel,
                worker: Some(worker),
            },
        );
        Ok(query)
    }

    pub fn query(&self, owner_uri: &str) -> Result<Arc<Query>, Error> {
        let queries = self.queries()?;
        queries
            .get(owner_uri)
            .map(|active| Arc::clone(&active.query))
            .ok_or_else(|| not_found(owner_uri))
    }

    /// Blocks until the owner's worker finishes and returns the execution outcome.
    /// Later calls return `Ok(())` once the outcome has been collected.
    pub fn wait(&self, owner_uri: &str) -> Result<(), Error> {
        let worker = {
            let mut queries = self.queries()?;
            let active = queries
                .get_mut(owner_uri)
                .ok_or_else(|| not_found(owner_uri))?;
            active.worker.take()
        };
        match worker {
            Some(worker) => worker.join().map_err(|_| {
                Error::new(ErrorKind::Internal).with_message("query worker panicked")
            })?,
            None => Ok(()),
        }
    }

    pub fn subset(
        &self,
        owner_uri: &str,
        batch_index: usize,
        result_set_index: usize,
        start: i64,
        end: i64,
    ) -> Result<ResultSetSubset, Error> {
        let query = self.query(owner_uri)?;
        ResultSetSubset::from_query(&query, batch_index, result_set_index, start, end)
    }

    pub fn cancel(&self, owner_uri: &str) -> Result<CancelOutcome, Error> {
        let queries = self.queries()?;
        let active = queries.get(owner_uri).ok_or_else(|| not_found(owner_uri))?;
        cancel_active(owner_uri, active)
    }

    /// Cancels an unfinished query and forgets it. Spool files go once the last handle drops.
    pub fn dispose(&self, owner_uri: &str) -> Result<(), Error> {
        let active = self
            .queries()?
            .remove(owner_uri)
            .ok_or_else(|| not_found(owner_uri))?;
        if active.query.execution_state() != ExecutionState::Executed {
            cancel_active(owner_uri, &active)?;
        }
        tracing::debug!(owner = owner_uri, "query disposed");
        Ok(())
    }

    pub fn save_as(
        &self,
        owner_uri: &str,
        batch_index: usize,
        result_set_index: usize,
        params: SaveParams,
        factory: Arc<dyn ExporterFactory>,
    ) -> Result<ExportHandle, Error> {
        self.query(owner_uri)?
            .save_as(batch_index, result_set_index, params, factory)
    }

    fn queries(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveQuery>>, Error> {
        self.queries
            .lock()
            .map_err(|_| Error::poisoned("query registry"))
    }
}

fn cancel_active(owner_uri: &str, active: &ActiveQuery) -> Result<CancelOutcome, Error> {
    let state = active.query.execution_state();
    if state == ExecutionState::Executed {
        return Ok(CancelOutcome::AlreadyExecuted);
    }
    active.query.cancel();
    tracing::info!(owner = owner_uri, ?state, "cancel requested");
    if state == ExecutionState::Executing {
        let handle = active.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = handle.as_ref() {
            handle.cancel()?;
        }
    }
    Ok(CancelOutcome::Canceled)
}

fn run_query(
    query: &Query,
    connection: &SharedConnection,
    cancel: &CancelSlot,
    events: &dyn QueryEvents,
) -> Result<(), Error> {
    let mut conn = lock_connection(connection)?;
    *cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.cancel_handle());
    let outcome = query.execute(&mut *conn, events);
    if let Err(err) = &outcome {
        if err.kind() == ErrorKind::Database && conn.in_failed_transaction() {
            tracing::warn!(owner = query.owner_uri(), "rolling back failed transaction");
            rollback(query, &mut *conn, events);
        }
    }
    outcome
}

fn rollback(query: &Query, conn: &mut dyn Connection, events: &dyn QueryEvents) {
    let settings = QuerySettings {
        plan: ExecutionPlan::None,
        storage: StorageType::Memory,
        spool_dir: query.settings().spool_dir.clone(),
    };
    let result = Query::new(query.owner_uri(), "ROLLBACK", settings)
        .and_then(|rollback| rollback.execute(conn, &crate::core::events::NoEvents));
    if let Err(err) = result {
        let text = err.message().map_or_else(|| err.to_string(), str::to_string);
        events.message(&ResultMessage::new(None, true, text));
    }
}

fn lock_connection(
    connection: &SharedConnection,
) -> Result<MutexGuard<'_, dyn Connection + 'static>, Error> {
    connection.lock().map_err(|_| Error::poisoned("connection"))
}

fn not_found(owner_uri: &str) -> Error {
    Error::new(ErrorKind::NotFound).with_message(format!("no query for {owner_uri}"))
}
