//! Purpose: Execute one statement and capture its outcome: timings, notices, errors, rows.
//! Exports: `Batch`, `BatchSummary`, `ResultMessage`.
//! Role: Unit of work inside a query; owns at most one result set.
//! Invariants: End time, notices, and `has_executed` are recorded whether or not the statement fails.
//! Invariants: Database errors mark the batch (`has_error`) and are returned unchanged; no retry.
//! Invariants: A result set is attached only after it has been read to the end.
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::connection::{Connection, Cursor, CursorKind};
use crate::core::error::Error;
use crate::core::events::QueryEvents;
use crate::core::result_set::{ResultSet, ResultSetSummary, StorageType};
use crate::core::selection::Selection;
use crate::core::splitter::uses_server_cursor;
use crate::spool_paths::random_token;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchSummary {
    pub id: usize,
    pub selection: Selection,
    pub execution_start: Option<String>,
    pub execution_end: Option<String>,
    pub execution_elapsed: Option<String>,
    pub has_error: bool,
    pub has_executed: bool,
    pub result_set_summaries: Vec<ResultSetSummary>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResultMessage {
    pub batch_id: Option<usize>,
    pub is_error: bool,
    pub time: String,
    pub message: String,
}

impl ResultMessage {
    pub(crate) fn new(batch_id: Option<usize>, is_error: bool, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            is_error,
            time: timestamp(OffsetDateTime::now_utc()),
            message: message.into(),
        }
    }
}

#[derive(Default)]
struct Outcome {
    started: Option<OffsetDateTime>,
    ended: Option<OffsetDateTime>,
    has_error: bool,
    has_executed: bool,
    rows_affected: Option<u64>,
    notices: Vec<String>,
    messages: Vec<ResultMessage>,
    result_set: Option<Arc<ResultSet>>,
}

pub struct Batch {
    id: usize,
    selection: Selection,
    text: String,
    outcome: Mutex<Outcome>,
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.id)
            .field("selection", &self.selection)
            .field("text", &self.text)
            .finish()
    }
}

impl Batch {
    pub fn new(id: usize, selection: Selection, text: impl Into<String>) -> Self {
        Self {
            id,
            selection,
            text: text.into(),
            outcome: Mutex::new(Outcome::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn has_error(&self) -> bool {
        self.outcome().has_error
    }

    pub fn has_executed(&self) -> bool {
        self.outcome().has_executed
    }

    pub fn rows_affected(&self) -> Option<u64> {
        self.outcome().rows_affected
    }

    pub fn notices(&self) -> Vec<String> {
        self.outcome().notices.clone()
    }

    pub fn messages(&self) -> Vec<ResultMessage> {
        self.outcome().messages.clone()
    }

    pub fn result_set(&self) -> Option<Arc<ResultSet>> {
        self.outcome().result_set.clone()
    }

    pub fn summary(&self) -> BatchSummary {
        let outcome = self.outcome();
        let elapsed = match (outcome.started, outcome.ended) {
            (Some(start), Some(end)) => Some(format_elapsed(end - start)),
            _ => None,
        };
        BatchSummary {
            id: self.id,
            selection: self.selection,
            execution_start: outcome.started.map(timestamp),
            execution_end: outcome.ended.map(timestamp),
            execution_elapsed: elapsed,
            has_error: outcome.has_error,
            has_executed: outcome.has_executed,
            result_set_summaries: outcome
                .result_set
                .iter()
                .map(|result_set| result_set.summary())
                .collect(),
        }
    }

    /// Runs the batch text (wrapped in `template` when given) on `conn`.
    pub fn execute(
        &self,
        conn: &mut dyn Connection,
        template: Option<&str>,
        storage: StorageType,
        spool_dir: &Path,
        events: &dyn QueryEvents,
    ) -> Result<(), Error> {
        self.outcome().started = Some(OffsetDateTime::now_utc());
        events.batch_started(&self.summary());

        let sql = match template {
            Some(template) => template.replacen("{}", &self.text, 1),
            None => self.text.clone(),
        };
        tracing::debug!(batch = self.id, "executing batch");

        let mut result_set = None;
        let outcome = self.run(conn, &sql, storage, spool_dir, &mut result_set);

        let notices = conn.take_notices();
        let mut messages: Vec<ResultMessage> = notices
            .iter()
            .map(|notice| ResultMessage::new(Some(self.id), false, notice.clone()))
            .collect();
        match &outcome {
            Ok(affected) => {
                let rows = affected.or_else(|| {
                    result_set
                        .as_ref()
                        .map(|result_set: &Arc<ResultSet>| result_set.row_count() as u64)
                });
                let text = match rows {
                    Some(rows) => format!("({rows} row(s) affected)"),
                    None => "Commands completed successfully".to_string(),
                };
                messages.push(ResultMessage::new(Some(self.id), false, text));
            }
            Err(err) => {
                let text = err.message().map_or_else(|| err.to_string(), str::to_string);
                messages.push(ResultMessage::new(Some(self.id), true, text));
            }
        }

        {
            let mut state = self.outcome();
            state.ended = Some(OffsetDateTime::now_utc());
            state.has_executed = true;
            state.has_error = outcome.is_err();
            state.rows_affected = outcome.as_ref().ok().copied().flatten();
            state.notices = notices;
            state.messages = messages.clone();
            state.result_set = result_set.clone();
        }

        if let Some(result_set) = &result_set {
            events.result_set_completed(&result_set.summary());
        }
        for message in &messages {
            events.message(message);
        }
        let summary = self.summary();
        match &outcome {
            Ok(_) => tracing::debug!(batch = self.id, elapsed = ?summary.execution_elapsed, "batch finished"),
            Err(err) => tracing::debug!(batch = self.id, error = %err, "batch failed"),
        }
        events.batch_completed(&summary);
        outcome.map(|_| ())
    }

    fn run(
        &self,
        conn: &mut dyn Connection,
        sql: &str,
        storage: StorageType,
        spool_dir: &Path,
        result_set: &mut Option<Arc<ResultSet>>,
    ) -> Result<Option<u64>, Error> {
        let cursor = if uses_server_cursor(sql)? {
            CursorKind::Server(format!("sqlspool_{}", random_token()?))
        } else {
            CursorKind::Client
        };
        conn.execute(sql, &cursor, &mut |cursor: &mut dyn Cursor| {
            let created = ResultSet::new(0, self.id, cursor.columns().to_vec(), storage, spool_dir)?;
            created.read_result_to_end(cursor)?;
            *result_set = Some(Arc::new(created));
            Ok(())
        })
    }

    fn outcome(&self) -> std::sync::MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn timestamp(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

/// `HH:MM:SS.mmm`
fn format_elapsed(elapsed: time::Duration) -> String {
    let millis = elapsed.whole_milliseconds().max(0);
    let (secs, millis) = (millis / 1000, millis % 1000);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        millis
    )
}
