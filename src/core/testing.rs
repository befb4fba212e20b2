// Scripted in-process connection for engine tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::core::column::ColumnInfo;
use crate::core::connection::{CancelHandle, Connection, Cursor, CursorKind, RowsCursor};
use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

#[derive(Clone)]
pub(crate) enum Reply {
    Rows(Vec<ColumnInfo>, Vec<Vec<Value>>),
    Affected(u64),
    Fail(&'static str),
    /// Blocks until cancelled, then fails like an interrupted statement.
    Hang,
}

#[derive(Default)]
pub(crate) struct Log {
    pub(crate) executed: Vec<(String, CursorKind)>,
    pub(crate) autocommit_changes: Vec<bool>,
}

pub(crate) struct ScriptedConnection {
    replies: HashMap<String, Reply>,
    notices: HashMap<String, Vec<String>>,
    pending_notices: Vec<String>,
    autocommit: bool,
    failed_transaction: bool,
    interrupted: Arc<AtomicBool>,
    pub(crate) log: Arc<Mutex<Log>>,
}

impl ScriptedConnection {
    pub(crate) fn new() -> Self {
        Self {
            replies: HashMap::new(),
            notices: HashMap::new(),
            pending_notices: Vec::new(),
            autocommit: true,
            failed_transaction: false,
            interrupted: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(Log::default())),
        }
    }

    pub(crate) fn reply(mut self, sql: &str, reply: Reply) -> Self {
        self.replies.insert(sql.to_string(), reply);
        self
    }

    pub(crate) fn notice(mut self, sql: &str, notice: &str) -> Self {
        self.notices
            .entry(sql.to_string())
            .or_default()
            .push(notice.to_string());
        self
    }

    pub(crate) fn without_autocommit(mut self) -> Self {
        self.autocommit = false;
        self
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.log
            .lock()
            .expect("log")
            .executed
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect()
    }
}

struct Interrupt(Arc<AtomicBool>);

impl CancelHandle for Interrupt {
    fn cancel(&self) -> Result<(), Error> {
        self.0.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Connection for ScriptedConnection {
    fn execute(
        &mut self,
        sql: &str,
        cursor: &CursorKind,
        on_result: &mut dyn FnMut(&mut dyn Cursor) -> Result<(), Error>,
    ) -> Result<Option<u64>, Error> {
        self.log
            .lock()
            .expect("log")
            .executed
            .push((sql.to_string(), cursor.clone()));
        if let Some(notices) = self.notices.get(sql) {
            self.pending_notices.extend(notices.iter().cloned());
        }
        if sql.eq_ignore_ascii_case("ROLLBACK") {
            self.failed_transaction = false;
            return Ok(None);
        }
        match self.replies.get(sql).cloned() {
            Some(Reply::Rows(columns, rows)) => {
                let mut rows = RowsCursor::new(columns, rows);
                on_result(&mut rows)?;
                Ok(None)
            }
            Some(Reply::Affected(count)) => Ok(Some(count)),
            Some(Reply::Fail(message)) => {
                self.failed_transaction = !self.autocommit;
                Err(Error::new(ErrorKind::Database).with_message(message))
            }
            Some(Reply::Hang) => {
                while !self.interrupted.swap(false, Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(2));
                }
                Err(Error::new(ErrorKind::Database)
                    .with_message("canceling statement due to user request"))
            }
            None => Ok(None),
        }
    }

    fn take_notices(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_notices)
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn set_autocommit(&mut self, enabled: bool) -> Result<(), Error> {
        self.autocommit = enabled;
        self.log
            .lock()
            .expect("log")
            .autocommit_changes
            .push(enabled);
        Ok(())
    }

    fn in_failed_transaction(&self) -> bool {
        self.failed_transaction
    }

    fn cancel_handle(&self) -> Box<dyn CancelHandle> {
        Box::new(Interrupt(Arc::clone(&self.interrupted)))
    }
}
