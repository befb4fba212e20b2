//! Purpose: Map statements back to line/column ranges of the document they came from.
//! Exports: `Selection`, `LineIndex`, `compute_selections`.
//! Role: Source attribution for batches; consumed by summaries and statement-under-cursor lookup.
//! Invariants: Lines and columns are 0-based; columns count characters, not bytes.
//! Invariants: Ranges are half-open: the end column is exclusive, one past the last character,
//! so `"select 1;"` on line 0 maps to `(0,0)-(0,9)`.
//! Invariants: Lookups advance monotonically, so repeated statement text maps to later occurrences.
use serde::Serialize;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Selection {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

impl Selection {
    pub fn new(start_line: usize, start_column: usize, end_line: usize, end_column: usize) -> Self {
        Self {
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// True when `(line, column)` falls inside the range, end position included.
    pub fn contains(&self, line: usize, column: usize) -> bool {
        let pos = (line, column);
        (self.start_line, self.start_column) <= pos && pos <= (self.end_line, self.end_column)
    }
}

/// Byte offsets at which each line of a document starts.
#[derive(Clone, Debug)]
pub struct LineIndex<'a> {
    text: &'a str,
    starts: Vec<usize>,
}

impl<'a> LineIndex<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(idx, _)| idx + 1));
        Self { text, starts }
    }

    /// Selection for the byte range `start..end` of the indexed text.
    pub fn selection(&self, start: usize, end: usize) -> Selection {
        let start_line = self.starts.partition_point(|&line| line <= start) - 1;
        let end_line = if end > 0 {
            self.starts.partition_point(|&line| line < end) - 1
        } else {
            0
        };
        Selection {
            start_line,
            start_column: self.column(start_line, start),
            end_line,
            end_column: self.column(end_line, end),
        }
    }

    fn column(&self, line: usize, offset: usize) -> usize {
        self.text[self.starts[line]..offset].chars().count()
    }
}

/// Locates each statement in `full_text`, searching forward from the end of the previous match.
pub fn compute_selections<S: AsRef<str>>(
    statements: &[S],
    full_text: &str,
) -> Result<Vec<Selection>, Error> {
    let index = LineIndex::new(full_text);
    let mut search_from = 0;
    let mut selections = Vec::with_capacity(statements.len());
    for statement in statements {
        let statement = statement.as_ref();
        let start = full_text[search_from..]
            .find(statement)
            .map(|found| search_from + found)
            .ok_or_else(|| {
                Error::new(ErrorKind::Parse).with_message(format!(
                    "statement not found in document text: {}",
                    preview(statement)
                ))
            })?;
        let end = start + statement.len();
        selections.push(index.selection(start, end));
        search_from = end;
    }
    Ok(selections)
}

fn preview(statement: &str) -> String {
    const MAX: usize = 40;
    let mut out: String = statement.chars().take(MAX).collect();
    if statement.chars().count() > MAX {
        out.push_str("...");
    }
    out
}
