//! Purpose: Scratch file holding encoded rows, plus the writer and reader built on the row codec.
//! Exports: `SpoolFile`, `SpoolWriter`, `SpoolReader`.
//! Role: Storage layer beneath the disk-spooled result set.
//! Invariants: A spool file is created fresh (`create_new`) and removed when its owner drops it.
//! Invariants: Rows are append-only; a row's bytes are never rewritten once flushed.
//! Invariants: Readers open their own handle so concurrent readers never share a file cursor.
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::core::codec::{read_cell, write_cell};
use crate::core::column::{ColumnInfo, DataType};
use crate::core::error::{Error, ErrorKind};
use crate::core::value::{CellValue, Value};
use crate::spool_paths::{random_token, spool_file_name};

#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
}

impl SpoolFile {
    pub fn create(dir: &Path) -> Result<Self, Error> {
        fs::create_dir_all(dir).map_err(|err| {
            Error::io("failed to create spool directory", err).with_path(dir)
        })?;
        let path = dir.join(spool_file_name(&random_token()?));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|err| Error::io("failed to create spool file", err).with_path(&path))?;
        tracing::debug!(path = %path.display(), "created spool file");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writer(&self) -> Result<SpoolWriter, Error> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| Error::io("failed to open spool file for writing", err))
            .map_err(|err| err.with_path(&self.path))?;
        Ok(SpoolWriter {
            out: BufWriter::new(file),
            path: self.path.clone(),
        })
    }

    pub fn reader(&self) -> Result<SpoolReader, Error> {
        let file = File::open(&self.path)
            .map_err(|err| Error::io("failed to open spool file for reading", err))
            .map_err(|err| err.with_path(&self.path))?;
        Ok(SpoolReader {
            input: BufReader::new(file),
            position: 0,
            path: self.path.clone(),
        })
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed spool file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to remove spool file")
            }
        }
    }
}

#[derive(Debug)]
pub struct SpoolWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl SpoolWriter {
    /// Writes one cell; `last_column` flushes so the finished row is visible to readers.
    pub fn write_cell(
        &mut self,
        value: &Value,
        data_type: &DataType,
        last_column: bool,
    ) -> Result<u64, Error> {
        let written =
            write_cell(&mut self.out, value, data_type).map_err(|err| err.with_path(&self.path))?;
        if last_column {
            self.out.flush().map_err(|err| {
                Error::new(ErrorKind::Codec)
                    .with_message("failed to flush spool row")
                    .with_path(&self.path)
                    .with_source(err)
            })?;
        }
        Ok(written)
    }

    /// Writes a full row and returns its encoded length in bytes.
    pub fn write_row(&mut self, values: &[Value], columns: &[ColumnInfo]) -> Result<u64, Error> {
        if values.len() != columns.len() {
            return Err(Error::new(ErrorKind::Codec).with_message(format!(
                "row has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        let mut total = 0;
        let last = columns.len().saturating_sub(1);
        for (idx, (value, column)) in values.iter().zip(columns).enumerate() {
            total += self.write_cell(value, &column.data_type, idx == last)?;
        }
        Ok(total)
    }
}

#[derive(Debug)]
pub struct SpoolReader {
    input: BufReader<File>,
    position: u64,
    path: PathBuf,
}

impl SpoolReader {
    /// Decodes the row starting at `offset`, one cell per column.
    pub fn read_row(
        &mut self,
        offset: u64,
        row_id: u64,
        columns: &[ColumnInfo],
    ) -> Result<Vec<CellValue>, Error> {
        let context = |err: Error| err.with_path(&self.path).with_row(row_id).with_offset(offset);
        if self.position != offset {
            self.input.seek(SeekFrom::Start(offset)).map_err(|err| {
                context(
                    Error::new(ErrorKind::Codec)
                        .with_message("failed to seek spool file")
                        .with_source(err),
                )
            })?;
            self.position = offset;
        }

        let mut cells = Vec::with_capacity(columns.len());
        for column in columns {
            let (value, consumed) = match read_cell(&mut self.input, &column.data_type) {
                Ok(read) => read,
                Err(err) => {
                    // Unknown stream position after a partial read.
                    self.position = u64::MAX;
                    return Err(context(err));
                }
            };
            self.position += consumed;
            cells.push(CellValue::new(value, row_id));
        }
        Ok(cells)
    }
}
