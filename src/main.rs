//! Purpose: `sqlspool` CLI entry point: split, run, and export SQL documents.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Command results are JSON on stdout (pretty on a TTY).
//! Invariants: Errors are emitted on stderr, as JSON unless stderr is a TTY.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: Ctrl-C cancels the running query instead of killing the process.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{
    CommandFactory, Parser, Subcommand, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind,
};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod command_dispatch;

use sqlspool::api::{
    BatchSummary, CsvOptions, Error, ErrorKind, ExcelOptions, ExecutionPlan, LineTerminator,
    Query, QueryEvents, QueryService, QuerySettings, ResultMessage, ResultSetSubset, SaveFormat,
    SaveParams, SaveSelection, SharedConnection, SqliteConnection, StorageType, default_spool_dir,
    split_statements, to_exit_code,
};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse_from(normalize_args(std::env::args_os())) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `sqlspool --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    let color_mode = cli.color;
    let context = RunContext {
        db: cli.db,
        settings: QuerySettings {
            plan: cli.plan.into(),
            storage: cli.storage.into(),
            spool_dir: cli.spool_dir.unwrap_or_else(default_spool_dir),
        },
    };

    command_dispatch::dispatch_command(cli.command, context, color_mode)
        .map_err(add_io_hint)
        .map_err(|err| (err, color_mode))
}

fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    args.into_iter()
        .map(|arg| {
            let replacement = arg.to_str().and_then(|value| match value {
                "---help" => Some("--help"),
                "---version" => Some("--version"),
                _ => None,
            });
            replacement.map(OsString::from).unwrap_or(arg)
        })
        .collect()
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

#[derive(Parser)]
#[command(
    name = "sqlspool",
    version,
    about = "Run SQL documents and page or export their result sets",
    long_about = None,
    after_help = r#"EXAMPLES
  $ sqlspool split queries.sql
  $ sqlspool --db app.db run queries.sql --page 0:50
  $ sqlspool --db app.db export queries.sql --batch 1 --out rows.csv --format csv
  $ echo 'select 1; select 2;' | sqlspool run

Result sets are spooled to disk by default; use --storage memory to keep them in RAM.
Ctrl-C cancels the running statement and skips the remaining ones."#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(
        long,
        default_value = ":memory:",
        help = "SQLite database file (`:memory:` for a scratch database)",
        value_hint = ValueHint::FilePath
    )]
    db: PathBuf,
    #[arg(
        long,
        help = "Directory for spool files (default: $SQLSPOOL_SPOOL_DIR or the OS temp dir)",
        value_hint = ValueHint::DirPath
    )]
    spool_dir: Option<PathBuf>,
    #[arg(long, default_value = "file", value_enum, help = "Where result rows are kept")]
    storage: StorageCli,
    #[arg(long, default_value = "none", value_enum, help = "Run statements as execution plans")]
    plan: PlanCli,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and pretty JSON output: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StorageCli {
    Memory,
    File,
}

impl From<StorageCli> for StorageType {
    fn from(value: StorageCli) -> Self {
        match value {
            StorageCli::Memory => StorageType::Memory,
            StorageCli::File => StorageType::Spooled,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PlanCli {
    None,
    Estimated,
    Actual,
}

impl From<PlanCli> for ExecutionPlan {
    fn from(value: PlanCli) -> Self {
        match value {
            PlanCli::None => ExecutionPlan::None,
            PlanCli::Estimated => ExecutionPlan::Estimated,
            PlanCli::Actual => ExecutionPlan::Actual,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum FormatCli {
    Csv,
    Json,
    Xlsx,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Split a SQL document into statements and print their selections")]
    Split {
        #[arg(help = "SQL file (reads stdin when omitted or `-`)", value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
    },
    #[command(about = "Execute a SQL document and print batch summaries, messages, and rows")]
    Run {
        #[arg(help = "SQL file (reads stdin when omitted or `-`)", value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
        #[arg(
            long,
            default_value = "0:100",
            help = "Rows to print per result set as START:COUNT"
        )]
        page: String,
    },
    #[command(about = "Execute a SQL document and save one result set to a file")]
    Export {
        #[arg(help = "SQL file (reads stdin when omitted or `-`)", value_hint = ValueHint::FilePath)]
        file: Option<PathBuf>,
        #[arg(long, default_value_t = 0, help = "Batch index whose result set is saved")]
        batch: usize,
        #[arg(long, help = "Output file", value_hint = ValueHint::FilePath)]
        out: PathBuf,
        #[arg(long, value_enum, help = "Output format")]
        format: FormatCli,
        #[arg(long, help = "Inclusive row range A:B")]
        rows: Option<String>,
        #[arg(long, help = "Inclusive column range A:B")]
        columns: Option<String>,
        #[arg(long, help = "Omit the header row (csv, xlsx)")]
        no_headers: bool,
        #[arg(long, default_value_t = ',', help = "CSV field delimiter")]
        delimiter: char,
        #[arg(long, help = "End CSV records with LF instead of CRLF")]
        lf: bool,
    },
    #[command(about = "Generate shell completion scripts")]
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

struct RunContext {
    db: PathBuf,
    settings: QuerySettings,
}

/// Logs progress at debug level; results are printed once the query finishes.
struct LogEvents;

impl QueryEvents for LogEvents {
    fn batch_completed(&self, batch: &BatchSummary) {
        tracing::debug!(
            batch = batch.id,
            has_error = batch.has_error,
            elapsed = batch.execution_elapsed.as_deref().unwrap_or_default(),
            "batch completed"
        );
    }

    fn message(&self, message: &ResultMessage) {
        tracing::debug!(
            batch = ?message.batch_id,
            is_error = message.is_error,
            "{}",
            message.message
        );
    }
}

fn read_document(file: Option<&Path>) -> Result<(String, String), Error> {
    match file {
        Some(path) if path.as_os_str() != "-" => {
            let text = fs::read_to_string(path).map_err(|err| {
                let kind = if err.kind() == io::ErrorKind::NotFound {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::Io
                };
                Error::new(kind)
                    .with_message("failed to read SQL file")
                    .with_path(path)
                    .with_source(err)
            })?;
            Ok((format!("file://{}", path.display()), text))
        }
        _ => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read stdin")
                    .with_source(err)
            })?;
            Ok(("stdin".to_string(), text))
        }
    }
}

/// Parses `A:B` into two integers.
fn parse_pair(value: &str, flag: &str) -> Result<(i64, i64), Error> {
    let invalid = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid {flag} value {value:?}"))
            .with_hint(format!("Use {flag} A:B with non-negative integers."))
    };
    let (left, right) = value.split_once(':').ok_or_else(invalid)?;
    let left = left.trim().parse::<i64>().map_err(|_| invalid())?;
    let right = right.trim().parse::<i64>().map_err(|_| invalid())?;
    if left < 0 || right < 0 {
        return Err(invalid());
    }
    Ok((left, right))
}

fn save_selection(
    rows: Option<&str>,
    columns: Option<&str>,
    row_count: usize,
    column_count: usize,
) -> Result<Option<SaveSelection>, Error> {
    if rows.is_none() && columns.is_none() {
        return Ok(None);
    }
    let last_row = row_count.saturating_sub(1) as i64;
    let last_column = column_count.saturating_sub(1) as i64;
    let (row_start, row_end) = rows
        .map(|value| parse_pair(value, "--rows"))
        .transpose()?
        .unwrap_or((0, last_row));
    let (column_start, column_end) = columns
        .map(|value| parse_pair(value, "--columns"))
        .transpose()?
        .unwrap_or((0, last_column));
    Ok(Some(SaveSelection {
        row_start: row_start as usize,
        row_end: row_end as usize,
        column_start: column_start as usize,
        column_end: column_end as usize,
    }))
}

fn save_format(format: FormatCli, no_headers: bool, delimiter: char, lf: bool) -> SaveFormat {
    match format {
        FormatCli::Csv => SaveFormat::Csv(CsvOptions {
            include_headers: !no_headers,
            delimiter,
            line_terminator: if lf {
                LineTerminator::Lf
            } else {
                LineTerminator::CrLf
            },
            ..CsvOptions::default()
        }),
        FormatCli::Json => SaveFormat::Json,
        FormatCli::Xlsx => SaveFormat::Excel(ExcelOptions {
            include_headers: !no_headers,
        }),
    }
}

/// Runs `text` on a worker, cancelling it on Ctrl-C, and returns the finished query.
fn execute_document(
    service: &Arc<QueryService>,
    context: &RunContext,
    owner_uri: &str,
    text: &str,
) -> Result<(Arc<Query>, Result<(), Error>), Error> {
    let connection: SharedConnection = Arc::new(Mutex::new(SqliteConnection::open(&context.db)?));
    let query = service.execute_query(
        owner_uri,
        text,
        context.settings.clone(),
        connection,
        Arc::new(LogEvents),
    )?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    if let Err(err) =
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))
    {
        tracing::warn!(error = %err, "failed to install Ctrl-C handler");
    }
    let watcher = {
        let service = Arc::clone(service);
        let owner_uri = owner_uri.to_string();
        let interrupted = Arc::clone(&interrupted);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            while !finished.load(Ordering::Acquire) {
                if interrupted.swap(false, Ordering::AcqRel) {
                    match service.cancel(&owner_uri) {
                        Ok(outcome) => tracing::info!(%outcome, "cancel requested"),
                        Err(err) => tracing::warn!(error = %err, "cancel failed"),
                    }
                }
                thread::sleep(Duration::from_millis(50));
            }
        })
    };

    let outcome = service.wait(owner_uri);
    finished.store(true, Ordering::Release);
    join_watcher(watcher);
    Ok((query, outcome))
}

/// Joins the Ctrl-C watcher; a panic there is logged, never fatal. Returns whether it exited cleanly.
fn join_watcher(watcher: thread::JoinHandle<()>) -> bool {
    match watcher.join() {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!(%reason, "ctrl-c watcher thread panicked");
            false
        }
    }
}

fn split_json(text: &str) -> Result<Value, Error> {
    let statements = split_statements(text)?;
    Ok(json!({ "statements": statements }))
}

fn run_json(query: &Query, start: i64, count: i64) -> Result<Value, Error> {
    let mut batches = Vec::new();
    for batch in query.batches() {
        let mut entry = Map::new();
        entry.insert("summary".to_string(), json!(batch.summary()));
        entry.insert("messages".to_string(), json!(batch.messages()));
        if let Some(result_set) = batch.result_set() {
            let total = result_set.row_count() as i64;
            let page_start = start.min(total);
            let page_end = start.saturating_add(count).min(total);
            let subset = if page_start < page_end {
                ResultSetSubset::from_result_set(&result_set, page_start, page_end)?
            } else {
                ResultSetSubset {
                    row_count: 0,
                    rows: Vec::new(),
                }
            };
            let columns: Vec<_> = result_set
                .columns()
                .iter()
                .map(|column| column.name.clone())
                .collect();
            let rows: Vec<Vec<Value>> = subset
                .rows
                .iter()
                .map(|row| row.iter().map(|cell| cell.raw.to_json()).collect())
                .collect();
            entry.insert(
                "result_set".to_string(),
                json!({
                    "row_count": total,
                    "columns": columns,
                    "page": { "start": page_start, "rows": rows },
                }),
            );
        }
        batches.push(Value::Object(entry));
    }
    Ok(json!({
        "owner_uri": query.owner_uri(),
        "canceled": query.is_canceled(),
        "batches": batches,
    }))
}

fn emit_json(value: Value, color_mode: ColorMode) {
    let is_tty = io::stdout().is_terminal();
    let pretty = is_tty || color_mode.use_color(is_tty);
    let json = if pretty {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Range => "index out of range".to_string(),
        ErrorKind::Parse => "could not split SQL text".to_string(),
        ErrorKind::Database => "database error".to_string(),
        ErrorKind::Codec => "corrupt spool data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(row) = err.row() {
        inner.insert("row".to_string(), json!(row));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(row) = err.row() {
        lines.push(format!(
            "{} {row}",
            colorize_label("row:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }
    lines.join("\n")
}

fn add_io_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Io || err.hint().is_some() {
        return err;
    }
    err.with_hint("Check that the path exists and is writable, or pass --spool-dir.")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{Cli, error_json, error_text, join_watcher, parse_pair, save_selection};
    use clap::CommandFactory;
    use sqlspool::api::{Error, ErrorKind};

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn watcher_panics_are_reported_not_propagated() {
        let clean = std::thread::spawn(|| {});
        assert!(join_watcher(clean));
        let panicked = std::thread::spawn(|| panic!("watcher failed"));
        assert!(!join_watcher(panicked));
    }

    #[test]
    fn pairs_parse_and_reject_garbage() {
        assert_eq!(parse_pair("2:7", "--rows").expect("pair"), (2, 7));
        let err = parse_pair("2-7", "--rows").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(parse_pair("-1:3", "--rows").is_err());
    }

    #[test]
    fn selection_fills_missing_axis() {
        let selection = save_selection(Some("1:2"), None, 10, 4)
            .expect("selection")
            .expect("some");
        assert_eq!(
            (selection.row_start, selection.row_end, selection.column_start, selection.column_end),
            (1, 2, 0, 3)
        );
        assert!(save_selection(None, None, 10, 4).expect("none").is_none());
    }

    #[test]
    fn error_envelope_carries_context() {
        let err = Error::new(ErrorKind::Range)
            .with_message("row 9 out of range")
            .with_hint("Use a smaller index.")
            .with_row(9);
        let value = error_json(&err);
        assert_eq!(value["error"]["kind"], "Range");
        assert_eq!(value["error"]["row"], 9);
        let text = error_text(&err, false);
        assert!(text.starts_with("error: row 9 out of range"));
        assert!(text.contains("hint: Use a smaller index."));
    }
}
