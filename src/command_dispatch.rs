//! Purpose: Hold top-level CLI command dispatch for `sqlspool`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command prints one JSON document on success.
//! Invariants: A failed query still prints its batches before the error is returned.

use super::*;

pub(super) fn dispatch_command(
    command: Command,
    context: RunContext,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "sqlspool", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Split { file } => {
            let (_, text) = read_document(file.as_deref())?;
            emit_json(split_json(&text)?, color_mode);
            Ok(RunOutcome::ok())
        }
        Command::Run { file, page } => {
            let (start, count) = parse_pair(&page, "--page")?;
            let (owner_uri, text) = read_document(file.as_deref())?;
            let service = Arc::new(QueryService::new());
            let (query, outcome) = execute_document(&service, &context, &owner_uri, &text)?;
            emit_json(run_json(&query, start, count)?, color_mode);
            service.dispose(&owner_uri)?;
            outcome.map(|()| RunOutcome::ok())
        }
        Command::Export {
            file,
            batch,
            out,
            format,
            rows,
            columns,
            no_headers,
            delimiter,
            lf,
        } => {
            let (owner_uri, text) = read_document(file.as_deref())?;
            let service = Arc::new(QueryService::new());
            let (query, outcome) = execute_document(&service, &context, &owner_uri, &text)?;
            outcome?;

            let result_set = query.result_set(batch, 0).map_err(|err| {
                err.with_hint("Pick a batch that returns rows; `sqlspool split` lists batch indices.")
            })?;
            let selection = save_selection(
                rows.as_deref(),
                columns.as_deref(),
                result_set.row_count(),
                result_set.columns().len(),
            )?;
            let mut params = SaveParams::new(&out);
            if let Some(selection) = selection {
                params = params.with_selection(selection);
            }
            let factory = Arc::new(save_format(format, no_headers, delimiter, lf));
            let written = service
                .save_as(&owner_uri, batch, 0, params, factory)?
                .wait()?;
            emit_json(
                json!({
                    "path": out.display().to_string(),
                    "batch": batch,
                    "rows": written,
                }),
                color_mode,
            );
            service.dispose(&owner_uri)?;
            Ok(RunOutcome::ok())
        }
    }
}
