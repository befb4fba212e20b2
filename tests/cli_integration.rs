// CLI integration tests for split, run, and export.
use std::io::Write;
use std::process::{Command, Stdio};

use serde_json::Value;

fn cmd(spool_dir: &std::path::Path) -> Command {
    let exe = env!("CARGO_BIN_EXE_sqlspool");
    let mut command = Command::new(exe);
    command.args(["--spool-dir", spool_dir.to_str().unwrap()]);
    command
}

fn parse_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

fn write_sql(dir: &std::path::Path, sql: &str) -> std::path::PathBuf {
    let path = dir.join("doc.sql");
    std::fs::write(&path, sql).expect("write sql");
    path
}

#[test]
fn split_reads_stdin_and_reports_selections() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut child = cmd(temp.path())
        .arg("split")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn split");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(b"select 1;\n  select 2;")
        .expect("write stdin");
    let output = child.wait_with_output().expect("split");
    assert!(output.status.success());

    let json = parse_json(&output.stdout);
    let statements = json["statements"].as_array().expect("statements");
    assert_eq!(statements.len(), 2);
    assert_eq!(statements[0]["text"], "select 1;");
    assert_eq!(statements[1]["text"], "select 2;");
    assert_eq!(statements[1]["selection"]["start_line"], 1);
    assert_eq!(statements[1]["selection"]["start_column"], 2);
    assert_eq!(statements[1]["selection"]["end_column"], 11);
}

#[test]
fn run_prints_batches_and_pages() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sql = write_sql(
        temp.path(),
        "create table t (n integer, label text);
insert into t values (1, 'a'), (2, null), (3, 'c');
select n, label from t order by n;",
    );
    let output = cmd(temp.path())
        .args(["run", sql.to_str().unwrap(), "--page", "1:5"])
        .output()
        .expect("run");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let json = parse_json(&output.stdout);
    let batches = json["batches"].as_array().expect("batches");
    assert_eq!(batches.len(), 3);
    assert_eq!(
        batches[0]["messages"][0]["message"],
        "Commands completed successfully"
    );
    assert_eq!(batches[1]["messages"][0]["message"], "(3 row(s) affected)");

    let result_set = &batches[2]["result_set"];
    assert_eq!(result_set["row_count"], 3);
    assert_eq!(result_set["columns"], serde_json::json!(["n", "label"]));
    assert_eq!(result_set["page"]["start"], 1);
    assert_eq!(
        result_set["page"]["rows"],
        serde_json::json!([[2, null], [3, "c"]])
    );
    assert_eq!(batches[2]["summary"]["has_executed"], true);
}

#[test]
fn failing_statement_exits_with_database_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sql = write_sql(temp.path(), "select 1;\nselect nope from missing;\nselect 3;");
    let output = cmd(temp.path())
        .args(["run", sql.to_str().unwrap()])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(6));

    let json = parse_json(&output.stdout);
    let batches = json["batches"].as_array().expect("batches");
    assert_eq!(batches[0]["result_set"]["page"]["rows"], serde_json::json!([[1]]));
    assert_eq!(batches[1]["summary"]["has_error"], true);
    assert_eq!(batches[2]["summary"]["has_executed"], false);

    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Database");
}

#[test]
fn export_writes_csv_selection() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sql = write_sql(
        temp.path(),
        "select 1 as a, 'x' as b, 2.5 as c union all select 2, 'y', 3.5;",
    );
    let out = temp.path().join("out.csv");
    let output = cmd(temp.path())
        .args([
            "export",
            sql.to_str().unwrap(),
            "--batch",
            "0",
            "--out",
            out.to_str().unwrap(),
            "--format",
            "csv",
            "--columns",
            "1:2",
            "--lf",
        ])
        .output()
        .expect("export");
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let json = parse_json(&output.stdout);
    assert_eq!(json["rows"], 2);
    let csv = std::fs::read_to_string(&out).expect("read csv");
    assert_eq!(csv, "b,c\nx,2.5\ny,3.5\n");
}

#[test]
fn export_of_a_batch_without_rows_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sql = write_sql(temp.path(), "create table t (n integer);");
    let out = temp.path().join("out.json");
    let output = cmd(temp.path())
        .args([
            "export",
            sql.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--format",
            "json",
        ])
        .output()
        .expect("export");
    assert_eq!(output.status.code(), Some(3));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "NotFound");
    assert!(err["error"]["hint"].as_str().is_some());
    assert!(!out.exists());
}

#[test]
fn bad_page_is_a_usage_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sql = write_sql(temp.path(), "select 1;");
    let output = cmd(temp.path())
        .args(["run", sql.to_str().unwrap(), "--page", "ten"])
        .output()
        .expect("run");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
}
