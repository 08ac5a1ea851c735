use anyhow::Result;
use std::env;

use crate::expect::Expectation;
use crate::fixtures::{remove_tree, script_path};
use crate::harness::Harness;

pub type TestCase = (&'static str, Box<dyn Fn(&Harness) -> Result<()>>);

fn out(needle: &str) -> Expectation {
    Expectation::stdout(needle)
}

fn err(needle: &str) -> Expectation {
    Expectation::stderr(needle)
}

fn quiet() -> Expectation {
    Expectation::new()
}

/// Every registered case, in run order.
pub fn all() -> Vec<TestCase> {
    let mut cases: Vec<TestCase> = vec![
        // --------------------- Queries ------------------------------------
        ("basic select", Box::new(|h| h.test("select 'asdf' as a;", out("asdf")))),
        ("range", Box::new(|h| h.test("select * from range(10000);", out("9999")))),
        (
            "pragma table_info",
            Box::new(|h| {
                h.test(
                    "
.mode csv
.headers off
.sep |
CREATE TABLE t0(c0 INT);
PRAGMA table_info('t0');
",
                    out("0|c0|INTEGER|false||false"),
                )
            }),
        ),
        ("import data file", Box::new(test_import_data_file)),
        ("list value", Box::new(|h| h.test("select LIST_VALUE(1, 2);", out("[1, 2]")))),
        (
            "struct pack",
            Box::new(|h| h.test("select STRUCT_PACK(x := 3, y := 3);", out("<x: 3, y: 3>"))),
        ),
        (
            "nested struct pack",
            Box::new(|h| {
                h.test(
                    "select STRUCT_PACK(x := 3, y := LIST_VALUE(1, 2));",
                    out("<x: 3, y: [1, 2]>"),
                )
            }),
        ),
        (
            "conversion error",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE a (i STRING);
INSERT INTO a VALUES ('XXXX');
SELECT CAST(i AS INTEGER) FROM a;
",
                    err("Could not convert"),
                )
            }),
        ),
        (
            "newline in value",
            Box::new(|h| h.test("select 'hello\nworld' as a;", out("hello\\nworld"))),
        ),
        (
            "newline in column name",
            Box::new(|h| h.test("select 42 as \"hello\nworld\";", out("hello\\nworld"))),
        ),
        ("like", Box::new(|h| h.test("select 'yo' where 'abc' like 'a%c';", out("yo")))),
        (
            "regexp_matches",
            Box::new(|h| h.test("select regexp_matches('abc','abc')", out("true"))),
        ),
        // --------------------- Unsupported dot commands -------------------
        ("auth on", Box::new(|h| h.test(".auth ON", err("sqlite3_set_authorizer")))),
        ("auth off", Box::new(|h| h.test(".auth OFF", err("sqlite3_set_authorizer")))),
        (
            "backup",
            Box::new(|h| {
                let path = script_path(&h.fixtures.new_path("backup"));
                h.test(&format!(".backup {path}"), err("sqlite3_backup_init"))
            }),
        ),
        (
            "changes on",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE a (I INTEGER);
.changes on
INSERT INTO a VALUES (42);
DROP TABLE a;
",
                    err("sqlite3_changes"),
                )
            }),
        ),
        ("selftest", Box::new(|h| h.test(".selftest", err("sqlite3_table_column_metadata")))),
        ("limit", Box::new(|h| h.test(".limit length 42", err("sqlite3_limit")))),
        ("timeout", Box::new(|h| h.test(".timeout", err("sqlite3_busy_timeout")))),
        (
            "save",
            Box::new(|h| {
                let path = script_path(&h.fixtures.new_path("save"));
                h.test(&format!(".save {path}"), err("sqlite3_backup_init"))
            }),
        ),
        (
            "restore",
            Box::new(|h| {
                let path = script_path(&h.fixtures.new_path("restore"));
                h.test(&format!(".restore {path}"), err("sqlite3_backup_init"))
            }),
        ),
        ("stats", Box::new(|h| h.test(".stats", err("sqlite3_status64")))),
        (
            "scanstats",
            Box::new(|h| h.test("\n.scanstats on\nSELECT NULL;\n", err("scanstats"))),
        ),
        (
            "trace",
            Box::new(|h| {
                let path = script_path(&h.fixtures.new_path("trace"));
                h.test(&format!(".trace {path}\n; SELECT 42;"), err("sqlite3_trace_v2"))
            }),
        ),
        (
            "load missing extension",
            Box::new(|h| {
                let path = script_path(&h.fixtures.new_path("extension"));
                h.test(&format!(".load {path}"), err("Error"))
            }),
        ),
        // TODO: switch both schema cases to stdout checks once `.schema` stops emitting an unaliased subquery
        (
            "schema",
            Box::new(|h| h.test(".schema", err("subquery in FROM must have an alias"))),
        ),
        (
            "schema like",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE asdf (i INTEGER);
.schema as%
",
                    err("subquery in FROM must have an alias"),
                )
            }),
        ),
        // --------------------- Liveness -----------------------------------
        (
            "bail and binary",
            Box::new(|h| {
                h.test(
                    "
.bail on
.bail off
.binary on
SELECT 42;
.binary off
SELECT 42;
",
                    quiet(),
                )
            }),
        ),
        ("cd", Box::new(test_cd)),
        (
            "changes off",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE a (I INTEGER);
.changes off
INSERT INTO a VALUES (42);
DROP TABLE a;
",
                    quiet(),
                )
            }),
        ),
        ("exit", Box::new(|h| h.test(".exit", quiet()))),
        ("quit", Box::new(|h| h.test(".quit", quiet()))),
        ("lint", Box::new(|h| h.test(".lint fkey-indexes", quiet()))),
        ("sha3sum", Box::new(|h| h.test(".sha3sum", quiet()))),
        ("vfsinfo", Box::new(|h| h.test(".vfsinfo", quiet()))),
        ("vfsname", Box::new(|h| h.test(".vfsname", quiet()))),
        ("vfslist", Box::new(|h| h.test(".vfslist", quiet()))),
        ("stats on", Box::new(|h| h.test(".stats on", quiet()))),
        ("stats off", Box::new(|h| h.test(".stats off", quiet()))),
        (
            "log",
            Box::new(|h| {
                let path = script_path(&h.fixtures.new_path("log"));
                h.test(&format!("\n.log {path}\nSELECT 42;\n.log off\n"), quiet())
            }),
        ),
        // --------------------- Output settings ----------------------------
        ("echo", Box::new(|h| h.test("\n.echo on\nSELECT 42;\n", out("SELECT 42")))),
        ("print", Box::new(|h| h.test(".print asdf", out("asdf")))),
        (
            "headers",
            Box::new(|h| h.test("\n.headers on\nSELECT 42 as wilbur;\n", out("wilbur"))),
        ),
        (
            "nullvalue",
            Box::new(|h| h.test("\n.nullvalue wilbur\nSELECT NULL;\n", out("wilbur"))),
        ),
        ("help", Box::new(|h| h.test(".help", out("Show help text for PATTERN")))),
        ("show", Box::new(|h| h.test(".show", out("rowseparator")))),
        (
            "fullschema",
            Box::new(|h| {
                h.test(".fullschema", out("No STAT tables available").tolerate_exit())
            }),
        ),
        (
            "separator",
            Box::new(|h| h.test("\n.mode csv\n.separator XX\nSELECT 42,43;\n", out("42XX43"))),
        ),
        ("timer", Box::new(|h| h.test("\n.timer on\nSELECT NULL;\n", out("Run Time:")))),
        ("read script file", Box::new(test_read_script_file)),
        // --------------------- Catalog ------------------------------------
        (
            "tables",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE asda (i INTEGER);
CREATE TABLE bsdf (i INTEGER);
CREATE TABLE csda (i INTEGER);
.tables
",
                    out("asda  bsdf  csda"),
                )
            }),
        ),
        (
            "tables like",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE asda (i INTEGER);
CREATE TABLE bsdf (i INTEGER);
CREATE TABLE csda (i INTEGER);
.tables %da
",
                    out("asda  csda"),
                )
            }),
        ),
        ("indexes", Box::new(|h| h.test(".indexes", quiet()))),
        (
            "indexes like",
            Box::new(|h| {
                h.test(
                    "
CREATE TABLE a (i INTEGER);
CREATE INDEX a_idx ON a(i);
.indexes a%
",
                    out("a_idx"),
                )
            }),
        ),
        ("databases", Box::new(|h| h.test(".databases", out("main:")))),
        // --------------------- Output redirection -------------------------
        ("output file", Box::new(test_output_file)),
        ("once file", Box::new(test_once_file)),
        // --------------------- Databases ----------------------------------
        ("open switches databases", Box::new(test_open_switches_databases)),
        ("corrupt database file", Box::new(test_corrupt_database_file)),
        (
            "profiling without query",
            Box::new(|h| h.test("\nPRAGMA enable_profiling\n", quiet().tolerate_exit())),
        ),
        (
            "profiling with query",
            Box::new(|h| {
                h.test(
                    "\nPRAGMA enable_profiling;\nSELECT 42;\n",
                    out("42").with_stderr("Query Profiling Information"),
                )
            }),
        ),
        ("system", Box::new(|h| h.test(".system echo 42", out("42")))),
        ("shell", Box::new(|h| h.test(".shell echo 42", out("42")))),
        ("export import round trip", Box::new(test_export_import_round_trip)),
        ("import invalid utf8 csv", Box::new(test_import_invalid_utf8_csv)),
    ];
    cases.extend(mode_cases());
    cases.extend(dump_cases());
    cases
}

fn mode_cases() -> Vec<TestCase> {
    const ROW: &str = "SELECT NULL, 42, 'fourty-two', 42.0;";
    let modes: [(&'static str, &'static str, &'static str, &'static str); 8] = [
        ("mode ascii", "ascii", ROW, "fourty-two"),
        ("mode csv", "csv", ROW, ",fourty-two,"),
        ("mode column", "column\n.width 10 10 10 10", ROW, "  fourty-two  "),
        ("mode html", "html", ROW, "<TD>fourty-two</TD>"),
        ("mode line", "line", "SELECT NULL, 42, 'fourty-two' x, 42.0;", "x = fourty-two"),
        ("mode list", "list", ROW, "|fourty-two|"),
        ("mode tabs", "tabs", ROW, "fourty-two"),
        (
            "mode latex",
            "latex\nCREATE TABLE a (I INTEGER);\n.changes off\nINSERT INTO a VALUES (42);",
            "SELECT * FROM a;",
            "\\begin{tabular}",
        ),
    ];
    modes
        .into_iter()
        .map(|(name, mode, query, needle)| -> TestCase {
            let script = format!("\n.mode {mode}\n{query}\n");
            (name, Box::new(move |h: &Harness| h.test(&script, out(needle))))
        })
        .collect()
}

fn dump_cases() -> Vec<TestCase> {
    const SEED: &str = "
CREATE TABLE a (I INTEGER);
.changes off
INSERT INTO a VALUES (42);
";
    let dumps: [(&'static str, &'static str, &'static str); 4] = [
        ("dump create", ".dump", "CREATE TABLE a(i INTEGER)"),
        ("dump commit", ".dump", "COMMIT"),
        ("dump table", ".dump a", "CREATE TABLE a(i INTEGER);"),
        ("dump like", ".dump a%", "CREATE TABLE a(i INTEGER);"),
    ];
    let mut cases: Vec<TestCase> = dumps
        .into_iter()
        .map(|(name, command, needle)| -> TestCase {
            let script = format!("{SEED}{command}\n");
            (name, Box::new(move |h: &Harness| h.test(&script, out(needle))))
        })
        .collect();
    cases.push((
        "dump more types",
        Box::new(|h: &Harness| {
            h.test(
                "
CREATE TABLE a (d DATE, k FLOAT, t TIMESTAMP);
CREATE TABLE b (c INTEGER);
.changes off
INSERT INTO a VALUES (DATE '1992-01-01', 0.3, NOW());
INSERT INTO b SELECT * FROM range(0,10);
.dump
",
                out("CREATE TABLE a(d DATE, k FLOAT, t TIMESTAMP);"),
            )
        }),
    ));
    cases
}

// --------------------- Individual tests -----------------------------------
fn test_import_data_file(h: &Harness) -> Result<()> {
    let data = h.fixtures.write("import", b"42\n84\n")?;
    let script = format!(
        "\nCREATE TABLE a (i INTEGER);\n.import \"{}\" a\nSELECT SUM(i) FROM a;\n",
        script_path(&data)
    );
    h.test(&script, out("126"))
}

fn test_cd(h: &Harness) -> Result<()> {
    let cwd = env::current_dir()?;
    let script = format!(
        "\n.cd {}\n.cd {}\n",
        script_path(&env::temp_dir()),
        script_path(&cwd)
    );
    h.test(&script, quiet())
}

fn test_read_script_file(h: &Harness) -> Result<()> {
    let script_file = h.fixtures.write("script", b"select 42\n")?;
    h.test(&format!(".read {}", script_path(&script_file)), out("42"))
}

fn test_output_file(h: &Harness) -> Result<()> {
    let target = h.fixtures.new_path("output");
    let script = format!("\n.mode csv\n.output {}\nSELECT 42;\n", script_path(&target));
    let run = h.test_run(&script, &[] as &[&str], quiet())?;
    run.expect_file_contains(&target, b"42")
}

fn test_once_file(h: &Harness) -> Result<()> {
    let target = h.fixtures.new_path("once");
    let script = format!("\n.once {}\nSELECT 43;\n", script_path(&target));
    let run = h.test_run(&script, &[] as &[&str], quiet())?;
    run.expect_file_contains(&target, b"43")
}

fn test_open_switches_databases(h: &Harness) -> Result<()> {
    let db1 = script_path(&h.fixtures.new_path("db1"));
    let db2 = script_path(&h.fixtures.new_path("db2"));
    let script = format!(
        "
.open {db1}
CREATE TABLE t1 (i INTEGER);
INSERT INTO t1 VALUES (42);
.open {db2}
CREATE TABLE t2 (i INTEGER);
INSERT INTO t2 VALUES (43);
.open {db1}
SELECT * FROM t1;
"
    );
    h.test(&script, out("42"))
}

fn test_corrupt_database_file(h: &Harness) -> Result<()> {
    let nonsense = h.fixtures.scratch("nonsense.db", b"blablabla")?;
    h.test_with_args("", &[nonsense.path()], err("unable to open"))
}

fn test_export_import_round_trip(h: &Harness) -> Result<()> {
    let target = h.fixtures.new_path("export");
    let dir = script_path(&target);
    let script = format!(
        "
.mode csv
.changes off
CREATE TABLE integers(i INTEGER);
CREATE TABLE integers2(i INTEGER);
INSERT INTO integers SELECT * FROM range(100);
INSERT INTO integers2 VALUES (1), (3), (99);
EXPORT DATABASE '{dir}';
DROP TABLE integers;
DROP TABLE integers2;
IMPORT DATABASE '{dir}';
SELECT SUM(i)*MAX(i) FROM integers JOIN integers2 USING (i);
"
    );
    let outcome = h
        .test_run(&script, &[] as &[&str], out("10197"))
        .and_then(|run| run.expect_tree_nonempty(&target).map(drop));
    after_cleanup(outcome, remove_tree(&target))
}

/// A failed case keeps its own error; cleanup trouble only surfaces when the case passed.
fn after_cleanup(outcome: Result<()>, cleanup: Result<()>) -> Result<()> {
    outcome.and(cleanup)
}

fn test_import_invalid_utf8_csv(h: &Harness) -> Result<()> {
    let csv = h.fixtures.scratch("nonsense.csv", b"\xFF\n")?;
    let script = format!(
        "
.nullvalue NULL
CREATE TABLE test(i INTEGER);
.import {} test
SELECT * FROM test;
",
        script_path(csv.path())
    );
    h.test(&script, out("NULL"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expect::{CaseFailure, FailureKind};
    use anyhow::anyhow;
    use std::collections::HashSet;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn fake_harness(dir: &TempDir, body: &str) -> Harness {
        let path = dir.path().join("fake-shell");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        Harness::new(&path, Path::new("/dev/null"), None).unwrap()
    }

    fn leftover_exports(h: &Harness) -> usize {
        fs::read_dir(h.fixtures.root())
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().file_name().to_string_lossy().starts_with("export-"))
            .count()
    }

    #[test]
    fn cleanup_error_never_hides_the_case_failure() {
        let err = after_cleanup(Err(anyhow!("case failed")), Err(anyhow!("cleanup failed"))).unwrap_err();
        assert_eq!(err.to_string(), "case failed");

        let err = after_cleanup(Ok(()), Err(anyhow!("cleanup failed"))).unwrap_err();
        assert_eq!(err.to_string(), "cleanup failed");
        after_cleanup(Ok(()), Ok(())).unwrap();
    }

    #[test]
    fn round_trip_removes_its_export_directory() {
        let dir = TempDir::new().unwrap();
        let h = fake_harness(
            &dir,
            r#"target=$(sed -n "s/^EXPORT DATABASE '\(.*\)';\$/\1/p")
mkdir -p "$target" && echo x > "$target/schema.sql"
echo 10197"#,
        );
        test_export_import_round_trip(&h).unwrap();
        assert_eq!(leftover_exports(&h), 0);
    }

    #[test]
    fn round_trip_failure_keeps_its_transcript() {
        let dir = TempDir::new().unwrap();
        let h = fake_harness(&dir, "cat > /dev/null; echo 42");
        let err = test_export_import_round_trip(&h).unwrap_err();
        let failure = err.downcast_ref::<CaseFailure>().expect("a case failure");
        assert_eq!(failure.kind, FailureKind::Stdout);
        assert!(failure.input.contains("EXPORT DATABASE"));
        assert_eq!(leftover_exports(&h), 0);
    }

    #[test]
    fn case_names_are_unique() {
        let cases = all();
        let names: HashSet<_> = cases.iter().map(|(name, _)| *name).collect();
        assert_eq!(names.len(), cases.len());
    }

    #[test]
    fn core_scenarios_are_registered() {
        let names: Vec<_> = all().into_iter().map(|(name, _)| name).collect();
        for expected in [
            "basic select",
            "conversion error",
            "corrupt database file",
            "output file",
            "export import round trip",
            "mode latex",
            "dump more types",
        ] {
            assert!(names.contains(&expected), "missing case {expected}");
        }
    }
}
