// Drive the compiled `dsv` binary the way a user would.
use assert_cmd::prelude::*;
use assert_fs::prelude::*;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::process::Command;

mod util;

use util::{dump_log, enumeration_log, write};

fn dsv() -> Command {
    Command::cargo_bin("dsv").expect("binary built")
}

fn read_json(path: &std::path::Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read json")).expect("valid json")
}

#[test]
fn plan_writes_batches_and_diagnostics() {
    let tmp = assert_fs::TempDir::new().unwrap();
    let forward = write(
        &tmp,
        "forward.log",
        &enumeration_log(&[
            ("MapA_P", &[("Foo", "X"), ("Foo", "Y"), ("Foo", "Z")]),
            ("MapB_P", &[("Bar", "W")]),
        ]),
    );
    let reverse = write(
        &tmp,
        "reverse.log",
        &enumeration_log(&[
            ("MapB_P", &[("Bar", "W")]),
            ("MapA_P", &[("Foo", "X"), ("Foo", "Y")]),
        ]),
    );

    dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "plan", "--forward"])
        .arg(&forward)
        .arg("--reverse")
        .arg(&reverse)
        .args(["--out", "plan", "--max-batch-size", "1", "--diagnostics", "plan-diag.json"])
        .assert()
        .success();

    tmp.child("plan/MapA_P.000").assert("obj dump X\n");
    tmp.child("plan/MapA_P.001").assert("obj dump Y\n");
    tmp.child("plan/MapA_P.002").assert(predicate::path::missing());
    tmp.child("plan/plan.json").assert(predicate::path::exists());
    tmp.child("plan/INCOMPLETE").assert(predicate::path::missing());

    let diag = read_json(&tmp.path().join("plan-diag.json"));
    assert_eq!(diag["phase"], "plan");
    assert_eq!(diag["complete"], true);
    assert_eq!(diag["counts"]["unconfirmed"], 1);
}

#[test]
fn categorize_keeps_first_dump_and_reports_duplicate() {
    let tmp = assert_fs::TempDir::new().unwrap();
    let log = write(
        &tmp,
        "dumps.log",
        &dump_log(&[(
            "MapA_P",
            &[
                ("Foo", "Foo.Bar", &["  Value=first"]),
                ("Foo", "Foo.Bar", &["  Value=second"]),
            ],
            &[],
        )]),
    );

    dsv()
        .current_dir(tmp.path())
        .arg("categorize")
        .arg(&log)
        .args(["--out", "cat", "--quiet", "--diagnostics", "diag.json"])
        .assert()
        .success();

    let foo = fs::read_to_string(tmp.path().join("cat/Foo.dump")).unwrap();
    assert_eq!(foo, "*** Property dump for object 'Foo Foo.Bar' ***\n  Value=first\n\n");
    let diag = read_json(&tmp.path().join("diag.json"));
    assert_eq!(diag["counts"]["duplicates_discarded"], 1);
    assert_eq!(diag["complete"], true);
}

#[test]
fn compare_reports_new_and_missing_as_json() {
    let tmp = assert_fs::TempDir::new().unwrap();
    tmp.child("cur/Foo.dump")
        .write_str(
            "*** Property dump for object 'Foo A' ***\n  V=1\n\n\
             *** Property dump for object 'Foo B' ***\n  V=2\n\n\
             *** Property dump for object 'Foo C' ***\n  V=3\n\n",
        )
        .unwrap();
    tmp.child("old/Foo.dump")
        .write_str(
            "*** Property dump for object 'Foo A' ***\n  V=1\n\n\
             *** Property dump for object 'Foo C' ***\n  V=3\n\n\
             *** Property dump for object 'Foo D' ***\n  V=4\n\n",
        )
        .unwrap();

    let output = dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "compare", "cur", "old"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["counts"]["new"], 1);
    assert_eq!(report["counts"]["missing"], 1);
    assert_eq!(report["counts"]["unchanged"], 2);
    let records = report["results"].as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().any(|r| r["object_name"] == "B" && r["status"] == "new"));
    assert!(records.iter().any(|r| r["object_name"] == "D" && r["status"] == "missing"));
}

#[test]
fn compare_refuses_incomplete_corpus() {
    let tmp = assert_fs::TempDir::new().unwrap();
    tmp.child("cur/Foo.dump").write_str("").unwrap();
    tmp.child("cur/INCOMPLETE").write_str("phase=categorize\n").unwrap();
    tmp.child("old/Foo.dump").write_str("").unwrap();

    dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "compare", "cur", "old"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("incomplete"));
}

#[test]
fn archive_then_list_sections() {
    let tmp = assert_fs::TempDir::new().unwrap();
    tmp.child("cat/Foo.dump")
        .write_str("*** Property dump for object 'Foo GD.Bar_1' ***\n  V=1\n\n")
        .unwrap();

    dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "archive", "cat", "--out", "arc", "--layout", "per-object"])
        .args(["--generated-at", "2023-01-01T00:00:00Z"])
        .assert()
        .success();
    tmp.child("arc/index.sqlite").assert(predicate::path::exists());
    tmp.child("arc/blobs/Foo.1.gz").assert(predicate::path::exists());
    tmp.child("arc/INCOMPLETE").assert(predicate::path::missing());

    let log = write(
        &tmp,
        "enum.log",
        &enumeration_log(&[("MapA_P", &[("Foo", "X")]), ("CharVehicle", &[])]),
    );
    let output = dsv().args(["sections", "--json"]).arg(&log).output().unwrap();
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["sections"][0]["section"], "MapA_P");
    assert_eq!(summary["sections"][0]["objects"], 1);
    assert_eq!(summary["sections"][1]["kind"], "CharVehicle");
    assert_eq!(summary["clean_end"], true);
}

#[test]
fn dry_run_writes_nothing() {
    let tmp = assert_fs::TempDir::new().unwrap();
    let log = write(
        &tmp,
        "dumps.log",
        &dump_log(&[("MapA_P", &[("Foo", "Foo.Bar", &["  V=1"])], &[])]),
    );

    dsv()
        .current_dir(tmp.path())
        .arg("--dry-run")
        .arg("categorize")
        .arg(&log)
        .args(["--out", "cat"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DRY RUN"));
    tmp.child("cat").assert(predicate::path::missing());
}

#[test]
fn section_extract_is_byte_exact() {
    let tmp = assert_fs::TempDir::new().unwrap();
    let log = write(
        &tmp,
        "full.log",
        &dump_log(&[
            ("MapA_P", &[("Foo", "A.A", &["  V=1"])], &[]),
            ("charvehicle", &[("Foo", "C.C", &["  V=2"])], &[]),
        ]),
    );

    dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "section", "extract"])
        .arg(&log)
        .args(["--section", "charvehicle", "--out", "cv.log"])
        .assert()
        .success();

    let extracted = fs::read(tmp.path().join("cv.log")).unwrap();
    assert!(extracted.starts_with(b"[0001.00] Log: No objects found using command 'obj dump switch.to.charvehicle'\r\n"));
    assert!(extracted.ends_with(b"Log: Log file closed, 01/01/23 01:10:00\r\n"));
    assert!(!extracted.windows(6).any(|w| w == b"MapA_P"));
}

#[test]
fn init_refuses_to_overwrite() {
    let tmp = assert_fs::TempDir::new().unwrap();

    dsv().current_dir(tmp.path()).args(["--quiet", "init"]).assert().success();
    tmp.child("dumpsieve.toml")
        .assert(predicate::str::contains("max_batch_size = 800"));

    dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "init"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
}

#[test]
fn completions_print_to_stdout() {
    dsv()
        .args(["completions", "bash", "--stdout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("dsv"));
}

#[test]
fn unfiltered_plan_uses_forward_only() {
    let tmp = assert_fs::TempDir::new().unwrap();
    let forward = write(
        &tmp,
        "forward.log",
        &enumeration_log(&[("MapA_P", &[("Foo", "X"), ("Foo", "Y"), ("Foo", "Z")])]),
    );

    dsv()
        .current_dir(tmp.path())
        .args(["--quiet", "plan", "--unfiltered", "--no-defaults", "--forward"])
        .arg(&forward)
        .assert()
        .success();

    tmp.child("plan/MapA_P.000")
        .assert("obj dump X\nobj dump Y\nobj dump Z\n");
}
