//! Process-level checks of the administrative tool: argument validation,
//! exit codes, and the default dump.

use assert_cmd::Command;

#[test]
fn test_default_invocation_dumps_fresh_object() {
    Command::cargo_bin("gracectl")
        .unwrap()
        .args(["--log.format", "text"])
        .assert()
        .success()
        .stdout("cur=1 rec=0\n\n");
}

#[test]
fn test_non_numeric_nodeid_exits_one() {
    Command::cargo_bin("gracectl")
        .unwrap()
        .args(["--log.format", "text", "nodeA"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_out_of_range_nodeid_exits_one() {
    Command::cargo_bin("gracectl")
        .unwrap()
        .args(["--log.format", "text", "4294967295"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_start_renders_cohort() {
    // The in-process store starts fresh per invocation, so the start and
    // its dump land in one run.
    Command::cargo_bin("gracectl")
        .unwrap()
        .args(["--log.format", "text", "1", "2"])
        .assert()
        .success()
        .stdout("cur=2 rec=1\n1 2\n");
}
