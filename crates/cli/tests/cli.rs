//! Black-box tests of the two binaries: flag parsing, exit codes and a
//! short local end-to-end run.

use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;

fn server() -> Command {
    let mut cmd = Command::cargo_bin("optforge-server").unwrap();
    cmd.timeout(Duration::from_secs(60));
    cmd
}

fn worker() -> Command {
    let mut cmd = Command::cargo_bin("optforge-worker").unwrap();
    cmd.timeout(Duration::from_secs(60));
    cmd
}

#[test]
fn binaries_print_help() {
    server()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--port"));
    worker()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--server"));
}

#[test]
fn bad_configuration_exits_with_code_1() {
    worker()
        .args(["--backoff-base-ms", "100", "--backoff-cap-ms", "10"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("backoff"));

    server()
        .args(["--config", "/definitely/not/a/real/config.json"])
        .assert()
        .code(1);
}

#[test]
fn unknown_wire_formats_are_rejected_by_the_parser() {
    server().args(["--format", "yaml"]).assert().failure();
    worker().args(["--format", "yaml"]).assert().failure();
}

#[test]
fn exhausted_reconnects_exit_with_code_2() {
    // Nothing listens on port 1; the connect fails immediately.
    worker()
        .args([
            "--server",
            "127.0.0.1:1",
            "--reconnect-max",
            "2",
            "--backoff-base-ms",
            "10",
            "--backoff-cap-ms",
            "20",
        ])
        .assert()
        .code(2);
}

#[test]
fn the_server_runs_a_local_demo_sweep() {
    server()
        .args([
            "--port",
            "0",
            "--local-workers",
            "2",
            "--demo-batches",
            "2",
            "--demo-batch-size",
            "4",
            "--demo-eval-ms",
            "0",
            "--drain-grace-ms",
            "200",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("batch complete"));
}
