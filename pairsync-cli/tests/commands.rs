use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

fn pairsync_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("pairsync"));
    cmd.env("HOME", home).env("RUST_LOG", "warn");
    cmd
}

fn write_config(home: &Path, body: &str) -> PathBuf {
    let path = home.join(".pairsync").join("config.yaml");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(&path, body).expect("write config");
    path
}

fn docs_job(a: &Path, b: &Path) -> String {
    format!(
        "jobs:\n  docs:\n    directory: {}\n    peer_directory: {}\n    sync_interval_seconds: 5\n    filters:\n      exclude: [\"*.tmp\"]\n",
        a.display(),
        b.display()
    )
}

#[test]
fn validate_accepts_a_good_config() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write_config(home.path(), &docs_job(a.path(), b.path()));

    pairsync_cmd(home.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(contains("docs"))
        .stdout(contains("ok"))
        .stdout(contains("every 5s"));
}

#[test]
fn validate_names_every_bad_job_and_fails() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let mut body = docs_job(a.path(), b.path());
    body.push_str(&format!(
        "  ghost:\n    directory: /no/such/place\n    peer_directory: {}\n    sync_interval_seconds: 5\n  hasty:\n    directory: {}\n    peer_directory: {}\n    sync_interval_seconds: 0.01\n",
        b.path().display(),
        a.path().display(),
        b.path().display()
    ));
    write_config(home.path(), &body);

    pairsync_cmd(home.path())
        .arg("validate")
        .assert()
        .failure()
        .stdout(contains("ghost"))
        .stdout(contains("hasty"))
        .stdout(contains("invalid"))
        .stderr(contains("2 of 3 job(s) invalid"));
}

#[test]
fn missing_config_is_reported_with_its_path() {
    let home = TempDir::new().expect("home");
    pairsync_cmd(home.path())
        .arg("validate")
        .assert()
        .failure()
        .stderr(contains("config.yaml"));
}

#[test]
fn explicit_config_path_wins_over_the_default() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    let elsewhere = TempDir::new().expect("elsewhere");
    let path = elsewhere.path().join("pairs.yaml");
    fs::write(&path, docs_job(a.path(), b.path())).expect("write");

    pairsync_cmd(home.path())
        .arg("validate")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(contains("docs"));
}

#[test]
fn one_shot_sync_copies_and_then_settles() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write_config(home.path(), &docs_job(a.path(), b.path()));
    fs::create_dir(a.path().join("notes")).expect("mkdir");
    fs::write(a.path().join("notes/today.md"), "hello").expect("write");
    fs::write(a.path().join("scratch.tmp"), "junk").expect("write tmp");

    pairsync_cmd(home.path())
        .args(["sync", "docs"])
        .assert()
        .success()
        .stdout(contains("'docs' synced"));

    assert_eq!(
        fs::read_to_string(b.path().join("notes/today.md")).expect("copied"),
        "hello"
    );
    assert!(!b.path().join("scratch.tmp").exists());
    assert!(home
        .path()
        .join(".pairsync/state/docs.local/changes.jsonl")
        .exists());

    pairsync_cmd(home.path())
        .args(["sync", "docs"])
        .assert()
        .success()
        .stdout(contains("nothing to do"));
}

#[test]
fn dry_run_prints_the_plan_and_writes_nothing() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write_config(home.path(), &docs_job(a.path(), b.path()));
    fs::write(a.path().join("a.txt"), "a").expect("write");

    pairsync_cmd(home.path())
        .args(["sync", "--dry-run"])
        .assert()
        .success()
        .stdout(contains("[dry-run]"))
        .stdout(contains("copy local:a.txt -> remote:a.txt"));

    assert!(!b.path().join("a.txt").exists());
    assert!(!home
        .path()
        .join(".pairsync/state/docs.local/changes.jsonl")
        .exists());
}

#[test]
fn unknown_job_is_an_error() {
    let home = TempDir::new().expect("home");
    let a = TempDir::new().expect("a");
    let b = TempDir::new().expect("b");
    write_config(home.path(), &docs_job(a.path(), b.path()));

    pairsync_cmd(home.path())
        .args(["sync", "nope"])
        .assert()
        .failure()
        .stderr(contains("no job named 'nope'"));
}

#[test]
fn status_and_stop_without_a_daemon() {
    let home = TempDir::new().expect("home");

    pairsync_cmd(home.path())
        .arg("status")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));

    pairsync_cmd(home.path())
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"running\": false"));

    pairsync_cmd(home.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}
