//! Integration tests for the relab CLI
//!
//! These run the actual binary inside a scratch git repository and verify
//! the store layout and command output.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .status()
        .expect("git is available");
    assert!(status.success(), "git {args:?} failed");
}

/// Fresh git repository with one commit
fn repo() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    git(&root, &["init", "-q"]);
    git(&root, &["config", "user.email", "relab@example.com"]);
    git(&root, &["config", "user.name", "relab"]);
    git(&root, &["config", "commit.gpgsign", "false"]);
    fs::write(root.join("README"), "demo repo\n").unwrap();
    git(&root, &["add", "."]);
    git(&root, &["commit", "-q", "-m", "init"]);
    (tmp, root)
}

fn relab(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("relab").unwrap();
    cmd.current_dir(dir);
    cmd
}

/// Hash of the single most recent experiment matching `descr`
fn latest_hash(dir: &Path, descr: &str) -> String {
    let out = relab(dir)
        .args(["hash", descr, "--latest"])
        .output()
        .unwrap();
    assert!(out.status.success());
    String::from_utf8(out.stdout).unwrap().trim().to_string()
}

#[test]
fn help_describes_the_tool() {
    relab(Path::new("."))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("experiments"))
        .stdout(predicate::str::contains("runfile"));
}

#[test]
fn run_single_experiment() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["run", "hello", "echo hi > {}/out", "--poll-interval", "0.05"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed successfully"));

    let hsh = latest_hash(&root, "hello");
    let results = root.join("results").join(&hsh);
    assert_eq!(fs::read_to_string(results.join("out")).unwrap(), "hi\n");
    let log = fs::read_to_string(results.join("log")).unwrap();
    assert_eq!(log.lines().last(), Some("0"));
    let descr = fs::read_to_string(results.join("descr")).unwrap();
    assert!(descr.contains("SUCCESS"));
    assert!(!root.join("exp").join(&hsh).exists());
}

#[test]
fn failing_run_exits_nonzero() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["run", "boom", "false", "--poll-interval", "0.05"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("task failed"));
}

#[test]
fn runfile_executes_a_chain_and_caches_it() {
    let (_tmp, root) = repo();
    fs::write(
        root.join("chain.task"),
        "echo 42 > {}/out\n\t\"gen\"\ncat {gen}/out > {}/out\n\t\"sum\"\n\t{\"gen\"}\n",
    )
    .unwrap();

    relab(&root)
        .args(["runfile", "chain.task", "--poll-interval", "0.05"])
        .assert()
        .success()
        .stdout(predicate::str::contains("task archived with id 1"))
        .stdout(predicate::str::contains("completed successfully"));

    let sum = latest_hash(&root, "sum");
    let results = root.join("results").join(&sum);
    assert_eq!(fs::read_to_string(results.join("out")).unwrap(), "42\n");

    // the archived task is replayable, and a cached replay changes nothing
    let descr_before = fs::read(results.join("descr")).unwrap();
    fs::remove_dir_all(root.join("exp")).ok();
    relab(&root)
        .args(["runtask", "1", "--poll-interval", "0.05"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed successfully"));
    let descr_after = fs::read(results.join("descr")).unwrap();
    assert_eq!(descr_before, descr_after);
}

#[test]
fn failure_in_a_chain_leaves_child_unrun() {
    let (_tmp, root) = repo();
    fs::write(
        root.join("broken.task"),
        "false\n\t\"boom\"\necho ok > {}/out\n\t\"after\"\n\t{\"boom\"}\n",
    )
    .unwrap();

    relab(&root)
        .args(["runfile", "broken.task", "--poll-interval", "0.05"])
        .assert()
        .failure();

    // only the failed parent ever got a results directory
    let dirs: Vec<_> = fs::read_dir(root.join("results"))
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(dirs.len(), 1);
    let descr = fs::read_to_string(dirs[0].path().join("descr")).unwrap();
    assert!(descr.contains("FAIL"));
}

#[test]
fn list_parameter_fans_out_and_all_collects() {
    let (_tmp, root) = repo();
    fs::write(
        root.join("fan.task"),
        "echo {:p} > {}/out\n\t\"x\"\n\tp = [1, 2, 3]\n@output_list()\n\t\"collect\"\n\t{\"x\" [all]}\n",
    )
    .unwrap();

    relab(&root)
        .args(["runfile", "fan.task", "--poll-interval", "0.05"])
        .assert()
        .success();

    // three x nodes with distinct hashes, plus the collector
    let dirs: Vec<_> = fs::read_dir(root.join("results"))
        .unwrap()
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(dirs.len(), 4);

    let collect = latest_hash(&root, "collect");
    let out = fs::read_to_string(root.join("results").join(&collect).join("out")).unwrap();
    assert_eq!(out.lines().count(), 3);
}

#[test]
fn rerun_flag_discards_and_repeats() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["run", "hello", "echo hi > {}/out", "--poll-interval", "0.05"])
        .assert()
        .success();
    let hsh = latest_hash(&root, "hello");
    let descr_path = root.join("results").join(&hsh).join("descr");
    let before = fs::read_to_string(&descr_path).unwrap();

    relab(&root)
        .args([
            "run",
            "hello",
            "echo hi > {}/out",
            "--rerun",
            "--poll-interval",
            "0.05",
        ])
        .assert()
        .success();

    let after = fs::read_to_string(&descr_path).unwrap();
    assert!(after.contains("SUCCESS"));
    // same identity, fresh submission date
    assert_eq!(latest_hash(&root, "hello"), hsh);
    assert_ne!(before, after);
}

#[test]
fn cached_rerun_without_flag_is_a_no_op() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["run", "hello", "echo hi > {}/out", "--poll-interval", "0.05"])
        .assert()
        .success();
    let hsh = latest_hash(&root, "hello");
    let descr_path = root.join("results").join(&hsh).join("descr");
    let before = fs::read(&descr_path).unwrap();

    relab(&root)
        .args(["run", "hello", "echo hi > {}/out", "--poll-interval", "0.05"])
        .assert()
        .success();
    assert_eq!(fs::read(&descr_path).unwrap(), before);
}

#[test]
fn params_flow_into_the_command() {
    let (_tmp, root) = repo();
    relab(&root)
        .args([
            "run",
            "param-demo",
            "echo {:n} > {}/out",
            "--params",
            "n:7",
            "--poll-interval",
            "0.05",
        ])
        .assert()
        .success();

    let hsh = latest_hash(&root, "param-demo");
    assert_eq!(
        fs::read_to_string(root.join("results").join(&hsh).join("out")).unwrap(),
        "7\n"
    );
}

#[test]
fn list_show_and_purge_round_trip() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["run", "hello", "echo hi > {}/out", "--poll-interval", "0.05"])
        .assert()
        .success();

    relab(&root)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("SUCCESS"));

    relab(&root)
        .args(["show", "hello"])
        .assert()
        .success()
        .stdout(predicate::str::contains("description: hello"))
        .stdout(predicate::str::contains("state:       SUCCESS"));

    relab(&root)
        .args(["purge", "hello", "--dry-run"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would purge"));
    assert_eq!(fs::read_dir(root.join("results")).unwrap().count(), 1);

    relab(&root)
        .args(["purge", "hello", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("purged"));
    assert_eq!(fs::read_dir(root.join("results")).unwrap().count(), 0);

    relab(&root)
        .args(["show", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no experiment matches"));
}

#[test]
fn print_and_cmd_expand_references() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["run", "hello", "echo hi > {}/out", "--poll-interval", "0.05"])
        .assert()
        .success();
    let hsh = latest_hash(&root, "hello");

    relab(&root)
        .args(["print", "cat", "{hello}/out"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&hsh));

    relab(&root)
        .args(["cmd", "cat", "{hello}/out"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hi"));
}

#[test]
fn unmatched_reference_reports_a_fix() {
    let (_tmp, root) = repo();
    relab(&root)
        .args(["print", "cat", "{ghost}/out"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not match"))
        .stderr(predicate::str::contains("Fix:"));
}
