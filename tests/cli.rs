use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("comment-thread").unwrap();
    // keep the user's config and environment out of the run
    let home = tempdir().unwrap().into_path();
    cmd.env("HOME", &home)
        .env("XDG_CONFIG_HOME", &home)
        .env_remove("COMMENT_THREAD_API__BASE_URL")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn prints_version() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--demo").and(predicate::str::contains("--version")));
}

#[test]
fn demo_prints_thread() {
    cmd()
        .args(["--demo", "post-9"])
        .assert()
        .success()
        .stdout(
            predicate::str::starts_with("post-9: 6 comments")
                .and(predicate::str::contains("- Ada (0 likes, 2 replies): First!"))
                .and(predicate::str::contains("  - Grace -> Linus")),
        );
}

#[test]
fn rejects_unknown_flag() {
    cmd()
        .arg("--bogus")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown flag --bogus"));
}

#[test]
fn unreachable_api_fails() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("config.yaml");
    std::fs::write(
        &config,
        "api:\n  base_url: http://127.0.0.1:9/\n  timeout: 1s\nthread:\n  background: false\n",
    )
    .unwrap();
    cmd()
        .arg("--config")
        .arg(&config)
        .arg("post-1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load comments"));
}
