use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn recsync_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_recsync"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("guides")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nNotes about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("guides").join("beta.md"),
        "# Beta Document\n\nA guide to deployment.",
    )
    .unwrap();
    fs::write(files_dir.join("gamma.txt"), "Plain text without a heading.").unwrap();
    fs::write(files_dir.join("ignored.bin"), [0u8, 1, 2]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/recsync.sqlite"

[sync]
batch_size = 2

[sources.filesystem.notes]
root = "{root}/files"
include_globs = ["**/*.md", "**/*.txt"]
tags = ["notes"]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("recsync.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_recsync(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = recsync_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run recsync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn init_and_sync(config_path: &Path) -> String {
    let (_, stderr, success) = run_recsync(config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    let (stdout, stderr, success) = run_recsync(config_path, &["sync", "filesystem:notes"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

fn id_of(list_output: &str, title: &str) -> String {
    list_output
        .lines()
        .find(|line| line.contains(title))
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or_else(|| panic!("no row for '{}' in:\n{}", title, list_output))
        .to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success1) = run_recsync(&config_path, &["init"]);
    assert!(success1, "First init failed");
    assert!(stdout.contains("initialized"));

    let (_, _, success2) = run_recsync(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_sync_filesystem() {
    let (_tmp, config_path) = setup_test_env();

    let stdout = init_and_sync(&config_path);
    assert!(stdout.contains("sync filesystem:notes (full)"));
    assert!(stdout.contains("created: 3"));
    assert!(stdout.contains("failed: 0"));
    assert!(stdout.contains("batches committed: 2"));
    assert!(stdout.trim_end().ends_with("ok"));
}

#[test]
fn test_resync_creates_nothing() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, success) = run_recsync(&config_path, &["sync", "filesystem:notes"]);
    assert!(success);
    assert!(!stdout.contains("(full)"));
    assert!(stdout.contains("created: 0"));
    assert!(stdout.contains("updated: 0"));

    let (stdout, _, success) = run_recsync(&config_path, &["sync", "filesystem", "--full"]);
    assert!(success);
    assert!(stdout.contains("created: 0"));
    assert!(stdout.contains("updated: 0"));
    assert!(stdout.contains("skipped: 3"));

    let (stdout, _, _) = run_recsync(&config_path, &["list"]);
    assert!(stdout.contains("3 record(s)"));
}

#[test]
fn test_sync_incremental_picks_up_changes() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let path = tmp.path().join("files").join("alpha.md");
    fs::write(&path, "# Alpha Revised\n\nNew body.").unwrap();
    let later = SystemTime::now() + Duration::from_secs(3600);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(later)
        .unwrap();

    let (stdout, stderr, success) = run_recsync(&config_path, &["sync", "filesystem:notes"]);
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("created: 0"));
    assert!(stdout.contains("updated: 1"));

    let (stdout, _, _) = run_recsync(&config_path, &["list"]);
    assert!(stdout.contains("Alpha Revised"));
    assert!(!stdout.contains("Alpha Document"));
}

#[test]
fn test_full_sync_detects_deletions() {
    let (tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    fs::remove_file(tmp.path().join("files").join("gamma.txt")).unwrap();

    let (stdout, _, success) = run_recsync(&config_path, &["sync", "filesystem:notes"]);
    assert!(success);
    assert!(stdout.contains("deleted: 0"));

    let (stdout, stderr, success) = run_recsync(
        &config_path,
        &["sync", "filesystem:notes", "--full", "--detect-deletions"],
    );
    assert!(success, "sync failed: {}", stderr);
    assert!(stdout.contains("deleted: 1"));

    let (stdout, _, _) = run_recsync(&config_path, &["list"]);
    assert!(stdout.contains("2 record(s)"));
    let (stdout, _, _) = run_recsync(&config_path, &["list", "--include-deleted"]);
    assert!(stdout.contains("3 record(s)"));
    assert!(stdout.contains("deleted"));
}

#[test]
fn test_sync_json_output() {
    let (_tmp, config_path) = setup_test_env();
    run_recsync(&config_path, &["init"]);

    let (stdout, stderr, success) = run_recsync(&config_path, &["sync", "all", "--json"]);
    assert!(success, "sync failed: {}", stderr);
    let results: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let first = &results[0];
    assert_eq!(first["source"], "filesystem:notes");
    assert_eq!(first["success"], true);
    assert_eq!(first["created"], 3);
    assert_eq!(first["state"], "idle");
}

#[test]
fn test_get_record() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (list, _, _) = run_recsync(&config_path, &["list", "--tag", "notes"]);
    let id = id_of(&list, "Beta Document");

    let (stdout, stderr, success) = run_recsync(&config_path, &["get", &id]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains("--- Record ---"));
    assert!(stdout.contains("title:       Beta Document"));
    assert!(stdout.contains("source:      filesystem:notes"));
    assert!(stdout.contains("external_id: guides/beta.md"));
    assert!(stdout.contains("source_time: "));
    assert!(stdout.contains("A guide to deployment."));
}

#[test]
fn test_get_missing_record() {
    let (_tmp, config_path) = setup_test_env();
    run_recsync(&config_path, &["init"]);

    let (_, stderr, success) = run_recsync(&config_path, &["get", "no-such-id"]);
    assert!(!success);
    assert!(stderr.contains("record not found"));
}

#[test]
fn test_list_filters_by_source() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, success) =
        run_recsync(&config_path, &["list", "--source", "filesystem:notes", "--limit", "2"]);
    assert!(success);
    assert!(stdout.contains("2 record(s)"));

    let (stdout, _, success) = run_recsync(&config_path, &["list", "--source", "filesystem:other"]);
    assert!(success);
    assert!(stdout.contains("0 record(s)"));

    let (_, _, success) = run_recsync(&config_path, &["list", "--source", "filesystem"]);
    assert!(!success);
}

#[test]
fn test_members_of_non_header_fails() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (list, _, _) = run_recsync(&config_path, &["list"]);
    let id = id_of(&list, "Alpha Document");
    let (_, stderr, success) = run_recsync(&config_path, &["members", &id]);
    assert!(!success);
    assert!(stderr.contains("not a collection header"));
}

#[test]
fn test_checkpoint_show_and_reset() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, _, success) =
        run_recsync(&config_path, &["checkpoint", "show", "filesystem:notes"]);
    assert!(success);
    assert!(stdout.contains("checkpoint filesystem:notes"));
    assert!(stdout.contains("cursor: "));
    assert!(!stdout.contains("cursor: (none)"));

    let (stdout, _, success) =
        run_recsync(&config_path, &["checkpoint", "reset", "filesystem:notes"]);
    assert!(success);
    assert!(stdout.contains("checkpoint reset for filesystem:notes"));

    let (stdout, _, _) = run_recsync(&config_path, &["checkpoint", "show", "filesystem:notes"]);
    assert!(stdout.contains("no checkpoint for filesystem:notes"));

    // Records survive a reset; the next run rescans without creating.
    let (stdout, _, success) = run_recsync(&config_path, &["sync", "filesystem:notes"]);
    assert!(success);
    assert!(stdout.contains("(full)"));
    assert!(stdout.contains("created: 0"));
}

#[test]
fn test_sources() {
    let (_tmp, config_path) = setup_test_env();
    init_and_sync(&config_path);

    let (stdout, stderr, success) = run_recsync(&config_path, &["sources"]);
    assert!(success, "sources failed: {}", stderr);
    assert!(stdout.contains("filesystem:notes"));
    assert!(stdout.contains("OK"));
    assert!(!stdout.contains("never"));
}

#[test]
fn test_unknown_source() {
    let (_tmp, config_path) = setup_test_env();
    run_recsync(&config_path, &["init"]);

    let (_, stderr, success) = run_recsync(&config_path, &["sync", "github"]);
    assert!(!success);
    assert!(stderr.contains("unknown source"));
}

#[test]
fn test_embed_pending_errors_when_disabled() {
    let (_tmp, config_path) = setup_test_env();
    run_recsync(&config_path, &["init"]);

    let (_, stderr, success) = run_recsync(&config_path, &["embed", "pending"]);
    assert!(!success);
    assert!(stderr.contains("disabled"));
}
