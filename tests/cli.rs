use serde_json::Value;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    fs::write(root.join("1.txt"), "input").unwrap();

    let backend = root.join("backend.sh");
    fs::write(
        &backend,
        r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -oi) IDX="$2"; shift ;;
    -od) DAT="$2"; shift ;;
  esac
  shift
done
printf '%s\n' "$PWD/1.txt,0,12,0" "$PWD/1.txt,13,11,0" > "$IDX"
printf '%s' '{"price":10}
{"price":5}
' > "$DAT"
echo "Matches: 2"
echo "Total Bytes: 5"
echo "Duration: 1"
echo "Fabric Data Rate: inf MB/sec"
"#,
    )
    .unwrap();
    fs::set_permissions(&backend, fs::Permissions::from_mode(0o755)).unwrap();

    let config_content = format!(
        r#"[backend]
ryftprim_exec = "{backend}"
legacy = false

[paths]
mount_point = "{root}"
home_dir = "/"
instance = ".work"

[poll]
open_interval_ms = 10
read_interval_ms = 10
read_limit = 20

[logging]
level = "warn"
"#,
        backend = backend.display(),
        root = root.display(),
    );

    let config_path = root.join("primstream.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cli(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_primstream"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .expect("failed to run primstream binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn json_lines(stdout: &str) -> Vec<Value> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn test_search_streams_json_lines() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cli(
        &config_path,
        &[
            "search",
            "price",
            "-f",
            "1.txt",
            "--delimiter",
            "\n",
            "--aggs",
            r#"{"max-price": {"max": {"field": "price"}}}"#,
        ],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);

    let lines = json_lines(&stdout);
    assert_eq!(lines.len(), 3, "{}", stdout);
    assert_eq!(lines[0]["record"]["index"]["file"], "1.txt");
    assert_eq!(lines[0]["record"]["data"], r#"{"price":10}"#);
    assert_eq!(lines[1]["record"]["data"], r#"{"price":5}"#);

    let stat = &lines[2]["stat"];
    assert_eq!(stat["matches"], 2);
    assert_eq!(stat["fabric_data_rate_mbps"], 0.0);
    assert_eq!(stat["extra"]["aggregations"]["max-price"]["value"], 10.0);
}

#[test]
fn test_search_count_only() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cli(
        &config_path,
        &["search", "price", "-f", "1.txt", "--delimiter", "\n", "--count"],
    );
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);

    let lines = json_lines(&stdout);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["stat"]["matches"], 2);
}

#[test]
fn test_search_rejects_path_outside_home() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_cli(&config_path, &["search", "x", "-f", "../../etc/passwd"]);
    assert!(!success);
    assert!(stderr.contains("not relative to home"), "{}", stderr);
}

#[test]
fn test_stat_command() {
    let (tmp, config_path) = setup_test_env();
    let summary = tmp.path().join("summary.txt");
    fs::write(
        &summary,
        "Matches: 7\nTotal Bytes: 1 KB\nDuration: 2ms\nFabric Data Rate: 1 MB/sec\n",
    )
    .unwrap();

    let (stdout, stderr, success) =
        run_cli(&config_path, &["stat", summary.to_str().unwrap()]);
    assert!(success, "stat failed: {}", stderr);
    let stat: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(stat["matches"], 7);
    assert_eq!(stat["total_bytes"], 1024);
    assert_eq!(stat["duration_ms"], 2);

    fs::write(&summary, "Matches: 7\n").unwrap();
    let (_, stderr, success) = run_cli(&config_path, &["stat", summary.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Duration"), "{}", stderr);
}

#[test]
fn test_aggregate_and_view_commands() {
    let (tmp, config_path) = setup_test_env();
    let root = tmp.path();

    // keep the artifacts and a VIEW from a count-only search
    let (_, stderr, success) = run_cli(
        &config_path,
        &[
            "search",
            "price",
            "-f",
            "1.txt",
            "--delimiter",
            "\n",
            "--count",
            "--keep-index",
            "res/out.txt",
            "--keep-data",
            "res/out.bin",
            "--keep-view",
            "res/out.view",
        ],
    );
    assert!(success, "search failed: {}", stderr);

    let index = root.join("res/out.txt");
    let data = root.join("res/out.bin");
    let (stdout, stderr, success) = run_cli(
        &config_path,
        &[
            "aggregate",
            "--index",
            index.to_str().unwrap(),
            "--data",
            data.to_str().unwrap(),
            "--delimiter",
            "\n",
            "--engine",
            "native",
            "--concurrency",
            "2",
            "--aggs",
            r#"{"s": {"stats": {"field": "price"}}}"#,
        ],
    );
    assert!(success, "aggregate failed: {}", stderr);
    let aggs: Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(aggs["s"]["count"], 2);
    assert_eq!(aggs["s"]["sum"], 15.0);
    assert_eq!(aggs["s"]["min"], 5.0);

    let view = root.join("res/out.view");
    let (stdout, stderr, success) =
        run_cli(&config_path, &["view", "--view", view.to_str().unwrap()]);
    assert!(success, "view failed: {}", stderr);
    let lines = json_lines(&stdout);
    assert_eq!(lines[0]["items"], 2);
    assert_eq!(lines[2]["data"], serde_json::json!([13, 24]));

    // rebuilding from the kept INDEX gives the same positions
    let rebuilt = root.join("res/rebuilt.view");
    let (stdout, stderr, success) = run_cli(
        &config_path,
        &[
            "view",
            "--view",
            rebuilt.to_str().unwrap(),
            "--index",
            index.to_str().unwrap(),
            "--delimiter",
            "\n",
            "--pos",
            "1",
        ],
    );
    assert!(success, "view failed: {}", stderr);
    let item: Value = serde_json::from_str(stdout.trim()).unwrap();
    let first = format!("{}/1.txt,0,12,0\n", root.display()).len();
    let second = format!("{}/1.txt,13,11,0\n", root.display()).len();
    assert_eq!(item["index"], serde_json::json!([first, first + second]));
    assert_eq!(item["data"], serde_json::json!([13, 24]));
}
