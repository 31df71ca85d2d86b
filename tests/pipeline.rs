//! End-to-end searches against a fake backend.
//!
//! The backend is a shell script that parses `-oi`/`-od`, writes INDEX and
//! DATA relative to its working directory (the mount point) and prints a
//! statistics summary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use primstream::config::EngineConfig;
use primstream::lock::{LockManager, ShareMode};
use primstream::{Engine, PipelineError, Record, SearchConfig, Stat};
use serde_json::json;

const ARGS: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    -oi) IDX="$2"; shift ;;
    -od) DAT="$2"; shift ;;
  esac
  shift
done
"#;

const SUMMARY: &str = r#"
echo "Matches: 2"
echo "Total Bytes: 1024"
echo "Duration: 10"
echo "Fabric Data Rate: 1.5 MB/sec"
"#;

/// Two records: `hello` and `world!`, delimiter `|`.
const TWO_RECORDS: &str = r#"
printf '%s\n' "$PWD/1.txt,100,5,0" "$PWD/2.txt,200,6,1" > "$IDX"
printf '%s' 'hello|world!|' > "$DAT"
"#;

struct Fixture {
    tmp: TempDir,
    config: EngineConfig,
}

impl Fixture {
    fn new(body: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("backend.sh");
        fs::write(&script, format!("{}{}", ARGS, body)).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(tmp.path().join("1.txt"), "input").unwrap();
        fs::write(tmp.path().join("2.txt"), "input").unwrap();

        let mut config = EngineConfig::minimal();
        config.backend.ryftprim_exec = Some(script);
        config.backend.ryftpcre2_exec = None;
        config.backend.legacy = false;
        config.backend.kill_on_cancel = true;
        config.paths.mount_point = tmp.path().to_path_buf();
        config.paths.home_dir = "/".into();
        config.paths.instance = ".work".into();
        config.poll.open_interval_ms = 10;
        config.poll.read_interval_ms = 10;
        config.poll.read_limit = 20;
        config.aggregations.optimized_tool = Vec::new();

        Self { tmp, config }
    }

    fn low_latency(mut self) -> Self {
        self.config.processing.minimize_latency = true;
        self
    }

    fn root(&self) -> &Path {
        self.tmp.path()
    }

    fn engine(&self) -> Engine {
        Engine::with_locks(self.config.clone(), Arc::new(LockManager::new())).unwrap()
    }

    fn leftovers(&self) -> Vec<PathBuf> {
        match fs::read_dir(self.root().join(".work")) {
            Ok(dir) => dir.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn search() -> SearchConfig {
    SearchConfig::new("hello", &["1.txt", "2.txt"]).with_delimiter("|")
}

async fn run(engine: &Engine, search: SearchConfig) -> (Vec<Record>, Vec<PipelineError>, Option<Stat>) {
    let result = engine.search(search).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), result.collect())
        .await
        .expect("task did not finish")
}

#[tokio::test]
async fn test_records_and_stats() {
    let fx = Fixture::new(&format!("{}{}", TWO_RECORDS, SUMMARY));
    let (records, errors, stat) = run(&fx.engine(), search()).await;

    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].index.file, "1.txt");
    assert_eq!(records[0].index.offset, 100);
    assert_eq!(records[0].data.as_deref(), Some(&b"hello"[..]));
    assert_eq!(records[1].index.file, "2.txt");
    assert_eq!(records[1].index.fuzziness, 1);
    assert_eq!(records[1].data.as_deref(), Some(&b"world!"[..]));

    let stat = stat.expect("no stat");
    assert_eq!(stat.matches, 2);
    assert_eq!(stat.total_bytes, 1024);
    assert_eq!(stat.duration_ms, 10);
    assert!((stat.fabric_data_rate_mbps - 1.5).abs() < 1e-9);

    // transient artifacts are gone
    assert!(fx.leftovers().is_empty(), "left: {:?}", fx.leftovers());
}

#[tokio::test]
async fn test_streaming_while_backend_runs() {
    let body = r#"
printf '%s\n' "$PWD/1.txt,0,3,0" > "$IDX"
printf '%s' 'one|' > "$DAT"
sleep 0.3
printf '%s\n' "$PWD/2.txt,4,3,0" >> "$IDX"
printf '%s' 'two|' >> "$DAT"
"#;
    let fx = Fixture::new(&format!("{}{}", body, SUMMARY)).low_latency();
    let mut result = fx.engine().search(search()).await.unwrap();

    // the first record arrives before the backend exits
    let first = tokio::time::timeout(Duration::from_millis(250), result.next())
        .await
        .expect("first record was not streamed");
    match first {
        Some(primstream::ResultEvent::Record(rec)) => {
            assert_eq!(rec.data.as_deref(), Some(&b"one"[..]))
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let (records, errors, stat) = result.collect().await;
    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data.as_deref(), Some(&b"two"[..]));
    assert_eq!(stat.unwrap().matches, 2);
}

#[tokio::test]
async fn test_cancel_before_index_exists() {
    let fx = Fixture::new("sleep 10\n").low_latency();
    let result = fx.engine().search(search()).await.unwrap();

    let cancel = result.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    });

    let (records, errors, stat) = tokio::time::timeout(Duration::from_secs(5), result.collect())
        .await
        .expect("cancel did not stop the task");
    assert!(records.is_empty());
    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert!(stat.is_none());
}

#[tokio::test]
async fn test_backend_failure() {
    let fx = Fixture::new("echo 'no such primitive'\nexit 3\n");
    let (records, errors, stat) = run(&fx.engine(), search()).await;

    assert!(records.is_empty());
    assert!(stat.is_none());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), "execution");
    let msg = errors[0].to_string();
    assert!(msg.contains("RYFTPRIM failed with"), "{}", msg);
    assert!(msg.contains("no such primitive"), "{}", msg);
}

#[tokio::test]
async fn test_bad_summary() {
    let fx = Fixture::new(&format!("{}echo 'Matches: 2'\n", TWO_RECORDS));
    let (_, errors, stat) = run(&fx.engine(), search()).await;

    assert!(stat.is_none());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), "parse");
    assert!(errors[0].to_string().contains("failed to parse statistics"));
}

#[tokio::test]
async fn test_delimiter_mismatch() {
    let body = r#"
printf '%s\n' "$PWD/1.txt,0,5,0" > "$IDX"
printf '%s' 'hello#' > "$DAT"
"#;
    let fx = Fixture::new(&format!("{}{}", body, SUMMARY));
    let (records, errors, stat) = run(&fx.engine(), search()).await;

    assert!(records.is_empty());
    assert_eq!(errors.len(), 1, "errors: {:?}", errors);
    assert_eq!(errors[0].kind(), "integrity");
    assert!(errors[0].to_string().contains("unexpected delimiter found at 5"));
    // statistics still arrive
    assert_eq!(stat.unwrap().matches, 2);
}

#[tokio::test]
async fn test_truncated_data_hits_attempt_limit() {
    let body = r#"
printf '%s\n' "$PWD/1.txt,0,5,0" > "$IDX"
printf '%s' 'hello' > "$DAT"
"#;
    let fx = Fixture::new(&format!("{}{}", body, SUMMARY));
    let (_, errors, _) = run(&fx.engine(), search()).await;

    assert_eq!(errors.len(), 1, "errors: {:?}", errors);
    assert_eq!(errors[0].kind(), "integrity");
    let msg = errors[0].to_string();
    assert!(msg.starts_with("failed to read DATA delimiter"), "{}", msg);
    assert!(msg.contains("cancelled by attempt limit"), "{}", msg);
}

#[tokio::test]
async fn test_overflowing_index_length() {
    let body = r#"
printf '%s\n' "$PWD/1.txt,0,18446744073709551615,0" > "$IDX"
printf '%s' 'hello|' > "$DAT"
"#;
    let fx = Fixture::new(&format!("{}{}", body, SUMMARY));
    let (records, errors, stat) = run(&fx.engine(), search()).await;

    assert!(records.is_empty());
    assert_eq!(errors.len(), 1, "errors: {:?}", errors);
    assert_eq!(errors[0].kind(), "integrity");
    assert!(errors[0].to_string().contains("overflows DATA position"));
    assert_eq!(stat.unwrap().matches, 2);
}

#[tokio::test]
async fn test_limit() {
    let fx = Fixture::new(&format!("{}{}", TWO_RECORDS, SUMMARY));
    let (records, errors, stat) = run(&fx.engine(), search().with_limit(1)).await;

    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data.as_deref(), Some(&b"hello"[..]));
    assert!(stat.is_some());
}

#[tokio::test]
async fn test_count_only_with_view_and_aggregations() {
    let body = r#"
printf '%s\n' "$PWD/1.txt,0,11,0" "$PWD/1.txt,20,11,0" "$PWD/2.txt,0,12,0" > "$IDX"
printf '%s' '{"price":1}|{"price":2}|{"price":10}|' > "$DAT"
"#;
    let fx = Fixture::new(&format!("{}{}", body, SUMMARY));
    let mut search = search()
        .count_only()
        .with_aggregations(json!({
            "total": {"sum": {"field": "price"}},
            "mean": {"avg": {"field": "price"}},
        }));
    search.keep_view_as = "out/result.view".into();
    search.performance = true;

    let (records, errors, stat) = run(&fx.engine(), search).await;
    assert!(records.is_empty());
    assert!(errors.is_empty(), "errors: {:?}", errors);

    let stat = stat.unwrap();
    let aggs = &stat.extra["aggregations"];
    assert_eq!(aggs["total"]["value"], json!(13.0));
    assert!((aggs["mean"]["value"].as_f64().unwrap() - 13.0 / 3.0).abs() < 1e-9);
    assert!(stat.extra["performance"]["primstream"]["total-ms"].is_number());

    let mut view = primstream::view::ViewReader::open(&fx.root().join("out/result.view")).unwrap();
    assert_eq!(view.len(), 3);
    let last = view.get(2).unwrap();
    assert_eq!(last.data_begin, 24);
    assert_eq!(last.data_end, 36);
}

#[tokio::test]
async fn test_keep_artifacts() {
    let fx = Fixture::new(&format!("{}{}", TWO_RECORDS, SUMMARY));
    let mut search = search();
    search.keep_index_as = "keep/result.txt".into();
    search.keep_data_as = "keep/result.bin".into();

    let (records, errors, _) = run(&fx.engine(), search).await;
    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert_eq!(records.len(), 2);

    let data = fs::read(fx.root().join("keep/result.bin")).unwrap();
    assert_eq!(data, b"hello|world!|");
    assert!(fx.root().join("keep/result.txt").exists());
}

#[tokio::test]
async fn test_skip_busy_leaves_nothing_to_search() {
    let fx = Fixture::new("echo 'must not run'\nexit 1\n");
    let locks = Arc::new(LockManager::new());
    let root = fx.root().to_string_lossy().into_owned();
    for file in ["1.txt", "2.txt"] {
        let path = format!("{}/{}", root, file);
        assert!(locks.lock_write(&path, ShareMode::SkipBusy, &CancellationToken::new()).await);
    }
    let engine = Engine::with_locks(fx.config.clone(), locks.clone()).unwrap();

    let mut search = search();
    search.share_mode = "skip-busy".into();
    search.skip_missing = true;
    let (records, errors, stat) = run(&engine, search).await;

    assert!(records.is_empty());
    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert_eq!(stat.unwrap().matches, 0);
}

#[tokio::test]
async fn test_busy_file_fails_task() {
    let fx = Fixture::new(SUMMARY);
    let locks = Arc::new(LockManager::new());
    let busy = format!("{}/1.txt", fx.root().display());
    assert!(locks.lock_write(&busy, ShareMode::SkipBusy, &CancellationToken::new()).await);
    let engine = Engine::with_locks(fx.config.clone(), locks.clone()).unwrap();

    let mut search = search();
    search.share_mode = "wait-up-to-50ms".into();
    let (_, errors, stat) = run(&engine, search).await;

    assert!(stat.is_none());
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].kind(), "acquisition");
    // read locks on the other file were released
    assert_eq!(locks.refs(&format!("{}/2.txt", fx.root().display())), (0, 0));
}

#[tokio::test]
async fn test_cancel_while_waiting_for_lock() {
    let fx = Fixture::new(&format!("{}{}", TWO_RECORDS, SUMMARY));
    let locks = Arc::new(LockManager::new());
    let busy = format!("{}/2.txt", fx.root().display());
    assert!(locks.lock_write(&busy, ShareMode::SkipBusy, &CancellationToken::new()).await);
    let engine = Engine::with_locks(fx.config.clone(), locks.clone()).unwrap();

    let mut search = search();
    search.share_mode = "wait-up-to-30s".into();
    let result = engine.search(search).await.unwrap();
    let cancel = result.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let (records, errors, stat) = tokio::time::timeout(Duration::from_secs(5), result.collect())
        .await
        .expect("cancel did not interrupt the lock wait");
    assert!(records.is_empty());
    assert!(errors.is_empty(), "errors: {:?}", errors);
    assert!(stat.is_none());
    assert_eq!(locks.refs(&format!("{}/1.txt", fx.root().display())), (0, 0));
}

#[tokio::test]
async fn test_configuration_errors() {
    let fx = Fixture::new(SUMMARY);
    let engine = fx.engine();

    let outside = SearchConfig::new("x", &["../etc/passwd"]);
    let err = engine.search(outside).await.err().unwrap();
    assert_eq!(err.kind(), "configuration");

    let err = engine.search(search().with_mode("telepathy")).await.err().unwrap();
    assert_eq!(err.kind(), "configuration");

    let mut bad_share = search();
    bad_share.share_mode = "sometimes".into();
    assert_eq!(engine.search(bad_share).await.err().unwrap().kind(), "configuration");

    let bad_aggs = search().with_aggregations(json!({"x": {"median": {"field": "a"}}}));
    assert_eq!(engine.search(bad_aggs).await.err().unwrap().kind(), "configuration");

    let mut data_only = search();
    data_only.report_index = false;
    assert_eq!(engine.search(data_only).await.err().unwrap().kind(), "configuration");
}

#[tokio::test]
async fn test_options_report() {
    let fx = Fixture::new(SUMMARY);
    let options = fx.engine().options();
    assert_eq!(options["read-limit"], 20);
    assert_eq!(options["kill-on-cancel"], true);
    assert_eq!(options["aggregations"]["engine"], "auto");
}
