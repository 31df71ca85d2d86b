//! Task orchestration: locks, backend process, results reader,
//! aggregations and cleanup for one search.
//!
//! # Lifecycle
//!
//! ```text
//! validate ─► lock inputs ─► spawn backend ─┬─► exit ok ─► parse stats ─► drain reader
//!                                           │                             │
//!                                           ├─► exit err ─► error         ▼
//!                                           │                       aggregations
//!                                           └─► cancel ─► kill?           │
//!                                                                         ▼
//!                                        unlock ◄── cleanup ◄── publish stats
//! ```
//!
//! In low-latency mode the reader starts together with the backend and
//! polls the artifacts as they grow. Otherwise (or when the artifacts
//! already exist) it starts once the backend exits.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use primstream_core::stat::EXTRA_AGGREGATIONS;
use primstream_core::{parse_stat, Aggregations, DataFormat, Stat};

use crate::aggregate::{apply_aggregations, AggregationJob, AggregationOptions};
use crate::command::{build_command, primitive, select_backend};
use crate::config::EngineConfig;
use crate::error::{PipelineError, Result};
use crate::lock::{self, LockManager, ShareMode};
use crate::poll::PollSettings;
use crate::reader::{ReaderControl, ReaderOptions, ReaderSummary, ResultsReader};
use crate::result::{channel, ResultSink, SearchResult};
use crate::search_config::SearchConfig;
use crate::task::{LockSet, Task};
use crate::tweaks::Tweaks;
use crate::view::create_view_file;

/// Search engine over one backend installation.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    tweaks: Tweaks,
    aggs: AggregationOptions,
    poll: PollSettings,
    locks: Arc<LockManager>,
}

/// Options checked before a task starts.
struct Prepared {
    search: SearchConfig,
    share: ShareMode,
    aggs: Option<(Aggregations, DataFormat)>,
}

impl Engine {
    /// Creates an engine sharing the process-wide lock manager.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_locks(config, lock::global())
    }

    pub fn with_locks(config: EngineConfig, locks: Arc<LockManager>) -> Result<Self> {
        let tweaks = Tweaks::from_config(&config.backend.tweaks)?;
        let aggs = AggregationOptions::from_config(&config.aggregations)?;
        let poll = PollSettings::from(&config.poll);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tweaks,
                aggs,
                poll,
                locks,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Effective engine options, for diagnostics.
    pub fn options(&self) -> Value {
        let cfg = &self.inner.config;
        json!({
            "ryftprim-exec": cfg.backend.ryftprim_exec,
            "ryftx-exec": cfg.backend.ryftx_exec,
            "ryftpcre2-exec": cfg.backend.ryftpcre2_exec,
            "legacy-mode": cfg.backend.legacy,
            "kill-on-cancel": cfg.backend.kill_on_cancel,
            "abs-path": cfg.backend.abs_path,
            "mount-point": cfg.paths.mount_point,
            "home-dir": cfg.paths.home_dir,
            "instance-name": cfg.paths.instance,
            "open-poll": format!("{:?}", self.inner.poll.open_interval),
            "read-poll": format!("{:?}", self.inner.poll.read_interval),
            "read-limit": self.inner.poll.read_limit,
            "keep-files": cfg.processing.keep_files,
            "minimize-latency": cfg.processing.minimize_latency,
            "index-host": cfg.processing.index_host,
            "aggregations": {
                "engine": format!("{:?}", self.inner.aggs.engine).to_lowercase(),
                "optimized-tool": self.inner.aggs.optimized_tool,
                "concurrency": self.inner.aggs.concurrency,
            },
            "tweaks": self.inner.tweaks.to_json(),
        })
    }

    /// Starts a search task and returns its results stream.
    ///
    /// Configuration problems fail here; everything after the task starts
    /// is reported on the stream.
    pub async fn search(&self, search: SearchConfig) -> Result<SearchResult> {
        let prepared = self.prepare(search)?;
        let task = Task::new(&self.inner.config.paths, &prepared.search);
        info!(task = %task.id, search = %prepared.search, "starting search");

        let (sink, result) = channel();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run(task, prepared, sink).await;
        });
        Ok(result)
    }

    fn prepare(&self, search: SearchConfig) -> Result<Prepared> {
        let cfg = &self.inner.config;
        search.validate(&cfg.paths.home())?;
        let share = ShareMode::parse(&search.share_mode, cfg.locks.max_wait())?;

        // unknown mode or missing backend executable fail before any work
        let prim = primitive(&search.mode, search.dist)?;
        select_backend(&cfg.backend, &self.inner.tweaks, &search, prim)?;

        let aggs = match &search.aggregations {
            Some(options) => match Aggregations::from_options(options)
                .map_err(PipelineError::config)?
            {
                Some(aggs) => {
                    let format = search
                        .data_format
                        .parse::<DataFormat>()
                        .map_err(PipelineError::config)?;
                    Some((aggs, format))
                }
                None => None,
            },
            None => None,
        };

        if !search.transforms.is_empty() {
            debug!(transforms = ?search.transforms, "transforms are applied by the consumer");
        }

        Ok(Prepared {
            search,
            share,
            aggs,
        })
    }
}

impl Inner {
    async fn run(self: Arc<Self>, task: Task, prepared: Prepared, sink: ResultSink) {
        let keep_files = self.config.processing.keep_files;
        let lifetime = prepared.search.lifetime_secs;
        let mut locks = LockSet::new(self.locks.clone(), &task.id);

        match self.execute(&task, prepared, &mut locks, &sink).await {
            Ok(stat) => sink.report_stat(stat),
            Err(err) if err.is_cancelled() => {
                info!(task = %task.id, "task cancelled");
            }
            Err(err) => {
                error!(task = %task.id, kind = err.kind(), error = %err, "task failed");
                sink.report_error(err);
            }
        }

        drop(locks);
        task.cleanup(keep_files);
        if lifetime > 0 {
            schedule_removal(&task, Duration::from_secs(lifetime));
        }
        sink.close();
        info!(task = %task.id, elapsed = ?task.started.elapsed(), "task done");
    }

    async fn execute(
        &self,
        task: &Task,
        prepared: Prepared,
        locks: &mut LockSet,
        sink: &ResultSink,
    ) -> Result<Stat> {
        let Prepared {
            search,
            share,
            aggs,
        } = prepared;
        let cfg = &self.config;
        let home = cfg.paths.home();
        let host = cfg.processing.index_host.as_deref();
        let cancel = sink.cancel_token();

        let files = locks.acquire(&home, &search.files, share, &cancel).await?;
        debug!(task = %task.id, locked = locks.held(), "inputs locked");
        if files.is_empty() && search.skip_missing {
            info!(task = %task.id, "no input files left, nothing to search");
            return Ok(Stat::new(host));
        }

        let deferred =
            !cfg.processing.minimize_latency || task.index.exists() || task.data.exists();
        for artifact in [&task.index, &task.data] {
            artifact.remove().map_err(|e| {
                PipelineError::Io(e).with_context("failed to remove old artifact")
            })?;
        }
        let dirs = [Some(&task.index.path), Some(&task.data.path), task.view.as_ref()];
        for dir in dirs.into_iter().flatten().filter_map(|p| p.parent()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let command = build_command(
            &cfg.backend,
            &cfg.paths,
            &self.tweaks,
            &search,
            &files,
            &task.artifacts(),
        )?;
        info!(
            task = %task.id,
            backend = %command.backend,
            program = %command.program.display(),
            args = ?command.args,
            "executing backend"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&cfg.paths.mount_point)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                PipelineError::Spawn(format!("{}: {}", command.program.display(), e))
            })?;
        let backend_started = Instant::now();

        let output = Arc::new(Mutex::new(Vec::new()));
        let mut capture = Vec::new();
        if let Some(out) = child.stdout.take() {
            capture.push(tokio::spawn(capture_output(out, output.clone())));
        }
        if let Some(err) = child.stderr.take() {
            capture.push(tokio::spawn(capture_output(err, output.clone())));
        }

        let mut reader = ReaderRun::new(self.reader_options(task, &search), &task.id);
        if search.report_index && !deferred {
            reader.start(sink);
        }

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                info!(task = %task.id, "cancelling backend");
                reader.control.cancel();
                if cfg.backend.kill_on_cancel {
                    if let Err(e) = child.start_kill() {
                        warn!(task = %task.id, error = %e, "failed to kill backend");
                    }
                }
                // reap in the background, the backend may outlive the task
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
                reader.join(&cancel, sink).await;
                return Err(PipelineError::Cancelled("cancelled by client".into()));
            }
        };
        for handle in capture {
            let _ = handle.await;
        }
        let output = output
            .lock()
            .map(|buf| String::from_utf8_lossy(&buf).into_owned())
            .unwrap_or_default();
        let backend_elapsed = backend_started.elapsed();
        reader.control.finish();

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                reader.control.cancel();
                reader.join(&cancel, sink).await;
                return Err(PipelineError::Execution(format!(
                    "{} failed with {}\n{}",
                    command.backend.name().to_uppercase(),
                    e,
                    output
                )));
            }
        };
        if !status.success() {
            reader.control.cancel();
            reader.join(&cancel, sink).await;
            return Err(PipelineError::Execution(format!(
                "{} failed with {}\n{}",
                command.backend.name().to_uppercase(),
                status,
                output
            )));
        }
        debug!(task = %task.id, elapsed = ?backend_elapsed, "backend finished");

        let mut stat = match parse_stat(&output) {
            Ok(stat) => stat,
            Err(e) => {
                reader.control.cancel();
                reader.join(&cancel, sink).await;
                return Err(PipelineError::parse(e).with_context("failed to parse statistics"));
            }
        };
        stat.host = host.filter(|h| !h.is_empty()).map(str::to_string);

        if !task.index.exists() {
            // nothing was written, the reader would wait forever
            warn!(task = %task.id, path = %task.index.path.display(), "backend produced no INDEX");
            reader.control.cancel();
        } else if search.report_index && !reader.is_started() {
            reader.start(sink);
        }
        reader.control.stop();
        let reading_started = Instant::now();
        let summary = reader.join(&cancel, sink).await;
        if let Some(summary) = &summary {
            debug!(
                task = %task.id,
                records = summary.records,
                index_bytes = summary.total_index_length,
                data_bytes = summary.total_data_length,
                "results processed"
            );
        }
        let reading_elapsed = reading_started.elapsed();

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("cancelled by client".into()));
        }

        if !search.report_index {
            if let Some(view) = &task.view {
                match create_view_file(&task.index.path, view, search.delimiter.as_bytes()) {
                    Ok(items) => debug!(task = %task.id, items, "VIEW file created"),
                    Err(e) => sink.report_error(e.with_context("failed to create VIEW file")),
                }
            }
        }

        let aggs_started = Instant::now();
        if let Some((aggs, format)) = aggs {
            let job = AggregationJob {
                index_path: task.index.path.clone(),
                data_path: task.data.path.clone(),
                delimiter: search.delimiter.as_bytes().to_vec(),
                format,
                check_json_array: format == DataFormat::Json,
            };
            match apply_aggregations(&self.aggs, job, aggs, cancel.clone()).await {
                Ok(aggs) => {
                    stat.extra
                        .insert(EXTRA_AGGREGATIONS.to_string(), aggs.to_json(true));
                }
                Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                    return Err(PipelineError::Cancelled("cancelled by client".into()));
                }
                Err(err) => {
                    warn!(task = %task.id, error = %err, "aggregations failed");
                    sink.report_error(err.with_context("failed to apply aggregations"));
                }
            }
        }

        // a cancelled native scan returns partial results
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled("cancelled by client".into()));
        }

        if search.performance {
            let ms = |d: Duration| d.as_secs_f64() * 1000.0;
            stat.add_perf(
                "primstream",
                json!({
                    "task": task.id,
                    "created": task.created.to_rfc3339(),
                    "backend-ms": ms(backend_elapsed),
                    "reading-ms": ms(reading_elapsed),
                    "aggregations-ms": ms(aggs_started.elapsed()),
                    "total-ms": ms(task.started.elapsed()),
                }),
            );
        }

        Ok(stat)
    }

    fn reader_options(&self, task: &Task, search: &SearchConfig) -> ReaderOptions {
        ReaderOptions {
            index_path: task.index.path.clone(),
            data_path: task.data.path.clone(),
            view_path: task.view.clone(),
            delimiter: search.delimiter.as_bytes().to_vec(),
            limit: search.has_limit().then_some(search.limit as u64),
            read_data: search.report_data,
            relative_to: self.config.paths.home(),
            index_host: self.config.processing.index_host.clone().unwrap_or_default(),
            poll: self.poll,
        }
    }
}

/// Results reader that may start before or after the backend exits.
struct ReaderRun {
    reader: Option<ResultsReader>,
    control: Arc<ReaderControl>,
    handle: Option<JoinHandle<ReaderSummary>>,
}

impl ReaderRun {
    fn new(opts: ReaderOptions, task: &str) -> Self {
        let reader = ResultsReader::new(opts, task);
        Self {
            control: reader.control(),
            reader: Some(reader),
            handle: None,
        }
    }

    fn start(&mut self, sink: &ResultSink) {
        if let Some(reader) = self.reader.take() {
            self.handle = Some(tokio::spawn(reader.run(sink.clone())));
        }
    }

    fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    /// Waits for the reader, cancelling it if the client cancels meanwhile.
    /// A reader that dies without a summary is reported on `sink`.
    async fn join(&mut self, cancel: &CancellationToken, sink: &ResultSink) -> Option<ReaderSummary> {
        let mut handle = self.handle.take()?;
        let mut cancelled = false;
        loop {
            tokio::select! {
                res = &mut handle => {
                    return match res {
                        Ok(summary) => Some(summary),
                        Err(e) => {
                            error!(error = %e, "results reader panicked");
                            sink.report_error(PipelineError::Integrity(format!(
                                "results reader failed: {}",
                                e
                            )));
                            None
                        }
                    };
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    self.control.cancel();
                }
            }
        }
    }
}

async fn capture_output<R: AsyncRead + Unpin>(mut rd: R, buf: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match rd.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = buf.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

/// Removes kept artifacts once their lifetime expires.
fn schedule_removal(task: &Task, lifetime: Duration) {
    let mut paths: Vec<PathBuf> = [&task.index, &task.data]
        .into_iter()
        .filter(|a| a.keep)
        .map(|a| a.path.clone())
        .collect();
    paths.extend(task.view.clone());
    if paths.is_empty() {
        return;
    }

    let id = task.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(lifetime).await;
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(task = %id, path = %path.display(), "expired artifact removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task = %id, path = %path.display(), error = %e, "failed to remove expired artifact"),
            }
        }
    });
}
