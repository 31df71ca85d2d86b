//! Aggregation driver over a finished INDEX/DATA pair.
//!
//! Two paths:
//!
//! * **optimized**: an external binary computes stat engines over JSON
//!   records and prints one intermediate state per engine. Used only when
//!   every engine is a plain stat and the data format is JSON.
//! * **native**: INDEX is scanned line by line, each payload is parsed per
//!   the data format and fed to the engines, optionally on several worker
//!   threads that each own a clone of the aggregation set.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use primstream_core::{parse_index, Aggregations, DataFormat};

use crate::config::AggregationsConfig;
use crate::error::{PipelineError, Result};

/// Leading framing bytes of each record in a JSON-array DATA file.
pub const JSON_ARRAY_SKIP: usize = 2;

const BUF_SIZE: usize = 256 * 1024;
const QUEUE_SIZE: usize = 4 * 1024;
const MONITOR_PERIOD: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineSelector {
    #[default]
    Auto,
    Native,
    Optimized,
}

impl FromStr for EngineSelector {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(EngineSelector::Auto),
            "native" => Ok(EngineSelector::Native),
            "optimized" => Ok(EngineSelector::Optimized),
            other => Err(PipelineError::Configuration(format!(
                "{:?} is unknown aggregation engine",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregationOptions {
    pub engine: EngineSelector,
    /// Command line of the optimized tool. Empty disables the fast path.
    pub optimized_tool: Vec<String>,
    pub concurrency: usize,
}

impl AggregationOptions {
    pub fn from_config(cfg: &AggregationsConfig) -> Result<Self> {
        Ok(Self {
            engine: cfg.engine.parse()?,
            optimized_tool: cfg.optimized_tool.clone(),
            concurrency: cfg.concurrency.max(1),
        })
    }
}

/// Inputs of one aggregation run.
#[derive(Debug, Clone)]
pub struct AggregationJob {
    pub index_path: PathBuf,
    pub data_path: PathBuf,
    pub delimiter: Vec<u8>,
    pub format: DataFormat,
    /// Detect and skip JSON-array framing in DATA.
    pub check_json_array: bool,
}

/// Runs aggregations and returns the updated set.
///
/// A cancelled run returns the set with whatever was accumulated.
pub async fn apply_aggregations(
    opts: &AggregationOptions,
    job: AggregationJob,
    mut aggs: Aggregations,
    cancel: CancellationToken,
) -> Result<Aggregations> {
    let start = Instant::now();
    if let Some(fields) = optimized_fields(opts, &job, &aggs)? {
        match run_optimized(opts, &job, &fields, &mut aggs, &cancel).await {
            Ok(()) => {
                info!(elapsed = ?start.elapsed(), "optimized aggregations done");
                return Ok(aggs);
            }
            Err(err) if opts.engine == EngineSelector::Optimized || err.is_cancelled() => {
                return Err(err)
            }
            Err(err) => warn!(error = %err, "optimized aggregations failed, using native"),
        }
    }

    let concurrency = opts.concurrency.max(1);
    let aggs = tokio::task::spawn_blocking(move || {
        run_native(&job, &mut aggs, concurrency, &|| cancel.is_cancelled()).map(|_| aggs)
    })
    .await
    .map_err(|e| PipelineError::Execution(format!("aggregation worker failed: {}", e)))??;

    info!(elapsed = ?start.elapsed(), concurrency, "native aggregations done");
    Ok(aggs)
}

/// Engine fields for the fast path, or `None` when it does not apply.
fn optimized_fields(
    opts: &AggregationOptions,
    job: &AggregationJob,
    aggs: &Aggregations,
) -> Result<Option<Vec<String>>> {
    let forced = match opts.engine {
        EngineSelector::Native => return Ok(None),
        EngineSelector::Optimized => true,
        EngineSelector::Auto => false,
    };

    if opts.optimized_tool.is_empty() {
        if forced {
            return Err(PipelineError::Configuration(
                "no optimized aggregation tool configured".into(),
            ));
        }
        return Ok(None);
    }
    if job.format != DataFormat::Json {
        if forced {
            return Err(PipelineError::Configuration(format!(
                "optimized aggregations do not support {:?} data format",
                job.format.as_str()
            )));
        }
        return Ok(None);
    }
    match aggs.stat_fields() {
        Some(fields) => Ok(Some(fields)),
        None if forced => Err(PipelineError::Configuration(
            "optimized aggregations support only stat functions".into(),
        )),
        None => Ok(None),
    }
}

fn is_json_array(path: &Path) -> Result<bool> {
    let mut f = File::open(path)?;
    let mut first = [0u8; 1];
    let n = f.read(&mut first)?;
    Ok(n == 1 && first[0] == b'[')
}

async fn run_optimized(
    opts: &AggregationOptions,
    job: &AggregationJob,
    fields: &[String],
    aggs: &mut Aggregations,
    cancel: &CancellationToken,
) -> Result<()> {
    let (program, base_args) = match opts.optimized_tool.split_first() {
        Some(split) => split,
        None => {
            return Err(PipelineError::Configuration(
                "no optimized aggregation tool configured".into(),
            ))
        }
    };

    let mut cmd = Command::new(program);
    cmd.args(base_args)
        .arg("--index")
        .arg(&job.index_path)
        .arg("--data")
        .arg(&job.data_path)
        .arg("--delimiter-length")
        .arg(job.delimiter.len().to_string())
        .arg("--concurrency")
        .arg(opts.concurrency.max(1).to_string());
    if job.check_json_array && is_json_array(&job.data_path)? {
        cmd.arg("--json-array");
    }
    for field in fields {
        cmd.arg("--field").arg(field);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool = %program, fields = ?fields, "starting optimized aggregations");
    let mut child = cmd
        .spawn()
        .map_err(|e| PipelineError::Spawn(format!("{}: {}", program, e)))?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let output = tokio::spawn(async move {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_end(&mut out).await;
            }
        };
        let read_err = async {
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_end(&mut err).await;
            }
        };
        tokio::join!(read_out, read_err);
        (out, err)
    });

    let mut monitor = tokio::time::interval(MONITOR_PERIOD);
    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = monitor.tick() => {
                if cancel.is_cancelled() {
                    debug!("optimized aggregations cancelled");
                    terminate(&mut child).await;
                    return Err(PipelineError::Cancelled("aggregations".into()));
                }
            }
        }
    };

    let (out, err) = output
        .await
        .map_err(|e| PipelineError::Execution(format!("failed to collect tool output: {}", e)))?;
    if !status.success() {
        return Err(PipelineError::Execution(format!(
            "optimized aggregation tool failed ({}): {}",
            status,
            String::from_utf8_lossy(&err).trim()
        )));
    }

    let states: Vec<serde_json::Value> = serde_json::from_slice(&out)
        .map_err(|e| PipelineError::Parse(format!("failed to parse tool output: {}", e)))?;
    if states.len() != fields.len() {
        return Err(PipelineError::Parse(format!(
            "tool reported {} engines, expected {}",
            states.len(),
            fields.len()
        )));
    }
    for (i, state) in states.iter().enumerate() {
        aggs.merge_engine(i, state).map_err(PipelineError::parse)?;
    }
    Ok(())
}

/// Stops the tool with SIGTERM, then SIGKILL if it is still running
/// after the grace period.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok() {
            match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                Ok(_) => return,
                Err(_) => warn!(pid, "optimized tool ignored SIGTERM, killing"),
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Native aggregation on the calling thread, plus `concurrency - 1`
/// additional workers when more than one is requested.
pub fn run_native(
    job: &AggregationJob,
    aggs: &mut Aggregations,
    concurrency: usize,
    cancelled: &(dyn Fn() -> bool + Sync),
) -> Result<()> {
    if concurrency <= 1 {
        let format = job.format;
        return scan(job, cancelled, &mut |data| {
            let parsed = format
                .parse(&data)
                .map_err(|e| PipelineError::Parse(format!("failed to parse DATA: {:#}", e)))?;
            aggs.add(&parsed)
                .map_err(|e| PipelineError::Parse(format!("failed to apply aggregation: {:#}", e)))
        });
    }

    let failed = AtomicBool::new(false);
    let format = job.format;
    debug!(concurrency, "start sub-processing");

    let (scanned, workers) = std::thread::scope(|scope| {
        let mut senders: Vec<SyncSender<Vec<u8>>> = Vec::with_capacity(concurrency);
        let mut handles = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let (tx, rx) = sync_channel::<Vec<u8>>(QUEUE_SIZE / concurrency);
            senders.push(tx);
            let mut local = aggs.clone();
            let failed = &failed;
            handles.push(scope.spawn(move || -> (Aggregations, Option<PipelineError>) {
                // keep draining after a failure so the feeder never blocks
                let mut error = None;
                for data in rx {
                    if error.is_some() {
                        continue;
                    }
                    let res = format
                        .parse(&data)
                        .map_err(|e| {
                            PipelineError::Parse(format!("failed to parse DATA: {:#}", e))
                        })
                        .and_then(|parsed| {
                            local.add(&parsed).map_err(|e| {
                                PipelineError::Parse(format!(
                                    "failed to apply aggregation: {:#}",
                                    e
                                ))
                            })
                        });
                    if let Err(err) = res {
                        failed.store(true, Ordering::Release);
                        error = Some(err);
                    }
                }
                (local, error)
            }));
        }

        let mut next = 0;
        let scanned = scan(job, cancelled, &mut |data| {
            if senders[next].send(data).is_err() {
                return Err(PipelineError::Execution("aggregation worker stopped".into()));
            }
            next = (next + 1) % senders.len();
            if failed.load(Ordering::Acquire) {
                return Err(PipelineError::Execution("parallel error occurred".into()));
            }
            Ok(())
        });
        drop(senders);

        let workers: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
        (scanned, workers)
    });

    // the first worker error explains a "parallel error" better
    let mut first_error = None;
    for worker in workers {
        match worker {
            Ok((local, error)) => {
                if let Some(err) = error {
                    warn!(error = %err, "sub-processing error");
                    first_error.get_or_insert(err);
                }
                aggs.merge_from(&local).map_err(PipelineError::parse)?;
            }
            Err(_) => {
                first_error
                    .get_or_insert(PipelineError::Execution("aggregation worker panicked".into()));
            }
        }
    }

    match (scanned, first_error) {
        (Err(_), Some(err)) | (Ok(()), Some(err)) => Err(err),
        (Err(err), None) => Err(err),
        (Ok(()), None) => Ok(()),
    }
}

/// Reads every INDEX entry and hands its payload to `sink`.
fn scan(
    job: &AggregationJob,
    cancelled: &(dyn Fn() -> bool + Sync),
    sink: &mut dyn FnMut(Vec<u8>) -> Result<()>,
) -> Result<()> {
    let index_file = File::open(&job.index_path)
        .map_err(|e| PipelineError::from(e).with_context("failed to open INDEX file"))?;
    let data_file = File::open(&job.data_path)
        .map_err(|e| PipelineError::from(e).with_context("failed to open DATA file"))?;
    let mut index_rd = BufReader::with_capacity(BUF_SIZE, index_file);
    let mut data_rd = BufReader::with_capacity(BUF_SIZE, data_file);

    let json_array = job.check_json_array && data_rd.fill_buf()?.first() == Some(&b'[');
    let skip = if json_array { JSON_ARRAY_SKIP } else { 0 };

    let mut line = Vec::new();
    let mut data_pos = 0u64;
    loop {
        line.clear();
        let n = index_rd
            .read_until(b'\n', &mut line)
            .map_err(|e| PipelineError::from(e).with_context("INDEX reading failed"))?;
        if n == 0 {
            return Ok(());
        }

        let index = parse_index(&line)
            .map_err(|e| PipelineError::Parse(format!("failed to parse INDEX: {:#}", e)))?;

        if skip != 0 {
            let mut mark = [0u8; JSON_ARRAY_SKIP];
            data_rd.read_exact(&mut mark).map_err(|e| {
                PipelineError::Integrity(format!("failed to skip JSON mark: {}", e))
            })?;
            data_pos = advance(data_pos, skip as u64)?;
        }

        // the length is untrusted: grow the buffer as bytes actually arrive
        let mut data = Vec::new();
        (&mut data_rd)
            .take(index.length)
            .read_to_end(&mut data)
            .map_err(|e| PipelineError::Integrity(format!("failed to read DATA: {}", e)))?;
        if (data.len() as u64) < index.length {
            return Err(PipelineError::Integrity(format!(
                "failed to read DATA: {} of {} bytes available at {}",
                data.len(),
                index.length,
                data_pos
            )));
        }
        data_pos = advance(data_pos, index.length)?;

        if !job.delimiter.is_empty() {
            let mut delim = vec![0u8; job.delimiter.len()];
            data_rd.read_exact(&mut delim).map_err(|e| {
                PipelineError::Integrity(format!("failed to read DATA delimiter: {}", e))
            })?;
            // JSON-array framing replaces the delimiter bytes
            if !json_array && delim != job.delimiter {
                return Err(PipelineError::Integrity(format!(
                    "{:?} unexpected delimiter found at {}",
                    String::from_utf8_lossy(&delim),
                    data_pos
                )));
            }
            data_pos = advance(data_pos, delim.len() as u64)?;
        }

        sink(data)?;

        if cancelled() {
            debug!("aggregations cancelled");
            return Ok(());
        }
    }
}

fn advance(pos: u64, by: u64) -> Result<u64> {
    pos.checked_add(by).ok_or_else(|| {
        PipelineError::Integrity(format!("DATA position {} overflows by {} bytes", pos, by))
    })
}
