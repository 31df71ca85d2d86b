//! Streaming correlation of INDEX lines with DATA payloads.
//!
//! The reader follows the backend while it writes: INDEX lines may arrive
//! in fragments, DATA may lag behind INDEX. Each complete INDEX line is
//! parsed, its payload and trailing delimiter are read from DATA, and the
//! record is pushed to the results channel in INDEX order.
//!
//! Lifecycle: `running -> stopped` (soft stop, drain to end-of-file) or
//! `running -> cancelled` (hard stop, return at the next suspension point).
//! `finishing` is set independently when the backend process exits and
//! turns on the idle attempt limit.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use primstream_core::{parse_index, Index, Record};

use crate::error::{PipelineError, Result};
use crate::poll::{PollSettings, Polled, Poller};
use crate::result::ResultSink;
use crate::search_config::relative_to_home;
use crate::view::{ViewItem, ViewWriter};

const BUF_SIZE: usize = 256 * 1024;

/// Shared stop/cancel/finish flags. All transitions are one-way.
#[derive(Debug, Default)]
pub struct ReaderControl {
    token: CancellationToken,
    cancelled: AtomicBool,
    stopped: AtomicBool,
    finishing: AtomicBool,
}

impl ReaderControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hard cancel. Implies stop. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
        self.token.cancel();
    }

    /// Soft stop: read what is left, then finish.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// The backend has exited; idle attempts start counting.
    pub fn finish(&self) {
        self.finishing.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub index_path: PathBuf,
    pub data_path: PathBuf,
    /// Written while streaming when set.
    pub view_path: Option<PathBuf>,
    pub delimiter: Vec<u8>,
    /// Stop after this many records. `None` is unlimited.
    pub limit: Option<u64>,
    /// Read payloads from DATA. Off in count-only mode.
    pub read_data: bool,
    /// File names in INDEX are made relative to this directory.
    pub relative_to: PathBuf,
    pub index_host: String,
    pub poll: PollSettings,
}

/// Totals accumulated over the INDEX lines processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    pub records: u64,
    pub total_index_length: u64,
    /// Expected DATA length: payloads plus delimiters.
    pub total_data_length: u64,
}

enum Step {
    Next,
    Done,
}

pub struct ResultsReader {
    opts: ReaderOptions,
    control: Arc<ReaderControl>,
    task: String,
}

impl ResultsReader {
    pub fn new(opts: ReaderOptions, task: impl Into<String>) -> Self {
        Self {
            opts,
            control: Arc::new(ReaderControl::new()),
            task: task.into(),
        }
    }

    pub fn control(&self) -> Arc<ReaderControl> {
        self.control.clone()
    }

    /// Processes INDEX and DATA until done, stopped or cancelled.
    ///
    /// Errors go to `sink`; the summary is returned either way.
    pub async fn run(self, sink: ResultSink) -> ReaderSummary {
        debug!(task = %self.task, "begin processing");
        let mut summary = ReaderSummary::default();
        if let Err(err) = self.process(&sink, &mut summary).await {
            warn!(task = %self.task, error = %err, "reader failed");
            sink.report_error(err);
        }
        debug!(
            task = %self.task,
            records = summary.records,
            expected_data_length = summary.total_data_length,
            "end processing"
        );
        summary
    }

    fn poller(&self) -> Poller<'_> {
        Poller {
            settings: &self.opts.poll,
            cancel: self.control.token(),
            finishing: &self.control.finishing,
        }
    }

    async fn process(&self, sink: &ResultSink, summary: &mut ReaderSummary) -> Result<()> {
        let poller = self.poller();

        let index_file = match poller
            .open_with_wait(&self.opts.index_path)
            .await
            .map_err(|e| e.with_context("failed to open INDEX file"))?
        {
            Polled::Ready(f) => f,
            Polled::Cancelled => return Ok(()),
        };
        let mut index_rd = BufReader::with_capacity(BUF_SIZE, index_file);

        let mut view = match &self.opts.view_path {
            Some(path) => Some(
                ViewWriter::create(path).map_err(|e| e.with_context("failed to create VIEW file"))?,
            ),
            None => None,
        };

        let mut data_rd: Option<BufReader<File>> = None;
        let mut data_pos = 0u64;
        let mut parts = Vec::new();
        let mut attempt = 0;
        let outcome = loop {
            if attempt >= self.opts.poll.read_limit {
                break Err(self.opts.poll.attempt_limit_error());
            }

            let n = match index_rd.read_until(b'\n', &mut parts).await {
                Ok(n) => n,
                Err(e) => break Err(PipelineError::from(e).with_context("INDEX processing failed")),
            };
            if n > 0 {
                attempt = 0;
            }

            if parts.last() == Some(&b'\n') {
                let line = std::mem::take(&mut parts);
                let step = self
                    .handle_line(&line, sink, summary, &mut view, &mut data_rd, &mut data_pos)
                    .await;
                match step {
                    Ok(Step::Next) => {}
                    Ok(Step::Done) => break Ok(()),
                    Err(err) => break Err(err),
                }

                if self.control.is_cancelled() {
                    debug!(task = %self.task, "cancelled");
                } else {
                    continue;
                }
            }

            if self.control.is_stopped() {
                debug!(
                    task = %self.task,
                    expected_data_length = summary.total_data_length,
                    "stopped"
                );
                break Ok(());
            }

            if !poller.sleep().await {
                debug!(task = %self.task, "cancelled while polling INDEX");
                break Ok(());
            }
            attempt += u32::from(self.control.is_finishing());
        };

        if let Some(mut writer) = view.take() {
            let finished = writer
                .update(
                    summary.total_index_length as i64,
                    summary.total_data_length as i64,
                )
                .and_then(|_| writer.close());
            if let Err(err) = finished {
                sink.report_error(err.with_context("failed to update VIEW file"));
            }
        }

        outcome
    }

    async fn handle_line(
        &self,
        line: &[u8],
        sink: &ResultSink,
        summary: &mut ReaderSummary,
        view: &mut Option<ViewWriter>,
        data_rd: &mut Option<BufReader<File>>,
        data_pos: &mut u64,
    ) -> Result<Step> {
        let mut index = parse_index(line).map_err(|e| {
            warn!(task = %self.task, line = ?String::from_utf8_lossy(line).trim(), "bad INDEX line");
            PipelineError::Parse(format!("failed to parse INDEX: {:#}", e))
        })?;

        // positions are stored as i64 in VIEW files
        let in_range = |v: &u64| *v <= i64::MAX as u64;
        let index_end = summary
            .total_index_length
            .checked_add(line.len() as u64)
            .filter(in_range);
        let data_end = summary.total_data_length.checked_add(index.length);
        let next_data = data_end
            .and_then(|end| end.checked_add(self.opts.delimiter.len() as u64))
            .filter(in_range);
        let (Some(index_end), Some(data_end), Some(next_data)) = (index_end, data_end, next_data)
        else {
            return Err(PipelineError::Integrity(format!(
                "INDEX length {} overflows DATA position {}",
                index.length, summary.total_data_length
            )));
        };

        if let Some(writer) = view.as_mut() {
            let put = writer.put(ViewItem {
                index_begin: summary.total_index_length as i64,
                index_end: index_end as i64,
                data_begin: summary.total_data_length as i64,
                data_end: data_end as i64,
            });
            if let Err(err) = put {
                // keep streaming without the VIEW
                sink.report_error(err.with_context("failed to write VIEW file"));
                if let Some(path) = &self.opts.view_path {
                    let _ = std::fs::remove_file(path);
                }
                *view = None;
            }
        }

        summary.total_index_length = index_end;
        summary.total_data_length = next_data;

        let data = if self.opts.read_data {
            match self.read_payload(&index, data_rd, data_pos).await? {
                Polled::Ready(data) => Some(data),
                Polled::Cancelled => return Ok(Step::Done),
            }
        } else {
            None
        };

        if !self.opts.relative_to.as_os_str().is_empty() {
            index.file = relative_to_home(&self.opts.relative_to, &index.file);
        }
        index.update_host(&self.opts.index_host);

        if !sink.report_record(Record::new(index, data)).await {
            debug!(task = %self.task, "record dropped: consumer cancelled");
            return Ok(Step::Done);
        }
        summary.records += 1;

        if let Some(limit) = self.opts.limit {
            if sink.records_reported() >= limit {
                debug!(task = %self.task, limit, "stopped by limit");
                return Ok(Step::Done);
            }
        }
        Ok(Step::Next)
    }

    async fn read_payload(
        &self,
        index: &Index,
        data_rd: &mut Option<BufReader<File>>,
        data_pos: &mut u64,
    ) -> Result<Polled<Vec<u8>>> {
        let poller = self.poller();

        if data_rd.is_none() {
            match poller
                .open_with_wait(&self.opts.data_path)
                .await
                .map_err(|e| e.with_context("failed to open DATA file"))?
            {
                Polled::Ready(f) => *data_rd = Some(BufReader::with_capacity(BUF_SIZE, f)),
                Polled::Cancelled => return Ok(Polled::Cancelled),
            }
        }
        let Some(rd) = data_rd.as_mut() else {
            return Ok(Polled::Cancelled);
        };

        let data = match poller
            .read_exact(rd, index.length)
            .await
            .map_err(|e| PipelineError::Integrity(format!("failed to read DATA: {}", e)))?
        {
            Polled::Ready(data) => data,
            Polled::Cancelled => return Ok(Polled::Cancelled),
        };
        *data_pos += data.len() as u64;

        let delimiter = &self.opts.delimiter;
        if !delimiter.is_empty() {
            let found = match poller.read_exact(rd, delimiter.len() as u64).await.map_err(|e| {
                PipelineError::Integrity(format!("failed to read DATA delimiter: {}", e))
            })? {
                Polled::Ready(found) => found,
                Polled::Cancelled => return Ok(Polled::Cancelled),
            };

            if &found != delimiter {
                warn!(
                    task = %self.task,
                    expected = %hex::encode(delimiter),
                    received = %hex::encode(&found),
                    position = *data_pos,
                    "unexpected delimiter"
                );
                return Err(PipelineError::Integrity(format!(
                    "{:?} unexpected delimiter found at {}",
                    String::from_utf8_lossy(&found),
                    data_pos
                )));
            }
            *data_pos += found.len() as u64;
        }

        Ok(Polled::Ready(data))
    }
}
