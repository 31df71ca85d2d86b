//! Results channel between a running task and its consumer.
//!
//! The producer side ([`ResultSink`]) is cheap to clone and is shared by
//! the results reader and the orchestrator. The consumer side
//! ([`SearchResult`]) yields records and errors as they arrive, then the
//! final statistics once the producer closes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use primstream_core::{Record, Stat};

use crate::error::PipelineError;

/// Records buffered before the producer blocks.
pub const RECORDS_CAPACITY: usize = 4096;

#[derive(Debug)]
pub enum ResultEvent {
    Record(Record),
    Error(PipelineError),
    /// Always the last event of a task, at most once.
    Stat(Stat),
}

struct Shared {
    records_tx: Mutex<Option<mpsc::Sender<Record>>>,
    errors_tx: Mutex<Option<mpsc::UnboundedSender<PipelineError>>>,
    stat: Mutex<Option<Stat>>,
    cancel: CancellationToken,
    records: AtomicU64,
    errors: AtomicU64,
}

#[derive(Clone)]
pub struct ResultSink {
    shared: Arc<Shared>,
}

pub struct SearchResult {
    shared: Arc<Shared>,
    records_rx: mpsc::Receiver<Record>,
    errors_rx: mpsc::UnboundedReceiver<PipelineError>,
    records_open: bool,
    errors_open: bool,
    stat_taken: bool,
}

/// Creates a connected producer/consumer pair.
pub fn channel() -> (ResultSink, SearchResult) {
    let (records_tx, records_rx) = mpsc::channel(RECORDS_CAPACITY);
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        records_tx: Mutex::new(Some(records_tx)),
        errors_tx: Mutex::new(Some(errors_tx)),
        stat: Mutex::new(None),
        cancel: CancellationToken::new(),
        records: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });
    let sink = ResultSink {
        shared: shared.clone(),
    };
    let result = SearchResult {
        shared,
        records_rx,
        errors_rx,
        records_open: true,
        errors_open: true,
        stat_taken: false,
    };
    (sink, result)
}

impl ResultSink {
    /// Sends one record, waiting for queue space.
    ///
    /// Returns `false` if the consumer cancelled or the channel is closed;
    /// the record is dropped in that case.
    pub async fn report_record(&self, rec: Record) -> bool {
        let tx = match self.shared.records_tx.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(tx) = tx else {
            return false;
        };

        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => false,
            sent = tx.send(rec) => {
                if sent.is_ok() {
                    self.shared.records.fetch_add(1, Ordering::AcqRel);
                }
                sent.is_ok()
            }
        }
    }

    /// Queues one error. Never blocks.
    pub fn report_error(&self, err: PipelineError) {
        if let Ok(guard) = self.shared.errors_tx.lock() {
            if let Some(tx) = guard.as_ref() {
                if tx.send(err).is_ok() {
                    self.shared.errors.fetch_add(1, Ordering::AcqRel);
                }
            }
        }
    }

    /// Stores the final statistics. Delivered after all records.
    pub fn report_stat(&self, stat: Stat) {
        if let Ok(mut slot) = self.shared.stat.lock() {
            *slot = Some(stat);
        }
    }

    /// Closes both queues. Safe to call more than once.
    pub fn close(&self) {
        if let Ok(mut tx) = self.shared.records_tx.lock() {
            tx.take();
        }
        if let Ok(mut tx) = self.shared.errors_tx.lock() {
            tx.take();
        }
    }

    pub fn records_reported(&self) -> u64 {
        self.shared.records.load(Ordering::Acquire)
    }

    pub fn errors_reported(&self) -> u64 {
        self.shared.errors.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl SearchResult {
    /// Next event, or `None` once the task is finished and drained.
    ///
    /// Errors are preferred over records when both are ready.
    pub async fn next(&mut self) -> Option<ResultEvent> {
        while self.records_open || self.errors_open {
            tokio::select! {
                biased;
                err = self.errors_rx.recv(), if self.errors_open => match err {
                    Some(err) => return Some(ResultEvent::Error(err)),
                    None => self.errors_open = false,
                },
                rec = self.records_rx.recv(), if self.records_open => match rec {
                    Some(rec) => return Some(ResultEvent::Record(rec)),
                    None => self.records_open = false,
                },
            }
        }

        if self.stat_taken {
            return None;
        }
        self.stat_taken = true;
        let stat = self.shared.stat.lock().ok().and_then(|mut slot| slot.take());
        stat.map(ResultEvent::Stat)
    }

    /// Asks the task to stop. Does not wait; keep calling [`next`](Self::next)
    /// to drain what was already produced.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    /// Handle that cancels this task from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Drains everything into vectors. Handy for tests and the CLI.
    pub async fn collect(mut self) -> (Vec<Record>, Vec<PipelineError>, Option<Stat>) {
        let mut records = Vec::new();
        let mut errors = Vec::new();
        let mut stat = None;
        while let Some(event) = self.next().await {
            match event {
                ResultEvent::Record(rec) => records.push(rec),
                ResultEvent::Error(err) => errors.push(err),
                ResultEvent::Stat(s) => stat = Some(s),
            }
        }
        (records, errors, stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primstream_core::Index;
    use std::time::Duration;

    fn rec(n: u64) -> Record {
        Record::new(Index::new("1.txt", n, 5, 0), Some(b"hello".to_vec()))
    }

    #[tokio::test]
    async fn records_errors_then_stat() {
        let (sink, result) = channel();
        assert!(sink.report_record(rec(1)).await);
        assert!(sink.report_record(rec(2)).await);
        sink.report_error(PipelineError::Parse("bad".into()));
        sink.report_stat(Stat::new(Some("node")));
        sink.close();
        sink.close();

        let (records, errors, stat) = result.collect().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].index.offset, 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(stat.unwrap().host.as_deref(), Some("node"));
        assert_eq!(sink.records_reported(), 2);
        assert_eq!(sink.errors_reported(), 1);
    }

    #[tokio::test]
    async fn closed_sink_drops_records() {
        let (sink, mut result) = channel();
        sink.close();
        assert!(!sink.report_record(rec(1)).await);
        assert!(result.next().await.is_none());
        assert!(result.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_unblocks_full_queue() {
        let (sink, result) = channel();
        for n in 0..RECORDS_CAPACITY as u64 {
            assert!(sink.report_record(rec(n)).await);
        }

        let token = result.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        // queue is full: only the cancel can release this call
        assert!(!sink.report_record(rec(0)).await);
        assert!(sink.is_cancelled());
    }
}
