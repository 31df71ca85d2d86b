//! Polling reads over files that are still being written.
//!
//! The backend creates INDEX and DATA some time after it starts and appends
//! to them in small chunks. Opening waits for the file to appear. Reading
//! treats end-of-file as "try again later". Idle attempts are only counted
//! once the backend has exited (the `finishing` flag), so a slow backend
//! never times the reader out but a truncated file eventually does.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PollConfig;
use crate::error::{PipelineError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Outcome of a poll that can be cancelled.
#[derive(Debug)]
pub enum Polled<T> {
    Ready(T),
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub open_interval: Duration,
    pub read_interval: Duration,
    pub read_limit: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::from(&PollConfig::default())
    }
}

impl From<&PollConfig> for PollSettings {
    fn from(cfg: &PollConfig) -> Self {
        Self {
            open_interval: cfg.open_interval(),
            read_interval: cfg.read_interval(),
            read_limit: cfg.read_limit.max(1),
        }
    }
}

impl PollSettings {
    /// Error reported when idle attempts run out.
    pub fn attempt_limit_error(&self) -> PipelineError {
        PipelineError::AttemptLimit(format!(
            "{:?} ({}x{:?})",
            self.read_interval * self.read_limit,
            self.read_limit,
            self.read_interval
        ))
    }
}

/// Borrowed view of the reader state a poll needs.
pub struct Poller<'a> {
    pub settings: &'a PollSettings,
    pub cancel: &'a CancellationToken,
    pub finishing: &'a AtomicBool,
}

impl Poller<'_> {
    fn attempt_step(&self) -> u32 {
        u32::from(self.finishing.load(Ordering::Acquire))
    }

    /// Sleeps one read interval. Returns `false` if cancelled meanwhile.
    pub async fn sleep(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.read_interval) => true,
            _ = self.cancel.cancelled() => false,
        }
    }

    /// Opens `path`, waiting for it to be created. Only "not found" is
    /// retried; there is no attempt limit here.
    pub async fn open_with_wait(&self, path: &Path) -> Result<Polled<File>> {
        loop {
            match File::open(path).await {
                Ok(f) => return Ok(Polled::Ready(f)),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.open_interval) => {}
                _ = self.cancel.cancelled() => {
                    debug!(path = %path.display(), "open file cancelled");
                    return Ok(Polled::Cancelled);
                }
            }
        }
    }

    /// Reads exactly `len` bytes, polling at end-of-file.
    ///
    /// `len` comes from INDEX and is not trusted: the result grows only as
    /// bytes arrive, never preallocated to `len`.
    pub async fn read_exact<R>(&self, rd: &mut R, len: u64) -> Result<Polled<Vec<u8>>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        if len == 0 {
            return Ok(Polled::Ready(buf));
        }
        let mut chunk = vec![0u8; len.min(READ_CHUNK as u64) as usize];

        let mut attempt = 0;
        while attempt < self.settings.read_limit {
            let want = (len - buf.len() as u64).min(chunk.len() as u64) as usize;
            let n = rd.read(&mut chunk[..want]).await?;
            if n > 0 {
                attempt = 0;
                buf.try_reserve(n).map_err(|e| {
                    PipelineError::Integrity(format!("no memory for {} bytes of DATA: {}", len, e))
                })?;
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() as u64 >= len {
                    return Ok(Polled::Ready(buf));
                }
                continue;
            }

            if !self.sleep().await {
                debug!(read = buf.len(), expected = len, "read file cancelled");
                return Ok(Polled::Cancelled);
            }
            attempt += self.attempt_step();
        }

        Err(self.settings.attempt_limit_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    fn fast() -> PollSettings {
        PollSettings {
            open_interval: Duration::from_millis(10),
            read_interval: Duration::from_millis(10),
            read_limit: 5,
        }
    }

    #[tokio::test]
    async fn open_waits_for_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("late.txt");
        let settings = fast();
        let cancel = CancellationToken::new();
        let finishing = AtomicBool::new(false);
        let poller = Poller {
            settings: &settings,
            cancel: &cancel,
            finishing: &finishing,
        };

        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                std::fs::write(path, b"ok").unwrap();
            })
        };

        let f = poller.open_with_wait(&path).await.unwrap();
        assert!(matches!(f, Polled::Ready(_)));
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn open_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = fast();
        let cancel = CancellationToken::new();
        let finishing = AtomicBool::new(false);
        let poller = Poller {
            settings: &settings,
            cancel: &cancel,
            finishing: &finishing,
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });
        let f = poller
            .open_with_wait(&dir.path().join("never.txt"))
            .await
            .unwrap();
        assert!(matches!(f, Polled::Cancelled));
    }

    #[tokio::test]
    async fn read_exact_waits_while_running() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        let mut out = std::fs::File::create(&path).unwrap();
        out.write_all(b"hel").unwrap();

        let settings = fast();
        let cancel = CancellationToken::new();
        let finishing = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            // longer than read_limit x read_interval: not counted while running
            tokio::time::sleep(Duration::from_millis(120)).await;
            out.write_all(b"lo").unwrap();
        });

        let poller = Poller {
            settings: &settings,
            cancel: &cancel,
            finishing: &finishing,
        };
        let mut f = File::open(&path).await.unwrap();
        match poller.read_exact(&mut f, 5).await.unwrap() {
            Polled::Ready(buf) => assert_eq!(buf, b"hello"),
            Polled::Cancelled => panic!("unexpected cancel"),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_exact_attempt_limit_after_finishing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"he").unwrap();

        let settings = fast();
        let cancel = CancellationToken::new();
        let finishing = AtomicBool::new(true);
        let poller = Poller {
            settings: &settings,
            cancel: &cancel,
            finishing: &finishing,
        };

        let mut f = File::open(&path).await.unwrap();
        let err = poller.read_exact(&mut f, 5).await.unwrap_err();
        assert_eq!(err.kind(), "attempt-limit");
        assert!(err.to_string().contains("cancelled by attempt limit"));
    }

    #[tokio::test]
    async fn read_exact_zero_length() {
        let settings = fast();
        let cancel = CancellationToken::new();
        let finishing = AtomicBool::new(true);
        let poller = Poller {
            settings: &settings,
            cancel: &cancel,
            finishing: &finishing,
        };
        let mut empty: &[u8] = b"";
        match poller.read_exact(&mut empty, 0).await.unwrap() {
            Polled::Ready(buf) => assert!(buf.is_empty()),
            Polled::Cancelled => panic!("unexpected cancel"),
        }
    }
}
