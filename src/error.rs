//! Pipeline error kinds.
//!
//! Every failure surfaced by a task is one of these. The detail string is
//! free-form and is what ends up on the results channel.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad search or engine configuration. No task is started.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Input file is busy and the share mode did not allow skip or wait.
    #[error("failed to acquire lock: {0}")]
    Acquisition(String),

    #[error("failed to start backend: {0}")]
    Spawn(String),

    /// Backend exited with an error. Carries its combined output.
    #[error("backend failed: {0}")]
    Execution(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// DATA does not match INDEX (delimiter mismatch, truncated payload).
    #[error("{0}")]
    Integrity(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("cancelled by attempt limit: {0}")]
    AttemptLimit(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Short stable tag for logs and result streams.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Configuration(_) => "configuration",
            PipelineError::Acquisition(_) => "acquisition",
            PipelineError::Spawn(_) => "spawn",
            PipelineError::Execution(_) => "execution",
            PipelineError::Parse(_) => "parse",
            PipelineError::Integrity(_) => "integrity",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::AttemptLimit(_) => "attempt-limit",
            PipelineError::Io(_) => "io",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled(_))
    }

    /// Maps a core parse failure, keeping the whole context chain.
    pub fn parse(err: anyhow::Error) -> Self {
        PipelineError::Parse(format!("{:#}", err))
    }

    /// Maps a core option failure, keeping the whole context chain.
    pub fn config(err: anyhow::Error) -> Self {
        PipelineError::Configuration(format!("{:#}", err))
    }

    /// Prefixes the detail with what was being done. The kind is kept.
    pub fn with_context(self, what: &str) -> Self {
        let wrap = |detail: String| format!("{}: {}", what, detail);
        match self {
            PipelineError::Configuration(d) => PipelineError::Configuration(wrap(d)),
            PipelineError::Acquisition(d) => PipelineError::Acquisition(wrap(d)),
            PipelineError::Spawn(d) => PipelineError::Spawn(wrap(d)),
            PipelineError::Execution(d) => PipelineError::Execution(wrap(d)),
            PipelineError::Parse(d) => PipelineError::Parse(wrap(d)),
            PipelineError::Integrity(d) => PipelineError::Integrity(wrap(d)),
            PipelineError::Cancelled(d) => PipelineError::Cancelled(wrap(d)),
            PipelineError::AttemptLimit(d) => PipelineError::AttemptLimit(wrap(d)),
            PipelineError::Io(e) => {
                PipelineError::Io(std::io::Error::new(e.kind(), wrap(e.to_string())))
            }
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
