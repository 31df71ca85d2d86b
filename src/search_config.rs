//! Per-task search configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Everything one search task needs to know.
///
/// `width`: `-1` selects line mode, `0` disables surrounding, a positive
/// value is the character window. `limit`: `-1` (or `0`) means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub query: String,
    /// Input files, relative to the home directory.
    pub files: Vec<String>,
    /// Primitive tag: `es`, `fhs`, `feds`, `ds`, `ts`, `ns`, `cs`, `ipv4`,
    /// `ipv6`, `pcre2`, optionally with a `g/` prefix. Empty means generic.
    pub mode: String,
    pub width: i32,
    pub case: bool,
    pub dist: u32,
    pub reduce: bool,
    pub nodes: u32,
    pub limit: i64,
    pub offset: u64,

    pub keep_index_as: String,
    pub keep_data_as: String,
    pub keep_view_as: String,
    pub delimiter: String,
    /// Artifact lifetime in seconds. Zero means no expiry.
    pub lifetime_secs: u64,

    /// Post-processing rules, applied by the presentation layer.
    pub transforms: Vec<String>,

    pub aggregations: Option<Value>,
    /// Payload format used to parse records for aggregations.
    pub data_format: String,

    pub report_index: bool,
    pub report_data: bool,
    pub is_record: bool,
    pub skip_missing: bool,

    pub share_mode: String,

    /// Backend name (`ryftprim`, `ryftx`, `ryftpcre2`); empty selects one.
    pub backend: String,
    /// Extra backend arguments. Override the configured tweaks.
    pub backend_options: Vec<String>,
    /// Tweak key prefix, e.g. `high` in `high.ryftx.es`.
    pub backend_mode: String,

    pub performance: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            files: Vec::new(),
            mode: String::new(),
            width: 0,
            case: true,
            dist: 0,
            reduce: false,
            nodes: 0,
            limit: -1,
            offset: 0,
            keep_index_as: String::new(),
            keep_data_as: String::new(),
            keep_view_as: String::new(),
            delimiter: String::new(),
            lifetime_secs: 0,
            transforms: Vec::new(),
            aggregations: None,
            data_format: "json".to_string(),
            report_index: true,
            report_data: true,
            is_record: false,
            skip_missing: false,
            share_mode: String::new(),
            backend: String::new(),
            backend_options: Vec::new(),
            backend_mode: String::new(),
            performance: false,
        }
    }
}

impl SearchConfig {
    pub fn new(query: impl Into<String>, files: &[&str]) -> Self {
        Self {
            query: query.into(),
            files: files.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: &str) -> Self {
        self.mode = mode.to_string();
        self
    }

    pub fn with_delimiter(mut self, delimiter: &str) -> Self {
        self.delimiter = delimiter.to_string();
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_aggregations(mut self, aggs: Value) -> Self {
        self.aggregations = Some(aggs);
        self
    }

    /// Count-only: no records are reported at all.
    pub fn count_only(mut self) -> Self {
        self.report_index = false;
        self.report_data = false;
        self
    }

    pub fn has_limit(&self) -> bool {
        self.limit > 0
    }

    /// Checks the option invariants. `home` is the absolute home directory.
    pub fn validate(&self, home: &Path) -> Result<()> {
        if self.report_data && !self.report_index {
            return Err(PipelineError::Configuration(
                "DATA reporting requires INDEX reporting".into(),
            ));
        }
        self.check_relative_to_home(home)
    }

    /// Every input and output path must stay under `home`.
    pub fn check_relative_to_home(&self, home: &Path) -> Result<()> {
        for path in &self.files {
            if !is_relative_to_home(home, path) {
                return Err(PipelineError::Configuration(format!(
                    "path {:?} is not relative to home",
                    path
                )));
            }
        }
        for (what, path) in [
            ("index", &self.keep_index_as),
            ("data", &self.keep_data_as),
            ("view", &self.keep_view_as),
        ] {
            if !path.is_empty() && !is_relative_to_home(home, path) {
                return Err(PipelineError::Configuration(format!(
                    "{} {:?} is not relative to home",
                    what, path
                )));
            }
        }
        Ok(())
    }
}

/// Joins `path` onto `home` lexically and checks the result stays inside.
pub fn is_relative_to_home(home: &Path, path: &str) -> bool {
    let joined = home.join(path.trim_start_matches('/'));
    let normalized = normalize(&joined);
    normalized.starts_with(normalize(home))
}

/// Lexical normalization: resolves `.` and `..` without touching the disk.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Makes `path` relative to `home` when possible, otherwise keeps it.
pub fn relative_to_home(home: &Path, path: &str) -> String {
    if home.as_os_str().is_empty() {
        return path.to_string();
    }
    match Path::new(path).strip_prefix(home) {
        Ok(rel) => rel.to_string_lossy().into_owned(),
        Err(_) => path.to_string(),
    }
}

impl fmt::Display for SearchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut props = Vec::new();
        if !self.query.is_empty() {
            props.push(format!("query:{}", self.query));
        }
        if !self.files.is_empty() {
            props.push(format!("files:{:?}", self.files));
        }
        if !self.mode.is_empty() {
            props.push(format!("mode:{:?}", self.mode));
        }
        if self.width != 0 {
            props.push(format!("width:{}", self.width));
        }
        if self.dist != 0 {
            props.push(format!("dist:{}", self.dist));
        }
        props.push(format!("cs:{}", self.case));
        if self.nodes != 0 {
            props.push(format!("nodes:{}", self.nodes));
        }
        if self.offset != 0 {
            props.push(format!("offset:{}", self.offset));
        }
        if self.has_limit() {
            props.push(format!("limit:{}", self.limit));
        }
        if !self.keep_data_as.is_empty() {
            props.push(format!("data:{:?}", self.keep_data_as));
        }
        if !self.keep_index_as.is_empty() {
            props.push(format!("index:{:?}", self.keep_index_as));
        }
        if !self.keep_view_as.is_empty() {
            props.push(format!("view:{:?}", self.keep_view_as));
        }
        if !self.delimiter.is_empty() {
            props.push(format!("delim:#{}", hex::encode(&self.delimiter)));
        }
        if !self.backend.is_empty() {
            props.push(format!("backend:{:?}", self.backend));
        }
        if !self.backend_options.is_empty() {
            props.push(format!("backend-options:{:?}", self.backend_options));
        }
        if self.report_index {
            props.push("I".to_string());
        }
        if self.report_data {
            props.push("D".to_string());
        }
        if self.performance {
            props.push("P".to_string());
        }
        write!(f, "Config{{{}}}", props.join(", "))
    }
}
