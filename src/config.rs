//! Engine configuration.
//!
//! Loaded once from a TOML file; every section and key is optional.
//!
//! ```toml
//! [backend]
//! ryftprim_exec = "/usr/bin/ryftprim"
//! ryftx_exec = "/usr/bin/ryftx"
//! kill_on_cancel = true
//!
//! [backend.tweaks.options]
//! "es.ryftx" = ["--rx-max-spawns", "4"]
//!
//! [backend.tweaks.router]
//! "es,fhs" = "ryftx"
//! default = "ryftprim"
//!
//! [paths]
//! mount_point = "/ryftone"
//! home_dir = "/test"
//!
//! [poll]
//! read_interval_ms = 50
//! read_limit = 100
//!
//! [aggregations]
//! optimized_tool = ["/usr/bin/ryft-server-aggs"]
//! concurrency = 4
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: BackendConfig,
    pub paths: PathsConfig,
    pub poll: PollConfig,
    pub processing: ProcessingConfig,
    pub locks: LocksConfig,
    pub aggregations: AggregationsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_ryftprim_exec")]
    pub ryftprim_exec: Option<PathBuf>,
    #[serde(default)]
    pub ryftx_exec: Option<PathBuf>,
    #[serde(default = "default_ryftprim_exec")]
    pub ryftpcre2_exec: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub legacy: bool,
    #[serde(default)]
    pub kill_on_cancel: bool,
    #[serde(default)]
    pub abs_path: bool,
    #[serde(default)]
    pub tweaks: TweaksConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            ryftprim_exec: default_ryftprim_exec(),
            ryftx_exec: None,
            ryftpcre2_exec: default_ryftprim_exec(),
            legacy: true,
            kill_on_cancel: false,
            abs_path: false,
            tweaks: TweaksConfig::default(),
        }
    }
}

fn default_ryftprim_exec() -> Option<PathBuf> {
    Some(PathBuf::from("/usr/bin/ryftprim"))
}

fn default_true() -> bool {
    true
}

/// Raw tweak tables. Parsed into [`crate::tweaks::Tweaks`] by the engine.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct TweaksConfig {
    #[serde(default)]
    pub options: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub router: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
    #[serde(default = "default_home_dir")]
    pub home_dir: String,
    #[serde(default)]
    pub instance: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            home_dir: default_home_dir(),
            instance: String::new(),
        }
    }
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/ryftone")
}

fn default_home_dir() -> String {
    "/".to_string()
}

impl PathsConfig {
    /// `mount_point/home_dir`, the root all search paths are relative to.
    pub fn home(&self) -> PathBuf {
        self.mount_point.join(self.home_dir.trim_start_matches('/'))
    }

    /// Directory for transient INDEX/DATA artifacts.
    pub fn instance_dir(&self) -> PathBuf {
        self.home().join(self.instance.trim_start_matches('/'))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub open_interval_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub read_interval_ms: u64,
    #[serde(default = "default_read_limit")]
    pub read_limit: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            open_interval_ms: default_poll_interval(),
            read_interval_ms: default_poll_interval(),
            read_limit: default_read_limit(),
        }
    }
}

fn default_poll_interval() -> u64 {
    50
}

fn default_read_limit() -> u32 {
    100
}

impl PollConfig {
    pub fn open_interval(&self) -> Duration {
        Duration::from_millis(self.open_interval_ms)
    }

    pub fn read_interval(&self) -> Duration {
        Duration::from_millis(self.read_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub keep_files: bool,
    #[serde(default)]
    pub minimize_latency: bool,
    #[serde(default)]
    pub index_host: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LocksConfig {
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_max_wait_ms() -> u64 {
    30_000
}

impl LocksConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AggregationsConfig {
    #[serde(default)]
    pub optimized_tool: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_agg_engine")]
    pub engine: String,
}

impl Default for AggregationsConfig {
    fn default() -> Self {
        Self {
            optimized_tool: Vec::new(),
            concurrency: default_concurrency(),
            engine: default_agg_engine(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_agg_engine() -> String {
    "auto".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Defaults for every key, without a file.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<EngineConfig> {
    let config: EngineConfig =
        toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.poll.read_limit == 0 {
        anyhow::bail!("poll.read_limit must be > 0");
    }
    if config.poll.read_interval_ms == 0 || config.poll.open_interval_ms == 0 {
        anyhow::bail!("poll intervals must be > 0");
    }
    if config.aggregations.concurrency == 0 {
        anyhow::bail!("aggregations.concurrency must be >= 1");
    }

    match config.aggregations.engine.as_str() {
        "" | "auto" | "native" | "optimized" => {}
        other => anyhow::bail!(
            "Unknown aggregation engine: '{}'. Must be native, optimized, or auto.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::minimal();
        assert_eq!(cfg.backend.ryftprim_exec, Some(PathBuf::from("/usr/bin/ryftprim")));
        assert!(cfg.backend.legacy);
        assert!(!cfg.backend.kill_on_cancel);
        assert_eq!(cfg.poll.read_interval(), Duration::from_millis(50));
        assert_eq!(cfg.poll.read_limit, 100);
        assert_eq!(cfg.locks.max_wait(), Duration::from_secs(30));
        assert_eq!(cfg.aggregations.engine, "auto");
        assert_eq!(cfg.paths.home(), PathBuf::from("/ryftone"));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.aggregations.concurrency, 1);
        assert_eq!(cfg.paths.mount_point, PathBuf::from("/ryftone"));
    }

    #[test]
    fn sections() {
        let cfg = parse_config(
            r#"
            [backend]
            ryftx_exec = "/usr/bin/ryftx"
            kill_on_cancel = true

            [backend.tweaks.options]
            "es.ryftx" = ["--rx-max-spawns", "4"]

            [backend.tweaks.router]
            "es,fhs" = "ryftx"

            [paths]
            mount_point = "/mnt"
            home_dir = "/user"
            instance = ".work"

            [processing]
            index_host = "node-1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.backend.ryftx_exec, Some(PathBuf::from("/usr/bin/ryftx")));
        assert!(cfg.backend.kill_on_cancel);
        assert_eq!(cfg.backend.tweaks.options["es.ryftx"].len(), 2);
        assert_eq!(cfg.backend.tweaks.router["es,fhs"], "ryftx");
        assert_eq!(cfg.paths.home(), PathBuf::from("/mnt/user"));
        assert_eq!(cfg.paths.instance_dir(), PathBuf::from("/mnt/user/.work"));
        assert_eq!(cfg.processing.index_host.as_deref(), Some("node-1"));
    }

    #[test]
    fn validation() {
        assert!(parse_config("[poll]\nread_limit = 0\n").is_err());
        assert!(parse_config("[aggregations]\nconcurrency = 0\n").is_err());
        let err = parse_config("[aggregations]\nengine = \"turbo\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown aggregation engine"));
    }

    #[test]
    fn example_config_parses() {
        let cfg = parse_config(include_str!("../config/primstream.example.toml")).unwrap();
        assert_eq!(cfg.backend.tweaks.router["pcre2"], "ryftpcre2");
        assert_eq!(cfg.aggregations.concurrency, 4);
        assert!(cfg.processing.minimize_latency);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("primstream.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        assert_eq!(load_config(&path).unwrap().logging.level, "debug");
        assert!(load_config(&dir.path().join("nope.toml")).is_err());
    }
}
