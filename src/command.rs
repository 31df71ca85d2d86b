//! Backend selection and command-line assembly.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::{BackendConfig, PathsConfig};
use crate::error::{PipelineError, Result};
use crate::search_config::SearchConfig;
use crate::tweaks::Tweaks;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backend {
    Ryftprim,
    Ryftx,
    Ryftpcre2,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Ryftprim => "ryftprim",
            Backend::Ryftx => "ryftx",
            Backend::Ryftpcre2 => "ryftpcre2",
        }
    }

    /// Configured executable for this backend, if any.
    pub fn exec_path<'a>(&self, cfg: &'a BackendConfig) -> Option<&'a Path> {
        match self {
            Backend::Ryftprim => cfg.ryftprim_exec.as_deref(),
            Backend::Ryftx => cfg.ryftx_exec.as_deref(),
            Backend::Ryftpcre2 => cfg.ryftpcre2_exec.as_deref(),
        }
    }
}

impl FromStr for Backend {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ryftprim" | "prim" | "1" => Ok(Backend::Ryftprim),
            "ryftx" | "x" => Ok(Backend::Ryftx),
            "ryftpcre2" | "pcre2" | "regexp" | "regex" | "re" => Ok(Backend::Ryftpcre2),
            other => Err(PipelineError::Configuration(format!(
                "{:?} is unknown backend tool",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const PRIMITIVES: &[&str] = &[
    "es", "fhs", "feds", "ds", "ts", "ns", "cs", "ipv4", "ipv6", "pcre2",
];

/// Backend primitive for a search mode. `g/` prefixes are accepted, an
/// empty mode is the generic primitive `g`, and a Hamming search without
/// distance degrades to exact search.
pub fn primitive(mode: &str, dist: u32) -> Result<&'static str> {
    let mode = mode.trim().to_ascii_lowercase();
    let mode = mode.strip_prefix("g/").unwrap_or(&mode);
    if mode.is_empty() || mode == "g" {
        return Ok("g");
    }
    match PRIMITIVES.iter().find(|p| **p == mode) {
        Some(&"fhs") if dist == 0 => Ok("es"),
        Some(p) => Ok(*p),
        None => Err(PipelineError::Configuration(format!(
            "{:?} is unknown search mode",
            mode
        ))),
    }
}

/// Picks the backend: explicit choice, then the tweaks router, then by
/// primitive when both main binaries are configured.
pub fn select_backend(
    cfg: &BackendConfig,
    tweaks: &Tweaks,
    search: &SearchConfig,
    primitive: &str,
) -> Result<(Backend, PathBuf)> {
    let chosen = if !search.backend.trim().is_empty() {
        Some(search.backend.parse::<Backend>()?)
    } else {
        tweaks.backend_for(primitive)
    };

    let backend = match chosen {
        Some(backend) => backend,
        None if cfg.ryftprim_exec.is_some() && cfg.ryftx_exec.is_some() => match primitive {
            "es" | "ds" | "ts" | "ns" | "cs" | "ipv4" | "ipv6" => Backend::Ryftx,
            "fhs" if search.dist <= 1 => Backend::Ryftx,
            "fhs" | "feds" => Backend::Ryftprim,
            "pcre2" => Backend::Ryftpcre2,
            _ => Backend::Ryftprim,
        },
        None if cfg.ryftprim_exec.is_some() => Backend::Ryftprim,
        None if cfg.ryftx_exec.is_some() => Backend::Ryftx,
        None => {
            return Err(PipelineError::Configuration(
                "no backend executable configured".into(),
            ))
        }
    };

    match backend.exec_path(cfg) {
        Some(path) => Ok((backend, path.to_path_buf())),
        None => Err(PipelineError::Configuration(format!(
            "{} backend is not configured",
            backend
        ))),
    }
}

/// Plain queries are hex-encoded into a `RAW_TEXT CONTAINS` expression so
/// no escaping is needed.
pub fn prepare_query(query: &str) -> String {
    if query.contains("RAW_TEXT") || query.contains("RECORD") {
        query.to_string()
    } else {
        format!("(RAW_TEXT CONTAINS {})", hex::encode(query))
    }
}

/// `\xNN` escape form of a delimiter.
pub fn escape_delimiter(delimiter: &[u8]) -> String {
    delimiter.iter().map(|b| format!("\\x{:02x}", b)).collect()
}

/// A fully assembled backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub backend: Backend,
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Output artifact names, relative to the mount point.
#[derive(Debug, Clone)]
pub struct Artifacts {
    pub index: String,
    pub data: String,
}

/// Assembles the backend command line.
///
/// Paths are passed relative to the mount point (the process runs there)
/// unless `abs_path` is configured for input files.
pub fn build_command(
    backend_cfg: &BackendConfig,
    paths: &PathsConfig,
    tweaks: &Tweaks,
    search: &SearchConfig,
    files: &[String],
    artifacts: &Artifacts,
) -> Result<CommandLine> {
    let prim = primitive(&search.mode, search.dist)?;
    let (backend, program) = select_backend(backend_cfg, tweaks, search, prim)?;

    let mut args: Vec<String> = vec!["-p".into(), prim.into()];
    args.push("-q".into());
    args.push(prepare_query(&search.query));

    if search.width < 0 {
        args.push("--rline".into());
    } else if search.width > 0 {
        args.push("-w".into());
        args.push(search.width.to_string());
    }
    if search.dist > 0 && prim != "es" {
        args.push("-d".into());
        args.push(search.dist.to_string());
    }
    if !search.case {
        args.push("-i".into());
    }
    if search.reduce && matches!(prim, "es" | "fhs" | "feds") {
        args.push("--reduce".into());
    }

    let home = Path::new(paths.home_dir.trim_start_matches('/'));
    for file in files {
        let rel = home.join(file.trim_start_matches('/'));
        let path = if backend_cfg.abs_path {
            paths.mount_point.join(rel)
        } else {
            rel
        };
        args.push("-f".into());
        args.push(path.to_string_lossy().into_owned());
    }

    if search.delimiter.is_empty() {
        args.push("-en".into());
    } else {
        args.push("-e".into());
        args.push(escape_delimiter(search.delimiter.as_bytes()));
    }

    args.push("-v".into());
    if backend_cfg.legacy {
        args.push("--legacy".into());
    }
    if search.nodes > 0 {
        args.push("-n".into());
        args.push(search.nodes.to_string());
    }

    args.push("-oi".into());
    args.push(artifacts.index.clone());
    args.push("-od".into());
    args.push(artifacts.data.clone());

    if !search.backend_options.is_empty() {
        args.extend(search.backend_options.iter().cloned());
    } else if let Some(extra) = tweaks.options_for(&search.backend_mode, backend.name(), prim) {
        args.extend(extra.iter().cloned());
    }

    Ok(CommandLine {
        backend,
        program,
        args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TweaksConfig;

    fn both() -> BackendConfig {
        BackendConfig {
            ryftx_exec: Some(PathBuf::from("/usr/bin/ryftx")),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn primitives() {
        assert_eq!(primitive("", 0).unwrap(), "g");
        assert_eq!(primitive("g/es", 0).unwrap(), "es");
        assert_eq!(primitive("fhs", 0).unwrap(), "es");
        assert_eq!(primitive("FHS", 2).unwrap(), "fhs");
        assert_eq!(primitive("ipv6", 0).unwrap(), "ipv6");
        assert!(primitive("quantum", 0).is_err());
    }

    #[test]
    fn auto_backend() {
        let cfg = both();
        let t = Tweaks::default();
        let pick = |mode: &str, dist: u32| {
            let mut s = SearchConfig::new("x", &["1.txt"]).with_mode(mode);
            s.dist = dist;
            let p = primitive(mode, dist).unwrap();
            select_backend(&cfg, &t, &s, p).unwrap().0
        };
        assert_eq!(pick("es", 0), Backend::Ryftx);
        assert_eq!(pick("fhs", 1), Backend::Ryftx);
        assert_eq!(pick("fhs", 2), Backend::Ryftprim);
        assert_eq!(pick("feds", 1), Backend::Ryftprim);
        assert_eq!(pick("pcre2", 0), Backend::Ryftpcre2);
        assert_eq!(pick("", 0), Backend::Ryftprim);

        // only ryftprim configured
        let prim_only = BackendConfig::default();
        let s = SearchConfig::new("x", &[]).with_mode("es");
        assert_eq!(
            select_backend(&prim_only, &t, &s, "es").unwrap().0,
            Backend::Ryftprim
        );
    }

    #[test]
    fn explicit_and_routed_backend() {
        let cfg = both();
        let mut tc = TweaksConfig::default();
        tc.router.insert("es".into(), "ryftprim".into());
        let t = Tweaks::from_config(&tc).unwrap();

        let s = SearchConfig::new("x", &[]).with_mode("es");
        assert_eq!(select_backend(&cfg, &t, &s, "es").unwrap().0, Backend::Ryftprim);

        let mut s = s;
        s.backend = "x".into();
        assert_eq!(select_backend(&cfg, &t, &s, "es").unwrap().0, Backend::Ryftx);

        s.backend = "hyperdrive".into();
        assert_eq!(select_backend(&cfg, &t, &s, "es").unwrap_err().kind(), "configuration");

        let no_x = BackendConfig::default();
        s.backend = "ryftx".into();
        assert!(select_backend(&no_x, &t, &s, "es").is_err());
    }

    #[test]
    fn queries() {
        assert_eq!(prepare_query("hello"), "(RAW_TEXT CONTAINS 68656c6c6f)");
        assert_eq!(
            prepare_query("(RAW_TEXT CONTAINS \"a\")"),
            "(RAW_TEXT CONTAINS \"a\")"
        );
        assert_eq!(escape_delimiter(b"\r\n\x0c"), "\\x0d\\x0a\\x0c");
    }

    #[test]
    fn command_line() {
        let cfg = BackendConfig::default();
        let mut paths = PathsConfig::default();
        paths.home_dir = "/test".into();

        let mut tc = TweaksConfig::default();
        tc.options.insert("ryftprim".into(), vec!["--rx-threads".into(), "4".into()]);
        let tweaks = Tweaks::from_config(&tc).unwrap();

        let mut search = SearchConfig::new("hello", &["1.txt"])
            .with_mode("fhs")
            .with_delimiter("\r\n");
        search.dist = 2;
        search.width = 10;
        search.case = false;
        search.nodes = 3;

        let artifacts = Artifacts {
            index: "test/.idx-01.txt".into(),
            data: "test/.dat-01.bin".into(),
        };
        let cmd = build_command(&cfg, &paths, &tweaks, &search, &search.files, &artifacts).unwrap();
        assert_eq!(cmd.backend, Backend::Ryftprim);
        assert_eq!(cmd.program, PathBuf::from("/usr/bin/ryftprim"));
        assert_eq!(
            cmd.args,
            [
                "-p", "fhs", "-q", "(RAW_TEXT CONTAINS 68656c6c6f)", "-w", "10", "-d", "2",
                "-i", "-f", "test/1.txt", "-e", "\\x0d\\x0a", "-v", "--legacy", "-n", "3",
                "-oi", "test/.idx-01.txt", "-od", "test/.dat-01.bin", "--rx-threads", "4",
            ]
        );

        // explicit options win over tweaks, line mode, null delimiter
        search.backend_options = vec!["--custom".into()];
        search.width = -1;
        search.delimiter.clear();
        let cmd = build_command(&cfg, &paths, &tweaks, &search, &[], &artifacts).unwrap();
        assert!(cmd.args.contains(&"--rline".to_string()));
        assert!(cmd.args.contains(&"-en".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("--custom"));
        assert!(!cmd.args.contains(&"--rx-threads".to_string()));
    }

    #[test]
    fn absolute_file_paths() {
        let mut cfg = BackendConfig::default();
        cfg.abs_path = true;
        let paths = PathsConfig::default();
        let search = SearchConfig::new("x", &["/dir/2.txt"]);
        let artifacts = Artifacts {
            index: ".idx.txt".into(),
            data: ".dat.bin".into(),
        };
        let cmd = build_command(&cfg, &paths, &Tweaks::default(), &search, &search.files, &artifacts)
            .unwrap();
        let pos = cmd.args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(cmd.args[pos + 1], "/ryftone/dir/2.txt");
    }
}
