//! Backend tweaks: extra command-line options and primitive routing.
//!
//! Option keys are dotted combinations of `mode`, `backend` and
//! `primitive`, e.g. `high.ryftx.es`. The most specific key wins:
//!
//! 1. `mode.backend.primitive`
//! 2. `mode.primitive`
//! 3. `mode.backend`
//! 4. `mode`
//! 5. `backend.primitive`
//! 6. `primitive`
//! 7. `backend`
//! 8. `default`
//!
//! Router keys list primitives separated by whitespace or any of `,;:`.

use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::command::Backend;
use crate::config::TweaksConfig;
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tweaks {
    options: BTreeMap<String, Vec<String>>,
    router: BTreeMap<String, Backend>,
}

impl Tweaks {
    pub fn from_config(cfg: &TweaksConfig) -> Result<Self> {
        let mut router = BTreeMap::new();
        for (keys, tool) in &cfg.router {
            let backend: Backend = tool.parse().map_err(|e: PipelineError| {
                PipelineError::Configuration(format!(
                    "bad backend tweak router value for {:?}: {}",
                    keys, e
                ))
            })?;
            for key in keys
                .split(|c: char| c.is_whitespace() || ",;:".contains(c))
                .map(str::trim)
                .filter(|k| !k.is_empty())
            {
                router.insert(key.to_string(), backend);
            }
        }

        Ok(Self {
            options: cfg.options.clone(),
            router,
        })
    }

    /// Extra backend options, most specific key first.
    pub fn options_for(&self, mode: &str, backend: &str, primitive: &str) -> Option<&[String]> {
        let candidates: [&[&str]; 7] = [
            &[mode, backend, primitive],
            &[mode, primitive],
            &[mode, backend],
            &[mode],
            &[backend, primitive],
            &[primitive],
            &[backend],
        ];

        candidates.iter().find_map(|parts| {
            let key = parts.join(".");
            let key = key.trim_start_matches('.').trim_end_matches('.');
            let key = if key.is_empty() { "default" } else { key };
            self.options.get(key).map(Vec::as_slice)
        })
    }

    /// Sets (or with `None` removes) options for a key combination.
    pub fn set_options(
        &mut self,
        mode: &str,
        backend: &str,
        primitive: &str,
        opts: Option<Vec<String>>,
    ) {
        let key = [mode, backend, primitive]
            .iter()
            .filter(|p| !p.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(".");
        let key = if key.is_empty() { "default".to_string() } else { key };
        match opts {
            Some(opts) => {
                self.options.insert(key, opts);
            }
            None => {
                self.options.remove(&key);
            }
        }
    }

    /// Backend routed for `primitive`, falling back to the `default` route.
    pub fn backend_for(&self, primitive: &str) -> Option<Backend> {
        self.router
            .get(primitive)
            .or_else(|| self.router.get("default"))
            .copied()
    }

    pub fn to_json(&self) -> Value {
        let router: BTreeMap<&str, &str> = self
            .router
            .iter()
            .map(|(k, v)| (k.as_str(), v.name()))
            .collect();
        json!({
            "options": self.options,
            "router": router,
        })
    }
}
