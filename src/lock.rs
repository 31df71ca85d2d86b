//! Named read/write locks on input files.
//!
//! Readers share a name; a read lock fails while any writer holds it, and
//! a write lock fails while any reader holds it. Writers do not exclude each
//! other, so many uploads (or many searches) can touch the same file as long
//! as the two categories never overlap.
//!
//! Waiting is done on a per-item signal that fires when the item is deleted
//! (both reference counts drop to zero). The registry mutex is only held for
//! lookups and refcount updates.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

/// Default upper bound for `wait-up-to-D`.
pub const MAX_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock acquisition policy for busy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// Do not lock at all.
    Ignore,
    /// Fail immediately; the caller skips the busy file.
    SkipBusy,
    /// Wait up to the duration. Zero means fail immediately.
    Wait(Duration),
}

impl ShareMode {
    /// Parses `ignore`, `skip`, `skip-busy`, `""`, `wait-up-to-<d>` or
    /// `wait-<d>`. Durations use `ns`, `us`, `ms`, `s`, `m`, `h` units.
    pub fn parse(mode: &str, max_wait: Duration) -> Result<Self> {
        let sm = mode.trim().to_ascii_lowercase();
        match sm.as_str() {
            "ignore" | "force-ignore" => return Ok(ShareMode::Ignore),
            "skip" | "skip-busy" => return Ok(ShareMode::SkipBusy),
            "" => return Ok(ShareMode::Wait(Duration::ZERO)),
            _ => {}
        }

        let sm = sm.strip_prefix("wait-up-to-").unwrap_or(&sm);
        let sm = sm.strip_prefix("wait-").unwrap_or(sm);
        let bad = |detail: String| PipelineError::Configuration(format!("bad timeout: {}", detail));

        if sm.starts_with('-') {
            return Err(bad(format!("cannot be negative, found {}", sm)));
        }
        let d = parse_duration(sm).map_err(bad)?;
        if d > max_wait {
            return Err(bad(format!(
                "cannot be greater than {:?}, found {:?}",
                max_wait, d
            )));
        }
        Ok(ShareMode::Wait(d))
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, ShareMode::Ignore)
    }

    pub fn is_skip_busy(&self) -> bool {
        matches!(self, ShareMode::SkipBusy)
    }

    pub fn timeout(&self) -> Duration {
        match self {
            ShareMode::Wait(d) => *d,
            _ => Duration::ZERO,
        }
    }
}

impl fmt::Display for ShareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareMode::Ignore => f.write_str("ignore"),
            ShareMode::SkipBusy => f.write_str("skip-busy"),
            ShareMode::Wait(d) if d.is_zero() => f.write_str(""),
            ShareMode::Wait(d) => write!(f, "wait-up-to-{}ms", d.as_millis()),
        }
    }
}

/// Parses a duration such as `10s`, `1.5m`, `1h30m` or `250ms`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("invalid duration \"\"".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {:?}", s));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration {:?}", s))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("missing unit in duration {:?}", s)),
            unit => return Err(format!("unknown unit {:?} in duration {:?}", unit, s)),
        };
        rest = &rest[unit_len..];
        total += value * scale;
    }
    Ok(Duration::from_secs_f64(total))
}

#[derive(Debug)]
struct LockItem {
    read_refs: usize,
    write_refs: usize,
    released: CancellationToken,
}

impl LockItem {
    fn new() -> Self {
        Self {
            read_refs: 0,
            write_refs: 0,
            released: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Registry of named locks.
#[derive(Debug, Default)]
pub struct LockManager {
    items: Mutex<HashMap<String, LockItem>>,
}

static GLOBAL: Lazy<Arc<LockManager>> = Lazy::new(|| Arc::new(LockManager::default()));

/// The process-wide lock registry.
pub fn global() -> Arc<LockManager> {
    GLOBAL.clone()
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, LockItem>> {
        // the map is always left consistent, so a poisoned guard is usable
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Takes a shared read lock. Returns `false` if the name stays busy or
    /// `cancel` fires while waiting.
    pub async fn lock_read(&self, name: &str, mode: ShareMode, cancel: &CancellationToken) -> bool {
        self.lock(name, mode, Access::Read, cancel).await
    }

    pub async fn lock_write(
        &self,
        name: &str,
        mode: ShareMode,
        cancel: &CancellationToken,
    ) -> bool {
        self.lock(name, mode, Access::Write, cancel).await
    }

    pub fn unlock_read(&self, name: &str) {
        self.unlock(name, Access::Read)
    }

    pub fn unlock_write(&self, name: &str) {
        self.unlock(name, Access::Write)
    }

    /// Number of (readers, writers) currently holding `name`.
    pub fn refs(&self, name: &str) -> (usize, usize) {
        self.items()
            .get(name)
            .map(|item| (item.read_refs, item.write_refs))
            .unwrap_or((0, 0))
    }

    async fn lock(
        &self,
        name: &str,
        mode: ShareMode,
        access: Access,
        cancel: &CancellationToken,
    ) -> bool {
        if mode.is_ignore() {
            return true;
        }

        let deadline = Instant::now() + mode.timeout();
        loop {
            let released = match self.try_lock(name, access) {
                Ok(()) => return true,
                Err(released) => released,
            };

            let now = Instant::now();
            if mode.is_skip_busy() || now >= deadline {
                warn!(lock = %name, ?access, "name is busy");
                return false;
            }

            debug!(lock = %name, ?access, remaining = ?(deadline - now), "waiting for lock");
            tokio::select! {
                _ = released.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(lock = %name, ?access, "timed out waiting for lock");
                    return false;
                }
                _ = cancel.cancelled() => {
                    debug!(lock = %name, ?access, "lock wait cancelled");
                    return false;
                }
            }
        }
    }

    /// Takes the lock, or returns the signal to wait on.
    fn try_lock(&self, name: &str, access: Access) -> std::result::Result<(), CancellationToken> {
        let mut items = self.items();
        let item = items.entry(name.to_string()).or_insert_with(LockItem::new);
        match access {
            Access::Read if item.write_refs > 0 => Err(item.released.clone()),
            Access::Write if item.read_refs > 0 => Err(item.released.clone()),
            Access::Read => {
                item.read_refs += 1;
                info!(lock = %name, readers = item.read_refs, "read lock acquired");
                Ok(())
            }
            Access::Write => {
                item.write_refs += 1;
                info!(lock = %name, writers = item.write_refs, "write lock acquired");
                Ok(())
            }
        }
    }

    fn unlock(&self, name: &str, access: Access) {
        let mut items = self.items();
        let Some(item) = items.get_mut(name) else {
            return;
        };
        match access {
            Access::Read => {
                item.read_refs = item.read_refs.saturating_sub(1);
                info!(lock = %name, readers = item.read_refs, "read lock released");
            }
            Access::Write => {
                item.write_refs = item.write_refs.saturating_sub(1);
                info!(lock = %name, writers = item.write_refs, "write lock released");
            }
        }
        if item.read_refs + item.write_refs == 0 {
            if let Some(item) = items.remove(name) {
                item.released.cancel();
            }
            debug!(lock = %name, "lock deleted (no references)");
        }
    }
}
