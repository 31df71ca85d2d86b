//! Backend statistics.
//!
//! The backend prints a `Key: value` summary when it finishes. Four keys
//! are required:
//!
//! | Key | Example | Parsed as |
//! |-----|---------|-----------|
//! | `Duration` | `1250` | milliseconds |
//! | `Total Bytes` | `1.5 MB` | bytes (binary units) |
//! | `Matches` | `42` | count |
//! | `Fabric Data Rate` | `812.3 MB/sec` | MB/sec (`inf`, `nan` read as 0) |
//!
//! `Data Rate` is optional and computed from bytes and duration when absent.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Key under [`Stat::extra`] for final aggregation output.
pub const EXTRA_AGGREGATIONS: &str = "aggregations";
/// Key under [`Stat::extra`] for timing metrics.
pub const EXTRA_PERFORMANCE: &str = "performance";

const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    pub matches: u64,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub fabric_duration_ms: u64,
    pub data_rate_mbps: f64,
    pub fabric_data_rate_mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<Stat>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl Stat {
    /// Creates empty statistics, optionally tagged with a host.
    pub fn new(host: Option<&str>) -> Self {
        Self {
            host: host.filter(|h| !h.is_empty()).map(str::to_string),
            ..Default::default()
        }
    }

    /// Merges statistics from another node (cluster mode).
    ///
    /// Counts add up, durations take the maximum, rates add up.
    pub fn merge(&mut self, other: Stat) {
        self.matches += other.matches;
        self.total_bytes += other.total_bytes;
        self.duration_ms = self.duration_ms.max(other.duration_ms);
        self.fabric_duration_ms = self.fabric_duration_ms.max(other.fabric_duration_ms);
        self.data_rate_mbps += other.data_rate_mbps;
        self.fabric_data_rate_mbps += other.fabric_data_rate_mbps;
        self.details.push(other);
    }

    /// Combines statistics from a sequential backend call.
    ///
    /// Counts and durations add up; rates are recomputed in MB/sec.
    pub fn combine(&mut self, other: Stat) {
        self.matches += other.matches;
        self.total_bytes += other.total_bytes;
        self.duration_ms += other.duration_ms;
        self.fabric_duration_ms += other.fabric_duration_ms;

        let mb = self.total_bytes as f64 / MB;
        self.fabric_data_rate_mbps = if self.fabric_duration_ms > 0 {
            mb / (self.fabric_duration_ms as f64 / 1000.0)
        } else {
            0.0
        };
        self.data_rate_mbps = if self.duration_ms > 0 {
            mb / (self.duration_ms as f64 / 1000.0)
        } else {
            0.0
        };

        self.details.push(other);
    }

    /// Records one timing metric under `extra.performance`.
    pub fn add_perf(&mut self, name: &str, value: Value) {
        let perf = self
            .extra
            .entry(EXTRA_PERFORMANCE)
            .or_insert_with(|| Value::Object(Map::new()));
        if !perf.is_object() {
            *perf = Value::Object(Map::new());
        }
        if let Value::Object(map) = perf {
            map.insert(name.to_string(), value);
        }
    }
}

/// Parses the backend's combined output into [`Stat`].
pub fn parse_stat(output: &str) -> Result<Stat> {
    let mut fields: HashMap<&str, &str> = HashMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                fields.insert(key, value.trim());
            }
        }
    }

    let required = |key: &str| {
        fields
            .get(key)
            .copied()
            .ok_or_else(|| anyhow!("no {:?} found in backend output", key))
    };

    let mut stat = Stat::new(None);

    let duration = required("Duration")?;
    stat.duration_ms = parse_duration_ms(duration)
        .with_context(|| format!("failed to parse \"Duration\" stat from {:?}", duration))?;

    let total = required("Total Bytes")?;
    stat.total_bytes = parse_size(total)
        .with_context(|| format!("failed to parse \"Total Bytes\" stat from {:?}", total))?;

    let matches = required("Matches")?;
    stat.matches = matches
        .parse::<u64>()
        .with_context(|| format!("failed to parse \"Matches\" stat from {:?}", matches))?;

    let fabric = required("Fabric Data Rate")?;
    stat.fabric_data_rate_mbps = parse_data_rate(fabric).with_context(|| {
        format!("failed to parse \"Fabric Data Rate\" stat from {:?}", fabric)
    })?;

    let mb = stat.total_bytes as f64 / MB;
    if stat.fabric_data_rate_mbps > 0.0 {
        stat.fabric_duration_ms = (1000.0 * mb / stat.fabric_data_rate_mbps) as u64;
    }

    match fields.get("Data Rate") {
        Some(rate) => {
            stat.data_rate_mbps = parse_data_rate(rate)
                .with_context(|| format!("failed to parse \"Data Rate\" stat from {:?}", rate))?;
        }
        None if stat.duration_ms > 0 => {
            stat.data_rate_mbps = mb / (stat.duration_ms as f64 / 1000.0);
        }
        None => {}
    }

    Ok(stat)
}

fn parse_duration_ms(s: &str) -> Result<u64> {
    let s = s.trim();
    let s = s.strip_suffix("ms").unwrap_or(s).trim();
    Ok(s.parse::<u64>()?)
}

/// Parses a size like `1024`, `12 bytes`, `1.5 KB` or `2TB` into bytes.
fn parse_size(s: &str) -> Result<u64> {
    let lower = s.trim().to_ascii_lowercase();
    let units: [(&str, f64); 6] = [
        ("bytes", 1.0),
        ("kb", 1024.0),
        ("mb", MB),
        ("gb", MB * 1024.0),
        ("tb", MB * MB),
        ("b", 1.0),
    ];

    let (number, scale) = units
        .iter()
        .find_map(|(suffix, scale)| lower.strip_suffix(suffix).map(|rest| (rest, *scale)))
        .unwrap_or((lower.as_str(), 1.0));

    let number = number.trim();
    if let Ok(n) = number.parse::<u64>() {
        return Ok((n as f64 * scale) as u64);
    }
    let n: f64 = number.parse()?;
    if !n.is_finite() || n < 0.0 {
        bail!("bad size {:?}", s);
    }
    Ok((n * scale).round() as u64)
}

/// Parses a data rate into MB/sec. Non-finite values are reported as zero.
fn parse_data_rate(s: &str) -> Result<f64> {
    let lower = s.trim().to_ascii_lowercase();
    let units: [(&str, f64); 4] = [
        ("kb/sec", 1.0 / 1024.0),
        ("mb/sec", 1.0),
        ("gb/sec", 1024.0),
        ("tb/sec", 1024.0 * 1024.0),
    ];

    let (number, scale) = units
        .iter()
        .find_map(|(suffix, scale)| lower.strip_suffix(suffix).map(|rest| (rest, *scale)))
        .unwrap_or((lower.as_str(), 1.0));

    let rate: f64 = number.trim().parse()?;
    if !rate.is_finite() {
        return Ok(0.0);
    }
    Ok(rate * scale)
}
