//! Numeric statistics engine shared by `sum`, `min`, `max`, `avg`,
//! `value_count`, `stats` and `extended_stats`.

use anyhow::{anyhow, Result};
use serde_json::{json, Map, Value};

use super::Engine;
use crate::access::{as_f64, as_string, FieldPath, Lookup};

pub const STAT_SUM: u8 = 1 << 0;
pub const STAT_SUM2: u8 = 1 << 1;
pub const STAT_MIN: u8 = 1 << 2;
pub const STAT_MAX: u8 = 1 << 3;

#[derive(Debug, Clone, PartialEq)]
pub struct StatEngine {
    field: FieldPath,
    missing: Option<Value>,
    flags: u8,

    pub count: u64,
    pub sum: f64,
    pub sum2: f64,
    pub min: f64,
    pub max: f64,
}

impl StatEngine {
    pub fn new(field: FieldPath, missing: Option<Value>, flags: u8) -> Self {
        Self {
            field,
            missing,
            flags,
            count: 0,
            sum: 0.0,
            sum2: 0.0,
            min: 0.0,
            max: 0.0,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn missing(&self) -> Option<&Value> {
        self.missing.as_ref()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Widens the set of maintained quantities. Used when two functions
    /// share one engine.
    pub fn join_flags(&mut self, flags: u8) {
        self.flags |= flags;
    }

    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Adds one numeric value.
    pub fn add_value(&mut self, val: f64) {
        if self.has(STAT_SUM) {
            self.sum += val;
        }
        if self.has(STAT_SUM2) {
            self.sum2 += val * val;
        }
        if self.has(STAT_MIN) && (self.count == 0 || val < self.min) {
            self.min = val;
        }
        if self.has(STAT_MAX) && (self.count == 0 || val > self.max) {
            self.max = val;
        }
        self.count += 1;
    }

    /// Merges partial state from a worker or an optimized tool.
    fn merge_parts(&mut self, count: u64, sum: f64, sum2: f64, min: f64, max: f64) {
        if count == 0 {
            return;
        }
        if self.has(STAT_SUM) {
            self.sum += sum;
        }
        if self.has(STAT_SUM2) {
            self.sum2 += sum2;
        }
        if self.has(STAT_MIN) && (self.count == 0 || min < self.min) {
            self.min = min;
        }
        if self.has(STAT_MAX) && (self.count == 0 || max > self.max) {
            self.max = max;
        }
        self.count += count;
    }

    pub fn merge_engine(&mut self, other: &StatEngine) {
        self.merge_parts(other.count, other.sum, other.sum2, other.min, other.max);
    }

    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

fn number_field(map: &Map<String, Value>, key: &str) -> Result<f64> {
    let value = map
        .get(key)
        .ok_or_else(|| anyhow!("no {:?} field in intermediate stat", key))?;
    as_f64(value)
}

impl Engine for StatEngine {
    fn name(&self) -> String {
        match &self.missing {
            Some(missing) => format!(
                "stat.{}/{}",
                self.field,
                as_string(missing).unwrap_or_else(|_| missing.to_string())
            ),
            None => format!("stat.{}", self.field),
        }
    }

    fn add(&mut self, data: &Value) -> Result<()> {
        let value = match self.field.get(data)? {
            Lookup::Found(Value::Null) | Lookup::Missing => match &self.missing {
                Some(missing) => missing.clone(),
                None => return Ok(()),
            },
            Lookup::Found(v) => v.clone(),
        };
        let val = as_f64(&value)?;
        self.add_value(val);
        Ok(())
    }

    fn merge_json(&mut self, data: &Value) -> Result<()> {
        let map = data
            .as_object()
            .ok_or_else(|| anyhow!("no valid stat data"))?;

        let count = match map.get("count") {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| anyhow!("bad stat count: {}", n))?,
            Some(other) => as_f64(other)? as u64,
            None => return Err(anyhow!("no \"count\" field in intermediate stat")),
        };
        if count == 0 {
            return Ok(());
        }

        let sum = if self.has(STAT_SUM) { number_field(map, "sum")? } else { 0.0 };
        let sum2 = if self.has(STAT_SUM2) { number_field(map, "sum2")? } else { 0.0 };
        let min = if self.has(STAT_MIN) { number_field(map, "min")? } else { 0.0 };
        let max = if self.has(STAT_MAX) { number_field(map, "max")? } else { 0.0 };
        self.merge_parts(count, sum, sum2, min, max);
        Ok(())
    }

    fn to_json(&self) -> Value {
        json!({
            "count": self.count,
            "sum": self.sum,
            "sum2": self.sum2,
            "min": self.min,
            "max": self.max,
        })
    }
}

fn value_or_null(v: Option<f64>) -> Value {
    v.map(Value::from).unwrap_or(Value::Null)
}

pub(crate) fn avg_json(s: &StatEngine) -> Value {
    json!({ "value": value_or_null(s.avg()) })
}

pub(crate) fn sum_json(s: &StatEngine) -> Value {
    json!({ "value": s.sum })
}

pub(crate) fn min_json(s: &StatEngine) -> Value {
    json!({ "value": value_or_null((s.count > 0).then_some(s.min)) })
}

pub(crate) fn max_json(s: &StatEngine) -> Value {
    json!({ "value": value_or_null((s.count > 0).then_some(s.max)) })
}

pub(crate) fn count_json(s: &StatEngine) -> Value {
    json!({ "value": s.count })
}

pub(crate) fn stats_json(s: &StatEngine) -> Value {
    let some = s.count > 0;
    json!({
        "avg": value_or_null(s.avg()),
        "sum": s.sum,
        "min": value_or_null(some.then_some(s.min)),
        "max": value_or_null(some.then_some(s.max)),
        "count": s.count,
    })
}

pub(crate) fn extended_stats_json(s: &StatEngine, sigma: f64) -> Value {
    let Some(avg) = s.avg() else {
        return json!({
            "avg": null,
            "sum": s.sum,
            "min": null,
            "max": null,
            "count": s.count,
            "sum_of_squares": s.sum2,
            "variance": null,
            "std_deviation": null,
            "std_deviation_bounds": { "upper": null, "lower": null },
        });
    };

    let variance = s.sum2 / s.count as f64 - avg * avg;
    let std_dev = variance.sqrt();
    json!({
        "avg": avg,
        "sum": s.sum,
        "min": s.min,
        "max": s.max,
        "count": s.count,
        "sum_of_squares": s.sum2,
        "variance": variance,
        "std_deviation": std_dev,
        "std_deviation_bounds": {
            "upper": avg + sigma * std_dev,
            "lower": avg - sigma * std_dev,
        },
    })
}
