//! `date_histogram` engine: counts records per calendar bucket and,
//! optionally, runs nested aggregations inside every bucket.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::{Aggregations, Engine};
use crate::access::{as_string, FieldPath, Lookup};
use crate::datetime::{format_joda, parse_datetime_in, Interval, Zone};

pub const DEFAULT_KEY_FORMAT: &str = "yyyy-MM-ddTHH:mm:ss.SSSZZ";

#[derive(Debug, Clone)]
pub struct Bucket {
    pub count: u64,
    pub aggs: Option<Aggregations>,
}

impl Bucket {
    fn add(&mut self, data: &Value) -> Result<()> {
        if let Some(aggs) = &mut self.aggs {
            aggs.add(data)?;
        }
        self.count += 1;
        Ok(())
    }

    fn merge(&mut self, other: &Bucket) -> Result<()> {
        if let (Some(mine), Some(theirs)) = (&mut self.aggs, &other.aggs) {
            mine.merge_from(theirs)?;
        }
        self.count += other.count;
        Ok(())
    }

    fn merge_json(&mut self, data: &Value) -> Result<()> {
        let count = data
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("no valid bucket count"))?;
        if count == 0 {
            return Ok(());
        }
        if let Some(aggs) = &mut self.aggs {
            let sub = data
                .get("aggs")
                .ok_or_else(|| anyhow!("no sub-aggregations in bucket"))?;
            aggs.merge(sub)?;
        }
        self.count += count;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DateHistEngine {
    field: FieldPath,
    missing: Option<Value>,
    interval: Interval,
    offset: Duration,
    timezone: Zone,
    format: String,

    pub buckets: BTreeMap<DateTime<Utc>, Bucket>,

    // prototype cloned into every new bucket
    sub_aggs: Option<Box<Aggregations>>,
}

impl DateHistEngine {
    pub fn new(
        field: FieldPath,
        missing: Option<Value>,
        interval: Interval,
        offset: Duration,
        timezone: Zone,
        format: String,
        sub_aggs: Option<Aggregations>,
    ) -> Self {
        Self {
            field,
            missing,
            interval,
            offset,
            timezone,
            format,
            buckets: BTreeMap::new(),
            sub_aggs: sub_aggs.map(Box::new),
        }
    }

    fn bucket(&mut self, key: DateTime<Utc>) -> &mut Bucket {
        let proto = &self.sub_aggs;
        self.buckets.entry(key).or_insert_with(|| Bucket {
            count: 0,
            aggs: proto.as_deref().cloned(),
        })
    }

    pub fn merge_engine(&mut self, other: &DateHistEngine) -> Result<()> {
        for (key, theirs) in &other.buckets {
            self.bucket(*key).merge(theirs)?;
        }
        Ok(())
    }

    /// Renders buckets in key order for the `date_histogram` function.
    pub(crate) fn function_json(&self, keyed: bool, min_doc_count: u64) -> Value {
        let mut list = Vec::new();
        let mut map = Map::new();

        for (key, bucket) in &self.buckets {
            if bucket.count < min_doc_count {
                continue;
            }
            let key_as_string = format_joda(&self.format, &self.timezone.localize(key));

            let mut b = Map::new();
            b.insert("key_as_string".into(), json!(key_as_string));
            b.insert("key".into(), json!(key.timestamp_millis()));
            b.insert("doc_count".into(), json!(bucket.count));
            if let Some(Value::Object(sub)) = bucket.aggs.as_ref().map(|a| a.to_json(true)) {
                b.extend(sub);
            }

            if keyed {
                map.insert(key_as_string, Value::Object(b));
            } else {
                list.push(Value::Object(b));
            }
        }

        let buckets = if keyed {
            Value::Object(map)
        } else {
            Value::Array(list)
        };
        json!({ "buckets": buckets })
    }
}

impl Engine for DateHistEngine {
    fn name(&self) -> String {
        let mut parts = vec![
            format!("field::{}", self.field),
            format!("interval::{}", self.interval.as_str()),
            format!("format::{}", self.format),
            format!("timezone::{}", self.timezone),
        ];
        if let Some(missing) = &self.missing {
            parts.push(format!(
                "missing::{}",
                as_string(missing).unwrap_or_else(|_| missing.to_string())
            ));
        }
        if self.offset != Duration::zero() {
            parts.push(format!("offset::{}ms", self.offset.num_milliseconds()));
        }
        if let Some(sub) = &self.sub_aggs {
            let names: Vec<String> = sub.engines().iter().map(|e| e.name()).collect();
            parts.push(format!("sub-aggs<{}>", names.join("|")));
        }
        format!("datehist.{}", parts.join("/"))
    }

    fn add(&mut self, data: &Value) -> Result<()> {
        let value = match self.field.get(data)? {
            Lookup::Found(Value::Null) | Lookup::Missing => match &self.missing {
                Some(missing) => missing.clone(),
                None => return Ok(()),
            },
            Lookup::Found(v) => v.clone(),
        };

        let text = as_string(&value).context("failed to get datetime field")?;
        let when = parse_datetime_in(&text, &self.timezone)
            .context("failed to parse datetime field")?;
        let key = self.interval.truncate(when, &self.timezone)? + self.offset;

        self.bucket(key.with_timezone(&Utc))
            .add(data)
            .context("sub-aggs failed")
    }

    fn merge_json(&mut self, data: &Value) -> Result<()> {
        let buckets = data
            .get("buckets")
            .and_then(Value::as_object)
            .ok_or_else(|| anyhow!("no valid date histogram buckets"))?;

        for (key, bucket) in buckets {
            let key = DateTime::parse_from_rfc3339(key)
                .with_context(|| format!("bad bucket key {:?}", key))?
                .with_timezone(&Utc);
            self.bucket(key).merge_json(bucket)?;
        }
        Ok(())
    }

    fn to_json(&self) -> Value {
        let mut buckets = Map::new();
        for (key, bucket) in &self.buckets {
            let mut b = Map::new();
            b.insert("count".into(), json!(bucket.count));
            if let Some(aggs) = &bucket.aggs {
                b.insert("aggs".into(), aggs.to_json(false));
            }
            buckets.insert(
                key.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                Value::Object(b),
            );
        }
        json!({ "buckets": buckets })
    }
}
