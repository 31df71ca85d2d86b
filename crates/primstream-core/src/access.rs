//! Field paths over parsed records.
//!
//! A path is a dotted list of object keys with optional bracketed array
//! positions: `foo.bar`, `items[2].price`, `[1]` (second CSV column). The
//! single `.` selects the whole record, which is how UTF-8 payloads are
//! aggregated.

use anyhow::{bail, Result};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Position(usize),
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    text: String,
    segments: Vec<Segment>,
}

/// Outcome of a field lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value),
    /// Key or position not present in the record.
    Missing,
}

impl FieldPath {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let mut segments = Vec::new();

        if text.is_empty() || text == "." {
            return Ok(Self {
                text: ".".to_string(),
                segments,
            });
        }

        for part in text.split('.') {
            if part.is_empty() {
                bail!("bad field path {:?}: empty key", text);
            }

            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                let Some(inner) = rest.strip_prefix('[') else {
                    bail!("bad field path {:?}: unexpected {:?}", text, rest);
                };
                let Some(end) = inner.find(']') else {
                    bail!("bad field path {:?}: unclosed bracket", text);
                };
                let pos = inner[..end].trim().parse::<usize>().map_err(|_| {
                    anyhow::anyhow!("bad field path {:?}: {:?} is not a position", text, &inner[..end])
                })?;
                segments.push(Segment::Position(pos));
                rest = &inner[end + 1..];
            }
        }

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// True for the `.` path that selects the whole record.
    pub fn is_whole(&self) -> bool {
        self.segments.is_empty()
    }

    /// Looks the path up in `data`.
    ///
    /// A `null` on the way down reads as missing. Descending into a scalar
    /// is an error.
    pub fn get<'a>(&self, data: &'a Value) -> Result<Lookup<'a>> {
        let mut current = data;
        for segment in &self.segments {
            let next = match (segment, current) {
                (_, Value::Null) => None,
                (Segment::Key(key), Value::Object(map)) => map.get(key),
                (Segment::Position(pos), Value::Array(items)) => items.get(*pos),
                (Segment::Position(pos), Value::Object(map)) => map.get(&pos.to_string()),
                (Segment::Key(key), other) => {
                    bail!("cannot get {:?} from {}", key, kind_of(other))
                }
                (Segment::Position(pos), other) => {
                    bail!("cannot get [{}] from {}", pos, kind_of(other))
                }
            };
            match next {
                Some(value) => current = value,
                None => return Ok(Lookup::Missing),
            }
        }
        Ok(Lookup::Found(current))
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Reads a value as a number. Strings are trimmed and parsed.
pub fn as_f64(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(v) => Ok(v),
            None => bail!("{} is not a valid number", n),
        },
        Value::String(s) => match s.trim().parse::<f64>() {
            Ok(v) => Ok(v),
            Err(_) => bail!("failed to parse {:?} as a number", s),
        },
        other => bail!("{} is not a number", kind_of(other)),
    }
}

/// Reads a value as a string. Numbers and booleans are rendered.
pub fn as_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => bail!("{} is not a string", kind_of(other)),
    }
}
