//! Record payload formats.
//!
//! Aggregations need structured values, so each DATA payload is parsed
//! according to the data format declared on the search. XML payloads map
//! onto JSON objects: child elements become keys, repeated children become
//! arrays, attributes become `-name` keys, and text next to attributes or
//! children lands under `#text`.

use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    Xml,
    Csv,
    Utf8,
    /// `-`: records are already parsed by the caller. Parsing raw bytes
    /// with this format always fails.
    Internal,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Json => "json",
            DataFormat::Xml => "xml",
            DataFormat::Csv => "csv",
            DataFormat::Utf8 => "utf8",
            DataFormat::Internal => "-",
        }
    }

    /// Parses one raw payload.
    pub fn parse(&self, raw: &[u8]) -> Result<Value> {
        match self {
            DataFormat::Json => serde_json::from_slice(raw).context("failed to parse JSON data"),
            DataFormat::Xml => parse_xml(raw),
            DataFormat::Csv => parse_csv(raw, b','),
            DataFormat::Utf8 => {
                let text = std::str::from_utf8(raw).context("data is not valid UTF-8")?;
                Ok(Value::String(text.to_string()))
            }
            DataFormat::Internal => bail!("internal format cannot parse raw data"),
        }
    }
}

impl FromStr for DataFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(DataFormat::Json),
            "xml" => Ok(DataFormat::Xml),
            "csv" => Ok(DataFormat::Csv),
            "utf8" | "utf-8" => Ok(DataFormat::Utf8),
            "-" => Ok(DataFormat::Internal),
            other => Err(anyhow!("{:?} is unknown data format", other)),
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element under construction.
struct Frame {
    name: String,
    children: Map<String, Value>,
    text: String,
}

impl Frame {
    fn open(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut children = Map::new();
        for attr in start.attributes() {
            let attr = attr.context("bad XML attribute")?;
            let key = format!("-{}", String::from_utf8_lossy(attr.key.as_ref()));
            let value = attr.unescape_value().context("bad XML attribute value")?;
            children.insert(key, Value::String(value.into_owned()));
        }
        Ok(Self {
            name,
            children,
            text: String::new(),
        })
    }

    fn close(self) -> (String, Value) {
        let value = if self.children.is_empty() {
            Value::String(self.text)
        } else {
            let mut children = self.children;
            if !self.text.is_empty() {
                children.insert("#text".to_string(), Value::String(self.text));
            }
            Value::Object(children)
        };
        (self.name, value)
    }
}

fn insert_child(parent: &mut Map<String, Value>, name: String, value: Value) {
    match parent.get_mut(&name) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(name, value);
        }
    }
}

/// Parses a single XML record and returns the content of its root element.
fn parse_xml(raw: &[u8]) -> Result<Value> {
    let mut reader = quick_xml::Reader::from_reader(raw);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Frame> = Vec::new();
    let mut root: Option<Value> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| anyhow!("failed to parse XML data: {}", e))?;
        match event {
            Event::Start(e) => {
                if root.is_some() {
                    bail!("failed to parse XML data: multiple root elements");
                }
                stack.push(Frame::open(&e)?);
            }
            Event::Empty(e) => {
                let (name, value) = Frame::open(&e)?.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None if root.is_none() => root = Some(value),
                    None => bail!("failed to parse XML data: multiple root elements"),
                }
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = t.unescape().context("bad XML text")?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Event::End(_) => {
                let Some(frame) = stack.pop() else {
                    bail!("failed to parse XML data: unbalanced end tag");
                };
                let (name, value) = frame.close();
                match stack.last_mut() {
                    Some(parent) => insert_child(&mut parent.children, name, value),
                    None => root = Some(value),
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        bail!("failed to parse XML data: unexpected end of record");
    }
    root.ok_or_else(|| anyhow!("failed to parse XML data: no root element"))
}

/// Parses a single CSV record into an array of column strings.
fn parse_csv(raw: &[u8], separator: u8) -> Result<Value> {
    let text = std::str::from_utf8(raw).context("CSV data is not valid UTF-8")?;
    let text = text.trim_end_matches(['\r', '\n']);
    let sep = separator as char;

    let mut columns = Vec::new();
    let mut field = String::new();
    let mut chars = text.chars().peekable();
    let mut quoted = false;
    let mut at_field_start = true;

    while let Some(c) = chars.next() {
        if quoted {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    quoted = false;
                }
            } else {
                field.push(c);
            }
            continue;
        }

        if c == '"' && at_field_start {
            quoted = true;
            at_field_start = false;
        } else if c == sep {
            columns.push(Value::String(std::mem::take(&mut field)));
            at_field_start = true;
        } else {
            field.push(c);
            at_field_start = false;
        }
    }

    if quoted {
        bail!("failed to parse CSV data: unterminated quoted field");
    }
    columns.push(Value::String(field));
    Ok(Value::Array(columns))
}
