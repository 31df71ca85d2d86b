//! INDEX entries and records.
//!
//! The backend writes one INDEX line per match:
//!
//! ```text
//! file,offset,length,fuzziness
//! ```
//!
//! The file name may itself contain commas, so only the last three fields
//! are positional and everything before them is joined back into the name.
//! Fuzziness is `n/a` for primitives that have no edit distance; that maps
//! to `-1`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fuzziness value meaning "not applicable".
pub const FUZZINESS_NA: i32 = -1;

/// Bounds of the signed 31-bit fuzziness field.
pub const FUZZINESS_MIN: i32 = -(1 << 30);
pub const FUZZINESS_MAX: i32 = (1 << 30) - 1;

/// Location of one match inside a source file.
///
/// `length` is the number of payload bytes the match occupies in the DATA
/// file, not counting the delimiter that follows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub file: String,
    pub offset: u64,
    pub length: u64,
    pub fuzziness: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Index {
    pub fn new(file: impl Into<String>, offset: u64, length: u64, fuzziness: i32) -> Self {
        Self {
            file: file.into(),
            offset,
            length,
            fuzziness,
            host: None,
        }
    }

    /// Assigns the host tag once. Later calls and empty hosts are ignored.
    pub fn update_host(&mut self, host: &str) {
        if self.host.is_none() && !host.is_empty() {
            self.host = Some(host.to_string());
        }
    }

    /// Renders the entry back into INDEX line form, newline included.
    pub fn to_line(&self) -> String {
        if self.fuzziness == FUZZINESS_NA {
            format!("{},{},{},n/a\n", self.file, self.offset, self.length)
        } else {
            format!(
                "{},{},{},{}\n",
                self.file, self.offset, self.length, self.fuzziness
            )
        }
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}#{}, len:{}, d:{}}}",
            self.file, self.offset, self.length, self.fuzziness
        )?;
        if let Some(host) = &self.host {
            write!(f, "@{}", host)?;
        }
        Ok(())
    }
}

/// An index entry paired with its DATA payload.
///
/// `data` is `None` in count-only mode. Otherwise it holds exactly
/// `index.length` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub index: Index,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,
}

impl Record {
    pub fn new(index: Index, data: Option<Vec<u8>>) -> Self {
        Self { index, data }
    }
}

/// Parses one INDEX line. A trailing newline is optional.
pub fn parse_index(line: &[u8]) -> Result<Index> {
    let text = std::str::from_utf8(line).context("INDEX line is not valid UTF-8")?;
    let text = text.trim();

    let fields: Vec<&str> = text.split(',').collect();
    let n = fields.len();
    if n < 4 {
        bail!("invalid number of fields in {:?}", text);
    }

    let file = fields[..n - 3].join(",");

    let offset = fields[n - 3]
        .trim()
        .parse::<u64>()
        .with_context(|| format!("failed to parse offset from {:?}", fields[n - 3]))?;

    let length = fields[n - 2]
        .trim()
        .parse::<u64>()
        .with_context(|| format!("failed to parse length from {:?}", fields[n - 2]))?;

    let fuzz = fields[n - 1].trim();
    let fuzziness = if fuzz.eq_ignore_ascii_case("n/a") {
        FUZZINESS_NA
    } else {
        let value = fuzz
            .parse::<i32>()
            .with_context(|| format!("failed to parse fuzziness from {:?}", fuzz))?;
        if !(FUZZINESS_MIN..=FUZZINESS_MAX).contains(&value) {
            bail!("fuzziness {} is out of signed 31-bit range", value);
        }
        value
    };

    Ok(Index::new(file, offset, length, fuzziness))
}
