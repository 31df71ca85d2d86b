//! VIEW files: random-access positions of records inside INDEX and DATA.
//!
//! Layout (big-endian):
//!
//! ```text
//! header: [u64; 8] = signature, item count, INDEX length, DATA length, 0, 0, 0, 0
//! item:   [i64; 4] = index begin, index end, data begin, data end
//! ```
//!
//! A fresh file has item count 0 and both lengths set to -1 until
//! [`ViewWriter::update`] rewrites the header.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use primstream_core::parse_index;

use crate::error::{PipelineError, Result};

/// "ryftview"
pub const SIGNATURE: u64 = 0x7279_6674_7669_6577;

const HEADER_SIZE: u64 = 8 * 8;
const ITEM_SIZE: u64 = 4 * 8;
const BUF_SIZE: usize = 256 * 1024;

/// Positions of one record. `*_end` is exclusive; the DATA range excludes
/// the delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewItem {
    pub index_begin: i64,
    pub index_end: i64,
    pub data_begin: i64,
    pub data_end: i64,
}

fn header_bytes(count: u64, index_len: i64, data_len: i64) -> [u8; HEADER_SIZE as usize] {
    let words = [SIGNATURE, count, index_len as u64, data_len as u64, 0, 0, 0, 0];
    let mut out = [0u8; HEADER_SIZE as usize];
    for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

pub struct ViewWriter {
    out: BufWriter<File>,
    count: u64,
}

impl ViewWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut out = BufWriter::with_capacity(BUF_SIZE, file);
        out.write_all(&header_bytes(0, -1, -1))?;
        Ok(Self { out, count: 0 })
    }

    pub fn put(&mut self, item: ViewItem) -> Result<()> {
        for word in [item.index_begin, item.index_end, item.data_begin, item.data_end] {
            self.out.write_all(&word.to_be_bytes())?;
        }
        self.count += 1;
        Ok(())
    }

    /// Rewrites the header with the current item count and final lengths.
    pub fn update(&mut self, index_len: i64, data_len: i64) -> Result<()> {
        self.out.flush()?;
        let file = self.out.get_mut();
        let pos = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header_bytes(self.count, index_len, data_len))?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn close(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

pub struct ViewReader {
    file: File,
    count: u64,
    index_len: i64,
    data_len: i64,
}

impl ViewReader {
    /// Opens a VIEW file and validates its header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&header[i * 8..i * 8 + 8]);
            u64::from_be_bytes(b)
        };
        if word(0) != SIGNATURE {
            return Err(PipelineError::Integrity(format!(
                "{} is not a VIEW file: bad signature {:#018x}",
                path.display(),
                word(0)
            )));
        }

        Ok(Self {
            file,
            count: word(1),
            index_len: word(2) as i64,
            data_len: word(3) as i64,
        })
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total INDEX length, or -1 if the writer never finished.
    pub fn index_len(&self) -> i64 {
        self.index_len
    }

    pub fn data_len(&self) -> i64 {
        self.data_len
    }

    pub fn get(&mut self, pos: u64) -> Result<ViewItem> {
        if pos >= self.count {
            return Err(PipelineError::Integrity(format!(
                "VIEW item {} out of range [0, {})",
                pos, self.count
            )));
        }
        self.file
            .seek(SeekFrom::Start(HEADER_SIZE + pos * ITEM_SIZE))?;
        let mut raw = [0u8; ITEM_SIZE as usize];
        self.file.read_exact(&mut raw)?;

        let mut words = [0i64; 4];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(8)) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            *word = i64::from_be_bytes(b);
        }
        Ok(ViewItem {
            index_begin: words[0],
            index_end: words[1],
            data_begin: words[2],
            data_end: words[3],
        })
    }
}

/// Builds a VIEW file from a finished INDEX file.
///
/// Returns the number of items written.
pub fn create_view_file(index_path: &Path, view_path: &Path, delimiter: &[u8]) -> Result<u64> {
    let file = File::open(index_path)?;
    let mut rd = BufReader::with_capacity(BUF_SIZE, file);
    let mut writer = ViewWriter::create(view_path)?;

    let delim_len = delimiter.len() as i64;
    let mut index_pos = 0i64;
    let mut data_pos = 0i64;
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = rd.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }

        let index = parse_index(&line)
            .map_err(|e| PipelineError::Parse(format!("failed to parse index: {:#}", e)))?;
        let length = index.length as i64;
        writer.put(ViewItem {
            index_begin: index_pos,
            index_end: index_pos + n as i64,
            data_begin: data_pos,
            data_end: data_pos + length,
        })?;

        index_pos += n as i64;
        data_pos += length + delim_len;
    }

    writer.update(index_pos, data_pos)?;
    let count = writer.len();
    writer.close()?;
    Ok(count)
}
