//! # primstream core
//!
//! Pure logic shared by the streaming pipeline: INDEX entries, backend
//! statistics, record payload formats, and the mergeable aggregation
//! engines.
//!
//! This crate performs no filesystem I/O and pulls in no async runtime.
//! Everything here can be unit-tested on in-memory buffers.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`index`] | INDEX line parser, [`Index`] and [`Record`] |
//! | [`stat`] | Backend summary parser and [`Stat`] combiners |
//! | [`access`] | Dotted / bracketed field paths over parsed records |
//! | [`format`] | Record payload formats (JSON, XML, CSV, UTF-8) |
//! | [`datetime`] | Calendar intervals, fixed-offset time zones, timestamp parsing |
//! | [`aggs`] | Stat, geo and date-histogram engines plus the function layer |

pub mod access;
pub mod aggs;
pub mod datetime;
pub mod format;
pub mod index;
pub mod stat;

pub use aggs::Aggregations;
pub use format::DataFormat;
pub use index::{parse_index, Index, Record};
pub use stat::{parse_stat, Stat};
