//! # primstream
//!
//! Streaming results pipeline over a hardware fuzzy-search backend.
//!
//! A search runs the backend as a child process. The backend writes two
//! artifacts: an INDEX text file (one line per match) and a DATA file
//! (the matched bytes, each followed by a delimiter). primstream pairs
//! them into records and streams those to the caller while the backend
//! is still running. It then publishes the backend statistics, with
//! optional aggregations computed over the DATA file.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  spawn   ┌──────────┐  INDEX/DATA  ┌────────────┐
//! │  Engine  │─────────▶│ backend  │─────────────▶│   reader   │
//! │ (task)   │          └──────────┘              └─────┬──────┘
//! └────┬─────┘                                          │ records
//!      │ stats + aggregations                           ▼
//!      └──────────────────────────────────────▶ ┌──────────────┐
//!                                               │ SearchResult │
//!                                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML engine configuration |
//! | [`search_config`] | Per-search options and path checks |
//! | [`engine`] | Task orchestration |
//! | [`task`] | Task identity, artifacts, held locks |
//! | [`command`] | Backend selection and command line |
//! | [`tweaks`] | Extra backend options and primitive routing |
//! | [`lock`] | Named reader/writer file locks |
//! | [`poll`] | Polling open/read over growing files |
//! | [`reader`] | INDEX/DATA results reader |
//! | [`view`] | VIEW offset file |
//! | [`aggregate`] | Aggregation driver (optimized tool or native scan) |
//! | [`result`] | Records/errors/stat channel |
//! | [`error`] | Error kinds |
//! | [`logging`] | Tracing setup |

pub mod aggregate;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod lock;
pub mod logging;
pub mod poll;
pub mod reader;
pub mod result;
pub mod search_config;
pub mod task;
pub mod tweaks;
pub mod view;

pub use config::{load_config, EngineConfig};
pub use engine::Engine;
pub use error::{PipelineError, Result};
pub use result::{ResultEvent, SearchResult};
pub use search_config::SearchConfig;

pub use primstream_core::{parse_stat, Aggregations, DataFormat, Index, Record, Stat};
