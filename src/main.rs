//! # primstream CLI
//!
//! ```bash
//! primstream --config ./config/primstream.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `primstream search "<query>" -f <file>...` | Run a search and stream JSON lines |
//! | `primstream aggregate --index I --data D --aggs '{...}'` | Aggregate existing artifacts |
//! | `primstream view --view V [--index I]` | Build and/or dump a VIEW file |
//! | `primstream stat [file]` | Parse a backend summary |
//! | `primstream options` | Print effective engine options |
//!
//! Search output is one JSON object per line: `{"record": ...}`,
//! `{"error": ...}` and finally `{"stat": ...}`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use primstream::aggregate::{apply_aggregations, AggregationJob, AggregationOptions};
use primstream::config::{self, EngineConfig};
use primstream::view::{create_view_file, ViewItem, ViewReader};
use primstream::{
    logging, parse_stat, Aggregations, DataFormat, Engine, Record, ResultEvent, SearchConfig,
};

/// Streaming results pipeline over a hardware fuzzy-search backend.
#[derive(Parser)]
#[command(name = "primstream", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Built-in defaults are used when the file does not exist.
    #[arg(long, global = true, default_value = "./config/primstream.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a search and stream results as JSON lines.
    ///
    /// Ctrl-C cancels the running task.
    Search(SearchArgs),

    /// Apply aggregations to existing INDEX and DATA files.
    Aggregate {
        #[arg(long)]
        index: PathBuf,
        #[arg(long)]
        data: PathBuf,
        /// Aggregation options as JSON.
        #[arg(long)]
        aggs: String,
        #[arg(long, default_value = "")]
        delimiter: String,
        #[arg(long, default_value = "json")]
        format: String,
        /// Override the configured engine: auto, native or optimized.
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Print intermediate (mergeable) state instead of final values.
        #[arg(long)]
        intermediate: bool,
    },

    /// Dump a VIEW file, building it from an INDEX file first if given.
    View {
        #[arg(long)]
        view: PathBuf,
        /// Finished INDEX file to build the VIEW from.
        #[arg(long)]
        index: Option<PathBuf>,
        #[arg(long, default_value = "")]
        delimiter: String,
        /// Print only this item.
        #[arg(long)]
        pos: Option<u64>,
    },

    /// Parse a backend summary from a file (or stdin).
    Stat { path: Option<PathBuf> },

    /// Print the effective engine options.
    Options,
}

#[derive(clap::Args)]
struct SearchArgs {
    query: String,

    /// Input file, relative to home. Repeatable.
    #[arg(short = 'f', long = "file", required = true)]
    files: Vec<String>,

    /// Search mode: es, fhs, feds, ds, ts, ns, cs, ipv4, ipv6, pcre2.
    #[arg(long, default_value = "")]
    mode: String,

    /// Surrounding width; negative means whole line.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    width: i32,

    #[arg(long, short = 'd', default_value_t = 0)]
    dist: u32,

    #[arg(long, short = 'i')]
    case_insensitive: bool,

    #[arg(long)]
    reduce: bool,

    #[arg(long, default_value_t = 0)]
    nodes: u32,

    /// Maximum records to report; 0 or negative means all.
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    limit: i64,

    #[arg(long, default_value = "")]
    delimiter: String,

    #[arg(long, default_value = "")]
    keep_index: String,
    #[arg(long, default_value = "")]
    keep_data: String,
    #[arg(long, default_value = "")]
    keep_view: String,

    /// Seconds before kept artifacts are removed; 0 keeps them.
    #[arg(long, default_value_t = 0)]
    lifetime: u64,

    /// Aggregation options as JSON.
    #[arg(long)]
    aggs: Option<String>,

    /// Record format for aggregations: json, xml, csv, utf8.
    #[arg(long, alias = "format", default_value = "json")]
    data_format: String,

    /// Report statistics only.
    #[arg(long)]
    count: bool,

    /// Report INDEX entries without DATA.
    #[arg(long)]
    no_data: bool,

    #[arg(long)]
    skip_missing: bool,

    /// Share mode: wait-up-to-<duration>, skip-busy or ignore.
    #[arg(long, default_value = "")]
    share_mode: String,

    /// Force backend: ryftprim, ryftx or ryftpcre2.
    #[arg(long, default_value = "")]
    backend: String,

    #[arg(long, default_value = "")]
    backend_mode: String,

    /// Extra backend option. Repeatable; replaces configured tweaks.
    #[arg(long = "backend-option", allow_hyphen_values = true)]
    backend_options: Vec<String>,

    #[arg(long)]
    performance: bool,
}

impl SearchArgs {
    fn into_search(self) -> anyhow::Result<SearchConfig> {
        let aggregations = match &self.aggs {
            Some(raw) => Some(
                serde_json::from_str::<Value>(raw).context("failed to parse --aggs JSON")?,
            ),
            None => None,
        };
        Ok(SearchConfig {
            query: self.query,
            files: self.files,
            mode: self.mode,
            width: self.width,
            case: !self.case_insensitive,
            dist: self.dist,
            reduce: self.reduce,
            nodes: self.nodes,
            limit: self.limit,
            keep_index_as: self.keep_index,
            keep_data_as: self.keep_data,
            keep_view_as: self.keep_view,
            delimiter: self.delimiter,
            lifetime_secs: self.lifetime,
            aggregations,
            data_format: self.data_format,
            report_index: !self.count,
            report_data: !self.count && !self.no_data,
            skip_missing: self.skip_missing,
            share_mode: self.share_mode,
            backend: self.backend,
            backend_options: self.backend_options,
            backend_mode: self.backend_mode,
            performance: self.performance,
            ..Default::default()
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = if cli.config.exists() {
        config::load_config(&cli.config)?
    } else {
        EngineConfig::minimal()
    };
    logging::init(&cfg.logging.level);

    match cli.command {
        Commands::Search(args) => run_search(cfg, args.into_search()?).await,
        Commands::Aggregate {
            index,
            data,
            aggs,
            delimiter,
            format,
            engine,
            concurrency,
            intermediate,
        } => {
            let mut opts = AggregationOptions::from_config(&cfg.aggregations)?;
            if let Some(engine) = engine {
                opts.engine = engine.parse()?;
            }
            if let Some(n) = concurrency {
                opts.concurrency = n;
            }
            let options: Value = serde_json::from_str(&aggs).context("failed to parse --aggs JSON")?;
            let Some(aggs) = Aggregations::from_options(&options)? else {
                bail!("no aggregations requested");
            };
            let format: DataFormat = format.parse()?;
            let job = AggregationJob {
                index_path: index,
                data_path: data,
                delimiter: delimiter.into_bytes(),
                format,
                check_json_array: format == DataFormat::Json,
            };
            let aggs = apply_aggregations(&opts, job, aggs, CancellationToken::new()).await?;
            print_json(&aggs.to_json(!intermediate))
        }
        Commands::View {
            view,
            index,
            delimiter,
            pos,
        } => {
            if let Some(index) = index {
                create_view_file(&index, &view, delimiter.as_bytes())?;
            }
            let mut view = ViewReader::open(&view)?;
            if let Some(pos) = pos {
                return print_json(&item_json(pos, view.get(pos)?));
            }
            print_json(&json!({
                "items": view.len(),
                "index-length": view.index_len(),
                "data-length": view.data_len(),
            }))?;
            for pos in 0..view.len() {
                print_json(&item_json(pos, view.get(pos)?))?;
            }
            Ok(())
        }
        Commands::Stat { path } => {
            let mut output = String::new();
            match path {
                Some(path) => {
                    output = std::fs::read_to_string(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?
                }
                None => {
                    std::io::stdin().read_to_string(&mut output)?;
                }
            }
            let stat = parse_stat(&output).context("failed to parse backend summary")?;
            print_json(&serde_json::to_value(stat)?)
        }
        Commands::Options => {
            let engine = Engine::new(cfg)?;
            print_json(&engine.options())
        }
    }
}

async fn run_search(cfg: EngineConfig, search: SearchConfig) -> anyhow::Result<()> {
    let engine = Engine::new(cfg)?;
    let mut result = engine.search(search).await?;

    let cancel = result.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut failed = false;
    while let Some(event) = result.next().await {
        match event {
            ResultEvent::Record(rec) => print_json(&json!({ "record": record_json(&rec) }))?,
            ResultEvent::Error(err) => {
                failed = true;
                print_json(&json!({ "error": { "kind": err.kind(), "message": err.to_string() } }))?
            }
            ResultEvent::Stat(stat) => print_json(&json!({ "stat": stat }))?,
        }
    }

    if failed {
        bail!("search finished with errors");
    }
    Ok(())
}

/// DATA as text when it is UTF-8, otherwise hex.
fn record_json(rec: &Record) -> Value {
    let mut out = json!({ "index": rec.index });
    if let Some(data) = &rec.data {
        out["data"] = match std::str::from_utf8(data) {
            Ok(text) => Value::String(text.to_string()),
            Err(_) => json!({ "hex": hex::encode(data) }),
        };
    }
    out
}

fn item_json(pos: u64, item: ViewItem) -> Value {
    json!({
        "pos": pos,
        "index": [item.index_begin, item.index_end],
        "data": [item.data_begin, item.data_end],
    })
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    stdout.write_all(b"\n")?;
    Ok(())
}
