//! Scout CLI: operational commands over the table store and result cache.
//!
//! Commands:
//! - `store list`: every stored (dataset, source, partition) table
//! - `store show`: print one partition, or the union of several
//! - `store export`: write a partition to Parquet
//! - `store delete`: drop one partition
//! - `cache stats`: entry counts and hit counters for both tiers
//! - `cache clear`: empty both tiers
//! - `limits`: effective per-source rate limits

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use scout_core::cache::ResultCache;
use scout_core::ratelimit::RateLimiter;
use scout_core::store::{Compression, LoadOptions, PartitionedStore, TableKey};
use scout_core::ScoutConfig;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "scout", about = "Scout: sports data store and cache tooling")]
struct Cli {
    /// TOML config file. Environment variables override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store file, overriding config and SCOUT_STORE_PATH.
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and export stored tables.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Result cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Show the effective rate limit of every configured source.
    Limits {
        /// Print JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum StoreAction {
    /// List every stored table.
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print rows of one or more partitions of a dataset.
    Show {
        #[arg(long)]
        dataset: String,

        #[arg(long)]
        source: String,

        /// Partition(s) to read. More than one reads their union.
        #[arg(long = "partition", required = true)]
        partitions: Vec<String>,

        /// SQL filter, e.g. "goals > 2".
        #[arg(long)]
        filter: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Write one partition to a Parquet file.
    Export {
        #[arg(long)]
        dataset: String,

        #[arg(long)]
        source: String,

        #[arg(long)]
        partition: String,

        /// Output directory.
        #[arg(long, default_value = "exports")]
        dir: PathBuf,

        /// uncompressed, snappy, gzip, lz4 or zstd.
        #[arg(long, default_value = "snappy")]
        compression: Compression,
    },
    /// Drop one partition.
    Delete {
        #[arg(long)]
        dataset: String,

        #[arg(long)]
        source: String,

        #[arg(long)]
        partition: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Entry counts, hit counters and configuration.
    Stats,
    /// Remove every entry from both tiers.
    Clear,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("scout=info,scout_core=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = ScoutConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(path) = cli.store {
        config.store.path = path;
    }

    match cli.command {
        Commands::Store { action } => {
            let store = open_store(&config.store.path)?;
            match action {
                StoreAction::List { json } => run_store_list(&store, json),
                StoreAction::Show {
                    dataset,
                    source,
                    partitions,
                    filter,
                    limit,
                } => run_store_show(&store, &dataset, &source, &partitions, filter, limit),
                StoreAction::Export {
                    dataset,
                    source,
                    partition,
                    dir,
                    compression,
                } => {
                    let key = TableKey::new(dataset, source, partition);
                    let path = store
                        .export_columnar(&key, &dir, compression)
                        .with_context(|| format!("exporting {key}"))?;
                    println!("{}", path.display());
                    Ok(())
                }
                StoreAction::Delete {
                    dataset,
                    source,
                    partition,
                } => {
                    let key = TableKey::new(dataset, source, partition);
                    if !store.delete(&key)? {
                        bail!("no stored table for {key}");
                    }
                    println!("deleted {key}");
                    Ok(())
                }
            }
        }
        Commands::Cache { action } => {
            let cache = ResultCache::from_config(&config.cache);
            match action {
                CacheAction::Stats => {
                    println!("{}", serde_json::to_string_pretty(&cache.stats())?);
                    Ok(())
                }
                CacheAction::Clear => {
                    cache.clear();
                    info!("cache cleared");
                    Ok(())
                }
            }
        }
        Commands::Limits { json } => {
            let limiter = RateLimiter::from_config(&config).context("invalid rate limits")?;
            run_limits(&limiter, json)
        }
    }
}

fn open_store(path: &Path) -> Result<PartitionedStore> {
    PartitionedStore::open(path).with_context(|| format!("opening store {}", path.display()))
}

fn run_store_list(store: &PartitionedStore, json: bool) -> Result<()> {
    let tables = store.list_tables()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tables)?);
        return Ok(());
    }
    if tables.is_empty() {
        println!("Store is empty");
        return Ok(());
    }

    println!(
        "{:<20} {:<14} {:<12} {:>10}  {:<20}",
        "Dataset", "Source", "Partition", "Rows", "Saved"
    );
    println!("{}", "-".repeat(80));
    for t in &tables {
        println!(
            "{:<20} {:<14} {:<12} {:>10}  {:<20}",
            t.key.dataset,
            t.key.source,
            t.key.partition,
            t.row_count,
            t.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn run_store_show(
    store: &PartitionedStore,
    dataset: &str,
    source: &str,
    partitions: &[String],
    filter: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut options = LoadOptions::new().limit(limit);
    if let Some(filter) = filter {
        options = options.filter(filter);
    }

    let frame = if let [partition] = partitions {
        store.load(&TableKey::new(dataset, source, partition.as_str()), &options)?
    } else {
        store.load_multi_partition(dataset, source, partitions, &options)?
    };

    if frame.height() == 0 {
        println!("No rows");
    } else {
        println!("{frame}");
    }
    Ok(())
}

fn run_limits(limiter: &RateLimiter, json: bool) -> Result<()> {
    let buckets = limiter.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&buckets)?);
        return Ok(());
    }

    let default = limiter.default_limit();
    println!(
        "default: {:.2}/s, burst {:.0}",
        default.rate(),
        default.burst()
    );
    for b in &buckets {
        println!("{:<16} {:>8.2}/s  burst {:>4.0}", b.source, b.rate, b.burst);
    }
    Ok(())
}
