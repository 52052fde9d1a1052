mod catalog;
mod checkpoint;
mod config;
mod extract;
mod json;
mod merge;
mod model;
mod normalize;
mod runner;
mod sink;
mod worklist;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::catalog::{CatalogEntry, CatalogStats};
use crate::checkpoint::{Checkpoint, JsonFileStore};
use crate::config::Settings;
use crate::extract::SpiderExtractor;
use crate::merge::{MergePolicy, MergeStats};
use crate::model::{Product, RawRecord};
use crate::runner::RunOptions;
use crate::sink::{RestSink, SqliteSink};

#[derive(Parser)]
#[command(name = "catalog_merge", about = "Multi-source product catalog ingestion and UPC merge")]
struct Cli {
    /// Configuration file (default: ./catalog.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every pending work-list item for an origin, checkpointing as it goes
    Ingest {
        /// Origin tag, e.g. montania or rol
        origin: String,
        /// Work-list document (default: <data_dir>/<origin>/worklist.json)
        #[arg(short, long)]
        worklist: Option<PathBuf>,
        /// Checkpoint file (default: <data_dir>/<origin>/checkpoint.json)
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Max items to extract this run (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Rename fields, parse prices and UPCs, assign ids
    Normalize {
        origin: String,
        /// Raw records (default: the origin's checkpoint)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Normalized products (default: <data_dir>/<origin>/products.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge normalized products by UPC and assemble the catalog
    Merge {
        /// Product files, in precedence encounter order (default: every origin's products.json)
        #[arg(short, long, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Catalog file (default: <data_dir>/catalog.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Suffix for merged ids (default: current UTC timestamp)
        #[arg(long)]
        token: Option<String>,
    },
    /// Report UPCs shared by more than one product
    Dupes {
        #[arg(short, long, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Write the full report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show catalog composition
    Stats {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// Upsert the catalog into the configured sink
    Upload {
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Write to the local SQLite database even if a REST endpoint is configured
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = config::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Ingest {
            origin,
            worklist,
            checkpoint,
            limit,
        } => {
            let profile = settings.origin(&origin)?;
            let worklist = worklist.unwrap_or_else(|| settings.worklist_path(&origin));
            let locators = worklist::load(&worklist)?;
            if locators.is_empty() {
                println!("Work list {:?} is empty.", worklist);
                return Ok(());
            }

            let extractor = SpiderExtractor::new(&origin, profile)?;
            let checkpoint = checkpoint.unwrap_or_else(|| settings.checkpoint_path(&origin));
            let mut cp = Checkpoint::open(
                JsonFileStore::new(&checkpoint),
                settings.checkpoint_every(&origin),
            )?;

            let opts = RunOptions {
                timeout: Duration::from_secs(settings.extract_timeout_secs),
                limit,
            };
            let stats = runner::run(&origin, profile, &extractor, &mut cp, &locators, &opts).await?;
            stats.print();
            println!("Checkpoint {:?} holds {} records.", checkpoint, cp.len());
            Ok(())
        }
        Commands::Normalize {
            origin,
            input,
            output,
        } => {
            let profile = settings.origin(&origin)?;
            let input = input.unwrap_or_else(|| settings.checkpoint_path(&origin));
            let output = output.unwrap_or_else(|| settings.products_path(&origin));

            let raws: Vec<RawRecord> = json::load(&input)?;
            let (products, stats) = normalize::normalize_batch(&origin, profile, &raws);
            json::save(&output, &products)?;
            stats.print();
            println!("Wrote {} products to {:?}", products.len(), output);
            Ok(())
        }
        Commands::Merge {
            input,
            output,
            token,
        } => {
            let inputs = product_inputs(&settings, input)?;
            let products = load_products(&inputs)?;
            let output = output.unwrap_or_else(|| settings.catalog_path());
            let token = token.unwrap_or_else(merge::run_token);

            let (merged, stats) = merge::merge(&products, &settings.merge, &token);
            let entries = catalog::assemble(merged);
            let composition = CatalogStats::from_entries(&entries);
            json::save(&output, &entries)?;

            let summary = MergeSummary {
                generated_at: Utc::now(),
                run_token: &token,
                policy: &settings.merge,
                inputs: &inputs,
                stats: &stats,
                composition: &composition,
            };
            json::save(&summary_path(&output), &summary)?;

            stats.print();
            composition.print();
            println!("Wrote catalog to {:?}", output);
            Ok(())
        }
        Commands::Dupes { input, output } => {
            let inputs = product_inputs(&settings, input)?;
            let products = load_products(&inputs)?;
            let report = merge::analyze_duplicates(&products);
            report.print();
            if let Some(path) = output {
                json::save(&path, &report)?;
                println!("Wrote report to {:?}", path);
            }
            Ok(())
        }
        Commands::Stats { input } => {
            let input = input.unwrap_or_else(|| settings.catalog_path());
            let entries: Vec<CatalogEntry> = json::load(&input)?;
            CatalogStats::from_entries(&entries).print();
            Ok(())
        }
        Commands::Upload { input, local } => {
            let input = input.unwrap_or_else(|| settings.catalog_path());
            let entries: Vec<CatalogEntry> = json::load(&input)?;
            let sink_cfg = &settings.sink;
            let pause = Duration::from_millis(sink_cfg.pause_ms);

            let stats = match sink_cfg.rest_url.as_deref() {
                Some(url) if !local => {
                    info!(url, table = %sink_cfg.table, "Uploading to REST endpoint");
                    let mut sink = RestSink::new(url, &sink_cfg.table, sink_cfg.headers.clone())?;
                    sink::upload(&mut sink, &entries, sink_cfg.batch_size, pause).await?
                }
                _ => {
                    info!(path = ?sink_cfg.sqlite_path, "Uploading to SQLite");
                    let mut sink = SqliteSink::open(&sink_cfg.sqlite_path)?;
                    sink::upload(&mut sink, &entries, sink_cfg.batch_size, Duration::ZERO).await?
                }
            };
            stats.print();
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MergeSummary<'a> {
    generated_at: DateTime<Utc>,
    run_token: &'a str,
    policy: &'a MergePolicy,
    inputs: &'a [PathBuf],
    stats: &'a MergeStats,
    composition: &'a CatalogStats,
}

/// Explicit inputs, or every configured origin's products file that exists.
fn product_inputs(settings: &Settings, explicit: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    let found: Vec<PathBuf> = settings
        .origins
        .keys()
        .map(|tag| settings.products_path(tag))
        .filter(|p| p.exists())
        .collect();
    if found.is_empty() {
        bail!(
            "No product files under {:?}. Run 'normalize' first or pass --input.",
            settings.data_dir
        );
    }
    Ok(found)
}

fn load_products(paths: &[PathBuf]) -> Result<Vec<Product>> {
    let mut all = Vec::new();
    for path in paths {
        let products: Vec<Product> = json::load(path)?;
        info!(path = ?path, products = products.len(), "Loaded products");
        all.extend(products);
    }
    Ok(all)
}

/// `data/catalog.json` → `data/catalog_summary.json`
fn summary_path(catalog: &Path) -> PathBuf {
    let stem = catalog
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string());
    catalog.with_file_name(format!("{}_summary.json", stem))
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_sits_next_to_catalog() {
        assert_eq!(
            summary_path(Path::new("data/catalog.json")),
            PathBuf::from("data/catalog_summary.json")
        );
        assert_eq!(summary_path(Path::new("out.json")), PathBuf::from("out_summary.json"));
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn cli_parses() {
        let cli = Cli::try_parse_from(["catalog_merge", "ingest", "rol", "-n", "5"]).unwrap();
        assert!(matches!(cli.command, Commands::Ingest { limit: Some(5), .. }));
        let cli = Cli::try_parse_from([
            "catalog_merge", "--config", "x.toml", "merge", "-i", "a.json", "b.json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        assert!(matches!(cli.command, Commands::Merge { ref input, .. } if input.len() == 2));
    }
}
