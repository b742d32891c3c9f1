mod cli;

use anyhow::{bail, Context};
use clap::Parser;
use cli::{Cli, Command, QueryArgs, SyncArgs};
use colored::*;
use log::{error, info};
use rdw_dashboard::config::Config;
use rdw_dashboard::downloader::{SyncMode, Synchronizer};
use rdw_dashboard::metadata::MetadataStore;
use rdw_dashboard::progress::{ConsoleReporter, SyncSessions};
use rdw_dashboard::query::{Engine, PivotRequest, SimpleQueryRequest};
use rdw_dashboard::registry::{self, Registry};
use rdw_dashboard::types::DownloadStatus;
use serde::Serialize;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    info!("Starting RDW dashboard");

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())
        .await
        .context("loading configuration")?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let registry = match &cli.catalog {
        Some(path) => Registry::from_catalog_file(path)
            .await
            .with_context(|| format!("reading catalog {}", path.display()))?,
        None => Registry::builtin(),
    };

    match cli.command {
        Command::Sync(args) => run_sync(config, registry, args).await,
        Command::Status => run_status(&config, &registry).await,
        Command::Pivot { request } => {
            let content = tokio::fs::read_to_string(&request)
                .await
                .with_context(|| format!("reading {}", request.display()))?;
            let request: PivotRequest =
                serde_json::from_str(&content).context("parsing pivot request")?;
            let engine = open_engine(&config, &registry).await?;
            print_json(&engine.pivot(&request)?)
        }
        Command::Query(args) => run_query(&config, &registry, args).await,
        Command::Lookup { kenteken } => {
            let engine = open_engine(&config, &registry).await?;
            match engine.lookup(&kenteken)? {
                Some(row) => print_json(&row),
                None => bail!("no vehicle found for {}", kenteken),
            }
        }
        Command::Columns => {
            let engine = open_engine(&config, &registry).await?;
            let view = engine.view()?;
            print_json(&view.provenance())
        }
    }
}

async fn run_sync(mut config: Config, registry: Registry, args: SyncArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.sequential |= args.sequential;
    info!("Sync arguments: workers={}, sequential={}", config.workers, config.sequential);

    let registry = if args.datasets.is_empty() {
        registry
    } else {
        registry.select(&args.datasets)?
    };
    let mode: SyncMode = config.sync_mode();

    let metadata = MetadataStore::load(config.metadata_path())
        .await
        .context("loading download metadata")?;
    let mut options = config.sync_options();
    options.force = args.force;
    let synchronizer = Arc::new(Synchronizer::new(options, metadata)?);

    let sessions = SyncSessions::new();
    let handle = sessions.start(synchronizer, registry, mode).await;
    ConsoleReporter::new().run(handle.events).await;
    let summary = match sessions.wait(handle.id).await {
        Some(result) => result.context("synchronization task panicked")?,
        None => bail!("synchronization session {} disappeared", handle.id),
    };

    println!("\n{}", "Synchronization Summary:".bold());
    println!("Completed: {}", summary.completed.to_string().green());
    println!("Skipped:   {}", summary.skipped.to_string().yellow());
    println!("Failed:    {}", summary.failed.to_string().red());
    println!(
        "Total data transferred: {:.2} MB",
        summary.total_bytes_downloaded as f64 / 1_048_576.0
    );
    println!("Total duration: {:.2?}", summary.total_duration);

    if summary.failed > 0 {
        println!("\n{}", "Failed Downloads:".red().bold());
        for report in summary
            .reports
            .iter()
            .filter(|r| r.status == DownloadStatus::Failed)
        {
            println!(
                "✗ {} - Error: {}",
                report.task.dataset.name.red(),
                report.error.as_deref().unwrap_or("unknown error")
            );
            println!("  URL: {}", report.task.url);
        }
        error!("{} downloads failed", summary.failed);
        bail!("Some downloads failed");
    }

    println!("\n{}", "All datasets are up to date".green());
    Ok(())
}

async fn run_status(config: &Config, registry: &Registry) -> anyhow::Result<()> {
    let metadata = MetadataStore::load(config.metadata_path()).await?;
    let database_path = config.database_path();
    let engine = if database_path.is_file() {
        Some(Engine::open(&database_path, config.result_limit)?)
    } else {
        None
    };
    println!("{}", "Datasets:".bold());
    for dataset in registry.datasets() {
        let present = registry::dataset_path(&config.data_dir, dataset).is_file();
        let marker = if present { "✓".green() } else { "✗".red() };
        println!(
            "{} {} ({}, {}) - {}",
            marker,
            dataset.name.bold(),
            dataset.id,
            dataset.estimated_size,
            dataset.description
        );
        if let Some(entry) = metadata.get(&dataset.name).await {
            println!(
                "    downloaded {} | {} bytes | etag {} | last-modified {}",
                entry.downloaded_at,
                entry.size,
                entry.etag.as_deref().unwrap_or("-"),
                entry.last_modified.as_deref().unwrap_or("-")
            );
        }
        if let Some(stamp) = engine.as_ref().and_then(|e| e.stamp(&dataset.name)) {
            println!(
                "    loaded into query database from the copy downloaded {} ({} bytes)",
                stamp.downloaded_at, stamp.size
            );
        }
    }

    println!("\nMetadata: {}", metadata.path().display());
    match &engine {
        Some(engine) => println!(
            "Query database: {} ({} tables)",
            database_path.display(),
            engine.tables().len()
        ),
        None => println!("Query database: {} (not created yet)", database_path.display()),
    }
    Ok(())
}

async fn run_query(config: &Config, registry: &Registry, args: QueryArgs) -> anyhow::Result<()> {
    let request = SimpleQueryRequest {
        field: args.field,
        operation: args.operation.into(),
        limit: args.limit,
        pivot_field: args.pivot_field,
    };
    let engine = open_engine(config, registry).await?;
    print_json(&engine.simple_query(&request)?)
}

/// Opens the query database in the data directory and reloads any dataset
/// whose download changed since it was last loaded.
async fn open_engine(config: &Config, registry: &Registry) -> anyhow::Result<Engine> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let metadata = MetadataStore::load(config.metadata_path())
        .await
        .context("loading download metadata")?;
    let database_path = config.database_path();
    let mut engine = Engine::open(&database_path, config.result_limit)
        .with_context(|| format!("opening {}", database_path.display()))?;
    let changed = engine
        .refresh(registry, &config.data_dir, &metadata.entries().await)
        .with_context(|| format!("loading datasets from {}", config.data_dir.display()))?;
    if !changed {
        info!("Query database is current, nothing reloaded");
    }
    Ok(engine)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
