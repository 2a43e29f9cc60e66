use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use festcal::config::Config;
use festcal::dedupe::Deduplicator;
use festcal::export::export_to_file;
use festcal::logging;
use festcal::runner::IngestionRunner;
use festcal::sources::{JsonFeedAdapter, SourceAdapter, SourceDescriptor};
use festcal::store::{CanonicalStore, EventQuery, InMemoryStore};

#[derive(Parser)]
#[command(name = "festcal")]
#[command(about = "Rhein-Main event catalog aggregator")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fetch → normalize → dedup → store pipeline
    Ingest {
        /// Specific sources to run (comma-separated); defaults to all enabled
        #[arg(long)]
        sources: Option<String>,
        /// Path to the TOML configuration
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Path of the catalog snapshot
        #[arg(long, default_value = "data/catalog.json")]
        catalog: PathBuf,
    },
    /// Export the catalog as an iCalendar feed
    Export {
        /// Output .ics file path
        #[arg(long, short)]
        output: PathBuf,
        /// Filter by city
        #[arg(long)]
        city: Option<String>,
        /// Filter by category
        #[arg(long)]
        category: Option<String>,
        /// Include events starting on or after this date (inclusive)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Include events starting before this date (exclusive)
        #[arg(long)]
        to: Option<NaiveDate>,
        /// Maximum number of events
        #[arg(long)]
        limit: Option<usize>,
        /// Path to the TOML configuration (for the catalog timezone)
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Path of the catalog snapshot
        #[arg(long, default_value = "data/catalog.json")]
        catalog: PathBuf,
    },
    /// Print catalog statistics
    Stats {
        /// Path to the TOML configuration (for the catalog timezone)
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Path of the catalog snapshot
        #[arg(long, default_value = "data/catalog.json")]
        catalog: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_logging();

    let cli = Cli::parse();
    match cli.command {
        Commands::Ingest {
            sources,
            config,
            catalog,
        } => ingest(sources, &config, &catalog).await,
        Commands::Export {
            output,
            city,
            category,
            from,
            to,
            limit,
            config,
            catalog,
        } => export(output, city, category, from, to, limit, &config, &catalog).await,
        Commands::Stats { config, catalog } => stats(&config, &catalog).await,
    }
}

async fn ingest(sources: Option<String>, config: &PathBuf, catalog: &PathBuf) -> Result<()> {
    let config = Config::load(config)?;

    let only: Option<Vec<String>> = sources
        .map(|list| list.split(',').map(|s| s.trim().to_string()).collect());
    let enabled = config.enabled_sources(only.as_deref());
    if enabled.is_empty() {
        warn!("No enabled sources matched; nothing to ingest");
        println!("⚠️  No enabled sources matched");
        return Ok(());
    }

    let adapters: Vec<Arc<dyn SourceAdapter>> = enabled
        .iter()
        .map(|source| {
            Arc::new(JsonFeedAdapter::new(SourceDescriptor::from(*source))) as Arc<dyn SourceAdapter>
        })
        .collect();

    let store = Arc::new(InMemoryStore::load(catalog, config.ingest.timezone)?);
    let deduplicator = Deduplicator::from_config(&config);
    let runner = IngestionRunner::new(config.ingest.clone(), deduplicator, store.clone());

    println!("🔄 Ingesting from {} source(s)...", adapters.len());
    let run = runner.run(adapters).await?;
    let saved = store.save(catalog)?;

    println!("\n📊 Ingestion run {}:", run.id);
    println!("   Raw records: {}", run.raw_records);
    println!("   Normalized:  {}", run.normalized_events);
    println!("   Rejected:    {}", run.rejected_records);
    println!("   Created:     {}", run.created_events);
    println!("   Merged:      {}", run.merged_events);
    println!("   Failed:      {}", run.failed_events);
    println!("   Catalog:     {} events ({})", saved, catalog.display());

    if run.is_degraded() {
        println!("\n⚠️  {} source(s) failed this run:", run.source_failures.len());
        for failure in &run.source_failures {
            println!("   - {}: {}", failure.source_id, failure.reason);
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn export(
    output: PathBuf,
    city: Option<String>,
    category: Option<String>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    limit: Option<usize>,
    config: &PathBuf,
    catalog: &PathBuf,
) -> Result<()> {
    let config = Config::load(config)?;
    let store = InMemoryStore::load(catalog, config.ingest.timezone)?;
    let events = store
        .query(&EventQuery {
            city,
            category,
            start_from: from,
            start_until: to,
            limit,
        })
        .await?;

    let count = export_to_file(&events, "Rhein-Main Events", &output)?;
    println!("✅ Exported {} events to {}", count, output.display());
    Ok(())
}

async fn stats(config: &PathBuf, catalog: &PathBuf) -> Result<()> {
    let config = Config::load(config)?;
    let store = InMemoryStore::load(catalog, config.ingest.timezone)?;
    let events = store.query(&EventQuery::default()).await?;

    let mut cities = std::collections::BTreeSet::new();
    let mut categories = std::collections::BTreeSet::new();
    let mut sources = std::collections::BTreeSet::new();
    for event in &events {
        cities.insert(event.city_folded());
        if let Some(ref category) = event.category {
            categories.insert(category.to_lowercase());
        }
        sources.extend(event.sources.iter().cloned());
    }

    println!("📊 Catalog statistics ({}):", catalog.display());
    println!("   Events:     {}", events.len());
    println!("   Cities:     {}", cities.len());
    println!("   Categories: {}", categories.len());
    println!("   Sources:    {}", sources.len());
    Ok(())
}
