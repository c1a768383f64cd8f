//! Coach CLI - Command-line interface
//!
//! Usage:
//!   coach watch
//!   coach scan
//!   coach query <text> [-k N] [--category C]
//!   coach stats
//!   coach config

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use coach_core::{AppConfig, Category, Chunker, Classifier, LoggingConfig};
use coach_ingest::{IngestPipeline, IngestSession};
use coach_parser::ParserRegistry;
use coach_vector::{create_embedding_provider, IndexStore, SqliteIndexStore};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "coach")]
#[command(about = "Watch career documents and keep a semantic index of them")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured folders and index changes until Ctrl-C
    Watch,
    /// Reconcile the index with the configured folders once
    Scan,
    /// Query the index
    Query {
        /// Text to search for
        text: String,
        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
        /// Restrict results to one category
        #[arg(long)]
        category: Option<Category>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show index statistics
    Stats {
        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Watch => watch(config).await,
        Commands::Scan => scan(config).await,
        Commands::Query {
            text,
            k,
            category,
            json,
        } => query(config, &text, k, category, json).await,
        Commands::Stats { json } => stats(config, json).await,
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let level = &logging.level;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "coach_cli={level},coach_core={level},coach_parser={level},coach_vector={level},coach_ingest={level}"
        ))
    });

    if logging.json_format {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteIndexStore>> {
    let embedder = create_embedding_provider(&config.embedding)?;
    let store = SqliteIndexStore::open(&config.store, embedder)
        .await
        .with_context(|| format!("opening index at {}", config.store.path.display()))?
        .with_chunker(Chunker::new(config.chunking.clone()));
    Ok(Arc::new(store))
}

fn build_pipeline(config: &AppConfig, store: Arc<SqliteIndexStore>) -> Arc<IngestPipeline> {
    Arc::new(IngestPipeline::new(
        store,
        ParserRegistry::with_defaults(),
        Classifier::from_config(&config.classifier).with_roots(&config.watch.roots),
        config.pipeline.clone(),
    ))
}

fn ensure_roots(config: &AppConfig) -> anyhow::Result<()> {
    for root in &config.watch.roots {
        std::fs::create_dir_all(root)
            .with_context(|| format!("creating watched folder {}", root.display()))?;
    }
    Ok(())
}

async fn watch(config: AppConfig) -> anyhow::Result<()> {
    ensure_roots(&config)?;
    let store = open_store(&config).await?;
    let pipeline = build_pipeline(&config, store.clone());

    let session = IngestSession::start(&config.watch, pipeline).await?;
    println!(
        "Watching {} folder(s), initial scan: {}",
        session.watch().roots().len(),
        session.reconciled()
    );

    let result = session
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
            }
        })
        .await;
    store.close().await;

    let summary = result?;
    println!("Stopped: {summary}");
    print_cache_stats(store.as_ref());
    Ok(())
}

fn print_cache_stats(store: &dyn IndexStore) {
    if let Some(cache) = store.embedding_cache() {
        println!("{cache}");
    }
}

async fn scan(config: AppConfig) -> anyhow::Result<()> {
    ensure_roots(&config)?;
    let store = open_store(&config).await?;
    let pipeline = build_pipeline(&config, store.clone());

    let result = pipeline
        .reconcile(&config.watch.roots, config.watch.recursive)
        .await;
    store.close().await;

    println!("Scan finished: {}", result?);
    print_cache_stats(store.as_ref());
    Ok(())
}

async fn query(
    config: AppConfig,
    text: &str,
    k: usize,
    category: Option<Category>,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let matches = store.query(text, k, category).await;
    store.close().await;
    let matches = matches?;

    if json {
        println!("{}", serde_json::to_string_pretty(&matches)?);
        return Ok(());
    }

    if matches.is_empty() {
        println!("No matches.");
    }
    for (rank, m) in matches.iter().enumerate() {
        println!(
            "{:>2}. [{:.3}] {} ({})",
            rank + 1,
            m.score,
            m.identity,
            m.category
        );
        if let Some(heading) = &m.heading {
            println!("    ({heading})");
        }
        let preview: String = m.passage.split_whitespace().take(24).collect::<Vec<_>>().join(" ");
        if !preview.is_empty() {
            println!("    {preview}");
        }
    }
    Ok(())
}

async fn stats(config: AppConfig, json: bool) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let stats = store.stats().await;
    store.close().await;
    let stats = stats?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Collection: {}", stats.collection);
    println!("Embedding:  {} ({} dims)", stats.embedding_model, stats.dimension);
    println!("Documents:  {}", stats.total);
    println!("Passages:   {}", stats.chunks);
    for (category, count) in &stats.by_category {
        println!("  {category:<14} {count}");
    }
    Ok(())
}
