// src/main.rs

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use uuid::Uuid;

use ncm_clustering_lib::clustering::{Clusterer, LocalFingerprintClusterer, RefineClusterer};
use ncm_clustering_lib::config::{ClusterBackend, PipelineConfig, RerunPolicy};
use ncm_clustering_lib::pipeline::NcmClusteringPipeline;
use ncm_clustering_lib::store::{MemoryStore, PgStore};
use ncm_clustering_lib::utils::db_connect::{connect, get_pool_status};
use ncm_clustering_lib::utils::env::{load_env, load_env_from_file};
use ncm_clustering_lib::utils::progress_config::ProgressConfig;

#[derive(Parser)]
#[command(author, version, about = "Clusters product names per NCM code", long_about = None)]
struct Args {
    /// Only process these NCM codes (repeatable)
    #[arg(long = "ncm")]
    ncm: Vec<String>,

    /// Clustering backend: openrefine or local
    #[arg(long)]
    backend: Option<String>,

    /// Skip codes that already have an audit record
    #[arg(long)]
    skip_processed: bool,

    /// Dry run mode (read and cluster, don't write to the database)
    #[arg(long)]
    dry_run: bool,

    /// Env file to load instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn build_clusterer(config: &PipelineConfig) -> Result<Box<dyn Clusterer>> {
    Ok(match config.backend {
        ClusterBackend::OpenRefine => Box::new(
            RefineClusterer::new(&config.refine_url, config.refine_timeout, config.ngram_size)
                .context("Failed to set up OpenRefine client")?,
        ),
        ClusterBackend::Local => Box::new(LocalFingerprintClusterer::new(config.ngram_size)),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging and environment
    env_logger::init();
    info!("Starting NCM product name clustering pipeline");
    match &args.env_file {
        Some(path) => load_env_from_file(path),
        None => load_env(),
    }

    let mut config = PipelineConfig::from_env();
    if let Some(raw) = &args.backend {
        config.backend = ClusterBackend::parse(raw)
            .with_context(|| format!("Unknown backend '{}'; expected openrefine or local", raw))?;
    }
    if args.skip_processed {
        config.rerun_policy = RerunPolicy::SkipProcessed;
    }
    config.only_codes = args.ncm.clone();
    config.log_config();

    let progress_config = ProgressConfig::from_env();
    let clusterer = build_clusterer(&config)?;

    let pool = connect().await.context("Failed to connect to database")?;
    info!("Successfully connected to the database");
    let store = PgStore::new(pool, config.codes_query.clone(), config.names_query.clone());

    let run_id = Uuid::new_v4().to_string();
    info!("Pipeline run ID: {} - {}", run_id, Local::now().to_rfc3339());

    let result = if args.dry_run {
        warn!("Dry run: assignments and audit records are kept in memory only");
        let sink = MemoryStore::new();
        let pipeline = NcmClusteringPipeline::new(&store, &sink, clusterer.as_ref(), &config, run_id.as_str())
            .with_progress(progress_config.clone());
        let result = pipeline.run().await;
        info!(
            "Dry run would have written {} assignment rows and {} audit rows",
            sink.assignments().len(),
            sink.audits().len()
        );
        result
    } else {
        let pipeline = NcmClusteringPipeline::new(&store, &store, clusterer.as_ref(), &config, run_id.as_str())
            .with_progress(progress_config.clone());
        pipeline.run().await
    };

    if progress_config.should_show_db_connection_stats() {
        let (size, idle) = get_pool_status(store.pool());
        info!("DB: {}/{} (used/total)", size - idle, size);
    }

    // Closed once, whatever the run's outcome.
    store.close();

    let stats = result.context("NCM clustering run aborted")?;
    info!(
        "Pipeline run {} completed: {} of {} codes clustered",
        stats.run_id, stats.codes_done, stats.codes_seen
    );
    Ok(())
}
