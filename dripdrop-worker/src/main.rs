// DripDrop pipeline worker
// Runs the dispatcher and stage workers, or drives one upload through them locally

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use dripdrop_core::payloads::from_json;
use dripdrop_core::{CorrelationId, PipelineConfig, PostId, PostStatus, UploadEvent};
use dripdrop_eye::HttpInferenceEndpoint;
use dripdrop_pipeline::{queues, Pipeline, Stores};
use dripdrop_storage::Catalog;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dripdrop-worker")]
#[command(about = "DripDrop clothing-item pipeline worker", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher and all stage workers until interrupted.
    /// Upload events are read from stdin, one JSON object per line.
    Run {
        /// Add unknown images to the catalog under a new private post
        #[arg(long)]
        register_images: bool,
    },

    /// Push one upload through every stage and print the resulting record
    Submit {
        #[arg(long)]
        image_path: String,

        #[arg(long)]
        post_id: Option<u64>,
    },

    /// Print the processing record of an image
    Status {
        #[arg(long)]
        correlation_id: String,
    },

    /// Replay upload events and list what a queue dead-lettered
    DeadLetters {
        #[arg(long, default_value = queues::UPLOADS)]
        queue: String,

        /// File of upload events, one JSON object per line
        #[arg(long)]
        events: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path).with_context(|| format!("loading config from {}", path))?,
        None => PipelineConfig::default(),
    };
    config.apply_env();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn build_pipeline(config: PipelineConfig) -> anyhow::Result<Pipeline> {
    let stores = Stores::open(&config)?;
    let endpoint = HttpInferenceEndpoint::new(
        config.inference.control_url.clone(),
        config.inference.runtime_url.clone(),
        Duration::from_millis(config.inference.request_timeout_ms),
    );
    Ok(Pipeline::from_config(config, stores, Arc::new(endpoint))?)
}

/// The catalog is local to this process, so images have to be known to it
/// before Persistence can attach items.
async fn register_image(catalog: &dyn Catalog, image_path: &str) -> anyhow::Result<PostId> {
    if let Some(image) = catalog.find_image_by_path(image_path).await? {
        if let Some(post) = image.post_id {
            return Ok(post);
        }
    }
    let post = catalog.insert_post(PostStatus::Private).await?;
    catalog.insert_image(image_path, Some(post)).await?;
    debug!(image_path, post_id = %post, "registered image");
    Ok(post)
}

async fn feed_stdin(pipeline: Arc<Pipeline>, register_images: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if register_images {
            if let Ok(UploadEvent { image_path: Some(path), .. }) = from_json::<UploadEvent>(line.as_bytes()) {
                register_image(pipeline.catalog(), path.trim()).await?;
            }
        }
        // malformed lines still go through so the dispatcher can dead-letter them
        let message_id = pipeline
            .handoff()
            .queue()
            .send(queues::UPLOADS, Bytes::from(line.to_string()))
            .await?;
        debug!(%message_id, "upload queued");
    }
    info!("stdin closed, no more uploads");
    Ok(())
}

async fn run(pipeline: Pipeline, register_images: bool) -> anyhow::Result<()> {
    let grace = Duration::from_millis(pipeline.config().worker.shutdown_grace_ms);
    let pipeline = Arc::new(pipeline);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(shutdown_rx).await })
    };
    let feeder = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = feed_stdin(pipeline, register_images).await {
                warn!(error = %e, "upload feed stopped");
            }
        })
    };

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    feeder.abort();
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(grace, runner).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "workers did not stop within the grace period");
    }
    Ok(())
}

async fn submit(pipeline: Pipeline, image_path: String, post_id: Option<u64>) -> anyhow::Result<()> {
    let registered = register_image(pipeline.catalog(), image_path.trim()).await?;
    let event = UploadEvent::new(image_path, post_id.map(PostId).or(Some(registered)));

    let id = pipeline.dispatcher().dispatch(event).await?;
    let handled = pipeline.run_until_idle().await?;
    info!(correlation_id = %id, handled, "upload drained");

    let record = pipeline.record(&id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    let stats = pipeline.catalog().stats().await?;
    println!(
        "catalog: {} items, {} tags, {} item tags",
        stats.clothing_items, stats.tags, stats.item_tags
    );
    for queue in queues::ALL {
        for letter in pipeline.handoff().queue().dead_letters(queue).await? {
            println!("dead letter on {}: {}", queue, letter.reason);
        }
    }
    Ok(())
}

async fn status(pipeline: Pipeline, correlation_id: &str) -> anyhow::Result<()> {
    if pipeline.config().storage.backend == dripdrop_core::config::StorageBackend::Memory {
        warn!("memory backend: only records created by this process are visible");
    }
    let id = CorrelationId::parse(correlation_id)?;
    let record = pipeline.record(&id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

async fn dead_letters(pipeline: Pipeline, queue: &str, events: PathBuf) -> anyhow::Result<()> {
    if !queues::ALL.contains(&queue) {
        anyhow::bail!("unknown queue '{}', expected one of {:?}", queue, queues::ALL);
    }
    let content = tokio::fs::read_to_string(&events)
        .await
        .with_context(|| format!("reading {}", events.display()))?;
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Ok(UploadEvent { image_path: Some(path), .. }) = from_json::<UploadEvent>(line.as_bytes()) {
            register_image(pipeline.catalog(), path.trim()).await?;
        }
        pipeline
            .handoff()
            .queue()
            .send(queues::UPLOADS, Bytes::from(line.to_string()))
            .await?;
    }
    pipeline.run_until_idle().await?;

    let letters = pipeline.handoff().queue().dead_letters(queue).await?;
    if letters.is_empty() {
        println!("no dead letters on {}", queue);
    }
    for letter in letters {
        println!(
            "{} receives={} at={} reason={} body={}",
            letter.message_id,
            letter.receive_count,
            letter.dead_lettered_at.to_rfc3339(),
            letter.reason,
            String::from_utf8_lossy(&letter.body)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.log_level), cli.log_format);

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Run { register_images } => {
            info!(
                backend = ?config.storage.backend,
                image_root = %config.storage.image_root.display(),
                "starting dripdrop worker"
            );
            run(build_pipeline(config)?, register_images).await?;
        }
        Commands::Submit { image_path, post_id } => {
            submit(build_pipeline(config)?, image_path, post_id).await?;
        }
        Commands::Status { correlation_id } => {
            status(build_pipeline(config)?, &correlation_id).await?;
        }
        Commands::DeadLetters { queue, events } => {
            dead_letters(build_pipeline(config)?, &queue, events).await?;
        }
    }

    Ok(())
}
