use anyhow::{Context, Result};
use clap::Parser;
use reactocraft_server::{
    metrics::start_metrics_reporter,
    world::{FileStorage, PipelineConfig},
    ChunkPipeline, EventHooks, GeneratorBackend, Server, ServerConfig, ServerMetrics,
};
use reactocraft_worldgen::{GenerationPool, TerrainMode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "reactocraft-server")]
#[command(about = "Multiplayer voxel-world server", long_about = None)]
struct Args {
    /// Address to listen on (overrides REACTOCRAFT_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Directory for chunk files (overrides REACTOCRAFT_CHUNK_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// World seed
    #[arg(long)]
    seed: Option<u64>,

    /// Terrain mode: flat or noise
    #[arg(long)]
    terrain: Option<String>,

    /// Generator backend: in-process or native
    #[arg(long)]
    generator: Option<GeneratorBackend>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) -> Result<()> {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(dir) = self.data_dir {
            config.world.chunk_dir = dir.join("chunks");
        }
        if let Some(seed) = self.seed {
            config.world.seed = seed;
        }
        if let Some(name) = self.terrain {
            config.world.terrain_mode = TerrainMode::parse(&name)
                .with_context(|| format!("unknown terrain mode `{name}`"))?;
        }
        if let Some(generator) = self.generator {
            config.world.generator = generator;
        }
        config.validate()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::from_env()?;
    Args::parse().apply(&mut config)?;

    tracing::info!("ReactoCraft server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind = %config.bind_address,
        chunks = %config.world.chunk_dir.display(),
        seed = config.world.seed,
        mode = ?config.world.terrain_mode,
        "starting"
    );

    let metrics = Arc::new(ServerMetrics::default());
    let hooks = EventHooks::new();

    let storage = FileStorage::open(&config.world.chunk_dir)
        .with_context(|| format!("failed to open {}", config.world.chunk_dir.display()))?;
    let generator = config
        .world
        .terrain_generator()
        .context("failed to set up the terrain generator")?;
    let pool = GenerationPool::new(generator, config.world.pool_config())
        .context("failed to start generation workers")?;
    tracing::info!(generator = pool.description(), "generation pool ready");

    let pipeline = ChunkPipeline::new(
        PipelineConfig::from(&config.world),
        Arc::new(storage),
        Arc::new(pool),
        hooks.clone(),
        Arc::clone(&metrics),
    );

    let shutdown = CancellationToken::new();
    let maintenance = pipeline.spawn_maintenance(shutdown.clone());
    if !config.metrics_interval.is_zero() {
        tokio::spawn(start_metrics_reporter(
            Arc::clone(&metrics),
            config.metrics_interval,
        ));
    }

    let server = Server::bind(config, pipeline, hooks, Arc::clone(&metrics)).await?;
    tracing::info!(addr = %server.local_addr()?, "server ready");

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("interrupt received, shutting down"),
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
        trigger.cancel();
    });

    server.run(shutdown).await?;
    maintenance.await.context("maintenance task failed")?;
    metrics.print_stats();
    Ok(())
}
