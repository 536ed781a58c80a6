use reactocraft_worldgen::{
    GenerationError, InProcessGenerator, NativeGenerator, PoolConfig, TerrainGenerator,
    TerrainMode,
};
use std::{env, path::PathBuf, str::FromStr, sync::Arc, time::Duration};

/// Configuration for the ReactoCraft server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address and port the TCP listener binds to (e.g. `0.0.0.0:25575`).
    pub bind_address: String,
    /// Concurrent logged-in sessions before logins are refused.
    pub max_sessions: usize,
    /// Upper bound applied to the view distance a client asks for.
    pub max_view_distance: u8,
    /// Encoded frames that may wait in one connection's outbound queue.
    pub outbound_queue: usize,
    /// Chunk requests one connection may have in flight before its reader pauses.
    pub max_pending_requests: usize,
    /// Handshake plus login must finish within this window after accept.
    pub login_timeout: Duration,
    /// Interval between server keep-alives in play.
    pub keepalive_interval: Duration,
    /// Connections silent for this long are closed.
    pub idle_timeout: Duration,
    /// Time allowed to drain the outbound queue while closing.
    pub flush_timeout: Duration,
    /// Consecutive dropped updates before a slow client is disconnected.
    pub backpressure_strikes: u32,
    /// Capacity of the world-delta channel feeding the broadcaster task.
    pub broadcast_queue: usize,
    /// Interval of the periodic metrics log line. Zero disables it.
    pub metrics_interval: Duration,
    /// World-specific configuration.
    pub world: WorldConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:25575".to_string(),
            max_sessions: 100,
            max_view_distance: 8,
            outbound_queue: 256,
            max_pending_requests: 32,
            login_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(45),
            flush_timeout: Duration::from_secs(2),
            backpressure_strikes: 8,
            broadcast_queue: 1024,
            metrics_interval: Duration::from_secs(30),
            world: WorldConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Builds a configuration from `REACTOCRAFT_*` environment variables,
    /// falling back to the defaults above.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let data_dir = env::var("REACTOCRAFT_DATA").unwrap_or_else(|_| "data".to_string());
        let bind_address = env::var("REACTOCRAFT_BIND").unwrap_or(defaults.bind_address);

        let config = Self {
            bind_address,
            max_sessions: env_or("REACTOCRAFT_MAX_SESSIONS", defaults.max_sessions),
            max_view_distance: env_or("REACTOCRAFT_MAX_VIEW_DISTANCE", defaults.max_view_distance),
            outbound_queue: env_or("REACTOCRAFT_OUTBOUND_QUEUE", defaults.outbound_queue),
            max_pending_requests: env_or(
                "REACTOCRAFT_MAX_PENDING_REQUESTS",
                defaults.max_pending_requests,
            ),
            login_timeout: env_millis("REACTOCRAFT_LOGIN_TIMEOUT_MS", defaults.login_timeout),
            keepalive_interval: env_millis(
                "REACTOCRAFT_KEEPALIVE_INTERVAL_MS",
                defaults.keepalive_interval,
            ),
            idle_timeout: env_millis("REACTOCRAFT_IDLE_TIMEOUT_MS", defaults.idle_timeout),
            flush_timeout: env_millis("REACTOCRAFT_FLUSH_TIMEOUT_MS", defaults.flush_timeout),
            backpressure_strikes: env_or(
                "REACTOCRAFT_BACKPRESSURE_STRIKES",
                defaults.backpressure_strikes,
            ),
            broadcast_queue: env_or("REACTOCRAFT_BROADCAST_QUEUE", defaults.broadcast_queue),
            metrics_interval: env_millis(
                "REACTOCRAFT_METRICS_INTERVAL_MS",
                defaults.metrics_interval,
            ),
            world: WorldConfig::from_env(&data_dir)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_sessions >= 1, "max sessions must be >= 1");
        anyhow::ensure!(self.max_view_distance >= 1, "max view distance must be >= 1");
        // one slot stays reserved for the closing Disconnect
        anyhow::ensure!(self.outbound_queue >= 2, "outbound queue must hold at least two frames");
        anyhow::ensure!(self.broadcast_queue >= 1, "broadcast queue must hold at least one delta");
        anyhow::ensure!(
            self.max_pending_requests >= 1,
            "max pending requests must be >= 1"
        );
        anyhow::ensure!(
            self.backpressure_strikes >= 1,
            "backpressure strikes must be >= 1"
        );
        anyhow::ensure!(
            self.keepalive_interval < self.idle_timeout,
            "keepalive interval must be shorter than the idle timeout"
        );
        self.world.validate()
    }
}

/// Where terrain comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorBackend {
    /// Algorithms linked into the server binary.
    InProcess,
    /// The terrain library loaded at runtime over its C ABI.
    Native,
}

impl FromStr for GeneratorBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" => Ok(Self::InProcess),
            "native" => Ok(Self::Native),
            other => anyhow::bail!("unknown generator backend `{other}`"),
        }
    }
}

/// Configuration describing how chunks are generated, cached and persisted.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Directory holding `<x>_<z>.dat` chunk files and their
    /// `<x>_<z>_partial.dat` change lists.
    pub chunk_dir: PathBuf,
    pub seed: u64,
    pub terrain_mode: TerrainMode,
    pub generator: GeneratorBackend,
    /// Directories searched for the native terrain library.
    pub library_search_path: Vec<PathBuf>,
    pub generation_workers: usize,
    pub generation_queue: usize,
    /// Bound on one generation attempt.
    pub generation_timeout: Duration,
    /// Total generation attempts per chunk (the first try plus retries).
    pub generation_attempts: u32,
    pub cache_capacity: usize,
    /// Interval between dirty-chunk saves.
    pub save_interval: Duration,
    /// Interval between idle-chunk collection passes.
    pub gc_interval: Duration,
    /// Unpinned chunks untouched for this long are unloaded.
    pub unload_after: Duration,
    /// Changed blocks a chunk may accumulate before a save rewrites the
    /// whole chunk file instead of its partial change list.
    pub partial_save_limit: usize,
}

/// Default for [`WorldConfig::partial_save_limit`].
pub const MAX_DIRTY_BLOCKS_BEFORE_FULL_SAVE: usize = 1000;

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_dir: PathBuf::from("data/chunks"),
            seed: 0,
            terrain_mode: TerrainMode::Noise,
            generator: GeneratorBackend::InProcess,
            library_search_path: vec![PathBuf::from("."), PathBuf::from("target/release")],
            generation_workers: 2,
            generation_queue: 256,
            generation_timeout: Duration::from_secs(5),
            generation_attempts: 2,
            cache_capacity: 256,
            save_interval: Duration::from_secs(30),
            gc_interval: Duration::from_secs(10),
            unload_after: Duration::from_secs(60),
            partial_save_limit: MAX_DIRTY_BLOCKS_BEFORE_FULL_SAVE,
        }
    }
}

impl WorldConfig {
    pub fn from_env(data_dir: &str) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let base = PathBuf::from(data_dir);

        let chunk_dir = env::var("REACTOCRAFT_CHUNK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("chunks"));

        let terrain_mode = match env::var("REACTOCRAFT_TERRAIN") {
            Ok(name) => TerrainMode::parse(&name)
                .ok_or_else(|| anyhow::anyhow!("unknown terrain mode `{name}`"))?,
            Err(_) => defaults.terrain_mode,
        };
        let generator = match env::var("REACTOCRAFT_GENERATOR") {
            Ok(name) => name.parse()?,
            Err(_) => defaults.generator,
        };
        let library_search_path = env::var_os("REACTOCRAFT_LIBRARY_PATH")
            .map(|paths| env::split_paths(&paths).collect())
            .unwrap_or(defaults.library_search_path);

        let config = Self {
            chunk_dir,
            seed: env_or("REACTOCRAFT_SEED", defaults.seed),
            terrain_mode,
            generator,
            library_search_path,
            generation_workers: env_or("REACTOCRAFT_GENERATION_WORKERS", defaults.generation_workers),
            generation_queue: env_or("REACTOCRAFT_GENERATION_QUEUE", defaults.generation_queue),
            generation_timeout: env_millis(
                "REACTOCRAFT_GENERATION_TIMEOUT_MS",
                defaults.generation_timeout,
            ),
            generation_attempts: env_or(
                "REACTOCRAFT_GENERATION_ATTEMPTS",
                defaults.generation_attempts,
            ),
            cache_capacity: env_or("REACTOCRAFT_CACHE_SIZE", defaults.cache_capacity),
            save_interval: env_millis("REACTOCRAFT_SAVE_INTERVAL_MS", defaults.save_interval),
            gc_interval: env_millis("REACTOCRAFT_GC_INTERVAL_MS", defaults.gc_interval),
            unload_after: env_millis("REACTOCRAFT_UNLOAD_AFTER_MS", defaults.unload_after),
            partial_save_limit: env_or(
                "REACTOCRAFT_PARTIAL_SAVE_LIMIT",
                defaults.partial_save_limit,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.generation_workers >= 1, "generation workers must be >= 1");
        anyhow::ensure!(self.generation_attempts >= 1, "generation attempts must be >= 1");
        anyhow::ensure!(self.cache_capacity >= 1, "cache capacity must be >= 1");
        anyhow::ensure!(
            !self.generation_timeout.is_zero(),
            "generation timeout must be non-zero"
        );
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.generation_workers,
            queue_capacity: self.generation_queue,
            timeout: self.generation_timeout,
            attempts: self.generation_attempts,
        }
    }

    /// Terrain generator for the configured backend and mode.
    pub fn terrain_generator(&self) -> Result<Arc<dyn TerrainGenerator>, GenerationError> {
        Ok(match self.generator {
            GeneratorBackend::InProcess => Arc::new(InProcessGenerator::new(self.terrain_mode)),
            GeneratorBackend::Native => Arc::new(NativeGenerator::load_from_search_path(
                &self.library_search_path,
                self.terrain_mode,
            )?),
        })
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn keepalive_must_undercut_idle_timeout() {
        let config = ServerConfig {
            keepalive_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn outbound_queue_leaves_room_for_disconnect() {
        let config = ServerConfig {
            outbound_queue: 1,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_names() {
        assert_eq!(
            "in-process".parse::<GeneratorBackend>().unwrap(),
            GeneratorBackend::InProcess
        );
        assert_eq!(
            " Native ".parse::<GeneratorBackend>().unwrap(),
            GeneratorBackend::Native
        );
        assert!("wasm".parse::<GeneratorBackend>().is_err());
    }

    #[test]
    fn missing_native_library_is_reported() {
        let world = WorldConfig {
            generator: GeneratorBackend::Native,
            library_search_path: vec![PathBuf::from("/nonexistent/reactocraft")],
            ..WorldConfig::default()
        };
        assert!(matches!(
            world.terrain_generator(),
            Err(GenerationError::NotFound(_))
        ));
        assert_eq!(world.pool_config().attempts, 2);
    }
}
