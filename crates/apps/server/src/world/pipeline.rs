//! Chunk resolution: cache, then storage, then the terrain generator.
//!
//! Concurrent requests for one coordinate share a single resolution task and
//! receive the same `Arc<Chunk>`. A resolution whose last waiter goes away
//! before generation has started is cancelled; once the generator is running
//! the chunk is finished and cached regardless. Failures are reported to the
//! waiters of that resolution and never cached.
//!
//! Saves write the whole chunk when it was never stored or has collected
//! more than `partial_save_limit` edits, and otherwise only the list of
//! changed blocks. Loading replays that list over the stored chunk.

use super::cache::{ChunkCache, SavePlan};
use super::chunk::{Chunk, ChunkError, GenerationState, LocalPos};
use super::nbt;
use super::storage::{ChunkStorage, StorageError};
use super::PersistenceError;
use crate::config::WorldConfig;
use crate::events::{ChunkSource, EventHooks};
use crate::metrics::ServerMetrics;
use parking_lot::Mutex;
use reactocraft_protocol::{BlockPosition, ChunkCoordinate};
use reactocraft_worldgen::GenerationPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("chunk {coord} could not be generated: {reason}")]
    GenerationFailed {
        coord: ChunkCoordinate,
        reason: String,
    },
    #[error("resolution of chunk {0} was cancelled")]
    Cancelled(ChunkCoordinate),
    #[error("resolution of chunk {0} ended without a result")]
    Aborted(ChunkCoordinate),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub seed: u64,
    pub cache_capacity: usize,
    pub save_interval: Duration,
    pub gc_interval: Duration,
    pub unload_after: Duration,
    pub partial_save_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&WorldConfig::default())
    }
}

impl From<&WorldConfig> for PipelineConfig {
    fn from(world: &WorldConfig) -> Self {
        Self {
            seed: world.seed,
            cache_capacity: world.cache_capacity,
            save_interval: world.save_interval,
            gc_interval: world.gc_interval,
            unload_after: world.unload_after,
            partial_save_limit: world.partial_save_limit,
        }
    }
}

type Outcome = Option<Result<Arc<Chunk>, ResolveError>>;

struct InFlight {
    id: u64,
    result: watch::Receiver<Outcome>,
    waiters: usize,
    cancel: CancellationToken,
    generating: bool,
}

/// Shared handle to the chunk pipeline. Cheap to clone.
#[derive(Clone)]
pub struct ChunkPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    config: PipelineConfig,
    cache: ChunkCache,
    storage: Arc<dyn ChunkStorage>,
    generator: Arc<GenerationPool>,
    in_flight: Mutex<HashMap<ChunkCoordinate, InFlight>>,
    next_flight: AtomicU64,
    save_lock: tokio::sync::Mutex<()>,
    hooks: EventHooks,
    metrics: Arc<ServerMetrics>,
}

impl ChunkPipeline {
    pub fn new(
        config: PipelineConfig,
        storage: Arc<dyn ChunkStorage>,
        generator: Arc<GenerationPool>,
        hooks: EventHooks,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                cache: ChunkCache::new(config.cache_capacity),
                config,
                storage,
                generator,
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                save_lock: tokio::sync::Mutex::new(()),
                hooks,
                metrics,
            }),
        }
    }

    pub fn cache(&self) -> &ChunkCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Resolve a chunk through cache, storage and generation.
    pub async fn resolve(&self, coord: ChunkCoordinate) -> Result<Arc<Chunk>, ResolveError> {
        if let Some(chunk) = self.inner.cache.get(coord) {
            ServerMetrics::incr(&self.inner.metrics.cache_hits);
            self.inner.hooks.chunk_resolved(coord, ChunkSource::Cache);
            return Ok(chunk);
        }

        let (mut result, _waiter) = self.join(coord);
        let outcome = match result.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(ResolveError::Aborted(coord)))
    }

    /// Attach to the running resolution for `coord`, starting one if needed.
    fn join(&self, coord: ChunkCoordinate) -> (watch::Receiver<Outcome>, Waiter) {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(flight) = in_flight.get_mut(&coord) {
            flight.waiters += 1;
            let waiter = Waiter {
                pipeline: Arc::clone(&self.inner),
                coord,
                id: flight.id,
            };
            return (flight.result.clone(), waiter);
        }

        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
        let (sender, result) = watch::channel(None);
        let cancel = CancellationToken::new();
        in_flight.insert(
            coord,
            InFlight {
                id,
                result: result.clone(),
                waiters: 1,
                cancel: cancel.clone(),
                generating: false,
            },
        );
        drop(in_flight);

        tracing::debug!(%coord, flight = id, "starting chunk resolution");
        tokio::spawn(Arc::clone(&self.inner).run(coord, id, sender, cancel));

        let waiter = Waiter {
            pipeline: Arc::clone(&self.inner),
            coord,
            id,
        };
        (result, waiter)
    }

    /// Where `coord` is in its lifecycle, if anywhere.
    pub fn state(&self, coord: ChunkCoordinate) -> Option<GenerationState> {
        if let Some(flight) = self.inner.in_flight.lock().get(&coord) {
            return Some(if flight.generating {
                GenerationState::Generating
            } else {
                GenerationState::Requested
            });
        }
        self.inner.cache.peek(coord).map(|chunk| chunk.state())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Apply a block change to a resident chunk. Returns `Ok(false)` when the
    /// chunk is not loaded; the change is then dropped.
    pub fn apply_block(&self, position: BlockPosition, block_id: u16) -> Result<bool, ChunkError> {
        self.inner.cache.set_block(position, block_id)
    }

    /// Mark a chunk as held by a session so it stays resident.
    pub fn retain(&self, coord: ChunkCoordinate) -> bool {
        self.inner.cache.pin(coord)
    }

    pub fn release(&self, coord: ChunkCoordinate) {
        self.inner.cache.unpin(coord);
    }

    /// Persist every dirty chunk now. Returns how many were written.
    pub async fn flush_all(&self) -> usize {
        self.inner.save_dirty().await
    }

    /// Run periodic dirty saves and idle unloading until `shutdown` fires,
    /// then flush everything.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut save = tokio::time::interval(inner.config.save_interval);
            let mut gc = tokio::time::interval(inner.config.gc_interval);
            save.set_missed_tick_behavior(MissedTickBehavior::Delay);
            gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
            save.tick().await;
            gc.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = save.tick() => {
                        let saved = inner.save_dirty().await;
                        if saved > 0 {
                            tracing::debug!(saved, "saved dirty chunks");
                        }
                    }
                    _ = gc.tick() => inner.collect_idle().await,
                }
            }

            let saved = inner.save_dirty().await;
            tracing::info!(saved, "chunk pipeline flushed");
        })
    }
}

/// One caller waiting on a resolution. Dropping the last one before
/// generation starts cancels the resolution.
struct Waiter {
    pipeline: Arc<PipelineInner>,
    coord: ChunkCoordinate,
    id: u64,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut in_flight = self.pipeline.in_flight.lock();
        let Some(flight) = in_flight.get_mut(&self.coord) else {
            return;
        };
        if flight.id != self.id {
            return;
        }
        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 && !flight.generating {
            flight.cancel.cancel();
            in_flight.remove(&self.coord);
            tracing::debug!(coord = %self.coord, flight = self.id, "chunk resolution cancelled");
        }
    }
}

/// Removes the in-flight entry however the resolution task ends.
struct FlightGuard<'a> {
    pipeline: &'a PipelineInner,
    coord: ChunkCoordinate,
    id: u64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.pipeline.finish(self.coord, self.id);
    }
}

impl PipelineInner {
    async fn run(
        self: Arc<Self>,
        coord: ChunkCoordinate,
        id: u64,
        sender: watch::Sender<Outcome>,
        cancel: CancellationToken,
    ) {
        let _guard = FlightGuard {
            pipeline: &self,
            coord,
            id,
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ResolveError::Cancelled(coord)),
            outcome = self.produce(coord, id) => outcome,
        };

        match &outcome {
            Ok((_, source)) => {
                tracing::debug!(%coord, %source, "chunk resolved");
                self.hooks.chunk_resolved(coord, *source);
            }
            Err(ResolveError::Cancelled(_)) => {}
            Err(err) => tracing::warn!(%coord, error = %err, "chunk resolution failed"),
        }

        self.finish(coord, id);
        let _ = sender.send(Some(outcome.map(|(chunk, _)| chunk)));
    }

    fn finish(&self, coord: ChunkCoordinate, id: u64) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&coord).is_some_and(|flight| flight.id == id) {
            in_flight.remove(&coord);
        }
    }

    async fn produce(
        self: &Arc<Self>,
        coord: ChunkCoordinate,
        id: u64,
    ) -> Result<(Arc<Chunk>, ChunkSource), ResolveError> {
        if let Some(chunk) = self.cache.get(coord) {
            ServerMetrics::incr(&self.metrics.cache_hits);
            return Ok((chunk, ChunkSource::Cache));
        }

        match self.load_persisted(coord).await {
            Ok(Some((chunk, changed))) => {
                ServerMetrics::incr(&self.metrics.storage_loads);
                let chunk = Arc::new(chunk);
                let blocked = self.cache.insert_persisted(Arc::clone(&chunk), changed);
                self.make_room(blocked);
                return Ok((chunk, ChunkSource::Storage));
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%coord, error = %err, "failed to load stored chunk, regenerating");
            }
        }

        if !self.begin_generation(coord, id) {
            return Err(ResolveError::Cancelled(coord));
        }

        let generated = self
            .generator
            .generate_with_retry(coord, self.config.seed)
            .await
            .map_err(|err| err.to_string())
            .and_then(|blocks| {
                Chunk::new(coord, blocks, GenerationState::Ready).map_err(|err| err.to_string())
            });
        let chunk = match generated {
            Ok(chunk) => Arc::new(chunk),
            Err(reason) => {
                ServerMetrics::incr(&self.metrics.generation_failures);
                return Err(ResolveError::GenerationFailed { coord, reason });
            }
        };
        ServerMetrics::incr(&self.metrics.chunks_generated);

        let blocked = self.cache.insert(Arc::clone(&chunk), true);
        self.spawn_save(Arc::clone(&chunk));
        self.make_room(blocked);
        Ok((chunk, ChunkSource::Generated))
    }

    /// Flag the resolution as generating unless it was cancelled meanwhile.
    fn begin_generation(&self, coord: ChunkCoordinate, id: u64) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(&coord) {
            Some(flight) if flight.id == id && !flight.cancel.is_cancelled() => {
                flight.generating = true;
                true
            }
            _ => false,
        }
    }

    /// Stored chunk with its partial changes applied, plus the positions
    /// those changes touched.
    async fn load_persisted(
        &self,
        coord: ChunkCoordinate,
    ) -> Result<Option<(Chunk, Vec<LocalPos>)>, PersistenceError> {
        let storage = Arc::clone(&self.storage);
        let loaded = task::spawn_blocking(
            move || -> Result<Option<(Chunk, Vec<LocalPos>)>, PersistenceError> {
                match storage.load(coord) {
                    Ok(blob) => {
                        let base = nbt::decode_chunk(coord, &blob)?;
                        Ok(Some(replay_partial(storage.as_ref(), base)))
                    }
                    Err(StorageError::NotFound(_)) => Ok(None),
                    Err(err) => Err(PersistenceError::from(err)),
                }
            },
        )
        .await??;
        Ok(loaded)
    }

    /// Write the newest snapshot of `chunk`'s coordinate, in full or as a
    /// partial change list, and mark it clean.
    async fn save(&self, chunk: Arc<Chunk>) -> Result<(), PersistenceError> {
        let _serial = self.save_lock.lock().await;
        let coord = chunk.coord();
        // An edit may have replaced the snapshot since this save was queued,
        // or an earlier save already covered it.
        let Some((snapshot, plan)) = self.cache.save_plan(coord, self.config.partial_save_limit)
        else {
            return Ok(());
        };
        let full = plan == SavePlan::Full;

        let storage = Arc::clone(&self.storage);
        let written = Arc::clone(&snapshot);
        task::spawn_blocking(move || -> Result<(), PersistenceError> {
            match plan {
                SavePlan::Full => {
                    let blob = nbt::encode_chunk(&written)?;
                    storage.store(coord, &blob)?;
                    storage.remove_partial(coord)?;
                }
                SavePlan::Partial(changes) => {
                    let blob = nbt::encode_partial(coord, &changes)?;
                    storage.store_partial(coord, &blob)?;
                }
            }
            Ok(())
        })
        .await??;

        snapshot.set_state(GenerationState::Persisted);
        self.cache.mark_saved(&snapshot, full);
        ServerMetrics::incr(&self.metrics.chunks_saved);
        if !full {
            ServerMetrics::incr(&self.metrics.partial_saves);
        }
        Ok(())
    }

    fn spawn_save(self: &Arc<Self>, chunk: Arc<Chunk>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let coord = chunk.coord();
            if let Err(err) = inner.save(chunk).await {
                tracing::warn!(%coord, error = %err, "failed to persist chunk, keeping it dirty");
            }
        });
    }

    /// Save dirty chunks blocking eviction, then trim again.
    fn make_room(self: &Arc<Self>, blocked: Vec<Arc<Chunk>>) {
        if blocked.is_empty() {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            for chunk in blocked {
                let coord = chunk.coord();
                if let Err(err) = inner.save(chunk).await {
                    tracing::warn!(%coord, error = %err, "failed to persist chunk before eviction");
                }
            }
            let (evicted, _) = inner.cache.trim();
            ServerMetrics::add(&inner.metrics.chunks_unloaded, evicted.len() as u64);
        });
    }

    async fn save_dirty(&self) -> usize {
        let mut saved = 0;
        for chunk in self.cache.dirty_chunks() {
            let coord = chunk.coord();
            match self.save(chunk).await {
                Ok(()) => saved += 1,
                Err(err) => tracing::warn!(%coord, error = %err, "failed to save dirty chunk"),
            }
        }
        saved
    }

    async fn collect_idle(&self) {
        let unload_after = self.config.unload_after;
        for chunk in self.cache.idle(unload_after) {
            if self.cache.is_dirty(chunk.coord()) {
                let coord = chunk.coord();
                if let Err(err) = self.save(chunk).await {
                    tracing::warn!(%coord, error = %err, "failed to save idle chunk");
                }
            }
        }

        let idle = self.cache.evict_idle(unload_after).len();
        let (trimmed, _) = self.cache.trim();
        let unloaded = idle + trimmed.len();
        if unloaded > 0 {
            ServerMetrics::add(&self.metrics.chunks_unloaded, unloaded as u64);
            tracing::debug!(unloaded, resident = self.cache.len(), "unloaded idle chunks");
        }
    }
}

/// Apply the partial file of `base`'s chunk, if any. An unreadable partial
/// file leaves the stored chunk as it is.
fn replay_partial(storage: &dyn ChunkStorage, base: Chunk) -> (Chunk, Vec<LocalPos>) {
    let coord = base.coord();
    let changes = match storage.load_partial(coord) {
        Ok(blob) => nbt::decode_partial(coord, &blob),
        Err(StorageError::NotFound(_)) => return (base, Vec::new()),
        Err(err) => {
            tracing::warn!(%coord, error = %err, "failed to read partial chunk file");
            return (base, Vec::new());
        }
    };
    let replayed = changes
        .map_err(PersistenceError::from)
        .and_then(|changes| {
            let chunk = base.with_changes(&changes, GenerationState::Persisted)?;
            Ok((chunk, changes.iter().map(|change| change.pos).collect()))
        });
    match replayed {
        Ok(replayed) => replayed,
        Err(err) => {
            tracing::warn!(%coord, error = %err, "ignoring bad partial chunk file");
            (base, Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::storage::MemoryStorage;
    use reactocraft_worldgen::{InProcessGenerator, PoolConfig, TerrainMode};

    fn pipeline(storage: Arc<MemoryStorage>) -> ChunkPipeline {
        let pool = GenerationPool::new(
            Arc::new(InProcessGenerator::new(TerrainMode::Flat)),
            PoolConfig::default(),
        )
        .unwrap();
        ChunkPipeline::new(
            PipelineConfig::default(),
            storage,
            Arc::new(pool),
            EventHooks::new(),
            Arc::new(ServerMetrics::default()),
        )
    }

    #[tokio::test]
    async fn generated_chunks_are_cached_and_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let pipeline = pipeline(storage.clone());
        let coord = ChunkCoordinate::new(2, 3);

        let first = pipeline.resolve(coord).await.unwrap();
        let second = pipeline.resolve(coord).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pipeline.in_flight(), 0);

        pipeline.flush_all().await;
        assert!(storage.contains(coord));
        assert!(!pipeline.cache().is_dirty(coord));
        assert_eq!(pipeline.state(coord), Some(GenerationState::Persisted));
    }

    #[tokio::test]
    async fn block_edits_mark_chunks_dirty() {
        let storage = Arc::new(MemoryStorage::new());
        let pipeline = pipeline(storage);
        let position = BlockPosition::new(3, 10, 4);

        assert_eq!(pipeline.apply_block(position, 6), Ok(false));

        let before = pipeline.resolve(position.chunk()).await.unwrap();
        pipeline.flush_all().await;
        assert_eq!(pipeline.apply_block(position, 6), Ok(true));
        assert!(pipeline.cache().is_dirty(position.chunk()));

        let after = pipeline.resolve(position.chunk()).await.unwrap();
        assert_eq!(after.block_at(position), Some(6));
        assert_eq!(before.block_at(position), Some(0));
    }
}
