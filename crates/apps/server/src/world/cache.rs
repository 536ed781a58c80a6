use super::chunk::{ChangedBlock, Chunk, ChunkError, LocalPos};
use parking_lot::Mutex;
use reactocraft_protocol::{BlockPosition, ChunkCoordinate};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheEntry {
    chunk: Arc<Chunk>,
    pins: u32,
    dirty: bool,
    /// The stored chunk file is missing or stale; only a full save fixes it.
    full_save: bool,
    /// Blocks edited since the last full save.
    changed: BTreeSet<LocalPos>,
    last_access: Instant,
}

/// How the next save of a chunk is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SavePlan {
    Full,
    Partial(Vec<ChangedBlock>),
}

impl CacheEntry {
    fn evictable(&self) -> bool {
        self.pins == 0 && !self.dirty
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<ChunkCoordinate, CacheEntry>,
    order: VecDeque<ChunkCoordinate>,
}

impl CacheInner {
    fn touch(&mut self, coord: ChunkCoordinate) {
        self.order.retain(|existing| existing != &coord);
        self.order.push_back(coord);
    }

    fn remove(&mut self, coord: ChunkCoordinate) -> Option<CacheEntry> {
        self.order.retain(|existing| existing != &coord);
        self.map.remove(&coord)
    }
}

/// LRU cache of resident chunks.
///
/// Pinned entries (chunks some session holds) are never evicted, and dirty
/// entries are only evicted after they have been saved and marked clean.
/// When nothing is evictable the cache runs over capacity until pins are
/// released or saves complete.
#[derive(Debug)]
pub struct ChunkCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, coord: ChunkCoordinate) -> bool {
        self.inner.lock().map.contains_key(&coord)
    }

    /// Look up a chunk and mark it most recently used.
    pub fn get(&self, coord: ChunkCoordinate) -> Option<Arc<Chunk>> {
        let mut inner = self.inner.lock();
        let entry = inner.map.get_mut(&coord)?;
        entry.last_access = Instant::now();
        let chunk = Arc::clone(&entry.chunk);
        inner.touch(coord);
        Some(chunk)
    }

    /// Look up a chunk without affecting recency.
    pub fn peek(&self, coord: ChunkCoordinate) -> Option<Arc<Chunk>> {
        self.inner
            .lock()
            .map
            .get(&coord)
            .map(|entry| Arc::clone(&entry.chunk))
    }

    /// Insert or replace a chunk, then trim to capacity. A dirty insert
    /// needs a full save.
    ///
    /// Returns the dirty chunks that stand in the way of trimming; once they
    /// are saved and [`mark_saved`](Self::mark_saved), [`trim`](Self::trim)
    /// can evict them.
    pub fn insert(&self, chunk: Arc<Chunk>, dirty: bool) -> Vec<Arc<Chunk>> {
        self.insert_entry(chunk, dirty, Vec::new())
    }

    /// Insert a chunk read back from storage whose partial file recorded
    /// `changed`. Later partial saves keep listing those blocks.
    pub fn insert_persisted(&self, chunk: Arc<Chunk>, changed: Vec<LocalPos>) -> Vec<Arc<Chunk>> {
        self.insert_entry(chunk, false, changed)
    }

    fn insert_entry(&self, chunk: Arc<Chunk>, dirty: bool, changed: Vec<LocalPos>) -> Vec<Arc<Chunk>> {
        let coord = chunk.coord();
        let mut inner = self.inner.lock();

        match inner.map.get_mut(&coord) {
            Some(entry) => {
                entry.chunk = chunk;
                entry.dirty |= dirty;
                entry.full_save |= dirty;
                entry.changed.extend(changed);
                entry.last_access = Instant::now();
            }
            None => {
                inner.map.insert(
                    coord,
                    CacheEntry {
                        chunk,
                        pins: 0,
                        dirty,
                        full_save: dirty,
                        changed: changed.into_iter().collect(),
                        last_access: Instant::now(),
                    },
                );
            }
        }
        inner.touch(coord);

        self.trim_locked(&mut inner, Some(coord)).1
    }

    /// Replace a resident chunk with a copy holding the new block, built
    /// under the cache lock so concurrent edits of one chunk are never lost.
    /// Marks the entry dirty. Returns `Ok(false)` if the chunk is not resident.
    pub fn set_block(&self, position: BlockPosition, block_id: u16) -> Result<bool, ChunkError> {
        let coord = position.chunk();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.map.get_mut(&coord) else {
            return Ok(false);
        };
        let edited = entry.chunk.with_block(position, block_id)?;
        let local = entry.chunk.local_position(position)?;
        entry.chunk = Arc::new(edited);
        entry.dirty = true;
        entry.changed.insert(local);
        entry.last_access = Instant::now();
        inner.touch(coord);
        Ok(true)
    }

    /// Evict least recently used clean, unpinned entries until the cache fits.
    /// Returns the evicted chunks and the dirty ones still over the limit.
    pub fn trim(&self) -> (Vec<Arc<Chunk>>, Vec<Arc<Chunk>>) {
        let mut inner = self.inner.lock();
        self.trim_locked(&mut inner, None)
    }

    fn trim_locked(
        &self,
        inner: &mut CacheInner,
        keep: Option<ChunkCoordinate>,
    ) -> (Vec<Arc<Chunk>>, Vec<Arc<Chunk>>) {
        let mut evicted = Vec::new();
        let mut blocked = Vec::new();
        if inner.map.len() <= self.capacity {
            return (evicted, blocked);
        }

        let mut excess = inner.map.len() - self.capacity;
        let candidates: Vec<ChunkCoordinate> = inner.order.iter().copied().collect();
        for coord in candidates {
            if excess == 0 {
                break;
            }
            if keep == Some(coord) {
                continue;
            }
            let Some(entry) = inner.map.get(&coord) else {
                continue;
            };
            if entry.evictable() {
                if let Some(entry) = inner.remove(coord) {
                    evicted.push(entry.chunk);
                    excess -= 1;
                }
            } else if entry.pins == 0 {
                blocked.push(Arc::clone(&entry.chunk));
                excess -= 1;
            }
        }

        (evicted, blocked)
    }

    /// Record that a session holds this chunk. Returns `false` if it is not resident.
    pub fn pin(&self, coord: ChunkCoordinate) -> bool {
        match self.inner.lock().map.get_mut(&coord) {
            Some(entry) => {
                entry.pins += 1;
                true
            }
            None => false,
        }
    }

    pub fn unpin(&self, coord: ChunkCoordinate) {
        if let Some(entry) = self.inner.lock().map.get_mut(&coord) {
            entry.pins = entry.pins.saturating_sub(1);
            entry.last_access = Instant::now();
        }
    }

    pub fn pins(&self, coord: ChunkCoordinate) -> u32 {
        self.inner
            .lock()
            .map
            .get(&coord)
            .map_or(0, |entry| entry.pins)
    }

    pub fn is_dirty(&self, coord: ChunkCoordinate) -> bool {
        self.inner
            .lock()
            .map
            .get(&coord)
            .is_some_and(|entry| entry.dirty)
    }

    /// Blocks edited since the last full save.
    pub fn changed_blocks(&self, coord: ChunkCoordinate) -> usize {
        self.inner
            .lock()
            .map
            .get(&coord)
            .map_or(0, |entry| entry.changed.len())
    }

    /// Current snapshot of `coord` and how to write it, or `None` when it is
    /// not resident or has nothing unsaved. More than `limit` changed blocks
    /// call for a full save.
    pub fn save_plan(&self, coord: ChunkCoordinate, limit: usize) -> Option<(Arc<Chunk>, SavePlan)> {
        let inner = self.inner.lock();
        let entry = inner.map.get(&coord).filter(|entry| entry.dirty)?;
        let plan = if entry.full_save || entry.changed.len() > limit {
            SavePlan::Full
        } else {
            SavePlan::Partial(
                entry
                    .changed
                    .iter()
                    .map(|&pos| ChangedBlock {
                        pos,
                        block_id: entry.chunk.block_local(pos),
                    })
                    .collect(),
            )
        };
        Some((Arc::clone(&entry.chunk), plan))
    }

    /// Record that `saved` reached storage. The entry turns clean only if it
    /// still holds exactly `saved`; a newer edit keeps it dirty. After a full
    /// save of the current snapshot the changed-block list starts over.
    pub fn mark_saved(&self, saved: &Arc<Chunk>, full: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.map.get_mut(&saved.coord()) else {
            return false;
        };
        if full {
            entry.full_save = false;
        }
        if !Arc::ptr_eq(&entry.chunk, saved) {
            return false;
        }
        if full {
            entry.changed.clear();
        }
        entry.dirty = false;
        true
    }

    pub fn dirty_chunks(&self) -> Vec<Arc<Chunk>> {
        self.inner
            .lock()
            .map
            .values()
            .filter(|entry| entry.dirty)
            .map(|entry| Arc::clone(&entry.chunk))
            .collect()
    }

    /// Unpinned chunks untouched for longer than `max_idle`, dirty or not.
    pub fn idle(&self, max_idle: Duration) -> Vec<Arc<Chunk>> {
        let now = Instant::now();
        self.inner
            .lock()
            .map
            .values()
            .filter(|entry| entry.pins == 0 && now.duration_since(entry.last_access) > max_idle)
            .map(|entry| Arc::clone(&entry.chunk))
            .collect()
    }

    /// Remove idle entries that are unpinned and clean.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<Arc<Chunk>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let stale: Vec<ChunkCoordinate> = inner
            .map
            .iter()
            .filter(|(_, entry)| {
                entry.evictable() && now.duration_since(entry.last_access) > max_idle
            })
            .map(|(coord, _)| *coord)
            .collect();

        stale
            .into_iter()
            .filter_map(|coord| inner.remove(coord).map(|entry| entry.chunk))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::chunk::GenerationState;
    use reactocraft_protocol::BlockPosition;
    use reactocraft_worldgen::CHUNK_VOLUME;

    fn chunk(x: i32) -> Arc<Chunk> {
        Arc::new(
            Chunk::new(
                ChunkCoordinate::new(x, 0),
                vec![0u8; CHUNK_VOLUME],
                GenerationState::Ready,
            )
            .unwrap(),
        )
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ChunkCache::new(2);
        cache.insert(chunk(0), false);
        cache.insert(chunk(1), false);
        assert!(cache.get(ChunkCoordinate::new(0, 0)).is_some());
        cache.insert(chunk(2), false);

        assert!(cache.contains(ChunkCoordinate::new(0, 0)));
        assert!(!cache.contains(ChunkCoordinate::new(1, 0)));
        assert!(cache.contains(ChunkCoordinate::new(2, 0)));
    }

    #[test]
    fn pinned_entries_survive_and_cache_overflows() {
        let cache = ChunkCache::new(1);
        cache.insert(chunk(0), false);
        assert!(cache.pin(ChunkCoordinate::new(0, 0)));
        cache.insert(chunk(1), false);
        assert!(cache.pin(ChunkCoordinate::new(1, 0)));
        cache.insert(chunk(2), false);

        // nothing evictable except the entry just inserted
        assert_eq!(cache.len(), 3);

        cache.unpin(ChunkCoordinate::new(0, 0));
        let (evicted, blocked) = cache.trim();
        assert_eq!(evicted.len(), 2);
        assert!(blocked.is_empty());
        assert!(cache.contains(ChunkCoordinate::new(1, 0)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn dirty_entries_wait_for_save() {
        let cache = ChunkCache::new(1);
        let dirty = chunk(0);
        cache.insert(dirty.clone(), true);
        let blocked = cache.insert(chunk(1), false);

        assert_eq!(blocked.len(), 1);
        assert!(Arc::ptr_eq(&blocked[0], &dirty));
        assert_eq!(cache.len(), 2);

        assert!(cache.mark_saved(&dirty, true));
        let (evicted, _) = cache.trim();
        assert_eq!(evicted.len(), 1);
        assert!(!cache.contains(ChunkCoordinate::new(0, 0)));
    }

    #[test]
    fn mark_saved_ignores_stale_snapshots() {
        let cache = ChunkCache::new(4);
        let original = chunk(0);
        cache.insert(original.clone(), true);
        let position = BlockPosition::new(1, 1, 1);
        assert_eq!(cache.set_block(position, 4), Ok(true));

        assert!(!cache.mark_saved(&original, true));
        assert!(cache.is_dirty(ChunkCoordinate::new(0, 0)));
        assert_eq!(
            cache.peek(ChunkCoordinate::new(0, 0)).unwrap().block(1, 1, 1),
            Some(4)
        );
        // the full save happened, but the edit after it is still owed
        assert_eq!(cache.changed_blocks(ChunkCoordinate::new(0, 0)), 1);
        assert_eq!(cache.set_block(BlockPosition::new(9 * 16, 1, 1), 4), Ok(false));
        assert_eq!(
            cache.set_block(position, 256),
            Err(ChunkError::InvalidBlock(256))
        );
    }

    #[test]
    fn save_plan_switches_to_full_above_the_limit() {
        let cache = ChunkCache::new(4);
        let coord = ChunkCoordinate::new(0, 0);
        cache.insert(chunk(0), true);

        // never written in full yet
        assert!(matches!(cache.save_plan(coord, 10), Some((_, SavePlan::Full))));
        let (snapshot, _) = cache.save_plan(coord, 10).unwrap();
        assert!(cache.mark_saved(&snapshot, true));

        cache.set_block(BlockPosition::new(2, 3, 4), 5).unwrap();
        cache.set_block(BlockPosition::new(2, 3, 4), 6).unwrap();
        cache.set_block(BlockPosition::new(0, 0, 0), 1).unwrap();
        let (snapshot, plan) = cache.save_plan(coord, 2).unwrap();
        let changes = match plan {
            SavePlan::Partial(changes) => changes,
            other => panic!("expected a partial save, got {other:?}"),
        };
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&ChangedBlock {
            pos: LocalPos::new(2, 3, 4).unwrap(),
            block_id: 6,
        }));

        // a partial save keeps the list, so the next partial still has it
        assert!(cache.mark_saved(&snapshot, false));
        assert!(!cache.is_dirty(coord));
        assert!(cache.save_plan(coord, 2).is_none());
        cache.set_block(BlockPosition::new(9, 9, 9), 2).unwrap();
        let (snapshot, plan) = cache.save_plan(coord, 2).unwrap();
        assert_eq!(plan, SavePlan::Full);

        assert!(cache.mark_saved(&snapshot, true));
        assert_eq!(cache.changed_blocks(coord), 0);
    }

    #[test]
    fn replayed_changes_are_carried_forward() {
        let cache = ChunkCache::new(4);
        let coord = ChunkCoordinate::new(0, 0);
        let replayed = LocalPos::new(1, 2, 3).unwrap();
        cache.insert_persisted(chunk(0), vec![replayed]);
        assert!(!cache.is_dirty(coord));

        cache.set_block(BlockPosition::new(5, 5, 5), 3).unwrap();
        let (_, plan) = cache.save_plan(coord, 100).unwrap();
        let changes = match plan {
            SavePlan::Partial(changes) => changes,
            other => panic!("expected a partial save, got {other:?}"),
        };
        let positions: Vec<LocalPos> = changes.iter().map(|change| change.pos).collect();
        assert!(positions.contains(&replayed));
        assert_eq!(positions.len(), 2);
    }

    #[test]
    fn idle_eviction_skips_pinned_and_dirty() {
        let cache = ChunkCache::new(8);
        cache.insert(chunk(0), false);
        cache.insert(chunk(1), true);
        cache.insert(chunk(2), false);
        cache.pin(ChunkCoordinate::new(2, 0));
        std::thread::sleep(Duration::from_millis(5));

        let idle = cache.idle(Duration::ZERO);
        assert_eq!(idle.len(), 2);

        let evicted = cache.evict_idle(Duration::ZERO);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].coord(), ChunkCoordinate::new(0, 0));
        assert_eq!(cache.len(), 2);
    }
}
