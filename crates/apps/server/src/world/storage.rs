use bytes::Bytes;
use dashmap::DashMap;
use reactocraft_protocol::ChunkCoordinate;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Errors emitted by storage implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("chunk {0} not stored")]
    NotFound(ChunkCoordinate),
}

/// Backend trait for persisting encoded chunk blobs.
///
/// Each chunk has a full blob and, optionally, a partial blob holding the
/// blocks changed since the full one was written.
///
/// Calls block; the pipeline runs them on the blocking thread pool.
pub trait ChunkStorage: Send + Sync + 'static {
    fn load(&self, coord: ChunkCoordinate) -> Result<Bytes, StorageError>;
    fn store(&self, coord: ChunkCoordinate, blob: &[u8]) -> Result<(), StorageError>;
    fn load_partial(&self, coord: ChunkCoordinate) -> Result<Bytes, StorageError>;
    fn store_partial(&self, coord: ChunkCoordinate, blob: &[u8]) -> Result<(), StorageError>;
    /// Drop the partial blob. Missing blobs are not an error.
    fn remove_partial(&self, coord: ChunkCoordinate) -> Result<(), StorageError>;
}

/// One file per chunk, `<dir>/<x>_<z>.dat`, plus `<dir>/<x>_<z>_partial.dat`
/// when there are changes since the last full write. Both are replaced
/// atomically.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the chunk directory if it does not exist yet.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let storage = Self::new(dir);
        fs::create_dir_all(&storage.dir)?;
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn chunk_path(&self, coord: ChunkCoordinate) -> PathBuf {
        self.dir.join(format!("{}_{}.dat", coord.x, coord.z))
    }

    pub fn partial_path(&self, coord: ChunkCoordinate) -> PathBuf {
        self.dir.join(format!("{}_{}_partial.dat", coord.x, coord.z))
    }
}

fn read_file(path: &Path, coord: ChunkCoordinate) -> Result<Bytes, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(coord)),
        Err(err) => Err(StorageError::Io(err)),
    }
}

fn replace_file(path: &Path, blob: &[u8]) -> Result<(), StorageError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, blob)?;
    fs::rename(tmp, path)?;
    Ok(())
}

impl ChunkStorage for FileStorage {
    fn load(&self, coord: ChunkCoordinate) -> Result<Bytes, StorageError> {
        read_file(&self.chunk_path(coord), coord)
    }

    fn store(&self, coord: ChunkCoordinate, blob: &[u8]) -> Result<(), StorageError> {
        replace_file(&self.chunk_path(coord), blob)
    }

    fn load_partial(&self, coord: ChunkCoordinate) -> Result<Bytes, StorageError> {
        read_file(&self.partial_path(coord), coord)
    }

    fn store_partial(&self, coord: ChunkCoordinate, blob: &[u8]) -> Result<(), StorageError> {
        replace_file(&self.partial_path(coord), blob)
    }

    fn remove_partial(&self, coord: ChunkCoordinate) -> Result<(), StorageError> {
        match fs::remove_file(self.partial_path(coord)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(StorageError::Io(err)),
            _ => Ok(()),
        }
    }
}

/// In-memory storage for tests and throwaway worlds.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    chunks: DashMap<ChunkCoordinate, Bytes>,
    partials: DashMap<ChunkCoordinate, Bytes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, coord: ChunkCoordinate) -> bool {
        self.chunks.contains_key(&coord)
    }

    pub fn has_partial(&self, coord: ChunkCoordinate) -> bool {
        self.partials.contains_key(&coord)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl ChunkStorage for MemoryStorage {
    fn load(&self, coord: ChunkCoordinate) -> Result<Bytes, StorageError> {
        self.chunks
            .get(&coord)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound(coord))
    }

    fn store(&self, coord: ChunkCoordinate, blob: &[u8]) -> Result<(), StorageError> {
        self.chunks.insert(coord, Bytes::copy_from_slice(blob));
        Ok(())
    }

    fn load_partial(&self, coord: ChunkCoordinate) -> Result<Bytes, StorageError> {
        self.partials
            .get(&coord)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::NotFound(coord))
    }

    fn store_partial(&self, coord: ChunkCoordinate, blob: &[u8]) -> Result<(), StorageError> {
        self.partials.insert(coord, Bytes::copy_from_slice(blob));
        Ok(())
    }

    fn remove_partial(&self, coord: ChunkCoordinate) -> Result<(), StorageError> {
        self.partials.remove(&coord);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_round_trips_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("chunks")).unwrap();
        let coord = ChunkCoordinate::new(-3, 12);

        assert!(matches!(storage.load(coord), Err(StorageError::NotFound(c)) if c == coord));

        storage.store(coord, b"first").unwrap();
        storage.store(coord, b"second").unwrap();
        assert_eq!(storage.load(coord).unwrap(), Bytes::from_static(b"second"));
        assert!(storage.chunk_path(coord).ends_with("-3_12.dat"));
        assert!(!storage.chunk_path(coord).with_extension("tmp").exists());
    }

    #[test]
    fn partial_files_sit_next_to_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        let coord = ChunkCoordinate::new(2, -1);

        // removing what is not there is fine
        storage.remove_partial(coord).unwrap();
        assert!(matches!(storage.load_partial(coord), Err(StorageError::NotFound(_))));

        storage.store(coord, b"full").unwrap();
        storage.store_partial(coord, b"delta").unwrap();
        assert!(storage.partial_path(coord).ends_with("2_-1_partial.dat"));
        assert_eq!(storage.load_partial(coord).unwrap(), Bytes::from_static(b"delta"));
        assert_eq!(storage.load(coord).unwrap(), Bytes::from_static(b"full"));

        storage.remove_partial(coord).unwrap();
        assert!(!storage.partial_path(coord).exists());
        assert!(storage.chunk_path(coord).exists());
    }

    #[test]
    fn memory_storage_overwrites() {
        let storage = MemoryStorage::new();
        let coord = ChunkCoordinate::new(0, 0);
        storage.store(coord, &[1, 2, 3]).unwrap();
        storage.store(coord, &[4]).unwrap();
        assert_eq!(storage.load(coord).unwrap(), Bytes::from_static(&[4]));
        assert_eq!(storage.len(), 1);
    }
}
