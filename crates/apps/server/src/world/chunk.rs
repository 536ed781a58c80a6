use bytes::Bytes;
use reactocraft_protocol::{BlockPosition, ChunkCoordinate};
pub use reactocraft_worldgen::{
    CHUNK_HEIGHT, CHUNK_SIZE, CHUNK_VOLUME, SECTION_COUNT, SECTION_HEIGHT, SECTION_VOLUME,
};
use reactocraft_worldgen::block_index;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("chunk payload is {0} bytes, expected {expected}", expected = CHUNK_VOLUME)]
    WrongSize(usize),
    #[error("block y {0} is outside the chunk")]
    OutOfBounds(i32),
    #[error("block id {0} does not fit the chunk format")]
    InvalidBlock(u16),
    #[error("block {x}, {z} belongs to chunk {actual}, not {expected}")]
    WrongChunk {
        x: i32,
        z: i32,
        expected: ChunkCoordinate,
        actual: ChunkCoordinate,
    },
}

/// Lifecycle of a chunk as seen by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GenerationState {
    /// A resolution is looking in the cache and storage.
    Requested = 0,
    /// The terrain generator is producing it.
    Generating = 1,
    /// Loaded from or written to storage; disk matches memory.
    Persisted = 2,
    /// In memory with changes not yet on disk.
    Ready = 3,
}

impl GenerationState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Requested,
            1 => Self::Generating,
            2 => Self::Persisted,
            _ => Self::Ready,
        }
    }
}

/// Block position relative to a chunk's corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalPos {
    x: u8,
    y: u8,
    z: u8,
}

impl LocalPos {
    pub fn new(x: usize, y: usize, z: usize) -> Option<Self> {
        if x >= CHUNK_SIZE || y >= CHUNK_HEIGHT || z >= CHUNK_SIZE {
            return None;
        }
        Some(Self {
            x: x as u8,
            y: y as u8,
            z: z as u8,
        })
    }

    pub fn x(&self) -> usize {
        usize::from(self.x)
    }

    pub fn y(&self) -> usize {
        usize::from(self.y)
    }

    pub fn z(&self) -> usize {
        usize::from(self.z)
    }

    fn index(&self) -> usize {
        block_index(self.x(), self.y(), self.z())
    }
}

/// One entry of a partial save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedBlock {
    pub pos: LocalPos,
    pub block_id: u8,
}

/// Immutable block payload of one 16×64×16 column.
///
/// Edits never mutate a chunk in place; they build a new one (see
/// [`Chunk::with_block`]) so readers holding an `Arc<Chunk>` keep a
/// consistent snapshot. Only the state tag changes after construction.
pub struct Chunk {
    coord: ChunkCoordinate,
    blocks: Bytes,
    state: AtomicU8,
}

impl Chunk {
    pub fn new(
        coord: ChunkCoordinate,
        blocks: impl Into<Bytes>,
        state: GenerationState,
    ) -> Result<Self, ChunkError> {
        let blocks = blocks.into();
        if blocks.len() != CHUNK_VOLUME {
            return Err(ChunkError::WrongSize(blocks.len()));
        }
        Ok(Self {
            coord,
            blocks,
            state: AtomicU8::new(state as u8),
        })
    }

    pub fn coord(&self) -> ChunkCoordinate {
        self.coord
    }

    /// Raw payload, cheap to clone into a `ChunkData` packet.
    pub fn blocks(&self) -> &Bytes {
        &self.blocks
    }

    pub fn state(&self) -> GenerationState {
        GenerationState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: GenerationState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn block(&self, x: usize, y: usize, z: usize) -> Option<u8> {
        if x >= CHUNK_SIZE || y >= CHUNK_HEIGHT || z >= CHUNK_SIZE {
            return None;
        }
        Some(self.blocks[block_index(x, y, z)])
    }

    /// Block at an absolute position, if that position is inside this chunk.
    pub fn block_at(&self, position: BlockPosition) -> Option<u8> {
        if position.chunk() != self.coord || position.y < 0 {
            return None;
        }
        let (x, y, z) = position.local();
        self.block(x, y as usize, z)
    }

    pub fn block_local(&self, pos: LocalPos) -> u8 {
        self.blocks[pos.index()]
    }

    /// Where an absolute position falls inside this chunk.
    pub fn local_position(&self, position: BlockPosition) -> Result<LocalPos, ChunkError> {
        if position.chunk() != self.coord {
            return Err(ChunkError::WrongChunk {
                x: position.x,
                z: position.z,
                expected: self.coord,
                actual: position.chunk(),
            });
        }
        let (x, y, z) = position.local();
        usize::try_from(y)
            .ok()
            .and_then(|y| LocalPos::new(x, y, z))
            .ok_or(ChunkError::OutOfBounds(y))
    }

    /// Copy of this chunk with one block replaced.
    pub fn with_block(&self, position: BlockPosition, block: u16) -> Result<Chunk, ChunkError> {
        let block_id = u8::try_from(block).map_err(|_| ChunkError::InvalidBlock(block))?;
        let pos = self.local_position(position)?;
        self.with_changes(&[ChangedBlock { pos, block_id }], GenerationState::Ready)
    }

    /// Copy of this chunk with every change applied in order.
    pub fn with_changes(
        &self,
        changes: &[ChangedBlock],
        state: GenerationState,
    ) -> Result<Chunk, ChunkError> {
        let mut blocks = self.blocks.to_vec();
        for change in changes {
            blocks[change.pos.index()] = change.block_id;
        }
        Chunk::new(self.coord, blocks, state)
    }

    /// One 16-layer horizontal slab.
    pub fn section(&self, y_index: usize) -> Option<&[u8]> {
        if y_index >= SECTION_COUNT {
            return None;
        }
        let start = y_index * SECTION_VOLUME;
        Some(&self.blocks[start..start + SECTION_VOLUME])
    }

    pub fn sections(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.blocks.chunks_exact(SECTION_VOLUME).enumerate()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layered() -> Chunk {
        let blocks: Vec<u8> = (0..CHUNK_VOLUME).map(|i| (i / SECTION_VOLUME) as u8).collect();
        Chunk::new(ChunkCoordinate::new(-1, 2), blocks, GenerationState::Ready).unwrap()
    }

    #[test]
    fn rejects_wrong_payload_size() {
        let err = Chunk::new(ChunkCoordinate::new(0, 0), vec![0u8; 10], GenerationState::Ready)
            .unwrap_err();
        assert_eq!(err, ChunkError::WrongSize(10));
    }

    #[test]
    fn sections_follow_height() {
        let chunk = layered();
        let sections: Vec<_> = chunk.sections().collect();
        assert_eq!(sections.len(), SECTION_COUNT);
        for (y_index, data) in sections {
            assert!(data.iter().all(|&b| b as usize == y_index));
        }
        assert!(chunk.section(SECTION_COUNT).is_none());
    }

    #[test]
    fn with_block_copies_on_write() {
        let chunk = layered();
        let position = BlockPosition::new(-16, 40, 35);
        let edited = chunk.with_block(position, 9).unwrap();

        assert_eq!(edited.block_at(position), Some(9));
        assert_eq!(chunk.block_at(position), Some(2));
        assert_eq!(edited.state(), GenerationState::Ready);
    }

    #[test]
    fn with_block_bounds() {
        let chunk = layered();
        assert_eq!(
            chunk.with_block(BlockPosition::new(-1, 64, 32), 1).unwrap_err(),
            ChunkError::OutOfBounds(64)
        );
        assert_eq!(
            chunk.with_block(BlockPosition::new(-1, 0, 32), 300).unwrap_err(),
            ChunkError::InvalidBlock(300)
        );
        assert_eq!(chunk.block_at(BlockPosition::new(0, 0, 0)), None);
    }

    #[test]
    fn changes_apply_in_order() {
        let chunk = layered();
        let pos = LocalPos::new(3, 20, 15).unwrap();
        let changes = [
            ChangedBlock { pos, block_id: 7 },
            ChangedBlock { pos, block_id: 8 },
        ];
        let patched = chunk.with_changes(&changes, GenerationState::Persisted).unwrap();

        assert_eq!(patched.block_local(pos), 8);
        assert_eq!(patched.state(), GenerationState::Persisted);
        assert_eq!(chunk.block_local(pos), 1);
        assert!(LocalPos::new(16, 0, 0).is_none());
        assert!(LocalPos::new(0, CHUNK_HEIGHT, 0).is_none());
    }

    #[test]
    fn local_position_of_negative_coordinates() {
        let chunk = layered();
        let pos = chunk.local_position(BlockPosition::new(-16, 5, 47)).unwrap();
        assert_eq!((pos.x(), pos.y(), pos.z()), (0, 5, 15));
        assert_eq!(
            chunk.local_position(BlockPosition::new(-16, -1, 47)).unwrap_err(),
            ChunkError::OutOfBounds(-1)
        );
    }

    #[test]
    fn state_tag_updates() {
        let chunk = layered();
        chunk.set_state(GenerationState::Persisted);
        assert_eq!(chunk.state(), GenerationState::Persisted);
    }
}
