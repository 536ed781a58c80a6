pub mod cache;
pub mod chunk;
pub mod nbt;
pub mod pipeline;
pub mod storage;

pub use cache::{ChunkCache, SavePlan};
pub use chunk::{ChangedBlock, Chunk, ChunkError, GenerationState, LocalPos};
pub use pipeline::{ChunkPipeline, PipelineConfig, ResolveError};
pub use storage::{ChunkStorage, FileStorage, MemoryStorage, StorageError};

use reactocraft_protocol::{BlockPosition, ChunkCoordinate, Packet};
use thiserror::Error;

/// A loaded chunk could not be read from or written to storage.
/// Never fatal: reads fall through to generation, failed writes stay dirty.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("chunk file error: {0}")]
    Nbt(#[from] nbt::NbtError),
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("persistence task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A change to the shared world, fanned out to every session in range.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldDelta {
    Block {
        position: BlockPosition,
        block_id: u16,
    },
    Entity {
        entity_id: u64,
        position: [f64; 3],
    },
}

impl WorldDelta {
    /// Chunk whose viewers should receive this delta.
    pub fn chunk(&self) -> ChunkCoordinate {
        match self {
            WorldDelta::Block { position, .. } => position.chunk(),
            WorldDelta::Entity { position, .. } => {
                ChunkCoordinate::from_world(position[0], position[2])
            }
        }
    }

    pub fn to_packet(&self) -> Packet {
        match *self {
            WorldDelta::Block { position, block_id } => Packet::BlockUpdate {
                position,
                block: block_id,
            },
            WorldDelta::Entity {
                entity_id,
                position,
            } => Packet::EntityUpdate {
                entity_id,
                position,
            },
        }
    }
}
