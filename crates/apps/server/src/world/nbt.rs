//! Chunk file format: a gzip-compressed NBT compound
//!
//! ```text
//! {
//!     DataVersion: int,
//!     chunkX: int,
//!     chunkZ: int,
//!     sections: [ { yIndex: int, blocks: byte[4096] }, ... ],
//! }
//! ```
//!
//! Sections that are entirely air are omitted on write and read back as air.
//!
//! Partial files list the blocks changed since the last full save, with
//! positions relative to the chunk corner:
//!
//! ```text
//! {
//!     chunkX: int,
//!     chunkZ: int,
//!     changedBlocks: [ { x: int, y: int, z: int, blockId: int }, ... ],
//! }
//! ```

use super::chunk::{
    ChangedBlock, Chunk, ChunkError, GenerationState, LocalPos, SECTION_COUNT, SECTION_VOLUME,
};
use fastnbt::ByteArray;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use reactocraft_protocol::ChunkCoordinate;
use reactocraft_worldgen::CHUNK_VOLUME;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Format revision written into every chunk file.
pub const DATA_VERSION: i32 = 1;

/// Largest decompressed chunk file accepted.
pub const MAX_CHUNK_NBT: u64 = 64 * 1024;

/// Largest decompressed partial file accepted; room for every block of a chunk.
pub const MAX_PARTIAL_NBT: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum NbtError {
    #[error("compression error: {0}")]
    Compression(#[from] io::Error),
    #[error("nbt error: {0}")]
    Nbt(#[from] fastnbt::error::Error),
    #[error("decompressed file exceeds {0} bytes")]
    TooLarge(u64),
    #[error("unsupported data version {0}")]
    DataVersion(i32),
    #[error("file holds chunk {found}, expected {expected}")]
    CoordinateMismatch {
        expected: ChunkCoordinate,
        found: ChunkCoordinate,
    },
    #[error("section index {0} out of range")]
    SectionIndex(i32),
    #[error("section {y_index} has {len} blocks, expected {expected}", expected = SECTION_VOLUME)]
    SectionSize { y_index: i32, len: usize },
    #[error("changed block at {x}, {y}, {z} is outside the chunk")]
    BlockPosition { x: i32, y: i32, z: i32 },
    #[error("changed block id {0} does not fit the chunk format")]
    BlockId(i32),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

#[derive(Debug, Serialize, Deserialize)]
struct ChunkNbt {
    #[serde(rename = "DataVersion")]
    data_version: i32,
    #[serde(rename = "chunkX")]
    chunk_x: i32,
    #[serde(rename = "chunkZ")]
    chunk_z: i32,
    sections: Vec<SectionNbt>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SectionNbt {
    #[serde(rename = "yIndex")]
    y_index: i32,
    blocks: ByteArray,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartialNbt {
    #[serde(rename = "chunkX")]
    chunk_x: i32,
    #[serde(rename = "chunkZ")]
    chunk_z: i32,
    #[serde(rename = "changedBlocks")]
    changed_blocks: Vec<ChangedBlockNbt>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChangedBlockNbt {
    x: i32,
    y: i32,
    z: i32,
    #[serde(rename = "blockId")]
    block_id: i32,
}

fn compress(nbt: &[u8]) -> Result<Vec<u8>, NbtError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(nbt)?;
    Ok(encoder.finish()?)
}

/// Inflate at most `limit` bytes; anything bigger is rejected.
fn decompress(blob: &[u8], limit: u64) -> Result<Vec<u8>, NbtError> {
    let mut nbt = Vec::new();
    GzDecoder::new(blob).take(limit + 1).read_to_end(&mut nbt)?;
    if nbt.len() as u64 > limit {
        return Err(NbtError::TooLarge(limit));
    }
    Ok(nbt)
}

pub fn encode_chunk(chunk: &Chunk) -> Result<Vec<u8>, NbtError> {
    let coord = chunk.coord();
    let sections = chunk
        .sections()
        .filter(|(_, blocks)| blocks.iter().any(|&b| b != 0))
        .map(|(y_index, blocks)| SectionNbt {
            y_index: y_index as i32,
            blocks: ByteArray::new(blocks.iter().map(|&b| b as i8).collect()),
        })
        .collect();

    let nbt = fastnbt::to_bytes(&ChunkNbt {
        data_version: DATA_VERSION,
        chunk_x: coord.x,
        chunk_z: coord.z,
        sections,
    })?;
    compress(&nbt)
}

/// Decode a chunk file, checking it really holds `expected`.
pub fn decode_chunk(expected: ChunkCoordinate, blob: &[u8]) -> Result<Chunk, NbtError> {
    let nbt = decompress(blob, MAX_CHUNK_NBT)?;
    let parsed: ChunkNbt = fastnbt::from_bytes(&nbt)?;

    if parsed.data_version != DATA_VERSION {
        return Err(NbtError::DataVersion(parsed.data_version));
    }
    let found = ChunkCoordinate::new(parsed.chunk_x, parsed.chunk_z);
    if found != expected {
        return Err(NbtError::CoordinateMismatch { expected, found });
    }

    let mut blocks = vec![0u8; CHUNK_VOLUME];
    for section in &parsed.sections {
        let y_index = usize::try_from(section.y_index)
            .ok()
            .filter(|&y| y < SECTION_COUNT)
            .ok_or(NbtError::SectionIndex(section.y_index))?;
        if section.blocks.len() != SECTION_VOLUME {
            return Err(NbtError::SectionSize {
                y_index: section.y_index,
                len: section.blocks.len(),
            });
        }
        let start = y_index * SECTION_VOLUME;
        for (dst, &src) in blocks[start..start + SECTION_VOLUME]
            .iter_mut()
            .zip(section.blocks.iter())
        {
            *dst = src as u8;
        }
    }

    Ok(Chunk::new(expected, blocks, GenerationState::Persisted)?)
}

pub fn encode_partial(coord: ChunkCoordinate, changes: &[ChangedBlock]) -> Result<Vec<u8>, NbtError> {
    let changed_blocks = changes
        .iter()
        .map(|change| ChangedBlockNbt {
            x: change.pos.x() as i32,
            y: change.pos.y() as i32,
            z: change.pos.z() as i32,
            block_id: i32::from(change.block_id),
        })
        .collect();
    let nbt = fastnbt::to_bytes(&PartialNbt {
        chunk_x: coord.x,
        chunk_z: coord.z,
        changed_blocks,
    })?;
    compress(&nbt)
}

/// Decode a partial file for `expected`, keeping the recorded order.
pub fn decode_partial(expected: ChunkCoordinate, blob: &[u8]) -> Result<Vec<ChangedBlock>, NbtError> {
    let nbt = decompress(blob, MAX_PARTIAL_NBT)?;
    let parsed: PartialNbt = fastnbt::from_bytes(&nbt)?;

    let found = ChunkCoordinate::new(parsed.chunk_x, parsed.chunk_z);
    if found != expected {
        return Err(NbtError::CoordinateMismatch { expected, found });
    }

    parsed
        .changed_blocks
        .iter()
        .map(|entry| {
            let axis = |value: i32| usize::try_from(value).ok();
            let pos = match (axis(entry.x), axis(entry.y), axis(entry.z)) {
                (Some(x), Some(y), Some(z)) => LocalPos::new(x, y, z),
                _ => None,
            }
            .ok_or(NbtError::BlockPosition {
                x: entry.x,
                y: entry.y,
                z: entry.z,
            })?;
            let block_id = u8::try_from(entry.block_id).map_err(|_| NbtError::BlockId(entry.block_id))?;
            Ok(ChangedBlock { pos, block_id })
        })
        .collect()
}
