//! Terrain generator library.
//!
//! Built twice: as a `cdylib` that the server loads at runtime through the C
//! ABI in [`ffi`], and as an `rlib` so the same algorithms can be linked
//! in-process. Output is a flat array of block ids in the chunk layout
//! described by [`terrain::block_index`], and depends only on the chunk
//! coordinate, the world seed and the terrain mode.

pub mod ffi;
pub mod terrain;

pub use terrain::{
    block_index, generate, TerrainMode, CHUNK_HEIGHT, CHUNK_SIZE, CHUNK_VOLUME, SECTION_COUNT,
    SECTION_HEIGHT, SECTION_VOLUME,
};
