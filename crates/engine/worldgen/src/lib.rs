//! Terrain generation for the server.
//!
//! [`TerrainGenerator`] is the seam between the chunk pipeline and whatever
//! produces block data. [`NativeGenerator`] loads the terrain library at
//! runtime over its C ABI, [`InProcessGenerator`] links the same algorithms
//! directly. Either one runs on a [`GenerationPool`] of dedicated threads so
//! that slow or misbehaving generation never stalls the async runtime.

pub mod error;
pub mod generator;
pub mod native;
pub mod pool;

pub use error::GenerationError;
pub use generator::{InProcessGenerator, TerrainGenerator};
pub use native::{platform_library_filename, NativeGenerator, LIBRARY_NAME};
pub use pool::{GenerationPool, PoolConfig};
pub use reactocraft_native_worldgen::{
    block_index, TerrainMode, CHUNK_HEIGHT, CHUNK_SIZE, CHUNK_VOLUME, SECTION_COUNT, SECTION_HEIGHT,
    SECTION_VOLUME,
};
