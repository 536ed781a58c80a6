use crate::error::GenerationError;
use reactocraft_native_worldgen::{generate, TerrainMode};
use reactocraft_protocol::ChunkCoordinate;

/// Produces the block payload of a chunk.
///
/// Implementations must be deterministic for a fixed (coordinate, seed) and
/// are called from the generation pool's worker threads, never from async
/// tasks.
pub trait TerrainGenerator: Send + Sync + 'static {
    fn generate(&self, coord: ChunkCoordinate, seed: u64) -> Result<Vec<u8>, GenerationError>;

    /// Label used in logs.
    fn describe(&self) -> String {
        "terrain generator".to_string()
    }
}

/// Runs the terrain algorithms linked into this binary.
#[derive(Debug, Clone, Copy)]
pub struct InProcessGenerator {
    mode: TerrainMode,
}

impl InProcessGenerator {
    pub fn new(mode: TerrainMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> TerrainMode {
        self.mode
    }
}

impl TerrainGenerator for InProcessGenerator {
    fn generate(&self, coord: ChunkCoordinate, seed: u64) -> Result<Vec<u8>, GenerationError> {
        Ok(generate(self.mode, coord.x, coord.z, seed))
    }

    fn describe(&self) -> String {
        format!("in-process {:?} generator", self.mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reactocraft_native_worldgen::CHUNK_VOLUME;

    #[test]
    fn in_process_generator_is_deterministic() {
        let generator = InProcessGenerator::new(TerrainMode::Noise);
        let coord = ChunkCoordinate::new(-9, 4);
        let first = generator.generate(coord, 77).unwrap();
        assert_eq!(first.len(), CHUNK_VOLUME);
        assert_eq!(first, generator.generate(coord, 77).unwrap());
    }
}
