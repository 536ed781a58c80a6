use std::fmt;

/// Width of a chunk along X and Z, in blocks.
pub const CHUNK_WIDTH: i32 = 16;

/// Column address of a chunk. Identity key for caches, storage and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoordinate {
    pub x: i32,
    pub z: i32,
}

impl ChunkCoordinate {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk containing the block column at (`block_x`, `block_z`).
    pub fn from_block(block_x: i32, block_z: i32) -> Self {
        Self {
            x: block_x.div_euclid(CHUNK_WIDTH),
            z: block_z.div_euclid(CHUNK_WIDTH),
        }
    }

    /// Chunk containing a world-space position.
    pub fn from_world(x: f64, z: f64) -> Self {
        Self::from_block(x.floor() as i32, z.floor() as i32)
    }

    /// Square-ring distance, which is how view distance is measured.
    pub fn chebyshev_distance(&self, other: &ChunkCoordinate) -> u32 {
        let dx = (i64::from(self.x) - i64::from(other.x)).unsigned_abs();
        let dz = (i64::from(self.z) - i64::from(other.z)).unsigned_abs();
        dx.max(dz).min(u64::from(u32::MAX)) as u32
    }
}

impl fmt::Display for ChunkCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Absolute block position in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockPosition {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPosition {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn chunk(&self) -> ChunkCoordinate {
        ChunkCoordinate::from_block(self.x, self.z)
    }

    /// Position relative to the owning chunk's corner (x and z in `0..16`).
    pub fn local(&self) -> (usize, i32, usize) {
        (
            self.x.rem_euclid(CHUNK_WIDTH) as usize,
            self.y,
            self.z.rem_euclid(CHUNK_WIDTH) as usize,
        )
    }
}
