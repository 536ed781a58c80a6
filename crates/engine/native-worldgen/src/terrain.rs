use noise::{NoiseFn, Perlin};

/// Chunk width along X and Z.
pub const CHUNK_SIZE: usize = 16;
/// Chunk height along Y.
pub const CHUNK_HEIGHT: usize = 64;
/// Height of one vertical section.
pub const SECTION_HEIGHT: usize = 16;
pub const SECTION_COUNT: usize = CHUNK_HEIGHT / SECTION_HEIGHT;
pub const SECTION_VOLUME: usize = CHUNK_SIZE * CHUNK_SIZE * SECTION_HEIGHT;
/// Bytes in one generated chunk, one block id per cell.
pub const CHUNK_VOLUME: usize = CHUNK_SIZE * CHUNK_SIZE * CHUNK_HEIGHT;

/// Block ids written by the generators.
pub mod blocks {
    pub const AIR: u8 = 0;
    pub const GRASS: u8 = 1;
    pub const DIRT: u8 = 2;
    pub const BEDROCK: u8 = 3;
    pub const STONE: u8 = 4;
    pub const WATER: u8 = 5;
    pub const SAND: u8 = 6;
}

const SEA_LEVEL: usize = 24;
const BASE_HEIGHT: f64 = 28.0;
const AMPLITUDE: f64 = 14.0;
const HORIZONTAL_SCALE: f64 = 0.015;

/// Index of block (`x`, `y`, `z`) inside a chunk buffer. Y-major, then Z, then X,
/// so each section of 16 layers is one contiguous slice.
#[inline]
pub fn block_index(x: usize, y: usize, z: usize) -> usize {
    (y * CHUNK_SIZE + z) * CHUNK_SIZE + x
}

/// Terrain shapes the library knows how to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TerrainMode {
    /// Bedrock floor, three layers of dirt, grass on top.
    Flat = 0,
    /// Seeded Perlin heightmap with stone, dirt, grass, sand and water.
    Noise = 1,
}

impl TerrainMode {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Flat),
            1 => Some(Self::Noise),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "flat" => Some(Self::Flat),
            "noise" => Some(Self::Noise),
            _ => None,
        }
    }
}

/// Generate the chunk at (`chunk_x`, `chunk_z`).
pub fn generate(mode: TerrainMode, chunk_x: i32, chunk_z: i32, seed: u64) -> Vec<u8> {
    match mode {
        TerrainMode::Flat => generate_flat(),
        TerrainMode::Noise => generate_noise(chunk_x, chunk_z, seed),
    }
}

fn generate_flat() -> Vec<u8> {
    let mut chunk = vec![blocks::AIR; CHUNK_VOLUME];
    for y in 0..=4 {
        let block = match y {
            0 => blocks::BEDROCK,
            1..=3 => blocks::DIRT,
            _ => blocks::GRASS,
        };
        let start = block_index(0, y, 0);
        chunk[start..start + CHUNK_SIZE * CHUNK_SIZE].fill(block);
    }
    chunk
}

fn generate_noise(chunk_x: i32, chunk_z: i32, seed: u64) -> Vec<u8> {
    let perlin = Perlin::new(fold_seed(seed));
    let mut chunk = vec![blocks::AIR; CHUNK_VOLUME];

    for z in 0..CHUNK_SIZE {
        for x in 0..CHUNK_SIZE {
            let wx = i64::from(chunk_x) * CHUNK_SIZE as i64 + x as i64;
            let wz = i64::from(chunk_z) * CHUNK_SIZE as i64 + z as i64;
            let surface = surface_height(&perlin, wx as f64, wz as f64);
            fill_column(&mut chunk, x, z, surface);
        }
    }

    chunk
}

/// Three octaves of Perlin noise mapped into the chunk's height range.
fn surface_height(perlin: &Perlin, wx: f64, wz: f64) -> usize {
    let mut value = 0.0;
    let mut frequency = HORIZONTAL_SCALE;
    let mut amplitude = 1.0;
    let mut total = 0.0;

    for _ in 0..3 {
        value += perlin.get([wx * frequency, wz * frequency]) * amplitude;
        total += amplitude;
        frequency *= 2.0;
        amplitude *= 0.5;
    }

    let height = BASE_HEIGHT + (value / total) * AMPLITUDE;
    (height.round() as i64).clamp(2, CHUNK_HEIGHT as i64 - 2) as usize
}

fn fill_column(chunk: &mut [u8], x: usize, z: usize, surface: usize) {
    for y in 0..CHUNK_HEIGHT {
        let block = if y == 0 {
            blocks::BEDROCK
        } else if y + 3 < surface {
            blocks::STONE
        } else if y < surface {
            blocks::DIRT
        } else if y == surface {
            if surface <= SEA_LEVEL + 1 {
                blocks::SAND
            } else {
                blocks::GRASS
            }
        } else if y <= SEA_LEVEL {
            blocks::WATER
        } else {
            blocks::AIR
        };
        chunk[block_index(x, y, z)] = block;
    }
}

/// Perlin takes a 32-bit seed; fold both halves in so every bit of the world
/// seed matters.
fn fold_seed(seed: u64) -> u32 {
    (seed as u32) ^ ((seed >> 32) as u32)
}
