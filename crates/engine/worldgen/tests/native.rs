//! Exercises the dynamic library when a build of it is available next to the
//! test binaries. Skipped otherwise.

use reactocraft_protocol::ChunkCoordinate;
use reactocraft_worldgen::{
    native::locate, InProcessGenerator, NativeGenerator, TerrainGenerator, TerrainMode,
};
use std::path::PathBuf;

fn search_path() -> Vec<PathBuf> {
    let target = std::env::var_os("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../../target"));

    ["debug", "debug/deps", "release", "release/deps"]
        .iter()
        .map(|profile| target.join(profile))
        .collect()
}

#[test]
fn native_library_matches_in_process_generation() {
    let dirs = search_path();
    if locate(&dirs).is_none() {
        eprintln!("terrain library not built; skipping");
        return;
    }

    let native = NativeGenerator::load_from_search_path(&dirs, TerrainMode::Noise).unwrap();
    let linked = InProcessGenerator::new(TerrainMode::Noise);

    for coord in [ChunkCoordinate::new(0, 0), ChunkCoordinate::new(-12, 40)] {
        assert_eq!(
            native.generate(coord, 2024).unwrap(),
            linked.generate(coord, 2024).unwrap(),
            "chunk {coord}"
        );
    }
}
