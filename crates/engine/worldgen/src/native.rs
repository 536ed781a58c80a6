use crate::error::GenerationError;
use crate::generator::TerrainGenerator;
use libloading::Library;
use reactocraft_native_worldgen::{TerrainMode, CHUNK_VOLUME};
use reactocraft_protocol::ChunkCoordinate;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::ptr;

/// Base name of the terrain library, without platform prefix or suffix.
pub const LIBRARY_NAME: &str = "reactocraft_native_worldgen";

/// ABI revision this bridge was written against.
pub const EXPECTED_ABI_VERSION: u32 = 1;

const ABI_VERSION_SYMBOL: &[u8] = b"rc_worldgen_abi_version\0";
const GENERATE_SYMBOL: &[u8] = b"rc_worldgen_generate\0";
const FREE_SYMBOL: &[u8] = b"rc_worldgen_free\0";

type AbiVersionFn = unsafe extern "C" fn() -> u32;
type GenerateFn = unsafe extern "C" fn(i32, i32, u64, u32, *mut *mut u8, *mut usize) -> i32;
type FreeFn = unsafe extern "C" fn(*mut u8, usize);

/// Platform file name of a dynamic library (`libfoo.so`, `libfoo.dylib`, `foo.dll`).
pub fn platform_library_filename(name: &str) -> String {
    format!("{DLL_PREFIX}{name}{DLL_SUFFIX}")
}

/// Terrain generator backed by the dynamically loaded native library.
pub struct NativeGenerator {
    generate: GenerateFn,
    free: FreeFn,
    mode: TerrainMode,
    path: PathBuf,
    // Keeps the function pointers above valid.
    _library: Library,
}

impl NativeGenerator {
    /// Load the library at `path` and bind its entry points.
    pub fn load(path: impl AsRef<Path>, mode: TerrainMode) -> Result<Self, GenerationError> {
        let path = path.as_ref().to_path_buf();

        // SAFETY: loading runs the library's initialisers; the terrain library
        // has none beyond the Rust runtime's.
        let library = unsafe { Library::new(&path) }.map_err(|err| GenerationError::LibraryLoad {
            path: path.clone(),
            message: err.to_string(),
        })?;

        // SAFETY: symbol types match the declarations exported by the library.
        let (abi_version, generate, free) = unsafe {
            (
                bind::<AbiVersionFn>(&library, ABI_VERSION_SYMBOL, "rc_worldgen_abi_version")?,
                bind::<GenerateFn>(&library, GENERATE_SYMBOL, "rc_worldgen_generate")?,
                bind::<FreeFn>(&library, FREE_SYMBOL, "rc_worldgen_free")?,
            )
        };

        let found = unsafe { abi_version() };
        if found != EXPECTED_ABI_VERSION {
            return Err(GenerationError::AbiMismatch {
                expected: EXPECTED_ABI_VERSION,
                found,
            });
        }

        tracing::info!(path = %path.display(), ?mode, "loaded native terrain library");

        Ok(Self {
            generate,
            free,
            mode,
            path,
            _library: library,
        })
    }

    /// Load the first library found in `search_path`.
    pub fn load_from_search_path(
        search_path: &[PathBuf],
        mode: TerrainMode,
    ) -> Result<Self, GenerationError> {
        let path = locate(search_path)
            .ok_or_else(|| GenerationError::NotFound(search_path.to_vec()))?;
        Self::load(path, mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// First directory in `search_path` that contains the terrain library.
pub fn locate(search_path: &[PathBuf]) -> Option<PathBuf> {
    let filename = platform_library_filename(LIBRARY_NAME);
    search_path
        .iter()
        .map(|dir| dir.join(&filename))
        .find(|candidate| candidate.is_file())
}

unsafe fn bind<T: Copy>(
    library: &Library,
    symbol: &[u8],
    name: &'static str,
) -> Result<T, GenerationError> {
    let bound = unsafe { library.get::<T>(symbol) }.map_err(|err| GenerationError::MissingSymbol {
        symbol: name,
        message: err.to_string(),
    })?;
    Ok(*bound)
}

impl TerrainGenerator for NativeGenerator {
    fn generate(&self, coord: ChunkCoordinate, seed: u64) -> Result<Vec<u8>, GenerationError> {
        let mut out_ptr: *mut u8 = ptr::null_mut();
        let mut out_len = 0usize;

        // SAFETY: both out-pointers reference live locals.
        let status = unsafe {
            (self.generate)(
                coord.x,
                coord.z,
                seed,
                self.mode as u32,
                &mut out_ptr,
                &mut out_len,
            )
        };
        if status != 0 {
            return Err(GenerationError::NativeStatus(status));
        }
        if out_ptr.is_null() {
            return Err(GenerationError::NullBuffer);
        }

        // SAFETY: on success the library hands over `out_len` initialised bytes
        // which stay valid until `free` is called below.
        let blocks = unsafe { std::slice::from_raw_parts(out_ptr, out_len) }.to_vec();
        unsafe { (self.free)(out_ptr, out_len) };

        if blocks.len() != CHUNK_VOLUME {
            return Err(GenerationError::WrongSize {
                expected: CHUNK_VOLUME,
                actual: blocks.len(),
            });
        }
        Ok(blocks)
    }

    fn describe(&self) -> String {
        format!("native {:?} generator ({})", self.mode, self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_uses_platform_affixes() {
        let name = platform_library_filename("terrain");
        assert!(name.contains("terrain"));
        assert!(name.ends_with(DLL_SUFFIX));
        assert!(name.starts_with(DLL_PREFIX));
    }

    #[test]
    fn missing_library_reports_search_path() {
        let dirs = vec![PathBuf::from("/definitely/not/here")];
        match NativeGenerator::load_from_search_path(&dirs, TerrainMode::Flat) {
            Err(GenerationError::NotFound(searched)) => assert_eq!(searched, dirs),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("library should not be found"),
        }
    }

    #[test]
    fn unloadable_file_is_a_load_error() {
        let dir = std::env::temp_dir();
        let bogus = dir.join(format!("not-a-library-{}.so", std::process::id()));
        std::fs::write(&bogus, b"plain text").unwrap();
        let result = NativeGenerator::load(&bogus, TerrainMode::Flat);
        let _ = std::fs::remove_file(&bogus);
        assert!(matches!(result, Err(GenerationError::LibraryLoad { .. })));
    }
}
