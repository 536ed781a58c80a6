//! C ABI surface loaded by the server at runtime.
//!
//! Ownership rule: every buffer returned by [`rc_worldgen_generate`] belongs
//! to this library and must be handed back through [`rc_worldgen_free`]
//! exactly once, with the same pointer and length.

use crate::terrain::{generate, TerrainMode, CHUNK_VOLUME};
use std::panic::{self, AssertUnwindSafe};

/// Bumped whenever a signature or the buffer layout changes.
pub const ABI_VERSION: u32 = 1;

/// Status codes returned by [`rc_worldgen_generate`].
pub mod status {
    pub const OK: i32 = 0;
    pub const INVALID_ARGUMENT: i32 = 1;
    pub const UNKNOWN_MODE: i32 = 2;
    pub const PANICKED: i32 = 3;
}

#[no_mangle]
pub extern "C" fn rc_worldgen_abi_version() -> u32 {
    ABI_VERSION
}

/// Generate one chunk and hand its block ids back through `out_ptr` and
/// `out_len`.
///
/// # Safety
///
/// `out_ptr` and `out_len` must be valid for writes. On success the caller
/// owns `*out_ptr` until it passes it to [`rc_worldgen_free`].
#[no_mangle]
pub unsafe extern "C" fn rc_worldgen_generate(
    chunk_x: i32,
    chunk_z: i32,
    seed: u64,
    mode: u32,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    if out_ptr.is_null() || out_len.is_null() {
        return status::INVALID_ARGUMENT;
    }
    let Some(mode) = TerrainMode::from_u32(mode) else {
        return status::UNKNOWN_MODE;
    };

    let blocks = match panic::catch_unwind(AssertUnwindSafe(|| {
        generate(mode, chunk_x, chunk_z, seed)
    })) {
        Ok(blocks) => blocks,
        Err(_) => return status::PANICKED,
    };
    debug_assert_eq!(blocks.len(), CHUNK_VOLUME);

    let buffer = blocks.into_boxed_slice();
    let len = buffer.len();
    // SAFETY: both pointers were checked for null and the caller guarantees
    // they are writable.
    unsafe {
        *out_len = len;
        *out_ptr = Box::into_raw(buffer) as *mut u8;
    }
    status::OK
}

/// Release a buffer produced by [`rc_worldgen_generate`]. Null is ignored.
///
/// # Safety
///
/// `ptr` and `len` must come from a single successful generate call and must
/// not have been freed already.
#[no_mangle]
pub unsafe extern "C" fn rc_worldgen_free(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: reconstructs the boxed slice leaked in `rc_worldgen_generate`.
    unsafe {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::blocks;
    use std::ptr;

    #[test]
    fn generate_and_free_round_trip() {
        let mut out_ptr: *mut u8 = ptr::null_mut();
        let mut out_len = 0usize;

        let code = unsafe { rc_worldgen_generate(3, -2, 42, 0, &mut out_ptr, &mut out_len) };
        assert_eq!(code, status::OK);
        assert_eq!(out_len, CHUNK_VOLUME);
        assert!(!out_ptr.is_null());

        let blocks = unsafe { std::slice::from_raw_parts(out_ptr, out_len) };
        assert_eq!(blocks[0], blocks::BEDROCK);
        assert_eq!(blocks, generate(TerrainMode::Flat, 3, -2, 42).as_slice());

        unsafe { rc_worldgen_free(out_ptr, out_len) };
    }

    #[test]
    fn rejects_unknown_mode_and_null_outputs() {
        let mut out_ptr: *mut u8 = ptr::null_mut();
        let mut out_len = 0usize;

        let code = unsafe { rc_worldgen_generate(0, 0, 0, 77, &mut out_ptr, &mut out_len) };
        assert_eq!(code, status::UNKNOWN_MODE);
        assert!(out_ptr.is_null());

        let code = unsafe { rc_worldgen_generate(0, 0, 0, 0, ptr::null_mut(), &mut out_len) };
        assert_eq!(code, status::INVALID_ARGUMENT);
    }

    #[test]
    fn free_ignores_null() {
        unsafe { rc_worldgen_free(ptr::null_mut(), 0) };
    }

    #[test]
    fn abi_version_is_stable() {
        assert_eq!(rc_worldgen_abi_version(), ABI_VERSION);
    }
}
